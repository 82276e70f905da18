//! Tests for driver selection and the shared driver behaviour.

use super::*;
use crate::test_support::{
    FakeSearchPlatform, ScriptedRunner, aws_instances_json, azure_vms_json, sample_config_for,
    vagrant_status,
};
use camino::Utf8PathBuf;
use rstest::{fixture, rstest};
use tempfile::TempDir;

struct Harness {
    _tmp: TempDir,
    root: Utf8PathBuf,
    runner: ScriptedRunner,
    platform: FakeSearchPlatform,
}

impl Harness {
    fn driver(&self, provider: Provider) -> Driver<ScriptedRunner, &FakeSearchPlatform> {
        let tools = ToolConfig {
            project_root: self.root.to_string(),
            ..ToolConfig::default()
        };
        Driver::select(DriverContext {
            config: sample_config_for(provider),
            tools,
            runner: self.runner.clone(),
            platform: &self.platform,
        })
    }
}

#[fixture]
fn harness() -> Harness {
    let tmp = TempDir::new().unwrap_or_else(|err| panic!("tempdir: {err}"));
    let root = Utf8PathBuf::from_path_buf(tmp.path().to_path_buf())
        .unwrap_or_else(|path| panic!("utf8 path: {}", path.display()));
    for dir in ["terraform/aws", "terraform/azure", "vagrant"] {
        std::fs::create_dir_all(root.join(dir)).unwrap_or_else(|err| panic!("mkdir: {err}"));
    }
    Harness {
        _tmp: tmp,
        root,
        runner: ScriptedRunner::new(),
        platform: FakeSearchPlatform::with_results(crate::test_support::sample_events(3)),
    }
}

fn dump_request(file_name: Utf8PathBuf, search: &str) -> DumpRequest {
    DumpRequest {
        file_name,
        search: search.to_owned(),
        earliest: String::from("-1d"),
        latest: String::from("now"),
    }
}

#[rstest]
#[case::aws(Provider::Aws)]
#[case::azure(Provider::Azure)]
#[case::local(Provider::Local)]
fn selection_matches_the_configured_provider(harness: Harness, #[case] provider: Provider) {
    let driver = harness.driver(provider);

    assert_eq!(driver.provider(), provider);
    let variant_matches = match provider {
        Provider::Aws => matches!(driver, Driver::Aws(_)),
        Provider::Azure => matches!(driver, Driver::Azure(_)),
        Provider::Local => matches!(driver, Driver::Local(_)),
    };
    assert!(variant_matches);
}

#[rstest]
#[tokio::test]
async fn stopping_a_stopped_range_issues_no_power_commands(harness: Harness) {
    harness.runner.push_stdout(aws_instances_json(&[
        ("i-1", "ar-splunk-demo", "stopped", None),
        ("i-2", "ar-win-demo-0", "stopped", None),
    ]));
    let driver = harness.driver(Provider::Aws);

    let changed = driver
        .stop()
        .await
        .unwrap_or_else(|err| panic!("stop: {err}"));

    assert!(changed.is_empty());
    assert_eq!(harness.runner.invocations().len(), 1);
}

#[rstest]
#[tokio::test]
async fn resuming_a_running_local_range_changes_nothing(harness: Harness) {
    harness.runner.push_stdout(vagrant_status(&[
        ("ar-splunk-demo", "running"),
        ("ar-win-demo-0", "running"),
        ("ar-linux-demo-0", "running"),
    ]));
    let driver = harness.driver(Provider::Local);

    let changed = driver
        .resume()
        .await
        .unwrap_or_else(|err| panic!("resume: {err}"));

    assert!(changed.is_empty());
    assert_eq!(
        harness.runner.commands(),
        vec![String::from("vagrant status --machine-readable")]
    );
}

#[rstest]
#[tokio::test]
async fn stop_only_touches_running_machines(harness: Harness) {
    harness.runner.push_stdout(aws_instances_json(&[
        ("i-1", "ar-splunk-demo", "running", Some("10.0.1.12")),
        ("i-2", "ar-win-demo-0", "stopped", None),
        ("i-3", "ar-linux-demo-0", "pending", None),
    ]));
    harness.runner.push_success();
    let driver = harness.driver(Provider::Aws);

    let changed = driver
        .stop()
        .await
        .unwrap_or_else(|err| panic!("stop: {err}"));

    assert_eq!(changed, vec![String::from("ar-splunk-demo")]);
    let commands = harness.runner.commands();
    assert_eq!(
        commands.last().map(String::as_str),
        Some("aws ec2 stop-instances --instance-ids i-1 --region us-west-2")
    );
}

#[rstest]
#[tokio::test]
async fn failed_resumes_name_every_failed_machine(harness: Harness) {
    harness.runner.push_stdout(azure_vms_json(&[
        ("ar-splunk-demo", "VM deallocated", ""),
        ("ar-win-demo-0", "VM deallocated", ""),
    ]));
    harness.runner.push_failure(1, "QuotaExceeded");
    harness.runner.push_success();
    let driver = harness.driver(Provider::Azure);

    let err = driver.resume().await.expect_err("resume should fail");

    assert!(
        matches!(
            &err,
            RangeError::Provision { failed_resources, .. }
                if failed_resources == &vec![String::from("ar-splunk-demo")]
        ),
        "unexpected error: {err:?}"
    );
    assert_eq!(harness.runner.invocations().len(), 3);
}

#[rstest]
#[tokio::test]
async fn missing_resource_group_shows_an_empty_range(harness: Harness) {
    harness
        .runner
        .push_failure(3, "(ResourceGroupNotFound) Resource group 'ar-rg-demo' could not be found.");
    let driver = harness.driver(Provider::Azure);

    let inventory = driver
        .show()
        .await
        .unwrap_or_else(|err| panic!("show: {err}"));

    assert!(inventory.is_empty());
}

#[rstest]
#[tokio::test]
async fn local_inventory_skips_machines_not_created(harness: Harness) {
    harness.runner.push_stdout(vagrant_status(&[
        ("ar-splunk-demo", "running"),
        ("ar-win-demo-0", "poweroff"),
        ("ar-linux-demo-0", "not_created"),
    ]));
    let driver = harness.driver(Provider::Local);

    let inventory = driver
        .show()
        .await
        .unwrap_or_else(|err| panic!("show: {err}"));

    assert_eq!(inventory.names(), "ar-splunk-demo, ar-win-demo-0");
    let dirs: Vec<Utf8PathBuf> = harness
        .runner
        .invocations()
        .into_iter()
        .map(|invocation| invocation.dir)
        .collect();
    assert_eq!(dirs, vec![harness.root.join("vagrant")]);
}

#[rstest]
#[case::packer("packer")]
#[case::backend("create_remote_backend")]
#[tokio::test]
async fn local_rejects_cloud_only_operations(harness: Harness, #[case] operation: &str) {
    let driver = harness.driver(Provider::Local);
    let name = BackendName::parse("ar-state").unwrap_or_else(|err| panic!("name: {err}"));

    let result = if operation == "packer" {
        driver.packer("splunk-v1").await
    } else {
        driver.create_remote_backend(&name).await
    };

    assert!(matches!(
        result,
        Err(RangeError::Unsupported {
            provider: Provider::Local,
            ..
        })
    ));
    assert!(harness.runner.invocations().is_empty());
}

#[rstest]
#[tokio::test]
async fn build_checks_images_before_applying(harness: Harness) {
    for _ in 0..3 {
        harness
            .runner
            .push_stdout("{\"Images\":[{\"ImageId\":\"ami-1\"}]}");
    }
    for _ in 0..3 {
        harness.runner.push_success();
    }
    harness.runner.push_stdout(aws_instances_json(&[(
        "i-1",
        "ar-splunk-demo",
        "running",
        Some("10.0.1.12"),
    )]));
    let driver = harness.driver(Provider::Aws);

    let inventory = driver
        .build()
        .await
        .unwrap_or_else(|err| panic!("build: {err}"));

    assert_eq!(inventory.names(), "ar-splunk-demo");
    let commands = harness.runner.commands();
    assert_eq!(commands.len(), 7);
    assert!(commands.iter().take(3).all(|cmd| cmd.contains("describe-images")));
    let terraform: Vec<&str> = commands.iter().skip(3).take(2).map(String::as_str).collect();
    assert_eq!(
        terraform,
        vec![
            "terraform init -input=false -no-color",
            "terraform workspace select -or-create=true demo",
        ]
    );
    assert!(commands.get(5).is_some_and(|cmd| cmd.starts_with("terraform apply")));
    let vars = harness
        .root
        .join("terraform/aws")
        .join(crate::terraform::VARS_FILE_NAME);
    assert!(vars.is_file());
}

#[rstest]
#[tokio::test]
async fn build_creates_missing_images_with_packer(harness: Harness) {
    harness.runner.push_stdout("{\"Images\":[]}");
    harness.runner.push_failure(1, "Build 'amazon-ebs.splunk-ubuntu-18-04' errored");
    let driver = harness.driver(Provider::Aws);

    let err = driver.build().await.expect_err("packer failure should abort");

    assert!(
        matches!(err, RangeError::Provision { ref stage, .. } if stage == "packer build splunk-v1"),
        "unexpected error: {err:?}"
    );
    let commands = harness.runner.commands();
    assert_eq!(commands.len(), 2);
    assert!(commands.last().is_some_and(|cmd| cmd.starts_with("packer build")));
}

#[rstest]
#[tokio::test]
async fn dump_targets_the_running_splunk_server(harness: Harness) {
    harness.runner.push_stdout(aws_instances_json(&[(
        "i-1",
        "ar-splunk-demo",
        "running",
        Some("10.0.1.12"),
    )]));
    let driver = harness.driver(Provider::Aws);
    let request = dump_request(harness.root.join("events.jsonl"), "index=win");

    let count = driver
        .dump(&request)
        .await
        .unwrap_or_else(|err| panic!("dump: {err}"));

    assert_eq!(count, 3);
    let endpoints = harness.platform.endpoints();
    assert_eq!(endpoints.len(), 1);
    let endpoint = endpoints.first().unwrap_or_else(|| panic!("no endpoint recorded"));
    assert_eq!(endpoint.host, "10.0.1.12");
    assert_eq!(endpoint.hec_token.as_deref(), Some("hec-token"));
}

#[rstest]
#[tokio::test]
async fn empty_searches_fail_before_any_query(harness: Harness) {
    let driver = harness.driver(Provider::Aws);
    let request = dump_request(harness.root.join("events.jsonl"), "   ");

    let err = driver.dump(&request).await.expect_err("empty search");

    assert!(matches!(err, RangeError::Search(_)));
    assert!(harness.runner.invocations().is_empty());
    assert_eq!(harness.platform.call_count(), 0);
}

#[rstest]
#[tokio::test]
async fn dump_needs_a_running_splunk_server(harness: Harness) {
    harness.runner.push_stdout(aws_instances_json(&[(
        "i-1",
        "ar-splunk-demo",
        "stopped",
        None,
    )]));
    let driver = harness.driver(Provider::Aws);
    let request = dump_request(harness.root.join("events.jsonl"), "index=win");

    let err = driver.dump(&request).await.expect_err("splunk is stopped");

    assert!(matches!(err, RangeError::TargetNotReady { .. }));
    assert!(!harness.root.join("events.jsonl").exists());
}

#[rstest]
#[tokio::test]
async fn local_destroy_names_only_this_ranges_machines(harness: Harness) {
    harness.runner.push_success();
    let driver = harness.driver(Provider::Local);

    driver
        .destroy()
        .await
        .unwrap_or_else(|err| panic!("destroy: {err}"));

    assert_eq!(
        harness.runner.commands(),
        vec![String::from(
            "vagrant destroy -f ar-splunk-demo ar-win-demo-0 ar-linux-demo-0"
        )]
    );
    let manifest = harness.root.join("vagrant").join(local::MANIFEST_FILE_NAME);
    assert!(manifest.is_file());
}

#[rstest]
#[tokio::test]
async fn unwritable_manifest_is_a_provisioning_failure(harness: Harness) {
    std::fs::remove_dir_all(harness.root.join("vagrant"))
        .unwrap_or_else(|err| panic!("rmdir: {err}"));
    let driver = harness.driver(Provider::Local);

    let err = driver.build().await.expect_err("manifest cannot be written");

    assert!(
        matches!(
            err,
            RangeError::Provision { ref stage, .. } if stage == "write vagrant manifest"
        ),
        "unexpected error: {err:?}"
    );
    assert!(harness.runner.invocations().is_empty());
}

#[rstest]
#[case::aws(Provider::Aws)]
#[case::azure(Provider::Azure)]
#[tokio::test]
async fn cloud_destroy_removes_the_range_workspace(harness: Harness, #[case] provider: Provider) {
    if provider == Provider::Aws {
        harness.runner.push_stdout(aws_instances_json(&[(
            "i-1",
            "ar-splunk-demo",
            "running",
            Some("10.0.1.12"),
        )]));
    } else {
        harness
            .runner
            .push_stdout(azure_vms_json(&[("ar-splunk-demo", "VM running", "10.0.1.12")]));
    }
    for _ in 0..5 {
        harness.runner.push_success();
    }
    let driver = harness.driver(provider);

    driver
        .destroy()
        .await
        .unwrap_or_else(|err| panic!("destroy: {err}"));

    let commands = harness.runner.commands();
    let terraform: Vec<&str> = commands.iter().skip(1).map(String::as_str).collect();
    let [init, select, destroy, default, delete] = terraform.as_slice() else {
        panic!("unexpected terraform sequence: {terraform:?}");
    };
    assert_eq!(*init, "terraform init -input=false -no-color");
    assert_eq!(*select, "terraform workspace select -or-create=true demo");
    assert!(destroy.starts_with("terraform destroy -input=false -no-color -auto-approve"));
    assert_eq!(*default, "terraform workspace select default");
    assert_eq!(*delete, "terraform workspace delete demo");
    let dirs: Vec<Utf8PathBuf> = harness
        .runner
        .invocations()
        .into_iter()
        .skip(1)
        .map(|invocation| invocation.dir)
        .collect();
    let expected = if provider == Provider::Aws {
        "terraform/aws"
    } else {
        "terraform/azure"
    };
    assert!(dirs.iter().all(|dir| *dir == harness.root.join(expected)));
}

#[rstest]
#[tokio::test]
async fn inventory_is_unchanged_by_a_redundant_stop(harness: Harness) {
    let machines = aws_instances_json(&[
        ("i-1", "ar-splunk-demo", "stopped", None),
        ("i-2", "ar-win-demo-0", "stopped", None),
    ]);
    for _ in 0..3 {
        harness.runner.push_stdout(machines.clone());
    }
    let driver = harness.driver(Provider::Aws);

    let before = driver
        .show()
        .await
        .unwrap_or_else(|err| panic!("show: {err}"));
    let changed = driver
        .stop()
        .await
        .unwrap_or_else(|err| panic!("stop: {err}"));
    let after = driver
        .show()
        .await
        .unwrap_or_else(|err| panic!("show: {err}"));

    assert!(changed.is_empty());
    assert_eq!(before, after);
    assert_eq!(harness.runner.invocations().len(), 3);
}
