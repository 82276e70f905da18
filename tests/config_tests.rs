//! Integration tests for loading range configuration files from disk.

use attack_range::config::{self, ConfigError, Provider, ProviderSettings};
use camino::Utf8PathBuf;
use cap_std::{ambient_authority, fs_utf8::Dir};
use rstest::{fixture, rstest};
use tempfile::TempDir;

const FLEET: &str = r"
splunk_server:
  image: splunk-v2
windows_servers:
  - hostname: ar-win-dc
    image: windows-2019-v3
  - hostname: ar-win-2
    image: windows-2019-v3
linux_servers:
  - hostname: ar-linux
    image: linux-v3
";

struct ConfigDir {
    _tmp: TempDir,
    root: Utf8PathBuf,
}

impl ConfigDir {
    fn write(&self, name: &str, contents: &str) -> Utf8PathBuf {
        let dir = Dir::open_ambient_dir(&self.root, ambient_authority())
            .unwrap_or_else(|err| panic!("open dir: {err}"));
        dir.write(name, contents)
            .unwrap_or_else(|err| panic!("write {name}: {err}"));
        self.root.join(name)
    }
}

#[fixture]
fn config_dir() -> ConfigDir {
    let tmp = TempDir::new().unwrap_or_else(|err| panic!("tempdir: {err}"));
    let root = Utf8PathBuf::from_path_buf(tmp.path().to_path_buf())
        .unwrap_or_else(|path| panic!("utf8 path: {}", path.display()));
    ConfigDir { _tmp: tmp, root }
}

fn document(provider: &str, sections: &str) -> String {
    format!(
        "general:\n  cloud_provider: {provider}\n  attack_range_name: lab\n  attack_range_password: Pl3ase-change\n{sections}{FLEET}"
    )
}

#[rstest]
fn load_prunes_other_provider_sections(config_dir: ConfigDir) {
    let path = config_dir.write(
        "attack_range.yml",
        &document(
            "aws",
            "aws:\n  region: eu-west-1\n  private_key_path: ~/.ssh/lab.pem\nlocal:\n  splunk_ip: 192.168.56.12\n",
        ),
    );

    let loaded = config::load(&path).unwrap_or_else(|err| panic!("load: {err}"));

    assert_eq!(loaded.cloud_provider(), Provider::Aws);
    assert_eq!(loaded.range_id(), "lab");
    let ProviderSettings::Aws(aws) = &loaded.provider else {
        panic!("expected aws settings, got {:?}", loaded.provider);
    };
    assert_eq!(aws.region, "eu-west-1");
    assert_eq!(loaded.fleet.windows_servers.len(), 2);
    assert!(!loaded.fleet.kali_server.enabled);
}

#[rstest]
fn local_section_may_be_empty(config_dir: ConfigDir) {
    let path = config_dir.write("local.yml", &document("local", "local:\n"));

    let loaded = config::load(&path).unwrap_or_else(|err| panic!("load: {err}"));

    assert_eq!(loaded.cloud_provider(), Provider::Local);
}

#[rstest]
fn unknown_provider_error_lists_the_supported_backends(config_dir: ConfigDir) {
    let path = config_dir.write("bogus.yml", &document("vmware", ""));

    let err = config::load(&path).expect_err("vmware is not a provider");

    assert!(matches!(err, ConfigError::UnknownProvider(_)), "unexpected: {err}");
    assert!(err.to_string().contains("expected one of aws, azure, local"));
}

#[rstest]
fn selected_section_must_be_present(config_dir: ConfigDir) {
    let path = config_dir.write(
        "azure.yml",
        &document("azure", "aws:\n  region: eu-west-1\n  private_key_path: ~/.ssh/lab.pem\n"),
    );

    let err = config::load(&path).expect_err("azure section is missing");

    let ConfigError::MissingSection(ref section) = err else {
        panic!("expected MissingSection, got {err}");
    };
    assert_eq!(section, "azure");
}

#[rstest]
fn missing_file_names_the_path(config_dir: ConfigDir) {
    let path = config_dir.root.join("absent.yml");

    let err = config::load(&path).expect_err("file is absent");

    assert!(err.to_string().contains("absent.yml"), "unexpected: {err}");
}
