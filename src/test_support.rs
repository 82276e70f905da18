//! Test support utilities shared across unit and integration tests.

use std::cell::RefCell;
use std::collections::{BTreeSet, VecDeque};
use std::env;
use std::ffi::OsString;
use std::rc::Rc;
use std::sync::{Mutex as StdMutex, PoisonError};

use camino::{Utf8Path, Utf8PathBuf};
use tokio::sync::{Mutex, MutexGuard};

use crate::config::{
    AwsSettings, AzureSettings, FleetSpec, GeneralSettings, KaliServer, LocalSettings, Provider,
    ProviderSettings, RangeConfig, ServerSpec, SimulationEngine, SplunkServer,
};
use crate::error::RangeError;
use crate::runner::{CommandOutput, CommandRunner, RunnerError};
use crate::telemetry::{
    DumpEvent, ExportQuery, IngestLabels, PlatformFuture, SearchPlatform, SplunkEndpoint,
};

/// Scripted command runner that returns pre-seeded outputs in FIFO order.
///
/// Used to drive deterministic command outcomes without spawning processes.
#[derive(Clone, Debug, Default)]
pub struct ScriptedRunner {
    responses: Rc<RefCell<VecDeque<CommandOutput>>>,
    invocations: Rc<RefCell<Vec<CommandInvocation>>>,
}

/// Records a single invocation made through [`ScriptedRunner`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CommandInvocation {
    /// Program name as passed to the runner.
    pub program: String,
    /// Arguments passed to the program.
    pub args: Vec<OsString>,
    /// Working directory the command ran in.
    pub dir: Utf8PathBuf,
}

impl CommandInvocation {
    /// Returns a shell-like command string for assertions.
    #[must_use]
    pub fn command_string(&self) -> String {
        let mut parts = Vec::with_capacity(self.args.len() + 1);
        parts.push(self.program.clone());
        parts.extend(
            self.args
                .iter()
                .map(|arg| arg.to_string_lossy().into_owned()),
        );
        parts.join(" ")
    }
}

impl ScriptedRunner {
    /// Creates a new runner with no queued responses.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a snapshot of all invocations recorded so far.
    #[must_use]
    pub fn invocations(&self) -> Vec<CommandInvocation> {
        self.invocations.borrow().clone()
    }

    /// Returns the rendered command lines recorded so far.
    #[must_use]
    pub fn commands(&self) -> Vec<String> {
        self.invocations
            .borrow()
            .iter()
            .map(CommandInvocation::command_string)
            .collect()
    }

    /// Pushes a successful exit status.
    pub fn push_success(&self) {
        self.push_output(Some(0), "", "");
    }

    /// Pushes a successful exit status with `stdout`.
    pub fn push_stdout(&self, stdout: impl Into<String>) {
        self.push_output(Some(0), stdout, "");
    }

    /// Pushes a failing exit code with `stderr` text.
    pub fn push_failure(&self, code: i32, stderr: impl Into<String>) {
        self.push_output(Some(code), "", stderr);
    }

    /// Pushes an explicit command output response.
    pub fn push_output(
        &self,
        code: Option<i32>,
        stdout: impl Into<String>,
        stderr: impl Into<String>,
    ) {
        self.responses.borrow_mut().push_back(CommandOutput {
            code,
            stdout: stdout.into(),
            stderr: stderr.into(),
        });
    }
}

impl CommandRunner for ScriptedRunner {
    fn run(
        &self,
        program: &str,
        args: &[OsString],
        dir: &Utf8Path,
    ) -> Result<CommandOutput, RunnerError> {
        self.invocations.borrow_mut().push(CommandInvocation {
            program: program.to_owned(),
            args: args.to_vec(),
            dir: dir.to_path_buf(),
        });
        self.responses
            .borrow_mut()
            .pop_front()
            .ok_or_else(|| RunnerError::Spawn {
                program: program.to_owned(),
                message: String::from("no scripted response available"),
            })
    }
}

/// One batch received by [`FakeSearchPlatform::ingest`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct IngestedBatch {
    /// Labels the batch was sent with.
    pub labels: IngestLabels,
    /// Events in the batch, in send order.
    pub events: Vec<DumpEvent>,
}

/// In-memory search platform that serves canned export results and records
/// ingested batches.
#[derive(Debug, Default)]
pub struct FakeSearchPlatform {
    results: StdMutex<Vec<DumpEvent>>,
    export_failure: StdMutex<Option<String>>,
    ingest_failure: StdMutex<Option<(usize, String)>>,
    queries: StdMutex<Vec<ExportQuery>>,
    endpoints: StdMutex<Vec<SplunkEndpoint>>,
    batches: StdMutex<Vec<IngestedBatch>>,
}

impl FakeSearchPlatform {
    /// Creates a platform whose exports return `results`.
    #[must_use]
    pub fn with_results(results: Vec<DumpEvent>) -> Self {
        let platform = Self::default();
        *lock(&platform.results) = results;
        platform
    }

    /// Makes every export fail with a search error carrying `message`.
    pub fn fail_exports(&self, message: impl Into<String>) {
        *lock(&self.export_failure) = Some(message.into());
    }

    /// Makes every ingest call from the `batch`-th (zero based) onwards
    /// fail with an ingest error carrying `message`.
    pub fn fail_ingest_from(&self, batch: usize, message: impl Into<String>) {
        *lock(&self.ingest_failure) = Some((batch, message.into()));
    }

    /// Export queries received so far.
    #[must_use]
    pub fn queries(&self) -> Vec<ExportQuery> {
        lock(&self.queries).clone()
    }

    /// Endpoints contacted so far, one entry per call.
    #[must_use]
    pub fn endpoints(&self) -> Vec<SplunkEndpoint> {
        lock(&self.endpoints).clone()
    }

    /// Ingested batches so far.
    #[must_use]
    pub fn batches(&self) -> Vec<IngestedBatch> {
        lock(&self.batches).clone()
    }

    /// Every ingested event in arrival order.
    #[must_use]
    pub fn ingested_events(&self) -> Vec<DumpEvent> {
        lock(&self.batches)
            .iter()
            .flat_map(|batch| batch.events.iter().cloned())
            .collect()
    }

    /// Total number of calls made against the platform.
    #[must_use]
    pub fn call_count(&self) -> usize {
        lock(&self.endpoints).len()
    }
}

fn lock<T>(mutex: &StdMutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl SearchPlatform for FakeSearchPlatform {
    fn export<'a>(
        &'a self,
        endpoint: &'a SplunkEndpoint,
        query: &'a ExportQuery,
    ) -> PlatformFuture<'a, Vec<DumpEvent>> {
        Box::pin(async move {
            lock(&self.endpoints).push(endpoint.clone());
            lock(&self.queries).push(query.clone());
            if let Some(message) = lock(&self.export_failure).clone() {
                return Err(RangeError::Search(message));
            }
            Ok(lock(&self.results).clone())
        })
    }

    fn ingest<'a>(
        &'a self,
        endpoint: &'a SplunkEndpoint,
        events: &'a [DumpEvent],
        labels: &'a IngestLabels,
    ) -> PlatformFuture<'a, usize> {
        Box::pin(async move {
            lock(&self.endpoints).push(endpoint.clone());
            let failure = lock(&self.ingest_failure).clone();
            let delivered = lock(&self.batches).len();
            if let Some((_, message)) = failure.filter(|(from, _)| delivered >= *from) {
                return Err(RangeError::Ingest(message));
            }
            lock(&self.batches).push(IngestedBatch {
                labels: labels.clone(),
                events: events.to_vec(),
            });
            Ok(events.len())
        })
    }
}

/// Global mutex used to serialise environment mutation in tests.
pub static ENV_LOCK: Mutex<()> = Mutex::const_new(());

/// Guard that holds the env mutex and cleans up variables on drop.
pub struct EnvGuard {
    previous: Vec<(String, Option<OsString>)>,
    _guard: MutexGuard<'static, ()>,
}

impl EnvGuard {
    /// Sets multiple environment variables while holding a global mutex.
    pub async fn set_vars(pairs: &[(&str, &str)]) -> Self {
        debug_assert!(
            {
                let mut seen = BTreeSet::new();
                pairs.iter().all(|(key, _)| seen.insert(*key))
            },
            "duplicate environment variable keys passed to EnvGuard::set_vars"
        );

        let guard = ENV_LOCK.lock().await;
        let mut previous = Vec::with_capacity(pairs.len());
        for (key, value) in pairs {
            let old = env::var_os(key);
            // SAFETY: Environment mutation is serialised by `ENV_LOCK`, preventing races.
            unsafe { env::set_var(key, value) };
            previous.push(((*key).to_owned(), old));
        }

        Self {
            previous,
            _guard: guard,
        }
    }
}

impl Drop for EnvGuard {
    fn drop(&mut self) {
        for (key, old) in &self.previous {
            // SAFETY: Environment mutation is serialised by holding `_guard`.
            unsafe {
                match old {
                    Some(val) => env::set_var(key, val),
                    None => env::remove_var(key),
                }
            }
        }
    }
}

/// Range configuration for provider `aws`, range `demo`, with one Windows
/// and one Linux victim.
#[must_use]
pub fn sample_config() -> RangeConfig {
    sample_config_for(Provider::Aws)
}

/// Range configuration like [`sample_config`] for any provider.
#[must_use]
pub fn sample_config_for(provider: Provider) -> RangeConfig {
    let settings = match provider {
        Provider::Aws => ProviderSettings::Aws(AwsSettings {
            region: String::from("us-west-2"),
            private_key_path: String::from("~/.ssh/aws.pem"),
            key_name: Some(String::from("ar-key")),
        }),
        Provider::Azure => ProviderSettings::Azure(AzureSettings {
            subscription_id: String::from("11111111-2222-3333-4444-555555555555"),
            region: String::from("West Europe"),
            private_key_path: String::from("~/.ssh/azure"),
            image_resource_group: String::from("ar-images"),
            state_resource_group: String::from("ar-tfstate"),
        }),
        Provider::Local => ProviderSettings::Local(LocalSettings::default()),
    };
    RangeConfig {
        general: GeneralSettings {
            cloud_provider: provider,
            range_id: String::from("demo"),
            password: String::from("Pl3ase-change"),
            key_name: Some(String::from("ar-key")),
            simulation_engine: SimulationEngine::Art,
        },
        provider: settings,
        fleet: FleetSpec {
            splunk_server: SplunkServer {
                image: String::from("splunk-v1"),
                install_es: false,
                hec_token: Some(String::from("hec-token")),
                verify_tls: false,
            },
            windows_servers: vec![ServerSpec {
                hostname: String::from("ar-win-dc"),
                image: String::from("windows-2019-v1"),
            }],
            linux_servers: vec![ServerSpec {
                hostname: String::from("ar-linux"),
                image: String::from("linux-v1"),
            }],
            kali_server: KaliServer { enabled: false },
        },
    }
}

/// Builds events with distinct timestamps, hosts, and payloads.
#[must_use]
pub fn sample_events(count: usize) -> Vec<DumpEvent> {
    (0..count)
        .map(|index| {
            let mut fields = std::collections::BTreeMap::new();
            fields.insert(
                String::from("host"),
                serde_json::Value::from(format!("ar-win-demo-{index}")),
            );
            fields.insert(
                String::from("EventCode"),
                serde_json::Value::from(4688 + index),
            );
            DumpEvent {
                time: format!("17000000{index:02}.{:03}", index * 7),
                raw: format!("<Event><System>event {index}</System></Event>"),
                fields,
            }
        })
        .collect()
}

/// Produces a minimal payload matching `aws ec2 describe-instances --output json`.
///
/// Each tuple is `(instance id, Name tag, state, public ip)`.
#[must_use]
pub fn aws_instances_json(instances: &[(&str, &str, &str, Option<&str>)]) -> String {
    let items = instances
        .iter()
        .map(|(id, name, state, ip)| {
            let ip_json =
                ip.map_or_else(String::new, |ip| format!(",\"PublicIpAddress\":\"{ip}\""));
            format!(
                "{{\"InstanceId\":\"{id}\",\"State\":{{\"Name\":\"{state}\"}}{ip_json},\"Tags\":[{{\"Key\":\"Name\",\"Value\":\"{name}\"}},{{\"Key\":\"attack_range_name\",\"Value\":\"demo\"}}]}}"
            )
        })
        .collect::<Vec<_>>()
        .join(",");
    format!("{{\"Reservations\":[{{\"Instances\":[{items}]}}]}}")
}

/// Produces a minimal payload matching `az vm list -d -o json`.
///
/// Each tuple is `(vm name, power state, public ip)`.
#[must_use]
pub fn azure_vms_json(vms: &[(&str, &str, &str)]) -> String {
    let items = vms
        .iter()
        .map(|(name, power, ip)| {
            format!("{{\"name\":\"{name}\",\"powerState\":\"{power}\",\"publicIps\":\"{ip}\"}}")
        })
        .collect::<Vec<_>>()
        .join(",");
    format!("[{items}]")
}

/// Produces `vagrant status --machine-readable` output.
///
/// Each tuple is `(machine name, state)`.
#[must_use]
pub fn vagrant_status(machines: &[(&str, &str)]) -> String {
    let mut out = String::from("1700000000,,ui,info,Current machine states:\n");
    for (name, state) in machines {
        out.push_str(&format!("1700000000,{name},metadata,provider,virtualbox\n"));
        out.push_str(&format!("1700000000,{name},provider-name,virtualbox\n"));
        out.push_str(&format!("1700000000,{name},state,{state}\n"));
    }
    out
}
