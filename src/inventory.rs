//! Machine inventory of a range and its `show` rendering.

use std::fmt::{self, Write as _};

use serde::Serialize;

use crate::config::{FleetSpec, RangeConfig, ServerSpec};

/// Function a machine plays inside the range, derived from its name.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
pub enum MachineRole {
    /// Splunk search and ingest server.
    Splunk,
    /// Windows victim.
    Windows,
    /// Linux victim.
    Linux,
    /// Kali attacker.
    Kali,
    /// Nginx web proxy.
    Nginx,
    /// Phantom SOAR server.
    Phantom,
    /// Anything else carrying the range tag.
    Other,
}

impl MachineRole {
    /// Classifies a machine by the `ar-<role>` naming convention.
    #[must_use]
    pub fn from_name(name: &str) -> Self {
        let prefixes = [
            ("ar-splunk", Self::Splunk),
            ("ar-win", Self::Windows),
            ("ar-linux", Self::Linux),
            ("ar-kali", Self::Kali),
            ("ar-nginx", Self::Nginx),
            ("ar-phantom", Self::Phantom),
        ];
        prefixes
            .into_iter()
            .find(|(prefix, _)| name.starts_with(prefix))
            .map_or(Self::Other, |(_, role)| role)
    }

    /// Classifies a machine whose name matches a fleet hostname by the
    /// fleet list it appears in, falling back to [`Self::from_name`].
    #[must_use]
    pub fn from_fleet(name: &str, fleet: &FleetSpec) -> Self {
        let listed = |servers: &[ServerSpec]| {
            servers
                .iter()
                .any(|server| server.hostname.eq_ignore_ascii_case(name))
        };
        if listed(&fleet.windows_servers) {
            Self::Windows
        } else if listed(&fleet.linux_servers) {
            Self::Linux
        } else {
            Self::from_name(name)
        }
    }
}

/// Power state of a machine as reported by its provider.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub enum MachineStatus {
    /// Booted and reachable.
    Running,
    /// Powered off with disks retained.
    Stopped,
    /// Transitioning between states.
    Pending(String),
    /// Any other provider specific state.
    Other(String),
}

impl fmt::Display for MachineStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Running => f.write_str("running"),
            Self::Stopped => f.write_str("stopped"),
            Self::Pending(state) | Self::Other(state) => f.write_str(state),
        }
    }
}

/// One provisioned machine.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct Machine {
    /// Provider specific identifier (instance id, VM name).
    pub id: String,
    /// Name of the machine inside the range.
    pub name: String,
    /// Role derived from the name.
    pub role: MachineRole,
    /// Current power state.
    pub status: MachineStatus,
    /// Address the controller can reach the machine on.
    pub address: Option<String>,
}

impl Machine {
    /// Builds a machine, deriving its role from `name`.
    #[must_use]
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        status: MachineStatus,
        address: Option<String>,
    ) -> Self {
        let machine_name: String = name.into();
        Self {
            id: id.into(),
            role: MachineRole::from_name(&machine_name),
            name: machine_name,
            status,
            address,
        }
    }

    /// Returns `true` when the machine is running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.status == MachineStatus::Running
    }

    /// Returns `true` when the machine is stopped.
    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.status == MachineStatus::Stopped
    }
}

/// Machines currently provisioned for one range.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize)]
pub struct Inventory {
    /// Machines in provider listing order.
    pub machines: Vec<Machine>,
}

impl Inventory {
    /// Wraps a machine list, sorted by name for stable output.
    #[must_use]
    pub fn new(mut machines: Vec<Machine>) -> Self {
        machines.sort_by(|left, right| left.name.cmp(&right.name));
        Self { machines }
    }

    /// Re-derives every role against the fleet's hostnames.
    #[must_use]
    pub fn with_fleet_roles(mut self, fleet: &FleetSpec) -> Self {
        for machine in &mut self.machines {
            machine.role = MachineRole::from_fleet(&machine.name, fleet);
        }
        self
    }

    /// Returns `true` when nothing is provisioned.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.machines.is_empty()
    }

    /// Finds a machine by name.
    #[must_use]
    pub fn find(&self, name: &str) -> Option<&Machine> {
        self.machines.iter().find(|machine| machine.name == name)
    }

    /// Returns the first machine with `role`.
    #[must_use]
    pub fn first_with_role(&self, role: MachineRole) -> Option<&Machine> {
        self.machines.iter().find(|machine| machine.role == role)
    }

    /// Comma separated machine names, used in error messages.
    #[must_use]
    pub fn names(&self) -> String {
        self.machines
            .iter()
            .map(|machine| machine.name.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    }

    /// Renders the status table followed by access hints for running
    /// machines.
    #[must_use]
    pub fn render(&self, config: &RangeConfig, private_key_path: Option<&str>) -> String {
        let mut out = String::from("Status Virtual Machines\n\n");
        if self.is_empty() {
            out.push_str("No machines found for this attack range\n");
            return out;
        }

        let rows: Vec<[String; 3]> = self
            .machines
            .iter()
            .map(|machine| {
                [
                    machine.name.clone(),
                    machine.status.to_string(),
                    machine.address.clone().unwrap_or_default(),
                ]
            })
            .collect();
        render_table(&mut out, ["Name", "Status", "IP Address"], &rows);

        for machine in self.machines.iter().filter(|machine| machine.is_running()) {
            if let Some(hint) = access_hint(machine, config, private_key_path) {
                out.push('\n');
                out.push_str(&hint);
            }
        }
        out
    }
}

fn render_table(out: &mut String, headers: [&str; 3], rows: &[[String; 3]]) {
    let mut widths = headers.map(str::len);
    for row in rows {
        for (width, cell) in widths.iter_mut().zip(row) {
            *width = (*width).max(cell.len());
        }
    }

    let mut push_row = |cells: [&str; 3]| {
        let line = cells
            .iter()
            .zip(widths)
            .map(|(cell, width)| format!("{cell:<width$}"))
            .collect::<Vec<_>>()
            .join("  ");
        out.push_str(line.trim_end());
        out.push('\n');
    };
    push_row(headers);
    let rules = widths.map(|width| "-".repeat(width));
    push_row([rules[0].as_str(), rules[1].as_str(), rules[2].as_str()]);
    for row in rows {
        push_row([row[0].as_str(), row[1].as_str(), row[2].as_str()]);
    }
}

fn access_hint(
    machine: &Machine,
    config: &RangeConfig,
    private_key_path: Option<&str>,
) -> Option<String> {
    let address = machine.address.as_deref()?;
    let ssh = |user: &str| match private_key_path {
        Some(key) => format!("ssh -i {key} {user}@{address}"),
        None => format!("ssh {user}@{address}"),
    };
    let mut hint = String::new();
    match machine.role {
        MachineRole::Splunk => {
            let scheme = if config.fleet.splunk_server.install_es {
                "https"
            } else {
                "http"
            };
            writeln!(hint, "Access Splunk via:").ok()?;
            writeln!(hint, "\tWeb > {scheme}://{address}:8000").ok()?;
            writeln!(hint, "\tSSH > {}", ssh("ubuntu")).ok()?;
            writeln!(hint, "\tusername: admin").ok()?;
        }
        MachineRole::Windows => {
            writeln!(hint, "Access Windows via:").ok()?;
            writeln!(hint, "\tRDP > rdp://{address}:3389").ok()?;
            writeln!(hint, "\tusername: Administrator").ok()?;
        }
        MachineRole::Linux | MachineRole::Nginx => {
            writeln!(hint, "Access {} via:", machine.name).ok()?;
            writeln!(hint, "\tSSH > {}", ssh("ubuntu")).ok()?;
        }
        MachineRole::Kali => {
            writeln!(hint, "Access Kali via:").ok()?;
            writeln!(hint, "\tSSH > {}", ssh("kali")).ok()?;
        }
        MachineRole::Phantom => {
            writeln!(hint, "Access Phantom via:").ok()?;
            writeln!(hint, "\tWeb > https://{address}").ok()?;
            writeln!(hint, "\tSSH > {}", ssh("centos")).ok()?;
        }
        MachineRole::Other => return None,
    }
    writeln!(hint, "\tpassword: value of general.attack_range_password").ok()?;
    Some(hint)
}
