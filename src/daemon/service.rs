//! OS service manager integration
//!
//! Installs, starts, stops and queries the agent and the watchdog as
//! system services: systemd units on Linux, launchd daemons on macOS.

use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Command;

use crate::constants::APP_SUBSYSTEM;
use crate::error::ServiceError;

/// State of an installed service
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceStatus {
    Running,
    Stopped,
    /// Not installed, or the manager could not tell
    Unknown,
}

impl ServiceStatus {
    /// Exit code of the `status` verb
    pub fn exit_code(&self) -> i32 {
        match self {
            ServiceStatus::Running | ServiceStatus::Stopped => 0,
            ServiceStatus::Unknown => 1,
        }
    }
}

impl fmt::Display for ServiceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServiceStatus::Running => write!(f, "running"),
            ServiceStatus::Stopped => write!(f, "stopped"),
            ServiceStatus::Unknown => write!(f, "unknown"),
        }
    }
}

/// What to run as a service
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceDefinition {
    pub name: String,
    pub description: String,
    pub executable: PathBuf,
    pub arguments: Vec<String>,
}

impl ServiceDefinition {
    /// A service running this executable with `arguments`
    pub fn for_current_exe(name: &str, description: &str, arguments: Vec<String>) -> Result<Self, ServiceError> {
        let executable = std::env::current_exe().map_err(|source| ServiceError::Io {
            action: "locate current executable".to_string(),
            source,
        })?;
        Ok(Self {
            name: name.to_string(),
            description: description.to_string(),
            executable,
            arguments,
        })
    }

    /// launchd label of the service
    pub fn label(&self) -> String {
        launchd_label(&self.name)
    }

    /// systemd unit file contents
    pub fn systemd_unit(&self) -> String {
        let mut exec_start = quote_systemd(&self.executable.to_string_lossy());
        for arg in &self.arguments {
            exec_start.push(' ');
            exec_start.push_str(&quote_systemd(arg));
        }

        format!(
            "[Unit]\n\
             Description={}\n\
             After=network-online.target\n\
             Wants=network-online.target\n\
             \n\
             [Service]\n\
             ExecStart={}\n\
             Restart=on-failure\n\
             RestartSec=5\n\
             \n\
             [Install]\n\
             WantedBy=multi-user.target\n",
            self.description, exec_start
        )
    }

    /// launchd property list contents
    pub fn launchd_plist(&self) -> String {
        let mut plist = String::new();

        plist.push_str("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n");
        plist.push_str("<!DOCTYPE plist PUBLIC \"-//Apple//DTD PLIST 1.0//EN\" \"http://www.apple.com/DTDs/PropertyList-1.0.dtd\">\n");
        plist.push_str("<plist version=\"1.0\">\n");
        plist.push_str("<dict>\n");

        plist.push_str("\t<key>Label</key>\n");
        plist.push_str(&format!("\t<string>{}</string>\n", escape_xml(&self.label())));

        plist.push_str("\t<key>ProgramArguments</key>\n");
        plist.push_str("\t<array>\n");
        plist.push_str(&format!(
            "\t\t<string>{}</string>\n",
            escape_xml(&self.executable.to_string_lossy())
        ));
        for arg in &self.arguments {
            plist.push_str(&format!("\t\t<string>{}</string>\n", escape_xml(arg)));
        }
        plist.push_str("\t</array>\n");

        plist.push_str("\t<key>RunAtLoad</key>\n");
        plist.push_str("\t<true/>\n");

        // Restart only when the process exits with an error
        plist.push_str("\t<key>KeepAlive</key>\n");
        plist.push_str("\t<dict>\n");
        plist.push_str("\t\t<key>SuccessfulExit</key>\n");
        plist.push_str("\t\t<false/>\n");
        plist.push_str("\t</dict>\n");

        plist.push_str("</dict>\n");
        plist.push_str("</plist>\n");
        plist
    }
}

/// Start/stop/install/status by service name
pub trait ServiceManager: Send + Sync {
    fn install(&self, definition: &ServiceDefinition) -> Result<(), ServiceError>;
    fn uninstall(&self, name: &str) -> Result<(), ServiceError>;
    fn start(&self, name: &str) -> Result<(), ServiceError>;
    fn stop(&self, name: &str) -> Result<(), ServiceError>;
    fn status(&self, name: &str) -> Result<ServiceStatus, ServiceError>;
}

/// The host's service manager
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SystemServiceManager {
    Systemd { unit_dir: PathBuf },
    Launchd { plist_dir: PathBuf },
    Unsupported(String),
}

impl SystemServiceManager {
    pub fn detect() -> Self {
        match std::env::consts::OS {
            "linux" => SystemServiceManager::Systemd {
                unit_dir: PathBuf::from("/etc/systemd/system"),
            },
            "macos" => SystemServiceManager::Launchd {
                plist_dir: PathBuf::from("/Library/LaunchDaemons"),
            },
            other => SystemServiceManager::Unsupported(other.to_string()),
        }
    }

    fn unit_path(unit_dir: &Path, name: &str) -> PathBuf {
        unit_dir.join(format!("{}.service", name))
    }

    fn plist_path(plist_dir: &Path, name: &str) -> PathBuf {
        plist_dir.join(format!("{}.plist", launchd_label(name)))
    }
}

impl ServiceManager for SystemServiceManager {
    fn install(&self, definition: &ServiceDefinition) -> Result<(), ServiceError> {
        match self {
            SystemServiceManager::Systemd { unit_dir } => {
                let path = Self::unit_path(unit_dir, &definition.name);
                write_file(&path, &definition.systemd_unit())?;
                run("systemctl", &["daemon-reload"])?;
                run("systemctl", &["enable", &definition.name])?;
                Ok(())
            }
            SystemServiceManager::Launchd { plist_dir } => {
                let path = Self::plist_path(plist_dir, &definition.name);
                write_file(&path, &definition.launchd_plist())?;
                run("launchctl", &["load", "-w", &path.to_string_lossy()])?;
                Ok(())
            }
            SystemServiceManager::Unsupported(os) => Err(ServiceError::Unsupported(os.clone())),
        }
    }

    fn uninstall(&self, name: &str) -> Result<(), ServiceError> {
        match self {
            SystemServiceManager::Systemd { unit_dir } => {
                // Disabling a unit that is already disabled is not an error worth stopping for
                let _ = run("systemctl", &["disable", "--now", name]);
                remove_file(&Self::unit_path(unit_dir, name))?;
                run("systemctl", &["daemon-reload"])?;
                Ok(())
            }
            SystemServiceManager::Launchd { plist_dir } => {
                let path = Self::plist_path(plist_dir, name);
                let _ = run("launchctl", &["unload", "-w", &path.to_string_lossy()]);
                remove_file(&path)
            }
            SystemServiceManager::Unsupported(os) => Err(ServiceError::Unsupported(os.clone())),
        }
    }

    fn start(&self, name: &str) -> Result<(), ServiceError> {
        match self {
            SystemServiceManager::Systemd { .. } => run("systemctl", &["start", name]).map(|_| ()),
            SystemServiceManager::Launchd { .. } => run("launchctl", &["start", &launchd_label(name)]).map(|_| ()),
            SystemServiceManager::Unsupported(os) => Err(ServiceError::Unsupported(os.clone())),
        }
    }

    fn stop(&self, name: &str) -> Result<(), ServiceError> {
        match self {
            SystemServiceManager::Systemd { .. } => run("systemctl", &["stop", name]).map(|_| ()),
            SystemServiceManager::Launchd { .. } => run("launchctl", &["stop", &launchd_label(name)]).map(|_| ()),
            SystemServiceManager::Unsupported(os) => Err(ServiceError::Unsupported(os.clone())),
        }
    }

    fn status(&self, name: &str) -> Result<ServiceStatus, ServiceError> {
        match self {
            SystemServiceManager::Systemd { unit_dir } => {
                if !Self::unit_path(unit_dir, name).exists() {
                    return Ok(ServiceStatus::Unknown);
                }
                // is-active exits non-zero for inactive units, so read stdout regardless
                let output = command_output("systemctl", &["is-active", name])?;
                Ok(parse_systemd_state(&output))
            }
            SystemServiceManager::Launchd { .. } => match run("launchctl", &["list", &launchd_label(name)]) {
                Ok(listing) => Ok(parse_launchd_listing(&listing)),
                Err(ServiceError::CommandFailed { .. }) => Ok(ServiceStatus::Unknown),
                Err(e) => Err(e),
            },
            SystemServiceManager::Unsupported(os) => Err(ServiceError::Unsupported(os.clone())),
        }
    }
}

fn launchd_label(name: &str) -> String {
    format!("{}.{}", APP_SUBSYSTEM, name)
}

fn parse_systemd_state(output: &str) -> ServiceStatus {
    match output.trim() {
        "active" | "reloading" | "activating" => ServiceStatus::Running,
        "inactive" | "failed" | "deactivating" => ServiceStatus::Stopped,
        _ => ServiceStatus::Unknown,
    }
}

fn parse_launchd_listing(listing: &str) -> ServiceStatus {
    if listing.contains("\"PID\"") {
        ServiceStatus::Running
    } else {
        ServiceStatus::Stopped
    }
}

fn quote_systemd(arg: &str) -> String {
    if arg.is_empty() || arg.contains(char::is_whitespace) || arg.contains('"') {
        format!("\"{}\"", arg.replace('\\', "\\\\").replace('"', "\\\""))
    } else {
        arg.to_string()
    }
}

fn escape_xml(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

fn write_file(path: &Path, content: &str) -> Result<(), ServiceError> {
    std::fs::write(path, content).map_err(|source| ServiceError::Io {
        action: format!("write {}", path.display()),
        source,
    })
}

fn remove_file(path: &Path) -> Result<(), ServiceError> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(source) => Err(ServiceError::Io {
            action: format!("remove {}", path.display()),
            source,
        }),
    }
}

fn command_output(program: &str, args: &[&str]) -> Result<String, ServiceError> {
    let output = Command::new(program).args(args).output().map_err(|source| ServiceError::Io {
        action: format!("execute {}", program),
        source,
    })?;
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Run a manager command, failing on a non-zero exit
fn run(program: &str, args: &[&str]) -> Result<String, ServiceError> {
    let output = Command::new(program).args(args).output().map_err(|source| ServiceError::Io {
        action: format!("execute {}", program),
        source,
    })?;

    if !output.status.success() {
        return Err(ServiceError::CommandFailed {
            command: format!("{} {}", program, args.join(" ")),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}
