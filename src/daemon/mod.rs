//! Token agent daemon
//!
//! This module runs the agent process:
//! - Configuration loading, pushes over the bus and write-through
//! - The polling loop driving the token monitor
//! - The liveness listener checked by the watchdog
//! - Service manager integration for the install/start/stop verbs

pub mod config;
pub mod liveness;
pub mod logging;
pub mod service;
pub mod sync;

use anyhow::{Context, Result};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{Interval, MissedTickBehavior};

use crate::bus::{AmqpBus, EventEmitter, HostIdentity, InboundMessage, MessageBus};
use crate::constants::{CONFIG_QUEUE, EVENT_QUEUE, INSPECT_TIMEOUT, PUBLISH_TIMEOUT, RUN_SUBCOMMAND};
use crate::daemon::config::{format_duration, host_os_key, resolve_config_path, AgentConfiguration};
use crate::daemon::liveness::LivenessListener;
use crate::daemon::logging::{DaemonLogger, LogLevel};
use crate::daemon::service::{ServiceDefinition, ServiceManager, ServiceStatus};
use crate::daemon::sync::{apply_update, SyncOutcome};
use crate::monitor::inspector::SmartcardDriver;
use crate::monitor::pkcs11::Pkcs11Driver;
use crate::monitor::scanner::{DeviceEnumerator, UsbEnumerator};
use crate::monitor::{DeviceScanner, TokenInspector, TokenMonitor};

/// Options for `tokenwatch agent run`
#[derive(Debug, Clone)]
pub struct AgentOptions {
    pub config_path: Option<PathBuf>,
    pub broker_uri: String,
    pub liveness_port: u16,
}

/// Build a token monitor over the given collaborators for this host
pub fn build_monitor(enumerator: Arc<dyn DeviceEnumerator>, driver: Arc<dyn SmartcardDriver>) -> TokenMonitor {
    TokenMonitor::new(
        DeviceScanner::new(enumerator),
        TokenInspector::new(driver, host_os_key(), INSPECT_TIMEOUT),
    )
}

/// Run a future to completion on a current-thread runtime.
///
/// Teardown does not wait for blocking-pool threads: a driver call that
/// already timed out may never return, and it must not hold the process
/// open after shutdown.
pub fn block_on<F: std::future::Future>(future: F) -> Result<F::Output> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("Failed to start async runtime")?;
    let output = runtime.block_on(future);
    runtime.shutdown_background();
    Ok(output)
}

/// Load the configuration the agent starts with. A missing file yields
/// the defaults, written out so they can be edited.
pub fn load_startup_config(explicit: Option<&std::path::Path>, logger: &DaemonLogger) -> Result<AgentConfiguration> {
    let path = resolve_config_path(explicit).context("Failed to resolve configuration location")?;
    let existed = path.exists();
    let config = AgentConfiguration::load_or_default(&path)
        .with_context(|| format!("Failed to load configuration from {}", path.display()))?;

    if !existed {
        if let Err(e) = config.save() {
            logger.log_error(&format!("Failed to write default configuration: {}", e), Some("config_persist_failed"));
        }
    }
    Ok(config)
}

/// Run the agent until a shutdown signal arrives or a publish fails
pub async fn run_agent(options: AgentOptions) -> Result<()> {
    let logger = DaemonLogger::new(LogLevel::Info);
    let config = load_startup_config(options.config_path.as_deref(), &logger)?;
    let identity = HostIdentity::resolve()?;

    let bus = AmqpBus::connect(&options.broker_uri, &[EVENT_QUEUE, CONFIG_QUEUE])
        .await
        .context("Failed to connect to message broker")?;
    let bus: Arc<dyn MessageBus> = Arc::new(bus);
    let config_rx = bus
        .subscribe(CONFIG_QUEUE)
        .await
        .context("Failed to subscribe to configuration queue")?;

    let listener = LivenessListener::bind(options.liveness_port).await?;
    let liveness = tokio::spawn(listener.serve());

    let emitter = EventEmitter::new(bus, EVENT_QUEUE, identity, PUBLISH_TIMEOUT);
    let monitor = build_monitor(Arc::new(UsbEnumerator), Arc::new(Pkcs11Driver));
    let mut agent = Agent::new(monitor, emitter, config, logger.clone());

    logger.log_startup("agent", Some(&agent.config().path), std::process::id());
    let result = agent.run(config_rx, shutdown_signal()).await;
    liveness.abort();

    match &result {
        Ok(()) => logger.log_shutdown("agent", "Received shutdown signal"),
        Err(e) => logger.log_shutdown("agent", &format!("{:#}", e)),
    }
    result
}

/// The agent's single-threaded loop state
pub struct Agent {
    monitor: TokenMonitor,
    emitter: EventEmitter,
    config: AgentConfiguration,
    logger: DaemonLogger,
}

enum Step {
    Tick,
    Inbound(InboundMessage),
    InboundClosed,
    Shutdown,
}

impl Agent {
    pub fn new(monitor: TokenMonitor, emitter: EventEmitter, config: AgentConfiguration, logger: DaemonLogger) -> Self {
        Self {
            monitor,
            emitter,
            config,
            logger,
        }
    }

    pub fn config(&self) -> &AgentConfiguration {
        &self.config
    }

    pub fn monitor(&self) -> &TokenMonitor {
        &self.monitor
    }

    /// Run one tick and publish its events in order. A publish failure
    /// is returned and ends the agent.
    pub async fn tick(&mut self) -> Result<()> {
        let report = match self.monitor.tick(&self.config).await {
            Ok(report) => report,
            Err(e) => {
                self.logger.log_error(&e.to_string(), Some("scan_failed"));
                return Ok(());
            }
        };

        for failure in report.failures.iter().filter(|f| f.first_occurrence) {
            self.logger.log_inspection_failure(&failure.device, &failure.error);
        }

        for event in &report.events {
            self.emitter
                .publish(event)
                .await
                .context("Failed to publish token event")?;
            self.logger.log_token_event(event);
        }
        Ok(())
    }

    /// Apply one inbound delivery. Returns true when the poll interval
    /// changed.
    pub fn apply_config(&mut self, message: &InboundMessage) -> bool {
        let old_interval = self.config.reload_time;
        match apply_update(&mut self.config, message) {
            SyncOutcome::Ignored => false,
            SyncOutcome::Rejected(e) => {
                self.logger.log_config_rejected(&e.to_string());
                false
            }
            SyncOutcome::Applied {
                interval_changed,
                persist_error,
            } => {
                self.logger.log_config_change(
                    "Configuration updated",
                    &format_duration(old_interval),
                    &format_duration(self.config.reload_time),
                );
                if let Some(e) = persist_error {
                    self.logger.log_error(&e.to_string(), Some("config_persist_failed"));
                }
                interval_changed
            }
        }
    }

    /// Multiplex ticks, configuration pushes and shutdown on one task
    pub async fn run<F>(&mut self, mut inbound: mpsc::Receiver<InboundMessage>, shutdown: F) -> Result<()>
    where
        F: std::future::Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        let mut interval = poll_interval(self.config.reload_time);
        let mut inbound_open = true;

        loop {
            let step = tokio::select! {
                _ = &mut shutdown => Step::Shutdown,
                _ = interval.tick() => Step::Tick,
                message = inbound.recv(), if inbound_open => match message {
                    Some(message) => Step::Inbound(message),
                    None => Step::InboundClosed,
                },
            };

            match step {
                Step::Shutdown => return Ok(()),
                Step::Tick => self.tick().await?,
                Step::Inbound(message) => {
                    if self.apply_config(&message) {
                        interval = poll_interval(self.config.reload_time);
                    }
                }
                Step::InboundClosed => {
                    self.logger
                        .log_error("Configuration subscription closed", Some("config_queue"));
                    inbound_open = false;
                }
            }
        }
    }
}

fn poll_interval(period: Duration) -> Interval {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

/// Resolves on Ctrl-C, or SIGTERM on Unix
pub async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(_) => {
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

/// Service control verbs shared by the agent and the watchdog
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceAction {
    Install,
    Start,
    Stop,
    Remove,
    Status,
}

/// Perform a service verb and describe the result for the operator
pub fn control_service(
    manager: &dyn ServiceManager,
    definition: &ServiceDefinition,
    action: ServiceAction,
) -> Result<(String, ServiceStatus)> {
    let name = definition.name.as_str();
    match action {
        ServiceAction::Install => {
            manager
                .install(definition)
                .with_context(|| format!("Failed to install {}", name))?;
            Ok((format!("Service {} installed", name), ServiceStatus::Stopped))
        }
        ServiceAction::Start => {
            manager.start(name).with_context(|| format!("Failed to start {}", name))?;
            Ok((format!("Service {} started", name), ServiceStatus::Running))
        }
        ServiceAction::Stop => {
            manager.stop(name).with_context(|| format!("Failed to stop {}", name))?;
            Ok((format!("Service {} stopped", name), ServiceStatus::Stopped))
        }
        ServiceAction::Remove => {
            manager
                .uninstall(name)
                .with_context(|| format!("Failed to remove {}", name))?;
            Ok((format!("Service {} removed", name), ServiceStatus::Unknown))
        }
        ServiceAction::Status => {
            let status = manager
                .status(name)
                .with_context(|| format!("Failed to query {}", name))?;
            let mut text = format!("Service {} is {}", name, status);
            if status == ServiceStatus::Running && name.ends_with("agent") {
                let pids = find_agent_pids();
                if !pids.is_empty() {
                    let pids: Vec<String> = pids.iter().map(u32::to_string).collect();
                    text.push_str(&format!(" (pid {})", pids.join(", ")));
                }
            }
            Ok((text, status))
        }
    }
}

/// PIDs of agent processes running on this host, other than this one
pub fn find_agent_pids() -> Vec<u32> {
    use sysinfo::{ProcessRefreshKind, RefreshKind, System};

    let system = System::new_with_specifics(RefreshKind::new().with_processes(ProcessRefreshKind::everything()));
    let own_pid = std::process::id();
    let mut pids: Vec<u32> = system
        .processes()
        .iter()
        .filter(|(pid, process)| {
            pid.as_u32() != own_pid
                && process.name().to_string_lossy().starts_with("tokenwatch")
                && process.cmd().iter().any(|arg| arg.to_string_lossy() == "agent")
                && process.cmd().iter().any(|arg| arg.to_string_lossy() == "run")
        })
        .map(|(pid, _)| pid.as_u32())
        .collect();
    pids.sort_unstable();
    pids
}

/// Arguments the service manager launches a component with
pub fn service_arguments(component: &str, extra: &[String]) -> Vec<String> {
    let mut arguments = vec![component.to_string(), RUN_SUBCOMMAND.to_string()];
    arguments.extend(extra.iter().cloned());
    arguments
}
