#![forbid(unsafe_code)]

use anyhow::{Context, Result};
use std::path::Path;
use std::sync::Arc;

use tokenwatch::bus::AmqpBus;
use tokenwatch::cli::{self, AgentArgs, CliCommand, ServiceVerb, WatchdogArgs};
use tokenwatch::constants::{
    AGENT_SERVICE_NAME, AGENT_SUBCOMMAND, APP_SUBSYSTEM, DEFAULT_BROKER_URI, EVENT_QUEUE, LIVENESS_PORT,
    OBSERVER_QUEUE, WATCHDOG_SERVICE_NAME, WATCHDOG_SUBCOMMAND,
};
use tokenwatch::control::{self, PingOutcome};
use tokenwatch::daemon::config::{resolve_config_path, AgentConfiguration};
use tokenwatch::daemon::logging::init_backend;
use tokenwatch::daemon::service::{ServiceDefinition, SystemServiceManager};
use tokenwatch::daemon::{self, control_service, AgentOptions, ServiceAction};
use tokenwatch::monitor::pkcs11::Pkcs11Driver;
use tokenwatch::monitor::scanner::UsbEnumerator;
use tokenwatch::output::{self, ScanOutput};
use tokenwatch::watchdog::{self, RestartPolicy, WatchdogOptions};

fn main() -> Result<()> {
    let command = cli::parse_args()?;

    match command {
        CliCommand::Agent(args) => agent_command(args),
        CliCommand::Watchdog(args) => watchdog_command(args),
        CliCommand::ConfigPush { file, broker_uri } => daemon::block_on(async {
            let document = control::config_document(file.as_deref())?;
            let bus = AmqpBus::connect(&broker_uri, &[EVENT_QUEUE]).await?;
            control::push_config(&bus, document).await?;
            println!("Configuration sent to {}", EVENT_QUEUE);
            Ok::<(), anyhow::Error>(())
        })?,
        CliCommand::Ping { broker_uri, timeout } => {
            let outcome = daemon::block_on(async {
                let bus = AmqpBus::connect(&broker_uri, &[OBSERVER_QUEUE]).await?;
                Ok::<_, anyhow::Error>(control::ping(&bus, timeout).await?)
            })??;
            match outcome {
                PingOutcome::Response(text) => {
                    println!("Response: {}", text);
                    Ok(())
                }
                PingOutcome::NoWatchdog => {
                    eprintln!("Error: Start watchdog first");
                    std::process::exit(1);
                }
                PingOutcome::TimedOut => {
                    eprintln!("Error: No response within {}s", timeout.as_secs());
                    std::process::exit(1);
                }
            }
        }
        CliCommand::Scan { config_path, json } => scan(config_path.as_deref(), json),
    }
}

fn agent_command(args: AgentArgs) -> Result<()> {
    match args.verb {
        ServiceVerb::Run => {
            init_backend(APP_SUBSYSTEM)?;
            daemon::block_on(daemon::run_agent(AgentOptions {
                config_path: args.config_path,
                broker_uri: args.broker_uri,
                liveness_port: LIVENESS_PORT,
            }))?
        }
        ServiceVerb::Control(action) => {
            let mut extra = Vec::new();
            if let Some(path) = &args.config_path {
                let absolute = std::fs::canonicalize(path)
                    .with_context(|| format!("Configuration file not found: {}", path.display()))?;
                extra.push("--config".to_string());
                extra.push(absolute.to_string_lossy().into_owned());
            }
            push_broker(&mut extra, &args.broker_uri);

            let definition = ServiceDefinition::for_current_exe(
                AGENT_SERVICE_NAME,
                "tokenwatch token agent",
                daemon::service_arguments(AGENT_SUBCOMMAND, &extra),
            )?;
            service_command(&definition, action)
        }
    }
}

fn watchdog_command(args: WatchdogArgs) -> Result<()> {
    match args.verb {
        ServiceVerb::Run => {
            init_backend(APP_SUBSYSTEM)?;
            daemon::block_on(watchdog::run_watchdog(WatchdogOptions {
                target: args.target,
                port: args.port,
                period: args.period,
                policy: args.policy,
                broker_uri: args.broker_uri,
            }))?
        }
        ServiceVerb::Control(action) => {
            let mut extra = vec![
                "--target".to_string(),
                args.target.clone(),
                "--port".to_string(),
                args.port.to_string(),
                "--period".to_string(),
                args.period.as_secs().to_string(),
            ];
            if args.policy == RestartPolicy::Immediate {
                extra.push("--no-backoff".to_string());
            }
            push_broker(&mut extra, &args.broker_uri);

            let definition = ServiceDefinition::for_current_exe(
                WATCHDOG_SERVICE_NAME,
                "tokenwatch watchdog",
                daemon::service_arguments(WATCHDOG_SUBCOMMAND, &extra),
            )?;
            service_command(&definition, action)
        }
    }
}

fn push_broker(extra: &mut Vec<String>, broker_uri: &str) {
    if broker_uri != DEFAULT_BROKER_URI {
        extra.push("--broker".to_string());
        extra.push(broker_uri.to_string());
    }
}

fn service_command(definition: &ServiceDefinition, action: ServiceAction) -> Result<()> {
    let manager = SystemServiceManager::detect();

    let (message, status) = control_service(&manager, definition, action)?;
    println!("{}", message);

    // A freshly installed service is started right away
    if action == ServiceAction::Install {
        let (message, _) = control_service(&manager, definition, ServiceAction::Start)?;
        println!("{}", message);
    }

    if action == ServiceAction::Status {
        let code = status.exit_code();
        if code != 0 {
            std::process::exit(code);
        }
    }
    Ok(())
}

fn scan(config_path: Option<&Path>, json: bool) -> Result<()> {
    let path = resolve_config_path(config_path)?;
    let config = AgentConfiguration::load_or_default(&path)
        .with_context(|| format!("Failed to load configuration from {}", path.display()))?;

    let monitor = daemon::build_monitor(Arc::new(UsbEnumerator), Arc::new(Pkcs11Driver));
    let surveys = daemon::block_on(monitor.survey(&config))??;
    let report = ScanOutput::from_surveys(surveys);

    if json {
        output::format_json(&report)
    } else {
        output::format_human(&report)
    }
}
