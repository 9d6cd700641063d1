//! CLI argument parsing and validation module
//!
//! Handles command-line interface using clap, including:
//! - Agent and watchdog service verbs (run/install/start/stop/remove/status)
//! - Configuration push and watchdog ping
//! - One-shot token scan with human or JSON output

use anyhow::{anyhow, Result};
use clap::{value_parser, Arg, ArgAction, ArgMatches, Command};
use std::path::PathBuf;
use std::time::Duration;

use crate::constants::{
    AGENT_SERVICE_NAME, AGENT_SUBCOMMAND, DEFAULT_BROKER_URI, FAST_CHECK_PERIOD, LIVENESS_PORT, RESTART_BACKOFF_BASE,
    RESTART_BACKOFF_MAX, RUN_SUBCOMMAND, SLOW_CHECK_PERIOD, WATCHDOG_SUBCOMMAND,
};
use crate::daemon::ServiceAction;
use crate::watchdog::RestartPolicy;

/// Service verbs accepted by `agent` and `watchdog`
const SERVICE_VERBS: [&str; 6] = [RUN_SUBCOMMAND, "install", "start", "stop", "remove", "status"];

/// A service verb, or running the component in the foreground
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceVerb {
    Run,
    Control(ServiceAction),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentArgs {
    pub verb: ServiceVerb,
    pub config_path: Option<PathBuf>,
    pub broker_uri: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchdogArgs {
    pub verb: ServiceVerb,
    pub target: String,
    pub port: u16,
    pub period: Duration,
    pub policy: RestartPolicy,
    pub broker_uri: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CliCommand {
    Agent(AgentArgs),
    Watchdog(WatchdogArgs),
    ConfigPush { file: Option<PathBuf>, broker_uri: String },
    Ping { broker_uri: String, timeout: Duration },
    Scan { config_path: Option<PathBuf>, json: bool },
}

fn broker_arg() -> Arg {
    Arg::new("broker")
        .long("broker")
        .value_name("URI")
        .help("AMQP broker URI")
        .default_value(DEFAULT_BROKER_URI)
}

fn config_arg() -> Arg {
    Arg::new("config")
        .short('c')
        .long("config")
        .value_name("PATH")
        .help("Configuration file (default: ./config.json, then the user config directory)")
        .value_parser(value_parser!(PathBuf))
}

fn verb_arg() -> Arg {
    Arg::new("verb")
        .value_name("VERB")
        .help("run | install | start | stop | remove | status")
        .required(true)
        .value_parser(SERVICE_VERBS)
}

/// Build the command-line definition
pub fn build_cli() -> Command {
    Command::new("tokenwatch")
        .version(concat!(env!("TOKENWATCH_VERSION"), " (", env!("GIT_HASH"), ")"))
        .about("Track USB security tokens and report them over AMQP")
        .long_about(
            "Watches attached USB security tokens, reads the certificates they carry and publishes \
             connect/disconnect/certificate events to a message broker. A separate watchdog keeps the agent running.",
        )
        .subcommand_required(true)
        .arg_required_else_help(true)
        .subcommand(
            Command::new(AGENT_SUBCOMMAND)
                .about("Run or manage the token agent")
                .arg(verb_arg())
                .arg(config_arg())
                .arg(broker_arg()),
        )
        .subcommand(
            Command::new(WATCHDOG_SUBCOMMAND)
                .about("Run or manage the watchdog supervising the agent")
                .arg(verb_arg())
                .arg(
                    Arg::new("target")
                        .long("target")
                        .value_name("NAME")
                        .help("Service to supervise")
                        .default_value(AGENT_SERVICE_NAME),
                )
                .arg(
                    Arg::new("port")
                        .long("port")
                        .value_name("PORT")
                        .help("Liveness port of the supervised service [default: 9977]")
                        .value_parser(value_parser!(u16).range(1..)),
                )
                .arg(
                    Arg::new("period")
                        .long("period")
                        .value_name("SECS")
                        .help("Seconds between liveness checks")
                        .value_parser(value_parser!(u64).range(1..))
                        .conflicts_with("slow"),
                )
                .arg(
                    Arg::new("slow")
                        .long("slow")
                        .help("Check every 20 seconds instead of 5")
                        .action(ArgAction::SetTrue),
                )
                .arg(
                    Arg::new("no-backoff")
                        .long("no-backoff")
                        .help("Attempt a restart on every failed check")
                        .action(ArgAction::SetTrue),
                )
                .arg(broker_arg()),
        )
        .subcommand(
            Command::new("config")
                .about("Manage agent configuration over the bus")
                .subcommand_required(true)
                .subcommand(
                    Command::new("push")
                        .about("Push a configuration document to running agents")
                        .arg(
                            Arg::new("file")
                                .short('f')
                                .long("file")
                                .value_name("PATH")
                                .help("JSON document to push (default: built-in example)")
                                .value_parser(value_parser!(PathBuf)),
                        )
                        .arg(broker_arg()),
                ),
        )
        .subcommand(
            Command::new("ping")
                .about("Ask the watchdog for the agent's state")
                .arg(broker_arg())
                .arg(
                    Arg::new("timeout")
                        .long("timeout")
                        .value_name("SECS")
                        .help("Seconds to wait for a response")
                        .value_parser(value_parser!(u64).range(1..))
                        .default_value("30"),
                ),
        )
        .subcommand(
            Command::new("scan")
                .about("Inspect attached tokens once and print what was found")
                .arg(config_arg())
                .arg(
                    Arg::new("json")
                        .short('j')
                        .long("json")
                        .help("Output in JSON format")
                        .action(ArgAction::SetTrue),
                ),
        )
}

/// Parse command line arguments
pub fn parse_args() -> Result<CliCommand> {
    from_matches(&build_cli().get_matches())
}

/// Interpret parsed arguments
pub fn from_matches(matches: &ArgMatches) -> Result<CliCommand> {
    match matches.subcommand() {
        Some((AGENT_SUBCOMMAND, sub)) => Ok(CliCommand::Agent(AgentArgs {
            verb: parse_verb(sub)?,
            config_path: sub.get_one::<PathBuf>("config").cloned(),
            broker_uri: broker(sub),
        })),
        Some((WATCHDOG_SUBCOMMAND, sub)) => {
            let period = match sub.get_one::<u64>("period") {
                Some(secs) => Duration::from_secs(*secs),
                None if sub.get_flag("slow") => SLOW_CHECK_PERIOD,
                None => FAST_CHECK_PERIOD,
            };
            let policy = if sub.get_flag("no-backoff") {
                RestartPolicy::Immediate
            } else {
                RestartPolicy::Backoff {
                    base: RESTART_BACKOFF_BASE,
                    max: RESTART_BACKOFF_MAX,
                }
            };
            Ok(CliCommand::Watchdog(WatchdogArgs {
                verb: parse_verb(sub)?,
                target: sub
                    .get_one::<String>("target")
                    .cloned()
                    .unwrap_or_else(|| AGENT_SERVICE_NAME.to_string()),
                port: sub.get_one::<u16>("port").copied().unwrap_or(LIVENESS_PORT),
                period,
                policy,
                broker_uri: broker(sub),
            }))
        }
        Some(("config", sub)) => match sub.subcommand() {
            Some(("push", push)) => Ok(CliCommand::ConfigPush {
                file: push.get_one::<PathBuf>("file").cloned(),
                broker_uri: broker(push),
            }),
            _ => Err(anyhow!("Unknown config command")),
        },
        Some(("ping", sub)) => Ok(CliCommand::Ping {
            broker_uri: broker(sub),
            timeout: Duration::from_secs(sub.get_one::<u64>("timeout").copied().unwrap_or(30)),
        }),
        Some(("scan", sub)) => Ok(CliCommand::Scan {
            config_path: sub.get_one::<PathBuf>("config").cloned(),
            json: sub.get_flag("json"),
        }),
        _ => Err(anyhow!("Unknown command")),
    }
}

fn broker(matches: &ArgMatches) -> String {
    matches
        .get_one::<String>("broker")
        .cloned()
        .unwrap_or_else(|| DEFAULT_BROKER_URI.to_string())
}

fn parse_verb(matches: &ArgMatches) -> Result<ServiceVerb> {
    let verb = matches
        .get_one::<String>("verb")
        .ok_or_else(|| anyhow!("Missing service verb"))?;
    Ok(match verb.as_str() {
        RUN_SUBCOMMAND => ServiceVerb::Run,
        "install" => ServiceVerb::Control(ServiceAction::Install),
        "start" => ServiceVerb::Control(ServiceAction::Start),
        "stop" => ServiceVerb::Control(ServiceAction::Stop),
        "remove" => ServiceVerb::Control(ServiceAction::Remove),
        "status" => ServiceVerb::Control(ServiceAction::Status),
        other => return Err(anyhow!("Unrecognized command: {}", other)),
    })
}
