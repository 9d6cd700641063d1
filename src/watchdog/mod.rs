//! Watchdog supervisor
//!
//! Checks the agent's liveness port every period and asks the service
//! manager to start the agent when nothing answers. Pings arriving on the
//! observer queue trigger an immediate check whose report is published
//! back as text.

use anyhow::Result;
use async_trait::async_trait;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};

use crate::bus::{AmqpBus, InboundMessage, MessageBus, OutboundMessage};
use crate::constants::{OBSERVER_QUEUE, PING_BODY, CHECK_CONNECT_TIMEOUT, PUBLISH_TIMEOUT};
use crate::daemon::logging::{DaemonLogger, LogLevel};
use crate::daemon::service::{ServiceManager, SystemServiceManager};
use crate::daemon::shutdown_signal;

/// Checks whether the supervised service is alive
#[async_trait]
pub trait LivenessCheck: Send + Sync {
    async fn is_alive(&self) -> bool;
}

/// Plain TCP connect; a completed handshake means alive
#[derive(Debug, Clone)]
pub struct TcpCheck {
    addr: SocketAddr,
    timeout: Duration,
}

impl TcpCheck {
    pub fn new(addr: SocketAddr, timeout: Duration) -> Self {
        Self { addr, timeout }
    }

    /// Check a port on the loopback interface
    pub fn local(port: u16) -> Self {
        Self::new(SocketAddr::from(([127, 0, 0, 1], port)), CHECK_CONNECT_TIMEOUT)
    }
}

#[async_trait]
impl LivenessCheck for TcpCheck {
    async fn is_alive(&self) -> bool {
        matches!(
            tokio::time::timeout(self.timeout, TcpStream::connect(self.addr)).await,
            Ok(Ok(_))
        )
    }
}

/// When to attempt a restart after consecutive failed checks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartPolicy {
    /// Every failed check attempts a start
    Immediate,
    /// After an attempt, wait `base * 2^(failures - 1)`, capped at `max`
    Backoff { base: Duration, max: Duration },
}

impl RestartPolicy {
    /// Wait before the next attempt after `failures` consecutive attempts
    pub fn delay(&self, failures: u32) -> Option<Duration> {
        match *self {
            RestartPolicy::Immediate => None,
            RestartPolicy::Backoff { base, max } => {
                let exponent = failures.saturating_sub(1).min(16);
                let delay = base.saturating_mul(1u32 << exponent);
                Some(delay.min(max))
            }
        }
    }
}

/// Outcome of one supervision check
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchdogReport {
    Running { service: String },
    Started { service: String },
    StartFailed { service: String, reason: String },
    /// Check failed but the backoff window has not elapsed
    Deferred { service: String, retry_in: Duration },
}

impl WatchdogReport {
    pub fn restart_attempted(&self) -> bool {
        matches!(self, WatchdogReport::Started { .. } | WatchdogReport::StartFailed { .. })
    }
}

impl fmt::Display for WatchdogReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WatchdogReport::Running { service } => write!(f, "Service {} is running...", service),
            WatchdogReport::Started { service } => write!(f, "Service {} successfully started", service),
            WatchdogReport::StartFailed { service, reason } => write!(f, "Failed to start {}: {}", service, reason),
            WatchdogReport::Deferred { service, retry_in } => write!(
                f,
                "Service {} is not responding, next start attempt in {}s",
                service,
                retry_in.as_secs()
            ),
        }
    }
}

/// Supervision state for one service
pub struct Watchdog {
    service: String,
    liveness: Arc<dyn LivenessCheck>,
    manager: Arc<dyn ServiceManager>,
    policy: RestartPolicy,
    consecutive_failures: u32,
    next_attempt: Option<Instant>,
}

impl Watchdog {
    pub fn new(
        service: impl Into<String>,
        liveness: Arc<dyn LivenessCheck>,
        manager: Arc<dyn ServiceManager>,
        policy: RestartPolicy,
    ) -> Self {
        Self {
            service: service.into(),
            liveness,
            manager,
            policy,
            consecutive_failures: 0,
            next_attempt: None,
        }
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub async fn check(&mut self) -> WatchdogReport {
        self.check_at(Instant::now()).await
    }

    /// Check once and restart if needed, as of `now`
    pub async fn check_at(&mut self, now: Instant) -> WatchdogReport {
        let service = self.service.clone();
        if self.liveness.is_alive().await {
            self.consecutive_failures = 0;
            self.next_attempt = None;
            return WatchdogReport::Running { service };
        }

        if let Some(next) = self.next_attempt {
            if now < next {
                return WatchdogReport::Deferred {
                    service,
                    retry_in: next - now,
                };
            }
        }

        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        let started = self.manager.start(&self.service);
        self.next_attempt = self.policy.delay(self.consecutive_failures).map(|delay| now + delay);

        match started {
            Ok(()) => WatchdogReport::Started { service },
            Err(e) => WatchdogReport::StartFailed {
                service,
                reason: e.to_string(),
            },
        }
    }
}

/// Options for `tokenwatch watchdog run`
#[derive(Debug, Clone)]
pub struct WatchdogOptions {
    pub target: String,
    pub port: u16,
    pub period: Duration,
    pub policy: RestartPolicy,
    pub broker_uri: String,
}

/// Run the watchdog until a shutdown signal arrives
pub async fn run_watchdog(options: WatchdogOptions) -> Result<()> {
    let logger = DaemonLogger::new(LogLevel::Info);

    // Supervision continues without status reporting when the broker is down
    let (reporter, pings) = match AmqpBus::connect(&options.broker_uri, &[OBSERVER_QUEUE]).await {
        Ok(bus) => {
            let bus: Arc<dyn MessageBus> = Arc::new(bus);
            match bus.subscribe(OBSERVER_QUEUE).await {
                Ok(rx) => (Some(bus), Some(rx)),
                Err(e) => {
                    logger.log_error(&e.to_string(), Some("observer_queue"));
                    (Some(bus), None)
                }
            }
        }
        Err(e) => {
            logger.log_error(&e.to_string(), Some("broker_unavailable"));
            (None, None)
        }
    };

    let mut watchdog = Watchdog::new(
        options.target.clone(),
        Arc::new(TcpCheck::local(options.port)),
        Arc::new(SystemServiceManager::detect()),
        options.policy,
    );

    logger.log_startup("watchdog", None, std::process::id());
    supervise(&mut watchdog, reporter, pings, options.period, &logger, shutdown_signal()).await;
    logger.log_shutdown("watchdog", "Received shutdown signal");
    Ok(())
}

enum Step {
    Period,
    Ping(InboundMessage),
    PingsClosed,
    Shutdown,
}

/// The watchdog loop: periodic checks plus on-demand checks for pings
pub async fn supervise<F>(
    watchdog: &mut Watchdog,
    reporter: Option<Arc<dyn MessageBus>>,
    mut pings: Option<mpsc::Receiver<InboundMessage>>,
    period: Duration,
    logger: &DaemonLogger,
    shutdown: F,
) where
    F: std::future::Future<Output = ()>,
{
    tokio::pin!(shutdown);
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        let step = tokio::select! {
            _ = &mut shutdown => Step::Shutdown,
            _ = interval.tick() => Step::Period,
            message = next_ping(&mut pings), if pings.is_some() => match message {
                Some(message) => Step::Ping(message),
                None => Step::PingsClosed,
            },
        };

        match step {
            Step::Shutdown => return,
            Step::Period => {
                let report = watchdog.check().await;
                logger.log_watchdog_report(watchdog.service(), &report.to_string(), report.restart_attempted());
                if report.restart_attempted() {
                    respond(reporter.as_deref(), &report, logger).await;
                }
            }
            Step::Ping(message) => {
                // Responses land on the same queue; only requests are answered
                if message.body != PING_BODY.as_bytes() {
                    continue;
                }
                let report = watchdog.check().await;
                logger.log_watchdog_report(watchdog.service(), &report.to_string(), report.restart_attempted());
                respond(reporter.as_deref(), &report, logger).await;
            }
            Step::PingsClosed => {
                logger.log_error("Observer subscription closed", Some("observer_queue"));
                pings = None;
            }
        }
    }
}

async fn next_ping(pings: &mut Option<mpsc::Receiver<InboundMessage>>) -> Option<InboundMessage> {
    match pings {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn respond(reporter: Option<&dyn MessageBus>, report: &WatchdogReport, logger: &DaemonLogger) {
    let Some(bus) = reporter else {
        return;
    };
    let message = OutboundMessage::text(&report.to_string());
    match tokio::time::timeout(PUBLISH_TIMEOUT, bus.publish(OBSERVER_QUEUE, message)).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => logger.log_error(&e.to_string(), Some("watchdog_report")),
        Err(_) => logger.log_error("Watchdog report publish timed out", Some("watchdog_report")),
    }
}
