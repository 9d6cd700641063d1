//! TCP liveness listener checked by the watchdog

use anyhow::{Context, Result};
use std::net::SocketAddr;
use tokio::net::TcpListener;

/// Accepts connections and drops them; a completed handshake is the signal
pub struct LivenessListener {
    listener: TcpListener,
}

impl LivenessListener {
    /// Bind on the loopback interface. Port 0 picks a free port.
    pub async fn bind(port: u16) -> Result<Self> {
        let listener = TcpListener::bind(("127.0.0.1", port))
            .await
            .with_context(|| format!("Failed to bind liveness port {}", port))?;
        Ok(Self { listener })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener.local_addr().context("Failed to read liveness address")
    }

    /// Accept until the task is dropped
    pub async fn serve(self) {
        loop {
            match self.listener.accept().await {
                Ok((stream, _)) => drop(stream),
                Err(e) => log::warn!("Liveness accept failed: {}", e),
            }
        }
    }
}
