//! TCP readiness probing.
//!
//! A freshly created server is "ready" once it accepts a TCP connection on
//! its SSH port — a proxy for cloud-init having progressed far enough to be
//! useful. Failed ticks are classified for human-readable progress.

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::ProvisionError;

/// What a failed probe tick looked like from the outside.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbePhase {
    PortClosed,
    NoRoute,
    NetworkUnreachable,
    Timeout,
    ConnectionReset,
    HostDown,
    Connecting,
}

impl std::fmt::Display for ProbePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::PortClosed => "port closed",
            Self::NoRoute => "no route to host",
            Self::NetworkUnreachable => "network unreachable",
            Self::Timeout => "connect timeout",
            Self::ConnectionReset => "connection reset",
            Self::HostDown => "host down",
            Self::Connecting => "connecting",
        };
        write!(f, "{s}")
    }
}

#[cfg(target_os = "linux")]
const EHOSTDOWN: i32 = 112;

pub fn classify(err: &std::io::Error) -> ProbePhase {
    use std::io::ErrorKind;
    #[cfg(target_os = "linux")]
    if err.raw_os_error() == Some(EHOSTDOWN) {
        return ProbePhase::HostDown;
    }
    match err.kind() {
        ErrorKind::ConnectionRefused => ProbePhase::PortClosed,
        ErrorKind::HostUnreachable => ProbePhase::NoRoute,
        ErrorKind::NetworkUnreachable => ProbePhase::NetworkUnreachable,
        ErrorKind::TimedOut => ProbePhase::Timeout,
        ErrorKind::ConnectionReset => ProbePhase::ConnectionReset,
        _ => ProbePhase::Connecting,
    }
}

/// `[v6]:port` or `v4:port`.
pub fn probe_addr(ip: IpAddr, port: u16) -> SocketAddr {
    SocketAddr::new(ip, port)
}

/// Poll a TCP connect to `ip:port` until it succeeds. Each attempt gets
/// `connect_timeout`; attempts repeat at `interval` until `timeout` elapses
/// or `cancel` fires.
pub async fn wait_for_ready(
    cancel: &CancellationToken,
    ip: IpAddr,
    port: u16,
    timeout: Duration,
    interval: Duration,
    connect_timeout: Duration,
) -> Result<(), ProvisionError> {
    let addr = probe_addr(ip, port);
    let started = tokio::time::Instant::now();
    loop {
        if cancel.is_cancelled() {
            return Err(ProvisionError::Cancelled);
        }
        let phase = match tokio::time::timeout(connect_timeout, TcpStream::connect(addr)).await {
            Ok(Ok(_stream)) => {
                debug!(%addr, waited_ms = started.elapsed().as_millis() as u64, "server ready");
                return Ok(());
            }
            Ok(Err(e)) => classify(&e),
            Err(_elapsed) => ProbePhase::Timeout,
        };
        debug!(%addr, phase = %phase, "server not ready yet");
        if started.elapsed() >= timeout {
            return Err(ProvisionError::ReadinessTimeout { addr, waited: started.elapsed() });
        }
        tokio::select! {
            () = cancel.cancelled() => return Err(ProvisionError::Cancelled),
            () = tokio::time::sleep(interval) => {}
        }
    }
}
