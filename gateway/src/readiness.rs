//! Bounded TCP readiness probes.
//!
//! A gate polls one address (or an all-of port set) with short-timeout
//! connection attempts until it answers or the wait budget elapses. The
//! result is advisory: the calling stage decides what a timeout means.

use std::time::Duration;

use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::time::{timeout, Instant};

const PROBE_TIMEOUT: Duration = Duration::from_secs(2);

pub async fn port_is_open(addr: &str) -> bool {
    matches!(timeout(PROBE_TIMEOUT, TcpStream::connect(addr)).await, Ok(Ok(_)))
}

/// Wait for a single address to accept connections.
pub async fn wait_for_port(
    addr: &str,
    budget: Duration,
    interval: Duration,
    cancel: &mut watch::Receiver<bool>,
) -> bool {
    wait_for_ports(std::slice::from_ref(&addr), budget, interval, cancel).await
}

/// Wait for every address in the set to accept connections.
///
/// Never blocks past `budget` (plus at most one in-flight probe timeout).
pub async fn wait_for_ports<A: AsRef<str>>(
    addrs: &[A],
    budget: Duration,
    interval: Duration,
    cancel: &mut watch::Receiver<bool>,
) -> bool {
    let deadline = Instant::now() + budget;
    loop {
        if *cancel.borrow() {
            return false;
        }

        let mut all_open = true;
        for addr in addrs {
            if !port_is_open(addr.as_ref()).await {
                all_open = false;
                break;
            }
        }
        if all_open {
            return true;
        }

        if Instant::now() + interval >= deadline {
            return false;
        }
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = cancel.changed() => {}
        }
    }
}
