//! Waiting for the network before the first fetch.
//!
//! The board usually powers up together with the access point, so the first few
//! seconds are spent polling a readiness probe instead of failing every request.

use std::net::{TcpStream, ToSocketAddrs};
use std::thread;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Interval between readiness probes
pub const POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Error, Debug, PartialEq, Eq)]
pub enum NetworkError {
    #[error("network not ready after {secs} s")]
    Timeout { secs: u64 },

    /// The probe gave a definite answer that will not improve by waiting
    #[error("network rejected: {0}")]
    Rejected(String),
}

/// Outcome of a single readiness check.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Readiness {
    Ready,
    Pending,
    Failed(String),
}

pub trait ReadinessProbe {
    fn check(&mut self) -> Readiness;
}

/// Ready once a TCP connection to `host:port` succeeds.
pub struct TcpProbe {
    target: String,
    connect_timeout: Duration,
}

impl TcpProbe {
    pub fn new(target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            connect_timeout: Duration::from_secs(1),
        }
    }
}

impl ReadinessProbe for TcpProbe {
    fn check(&mut self) -> Readiness {
        // name resolution failing is expected while the link is still coming up
        let Ok(mut addrs) = self.target.to_socket_addrs() else {
            return Readiness::Pending;
        };
        match addrs.next() {
            Some(addr) => match TcpStream::connect_timeout(&addr, self.connect_timeout) {
                Ok(_) => Readiness::Ready,
                Err(_) => Readiness::Pending,
            },
            None => Readiness::Failed(format!("{} resolves to no address", self.target)),
        }
    }
}

/// Poll `probe` every [`POLL_INTERVAL`] until it is ready or `timeout` passes.
///
/// Returns how long it took.
pub fn wait_until_online(
    probe: &mut (impl ReadinessProbe + ?Sized),
    timeout: Duration,
) -> Result<Duration, NetworkError> {
    wait_with_interval(probe, timeout, POLL_INTERVAL)
}

fn wait_with_interval(
    probe: &mut (impl ReadinessProbe + ?Sized),
    timeout: Duration,
    interval: Duration,
) -> Result<Duration, NetworkError> {
    let start = Instant::now();
    loop {
        match probe.check() {
            Readiness::Ready => return Ok(start.elapsed()),
            Readiness::Failed(reason) => return Err(NetworkError::Rejected(reason)),
            Readiness::Pending => {}
        }
        if start.elapsed() >= timeout {
            return Err(NetworkError::Timeout {
                secs: timeout.as_secs(),
            });
        }
        thread::sleep(interval);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    struct Countdown {
        pending: usize,
        checks: usize,
        failure: Option<String>,
    }

    impl ReadinessProbe for Countdown {
        fn check(&mut self) -> Readiness {
            self.checks += 1;
            if let Some(reason) = &self.failure {
                return Readiness::Failed(reason.clone());
            }
            if self.pending == 0 {
                Readiness::Ready
            } else {
                self.pending -= 1;
                Readiness::Pending
            }
        }
    }

    #[test]
    fn test_ready_after_a_few_polls() {
        let mut probe = Countdown {
            pending: 3,
            checks: 0,
            failure: None,
        };
        let waited =
            wait_with_interval(&mut probe, Duration::from_secs(5), Duration::from_millis(1)).unwrap();
        assert_eq!(probe.checks, 4);
        assert!(waited < Duration::from_secs(5));
    }

    #[test]
    fn test_timeout() {
        let mut probe = Countdown {
            pending: usize::MAX,
            checks: 0,
            failure: None,
        };
        let err = wait_with_interval(&mut probe, Duration::from_millis(20), Duration::from_millis(1))
            .unwrap_err();
        assert_eq!(err, NetworkError::Timeout { secs: 0 });
        assert!(probe.checks > 1);
    }

    #[test]
    fn test_rejection_stops_waiting() {
        let mut probe = Countdown {
            pending: 10,
            checks: 0,
            failure: Some("bad credentials".to_string()),
        };
        let err = wait_until_online(&mut probe, Duration::from_secs(10)).unwrap_err();
        assert_eq!(err, NetworkError::Rejected("bad credentials".to_string()));
        assert_eq!(probe.checks, 1);
    }

    #[test]
    fn test_tcp_probe_against_local_listener() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let mut probe = TcpProbe::new(listener.local_addr().unwrap().to_string());
        assert_eq!(probe.check(), Readiness::Ready);
    }
}
