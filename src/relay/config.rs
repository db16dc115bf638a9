//! Relay configuration.

use std::net::SocketAddr;
use std::time::Duration;

use super::connection::{ConnectionConfig, DEFAULT_LIVENESS_TIMEOUT, DEFAULT_PING_INTERVAL};
use super::correlator::DEFAULT_JOB_TIMEOUT;
use super::gateway::DEFAULT_BODY_LIMIT;
use super::hub::HubConfig;

/// Default listen port.
pub const DEFAULT_PORT: u16 = 3001;

/// Settings for a relay instance.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Address the HTTP listener binds to.
    pub listen: SocketAddr,
    /// Job deadline.
    pub job_timeout: Duration,
    /// Interval between relay pings on control connections.
    pub ping_interval: Duration,
    /// Silence after which a control connection is closed.
    pub liveness_timeout: Duration,
    /// Fail pending jobs immediately when their worker disconnects.
    pub fail_pending_on_disconnect: bool,
    /// Maximum accepted request body size.
    pub body_limit: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT)),
            job_timeout: DEFAULT_JOB_TIMEOUT,
            ping_interval: DEFAULT_PING_INTERVAL,
            liveness_timeout: DEFAULT_LIVENESS_TIMEOUT,
            fail_pending_on_disconnect: false,
            body_limit: DEFAULT_BODY_LIMIT,
        }
    }
}

impl RelayConfig {
    /// Set the listen address.
    pub fn listen(mut self, addr: SocketAddr) -> Self {
        self.listen = addr;
        self
    }

    /// Set the job deadline.
    ///
    /// Default: 120 seconds
    pub fn job_timeout(mut self, timeout: Duration) -> Self {
        self.job_timeout = timeout;
        self
    }

    /// Set the ping interval.
    ///
    /// Default: 30 seconds
    pub fn ping_interval(mut self, interval: Duration) -> Self {
        self.ping_interval = interval;
        self
    }

    /// Set the liveness timeout.
    ///
    /// Default: 90 seconds
    pub fn liveness_timeout(mut self, timeout: Duration) -> Self {
        self.liveness_timeout = timeout;
        self
    }

    /// Fail pending jobs with 502 as soon as their worker disconnects.
    ///
    /// Default: false (jobs run into their deadline)
    pub fn fail_pending_on_disconnect(mut self, enabled: bool) -> Self {
        self.fail_pending_on_disconnect = enabled;
        self
    }

    /// Set the maximum request body size.
    pub fn body_limit(mut self, limit: usize) -> Self {
        self.body_limit = limit;
        self
    }

    pub(crate) fn hub(&self) -> HubConfig {
        HubConfig {
            job_timeout: self.job_timeout,
            fail_pending_on_disconnect: self.fail_pending_on_disconnect,
        }
    }

    pub(crate) fn connection(&self) -> ConnectionConfig {
        ConnectionConfig {
            ping_interval: self.ping_interval,
            liveness_timeout: self.liveness_timeout,
        }
    }
}
