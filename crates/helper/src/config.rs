use std::time::Duration;

use serde::Deserialize;

/// Helper daemon configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct HelperConfig {
    /// TCP port to accept peer connections on.
    pub listen_port: u16,

    /// How long to wait for a peer's second (port-prediction) connection.
    #[serde(default = "default_second_conn_secs")]
    pub second_conn_timeout_secs: u64,

    /// How long to wait for the buddy session and its published fields.
    #[serde(default = "default_buddy_secs")]
    pub buddy_timeout_secs: u64,
}

fn default_second_conn_secs() -> u64 {
    5
}

fn default_buddy_secs() -> u64 {
    20
}

impl HelperConfig {
    pub fn new(listen_port: u16) -> Self {
        Self {
            listen_port,
            second_conn_timeout_secs: default_second_conn_secs(),
            buddy_timeout_secs: default_buddy_secs(),
        }
    }

    pub fn timeouts(&self) -> Timeouts {
        Timeouts {
            second_conn: Duration::from_secs(self.second_conn_timeout_secs),
            buddy: Duration::from_secs(self.buddy_timeout_secs),
        }
    }
}

/// The bounded waits a session worker performs.
#[derive(Debug, Clone, Copy)]
pub struct Timeouts {
    /// Registry search for the adjacent-port second connection.
    pub second_conn: Duration,
    /// Registry search for the buddy session, and every wait on one of the
    /// buddy's published fields.
    pub buddy: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            second_conn: Duration::from_secs(default_second_conn_secs()),
            buddy: Duration::from_secs(default_buddy_secs()),
        }
    }
}
