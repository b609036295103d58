//! The publicly reachable helper.
//!
//! The helper coordinates a traversal attempt between two NATed peers but
//! never forwards a byte of application data. Each accepted TCP connection
//! becomes a session driven by its own worker; the two sessions of a pairing
//! find each other through the shared [`punch_registry::Registry`].

mod config;
mod error;
pub mod server;
pub mod session;

pub use config::{HelperConfig, Timeouts};
pub use error::SessionError;
pub use server::HelperServer;
pub use session::SessionWorker;
