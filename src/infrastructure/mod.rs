//! Infrastructure: configuration, logging, persistence, transports,
//! and the HTTP oracle client.

pub mod config;
pub mod logging;
pub mod oracle;
pub mod persist;
pub mod transport;
