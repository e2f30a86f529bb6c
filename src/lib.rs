pub mod config;
pub mod daemon;
pub mod domain;
pub mod error;
pub mod protocol;
pub mod queue;
pub mod resolver;
pub mod session;
pub mod store;
pub mod transport;
pub mod watch;
