pub mod client;
pub mod config;
pub mod options;
pub mod transport;
