pub mod config;
pub mod container;
pub mod errors;
pub mod logging;
pub mod server;
