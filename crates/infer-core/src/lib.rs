pub mod client;
pub mod config;
pub mod controller;
pub mod error;
pub mod generator;
pub mod monitor;
pub mod recorder;
pub mod schema;
pub mod server_stats;
pub mod transport;
pub mod util;
