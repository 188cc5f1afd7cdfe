pub mod client;
pub mod config;
pub mod error;
pub mod plan;
pub mod plugin;
pub mod resources;
pub mod schema;
pub mod sql;
