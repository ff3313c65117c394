pub mod config;
pub mod event_bus;
pub mod types;

pub use config::AppConfig;
