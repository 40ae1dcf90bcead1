//! Shared foundation for the Flowline engine: configuration, identifier
//! types, and the lifecycle event bus.

pub mod config;
pub mod event_bus;
pub mod types;

pub use config::AppConfig;
