pub mod captive_portal;
pub mod config;
pub mod poller;
pub mod radio;

pub use captive_portal::{PortalOrchestrator, PortalState};
pub use config::PortalConfig;
