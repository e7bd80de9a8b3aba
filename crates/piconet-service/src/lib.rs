//! PicoNet service: serverless LAN discovery and a named-event message bus.
//!
//! A [`PicoNetService`] advertises itself by broadcast, connects to every
//! process that shares its application id, and lets the application publish
//! and subscribe to named string events across that mesh.

pub mod bus;
pub mod config;
pub mod discovery;
pub mod error;
pub mod service;

pub use bus::{handler, Handler, SessionBus};
pub use config::{load_config, ServiceConfig};
pub use discovery::{AdmissionRejected, DiscoveryEngine, DiscoveryState};
pub use error::{ServiceError, ServiceResult};
pub use service::{Observer, PicoNetService, ServiceEvent};
