//! Shared configuration library for Iris.
//!
//! Centralizes defaults, environment parsing, and validation for every
//! budget and timeout the daemons honor. Environment variables win over the
//! optional TOML file, which wins over compiled-in defaults, so there is a
//! single source of truth for config keys across `iris-proxy` and `irisctl`.

pub mod loader;
pub mod models;
pub mod util;
pub mod validation;

pub use loader::{ConfigLoadError, load, load_from};
pub use models::{
    CaptureConfig, DetectionConfig, DnsConfig, IpcConfig, IrisConfig,
    ProxyConfig,
};
pub use validation::validate;
