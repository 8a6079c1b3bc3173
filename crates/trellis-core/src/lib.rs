//! # trellis-core: Shared Vocabulary
//!
//! Types shared by every Trellis crate: the capability names, run mode,
//! process configuration and the namespaced logger.
//!
//! This crate has no async runtime and no network dependencies. Anything
//! that opens a socket lives in `trellis-services` or `trellis-api`.

pub mod capability;
pub mod config;
pub mod error;
pub mod logging;
pub mod mode;

pub use capability::Capability;
pub use config::{
    AppConfig, CacheSettings, DatabaseSettings, RateLimitSettings, ReconnectPolicy,
    ServicesConfig, StartupPolicy, StorageSettings, Toggle,
};
pub use error::ConfigError;
pub use logging::{LogFormat, Logger};
pub use mode::RunMode;
