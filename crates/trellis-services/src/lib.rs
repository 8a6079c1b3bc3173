//! # trellis-services: Backing Service Lifecycle
//!
//! Lazy, fault-tolerant handles around the three optional backing
//! services and the registry that owns them.
//!
//! ## Modules
//!
//! - **handle**: [`ServiceHandle`], the per-capability state machine with
//!   single-flight connect and reconnect.
//! - **database**, **cache**, **storage**: [`Connector`] implementations
//!   for PostgreSQL (`sqlx`), Redis (`redis`) and S3-style object stores
//!   (`reqwest`).
//! - **signing**: AWS Signature Version 4 for object store requests.
//! - **backoff**: exponential reconnect delays with jitter.
//! - **registry**: [`ServiceRegistry`], built once from configuration.

pub mod backoff;
pub mod cache;
pub mod database;
pub mod error;
pub mod handle;
pub mod registry;
pub mod signing;
pub mod storage;

pub use cache::{CacheClient, CacheConnector};
pub use database::DatabaseConnector;
pub use error::{BoxError, RegistryError, ServiceError};
pub use handle::{
    Connector, DisabledService, HandleOptions, ManagedService, ServiceClient, ServiceHandle,
    ServiceState,
};
pub use registry::{ReadinessReport, RegistryBuilder, ServiceClients, ServiceRegistry, ServiceStatus};
pub use signing::{RequestSigner, SignError};
pub use storage::{ObjectInfo, StorageClient, StorageConnector, StoredObject};
