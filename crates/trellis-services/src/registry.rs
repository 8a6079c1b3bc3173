//! # Service Registry
//!
//! Holds at most one handle per capability, built once from
//! [`ServicesConfig`]. Handles are connected in capability order
//! (database, cache, storage) and closed in reverse.
//!
//! There is no global instance. The registry is constructed in `main`,
//! shared behind an `Arc`, and read once per request to build a
//! [`ServiceClients`] snapshot.

use std::sync::Arc;

use serde::Serialize;
use sqlx::PgPool;
use trellis_core::{Capability, Logger, ServicesConfig, StartupPolicy, Toggle};

use crate::cache::{CacheClient, CacheConnector};
use crate::database::DatabaseConnector;
use crate::error::{RegistryError, ServiceError};
use crate::handle::{
    DisabledService, HandleOptions, ManagedService, ServiceClient, ServiceHandle, ServiceState,
};
use crate::storage::{StorageClient, StorageConnector};

const LOG: Logger = Logger::new("registry");

static DISABLED: [DisabledService; 3] = [
    DisabledService::new(Capability::Database),
    DisabledService::new(Capability::Cache),
    DisabledService::new(Capability::Storage),
];

/// Per-request view of every capability's client.
///
/// Each slot is the outcome of [`ServiceHandle::client`] at the moment the
/// request entered service injection.
#[derive(Debug, Clone)]
pub struct ServiceClients {
    pub database: Result<ServiceClient<PgPool>, ServiceError>,
    pub cache: Result<ServiceClient<CacheClient>, ServiceError>,
    pub storage: Result<ServiceClient<StorageClient>, ServiceError>,
}

impl ServiceClients {
    /// Every slot set to the not-enabled sentinel.
    pub fn disabled() -> Self {
        Self {
            database: Ok(ServiceClient::NotEnabled),
            cache: Ok(ServiceClient::NotEnabled),
            storage: Ok(ServiceClient::NotEnabled),
        }
    }

    pub fn database(&self) -> Result<PgPool, ServiceError> {
        self.database.clone()?.require(Capability::Database)
    }

    pub fn cache(&self) -> Result<CacheClient, ServiceError> {
        self.cache.clone()?.require(Capability::Cache)
    }

    pub fn storage(&self) -> Result<StorageClient, ServiceError> {
        self.storage.clone()?.require(Capability::Storage)
    }

    pub fn is_ready(&self, capability: Capability) -> bool {
        match capability {
            Capability::Database => matches!(self.database, Ok(ServiceClient::Ready(_))),
            Capability::Cache => matches!(self.cache, Ok(ServiceClient::Ready(_))),
            Capability::Storage => matches!(self.storage, Ok(ServiceClient::Ready(_))),
        }
    }
}

/// One row of the readiness report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceStatus {
    pub capability: Capability,
    pub state: ServiceState,
    pub fatal: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

/// Snapshot of every capability's state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReadinessReport {
    /// False when any enabled capability with the fatal startup policy is
    /// not `Ready`.
    pub ready: bool,
    pub services: Vec<ServiceStatus>,
}

/// The process-wide set of service handles.
pub struct ServiceRegistry {
    ordered: Vec<Arc<dyn ManagedService>>,
    database: Option<Arc<ServiceHandle<DatabaseConnector>>>,
    cache: Option<Arc<ServiceHandle<CacheConnector>>>,
    storage: Option<Arc<ServiceHandle<StorageConnector>>>,
}

impl std::fmt::Debug for ServiceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let states: Vec<_> = self
            .ordered
            .iter()
            .map(|s| (s.capability(), s.state()))
            .collect();
        f.debug_struct("ServiceRegistry")
            .field("services", &states)
            .finish()
    }
}

impl ServiceRegistry {
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::default()
    }

    /// A registry with every capability disabled.
    pub fn empty() -> Self {
        RegistryBuilder::default().build()
    }

    /// Creates one handle per enabled capability. Nothing is connected.
    pub fn from_config(config: &ServicesConfig) -> Result<Self, RegistryError> {
        let options = |policy: StartupPolicy| HandleOptions {
            policy,
            strict_client: config.strict_client,
            connect_timeout: config.connect_timeout,
            reconnect: config.reconnect,
        };

        let mut builder = Self::builder();

        if let Toggle::Enabled { policy, params } = &config.database {
            let connector = DatabaseConnector::new(params.clone(), config.connect_timeout);
            builder = builder.database(ServiceHandle::new(connector, options(*policy)))?;
        }
        if let Toggle::Enabled { policy, params } = &config.cache {
            let connector = CacheConnector::new(params.clone());
            builder = builder.cache(ServiceHandle::new(connector, options(*policy)))?;
        }
        if let Toggle::Enabled { policy, params } = &config.storage {
            let connector =
                StorageConnector::new(params).map_err(|e| RegistryError::Misconfigured {
                    capability: Capability::Storage,
                    message: e.to_string(),
                })?;
            builder = builder.storage(ServiceHandle::new(connector, options(*policy)))?;
        }

        Ok(builder.build())
    }

    /// Builds the registry and connects every enabled handle.
    pub async fn start(config: &ServicesConfig) -> Result<Self, RegistryError> {
        let registry = Self::from_config(config)?;
        registry.connect_all().await?;
        Ok(registry)
    }

    /// Connects handles in capability order. Stops at the first failure of
    /// a fatal-policy capability; degrade-policy failures are logged and
    /// left to background reconnects.
    pub async fn connect_all(&self) -> Result<(), RegistryError> {
        for capability in Capability::ALL {
            if !self.contains(capability) {
                LOG.info(format!("{capability} disabled"));
            }
        }
        for service in &self.ordered {
            match service.connect().await {
                Ok(ServiceState::Degraded) => {
                    LOG.warn(format!(
                        "{} starting degraded: {}",
                        service.capability(),
                        service
                            .last_error()
                            .map(|e| e.to_string())
                            .unwrap_or_default()
                    ));
                }
                Ok(_) => {}
                Err(err) => {
                    LOG.error(format!("{} failed with fatal policy: {err}", service.capability()));
                    return Err(RegistryError::Fatal(err));
                }
            }
        }
        Ok(())
    }

    /// Whether a handle is registered for `capability`.
    pub fn contains(&self, capability: Capability) -> bool {
        self.ordered.iter().any(|s| s.capability() == capability)
    }

    /// The handle for `capability`, or the disabled sentinel. Never fails.
    pub fn get(&self, capability: Capability) -> &dyn ManagedService {
        match self.ordered.iter().find(|s| s.capability() == capability) {
            Some(service) => service.as_ref(),
            None => &DISABLED[capability as usize],
        }
    }

    pub fn database(&self) -> Option<&Arc<ServiceHandle<DatabaseConnector>>> {
        self.database.as_ref()
    }

    pub fn cache(&self) -> Option<&Arc<ServiceHandle<CacheConnector>>> {
        self.cache.as_ref()
    }

    pub fn storage(&self) -> Option<&Arc<ServiceHandle<StorageConnector>>> {
        self.storage.as_ref()
    }

    /// Snapshot of every client for one request.
    pub fn clients(&self) -> ServiceClients {
        ServiceClients {
            database: self
                .database
                .as_ref()
                .map_or(Ok(ServiceClient::NotEnabled), |h| h.client()),
            cache: self
                .cache
                .as_ref()
                .map_or(Ok(ServiceClient::NotEnabled), |h| h.client()),
            storage: self
                .storage
                .as_ref()
                .map_or(Ok(ServiceClient::NotEnabled), |h| h.client()),
        }
    }

    /// Starts background reconnects for Degraded handles whose backoff has
    /// elapsed. Returns how many were started.
    pub fn reconnect_due(&self) -> usize {
        self.ordered
            .iter()
            .filter(|s| Arc::clone(*s).spawn_reconnect_if_due())
            .count()
    }

    /// Pings every Ready handle in capability order.
    pub async fn health_check_all(&self) {
        for service in &self.ordered {
            if let Err(err) = service.health_check().await {
                LOG.debug(format!("{} health check skipped: {err}", service.capability()));
            }
        }
    }

    /// Current state of every capability, including disabled ones.
    pub fn status(&self) -> ReadinessReport {
        let services: Vec<ServiceStatus> = Capability::ALL
            .iter()
            .map(|cap| {
                let service = self.get(*cap);
                ServiceStatus {
                    capability: *cap,
                    state: service.state(),
                    fatal: service.state() != ServiceState::Disabled
                        && service.startup_policy() == StartupPolicy::Fatal,
                    last_error: service.last_error().map(|e| e.to_string()),
                }
            })
            .collect();
        let ready = services
            .iter()
            .all(|s| !s.fatal || s.state == ServiceState::Ready);
        ReadinessReport { ready, services }
    }

    /// Closes every handle in reverse initialization order.
    pub async fn close_all(&self) {
        for service in self.ordered.iter().rev() {
            service.close().await;
        }
        LOG.info("all services closed");
    }
}

/// Assembles a [`ServiceRegistry`], rejecting duplicate capabilities.
#[derive(Default)]
pub struct RegistryBuilder {
    ordered: Vec<Arc<dyn ManagedService>>,
    database: Option<Arc<ServiceHandle<DatabaseConnector>>>,
    cache: Option<Arc<ServiceHandle<CacheConnector>>>,
    storage: Option<Arc<ServiceHandle<StorageConnector>>>,
}

impl std::fmt::Debug for RegistryBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let capabilities: Vec<_> = self.ordered.iter().map(|s| s.capability()).collect();
        f.debug_struct("RegistryBuilder")
            .field("capabilities", &capabilities)
            .finish()
    }
}

impl RegistryBuilder {
    pub fn database(
        mut self,
        handle: ServiceHandle<DatabaseConnector>,
    ) -> Result<Self, RegistryError> {
        let handle = Arc::new(handle);
        self.push(handle.clone())?;
        self.database = Some(handle);
        Ok(self)
    }

    pub fn cache(mut self, handle: ServiceHandle<CacheConnector>) -> Result<Self, RegistryError> {
        let handle = Arc::new(handle);
        self.push(handle.clone())?;
        self.cache = Some(handle);
        Ok(self)
    }

    pub fn storage(
        mut self,
        handle: ServiceHandle<StorageConnector>,
    ) -> Result<Self, RegistryError> {
        let handle = Arc::new(handle);
        self.push(handle.clone())?;
        self.storage = Some(handle);
        Ok(self)
    }

    /// Registers a handle that takes part in the lifecycle (connect,
    /// status, close) but has no typed client slot.
    pub fn service(mut self, service: Arc<dyn ManagedService>) -> Result<Self, RegistryError> {
        self.push(service)?;
        Ok(self)
    }

    fn push(&mut self, service: Arc<dyn ManagedService>) -> Result<(), RegistryError> {
        let capability = service.capability();
        if self.ordered.iter().any(|s| s.capability() == capability) {
            return Err(RegistryError::DuplicateCapability(capability));
        }
        self.ordered.push(service);
        Ok(())
    }

    pub fn build(mut self) -> ServiceRegistry {
        self.ordered.sort_by_key(|s| s.capability());
        ServiceRegistry {
            ordered: self.ordered,
            database: self.database,
            cache: self.cache,
            storage: self.storage,
        }
    }
}
