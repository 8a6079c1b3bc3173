//! # Service Handle
//!
//! A [`ServiceHandle`] wraps one external dependency and owns its
//! lifecycle:
//!
//! ```text
//!   Disabled (terminal, never leaves)
//!
//!   Connecting ──ok──▶ Ready ──health fail──▶ Degraded
//!       │                ▲                       │
//!       └──fail──▶ Degraded ◀──reconnect fail────┘
//!                        └────reconnect ok───────▶ Ready
//!
//!   any enabled state ──close──▶ Closed (terminal)
//! ```
//!
//! ## Single-flight
//!
//! Connect, reconnect and close serialize on a per-handle async mutex.
//! Each finished attempt bumps a generation counter. A caller records the
//! generation before waiting on the mutex; if it has moved once the mutex
//! is acquired, another caller's attempt settled while it waited and the
//! caller returns that outcome instead of starting its own. Concurrent
//! callers therefore produce exactly one attempt.
//!
//! Client reads never touch the mutex. They take a short read lock on the
//! state and clone the client out.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::Serialize;
use tokio::time::Instant;
use trellis_core::{Capability, Logger, ReconnectPolicy, StartupPolicy};

use crate::backoff;
use crate::error::{BoxError, ServiceError};

const LOG: Logger = Logger::new("service");

/// Lifecycle state of a service handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceState {
    Disabled,
    Connecting,
    Ready,
    Degraded,
    Closed,
}

impl ServiceState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Disabled => "disabled",
            Self::Connecting => "connecting",
            Self::Ready => "ready",
            Self::Degraded => "degraded",
            Self::Closed => "closed",
        }
    }
}

impl std::fmt::Display for ServiceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of asking a handle for its client.
///
/// The two sentinels let handlers degrade gracefully without treating an
/// optional dependency as an error.
#[derive(Debug, Clone)]
pub enum ServiceClient<C> {
    Ready(C),
    /// The capability is switched off in configuration.
    NotEnabled,
    /// The capability is enabled but not currently usable.
    Unavailable,
}

impl<C> ServiceClient<C> {
    pub fn ready(self) -> Option<C> {
        match self {
            Self::Ready(client) => Some(client),
            _ => None,
        }
    }

    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Ready(_))
    }

    /// Converts the sentinels into errors for call sites that require the
    /// dependency.
    pub fn require(self, capability: Capability) -> Result<C, ServiceError> {
        match self {
            Self::Ready(client) => Ok(client),
            Self::NotEnabled => Err(ServiceError::NotEnabled { capability }),
            Self::Unavailable => Err(ServiceError::Unavailable { capability }),
        }
    }
}

/// Opens, checks and releases connections to one kind of backing service.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    type Client: Clone + Send + Sync + 'static;

    fn capability(&self) -> Capability;

    async fn connect(&self) -> Result<Self::Client, BoxError>;

    async fn ping(&self, client: &Self::Client) -> Result<(), BoxError>;

    async fn disconnect(&self, client: Self::Client);
}

/// Per-handle lifecycle settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandleOptions {
    pub policy: StartupPolicy,
    pub strict_client: bool,
    pub connect_timeout: Duration,
    pub reconnect: ReconnectPolicy,
}

impl Default for HandleOptions {
    fn default() -> Self {
        Self {
            policy: StartupPolicy::Degrade,
            strict_client: false,
            connect_timeout: Duration::from_secs(5),
            reconnect: ReconnectPolicy::default(),
        }
    }
}

struct Inner<C> {
    state: ServiceState,
    client: Option<C>,
    last_error: Option<ServiceError>,
    failures: u32,
    next_attempt_at: Option<Instant>,
}

/// Lifecycle wrapper around one backing service connection.
pub struct ServiceHandle<K: Connector> {
    capability: Capability,
    connector: K,
    options: HandleOptions,
    inner: RwLock<Inner<K::Client>>,
    flight: tokio::sync::Mutex<()>,
    generation: AtomicU64,
    attempts: AtomicU64,
}

impl<K: Connector> ServiceHandle<K> {
    /// An enabled handle in `Connecting`; nothing is attempted until
    /// [`connect`](Self::connect) is called.
    pub fn new(connector: K, options: HandleOptions) -> Self {
        Self::with_state(connector, options, ServiceState::Connecting)
    }

    /// A handle that stays `Disabled` for its whole life.
    pub fn disabled(connector: K) -> Self {
        Self::with_state(connector, HandleOptions::default(), ServiceState::Disabled)
    }

    fn with_state(connector: K, options: HandleOptions, state: ServiceState) -> Self {
        Self {
            capability: connector.capability(),
            connector,
            options,
            inner: RwLock::new(Inner {
                state,
                client: None,
                last_error: None,
                failures: 0,
                next_attempt_at: None,
            }),
            flight: tokio::sync::Mutex::new(()),
            generation: AtomicU64::new(0),
            attempts: AtomicU64::new(0),
        }
    }

    pub fn capability(&self) -> Capability {
        self.capability
    }

    pub fn state(&self) -> ServiceState {
        self.inner.read().state
    }

    pub fn last_error(&self) -> Option<ServiceError> {
        self.inner.read().last_error.clone()
    }

    pub fn options(&self) -> &HandleOptions {
        &self.options
    }

    /// Total connection attempts started by this handle.
    pub fn attempts(&self) -> u64 {
        self.attempts.load(Ordering::Acquire)
    }

    /// Performs the first connection attempt.
    ///
    /// Later calls, and calls that joined an in-flight attempt, return the
    /// settled state without connecting again. Fails only when the attempt
    /// failed and the startup policy is [`StartupPolicy::Fatal`].
    pub async fn connect(&self) -> Result<ServiceState, ServiceError> {
        let seen = self.generation.load(Ordering::Acquire);
        let _flight = self.flight.lock().await;

        if self.generation.load(Ordering::Acquire) == seen && self.state() == ServiceState::Connecting
        {
            self.attempt().await;
        }
        self.settled_for_connect()
    }

    /// Replaces the current connection with a fresh one.
    ///
    /// Allowed from `Ready` and `Degraded`. Callers arriving while another
    /// attempt is in flight wait for it and observe its result. A disabled
    /// handle stays disabled.
    pub async fn reconnect(&self) -> Result<ServiceState, ServiceError> {
        let seen = self.generation.load(Ordering::Acquire);
        let _flight = self.flight.lock().await;

        if self.generation.load(Ordering::Acquire) != seen {
            return self.settled();
        }

        match self.state() {
            ServiceState::Disabled => return Ok(ServiceState::Disabled),
            ServiceState::Closed => {
                return Err(ServiceError::Closed {
                    capability: self.capability,
                })
            }
            state @ ServiceState::Connecting => {
                return Err(ServiceError::InvalidTransition {
                    capability: self.capability,
                    operation: "reconnect",
                    state,
                })
            }
            ServiceState::Ready | ServiceState::Degraded => {}
        }

        let stale = self.inner.write().client.take();
        if let Some(client) = stale {
            self.connector.disconnect(client).await;
        }
        self.attempt().await;
        self.settled()
    }

    /// Pings a `Ready` client. A failed ping moves the handle to
    /// `Degraded` and makes a reconnect due immediately.
    ///
    /// Handles in any other state report their state without pinging.
    pub async fn health_check(&self) -> Result<ServiceState, ServiceError> {
        let seen = self.generation.load(Ordering::Acquire);
        let client = {
            let inner = self.inner.read();
            match (&inner.state, &inner.client) {
                (ServiceState::Ready, Some(client)) => client.clone(),
                (state, _) => return Ok(*state),
            }
        };

        let outcome =
            tokio::time::timeout(self.options.connect_timeout, self.connector.ping(&client)).await;
        let message = match outcome {
            Ok(Ok(())) => return Ok(ServiceState::Ready),
            Ok(Err(err)) => err.to_string(),
            Err(_) => format!("no reply within {:?}", self.options.connect_timeout),
        };

        let err = ServiceError::HealthCheckFailed {
            capability: self.capability,
            message,
        };
        let mut inner = self.inner.write();
        // A reconnect or close may have settled while the ping was out.
        if self.generation.load(Ordering::Acquire) == seen && inner.state == ServiceState::Ready {
            LOG.warn(format!("{err}; marking degraded"));
            inner.state = ServiceState::Degraded;
            inner.last_error = Some(err);
            inner.next_attempt_at = Some(Instant::now());
        }
        Ok(inner.state)
    }

    /// Releases the connection. Idempotent; a disabled handle stays
    /// disabled.
    pub async fn close(&self) {
        let _flight = self.flight.lock().await;

        let client = {
            let mut inner = self.inner.write();
            match inner.state {
                ServiceState::Disabled | ServiceState::Closed => return,
                _ => {}
            }
            inner.state = ServiceState::Closed;
            inner.next_attempt_at = None;
            inner.client.take()
        };
        self.generation.fetch_add(1, Ordering::AcqRel);

        if let Some(client) = client {
            self.connector.disconnect(client).await;
        }
        LOG.info(format!("{} closed", self.capability));
    }

    /// The client when `Ready`, a sentinel otherwise.
    ///
    /// Fails after close, and during the first connection when strict
    /// client access is enabled.
    pub fn client(&self) -> Result<ServiceClient<K::Client>, ServiceError> {
        let inner = self.inner.read();
        match inner.state {
            ServiceState::Ready => Ok(inner
                .client
                .clone()
                .map_or(ServiceClient::Unavailable, ServiceClient::Ready)),
            ServiceState::Disabled => Ok(ServiceClient::NotEnabled),
            ServiceState::Degraded => Ok(ServiceClient::Unavailable),
            ServiceState::Connecting if self.options.strict_client => {
                Err(ServiceError::Connecting {
                    capability: self.capability,
                })
            }
            ServiceState::Connecting => Ok(ServiceClient::Unavailable),
            ServiceState::Closed => Err(ServiceError::Closed {
                capability: self.capability,
            }),
        }
    }

    /// Starts a background reconnect when the handle is `Degraded` and its
    /// backoff deadline has passed. Returns whether one was started.
    pub fn reconnect_if_due(self: &Arc<Self>) -> bool {
        {
            let mut inner = self.inner.write();
            let due = inner.state == ServiceState::Degraded
                && inner
                    .next_attempt_at
                    .is_some_and(|at| at <= Instant::now());
            if !due {
                return false;
            }
            // Cleared so concurrent requests do not each spawn a task; a
            // failed attempt schedules the next deadline.
            inner.next_attempt_at = None;
        }

        let handle = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(err) = handle.reconnect().await {
                LOG.debug(format!("background reconnect skipped: {err}"));
            }
        });
        true
    }

    /// One connection attempt. Caller must hold the flight mutex.
    async fn attempt(&self) {
        self.inner.write().state = ServiceState::Connecting;
        self.attempts.fetch_add(1, Ordering::AcqRel);

        let timeout = self.options.connect_timeout;
        let outcome = tokio::time::timeout(timeout, self.connector.connect()).await;

        {
            let mut inner = self.inner.write();
            match outcome {
                Ok(Ok(client)) => {
                    inner.state = ServiceState::Ready;
                    inner.client = Some(client);
                    inner.last_error = None;
                    inner.failures = 0;
                    inner.next_attempt_at = None;
                    LOG.info(format!("{} ready", self.capability));
                }
                Ok(Err(err)) => self.record_failure(
                    &mut inner,
                    ServiceError::ConnectFailed {
                        capability: self.capability,
                        message: err.to_string(),
                    },
                ),
                Err(_) => self.record_failure(
                    &mut inner,
                    ServiceError::Timeout {
                        capability: self.capability,
                        timeout,
                    },
                ),
            }
        }
        self.generation.fetch_add(1, Ordering::AcqRel);
    }

    fn record_failure(&self, inner: &mut Inner<K::Client>, err: ServiceError) {
        inner.failures = inner.failures.saturating_add(1);
        inner.state = ServiceState::Degraded;
        inner.client = None;

        let policy = &self.options.reconnect;
        if backoff::attempts_remaining(inner.failures, policy) {
            let delay = backoff::delay_after(inner.failures, policy);
            inner.next_attempt_at = Some(Instant::now() + delay);
            LOG.warn(format!("{err}; retrying in {}ms", delay.as_millis()));
        } else {
            inner.next_attempt_at = None;
            LOG.error(format!(
                "{err}; giving up after {} consecutive failures",
                inner.failures
            ));
        }
        inner.last_error = Some(err);
    }

    fn settled(&self) -> Result<ServiceState, ServiceError> {
        let inner = self.inner.read();
        match inner.state {
            ServiceState::Closed => Err(ServiceError::Closed {
                capability: self.capability,
            }),
            state => Ok(state),
        }
    }

    fn settled_for_connect(&self) -> Result<ServiceState, ServiceError> {
        let state = self.settled()?;
        if state == ServiceState::Degraded && self.options.policy == StartupPolicy::Fatal {
            let err = self.last_error().unwrap_or(ServiceError::Unavailable {
                capability: self.capability,
            });
            return Err(err);
        }
        Ok(state)
    }
}

/// Object-safe view of a handle, used by the registry to drive handles of
/// different client types in one ordered list.
#[async_trait]
pub trait ManagedService: Send + Sync {
    fn capability(&self) -> Capability;

    fn state(&self) -> ServiceState;

    fn last_error(&self) -> Option<ServiceError>;

    fn startup_policy(&self) -> StartupPolicy;

    async fn connect(&self) -> Result<ServiceState, ServiceError>;

    async fn reconnect(&self) -> Result<ServiceState, ServiceError>;

    async fn health_check(&self) -> Result<ServiceState, ServiceError>;

    async fn close(&self);

    /// See [`ServiceHandle::reconnect_if_due`].
    fn spawn_reconnect_if_due(self: Arc<Self>) -> bool;
}

#[async_trait]
impl<K: Connector> ManagedService for ServiceHandle<K> {
    fn capability(&self) -> Capability {
        self.capability
    }

    fn state(&self) -> ServiceState {
        ServiceHandle::state(self)
    }

    fn last_error(&self) -> Option<ServiceError> {
        ServiceHandle::last_error(self)
    }

    fn startup_policy(&self) -> StartupPolicy {
        self.options.policy
    }

    async fn connect(&self) -> Result<ServiceState, ServiceError> {
        ServiceHandle::connect(self).await
    }

    async fn reconnect(&self) -> Result<ServiceState, ServiceError> {
        ServiceHandle::reconnect(self).await
    }

    async fn health_check(&self) -> Result<ServiceState, ServiceError> {
        ServiceHandle::health_check(self).await
    }

    async fn close(&self) {
        ServiceHandle::close(self).await
    }

    fn spawn_reconnect_if_due(self: Arc<Self>) -> bool {
        ServiceHandle::reconnect_if_due(&self)
    }
}

/// Stand-in returned for capabilities that are not configured.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DisabledService {
    capability: Capability,
}

impl DisabledService {
    pub const fn new(capability: Capability) -> Self {
        Self { capability }
    }
}

#[async_trait]
impl ManagedService for DisabledService {
    fn capability(&self) -> Capability {
        self.capability
    }

    fn state(&self) -> ServiceState {
        ServiceState::Disabled
    }

    fn last_error(&self) -> Option<ServiceError> {
        None
    }

    fn startup_policy(&self) -> StartupPolicy {
        StartupPolicy::Degrade
    }

    async fn connect(&self) -> Result<ServiceState, ServiceError> {
        Ok(ServiceState::Disabled)
    }

    async fn reconnect(&self) -> Result<ServiceState, ServiceError> {
        Ok(ServiceState::Disabled)
    }

    async fn health_check(&self) -> Result<ServiceState, ServiceError> {
        Ok(ServiceState::Disabled)
    }

    async fn close(&self) {}

    fn spawn_reconnect_if_due(self: Arc<Self>) -> bool {
        false
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicBool, AtomicUsize};

    /// In-memory connector whose failures are switched from the test.
    #[derive(Clone)]
    pub struct FakeConnector {
        pub capability: Capability,
        pub fail_connect: Arc<AtomicBool>,
        pub fail_ping: Arc<AtomicBool>,
        pub connects: Arc<AtomicUsize>,
        pub disconnects: Arc<AtomicUsize>,
        /// Capabilities in the order they were disconnected; shared between
        /// fakes so a test can see the order across a registry.
        pub close_log: Arc<Mutex<Vec<Capability>>>,
        pub delay: Duration,
    }

    impl FakeConnector {
        pub fn new(capability: Capability) -> Self {
            Self {
                capability,
                fail_connect: Arc::new(AtomicBool::new(false)),
                fail_ping: Arc::new(AtomicBool::new(false)),
                connects: Arc::new(AtomicUsize::new(0)),
                disconnects: Arc::new(AtomicUsize::new(0)),
                close_log: Arc::new(Mutex::new(Vec::new())),
                delay: Duration::from_millis(0),
            }
        }

        pub fn failing(capability: Capability) -> Self {
            let fake = Self::new(capability);
            fake.fail_connect.store(true, Ordering::SeqCst);
            fake
        }

        pub fn with_delay(mut self, delay: Duration) -> Self {
            self.delay = delay;
            self
        }

        pub fn with_close_log(mut self, log: Arc<Mutex<Vec<Capability>>>) -> Self {
            self.close_log = log;
            self
        }
    }

    #[async_trait]
    impl Connector for FakeConnector {
        type Client = usize;

        fn capability(&self) -> Capability {
            self.capability
        }

        async fn connect(&self) -> Result<usize, BoxError> {
            let n = self.connects.fetch_add(1, Ordering::SeqCst) + 1;
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            if self.fail_connect.load(Ordering::SeqCst) {
                return Err("connection refused".into());
            }
            Ok(n)
        }

        async fn ping(&self, _client: &usize) -> Result<(), BoxError> {
            if self.fail_ping.load(Ordering::SeqCst) {
                return Err("no pong".into());
            }
            Ok(())
        }

        async fn disconnect(&self, _client: usize) {
            self.disconnects.fetch_add(1, Ordering::SeqCst);
            self.close_log.lock().push(self.capability);
        }
    }
}
