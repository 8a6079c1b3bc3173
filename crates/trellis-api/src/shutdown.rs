//! # Shutdown Coordination
//!
//! One [`ShutdownCoordinator`] per process. The first SIGTERM or SIGINT (or
//! a programmatic [`trigger`](ShutdownCoordinator::trigger)) stops the
//! listener, gives in-flight requests up to the drain period to finish,
//! closes every service handle in reverse initialization order and then
//! runs the registered hooks. A second signal exits immediately.

use std::future::{Future, IntoFuture};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use trellis_core::Logger;
use trellis_services::ServiceRegistry;

const LOG: Logger = Logger::new("shutdown");

/// Exit status after a second termination signal.
pub const FORCED_EXIT_CODE: i32 = 1;

type Hook = Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>;

struct Inner {
    trigger: watch::Sender<bool>,
    hooks: Mutex<Vec<(String, Hook)>>,
    finished: AtomicBool,
    registry: Arc<ServiceRegistry>,
    drain: Duration,
}

/// Cloneable handle to the process shutdown sequence.
#[derive(Clone)]
pub struct ShutdownCoordinator {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for ShutdownCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShutdownCoordinator")
            .field("triggered", &self.is_triggered())
            .field("hooks", &self.inner.hooks.lock().len())
            .field("drain", &self.inner.drain)
            .finish()
    }
}

impl ShutdownCoordinator {
    pub fn new(registry: Arc<ServiceRegistry>, drain: Duration) -> Self {
        let (trigger, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                trigger,
                hooks: Mutex::new(Vec::new()),
                finished: AtomicBool::new(false),
                registry,
                drain,
            }),
        }
    }

    /// Starts shutdown. Returns `false` if it was already started.
    pub fn trigger(&self) -> bool {
        self.inner.trigger.send_if_modified(|triggered| {
            if *triggered {
                false
            } else {
                *triggered = true;
                true
            }
        })
    }

    pub fn is_triggered(&self) -> bool {
        *self.inner.trigger.borrow()
    }

    /// Resolves once shutdown has been triggered.
    pub async fn signalled(&self) {
        let mut rx = self.inner.trigger.subscribe();
        // The sender lives in `self`, so this cannot fail while we wait.
        let _ = rx.wait_for(|triggered| *triggered).await;
    }

    /// Registers a hook to run after the service handles are closed.
    /// Hooks run once, in registration order.
    pub fn add_hook<F, Fut>(&self, name: impl Into<String>, hook: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let hook: Hook = Box::new(move || Box::pin(hook()));
        self.inner.hooks.lock().push((name.into(), hook));
    }

    /// Spawns the OS signal listener. The first signal triggers shutdown;
    /// the second exits the process with [`FORCED_EXIT_CODE`].
    pub fn listen_for_signals(&self) -> JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            match wait_for_signal().await {
                Ok(name) => {
                    LOG.info(format!("{name} received, shutting down"));
                    this.trigger();
                }
                Err(err) => {
                    LOG.error(format!("failed to install signal handlers: {err}"));
                    return;
                }
            }
            if let Ok(name) = wait_for_signal().await {
                LOG.error(format!("second {name} received, exiting immediately"));
                std::process::exit(FORCED_EXIT_CODE);
            }
        })
    }

    /// Serves `router` on `listener` until shutdown, then drains and runs
    /// [`finish`](Self::finish).
    pub async fn serve(&self, listener: TcpListener, router: Router) -> std::io::Result<()> {
        let this = self.clone();
        let server = axum::serve(
            listener,
            router.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move { this.signalled().await })
        .into_future();
        tokio::pin!(server);

        let result = tokio::select! {
            result = &mut server => result,
            _ = self.signalled() => {
                LOG.info(format!("draining in-flight requests for up to {:?}", self.inner.drain));
                match tokio::time::timeout(self.inner.drain, &mut server).await {
                    Ok(result) => result,
                    Err(_) => {
                        LOG.warn("drain period elapsed, abandoning open connections");
                        Ok(())
                    }
                }
            }
        };

        self.finish().await;
        result
    }

    /// Closes the service handles, then runs the hooks. Only the first
    /// call does anything.
    pub async fn finish(&self) {
        if self.inner.finished.swap(true, Ordering::SeqCst) {
            return;
        }
        self.trigger();

        self.inner.registry.close_all().await;
        LOG.info("service handles closed");

        let hooks = std::mem::take(&mut *self.inner.hooks.lock());
        for (name, hook) in hooks {
            LOG.debug(format!("running shutdown hook {name}"));
            hook().await;
        }
        LOG.info("shutdown complete");
    }
}

#[cfg(unix)]
async fn wait_for_signal() -> std::io::Result<&'static str> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = signal(SignalKind::terminate())?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result.map(|_| "SIGINT"),
        _ = terminate.recv() => Ok("SIGTERM"),
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() -> std::io::Result<&'static str> {
    tokio::signal::ctrl_c().await.map(|_| "Ctrl-C")
}
