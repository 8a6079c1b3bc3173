//! # Startup
//!
//! ## Sequence
//!
//! 1. **Services**: build the registry and connect enabled capabilities in
//!    order (database, cache, storage). A `fatal` capability that cannot
//!    connect aborts startup.
//! 2. **Migrations**: when `DATABASE_MIGRATE` is set and the database is up.
//! 3. **Routes**: load every descriptor below `COMPONENTS_DIR` against the
//!    built-in catalog and log the route audit.
//! 4. **Pipeline**: wrap the routes in the middleware chain.
//! 5. **Serve**: accept connections until a termination signal, then drain
//!    and shut down.
//!
//! Each phase completes before the next begins. Any failure is a
//! [`StartupError`] and the process exits before accepting traffic.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use trellis_core::{AppConfig, ConfigError, Logger, Toggle};
use trellis_services::{RegistryError, ServiceRegistry};

use crate::components;
use crate::loader::{LoadError, RoutingTable};
use crate::middleware::normalizer::ErrorChannel;
use crate::pipeline::Pipeline;
use crate::shutdown::ShutdownCoordinator;

const LOG: Logger = Logger::new("app");

/// Errors that stop the server before it accepts traffic.
#[derive(Debug, thiserror::Error)]
pub enum StartupError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("service registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("route loading failed: {0}")]
    Load(#[from] LoadError),

    #[error("database migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    #[error("metrics exporter error: {0}")]
    Metrics(#[from] BuildError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A fully assembled application, ready to serve.
#[derive(Debug)]
pub struct App {
    pub config: AppConfig,
    pub registry: Arc<ServiceRegistry>,
    pub router: Router,
    pub errors: ErrorChannel,
    pub shutdown: ShutdownCoordinator,
}

/// Runs startup phases 1 through 4.
pub async fn build(config: AppConfig) -> Result<App, StartupError> {
    let registry = Arc::new(ServiceRegistry::start(&config.services).await?);

    let routed = async {
        migrate(&config, &registry).await?;
        let catalog = components::catalog(config.mode, registry.clone());
        let table = RoutingTable::load(catalog, &config.components_dir).await?;
        table.log_audit();
        Ok::<_, StartupError>(table)
    }
    .await;
    let table = match routed {
        Ok(table) => table,
        Err(err) => {
            registry.close_all().await;
            return Err(err);
        }
    };

    let mut pipeline = Pipeline::new(&config, registry.clone());
    if config.metrics_enabled {
        pipeline = pipeline.with_metrics(PrometheusBuilder::new().install_recorder()?);
    }
    let router = pipeline.build(table);
    let errors = pipeline.errors().clone();
    log_server_errors(&errors);

    let shutdown = ShutdownCoordinator::new(registry.clone(), config.shutdown_drain);
    LOG.info(format!("application initialized in {} mode", config.mode));

    Ok(App {
        config,
        registry,
        router,
        errors,
        shutdown,
    })
}

/// Builds the application and serves it until shutdown completes.
pub async fn run(config: AppConfig) -> Result<(), StartupError> {
    let app = build(config).await?;
    let addr = SocketAddr::from(([0, 0, 0, 0], app.config.port));
    serve(app, addr).await
}

/// Phase 5. The service handles are closed on every exit path, including a
/// listener that cannot bind.
pub async fn serve(app: App, addr: SocketAddr) -> Result<(), StartupError> {
    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(err) => {
            LOG.error(format!("cannot listen on {addr}: {err}"));
            app.shutdown.finish().await;
            return Err(err.into());
        }
    };
    LOG.info(format!("listening on {addr}"));

    app.shutdown.listen_for_signals();
    app.shutdown.serve(listener, app.router).await?;
    Ok(())
}

async fn migrate(config: &AppConfig, registry: &ServiceRegistry) -> Result<(), StartupError> {
    let Toggle::Enabled { params, .. } = &config.services.database else {
        return Ok(());
    };
    if !params.migrate {
        return Ok(());
    }
    match registry.clients().database() {
        Ok(pool) => {
            sqlx::migrate!("./migrations").run(&pool).await?;
            LOG.info("database migrations applied");
        }
        Err(err) => LOG.warn(format!("skipping migrations: {err}")),
    }
    Ok(())
}

/// Logs every report published on `errors` until the channel closes.
fn log_server_errors(errors: &ErrorChannel) -> JoinHandle<()> {
    let mut reports = errors.subscribe();
    tokio::spawn(async move {
        loop {
            match reports.recv().await {
                Ok(report) => tracing::error!(
                    namespace = LOG.namespace(),
                    status = report.status,
                    method = %report.method,
                    path = %report.path,
                    request_id = %report.request_id,
                    chain = ?report.chain,
                    "server error: {}",
                    report.message
                ),
                Err(RecvError::Lagged(skipped)) => {
                    LOG.warn(format!("error listener fell behind, {skipped} report(s) dropped"))
                }
                Err(RecvError::Closed) => break,
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[tokio::test]
    async fn missing_components_dir_fails_startup() {
        let dir = tempfile::tempdir().unwrap();
        let config = AppConfig {
            components_dir: dir.path().join("missing"),
            ..AppConfig::default()
        };
        let err = build(config).await.unwrap_err();
        assert!(matches!(err, StartupError::Load(LoadError::ComponentsDirMissing { .. })));
    }

    #[tokio::test]
    async fn bundled_components_load() {
        let config = AppConfig {
            components_dir: concat!(env!("CARGO_MANIFEST_DIR"), "/components").into(),
            ..AppConfig::default()
        };
        let app = build(config).await.unwrap();
        assert!(!app.shutdown.is_triggered());
    }

    #[tokio::test]
    async fn bind_failure_still_closes_services() {
        let taken = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = taken.local_addr().unwrap();
        let config = AppConfig {
            components_dir: concat!(env!("CARGO_MANIFEST_DIR"), "/components").into(),
            ..AppConfig::default()
        };
        let app = build(config).await.unwrap();
        let closed = Arc::new(AtomicBool::new(false));
        let flag = closed.clone();
        app.shutdown.add_hook("flag", move || async move {
            flag.store(true, Ordering::SeqCst);
        });
        let shutdown = app.shutdown.clone();

        let err = serve(app, addr).await.unwrap_err();

        assert!(matches!(err, StartupError::Io(_)));
        assert!(shutdown.is_triggered());
        assert!(closed.load(Ordering::SeqCst), "shutdown sequence ran");
    }
}
