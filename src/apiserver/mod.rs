//! Secure API server for the `metrics.k8s.io` group.
//!
//! [`MetricsServer`] is built from a [`CompletedConfig`], collects named
//! health checks and turns into a [`PreparedServer`] once everything is in
//! place. Only [`PreparedServer::run`] opens the listener.

pub mod config;
pub mod filters;
pub mod handlers;
pub mod healthz;
pub mod tls;

pub use config::{
    CompletedConfig, GenericServerConfig, ProviderConfig, SecureServingInfo, ServiceConfig,
};
pub use healthz::{HealthzChecker, NamedCheck, PingHealthz};

use crate::k8s::SharedInformerFactory;
use crate::lifecycle::join_logged;
use crate::provider::resources::{API_VERSION, GROUP};
use crate::provider::{NodeMetricsProvider, PodMetricsProvider};
use crate::{Error, Result};
use axum::{middleware, routing::get, Router};
use axum_server::Handle;
use handlers::AppState;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tls::IdentityAcceptor;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

pub struct MetricsServer {
    config: GenericServerConfig,
    node: Arc<dyn NodeMetricsProvider>,
    pod: Arc<dyn PodMetricsProvider>,
    informers: Arc<SharedInformerFactory>,
    healthz: Vec<Arc<dyn HealthzChecker>>,
}

impl MetricsServer {
    pub(crate) fn new(
        config: GenericServerConfig,
        node: Arc<dyn NodeMetricsProvider>,
        pod: Arc<dyn PodMetricsProvider>,
        informers: Arc<SharedInformerFactory>,
    ) -> Self {
        Self {
            config,
            node,
            pod,
            informers,
            healthz: vec![Arc::new(PingHealthz)],
        }
    }

    /// Register additional health checks. Names must be unique.
    pub fn add_healthz_checks(&mut self, checks: Vec<Arc<dyn HealthzChecker>>) -> Result<()> {
        for check in checks {
            if self.healthz.iter().any(|c| c.name() == check.name()) {
                return Err(Error::ServerConfig(format!(
                    "duplicate health check {:?}",
                    check.name()
                )));
            }
            self.healthz.push(check);
        }
        Ok(())
    }

    pub fn healthz_checks(&self) -> Vec<String> {
        self.healthz.iter().map(|c| c.name().to_string()).collect()
    }

    pub fn router(&self) -> Router {
        let state = AppState {
            nodes: self.node.clone(),
            pods: self.pod.clone(),
            healthz: Arc::new(self.healthz.clone()),
            metrics: self.config.metrics.clone(),
            swagger: self.config.swagger.clone(),
            contention_profiling: self.config.enable_contention_profiling,
        };

        let prefix = format!("/apis/{}", API_VERSION);
        let mut router = Router::new()
            .route("/apis", get(handlers::api_group_list))
            .route(&format!("/apis/{}", GROUP), get(handlers::api_group))
            .route(&prefix, get(handlers::api_resource_list))
            .route(&format!("{}/nodes", prefix), get(handlers::list_nodes))
            .route(&format!("{}/nodes/{{name}}", prefix), get(handlers::get_node))
            .route(&format!("{}/pods", prefix), get(handlers::list_pods))
            .route(
                &format!("{}/namespaces/{{namespace}}/pods", prefix),
                get(handlers::list_namespaced_pods),
            )
            .route(
                &format!("{}/namespaces/{{namespace}}/pods/{{name}}", prefix),
                get(handlers::get_pod),
            )
            .route("/healthz", get(handlers::healthz))
            .route("/healthz/{name}", get(handlers::healthz_check))
            .route("/openapi/v2", get(handlers::openapi));

        if self.config.metrics.is_some() {
            router = router.route("/metrics", get(handlers::metrics));
        }
        if self.config.enable_profiling {
            router = router.route("/debug/runtime", get(handlers::debug_runtime));
        }

        let mut router = router.fallback(handlers::fallback).with_state(state);

        // Layers wrap outward: authentication runs before authorization.
        if let Some(authorizer) = &self.config.authorization {
            router = router.layer(middleware::from_fn_with_state(
                authorizer.clone(),
                filters::authorize,
            ));
        }
        if let Some(authenticator) = &self.config.authentication {
            router = router.layer(middleware::from_fn_with_state(
                authenticator.clone(),
                filters::authenticate,
            ));
        }
        if let Some(metrics) = &self.config.metrics {
            router = router.layer(middleware::from_fn_with_state(
                metrics.clone(),
                handlers::record_requests,
            ));
        }

        router.layer(TraceLayer::new_for_http())
    }

    /// Load TLS material and build the routes. Nothing listens yet.
    pub fn prepare_run(self) -> Result<PreparedServer> {
        let serving = self
            .config
            .secure_serving
            .as_ref()
            .ok_or_else(|| Error::Serve("secure serving is not configured".to_string()))?;

        let tls = tls::server_config(
            &serving.cert_file,
            &serving.key_file,
            serving.client_ca.as_deref(),
        )?;

        if self.config.authentication.is_none() {
            warn!("Authentication and authorization are disabled");
        }

        Ok(PreparedServer {
            router: self.router(),
            bind_address: serving.bind_address,
            tls,
            informers: self.informers,
            handle: Handle::new(),
            shutdown_grace: self.config.shutdown_grace,
        })
    }
}

pub struct PreparedServer {
    router: Router,
    bind_address: SocketAddr,
    tls: rustls::ServerConfig,
    informers: Arc<SharedInformerFactory>,
    handle: Handle,
    shutdown_grace: Duration,
}

impl PreparedServer {
    /// Start the informers and serve until `token` fires, then drain
    /// in-flight requests for at most the shutdown grace period.
    pub async fn run(self, token: CancellationToken) -> Result<()> {
        let informer_token = token.child_token();
        let informer_task = self.informers.start(informer_token.clone());

        let informers = self.informers.clone();
        let sync_token = informer_token.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = sync_token.cancelled() => {}
                synced = informers.wait_for_cache_sync() => {
                    if synced {
                        info!("Node cache synced");
                    }
                }
            }
        });

        let shutdown = {
            let handle = self.handle.clone();
            let token = token.clone();
            let grace = self.shutdown_grace;
            tokio::spawn(async move {
                token.cancelled().await;
                info!("Shutting down API server, draining for up to {:?}", grace);
                handle.graceful_shutdown(Some(grace));
            })
        };

        info!("Serving securely on {}", self.bind_address);

        let result = axum_server::bind(self.bind_address)
            .handle(self.handle)
            .acceptor(IdentityAcceptor::new(self.tls))
            .serve(self.router.into_make_service())
            .await;

        shutdown.abort();
        informer_token.cancel();
        if let Some(task) = informer_task {
            join_logged("Node informer", task).await;
        }

        info!("API server stopped");
        result.map_err(|e| Error::Serve(format!("{}: {}", self.bind_address, e)))
    }
}
