use super::healthz::{self, HealthzChecker};
use crate::metrics::ServiceMetrics;
use crate::provider::resources::{MetricsList, GROUP, VERSION, API_VERSION};
use crate::provider::{NodeMetricsProvider, PodMetricsProvider};
use axum::{
    extract::{Path, Query, Request, State},
    http::{header, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::error;

#[derive(Clone)]
pub struct AppState {
    pub nodes: Arc<dyn NodeMetricsProvider>,
    pub pods: Arc<dyn PodMetricsProvider>,
    pub healthz: Arc<Vec<Arc<dyn HealthzChecker>>>,
    pub metrics: Option<Arc<ServiceMetrics>>,
    pub swagger: Option<Value>,
    pub contention_profiling: bool,
}

/// Kubernetes `Status` error body.
pub fn status_error(code: StatusCode, reason: &str, message: String) -> Response {
    let body = json!({
        "kind": "Status",
        "apiVersion": "v1",
        "metadata": {},
        "status": "Failure",
        "message": message,
        "reason": reason,
        "code": code.as_u16(),
    });
    (code, Json(body)).into_response()
}

fn not_found(resource: &str, name: &str) -> Response {
    status_error(
        StatusCode::NOT_FOUND,
        "NotFound",
        format!("{}.{} \"{}\" not found", resource, GROUP, name),
    )
}

pub async fn fallback(request: Request) -> Response {
    status_error(
        StatusCode::NOT_FOUND,
        "NotFound",
        format!("the server could not find the requested resource ({})", request.uri().path()),
    )
}

pub async fn api_group_list() -> impl IntoResponse {
    Json(json!({
        "kind": "APIGroupList",
        "apiVersion": "v1",
        "groups": [api_group_value()],
    }))
}

pub async fn api_group() -> impl IntoResponse {
    Json(api_group_value())
}

fn api_group_value() -> Value {
    let version = json!({ "groupVersion": API_VERSION, "version": VERSION });
    json!({
        "kind": "APIGroup",
        "apiVersion": "v1",
        "name": GROUP,
        "versions": [version.clone()],
        "preferredVersion": version,
    })
}

pub async fn api_resource_list() -> impl IntoResponse {
    let verbs = ["get", "list"];
    Json(json!({
        "kind": "APIResourceList",
        "apiVersion": "v1",
        "groupVersion": API_VERSION,
        "resources": [
            { "name": "nodes", "singularName": "", "namespaced": false, "kind": "NodeMetrics", "verbs": verbs },
            { "name": "pods", "singularName": "", "namespaced": true, "kind": "PodMetrics", "verbs": verbs },
        ],
    }))
}

pub async fn list_nodes(State(state): State<AppState>) -> impl IntoResponse {
    Json(MetricsList::new(
        "NodeMetricsList",
        state.nodes.list_node_metrics().await,
    ))
}

pub async fn get_node(State(state): State<AppState>, Path(name): Path<String>) -> Response {
    match state.nodes.get_node_metrics(&name).await {
        Some(metrics) => Json(metrics).into_response(),
        None => not_found("nodemetrics", &name),
    }
}

pub async fn list_pods(State(state): State<AppState>) -> impl IntoResponse {
    Json(MetricsList::new(
        "PodMetricsList",
        state.pods.list_pod_metrics(None).await,
    ))
}

pub async fn list_namespaced_pods(
    State(state): State<AppState>,
    Path(namespace): Path<String>,
) -> impl IntoResponse {
    Json(MetricsList::new(
        "PodMetricsList",
        state.pods.list_pod_metrics(Some(&namespace)).await,
    ))
}

pub async fn get_pod(
    State(state): State<AppState>,
    Path((namespace, name)): Path<(String, String)>,
) -> Response {
    match state.pods.get_pod_metrics(&namespace, &name).await {
        Some(metrics) => Json(metrics).into_response(),
        None => not_found("podmetrics", &name),
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct HealthzQuery {
    #[serde(default)]
    verbose: Option<String>,
}

pub async fn healthz(
    State(state): State<AppState>,
    Query(query): Query<HealthzQuery>,
) -> Response {
    let (ok, body) = healthz::aggregate(&state.healthz, query.verbose.is_some());
    if !ok {
        error!("Health check failed:\n{}", body);
    }
    health_response(ok, body)
}

pub async fn healthz_check(State(state): State<AppState>, Path(name): Path<String>) -> Response {
    let check = match state.healthz.iter().find(|c| c.name() == name) {
        Some(check) => check,
        None => return (StatusCode::NOT_FOUND, "not found").into_response(),
    };

    match check.check() {
        Ok(()) => health_response(true, "ok".to_string()),
        Err(reason) => health_response(false, format!("internal server error: {}", reason)),
    }
}

fn health_response(ok: bool, body: String) -> Response {
    let code = if ok {
        StatusCode::OK
    } else {
        StatusCode::INTERNAL_SERVER_ERROR
    };
    (
        code,
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        body,
    )
        .into_response()
}

pub async fn metrics(State(state): State<AppState>) -> Response {
    let metrics = match &state.metrics {
        Some(metrics) => metrics,
        None => return fallback_status(),
    };

    match metrics.encode() {
        Ok(body) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            body,
        )
            .into_response(),
        Err(e) => status_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            "InternalError",
            format!("encoding metrics: {}", e),
        ),
    }
}

pub async fn openapi(State(state): State<AppState>) -> Response {
    match state.swagger {
        Some(doc) => Json(doc).into_response(),
        None => fallback_status(),
    }
}

fn fallback_status() -> Response {
    status_error(
        StatusCode::NOT_FOUND,
        "NotFound",
        "the server could not find the requested resource".to_string(),
    )
}

/// Runtime counters for the profiling endpoint.
pub async fn debug_runtime(State(state): State<AppState>) -> impl IntoResponse {
    let metrics = tokio::runtime::Handle::current().metrics();
    let mut body = json!({
        "workers": metrics.num_workers(),
        "aliveTasks": metrics.num_alive_tasks(),
        "version": crate::VERSION,
    });
    if state.contention_profiling {
        body["globalQueueDepth"] = json!(metrics.global_queue_depth());
    }
    Json(body)
}

/// Default OpenAPI document for the served group.
pub fn default_swagger() -> Value {
    let usage = json!({ "type": "object", "additionalProperties": { "type": "string" } });
    let meta = json!({ "type": "object" });

    json!({
        "swagger": "2.0",
        "info": { "title": "kubemetrics", "version": crate::VERSION },
        "paths": {
            format!("/apis/{}/nodes", API_VERSION): { "get": { "operationId": "listNodeMetrics" } },
            format!("/apis/{}/nodes/{{name}}", API_VERSION): { "get": { "operationId": "readNodeMetrics" } },
            format!("/apis/{}/pods", API_VERSION): { "get": { "operationId": "listPodMetricsForAllNamespaces" } },
            format!("/apis/{}/namespaces/{{namespace}}/pods", API_VERSION): { "get": { "operationId": "listNamespacedPodMetrics" } },
            format!("/apis/{}/namespaces/{{namespace}}/pods/{{name}}", API_VERSION): { "get": { "operationId": "readNamespacedPodMetrics" } },
        },
        "definitions": {
            "NodeMetrics": {
                "type": "object",
                "properties": {
                    "metadata": meta.clone(),
                    "timestamp": { "type": "string", "format": "date-time" },
                    "window": { "type": "string" },
                    "usage": usage.clone(),
                },
            },
            "PodMetrics": {
                "type": "object",
                "properties": {
                    "metadata": meta,
                    "timestamp": { "type": "string", "format": "date-time" },
                    "window": { "type": "string" },
                    "containers": {
                        "type": "array",
                        "items": {
                            "type": "object",
                            "properties": { "name": { "type": "string" }, "usage": usage },
                        },
                    },
                },
            },
        },
    })
}

/// Counts every response by status code.
pub async fn record_requests(
    State(metrics): State<Arc<ServiceMetrics>>,
    request: Request,
    next: Next,
) -> Response {
    let response = next.run(request).await;
    metrics.record_request(response.status().as_u16());
    response
}
