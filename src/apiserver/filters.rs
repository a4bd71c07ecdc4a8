//! Request authentication and authorization delegated to the cluster.
//!
//! Authentication tries the verified client certificate first, then a bearer
//! token checked through `TokenReview`; requests with neither are anonymous.
//! Authorization asks the cluster through `SubjectAccessReview`, except for a
//! fixed set of always-allowed paths. Both results are cached for a TTL.

use super::handlers::status_error;
use super::tls::PeerCertificates;
use crate::provider::resources::{GROUP, VERSION};
use async_trait::async_trait;
use axum::extract::{Request, State};
use axum::http::{header::AUTHORIZATION, Method, StatusCode};
use axum::middleware::Next;
use axum::response::Response;
use dashmap::DashMap;
use k8s_openapi::api::authentication::v1::{TokenReview, TokenReviewSpec};
use k8s_openapi::api::authorization::v1::{
    NonResourceAttributes, ResourceAttributes, SubjectAccessReview, SubjectAccessReviewSpec,
};
use kube::api::PostParams;
use kube::{Api, Client};
use rustls::pki_types::CertificateDer;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

pub const ANONYMOUS_USER: &str = "system:anonymous";
pub const UNAUTHENTICATED_GROUP: &str = "system:unauthenticated";
pub const AUTHENTICATED_GROUP: &str = "system:authenticated";

/// Cache size at which expired entries are swept before the next insert.
const CACHE_SWEEP_THRESHOLD: usize = 1024;
/// Live entries past this are not cached; the review is simply repeated.
const CACHE_MAX_ENTRIES: usize = 4096;

type TtlCache<K, V> = DashMap<K, (V, Instant)>;

fn cache_insert<K, V>(cache: &TtlCache<K, V>, key: K, value: V, ttl: impl Fn(&V) -> Duration)
where
    K: Eq + Hash,
{
    if cache.len() >= CACHE_SWEEP_THRESHOLD {
        cache.retain(|_, (cached, stored)| stored.elapsed() < ttl(&*cached));
    }
    if cache.len() < CACHE_MAX_ENTRIES {
        cache.insert(key, (value, Instant::now()));
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct UserInfo {
    pub username: String,
    pub groups: Vec<String>,
}

impl UserInfo {
    pub fn anonymous() -> Self {
        Self {
            username: ANONYMOUS_USER.to_string(),
            groups: vec![UNAUTHENTICATED_GROUP.to_string()],
        }
    }

    fn authenticated(username: String, mut groups: Vec<String>) -> Self {
        if !groups.iter().any(|g| g == AUTHENTICATED_GROUP) {
            groups.push(AUTHENTICATED_GROUP.to_string());
        }
        Self { username, groups }
    }
}

/// Resolves a bearer token to a user. `Ok(None)` means the token is not valid.
#[async_trait]
pub trait TokenReviewer: Send + Sync {
    async fn review(&self, token: &str) -> Result<Option<UserInfo>, String>;
}

pub struct KubeTokenReviewer {
    api: Api<TokenReview>,
}

impl KubeTokenReviewer {
    pub fn new(client: Client) -> Self {
        Self {
            api: Api::all(client),
        }
    }
}

#[async_trait]
impl TokenReviewer for KubeTokenReviewer {
    async fn review(&self, token: &str) -> Result<Option<UserInfo>, String> {
        let review = TokenReview {
            spec: TokenReviewSpec {
                token: Some(token.to_string()),
                ..Default::default()
            },
            ..Default::default()
        };

        let created = self
            .api
            .create(&PostParams::default(), &review)
            .await
            .map_err(|e| format!("token review failed: {}", e))?;

        let status = match created.status {
            Some(status) if status.authenticated == Some(true) => status,
            _ => return Ok(None),
        };

        Ok(status.user.and_then(|user| {
            user.username
                .map(|name| UserInfo::authenticated(name, user.groups.unwrap_or_default()))
        }))
    }
}

pub struct Authenticator {
    token_reviewer: Option<Arc<dyn TokenReviewer>>,
    cache_ttl: Duration,
    token_cache: TtlCache<String, Option<UserInfo>>,
}

impl Authenticator {
    pub fn new(token_reviewer: Option<Arc<dyn TokenReviewer>>, cache_ttl: Duration) -> Self {
        Self {
            token_reviewer,
            cache_ttl,
            token_cache: DashMap::new(),
        }
    }

    pub async fn authenticate(
        &self,
        peer_certificates: &[CertificateDer<'_>],
        authorization: Option<&str>,
    ) -> Result<UserInfo, String> {
        if let Some(leaf) = peer_certificates.first() {
            return user_from_certificate(leaf);
        }

        let token = authorization
            .and_then(|h| h.strip_prefix("Bearer "))
            .map(str::trim)
            .filter(|t| !t.is_empty());

        match (token, &self.token_reviewer) {
            (Some(token), Some(reviewer)) => self
                .review_cached(reviewer.as_ref(), token)
                .await?
                .ok_or_else(|| "invalid bearer token".to_string()),
            _ => Ok(UserInfo::anonymous()),
        }
    }

    async fn review_cached(
        &self,
        reviewer: &dyn TokenReviewer,
        token: &str,
    ) -> Result<Option<UserInfo>, String> {
        if let Some(entry) = self.token_cache.get(token) {
            let (user, stored) = entry.value();
            if stored.elapsed() < self.cache_ttl {
                return Ok(user.clone());
            }
        }

        let user = reviewer.review(token).await?;
        let ttl = self.cache_ttl;
        cache_insert(&self.token_cache, token.to_string(), user.clone(), |_| ttl);
        Ok(user)
    }
}

/// Username from the subject common name, groups from its organizations.
fn user_from_certificate(der: &CertificateDer<'_>) -> Result<UserInfo, String> {
    let (_, cert) = x509_parser::parse_x509_certificate(der.as_ref())
        .map_err(|e| format!("invalid client certificate: {}", e))?;
    let subject = cert.subject();

    let username = subject
        .iter_common_name()
        .next()
        .and_then(|cn| cn.as_str().ok())
        .filter(|cn| !cn.is_empty())
        .ok_or_else(|| "client certificate has no common name".to_string())?
        .to_string();

    let groups = subject
        .iter_organization()
        .filter_map(|o| o.as_str().ok())
        .map(str::to_string)
        .collect();

    Ok(UserInfo::authenticated(username, groups))
}

/// What a request is trying to do, in the terms access reviews use.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RequestAttributes {
    Resource {
        verb: String,
        namespace: Option<String>,
        resource: String,
        name: Option<String>,
    },
    NonResource {
        verb: String,
        path: String,
    },
}

impl RequestAttributes {
    pub fn from_request(method: &Method, path: &str) -> Self {
        let prefix = format!("/apis/{}/{}/", GROUP, VERSION);
        let segments: Vec<&str> = match path.strip_prefix(&prefix) {
            Some(rest) => rest.split('/').filter(|s| !s.is_empty()).collect(),
            None => Vec::new(),
        };

        let (namespace, resource, name) = match segments.as_slice() {
            [resource] => (None, *resource, None),
            [resource, name] if *resource != "namespaces" => (None, *resource, Some(*name)),
            ["namespaces", ns, resource] => (Some(*ns), *resource, None),
            ["namespaces", ns, resource, name] => (Some(*ns), *resource, Some(*name)),
            _ => {
                return RequestAttributes::NonResource {
                    verb: method.as_str().to_lowercase(),
                    path: path.to_string(),
                }
            }
        };

        if method != Method::GET && method != Method::HEAD {
            return RequestAttributes::NonResource {
                verb: method.as_str().to_lowercase(),
                path: path.to_string(),
            };
        }
        let verb = if name.is_some() { "get" } else { "list" };

        RequestAttributes::Resource {
            verb: verb.to_string(),
            namespace: namespace.map(str::to_string),
            resource: resource.to_string(),
            name: name.map(str::to_string),
        }
    }

    fn verb(&self) -> &str {
        match self {
            RequestAttributes::Resource { verb, .. } | RequestAttributes::NonResource { verb, .. } => {
                verb
            }
        }
    }

    fn target(&self) -> String {
        match self {
            RequestAttributes::Resource {
                resource,
                namespace,
                ..
            } => match namespace {
                Some(ns) => format!("resource \"{}\" in API group \"{}\" in the namespace \"{}\"", resource, GROUP, ns),
                None => format!("resource \"{}\" in API group \"{}\" at the cluster scope", resource, GROUP),
            },
            RequestAttributes::NonResource { path, .. } => format!("path \"{}\"", path),
        }
    }
}

/// Decides whether a user may perform an action.
#[async_trait]
pub trait AccessReviewer: Send + Sync {
    async fn review(&self, user: &UserInfo, attributes: &RequestAttributes) -> Result<bool, String>;
}

pub struct KubeAccessReviewer {
    api: Api<SubjectAccessReview>,
}

impl KubeAccessReviewer {
    pub fn new(client: Client) -> Self {
        Self {
            api: Api::all(client),
        }
    }
}

#[async_trait]
impl AccessReviewer for KubeAccessReviewer {
    async fn review(&self, user: &UserInfo, attributes: &RequestAttributes) -> Result<bool, String> {
        let mut spec = SubjectAccessReviewSpec {
            user: Some(user.username.clone()),
            groups: Some(user.groups.clone()),
            ..Default::default()
        };

        match attributes {
            RequestAttributes::Resource {
                verb,
                namespace,
                resource,
                name,
            } => {
                spec.resource_attributes = Some(ResourceAttributes {
                    group: Some(GROUP.to_string()),
                    version: Some(VERSION.to_string()),
                    verb: Some(verb.clone()),
                    namespace: namespace.clone(),
                    resource: Some(resource.clone()),
                    name: name.clone(),
                    ..Default::default()
                })
            }
            RequestAttributes::NonResource { verb, path } => {
                spec.non_resource_attributes = Some(NonResourceAttributes {
                    verb: Some(verb.clone()),
                    path: Some(path.clone()),
                })
            }
        }

        let review = SubjectAccessReview {
            spec,
            ..Default::default()
        };

        let created = self
            .api
            .create(&PostParams::default(), &review)
            .await
            .map_err(|e| format!("subject access review failed: {}", e))?;

        Ok(created.status.map(|s| s.allowed).unwrap_or(false))
    }
}

pub struct Authorizer {
    always_allow_paths: Vec<String>,
    reviewer: Option<Arc<dyn AccessReviewer>>,
    allowed_ttl: Duration,
    unauthorized_ttl: Duration,
    cache: TtlCache<(UserInfo, RequestAttributes), bool>,
}

impl Authorizer {
    pub fn new(
        always_allow_paths: Vec<String>,
        reviewer: Option<Arc<dyn AccessReviewer>>,
        allowed_ttl: Duration,
        unauthorized_ttl: Duration,
    ) -> Self {
        Self {
            always_allow_paths,
            reviewer,
            allowed_ttl,
            unauthorized_ttl,
            cache: DashMap::new(),
        }
    }

    pub fn always_allowed(&self, path: &str) -> bool {
        self.always_allow_paths.iter().any(|allowed| match allowed.strip_suffix('*') {
            Some(prefix) => path.starts_with(prefix),
            None => path == allowed,
        })
    }

    /// Without a reviewer only always-allowed paths are permitted.
    pub async fn authorize(&self, user: &UserInfo, attributes: &RequestAttributes) -> Result<bool, String> {
        if let RequestAttributes::NonResource { path, .. } = attributes {
            if self.always_allowed(path) {
                return Ok(true);
            }
        }

        let reviewer = match &self.reviewer {
            Some(reviewer) => reviewer,
            None => return Ok(false),
        };

        let key = (user.clone(), attributes.clone());
        if let Some(entry) = self.cache.get(&key) {
            let (allowed, stored) = *entry.value();
            if stored.elapsed() < self.ttl(allowed) {
                return Ok(allowed);
            }
        }

        let allowed = reviewer.review(user, attributes).await?;
        cache_insert(&self.cache, key, allowed, |allowed| self.ttl(*allowed));
        Ok(allowed)
    }

    fn ttl(&self, allowed: bool) -> Duration {
        if allowed {
            self.allowed_ttl
        } else {
            self.unauthorized_ttl
        }
    }
}

pub async fn authenticate(
    State(authenticator): State<Arc<Authenticator>>,
    mut request: Request,
    next: Next,
) -> Response {
    let certificates = request
        .extensions()
        .get::<PeerCertificates>()
        .cloned()
        .unwrap_or_default();
    let authorization = request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    match authenticator
        .authenticate(&certificates.0, authorization.as_deref())
        .await
    {
        Ok(user) => {
            debug!("Authenticated {} as {}", request.uri().path(), user.username);
            request.extensions_mut().insert(user);
            next.run(request).await
        }
        Err(reason) => {
            debug!("Authentication failed for {}: {}", request.uri().path(), reason);
            status_error(StatusCode::UNAUTHORIZED, "Unauthorized", "Unauthorized".to_string())
        }
    }
}

pub async fn authorize(
    State(authorizer): State<Arc<Authorizer>>,
    request: Request,
    next: Next,
) -> Response {
    let user = request
        .extensions()
        .get::<UserInfo>()
        .cloned()
        .unwrap_or_else(UserInfo::anonymous);
    let attributes = RequestAttributes::from_request(request.method(), request.uri().path());

    match authorizer.authorize(&user, &attributes).await {
        Ok(true) => next.run(request).await,
        Ok(false) => status_error(
            StatusCode::FORBIDDEN,
            "Forbidden",
            format!(
                "forbidden: User \"{}\" cannot {} {}",
                user.username,
                attributes.verb(),
                attributes.target()
            ),
        ),
        Err(reason) => {
            warn!("Authorization error: {}", reason);
            status_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                "InternalError",
                format!("authorization error: {}", reason),
            )
        }
    }
}
