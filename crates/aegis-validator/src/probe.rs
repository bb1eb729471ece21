//! Filesystem and image registry probes used by the precondition stage

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{ACCEPT, WWW_AUTHENTICATE};
use reqwest::StatusCode;
use serde::Deserialize;
use tracing::debug;

#[cfg(test)]
use mockall::automock;

use aegis_common::{Error, Result};

/// Docker Hub's registry API host
const DOCKER_HUB_REGISTRY: &str = "registry-1.docker.io";

const MANIFEST_MEDIA_TYPES: &str = "application/vnd.oci.image.index.v1+json, \
    application/vnd.oci.image.manifest.v1+json, \
    application/vnd.docker.distribution.manifest.list.v2+json, \
    application/vnd.docker.distribution.manifest.v2+json";

const REGISTRY_TIMEOUT: Duration = Duration::from_secs(10);

/// Whether a filesystem path exists
#[cfg_attr(test, automock)]
#[async_trait]
pub trait PathProbe: Send + Sync {
    /// True if `path` names an existing file or directory
    async fn exists(&self, path: &str) -> bool;
}

/// Checks paths on the local filesystem
#[derive(Clone, Copy, Debug, Default)]
pub struct HostPathProbe;

#[async_trait]
impl PathProbe for HostPathProbe {
    async fn exists(&self, path: &str) -> bool {
        match tokio::fs::try_exists(path).await {
            Ok(found) => found,
            Err(e) => {
                debug!(path = %path, error = %e, "path check failed, treating as missing");
                false
            }
        }
    }
}

/// Whether an image reference resolves in its registry
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ImageRegistry: Send + Sync {
    /// True if the registry answers 200 for the image manifest
    async fn image_exists(&self, image: &str) -> Result<bool>;
}

/// A parsed image reference
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ImageReference {
    /// Registry host
    pub registry: String,
    /// Repository path within the registry
    pub repository: String,
    /// Tag or digest
    pub reference: String,
}

impl ImageReference {
    /// Parse `[registry/]repository[:tag|@digest]`.
    ///
    /// Returns `None` for empty input and for wildcard patterns, which name
    /// no single manifest.
    pub fn parse(image: &str) -> Option<Self> {
        let image = image.trim();
        if image.is_empty() || image.contains('*') {
            return None;
        }

        let (name, reference) = match image.split_once('@') {
            Some((name, digest)) => (name, digest.to_string()),
            None => match image.rsplit_once(':') {
                Some((name, tag)) if !tag.contains('/') => (name, tag.to_string()),
                _ => (image, "latest".to_string()),
            },
        };

        let (registry, repository) = match name.split_once('/') {
            Some((host, rest))
                if host.contains('.') || host.contains(':') || host == "localhost" =>
            {
                let registry = match host {
                    "docker.io" | "index.docker.io" => DOCKER_HUB_REGISTRY,
                    other => other,
                };
                (registry.to_string(), rest.to_string())
            }
            Some(_) => (DOCKER_HUB_REGISTRY.to_string(), name.to_string()),
            None => (DOCKER_HUB_REGISTRY.to_string(), format!("library/{name}")),
        };
        if repository.is_empty() || reference.is_empty() {
            return None;
        }

        Some(Self {
            registry,
            repository,
            reference,
        })
    }

    /// Registry v2 manifest URL
    pub fn manifest_url(&self) -> String {
        self.manifest_url_over("https")
    }

    fn manifest_url_over(&self, scheme: &str) -> String {
        format!(
            "{scheme}://{}/v2/{}/manifests/{}",
            self.registry, self.repository, self.reference
        )
    }
}

/// A `WWW-Authenticate: Bearer` challenge from a registry
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BearerChallenge {
    /// Token endpoint
    pub realm: String,
    /// Service the token is issued for
    pub service: Option<String>,
    /// Requested access, e.g. `repository:library/nginx:pull`
    pub scope: Option<String>,
}

impl BearerChallenge {
    /// Parse `Bearer realm="..",service="..",scope=".."`.
    ///
    /// Returns `None` for other schemes and for challenges without a realm.
    pub fn parse(header: &str) -> Option<Self> {
        let (scheme, params) = header.trim().split_once(' ')?;
        if !scheme.eq_ignore_ascii_case("bearer") {
            return None;
        }

        let mut challenge = Self::default();
        let mut rest = params.trim();
        while !rest.is_empty() {
            let (key, after) = rest.split_once('=')?;
            // quoted values may contain commas, e.g. scope="repository:a:pull,push"
            let (value, tail) = match after.strip_prefix('"') {
                Some(quoted) => quoted.split_once('"')?,
                None => after.split_once(',').unwrap_or((after, "")),
            };
            let value = value.trim().to_string();
            match key.trim().to_ascii_lowercase().as_str() {
                "realm" => challenge.realm = value,
                "service" => challenge.service = Some(value),
                "scope" => challenge.scope = Some(value),
                _ => {}
            }
            rest = tail.trim_start().trim_start_matches(',').trim_start();
        }

        (!challenge.realm.is_empty()).then_some(challenge)
    }
}

#[derive(Deserialize)]
struct TokenResponse {
    #[serde(default)]
    token: Option<String>,
    #[serde(default)]
    access_token: Option<String>,
}

fn registry_error(e: impl std::fmt::Display) -> Error {
    Error::internal_with_context("image-registry", e.to_string())
}

/// Probes registries over the distribution API with anonymous pull tokens
pub struct HttpImageRegistry {
    client: reqwest::Client,
    scheme: &'static str,
}

impl HttpImageRegistry {
    /// Create a registry probe with a bounded request timeout
    pub fn new() -> Result<Self> {
        Self::with_scheme("https")
    }

    /// Same as [`HttpImageRegistry::new`] but for registries served over plain HTTP
    pub fn insecure() -> Result<Self> {
        Self::with_scheme("http")
    }

    fn with_scheme(scheme: &'static str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(REGISTRY_TIMEOUT)
            .build()
            .map_err(registry_error)?;
        Ok(Self { client, scheme })
    }

    async fn head_manifest(&self, url: &str, token: Option<&str>) -> Result<reqwest::Response> {
        let mut request = self.client.head(url).header(ACCEPT, MANIFEST_MEDIA_TYPES);
        if let Some(token) = token {
            request = request.bearer_auth(token);
        }
        request.send().await.map_err(registry_error)
    }

    /// Fetch a pull token from the challenge realm without credentials
    async fn anonymous_token(&self, challenge: &BearerChallenge) -> Result<String> {
        let mut query: Vec<(&str, &str)> = Vec::new();
        if let Some(service) = &challenge.service {
            query.push(("service", service.as_str()));
        }
        if let Some(scope) = &challenge.scope {
            query.push(("scope", scope.as_str()));
        }

        let body: TokenResponse = self
            .client
            .get(&challenge.realm)
            .query(&query)
            .send()
            .await
            .map_err(registry_error)?
            .error_for_status()
            .map_err(registry_error)?
            .json()
            .await
            .map_err(registry_error)?;

        body.token
            .or(body.access_token)
            .filter(|t| !t.is_empty())
            .ok_or_else(|| registry_error(format!("no token from {}", challenge.realm)))
    }
}

#[async_trait]
impl ImageRegistry for HttpImageRegistry {
    async fn image_exists(&self, image: &str) -> Result<bool> {
        let Some(reference) = ImageReference::parse(image) else {
            return Err(Error::validation(format!("invalid image reference {image}")));
        };
        let url = reference.manifest_url_over(self.scheme);

        let mut response = self.head_manifest(&url, None).await?;
        if response.status() == StatusCode::UNAUTHORIZED {
            let challenge = response
                .headers()
                .get(WWW_AUTHENTICATE)
                .and_then(|v| v.to_str().ok())
                .and_then(BearerChallenge::parse)
                .ok_or_else(|| registry_error(format!("{url} requires credentials")))?;
            let token = self.anonymous_token(&challenge).await?;
            response = self.head_manifest(&url, Some(&token)).await?;
        }

        debug!(image = %image, url = %url, status = %response.status(), "probed image manifest");
        match response.status() {
            StatusCode::OK => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            status => Err(registry_error(format!("{url} answered {status}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn docker_hub_short_names_get_the_library_prefix() {
        let image = ImageReference::parse("nginx").unwrap();
        assert_eq!(
            image.manifest_url(),
            "https://registry-1.docker.io/v2/library/nginx/manifests/latest"
        );

        let image = ImageReference::parse("bitnami/redis:7.2").unwrap();
        assert_eq!(image.registry, DOCKER_HUB_REGISTRY);
        assert_eq!(image.repository, "bitnami/redis");
        assert_eq!(image.reference, "7.2");
    }

    #[test]
    fn explicit_registries_and_digests_are_kept() {
        let image = ImageReference::parse("ghcr.io/acme/api@sha256:abc").unwrap();
        assert_eq!(image.registry, "ghcr.io");
        assert_eq!(image.repository, "acme/api");
        assert_eq!(image.reference, "sha256:abc");

        let image = ImageReference::parse("localhost:5000/app").unwrap();
        assert_eq!(image.registry, "localhost:5000");
        assert_eq!(image.reference, "latest");

        let image = ImageReference::parse("docker.io/library/busybox:1.36").unwrap();
        assert_eq!(image.registry, DOCKER_HUB_REGISTRY);
    }

    #[test]
    fn wildcards_and_empty_input_name_no_manifest() {
        assert!(ImageReference::parse("ghcr.io/acme/*").is_none());
        assert!(ImageReference::parse("  ").is_none());
    }

    #[tokio::test]
    async fn host_probe_sees_existing_paths() {
        let probe = HostPathProbe;
        assert!(probe.exists("/").await);
        assert!(!probe.exists("/definitely/not/here/aegis").await);
    }

    #[test]
    fn bearer_challenges_yield_realm_service_and_scope() {
        let challenge = BearerChallenge::parse(
            r#"Bearer realm="https://auth.docker.io/token",service="registry.docker.io",scope="repository:library/nginx:pull,push""#,
        )
        .unwrap();
        assert_eq!(challenge.realm, "https://auth.docker.io/token");
        assert_eq!(challenge.service.as_deref(), Some("registry.docker.io"));
        assert_eq!(challenge.scope.as_deref(), Some("repository:library/nginx:pull,push"));

        let bare = BearerChallenge::parse("bearer realm=https://ghcr.io/token").unwrap();
        assert_eq!(bare.realm, "https://ghcr.io/token");
        assert_eq!(bare.service, None);

        assert!(BearerChallenge::parse(r#"Basic realm="registry""#).is_none());
        assert!(BearerChallenge::parse(r#"Bearer service="registry.docker.io""#).is_none());
    }

    /// Minimal distribution API: manifests need an anonymous pull token
    mod registry {
        use std::collections::HashMap;
        use std::net::SocketAddr;

        use axum::extract::{Query, State};
        use axum::http::header::{ACCEPT, AUTHORIZATION, WWW_AUTHENTICATE};
        use axum::http::{HeaderMap, HeaderName, StatusCode};
        use axum::response::{IntoResponse, Response};
        use axum::routing::{get, head};
        use axum::{Json, Router};

        const TOKEN: &str = "anon-pull-token";
        const SCOPE: &str = "repository:library/nginx:pull";

        async fn manifest(State(realm): State<String>, headers: HeaderMap) -> Response {
            let value = |name: HeaderName| headers.get(name).and_then(|v| v.to_str().ok());
            let expected = format!("Bearer {TOKEN}");
            let authorized = value(AUTHORIZATION) == Some(expected.as_str());
            let wants_manifest =
                value(ACCEPT).is_some_and(|v| v.contains("application/vnd.oci.image.index.v1+json"));
            if authorized && wants_manifest {
                return StatusCode::OK.into_response();
            }
            let challenge =
                format!(r#"Bearer realm="{realm}",service="registry.test",scope="{SCOPE}""#);
            (StatusCode::UNAUTHORIZED, [(WWW_AUTHENTICATE, challenge)]).into_response()
        }

        async fn token(Query(params): Query<HashMap<String, String>>) -> Response {
            let service = params.get("service").map(String::as_str);
            let scope = params.get("scope").map(String::as_str);
            if service != Some("registry.test") || scope != Some(SCOPE) {
                return StatusCode::BAD_REQUEST.into_response();
            }
            Json(HashMap::from([("token", TOKEN)])).into_response()
        }

        pub(super) async fn start() -> SocketAddr {
            let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            let addr = listener.local_addr().unwrap();
            let app = Router::new()
                .route("/v2/library/nginx/manifests/latest", head(manifest))
                .route("/token", get(token))
                .with_state(format!("http://{addr}/token"));
            tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
            addr
        }
    }

    #[tokio::test]
    async fn story_public_image_is_found_after_anonymous_token_exchange() {
        let addr = registry::start().await;
        let images = HttpImageRegistry::insecure().unwrap();

        assert!(images
            .image_exists(&format!("{addr}/library/nginx"))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn story_unknown_manifest_is_reported_missing() {
        let addr = registry::start().await;
        let images = HttpImageRegistry::insecure().unwrap();

        assert!(!images
            .image_exists(&format!("{addr}/library/ghost:1.0"))
            .await
            .unwrap());
    }
}
