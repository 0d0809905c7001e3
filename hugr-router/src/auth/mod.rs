//! Request authentication: bearer tokens, the auth cookie, managed API keys
//! and the anonymous fallback, resolved into a per-request [`AuthContext`].

use std::sync::Arc;
use std::time::SystemTime;
use std::time::UNIX_EPOCH;

use async_trait::async_trait;
use dashmap::DashMap;
use http::HeaderMap;
use hugr_core::error::HugrError;
use hugr_core::error::SingleHugrError;
use hugr_core::permissions::AuthContext;
use indexmap::IndexMap;
use serde::Deserialize;
use serde::Serialize;
use serde_json_bytes::Value;

use crate::configuration::Configuration;

pub const AUTH_COOKIE: &str = "hugr_auth";

/// A managed API key, as stored in the `api_keys` system table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiKey {
    pub name: String,
    pub key: String,
    #[serde(default)]
    pub description: String,
    pub default_role: String,
    #[serde(default)]
    pub disabled: bool,
    #[serde(default)]
    pub is_temporal: bool,
    /// Unix seconds; only enforced for temporal keys.
    #[serde(default)]
    pub expires_at: Option<i64>,
    /// Request header name to claim name: header values become claims.
    #[serde(default)]
    pub headers: IndexMap<String, String>,
    /// Static claims attached to every request using this key.
    #[serde(default)]
    pub claims: IndexMap<String, Value>,
}

impl ApiKey {
    fn is_expired(&self, now_unix: i64) -> bool {
        self.is_temporal && self.expires_at.is_some_and(|expires| expires <= now_unix)
    }

    /// Role resolution order: header-provided claims, then static claims,
    /// then the key's default role.
    fn resolve(&self, request_headers: &HeaderMap) -> AuthContext {
        let mut claims: IndexMap<String, Value> = self.claims.clone();
        for (header_name, claim_name) in &self.headers {
            if let Some(value) = request_headers
                .get(header_name.as_str())
                .and_then(|v| v.to_str().ok())
            {
                claims.insert(claim_name.clone(), Value::from(value.to_owned()));
            }
        }
        let role = claims
            .get("role")
            .and_then(|v| v.as_str().map(str::to_owned))
            .unwrap_or_else(|| self.default_role.clone());
        AuthContext {
            user_id: claims
                .get("user_id")
                .and_then(|v| v.as_str().map(str::to_owned)),
            user_name: Some(self.name.clone()),
            role,
            auth_type: Some("api-key".to_owned()),
            provider: Some("managed".to_owned()),
            claims,
        }
    }
}

/// In-memory view of the managed API keys, refreshed from the core database.
#[derive(Default)]
pub struct ApiKeyStore {
    by_secret: DashMap<String, ApiKey>,
}

impl ApiKeyStore {
    pub fn replace(&self, keys: impl IntoIterator<Item = ApiKey>) {
        self.by_secret.clear();
        for key in keys {
            self.by_secret.insert(key.key.clone(), key);
        }
    }

    pub fn lookup(&self, secret: &str) -> Option<ApiKey> {
        self.by_secret.get(secret).map(|entry| entry.clone())
    }
}

/// External token validation (OIDC, JWT) plugs in here; validation itself is
/// out of scope for the core.
#[async_trait]
pub trait TokenVerifier: Send + Sync + 'static {
    async fn verify(&self, token: &str) -> Result<AuthContext, HugrError>;
}

pub struct Authenticator {
    anonymous_role: String,
    allowed_anonymous: bool,
    allowed_managed_api_keys: bool,
    api_keys: Arc<ApiKeyStore>,
    verifier: Option<Arc<dyn TokenVerifier>>,
}

impl Authenticator {
    pub fn new(
        config: &Configuration,
        api_keys: Arc<ApiKeyStore>,
        verifier: Option<Arc<dyn TokenVerifier>>,
    ) -> Self {
        Self {
            anonymous_role: config.anonymous_role.clone(),
            allowed_anonymous: config.allowed_anonymous,
            allowed_managed_api_keys: config.allowed_managed_api_keys,
            api_keys,
            verifier,
        }
    }

    /// Precedence: `Authorization: Bearer` token, then the auth cookie, then
    /// anonymous (when allowed).
    pub async fn authenticate(&self, headers: &HeaderMap) -> Result<AuthContext, HugrError> {
        if let Some(token) = bearer_token(headers) {
            return self.resolve_token(&token, headers).await;
        }
        if let Some(token) = cookie_token(headers) {
            return self.resolve_token(&token, headers).await;
        }
        self.anonymous()
    }

    fn anonymous(&self) -> Result<AuthContext, HugrError> {
        if !self.allowed_anonymous {
            return Err(SingleHugrError::PermissionDenied.into());
        }
        Ok(AuthContext::anonymous(self.anonymous_role.clone()))
    }

    async fn resolve_token(
        &self,
        token: &str,
        headers: &HeaderMap,
    ) -> Result<AuthContext, HugrError> {
        if self.allowed_managed_api_keys {
            if let Some(key) = self.api_keys.lookup(token) {
                if key.disabled {
                    return Err(SingleHugrError::PermissionDenied.into());
                }
                let now = SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .map(|d| d.as_secs() as i64)
                    .unwrap_or(0);
                if key.is_expired(now) {
                    return Err(SingleHugrError::PermissionDenied.into());
                }
                return Ok(key.resolve(headers));
            }
        }
        if let Some(verifier) = &self.verifier {
            return verifier.verify(token).await;
        }
        // An unverifiable token never silently degrades to anonymous.
        Err(SingleHugrError::PermissionDenied.into())
    }
}

fn bearer_token(headers: &HeaderMap) -> Option<String> {
    headers
        .get(http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::to_owned)
}

fn cookie_token(headers: &HeaderMap) -> Option<String> {
    let cookies = headers.get(http::header::COOKIE)?.to_str().ok()?;
    cookies.split(';').find_map(|cookie| {
        let (name, value) = cookie.trim().split_once('=')?;
        (name == AUTH_COOKIE).then(|| value.to_owned())
    })
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use serde_json_bytes::json;

    use super::*;

    fn store_with_key(key: ApiKey) -> Arc<ApiKeyStore> {
        let store = Arc::new(ApiKeyStore::default());
        store.replace([key]);
        store
    }

    fn tenant_key() -> ApiKey {
        ApiKey {
            name: "reporting".to_owned(),
            key: "secret-1".to_owned(),
            description: String::new(),
            default_role: "reader".to_owned(),
            disabled: false,
            is_temporal: false,
            expires_at: None,
            headers: [("x-tenant".to_owned(), "tenant_id".to_owned())]
                .into_iter()
                .collect(),
            claims: [("scope".to_owned(), json!("reports"))].into_iter().collect(),
        }
    }

    fn authenticator(store: Arc<ApiKeyStore>) -> Authenticator {
        Authenticator::new(&Configuration::default(), store, None)
    }

    #[tokio::test]
    async fn bearer_api_key_resolves_role_and_claims() {
        let auth = authenticator(store_with_key(tenant_key()));
        let mut headers = HeaderMap::new();
        headers.insert(http::header::AUTHORIZATION, "Bearer secret-1".parse().expect("header"));
        headers.insert("x-tenant", "42".parse().expect("header"));
        let context = auth.authenticate(&headers).await.expect("authenticated");
        assert_eq!(context.role, "reader");
        assert_eq!(context.claims.get("tenant_id"), Some(&json!("42")));
        assert_eq!(context.claims.get("scope"), Some(&json!("reports")));
    }

    #[tokio::test]
    async fn cookie_is_used_when_no_bearer_token() {
        let auth = authenticator(store_with_key(tenant_key()));
        let mut headers = HeaderMap::new();
        headers.insert(
            http::header::COOKIE,
            format!("{AUTH_COOKIE}=secret-1; theme=dark").parse().expect("header"),
        );
        let context = auth.authenticate(&headers).await.expect("authenticated");
        assert_eq!(context.role, "reader");
    }

    #[tokio::test]
    async fn expired_temporal_key_is_rejected() {
        let mut key = tenant_key();
        key.is_temporal = true;
        key.expires_at = Some(1);
        let auth = authenticator(store_with_key(key));
        let mut headers = HeaderMap::new();
        headers.insert(http::header::AUTHORIZATION, "Bearer secret-1".parse().expect("header"));
        assert!(auth.authenticate(&headers).await.is_err());
    }

    #[tokio::test]
    async fn anonymous_requests_receive_the_configured_role() {
        let auth = authenticator(Arc::new(ApiKeyStore::default()));
        let context = auth.authenticate(&HeaderMap::new()).await.expect("anonymous");
        assert_eq!(context.role, "anonymous");
    }

    #[tokio::test]
    async fn unknown_token_is_rejected_not_anonymous() {
        let auth = authenticator(Arc::new(ApiKeyStore::default()));
        let mut headers = HeaderMap::new();
        headers.insert(http::header::AUTHORIZATION, "Bearer nope".parse().expect("header"));
        assert!(auth.authenticate(&headers).await.is_err());
    }
}
