//! Provider registry and the public connect/list/disconnect/token surface.

use std::sync::Arc;

use {
    modelgate_config::OAuthSection,
    secrecy::ExposeSecret,
    serde::Serialize,
    tracing::{info, warn},
};

#[cfg(feature = "metrics")]
use modelgate_metrics::{counter, oauth as oauth_metrics};

use crate::{
    browser::BrowserOpener,
    defaults::configured_providers,
    error::OAuthError,
    flow::FlowTimeouts,
    provider::{OAuthProvider, PkceProvider},
    storage::TokenStore,
    types::{OAuthProfile, OAuthProviderStatus, StoredProviderData, now_ms},
};

/// Outcome of [`OAuthManager::connect`]. Failures are data, never errors.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectResult {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub profile: Option<OAuthProfile>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ConnectResult {
    fn failed(err: impl ToString) -> Self {
        Self {
            success: false,
            profile: None,
            error: Some(err.to_string()),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DisconnectResult {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

pub struct OAuthManager {
    store: TokenStore,
    providers: Vec<Arc<dyn OAuthProvider>>,
}

impl OAuthManager {
    /// An empty manager. Register providers with [`OAuthManager::register`].
    pub fn new(store: TokenStore) -> Self {
        Self {
            store,
            providers: Vec::new(),
        }
    }

    /// Manager with every enabled built-in provider, overrides and timeouts
    /// taken from the `[oauth]` section.
    pub fn from_config(section: &OAuthSection, browser: Arc<dyn BrowserOpener>) -> Self {
        let store = match &section.store_path {
            Some(path) => TokenStore::with_path(path.clone()),
            None => TokenStore::new(),
        };
        let timeouts = FlowTimeouts::from_section(section);
        let mut manager = Self::new(store);
        for config in configured_providers(section) {
            manager.register(Arc::new(
                PkceProvider::new(config)
                    .with_browser(Arc::clone(&browser))
                    .with_timeouts(timeouts),
            ));
        }
        manager
    }

    /// Register a provider, replacing any existing one with the same id.
    pub fn register(&mut self, provider: Arc<dyn OAuthProvider>) {
        self.providers.retain(|p| p.id() != provider.id());
        self.providers.push(provider);
    }

    pub fn with_provider(mut self, provider: Arc<dyn OAuthProvider>) -> Self {
        self.register(provider);
        self
    }

    pub fn store(&self) -> &TokenStore {
        &self.store
    }

    pub fn provider(&self, id: &str) -> Option<&Arc<dyn OAuthProvider>> {
        self.providers.iter().find(|p| p.id() == id)
    }

    /// Connection status of every registered provider. Reads storage only.
    pub fn list(&self) -> Vec<OAuthProviderStatus> {
        self.providers
            .iter()
            .map(|provider| {
                let config = provider.config();
                let stored = self.store.load(&config.id);
                OAuthProviderStatus {
                    id: config.id.clone(),
                    name: config.name.clone(),
                    icon: config.icon.clone(),
                    description: config.description.clone(),
                    connected: stored.is_some(),
                    is_expired: stored
                        .as_ref()
                        .is_some_and(|s| provider.is_expired(&s.tokens)),
                    refreshable: stored.as_ref().is_some_and(|s| s.tokens.can_refresh()),
                    expires_at: stored.as_ref().and_then(|s| s.tokens.expires_at),
                    profile: stored.map(|s| s.profile),
                }
            })
            .collect()
    }

    /// Run the interactive flow for `id` and persist the result.
    ///
    /// A failed attempt leaves any previous connection in place.
    pub async fn connect(&self, id: &str) -> ConnectResult {
        let Some(provider) = self.provider(id) else {
            return ConnectResult::failed(OAuthError::UnknownProvider(id.to_string()));
        };

        let outcome = match provider.authorize().await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(provider = id, error = %e, "OAuth connect failed");
                #[cfg(feature = "metrics")]
                counter!(oauth_metrics::CONNECT_FAILURES_TOTAL, "provider" => id.to_string())
                    .increment(1);
                return ConnectResult::failed(e);
            },
        };

        let record = StoredProviderData {
            tokens: outcome.tokens,
            profile: outcome.profile,
            connected_at: now_ms(),
        };
        if let Err(e) = self.store.save(id, &record) {
            warn!(provider = id, error = %e, "failed to persist OAuth tokens");
            return ConnectResult::failed(OAuthError::Store(e.to_string()));
        }

        info!(provider = id, profile_id = %record.profile.id, "OAuth provider connected");
        #[cfg(feature = "metrics")]
        counter!(oauth_metrics::CONNECT_TOTAL, "provider" => id.to_string()).increment(1);

        ConnectResult {
            success: true,
            profile: Some(record.profile),
            error: None,
        }
    }

    /// Forget the stored connection. Disconnecting twice is not an error.
    pub fn disconnect(&self, id: &str) -> DisconnectResult {
        if self.provider(id).is_none() {
            return DisconnectResult {
                success: false,
                error: Some(OAuthError::UnknownProvider(id.to_string()).to_string()),
            };
        }
        match self.store.delete(id) {
            Ok(removed) => {
                if removed {
                    info!(provider = id, "OAuth provider disconnected");
                    #[cfg(feature = "metrics")]
                    counter!(oauth_metrics::DISCONNECT_TOTAL, "provider" => id.to_string())
                        .increment(1);
                }
                DisconnectResult {
                    success: true,
                    error: None,
                }
            },
            Err(e) => {
                warn!(provider = id, error = %e, "failed to remove OAuth tokens");
                DisconnectResult {
                    success: false,
                    error: Some(OAuthError::Store(e.to_string()).to_string()),
                }
            },
        }
    }

    /// A usable access token for `id`, refreshing it first when expired.
    ///
    /// Returns `None` for unknown or unconnected providers and whenever the
    /// session cannot be healed. Never surfaces a network error.
    pub async fn get_access_token(&self, id: &str) -> Option<String> {
        let provider = self.provider(id)?;
        let mut record = self.store.load(id)?;

        if !provider.is_expired(&record.tokens) {
            return Some(record.tokens.access_token.expose_secret().clone());
        }

        let Some(refresh_token) = record.tokens.refresh_token.clone() else {
            info!(provider = id, "access token expired and no refresh token, reconnect needed");
            return None;
        };

        #[cfg(feature = "metrics")]
        counter!(oauth_metrics::REFRESH_TOTAL, "provider" => id.to_string()).increment(1);

        let refreshed = match provider.refresh_token(refresh_token.expose_secret()).await {
            Ok(tokens) => tokens,
            Err(e) => {
                warn!(provider = id, error = %e, "OAuth token refresh failed");
                #[cfg(feature = "metrics")]
                counter!(oauth_metrics::REFRESH_FAILURES_TOTAL, "provider" => id.to_string())
                    .increment(1);
                return None;
            },
        };

        record.tokens = refreshed.inherit_missing(&record.tokens);
        let access = record.tokens.access_token.expose_secret().clone();
        if let Err(e) = self.store.save(id, &record) {
            warn!(provider = id, error = %e, "refreshed token could not be persisted");
        }
        info!(provider = id, "OAuth access token refreshed");
        Some(access)
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::{
            defaults::{OPENAI_CODEX, builtin_config},
            types::{AuthorizeOutcome, OAuthTokens, ProviderConfig},
        },
        async_trait::async_trait,
        secrecy::Secret,
        std::{
            collections::HashMap,
            sync::{
                Mutex,
                atomic::{AtomicUsize, Ordering},
            },
            time::Duration,
        },
    };

    /// Provider whose authorize/refresh results are scripted per test.
    struct FakeProvider {
        config: ProviderConfig,
        authorize: Mutex<Vec<Result<AuthorizeOutcome, OAuthError>>>,
        refresh: Mutex<Option<Result<OAuthTokens, OAuthError>>>,
        refresh_calls: AtomicUsize,
    }

    impl FakeProvider {
        fn new() -> Self {
            Self {
                config: builtin_config(OPENAI_CODEX).unwrap(),
                authorize: Mutex::new(Vec::new()),
                refresh: Mutex::new(None),
                refresh_calls: AtomicUsize::new(0),
            }
        }

        fn authorizes(self, result: Result<AuthorizeOutcome, OAuthError>) -> Self {
            self.authorize.lock().unwrap().push(result);
            self
        }

        fn refreshes(self, result: Result<OAuthTokens, OAuthError>) -> Self {
            *self.refresh.lock().unwrap() = Some(result);
            self
        }
    }

    #[async_trait]
    impl OAuthProvider for FakeProvider {
        fn config(&self) -> &ProviderConfig {
            &self.config
        }

        async fn authorize(&self) -> Result<AuthorizeOutcome, OAuthError> {
            self.authorize
                .lock()
                .unwrap()
                .pop()
                .unwrap_or(Err(OAuthError::Timeout))
        }

        async fn exchange_code(
            &self,
            _code: &str,
            _verifier: &str,
            _redirect_uri: &str,
            _state: &str,
        ) -> Result<OAuthTokens, OAuthError> {
            unreachable!("exchange runs inside authorize")
        }

        async fn refresh_token(&self, _refresh_token: &str) -> Result<OAuthTokens, OAuthError> {
            self.refresh_calls.fetch_add(1, Ordering::SeqCst);
            self.refresh
                .lock()
                .unwrap()
                .take()
                .unwrap_or_else(|| Err(OAuthError::RefreshFailed("unscripted".into())))
        }

        async fn fetch_profile(&self, _access_token: &str) -> Result<OAuthProfile, OAuthError> {
            Ok(OAuthProfile::unknown())
        }
    }

    fn outcome(access: &str, expires_at: Option<u64>) -> AuthorizeOutcome {
        AuthorizeOutcome {
            tokens: OAuthTokens {
                refresh_token: Some(Secret::new("rt-1".into())),
                expires_at,
                ..OAuthTokens::new(access)
            },
            profile: OAuthProfile {
                id: "acct-1".into(),
                email: Some("dev@example.com".into()),
                name: None,
            },
        }
    }

    fn manager_with(provider: FakeProvider) -> (tempfile::TempDir, OAuthManager, Arc<FakeProvider>) {
        let dir = tempfile::tempdir().unwrap();
        let provider = Arc::new(provider);
        let manager = OAuthManager::new(TokenStore::with_path(dir.path().join("tokens.json")))
            .with_provider(provider.clone());
        (dir, manager, provider)
    }

    fn store_record(manager: &OAuthManager, tokens: OAuthTokens) {
        manager
            .store()
            .save(OPENAI_CODEX, &StoredProviderData {
                tokens,
                profile: OAuthProfile::unknown(),
                connected_at: 1,
            })
            .unwrap();
    }

    fn expired_tokens(access: &str, refresh: Option<&str>) -> OAuthTokens {
        OAuthTokens {
            refresh_token: refresh.map(|r| Secret::new(r.to_string())),
            id_token: Some(Secret::new("old-id".into())),
            expires_at: Some(now_ms() - 1_000),
            scopes: vec!["openid".into()],
            ..OAuthTokens::new(access)
        }
    }

    #[tokio::test]
    async fn unknown_provider_is_a_failed_result() {
        let (_dir, manager, _) = manager_with(FakeProvider::new());

        let result = manager.connect("nope").await;
        assert!(!result.success);
        assert!(result.error.unwrap().contains("nope"));
        assert!(manager.get_access_token("nope").await.is_none());
        assert!(!manager.disconnect("nope").success);
    }

    #[tokio::test]
    async fn connect_persists_and_lists_connected() {
        let expires = now_ms() + 3_600_000;
        let (_dir, manager, _) =
            manager_with(FakeProvider::new().authorizes(Ok(outcome("at-1", Some(expires)))));

        let before = manager.list();
        assert!(!before[0].connected);
        assert!(!before[0].is_expired);

        let result = manager.connect(OPENAI_CODEX).await;
        assert!(result.success);
        assert_eq!(result.profile.unwrap().id, "acct-1");

        let status = &manager.list()[0];
        assert!(status.connected);
        assert!(!status.is_expired);
        assert!(status.refreshable);
        assert_eq!(status.expires_at, Some(expires));
        assert_eq!(status.profile.as_ref().unwrap().email.as_deref(), Some("dev@example.com"));

        let stored = manager.store().load(OPENAI_CODEX).unwrap();
        assert!(stored.connected_at > 0);
        assert_eq!(
            manager.get_access_token(OPENAI_CODEX).await.as_deref(),
            Some("at-1")
        );
    }

    #[tokio::test]
    async fn failed_reconnect_keeps_previous_connection() {
        let (_dir, manager, _) = manager_with(
            FakeProvider::new().authorizes(Err(OAuthError::ProviderDeniedAuthorization {
                error: "access_denied".into(),
                description: None,
            })),
        );
        store_record(&manager, OAuthTokens::new("kept"));

        let result = manager.connect(OPENAI_CODEX).await;
        assert!(!result.success);
        assert_eq!(result.error.as_deref(), Some("access_denied"));
        assert_eq!(
            manager.get_access_token(OPENAI_CODEX).await.as_deref(),
            Some("kept")
        );
    }

    #[tokio::test]
    async fn unwritable_store_fails_connect() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("blocker");
        std::fs::write(&blocker, "not a directory").unwrap();
        let manager = OAuthManager::new(TokenStore::with_path(blocker.join("tokens.json")))
            .with_provider(Arc::new(
                FakeProvider::new().authorizes(Ok(outcome("at", None))),
            ));

        let result = manager.connect(OPENAI_CODEX).await;
        assert!(!result.success);
        assert!(result.error.unwrap().contains("token store write failed"));
    }

    #[tokio::test]
    async fn disconnect_twice_succeeds() {
        let (_dir, manager, _) = manager_with(FakeProvider::new());
        store_record(&manager, OAuthTokens::new("at"));

        assert!(manager.disconnect(OPENAI_CODEX).success);
        assert!(manager.disconnect(OPENAI_CODEX).success);
        assert!(manager.store().load(OPENAI_CODEX).is_none());
        assert!(!manager.list()[0].connected);
    }

    #[tokio::test]
    async fn fresh_token_is_returned_without_refresh() {
        let (_dir, manager, provider) = manager_with(FakeProvider::new());
        store_record(&manager, OAuthTokens {
            refresh_token: Some(Secret::new("rt".into())),
            expires_at: Some(now_ms() + 3_600_000),
            ..OAuthTokens::new("at")
        });

        assert_eq!(manager.get_access_token(OPENAI_CODEX).await.as_deref(), Some("at"));
        assert_eq!(provider.refresh_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn expired_token_is_refreshed_and_persisted() {
        let (_dir, manager, provider) = manager_with(FakeProvider::new().refreshes(Ok(OAuthTokens {
            expires_at: Some(now_ms() + 3_600_000),
            ..OAuthTokens::new("at-2")
        })));
        store_record(&manager, expired_tokens("at-1", Some("rt-1")));

        assert_eq!(
            manager.get_access_token(OPENAI_CODEX).await.as_deref(),
            Some("at-2")
        );
        assert_eq!(provider.refresh_calls.load(Ordering::SeqCst), 1);

        let stored = manager.store().load(OPENAI_CODEX).unwrap();
        assert_eq!(stored.tokens.access_token.expose_secret(), "at-2");
        // Fields the refresh response omitted carry over.
        assert_eq!(
            stored.tokens.refresh_token.as_ref().map(|s| s.expose_secret().as_str()),
            Some("rt-1")
        );
        assert_eq!(
            stored.tokens.id_token.as_ref().map(|s| s.expose_secret().as_str()),
            Some("old-id")
        );
        assert_eq!(stored.tokens.scopes, vec!["openid".to_string()]);
        assert_eq!(stored.connected_at, 1);

        // Second read uses the persisted token.
        assert_eq!(
            manager.get_access_token(OPENAI_CODEX).await.as_deref(),
            Some("at-2")
        );
        assert_eq!(provider.refresh_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn refresh_failure_yields_none_and_keeps_record() {
        let (_dir, manager, _) = manager_with(
            FakeProvider::new().refreshes(Err(OAuthError::RefreshFailed("HTTP 400".into()))),
        );
        store_record(&manager, expired_tokens("at-1", Some("rt-1")));

        assert!(manager.get_access_token(OPENAI_CODEX).await.is_none());
        let stored = manager.store().load(OPENAI_CODEX).unwrap();
        assert_eq!(stored.tokens.access_token.expose_secret(), "at-1");
    }

    #[tokio::test]
    async fn expired_without_refresh_token_is_none() {
        let (_dir, manager, provider) = manager_with(FakeProvider::new());
        store_record(&manager, expired_tokens("at-1", None));

        assert!(manager.get_access_token(OPENAI_CODEX).await.is_none());
        assert_eq!(provider.refresh_calls.load(Ordering::SeqCst), 0);
        let status = &manager.list()[0];
        assert!(status.is_expired);
        assert!(!status.refreshable);
    }

    #[tokio::test]
    async fn list_never_refreshes() {
        let (_dir, manager, provider) = manager_with(FakeProvider::new());
        store_record(&manager, expired_tokens("at-1", Some("rt-1")));

        let status = &manager.list()[0];
        assert!(status.connected);
        assert!(status.is_expired);
        assert_eq!(provider.refresh_calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn from_config_registers_enabled_builtins() {
        let dir = tempfile::tempdir().unwrap();
        let section = OAuthSection {
            store_path: Some(dir.path().join("t.json")),
            providers: HashMap::from([(
                "anthropic".to_string(),
                modelgate_config::ProviderOverride {
                    enabled: false,
                    ..Default::default()
                },
            )]),
            ..OAuthSection::default()
        };
        let manager = OAuthManager::from_config(&section, Arc::new(crate::SystemBrowser));

        let ids: Vec<_> = manager.list().into_iter().map(|s| s.id).collect();
        assert_eq!(ids, vec![OPENAI_CODEX]);
        assert_eq!(manager.store().path(), dir.path().join("t.json"));
    }

    #[tokio::test]
    async fn end_to_end_connect_through_local_callback() {
        use url::Url;

        struct Approve;
        impl BrowserOpener for Approve {
            fn open(&self, url: &str) -> anyhow::Result<()> {
                let url = Url::parse(url)?;
                let params: HashMap<String, String> = url.query_pairs().into_owned().collect();
                let redirect = Url::parse(&params["redirect_uri"])?;
                let callback = format!(
                    "http://127.0.0.1:{}{}?code=ABC123&state={}",
                    redirect.port().unwrap_or(80),
                    redirect.path(),
                    params["state"]
                );
                tokio::spawn(async move {
                    let _ = reqwest::get(callback).await;
                });
                Ok(())
            }
        }

        let mut server = mockito::Server::new_async().await;
        let token_mock = server
            .mock("POST", "/oauth/token")
            .match_body(mockito::Matcher::UrlEncoded("code".into(), "ABC123".into()))
            .with_body(r#"{"access_token":"at","refresh_token":"rt","expires_in":3600}"#)
            .expect(1)
            .create_async()
            .await;

        let mut config = builtin_config(OPENAI_CODEX).unwrap();
        config.token_url = format!("{}/oauth/token", server.url());
        config.callback_port = None;

        let dir = tempfile::tempdir().unwrap();
        let manager = OAuthManager::new(TokenStore::with_path(dir.path().join("tokens.json")))
            .with_provider(Arc::new(
                PkceProvider::new(config)
                    .with_browser(Arc::new(Approve))
                    .with_timeouts(FlowTimeouts {
                        authorize: Duration::from_secs(5),
                        ..FlowTimeouts::default()
                    }),
            ));

        let result = manager.connect(OPENAI_CODEX).await;
        assert!(result.success, "{:?}", result.error);
        token_mock.assert_async().await;

        let status = &manager.list()[0];
        assert!(status.connected);
        assert!(!status.is_expired);
        // No id_token was issued, so identity falls back to unknown.
        assert_eq!(status.profile.as_ref().unwrap().id, "unknown");
    }
}
