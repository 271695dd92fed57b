//! The per-provider plugin seam and its PKCE implementation.

use std::sync::Arc;

use {async_trait::async_trait, secrecy::ExposeSecret, tracing::{info, warn}};

use crate::{
    browser::{BrowserOpener, SystemBrowser},
    callback_server::{CallbackOptions, CallbackServer},
    error::OAuthError,
    flow::{FlowTimeouts, OAuthFlow},
    jwt::profile_from_id_token,
    pkce::{generate_pkce, generate_state},
    profile,
    types::{AuthorizeOutcome, IdentitySource, OAuthProfile, OAuthTokens, ProviderConfig},
};

/// One OAuth provider, as seen by the manager.
#[async_trait]
pub trait OAuthProvider: Send + Sync {
    fn config(&self) -> &ProviderConfig;

    fn id(&self) -> &str {
        &self.config().id
    }

    /// Run the full interactive authorization and return tokens plus the
    /// connected profile. Resolves exactly once.
    async fn authorize(&self) -> Result<AuthorizeOutcome, OAuthError>;

    async fn exchange_code(
        &self,
        code: &str,
        verifier: &str,
        redirect_uri: &str,
        state: &str,
    ) -> Result<OAuthTokens, OAuthError>;

    async fn refresh_token(&self, refresh_token: &str) -> Result<OAuthTokens, OAuthError>;

    fn is_expired(&self, tokens: &OAuthTokens) -> bool {
        tokens.is_expired()
    }

    async fn fetch_profile(&self, access_token: &str) -> Result<OAuthProfile, OAuthError>;
}

/// Authorization code + PKCE provider driven entirely by its [`ProviderConfig`].
pub struct PkceProvider {
    flow: OAuthFlow,
    browser: Arc<dyn BrowserOpener>,
}

impl PkceProvider {
    pub fn new(config: ProviderConfig) -> Self {
        Self {
            flow: OAuthFlow::new(config),
            browser: Arc::new(SystemBrowser),
        }
    }

    pub fn with_browser(mut self, browser: Arc<dyn BrowserOpener>) -> Self {
        self.browser = browser;
        self
    }

    pub fn with_timeouts(mut self, timeouts: FlowTimeouts) -> Self {
        self.flow = self.flow.with_timeouts(timeouts);
        self
    }

    /// Resolve the profile for freshly exchanged tokens.
    async fn identify(&self, tokens: &OAuthTokens) -> Result<OAuthProfile, OAuthError> {
        match &self.flow.config().identity {
            IdentitySource::ProfileEndpoint {
                url,
                required_scope,
            } => {
                if let Some(scope) = required_scope
                    && !tokens.has_scope(scope)
                {
                    info!(
                        provider = %self.id(),
                        scope = %scope,
                        "grant lacks profile scope, skipping profile fetch"
                    );
                    return Ok(OAuthProfile::unknown());
                }
                profile::fetch_profile(
                    self.flow.client(),
                    url,
                    tokens.access_token.expose_secret(),
                    self.flow.timeouts().profile,
                )
                .await
            },
            IdentitySource::IdTokenClaims {
                namespace,
                account_field,
            } => Ok(tokens
                .id_token
                .as_ref()
                .map(|t| profile_from_id_token(t.expose_secret(), namespace, account_field))
                .unwrap_or_else(OAuthProfile::unknown)),
        }
    }
}

#[async_trait]
impl OAuthProvider for PkceProvider {
    fn config(&self) -> &ProviderConfig {
        self.flow.config()
    }

    async fn authorize(&self) -> Result<AuthorizeOutcome, OAuthError> {
        let config = self.flow.config();
        let pkce = generate_pkce(config.verifier_bytes);
        let state = generate_state();

        let server = CallbackServer::bind(config.callback_port, CallbackOptions {
            path: config.redirect_path.clone(),
            expected_state: state.clone(),
            success_redirect_url: config.success_redirect_url.clone(),
        })
        .await?;
        let redirect_uri = config.redirect_uri(server.port());
        let auth_url = self.flow.authorization_url(&redirect_uri, &pkce, &state)?;

        info!(
            provider = %config.id,
            port = server.port(),
            ipv6 = server.serves_ipv6(),
            "starting OAuth authorization"
        );
        if let Err(e) = self.browser.open(auth_url.as_str()) {
            // The URL carries the full state, so it is never logged.
            warn!(provider = %config.id, error = %e, "could not open a browser");
        }

        server
            .run(self.flow.timeouts().authorize, |code| async move {
                let tokens = self
                    .exchange_code(&code, &pkce.verifier, &redirect_uri, &state)
                    .await?;
                let profile = self.identify(&tokens).await?;
                Ok(AuthorizeOutcome { tokens, profile })
            })
            .await
    }

    async fn exchange_code(
        &self,
        code: &str,
        verifier: &str,
        redirect_uri: &str,
        state: &str,
    ) -> Result<OAuthTokens, OAuthError> {
        self.flow.exchange(code, verifier, redirect_uri, state).await
    }

    async fn refresh_token(&self, refresh_token: &str) -> Result<OAuthTokens, OAuthError> {
        self.flow.refresh(refresh_token).await
    }

    /// Profile-endpoint providers fetch; claim-based providers have nothing
    /// to fetch with only an access token and report the unknown profile.
    async fn fetch_profile(&self, access_token: &str) -> Result<OAuthProfile, OAuthError> {
        match self.flow.config().profile_url() {
            Some(url) => {
                profile::fetch_profile(
                    self.flow.client(),
                    url,
                    access_token,
                    self.flow.timeouts().profile,
                )
                .await
            },
            None => Ok(OAuthProfile::unknown()),
        }
    }
}
