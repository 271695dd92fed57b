//! Token-endpoint side of the authorization code flow: building the authorize
//! URL, exchanging the code, and refreshing.

use std::time::Duration;

#[cfg(feature = "metrics")]
use std::time::Instant;

use {
    modelgate_config::OAuthSection,
    reqwest::{Client, StatusCode},
    secrecy::Secret,
    serde::Deserialize,
    tracing::{debug, warn},
    url::Url,
};

#[cfg(feature = "metrics")]
use modelgate_metrics::{histogram, oauth as oauth_metrics};

use crate::{
    error::OAuthError,
    types::{OAuthTokens, PkceCodes, ProviderConfig, TokenRequestFormat, now_ms},
};

/// Upper bounds for each network phase of a flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlowTimeouts {
    /// Waiting for the browser to hit the callback.
    pub authorize: Duration,
    pub exchange: Duration,
    pub refresh: Duration,
    pub profile: Duration,
}

impl Default for FlowTimeouts {
    fn default() -> Self {
        Self {
            authorize: Duration::from_secs(300),
            exchange: Duration::from_secs(30),
            refresh: Duration::from_secs(10),
            profile: Duration::from_secs(10),
        }
    }
}

impl FlowTimeouts {
    pub fn from_section(section: &OAuthSection) -> Self {
        Self {
            authorize: Duration::from_secs(section.authorize_timeout_secs),
            exchange: Duration::from_secs(section.exchange_timeout_secs),
            refresh: Duration::from_secs(section.refresh_timeout_secs),
            profile: Duration::from_secs(section.profile_timeout_secs),
        }
    }
}

/// Token endpoint response. Only `access_token` is mandatory.
#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    id_token: Option<String>,
    #[serde(default)]
    expires_in: Option<u64>,
    #[serde(default)]
    scope: Option<String>,
}

impl TokenResponse {
    fn into_tokens(self, now_ms: u64) -> OAuthTokens {
        OAuthTokens {
            access_token: Secret::new(self.access_token),
            refresh_token: self.refresh_token.map(Secret::new),
            id_token: self.id_token.map(Secret::new),
            expires_at: self
                .expires_in
                .map(|secs| now_ms.saturating_add(secs.saturating_mul(1000))),
            scopes: self
                .scope
                .map(|s| s.split_whitespace().map(str::to_string).collect())
                .unwrap_or_default(),
        }
    }
}

/// HTTP half of one provider's authorization code + PKCE flow.
#[derive(Debug, Clone)]
pub struct OAuthFlow {
    config: ProviderConfig,
    client: Client,
    timeouts: FlowTimeouts,
}

impl OAuthFlow {
    pub fn new(config: ProviderConfig) -> Self {
        Self {
            config,
            client: Client::new(),
            timeouts: FlowTimeouts::default(),
        }
    }

    pub fn with_timeouts(mut self, timeouts: FlowTimeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    pub fn config(&self) -> &ProviderConfig {
        &self.config
    }

    pub fn timeouts(&self) -> FlowTimeouts {
        self.timeouts
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    /// Build the URL the user's browser is sent to.
    pub fn authorization_url(
        &self,
        redirect_uri: &str,
        pkce: &PkceCodes,
        state: &str,
    ) -> Result<Url, OAuthError> {
        let mut url = Url::parse(&self.config.authorize_url).map_err(|e| {
            OAuthError::InvalidConfig(format!(
                "authorize URL '{}': {e}",
                self.config.authorize_url
            ))
        })?;
        {
            let mut query = url.query_pairs_mut();
            query
                .append_pair("response_type", "code")
                .append_pair("client_id", &self.config.client_id)
                .append_pair("redirect_uri", redirect_uri)
                .append_pair("scope", &self.config.scopes.join(" "))
                .append_pair("code_challenge", &pkce.challenge)
                .append_pair("code_challenge_method", "S256")
                .append_pair("state", state);
            for (key, value) in &self.config.extra_auth_params {
                query.append_pair(key, value);
            }
        }
        Ok(url)
    }

    /// Exchange an authorization code for tokens.
    ///
    /// A 401 means the code itself was refused; any other non-2xx status
    /// keeps the status and body for diagnosis.
    pub async fn exchange(
        &self,
        code: &str,
        verifier: &str,
        redirect_uri: &str,
        state: &str,
    ) -> Result<OAuthTokens, OAuthError> {
        let mut params = vec![
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", redirect_uri),
            ("client_id", self.config.client_id.as_str()),
            ("code_verifier", verifier),
        ];
        if self.config.exchange_includes_state {
            params.push(("state", state));
        }

        #[cfg(feature = "metrics")]
        let started = Instant::now();

        let resp = self
            .token_request(&params)
            .timeout(self.timeouts.exchange)
            .send()
            .await?;

        #[cfg(feature = "metrics")]
        histogram!(
            oauth_metrics::TOKEN_EXCHANGE_DURATION_SECONDS,
            "provider" => self.config.id.clone()
        )
        .record(started.elapsed().as_secs_f64());

        let status = resp.status();
        if status == StatusCode::UNAUTHORIZED {
            warn!(provider = %self.config.id, "token endpoint rejected the authorization code");
            return Err(OAuthError::InvalidAuthorizationCode);
        }
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            warn!(provider = %self.config.id, status = status.as_u16(), "token exchange failed");
            return Err(OAuthError::TokenExchangeFailed {
                status: status.as_u16(),
                body,
            });
        }

        let mut tokens = resp.json::<TokenResponse>().await?.into_tokens(now_ms());
        if tokens.scopes.is_empty() {
            tokens.scopes = self.config.scopes.clone();
        }
        debug!(
            provider = %self.config.id,
            has_refresh = tokens.refresh_token.is_some(),
            has_id_token = tokens.id_token.is_some(),
            "token exchange succeeded"
        );
        Ok(tokens)
    }

    /// Use a refresh token to obtain a new access token.
    ///
    /// When the response omits `refresh_token`, the one passed in is kept.
    pub async fn refresh(&self, refresh_token: &str) -> Result<OAuthTokens, OAuthError> {
        let params = [
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
            ("client_id", self.config.client_id.as_str()),
        ];

        let resp = self
            .token_request(&params)
            .timeout(self.timeouts.refresh)
            .send()
            .await
            .map_err(|e| OAuthError::RefreshFailed(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(OAuthError::RefreshFailed(format!(
                "HTTP {}: {body}",
                status.as_u16()
            )));
        }

        let mut tokens = resp
            .json::<TokenResponse>()
            .await
            .map_err(|e| OAuthError::RefreshFailed(e.to_string()))?
            .into_tokens(now_ms());
        if tokens.refresh_token.is_none() {
            tokens.refresh_token = Some(Secret::new(refresh_token.to_string()));
        }
        debug!(provider = %self.config.id, "token refresh succeeded");
        Ok(tokens)
    }

    fn token_request(&self, params: &[(&str, &str)]) -> reqwest::RequestBuilder {
        let req = self
            .client
            .post(&self.config.token_url)
            .header(reqwest::header::ACCEPT, "application/json");
        match self.config.token_request_format {
            TokenRequestFormat::Form => req.form(params),
            TokenRequestFormat::Json => {
                let body: serde_json::Map<String, serde_json::Value> = params
                    .iter()
                    .map(|(k, v)| ((*k).to_string(), serde_json::Value::from(*v)))
                    .collect();
                req.json(&body)
            },
        }
    }
}
