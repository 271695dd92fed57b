use std::time::{SystemTime, UNIX_EPOCH};

use {
    secrecy::{ExposeSecret, Secret},
    serde::{Deserialize, Serialize, Serializer},
};

/// Tokens are treated as expired this long before their real expiry, so a
/// refresh happens ahead of the deadline rather than after it.
pub const EXPIRY_BUFFER_MS: u64 = 5 * 60 * 1000;

/// Current wall-clock time in epoch milliseconds.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Serialize a `Secret<String>` as a plain string (store/wire boundary only).
pub fn serialize_secret<S: Serializer>(
    secret: &Secret<String>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(secret.expose_secret())
}

pub fn serialize_option_secret<S: Serializer>(
    secret: &Option<Secret<String>>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    match secret {
        Some(s) => serializer.serialize_some(s.expose_secret()),
        None => serializer.serialize_none(),
    }
}

// ── Provider configuration ──────────────────────────────────────────────────

/// How the token endpoint expects its request body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenRequestFormat {
    Json,
    Form,
}

/// Where a provider gets the connected user's identity from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdentitySource {
    /// Authenticated GET against a profile endpoint. When `required_scope` is
    /// set and the grant lacks it, no request is made and a minimal profile
    /// is used instead.
    ProfileEndpoint {
        url: String,
        required_scope: Option<String>,
    },
    /// Claims embedded in the `id_token` JWT returned by the token endpoint.
    /// The account id lives in the object under `namespace`, field
    /// `account_field`.
    IdTokenClaims {
        namespace: String,
        account_field: String,
    },
}

/// Static configuration of one OAuth provider.
#[derive(Debug, Clone)]
pub struct ProviderConfig {
    pub id: String,
    pub name: String,
    /// Icon key understood by the UI.
    pub icon: String,
    pub description: String,
    pub authorize_url: String,
    pub token_url: String,
    pub client_id: String,
    pub scopes: Vec<String>,
    /// Path component of the local redirect URI, e.g. `/auth/callback`.
    pub redirect_path: String,
    /// Fixed local port the provider's registered redirect URI expects.
    /// `None` means an OS-assigned port.
    pub callback_port: Option<u16>,
    pub extra_auth_params: Vec<(String, String)>,
    /// Random bytes behind the PKCE verifier (32 or 64).
    pub verifier_bytes: usize,
    pub token_request_format: TokenRequestFormat,
    /// Whether the exchange request echoes `state`.
    pub exchange_includes_state: bool,
    /// When set, a successful callback redirects here instead of rendering
    /// the local success page.
    pub success_redirect_url: Option<String>,
    pub identity: IdentitySource,
}

impl ProviderConfig {
    /// Redirect URI for a listener bound to `port`.
    pub fn redirect_uri(&self, port: u16) -> String {
        format!("http://localhost:{port}{}", self.redirect_path)
    }

    pub fn profile_url(&self) -> Option<&str> {
        match &self.identity {
            IdentitySource::ProfileEndpoint { url, .. } => Some(url),
            IdentitySource::IdTokenClaims { .. } => None,
        }
    }
}

/// PKCE S256 verifier/challenge pair. The challenge is always derived from
/// the verifier (see [`crate::pkce`]).
#[derive(Clone)]
pub struct PkceCodes {
    pub verifier: String,
    pub challenge: String,
}

impl std::fmt::Debug for PkceCodes {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PkceCodes")
            .field("verifier", &"[REDACTED]")
            .field("challenge", &self.challenge)
            .finish()
    }
}

// ── Tokens and profiles ─────────────────────────────────────────────────────

/// Stored OAuth tokens.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OAuthTokens {
    #[serde(serialize_with = "serialize_secret")]
    pub access_token: Secret<String>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        serialize_with = "serialize_option_secret"
    )]
    pub refresh_token: Option<Secret<String>>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        serialize_with = "serialize_option_secret"
    )]
    pub id_token: Option<Secret<String>>,
    /// Epoch milliseconds. `None` means the token never expires.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<u64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub scopes: Vec<String>,
}

impl OAuthTokens {
    pub fn new(access_token: impl Into<String>) -> Self {
        Self {
            access_token: Secret::new(access_token.into()),
            refresh_token: None,
            id_token: None,
            expires_at: None,
            scopes: Vec::new(),
        }
    }

    /// True when `expires_at <= now + 5min`. Tokens without an expiry never expire.
    pub fn is_expired_at(&self, now_ms: u64) -> bool {
        self.expires_at
            .is_some_and(|at| at <= now_ms.saturating_add(EXPIRY_BUFFER_MS))
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(now_ms())
    }

    pub fn has_scope(&self, scope: &str) -> bool {
        self.scopes.iter().any(|s| s == scope)
    }

    pub fn can_refresh(&self) -> bool {
        self.refresh_token.is_some()
    }

    /// Fill fields a refresh response left out from the previous tokens.
    pub fn inherit_missing(mut self, previous: &OAuthTokens) -> Self {
        if self.refresh_token.is_none() {
            self.refresh_token = previous.refresh_token.clone();
        }
        if self.id_token.is_none() {
            self.id_token = previous.id_token.clone();
        }
        if self.scopes.is_empty() {
            self.scopes = previous.scopes.clone();
        }
        self
    }
}

/// Identity of the connected account, for display.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OAuthProfile {
    /// Provider-stable subject identifier.
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl OAuthProfile {
    /// Minimal profile used when identity cannot be determined.
    pub fn unknown() -> Self {
        Self {
            id: "unknown".into(),
            email: None,
            name: None,
        }
    }
}

/// Result of a successful `authorize()` round-trip.
#[derive(Debug, Clone)]
pub struct AuthorizeOutcome {
    pub tokens: OAuthTokens,
    pub profile: OAuthProfile,
}

/// One provider's record in the token store.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredProviderData {
    pub tokens: OAuthTokens,
    pub profile: OAuthProfile,
    /// Epoch milliseconds of the code exchange that created this record.
    pub connected_at: u64,
}

/// Read-only projection of a provider's connection state for the UI.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OAuthProviderStatus {
    pub id: String,
    pub name: String,
    pub icon: String,
    pub description: String,
    pub connected: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub profile: Option<OAuthProfile>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<u64>,
    pub is_expired: bool,
    /// A refresh token is stored, so an expired session can heal silently.
    pub refreshable: bool,
}
