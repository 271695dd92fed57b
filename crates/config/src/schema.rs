//! Config schema types for the OAuth subsystem.

use std::{collections::HashMap, path::PathBuf};

use serde::{Deserialize, Serialize};

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelgateConfig {
    pub oauth: OAuthSection,
}

/// `[oauth]` section: token store location, flow timeouts and provider overrides.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OAuthSection {
    /// Override the token store path. Defaults to `<config_dir>/oauth_tokens.json`.
    pub store_path: Option<PathBuf>,

    /// Wall-clock limit for the whole browser round-trip.
    pub authorize_timeout_secs: u64,

    /// Limit for the authorization-code exchange request.
    pub exchange_timeout_secs: u64,

    pub refresh_timeout_secs: u64,

    pub profile_timeout_secs: u64,

    /// Per-provider overrides keyed by provider id (e.g. "openai-codex").
    pub providers: HashMap<String, ProviderOverride>,
}

impl Default for OAuthSection {
    fn default() -> Self {
        Self {
            store_path: None,
            authorize_timeout_secs: 300,
            exchange_timeout_secs: 30,
            refresh_timeout_secs: 10,
            profile_timeout_secs: 10,
            providers: HashMap::new(),
        }
    }
}

impl OAuthSection {
    /// Check if a provider is enabled (defaults to true if not configured).
    pub fn is_enabled(&self, id: &str) -> bool {
        self.providers.get(id).is_none_or(|p| p.enabled)
    }

    /// Get the configured override for a provider, if any.
    pub fn provider(&self, id: &str) -> Option<&ProviderOverride> {
        self.providers.get(id)
    }
}

/// Field-level overrides for a built-in OAuth provider.
///
/// Unset fields keep the built-in value.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderOverride {
    pub enabled: bool,
    pub client_id: Option<String>,
    pub authorize_url: Option<String>,
    pub token_url: Option<String>,
    pub profile_url: Option<String>,
    pub callback_port: Option<u16>,
    pub scopes: Option<Vec<String>>,
}

impl Default for ProviderOverride {
    fn default() -> Self {
        Self {
            enabled: true,
            client_id: None,
            authorize_url: None,
            token_url: None,
            profile_url: None,
            callback_port: None,
            scopes: None,
        }
    }
}
