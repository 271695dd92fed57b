//! OAuth 2.0 authorization code + PKCE sign-in for model providers.
//!
//! [`OAuthManager`] is the entry point: it owns the [`TokenStore`] and the
//! registered [`OAuthProvider`]s, runs the browser flow on `connect`, and
//! hands out access tokens, refreshing them when they are about to expire.

pub mod browser;
pub mod callback_server;
pub mod defaults;
pub mod error;
pub mod flow;
pub mod jwt;
pub mod manager;
pub mod pkce;
pub mod profile;
pub mod provider;
pub mod storage;
pub mod types;

pub use {
    browser::{BrowserOpener, SystemBrowser},
    callback_server::{CallbackOptions, CallbackServer, FlowState},
    defaults::{builtin_config, configured_providers, load_provider_config},
    error::OAuthError,
    flow::{FlowTimeouts, OAuthFlow},
    manager::{ConnectResult, DisconnectResult, OAuthManager},
    provider::{OAuthProvider, PkceProvider},
    storage::TokenStore,
    types::{
        AuthorizeOutcome, IdentitySource, OAuthProfile, OAuthProviderStatus, OAuthTokens,
        PkceCodes, ProviderConfig, StoredProviderData, TokenRequestFormat,
    },
};
