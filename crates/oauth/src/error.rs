/// Failures of the OAuth authorization and token lifecycle.
#[derive(Debug, thiserror::Error)]
pub enum OAuthError {
    #[error("failed to bind OAuth callback listener: {0}")]
    PortBindFailed(#[source] std::io::Error),

    #[error("OAuth authorization timed out waiting for the browser callback")]
    Timeout,

    #[error("OAuth state mismatch in callback (possible CSRF attempt)")]
    InvalidState,

    #[error("OAuth callback did not include an authorization code")]
    NoAuthorizationCode,

    #[error("{}", describe_denial(.error, .description.as_deref()))]
    ProviderDeniedAuthorization {
        error: String,
        description: Option<String>,
    },

    #[error("authorization code was rejected by the token endpoint")]
    InvalidAuthorizationCode,

    #[error("token exchange failed (HTTP {status}): {body}")]
    TokenExchangeFailed { status: u16, body: String },

    #[error("token refresh failed: {0}")]
    RefreshFailed(String),

    #[error("profile fetch failed: {0}")]
    ProfileFetchFailed(String),

    #[error("unknown OAuth provider: {0}")]
    UnknownProvider(String),

    #[error("invalid OAuth provider configuration: {0}")]
    InvalidConfig(String),

    #[error("token request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("token store write failed: {0}")]
    Store(String),
}

fn describe_denial(error: &str, description: Option<&str>) -> String {
    match description {
        Some(d) if !d.is_empty() => format!("{error}: {d}"),
        _ => error.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn denial_leads_with_provider_error_code() {
        let err = OAuthError::ProviderDeniedAuthorization {
            error: "access_denied".into(),
            description: Some("The user declined".into()),
        };
        assert_eq!(err.to_string(), "access_denied: The user declined");

        let bare = OAuthError::ProviderDeniedAuthorization {
            error: "access_denied".into(),
            description: None,
        };
        assert_eq!(bare.to_string(), "access_denied");
    }

    #[test]
    fn timeout_mentions_timed_out() {
        assert!(OAuthError::Timeout.to_string().contains("timed out"));
    }
}
