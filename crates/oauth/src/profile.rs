use std::time::Duration;

use {reqwest::Client, serde_json::Value, tracing::debug};

use crate::{error::OAuthError, types::OAuthProfile};

/// Fetch the connected account's profile with a bearer token.
pub async fn fetch_profile(
    client: &Client,
    url: &str,
    access_token: &str,
    timeout: Duration,
) -> Result<OAuthProfile, OAuthError> {
    let resp = client
        .get(url)
        .bearer_auth(access_token)
        .header(reqwest::header::ACCEPT, "application/json")
        .timeout(timeout)
        .send()
        .await
        .map_err(|e| OAuthError::ProfileFetchFailed(e.to_string()))?;

    let status = resp.status();
    if !status.is_success() {
        return Err(OAuthError::ProfileFetchFailed(format!(
            "HTTP {}",
            status.as_u16()
        )));
    }

    let body: Value = resp
        .json()
        .await
        .map_err(|e| OAuthError::ProfileFetchFailed(e.to_string()))?;
    let profile = parse_profile(&body);
    debug!(profile_id = %profile.id, "fetched OAuth profile");
    Ok(profile)
}

/// Extract a profile from a profile-endpoint body. Accepts both a nested
/// `account` object and flat top-level fields.
pub fn parse_profile(body: &Value) -> OAuthProfile {
    let id = first_str(body, &[
        &["account", "uuid"],
        &["account", "id"],
        &["id"],
        &["sub"],
    ])
    .unwrap_or_else(|| "unknown".into());

    OAuthProfile {
        id,
        email: first_str(body, &[
            &["account", "email_address"],
            &["account", "email"],
            &["email"],
        ]),
        name: first_str(body, &[
            &["account", "full_name"],
            &["account", "display_name"],
            &["name"],
        ]),
    }
}

fn first_str(body: &Value, paths: &[&[&str]]) -> Option<String> {
    paths.iter().find_map(|path| {
        path.iter()
            .try_fold(body, |v, key| v.get(*key))
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    })
}
