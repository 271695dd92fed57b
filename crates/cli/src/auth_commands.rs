use std::sync::Arc;

use {
    anyhow::{Result, bail},
    clap::Subcommand,
    modelgate_oauth::{
        BrowserOpener, OAuthManager, OAuthProviderStatus, SystemBrowser, types::now_ms,
    },
};

#[derive(Subcommand)]
pub enum AuthAction {
    /// Log in to a provider via OAuth.
    Login {
        /// Provider id (e.g. "anthropic", "openai-codex").
        #[arg(long)]
        provider: String,
    },
    /// Show authentication status for all providers.
    Status {
        /// Print the status as JSON.
        #[arg(long, default_value_t = false)]
        json: bool,
    },
    /// Log out from a provider.
    Logout {
        #[arg(long)]
        provider: String,
    },
    /// Verify a usable access token is available, refreshing it if needed.
    Check {
        #[arg(long)]
        provider: String,
    },
}

/// Opens the system browser and always echoes the URL, for headless shells.
struct TerminalBrowser;

impl BrowserOpener for TerminalBrowser {
    fn open(&self, url: &str) -> Result<()> {
        println!("Opening browser for authentication...");
        if SystemBrowser.open(url).is_err() {
            println!("Could not open browser. Please visit:\n{url}");
        } else {
            println!("If the browser did not open, visit:\n{url}");
        }
        Ok(())
    }
}

pub async fn handle_auth(action: AuthAction) -> Result<()> {
    let config = modelgate_config::discover_and_load();
    let manager = OAuthManager::from_config(&config.oauth, Arc::new(TerminalBrowser));

    match action {
        AuthAction::Login { provider } => login(&manager, &provider).await,
        AuthAction::Status { json } => status(&manager, json),
        AuthAction::Logout { provider } => logout(&manager, &provider),
        AuthAction::Check { provider } => check(&manager, &provider).await,
    }
}

async fn login(manager: &OAuthManager, provider: &str) -> Result<()> {
    println!("Waiting for the browser to complete sign-in (5 minute limit)...");
    let result = manager.connect(provider).await;
    if !result.success {
        bail!(
            "login to {provider} failed: {}",
            result.error.unwrap_or_else(|| "unknown error".into())
        );
    }
    match result.profile.and_then(|p| p.email.or(p.name)) {
        Some(who) => println!("Successfully logged in to {provider} as {who}"),
        None => println!("Successfully logged in to {provider}"),
    }
    Ok(())
}

fn status(manager: &OAuthManager, json: bool) -> Result<()> {
    let statuses = manager.list();
    if json {
        println!("{}", serde_json::to_string_pretty(&statuses)?);
        return Ok(());
    }
    for status in &statuses {
        println!("{}", describe(status, now_ms()));
    }
    Ok(())
}

fn describe(status: &OAuthProviderStatus, now_ms: u64) -> String {
    if !status.connected {
        return format!("{} [not connected]", status.id);
    }
    let who = status
        .profile
        .as_ref()
        .and_then(|p| p.email.clone().or_else(|| p.name.clone()))
        .map(|w| format!(" {w}"))
        .unwrap_or_default();
    let state = match status.expires_at {
        None => "valid (no expiry)".to_string(),
        Some(at) if !status.is_expired => {
            let remaining = at.saturating_sub(now_ms) / 1000;
            let hours = remaining / 3600;
            let mins = (remaining % 3600) / 60;
            format!("valid ({hours}h {mins}m remaining)")
        },
        Some(_) if status.refreshable => "expired (refreshes on next use)".to_string(),
        Some(_) => "expired (reconnect)".to_string(),
    };
    format!("{}{who} [{state}]", status.id)
}

fn logout(manager: &OAuthManager, provider: &str) -> Result<()> {
    let result = manager.disconnect(provider);
    if !result.success {
        bail!(
            "logout from {provider} failed: {}",
            result.error.unwrap_or_default()
        );
    }
    println!("Logged out from {provider}");
    Ok(())
}

async fn check(manager: &OAuthManager, provider: &str) -> Result<()> {
    match manager.get_access_token(provider).await {
        Some(_) => {
            println!("{provider}: access token available");
            Ok(())
        },
        None => bail!("{provider}: not authenticated, run `modelgate auth login --provider {provider}`"),
    }
}
