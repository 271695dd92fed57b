use std::{
    io::Write,
    path::{Path, PathBuf},
    sync::{Mutex, PoisonError},
};

use {
    anyhow::{Context, Result},
    serde::{Deserialize, Serialize},
    serde_json::{Map, Value},
    tracing::warn,
};

use crate::types::StoredProviderData;

/// On-disk shape: `{"providers": {"<id>": {tokens, profile, connectedAt}}}`.
/// Top-level keys this version does not know about are carried through.
#[derive(Debug, Default, Serialize, Deserialize)]
struct StoreDocument {
    #[serde(default)]
    providers: Map<String, Value>,
    #[serde(flatten)]
    extra: Map<String, Value>,
}

/// File-based token storage at `~/.config/modelgate/oauth_tokens.json`.
///
/// Reads fail open: a missing or unreadable file looks empty. Writes go
/// through a temp file and rename, so readers never see a partial document.
#[derive(Debug)]
pub struct TokenStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl TokenStore {
    pub fn new() -> Self {
        Self::with_path(modelgate_config::config_dir().join("oauth_tokens.json"))
    }

    /// Create a token store at a specific path (useful for testing).
    pub fn with_path(path: PathBuf) -> Self {
        Self {
            path,
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load(&self, provider: &str) -> Option<StoredProviderData> {
        let value = self.read_document().providers.remove(provider)?;
        match serde_json::from_value(value) {
            Ok(data) => Some(data),
            Err(e) => {
                warn!(provider, error = %e, "ignoring malformed stored OAuth record");
                None
            },
        }
    }

    pub fn save(&self, provider: &str, data: &StoredProviderData) -> Result<()> {
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut doc = self.read_document();
        doc.providers
            .insert(provider.to_string(), serde_json::to_value(data)?);
        self.write_document(&doc)
    }

    /// Remove a provider's record. Returns whether one existed.
    pub fn delete(&self, provider: &str) -> Result<bool> {
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut doc = self.read_document();
        if doc.providers.remove(provider).is_none() {
            return Ok(false);
        }
        self.write_document(&doc)?;
        Ok(true)
    }

    /// Provider ids with a stored record.
    pub fn list(&self) -> Vec<String> {
        self.read_document().providers.into_iter().map(|(k, _)| k).collect()
    }

    fn read_document(&self) -> StoreDocument {
        let data = match std::fs::read_to_string(&self.path) {
            Ok(d) => d,
            Err(e) => {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(path = %self.path.display(), error = %e, "failed to read token store");
                }
                return StoreDocument::default();
            },
        };
        serde_json::from_str(&data).unwrap_or_else(|e| {
            warn!(path = %self.path.display(), error = %e, "token store is not valid JSON, treating as empty");
            StoreDocument::default()
        })
    }

    fn write_document(&self, doc: &StoreDocument) -> Result<()> {
        let parent = self
            .path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating {}", parent.display()))?;

        let data = serde_json::to_string_pretty(doc)?;
        let mut tmp = tempfile::NamedTempFile::new_in(parent)
            .with_context(|| format!("creating temp file in {}", parent.display()))?;
        tmp.write_all(data.as_bytes())?;
        tmp.as_file().sync_all()?;

        // Set file permissions to 0600 on Unix
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(tmp.path(), std::fs::Permissions::from_mode(0o600))?;
        }

        tmp.persist(&self.path)
            .with_context(|| format!("replacing {}", self.path.display()))?;
        Ok(())
    }
}

impl Default for TokenStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::types::{OAuthProfile, OAuthTokens},
        secrecy::{ExposeSecret, Secret},
    };

    fn record(access: &str) -> StoredProviderData {
        StoredProviderData {
            tokens: OAuthTokens {
                refresh_token: Some(Secret::new("rt".into())),
                expires_at: Some(1_700_000_000_000),
                ..OAuthTokens::new(access)
            },
            profile: OAuthProfile {
                id: "u-1".into(),
                email: Some("a@b.c".into()),
                name: None,
            },
            connected_at: 1_600_000_000_000,
        }
    }

    fn store() -> (tempfile::TempDir, TokenStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = TokenStore::with_path(dir.path().join("nested").join("oauth_tokens.json"));
        (dir, store)
    }

    #[test]
    fn save_then_load() {
        let (_dir, store) = store();
        store.save("anthropic", &record("at-1")).unwrap();

        let loaded = store.load("anthropic").unwrap();
        assert_eq!(loaded.tokens.access_token.expose_secret(), "at-1");
        assert_eq!(loaded.profile.id, "u-1");
        assert_eq!(loaded.connected_at, 1_600_000_000_000);
        assert!(store.load("openai-codex").is_none());
        assert_eq!(store.list(), vec!["anthropic".to_string()]);
    }

    #[test]
    fn full_record_survives_reload_unchanged() {
        let (_dir, store) = store();
        let original = StoredProviderData {
            tokens: OAuthTokens {
                access_token: Secret::new("at-full".into()),
                refresh_token: Some(Secret::new("rt-full".into())),
                id_token: Some(Secret::new("header.payload.sig".into())),
                expires_at: Some(1_700_000_123_456),
                scopes: vec!["openid".into(), "offline_access".into()],
            },
            profile: OAuthProfile {
                id: "acct-1".into(),
                email: Some("dev@example.com".into()),
                name: Some("Dev Eloper".into()),
            },
            connected_at: 1_600_000_000_001,
        };
        store.save("openai-codex", &original).unwrap();

        // Reload through a fresh handle so nothing is served from memory.
        let reloaded = TokenStore::with_path(store.path().to_path_buf())
            .load("openai-codex")
            .unwrap();
        assert_eq!(
            serde_json::to_value(&reloaded).unwrap(),
            serde_json::to_value(&original).unwrap()
        );
        assert_eq!(
            reloaded.tokens.id_token.as_ref().map(|s| s.expose_secret().as_str()),
            Some("header.payload.sig")
        );
        assert_eq!(reloaded.tokens.scopes, original.tokens.scopes);
        assert_eq!(reloaded.profile, original.profile);
    }

    #[test]
    fn document_layout_is_camel_case_under_providers() {
        let (_dir, store) = store();
        store.save("anthropic", &record("at")).unwrap();

        let raw: Value =
            serde_json::from_str(&std::fs::read_to_string(store.path()).unwrap()).unwrap();
        let entry = &raw["providers"]["anthropic"];
        assert_eq!(entry["tokens"]["accessToken"], "at");
        assert_eq!(entry["tokens"]["refreshToken"], "rt");
        assert_eq!(entry["connectedAt"], 1_600_000_000_000u64);
        assert_eq!(entry["profile"]["email"], "a@b.c");
    }

    #[test]
    fn unknown_keys_survive_writes() {
        let (_dir, store) = store();
        std::fs::create_dir_all(store.path().parent().unwrap()).unwrap();
        std::fs::write(
            store.path(),
            r#"{"version": 2, "providers": {"other": {"custom": true}}}"#,
        )
        .unwrap();

        store.save("anthropic", &record("at")).unwrap();
        store.delete("anthropic").unwrap();

        let raw: Value =
            serde_json::from_str(&std::fs::read_to_string(store.path()).unwrap()).unwrap();
        assert_eq!(raw["version"], 2);
        assert_eq!(raw["providers"]["other"]["custom"], true);
        // A record this version cannot parse is skipped, not fatal.
        assert!(store.load("other").is_none());
    }

    #[test]
    fn corrupt_file_reads_as_empty() {
        let (_dir, store) = store();
        std::fs::create_dir_all(store.path().parent().unwrap()).unwrap();
        std::fs::write(store.path(), "{not json").unwrap();

        assert!(store.load("anthropic").is_none());
        assert!(store.list().is_empty());
        store.save("anthropic", &record("at")).unwrap();
        assert!(store.load("anthropic").is_some());
    }

    #[test]
    fn delete_is_idempotent() {
        let (_dir, store) = store();
        assert!(!store.delete("anthropic").unwrap());
        store.save("anthropic", &record("at")).unwrap();
        assert!(store.delete("anthropic").unwrap());
        assert!(!store.delete("anthropic").unwrap());
        assert!(store.load("anthropic").is_none());
    }

    #[cfg(unix)]
    #[test]
    fn file_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let (_dir, store) = store();
        store.save("anthropic", &record("at")).unwrap();
        let mode = std::fs::metadata(store.path()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}
