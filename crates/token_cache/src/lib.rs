use std::fs;
use std::path::{Path, PathBuf};

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use anyhow::{Context, Result, anyhow, bail};
use argon2::Argon2;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::{DateTime, Duration, Utc};
use rand::RngCore;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, info};

const SEALED_SCHEMA_VERSION: u32 = 1;
const PLAIN_FILE: &str = "token.json";
const SEALED_FILE: &str = "token.enc.json";

#[derive(Debug, Error)]
pub enum TokenError {
    #[error("the cached token is encrypted but no passphrase was provided")]
    MissingPassphrase,
    #[error("no cached authorization; import a token with `helper-ledger auth import <file>`")]
    NotAuthorized,
}

/// An authorized-user credential, field-compatible with the `token.json`
/// files written by Google's client libraries.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OAuthToken {
    pub token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_uri: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_secret: Option<String>,
    #[serde(default)]
    pub scopes: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expiry: Option<DateTime<Utc>>,
}

impl OAuthToken {
    /// True once `now + skew` reaches the expiry. Tokens without one never expire.
    pub fn is_expired(&self, now: DateTime<Utc>, skew: Duration) -> bool {
        self.expiry.is_some_and(|expiry| expiry <= now + skew)
    }

    pub fn can_refresh(&self) -> bool {
        self.refresh_token.is_some() && self.client_id.is_some() && self.client_secret.is_some()
    }

    /// Short digest safe to put in logs.
    pub fn fingerprint(&self) -> String {
        let digest = Sha256::digest(self.token.as_bytes());
        format!("{digest:x}")[..12].to_string()
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct SealedToken {
    schema_version: u32,
    salt_b64: String,
    nonce_b64: String,
    ciphertext_b64: String,
}

/// One cached token under `root`, as `token.json` or, with a passphrase,
/// `token.enc.json`.
#[derive(Debug, Clone)]
pub struct TokenCache {
    root: PathBuf,
    passphrase: Option<String>,
}

impl TokenCache {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            passphrase: None,
        }
    }

    pub fn with_passphrase(mut self, passphrase: Option<String>) -> Self {
        self.passphrase = passphrase;
        self
    }

    pub fn is_encrypted_mode(&self) -> bool {
        self.passphrase.is_some()
    }

    pub fn load(&self) -> Result<Option<OAuthToken>> {
        let plain = self.plain_path();
        let sealed = self.sealed_path();

        let bytes = match (sealed.exists(), self.passphrase.as_deref()) {
            (true, Some(passphrase)) => open(passphrase, &read_sealed(&sealed)?)?,
            (true, None) if !plain.exists() => return Err(TokenError::MissingPassphrase.into()),
            _ if plain.exists() => fs::read(&plain)
                .with_context(|| format!("failed to read {}", plain.display()))?,
            _ => return Ok(None),
        };

        let token: OAuthToken =
            serde_json::from_slice(&bytes).context("failed to parse cached token")?;
        debug!(fingerprint = %token.fingerprint(), "loaded cached token");
        Ok(Some(token))
    }

    pub fn store(&self, token: &OAuthToken) -> Result<()> {
        fs::create_dir_all(&self.root)
            .with_context(|| format!("failed to create {}", self.root.display()))?;
        let json = serde_json::to_vec_pretty(token).context("failed to serialize token")?;

        let (written, stale) = match self.passphrase.as_deref() {
            Some(passphrase) => {
                let sealed = seal(passphrase, &json)?;
                fs::write(self.sealed_path(), serde_json::to_string_pretty(&sealed)?)?;
                (self.sealed_path(), self.plain_path())
            }
            None => {
                fs::write(self.plain_path(), &json)?;
                (self.plain_path(), self.sealed_path())
            }
        };
        if stale.exists() {
            fs::remove_file(&stale).ok();
        }
        info!(
            path = %written.display(),
            fingerprint = %token.fingerprint(),
            encrypted = self.is_encrypted_mode(),
            "cached authorization token"
        );
        Ok(())
    }

    /// Reads an authorized-user file from elsewhere and caches it.
    pub fn import_file(&self, path: impl AsRef<Path>) -> Result<OAuthToken> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let token: OAuthToken = serde_json::from_str(&text)
            .with_context(|| format!("{} is not an authorized-user token file", path.display()))?;
        self.store(&token)?;
        Ok(token)
    }

    pub fn clear(&self) -> Result<()> {
        for path in [self.plain_path(), self.sealed_path()] {
            if path.exists() {
                fs::remove_file(&path)
                    .with_context(|| format!("failed to remove {}", path.display()))?;
            }
        }
        Ok(())
    }

    fn plain_path(&self) -> PathBuf {
        self.root.join(PLAIN_FILE)
    }

    fn sealed_path(&self) -> PathBuf {
        self.root.join(SEALED_FILE)
    }
}

pub fn default_token_dir_from(base_dir: &Path) -> PathBuf {
    base_dir.join("auth")
}

fn read_sealed(path: &Path) -> Result<SealedToken> {
    let text =
        fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))?;
    Ok(serde_json::from_str(&text)?)
}

fn cipher_for(passphrase: &str, salt: &[u8]) -> Result<Aes256Gcm> {
    let mut key = [0u8; 32];
    Argon2::default()
        .hash_password_into(passphrase.as_bytes(), salt, &mut key)
        .map_err(|e| anyhow!("failed to derive token key: {e}"))?;
    Aes256Gcm::new_from_slice(&key).context("failed to build cipher")
}

fn seal(passphrase: &str, plaintext: &[u8]) -> Result<SealedToken> {
    let mut salt = [0u8; 16];
    let mut nonce = [0u8; 12];
    OsRng.fill_bytes(&mut salt);
    OsRng.fill_bytes(&mut nonce);

    let ciphertext = cipher_for(passphrase, &salt)?
        .encrypt(Nonce::from_slice(&nonce), plaintext)
        .map_err(|e| anyhow!("failed to encrypt token: {e}"))?;

    Ok(SealedToken {
        schema_version: SEALED_SCHEMA_VERSION,
        salt_b64: BASE64.encode(salt),
        nonce_b64: BASE64.encode(nonce),
        ciphertext_b64: BASE64.encode(ciphertext),
    })
}

fn open(passphrase: &str, sealed: &SealedToken) -> Result<Vec<u8>> {
    let salt = BASE64.decode(&sealed.salt_b64)?;
    let nonce = BASE64.decode(&sealed.nonce_b64)?;
    let ciphertext = BASE64.decode(&sealed.ciphertext_b64)?;
    if nonce.len() != 12 {
        bail!("invalid nonce length");
    }

    cipher_for(passphrase, &salt)?
        .decrypt(Nonce::from_slice(&nonce), ciphertext.as_ref())
        .map_err(|e| anyhow!("failed to decrypt token: {e}"))
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;

    fn token(expiry: Option<DateTime<Utc>>) -> OAuthToken {
        OAuthToken {
            token: "ya29.access".to_string(),
            refresh_token: Some("1//refresh".to_string()),
            token_uri: Some("https://oauth2.googleapis.com/token".to_string()),
            client_id: Some("client".to_string()),
            client_secret: Some("secret".to_string()),
            scopes: vec!["https://www.googleapis.com/auth/spreadsheets".to_string()],
            expiry,
        }
    }

    #[test]
    fn empty_cache_loads_nothing() {
        let dir = tempdir().expect("tempdir");
        let cache = TokenCache::new(dir.path());
        assert_eq!(cache.load().expect("load"), None);
    }

    #[test]
    fn roundtrip_plain() {
        let dir = tempdir().expect("tempdir");
        let cache = TokenCache::new(dir.path());
        cache.store(&token(None)).expect("store");
        assert_eq!(cache.load().expect("load"), Some(token(None)));
        cache.clear().expect("clear");
        assert_eq!(cache.load().expect("load"), None);
    }

    #[test]
    fn roundtrip_encrypted_replaces_plain_file() {
        let dir = tempdir().expect("tempdir");
        TokenCache::new(dir.path())
            .store(&token(None))
            .expect("plain store");

        let cache = TokenCache::new(dir.path()).with_passphrase(Some("p@ss".to_string()));
        cache.store(&token(None)).expect("sealed store");
        assert!(!dir.path().join(PLAIN_FILE).exists());

        let reopened = TokenCache::new(dir.path()).with_passphrase(Some("p@ss".to_string()));
        assert_eq!(reopened.load().expect("load"), Some(token(None)));

        let err = TokenCache::new(dir.path()).load().expect_err("must fail");
        assert!(matches!(
            err.downcast_ref::<TokenError>(),
            Some(TokenError::MissingPassphrase)
        ));
    }

    #[test]
    fn wrong_passphrase_fails() {
        let dir = tempdir().expect("tempdir");
        TokenCache::new(dir.path())
            .with_passphrase(Some("good".to_string()))
            .store(&token(None))
            .expect("store");
        let err = TokenCache::new(dir.path())
            .with_passphrase(Some("bad".to_string()))
            .load()
            .expect_err("must fail");
        assert!(
            err.to_string().contains("failed to decrypt"),
            "unexpected error: {err}"
        );
    }

    #[test]
    fn imports_google_authorized_user_file() {
        let dir = tempdir().expect("tempdir");
        let source = dir.path().join("token.json.src");
        fs::write(
            &source,
            r#"{"token": "ya29.abc", "refresh_token": "1//r", "token_uri": "https://oauth2.googleapis.com/token",
               "client_id": "id", "client_secret": "s", "scopes": ["a", "b"],
               "universe_domain": "googleapis.com", "account": "", "expiry": "2024-08-18T10:00:00.123456Z"}"#,
        )
        .expect("write");
        let cache = TokenCache::new(dir.path().join("auth"));
        let imported = cache.import_file(&source).expect("import");
        assert_eq!(imported.token, "ya29.abc");
        assert!(imported.can_refresh());
        assert_eq!(cache.load().expect("load"), Some(imported));
    }

    #[test]
    fn expiry_uses_skew() {
        let now = Utc::now();
        let soon = token(Some(now + Duration::seconds(30)));
        assert!(soon.is_expired(now, Duration::seconds(60)));
        assert!(!soon.is_expired(now, Duration::zero()));
        assert!(!token(None).is_expired(now, Duration::seconds(60)));
        assert_eq!(soon.fingerprint().len(), 12);
    }
}
