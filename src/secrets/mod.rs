//! Tenant secret registry
//!
//! The handshake accepts a connection when exactly one active secret
//! validates the client frame. The active set is fetched at the start of
//! every connection so revocations take effect without a restart. A fetch
//! failure is logged and the last successfully fetched set is used; only a
//! registry that never produced a set rejects connections.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use thiserror::Error;
use tracing::warn;

/// An opaque byte string identifying a tenant
pub type Secret = Vec<u8>;

/// Registry failures
#[derive(Debug, Error)]
pub enum SecretError {
    #[error("no secrets configured")]
    Empty,

    #[error("invalid hex secret at {path}:{line}")]
    BadEntry { path: String, line: usize },

    #[error("secret registry {path} is unavailable and no prior set is cached: {source}")]
    Unavailable {
        path: String,
        source: std::io::Error,
    },
}

/// Source of the active secret set, consulted once per connection
#[async_trait]
pub trait SecretProvider: Send + Sync {
    async fn active_secrets(&self) -> Result<Arc<Vec<Secret>>, SecretError>;
}

/// Fixed set handed over at startup
#[derive(Debug)]
pub struct StaticSecrets(Arc<Vec<Secret>>);

impl StaticSecrets {
    pub fn new(secrets: Vec<Secret>) -> Result<Self, SecretError> {
        if secrets.is_empty() {
            return Err(SecretError::Empty);
        }
        Ok(Self(Arc::new(secrets)))
    }
}

#[async_trait]
impl SecretProvider for StaticSecrets {
    async fn active_secrets(&self) -> Result<Arc<Vec<Secret>>, SecretError> {
        Ok(Arc::clone(&self.0))
    }
}

/// Registry file with one hex secret per line, re-read on every fetch.
///
/// Blank lines and `#` comments are skipped. When the file turns unreadable
/// or unparsable, the previously loaded set keeps serving.
#[derive(Debug)]
pub struct FileRegistry {
    path: PathBuf,
    last_good: Mutex<Option<Arc<Vec<Secret>>>>,
}

impl FileRegistry {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            last_good: Mutex::new(None),
        }
    }

    fn parse(path: &str, content: &str) -> Result<Vec<Secret>, SecretError> {
        let mut secrets = Vec::new();
        for (idx, line) in content.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let secret = hex::decode(line).map_err(|_| SecretError::BadEntry {
                path: path.to_string(),
                line: idx + 1,
            })?;
            secrets.push(secret);
        }
        if secrets.is_empty() {
            return Err(SecretError::Empty);
        }
        Ok(secrets)
    }

    fn fall_back(&self, err: SecretError) -> Result<Arc<Vec<Secret>>, SecretError> {
        match self.last_good.lock().clone() {
            Some(cached) => {
                warn!(error = %err, "secret registry fetch failed, serving previous set");
                Ok(cached)
            }
            None => Err(err),
        }
    }
}

#[async_trait]
impl SecretProvider for FileRegistry {
    async fn active_secrets(&self) -> Result<Arc<Vec<Secret>>, SecretError> {
        let path = self.path.display().to_string();
        match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => match Self::parse(&path, &content) {
                Ok(secrets) => {
                    let set = Arc::new(secrets);
                    *self.last_good.lock() = Some(Arc::clone(&set));
                    Ok(set)
                }
                Err(e) => self.fall_back(e),
            },
            Err(source) => self.fall_back(SecretError::Unavailable { path, source }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_static_set_served() {
        let provider = StaticSecrets::new(vec![vec![1, 2, 3]]).unwrap();
        let set = provider.active_secrets().await.unwrap();
        assert_eq!(set.as_slice(), &[vec![1, 2, 3]]);
    }

    #[test]
    fn test_static_rejects_empty() {
        assert!(matches!(StaticSecrets::new(vec![]), Err(SecretError::Empty)));
    }

    #[test]
    fn test_parse_skips_comments_and_blanks() {
        let content = "# tenants\n\ndeadbeef\n  00ff  \n";
        let secrets = FileRegistry::parse("registry", content).unwrap();
        assert_eq!(secrets, vec![vec![0xDE, 0xAD, 0xBE, 0xEF], vec![0x00, 0xFF]]);
    }

    #[test]
    fn test_parse_reports_bad_line() {
        let err = FileRegistry::parse("registry", "deadbeef\nnot-hex\n").unwrap_err();
        assert!(matches!(err, SecretError::BadEntry { line: 2, .. }));
    }

    #[tokio::test]
    async fn test_registry_serves_last_good_set() {
        let dir = std::env::temp_dir().join(format!("veilgate-secrets-{}", std::process::id()));
        tokio::fs::create_dir_all(&dir).await.unwrap();
        let path = dir.join("registry");

        tokio::fs::write(&path, "deadbeef\n").await.unwrap();
        let registry = FileRegistry::new(path.clone());
        let first = registry.active_secrets().await.unwrap();
        assert_eq!(first.as_slice(), &[vec![0xDE, 0xAD, 0xBE, 0xEF]]);

        // The file goes away; the cached set keeps serving.
        tokio::fs::remove_file(&path).await.unwrap();
        let second = registry.active_secrets().await.unwrap();
        assert_eq!(second.as_slice(), first.as_slice());

        tokio::fs::remove_dir_all(&dir).await.unwrap();
    }

    #[tokio::test]
    async fn test_registry_errors_without_prior_set() {
        let registry = FileRegistry::new(PathBuf::from("/nonexistent/veilgate-registry"));
        let err = registry.active_secrets().await.unwrap_err();
        assert!(matches!(err, SecretError::Unavailable { .. }));
    }
}
