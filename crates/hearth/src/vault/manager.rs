//! Key provisioning
//!
//! The key is resolved once at startup, in order:
//!
//! 1. `vault.encryption_key` / `ENCRYPTION_KEY`, which must be valid
//! 2. containerized: `<data-dir>/.encryption_key` from an earlier run
//! 3. bare process: an `ENCRYPTION_KEY=` entry in the local env file
//! 4. a freshly generated key, persisted to the target of 2 or 3
//!
//! Persisting never replaces an existing key. A failed write is logged but
//! does not stop the process; the key then lives only in memory.

use std::fmt;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use super::codec::EncryptionCodec;
use super::key::EncryptionKey;
use crate::config::VaultConfig;
use crate::error::{HearthError, Result};

const ENV_ENTRY: &str = "ENCRYPTION_KEY";

/// Where the active key came from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeySource {
    /// Configuration file or process environment
    Configured,
    /// Key file in the persistent-data directory
    KeyFile(PathBuf),
    /// Entry in the local environment file
    EnvFile(PathBuf),
    /// Generated this run; `persisted_to` is None if the write failed or was skipped
    Generated { persisted_to: Option<PathBuf> },
}

impl fmt::Display for KeySource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeySource::Configured => write!(f, "configured"),
            KeySource::KeyFile(path) => write!(f, "key file {}", path.display()),
            KeySource::EnvFile(path) => write!(f, "env file {}", path.display()),
            KeySource::Generated {
                persisted_to: Some(path),
            } => write!(f, "generated, saved to {}", path.display()),
            KeySource::Generated { persisted_to: None } => {
                write!(f, "generated, NOT persisted")
            }
        }
    }
}

/// Owner of the process key
#[derive(Debug, Clone)]
pub struct KeyManager {
    key: Arc<EncryptionKey>,
    source: KeySource,
    strict: bool,
}

impl KeyManager {
    pub fn resolve(config: &VaultConfig) -> Result<Self> {
        let (key, source) = resolve_key(config)?;
        tracing::info!(source = %source, container = config.is_container(), "Encryption key ready");
        Ok(Self {
            key: Arc::new(key),
            source,
            strict: config.strict_decrypt,
        })
    }

    /// Look up an existing key without generating one
    pub fn existing(config: &VaultConfig) -> Result<Option<Self>> {
        Ok(find_key(config)?.map(|(key, source)| Self {
            key: Arc::new(key),
            source,
            strict: config.strict_decrypt,
        }))
    }

    /// Wrap an already known key
    pub fn from_key(key: EncryptionKey, strict: bool) -> Self {
        Self {
            key: Arc::new(key),
            source: KeySource::Configured,
            strict,
        }
    }

    pub fn source(&self) -> &KeySource {
        &self.source
    }

    /// Codec borrowing this manager's key
    pub fn codec(&self) -> EncryptionCodec {
        EncryptionCodec::new(Arc::clone(&self.key)).strict(self.strict)
    }
}

fn resolve_key(config: &VaultConfig) -> Result<(EncryptionKey, KeySource)> {
    if let Some(found) = find_key(config)? {
        return Ok(found);
    }

    let key = EncryptionKey::generate();
    let persisted_to = if config.is_container() {
        persist_to_key_file(&config.key_file(), &key)
    } else {
        persist_to_env_file(&config.env_file, &key)
    };
    Ok((key, KeySource::Generated { persisted_to }))
}

/// Steps 1-3 of the resolution order; never writes anything
fn find_key(config: &VaultConfig) -> Result<Option<(EncryptionKey, KeySource)>> {
    if let Some(explicit) = &config.encryption_key {
        return Ok(Some((EncryptionKey::from_hex(explicit)?, KeySource::Configured)));
    }

    if config.is_container() {
        let path = config.key_file();
        return match read_key_file(&path) {
            Ok(Some(key)) => Ok(Some((key, KeySource::KeyFile(path)))),
            Ok(None) => Ok(None),
            Err(e) => {
                // The file stays untouched; a generated key cannot replace it.
                tracing::error!(
                    path = %path.display(),
                    error = %e,
                    "Existing key file is unusable; records encrypted under it cannot be read this run"
                );
                Ok(None)
            }
        };
    }

    let env_file = &config.env_file;
    let Some(value) = read_env_entry(env_file)? else {
        return Ok(None);
    };
    let key = EncryptionKey::from_hex(&value).map_err(|e| match e {
        HearthError::InvalidKeyFormat(msg) => {
            HearthError::InvalidKeyFormat(format!("{ENV_ENTRY} in {}: {msg}", env_file.display()))
        }
        other => other,
    })?;
    Ok(Some((key, KeySource::EnvFile(env_file.clone()))))
}

fn read_key_file(path: &Path) -> Result<Option<EncryptionKey>> {
    match fs::read_to_string(path) {
        Ok(content) => EncryptionKey::from_hex(&content).map(Some),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn persist_to_key_file(path: &Path, key: &EncryptionKey) -> Option<PathBuf> {
    match write_key_file(path, key) {
        Ok(()) => {
            tracing::info!(path = %path.display(), "Generated encryption key saved");
            Some(path.to_path_buf())
        }
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
            tracing::warn!(path = %path.display(), "Key file already exists, not overwriting it");
            None
        }
        Err(e) => {
            tracing::error!(
                path = %path.display(),
                error = %e,
                "Failed to save generated encryption key; data written this run will be unreadable after a restart"
            );
            None
        }
    }
}

fn write_key_file(path: &Path, key: &EncryptionKey) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let mut options = OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }

    let mut file = options.open(path)?;
    file.write_all(key.to_hex().as_bytes())?;
    file.sync_all()
}

/// Value of the key entry in an env file; None if the file or entry is absent
fn read_env_entry(path: &Path) -> Result<Option<String>> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    Ok(find_env_entry(&content)
        .filter(|value| !value.is_empty())
        .map(str::to_string))
}

fn find_env_entry(content: &str) -> Option<&str> {
    content.lines().find_map(|line| {
        let line = line.trim();
        let line = line.strip_prefix("export ").unwrap_or(line);
        let (name, value) = line.split_once('=')?;
        if name.trim() != ENV_ENTRY {
            return None;
        }
        Some(value.trim().trim_matches(|c| c == '"' || c == '\''))
    })
}

fn persist_to_env_file(path: &Path, key: &EncryptionKey) -> Option<PathBuf> {
    match append_env_entry(path, key) {
        Ok(true) => {
            tracing::info!(path = %path.display(), "Generated encryption key appended to env file");
            Some(path.to_path_buf())
        }
        Ok(false) => {
            tracing::warn!(
                path = %path.display(),
                "{ENV_ENTRY} entry already present, not overwriting it"
            );
            None
        }
        Err(e) => {
            tracing::error!(
                path = %path.display(),
                error = %e,
                "Failed to save generated encryption key; data written this run will be unreadable after a restart"
            );
            None
        }
    }
}

/// Append the key entry; Ok(false) if one exists already
fn append_env_entry(path: &Path, key: &EncryptionKey) -> std::io::Result<bool> {
    let existing = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
        Err(e) => return Err(e),
    };
    if find_env_entry(&existing).is_some() {
        return Ok(false);
    }

    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    let separator = if existing.is_empty() || existing.ends_with('\n') {
        ""
    } else {
        "\n"
    };
    writeln!(file, "{separator}{ENV_ENTRY}={}", key.to_hex())?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn bare_config(dir: &TempDir) -> VaultConfig {
        VaultConfig {
            container_mode: Some(false),
            data_dir: dir.path().join("data"),
            env_file: dir.path().join(".env.local"),
            encryption_key: None,
            strict_decrypt: false,
        }
    }

    fn container_config(dir: &TempDir) -> VaultConfig {
        VaultConfig {
            container_mode: Some(true),
            ..bare_config(dir)
        }
    }

    #[test]
    fn test_explicit_key_wins() {
        let dir = TempDir::new().unwrap();
        let mut config = container_config(&dir);
        config.encryption_key = Some("cd".repeat(32));

        let manager = KeyManager::resolve(&config).unwrap();
        assert_eq!(manager.source(), &KeySource::Configured);
        assert!(!config.key_file().exists());
    }

    #[test]
    fn test_explicit_63_char_key_fails_fast() {
        let dir = TempDir::new().unwrap();
        let mut config = bare_config(&dir);
        config.encryption_key = Some("a".repeat(63));

        let err = KeyManager::resolve(&config).unwrap_err();
        assert!(matches!(err, HearthError::InvalidKeyFormat(_)));
        assert!(!config.env_file.exists());
    }

    #[test]
    fn test_existing_does_not_generate() {
        let dir = TempDir::new().unwrap();
        let config = bare_config(&dir);
        assert!(KeyManager::existing(&config).unwrap().is_none());
        assert!(!config.env_file.exists());
    }

    #[test]
    fn test_find_env_entry_variants() {
        assert_eq!(find_env_entry("ENCRYPTION_KEY=abc"), Some("abc"));
        assert_eq!(find_env_entry("# c\nexport ENCRYPTION_KEY=\"abc\"\n"), Some("abc"));
        assert_eq!(find_env_entry("OTHER=1\nENCRYPTION_KEY = 'x'"), Some("x"));
        assert_eq!(find_env_entry("ENCRYPTION_KEYS=abc"), None);
        assert_eq!(find_env_entry(""), None);
    }

    #[test]
    fn test_append_keeps_existing_content() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(".env.local");
        fs::write(&path, "PORT=3000").unwrap();

        let key = EncryptionKey::generate();
        assert!(append_env_entry(&path, &key).unwrap());
        let content = fs::read_to_string(&path).unwrap();
        assert_eq!(content, format!("PORT=3000\nENCRYPTION_KEY={}\n", key.to_hex()));

        assert!(!append_env_entry(&path, &EncryptionKey::generate()).unwrap());
        assert_eq!(fs::read_to_string(&path).unwrap(), content);
    }

    #[cfg(unix)]
    #[test]
    fn test_key_file_is_private() {
        use std::os::unix::fs::PermissionsExt;

        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join(".encryption_key");
        write_key_file(&path, &EncryptionKey::generate()).unwrap();
        let mode = fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn test_key_file_never_overwritten() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(".encryption_key");
        fs::write(&path, "keep me").unwrap();

        assert!(persist_to_key_file(&path, &EncryptionKey::generate()).is_none());
        assert_eq!(fs::read_to_string(&path).unwrap(), "keep me");
    }

    #[test]
    fn test_source_display() {
        assert_eq!(KeySource::Configured.to_string(), "configured");
        assert_eq!(
            KeySource::Generated { persisted_to: None }.to_string(),
            "generated, NOT persisted"
        );
    }
}
