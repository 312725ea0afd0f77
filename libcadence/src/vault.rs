//! Credential vault
//!
//! Account credentials are stored sealed. The vault is the only component
//! that sees them in the clear, and only the token broker calls it.
//!
//! [`AgeVault`] encrypts to an age x25519 recipient. Its identity lives in a
//! key file that is created on first use with owner-only permissions.

use std::io::{Read, Write};
use std::path::Path;
use std::str::FromStr;

use age::secrecy::ExposeSecret as _;
use secrecy::SecretString;
use zeroize::Zeroizing;

use crate::error::{CredentialError, Result};

/// Seal and open opaque secrets
pub trait Vault: Send + Sync {
    fn seal(&self, plaintext: &str) -> Result<Vec<u8>>;

    fn open(&self, sealed: &[u8]) -> Result<SecretString>;
}

pub struct AgeVault {
    identity: age::x25519::Identity,
    recipient: age::x25519::Recipient,
}

impl AgeVault {
    /// A vault with a fresh, unpersisted identity
    pub fn generate() -> Self {
        Self::from_identity(age::x25519::Identity::generate())
    }

    fn from_identity(identity: age::x25519::Identity) -> Self {
        let recipient = identity.to_public();
        Self {
            identity,
            recipient,
        }
    }

    /// Parse an `AGE-SECRET-KEY-1...` identity; `#` comment lines are ignored
    pub fn from_identity_str(contents: &str) -> Result<Self> {
        let line = contents
            .lines()
            .map(str::trim)
            .find(|line| !line.is_empty() && !line.starts_with('#'))
            .ok_or_else(|| CredentialError::Key("identity file is empty".to_string()))?;

        let identity = age::x25519::Identity::from_str(line)
            .map_err(|e| CredentialError::Key(e.to_string()))?;
        Ok(Self::from_identity(identity))
    }

    /// Read the identity at `path`, or create one there if it does not exist
    pub fn load_or_create(path: &Path) -> Result<Self> {
        if std::fs::symlink_metadata(path).is_ok() {
            validate_not_symlink(path)?;
            let contents = Zeroizing::new(
                std::fs::read_to_string(path)
                    .map_err(|e| CredentialError::Key(format!("{}: {}", path.display(), e)))?,
            );
            tracing::debug!(path = %path.display(), "loaded vault identity");
            return Self::from_identity_str(&contents);
        }

        let vault = Self::generate();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| CredentialError::Key(format!("{}: {}", parent.display(), e)))?;
        }

        let encoded = vault.identity.to_string();
        let contents = Zeroizing::new(format!(
            "# cadence vault identity\n# public key: {}\n{}\n",
            vault.recipient,
            encoded.expose_secret()
        ));
        std::fs::write(path, contents.as_bytes())
            .map_err(|e| CredentialError::Key(format!("{}: {}", path.display(), e)))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
                .map_err(|e| CredentialError::Key(format!("{}: {}", path.display(), e)))?;
        }

        tracing::info!(path = %path.display(), "created vault identity");
        Ok(vault)
    }
}

impl Vault for AgeVault {
    fn seal(&self, plaintext: &str) -> Result<Vec<u8>> {
        let recipients: Vec<Box<dyn age::Recipient + Send>> = vec![Box::new(self.recipient.clone())];
        let encryptor = age::Encryptor::with_recipients(recipients)
            .ok_or_else(|| CredentialError::Seal("no recipients".to_string()))?;

        let mut sealed = vec![];
        let mut writer = encryptor
            .wrap_output(&mut sealed)
            .map_err(|e| CredentialError::Seal(e.to_string()))?;
        writer
            .write_all(plaintext.as_bytes())
            .map_err(|e| CredentialError::Seal(e.to_string()))?;
        writer
            .finish()
            .map_err(|e| CredentialError::Seal(e.to_string()))?;

        Ok(sealed)
    }

    fn open(&self, sealed: &[u8]) -> Result<SecretString> {
        let decryptor = match age::Decryptor::new(sealed) {
            Ok(age::Decryptor::Recipients(d)) => d,
            Ok(_) => {
                return Err(
                    CredentialError::Open("expected recipient encryption".to_string()).into(),
                )
            }
            Err(e) => return Err(CredentialError::Open(e.to_string()).into()),
        };

        let mut reader = decryptor
            .decrypt(std::iter::once(&self.identity as &dyn age::Identity))
            .map_err(|e| CredentialError::Open(e.to_string()))?;

        let mut plaintext = Zeroizing::new(Vec::new());
        reader
            .read_to_end(&mut plaintext)
            .map_err(|e| CredentialError::Open(e.to_string()))?;

        let text = std::str::from_utf8(&plaintext)
            .map_err(|e| CredentialError::Open(format!("invalid UTF-8: {}", e)))?;
        Ok(SecretString::from(text.to_string()))
    }
}

/// Refuse to read key material through a symbolic link
pub fn validate_not_symlink(path: &Path) -> Result<()> {
    let metadata = std::fs::symlink_metadata(path)
        .map_err(|e| CredentialError::Key(format!("{}: {}", path.display(), e)))?;

    if metadata.is_symlink() {
        return Err(CredentialError::Security(format!(
            "'{}' is a symbolic link; key files must be regular files",
            path.display()
        ))
        .into());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::ExposeSecret;
    use tempfile::TempDir;

    #[test]
    fn test_seal_open_round_trip() {
        let vault = AgeVault::generate();
        let sealed = vault.seal("access-token-123").unwrap();
        assert!(!sealed
            .windows(b"access-token-123".len())
            .any(|w| w == b"access-token-123"));

        let opened = vault.open(&sealed).unwrap();
        assert_eq!(opened.expose_secret(), "access-token-123");
    }

    #[test]
    fn test_open_with_wrong_identity_fails() {
        let sealed = AgeVault::generate().seal("secret").unwrap();
        let err = AgeVault::generate().open(&sealed).unwrap_err();
        assert!(matches!(
            err,
            crate::error::CadenceError::Credential(CredentialError::Open(_))
        ));
    }

    #[test]
    fn test_open_garbage_fails() {
        assert!(AgeVault::generate().open(b"not an age file").is_err());
    }

    #[test]
    fn test_load_or_create_persists_identity() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("keys").join("vault.key");

        let first = AgeVault::load_or_create(&path).unwrap();
        let sealed = first.seal("persisted").unwrap();

        let second = AgeVault::load_or_create(&path).unwrap();
        assert_eq!(second.open(&sealed).unwrap().expose_secret(), "persisted");

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }

    #[cfg(unix)]
    #[test]
    fn test_symlinked_identity_is_refused() {
        let dir = TempDir::new().unwrap();
        let real = dir.path().join("real.key");
        AgeVault::load_or_create(&real).unwrap();

        let link = dir.path().join("link.key");
        std::os::unix::fs::symlink(&real, &link).unwrap();

        let err = AgeVault::load_or_create(&link).err().unwrap();
        assert!(matches!(
            err,
            crate::error::CadenceError::Credential(CredentialError::Security(_))
        ));
    }

    #[test]
    fn test_identity_parse_rejects_empty() {
        assert!(AgeVault::from_identity_str("# only a comment\n").is_err());
        assert!(AgeVault::from_identity_str("AGE-SECRET-KEY-1NOPE").is_err());
    }
}
