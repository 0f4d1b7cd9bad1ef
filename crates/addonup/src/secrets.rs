//! Generated secrets that persist across restarts.

use std::io;
use std::path::Path;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use rand::RngCore;

/// A fresh URL-safe random token: 32 bytes of OS randomness, base64url
/// without padding.
pub fn token_urlsafe() -> String {
    let mut bytes = [0u8; 32];
    rand::rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Read the secret stored at `path`, generating and persisting one on first
/// run. Trailing whitespace is stripped on read so the file can be edited by
/// hand.
pub fn ensure_secret_file(path: &Path) -> io::Result<String> {
    if path.exists() {
        let secret = std::fs::read_to_string(path)?;
        return Ok(secret.trim_end().to_string());
    }

    let secret = token_urlsafe();
    std::fs::write(path, &secret)?;
    Ok(secret)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_urlsafe_shape() {
        let token = token_urlsafe();
        // 32 bytes base64url unpadded is 43 chars
        assert_eq!(token.len(), 43);
        assert!(
            token
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        );
        assert_ne!(token, token_urlsafe());
    }

    #[test]
    fn test_ensure_secret_file_reuses() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let path = temp_dir.path().join("secret");

        let first = ensure_secret_file(&path).unwrap();
        let second = ensure_secret_file(&path).unwrap();
        assert_eq!(first, second);
        assert_eq!(std::fs::read_to_string(&path).unwrap(), first);
    }
}
