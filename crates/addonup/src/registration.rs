//! Appservice registration files.
//!
//! A registration is the YAML credential file exchanged between a Matrix
//! homeserver and a bridge. It is generated exactly once by the bridge's own
//! tooling and then reused for every later start; losing or regenerating it
//! invalidates the tokens the homeserver already knows. Bridges differ in
//! where the authoritative copy lives, so the shared registrations directory
//! supports both publishing a fresh registration and restoring one into a
//! rebuilt data directory.

use std::io;
use std::path::Path;
use std::path::PathBuf;

use thiserror::Error;
use tokio::process::Command;
use tracing::info;

use crate::supervisor;
use crate::supervisor::SupervisorError;

/// Where bridge add-ons and the homeserver add-on exchange registrations.
pub const REGISTRATIONS_DIR: &str = "/share/matrix_appservices";

/// Stand-in token value used before the registration has been generated.
const TOKEN_PLACEHOLDER: &str = "This value is generated when generating the registration";

#[derive(Debug, Error)]
pub enum RegistrationError {
    #[error("registration file {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("registration file {} is not valid YAML: {source}", path.display())]
    Yaml {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("registration file {} is not a YAML mapping", path.display())]
    NotAMapping { path: PathBuf },

    #[error("registration file {} has no '{key}' entry", path.display())]
    MissingToken { path: PathBuf, key: String },

    #[error("could not determine hostname: {0}")]
    Hostname(#[source] io::Error),

    #[error(transparent)]
    Generate(#[from] SupervisorError),
}

/// The credentials a bridge config needs from its registration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppserviceTokens {
    pub as_token: String,
    pub hs_token: String,
}

/// A path-addressed appservice registration YAML file
#[derive(Debug, Clone)]
pub struct Registration {
    path: PathBuf,
}

impl Registration {
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// The hostname-derived registration path used by bridges that key their
    /// registration on the add-on's hostname: `<dir>/<hostname>.yaml`.
    pub fn for_hostname(dir: impl AsRef<Path>) -> Result<Self, RegistrationError> {
        let host = hostname::get().map_err(RegistrationError::Hostname)?;
        Ok(Self::at(
            dir.as_ref()
                .join(format!("{}.yaml", host.to_string_lossy())),
        ))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    fn load(&self) -> Result<serde_yaml::Mapping, RegistrationError> {
        let text = std::fs::read_to_string(&self.path).map_err(|source| RegistrationError::Io {
            path: self.path.clone(),
            source,
        })?;
        let value: serde_yaml::Value =
            serde_yaml::from_str(&text).map_err(|source| RegistrationError::Yaml {
                path: self.path.clone(),
                source,
            })?;
        match value {
            serde_yaml::Value::Mapping(mapping) => Ok(mapping),
            _ => Err(RegistrationError::NotAMapping {
                path: self.path.clone(),
            }),
        }
    }

    fn store(&self, mapping: &serde_yaml::Mapping) -> Result<(), RegistrationError> {
        let text = serde_yaml::to_string(mapping).map_err(|source| RegistrationError::Yaml {
            path: self.path.clone(),
            source,
        })?;
        std::fs::write(&self.path, text).map_err(|source| RegistrationError::Io {
            path: self.path.clone(),
            source,
        })
    }

    /// Run the bridge's own registration generator, then patch the `url` key
    /// so the homeserver reaches the bridge at its add-on address rather
    /// than whatever the generator guessed.
    pub async fn generate_with(
        &self,
        name: &str,
        command: &mut Command,
        own_url: &str,
    ) -> Result<(), RegistrationError> {
        supervisor::check_call(name, command).await?;
        self.set_url(own_url)?;
        info!("Patched registration url to {}", own_url);
        Ok(())
    }

    /// Rewrite the registration's `url` entry.
    pub fn set_url(&self, own_url: &str) -> Result<(), RegistrationError> {
        let mut mapping = self.load()?;
        mapping.insert(
            serde_yaml::Value::from("url"),
            serde_yaml::Value::from(own_url),
        );
        self.store(&mapping)
    }

    /// The `as_token`/`hs_token` pair for splicing into a bridge config.
    /// Before the registration exists, both are placeholder strings so the
    /// rendered config is syntactically complete on the generation run.
    pub fn tokens(&self) -> Result<AppserviceTokens, RegistrationError> {
        if !self.exists() {
            return Ok(AppserviceTokens {
                as_token: TOKEN_PLACEHOLDER.to_string(),
                hs_token: TOKEN_PLACEHOLDER.to_string(),
            });
        }

        let mapping = self.load()?;
        let token = |key: &str| -> Result<String, RegistrationError> {
            mapping
                .get(key)
                .and_then(|v| v.as_str())
                .map(str::to_string)
                .ok_or_else(|| RegistrationError::MissingToken {
                    path: self.path.clone(),
                    key: key.to_string(),
                })
        };

        Ok(AppserviceTokens {
            as_token: token("as_token")?,
            hs_token: token("hs_token")?,
        })
    }

    /// Copy this registration into the shared registrations directory under
    /// `name`, creating the directory on first use.
    pub fn publish(&self, dir: impl AsRef<Path>, name: &str) -> Result<PathBuf, RegistrationError> {
        let dir = dir.as_ref();
        if !dir.is_dir() {
            std::fs::create_dir_all(dir).map_err(|source| RegistrationError::Io {
                path: dir.to_path_buf(),
                source,
            })?;
        }

        let target = dir.join(name);
        std::fs::copy(&self.path, &target).map_err(|source| RegistrationError::Io {
            path: target.clone(),
            source,
        })?;
        info!("Published registration to {}", target.display());
        Ok(target)
    }

    /// Copy a previously shared registration back into place, so the add-on
    /// data directory can be rebuilt without resyncing tokens.
    pub fn restore_from(&self, shared: impl AsRef<Path>) -> Result<(), RegistrationError> {
        std::fs::copy(shared.as_ref(), &self.path).map_err(|source| RegistrationError::Io {
            path: self.path.clone(),
            source,
        })?;
        info!(
            "Restored registration from {}",
            shared.as_ref().display()
        );
        Ok(())
    }
}

/// Printed after generating a registration; the operator has to register it
/// with the homeserver before the bridge can actually start.
pub fn print_registration_notice() {
    eprintln!(
        "Appservice registration yaml generated, go sort out registration before restarting this addon."
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_url_patches_in_place() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let path = temp_dir.path().join("reg.yaml");
        std::fs::write(
            &path,
            "id: heisenbridge\nas_token: aaa\nhs_token: bbb\nurl: http://guessed:9898\n",
        )
        .unwrap();

        let registration = Registration::at(&path);
        registration.set_url("http://addon.local:9898").unwrap();

        let reloaded: serde_yaml::Mapping =
            serde_yaml::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(
            reloaded.get("url").and_then(|v| v.as_str()),
            Some("http://addon.local:9898")
        );
        // The rest of the document survives the rewrite
        assert_eq!(
            reloaded.get("as_token").and_then(|v| v.as_str()),
            Some("aaa")
        );
    }

    #[test]
    fn test_tokens_placeholder_before_generation() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let registration = Registration::at(temp_dir.path().join("missing.yaml"));

        let tokens = registration.tokens().unwrap();
        assert_eq!(tokens.as_token, TOKEN_PLACEHOLDER);
        assert_eq!(tokens.hs_token, TOKEN_PLACEHOLDER);
    }

    #[test]
    fn test_tokens_from_registration() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let path = temp_dir.path().join("reg.yaml");
        std::fs::write(&path, "as_token: abc\nhs_token: def\n").unwrap();

        let tokens = Registration::at(&path).tokens().unwrap();
        assert_eq!(
            tokens,
            AppserviceTokens {
                as_token: "abc".to_string(),
                hs_token: "def".to_string(),
            }
        );
    }

    #[test]
    fn test_tokens_missing_key() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let path = temp_dir.path().join("reg.yaml");
        std::fs::write(&path, "as_token: abc\n").unwrap();

        let err = Registration::at(&path).tokens().unwrap_err();
        assert!(matches!(err, RegistrationError::MissingToken { key, .. } if key == "hs_token"));
    }

    #[test]
    fn test_publish_and_restore() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let local = temp_dir.path().join("data").join("registration.yaml");
        std::fs::create_dir_all(local.parent().unwrap()).unwrap();
        std::fs::write(&local, "as_token: abc\nhs_token: def\n").unwrap();

        let shared_dir = temp_dir.path().join("share");
        let registration = Registration::at(&local);
        let shared = registration
            .publish(&shared_dir, "mautrix-meta.yaml")
            .unwrap();
        assert!(shared.exists());

        std::fs::remove_file(&local).unwrap();
        registration.restore_from(&shared).unwrap();
        assert_eq!(
            std::fs::read_to_string(&local).unwrap(),
            "as_token: abc\nhs_token: def\n"
        );
    }
}
