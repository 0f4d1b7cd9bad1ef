//! SnappyMail webmail configuration for the combined bridge add-ons.
//!
//! The upstream image is configured through env vars plus an
//! `application.ini` that must carry the admin credentials before its
//! entrypoint runs, so the admin password hash is synced here rather than
//! left to the image.

use std::collections::BTreeMap;
use std::io;
use std::path::Path;
use std::path::PathBuf;

use addonup_config::Diagnostics;
use addonup_config::Options;
use ini::Ini;
use thiserror::Error;
use tracing::info;

pub const CONFIG_DIR: &str = "/data/snappymail_data_";
pub const CONFIG_TEMPLATE: &str = "/usr/local/include/application.ini";
pub const DATA_LINK: &str = "/snappymail/data/_data_";
pub const ENTRYPOINT: &str = "/entrypoint.sh";

/// The application.ini inside the persistent config dir.
pub fn app_config_path(config_dir: &Path) -> PathBuf {
    config_dir.join("_default_").join("configs").join("application.ini")
}

#[derive(Debug, Error)]
pub enum SnappymailError {
    #[error("application.ini: {0}")]
    Ini(#[from] ini::Error),

    #[error("application.ini: {0}")]
    Io(#[from] io::Error),

    #[error("failed to hash admin password: {0}")]
    Bcrypt(#[from] bcrypt::BcryptError),
}

#[derive(Debug, Clone)]
pub struct SnappymailConfig {
    pub admin_username: String,
    pub admin_password: String,
    pub upload_max_size: String,
    pub memory_limit: String,
}

impl SnappymailConfig {
    /// Nested `snappymail` section.
    pub fn from_section(section: &Options) -> Result<Self, Diagnostics> {
        let mut scope = section.scope();
        let admin_username = scope.require_str("admin_username");
        let admin_password = scope.require_str("admin_password");
        let upload_max_size = scope.str_or("UPLOAD_MAX_SIZE", "25M");
        let memory_limit = scope.str_or("MEMORY_LIMIT", "128M");
        scope.finish()?;

        Ok(Self {
            admin_username,
            admin_password,
            upload_max_size,
            memory_limit,
        })
    }

    /// Env map for the upstream entrypoint. Values must all be strings, the
    /// entrypoint does not cope with anything else.
    pub fn env_map(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            // Always log to stderr, there is no point making this an option
            ("LOG_TO_STDERR".to_string(), "true".to_string()),
            ("SECURE_COOKIES".to_string(), "true".to_string()),
            ("UPLOAD_MAX_SIZE".to_string(), self.upload_max_size.clone()),
            ("MEMORY_LIMIT".to_string(), self.memory_limit.clone()),
            // The entrypoint insists on these even though we never switch user
            ("UID".to_string(), "991".to_string()),
            ("GID".to_string(), "991".to_string()),
        ])
    }
}

/// Seed application.ini from the packaged template on first run. Returns
/// true when the file was created.
pub fn seed_app_config(app_config: &Path, template: &Path) -> io::Result<bool> {
    if app_config.exists() {
        return Ok(false);
    }

    if let Some(parent) = app_config.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::copy(template, app_config)?;
    Ok(true)
}

/// Symlink the image's data directory onto the persistent config dir.
pub fn link_data_dir(link: &Path, target: &Path) -> io::Result<()> {
    if link.exists() || link.is_symlink() {
        return Ok(());
    }
    std::os::unix::fs::symlink(target, link)
}

/// Keep the `[security]` admin credentials in application.ini in sync with
/// the options, rewriting the file only when they differ. Returns true when
/// the file was rewritten.
pub fn sync_admin_credentials(
    app_config: &Path,
    username: &str,
    password: &str,
) -> Result<bool, SnappymailError> {
    let mut conf = Ini::load_from_file(app_config)?;

    let current_username = conf
        .get_from(Some("security"), "admin_username")
        .unwrap_or("")
        .trim_matches('"')
        .to_string();
    let current_hash = conf
        .get_from(Some("security"), "admin_password")
        .unwrap_or("")
        .trim_matches('"')
        .to_string();

    if current_username == username
        && !current_hash.is_empty()
        && bcrypt::verify(password, &current_hash).unwrap_or(false)
    {
        // Configured file already good, carry on
        return Ok(false);
    }

    let hash = bcrypt::hash(password, bcrypt::DEFAULT_COST)?;
    conf.with_section(Some("security"))
        .set("admin_password", format!("\"{}\"", hash))
        .set("admin_username", format!("\"{}\"", username));
    conf.write_to_file(app_config)?;
    info!("Updated SnappyMail admin credentials");
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> SnappymailConfig {
        SnappymailConfig {
            admin_username: "admin".to_string(),
            admin_password: "hunter2".to_string(),
            upload_max_size: "25M".to_string(),
            memory_limit: "128M".to_string(),
        }
    }

    #[test]
    fn test_env_map() {
        let env = config().env_map();
        assert_eq!(env.get("LOG_TO_STDERR").map(String::as_str), Some("true"));
        assert_eq!(env.get("UPLOAD_MAX_SIZE").map(String::as_str), Some("25M"));
        assert_eq!(env.get("UID").map(String::as_str), Some("991"));
        assert_eq!(env.len(), 6);
    }

    #[test]
    fn test_seed_app_config() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let template = temp_dir.path().join("template.ini");
        std::fs::write(&template, "[webmail]\ntitle = \"SnappyMail\"\n").unwrap();

        let app_config = app_config_path(&temp_dir.path().join("data"));
        assert!(seed_app_config(&app_config, &template).unwrap());
        assert!(app_config.exists());
        // Second run leaves the existing file alone
        assert!(!seed_app_config(&app_config, &template).unwrap());
    }

    #[test]
    fn test_sync_admin_credentials() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let app_config = temp_dir.path().join("application.ini");
        std::fs::write(&app_config, "[webmail]\ntitle = \"SnappyMail\"\n").unwrap();

        // First sync writes a hash
        assert!(sync_admin_credentials(&app_config, "admin", "hunter2").unwrap());

        let conf = Ini::load_from_file(&app_config).unwrap();
        let hash = conf
            .get_from(Some("security"), "admin_password")
            .unwrap()
            .trim_matches('"')
            .to_string();
        assert!(bcrypt::verify("hunter2", &hash).unwrap());

        // Matching credentials leave the file untouched
        assert!(!sync_admin_credentials(&app_config, "admin", "hunter2").unwrap());

        // A changed password rewrites the hash
        assert!(sync_admin_credentials(&app_config, "admin", "changed").unwrap());
    }

    #[test]
    fn test_from_section_defaults() {
        let options = Options::from_json(
            "/data/options.json",
            r#"{"snappymail": {"admin_username": "admin", "admin_password": "pw"}}"#,
        )
        .unwrap();

        let config =
            SnappymailConfig::from_section(&options.section("snappymail").unwrap()).unwrap();
        assert_eq!(config.upload_max_size, "25M");
        assert_eq!(config.memory_limit, "128M");
    }
}
