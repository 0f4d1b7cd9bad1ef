//! Roundcube webmail launcher.
//!
//! The upstream image is configured entirely through env vars; the add-on
//! schema exposes them as a `roundcube` options section plus one database
//! URL that expands into the individual `ROUNDCUBEMAIL_DB_*` vars.

use std::collections::BTreeMap;
use std::path::Path;

use addonup_config::Options;
use tokio::process::Command;
use tracing::info;

use crate::dburl;
use crate::dburl::ROUNDCUBE_DB_KEYS;
use crate::supervisor;

// Some Roundcube directories are symlinked into /data, and Roundcube
// expects them to exist before it starts.
pub const CONFIG_DIR: &str = "/data/config";
pub const DB_DIR: &str = "/data/db";
pub const ENTRYPOINT: &str = "/docker-entrypoint.sh";
pub const DEFAULT_COMMAND: &str = "apache2-foreground";

/// The env map for the entrypoint: every scalar in the `roundcube` section,
/// with `database_url` expanded and empty values dropped so upstream
/// defaults apply.
pub fn build_env(options: &Options) -> anyhow::Result<BTreeMap<String, String>> {
    let mut scope = options.scope();
    let section = scope.require_section("roundcube");
    scope.finish()?;

    let mut env = section.env_map();
    if let Some(database_url) = section.lookup_str("database_url").filter(|u| !u.is_empty()) {
        env.extend(dburl::parse_db_url(&database_url)?.env(&ROUNDCUBE_DB_KEYS));
    }

    // Remove empty variables so that the defaults happen rather than being
    // treated as empty strings
    env.retain(|_, value| !value.is_empty());
    Ok(env)
}

pub async fn run(options: &Options, args: &[String]) -> anyhow::Result<()> {
    for dir in [DB_DIR, CONFIG_DIR] {
        if !Path::new(dir).exists() {
            std::fs::create_dir_all(dir)?;
        }
    }

    let env = build_env(options)?;

    let mut command = Command::new(ENTRYPOINT);
    command.arg(args.first().map(String::as_str).unwrap_or(DEFAULT_COMMAND));
    command.args(args.iter().skip(1));
    command.envs(env);

    info!(
        "Starting Roundcube with command: {}",
        supervisor::command_line(&command)
    );
    supervisor::check_call("roundcube", &mut command).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_env_expands_database_url() {
        let options = Options::from_json(
            "/data/options.json",
            r#"{"roundcube": {
                "ROUNDCUBEMAIL_DEFAULT_HOST": "ssl://imap.example.com",
                "ROUNDCUBEMAIL_SMTP_SERVER": "",
                "database_url": "postgres://rc:pw@db:5432/roundcube"
            }}"#,
        )
        .unwrap();

        let env = build_env(&options).unwrap();
        assert_eq!(
            env.get("ROUNDCUBEMAIL_DEFAULT_HOST").map(String::as_str),
            Some("ssl://imap.example.com")
        );
        assert_eq!(
            env.get("ROUNDCUBEMAIL_DB_TYPE").map(String::as_str),
            Some("pgsql")
        );
        assert_eq!(
            env.get("ROUNDCUBEMAIL_DB_PASSWORD").map(String::as_str),
            Some("pw")
        );
        // Empty values dropped so upstream defaults apply
        assert!(!env.contains_key("ROUNDCUBEMAIL_SMTP_SERVER"));
        // The URL itself is harmless and rides along like every other scalar
        assert!(env.contains_key("database_url"));
    }

    #[test]
    fn test_build_env_without_database_url() {
        let options = Options::from_json(
            "/data/options.json",
            r#"{"roundcube": {"database_url": ""}}"#,
        )
        .unwrap();

        let env = build_env(&options).unwrap();
        assert!(env.is_empty());
    }

    #[test]
    fn test_build_env_requires_section() {
        let options = Options::from_json("/data/options.json", r#"{}"#).unwrap();
        assert!(build_env(&options).is_err());
    }
}
