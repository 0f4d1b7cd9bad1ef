//! Cypht webmail launcher.
//!
//! Cypht reads `CYPHT_*` env vars directly, so the translation is a prefix
//! filter over the options plus the database URL expansion.

use std::collections::BTreeMap;
use std::path::Path;

use addonup_config::Options;
use tokio::process::Command;
use tracing::info;

use crate::dburl;
use crate::dburl::CYPHT_DB_KEYS;
use crate::supervisor;

pub const DATA_DIR: &str = "/data/hm3";
pub const ENTRYPOINT: &str = "docker-entrypoint.sh";
pub const DEFAULT_COMMAND: &str = "php-fpm";

/// `CYPHT_*` options as the entrypoint env, with empties dropped first and
/// `CYPHT_DB_URL` expanded into its component vars.
pub fn build_env(options: &Options) -> anyhow::Result<BTreeMap<String, String>> {
    let mut options = options.clone();
    // Remove empty variables to let the defaults happen rather than
    // treating them as empty strings
    options.prune_empty();

    let mut env = options.env_with_prefix("CYPHT_");
    if let Some(database_url) = env.remove("CYPHT_DB_URL") {
        env.extend(dburl::parse_db_url(&database_url)?.env(&CYPHT_DB_KEYS));
    }

    Ok(env)
}

pub async fn run(options: &Options, args: &[String]) -> anyhow::Result<()> {
    if !Path::new(DATA_DIR).exists() {
        std::fs::create_dir_all(DATA_DIR)?;
    }

    let env = build_env(options)?;
    info!("Starting cypht with env: {:?}", env);

    let mut command = Command::new(ENTRYPOINT);
    command.arg(args.first().map(String::as_str).unwrap_or(DEFAULT_COMMAND));
    command.args(args.iter().skip(1));
    command.envs(env);

    supervisor::check_call("cypht", &mut command).await?;
    Ok(())
}
