//! Synapse homeserver launcher.
//!
//! The homeserver.yaml is rendered from a template option rather than
//! generated from env vars, so restarts are reproducible. The upstream
//! `generate` step still runs once for its side effects (log config and
//! signing keys), and the first run schedules a delayed admin-user
//! registration against the freshly started server.

use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;

use addonup_config::Diagnostics;
use addonup_config::Options;
use addonup_config::render;
use tokio::process::Command;
use tracing::info;
use tracing::warn;

use crate::secrets;
use crate::supervisor;

pub const HOMESERVER_YAML: &str = "/data/homeserver.yaml";
pub const START_SCRIPT: &str = "/start.py";

/// Secrets synapse needs that the user usually shouldn't have to invent
const GENERATED_SECRETS: [&str; 2] = ["registration_shared_secret", "macaroon_secret_key"];

/// How long to give synapse to come up before registering the default user
const REGISTRATION_DELAY: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct SynapseConfig {
    pub server_name: String,
    pub media_store_path: PathBuf,
    pub default_user: String,
    pub default_userpass: String,
}

impl SynapseConfig {
    pub fn from_options(options: &Options) -> Result<Self, Diagnostics> {
        let mut scope = options.scope();
        let server_name = scope.require_str("server_name");
        let media_store_path = PathBuf::from(scope.require_str("media_store_path"));
        let default_user = scope.require_str("default_user");
        let default_userpass = scope.require_str("default_userpass");
        // The template itself is validated separately at render time
        scope.require_str("homeserver.yaml");
        scope.finish()?;

        Ok(Self {
            server_name,
            media_store_path,
            default_user,
            default_userpass,
        })
    }

    /// Env vars the upstream scripts expect even though the config file is
    /// written by us.
    pub fn env_opts(&self) -> Vec<(String, String)> {
        vec![
            ("SYNAPSE_REPORT_STATS".to_string(), "no".to_string()),
            ("SYNAPSE_SERVER_NAME".to_string(), self.server_name.clone()),
        ]
    }
}

/// Backfill absent secret options with fresh tokens so the template can
/// reference them unconditionally.
pub fn fill_secrets(options: &mut Options) {
    for key in GENERATED_SECRETS {
        let present = options
            .lookup_str(key)
            .map(|v| !v.is_empty())
            .unwrap_or(false);
        if !present {
            options.set(key, serde_json::Value::from(secrets::token_urlsafe()));
        }
    }
}

/// Render the homeserver.yaml template option. Round-tripping through the
/// YAML parser is not strictly necessary but makes syntax errors obvious
/// before synapse trips over them.
pub fn render_homeserver_yaml(options: &Options) -> anyhow::Result<String> {
    let template = options
        .lookup_str("homeserver.yaml")
        .ok_or_else(|| anyhow::anyhow!("homeserver.yaml template option is missing"))?;

    let rendered = render(&template, options)?;
    let parsed: serde_yaml::Value = serde_yaml::from_str(&rendered)?;
    Ok(serde_yaml::to_string(&parsed)?)
}

fn registration_command(config: &SynapseConfig) -> Command {
    let mut command = Command::new("register_new_matrix_user");
    command.args([
        "--config",
        HOMESERVER_YAML,
        "--user",
        &config.default_user,
        "--password",
        &config.default_userpass,
        "--admin",
        "http://localhost:8008",
    ]);
    // If synapse never comes up we get aborted mid-flight; take the child
    // down with us.
    command.kill_on_drop(true);
    command
}

pub async fn run(options: &mut Options) -> anyhow::Result<()> {
    let config = SynapseConfig::from_options(options)?;

    fill_secrets(options);
    let homeserver_yaml = render_homeserver_yaml(options)?;

    let first_run = !Path::new(HOMESERVER_YAML).exists();
    let mut registration_helper = None;

    if first_run {
        info!("Homeserver.yaml doesn't exist, pregenerating configs");
        // Not for homeserver.yaml itself (we overwrite that below) but for
        // the other files the generate step produces, like log.config.
        let mut generate = Command::new("python3");
        generate.args([START_SCRIPT, "generate"]).envs(config.env_opts());
        supervisor::check_call("synapse generate", &mut generate).await?;

        let mut register = registration_command(&config);
        registration_helper = Some(tokio::spawn(async move {
            tokio::time::sleep(REGISTRATION_DELAY).await;
            match register.status().await {
                Ok(status) if status.success() => info!("Default user registered"),
                Ok(status) => warn!("register_new_matrix_user exited with {}", status),
                Err(e) => warn!("register_new_matrix_user failed to start: {}", e),
            }
        }));
    }

    if !config.media_store_path.is_dir() {
        std::fs::create_dir_all(&config.media_store_path)?;
        // 991 is the uid/gid synapse runs as by default
        nix::unistd::chown(
            &config.media_store_path,
            Some(nix::unistd::Uid::from_raw(991)),
            Some(nix::unistd::Gid::from_raw(991)),
        )?;
    }

    info!("Overwriting homeserver.yaml with custom config");
    std::fs::write(HOMESERVER_YAML, homeserver_yaml)?;

    info!("Starting Synapse");
    let mut start = Command::new("python3");
    start.arg(START_SCRIPT).envs(config.env_opts());
    let result = supervisor::check_call("synapse", &mut start).await;

    // If the registration helper is still pending, kill it. Just in case
    // synapse failed to start before the registration happened.
    if let Some(helper) = registration_helper {
        if !helper.is_finished() {
            helper.abort();
        }
    }

    result?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options() -> Options {
        Options::from_json(
            "/data/options.json",
            r#"{
                "server_name": "matrix.example.com",
                "media_store_path": "/data/media_store",
                "default_user": "admin",
                "default_userpass": "hunter2",
                "registration_shared_secret": "",
                "homeserver.yaml": "server_name: \"{server_name}\"\nregistration_shared_secret: \"{registration_shared_secret}\"\nmacaroon_secret_key: \"{macaroon_secret_key}\"\n"
            }"#,
        )
        .unwrap()
    }

    #[test]
    fn test_fill_secrets_only_fills_absent() {
        let mut opts = options();
        opts.set("macaroon_secret_key", serde_json::Value::from("keepme"));
        fill_secrets(&mut opts);

        // The empty secret was replaced, the provided one kept
        let generated = opts.lookup_str("registration_shared_secret").unwrap();
        assert!(!generated.is_empty());
        assert_eq!(opts.lookup_str("macaroon_secret_key").unwrap(), "keepme");
    }

    #[test]
    fn test_render_homeserver_yaml() {
        let mut opts = options();
        fill_secrets(&mut opts);
        let rendered = render_homeserver_yaml(&opts).unwrap();

        let parsed: serde_yaml::Value = serde_yaml::from_str(&rendered).unwrap();
        assert_eq!(
            parsed.get("server_name").and_then(|v| v.as_str()),
            Some("matrix.example.com")
        );
        assert!(
            parsed
                .get("registration_shared_secret")
                .and_then(|v| v.as_str())
                .map(|s| !s.is_empty())
                .unwrap_or(false)
        );
    }

    #[test]
    fn test_render_rejects_bad_yaml() {
        let mut opts = options();
        fill_secrets(&mut opts);
        opts.set(
            "homeserver.yaml",
            serde_json::Value::from("server_name: [unclosed"),
        );
        assert!(render_homeserver_yaml(&opts).is_err());
    }

    #[test]
    fn test_env_opts() {
        let config = SynapseConfig::from_options(&options()).unwrap();
        assert_eq!(
            config.env_opts(),
            vec![
                ("SYNAPSE_REPORT_STATS".to_string(), "no".to_string()),
                (
                    "SYNAPSE_SERVER_NAME".to_string(),
                    "matrix.example.com".to_string()
                ),
            ]
        );
    }
}
