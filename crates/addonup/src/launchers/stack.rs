//! The combined bridge add-on: WireGuard tunnel + Heisenbridge + webmail,
//! supervised together.

use std::path::Path;

use addonup_config::Options;
use tokio::process::Command;
use tracing::info;

use crate::launchers::heisenbridge;
use crate::launchers::heisenbridge::HeisenbridgeConfig;
use crate::launchers::snappymail;
use crate::launchers::snappymail::SnappymailConfig;
use crate::launchers::wireguard;
use crate::launchers::wireguard::WIREGUARD_CONF;
use crate::launchers::wireguard::WireguardConfig;
use crate::registration::REGISTRATIONS_DIR;
use crate::registration::Registration;
use crate::supervisor::Supervisor;

/// Which webmail child runs alongside the bridge
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum Webmail {
    /// SnappyMail via the image's entrypoint
    Snappymail,
    /// A placeholder sleeper, for images whose webmail is managed elsewhere
    Idle,
}

pub async fn run(options: &Options, webmail: Webmail) -> anyhow::Result<()> {
    let mut scope = options.scope();
    let heisenbridge_section = scope.require_section("heisenbridge");
    let wireguard_section = scope.require_section("wireguard");
    let snappymail_section = match webmail {
        Webmail::Snappymail => Some(scope.require_section("snappymail")),
        Webmail::Idle => None,
    };
    scope.finish()?;

    let heisenbridge_config = HeisenbridgeConfig::from_section(&heisenbridge_section)?;
    let wireguard_config = WireguardConfig::from_section(&wireguard_section)?;

    let registration = Registration::for_hostname(REGISTRATIONS_DIR)?;
    if heisenbridge::ensure_registration(&registration, &heisenbridge_config).await? {
        return Ok(());
    }

    wireguard::bring_up(&wireguard_config, Path::new(WIREGUARD_CONF)).await?;

    let mut supervisor = Supervisor::new();
    supervisor.spawn(
        "heisenbridge",
        &mut heisenbridge::command(&registration, &heisenbridge_config),
    )?;

    match snappymail_section {
        Some(section) => {
            let snappymail_config = SnappymailConfig::from_section(&section)?;

            info!("Writing SnappyMail config file(s)");
            let app_config = snappymail::app_config_path(Path::new(snappymail::CONFIG_DIR));
            snappymail::seed_app_config(&app_config, Path::new(snappymail::CONFIG_TEMPLATE))?;
            snappymail::sync_admin_credentials(
                &app_config,
                &snappymail_config.admin_username,
                &snappymail_config.admin_password,
            )?;
            snappymail::link_data_dir(
                Path::new(snappymail::DATA_LINK),
                Path::new(snappymail::CONFIG_DIR),
            )?;

            let env = snappymail_config.env_map();
            info!("Starting SnappyMail with env: {:?}", env);
            let mut entrypoint = Command::new(snappymail::ENTRYPOINT);
            entrypoint.env_clear().envs(env);
            // SnappyMail doesn't need the VPN for startup and can take a
            // while to settle, so it's fine to start it alongside the bridge.
            supervisor.spawn("snappymail", &mut entrypoint)?;
        }
        None => {
            let mut idle = Command::new("sleep");
            idle.arg("infinity");
            supervisor.spawn("webmail", &mut idle)?;
        }
    }

    match supervisor.run_to_exit().await? {}
}
