//! mx-puppet-steam bridge launcher.
//!
//! This bridge cannot take its appservice tokens from config.yaml, so the
//! shared copy of the registration is authoritative: a rebuilt /data is
//! repopulated from the shared directory instead of regenerating tokens the
//! homeserver wouldn't recognise.

use std::path::Path;

use addonup_config::Options;
use tokio::process::Command;
use tracing::info;

use crate::launchers::mautrix::render_config;
use crate::registration::REGISTRATIONS_DIR;
use crate::registration::Registration;
use crate::registration::print_registration_notice;
use crate::supervisor;

pub const CONFIG_FILE: &str = "/data/config.yaml";
pub const LOCAL_REGISTRATION: &str = "/data/steam-registration.yaml";
pub const SHARED_REGISTRATION: &str = "mx-puppet-steam.yaml";
pub const RUNNER: &str = "/opt/mx-puppet-steam/docker-run.sh";

pub async fn run(options: &Options) -> anyhow::Result<()> {
    let config = render_config(options)?;
    info!("Overwriting config.yaml with custom config");
    std::fs::write(CONFIG_FILE, config)?;

    let registration = Registration::at(LOCAL_REGISTRATION);
    let shared = Path::new(REGISTRATIONS_DIR).join(SHARED_REGISTRATION);

    if !shared.exists() {
        // First run ever: generate, then share so later rebuilds can start
        // from the same tokens.
        if registration.exists() {
            anyhow::bail!(
                "{} exists but was never shared; refusing to regenerate tokens",
                registration.path().display()
            );
        }

        supervisor::check_call("mx-puppet-steam", &mut Command::new(RUNNER)).await?;
        if !registration.exists() {
            anyhow::bail!(
                "bridge runner did not create {}",
                registration.path().display()
            );
        }

        registration.publish(Path::new(REGISTRATIONS_DIR), SHARED_REGISTRATION)?;
        print_registration_notice();
        Ok(())
    } else {
        info!("Copying registration file from {}", shared.display());
        registration.restore_from(&shared)?;

        info!("Starting service");
        supervisor::check_call("mx-puppet-steam", &mut Command::new(RUNNER)).await?;
        Ok(())
    }
}
