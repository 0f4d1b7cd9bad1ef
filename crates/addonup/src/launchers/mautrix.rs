//! mautrix bridge launchers (Facebook Messenger and Meta).
//!
//! Both bridges render their config.yaml from a template option. The meta
//! bridge additionally owns an appservice registration whose tokens are
//! spliced into the config, and shares the registration with the homeserver
//! add-on on first run.

use std::path::Path;

use addonup_config::Options;
use addonup_config::render;
use tokio::process::Command;
use tracing::info;

use crate::registration::REGISTRATIONS_DIR;
use crate::registration::Registration;
use crate::registration::print_registration_notice;
use crate::supervisor;

pub const CONFIG_FILE: &str = "/data/config.yaml";
pub const META_REGISTRATION: &str = "/data/registration.yaml";

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum Flavor {
    Facebook,
    Meta,
}

impl Flavor {
    /// The upstream image's runner script.
    pub fn runner(&self) -> &'static str {
        match self {
            Flavor::Facebook => "/opt/mautrix-facebook/docker-run.sh",
            Flavor::Meta => "/docker-run.sh",
        }
    }

    /// Name of the shared registration copy, for flavors that publish one.
    pub fn shared_registration(&self) -> Option<&'static str> {
        match self {
            Flavor::Facebook => None,
            Flavor::Meta => Some("mautrix-meta.yaml"),
        }
    }
}

/// Render the bridge config template. Round-tripping through the YAML
/// parser makes template syntax errors obvious early.
pub fn render_config(options: &Options) -> anyhow::Result<String> {
    let template = options
        .lookup_str("config.yaml")
        .ok_or_else(|| anyhow::anyhow!("config.yaml template option is missing"))?;

    let rendered = render(&template, options)?;
    let parsed: serde_yaml::Value = serde_yaml::from_str(&rendered)?;
    Ok(serde_yaml::to_string(&parsed)?)
}

/// Splice the registration's tokens into the options the template renders
/// from. Before the registration exists these are placeholders.
pub fn splice_tokens(options: &mut Options, registration: &Registration) -> anyhow::Result<()> {
    let tokens = registration.tokens()?;
    options.set("as_token", serde_json::Value::from(tokens.as_token));
    options.set("hs_token", serde_json::Value::from(tokens.hs_token));
    Ok(())
}

pub async fn run(options: &mut Options, flavor: Flavor) -> anyhow::Result<()> {
    let registration = Registration::at(META_REGISTRATION);
    if flavor.shared_registration().is_some() {
        // Get the as & hs tokens directly from the registration yaml used by
        // the homeserver
        splice_tokens(options, &registration)?;
    }

    let config = render_config(options)?;
    info!("Overwriting config.yaml with custom config");
    std::fs::write(CONFIG_FILE, config)?;

    let shared_name = match flavor.shared_registration() {
        Some(name) => name,
        None => {
            // Nothing registration-shaped to manage, just hand over
            return Ok(supervisor::check_call("mautrix", &mut Command::new(flavor.runner())).await?);
        }
    };

    if !registration.exists() {
        // First run: the runner generates the registration, which then has
        // to reach the homeserver before the bridge can do anything.
        supervisor::check_call("mautrix", &mut Command::new(flavor.runner())).await?;
        if !registration.exists() {
            anyhow::bail!(
                "bridge runner did not create {}",
                registration.path().display()
            );
        }

        registration.publish(Path::new(REGISTRATIONS_DIR), shared_name)?;
        print_registration_notice();
        Ok(())
    } else {
        info!("Starting service");
        supervisor::check_call("mautrix", &mut Command::new(flavor.runner())).await?;
        Ok(())
    }
}
