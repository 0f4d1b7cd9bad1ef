//! Heisenbridge (Matrix IRC bridge) launcher.
//!
//! First run generates the appservice registration and stops so the operator
//! can register it with the homeserver; every later run starts the bridge
//! against the existing registration.

use addonup_config::Diagnostics;
use addonup_config::Options;
use tokio::process::Command;
use tracing::info;

use crate::registration::REGISTRATIONS_DIR;
use crate::registration::Registration;
use crate::registration::print_registration_notice;
use crate::supervisor;

#[derive(Debug, Clone)]
pub struct HeisenbridgeConfig {
    /// Matrix ID allowed to administer the bridge
    pub owner_mxid: String,

    /// Homeserver URL the bridge talks to
    pub synapse_url: String,

    /// URL the homeserver reaches the bridge back on, patched into the
    /// generated registration
    pub own_url: String,
}

impl HeisenbridgeConfig {
    /// Flat `heisenbridge_*` option names, as the standalone add-on uses.
    pub fn from_options(options: &Options) -> Result<Self, Diagnostics> {
        let mut scope = options.scope();
        let owner_mxid = scope.require_str("heisenbridge_owner_mxid");
        let synapse_url = scope.require_str("heisenbridge_synapse_url");
        let own_url = scope.require_str("heisenbridge_own_url");
        scope.finish()?;

        Ok(Self {
            owner_mxid,
            synapse_url,
            own_url,
        })
    }

    /// Nested `heisenbridge` section, as the combined add-ons use.
    pub fn from_section(section: &Options) -> Result<Self, Diagnostics> {
        let mut scope = section.scope();
        let owner_mxid = scope.require_str("owner_mxid");
        let synapse_url = scope.require_str("synapse_url");
        let own_url = scope.require_str("own_url");
        scope.finish()?;

        Ok(Self {
            owner_mxid,
            synapse_url,
            own_url,
        })
    }
}

/// Arguments shared by the generate step and the real start.
pub fn bridge_args(registration: &Registration, config: &HeisenbridgeConfig) -> Vec<String> {
    vec![
        "--config".to_string(),
        registration.path().display().to_string(),
        // The bridge must be reachable from the homeserver container, so
        // listen on everything rather than guessing an interface.
        "--listen-address".to_string(),
        "0.0.0.0".to_string(),
        "--owner".to_string(),
        config.owner_mxid.clone(),
        config.synapse_url.clone(),
    ]
}

/// The bridge start command.
pub fn command(registration: &Registration, config: &HeisenbridgeConfig) -> Command {
    let mut command = Command::new("heisenbridge");
    command.args(bridge_args(registration, config));
    command
}

/// Generate the registration if it doesn't exist yet.
///
/// Returns true when a registration was generated, in which case the caller
/// must stop instead of starting the bridge.
pub async fn ensure_registration(
    registration: &Registration,
    config: &HeisenbridgeConfig,
) -> anyhow::Result<bool> {
    if registration.exists() {
        return Ok(false);
    }

    info!("Overwriting registration yaml.");
    let mut generate = Command::new("heisenbridge");
    generate.arg("--generate").args(bridge_args(registration, config));
    registration
        .generate_with("heisenbridge --generate", &mut generate, &config.own_url)
        .await?;

    print_registration_notice();
    Ok(true)
}

pub async fn run(options: &Options) -> anyhow::Result<()> {
    let config = HeisenbridgeConfig::from_options(options)?;
    let registration = Registration::for_hostname(REGISTRATIONS_DIR)?;

    if ensure_registration(&registration, &config).await? {
        return Ok(());
    }

    supervisor::check_call("heisenbridge", &mut command(&registration, &config)).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> HeisenbridgeConfig {
        HeisenbridgeConfig {
            owner_mxid: "@admin:example.com".to_string(),
            synapse_url: "http://synapse:8008".to_string(),
            own_url: "http://addon:9898".to_string(),
        }
    }

    #[test]
    fn test_bridge_args() {
        let registration = Registration::at("/share/matrix_appservices/host.yaml");
        assert_eq!(
            bridge_args(&registration, &config()),
            vec![
                "--config",
                "/share/matrix_appservices/host.yaml",
                "--listen-address",
                "0.0.0.0",
                "--owner",
                "@admin:example.com",
                "http://synapse:8008",
            ]
        );
    }

    #[test]
    fn test_from_options_flat_keys() {
        let options = Options::from_json(
            "/data/options.json",
            r#"{
                "heisenbridge_owner_mxid": "@admin:example.com",
                "heisenbridge_synapse_url": "http://synapse:8008",
                "heisenbridge_own_url": "http://addon:9898"
            }"#,
        )
        .unwrap();

        let config = HeisenbridgeConfig::from_options(&options).unwrap();
        assert_eq!(config.owner_mxid, "@admin:example.com");
    }

    #[test]
    fn test_from_section_reports_all_missing() {
        let options = Options::from_json("/data/options.json", r#"{"heisenbridge": {}}"#).unwrap();
        let section = options.section("heisenbridge").unwrap();

        let err = HeisenbridgeConfig::from_section(&section).unwrap_err();
        assert_eq!(err.0.len(), 3);
        assert!(format!("{}", err).contains("heisenbridge.owner_mxid"));
    }
}
