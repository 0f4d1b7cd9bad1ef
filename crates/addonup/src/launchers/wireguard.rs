//! WireGuard tunnel setup for the combined bridge add-ons.

use std::path::Path;

use addonup_config::Diagnostics;
use addonup_config::Options;
use tokio::process::Command;
use tracing::info;

use crate::supervisor;

pub const WIREGUARD_CONF: &str = "/etc/wireguard/wg0.conf";

#[derive(Debug, Clone)]
pub struct WireguardConfig {
    pub own_ip: String,
    pub private_key: String,
    pub endpoint: String,
    pub public_key: String,
    pub allowed_ips: Vec<String>,
}

impl WireguardConfig {
    /// Nested `wireguard` section.
    pub fn from_section(section: &Options) -> Result<Self, Diagnostics> {
        let mut scope = section.scope();
        let own_ip = scope.require_str("own_IP");
        let private_key = scope.require_str("private_key");
        let endpoint = scope.require_str("endpoint");
        let public_key = scope.require_str("public_key");
        let allowed_ips = scope.require_str_list("allowed_IPs");
        scope.finish()?;

        Ok(Self {
            own_ip,
            private_key,
            endpoint,
            public_key,
            allowed_ips,
        })
    }

    /// The wg-quick config file contents.
    pub fn render_conf(&self) -> String {
        [
            "[Interface]".to_string(),
            format!("Address = {}", self.own_ip),
            format!("PrivateKey = {}", self.private_key),
            "[Peer]".to_string(),
            format!("Endpoint = {}", self.endpoint),
            format!("PublicKey = {}", self.public_key),
            format!("AllowedIPs = {}", self.allowed_ips.join(", ")),
        ]
        .join("\n")
    }
}

/// Write the config and bring the wg0 interface up, logging the resulting
/// addresses.
pub async fn bring_up(config: &WireguardConfig, conf_path: &Path) -> anyhow::Result<()> {
    info!("Writing wg-quick config");
    std::fs::write(conf_path, config.render_conf())?;

    info!("Starting Wireguard interface.");
    let mut up = Command::new("wg-quick");
    up.args(["up", "wg0"]);
    supervisor::check_call("wg-quick", &mut up).await?;

    info!("Got IP addresses;");
    let mut addresses = Command::new("ip");
    addresses.args(["-oneline", "address"]);
    let output = supervisor::check_output("ip", &mut addresses).await?;
    for line in output.lines() {
        info!("{}", line);
    }

    Ok(())
}
