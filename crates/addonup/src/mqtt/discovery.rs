//! Home Assistant MQTT discovery payloads.
//!
//! These are the JSON documents published retained on
//! `homeassistant/<component>/<node>/<object>/config` so entities appear
//! without manual configuration. Only the fields our agents publish are
//! modelled.

use serde::Serialize;

/// Device block tying an agent's entities to the machine they run on
#[derive(Debug, Clone, Serialize)]
pub struct Device {
    pub name: String,

    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub identifiers: Vec<String>,

    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub connections: Vec<(String, String)>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub manufacturer: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

impl Device {
    /// The device block for the local machine, identified by hostname.
    pub fn this_host() -> std::io::Result<Self> {
        let host = hostname::get()?.to_string_lossy().into_owned();
        Ok(Self {
            name: host.clone(),
            identifiers: vec![host],
            connections: Vec::new(),
            manufacturer: None,
            model: None,
        })
    }
}

/// Discovery config payload for a single entity
#[derive(Debug, Clone, Serialize)]
pub struct EntityConfig {
    pub name: String,
    pub unique_id: String,
    pub device: Device,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub availability_topic: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub state_topic: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub command_topic: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub command_template: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub code_format: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_class: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub json_attributes_topic: Option<String>,

    /// Tells Home Assistant whether to mark commands for retainment
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retain: Option<bool>,
}

impl EntityConfig {
    pub fn new(name: impl Into<String>, unique_id: impl Into<String>, device: Device) -> Self {
        Self {
            name: name.into(),
            unique_id: unique_id.into(),
            device,
            availability_topic: None,
            state_topic: None,
            command_topic: None,
            command_template: None,
            code_format: None,
            device_class: None,
            icon: None,
            json_attributes_topic: None,
            retain: None,
        }
    }

    pub fn to_payload(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device() -> Device {
        Device {
            name: "testhost".to_string(),
            identifiers: vec!["testhost".to_string()],
            connections: Vec::new(),
            manufacturer: None,
            model: None,
        }
    }

    #[test]
    fn test_entity_config_skips_absent_fields() {
        let config = EntityConfig::new("Screensaver", "screensaver_mqtt:testhost", device());
        let json: serde_json::Value =
            serde_json::from_slice(&config.to_payload().unwrap()).unwrap();

        assert_eq!(json["name"], "Screensaver");
        assert_eq!(json["unique_id"], "screensaver_mqtt:testhost");
        assert_eq!(json["device"]["name"], "testhost");
        assert!(json.get("state_topic").is_none());
        assert!(json.get("command_topic").is_none());
        assert!(json.get("device").unwrap().get("connections").is_none());
    }

    #[test]
    fn test_entity_config_full_lock_payload() {
        let mut config = EntityConfig::new("Screensaver", "screensaver_mqtt:testhost", device());
        config.availability_topic =
            Some("homeassistant/lock/testhost/screensaver/availability".to_string());
        config.state_topic = Some("homeassistant/lock/testhost/screensaver/state".to_string());
        config.command_topic = Some("homeassistant/lock/testhost/screensaver/command".to_string());
        config.icon = Some("mdi:monitor-lock".to_string());
        config.retain = Some(false);

        let json: serde_json::Value =
            serde_json::from_slice(&config.to_payload().unwrap()).unwrap();
        assert_eq!(json["icon"], "mdi:monitor-lock");
        assert_eq!(json["retain"], false);
        assert_eq!(
            json["command_topic"],
            "homeassistant/lock/testhost/screensaver/command"
        );
    }
}
