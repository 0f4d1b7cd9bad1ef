//! PipeWire playback monitor.
//!
//! Watches `pw-dump --monitor` for audio playback streams and exposes one
//! binary sensor per media role, so automations can react to "something is
//! playing music" separately from "a call is active".

use std::collections::HashMap;
use std::process::Stdio;
use std::str::FromStr;

use serde::Deserialize;
use strum::IntoEnumIterator;
use thiserror::Error;
use tokio::io::AsyncBufRead;
use tokio::io::AsyncBufReadExt;
use tokio::process::Command;
use tracing::info;

use crate::mqtt::MqttHandle;
use crate::mqtt::MqttSettings;
use crate::mqtt::discovery;
use crate::mqtt::discovery::EntityConfig;

/// PulseAudio media roles. The role is a free-form string in practice, but
/// the documentation enumerates these; anything else counts as `Other`.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
)]
#[strum(serialize_all = "lowercase")]
pub enum Role {
    /// What the playback sensors are mostly about
    Music,
    /// Mutes the music and steals all attention
    Phone,
    Game,
    /// YouTube videos and such
    Video,
    /// Chat notification blips
    Event,
    A11y,
    Animation,
    Production,
    /// Not a real PulseAudio role, used for any stream without a known one
    Other,
}

/// Map a stream's `media.role` property onto a [`Role`].
pub fn classify_role(role: Option<&str>) -> Role {
    role.and_then(|r| Role::from_str(&r.to_lowercase()).ok())
        .unwrap_or(Role::Other)
}

#[derive(Debug, Error)]
pub enum PipewireError {
    #[error("pw-dump output must start with a '['")]
    BadStart,

    #[error("pw-dump output ended mid-array")]
    TruncatedArray,

    #[error("failed to read pw-dump output: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to decode pw-dump output: {0}")]
    Json(#[from] serde_json::Error),
}

/// Read & decode the next pretty-printed JSON list from the reader.
///
/// `pw-dump --monitor` writes an endless concatenation of pretty-printed
/// arrays; each starts with `[` and ends with `]` alone at column zero.
/// Returns None at a clean end of stream.
pub async fn read_pretty_json_list<R: AsyncBufRead + Unpin>(
    reader: &mut R,
) -> Result<Option<Vec<serde_json::Value>>, PipewireError> {
    let mut line = String::new();
    if reader.read_line(&mut line).await? == 0 {
        return Ok(None);
    }
    if line != "[\n" {
        return Err(PipewireError::BadStart);
    }

    let mut json_string = line.clone();
    while line != "]\n" {
        line.clear();
        if reader.read_line(&mut line).await? == 0 {
            return Err(PipewireError::TruncatedArray);
        }
        json_string.push_str(&line);
    }

    Ok(Some(serde_json::from_str(&json_string)?))
}

#[derive(Debug, Deserialize)]
struct PwEvent {
    id: u64,
    #[serde(rename = "type")]
    kind: Option<String>,
    info: Option<PwNodeInfo>,
}

#[derive(Debug, Deserialize)]
struct PwNodeInfo {
    #[serde(default, rename = "change-mask")]
    change_mask: Vec<String>,
    state: Option<String>,
    #[serde(default)]
    props: serde_json::Map<String, serde_json::Value>,
}

/// A per-role sensor state change
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoleTransition {
    pub role: Role,
    pub active: bool,
}

/// Tracks running playback streams per role across the event stream.
#[derive(Debug, Default)]
pub struct RoleTracker {
    counts: HashMap<Role, usize>,
    playback_streams: HashMap<u64, Role>,
}

impl RoleTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one pw-dump event through the tracker.
    ///
    /// A new running playback stream reports its role active (repeats for
    /// further streams of the same role are harmless, the topic is
    /// retained); a removal reports inactive once the last stream of that
    /// role is gone.
    pub fn observe(&mut self, event: &serde_json::Value) -> Option<RoleTransition> {
        let event: PwEvent = serde_json::from_value(event.clone()).ok()?;

        if event.kind.is_none() && event.info.is_none() {
            // A node being removed, though we don't know what type of node
            let role = self.playback_streams.remove(&event.id)?;
            info!("del {}", role);
            let count = self.counts.entry(role).or_insert(1);
            *count = count.saturating_sub(1);
            if *count == 0 {
                return Some(RoleTransition {
                    role,
                    active: false,
                });
            }
            return None;
        }

        if event.kind.as_deref() != Some("PipeWire:Interface:Node") {
            return None;
        }
        let info = event.info?;

        match info.props.get("media.class").and_then(|v| v.as_str()) {
            Some("Stream/Output/Audio") => {
                if info.props.get("node.passive").and_then(|v| v.as_bool()) == Some(true) {
                    // Seen with internal loopback & echo cancelling modules
                    return None;
                }
                if !info.change_mask.iter().any(|c| c == "state") {
                    // Don't care about anything other than state changes
                    return None;
                }
                if info.state.as_deref() != Some("running") {
                    return None;
                }

                let role = classify_role(info.props.get("media.role").and_then(|v| v.as_str()));
                info!("new {}", role);
                *self.counts.entry(role).or_insert(0) += 1;
                // Keep record of the role so we can track it on deletion
                self.playback_streams.insert(event.id, role);
                Some(RoleTransition { role, active: true })
            }
            _ => None,
        }
    }
}

fn state_topic(topic_base: &str, role: Role) -> String {
    format!("{}/pipewire_{}/state", topic_base, role)
}

pub async fn run(settings: &MqttSettings) -> anyhow::Result<()> {
    let host = hostname::get()?.to_string_lossy().into_owned();
    let topic_base = format!("homeassistant/binary_sensor/{}", host);
    let availability_topic = format!("{}/availability", topic_base);

    let mqtt = MqttHandle::connect(settings, Some(&availability_topic)).await?;

    // Announce one binary sensor per role
    let device = discovery::Device::this_host()?;
    for role in Role::iter() {
        let mut config = EntityConfig::new(
            format!("Audio playback - {}", role),
            format!("{}-pipewire-{}", host, role),
            device.clone(),
        );
        config.availability_topic = Some(availability_topic.clone());
        config.state_topic = Some(state_topic(&topic_base, role));
        config.device_class = Some("sound".to_string());

        mqtt.publish(
            &format!("{}/pipewire_{}/config", topic_base, role),
            config.to_payload()?,
            true,
        )
        .await?;
    }
    mqtt.publish(&availability_topic, "online", false).await?;

    // Set everything to off before we get started
    for role in Role::iter() {
        mqtt.publish(&state_topic(&topic_base, role), "OFF", true)
            .await?;
    }

    let mut child = Command::new("pw-dump")
        .args(["--monitor", "--no-colors"])
        .stdout(Stdio::piped())
        .spawn()?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow::anyhow!("pw-dump has no stdout"))?;
    let mut reader = tokio::io::BufReader::new(stdout);

    let mut tracker = RoleTracker::new();
    while let Some(events) = read_pretty_json_list(&mut reader).await? {
        for event in &events {
            if let Some(transition) = tracker.observe(event) {
                let payload = if transition.active { "ON" } else { "OFF" };
                mqtt.publish(&state_topic(&topic_base, transition.role), payload, true)
                    .await?;
            }
        }

        // Ping availability in case HA has restarted and forgotten us
        mqtt.publish(&availability_topic, "online", false).await?;
    }

    anyhow::bail!("pw-dump exited");
}
