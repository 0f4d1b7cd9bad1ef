//! Screensaver/lock-state agent.
//!
//! Exposes the login session's lock state as a Home Assistant `lock` entity
//! and accepts LOCK/UNLOCK commands back. State comes from logind's session
//! `IdleHint`/`LockedHint` properties, observed through a `busctl monitor`
//! subprocess; the two hints distinguish "locking because the user asked"
//! from "locking because of an idle timeout".

use std::process::Stdio;

use tokio::io::AsyncBufReadExt;
use tokio::io::BufReader;
use tokio::io::Lines;
use tokio::process::Child;
use tokio::process::ChildStdout;
use tokio::process::Command;
use tracing::error;
use tracing::info;
use tracing::warn;

use crate::mqtt::MqttHandle;
use crate::mqtt::MqttSettings;
use crate::mqtt::discovery;
use crate::mqtt::discovery::EntityConfig;

const SESSION_INTERFACE: &str = "org.freedesktop.login1.Session";
const SESSION_PATH_PREFIX: &str = "/org/freedesktop/login1/session";

/// The payloads published on the state topic
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "UPPERCASE")]
pub enum LockState {
    Locking,
    Locked,
    Unlocked,
}

/// How one property changed in a PropertiesChanged signal
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Change {
    #[default]
    Unchanged,
    Set(bool),
    Invalidated,
}

/// The session hints carried by one PropertiesChanged signal
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HintUpdate {
    pub idle_hint: Change,
    pub locked_hint: Change,
}

impl HintUpdate {
    pub fn is_empty(&self) -> bool {
        self.idle_hint == Change::Unchanged && self.locked_hint == Change::Unchanged
    }
}

/// Folds hint updates into the current lock state.
#[derive(Debug, Default)]
pub struct HintTracker {
    idle: Option<bool>,
    locked: Option<bool>,
}

impl HintTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn idle(&self) -> Option<bool> {
        self.idle
    }

    pub fn locked(&self) -> Option<bool> {
        self.locked
    }

    /// Apply an update and classify the result. None means the state is
    /// currently unknowable and the entity should go unavailable.
    pub fn observe(&mut self, update: HintUpdate) -> Option<LockState> {
        match update.idle_hint {
            Change::Set(v) => self.idle = Some(v),
            Change::Invalidated => self.idle = None,
            Change::Unchanged => {}
        }
        match update.locked_hint {
            Change::Set(v) => self.locked = Some(v),
            Change::Invalidated => self.locked = None,
            Change::Unchanged => {}
        }

        let locked_changed = matches!(update.locked_hint, Change::Set(_));
        match (self.locked, self.idle) {
            // Locked before the screen blanked: the user locked manually
            (Some(true), Some(false)) if locked_changed => Some(LockState::Locking),
            (Some(true), _) => Some(LockState::Locked),
            // Screen blanked before locking: idle timeout, lock imminent
            (Some(false), Some(true)) => Some(LockState::Locking),
            (Some(false), _) => Some(LockState::Unlocked),
            (None, _) => None,
        }
    }
}

/// Parse one `busctl monitor --json=short` line into a hint update.
///
/// Returns None for anything that isn't a PropertiesChanged signal for a
/// login1 session.
pub fn parse_monitor_line(line: &str) -> Option<HintUpdate> {
    let value: serde_json::Value = serde_json::from_str(line).ok()?;

    if value.get("member").and_then(|v| v.as_str()) != Some("PropertiesChanged") {
        return None;
    }
    let path = value.get("path").and_then(|v| v.as_str())?;
    if !path.starts_with(SESSION_PATH_PREFIX) {
        return None;
    }

    let data = value.get("payload")?.get("data")?.as_array()?;
    if data.first().and_then(|v| v.as_str()) != Some(SESSION_INTERFACE) {
        return None;
    }

    let mut update = HintUpdate::default();

    if let Some(changed) = data.get(1).and_then(|v| v.as_object()) {
        for (key, slot) in [
            ("IdleHint", &mut update.idle_hint),
            ("LockedHint", &mut update.locked_hint),
        ] {
            if let Some(v) = changed.get(key).and_then(|v| v.get("data")).and_then(|v| v.as_bool())
            {
                *slot = Change::Set(v);
            }
        }
    }

    if let Some(invalidated) = data.get(2).and_then(|v| v.as_array()) {
        for name in invalidated.iter().filter_map(|v| v.as_str()) {
            // Invalidation of these hints has never been seen in practice
            match name {
                "IdleHint" => update.idle_hint = Change::Invalidated,
                "LockedHint" => update.locked_hint = Change::Invalidated,
                _ => {}
            }
        }
    }

    Some(update)
}

/// A command received on the command topic
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockCommand {
    Lock { code: Option<String> },
    Unlock { code: Option<String> },
}

pub fn parse_command(payload: &str) -> Option<LockCommand> {
    let mut words = payload.split_whitespace();
    let verb = words.next()?;
    let code = words.next().map(str::to_string);

    match verb {
        "LOCK" => Some(LockCommand::Lock { code }),
        "UNLOCK" => Some(LockCommand::Unlock { code }),
        _ => None,
    }
}

/// Watches login1 PropertiesChanged signals via a busctl subprocess.
pub struct BusctlMonitor {
    lines: Lines<BufReader<ChildStdout>>,
    _child: Child,
}

impl BusctlMonitor {
    pub fn spawn() -> anyhow::Result<Self> {
        let mut child = Command::new("busctl")
            .args([
                "--system",
                "monitor",
                "--json=short",
                "--match",
                "type='signal',interface='org.freedesktop.DBus.Properties',\
                 member='PropertiesChanged',path_namespace='/org/freedesktop/login1/session'",
            ])
            .stdout(Stdio::piped())
            .spawn()?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow::anyhow!("busctl has no stdout"))?;

        Ok(Self {
            lines: BufReader::new(stdout).lines(),
            _child: child,
        })
    }

    /// The next session hint update, skipping unrelated traffic. None at end
    /// of stream.
    pub async fn next_update(&mut self) -> anyhow::Result<Option<HintUpdate>> {
        while let Some(line) = self.lines.next_line().await? {
            if let Some(update) = parse_monitor_line(&line) {
                if !update.is_empty() {
                    return Ok(Some(update));
                }
            }
        }
        Ok(None)
    }
}

async fn run_session_command(action: &str, session: &str) {
    let mut command = Command::new("loginctl");
    command.args([action, session]);
    if let Err(e) = crate::supervisor::check_call("loginctl", &mut command).await {
        // A failing command must never take the agent down
        error!("loginctl {} failed: {}", action, e);
    }
}

async fn handle_command(command: LockCommand, session: &str) {
    match command {
        LockCommand::Lock { .. } => run_session_command("lock-session", session).await,
        LockCommand::Unlock { code } => {
            if code.is_some() {
                warn!("Unlock codes are not supported, activating session instead");
            }
            run_session_command("activate", session).await;
        }
    }
}

pub async fn run(settings: &MqttSettings, session: &str) -> anyhow::Result<()> {
    let host = hostname::get()?.to_string_lossy().into_owned();
    let topic_base = format!("homeassistant/lock/{}/screensaver", host);
    let availability_topic = format!("{}/availability", topic_base);
    let state_topic = format!("{}/state", topic_base);
    let command_topic = format!("{}/command", topic_base);

    let mut mqtt = MqttHandle::connect(settings, Some(&availability_topic)).await?;

    let mut config = EntityConfig::new(
        "Screensaver",
        format!("screensaver_mqtt:{}", host),
        discovery::Device::this_host()?,
    );
    config.availability_topic = Some(availability_topic.clone());
    config.state_topic = Some(state_topic.clone());
    config.command_topic = Some(command_topic.clone());
    config.command_template =
        Some("{{ value }}{% if code is not none %} {{ code }}{% endif %}".to_string());
    config.code_format = Some(r"^(\d+|.+)?$".to_string());
    config.icon = Some("mdi:monitor-lock".to_string());
    config.json_attributes_topic = Some(format!("{}/attributes", topic_base));
    // Tell Home Assistant NOT to mark commands for retainment
    config.retain = Some(false);

    mqtt.publish(&format!("{}/config", topic_base), config.to_payload()?, true)
        .await?;
    mqtt.subscribe(&command_topic).await?;

    let mut monitor = BusctlMonitor::spawn()?;
    let mut tracker = HintTracker::new();

    loop {
        tokio::select! {
            update = monitor.next_update() => {
                let Some(update) = update? else {
                    anyhow::bail!("busctl monitor exited");
                };

                let state = tracker.observe(update);
                info!(
                    "{:?}: IDLE={:?}, LOCKED={:?}",
                    state,
                    tracker.idle(),
                    tracker.locked()
                );

                match state {
                    Some(state) => {
                        // Remind the broker we're still here and accurate
                        mqtt.publish(&availability_topic, "online", false).await?;
                        mqtt.publish(&state_topic, state.to_string(), false).await?;
                    }
                    None => {
                        // Confused right now, mark the state unreliable
                        mqtt.publish(&availability_topic, "offline", false).await?;
                    }
                }
            }
            message = mqtt.next_message() => {
                let Some(message) = message else {
                    anyhow::bail!("MQTT connection lost");
                };
                if message.topic != command_topic {
                    continue;
                }

                let payload = String::from_utf8_lossy(&message.payload).into_owned();
                let redacted = match payload.split_whitespace().count() {
                    0 | 1 => payload.clone(),
                    _ => format!("{} [REDACTED]", payload.split_whitespace().next().unwrap_or("")),
                };
                info!("mqtt> {}", redacted);

                match parse_command(&payload) {
                    Some(command) => handle_command(command, session).await,
                    None => error!(
                        "Only locking is supported, or (maybe) unlocking with a code. Received {}",
                        redacted
                    ),
                }
            }
        }
    }
}
