//! Host-side agents: long-running processes that bridge a local event
//! source or remote API into Home Assistant, over MQTT or stdout.

pub mod jellyfin;
pub mod pipewire;
pub mod screensaver;
pub mod tramtracker;
