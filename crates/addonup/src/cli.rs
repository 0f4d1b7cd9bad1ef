use std::path::PathBuf;

use clap::Parser;
use clap::Subcommand;
use tracing_subscriber::filter::LevelFilter;

use addonup::agents::jellyfin::JellyfinArgs;
use addonup::agents::tramtracker::TramTrackerArgs;
use addonup::launchers::mautrix::Flavor;
use addonup::launchers::stack::Webmail;
use addonup::mqtt::MqttSettings;

/// Start and supervise Home Assistant add-ons from their JSON options file.
#[derive(Debug, Parser)]
#[command(name = "addonup")]
pub struct Cli {
    /// Path to the add-on options file
    #[arg(long, global = true, default_value = "/data/options.json")]
    pub options: PathBuf,

    /// Log level: trace, debug, info, warn, error
    #[arg(long, global = true, value_enum, default_value_t = LogLevel::Info)]
    pub log_level: LogLevel,

    #[command(subcommand)]
    pub command: AddonCommand,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl From<LogLevel> for LevelFilter {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => LevelFilter::TRACE,
            LogLevel::Debug => LevelFilter::DEBUG,
            LogLevel::Info => LevelFilter::INFO,
            LogLevel::Warn => LevelFilter::WARN,
            LogLevel::Error => LevelFilter::ERROR,
        }
    }
}

#[derive(Debug, Subcommand)]
pub enum AddonCommand {
    /// Start the Heisenbridge IRC bridge add-on
    Heisenbridge,

    /// Start the combined WireGuard + Heisenbridge + webmail add-on
    BridgeStack {
        #[arg(long, value_enum, default_value_t = Webmail::Snappymail)]
        webmail: Webmail,
    },

    /// Start the Snapcast proxy add-on (snapserver + VLC)
    Snapproxy,

    /// Start the Synapse homeserver add-on
    Synapse,

    /// Start a mautrix bridge add-on
    Mautrix {
        #[arg(long, value_enum)]
        flavor: Flavor,
    },

    /// Start the mx-puppet-steam bridge add-on
    MxPuppetSteam,

    /// Start the Roundcube webmail add-on
    Roundcube {
        /// Arguments forwarded to the entrypoint
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },

    /// Start the Cypht webmail add-on
    Cypht {
        /// Arguments forwarded to the entrypoint
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },

    /// Publish PipeWire playback state as MQTT binary sensors
    Pipewire(MqttArgs),

    /// Publish the login session's lock state as an MQTT lock entity
    Screensaver {
        #[command(flatten)]
        mqtt: MqttArgs,

        /// logind session to watch and control
        #[arg(long, default_value = "1")]
        session: String,
    },

    /// Query the TramTracker API, printing JSON for a command_line sensor
    Tramtracker(TramTrackerArgs),

    /// Report aired episodes missing from Jellyfin's library
    JellyfinMissing(JellyfinArgs),
}

/// Broker flags shared by the MQTT agents
#[derive(Debug, clap::Args)]
pub struct MqttArgs {
    /// MQTT broker host; located via a _mqtt._tcp SRV lookup when omitted
    #[arg(long)]
    pub mqtt_host: Option<String>,

    #[arg(long, default_value_t = 1883)]
    pub mqtt_port: u16,

    #[arg(long, default_value = "guest")]
    pub mqtt_username: String,

    #[arg(long, default_value = "guest")]
    pub mqtt_password: String,
}

impl MqttArgs {
    pub fn settings(&self, client_id: &str) -> MqttSettings {
        MqttSettings {
            host: self.mqtt_host.clone(),
            port: self.mqtt_port,
            username: self.mqtt_username.clone(),
            password: self.mqtt_password.clone(),
            client_id: client_id.to_string(),
        }
    }
}
