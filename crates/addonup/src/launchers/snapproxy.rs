//! Snapcast proxy: snapserver fed from a PulseAudio pipe sink, with a VLC
//! instance for endless HTTP streams, supervised together.

use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use addonup_config::Diagnostics;
use addonup_config::Options;
use thiserror::Error;
use tokio::process::Command;
use tracing::info;

use crate::secrets;
use crate::supervisor;
use crate::supervisor::Supervisor;

pub const CONFIG_FILE: &str = "/etc/snapserver.conf";
pub const SECRET_FILE: &str = "/data/secret";
pub const PULSE_COOKIE: &str = "/root/.config/pulse/cookie";
/// This ends up at /run/audio/snapfifo in the addon
pub const SNAPFIFO: &str = "/data/external/snapfifo";

/// Property key marking the pipe sink as ours, so reloads are idempotent.
const SINK_TAG: &str = "snapproxy.pipe-sink";

#[derive(Debug, Error)]
pub enum SnapproxyError {
    #[error("{0}")]
    Io(#[from] io::Error),

    #[error("system call failed: {0}")]
    Nix(#[from] nix::Error),

    #[error("no such user: {0}")]
    MissingUser(String),

    #[error("no such group: {0}")]
    MissingGroup(String),
}

#[derive(Debug, Clone)]
pub struct SnapproxyConfig {
    pub server_threads: u64,
    pub server_datadir: String,
    pub stream_sources: Vec<String>,
    pub stream_sampleformat: String,
    pub stream_codec: String,
    pub stream_chunk_ms: u64,
    pub stream_buffer: u64,
    pub stream_send_to_muted: bool,
    pub http_enabled: bool,
    pub tcp_enabled: bool,
    pub logging_filter: String,
}

impl SnapproxyConfig {
    pub fn from_options(options: &Options) -> Result<Self, Diagnostics> {
        let mut scope = options.scope();
        let server_threads = scope.require_u64("server_threads");
        let server_datadir = scope.require_str("server_datadir");
        let stream_sources = scope.require_str_list("stream_sources");
        let stream_sampleformat = scope.require_str("stream_sampleformat");
        let stream_codec = scope.require_str("stream_codec");
        let stream_chunk_ms = scope.require_u64("stream_chunk_ms");
        let stream_buffer = scope.require_u64("stream_buffer");
        let stream_send_to_muted = scope.require_bool("stream_send_to_muted");
        let http_enabled = scope.require_bool("http_enabled");
        let tcp_enabled = scope.require_bool("tcp_enabled");
        let logging_filter = scope.require_str("logging_filter");
        scope.finish()?;

        Ok(Self {
            server_threads,
            server_datadir,
            stream_sources,
            stream_sampleformat,
            stream_codec,
            stream_chunk_ms,
            stream_buffer,
            stream_send_to_muted,
            http_enabled,
            tcp_enabled,
            logging_filter,
        })
    }

    /// The generated snapserver.conf. snapserver allows repeated `source`
    /// keys, which is why this is a template and not an INI writer.
    pub fn render_config(&self) -> String {
        let sources = self
            .stream_sources
            .iter()
            .map(|source| format!("source = {}", source))
            .collect::<Vec<_>>()
            .join("\n");

        format!(
            "\n[server]\n\
             threads = {threads}\n\
             datadir = {datadir}\n\
             \n\
             [stream]\n\
             {sources}\n\
             sampleformat = {sampleformat}\n\
             codec = {codec}\n\
             chunk_ms = {chunk_ms}\n\
             buffer = {buffer}\n\
             send_to_muted = {send_to_muted}\n\
             \n\
             [http]\n\
             enabled = {http_enabled}\n\
             doc_root = /usr/share/snapserver/snapweb/\n\
             \n\
             [tcp]\n\
             enabled = {tcp_enabled}\n\
             \n\
             [logging]\n\
             sink = stderr\n\
             filter = {filter}\n",
            threads = self.server_threads,
            datadir = self.server_datadir,
            sources = sources,
            sampleformat = self.stream_sampleformat,
            codec = self.stream_codec,
            chunk_ms = self.stream_chunk_ms,
            buffer = self.stream_buffer,
            send_to_muted = self.stream_send_to_muted,
            http_enabled = self.http_enabled,
            tcp_enabled = self.tcp_enabled,
            filter = self.logging_filter,
        )
    }
}

/// Whether our pipe sink is already loaded, judged from `pactl list sinks`
/// output.
pub fn sink_loaded(pactl_output: &str) -> bool {
    let marker = format!("{} = ", SINK_TAG);
    pactl_output.lines().any(|line| line.contains(&marker))
}

/// `pactl load-module` arguments for the pipe sink, tagged so a later run
/// can recognise it.
pub fn load_sink_args(timestamp: &str) -> Vec<String> {
    vec![
        "load-module".to_string(),
        "module-pipe-sink".to_string(),
        format!("file={}", SNAPFIFO),
        "sink_name=snapfifo".to_string(),
        "format=s16le".to_string(),
        "rate=48000".to_string(),
        // pactl is picky about sink_properties quoting; this exact form works
        format!(
            r#"sink_properties="device.description='Snapcast\ FIFO'" device.icon_name='mdi:cast-audio' {}='{}'"#,
            SINK_TAG, timestamp
        ),
    ]
}

/// Make the pulse cookie readable by the unprivileged children: group/other
/// read-write on the file, group/other execute on each directory up to (and
/// excluding) `root`.
pub fn relax_cookie_permissions(cookie: &Path, root: &Path) -> io::Result<()> {
    let metadata = std::fs::metadata(cookie)?;
    let mut permissions = metadata.permissions();
    permissions.set_mode(permissions.mode() | 0o066);
    std::fs::set_permissions(cookie, permissions)?;

    for parent in cookie.ancestors().skip(1) {
        if parent == root {
            break;
        }
        let metadata = std::fs::metadata(parent)?;
        let mut permissions = metadata.permissions();
        permissions.set_mode(permissions.mode() | 0o011);
        std::fs::set_permissions(parent, permissions)?;
    }

    Ok(())
}

/// Drop to nobody:audio. VLC refuses to run as root, and the audio group is
/// what grants the pulse socket. The gid must change before the uid.
pub fn drop_privileges() -> Result<(), SnapproxyError> {
    let group = nix::unistd::Group::from_name("audio")?
        .ok_or_else(|| SnapproxyError::MissingGroup("audio".to_string()))?;
    let user = nix::unistd::User::from_name("nobody")?
        .ok_or_else(|| SnapproxyError::MissingUser("nobody".to_string()))?;

    nix::unistd::setgid(group.gid)?;
    nix::unistd::setuid(user.uid)?;
    Ok(())
}

pub async fn run(options: &Options) -> anyhow::Result<()> {
    let config = SnapproxyConfig::from_options(options)?;

    info!("Dumping config to config file");
    std::fs::write(CONFIG_FILE, config.render_config())?;

    if !Path::new(SECRET_FILE).exists() {
        info!("generating secret");
    }
    let secret = secrets::ensure_secret_file(Path::new(SECRET_FILE))?;

    // Set up the PulseAudio pipe sink, once
    let mut list_sinks = Command::new("pactl");
    list_sinks.args(["list", "sinks"]);
    let sinks = supervisor::check_output("pactl list sinks", &mut list_sinks).await?;
    if !sink_loaded(&sinks) {
        let mut load = Command::new("pactl");
        load.args(load_sink_args(&chrono::Local::now().to_string()));
        supervisor::check_call("pactl load-module", &mut load).await?;
    }

    // Before dropping privileges, make sure the children can still reach the
    // pulse cookie.
    relax_cookie_permissions(Path::new(PULSE_COOKIE), Path::new("/"))?;
    drop_privileges()?;

    let mut snapserver = Command::new("snapserver");
    snapserver.args(["-c", CONFIG_FILE]);

    let mut vlc = Command::new("cvlc");
    vlc.args(["--extraintf", "telnet", "--telnet-password", &secret]);
    // The general purpose here is endless HTTP streams
    vlc.args(["--http-continuous", "--http-reconnect"]);

    let mut supervisor = Supervisor::new();
    supervisor.spawn("snapserver", &mut snapserver)?;
    supervisor.spawn("cvlc", &mut vlc)?;

    match supervisor.run_to_exit().await? {}
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> SnapproxyConfig {
        SnapproxyConfig {
            server_threads: 2,
            server_datadir: "/data/snapserver".to_string(),
            stream_sources: vec![
                "pipe:///run/audio/snapfifo?name=fifo".to_string(),
                "librespot:///usr/bin/librespot?name=spotify".to_string(),
            ],
            stream_sampleformat: "48000:16:2".to_string(),
            stream_codec: "flac".to_string(),
            stream_chunk_ms: 20,
            stream_buffer: 1000,
            stream_send_to_muted: false,
            http_enabled: true,
            tcp_enabled: true,
            logging_filter: "*:info".to_string(),
        }
    }

    #[test]
    fn test_render_config() {
        let rendered = config().render_config();
        assert_eq!(
            rendered,
            "\n[server]\n\
             threads = 2\n\
             datadir = /data/snapserver\n\
             \n\
             [stream]\n\
             source = pipe:///run/audio/snapfifo?name=fifo\n\
             source = librespot:///usr/bin/librespot?name=spotify\n\
             sampleformat = 48000:16:2\n\
             codec = flac\n\
             chunk_ms = 20\n\
             buffer = 1000\n\
             send_to_muted = false\n\
             \n\
             [http]\n\
             enabled = true\n\
             doc_root = /usr/share/snapserver/snapweb/\n\
             \n\
             [tcp]\n\
             enabled = true\n\
             \n\
             [logging]\n\
             sink = stderr\n\
             filter = *:info\n"
        );
    }

    #[test]
    fn test_sink_loaded() {
        let loaded = "Sink #4\n\tProperties:\n\t\tsnapproxy.pipe-sink = '2024-01-01 10:00:00'\n";
        assert!(sink_loaded(loaded));
        assert!(!sink_loaded("Sink #0\n\tProperties:\n\t\tdevice.description = 'Speakers'\n"));
    }

    #[test]
    fn test_load_sink_args_tagged() {
        let args = load_sink_args("2024-01-01 10:00:00");
        assert_eq!(args[0], "load-module");
        assert_eq!(args[1], "module-pipe-sink");
        assert!(args.iter().any(|a| a == "sink_name=snapfifo"));
        assert!(
            args.last()
                .unwrap()
                .contains("snapproxy.pipe-sink='2024-01-01 10:00:00'")
        );
    }

    #[test]
    fn test_relax_cookie_permissions() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let cookie_dir = temp_dir.path().join(".config").join("pulse");
        std::fs::create_dir_all(&cookie_dir).unwrap();
        let cookie = cookie_dir.join("cookie");
        std::fs::write(&cookie, b"cookie").unwrap();
        std::fs::set_permissions(&cookie, std::fs::Permissions::from_mode(0o600)).unwrap();
        std::fs::set_permissions(&cookie_dir, std::fs::Permissions::from_mode(0o700)).unwrap();

        relax_cookie_permissions(&cookie, temp_dir.path()).unwrap();

        let cookie_mode = std::fs::metadata(&cookie).unwrap().permissions().mode() & 0o777;
        assert_eq!(cookie_mode, 0o666);
        let dir_mode = std::fs::metadata(&cookie_dir).unwrap().permissions().mode() & 0o777;
        assert_eq!(dir_mode, 0o711);
    }

    #[test]
    fn test_from_options_collects_errors() {
        let options = Options::from_json(
            "/data/options.json",
            r#"{"server_threads": 2, "stream_sources": "not a list"}"#,
        )
        .unwrap();

        let err = SnapproxyConfig::from_options(&options).unwrap_err();
        let rendered = format!("{}", err);
        assert!(rendered.contains("stream_sources must be a list of strings"));
        assert!(rendered.contains("server_datadir is required"));
    }
}
