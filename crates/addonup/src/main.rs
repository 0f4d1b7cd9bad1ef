mod cli;

use std::path::Path;

use addonup_config::Options;
use clap::Parser;
use tracing_subscriber::filter::LevelFilter;

use addonup::SupervisorError;
use addonup::agents;
use addonup::launchers;
use cli::AddonCommand;
use cli::Cli;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_max_level(LevelFilter::from(cli.log_level))
        .init();

    if let Err(error) = run(cli).await {
        // A supervised child's exit becomes our exit code, so the Home
        // Assistant watchdog sees the real failure.
        if let Some(code) = error
            .downcast_ref::<SupervisorError>()
            .and_then(SupervisorError::exit_code)
        {
            tracing::error!("{}", error);
            std::process::exit(code);
        }

        tracing::error!("{:#}", error);
        std::process::exit(1);
    }
}

/// Load add-on options, warning when the file carries no options at all.
fn load_options(path: &Path) -> anyhow::Result<Options> {
    let options = Options::from_file(path)?;
    if options.is_empty() {
        tracing::warn!("Options file {} contains no options", path.display());
    }
    Ok(options)
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        AddonCommand::Heisenbridge => {
            let options = load_options(&cli.options)?;
            launchers::heisenbridge::run(&options).await
        }
        AddonCommand::BridgeStack { webmail } => {
            let options = load_options(&cli.options)?;
            launchers::stack::run(&options, webmail).await
        }
        AddonCommand::Snapproxy => {
            let options = load_options(&cli.options)?;
            launchers::snapproxy::run(&options).await
        }
        AddonCommand::Synapse => {
            let mut options = load_options(&cli.options)?;
            launchers::synapse::run(&mut options).await
        }
        AddonCommand::Mautrix { flavor } => {
            let mut options = load_options(&cli.options)?;
            launchers::mautrix::run(&mut options, flavor).await
        }
        AddonCommand::MxPuppetSteam => {
            let options = load_options(&cli.options)?;
            launchers::mx_puppet::run(&options).await
        }
        AddonCommand::Roundcube { args } => {
            let options = load_options(&cli.options)?;
            launchers::roundcube::run(&options, &args).await
        }
        AddonCommand::Cypht { args } => {
            let options = load_options(&cli.options)?;
            launchers::cypht::run(&options, &args).await
        }
        AddonCommand::Pipewire(mqtt) => agents::pipewire::run(&mqtt.settings("pipewire-mqtt")).await,
        AddonCommand::Screensaver { mqtt, session } => {
            agents::screensaver::run(&mqtt.settings("screensaver-mqtt"), &session).await
        }
        AddonCommand::Tramtracker(args) => agents::tramtracker::run(&args).await,
        AddonCommand::JellyfinMissing(args) => agents::jellyfin::run(&args).await,
    }
}
