use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use labrelay::bus::open_bus;
use labrelay::config::{ConfigScope, LabRelayConfig};
use labrelay::instrument::build_instrument;
use labrelay::output::{sweep_file_name, SampleMetadata, SampleWriter};
use labrelay::relay::{Dispatcher, RelayClient, RelayServer};
use labrelay::session::InstrumentSession;
use std::path::PathBuf;
use tracing::{info, warn};

/// Instrument sessions and a TCP measurement relay
#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Cli {
    /// Configuration file
    #[clap(long, global = true, default_value = "config/labrelay.toml")]
    config: PathBuf,

    #[clap(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Serve the configured instrument until Ctrl-C
    Serve,
    /// Send one request to a relay
    Call {
        /// Command token, e.g. `I` or `AO0`
        token: String,
        /// Value for write tokens
        #[clap(allow_hyphen_values = true)]
        value: Option<f32>,
        /// Override client.host
        #[clap(long)]
        host: Option<String>,
        /// Override client.port
        #[clap(long)]
        port: Option<u16>,
    },
    /// Run the configured session once and write the samples
    Acquire,
    /// Print the effective configuration
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let scope = match cli.command {
        Commands::Serve => ConfigScope::Relay,
        Commands::Call { .. } => ConfigScope::Client,
        Commands::Acquire => ConfigScope::Session,
        Commands::Config => ConfigScope::Application,
    };
    let config = LabRelayConfig::load_scoped(&cli.config, scope)
        .with_context(|| format!("Failed to load configuration from {}", cli.config.display()))?;
    labrelay::logging::init(&config.application.log_level);

    match cli.command {
        Commands::Serve => serve(config).await,
        Commands::Call {
            token,
            value,
            host,
            port,
        } => call(config, &token, value, host, port).await,
        Commands::Acquire => acquire(config).await,
        Commands::Config => {
            print!("{}", config.to_toml()?);
            Ok(())
        }
    }
}

async fn serve(config: LabRelayConfig) -> Result<()> {
    info!(app = %config.application.name, "Starting relay");
    let instrument = build_instrument(&config.instrument)
        .await
        .context("Failed to open instrument")?;
    let dispatcher = Dispatcher::spawn(instrument, config.relay.dispatcher());

    let server = RelayServer::bind(&config.relay, dispatcher.clone())
        .await
        .with_context(|| format!("Failed to bind relay on {}", config.relay.bind_address()))?;
    println!("Relay listening on {}", server.local_addr());

    server
        .run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "Ctrl-C handler failed; stopping");
            }
        })
        .await?;

    let instrument = dispatcher.shutdown().await?;
    info!(instrument = instrument.name(), "Instrument released");
    Ok(())
}

async fn call(
    config: LabRelayConfig,
    token: &str,
    value: Option<f32>,
    host: Option<String>,
    port: Option<u16>,
) -> Result<()> {
    let mut settings = config.client;
    if let Some(host) = host {
        settings.host = host;
    }
    if let Some(port) = port {
        settings.port = port;
    }
    let client = RelayClient::new(settings);

    let measured = match value {
        Some(value) => client.write(token, value).await,
        None => client.read(token).await,
    }
    .with_context(|| format!("Request '{token}' failed"))?;

    println!("{}", measured.value);
    info!(attempts = measured.attempts, "Request complete");
    Ok(())
}

async fn acquire(config: LabRelayConfig) -> Result<()> {
    let session_config = config
        .session
        .context("No [session] section in the configuration")?;

    let bus = open_bus(&session_config.bus)
        .await
        .with_context(|| format!("Failed to open {}", session_config.bus.resource))?;
    let mut session = InstrumentSession::open(
        bus,
        session_config.profile,
        session_config.options.clone(),
    )
    .await
    .context("Failed to configure instrument")?;

    let mut metadata = SampleMetadata::new(
        session_config.profile,
        &session_config.bus.resource,
        session_config.options.clone(),
    );
    metadata.params = session_config.file_params.clone();
    match session.identify().await {
        Ok(identity) => metadata.identity = Some(identity),
        Err(e) => warn!(error = %e, "Identity query failed"),
    }

    let samples = session.acquire().await.context("Acquisition failed")?;
    session.close();

    let file_name = sweep_file_name(
        &session_config.file_prefix,
        session_config
            .file_params
            .iter()
            .map(|(key, value)| (key.as_str(), *value)),
        "csv",
    );
    let path = session_config.output_dir.join(file_name);
    let mut writer = SampleWriter::create(&path, &metadata)?;
    writer.write_samples(&samples)?;
    let rows = writer.finish()?;

    println!("{rows} samples written to {}", path.display());
    Ok(())
}
