mod cli;
mod error;

use std::sync::Arc;

use clap::Parser;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{info, warn};

use divert_core::{DirectRule, ProxyConfig, ProxyServer, Stats, Upstream};
use divert_settings::{ConfigLoader, Settings};

use cli::Cli;
use error::CliError;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    setup_tracing(cli.verbose);

    if let Err(e) = run(cli).await {
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<(), CliError> {
    let settings = ConfigLoader::load(cli.config.as_deref())?;
    let config = build_config(&cli, settings)?;

    let server = ProxyServer::new(config)?;
    spawn_stats_dump(server.stats());
    server.run().await?;
    Ok(())
}

/// Merge CLI flags over file settings into the engine configuration.
/// Flags win for scalars and replace the file's lists when given.
fn build_config(cli: &Cli, settings: Settings) -> Result<ProxyConfig, CliError> {
    let listen = cli
        .listen
        .clone()
        .or(settings.listen)
        .ok_or_else(|| {
            CliError::Other("no listen address configured (use --listen or a config file)".into())
        })?;
    let listen_addr = listen
        .parse()
        .map_err(|_| CliError::Other(format!("invalid listen address `{listen}`")))?;

    let proxy_specs = if cli.proxies.is_empty() {
        settings.proxies
    } else {
        cli.proxies.clone()
    };
    let upstreams = proxy_specs
        .iter()
        .map(|spec| Upstream::parse(spec))
        .collect::<Result<Vec<_>, _>>()?;

    let direct_specs = if cli.directs.is_empty() {
        settings.directs
    } else {
        cli.directs.clone()
    };
    let direct_rules = parse_direct_rules(&direct_specs)?;

    let defaults = ProxyConfig::default();
    Ok(ProxyConfig {
        listen_addr,
        upstreams,
        direct_rules,
        max_connections: cli
            .max_connections
            .or(settings.max_connections)
            .unwrap_or(defaults.max_connections),
        relay_redirects: cli.relay_redirects || settings.relay_redirects,
        reverse_lookups: cli.reverse_lookups || settings.reverse_lookups,
        sni_parsing: cli.sni || settings.sni_parsing,
        skip_upstream_healthcheck: cli.skip_healthcheck || settings.skip_upstream_healthcheck,
    })
}

fn parse_direct_rules(specs: &[String]) -> Result<Vec<DirectRule>, CliError> {
    specs
        .iter()
        .map(|spec| DirectRule::parse(spec).map_err(CliError::from))
        .collect()
}

/// Log a counter snapshot every time the process receives SIGUSR1.
fn spawn_stats_dump(stats: Arc<Stats>) {
    tokio::spawn(async move {
        let mut usr1 = match signal(SignalKind::user_defined1()) {
            Ok(s) => s,
            Err(e) => {
                warn!(error = %e, "could not install SIGUSR1 handler, stats dump disabled");
                return;
            }
        };
        while usr1.recv().await.is_some() {
            info!(stats = %stats.snapshot(), "statistics");
        }
    });
}

fn setup_tracing(verbose: u8) {
    let level = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };

    let filter = std::env::var("DIVERT_LOG").unwrap_or_else(|_| level.to_string());

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(filter))
        .with_writer(std::io::stderr)
        .init();
}
