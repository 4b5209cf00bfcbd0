use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use offerbook_sync::{connect_feed, open_catalog, SyncConfig, SyncPoller};
use offerbook_upstream::OfferFeed;
use offerbook_web::{AppState, WebConfig};
use tokio::net::TcpListener;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "offerbook-cli")]
#[command(about = "Offerbook product and offer catalog")]
struct Cli {
    /// Overrides DATABASE_URL.
    #[arg(long, global = true)]
    database_url: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// HTTP API plus the background offer poller.
    Serve {
        #[arg(long)]
        port: Option<u16>,
    },
    /// Run a single poller cycle and print its summary.
    Sync,
    Migrate,
    /// Delete every stored offer.
    PurgeOffers {
        #[arg(long)]
        yes: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();
    let cli = Cli::parse();

    let mut config = SyncConfig::from_env();
    if let Some(url) = cli.database_url {
        config.database_url = url;
    }

    match cli.command.unwrap_or(Commands::Serve { port: None }) {
        Commands::Serve { port } => serve(config, port).await?,
        Commands::Sync => {
            let summary = offerbook_sync::run_sync_once(&config).await?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        Commands::Migrate => {
            open_catalog(&config).await?;
            info!(database_url = %config.database_url, "migrations applied");
        }
        Commands::PurgeOffers { yes } => {
            if !yes {
                bail!("purge-offers deletes all offer history; rerun with --yes to confirm");
            }
            let catalog = open_catalog(&config).await?;
            let removed = catalog.purge_offers().await?;
            println!("purged {removed} offers");
        }
    }

    Ok(())
}

fn init_logging() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,sqlx=warn"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn serve(config: SyncConfig, port: Option<u16>) -> Result<()> {
    let mut web = WebConfig::from_env();
    if let Some(port) = port {
        web.port = port;
    }

    let catalog = open_catalog(&config).await?;
    let feed: Option<Arc<dyn OfferFeed>> = match &config.upstream_base_url {
        Some(_) => Some(connect_feed(&config).await?),
        None => {
            warn!("OFFER_BASE_URL not set; upstream polling and registration disabled");
            None
        }
    };

    let cancel = CancellationToken::new();
    let poller = match (&feed, config.poller_enabled) {
        (Some(feed), true) => {
            let poller = SyncPoller::new(catalog.clone(), feed.clone(), config.poller_settings());
            Some(poller.spawn(cancel.clone()))
        }
        _ => None,
    };

    let mut state = AppState::new(catalog, web.api_token);
    if let Some(feed) = feed {
        state = state.with_registrar(feed);
    }

    let signals = cancel.clone();
    tokio::spawn(async move {
        if let Err(err) = shutdown_signal().await {
            warn!(%err, "signal handler failed; shutting down");
        }
        signals.cancel();
    });

    let listener = TcpListener::bind(("0.0.0.0", web.port))
        .await
        .with_context(|| format!("binding port {}", web.port))?;
    let served = offerbook_web::serve(listener, state, cancel.clone()).await;

    cancel.cancel();
    if let Some(handle) = poller {
        if let Err(err) = handle.await {
            warn!(%err, "poller task ended abnormally");
        }
    }
    served
}

async fn shutdown_signal() -> Result<()> {
    let ctrl_c = async { signal::ctrl_c().await.context("installing Ctrl+C handler") };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .context("installing SIGTERM handler")?
            .recv()
            .await;
        Ok::<(), anyhow::Error>(())
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<Result<()>>();

    tokio::select! {
        result = ctrl_c => {
            result?;
            info!("ctrl_c signal received");
        }
        result = terminate => {
            result?;
            info!("terminate signal received");
        }
    }
    Ok(())
}
