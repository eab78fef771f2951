use std::sync::Arc;

use anyhow::Context as _;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use dunning::channels::web::{GatewayState, start_server};
use dunning::collections::{
    Dispatcher, EventLedger, StatusService, TokenSealer, TokenService, WebhookIngestor, audit,
    reconcile,
};
use dunning::config::{Config, LogFormat};
use dunning::db::{Channel, Database, connect_from_config};

#[derive(Parser, Debug)]
#[command(name = "dunning", version, about = "Debt-collection event correlation service")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the HTTP gateway (default).
    Serve,
    /// Apply database migrations and exit.
    Migrate,
    /// List intents with no provider outcome and print them as JSON.
    Sweep {
        #[arg(long, default_value_t = 60, env = "SWEEP_OLDER_THAN_MINUTES")]
        older_than_minutes: i64,
    },
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    match format {
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init(),
        LogFormat::Pretty => tracing_subscriber::fmt().with_env_filter(filter).init(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();
    let config = Config::from_env().context("invalid configuration")?;
    init_tracing(config.log_format);
    audit::init(&config.audit);

    let db = connect_from_config(&config.database)
        .await
        .context("failed to open database")?;

    match cli.command.unwrap_or(Command::Serve) {
        Command::Migrate => {
            tracing::info!("Migrations applied");
            Ok(())
        }
        Command::Sweep { older_than_minutes } => {
            anyhow::ensure!(older_than_minutes >= 0, "--older-than-minutes must not be negative");
            let report = reconcile::sweep(&db, chrono::Duration::minutes(older_than_minutes))
                .await
                .context("reconciliation sweep failed")?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
        Command::Serve => serve(config, db).await,
    }
}

async fn serve(config: Config, db: Arc<dyn Database>) -> anyhow::Result<()> {
    let Config {
        http,
        webhooks,
        status,
        dispatch,
        tokens: token_config,
        ..
    } = config;

    let ledger = EventLedger::new(Arc::clone(&db));
    let tokens = match &token_config.sealing_key {
        Some(key) => TokenService::new(Arc::clone(&db))
            .with_sealer(TokenSealer::from_secret(key).context("invalid token sealing key")?),
        None => {
            tracing::warn!(
                "TOKEN_SEALING_KEY unset; links in outbound messages need a token rotation after restart"
            );
            TokenService::new(Arc::clone(&db))
        }
    };
    let dispatcher = Dispatcher::new(
        Arc::clone(&db),
        ledger.clone(),
        tokens.clone(),
        &dispatch,
        http.public_base_url.clone(),
    );
    for channel in [Channel::Email, Channel::Sms, Channel::Voice] {
        if !dispatcher.has_channel(channel) {
            tracing::info!(
                channel = channel.as_str(),
                "No provider client registered; sends on this channel answer 503"
            );
        }
    }

    let state = Arc::new(GatewayState {
        db: Arc::clone(&db),
        tokens,
        ledger: ledger.clone(),
        ingestor: WebhookIngestor::new(
            Arc::clone(&db),
            ledger.clone(),
            webhooks,
            http.public_base_url.clone(),
            dispatch.default_currency.clone(),
        ),
        status: StatusService::new(ledger, status),
        dispatcher,
        public_base_url: http.public_base_url.clone(),
        shutdown_tx: tokio::sync::RwLock::new(None),
        startup_time: std::time::Instant::now(),
    });

    start_server(http.addr, Arc::clone(&state), http.api_token)
        .await
        .context("failed to start gateway")?;

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    if let Some(tx) = state.shutdown_tx.write().await.take() {
        let _ = tx.send(());
    }
    Ok(())
}
