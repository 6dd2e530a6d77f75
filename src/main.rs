use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use donate_bridge::alerts::donation_alerts::DonationAlertsSink;
use donate_bridge::alerts::log::LogSink;
use donate_bridge::auth::oauth::OAuthClient;
use donate_bridge::clock::{Clock, SystemClock};
use donate_bridge::config::{
    default_config_path, load_config, save_config, spawn_credential_writer, AppConfig,
};
use donate_bridge::filter::TextFilter;
use donate_bridge::psp::lolzteam::LolzteamSource;
use donate_bridge::psp::mock::MockSource;
use donate_bridge::{
    AlertSink, Credentials, EngineState, EventBus, Ledger, PauseReason, PaymentSource, Provider,
    SyncEngine, SyncEvent, TokenStore,
};

#[derive(Parser)]
#[command(name = "donate-bridge", version, about = "Forward received payments as stream alerts")]
struct Cli {
    /// Config file (defaults to the user config directory).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Poll for payments and forward them until Ctrl-C.
    Run {
        /// Use a random payment source and log alerts instead of posting them.
        #[arg(long)]
        demo: bool,
    },
    /// Print the URL to open for authorizing a provider.
    AuthorizeUrl { provider: Provider },
    /// Exchange an authorization code for tokens and store them.
    Exchange { provider: Provider, code: String },
    /// Forget stored tokens for a provider.
    Logout { provider: Provider },
    /// Show how many payments were forwarded so far.
    Stats,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();
    let config_path = cli.config.unwrap_or_else(default_config_path);
    let mut config = load_config(&config_path)?;

    match cli.command.unwrap_or(Command::Run { demo: false }) {
        Command::Run { demo } => run(&config_path, config, demo).await,
        Command::AuthorizeUrl { provider } => {
            let oauth = OAuthClient::new(
                provider,
                config.provider(provider).clone(),
                config.sync.request_timeout(),
            )?;
            println!("{}", oauth.authorize_url());
            Ok(())
        }
        Command::Exchange { provider, code } => {
            let oauth = OAuthClient::new(
                provider,
                config.provider(provider).clone(),
                config.sync.request_timeout(),
            )?;
            let credentials = oauth
                .exchange_code(&code, SystemClock.now())
                .await
                .with_context(|| format!("authorizing {provider}"))?;
            config.provider_mut(provider).credentials = Some(credentials);
            save_config(&config_path, &config)?;
            info!(provider = %provider, "Credentials stored");
            Ok(())
        }
        Command::Logout { provider } => {
            config.provider_mut(provider).credentials = None;
            save_config(&config_path, &config)?;
            info!(provider = %provider, "Credentials removed");
            Ok(())
        }
        Command::Stats => {
            let ledger_path = config.ledger_path(&config_path);
            if !ledger_path.exists() {
                println!("No payments forwarded yet.");
                return Ok(());
            }
            let ledger = Ledger::open(&ledger_path, SystemClock.now())?;
            let stats = ledger.stats();
            println!(
                "Forwarded {} payments, total {}",
                stats.forwarded_count, stats.forwarded_total
            );
            Ok(())
        }
    }
}

fn demo_credentials(provider: Provider) -> Credentials {
    Credentials {
        provider,
        access_token: "demo".to_string(),
        refresh_token: None,
        expires_at: None,
    }
}

async fn run(config_path: &Path, mut config: AppConfig, demo: bool) -> Result<()> {
    config.sync.validate()?;
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let timeout = config.sync.request_timeout();

    let mut store = TokenStore::new(clock.clone(), config.sync.refresh_margin());
    for provider in Provider::ALL {
        let credentials = if demo {
            Some(demo_credentials(provider))
        } else {
            let settings = config.provider(provider).clone();
            let oauth = OAuthClient::new(provider, settings.clone(), timeout)?;
            store = store.with_refresher(provider, Arc::new(oauth));
            settings.credentials
        };
        store = store.with_credentials(credentials);
    }
    let tokens = Arc::new(store);

    let filter = TextFilter::new(&config.filter);
    let (source, sink, ledger): (Arc<dyn PaymentSource>, Arc<dyn AlertSink>, Ledger) = if demo {
        (
            Arc::new(MockSource::new()),
            Arc::new(LogSink::new(filter)),
            Ledger::in_memory(clock.now()),
        )
    } else {
        (
            Arc::new(LolzteamSource::new(config.source.api_base.clone(), tokens.clone(), timeout)?),
            Arc::new(DonationAlertsSink::new(
                config.sink.api_base.clone(),
                tokens.clone(),
                filter,
                timeout,
            )?),
            Ledger::open(config.ledger_path(config_path), clock.now())?,
        )
    };

    let credential_writer = (!demo).then(|| {
        spawn_credential_writer(config_path.to_path_buf(), config.clone(), tokens.clone())
    });

    let events = EventBus::default();
    let observer = events.subscribe(report_event);

    let (engine, handle) = SyncEngine::new(
        config.sync.clone(),
        tokens.clone(),
        source,
        sink,
        ledger,
        events,
        clock,
    );
    let engine_task = tokio::spawn(engine.run());

    tokio::signal::ctrl_c().await?;
    handle.shutdown();
    let ledger = engine_task.await?;
    observer.abort();
    if let Some(writer) = credential_writer {
        writer.abort();
    }

    let stats = ledger.stats();
    info!(
        forwarded = stats.forwarded_count,
        total = %stats.forwarded_total,
        "Session finished"
    );

    if !demo {
        // Final write covers a change the writer task had not picked up yet.
        for provider in Provider::ALL {
            config.provider_mut(provider).credentials = tokens.credentials(provider);
        }
        save_config(config_path, &config)?;
    }
    Ok(())
}

fn report_event(event: SyncEvent) {
    match event {
        SyncEvent::PaymentForwarded { payment } => {
            info!(
                "New payment: {} {} from {}{}",
                payment.amount,
                payment.currency,
                payment.sender,
                if payment.message.is_empty() {
                    String::new()
                } else {
                    format!(" \"{}\"", payment.message)
                }
            );
        }
        SyncEvent::AuthRequired { provider } => {
            warn!(
                "Authorization required for {provider}: run `donate-bridge authorize-url {provider}` then `donate-bridge exchange {provider} <code>`"
            );
        }
        SyncEvent::CycleError { message, retry_in } => match retry_in {
            Some(delay) => warn!("Poll failed ({message}), retrying in {}s", delay.as_secs()),
            None => warn!("Poll failed: {message}"),
        },
        SyncEvent::PermanentFailure {
            payment,
            attempts,
            reason,
        } => {
            error!(
                "Gave up on payment {} after {attempts} attempts: {reason}",
                payment.id
            );
        }
        SyncEvent::StateChanged { state } => match state {
            EngineState::Paused(PauseReason::Operator) => info!("Paused"),
            EngineState::Paused(PauseReason::AuthRequired(provider)) => {
                warn!("Paused until {provider} is authorized again")
            }
            EngineState::Backoff { .. } => {}
            other => info!(state = ?other, "Engine state"),
        },
    }
}
