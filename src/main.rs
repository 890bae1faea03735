use chrono::Utc;
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use trailgate::adapters::{TopstepClient, TopstepMarketHub};
use trailgate::api::{self, AppState};
use trailgate::cli::{Cli, Commands};
use trailgate::config::AppConfig;
use trailgate::coordination::{install_signal_handlers, GracefulShutdown};
use trailgate::domain::ContractDirectory;
use trailgate::error::{Result, TrailgateError};
use trailgate::services::{Orchestrator, OrchestratorSettings, QuoteStreams};
use trailgate::supervisor::{ConnectionGuard, CredentialRefresher, CredentialStore};

mod main_runtime;

use main_runtime::{init_logging, init_logging_simple};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let cfg = AppConfig::load_from(&cli.config)?;

    match cli.command {
        Commands::CheckConfig => {
            init_logging_simple();
            check_config(&cfg)
        }
        Commands::Resolve { ticker } => {
            init_logging_simple();
            resolve(&cfg, &ticker).await
        }
        Commands::Serve => {
            init_logging(&cfg.logging);
            run_server(cfg).await
        }
    }
}

fn validated(cfg: &AppConfig) -> Result<()> {
    cfg.validate()
        .map_err(|errors| TrailgateError::Validation(errors.join("; ")))
}

fn check_config(cfg: &AppConfig) -> Result<()> {
    match cfg.validate() {
        Ok(()) => {
            println!("Configuration OK");
            println!("  api base:        {}", cfg.broker.api_base);
            println!("  hub:             {}", cfg.broker.hub_url);
            println!("  default symbol:  {}", cfg.market.default_contract_symbol);
            println!("  tick size:       {}", cfg.market.tick_size);
            println!(
                "  no-trade window: {:02}:00-{:02}:00 {}",
                cfg.session.pause_start_hour, cfg.session.pause_end_hour, cfg.session.timezone
            );
            println!("  listen:          {}:{}", cfg.server.host, cfg.server.port);
            Ok(())
        }
        Err(errors) => {
            for e in &errors {
                println!("  x {}", e);
            }
            Err(TrailgateError::Validation(format!(
                "{} configuration problem(s)",
                errors.len()
            )))
        }
    }
}

async fn resolve(cfg: &AppConfig, ticker: &str) -> Result<()> {
    validated(cfg)?;
    let credentials = Arc::new(CredentialStore::default());
    let client = TopstepClient::connect(&cfg.broker, credentials).await?;
    let contracts = ContractDirectory::new(cfg.market.default_contract_symbol.as_str());

    let key = contracts.resolve_ticker(ticker, &client, Utc::now()).await?;
    println!("{} -> {}", ticker, key);
    Ok(())
}

async fn run_server(cfg: AppConfig) -> Result<()> {
    validated(&cfg)?;
    let settings = OrchestratorSettings::from_config(&cfg)?;

    let credentials = Arc::new(CredentialStore::default());
    let client = Arc::new(TopstepClient::connect(&cfg.broker, Arc::clone(&credentials)).await?);
    info!("Broker session ready (account {})", client.account_id()?);

    let contracts = Arc::new(ContractDirectory::new(
        cfg.market.default_contract_symbol.as_str(),
    ));
    let active = contracts
        .resolve_ticker(contracts.default_symbol(), client.as_ref(), Utc::now())
        .await?;
    info!("Active contract {}", active);

    let hub = Arc::new(TopstepMarketHub::new(cfg.broker.hub_url.as_str()));
    let streams = Arc::new(QuoteStreams::new(
        hub,
        settings.session,
        credentials.token().await,
    ));
    let orchestrator = Arc::new(Orchestrator::new(
        client.clone(),
        Arc::clone(&streams),
        settings.clone(),
    ));

    let guard = Arc::new(ConnectionGuard::new(
        Arc::clone(&streams),
        Arc::clone(&credentials),
        settings.session,
        active,
        &cfg.guard,
    ));
    let guard_task = Arc::clone(&guard).start();

    let refresher = Arc::new(
        CredentialRefresher::new(
            Arc::clone(&credentials),
            client.clone(),
            Duration::from_secs(cfg.auth.refresh_interval_secs),
        )
        .with_streams(Arc::clone(&streams)),
    );
    let refresher_task = Arc::clone(&refresher).start();

    let shutdown = Arc::new(GracefulShutdown::with_defaults());
    install_signal_handlers(Arc::clone(&shutdown));

    let state = AppState::new(Arc::clone(&orchestrator), contracts, client.clone());
    let mut server_token = shutdown.token();
    let host = cfg.server.host.clone();
    let port = cfg.server.port;
    let mut server = tokio::spawn(async move {
        api::serve(state, &host, port, async move {
            server_token.wait_for_shutdown().await;
        })
        .await
    });

    let mut token = shutdown.token();
    let server_result = tokio::select! {
        signal = token.wait_for_shutdown() => {
            info!("Shutdown requested ({})", signal);
            match tokio::time::timeout(Duration::from_secs(5), &mut server).await {
                Ok(Ok(result)) => result,
                Ok(Err(e)) => Err(TrailgateError::Internal(format!("server task: {}", e))),
                Err(_) => {
                    warn!("Webhook server did not stop in time");
                    server.abort();
                    Ok(())
                }
            }
        }
        joined = &mut server => {
            let result = joined
                .map_err(|e| TrailgateError::Internal(format!("server task: {}", e)))
                .and_then(|r| r);
            if let Err(e) = &result {
                error!("Webhook server exited: {}", e);
            }
            result
        }
    };

    shutdown
        .execute(
            async {
                guard.stop();
                refresher.stop();
                guard_task.abort();
                refresher_task.abort();
            },
            orchestrator.shutdown(),
        )
        .await;
    info!("Shutdown complete");

    server_result
}
