use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use clap::{Parser, Subcommand};

use ypf_core::ProductKind;
use ypf_elt::{EltConfig, PolicyPipeline, ProductPipeline, RunSummary, StatusUpdater};
use ypf_sources::{Enricher, FinlifeApi, GeminiEnricher, NoopEnricher, YouthPolicyApi};
use ypf_storage::PgStore;
use ypf_web::AppState;

#[derive(Debug, Parser)]
#[command(name = "ypf")]
#[command(about = "Youth policy and financial product data platform")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Full policy refresh: ingest, land, reconcile, promote, update status.
    RefreshPolicies,
    /// Full product refresh across deposit and saving feeds.
    RefreshProducts,
    /// Re-drive the latest policy run from its first incomplete stage.
    ResumePolicies,
    /// Re-drive the latest product run from its first incomplete stage.
    ResumeProducts,
    /// Rederive policy statuses against today's date.
    UpdateStatus,
    /// Serve the read-only JSON API.
    Serve {
        #[arg(long, default_value_t = 8000)]
        port: u16,
    },
    /// Create or update the database schema.
    Migrate,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cli = Cli::parse();
    let config = EltConfig::from_env()?;

    match cli.command {
        Commands::RefreshPolicies => {
            let store = connect(&config).await?;
            let enricher = build_enricher(&config)?;
            let feed = YouthPolicyApi::new(
                config.policy_base_url.clone(),
                config.policy_api_key.clone(),
                config.page_size,
                config.api_client_config(),
            )?;
            let pipeline = PolicyPipeline {
                store: &store,
                enricher: enricher.as_ref(),
                start_page: config.start_page,
                end_page: config.end_page,
            };
            print_summary("policies", &pipeline.run(&feed).await?);
        }
        Commands::RefreshProducts => {
            let store = connect(&config).await?;
            let deposit = finlife_feed(&config, ProductKind::Deposit)?;
            let saving = finlife_feed(&config, ProductKind::Saving)?;
            let pipeline = ProductPipeline {
                store: &store,
                start_page: config.start_page,
                end_page: config.end_page,
            };
            print_summary("products", &pipeline.run(&[&deposit, &saving]).await?);
        }
        Commands::ResumePolicies => {
            let store = connect(&config).await?;
            let enricher = build_enricher(&config)?;
            let pipeline = PolicyPipeline {
                store: &store,
                enricher: enricher.as_ref(),
                start_page: config.start_page,
                end_page: config.end_page,
            };
            print_summary("policies", &pipeline.resume().await?);
        }
        Commands::ResumeProducts => {
            let store = connect(&config).await?;
            let pipeline = ProductPipeline {
                store: &store,
                start_page: config.start_page,
                end_page: config.end_page,
            };
            print_summary("products", &pipeline.resume().await?);
        }
        Commands::UpdateStatus => {
            let store = connect(&config).await?;
            let updater = StatusUpdater { store: &store };
            let now = Utc::now();
            let changed = updater.run(now.date_naive(), now).await?;
            println!("status refresh complete: changed={changed}");
        }
        Commands::Serve { port } => {
            let store = PgStore::connect(&config.database_url).await?;
            ypf_web::serve(AppState::new(Arc::new(store)), port).await?;
        }
        Commands::Migrate => {
            let store = PgStore::connect(&config.database_url).await?;
            store.bootstrap().await?;
            println!("schema bootstrap complete");
        }
    }

    Ok(())
}

async fn connect(config: &EltConfig) -> Result<PgStore> {
    let store = PgStore::connect(&config.database_url).await?;
    store.bootstrap().await?;
    Ok(store)
}

fn build_enricher(config: &EltConfig) -> Result<Box<dyn Enricher>> {
    match &config.gemini_api_key {
        Some(key) => Ok(Box::new(GeminiEnricher::new(
            key.clone(),
            config.gemini_model.clone(),
            config.http_timeout,
        )?)),
        None => Ok(Box::new(NoopEnricher)),
    }
}

fn finlife_feed(config: &EltConfig, kind: ProductKind) -> Result<FinlifeApi> {
    let base_url = match kind {
        ProductKind::Deposit => config.deposit_base_url.clone(),
        ProductKind::Saving => config.saving_base_url.clone(),
    };
    FinlifeApi::new(
        base_url,
        config.finlife_auth_key.clone(),
        config.top_fin_grp_no.clone(),
        kind,
        config.api_client_config(),
    )
}

fn print_summary(domain: &str, summary: &RunSummary) {
    println!(
        "{domain} refresh complete: run={} pages={} staged={} inserted={} updated={} removed={} unchanged={} status_changes={}",
        summary.run_id,
        summary.pages_ingested,
        summary.records_staged,
        summary.promotion.inserted,
        summary.promotion.updated,
        summary.promotion.removed,
        summary.promotion.unchanged,
        summary.status_changes,
    );
}
