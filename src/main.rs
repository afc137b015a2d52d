use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::Parser;
use homedir::my_home;
use indicatif::{ProgressBar, ProgressStyle};
use tracing_subscriber::EnvFilter;

use vsearch::catalog::shopify::ShopifyProvider;
use vsearch::config::Config;
use vsearch::jobs::{IndexingOrchestrator, JobRunner, JobStatus, ThreadedRunner};
use vsearch::semantic::{SearchRequest, VisualSearch};
use vsearch::store::{JsonStore, MetadataStore, TenantRecord};
use vsearch::tenant::TenantId;

mod cli;

use cli::Command;

const POLL_INTERVAL: Duration = Duration::from_millis(250);

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn base_path(data_dir: Option<PathBuf>) -> anyhow::Result<PathBuf> {
    if let Some(dir) = data_dir {
        return Ok(dir);
    }
    if let Ok(dir) = std::env::var("VSEARCH_DIR") {
        return Ok(PathBuf::from(dir));
    }
    let home = my_home()?.context("Could not determine home directory")?;
    Ok(home.join(".local/share/vsearch"))
}

fn tenant_id(raw: &str) -> anyhow::Result<TenantId> {
    Ok(TenantId::new(raw)?)
}

fn print_json<T: serde::Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn main() -> anyhow::Result<()> {
    init_tracing();
    let args = cli::Args::parse();

    let config = Config::load_with(base_path(args.data_dir)?)?;
    let search = VisualSearch::start(&config)?;
    let store = Arc::new(JsonStore::open(config.store_path())?);
    let catalogs = Arc::new(ShopifyProvider::new(
        &config.catalog,
        config.embedding.max_image_bytes,
    )?);
    let orchestrator = Arc::new(IndexingOrchestrator::new(
        search.clone(),
        store.clone(),
        catalogs,
        &config,
    ));

    orchestrator.stale_jobs()?;

    match args.command {
        Command::Index {
            tenant,
            domain,
            token,
            no_progress,
        } => {
            let tenant = tenant_id(&tenant)?;
            if let (Some(domain), Some(token)) = (domain, token) {
                orchestrator.register_tenant(TenantRecord::active(tenant.clone(), domain, token))?;
            }

            let runner = ThreadedRunner::start(orchestrator.clone());
            let job = runner.submit(&tenant)?;
            runner.run(&job.id)?;

            let job = if no_progress {
                runner.wait(&job.id, POLL_INTERVAL)?
            } else {
                let bar = ProgressBar::new(0);
                bar.set_style(
                    ProgressStyle::with_template("{spinner} [{bar:40}] {pos}/{len} {msg}")?
                        .progress_chars("=> "),
                );
                loop {
                    let job = runner.poll(&job.id)?;
                    bar.set_length(job.total as u64);
                    bar.set_position(job.processed as u64);
                    bar.set_message(job.status.to_string());
                    if job.is_terminal() {
                        bar.finish();
                        break job;
                    }
                    std::thread::sleep(POLL_INTERVAL);
                }
            };
            runner.shutdown();

            print_json(&job)?;
            if job.status == JobStatus::Error {
                bail!(
                    "indexing failed: {}",
                    job.error.as_deref().unwrap_or("unknown error")
                );
            }
        }

        Command::Search {
            tenant,
            image,
            limit,
        } => {
            let image = std::fs::read(&image)
                .with_context(|| format!("failed to read {}", image.display()))?;
            let response = search.query(&SearchRequest {
                tenant: tenant_id(&tenant)?,
                image,
                limit,
            })?;
            print_json(&response)?;
        }

        Command::Status { tenant } => {
            print_json(&orchestrator.report(&tenant_id(&tenant)?)?)?;
        }

        Command::Uninstall { tenant } => {
            let tenant = tenant_id(&tenant)?;
            if store.get_tenant(&tenant)?.is_none() {
                bail!("tenant {tenant} is not registered");
            }
            orchestrator.uninstall(&tenant)?;
            println!("Tenant {tenant} uninstalled");
        }

        Command::Jobs { tenant } => {
            let tenant = tenant.as_deref().map(tenant_id).transpose()?;
            print_json(&orchestrator.jobs(tenant.as_ref())?)?;
        }

        Command::Health => {
            print_json(&search.health())?;
        }
    }

    Ok(())
}
