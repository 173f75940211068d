// src/lib.rs

pub mod backend;
pub mod cli;
pub mod config;
pub mod dag;
pub mod errors;
pub mod exec;
pub mod logging;
pub mod models;
pub mod schemas;
pub mod store;
pub mod types;
pub mod workspace;

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Result, bail};
use tracing::{debug, info, warn};

use crate::backend::Client;
use crate::cli::CliArgs;
use crate::config::loader::load_and_validate;
use crate::config::model::WorkspaceFile;
use crate::dag::ComputePlanBuilder;
use crate::models::{ComputePlan, ComputePlanStatus};
use crate::store::InMemoryAssetStore;
use crate::types::BackendType;
use crate::workspace::{RegisteredAssets, identity_task_keys, new_task_keys, plan_request};

/// High-level entry point used by `main.rs`.
///
/// This wires together:
/// - workspace loading and validation
/// - client construction (local store, spawner, optional remote)
/// - asset registration
/// - compute plan submission and the final summary
pub async fn run(args: CliArgs) -> Result<()> {
    let config_path = PathBuf::from(&args.config);
    let mut cfg = load_and_validate(&config_path)?;

    if let Some(backend) = args.backend {
        if backend == BackendType::Remote && cfg.client.url.is_none() {
            bail!("--backend remote requires [client].url (or FEDPLAN_URL)");
        }
        if backend == BackendType::Remote && cfg.client.hybrid {
            bail!("--backend remote cannot be combined with [client].hybrid");
        }
        debug!(%backend, "backend overridden from command line");
        cfg.client.backend = backend;
    }

    if args.dry_run {
        print_dry_run(&cfg)?;
        return Ok(());
    }

    cfg.client.local_worker_dir = cfg.resolve(&cfg.client.local_worker_dir);

    let mut client = Client::from_config(&cfg.client, InMemoryAssetStore::shared())?;
    if let Some(level) = args.log_level {
        client = client.with_worker_log_level(level.as_str());
    }

    let assets = workspace::register_assets(&client, &cfg).await?;

    let Some(section) = cfg.compute_plan.as_ref() else {
        info!("workspace has no [compute_plan]; nothing to run");
        return Ok(());
    };

    let request = plan_request(&cfg, section, &assets, &new_task_keys(section))?;
    let plan_key = request.key.clone().unwrap_or_default();
    info!(compute_plan = %plan_key, tasks = request.batches.len(), "submitting compute plan");

    let submitted = client.add_compute_plan(request).await;
    let plan = match submitted {
        Ok(plan) if client.is_remote() => {
            client
                .wait_compute_plan(&plan.key, Duration::from_secs(args.timeout))
                .await?
        }
        Ok(plan) => plan,
        Err(err) => {
            // A failed local run leaves the plan in the store with its final counters.
            if let Ok(plan) = client.get::<ComputePlan>(&plan_key).await {
                print_summary(&plan);
            }
            return Err(err.into());
        }
    };

    print_summary(&plan);

    let performances = client.get_performances(&plan.key).await?;
    if !performances.entries.is_empty() {
        println!();
        println!("performances ({}):", performances.entries.len());
        for entry in &performances.entries {
            println!(
                "  - rank {} {} [{}] {} = {}",
                entry.rank, entry.compute_task_key, entry.worker, entry.identifier, entry.performance
            );
        }
    }

    if plan.status == ComputePlanStatus::Failed {
        bail!("compute plan {} failed", plan.key);
    }
    Ok(())
}

fn print_summary(plan: &ComputePlan) {
    println!("compute plan {} ({})", plan.key, plan.name);
    println!("  status: {:?}", plan.status);
    println!(
        "  tasks: {} (done {}, failed {}, canceled {}, waiting {}, doing {})",
        plan.task_count,
        plan.done_count,
        plan.failed_count,
        plan.canceled_count,
        plan.todo_count,
        plan.doing_count
    );
    if let Some(duration) = plan.duration {
        println!("  duration: {duration}s");
    }
}

/// Print assets and the ranked plan without registering or running anything.
fn print_dry_run(cfg: &WorkspaceFile) -> Result<()> {
    println!("fedplan dry-run");
    println!("  client.backend = {}", cfg.client.backend);
    println!("  client.organization = {}", cfg.client.organization);
    if cfg.client.hybrid {
        println!("  client.hybrid = true");
    }
    println!();

    println!("datasets ({}):", cfg.dataset.len());
    for dataset in &cfg.dataset {
        println!("  - {} ({:?})", dataset.id, cfg.resolve(&dataset.opener));
    }
    println!("data samples ({}):", cfg.data_sample.len());
    for sample in &cfg.data_sample {
        println!("  - {} -> {:?}", sample.id, sample.datasets);
    }
    println!("functions ({}):", cfg.function.len());
    for function in &cfg.function {
        println!("  - {} [{:?}]", function.id, function.category);
    }

    let Some(section) = cfg.compute_plan.as_ref() else {
        warn!("workspace has no [compute_plan]");
        return Ok(());
    };

    let request = plan_request(
        cfg,
        section,
        &RegisteredAssets::identity(cfg),
        &identity_task_keys(section),
    )?;
    let ranked = ComputePlanBuilder::new(&section.name).build_ranked(&request.batches)?;

    println!();
    println!("compute plan '{}' ({} tasks):", section.name, ranked.len());
    for task in &ranked {
        println!(
            "  - rank {} {} [{:?}] function={} worker={}",
            task.rank.unwrap_or(0),
            task.key.as_deref().unwrap_or_default(),
            task.category,
            task.function_key,
            task.worker
        );
    }

    debug!("dry-run complete (no execution)");
    Ok(())
}
