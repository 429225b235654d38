// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;

use rtlaunchd::adapters;
use rtlaunchd::adapters::cli::format;
use rtlaunchd::adapters::cli::{Command, HostsArgs, SubmitArgs};
use rtlaunchd::app::connection::ConnectionManager;
use rtlaunchd::app::orchestrator::ExecutionOrchestrator;
use rtlaunchd::app::tracker::JobTracker;
use rtlaunchd::app::types::{Parallelization, RetrieveOptions, SimulationBundle, Submission};
use rtlaunchd::{config, hosts, logging};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let parsed = adapters::cli::parse_opts();
    let opts = parsed.opts;
    let config::LoadResult { config, report } = config::load_with_report(
        opts.config,
        config::Overrides {
            database_path: opts.database,
            hosts_path: opts.hosts_path,
            verbose: parsed.verbose_override,
        },
    )?;
    logging::init(config.verbose);
    report.log();

    let profiles = hosts::load(&config.hosts_path)?;
    tracing::debug!(hosts = profiles.len(), "host profiles loaded");
    config::ensure_database_dir(&config.database_path)?;
    let store = adapters::db::JobStore::open(&config.database_path)
        .await
        .with_context(|| {
            format!(
                "failed to open job database {}",
                config.database_path.display()
            )
        })?;

    let clock = Arc::new(adapters::time::SystemClock);
    let tracker = Arc::new(JobTracker::new(
        Arc::new(adapters::db::SqliteStoreAdapter::new(store)),
        clock.clone(),
    ));
    let connections = Arc::new(ConnectionManager::new(
        Arc::new(adapters::ssh::SshConnector::default()),
        Arc::new(adapters::vpn::CommandVpn::default()),
        Arc::new(adapters::network::NetworkAdapter::new()),
        config.connection_settings(),
    ));
    let orchestrator = ExecutionOrchestrator::new(
        profiles,
        connections.clone(),
        tracker,
        clock,
        Arc::new(adapters::fs::LocalFilesystem),
        Arc::new(adapters::telemetry::TracingTelemetry),
        config.orchestrator_settings(),
    );

    let result = run(opts.command, &orchestrator, &connections).await;
    orchestrator.shutdown().await;
    result
}

async fn run(
    command: Command,
    orchestrator: &ExecutionOrchestrator,
    connections: &ConnectionManager,
) -> anyhow::Result<()> {
    orchestrator.start().await?;
    match command {
        Command::Submit(args) => submit(orchestrator, args).await,
        Command::Status(args) => {
            let job = orchestrator.job(args.job_id).await?;
            if args.json {
                println!("{}", format::format_json(format::job_to_json(&job))?);
            } else {
                print!("{}", format::format_job_details(&job));
            }
            Ok(())
        }
        Command::Cancel(args) => {
            orchestrator.cancel(args.job_id).await?;
            let state = orchestrator.status(args.job_id).await?;
            println!("job {} is {state}", args.job_id);
            Ok(())
        }
        Command::Output(args) => {
            let artifacts = orchestrator.output(args.job_id).await?;
            for file in &artifacts.files {
                println!("{}", artifacts.root.join(file).display());
            }
            Ok(())
        }
        Command::List(args) => {
            let jobs = orchestrator.list(args.host.as_deref()).await?;
            if args.json {
                println!("{}", format::format_jobs_json(&jobs)?);
            } else {
                print!("{}", format::format_jobs_table(&jobs));
            }
            Ok(())
        }
        Command::History(args) => {
            let transitions = orchestrator.history(args.job_id).await?;
            if args.json {
                println!("{}", format::format_history_json(&transitions)?);
            } else {
                print!("{}", format::format_history(&transitions));
            }
            Ok(())
        }
        Command::Watch => {
            tokio::select! {
                result = orchestrator.wait_all() => result?,
                _ = tokio::signal::ctrl_c() => {
                    tracing::info!("interrupted; outstanding jobs stay tracked");
                }
            }
            Ok(())
        }
        Command::Hosts(args) => list_hosts(orchestrator, connections, args).await,
    }
}

async fn submit(orchestrator: &ExecutionOrchestrator, args: SubmitArgs) -> anyhow::Result<()> {
    let local_output_dir = match args.output {
        Some(dir) => dir,
        None => description_dir(&args.description),
    };
    let submission = Submission {
        bundle: SimulationBundle {
            description: args.description,
            inputs: args.inputs,
            local_output_dir: std::path::absolute(&local_output_dir).with_context(|| {
                format!("invalid output directory {}", local_output_dir.display())
            })?,
        },
        parallelization: Parallelization {
            processes: args.processes,
            threads_per_process: args.threads,
        },
        retrieve: RetrieveOptions {
            patterns: args.retrieve,
            remove_remote: args.remove_remote,
        },
    };
    let id = orchestrator.submit(submission, &args.host).await?;
    println!("submitted job {id}");
    if args.wait {
        tokio::select! {
            state = orchestrator.wait(id) => println!("job {id} is {}", state?),
            _ = tokio::signal::ctrl_c() => {
                tracing::info!(job_id = id, "interrupted; job stays tracked");
            }
        }
    }
    Ok(())
}

fn description_dir(description: &Path) -> PathBuf {
    description
        .parent()
        .filter(|parent| !parent.as_os_str().is_empty())
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."))
}

async fn list_hosts(
    orchestrator: &ExecutionOrchestrator,
    connections: &ConnectionManager,
    args: HostsArgs,
) -> anyhow::Result<()> {
    let mut rows = Vec::new();
    for host in orchestrator.hosts() {
        let reachable = if args.check {
            match connections.probe(host).await {
                Ok(reachable) => Some(reachable),
                Err(err) => {
                    tracing::warn!(host = %host.name, error = %err, "reachability check failed");
                    Some(false)
                }
            }
        } else {
            None
        };
        rows.push((host, reachable));
    }
    if args.json {
        let value = serde_json::Value::Array(
            rows.iter()
                .map(|(host, reachable)| format::host_to_json(host, *reachable))
                .collect(),
        );
        println!("{}", format::format_json(value)?);
    } else {
        print!("{}", format::format_hosts_table(&rows));
    }
    Ok(())
}
