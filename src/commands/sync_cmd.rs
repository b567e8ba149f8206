//! Sync CLI commands for pushing queued meals to the server.

use clap::{Args, Subcommand};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;

use mealsync_core::{
    FailureKind, MealQueue, PassReport, StatusCounts, SyncEngine, SyncEvent,
};

use super::{OutputFormat, Session};
use crate::config::Config;
use crate::remote::{spawn_monitor, HttpRemote};

/// Sync queued meals with the server
#[derive(Args)]
pub struct SyncCommand {
    #[command(subcommand)]
    command: Option<SyncSubcommand>,

    /// Send again the remote deletes the server refused
    #[arg(long)]
    retry_deletes: bool,
}

#[derive(Subcommand)]
enum SyncSubcommand {
    /// Show sync configuration, queue state and server status
    Status {
        /// Output format
        #[arg(long, short, value_enum, default_value = "text")]
        format: OutputFormat,
    },

    /// Keep syncing in the foreground until interrupted
    Watch,
}

#[derive(Serialize)]
struct StatusReport<'a> {
    server_url: Option<&'a str>,
    auto_sync: bool,
    reachable: bool,
    queue: StatusCounts,
}

impl SyncCommand {
    pub async fn run(&self, config: &Config) -> Result<(), Box<dyn std::error::Error>> {
        match &self.command {
            None => self.sync(config).await,
            Some(SyncSubcommand::Status { format }) => self.status(config, *format).await,
            Some(SyncSubcommand::Watch) => self.watch(config).await,
        }
    }

    async fn sync(&self, config: &Config) -> Result<(), Box<dyn std::error::Error>> {
        if !config.sync.is_configured() {
            print_not_configured();
            return Ok(());
        }

        let session = Session::open(config).await?;
        if self.retry_deletes {
            let requeued = session.repo.retry_deletions().await?;
            println!("Requeued {} refused deletion(s).", requeued);
        }
        println!("Syncing with server...");
        println!();

        match session.sync_once().await? {
            Some(report) => print_report(&report),
            None => println!("  ✗ server unreachable"),
        }

        let counts = session.repo.status_counts().await?;
        println!();
        if counts.unsynced() == 0 && counts.pending_deletions == 0 {
            println!("Everything is synced.");
        } else {
            print_waiting(&counts);
        }

        session.close().await;
        Ok(())
    }

    async fn status(
        &self,
        config: &Config,
        format: OutputFormat,
    ) -> Result<(), Box<dyn std::error::Error>> {
        let session = Session::open(config).await?;
        let counts = session.repo.status_counts().await?;
        let reachable = session.probe().await;

        let report = StatusReport {
            server_url: config.sync.server_url.as_deref(),
            auto_sync: config.sync.auto_sync,
            reachable,
            queue: counts,
        };

        match format {
            OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&report)?),
            OutputFormat::Text => {
                println!("Sync Configuration");
                println!("==================");
                println!();

                match report.server_url {
                    Some(url) if config.sync.is_configured() => {
                        println!("Server:    {}", url);
                        println!(
                            "Auto-sync: {}",
                            if report.auto_sync {
                                "enabled"
                            } else {
                                "disabled"
                            }
                        );
                        println!(
                            "Server status: {}",
                            if reachable {
                                "✓ reachable"
                            } else {
                                "✗ unreachable"
                            }
                        );
                    }
                    _ => println!("Status: Not configured"),
                }

                println!();
                println!("Queue");
                println!("-----");
                println!("  synced:   {}", counts.synced);
                println!("  pending:  {}", counts.pending);
                println!("  syncing:  {}", counts.syncing);
                println!(
                    "  failed:   {} ({} rejected by server)",
                    counts.failed, counts.rejected
                );
                println!(
                    "  deletes waiting: {} ({} refused by server)",
                    counts.pending_deletions, counts.rejected_deletions
                );
                if counts.rejected_deletions > 0 {
                    let deletions = session.repo.queue().list_all_deletions().await?;
                    let refused = deletions
                        .iter()
                        .filter(|d| d.failure_kind == Some(FailureKind::Rejected));
                    for deletion in refused {
                        println!(
                            "    ✗ {}: {}",
                            deletion.id,
                            deletion.last_error.as_deref().unwrap_or("refused")
                        );
                    }
                }
            }
        }

        session.close().await;
        Ok(())
    }

    async fn watch(&self, config: &Config) -> Result<(), Box<dyn std::error::Error>> {
        if !config.sync.is_configured() {
            print_not_configured();
            return Ok(());
        }

        let queue = MealQueue::open(&config.database_path.value).await?;
        let remote = HttpRemote::from_config(&config.sync)?;
        let (connectivity, monitor) =
            spawn_monitor(remote.clone(), config.sync.poll_interval());
        let engine = SyncEngine::new(
            queue.clone(),
            Arc::new(remote),
            connectivity,
            config.sync.retry_policy(),
        );

        let mut events = engine.subscribe();
        let recovered = engine.start().await?;
        if recovered > 0 {
            println!("Re-queued {} meal(s) interrupted by an earlier run.", recovered);
        }
        println!("Watching for changes. Press Ctrl-C to stop.");

        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Ok(event) => print_event(&event),
                    Err(RecvError::Lagged(missed)) => println!("  ({} events skipped)", missed),
                    Err(RecvError::Closed) => break,
                },
                _ = tokio::signal::ctrl_c() => break,
            }
        }

        println!("Stopping...");
        engine.shutdown();
        engine.wait_idle().await;
        monitor.abort();
        queue.close().await;
        Ok(())
    }
}

/// Runs one pass after a write command. The write already succeeded locally,
/// so problems are reported on stderr and never fail the command.
pub async fn auto_sync(session: &Session) {
    match session.sync_once().await {
        Ok(Some(report)) if !report.is_clean() => {
            eprintln!(
                "Auto-sync: {} meal(s) not synced, will retry later",
                report.failed + report.rejected
            );
        }
        Ok(Some(_)) => {}
        Ok(None) => eprintln!("Auto-sync: server unreachable, skipping"),
        Err(e) => eprintln!("Auto-sync: {}", e),
    }
}

fn print_not_configured() {
    println!("Status: Not configured");
    println!();
    println!("To enable sync, add to your config file:");
    println!();
    println!("  sync:");
    println!("    server_url: \"https://meals.example.com\"");
    println!("    api_key: \"...\"");
    println!();
    println!("Or set environment variables:");
    println!("  MEALS_SYNC_URL");
    println!("  MEALS_SYNC_API_KEY");
}

fn print_report(report: &PassReport) {
    println!(
        "  ✓ {} synced, {} failed, {} rejected",
        report.synced, report.failed, report.rejected
    );
    if report.deletions_sent > 0 || report.deletions_failed > 0 || report.deletions_rejected > 0 {
        println!(
            "  ✓ {} deletion(s) sent, {} failed, {} refused",
            report.deletions_sent, report.deletions_failed, report.deletions_rejected
        );
    }
}

fn print_waiting(counts: &StatusCounts) {
    if counts.pending + counts.syncing > 0 {
        println!("{} meal(s) waiting to sync.", counts.pending + counts.syncing);
    }
    let transient = counts.failed - counts.rejected;
    if transient > 0 {
        println!("{} meal(s) failed and will be retried.", transient);
    }
    if counts.rejected > 0 {
        println!(
            "{} meal(s) rejected by the server. Fix them with 'meals meal edit' or 'meals meal retry'.",
            counts.rejected
        );
    }
    let owed = counts.pending_deletions - counts.rejected_deletions;
    if owed > 0 {
        println!("{} deletion(s) waiting to reach the server.", owed);
    }
    if counts.rejected_deletions > 0 {
        println!(
            "{} deletion(s) refused by the server. Send them again with 'meals sync --retry-deletes'.",
            counts.rejected_deletions
        );
    }
}

fn print_event(event: &SyncEvent) {
    match event {
        SyncEvent::PassStarted { trigger } => println!("Sync started ({:?})", trigger),
        SyncEvent::PassFinished(report) => print_report(report),
        SyncEvent::RecordSynced { id } => println!("  ✓ {}", id),
        SyncEvent::RecordFailed {
            id,
            error,
            retryable,
        } => {
            let kind = if *retryable { "failed" } else { "rejected" };
            println!("  ✗ {} {}: {}", id, kind, error);
        }
        SyncEvent::RetryScheduled { attempt, delay } => {
            println!("Retry {} in {:.1}s", attempt, delay.as_secs_f64());
        }
        SyncEvent::RetriesExhausted { remaining } => {
            println!(
                "Giving up for now, {} item(s) left. Will retry on reconnect.",
                remaining
            );
        }
        SyncEvent::PassAborted { error } => println!("Sync aborted: {}", error),
    }
}
