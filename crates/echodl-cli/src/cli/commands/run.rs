//! `echodl run` – start the engine and process the queue until it drains.

use anyhow::{Context, Result};
use echodl_core::config::EngineConfig;
use echodl_core::events::Event;
use echodl_core::resume::ResumeStore;
use echodl_core::scheduler;
use tokio::sync::broadcast::error::RecvError;

pub async fn run_engine(
    cfg: &EngineConfig,
    store: &ResumeStore,
    jobs: Option<usize>,
) -> Result<()> {
    let mut cfg = cfg.clone();
    if let Some(n) = jobs {
        cfg.max_concurrent_jobs = n.max(1);
    }

    let engine = scheduler::start(cfg, store.clone(), true).await?;
    let handle = engine.handle.clone();
    let mut events = engine.handle.subscribe();
    let mut task = engine.task;
    let mut interrupted = false;

    loop {
        tokio::select! {
            joined = &mut task => {
                joined.context("engine task panicked")??;
                break;
            }
            ev = events.recv() => {
                match ev {
                    Ok(event) => print_event(&event),
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::debug!(skipped, "event consumer lagged");
                    }
                    Err(RecvError::Closed) => {}
                }
            }
            _ = tokio::signal::ctrl_c(), if !interrupted => {
                println!("\nInterrupted; pausing running jobs...");
                interrupted = true;
                let _ = handle.shutdown().await;
            }
        }
    }
    Ok(())
}

fn print_event(event: &Event) {
    match event {
        Event::JobStarted { id } => println!("job {id}: started"),
        Event::JobProgress(s) => {
            let done_mib = s.bytes_done as f64 / 1_048_576.0;
            let rate_mib = s.avg_speed_bps / 1_048_576.0;
            let eta = s
                .eta_secs
                .map(|secs| format!("{:.0}s", secs))
                .unwrap_or_else(|| "?".to_string());
            match s.bytes_total {
                Some(total) if total > 0 => {
                    let total_mib = total as f64 / 1_048_576.0;
                    let pct = s.bytes_done as f64 / total as f64 * 100.0;
                    println!(
                        "job {}: {:.1} / {:.1} MiB ({:.1}%)  {:.2} MiB/s  ETA {}",
                        s.job_id, done_mib, total_mib, pct, rate_mib, eta
                    );
                }
                _ => println!(
                    "job {}: {:.1} MiB  {:.2} MiB/s",
                    s.job_id, done_mib, rate_mib
                ),
            }
        }
        Event::JobPaused { id } => println!("job {id}: paused"),
        Event::JobCompleted { id } => println!("job {id}: completed"),
        Event::JobFailed { id, reason } => println!("job {id}: failed: {reason}"),
        Event::JobCancelled { id } => println!("job {id}: cancelled"),
    }
}
