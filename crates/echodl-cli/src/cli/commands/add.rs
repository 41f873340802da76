//! `echodl add <url>` – add a new download job.

use anyhow::Result;
use echodl_core::resume::{JobSettings, ResumeStore};
use std::path::PathBuf;

pub async fn run_add(
    store: &ResumeStore,
    url: &str,
    dest: Option<PathBuf>,
    priority: i32,
) -> Result<()> {
    let destination = match dest {
        Some(d) => d,
        None => std::env::current_dir()?,
    };
    let id = store
        .add_job(url, &destination, priority, &JobSettings::default())
        .await?;
    println!("Added job {id} for URL: {url}");
    Ok(())
}
