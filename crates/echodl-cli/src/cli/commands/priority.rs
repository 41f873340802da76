//! `echodl priority <id> <n>` – change a job's admission priority.

use anyhow::{bail, Result};
use echodl_core::resume::ResumeStore;

pub async fn run_priority(store: &ResumeStore, id: i64, priority: i32) -> Result<()> {
    if store.get_job(id).await?.is_none() {
        bail!("no job with id {id}");
    }
    store.set_priority(id, priority).await?;
    println!("Job {id} priority set to {priority}");
    Ok(())
}
