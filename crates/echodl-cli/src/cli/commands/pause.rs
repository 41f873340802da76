//! `echodl pause <id>` – pause a job so its progress is kept.

use anyhow::{bail, Result};
use echodl_core::resume::{JobState, ResumeStore};

pub async fn run_pause(store: &ResumeStore, id: i64) -> Result<()> {
    let Some(job) = store.get_job(id).await? else {
        bail!("no job with id {id}");
    };
    if job.state.is_terminal() {
        bail!("job {id} already finished ({:?})", job.state);
    }
    store.set_state(id, JobState::Paused).await?;
    println!("Paused job {id}");
    Ok(())
}
