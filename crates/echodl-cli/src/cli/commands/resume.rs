//! `echodl resume <id>` – put a paused job back in the queue.

use anyhow::{bail, Result};
use echodl_core::resume::{JobState, ResumeStore};

pub async fn run_resume(store: &ResumeStore, id: i64) -> Result<()> {
    let Some(job) = store.get_job(id).await? else {
        bail!("no job with id {id}");
    };
    match job.state {
        JobState::Paused | JobState::Failed => {
            store.set_state(id, JobState::Queued).await?;
            println!("Queued job {id}; run `echodl run` to download");
        }
        JobState::Queued => println!("Job {id} is already queued"),
        other => bail!("job {id} cannot be resumed from state {:?}", other),
    }
    Ok(())
}
