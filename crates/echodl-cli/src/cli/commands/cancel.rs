//! `echodl cancel <id>` – cancel a job, optionally removing the partial file.

use anyhow::{bail, Result};
use echodl_core::resume::{JobState, ResumeStore};
use echodl_core::storage::part_path;

pub async fn run_cancel(store: &ResumeStore, id: i64, delete_file: bool) -> Result<()> {
    let Some(job) = store.get_job(id).await? else {
        bail!("no job with id {id}");
    };
    if job.state.is_terminal() {
        bail!("job {id} already finished ({:?})", job.state);
    }
    if delete_file {
        let part = part_path(&job.destination);
        match tokio::fs::remove_file(&part).await {
            Ok(()) => println!("Removed {}", part.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => eprintln!("could not remove {}: {e}", part.display()),
        }
        // With cleanup the record goes too; there is nothing left to resume.
        store.delete_job(id).await?;
    } else {
        store.set_state(id, JobState::Cancelled).await?;
    }
    println!("Cancelled job {id}");
    Ok(())
}
