//! `echodl status` – show status of all jobs.

use anyhow::Result;
use echodl_core::resume::ResumeStore;

pub async fn run_status(store: &ResumeStore) -> Result<()> {
    let jobs = store.list_jobs().await?;
    if jobs.is_empty() {
        println!("No jobs.");
        return Ok(());
    }
    println!(
        "{:<6} {:<10} {:>4} {:<16} {}",
        "ID", "STATE", "PRI", "PROGRESS", "URL"
    );
    for j in jobs {
        let progress = match j.total_size {
            Some(total) if total > 0 => {
                let pct = j.bytes_done as f64 / total as f64 * 100.0;
                format!("{}/{} ({:.0}%)", j.bytes_done, total, pct)
            }
            Some(_) => "0/0".to_string(),
            None => format!("{}/?", j.bytes_done),
        };
        println!(
            "{:<6} {:<10} {:>4} {:<16} {}",
            j.id,
            format!("{:?}", j.state).to_lowercase(),
            j.priority,
            progress,
            j.url
        );
    }
    Ok(())
}
