//! End-to-end engine tests against a local range-capable HTTP server:
//! segmented downloads, probe fallbacks, resume, retry, priority ordering,
//! and pause/cancel control.

mod common;

use common::range_server::{self, RangeServerOptions};
use echodl_core::config::{EngineConfig, RetryConfig};
use echodl_core::events::Event;
use echodl_core::ranges::ByteRange;
use echodl_core::resume::{JobId, JobSettings, JobState, ResumeStore};
use echodl_core::scheduler::{self, EngineHandle};
use echodl_core::storage::part_path;
use std::path::Path;
use std::time::Duration;
use tempfile::tempdir;
use tokio::sync::broadcast;

fn pattern(len: usize) -> Vec<u8> {
    (0u8..251).cycle().take(len).collect()
}

fn test_config() -> EngineConfig {
    EngineConfig {
        max_concurrent_jobs: 3,
        max_total_connections: 16,
        max_segments_per_job: 4,
        min_segment_bytes: 1024,
        progress_interval_secs: 0.1,
        event_buffer: 256,
        keep_resume_on_complete: true,
        retry: Some(RetryConfig {
            max_attempts: 5,
            base_delay_secs: 0.01,
            max_delay_secs: 1,
        }),
        connect_timeout_secs: 5,
        stall_timeout_secs: 10,
    }
}

async fn open_store(dir: &Path) -> ResumeStore {
    ResumeStore::open_at(&dir.join("jobs.db")).await.unwrap()
}

async fn add_job(store: &ResumeStore, url: &str, dest: &Path, priority: i32) -> JobId {
    store
        .add_job(url, dest, priority, &JobSettings::default())
        .await
        .unwrap()
}

/// Run the engine until the queue drains, with a test timeout.
async fn run_to_idle(cfg: EngineConfig, store: &ResumeStore) {
    let engine = scheduler::start(cfg, store.clone(), true).await.unwrap();
    tokio::time::timeout(Duration::from_secs(60), engine.task)
        .await
        .expect("engine did not drain the queue in time")
        .expect("engine task panicked")
        .expect("engine loop failed");
}

async fn wait_for<F>(events: &mut broadcast::Receiver<Event>, mut pred: F) -> Event
where
    F: FnMut(&Event) -> bool,
{
    tokio::time::timeout(Duration::from_secs(30), async {
        loop {
            match events.recv().await {
                Ok(ev) if pred(&ev) => return ev,
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => panic!("event channel closed"),
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

async fn shutdown(handle: &EngineHandle, task: tokio::task::JoinHandle<anyhow::Result<()>>) {
    handle.shutdown().await.unwrap();
    tokio::time::timeout(Duration::from_secs(30), task)
        .await
        .expect("engine did not shut down in time")
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn multi_segment_download_completes_and_file_matches() {
    let body = pattern(64 * 1024);
    let server = range_server::start(body.clone());

    let dir = tempdir().unwrap();
    let store = open_store(dir.path()).await;
    let dest = dir.path().join("file.bin");
    let id = add_job(&store, &server.url, &dest, 0).await;

    run_to_idle(test_config(), &store).await;

    assert_eq!(std::fs::read(&dest).unwrap(), body);
    assert!(!part_path(&dest).exists(), "part file must be renamed away");

    let job = store.get_job(id).await.unwrap().expect("job kept");
    assert_eq!(job.state, JobState::Completed);
    assert!(job.completed.is_complete(body.len() as u64));

    // More than one ranged GET proves the transfer was actually segmented.
    let ranged: Vec<_> = server
        .ranges_requested()
        .into_iter()
        .flatten()
        .collect();
    assert!(ranged.len() >= 2, "expected segmented fetch, got {:?}", ranged);
}

#[tokio::test]
async fn completed_job_record_deleted_by_default() {
    let body = pattern(8 * 1024);
    let server = range_server::start(body.clone());

    let dir = tempdir().unwrap();
    let store = open_store(dir.path()).await;
    let dest = dir.path().join("file.bin");
    let id = add_job(&store, &server.url, &dest, 0).await;

    let cfg = EngineConfig {
        keep_resume_on_complete: false,
        ..test_config()
    };
    run_to_idle(cfg, &store).await;

    assert_eq!(std::fs::read(&dest).unwrap(), body);
    assert!(store.get_job(id).await.unwrap().is_none());
}

#[tokio::test]
async fn head_blocked_falls_back_to_ranged_probe() {
    let body = pattern(32 * 1024);
    let server = range_server::start_with_options(
        body.clone(),
        RangeServerOptions {
            block_head: true,
            ..Default::default()
        },
    );

    let dir = tempdir().unwrap();
    let store = open_store(dir.path()).await;
    let dest = dir.path().join("file.bin");
    let id = add_job(&store, &server.url, &dest, 0).await;

    run_to_idle(test_config(), &store).await;

    assert_eq!(std::fs::read(&dest).unwrap(), body);
    let job = store.get_job(id).await.unwrap().unwrap();
    assert_eq!(job.state, JobState::Completed);
}

#[tokio::test]
async fn no_range_server_streams_on_one_connection() {
    let body = pattern(32 * 1024);
    let server = range_server::start_with_options(
        body.clone(),
        RangeServerOptions {
            ignore_ranges: true,
            ..Default::default()
        },
    );

    let dir = tempdir().unwrap();
    let store = open_store(dir.path()).await;
    let dest = dir.path().join("file.bin");
    let id = add_job(&store, &server.url, &dest, 0).await;

    run_to_idle(test_config(), &store).await;

    assert_eq!(std::fs::read(&dest).unwrap(), body);
    let job = store.get_job(id).await.unwrap().unwrap();
    assert_eq!(job.state, JobState::Completed);

    assert_eq!(server.get_count(), 1, "streaming mode must use one GET");
    assert_eq!(server.ranges_requested(), vec![None]);
}

#[tokio::test]
async fn transient_errors_are_retried_until_success() {
    let body = pattern(16 * 1024);
    let server = range_server::start_with_options(
        body.clone(),
        RangeServerOptions {
            fail_first_gets: 2,
            ..Default::default()
        },
    );

    let dir = tempdir().unwrap();
    let store = open_store(dir.path()).await;
    let dest = dir.path().join("file.bin");
    let id = add_job(&store, &server.url, &dest, 0).await;

    run_to_idle(test_config(), &store).await;

    assert_eq!(std::fs::read(&dest).unwrap(), body);
    let job = store.get_job(id).await.unwrap().unwrap();
    assert_eq!(job.state, JobState::Completed);
    assert_eq!(job.retry_count, 2, "both 503s should be retried");
}

#[tokio::test]
async fn unreachable_server_fails_the_job() {
    // Grab a free port and release it so nothing is listening there.
    let port = std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port();
    let url = format!("http://127.0.0.1:{}/file.bin", port);

    let dir = tempdir().unwrap();
    let store = open_store(dir.path()).await;
    let dest = dir.path().join("file.bin");
    let id = add_job(&store, &url, &dest, 0).await;

    run_to_idle(test_config(), &store).await;

    let job = store.get_job(id).await.unwrap().unwrap();
    assert_eq!(job.state, JobState::Failed);
    assert!(!dest.exists());
}

#[tokio::test]
async fn resume_skips_already_completed_ranges() {
    let body = pattern(64 * 1024);
    let half = (body.len() / 2) as u64;
    let server = range_server::start_with_options(
        body.clone(),
        RangeServerOptions {
            etag: Some("v1".into()),
            ..Default::default()
        },
    );

    let dir = tempdir().unwrap();
    let store = open_store(dir.path()).await;
    let dest = dir.path().join("file.bin");
    let id = add_job(&store, &server.url, &dest, 0).await;

    // Simulate an interrupted earlier session: first half durable on disk
    // and recorded, validators stored.
    store
        .set_metadata(id, Some(body.len() as u64), Some("v1"), None)
        .await
        .unwrap();
    store
        .record_completed_range(id, ByteRange::new(0, half))
        .await
        .unwrap();
    let mut partial = vec![0u8; body.len()];
    partial[..half as usize].copy_from_slice(&body[..half as usize]);
    std::fs::write(part_path(&dest), &partial).unwrap();

    run_to_idle(test_config(), &store).await;

    assert_eq!(std::fs::read(&dest).unwrap(), body);
    let job = store.get_job(id).await.unwrap().unwrap();
    assert_eq!(job.state, JobState::Completed);

    // No GET may touch the bytes that were already complete.
    for range in server.ranges_requested().into_iter().flatten() {
        assert!(
            range.0 >= half,
            "requested range {:?} overlaps resumed bytes",
            range
        );
    }
}

#[tokio::test]
async fn changed_remote_discards_progress_and_redownloads() {
    let body = pattern(32 * 1024);
    let server = range_server::start_with_options(
        body.clone(),
        RangeServerOptions {
            etag: Some("v2".into()),
            ..Default::default()
        },
    );

    let dir = tempdir().unwrap();
    let store = open_store(dir.path()).await;
    let dest = dir.path().join("file.bin");
    let id = add_job(&store, &server.url, &dest, 0).await;

    // Stale record from a previous version of the remote file; the part file
    // holds garbage where the record claims completed bytes.
    store
        .set_metadata(id, Some(body.len() as u64), Some("v1"), None)
        .await
        .unwrap();
    store
        .record_completed_range(id, ByteRange::new(0, (body.len() / 2) as u64))
        .await
        .unwrap();
    std::fs::write(part_path(&dest), vec![0u8; body.len()]).unwrap();

    run_to_idle(test_config(), &store).await;

    // The stale half was not trusted: final bytes match the new entity.
    assert_eq!(std::fs::read(&dest).unwrap(), body);
    let job = store.get_job(id).await.unwrap().unwrap();
    assert_eq!(job.state, JobState::Completed);
    assert!(server
        .ranges_requested()
        .into_iter()
        .flatten()
        .any(|(start, _)| start == 0));
}

#[tokio::test]
async fn admission_follows_priority_then_fifo() {
    let slow_body = pattern(4 * 1024);
    let slow = range_server::start_with_options(
        slow_body,
        RangeServerOptions {
            get_delay: Some(Duration::from_millis(500)),
            ..Default::default()
        },
    );
    let fast_body = pattern(4 * 1024);
    let fast = range_server::start(fast_body);

    let dir = tempdir().unwrap();
    let store = open_store(dir.path()).await;
    let cfg = EngineConfig {
        max_concurrent_jobs: 1,
        ..test_config()
    };
    let engine = scheduler::start(cfg, store.clone(), false).await.unwrap();
    let mut events = engine.handle.subscribe();

    let a = engine
        .handle
        .enqueue(slow.url.clone(), dir.path().join("a.bin"), 0)
        .await
        .unwrap();
    let b = engine
        .handle
        .enqueue(fast.url.clone(), dir.path().join("b.bin"), 5)
        .await
        .unwrap();
    let c = engine
        .handle
        .enqueue(fast.url.clone(), dir.path().join("c.bin"), 5)
        .await
        .unwrap();
    let d = engine
        .handle
        .enqueue(fast.url.clone(), dir.path().join("d.bin"), 9)
        .await
        .unwrap();

    let mut started = Vec::new();
    while started.len() < 4 {
        if let Event::JobStarted { id } = wait_for(&mut events, |e| {
            matches!(e, Event::JobStarted { .. } | Event::JobFailed { .. })
        })
        .await
        {
            started.push(id);
        } else {
            panic!("a job failed during the priority test");
        }
    }

    // `a` grabbed the only slot first; after it the highest priority wins,
    // and equal priorities go in insertion order.
    assert_eq!(started, vec![a, d, b, c]);

    let mut completed = 0;
    while completed < 4 {
        wait_for(&mut events, |e| matches!(e, Event::JobCompleted { .. })).await;
        completed += 1;
    }
    shutdown(&engine.handle, engine.task).await;
}

#[tokio::test]
async fn pause_keeps_progress_and_resume_completes() {
    let body = pattern(16 * 1024);
    let server = range_server::start_with_options(
        body.clone(),
        RangeServerOptions {
            etag: Some("v1".into()),
            get_delay: Some(Duration::from_millis(300)),
            ..Default::default()
        },
    );

    let dir = tempdir().unwrap();
    let store = open_store(dir.path()).await;
    let engine = scheduler::start(test_config(), store.clone(), false)
        .await
        .unwrap();
    let mut events = engine.handle.subscribe();

    let id = engine
        .handle
        .enqueue(server.url.clone(), dir.path().join("file.bin"), 0)
        .await
        .unwrap();

    wait_for(&mut events, |e| matches!(e, Event::JobStarted { .. })).await;
    engine.handle.pause(id).await.unwrap();
    wait_for(&mut events, |e| matches!(e, Event::JobPaused { .. })).await;

    let job = store.get_job(id).await.unwrap().unwrap();
    assert_eq!(job.state, JobState::Paused);

    engine.handle.resume(id).await.unwrap();
    wait_for(&mut events, |e| matches!(e, Event::JobCompleted { .. })).await;

    assert_eq!(std::fs::read(dir.path().join("file.bin")).unwrap(), body);
    shutdown(&engine.handle, engine.task).await;
}

#[tokio::test]
async fn cancel_deletes_part_and_frees_the_slot() {
    let slow_body = pattern(8 * 1024);
    let slow = range_server::start_with_options(
        slow_body,
        RangeServerOptions {
            get_delay: Some(Duration::from_millis(500)),
            ..Default::default()
        },
    );
    let fast_body = pattern(8 * 1024);
    let fast = range_server::start(fast_body.clone());

    let dir = tempdir().unwrap();
    let store = open_store(dir.path()).await;
    let cfg = EngineConfig {
        max_concurrent_jobs: 1,
        ..test_config()
    };
    let engine = scheduler::start(cfg, store.clone(), false).await.unwrap();
    let mut events = engine.handle.subscribe();

    let a_dest = dir.path().join("a.bin");
    let a = engine
        .handle
        .enqueue(slow.url.clone(), a_dest.clone(), 0)
        .await
        .unwrap();
    let b_dest = dir.path().join("b.bin");
    let b = engine
        .handle
        .enqueue(fast.url.clone(), b_dest.clone(), 0)
        .await
        .unwrap();

    wait_for(&mut events, |e| matches!(e, Event::JobStarted { id } if *id == a)).await;
    engine.handle.cancel(a, true).await.unwrap();
    wait_for(&mut events, |e| matches!(e, Event::JobCancelled { id } if *id == a)).await;

    // Cancel-with-cleanup removes the resume record along with the file.
    assert!(store.get_job(a).await.unwrap().is_none());
    assert!(!a_dest.exists());

    // The freed slot lets the queued job through.
    wait_for(&mut events, |e| matches!(e, Event::JobCompleted { id } if *id == b)).await;
    assert_eq!(std::fs::read(&b_dest).unwrap(), fast_body);
    assert!(!part_path(&a_dest).exists(), "cancelled part file removed");

    shutdown(&engine.handle, engine.task).await;
}

#[tokio::test]
async fn cancel_without_cleanup_keeps_the_record() {
    let body = pattern(8 * 1024);
    let server = range_server::start_with_options(
        body,
        RangeServerOptions {
            get_delay: Some(Duration::from_millis(500)),
            ..Default::default()
        },
    );

    let dir = tempdir().unwrap();
    let store = open_store(dir.path()).await;
    let engine = scheduler::start(test_config(), store.clone(), false)
        .await
        .unwrap();
    let mut events = engine.handle.subscribe();

    let id = engine
        .handle
        .enqueue(server.url.clone(), dir.path().join("file.bin"), 0)
        .await
        .unwrap();
    wait_for(&mut events, |e| matches!(e, Event::JobStarted { .. })).await;
    engine.handle.cancel(id, false).await.unwrap();
    wait_for(&mut events, |e| matches!(e, Event::JobCancelled { .. })).await;

    let job = store.get_job(id).await.unwrap().expect("record kept");
    assert_eq!(job.state, JobState::Cancelled);

    shutdown(&engine.handle, engine.task).await;
}

#[tokio::test]
async fn cancel_queued_job_with_cleanup_deletes_the_record() {
    let slow_body = pattern(8 * 1024);
    let slow = range_server::start_with_options(
        slow_body,
        RangeServerOptions {
            get_delay: Some(Duration::from_millis(500)),
            ..Default::default()
        },
    );

    let dir = tempdir().unwrap();
    let store = open_store(dir.path()).await;
    let cfg = EngineConfig {
        max_concurrent_jobs: 1,
        ..test_config()
    };
    let engine = scheduler::start(cfg, store.clone(), false).await.unwrap();
    let mut events = engine.handle.subscribe();

    let a = engine
        .handle
        .enqueue(slow.url.clone(), dir.path().join("a.bin"), 0)
        .await
        .unwrap();
    let b = engine
        .handle
        .enqueue(slow.url.clone(), dir.path().join("b.bin"), 0)
        .await
        .unwrap();

    // `b` never left the queue; cancelling it with cleanup must still drop
    // its row, not just the (nonexistent) part file.
    wait_for(&mut events, |e| matches!(e, Event::JobStarted { id } if *id == a)).await;
    engine.handle.cancel(b, true).await.unwrap();
    wait_for(&mut events, |e| matches!(e, Event::JobCancelled { id } if *id == b)).await;

    assert!(store.get_job(b).await.unwrap().is_none());

    shutdown(&engine.handle, engine.task).await;
}

#[tokio::test]
async fn priority_change_takes_effect_at_next_admission() {
    let slow_body = pattern(8 * 1024);
    let slow = range_server::start_with_options(
        slow_body,
        RangeServerOptions {
            get_delay: Some(Duration::from_millis(500)),
            ..Default::default()
        },
    );
    let fast_body = pattern(4 * 1024);
    let fast = range_server::start(fast_body);

    let dir = tempdir().unwrap();
    let store = open_store(dir.path()).await;
    let cfg = EngineConfig {
        max_concurrent_jobs: 1,
        ..test_config()
    };
    let engine = scheduler::start(cfg, store.clone(), false).await.unwrap();
    let mut events = engine.handle.subscribe();

    let a = engine
        .handle
        .enqueue(slow.url.clone(), dir.path().join("a.bin"), 0)
        .await
        .unwrap();
    let b = engine
        .handle
        .enqueue(fast.url.clone(), dir.path().join("b.bin"), 0)
        .await
        .unwrap();
    let c = engine
        .handle
        .enqueue(fast.url.clone(), dir.path().join("c.bin"), 0)
        .await
        .unwrap();

    // While `a` holds the only slot, promote `c` over `b`.
    wait_for(&mut events, |e| matches!(e, Event::JobStarted { id } if *id == a)).await;
    engine.handle.set_priority(c, 5).await.unwrap();

    let mut started = Vec::new();
    while started.len() < 2 {
        if let Event::JobStarted { id } =
            wait_for(&mut events, |e| matches!(e, Event::JobStarted { .. })).await
        {
            started.push(id);
        }
    }
    assert_eq!(started, vec![c, b]);

    shutdown(&engine.handle, engine.task).await;
}

#[tokio::test]
async fn destination_directory_uses_derived_filename() {
    let body = pattern(4 * 1024);
    let server = range_server::start(body.clone());

    let dir = tempdir().unwrap();
    let store = open_store(dir.path()).await;
    // Destination is the directory itself; filename comes from the URL path.
    add_job(&store, &server.url, dir.path(), 0).await;

    run_to_idle(test_config(), &store).await;

    let expected = dir.path().join("file.bin");
    assert_eq!(std::fs::read(&expected).unwrap(), body);
}
