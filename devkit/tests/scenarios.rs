//! End-to-end behaviour of a kernel driven through its real sockets.

use mender_devkit::test_utils::WAIT;
use mender_devkit::{kernel_test, MockFixer, TestHarness};
use mender_kernel::remediation::{JobOutcome, Phase};
use std::time::Duration;

kernel_test!(test_two_registrations_get_distinct_ids, MockFixer::replying("x\n"), |harness| {
    let mut first = harness.worker("worker-A");
    let mut second = harness.worker("worker-A");
    let id1 = first.register().await?;
    let id2 = second.register().await?;

    anyhow::ensure!(id1 != id2, "ids must differ");
    let registry = harness.state().registry.lock().snapshot();
    anyhow::ensure!(registry["worker-A"].len() == 2, "registry: {registry:?}");
    anyhow::ensure!(registry["worker-A"].contains(&id1) && registry["worker-A"].contains(&id2));
});

kernel_test!(test_only_heartbeating_instances_are_reported, MockFixer::replying("x\n"), |harness| {
    let mut alive = harness.worker("worker-A");
    let mut silent = harness.worker("worker-A");
    let id1 = alive.register().await?;
    let id2 = silent.register().await?;
    alive.heartbeat().await?;

    let report = harness
        .sink
        .wait_for(WAIT, |r| r.instance("worker-A", &id1) == Some(true))
        .await?;
    anyhow::ensure!(report.instance("worker-A", &id2).is_none(), "never-heartbeated id reported");
});

kernel_test!(test_silent_instance_turns_stale, MockFixer::replying("x\n"), |harness| {
    let mut worker = harness.worker("worker-A");
    let id = worker.register().await?;
    worker.heartbeat().await?;

    harness
        .sink
        .wait_for(WAIT, |r| r.instance("worker-A", &id) == Some(true))
        .await?;
    harness
        .sink
        .wait_for(WAIT, |r| r.instance("worker-A", &id) == Some(false))
        .await?;
});

kernel_test!(test_regular_heartbeats_keep_instance_fresh, MockFixer::replying("x\n"), |harness| {
    let mut worker = harness.worker("worker-A");
    let id = worker.register().await?;
    worker.heartbeat().await?;
    harness
        .sink
        .wait_for(WAIT, |r| r.instance("worker-A", &id) == Some(true))
        .await?;

    // beats 400 ms apart under a 1 s liveness timeout
    let from = harness.sink.reports().len();
    for _ in 0..8 {
        tokio::time::sleep(Duration::from_millis(400)).await;
        worker.heartbeat().await?;
    }

    let window = harness.sink.reports().split_off(from);
    anyhow::ensure!(window.len() >= 10, "only {} reports in the window", window.len());
    let stale = window.iter().filter(|r| r.instance("worker-A", &id) != Some(true)).count();
    anyhow::ensure!(stale == 0, "{stale} of {} reports were not fresh", window.len());
});

kernel_test!(test_exit_removes_instance_from_reports, MockFixer::replying("x\n"), |harness| {
    let mut worker = harness.worker("worker-A");
    let id = worker.register().await?;
    worker.heartbeat().await?;
    harness
        .sink
        .wait_for(WAIT, |r| r.instance("worker-A", &id).is_some())
        .await?;

    worker.exit().await?;
    anyhow::ensure!(harness.state().heartbeats.lock().last_seen(&id).is_none());
    let report = harness.sink.wait_for(WAIT, |r| r.instance("worker-A", &id).is_none()).await?;
    anyhow::ensure!(!report.services().contains(&"worker-A"), "departed service still listed");

    // a second Exit for the same id is harmless
    worker.exit().await?;
});

kernel_test!(test_malformed_heartbeat_keeps_channel_usable, MockFixer::replying("x\n"), |harness| {
    let mut worker = harness.worker("worker-A");
    let id = worker.register().await?;
    worker.send_heartbeat_line("Heartbeat without brackets").await?;
    worker.heartbeat().await?;
    anyhow::ensure!(harness.state().heartbeats.lock().last_seen(&id).is_some());
});

kernel_test!(test_error_line_is_persisted_and_fixed, MockFixer::replying("print(0)\n"), |harness| {
    harness.write_source("worker-B.py", "print(1/0)\n")?;
    let mut stream = harness.worker("worker-B").open_stream().await?;
    stream.info("started").await?;
    stream.error("NullReference").await?;

    let status = harness.wait_for_jobs(1).await?;
    anyhow::ensure!(
        matches!(status.history[0].outcome, JobOutcome::Applied { .. }),
        "outcome: {:?}",
        status.history[0].outcome
    );

    let entries = harness.failure_entries().await?;
    anyhow::ensure!(entries.len() == 1, "entries: {entries:?}");
    anyhow::ensure!(entries[0].app == "worker-B" && entries[0].body.contains("NullReference"));

    anyhow::ensure!(harness.read_source("worker-B.py")? == "print(0)\n");
    anyhow::ensure!(harness.backups()? == vec!["worker-B.py.bkp".to_string()]);
    anyhow::ensure!(harness.read_source("worker-B.py.bkp")? == "print(1/0)\n");

    let request = harness.fixer.last_request().expect("fixer was called");
    anyhow::ensure!(request.source == "print(1/0)\n");
    anyhow::ensure!(request.logs.contains("Application: worker-B"));

    let kb = harness.state().remediator.knowledge().expect("knowledge base");
    anyhow::ensure!(kb.entries().len() == 1);

    // the stream stays open after an ERROR
    anyhow::ensure!(!stream.closed_by_kernel(Duration::from_millis(200)).await);
});

kernel_test!(test_concurrent_failures_run_one_job, MockFixer::gated("print(0)\n"), |harness| {
    harness.write_source("worker-B.py", "print(1/0)\n")?;
    harness.write_source("worker-C.py", "raise MemoryError\n")?;
    let mut b = harness.worker("worker-B").open_stream().await?;
    let mut c = harness.worker("worker-C").open_stream().await?;

    b.error("NullReference").await?;
    harness.fixer.wait_for_calls(1, WAIT).await?;
    anyhow::ensure!(harness.remediation().phase == Phase::Running);

    c.error("KeyError").await?;
    harness
        .wait_until("dropped trigger", |s| s.remediator.status().dropped_triggers == 1)
        .await?;

    harness.fixer.release();
    harness.wait_for_jobs(1).await?;
    anyhow::ensure!(harness.fixer.call_count() == 1, "calls: {}", harness.fixer.call_count());
    anyhow::ensure!(harness.read_source("worker-C.py")? == "raise MemoryError\n");

    // both failures are on record even though only one was remediated
    let apps: Vec<String> = harness.failure_entries().await?.into_iter().map(|e| e.app).collect();
    anyhow::ensure!(apps == vec!["worker-B".to_string(), "worker-C".to_string()], "apps: {apps:?}");
});

kernel_test!(test_fatal_closes_stream_and_ignores_the_rest, MockFixer::replying("ok = True\n"), |harness| {
    harness.write_source("worker-C.py", "data = [0] * 10**12\n")?;
    let mut stream = harness.worker("worker-C").open_stream().await?;
    stream.fatal("OutOfMemory").await?;

    anyhow::ensure!(stream.closed_by_kernel(WAIT).await, "stream still open after FATAL");
    let _ = stream.error("after close").await;

    harness.wait_for_jobs(1).await?;
    tokio::time::sleep(Duration::from_millis(100)).await;
    let entries = harness.failure_entries().await?;
    anyhow::ensure!(entries.len() == 1, "entries: {entries:?}");
    anyhow::ensure!(entries[0].body.contains("OutOfMemory"));
});

kernel_test!(test_missing_source_fails_without_fixer_call, MockFixer::replying("x\n"), |harness| {
    let mut stream = harness.worker("ghost").open_stream().await?;
    stream.error("boom").await?;

    let status = harness.wait_for_jobs(1).await?;
    anyhow::ensure!(matches!(status.history[0].outcome, JobOutcome::Failed { .. }));
    anyhow::ensure!(harness.fixer.call_count() == 0);
    anyhow::ensure!(harness.backups()?.is_empty());
});

kernel_test!(test_untagged_stream_gets_peer_identity, MockFixer::replying("x\n"), |harness| {
    let mut stream = harness.worker("unused").open_stream().await?;
    stream.send_raw("hello without a tag").await?;
    stream.send_raw("[whatever] [ERROR] [ts] crash").await?;

    harness.wait_for_jobs(1).await?;
    let entries = harness.failure_entries().await?;
    anyhow::ensure!(entries.len() == 1);
    anyhow::ensure!(entries[0].app.starts_with("App_127.0.0.1:"), "app: {}", entries[0].app);
});

#[tokio::test]
async fn test_hanging_fixer_times_out_and_frees_the_guard() {
    let harness = TestHarness::start_with(MockFixer::hanging(), |cfg| cfg.remediation.fixer.timeout_secs = 1)
        .await
        .unwrap();
    harness.write_source("worker-B.py", "print(1/0)\n").unwrap();
    let mut stream = harness.worker("worker-B").open_stream().await.unwrap();

    stream.error("first").await.unwrap();
    let status = harness.wait_for_jobs(1).await.unwrap();
    match &status.history[0].outcome {
        JobOutcome::Failed { reason } => assert!(reason.contains("timed out"), "{reason}"),
        other => panic!("unexpected outcome {other:?}"),
    }
    assert_eq!(harness.read_source("worker-B.py").unwrap(), "print(1/0)\n");

    stream.error("second").await.unwrap();
    harness.wait_for_jobs(2).await.unwrap();
    assert_eq!(harness.fixer.call_count(), 2);
}

#[tokio::test]
async fn test_second_fix_keeps_first_backup() {
    let harness = TestHarness::start(MockFixer::replying("v2\n")).await.unwrap();
    harness.write_source("worker-A.py", "v1\n").unwrap();
    let mut stream = harness.worker("worker-A").open_stream().await.unwrap();

    stream.error("first").await.unwrap();
    harness.wait_for_jobs(1).await.unwrap();

    harness.fixer.set_reply(mender_devkit::MockReply::Source("v3\n".into()));
    stream.error("second").await.unwrap();
    harness.wait_for_jobs(2).await.unwrap();

    let backups = harness.backups().unwrap();
    assert_eq!(backups.len(), 2, "{backups:?}");
    assert_eq!(harness.read_source("worker-A.py.bkp").unwrap(), "v1\n");
    let stamped = backups.iter().find(|b| *b != "worker-A.py.bkp").unwrap();
    assert_eq!(harness.read_source(stamped).unwrap(), "v2\n");
    assert_eq!(harness.read_source("worker-A.py").unwrap(), "v3\n");
}
