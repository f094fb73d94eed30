use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::{Arc, Barrier};
use std::thread;

use chrono::{Duration, Utc};
use conductor_kernel::{
    AuditFilter, FsArtifactWriter, InMemoryArtifactWriter, KernelError, ManualClock,
    NewRun, RunFilter, RunGraph, RunStatus, StepContext, StepError, StepHandlerRegistry,
    StepOutput, StepSpec,
};
use conductor_runtime::{
    Engine, EngineConfig, LeaseManager, StepOutcome, TickCaps, TickStatus,
};
use serde_json::json;

const ENV: &str = "local";
const LANE: &str = "default";

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn temp_sqlite_path(name: &str) -> PathBuf {
    std::env::temp_dir().join(format!("conductor-{}-{}.db", name, uuid::Uuid::new_v4()))
}

fn remove_sqlite_files(path: &PathBuf) {
    for suffix in ["", "-wal", "-shm"] {
        let _ = std::fs::remove_file(format!("{}{}", path.display(), suffix));
    }
}

fn boom(_ctx: &StepContext<'_>) -> Result<StepOutput, StepError> {
    panic!("step handler blew up")
}

fn manual_engine() -> (Engine, Arc<ManualClock>) {
    init_tracing();
    let clock = Arc::new(ManualClock::new(Utc::now()));
    let mut handlers = StepHandlerRegistry::with_builtins();
    handlers.register("boom", boom);
    let engine = Engine::builder(EngineConfig::in_memory())
        .clock(clock.clone())
        .step_handlers(handlers)
        .artifacts(Arc::new(InMemoryArtifactWriter::new()))
        .build()
        .expect("engine");
    (engine, clock)
}

fn noop_run(lane: &str) -> NewRun {
    NewRun::new(ENV, lane, "report", RunGraph::single("noop", "noop"))
}

fn chain(len: usize) -> RunGraph {
    let mut graph = RunGraph::single("step-0", "noop");
    for i in 1..len {
        graph = graph.with_step(
            format!("step-{}", i),
            StepSpec::new("noop").with_deps([format!("step-{}", i - 1)]),
        );
    }
    graph
}

fn tick_audits(engine: &Engine) -> Vec<conductor_kernel::AuditEntry> {
    engine
        .list_audit(
            &AuditFilter {
                action: Some("tick".into()),
                ..AuditFilter::default()
            },
            100,
        )
        .expect("list audit")
}

#[test]
fn idle_tick_reports_no_runnable_runs_and_audits_once() {
    let (engine, _clock) = manual_engine();
    let result = engine.tick_once(ENV, LANE, "worker-1", &TickCaps::default());
    assert_eq!(result.status, TickStatus::Idle);
    assert_eq!(result.reason.as_deref(), Some("no_runnable_runs"));
    assert_eq!(result.ticked_runs, 0);
    assert_eq!(result.events_added, 0);

    let audits = tick_audits(&engine);
    assert_eq!(audits.len(), 1);
    assert_eq!(audits[0].result, "idle");
    assert_eq!(audits[0].payload["owner_id"], "worker-1");
    assert_eq!(audits[0].payload["env"], ENV);
}

#[test]
fn single_noop_run_succeeds_in_one_tick() {
    let (engine, _clock) = manual_engine();
    let run_id = engine.create_run(noop_run(LANE)).unwrap();

    let result = engine.tick_once(ENV, LANE, "worker-1", &TickCaps::default());
    assert_eq!(result.status, TickStatus::Success);
    assert_eq!(result.ticked_runs, 1);
    assert_eq!(result.events_added, 4);
    assert_eq!(result.run_ids, vec![run_id.clone()]);

    let run = engine.get_run(&run_id).unwrap();
    assert_eq!(run.status, RunStatus::Succeeded);
    assert!(run.started_at.is_some());
    assert!(run.finished_at.is_some());
    assert!(run.last_error.is_none());

    let events = engine.list_events(&run_id, None, 100).unwrap().items;
    let types: Vec<_> = events.iter().map(|e| e.event_type.as_str()).collect();
    assert_eq!(
        types,
        vec!["run_created", "run_started", "step_started", "step_completed", "run_succeeded"]
    );
    assert!(engine.leases().get(&run_id).unwrap().is_none());
    assert_eq!(tick_audits(&engine)[0].result, "success");

    let again = engine.tick_once(ENV, LANE, "worker-1", &TickCaps::default());
    assert_eq!(again.status, TickStatus::Idle);
}

#[test]
fn activation_leaves_exactly_one_active_version() {
    let (engine, _clock) = manual_engine();
    assert_eq!(engine.activate_config("policy", json!({"max": 1}), "ops").unwrap(), 1);
    assert_eq!(engine.activate_config("policy", json!({"max": 2}), "ops").unwrap(), 2);
    assert_eq!(engine.activate_config("policy", json!({"max": 3}), "ops").unwrap(), 3);
    assert_eq!(engine.get_active_config("policy").unwrap(), Some(json!({"max": 3})));

    let versions = engine.list_config_versions("policy").unwrap();
    assert_eq!(versions.iter().filter(|v| v.is_active).count(), 1);
    assert!(versions.iter().any(|v| v.version == 3 && v.is_active));

    engine.reactivate_config("policy", 1, "ops").unwrap();
    assert_eq!(engine.get_active_config("policy").unwrap(), Some(json!({"max": 1})));
    let versions = engine.list_config_versions("policy").unwrap();
    assert_eq!(versions.iter().filter(|v| v.is_active).count(), 1);

    assert!(matches!(
        engine.reactivate_config("policy", 9, "ops"),
        Err(KernelError::NotFound(_))
    ));
    assert_eq!(engine.get_active_config("other").unwrap(), None);
}

#[test]
fn events_replay_in_order_across_pages() {
    let (engine, clock) = manual_engine();
    let run_id = engine
        .create_run(NewRun::new(ENV, LANE, "report", chain(4)))
        .unwrap();
    for _ in 0..4 {
        clock.advance(Duration::milliseconds(5));
        engine.tick_once(ENV, LANE, "worker-1", &TickCaps::single());
    }
    assert_eq!(engine.get_run(&run_id).unwrap().status, RunStatus::Succeeded);

    let mut all = Vec::new();
    let mut cursor: Option<String> = None;
    loop {
        let page = engine.list_events(&run_id, cursor.as_deref(), 3).unwrap();
        assert!(page.items.len() <= 3);
        all.extend(page.items);
        match page.next_cursor {
            Some(next) => cursor = Some(next),
            None => break,
        }
    }
    // run_created, run_started, 4 x (step_started, step_completed), run_succeeded
    assert_eq!(all.len(), 11);
    assert!(all.windows(2).all(|w| w[0].ordering_key() <= w[1].ordering_key()));
    let sequence_ids: HashSet<_> = all.iter().map(|e| e.sequence_id).collect();
    assert_eq!(sequence_ids.len(), all.len());
    assert!(all.last().unwrap().is_terminal());
}

#[test]
fn invocation_cap_bounds_runs_advanced() {
    let (engine, clock) = manual_engine();
    for _ in 0..5 {
        engine.create_run(noop_run(LANE)).unwrap();
        clock.advance(Duration::milliseconds(1));
    }
    let caps = TickCaps {
        max_total_ticks_per_invocation: 2,
        ..TickCaps::default()
    };
    let result = engine.tick_once(ENV, LANE, "worker-1", &caps);
    assert_eq!(result.status, TickStatus::Success);
    assert_eq!(result.ticked_runs, 2);
    assert_eq!(result.ticks, 2);

    let succeeded = engine
        .list_runs(
            &RunFilter {
                status: Some(RunStatus::Succeeded),
                ..RunFilter::default()
            },
            None,
            10,
        )
        .unwrap();
    assert_eq!(succeeded.items.len(), 2);

    let drained = engine.tick_once(ENV, LANE, "worker-1", &TickCaps::default());
    assert_eq!(drained.ticked_runs, 3);
}

#[test]
fn daily_cap_stops_selection_for_the_lane() {
    let (engine, clock) = manual_engine();
    engine.create_run(noop_run(LANE)).unwrap();
    engine.create_run(noop_run(LANE)).unwrap();
    let caps = TickCaps {
        daily_tick_cap: Some(1),
        ..TickCaps::default()
    };
    assert_eq!(engine.tick_once(ENV, LANE, "worker-1", &caps).ticks, 1);
    let capped = engine.tick_once(ENV, LANE, "worker-1", &caps);
    assert_eq!(capped.status, TickStatus::Idle);
    assert_eq!(capped.reason.as_deref(), Some("daily_cap_reached"));

    clock.advance(Duration::days(1));
    assert_eq!(engine.tick_once(ENV, LANE, "worker-1", &caps).ticks, 1);
}

#[test]
fn kill_switch_blocks_only_its_lane_and_only_new_selection() {
    let (engine, _clock) = manual_engine();
    let blocked = engine
        .create_run(NewRun::new(ENV, "blocked", "report", chain(2)))
        .unwrap();
    let open = engine.create_run(noop_run("open")).unwrap();

    // Start the multi-step run before the switch is engaged.
    engine.tick_once(ENV, "blocked", "worker-1", &TickCaps::single());
    assert_eq!(engine.get_run(&blocked).unwrap().status, RunStatus::Running);

    engine
        .set_kill_switch("blocked", true, "incident 42", "ops")
        .unwrap();
    let status = engine.kill_switch_status("blocked").unwrap();
    assert!(status.engaged);
    assert_eq!(status.reason, "incident 42");
    assert!(!engine.kill_switch_status("open").unwrap().engaged);

    let idle = engine.tick_once(ENV, "blocked", "worker-1", &TickCaps::default());
    assert_eq!(idle.status, TickStatus::Idle);
    assert_eq!(idle.reason.as_deref(), Some("lane_disabled"));
    assert_eq!(engine.get_run(&blocked).unwrap().status, RunStatus::Running);

    let other = engine.tick_once(ENV, "open", "worker-1", &TickCaps::default());
    assert_eq!(other.run_ids, vec![open]);

    engine.set_kill_switch("blocked", false, "", "ops").unwrap();
    engine.tick_once(ENV, "blocked", "worker-1", &TickCaps::default());
    assert_eq!(engine.get_run(&blocked).unwrap().status, RunStatus::Succeeded);

    let audits = engine
        .list_audit(
            &AuditFilter {
                action: Some("set_kill_switch".into()),
                ..AuditFilter::default()
            },
            10,
        )
        .unwrap();
    assert_eq!(audits.len(), 2);
}

#[test]
fn failing_step_fails_the_run_but_not_the_tick() {
    let (engine, _clock) = manual_engine();
    let run_id = engine
        .create_run(NewRun::new(
            ENV,
            LANE,
            "report",
            RunGraph::single("broken", "fail")
                .with_step("never", StepSpec::new("noop").with_deps(["broken"])),
        ))
        .unwrap();

    let result = engine.tick_once(ENV, LANE, "worker-1", &TickCaps::default());
    assert_eq!(result.status, TickStatus::Success);
    assert_eq!(result.ticks, 1);

    let run = engine.get_run(&run_id).unwrap();
    assert_eq!(run.status, RunStatus::Failed);
    let error = run.last_error.expect("last_error");
    assert_eq!(error.step_id.as_deref(), Some("broken"));
    assert!(!error.message.is_empty());

    let state = engine.get_run_state(&run_id).unwrap().state;
    assert!(!state.has_run("never"));
}

#[test]
fn panicking_handler_fails_the_run() {
    let (engine, _clock) = manual_engine();
    let run_id = engine
        .create_run(NewRun::new(ENV, LANE, "report", RunGraph::single("b", "boom")))
        .unwrap();
    let result = engine.tick_once(ENV, LANE, "worker-1", &TickCaps::default());
    assert_eq!(result.status, TickStatus::Success);
    let error = engine.get_run(&run_id).unwrap().last_error.unwrap();
    assert_eq!(error.kind, "panic");
    assert!(error.message.contains("blew up"));
}

#[test]
fn storage_failure_is_a_tick_error_and_rolls_back() {
    let (engine, _clock) = manual_engine();
    let run_id = engine.create_run(noop_run(LANE)).unwrap();
    engine
        .store()
        .with_connection(|conn| {
            conn.execute_batch(
                "CREATE TEMP TRIGGER reject_success BEFORE INSERT ON run_events
                 WHEN NEW.event_type = 'run_succeeded'
                 BEGIN SELECT RAISE(ABORT, 'injected write failure'); END;",
            )
            .map_err(|e| KernelError::Storage(e.to_string()))
        })
        .unwrap();

    let result = engine.tick_once(ENV, LANE, "worker-1", &TickCaps::default());
    assert_eq!(result.status, TickStatus::Error);
    assert_eq!(result.reason.as_deref(), Some("storage_error"));
    assert_eq!(engine.get_run(&run_id).unwrap().status, RunStatus::Pending);
    assert_eq!(engine.get_run_state(&run_id).unwrap().state.tick_count, 0);
    assert_eq!(engine.list_events(&run_id, None, 10).unwrap().items.len(), 1);
    assert!(engine.leases().get(&run_id).unwrap().is_none());
    let audit = &tick_audits(&engine)[0];
    assert_eq!(audit.result, "error");
    assert_eq!(audit.error.as_ref().unwrap()["code"], "STORAGE_ERROR");

    engine
        .store()
        .with_connection(|conn| {
            conn.execute_batch("DROP TRIGGER reject_success")
                .map_err(|e| KernelError::Storage(e.to_string()))
        })
        .unwrap();
    let retried = engine.tick_once(ENV, LANE, "worker-1", &TickCaps::default());
    assert_eq!(retried.status, TickStatus::Success);
    assert_eq!(engine.get_run(&run_id).unwrap().status, RunStatus::Succeeded);
}

#[test]
fn expired_lease_holder_is_fenced_off_after_takeover() {
    let (engine, clock) = manual_engine();
    let run_id = engine.create_run(noop_run(LANE)).unwrap();
    let leases = engine.leases();

    assert!(leases.acquire(&run_id, "worker-a", Duration::seconds(10)).unwrap());
    assert!(!leases.acquire(&run_id, "worker-b", Duration::seconds(10)).unwrap());
    assert!(!leases.release(&run_id, "worker-b").unwrap());
    assert_eq!(leases.get(&run_id).unwrap().unwrap().owner_id, "worker-a");

    clock.advance(Duration::seconds(11));
    assert!(leases.acquire(&run_id, "worker-b", Duration::seconds(10)).unwrap());

    let err = engine.executor().step_fenced(&run_id, "worker-a").unwrap_err();
    assert!(err.is_lease_conflict());
    assert_eq!(engine.get_run(&run_id).unwrap().status, RunStatus::Pending);
    assert!(!leases.renew(&run_id, "worker-a", Duration::seconds(10)).unwrap());

    let report = engine.executor().step_fenced(&run_id, "worker-b").unwrap();
    assert_eq!(report.outcome, StepOutcome::Succeeded);

    clock.advance(Duration::seconds(30));
    assert_eq!(engine.sweep_expired_leases().unwrap(), 1);
    assert!(leases.get(&run_id).unwrap().is_none());
}

#[test]
fn concurrent_acquires_on_a_shared_file_grant_one_lease() {
    init_tracing();
    let path = temp_sqlite_path("lease-race");
    let config = EngineConfig {
        database_path: path.display().to_string(),
        ..EngineConfig::default()
    };
    let engine = Engine::builder(config.clone())
        .artifacts(Arc::new(InMemoryArtifactWriter::new()))
        .build()
        .expect("engine");
    let run_id = engine.create_run(noop_run(LANE)).unwrap();

    let workers = 8;
    let barrier = Arc::new(Barrier::new(workers));
    let handles: Vec<_> = (0..workers)
        .map(|i| {
            let barrier = barrier.clone();
            let config = config.clone();
            let run_id = run_id.clone();
            thread::spawn(move || {
                let engine = Engine::builder(config)
                    .artifacts(Arc::new(InMemoryArtifactWriter::new()))
                    .build()
                    .expect("worker engine");
                barrier.wait();
                engine
                    .leases()
                    .acquire(&run_id, &format!("worker-{}", i), Duration::seconds(30))
                    .expect("acquire")
            })
        })
        .collect();
    let granted = handles
        .into_iter()
        .map(|h| h.join().expect("join"))
        .filter(|granted| *granted)
        .count();
    assert_eq!(granted, 1);
    remove_sqlite_files(&path);
}

#[test]
fn concurrent_ticks_advance_each_run_exactly_once() {
    init_tracing();
    let path = temp_sqlite_path("tick-race");
    let config = EngineConfig {
        database_path: path.display().to_string(),
        ..EngineConfig::default()
    };
    let engine = Engine::builder(config.clone())
        .artifacts(Arc::new(InMemoryArtifactWriter::new()))
        .build()
        .expect("engine");
    let run_ids: Vec<_> = (0..6)
        .map(|_| engine.create_run(noop_run(LANE)).unwrap())
        .collect();

    let workers = 4;
    let barrier = Arc::new(Barrier::new(workers));
    let handles: Vec<_> = (0..workers)
        .map(|i| {
            let barrier = barrier.clone();
            let config = config.clone();
            thread::spawn(move || {
                let engine = Engine::builder(config)
                    .artifacts(Arc::new(InMemoryArtifactWriter::new()))
                    .build()
                    .expect("worker engine");
                barrier.wait();
                let caps = TickCaps {
                    retry_on_lease_conflict: true,
                    ..TickCaps::default()
                };
                let owner = format!("worker-{}", i);
                let mut statuses = Vec::new();
                for _ in 0..3 {
                    statuses.push(engine.tick_once(ENV, LANE, &owner, &caps).status);
                }
                statuses
            })
        })
        .collect();
    for handle in handles {
        let statuses = handle.join().expect("join");
        assert!(statuses.iter().all(|s| *s != TickStatus::Error));
    }

    for run_id in &run_ids {
        assert_eq!(engine.get_run(run_id).unwrap().status, RunStatus::Succeeded);
        let events = engine.list_events(run_id, None, 100).unwrap().items;
        let terminal = events.iter().filter(|e| e.is_terminal()).count();
        let started = events.iter().filter(|e| e.event_type == "step_started").count();
        assert_eq!((terminal, started), (1, 1));
    }
    remove_sqlite_files(&path);
}

#[test]
fn run_listing_pages_newest_first_with_filters() {
    let (engine, clock) = manual_engine();
    let mut created = Vec::new();
    for i in 0..5 {
        let requested_by = if i % 2 == 0 { "alice@example" } else { "bob@example" };
        created.push(
            engine
                .create_run(noop_run(LANE).requested_by(requested_by))
                .unwrap(),
        );
        clock.advance(Duration::milliseconds(10));
    }

    let mut seen = Vec::new();
    let mut cursor: Option<String> = None;
    loop {
        let page = engine
            .list_runs(&RunFilter::default(), cursor.as_deref(), 2)
            .unwrap();
        seen.extend(page.items.into_iter().map(|r| r.run_id));
        match page.next_cursor {
            Some(next) => cursor = Some(next),
            None => break,
        }
    }
    created.reverse();
    assert_eq!(seen, created);

    let alice = engine
        .list_runs(
            &RunFilter {
                requested_by: Some("alice".into()),
                ..RunFilter::default()
            },
            None,
            10,
        )
        .unwrap();
    assert_eq!(alice.items.len(), 3);
    assert!(matches!(
        engine.list_runs(&RunFilter::default(), None, 0),
        Err(KernelError::Validation(_))
    ));
    assert!(matches!(
        engine.list_runs(&RunFilter::default(), Some("not a cursor"), 10),
        Err(KernelError::Validation(_))
    ));
}

#[test]
fn subscribers_receive_cancellation() {
    let (engine, _clock) = manual_engine();
    let run_id = engine
        .create_run(NewRun::new(ENV, LANE, "report", chain(3)))
        .unwrap();
    engine.tick_once(ENV, LANE, "worker-1", &TickCaps::single());
    let mut rx = engine.subscribe_events(&run_id).unwrap();

    let run = engine.cancel_run(&run_id, "ops", "no longer needed").unwrap();
    assert_eq!(run.status, RunStatus::Failed);
    let event = rx.try_recv().expect("run_failed delivered");
    assert_eq!(event.event_type, "run_failed");
    assert_eq!(event.payload["reason"], "cancelled");

    let stale = engine.executor().step(&run_id).unwrap();
    assert_eq!(stale.outcome, StepOutcome::AlreadyTerminal(RunStatus::Failed));
    let cancels = engine
        .list_audit(
            &AuditFilter {
                action: Some("cancel_run".into()),
                ..AuditFilter::default()
            },
            10,
        )
        .unwrap();
    assert_eq!(cancels.len(), 1);
    assert_eq!(cancels[0].result, "success");
}

#[test]
fn write_artifact_step_stores_file_and_records_uri() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let engine = Engine::builder(EngineConfig::in_memory())
        .artifacts(Arc::new(FsArtifactWriter::new(dir.path())))
        .build()
        .expect("engine");
    let graph = RunGraph::default().with_step(
        "summary",
        StepSpec::new("write_artifact").with_config(json!({"rows": 12})),
    );
    let run_id = engine
        .create_run(NewRun::new(ENV, LANE, "report", graph))
        .unwrap();
    let result = engine.tick_once(ENV, LANE, "worker-1", &TickCaps::default());
    assert_eq!(result.status, TickStatus::Success);

    let state = engine.get_run_state(&run_id).unwrap().state;
    let uris: Vec<_> = state.artifact_uris().map(str::to_string).collect();
    assert_eq!(uris.len(), 1);
    assert!(uris[0].starts_with("file://"));
    let written = std::fs::read(dir.path().join(&run_id).join("summary")).unwrap();
    let value: serde_json::Value = serde_json::from_slice(&written).unwrap();
    assert_eq!(value["rows"], 12);

    let completed = engine
        .list_events(&run_id, None, 10)
        .unwrap()
        .items
        .into_iter()
        .find(|e| e.event_type == "step_completed")
        .unwrap();
    assert_eq!(completed.payload["artifact_uris"][0], uris[0].as_str());
}
