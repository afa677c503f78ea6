//! End-to-end build execution against the in-process worker cluster,
//! the recording event sink, and in-memory storage.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;

use gantry_engine::delegate::recording_sink;
use gantry_engine::testing::{services_for, ServicesConfig};
use gantry_engine::{Engine, Outcome, Services, StepError};
use gantry_state::CheckableKind;
use gantry_types::build::SUPPORTED_SCHEMA;
use gantry_types::plan::{
    CheckInterval, CheckPlan, GetPlan, HookedPlan, InParallelPlan, PlanConfig, PutInputs,
    PutPlan, TaskPlan, TimeoutPlan,
};
use gantry_types::task::{TaskConfig, TaskInput, TaskRunConfig};
use gantry_types::{Build, Event, Plan, Version};
use gantry_worker::mem::{HandlerResult, MemCluster, MemWorker, MemWorkerConfig, ProcessCtx};
use gantry_worker::runtime::WorkerResourceType;

fn test_build() -> Arc<Build> {
    Arc::new(Build {
        id: 42,
        name: "7".into(),
        team_id: 1,
        team_name: "main".into(),
        pipeline_id: 3,
        pipeline_name: "ship".into(),
        job_id: 9,
        job_name: "unit".into(),
        create_time: Utc::now(),
        start_time: Utc::now(),
        schema: SUPPORTED_SCHEMA.into(),
    })
}

fn git_type() -> WorkerResourceType {
    WorkerResourceType {
        resource_type: "git".into(),
        image_path: "/images/git".into(),
        version: "1".into(),
        privileged: false,
    }
}

fn git_worker(cluster: &MemCluster, name: &str) -> Arc<MemWorker> {
    cluster.add_worker(MemWorkerConfig {
        resource_types: vec![git_type()],
        ..MemWorkerConfig::named(name)
    })
}

fn script_git_in(worker: &MemWorker, reference: &str) {
    let reference = reference.to_string();
    worker.set_handler("/opt/resource/in", move |ctx: &ProcessCtx| {
        ctx.write_file("/tmp/build/get/ref", reference.clone())?;
        Ok(HandlerResult::stdout_json(&serde_json::json!({
            "version": {"ref": reference},
            "metadata": [{"name": "author", "value": "me"}],
        })))
    });
}

fn get_plan(id: &str, name: &str, resource: &str) -> Plan {
    Plan::new(
        id,
        PlanConfig::Get(GetPlan {
            name: name.into(),
            resource: resource.into(),
            resource_type: "git".into(),
            source: serde_json::json!({"uri": "https://example.com/repo"}),
            params: serde_json::Value::Null,
            version: None,
            tags: vec![],
            versioned_resource_types: vec![],
        }),
    )
}

fn shell_task(id: &str, name: &str, path: &str) -> Plan {
    Plan::new(
        id,
        PlanConfig::Task(TaskPlan {
            name: name.into(),
            config: Some(TaskConfig {
                platform: "linux".into(),
                image_resource: None,
                rootfs_uri: Some("docker:///busybox".into()),
                run: TaskRunConfig {
                    path: path.into(),
                    args: vec![],
                    dir: None,
                    user: None,
                },
                inputs: vec![],
                outputs: vec![],
                env: Default::default(),
            }),
            config_from: None,
            privileged: false,
            tags: vec![],
            versioned_resource_types: vec![],
        }),
    )
}

async fn run_plan(
    services: &Arc<Services>,
    plan: &Plan,
) -> Result<gantry_engine::BuildResult, StepError> {
    Engine::new(services.clone())
        .execute(&test_build(), plan, CancellationToken::new())
        .await
}

#[tokio::test]
async fn s1_get_then_task_mounts_the_artifact() {
    let cluster = MemCluster::new();
    let worker = git_worker(&cluster, "w1");
    script_git_in(&worker, "abc123");
    worker.set_handler("/bin/test", |ctx: &ProcessCtx| {
        // The task sees the get's output at its input mount.
        let reference = ctx.read_file("/tmp/build/r/ref")?;
        assert_eq!(reference, "abc123");
        Ok(HandlerResult::exit(0))
    });

    let (sink, events) = recording_sink();
    let services = services_for(
        &cluster,
        ServicesConfig {
            sink: Some(sink),
            ..ServicesConfig::default()
        },
    );

    let mut task = shell_task("2", "t", "/bin/test");
    if let PlanConfig::Task(task_plan) = &mut task.config {
        if let Some(config) = &mut task_plan.config {
            config.inputs = vec![TaskInput {
                name: "r".into(),
                path: None,
                optional: false,
            }];
        }
    }
    let plan = Plan::new("0", PlanConfig::Do(vec![get_plan("1", "r", "repo"), task]));

    let result = run_plan(&services, &plan).await.unwrap();
    assert_eq!(result.outcome, Outcome::Succeeded);
    assert!(result.state.artifacts().get("r").is_some());

    // The get moved the pipeline's latest-version pointer.
    let version = services.state.resource_version(3, "repo").unwrap().unwrap();
    assert_eq!(version.get("ref"), Some("abc123"));

    // Per-step event ordering for the get leaf.
    let events = events.lock().unwrap();
    let get_events: Vec<&Event> = events
        .iter()
        .filter(|event| event.origin().id.as_str() == "1")
        .collect();
    assert!(matches!(get_events[0], Event::Initialize { .. }));
    assert!(matches!(get_events[1], Event::SelectedWorker { .. }));
    assert!(matches!(get_events[2], Event::Start { .. }));
    assert!(matches!(
        get_events.last().unwrap(),
        Event::Finish { exit_status: 0, .. }
    ));
}

#[tokio::test]
async fn s2_on_failure_hook_runs_and_build_fails() {
    let cluster = MemCluster::new();
    let worker = git_worker(&cluster, "w1");
    worker.set_handler("/bin/flaky", |_| Ok(HandlerResult::exit(1)));
    let notified = Arc::new(AtomicUsize::new(0));
    let notified_in_handler = notified.clone();
    worker.set_handler("/bin/notify", move |_| {
        notified_in_handler.fetch_add(1, Ordering::SeqCst);
        Ok(HandlerResult::exit(0))
    });

    let services = services_for(&cluster, ServicesConfig::default());
    let plan = Plan::new(
        "0",
        PlanConfig::OnFailure(HookedPlan {
            step: Box::new(shell_task("1", "t", "/bin/flaky")),
            next: Box::new(shell_task("2", "notify", "/bin/notify")),
        }),
    );

    let result = run_plan(&services, &plan).await.unwrap();
    // Failed, not errored; the hook ran exactly once.
    assert_eq!(result.outcome, Outcome::Failed);
    assert_eq!(notified.load(Ordering::SeqCst), 1);
    assert_eq!(result.state.result(&"1".into()), Some(false));
    assert_eq!(result.state.result(&"2".into()), Some(true));
}

#[tokio::test]
async fn on_success_and_on_failure_are_exclusive() {
    let cluster = MemCluster::new();
    let worker = git_worker(&cluster, "w1");
    worker.set_handler("/bin/ok", |_| Ok(HandlerResult::exit(0)));
    let ran = Arc::new(Mutex::new(Vec::new()));
    for hook in ["success-hook", "failure-hook"] {
        let ran = ran.clone();
        worker.set_handler(&format!("/bin/{hook}"), move |ctx: &ProcessCtx| {
            ran.lock().unwrap().push(ctx.spec.path.clone());
            Ok(HandlerResult::exit(0))
        });
    }

    let services = services_for(&cluster, ServicesConfig::default());
    let plan = Plan::new(
        "0",
        PlanConfig::OnFailure(HookedPlan {
            step: Box::new(Plan::new(
                "1",
                PlanConfig::OnSuccess(HookedPlan {
                    step: Box::new(shell_task("2", "t", "/bin/ok")),
                    next: Box::new(shell_task("3", "s", "/bin/success-hook")),
                }),
            )),
            next: Box::new(shell_task("4", "f", "/bin/failure-hook")),
        }),
    );

    let result = run_plan(&services, &plan).await.unwrap();
    assert_eq!(result.outcome, Outcome::Succeeded);
    assert_eq!(ran.lock().unwrap().as_slice(), ["/bin/success-hook"]);
}

#[tokio::test]
async fn s3_fail_fast_cancels_long_running_sibling() {
    let cluster = MemCluster::new();
    let worker = git_worker(&cluster, "w1");
    worker.set_handler("/bin/quick", |_| Ok(HandlerResult::exit(0)));
    worker.set_handler("/bin/failing", |_| {
        Ok(HandlerResult {
            exit_status: 1,
            delay: Some(Duration::from_millis(50)),
            ..HandlerResult::default()
        })
    });
    worker.set_handler("/bin/slow", |_| {
        Ok(HandlerResult {
            delay: Some(Duration::from_secs(600)),
            ..HandlerResult::default()
        })
    });

    let services = services_for(&cluster, ServicesConfig::default());
    let plan = Plan::new(
        "0",
        PlanConfig::InParallel(InParallelPlan {
            steps: vec![
                shell_task("1", "a", "/bin/quick"),
                shell_task("2", "b", "/bin/failing"),
                shell_task("3", "c", "/bin/slow"),
            ],
            limit: 2,
            fail_fast: true,
        }),
    );

    let started = std::time::Instant::now();
    let result = run_plan(&services, &plan).await.unwrap();
    assert_eq!(result.outcome, Outcome::Failed);
    // The slow sibling observed the cancellation instead of running out
    // its ten minutes.
    assert!(started.elapsed() < Duration::from_secs(30));
}

#[tokio::test]
async fn s4_retry_stops_at_first_success() {
    let cluster = MemCluster::new();
    let worker = git_worker(&cluster, "w1");
    let attempts = Arc::new(AtomicUsize::new(0));
    let attempts_in_handler = attempts.clone();
    worker.set_handler("/bin/eventually", move |_| {
        let n = attempts_in_handler.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(HandlerResult::exit(i32::from(n < 3)))
    });

    let services = services_for(&cluster, ServicesConfig::default());
    let plan = Plan::new(
        "0",
        PlanConfig::Retry(vec![
            shell_task("0/1", "t", "/bin/eventually"),
            shell_task("0/2", "t", "/bin/eventually"),
            shell_task("0/3", "t", "/bin/eventually"),
            shell_task("0/4", "t", "/bin/eventually"),
        ]),
    );

    let result = run_plan(&services, &plan).await.unwrap();
    assert_eq!(result.outcome, Outcome::Succeeded);
    // Two failures, one success, and no fourth attempt.
    assert_eq!(attempts.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn retry_exhausts_and_reports_failure() {
    let cluster = MemCluster::new();
    let worker = git_worker(&cluster, "w1");
    let attempts = Arc::new(AtomicUsize::new(0));
    let attempts_in_handler = attempts.clone();
    worker.set_handler("/bin/always-failing", move |_| {
        attempts_in_handler.fetch_add(1, Ordering::SeqCst);
        Ok(HandlerResult::exit(1))
    });

    let services = services_for(&cluster, ServicesConfig::default());
    let plan = Plan::new(
        "0",
        PlanConfig::Retry(vec![
            shell_task("0/1", "t", "/bin/always-failing"),
            shell_task("0/2", "t", "/bin/always-failing"),
        ]),
    );

    let result = run_plan(&services, &plan).await.unwrap();
    assert_eq!(result.outcome, Outcome::Failed);
    assert_eq!(attempts.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn ensure_runs_after_cancellation() {
    let cluster = MemCluster::new();
    let worker = git_worker(&cluster, "w1");
    worker.set_handler("/bin/hang", |_| {
        Ok(HandlerResult {
            delay: Some(Duration::from_secs(600)),
            ..HandlerResult::default()
        })
    });
    let cleaned = Arc::new(AtomicUsize::new(0));
    let cleaned_in_handler = cleaned.clone();
    worker.set_handler("/bin/cleanup", move |_| {
        cleaned_in_handler.fetch_add(1, Ordering::SeqCst);
        Ok(HandlerResult::exit(0))
    });

    let services = services_for(&cluster, ServicesConfig::default());
    let plan = Plan::new(
        "0",
        PlanConfig::Ensure(HookedPlan {
            step: Box::new(shell_task("1", "main", "/bin/hang")),
            next: Box::new(shell_task("2", "cleanup", "/bin/cleanup")),
        }),
    );

    let cancel = CancellationToken::new();
    let cancel_for_abort = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel_for_abort.cancel();
    });

    let err = Engine::new(services)
        .execute(&test_build(), &plan, cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, StepError::Aborted), "{err}");
    // The cleanup hook ran to completion despite the abort.
    assert_eq!(cleaned.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn on_abort_hook_runs_only_on_cancellation() {
    let cluster = MemCluster::new();
    let worker = git_worker(&cluster, "w1");
    worker.set_handler("/bin/ok", |_| Ok(HandlerResult::exit(0)));
    let aborted = Arc::new(AtomicUsize::new(0));
    let aborted_in_handler = aborted.clone();
    worker.set_handler("/bin/on-abort", move |_| {
        aborted_in_handler.fetch_add(1, Ordering::SeqCst);
        Ok(HandlerResult::exit(0))
    });

    let services = services_for(&cluster, ServicesConfig::default());
    let plan = Plan::new(
        "0",
        PlanConfig::OnAbort(HookedPlan {
            step: Box::new(shell_task("1", "t", "/bin/ok")),
            next: Box::new(shell_task("2", "h", "/bin/on-abort")),
        }),
    );

    let result = run_plan(&services, &plan).await.unwrap();
    assert_eq!(result.outcome, Outcome::Succeeded);
    assert_eq!(aborted.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn timeout_reports_failure_not_error() {
    let cluster = MemCluster::new();
    let worker = git_worker(&cluster, "w1");
    worker.set_handler("/bin/slow", |_| {
        Ok(HandlerResult {
            delay: Some(Duration::from_secs(600)),
            ..HandlerResult::default()
        })
    });

    let services = services_for(&cluster, ServicesConfig::default());
    let plan = Plan::new(
        "0",
        PlanConfig::Timeout(TimeoutPlan {
            step: Box::new(shell_task("1", "t", "/bin/slow")),
            duration_secs: 1,
        }),
    );

    let result = run_plan(&services, &plan).await.unwrap();
    assert_eq!(result.outcome, Outcome::Failed);
}

#[tokio::test]
async fn try_suppresses_failure() {
    let cluster = MemCluster::new();
    let worker = git_worker(&cluster, "w1");
    worker.set_handler("/bin/flaky", |_| Ok(HandlerResult::exit(1)));

    let services = services_for(&cluster, ServicesConfig::default());
    let plan = Plan::new(
        "0",
        PlanConfig::Try(Box::new(shell_task("1", "t", "/bin/flaky"))),
    );
    let result = run_plan(&services, &plan).await.unwrap();
    assert_eq!(result.outcome, Outcome::Succeeded);
}

#[tokio::test]
async fn duplicate_artifact_names_error_the_build() {
    let cluster = MemCluster::new();
    let worker = git_worker(&cluster, "w1");
    script_git_in(&worker, "abc");

    let services = services_for(&cluster, ServicesConfig::default());
    // Two gets registering the same artifact name concurrently: exactly
    // one wins, the other surfaces a duplicate-registration error.
    let plan = Plan::new(
        "0",
        PlanConfig::InParallel(InParallelPlan {
            steps: vec![get_plan("1", "r", ""), get_plan("2", "r", "")],
            limit: 0,
            fail_fast: false,
        }),
    );

    let err = run_plan(&services, &plan).await.unwrap_err();
    assert!(err.to_string().contains("already registered"), "{err}");
}

#[tokio::test]
async fn across_binds_vars_per_substep() {
    let cluster = MemCluster::new();
    let worker = git_worker(&cluster, "w1");
    let seen = Arc::new(Mutex::new(Vec::new()));
    let seen_in_handler = seen.clone();
    worker.set_handler("/bin/deploy", move |ctx: &ProcessCtx| {
        let region = ctx
            .env
            .iter()
            .find(|(key, _)| key == "REGION")
            .map(|(_, value)| value.clone())
            .unwrap_or_default();
        seen_in_handler.lock().unwrap().push(region);
        Ok(HandlerResult::exit(0))
    });

    let services = services_for(&cluster, ServicesConfig::default());
    let mut template = shell_task("t", "deploy", "/bin/deploy");
    if let PlanConfig::Task(task_plan) = &mut template.config {
        if let Some(config) = &mut task_plan.config {
            config.env = [("REGION".to_string(), "((region))".to_string())]
                .into_iter()
                .collect();
        }
    }
    let plan = Plan::new(
        "0",
        PlanConfig::Across(gantry_types::plan::AcrossPlan {
            vars: vec![gantry_types::plan::AcrossVar {
                var: "region".into(),
                values: vec![serde_json::json!("us-1"), serde_json::json!("eu-2")],
                max_in_flight: 1,
            }],
            step: Box::new(template),
            fail_fast: false,
        }),
    );

    let result = run_plan(&services, &plan).await.unwrap();
    assert_eq!(result.outcome, Outcome::Succeeded);
    let mut seen = seen.lock().unwrap().clone();
    seen.sort();
    assert_eq!(seen, vec!["eu-2".to_string(), "us-1".to_string()]);
}

#[tokio::test]
async fn put_mounts_detected_inputs_and_updates_version() {
    let cluster = MemCluster::new();
    let worker = git_worker(&cluster, "w1");
    script_git_in(&worker, "abc");
    worker.set_handler("/opt/resource/out", |ctx: &ProcessCtx| {
        // Only the detected artifact is mounted.
        assert_eq!(ctx.mount_paths(), vec!["/tmp/build/put/r".to_string()]);
        ctx.read_file("/tmp/build/put/r/ref")?;
        Ok(HandlerResult::stdout_json(&serde_json::json!({
            "version": {"ref": "pushed-1"},
        })))
    });

    let services = services_for(&cluster, ServicesConfig::default());
    let put = Plan::new(
        "2",
        PlanConfig::Put(PutPlan {
            name: "push".into(),
            resource: "repo".into(),
            resource_type: "git".into(),
            source: serde_json::json!({"uri": "u"}),
            params: serde_json::json!({"repository": "r/"}),
            inputs: PutInputs::Detect,
            tags: vec![],
            versioned_resource_types: vec![],
        }),
    );
    let plan = Plan::new(
        "0",
        PlanConfig::Do(vec![
            get_plan("1", "r", ""),
            get_plan("1b", "other", ""),
            put,
        ]),
    );

    let result = run_plan(&services, &plan).await.unwrap();
    assert_eq!(result.outcome, Outcome::Succeeded);
    let version = services.state.resource_version(3, "repo").unwrap().unwrap();
    assert_eq!(version.get("ref"), Some("pushed-1"));
}

#[tokio::test]
async fn s6_image_artifact_replicates_across_workers() {
    let cluster = MemCluster::new();
    let w1 = git_worker(&cluster, "w1");
    // The image artifact (with metadata.json) is produced on w1.
    w1.set_handler("/opt/resource/in", |ctx: &ProcessCtx| {
        ctx.write_file(
            "/tmp/build/get/metadata.json",
            r#"{"env": ["PATH=/usr/bin"], "user": "ci"}"#,
        )?;
        ctx.write_file("/tmp/build/get/rootfs/bin/sh", "elf")?;
        Ok(HandlerResult::stdout_json(&serde_json::json!({
            "version": {"digest": "sha256:1"},
        })))
    });

    // The task is pinned to w2 by tag.
    let w2 = cluster.add_worker(MemWorkerConfig {
        tags: vec!["builder".into()],
        ..MemWorkerConfig::named("w2")
    });
    w2.set_handler("/bin/build", |_| Ok(HandlerResult::exit(0)));

    let services = services_for(&cluster, ServicesConfig::default());
    let mut task = shell_task("2", "build", "/bin/build");
    if let PlanConfig::Task(task_plan) = &mut task.config {
        task_plan.tags = vec!["builder".into()];
        if let Some(config) = &mut task_plan.config {
            // Root filesystem comes from the image artifact.
            config.rootfs_uri = Some("image".into());
        }
    }
    let plan = Plan::new("0", PlanConfig::Do(vec![get_plan("1", "image", ""), task]));

    let result = run_plan(&services, &plan).await.unwrap();
    assert_eq!(result.outcome, Outcome::Succeeded);

    // The task container on w2 got a local raw:// rootfs carved out of
    // the replicated artifact.
    let rootfs_urls: Vec<String> = w2
        .containers()
        .iter()
        .map(|container| container.rootfs_url().to_string())
        .collect();
    assert_eq!(rootfs_urls.len(), 1);
    assert!(rootfs_urls[0].starts_with("raw:///volumes/"), "{rootfs_urls:?}");
    assert!(rootfs_urls[0].ends_with("/rootfs"), "{rootfs_urls:?}");
    assert_eq!(w2.containers()[0].user(), Some("ci"));
}

#[tokio::test]
async fn check_step_saves_versions_and_reuses_results() {
    let cluster = MemCluster::new();
    let worker = git_worker(&cluster, "w1");
    let checks = Arc::new(AtomicUsize::new(0));
    let checks_in_handler = checks.clone();
    worker.set_handler("/opt/resource/check", move |_| {
        checks_in_handler.fetch_add(1, Ordering::SeqCst);
        Ok(HandlerResult::stdout_json(&serde_json::json!([
            {"ref": "v1"},
            {"ref": "v2"},
        ])))
    });

    let services = services_for(&cluster, ServicesConfig::default());
    let check = |id: &str| {
        Plan::new(
            id,
            PlanConfig::Check(CheckPlan {
                name: "repo".into(),
                resource: "repo".into(),
                resource_type: String::new(),
                prototype: String::new(),
                image_type: "git".into(),
                source: serde_json::json!({"uri": "u"}),
                interval: CheckInterval {
                    interval_secs: 600,
                    never: false,
                },
                skip_interval: false,
                from_version: None,
                tags: vec![],
                versioned_resource_types: vec![],
            }),
        )
    };

    let result = run_plan(&services, &check("1")).await.unwrap();
    assert_eq!(result.outcome, Outcome::Succeeded);
    assert_eq!(checks.load(Ordering::SeqCst), 1);

    // The scope now points at the checked resource and carries the
    // discovered versions, newest last.
    let scope = services
        .state
        .checkable_scope(3, CheckableKind::Resource, "repo")
        .unwrap()
        .expect("resource should be bound to a scope");
    assert_eq!(
        services.state.latest_version(scope).unwrap(),
        Some(Version::from_pairs([("ref", "v2")]))
    );
    let last = services.state.last_check(scope).unwrap();
    assert!(last.succeeded);

    // A second periodic check within the interval reuses the result.
    let result = run_plan(&services, &check("2")).await.unwrap();
    assert_eq!(result.outcome, Outcome::Succeeded);
    assert_eq!(checks.load(Ordering::SeqCst), 1, "interval gate must hold");

    // The lock is free afterwards.
    assert!(services.state.try_acquire_check_lock(scope).unwrap());
}

#[tokio::test]
async fn failing_check_records_unsuccessful_last_check() {
    let cluster = MemCluster::new();
    let worker = git_worker(&cluster, "w1");
    worker.set_handler("/opt/resource/check", |_| {
        Ok(HandlerResult {
            exit_status: 1,
            stderr_lines: vec!["auth failed".into()],
            ..HandlerResult::default()
        })
    });

    let services = services_for(&cluster, ServicesConfig::default());
    let plan = Plan::new(
        "1",
        PlanConfig::Check(CheckPlan {
            name: "repo".into(),
            resource: "repo".into(),
            resource_type: String::new(),
            prototype: String::new(),
            image_type: "git".into(),
            source: serde_json::json!({"uri": "u"}),
            interval: CheckInterval {
                interval_secs: 600,
                never: false,
            },
            skip_interval: true,
            from_version: None,
            tags: vec![],
            versioned_resource_types: vec![],
        }),
    );

    let result = run_plan(&services, &plan).await.unwrap();
    assert_eq!(result.outcome, Outcome::Failed);

    // The failure is recorded so the next manual check is not skipped
    // as redundant, and the lock is released.
    let scope = services.state.find_or_create_scope(
        &gantry_state::cache_key::resource_config_key(
            "git",
            &serde_json::json!({"uri": "u"}),
            &[],
        ),
        Some("repo"),
    )
    .unwrap();
    let last = services.state.last_check(scope).unwrap();
    assert!(!last.succeeded);
    assert!(services.state.try_acquire_check_lock(scope).unwrap());
}

#[tokio::test]
async fn load_var_feeds_task_config() {
    let cluster = MemCluster::new();
    let worker = git_worker(&cluster, "w1");
    worker.set_handler("/opt/resource/in", |ctx: &ProcessCtx| {
        ctx.write_file("/tmp/build/get/version.txt", "  1.2.3\n")?;
        Ok(HandlerResult::stdout_json(&serde_json::json!({
            "version": {"ref": "x"},
        })))
    });
    let seen = Arc::new(Mutex::new(String::new()));
    let seen_in_handler = seen.clone();
    worker.set_handler("/bin/release", move |ctx: &ProcessCtx| {
        if let Some((_, value)) = ctx.env.iter().find(|(key, _)| key == "VERSION") {
            *seen_in_handler.lock().unwrap() = value.clone();
        }
        Ok(HandlerResult::exit(0))
    });

    let services = services_for(&cluster, ServicesConfig::default());
    let mut task = shell_task("3", "release", "/bin/release");
    if let PlanConfig::Task(task_plan) = &mut task.config {
        if let Some(config) = &mut task_plan.config {
            config.env = [("VERSION".to_string(), "((semver))".to_string())]
                .into_iter()
                .collect();
        }
    }
    let plan = Plan::new(
        "0",
        PlanConfig::Do(vec![
            get_plan("1", "meta", ""),
            Plan::new(
                "2",
                PlanConfig::LoadVar(gantry_types::plan::LoadVarPlan {
                    name: "semver".into(),
                    file: "meta/version.txt".into(),
                    format: None,
                    reveal: true,
                }),
            ),
            task,
        ]),
    );

    let result = run_plan(&services, &plan).await.unwrap();
    assert_eq!(result.outcome, Outcome::Succeeded);
    assert_eq!(seen.lock().unwrap().as_str(), "1.2.3");

    // The loaded binding is visible in the final run state.
    let binding = result.state.vars().get("semver").unwrap();
    assert_eq!(binding.value, serde_json::json!("1.2.3"));
    assert!(!binding.redact, "reveal: true must not redact");
}

#[tokio::test]
async fn no_compatible_workers_errors_the_build() {
    let cluster = MemCluster::new();
    cluster.add_worker(MemWorkerConfig {
        platform: "darwin".into(),
        ..MemWorkerConfig::named("mac")
    });

    let services = services_for(&cluster, ServicesConfig::default());
    let plan = shell_task("1", "t", "/bin/anything");

    let err = run_plan(&services, &plan).await.unwrap_err();
    assert!(matches!(err, StepError::Transient(_)), "{err}");
    assert!(err.to_string().contains("no workers satisfy"), "{err}");
}

#[tokio::test]
async fn artifact_output_then_input_bridges_builds() {
    let cluster = MemCluster::new();
    let worker = git_worker(&cluster, "w1");
    script_git_in(&worker, "abc");

    let services = services_for(&cluster, ServicesConfig::default());

    // First build exports the fetched artifact.
    let export = Plan::new(
        "0",
        PlanConfig::Do(vec![
            get_plan("1", "r", ""),
            Plan::new(
                "2",
                PlanConfig::ArtifactOutput(gantry_types::plan::ArtifactOutputPlan {
                    name: "r".into(),
                }),
            ),
        ]),
    );
    let result = run_plan(&services, &export).await.unwrap();
    assert_eq!(result.outcome, Outcome::Succeeded);

    // Second build imports it by id under a new name.
    let import = Plan::new(
        "0",
        PlanConfig::ArtifactInput(gantry_types::plan::ArtifactInputPlan {
            artifact_id: 1,
            name: "seed".into(),
        }),
    );
    let result = run_plan(&services, &import).await.unwrap();
    assert_eq!(result.outcome, Outcome::Succeeded);
    assert!(result.state.artifacts().get("seed").is_some());
}
