/// Pipeline behavior through the deploy orchestrator: strategy selection,
/// step ordering, failure attribution, redeploy and cancellation.
use crate::common::{setup, setup_with, API, DOCS, SCRIPT, SITE};
use deckhand::{
    error::DeployError,
    services::{registry_service::NewApplication, BuildStrategy},
    ApiError,
};
use entity::sea_orm_active_enums::{ApplicationStatus, RuntimeKind};
use sea_orm::TransactionTrait;
use std::{sync::Arc, time::Duration};
use tokio::{sync::Barrier, task::JoinSet};

#[tokio::test]
async fn scenario_c_build_descriptor_builds_before_launch() {
    let ctx = setup().await;

    let outcome = ctx
        .state
        .deploy_service
        .deploy("42", SITE, Some(300))
        .await
        .unwrap();

    assert_eq!(outcome.strategy, BuildStrategy::Containerized);
    assert_eq!(outcome.app.runtime_kind, Some(RuntimeKind::Container));
    assert_eq!(outcome.app.runtime_handle, outcome.app.runtime_name);
    assert!(outcome.app.runtime_name.starts_with("dh_42_site_"));
    // Time-ordered row ids
    assert_eq!(outcome.app.id.get_version_num(), 7);

    let verbs = ctx.runtime.verbs();
    assert_eq!(verbs, vec!["clone", "build", "rm", "run"]);

    // The ceiling is exactly the admitted request
    let run = ctx.runtime.calls().pop().unwrap();
    assert_eq!(run, format!("run {} 300m", outcome.app.runtime_name));
    assert!(ctx.runtime.live_containers().contains(&outcome.app.runtime_name));

    // Default environment written next to the clone
    let workspace = ctx.root.path().join("apps").join("42").join("site");
    assert_eq!(
        std::fs::read_to_string(workspace.join(".env")).unwrap(),
        "PORT=8000\n"
    );
}

#[tokio::test]
async fn entrypoint_without_descriptor_runs_as_process() {
    let ctx = setup().await;

    let outcome = ctx
        .state
        .deploy_service
        .deploy("42", SCRIPT, Some(128))
        .await
        .unwrap();

    assert!(matches!(
        outcome.strategy,
        BuildStrategy::InterpretedFallback { ref entrypoint, manifest: Some(_) } if entrypoint == "app.py"
    ));
    assert_eq!(outcome.app.runtime_kind, Some(RuntimeKind::Process));
    assert_eq!(
        ctx.runtime.verbs(),
        vec!["clone", "venv", "install", "spawn"]
    );

    let pid: u32 = outcome.app.runtime_handle.parse().unwrap();
    assert!(ctx.runtime.live_processes().contains(&pid));

    let log_path = outcome.app.log_path.clone().unwrap();
    assert!(log_path.ends_with("app.log"));
    // The workspace .env reached the process environment
    assert!(std::fs::read_to_string(log_path)
        .unwrap()
        .contains("listening on 8000"));
}

#[tokio::test]
async fn repository_env_file_is_kept() {
    let ctx = setup().await;
    ctx.runtime.set_repo(
        SCRIPT,
        &[("main.py", "print('hi')\n"), (".env", "PORT=3000\n")],
    );

    let outcome = ctx
        .state
        .deploy_service
        .deploy("42", SCRIPT, None)
        .await
        .unwrap();

    // No manifest, so nothing is installed
    assert_eq!(ctx.runtime.verbs(), vec!["clone", "venv", "spawn"]);
    let log = std::fs::read_to_string(outcome.app.log_path.unwrap()).unwrap();
    assert!(log.contains("listening on 3000"));
}

#[tokio::test]
async fn scenario_d_nothing_to_run_fails_fast() {
    let ctx = setup().await;

    let err = ctx
        .state
        .deploy_service
        .deploy("42", DOCS, None)
        .await
        .unwrap_err();

    match err {
        ApiError::Deploy(DeployError::NoEntrypoint(message)) => {
            assert!(message.contains("Dockerfile"));
            assert!(message.contains("app.py"));
        }
        other => panic!("expected NoEntrypoint, got {other:?}"),
    }

    // Cloned, then nothing else
    assert_eq!(ctx.runtime.verbs(), vec!["clone"]);

    // The failed workspace stays for inspection
    let workspace = ctx.root.path().join("apps").join("42").join("docs");
    assert!(workspace.join("README.md").is_file());

    let app = ctx.state.registry_service.get("42", "docs").await.unwrap();
    assert_eq!(app.status, ApplicationStatus::Failed);
    assert!(app.runtime_handle.is_empty());
}

#[tokio::test]
async fn failed_steps_report_their_output_verbatim() {
    let ctx = setup().await;

    let cases: [(&str, &str, fn(&DeployError) -> bool); 3] = [
        ("clone", "fatal: could not read Username\n", |e| {
            matches!(e, DeployError::CloneFailed(_))
        }),
        ("build", "Step 3/5 : RUN pip install\nERROR: no matching distribution\n", |e| {
            matches!(e, DeployError::BuildFailed(_))
        }),
        ("run", "docker: invalid memory value\n", |e| {
            matches!(e, DeployError::LaunchFailed(_))
        }),
    ];

    for (step, output, expected) in cases {
        ctx.runtime.clear_failures();
        ctx.runtime.fail(step, output);

        let err = ctx
            .state
            .deploy_service
            .deploy("42", SITE, None)
            .await
            .unwrap_err();
        let ApiError::Deploy(deploy_err) = err else {
            panic!("{step}: expected a deploy error, got {err:?}");
        };
        assert!(expected(&deploy_err), "{step}: {deploy_err:?}");
        assert!(deploy_err.to_string().ends_with(output), "{deploy_err}");
    }

    // A failed launch leaves nothing running under the allocated name
    assert!(ctx.runtime.live_containers().is_empty());
    assert_eq!(ctx.runtime.verbs().last().map(String::as_str), Some("rm"));
}

#[tokio::test]
async fn failed_deploy_consumes_no_credit() {
    let ctx = setup().await;
    ctx.state
        .deploy_service
        .deploy("42", SITE, Some(512))
        .await
        .unwrap();
    ctx.grant_credits("42", 100).await;

    for step in ["clone", "build", "run"] {
        ctx.runtime.clear_failures();
        ctx.runtime.fail(step, "boom\n");
        assert!(ctx
            .state
            .deploy_service
            .deploy("42", API, Some(100))
            .await
            .is_err());

        let balance = ctx.state.admission_service.balance("42").await.unwrap();
        assert_eq!(balance.credits, 100, "after failed {step}");
        assert_eq!(balance.reserved_credits, 0, "after failed {step}");
        assert_eq!(balance.used_mb, 512, "after failed {step}");
    }

    // The failed record is replaced by the next attempt
    ctx.runtime.clear_failures();
    let outcome = ctx
        .state
        .deploy_service
        .deploy("42", API, Some(100))
        .await
        .unwrap();
    assert_eq!(outcome.credits_debited, 100);
    assert_eq!(ctx.credits("42").await, 0);
    assert_eq!(ctx.state.registry_service.list("42").await.unwrap().len(), 2);
}

#[tokio::test]
async fn redeploy_replaces_workspace_and_runtime() {
    let ctx = setup().await;
    let first = ctx
        .state
        .deploy_service
        .deploy("42", SITE, Some(512))
        .await
        .unwrap();

    let workspace = ctx.root.path().join("apps").join("42").join("site");
    std::fs::write(workspace.join("scratch.txt"), "left behind").unwrap();
    ctx.runtime
        .set_repo(SITE, &[("Dockerfile", "FROM python:3.12\n"), ("main.py", "v2\n")]);

    // The running instance being replaced does not count against the request
    let second = ctx
        .state
        .deploy_service
        .deploy("42", SITE, Some(512))
        .await
        .unwrap();
    assert_eq!(second.credits_debited, 0);
    assert_ne!(first.app.runtime_name, second.app.runtime_name);

    // Exactly one live runtime under the application's name
    assert_eq!(
        ctx.runtime.live_containers(),
        [second.app.runtime_name.clone()].into_iter().collect()
    );
    let current = ctx.state.registry_service.get("42", "site").await.unwrap();
    assert_eq!(current.id, second.app.id);
    assert_eq!(current.status, ApplicationStatus::Running);

    // Only the latest clone on disk
    assert!(workspace.join("main.py").is_file());
    assert!(!workspace.join("app.py").exists());
    assert!(!workspace.join("scratch.txt").exists());

    // The old runtime was removed only after the new one started
    let calls = ctx.runtime.calls();
    let started = calls
        .iter()
        .position(|c| c.starts_with(&format!("run {}", second.app.runtime_name)))
        .unwrap();
    let removed = calls
        .iter()
        .rposition(|c| *c == format!("rm {}", first.app.runtime_name))
        .unwrap();
    assert!(removed > started);

    let balance = ctx.state.admission_service.balance("42").await.unwrap();
    assert_eq!(balance.used_mb, 512);
}

#[tokio::test]
async fn failed_redeploy_keeps_previous_runtime() {
    let ctx = setup().await;
    let first = ctx
        .state
        .deploy_service
        .deploy("42", SITE, None)
        .await
        .unwrap();

    ctx.runtime.fail("build", "error: syntax\n");
    assert!(ctx
        .state
        .deploy_service
        .deploy("42", SITE, None)
        .await
        .is_err());

    let current = ctx.state.registry_service.get("42", "site").await.unwrap();
    assert_eq!(current.id, first.app.id);
    assert_eq!(current.status, ApplicationStatus::Running);
    assert!(ctx.runtime.live_containers().contains(&first.app.runtime_name));
}

#[tokio::test]
async fn concurrent_deploys_cannot_double_spend() {
    let ctx = setup().await;
    ctx.state
        .deploy_service
        .deploy("42", SITE, Some(512))
        .await
        .unwrap();
    ctx.grant_credits("42", 100).await;
    ctx.runtime.set_repo(
        crate::common::SCRIPT,
        &[("Dockerfile", "FROM python:3.12\n")],
    );
    // Keep both pipelines in flight at the same time
    ctx.runtime.delay_clones(Duration::from_millis(50));

    let barrier = Arc::new(Barrier::new(2));
    let mut tasks = JoinSet::new();
    for url in [API, SCRIPT] {
        let deploy = ctx.state.deploy_service.clone();
        let barrier = barrier.clone();
        tasks.spawn(async move {
            barrier.wait().await;
            deploy.deploy("42", url, Some(100)).await
        });
    }

    let mut admitted = 0;
    let mut denied = 0;
    while let Some(result) = tasks.join_next().await {
        match result.unwrap() {
            Ok(outcome) => {
                assert_eq!(outcome.credits_debited, 100);
                admitted += 1;
            }
            Err(ApiError::InsufficientCredit { deficit: 100, .. }) => denied += 1,
            Err(other) => panic!("unexpected error {other:?}"),
        }
    }

    assert_eq!((admitted, denied), (1, 1));
    assert_eq!(ctx.credits("42").await, 0);
}

#[tokio::test]
async fn concurrent_deploys_of_one_repository_are_serialized() {
    let ctx = setup().await;
    ctx.runtime.delay_clones(Duration::from_millis(20));

    let mut tasks = JoinSet::new();
    for _ in 0..3 {
        let deploy = ctx.state.deploy_service.clone();
        tasks.spawn(async move { deploy.deploy("42", SITE, Some(200)).await });
    }
    while let Some(result) = tasks.join_next().await {
        result.unwrap().unwrap();
    }

    let running: Vec<_> = ctx
        .state
        .registry_service
        .list("42")
        .await
        .unwrap()
        .into_iter()
        .filter(|app| app.status == ApplicationStatus::Running)
        .collect();
    assert_eq!(running.len(), 1);
    assert_eq!(
        ctx.runtime.live_containers(),
        [running[0].runtime_name.clone()].into_iter().collect()
    );

    // Clones never overlapped: each one finished its launch before the next began
    let verbs = ctx.runtime.verbs();
    let clones: Vec<_> = verbs
        .iter()
        .enumerate()
        .filter(|(_, verb)| *verb == "clone")
        .map(|(i, _)| i)
        .collect();
    for window in clones.windows(2) {
        assert!(verbs[window[0]..window[1]].contains(&"run".to_string()));
    }
}

#[tokio::test]
async fn cancelled_deploy_releases_its_reservation() {
    let ctx = setup().await;
    ctx.state
        .deploy_service
        .deploy("42", SITE, Some(512))
        .await
        .unwrap();
    ctx.grant_credits("42", 100).await;
    ctx.runtime.delay_clones(Duration::from_secs(60));

    let deploy = ctx.state.deploy_service.clone();
    let task = tokio::spawn(async move { deploy.deploy("42", API, Some(100)).await });

    // Wait until the request is admitted and its clone is running
    let state = &ctx.state;
    wait_for(move || async move {
        state.admission_service.balance("42").await.unwrap().reserved_credits == 100
    })
    .await;

    task.abort();
    assert!(task.await.unwrap_err().is_cancelled());

    wait_for(move || async move {
        matches!(
            state.registry_service.get("42", "api").await,
            Ok(app) if app.status == ApplicationStatus::Failed
        )
    })
    .await;

    let balance = ctx.state.admission_service.balance("42").await.unwrap();
    assert_eq!(balance.reserved_credits, 0);
    assert_eq!(balance.credits, 100);
}

#[tokio::test]
async fn cancelled_launch_terminates_spawned_process() {
    let ctx = setup().await;
    ctx.runtime.delay_spawns(Duration::from_secs(60));

    let deploy = ctx.state.deploy_service.clone();
    let task = tokio::spawn(async move { deploy.deploy("42", SCRIPT, Some(128)).await });

    // The child exists but the launch has not been confirmed yet
    let runtime = &ctx.runtime;
    wait_for(move || async move { !runtime.live_processes().is_empty() }).await;
    let pid = *ctx.runtime.live_processes().iter().next().unwrap();

    task.abort();
    assert!(task.await.unwrap_err().is_cancelled());

    wait_for(move || async move { runtime.live_processes().is_empty() }).await;
    assert!(ctx.runtime.calls().contains(&format!("kill {pid}")));

    let state = &ctx.state;
    wait_for(move || async move {
        matches!(
            state.registry_service.get("42", "script").await,
            Ok(app) if app.status == ApplicationStatus::Failed
        )
    })
    .await;
}

#[tokio::test]
async fn launch_timeout_terminates_spawned_process() {
    let ctx = setup_with(|config| config.deploy.timeouts.launch_secs = 1).await;
    ctx.runtime.delay_spawns(Duration::from_secs(30));

    let err = ctx
        .state
        .deploy_service
        .deploy("42", SCRIPT, Some(128))
        .await
        .unwrap_err();

    match err {
        ApiError::Deploy(DeployError::LaunchFailed(output)) => {
            assert!(output.contains("timed out"), "{output}")
        }
        other => panic!("unexpected error {other:?}"),
    }
    assert!(ctx.runtime.live_processes().is_empty());
    assert_eq!(ctx.runtime.verbs().last().unwrap(), "kill");
    assert_eq!(ctx.credits("42").await, 0);
}

#[tokio::test]
async fn interrupted_deploys_are_failed_on_startup() {
    let ctx = setup().await;
    ctx.state
        .ledger_service
        .get_or_create_user("42")
        .await
        .unwrap();

    let txn = ctx.db.begin().await.unwrap();
    ctx.state
        .registry_service
        .register_pending_in_txn(
            NewApplication {
                owner_id: "42".to_string(),
                name: "site".to_string(),
                repository_url: SITE.to_string(),
                memory_mb: 256,
                runtime_name: "dh_42_site_deadbeef".to_string(),
                workspace_path: ctx.root.path().join("apps/42/site"),
                credit_deficit: 50,
            },
            &txn,
        )
        .await
        .unwrap();
    txn.commit().await.unwrap();

    assert_eq!(
        ctx.state
            .admission_service
            .balance("42")
            .await
            .unwrap()
            .reserved_credits,
        50
    );

    assert_eq!(
        ctx.state.registry_service.reconcile_interrupted().await.unwrap(),
        1
    );

    let app = ctx.state.registry_service.get("42", "site").await.unwrap();
    assert_eq!(app.status, ApplicationStatus::Failed);
    let balance = ctx.state.admission_service.balance("42").await.unwrap();
    assert_eq!(balance.reserved_credits, 0);
    assert_eq!(balance.used_mb, 0);
}

async fn wait_for<F, Fut>(mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..200 {
        if condition().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}
