//! Process isolation tests using `sh` as the child program.

#![cfg(unix)]

use std::time::Duration;

use herald_supervisor::{
    ChildCommand, JobRequest, ProcessSupervisor, ShutdownConfig, ShutdownReport, SupervisorError,
    TaskSupervisor,
};

/// Runs `script` under `sh -c`; the appended job arguments become `$1..`.
fn shell(script: &str) -> ChildCommand {
    ChildCommand::new("sh").arg("-c").arg(script).arg("herald-child")
}

fn request(name: &str) -> JobRequest {
    JobRequest { name: name.to_string(), payload: serde_json::json!({ "mailing_id": 1 }) }
}

fn config() -> ShutdownConfig {
    ShutdownConfig { timeout: Duration::from_millis(500), kill_timeout: Duration::from_millis(500) }
}

async fn wait_until_idle(supervisor: &ProcessSupervisor) {
    for _ in 0..200 {
        if supervisor.active() == 0 {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("children still tracked: {}", supervisor.active());
}

#[tokio::test]
async fn exited_children_are_untracked() {
    let ok = ProcessSupervisor::new(shell("exit 0"), config());
    ok.submit(request("noop")).unwrap();
    wait_until_idle(&ok).await;

    let failing = ProcessSupervisor::new(shell("exit 3"), config());
    failing.submit(request("noop")).unwrap();
    wait_until_idle(&failing).await;
}

#[tokio::test]
async fn child_receives_job_arguments() {
    let dir = std::env::temp_dir().join(format!("herald-args-{}", std::process::id()));
    let out = dir.with_extension("txt");
    let script = format!("echo \"$@\" > {}", out.display());

    let supervisor = ProcessSupervisor::new(shell(&script), config());
    supervisor.submit(request("dispatch_mailing")).unwrap();
    wait_until_idle(&supervisor).await;

    let written = std::fs::read_to_string(&out).unwrap();
    let _ = std::fs::remove_file(&out);
    assert_eq!(written.trim(), r#"--name dispatch_mailing --payload {"mailing_id":1}"#);
}

#[tokio::test]
async fn shutdown_kills_only_children_ignoring_sigterm() {
    let cooperative = ProcessSupervisor::new(shell("exec sleep 30"), config());
    let stubborn =
        ProcessSupervisor::new(shell("trap '' TERM; while true; do sleep 0.05; done"), config());

    cooperative.submit(request("a")).unwrap();
    cooperative.submit(request("b")).unwrap();
    stubborn.submit(request("c")).unwrap();

    // Give the shells time to install their traps.
    tokio::time::sleep(Duration::from_millis(200)).await;

    let started = tokio::time::Instant::now();
    let (polite, forced) =
        tokio::join!(cooperative.shutdown(config().timeout), stubborn.shutdown(config().timeout));
    let elapsed = started.elapsed();

    assert_eq!(polite, ShutdownReport { terminated: 2, killed: 0, unconfirmed: 0 });
    assert_eq!(forced, ShutdownReport { terminated: 0, killed: 1, unconfirmed: 0 });
    assert!(elapsed < config().timeout + config().kill_timeout + Duration::from_millis(500));
    assert_eq!(cooperative.active() + stubborn.active(), 0);
}

#[tokio::test]
async fn submit_after_shutdown_is_refused() {
    let supervisor = ProcessSupervisor::new(shell("exec sleep 30"), config());
    supervisor.submit(request("a")).unwrap();

    let first = supervisor.shutdown(config().timeout).await;
    assert_eq!(first.total(), 1);

    let second = supervisor.shutdown(config().timeout).await;
    assert_eq!(second, ShutdownReport::default());

    assert!(matches!(supervisor.submit(request("b")), Err(SupervisorError::ShuttingDown)));
}

#[tokio::test]
async fn missing_program_fails_at_submit() {
    let supervisor =
        ProcessSupervisor::new(ChildCommand::new("/nonexistent/herald-child"), config());
    assert!(matches!(supervisor.submit(request("a")), Err(SupervisorError::Spawn(_))));
    assert_eq!(supervisor.active(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn shutdown_accounts_for_children_spawned_while_it_runs() {
    let supervisor = ProcessSupervisor::new(shell("exec sleep 30"), config());

    let submitter = {
        let supervisor = supervisor.clone();
        tokio::task::spawn_blocking(move || {
            let mut accepted = 0;
            for n in 0..50 {
                match supervisor.submit(request(&format!("job-{n}"))) {
                    Ok(_) => accepted += 1,
                    Err(SupervisorError::ShuttingDown) => {},
                    Err(other) => panic!("unexpected submit error: {other}"),
                }
            }
            accepted
        })
    };

    tokio::time::sleep(Duration::from_millis(20)).await;
    let report = supervisor.shutdown(Duration::from_millis(200)).await;
    let accepted = submitter.await.unwrap();

    assert_eq!(report.total(), accepted, "accepted children missing from the report");
    assert_eq!(supervisor.active(), 0);
    assert!(matches!(supervisor.submit(request("late")), Err(SupervisorError::ShuttingDown)));
}
