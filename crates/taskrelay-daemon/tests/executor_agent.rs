//! Auto jobs against shell scripts standing in for the agent binary.
#![cfg(unix)]

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use taskrelay_core::job::{Job, JobKind, JobStatus, Step};
use taskrelay_core::store::{JobStore, StoreHandle, spawn_store_task};
use taskrelay_daemon::executor::{AgentSettings, Executor, PermissionMode};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

fn write_agent(dir: &Path, body: &str) -> PathBuf {
    let path = dir.join("agent.sh");
    fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
    path
}

fn settings(agent: &Path, timeout: Duration) -> AgentSettings {
    AgentSettings {
        agent_bin: agent.to_string_lossy().to_string(),
        max_turns: 10,
        permissions: PermissionMode::AllowList(vec!["Read".to_string(), "Grep".to_string()]),
        timeout,
    }
}

fn store_in(dir: &Path) -> StoreHandle {
    let store = JobStore::open(dir.join("jobs.jsonl")).unwrap();
    spawn_store_task(store).0
}

async fn submit_new(store: &StoreHandle, executor: &Executor, id: &str, prompt: &str) {
    let job = Job::new(id, 1, prompt, JobKind::Auto);
    assert!(store.insert_if_absent(job.clone()).await.unwrap());
    executor.submit(job);
}

async fn wait_for_status(store: &StoreHandle, id: &str, status: JobStatus) {
    for _ in 0..200 {
        if store.get(id).await.unwrap().map(|j| j.status) == Some(status) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("job {id} never reached {status}");
}

#[tokio::test]
async fn test_successful_run_records_steps_and_cost() {
    let dir = TempDir::new().unwrap();
    let args_file = dir.path().join("args.txt");
    let agent = write_agent(
        dir.path(),
        &format!(
            r#"printf '%s\n' "$@" > '{}'
cat <<'EOF'
{{"type":"system","subtype":"init"}}
{{"type":"assistant","message":{{"content":[{{"type":"text","text":"Reading the file."}},{{"type":"tool_use","name":"Read","input":{{"file_path":"README.md"}}}}]}}}}
{{"type":"result","subtype":"success","is_error":false,"result":"README describes taskrelay.","total_cost_usd":0.02,"duration_ms":1500}}
EOF"#,
            args_file.display()
        ),
    );
    let store = store_in(dir.path());
    let executor = Executor::new(
        settings(&agent, Duration::from_secs(30)),
        store.clone(),
        None,
        CancellationToken::new(),
    );

    submit_new(&store, &executor, "ok", "Summarize README.md").await;
    executor.shutdown().await;

    let job = store.get("ok").await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.result.as_deref(), Some("README describes taskrelay."));
    assert_eq!(job.cost_usd, Some(0.02));
    assert_eq!(job.duration_ms, Some(1500));
    assert_eq!(
        job.steps,
        Some(vec![
            Step::text("Reading the file."),
            Step::tool_use(r#"Read(file_path="README.md")"#),
        ])
    );

    let args: Vec<String> = fs::read_to_string(&args_file)
        .unwrap()
        .lines()
        .map(str::to_string)
        .collect();
    assert_eq!(
        args,
        vec![
            "-p",
            "Summarize README.md",
            "--output-format",
            "stream-json",
            "--verbose",
            "--max-turns",
            "10",
            "--permission-mode",
            "acceptEdits",
            "--allowedTools",
            "Read,Grep",
        ]
    );
}

#[tokio::test]
async fn test_agent_reported_error_fails_job() {
    let dir = TempDir::new().unwrap();
    let agent = write_agent(
        dir.path(),
        r#"echo '{"type":"result","is_error":true,"result":"boom"}'"#,
    );
    let store = store_in(dir.path());
    let executor = Executor::new(
        settings(&agent, Duration::from_secs(30)),
        store.clone(),
        None,
        CancellationToken::new(),
    );

    submit_new(&store, &executor, "err", "explode").await;
    executor.shutdown().await;

    let job = store.get("err").await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.error.as_deref(), Some("boom"));
    assert!(job.result.is_none());
}

#[tokio::test]
async fn test_nonzero_exit_uses_stderr() {
    let dir = TempDir::new().unwrap();
    let agent = write_agent(dir.path(), "echo 'credit balance too low' >&2\nexit 3");
    let store = store_in(dir.path());
    let executor = Executor::new(
        settings(&agent, Duration::from_secs(30)),
        store.clone(),
        None,
        CancellationToken::new(),
    );

    submit_new(&store, &executor, "exit", "anything").await;
    executor.shutdown().await;

    let job = store.get("exit").await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.error.as_deref(), Some("credit balance too low"));
    assert_eq!(job.steps, Some(Vec::new()));
}

#[tokio::test]
async fn test_timeout_kills_agent_and_fails_job() {
    let dir = TempDir::new().unwrap();
    let pid_file = dir.path().join("agent.pid");
    let agent = write_agent(
        dir.path(),
        &format!(
            r#"echo '{{"type":"assistant","message":{{"content":[{{"type":"text","text":"Working"}}]}}}}'
echo $$ > '{}'
exec sleep 30"#,
            pid_file.display()
        ),
    );
    let store = store_in(dir.path());
    let executor = Executor::new(
        settings(&agent, Duration::from_secs(1)),
        store.clone(),
        None,
        CancellationToken::new(),
    );

    submit_new(&store, &executor, "slow", "take forever").await;
    executor.shutdown().await;

    let job = store.get("slow").await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.error.as_deref(), Some("timed out after 1 seconds"));
    assert_eq!(job.steps, Some(vec![Step::text("Working")]));

    #[cfg(target_os = "linux")]
    {
        let pid = fs::read_to_string(&pid_file).unwrap();
        assert!(
            !Path::new("/proc").join(pid.trim()).exists(),
            "agent process {} still alive",
            pid.trim()
        );
    }
}

#[tokio::test]
async fn test_missing_binary_fails_job() {
    let dir = TempDir::new().unwrap();
    let store = store_in(dir.path());
    let executor = Executor::new(
        settings(&dir.path().join("nope"), Duration::from_secs(5)),
        store.clone(),
        None,
        CancellationToken::new(),
    );

    submit_new(&store, &executor, "missing", "anything").await;
    executor.shutdown().await;

    let job = store.get("missing").await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert!(job.error.unwrap().starts_with("Failed to spawn agent"));
    assert!(job.steps.is_none());
}

#[tokio::test]
async fn test_bounded_pool_keeps_waiting_job_pending_on_cancel() {
    let dir = TempDir::new().unwrap();
    let gate = dir.path().join("gate");
    let agent = write_agent(
        dir.path(),
        &format!(
            r#"while [ ! -f '{}' ]; do sleep 0.05; done
echo finished"#,
            gate.display()
        ),
    );
    let store = store_in(dir.path());
    let cancel = CancellationToken::new();
    let executor = Executor::new(
        settings(&agent, Duration::from_secs(30)),
        store.clone(),
        Some(1),
        cancel.clone(),
    );

    submit_new(&store, &executor, "first", "one").await;
    wait_for_status(&store, "first", JobStatus::Running).await;
    submit_new(&store, &executor, "second", "two").await;
    assert_eq!(executor.in_flight(), 2);

    tokio::time::sleep(Duration::from_millis(200)).await;
    let second = store.get("second").await.unwrap().unwrap();
    assert_eq!(second.status, JobStatus::Pending);

    cancel.cancel();
    fs::write(&gate, "").unwrap();
    executor.shutdown().await;

    let first = store.get("first").await.unwrap().unwrap();
    assert_eq!(first.status, JobStatus::Completed);
    assert_eq!(first.result.as_deref(), Some("finished"));

    let second = store.get("second").await.unwrap().unwrap();
    assert_eq!(second.status, JobStatus::Pending);
}
