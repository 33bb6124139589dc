//! Job ledger command handlers.

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Local};
use taskrelay_core::config::paths;
use taskrelay_core::job::{Job, JobKind, StepKind};
use taskrelay_core::store::JobStore;

fn open_store() -> Result<JobStore> {
    let path = paths::jobs_path();
    JobStore::open(&path).with_context(|| format!("open job ledger {}", path.display()))
}

fn format_time(time: i64) -> String {
    DateTime::from_timestamp(time, 0).map_or_else(
        || time.to_string(),
        |dt| dt.with_timezone(&Local).format("%Y-%m-%d %H:%M").to_string(),
    )
}

fn format_duration(ms: u64) -> String {
    if ms < 1000 {
        format!("{ms}ms")
    } else {
        format!("{:.1}s", ms as f64 / 1000.0)
    }
}

pub fn list(kind: Option<JobKind>) -> Result<()> {
    let store = open_store()?;
    let jobs = match kind {
        Some(kind) => store.list_by_kind(kind),
        None => store.list_all(),
    };
    if jobs.is_empty() {
        println!("No jobs found.");
        return Ok(());
    }
    for job in jobs {
        println!(
            "{}  {:<9}  {:<11}  {}  {}",
            format_time(job.time),
            job.status.as_str(),
            job.kind.as_str(),
            job.id,
            job.label()
        );
    }
    Ok(())
}

pub fn show(id: &str) -> Result<()> {
    let store = open_store()?;
    let Some(job) = store.get(id) else {
        bail!("Job '{id}' not found");
    };
    print!("{}", render_job(job));
    Ok(())
}

fn render_job(job: &Job) -> String {
    let mut out = String::new();
    let mut field = |name: &str, value: &str| {
        out.push_str(&format!("{:<10}{value}\n", format!("{name}:")));
    };

    field("ID", &job.id);
    field("Time", &format!("{} ({})", format_time(job.time), job.time));
    field("Kind", job.kind.as_str());
    field("Status", job.status.as_str());
    if let Some(title) = &job.title {
        field("Title", title);
    }
    field("Prompt", &job.prompt);
    if let Some(cost) = job.cost_usd {
        field("Cost", &format!("${cost:.4}"));
    }
    if let Some(ms) = job.duration_ms {
        field("Duration", &format_duration(ms));
    }
    if let Some(error) = &job.error {
        field("Error", error);
    }
    if let Some(result) = &job.result {
        out.push_str("\nResult:\n");
        out.push_str(result.trim_end());
        out.push('\n');
    }
    if let Some(steps) = job.steps.as_deref().filter(|s| !s.is_empty()) {
        out.push_str("\nSteps:\n");
        for (n, step) in steps.iter().enumerate() {
            let tag = match step.kind {
                StepKind::Text => "text",
                StepKind::ToolUse => "tool",
            };
            out.push_str(&format!("{:>3}. [{tag}] {}\n", n + 1, step.content));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use taskrelay_core::job::{JobStatus, Step};

    use super::*;

    #[test]
    fn test_render_auto_job_includes_result_and_steps() {
        let mut job = Job::new("a1", 1_700_000_000, "Summarize README.md", JobKind::Auto);
        job.transition(JobStatus::Running).unwrap();
        job.transition(JobStatus::Completed).unwrap();
        job.result = Some("A short summary.".to_string());
        job.cost_usd = Some(0.0123);
        job.duration_ms = Some(5120);
        job.steps = Some(vec![
            Step::text("Reading the file."),
            Step::tool_use(r#"Read(file_path="README.md")"#),
        ]);

        let out = render_job(&job);
        assert!(out.contains("ID:       a1\n"));
        assert!(out.contains("Status:   completed\n"));
        assert!(out.contains("Cost:     $0.0123\n"));
        assert!(out.contains("Duration: 5.1s\n"));
        assert!(out.contains("\nResult:\nA short summary.\n"));
        assert!(out.contains("  1. [text] Reading the file.\n"));
        assert!(out.contains("  2. [tool] Read(file_path=\"README.md\")\n"));
    }

    #[test]
    fn test_render_interactive_job_has_no_steps_section() {
        let job = Job::new("i1", 1, "Fix the auth bug", JobKind::Interactive);
        let out = render_job(&job);
        assert!(out.contains("Kind:     interactive\n"));
        assert!(!out.contains("Steps:"));
        assert!(!out.contains("Result:"));
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(250), "250ms");
        assert_eq!(format_duration(1500), "1.5s");
    }
}
