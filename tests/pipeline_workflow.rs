//! Pipeline, report and repair loop behavior against a scripted engine.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;

use dockhand::pipeline::{generate_report, BuildResult, LogsResult, RunResult, StageOutcomes};
use dockhand::{
    BuildSpec, ContainerEngine, EngineOutput, LoopStatus, Pipeline, PipelineOptions, RepairLoop,
    RepairOperation, RepairOutcome, RepairRequest, ReportStatus, Result, RunSpec, Stage,
    ValidationRequest,
};

/// Engine that replays fixed outputs and counts every call.
#[derive(Default)]
struct ScriptedEngine {
    build_fails_with: Option<String>,
    run_fails_with: Option<String>,
    logs: String,
    log_delay: Duration,
    builds: AtomicU32,
    runs: AtomicU32,
    log_reads: AtomicU32,
    last_build: Mutex<Option<BuildSpec>>,
}

#[async_trait]
impl ContainerEngine for ScriptedEngine {
    async fn build(&self, spec: &BuildSpec) -> Result<EngineOutput> {
        self.builds.fetch_add(1, Ordering::SeqCst);
        *self.last_build.lock().unwrap() = Some(spec.clone());
        Ok(match &self.build_fails_with {
            Some(error) => EngineOutput::failed(error.clone()),
            None => EngineOutput::ok("naming to docker.io/library/worker done\n"),
        })
    }

    async fn run(&self, _spec: &RunSpec) -> Result<EngineOutput> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        Ok(match &self.run_fails_with {
            Some(error) => EngineOutput::failed(error.clone()),
            None => EngineOutput::ok("4f9d2c1e8a7b\n"),
        })
    }

    async fn logs(&self, _container_id: &str, _tail: usize) -> Result<EngineOutput> {
        self.log_reads.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.log_delay).await;
        Ok(EngineOutput::ok(self.logs.clone()))
    }

    fn name(&self) -> &str {
        "scripted"
    }
}

struct CountingRepair {
    calls: AtomicU32,
}

#[async_trait]
impl RepairOperation for CountingRepair {
    async fn repair(&self, _request: &RepairRequest) -> Result<RepairOutcome> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(RepairOutcome {
            applied_fixes: vec![dockhand::AppliedFix::new("Dockerfile", "tried something")],
            needs_revalidation: true,
        })
    }

    fn name(&self) -> &str {
        "counting"
    }
}

fn options() -> PipelineOptions {
    PipelineOptions {
        settle_delay: Duration::ZERO,
        ..Default::default()
    }
}

fn repo_with_dockerfile() -> TempDir {
    let temp = TempDir::new().unwrap();
    std::fs::write(temp.path().join("Dockerfile"), "FROM python:3.11-slim\nCMD [\"python\", \"-u\", \"handler.py\"]\n").unwrap();
    temp
}

#[tokio::test]
async fn missing_dockerfile_fails_build_and_skips_later_stages() {
    let repo = TempDir::new().unwrap();
    std::fs::write(repo.path().join("README.md"), "# worker\n").unwrap();
    let pipeline = Pipeline::new(ScriptedEngine::default(), options());

    let report = pipeline.validate(&ValidationRequest::new(repo.path())).await;

    assert_eq!(report.status, ReportStatus::Failed);
    assert!(report.errors[&Stage::Build].contains("No Dockerfiles found"));
    assert!(report.stages.run.is_none());
    assert!(report.stages.logs.is_none());
    assert_eq!(pipeline.engine().builds.load(Ordering::SeqCst), 0);
    assert_eq!(pipeline.engine().runs.load(Ordering::SeqCst), 0);
    assert_eq!(pipeline.engine().log_reads.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn empty_logs_still_pass() {
    let repo = repo_with_dockerfile();
    let pipeline = Pipeline::new(ScriptedEngine::default(), options());

    let report = pipeline.validate(&ValidationRequest::new(repo.path())).await;

    assert_eq!(report.status, ReportStatus::Passed);
    assert!(report.errors.is_empty());
    let logs = report.stages.logs.as_ref().unwrap();
    assert!(logs.success);
    assert_eq!(logs.line_count, 0);
    assert!(report.stages.all_steps_completed());
}

#[tokio::test]
async fn build_uses_dockerfile_directory_and_platform() {
    let repo = TempDir::new().unwrap();
    std::fs::create_dir_all(repo.path().join("docker")).unwrap();
    std::fs::write(repo.path().join("docker/Dockerfile"), "FROM alpine\n").unwrap();
    let pipeline = Pipeline::new(ScriptedEngine::default(), options());

    let request = ValidationRequest::new(repo.path())
        .with_image_name("worker-test")
        .with_platform("linux/arm64");
    pipeline.validate(&request).await;

    let spec = pipeline.engine().last_build.lock().unwrap().clone().unwrap();
    assert_eq!(spec.context, repo.path().join("docker"));
    assert_eq!(spec.image_name, "worker-test");
    assert_eq!(spec.platform, "linux/arm64");
}

#[test]
fn completion_does_not_depend_on_log_content() {
    let stages = StageOutcomes {
        repo_path: Some(PathBuf::from("/repos/worker-basic")),
        dockerfile: Some(PathBuf::from("/repos/worker-basic/Dockerfile")),
        build: Some(BuildResult::ok("worker-basic-1700000000000")),
        run: Some(RunResult {
            success: true,
            container_id: Some("4f9d2c1e8a7b".to_string()),
            ..Default::default()
        }),
        logs: Some(LogsResult::ok(String::new())),
    };

    assert!(stages.all_steps_completed());
    assert_eq!(generate_report("worker-basic", stages).status, ReportStatus::Passed);
}

#[tokio::test]
async fn long_build_error_is_truncated_to_last_eight_lines() {
    let repo = repo_with_dockerfile();
    let error: String = (1..=20).map(|i| format!("#{} step output\n", i)).collect();
    let engine = ScriptedEngine {
        build_fails_with: Some(error),
        ..Default::default()
    };
    let pipeline = Pipeline::new(engine, options());

    let report = pipeline.validate(&ValidationRequest::new(repo.path())).await;

    let excerpt = &report.errors[&Stage::Build];
    let lines: Vec<&str> = excerpt.lines().collect();
    assert_eq!(lines.len(), 8);
    assert_eq!(lines[0], "#13 step output");
    assert_eq!(lines[7], "#20 step output");
}

#[tokio::test]
async fn slow_log_read_fails_the_logs_stage() {
    let repo = repo_with_dockerfile();
    let engine = ScriptedEngine {
        log_delay: Duration::from_secs(5),
        ..Default::default()
    };
    let pipeline = Pipeline::new(
        engine,
        PipelineOptions {
            log_timeout: Duration::from_millis(50),
            ..options()
        },
    );

    let report = pipeline.validate(&ValidationRequest::new(repo.path())).await;

    assert_eq!(report.status, ReportStatus::Failed);
    assert_eq!(report.errors.keys().collect::<Vec<_>>(), vec![&Stage::Logs]);
    assert!(report.errors[&Stage::Logs].contains("timed out"));
    let logs = report.stages.logs.as_ref().unwrap();
    assert!(!logs.success);
    assert!(logs.logs.is_none());
}

#[tokio::test]
async fn run_failure_stops_before_logs() {
    let repo = repo_with_dockerfile();
    let engine = ScriptedEngine {
        run_fails_with: Some("Error response from daemon: port is already allocated".to_string()),
        ..Default::default()
    };
    let pipeline = Pipeline::new(engine, options());

    let report = pipeline.validate(&ValidationRequest::new(repo.path())).await;

    assert_eq!(report.status, ReportStatus::Failed);
    assert_eq!(report.errors.keys().collect::<Vec<_>>(), vec![&Stage::Run]);
    assert!(report.errors[&Stage::Run].contains("port is already allocated"));
    assert!(report.stages.build.as_ref().unwrap().success);
    assert!(report.stages.logs.is_none());
    assert_eq!(pipeline.engine().runs.load(Ordering::SeqCst), 1);
    assert_eq!(pipeline.engine().log_reads.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn failed_upstream_results_are_forwarded_without_engine_calls() {
    let pipeline = Pipeline::new(ScriptedEngine::default(), options());
    let build = BuildResult::failed("pull access denied for cuda-base");
    let ports = vec!["8080:80".to_string()];
    let env = BTreeMap::from([("MODE".to_string(), "test".to_string())]);

    let run = pipeline
        .run_container(&build, "worker-container", &ports, &env, Some("python handler.py"))
        .await;

    assert!(!run.success);
    assert!(run.container_id.is_none());
    assert_eq!(run.error.as_deref(), Some("pull access denied for cuda-base"));
    assert_eq!(run.ports, ports);
    assert_eq!(run.env, env);
    assert_eq!(run.command.as_deref(), Some("python handler.py"));

    let logs = pipeline.collect_logs(&run).await;

    assert!(!logs.success);
    assert_eq!(logs.error.as_deref(), Some("pull access denied for cuda-base"));
    assert_eq!(pipeline.engine().runs.load(Ordering::SeqCst), 0);
    assert_eq!(pipeline.engine().log_reads.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn repair_is_attempted_at_most_three_times() {
    let repo = repo_with_dockerfile();
    let engine = ScriptedEngine {
        build_fails_with: Some("ERROR: failed to solve".to_string()),
        ..Default::default()
    };
    let pipeline = Pipeline::new(engine, options());
    let repair = CountingRepair {
        calls: AtomicU32::new(0),
    };

    let result = RepairLoop::default()
        .validate_and_repair(&pipeline, &ValidationRequest::new(repo.path()), &repair, None)
        .await;

    assert_eq!(result.status, LoopStatus::Unfixable);
    assert_eq!(repair.calls.load(Ordering::SeqCst), 3);
    assert_eq!(result.attempts.len(), 3);
    // One initial validation plus one after each repair.
    assert_eq!(pipeline.engine().builds.load(Ordering::SeqCst), 4);
    assert_eq!(result.applied_fixes().len(), 3);
}

#[test]
fn validation_request_rejects_bad_ports() {
    use dockhand::Validate;

    let request = ValidationRequest::new(Path::new("/repos/worker")).with_port("eighty");

    assert!(!request.validate().is_valid());
    assert!(ValidationRequest::new("/repos/worker")
        .with_port("8080:80/tcp")
        .validate()
        .is_valid());
}

#[test]
fn pipeline_runs_under_a_plain_runtime() {
    let repo = repo_with_dockerfile();
    let pipeline = Pipeline::new(ScriptedEngine::default(), options());

    let report = tokio_test::block_on(pipeline.validate(&ValidationRequest::new(repo.path())));

    assert!(report.passed());
}
