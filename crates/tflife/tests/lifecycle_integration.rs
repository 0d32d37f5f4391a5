//! End-to-end lifecycle tests against a fake provisioning CLI.
//!
//! The fake is a POSIX shell script that logs each call to a state
//! directory and misbehaves on request through `FAKE_*` environment
//! variables.

#![cfg(unix)]

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use tflife::classifier::ErrorClassifier;
use tflife::invoker::{Invoker, InvokerSettings};
use tflife::isolation::{IsolationError, IsolationRegistry, IsolationSettings};
use tflife::lifecycle::{Assertion, LifecycleRunner, ProvisionError, RunMode};
use tflife::retry::{RetryPolicy, RetrySettings};
use tflife::{expect_contains_key, expect_non_empty, Harness, HarnessError};
use tflife_core::{Config, IsolationMode, OutputSource, Phase, PhaseOutcome, RunConfig, RunStatus};
use tokio_util::sync::CancellationToken;

const FAKE_TOOL: &str = r#"#!/bin/sh
cmd="$1"
state="$FAKE_STATE_DIR"
echo "$*" >> "$state/calls.log"

count_file="$state/$cmd.count"
n=$(( $(cat "$count_file" 2>/dev/null || echo 0) + 1 ))
echo "$n" > "$count_file"

eval "flaky=\${FAKE_FLAKY_$cmd:-0}"
if [ "$n" -le "$flaky" ]; then
    echo "Error: POST https://api.example.test/v1/files: 429 Too Many Requests" >&2
    exit 1
fi

eval "fail=\${FAKE_FAIL_$cmd:-}"
if [ -n "$fail" ]; then
    echo "Error: $fail" >&2
    exit 1
fi

case "$cmd" in
    init)
        echo "Terraform has been successfully initialized!"
        ;;
    plan)
        for arg in "$@"; do
            case "$arg" in
                -out=*) echo "plan" > "${arg#-out=}" ;;
            esac
        done
        echo "Plan: 1 to add, 0 to change, 0 to destroy."
        exit "${FAKE_PLAN_EXIT:-0}"
        ;;
    apply)
        echo "provisioned" > "$state/resource"
        if [ -n "$FAKE_APPLY_SLEEP" ]; then
            exec sleep "$FAKE_APPLY_SLEEP"
        fi
        if [ -n "$FAKE_APPLY_JSON" ]; then
            printf '%s\n' "$FAKE_APPLY_JSON"
        else
            echo "Apply complete! Resources: 1 added, 0 changed, 0 destroyed."
        fi
        ;;
    output)
        if [ -n "$FAKE_OUTPUT" ]; then
            printf '%s\n' "$FAKE_OUTPUT"
        else
            cat <<'JSON'
{"file": {"sensitive": false, "type": ["object", {"test_snippet": "string"}], "value": {"test_snippet": "abc"}}}
JSON
        fi
        ;;
    validate)
        echo "Success! The configuration is valid."
        ;;
    destroy)
        rm -f "$state/resource"
        echo "Destroy complete! Resources: 1 destroyed."
        ;;
esac
exit 0
"#;

/// Scratch layout for one test: the fake tool, its state, and a config dir.
struct Fixture {
    _root: TempDir,
    tool: PathBuf,
    state: PathBuf,
    config_dir: PathBuf,
    work_root: PathBuf,
}

impl Fixture {
    fn new() -> Self {
        let root = TempDir::new().unwrap();
        let tool = root.path().join("terraform");
        std::fs::write(&tool, FAKE_TOOL).unwrap();
        {
            use std::os::unix::fs::PermissionsExt;
            let mut perms = std::fs::metadata(&tool).unwrap().permissions();
            perms.set_mode(0o755);
            std::fs::set_permissions(&tool, perms).unwrap();
        }

        let state = root.path().join("state");
        let config_dir = root.path().join("local-file");
        let work_root = root.path().join("work");
        std::fs::create_dir_all(&state).unwrap();
        std::fs::create_dir_all(&config_dir).unwrap();
        std::fs::write(config_dir.join("main.tf"), "# fake configuration\n").unwrap();

        Self {
            _root: root,
            tool,
            state,
            config_dir,
            work_root,
        }
    }

    fn runner(&self) -> LifecycleRunner {
        let invoker = Invoker::new(InvokerSettings {
            tool_bin: self.tool.clone(),
            timeout: Some(Duration::from_secs(30)),
        });
        let retry = RetryPolicy::new(RetrySettings {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
        });
        LifecycleRunner::new(invoker, retry, ErrorClassifier::with_default_retryable_errors())
    }

    fn registry(&self, mode: IsolationMode) -> Arc<IsolationRegistry> {
        IsolationRegistry::new(IsolationSettings {
            mode,
            acquire_timeout: Some(Duration::from_secs(30)),
            work_root: self.work_root.clone(),
        })
    }

    fn harness(&self) -> Harness {
        Harness::new(self.runner(), self.registry(IsolationMode::Block))
    }

    fn run_config(&self) -> RunConfig {
        RunConfig::new(&self.config_dir)
            .with_var("content", "hello")
            .with_env("FAKE_STATE_DIR", self.state.display().to_string())
    }

    /// Subcommands the fake tool saw, in order.
    fn calls(&self) -> Vec<String> {
        std::fs::read_to_string(self.state.join("calls.log"))
            .unwrap_or_default()
            .lines()
            .filter_map(|line| line.split_whitespace().next().map(str::to_string))
            .collect()
    }

    fn call_lines(&self) -> Vec<String> {
        std::fs::read_to_string(self.state.join("calls.log"))
            .unwrap_or_default()
            .lines()
            .map(str::to_string)
            .collect()
    }

    fn resource_exists(&self) -> bool {
        self.state.join("resource").exists()
    }
}

fn file_assertions() -> Vec<Assertion> {
    vec![
        expect_non_empty("file"),
        expect_contains_key("file", "test_snippet"),
    ]
}

#[tokio::test]
async fn apply_success_captures_output_and_tears_down() {
    let fx = Fixture::new();
    let report = fx
        .harness()
        .run_lifecycle(fx.run_config(), &file_assertions())
        .await
        .unwrap();

    assert_eq!(report.status(), RunStatus::Passed);
    assert_eq!(report.status().exit_code(), 0);
    assert_eq!(fx.calls(), vec!["init", "apply", "output", "destroy"]);
    assert_eq!(report.teardown_entries, 1);
    assert!(!fx.resource_exists());

    let output = report.output.as_ref().unwrap();
    assert!(output.has("file"));
    assert_eq!(output.get("file").unwrap()["test_snippet"], "abc");

    let apply_line = fx
        .call_lines()
        .into_iter()
        .find(|line| line.starts_with("apply"))
        .unwrap();
    assert!(apply_line.contains("-auto-approve"));
    assert!(apply_line.contains("-var content=hello"));
    assert!(apply_line.contains("-no-color"));

    let output = report.into_result().unwrap().unwrap();
    assert!(output.has("file"));
}

#[tokio::test]
async fn rate_limited_apply_succeeds_on_second_attempt() {
    let fx = Fixture::new();
    let config = fx.run_config().with_env("FAKE_FLAKY_apply", "1");
    let report = fx.harness().run_lifecycle(config, &[]).await.unwrap();

    assert_eq!(report.status(), RunStatus::Passed);
    assert!(matches!(
        report.phase_outcome(Phase::Apply),
        Some(PhaseOutcome::Success { attempts: 2, .. })
    ));
    assert_eq!(fx.calls(), vec!["init", "apply", "apply", "output", "destroy"]);
}

#[tokio::test]
async fn fatal_apply_still_destroys() {
    let fx = Fixture::new();
    let config = fx
        .run_config()
        .with_env("FAKE_FAIL_apply", "Invalid resource type \"local_fil\"");
    let report = fx
        .harness()
        .run_lifecycle(config, &file_assertions())
        .await
        .unwrap();

    assert_eq!(report.status(), RunStatus::ProvisioningFailed);
    assert_eq!(fx.calls(), vec!["init", "apply", "destroy"]);
    assert!(!fx.resource_exists());
    assert!(report.output.is_none());
    match report.first_error() {
        Some(ProvisionError::Fatal {
            phase, attempts, ..
        }) => {
            assert_eq!(*phase, Phase::Apply);
            assert_eq!(*attempts, 1);
        }
        other => panic!("expected fatal apply error, got {other:?}"),
    }

    let failure = report.into_result().unwrap_err();
    assert_eq!(failure.status.exit_code(), 1);
    assert!(failure.to_string().contains("local_fil"));
}

#[tokio::test]
async fn fatal_init_never_runs_destroy() {
    let fx = Fixture::new();
    let config = fx.run_config().with_env("FAKE_FAIL_init", "Unsupported block type");
    let report = fx.harness().run_lifecycle(config, &[]).await.unwrap();

    assert_eq!(report.status(), RunStatus::ProvisioningFailed);
    assert_eq!(fx.calls(), vec!["init"]);
    assert_eq!(report.records.len(), 1);
    assert_eq!(report.teardown_entries, 1);
    assert!(report.leak.is_none());
}

#[tokio::test]
async fn failed_assertion_still_destroys() {
    let fx = Fixture::new();
    let assertions = vec![expect_non_empty("file"), expect_non_empty("cloud_init")];
    let report = fx
        .harness()
        .run_lifecycle(fx.run_config(), &assertions)
        .await
        .unwrap();

    assert_eq!(report.status(), RunStatus::AssertionFailed);
    assert_eq!(report.status().exit_code(), 1);
    assert_eq!(fx.calls(), vec!["init", "apply", "output", "destroy"]);
    assert_eq!(report.errors.len(), 1);
    assert_eq!(report.assertion_failures().count(), 1);
    match report.first_error() {
        Some(ProvisionError::Assertion(failure)) => {
            assert_eq!(failure.key.as_deref(), Some("cloud_init"));
        }
        other => panic!("expected assertion failure, got {other:?}"),
    }
}

#[tokio::test]
async fn malformed_output_still_destroys() {
    let fx = Fixture::new();
    let config = fx.run_config().with_env("FAKE_OUTPUT", "Warning: not json");
    let report = fx.harness().run_lifecycle(config, &[]).await.unwrap();

    assert_eq!(report.status(), RunStatus::ProvisioningFailed);
    assert!(matches!(
        report.first_error(),
        Some(ProvisionError::MalformedOutput(_))
    ));
    assert_eq!(fx.calls(), vec!["init", "apply", "output", "destroy"]);
}

#[tokio::test]
async fn destroy_failure_is_reported_as_leak() {
    let fx = Fixture::new();
    let config = fx
        .run_config()
        .with_env("FAKE_FAIL_destroy", "deleting file: permission denied");
    let report = fx
        .harness()
        .run_lifecycle(config, &file_assertions())
        .await
        .unwrap();

    assert_eq!(report.status(), RunStatus::TeardownLeaked);
    assert_eq!(report.status().exit_code(), 3);
    let leak = report.leak.as_ref().unwrap();
    assert_eq!(leak.attempts, 1);
    assert_eq!(leak.exit_code, 1);
    assert!(leak.detail.contains("permission denied"));
    assert!(fx.resource_exists());

    let failure = report.into_result().unwrap_err();
    assert_eq!(failure.status, RunStatus::TeardownLeaked);
    assert!(failure.leak.is_some());
}

#[tokio::test]
async fn persistent_rate_limit_on_destroy_exhausts_retries() {
    let fx = Fixture::new();
    let config = fx.run_config().with_env("FAKE_FLAKY_destroy", "10");
    let report = fx.harness().run_lifecycle(config, &[]).await.unwrap();

    assert_eq!(report.status(), RunStatus::TeardownLeaked);
    assert_eq!(report.leak.as_ref().unwrap().attempts, 3);
    let destroys = fx.calls().iter().filter(|c| *c == "destroy").count();
    assert_eq!(destroys, 3);
}

#[tokio::test]
async fn leak_dominates_assertion_failure() {
    let fx = Fixture::new();
    let config = fx.run_config().with_env("FAKE_FAIL_destroy", "still in use");
    let assertions = vec![expect_non_empty("missing")];
    let report = fx.harness().run_lifecycle(config, &assertions).await.unwrap();

    assert_eq!(report.status(), RunStatus::TeardownLeaked);
    assert!(matches!(
        report.first_error(),
        Some(ProvisionError::Assertion(_))
    ));
}

#[tokio::test]
async fn apply_stdout_can_be_the_output_source() {
    let fx = Fixture::new();
    let runner = fx.runner().with_output_source(OutputSource::ApplyStdout);
    let harness = Harness::new(runner, fx.registry(IsolationMode::Block));
    let config = fx
        .run_config()
        .with_env("FAKE_APPLY_JSON", r#"{"file": {"test_snippet": "abc"}}"#);
    let report = harness
        .run_lifecycle(config, &file_assertions())
        .await
        .unwrap();

    assert_eq!(report.status(), RunStatus::Passed);
    assert_eq!(fx.calls(), vec!["init", "apply", "destroy"]);
}

#[tokio::test]
async fn lifecycle_with_plan_file_plans_first() {
    let fx = Fixture::new();
    let config = fx.run_config().with_plan_file("tfplan");
    let report = fx.harness().run_lifecycle(config, &[]).await.unwrap();

    assert_eq!(report.status(), RunStatus::Passed);
    assert_eq!(fx.calls(), vec!["init", "plan", "apply", "output", "destroy"]);
    assert!(fx.config_dir.join("tfplan").exists());
}

#[tokio::test]
async fn plan_only_returns_detailed_exit_code() {
    let fx = Fixture::new();
    let harness = fx.harness();

    let no_changes = harness.plan_only(fx.run_config()).await.unwrap();
    assert_eq!(no_changes, 0);

    let changes = harness
        .plan_only(fx.run_config().with_env("FAKE_PLAN_EXIT", "2"))
        .await
        .unwrap();
    assert_eq!(changes, 2);

    assert_eq!(fx.calls(), vec!["init", "plan", "init", "plan"]);
    assert!(!fx.resource_exists());
}

#[tokio::test]
async fn plan_only_persists_plan_file() {
    let fx = Fixture::new();
    let plan = fx.config_dir.join("out.tfplan");
    let code = fx
        .harness()
        .plan_only(fx.run_config().with_plan_file(&plan))
        .await
        .unwrap();
    assert_eq!(code, 0);
    assert!(plan.exists());
    let plan_line = fx
        .call_lines()
        .into_iter()
        .find(|line| line.starts_with("plan"))
        .unwrap();
    assert!(plan_line.contains("-detailed-exitcode"));
    assert!(plan_line.contains("-lock=false"));
}

#[tokio::test]
async fn plan_only_failure_is_an_error() {
    let fx = Fixture::new();
    let err = fx
        .harness()
        .plan_only(fx.run_config().with_env("FAKE_FAIL_plan", "Reference to undeclared input variable"))
        .await
        .unwrap_err();
    match err {
        HarnessError::Run(failure) => {
            assert_eq!(failure.status, RunStatus::ProvisioningFailed);
            assert!(matches!(
                failure.primary,
                Some(ProvisionError::Fatal {
                    phase: Phase::Plan,
                    ..
                })
            ));
        }
        other => panic!("expected run failure, got {other:?}"),
    }
}

#[tokio::test]
async fn validate_only_reports_pass_and_fail() {
    let fx = Fixture::new();
    let harness = fx.harness();

    assert!(harness.validate_only(fx.run_config()).await.unwrap());
    assert!(!harness
        .validate_only(fx.run_config().with_env("FAKE_FAIL_validate", "Missing required argument"))
        .await
        .unwrap());
    assert!(harness
        .validate_only(fx.run_config().with_env("FAKE_FAIL_init", "Failed to read module"))
        .await
        .is_err());

    assert_eq!(
        fx.calls(),
        vec!["init", "validate", "init", "validate", "init"]
    );
}

#[tokio::test]
async fn cancelled_run_still_tears_down() {
    let fx = Fixture::new();
    let harness = fx.harness();
    let config = fx.run_config().with_env("FAKE_APPLY_SLEEP", "30");
    let cancel_token = CancellationToken::new();

    let canceller = {
        let token = cancel_token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            token.cancel();
        })
    };

    let report = harness
        .run(config, RunMode::Lifecycle, &[], &cancel_token)
        .await
        .unwrap();
    canceller.await.unwrap();

    assert_eq!(report.status(), RunStatus::ProvisioningFailed);
    assert!(report.leak.is_none());
    assert_eq!(fx.calls(), vec!["init", "apply", "destroy"]);
    assert!(!fx.resource_exists());
    assert!(report
        .phase_outcome(Phase::Apply)
        .unwrap()
        .result()
        .cancelled());
}

#[tokio::test]
async fn cancel_during_retry_backoff_is_not_reported_as_exhausted() {
    let fx = Fixture::new();
    let runner = LifecycleRunner::new(
        Invoker::new(InvokerSettings {
            tool_bin: fx.tool.clone(),
            timeout: Some(Duration::from_secs(30)),
        }),
        RetryPolicy::new(RetrySettings {
            max_attempts: 5,
            base_delay: Duration::from_secs(60),
            max_delay: Duration::from_secs(60),
        }),
        ErrorClassifier::with_default_retryable_errors(),
    );
    let harness = Harness::new(runner, fx.registry(IsolationMode::Block));
    let config = fx.run_config().with_env("FAKE_FLAKY_apply", "10");
    let cancel_token = CancellationToken::new();

    let canceller = {
        let token = cancel_token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            token.cancel();
        })
    };

    let report = tokio::time::timeout(
        Duration::from_secs(20),
        harness.run(config, RunMode::Lifecycle, &[], &cancel_token),
    )
    .await
    .expect("backoff should end on cancel")
    .unwrap();
    canceller.await.unwrap();

    assert_eq!(report.status(), RunStatus::ProvisioningFailed);
    assert!(matches!(
        report.first_error(),
        Some(ProvisionError::CancelledDuringBackoff {
            phase: Phase::Apply,
            attempts: 1,
            ..
        })
    ));
    assert!(report.leak.is_none());
    assert_eq!(fx.calls(), vec!["init", "apply", "destroy"]);
}

#[tokio::test]
async fn deadline_expiry_starts_teardown() {
    let fx = Fixture::new();
    let runner = fx.runner().with_deadline(Some(Duration::from_millis(300)));
    let harness = Harness::new(runner, fx.registry(IsolationMode::Block));
    let config = fx.run_config().with_env("FAKE_APPLY_SLEEP", "30");

    let report = harness.run_lifecycle(config, &[]).await.unwrap();

    assert_eq!(report.status(), RunStatus::ProvisioningFailed);
    assert_eq!(fx.calls(), vec!["init", "apply", "destroy"]);
    assert!(!fx.resource_exists());
}

#[tokio::test]
async fn fail_fast_rejects_a_busy_directory() {
    let fx = Fixture::new();
    let harness = Harness::new(fx.runner(), fx.registry(IsolationMode::FailFast));

    let held = harness
        .start(fx.run_config(), &CancellationToken::new())
        .await
        .unwrap();
    let err = harness
        .run_lifecycle(fx.run_config(), &[])
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        HarnessError::Isolation(IsolationError::Conflict { .. })
    ));
    assert!(fx.calls().is_empty());
    drop(held);

    let report = harness.run_lifecycle(fx.run_config(), &[]).await.unwrap();
    assert_eq!(report.status(), RunStatus::Passed);
}

#[tokio::test]
async fn cancel_while_waiting_for_a_busy_directory() {
    let fx = Fixture::new();
    let registry = IsolationRegistry::new(IsolationSettings {
        mode: IsolationMode::Block,
        acquire_timeout: None,
        work_root: fx.work_root.clone(),
    });
    let harness = Harness::new(fx.runner(), registry);

    let held = harness
        .start(fx.run_config(), &CancellationToken::new())
        .await
        .unwrap();

    let cancel_token = CancellationToken::new();
    let canceller = {
        let token = cancel_token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            token.cancel();
        })
    };

    let err = tokio::time::timeout(
        Duration::from_secs(10),
        harness.run(fx.run_config(), RunMode::Lifecycle, &[], &cancel_token),
    )
    .await
    .expect("waiting run should observe the cancel")
    .unwrap_err();
    canceller.await.unwrap();

    assert!(matches!(err, HarnessError::Cancelled));
    assert!(fx.calls().is_empty());
    assert_eq!(harness.registry().active_count(), 1);

    drop(held);
    assert_eq!(harness.registry().active_count(), 0);
}

#[tokio::test]
async fn blocking_runs_on_one_directory_are_serialised() {
    let fx = Fixture::new();
    let harness = fx.harness();

    let (first, second) = tokio::join!(
        harness.run_lifecycle(fx.run_config(), &[]),
        harness.run_lifecycle(fx.run_config(), &[]),
    );
    assert_eq!(first.unwrap().status(), RunStatus::Passed);
    assert_eq!(second.unwrap().status(), RunStatus::Passed);

    let lifecycle = ["init", "apply", "output", "destroy"];
    let expected: Vec<&str> = lifecycle.iter().chain(lifecycle.iter()).copied().collect();
    assert_eq!(fx.calls(), expected);
    assert_eq!(harness.registry().active_count(), 0);
}

#[tokio::test]
async fn private_copies_run_side_by_side() {
    let fx = Fixture::new();
    let harness = Harness::new(fx.runner(), fx.registry(IsolationMode::FailFast))
        .with_private_copies(true);

    let (first_assertions, second_assertions) = (file_assertions(), file_assertions());
    let (first, second) = tokio::join!(
        harness.run_lifecycle(fx.run_config(), &first_assertions),
        harness.run_lifecycle(fx.run_config(), &second_assertions),
    );
    let (first, second) = (first.unwrap(), second.unwrap());

    assert_eq!(first.status(), RunStatus::Passed);
    assert_eq!(second.status(), RunStatus::Passed);
    assert_ne!(first.working_dir, second.working_dir);
    assert!(first
        .working_dir
        .starts_with(fx.work_root.canonicalize().unwrap()));
    assert_eq!(fx.calls().len(), 8);

    // Clean teardown removes the copies.
    assert!(!first.working_dir.exists());
    assert!(!second.working_dir.exists());
}

#[tokio::test]
async fn report_file_records_every_phase() {
    let fx = Fixture::new();
    let report_dir = fx.state.join("reports");
    let runner = fx.runner().with_report_dir(Some(report_dir.clone()));
    let harness = Harness::new(runner, fx.registry(IsolationMode::Block));

    let report = harness.run_lifecycle(fx.run_config(), &[]).await.unwrap();
    assert_eq!(report.status(), RunStatus::Passed);

    let contents = std::fs::read_to_string(report_dir.join("report.tsv")).unwrap();
    let lines: Vec<&str> = contents.lines().collect();
    assert!(lines[0].starts_with("timestamp_ms\trun_id"));
    // header + init/apply/output/destroy + RUN_END
    assert_eq!(lines.len(), 6);
    assert!(lines[5].contains("RUN_END"));
    assert!(lines[5].contains("PASSED"));
    assert!(lines[2].contains("\tapply\t"));
}

#[tokio::test]
async fn harness_from_config_reads_tool_and_retry_settings() {
    let fx = Fixture::new();
    let mut config = Config::default();
    config
        .parse_content(&format!(
            "tool_bin={}\nmax_attempts=2\nretry_base_delay_ms=1\nretry_max_delay_ms=1\nwork_root={}\n",
            fx.tool.display(),
            fx.work_root.display()
        ))
        .unwrap();
    let harness = Harness::from_config(&config).unwrap();

    let report = harness
        .run_lifecycle(fx.run_config().with_env("FAKE_FLAKY_apply", "5"), &[])
        .await
        .unwrap();
    assert_eq!(report.status(), RunStatus::ProvisioningFailed);
    assert!(matches!(
        report.first_error(),
        Some(ProvisionError::RetriesExhausted { attempts: 2, .. })
    ));
    assert_eq!(fx.calls(), vec!["init", "apply", "apply", "destroy"]);
}

/// Live run against a real `terraform` on PATH using the `local` provider.
///
/// Needs network access for provider download, so it is opt-in:
/// `cargo test -- --ignored`.
#[tokio::test]
#[ignore = "requires terraform on PATH and network access"]
async fn real_terraform_local_file_lifecycle() {
    let fixture = Path::new(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures/local-file");
    let scratch = TempDir::new().unwrap();
    let mut config = Config::default();
    config.work_root = scratch.path().to_path_buf();
    config.copy_to_work_root = true;
    config.retry_base_delay_ms = 1000;
    let harness = Harness::from_config(&config).unwrap();

    let run_config = RunConfig::new(&fixture).with_var("content", "tflife live test");
    assert!(harness.validate_only(run_config.clone()).await.unwrap());

    let report = harness
        .run_lifecycle(run_config, &file_assertions())
        .await
        .unwrap();
    assert_eq!(report.status(), RunStatus::Passed, "{:?}", report.errors);
}
