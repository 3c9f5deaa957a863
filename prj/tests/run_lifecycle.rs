//! End-to-end lifecycle tests for `Engine::execute`.
//!
//! Runs use fake workspace and session managers that record every call, so
//! ordering of provisioning and teardown can be asserted without git or tmux.

use std::fs;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use prj::core::context::StepStatus;
use prj::core::definition::{ActionDefinition, ArgumentSpec, Phase, Step, StepKind};
use prj::error::EngineError;
use prj::io::events::EventStatus;
use prj::io::session::SessionError;
use prj::io::workspace::WorkspaceError;
use prj::test_support::{EventCall, TestProject};

fn action(name: &str, steps: Vec<Step>) -> ActionDefinition {
    let mut def = ActionDefinition::new(name);
    def.steps = steps;
    def
}

fn names_in(result: &prj::core::types::ExecutionResult, phase: Phase) -> Vec<String> {
    result
        .history
        .iter()
        .filter(|r| r.phase == phase)
        .map(|r| r.name.clone())
        .collect()
}

fn named(name: &str, action: &str) -> Step {
    Step::new(name, StepKind::Builtin, action)
}

#[test]
fn echo_action_runs_and_records_artifacts() {
    let project = TestProject::new();
    let mut def = action("greet", vec![Step::builtin("echo")]);
    def.arguments = vec![ArgumentSpec::required("message")];

    let result = project.run(&def, &[("message", "hi")]).expect("run");

    assert!(result.success, "{result:?}");
    assert_eq!(result.error, None);
    assert_eq!(result.history.len(), 1);
    assert_eq!(result.history[0].output, "hi");
    assert_eq!(result.history[0].status, StepStatus::Completed);

    let dir = result.artifact_dir.expect("artifact dir");
    let run_id = result.run_id.expect("run id");
    assert!(run_id.starts_with("app-"), "{run_id}");
    assert!(dir.starts_with(project.paths.artifacts_dir.join("app")));
    assert_eq!(
        fs::read_to_string(dir.join("logs").join("step-01-echo.log")).expect("step log"),
        "hi"
    );
    let metadata: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(dir.join("metadata.json")).expect("metadata"))
            .expect("json");
    assert_eq!(metadata["run_id"], run_id.as_str());
    assert_eq!(metadata["success"], true);
    assert_eq!(metadata["strategy"], "bare");

    assert!(project.log.entries().is_empty(), "bare run touched resources");
}

#[test]
fn failing_main_step_skips_the_rest_and_runs_cleanup_once() {
    let project = TestProject::new();
    let mut def = action(
        "build",
        vec![
            Step::shell("first", "true"),
            named("second", "fail").with_arg("message", "compile error"),
            Step::shell("third", "true"),
        ],
    );
    def.pre_steps = vec![Step::builtin("setup-environment")];
    def.post_steps = vec![Step::builtin("store-artifacts")];
    def.cleanup_on_failure = vec![
        named("undo-a", "cleanup"),
        named("undo-b", "fail").with_arg("message", "cleanup broke"),
        named("undo-c", "cleanup"),
    ];

    let result = project.run(&def, &[]).expect("run");

    assert!(!result.success);
    assert_eq!(result.failed_step.as_deref(), Some("second"));
    let error = result.error.as_deref().expect("error");
    assert!(error.contains("second") && error.contains("compile error"), "{error}");

    assert_eq!(names_in(&result, Phase::Pre), vec!["setup-environment"]);
    assert_eq!(names_in(&result, Phase::Main), vec!["first", "second"]);
    assert!(names_in(&result, Phase::Post).is_empty());
    assert_eq!(
        names_in(&result, Phase::Cleanup),
        vec!["undo-a", "undo-b", "undo-c"]
    );

    assert_eq!(result.warnings.len(), 1, "{:?}", result.warnings);
    assert!(result.warnings[0].contains("cleanup broke"));
    // The cleanup failure never replaces the primary cause.
    assert!(!error.contains("cleanup broke"));
}

#[test]
fn failing_post_step_also_triggers_cleanup() {
    let project = TestProject::new();
    let mut def = action("ship", vec![Step::builtin("cleanup")]);
    def.post_steps = vec![named("publish", "fail")];
    def.cleanup_on_failure = vec![named("rollback", "cleanup")];

    let result = project.run(&def, &[]).expect("run");

    assert!(!result.success);
    assert_eq!(result.failed_step.as_deref(), Some("publish"));
    assert_eq!(names_in(&result, Phase::Cleanup), vec!["rollback"]);
}

#[test]
fn script_traversal_fails_as_security_violation() {
    let project = TestProject::new();
    let def = action(
        "sneaky",
        vec![
            Step::script("escape", "../../etc/passwd"),
            Step::builtin("echo"),
        ],
    );

    let result = project.run(&def, &[]).expect("run");

    assert!(!result.success);
    assert_eq!(result.failed_step.as_deref(), Some("escape"));
    assert!(
        result
            .error
            .as_deref()
            .is_some_and(|e| e.contains("security violation")),
        "{result:?}"
    );
    assert_eq!(names_in(&result, Phase::Main), vec!["escape"]);
}

#[test]
fn script_step_runs_from_steps_dir() {
    let project = TestProject::new();
    project.write_step("hello.sh", "echo \"hello $PRJ_ARG_WHO from $(basename \"$PWD\")\"\n");
    let mut def = action("hello", vec![Step::script("say", "hello.sh")]);
    def.arguments = vec![ArgumentSpec::optional("who", Some("world"))];

    let result = project.run(&def, &[]).expect("run");

    assert!(result.success, "{result:?}");
    assert_eq!(result.history[0].output.trim(), "hello world from app");
}

#[test]
fn shell_injection_is_refused_by_default() {
    let project = TestProject::new();
    let marker = project.root.join("injected");
    let def = action(
        "inject",
        vec![Step::shell("list", format!("ls && touch {}", marker.display()))],
    );

    let result = project.run(&def, &[]).expect("run");

    assert!(!result.success);
    assert!(!marker.exists());
    assert!(
        result
            .error
            .as_deref()
            .is_some_and(|e| e.contains("shell_policy")),
        "{result:?}"
    );
}

#[test]
fn branch_collision_stops_before_session_and_steps() {
    let project = TestProject::new();
    project
        .workspaces
        .fail_create(WorkspaceError::BranchExists("feat".into()));
    let mut def = action("feature", vec![Step::builtin("create-worktree")]);
    def.arguments = vec![ArgumentSpec::optional("branch", None)];
    def.cleanup_on_failure = vec![Step::builtin("cleanup")];

    let result = project.run(&def, &[("branch", "feat")]).expect("run");

    assert!(!result.success);
    assert_eq!(result.failed_step, None);
    assert!(
        result
            .error
            .as_deref()
            .is_some_and(|e| e.contains("provisioning failed") && e.contains("feat")),
        "{result:?}"
    );
    assert_eq!(project.log.entries(), vec!["workspace.create feat main"]);
    assert!(result.history.is_empty());
}

#[test]
fn resources_are_torn_down_in_reverse_order() {
    let project = TestProject::new();
    let mut def = action("feature", vec![Step::builtin("start-worktree-session")]);
    def.arguments = vec![ArgumentSpec::optional("branch", None)];

    let result = project.run(&def, &[("branch", "feat")]).expect("run");

    assert!(result.success, "{result:?}");
    let output = &result.history[0].output;
    assert!(output.contains("on branch feat"), "{output}");
    assert!(output.contains("app-feat-dev"), "{output}");

    let entries = project.log.entries();
    assert_eq!(entries.len(), 4, "{entries:?}");
    assert_eq!(entries[0], "workspace.create feat main");
    assert!(entries[1].starts_with("session.create app-feat-dev "));
    assert!(entries[1].ends_with("feat"), "session cwd is the worktree: {}", entries[1]);
    assert_eq!(entries[2], "session.kill app-feat-dev");
    assert!(entries[3].starts_with("workspace.remove "));
    assert!(entries[3].ends_with("force=false"));
    assert!(project.sessions.live().is_empty());
}

#[test]
fn steps_run_inside_the_worktree() {
    let project = TestProject::new();
    let mut def = action(
        "feature",
        vec![Step::builtin("create-worktree"), Step::shell("where", "pwd")],
    );
    def.arguments = vec![ArgumentSpec::optional("branch", None)];

    let result = project.run(&def, &[("branch", "wt-check")]).expect("run");

    assert!(result.success, "{result:?}");
    let cwd = PathBuf::from(result.history[1].output.trim());
    assert_eq!(cwd.file_name().and_then(|n| n.to_str()), Some("wt-check"));
}

#[test]
fn failed_session_tears_down_only_the_workspace() {
    let project = TestProject::new();
    project
        .sessions
        .fail_create(SessionError::NameCollision("app-feat-dev".into()));
    let mut def = action("feature", vec![Step::builtin("create-worktree")]);
    def.arguments = vec![ArgumentSpec::optional("branch", None)];

    let result = project.run(&def, &[("branch", "feat")]).expect("run");

    assert!(!result.success);
    assert!(project.log.matching("session.kill").is_empty());
    assert_eq!(project.log.matching("workspace.remove").len(), 1);
    let entries = project.log.entries();
    assert!(entries.last().is_some_and(|e| e.starts_with("workspace.remove")));
}

#[test]
fn teardown_failure_is_a_warning_not_a_failure() {
    let project = TestProject::new();
    project
        .workspaces
        .fail_remove(WorkspaceError::DirtyTree(PathBuf::from("/wt/feat")));
    let mut def = action("feature", vec![Step::builtin("create-worktree")]);
    def.arguments = vec![ArgumentSpec::optional("branch", None)];

    let result = project.run(&def, &[("branch", "feat")]).expect("run");

    assert!(result.success, "{result:?}");
    assert_eq!(result.warnings.len(), 1);
    assert!(result.warnings[0].contains("force_worktree_removal"));
    // The session was still released.
    assert_eq!(project.log.matching("session.kill").len(), 1);
}

#[test]
fn definition_errors_escape_before_anything_runs() {
    let project = TestProject::new();
    let mut def = action("greet", vec![Step::builtin("echo")]);
    def.arguments = vec![ArgumentSpec::required("message")];

    let err = project.run(&def, &[]).unwrap_err();
    assert!(matches!(err, EngineError::Definition(_)), "{err:?}");
    assert!(err.to_string().contains("message"));

    let err = project
        .run(&def, &[("message", "hi"), ("extra", "x")])
        .unwrap_err();
    assert!(err.to_string().contains("unknown argument 'extra'"));

    assert!(project.events.calls().is_empty());
    assert!(!project.paths.artifacts_dir.exists());
}

#[test]
fn step_timeout_kills_the_process() {
    let project = TestProject::new();
    let def = action(
        "slow",
        vec![Step::shell("nap", "sleep 10").with_timeout_secs(1)],
    );

    let started = Instant::now();
    let result = project.run(&def, &[]).expect("run");

    assert!(!result.success);
    assert!(started.elapsed() < Duration::from_secs(8));
    assert!(
        result
            .error
            .as_deref()
            .is_some_and(|e| e.contains("timed out")),
        "{result:?}"
    );
}

#[test]
fn script_timeout_kills_the_commands_it_spawned() {
    let project = TestProject::new();
    project.write_step("spawn.sh", "sleep 6\necho finished\n");
    let def = action(
        "spawn",
        vec![Step::script("spawn", "spawn.sh").with_timeout_secs(1)],
    );

    let started = Instant::now();
    let result = project.run(&def, &[]).expect("run");

    assert!(!result.success);
    assert!(started.elapsed() < Duration::from_secs(4), "took {:?}", started.elapsed());
    assert_eq!(result.failed_step.as_deref(), Some("spawn"));
    assert!(!result.history[0].output.contains("finished"));
}

#[test]
fn steps_without_a_timeout_inherit_the_definition_timeout() {
    let mut project = TestProject::new();
    project.config.default_timeout_secs = 1;
    let mut def = action("build", vec![Step::shell("compile", "sleep 2")]);
    def.timeout_secs = 10;

    let result = project.run(&def, &[]).expect("run");

    assert!(result.success, "{result:?}");
    assert_eq!(names_in(&result, Phase::Main), vec!["compile"]);
}

#[test]
fn definitions_without_a_timeout_use_the_configured_default() {
    let mut project = TestProject::new();
    project.config.default_timeout_secs = 1;
    let mut def = action("build", vec![Step::shell("compile", "sleep 5")]);
    def.timeout_secs = 0;

    let started = Instant::now();
    let result = project.run(&def, &[]).expect("run");

    assert!(!result.success);
    assert!(started.elapsed() < Duration::from_secs(4));
    assert_eq!(result.failed_step.as_deref(), Some("compile"));
    assert!(
        result
            .error
            .as_deref()
            .is_some_and(|e| e.contains("timed out")),
        "{result:?}"
    );
}

#[test]
fn run_budget_caps_step_timeouts() {
    let project = TestProject::new();
    let mut def = action(
        "budget",
        vec![Step::shell("nap", "sleep 10"), Step::builtin("echo")],
    );
    def.timeout_secs = 1;

    let started = Instant::now();
    let result = project.run(&def, &[]).expect("run");

    assert!(!result.success);
    assert!(started.elapsed() < Duration::from_secs(8));
    assert_eq!(result.failed_step.as_deref(), Some("nap"));
    assert_eq!(names_in(&result, Phase::Main), vec!["nap"]);
}

#[test]
fn events_record_start_and_terminal_status() {
    let project = TestProject::new();
    let ok = action("ok", vec![Step::builtin("cleanup")]);
    let bad = action("bad", vec![named("boom", "fail").with_arg("message", "kaput")]);

    let first = project.run(&ok, &[]).expect("run ok");
    project.run(&bad, &[]).expect("run bad");

    let calls = project.events.calls();
    assert_eq!(calls.len(), 4, "{calls:?}");
    let EventCall::Started { command, session_id, .. } = &calls[0] else {
        panic!("expected start, got {:?}", calls[0]);
    };
    assert_eq!(command, "ok");
    assert_eq!(Some(session_id), first.run_id.as_ref());
    assert!(matches!(
        &calls[1],
        EventCall::Ended { status: EventStatus::Completed, exit_code: 0, error: None, .. }
    ));
    let EventCall::Ended { status, exit_code, error, .. } = &calls[3] else {
        panic!("expected end, got {:?}", calls[3]);
    };
    assert_eq!(*status, EventStatus::Failed);
    assert_eq!(*exit_code, 1);
    assert!(error.as_deref().is_some_and(|e| e.contains("kaput")));
}

#[test]
fn concurrent_runs_get_distinct_ids_and_artifacts() {
    let project = TestProject::new();
    let engine = project.engine();
    let mut def = action("greet", vec![Step::builtin("echo")]);
    def.arguments = vec![ArgumentSpec::optional("message", Some("hi"))];

    let results: Vec<_> = std::thread::scope(|scope| {
        let handles: Vec<_> = (0..4)
            .map(|_| {
                scope.spawn(|| {
                    engine
                        .execute(&def, &Default::default(), &project.root)
                        .expect("run")
                })
            })
            .collect();
        handles
            .into_iter()
            .map(|h| h.join().expect("join"))
            .collect()
    });

    let mut ids: Vec<_> = results.iter().filter_map(|r| r.run_id.clone()).collect();
    ids.sort();
    ids.dedup();
    assert_eq!(ids.len(), 4);
    for result in &results {
        assert!(result.success);
        assert!(result.artifact_dir.as_ref().is_some_and(|d| d.join("metadata.json").is_file()));
    }
}

#[test]
fn dry_run_renders_plan_without_side_effects() {
    let project = TestProject::new();
    let mut def = action("feature", vec![Step::builtin("create-worktree")]);
    def.cleanup_on_failure = vec![Step::builtin("cleanup")];

    let result = project
        .engine()
        .plan(&def, &Default::default())
        .expect("plan");

    let output = result.output.expect("plan output");
    assert!(output.contains("strategy: workspace-session"), "{output}");
    assert!(output.contains("1. [builtin] create-worktree"), "{output}");
    assert!(output.contains("cleanup_on_failure:"), "{output}");
    assert!(project.log.entries().is_empty());
    assert!(project.events.calls().is_empty());
}
