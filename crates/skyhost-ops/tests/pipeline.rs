use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;

use skyhost_core::{Bindings, DaemonConfig, EnvironmentSpec, Error, OperationSpec, Result};
use skyhost_env::Environment;
use skyhost_ops::{
    CreateOperation, FnFactory, Operation, OperationFactory, OperationProcess, OperationRegistry,
    OperationResult,
};

/// Returns every argument as a variable override
struct SetVariables(Bindings);

#[async_trait]
impl Operation for SetVariables {
    async fn run(&self, _env: &Environment) -> Result<OperationResult> {
        Ok(OperationResult {
            variable_overrides: self.0.clone(),
        })
    }
}

fn set_variables(op: CreateOperation) -> Result<Box<dyn Operation>> {
    Ok(Box::new(SetVariables(op.args.into_iter().collect())))
}

fn registry() -> OperationRegistry {
    let mut registry = OperationRegistry::with_defaults(reqwest::Client::new(), Path::new("/nonexistent/binaries"));
    registry.register(Arc::new(FnFactory::new("setvar", set_variables)));
    registry
}

async fn environment(tmp: &TempDir, id: &str) -> Environment {
    let mut config = DaemonConfig::rooted_at(tmp.path());
    config.security.disable_unshare = true;
    config.security.jvm_stats_disabled = true;
    let env = Environment::new(id, &EnvironmentSpec::default(), &config, None).unwrap();
    env.create().await.unwrap();
    env
}

async fn run(env: &Environment, specs: Vec<OperationSpec>) -> Result<skyhost_ops::PipelineReport> {
    let registry = registry();
    let process = OperationProcess::generate(&specs, &HashMap::new(), &registry)?;
    process.run(env, &registry, Bindings::new()).await
}

#[tokio::test]
async fn test_install_steps_run_in_order() {
    let tmp = TempDir::new().unwrap();
    let env = environment(&tmp, "scenario-a").await;

    let report = run(
        &env,
        vec![
            OperationSpec::new("mkdir").with_arg("target", "data"),
            OperationSpec::new("writefile")
                .with_arg("target", "data/config.txt")
                .with_arg("text", "X"),
            OperationSpec::new("console").with_arg("message", "done"),
        ],
    )
    .await
    .unwrap();

    assert_eq!(report.executed, vec!["mkdir", "writefile", "console"]);
    assert!(report.skipped.is_empty());
    assert_eq!(env.files().read_to_string("data/config.txt").unwrap(), "X");
    assert!(env.console_buffer().read_all().0.ends_with("[DAEMON] done\n"));
}

#[tokio::test]
async fn test_stdin_step_on_offline_server_succeeds() {
    let tmp = TempDir::new().unwrap();
    let env = environment(&tmp, "scenario-b").await;

    let report = run(
        &env,
        vec![
            OperationSpec::new("stdin")
                .with_arg("command", "say hello")
                .with_condition("is_server_running() == false"),
            OperationSpec::new("stdin")
                .with_arg("command", "stop")
                .with_condition("is_server_running()"),
        ],
    )
    .await
    .unwrap();

    assert_eq!(report.executed, vec!["stdin"]);
    assert_eq!(report.skipped, vec!["stdin"]);
}

#[tokio::test]
async fn test_false_condition_leaves_no_trace() {
    let tmp = TempDir::new().unwrap();
    let env = environment(&tmp, "skip").await;

    let report = run(
        &env,
        vec![
            OperationSpec::new("writefile")
                .with_arg("target", "skipped.txt")
                .with_arg("text", "x")
                .with_condition(r#"env == "docker""#),
            OperationSpec::new("setvar")
                .with_arg("version", "9.9")
                .with_condition("!success"),
        ],
    )
    .await
    .unwrap();

    assert_eq!(report.skipped, vec!["writefile", "setvar"]);
    assert!(!env.files().exists("skipped.txt"));
    assert!(!report.bindings.contains_key("version"));
    assert_eq!(report.bindings.get("success"), Some(&Value::Bool(true)));
    assert_eq!(report.bindings.get("env"), Some(&json!("tty")));
}

#[tokio::test]
async fn test_failing_step_stops_the_pipeline() {
    let tmp = TempDir::new().unwrap();
    let env = environment(&tmp, "fail").await;

    let result = run(
        &env,
        vec![
            OperationSpec::new("writefile").with_arg("target", "before.txt"),
            OperationSpec::new("command").with_arg("commands", "sh -c \"exit 3\""),
            OperationSpec::new("writefile").with_arg("target", "after.txt"),
        ],
    )
    .await;

    assert!(matches!(result, Err(Error::CommandFailed(3))));
    assert!(env.files().exists("before.txt"));
    assert!(!env.files().exists("after.txt"));
    assert!(env
        .console_buffer()
        .read_all()
        .0
        .contains("[DAEMON] Error running command: "));
}

#[tokio::test]
async fn test_bad_arguments_abort_before_the_step_runs() {
    let tmp = TempDir::new().unwrap();
    let env = environment(&tmp, "factory").await;

    let result = run(
        &env,
        vec![
            OperationSpec::new("mkdir").with_arg("target", "first"),
            OperationSpec::new("alterfile").with_arg("file", "a.txt"),
            OperationSpec::new("mkdir").with_arg("target", "last"),
        ],
    )
    .await;

    assert!(matches!(result, Err(Error::FactoryError { op, .. }) if op == "alterfile"));
    assert!(env.files().exists("first"));
    assert!(!env.files().exists("last"));
}

#[tokio::test]
async fn test_unknown_type_runs_nothing() {
    let tmp = TempDir::new().unwrap();
    let env = environment(&tmp, "missing").await;

    let result = run(
        &env,
        vec![
            OperationSpec::new("mkdir").with_arg("target", "data"),
            OperationSpec::new("forgedl"),
        ],
    )
    .await;

    assert!(matches!(result, Err(Error::MissingFactory(kind)) if kind == "forgedl"));
    assert!(!env.files().exists("data"));
}

#[tokio::test]
async fn test_overrides_feed_later_steps() {
    let tmp = TempDir::new().unwrap();
    let env = environment(&tmp, "tokens").await;

    let report = run(
        &env,
        vec![
            OperationSpec::new("setvar").with_arg("version", "1.20.4"),
            OperationSpec::new("writefile")
                .with_arg("target", "version-${version}.txt")
                .with_arg("text", "${serverId} ${missing}"),
            OperationSpec::new("console")
                .with_arg("message", "installed ${version}")
                .with_condition(r#"version == "1.20.4""#),
        ],
    )
    .await
    .unwrap();

    assert_eq!(report.executed, vec!["setvar", "writefile", "console"]);
    assert_eq!(
        env.files().read_to_string("version-1.20.4.txt").unwrap(),
        "tokens ${missing}"
    );
    assert!(env.console_buffer().read_all().0.contains("installed 1.20.4"));
}

#[tokio::test]
async fn test_caller_bindings_and_environment_are_substituted() {
    let tmp = TempDir::new().unwrap();
    let env = environment(&tmp, "vars").await;
    let registry = registry();

    let environment = HashMap::from([("MOTD".to_string(), "welcome to ${name}".to_string())]);
    let process = OperationProcess::generate(
        &[OperationSpec::new("command").with_arg("commands", "sh -c \"echo $MOTD > motd.txt\"")],
        &environment,
        &registry,
    )
    .unwrap();

    let bindings = Bindings::from([("name".to_string(), json!("lobby"))]);
    process.run(&env, &registry, bindings).await.unwrap();

    assert_eq!(env.files().read_to_string("motd.txt").unwrap(), "welcome to lobby\n");
}

/// Keeps the bindings each created step was handed
struct RecordData(Arc<std::sync::Mutex<Vec<Bindings>>>);

impl OperationFactory for RecordData {
    fn key(&self) -> &'static str {
        "record"
    }

    fn create(&self, op: CreateOperation) -> Result<Box<dyn Operation>> {
        if let Ok(mut seen) = self.0.lock() {
            seen.push(op.data);
        }
        Ok(Box::new(SetVariables(Bindings::new())))
    }
}

#[tokio::test]
async fn test_steps_see_server_variables_through_bindings() {
    let tmp = TempDir::new().unwrap();
    let env = environment(&tmp, "bindings").await;
    let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
    let mut registry = registry();
    registry.register(Arc::new(RecordData(seen.clone())));

    let specs = vec![
        OperationSpec::new("record"),
        OperationSpec::new("setvar").with_arg("jar", "server-${version}.jar"),
        OperationSpec::new("record"),
    ];
    let process = OperationProcess::generate(&specs, &HashMap::new(), &registry).unwrap();
    let bindings = Bindings::from([("version".to_string(), json!("1.20.4"))]);
    process.run(&env, &registry, bindings).await.unwrap();

    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 2);
    assert_eq!(seen[0]["version"], json!("1.20.4"));
    assert_eq!(seen[0]["serverId"], json!("bindings"));
    assert_eq!(seen[0]["rootDir"], json!(env.root().display().to_string()));
    assert!(!seen[0].contains_key("jar"));
    assert_eq!(seen[1]["jar"], json!("server-1.20.4.jar"));
}

#[tokio::test]
async fn test_condition_error_is_fatal() {
    let tmp = TempDir::new().unwrap();
    let env = environment(&tmp, "cond").await;

    let result = run(
        &env,
        vec![OperationSpec::new("console")
            .with_arg("message", "x")
            .with_condition("undefined_thing == 1")],
    )
    .await;

    assert!(matches!(result, Err(Error::Condition(_))));
}
