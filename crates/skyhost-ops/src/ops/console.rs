//! Operations that talk to the server process or its console

use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info};

use skyhost_core::{split_arguments, Error, Result, StdinConfiguration};
use skyhost_env::{Environment, ExecutionData};

use crate::operation::{CreateOperation, Operation, OperationResult};

/// `command{commands[], stdin}`: run each command to completion, failing on a non-zero exit
pub struct Command {
    commands: Vec<String>,
    environment: HashMap<String, String>,
    stdin: StdinConfiguration,
}

impl Command {
    pub fn create(op: CreateOperation) -> Result<Box<dyn Operation>> {
        Ok(Box::new(Self {
            commands: op.strings("commands")?,
            stdin: op.stdin()?,
            environment: op.environment,
        }))
    }
}

#[async_trait]
impl Operation for Command {
    async fn run(&self, env: &Environment) -> Result<OperationResult> {
        for line in &self.commands {
            let (program, arguments) = split_arguments(line);
            if program.is_empty() {
                continue;
            }
            info!(server = %env.id(), command = %line, "running command");
            env.display_to_console(&format!("Executing: {}", line));

            let data = ExecutionData::new(program, arguments)
                .with_environment(self.environment.clone())
                .with_stdin(self.stdin.clone());
            let code = env.execute(data).await?;
            if code != 0 {
                return Err(Error::CommandFailed(code));
            }
        }
        Ok(OperationResult::default())
    }
}

/// `console{message}`
pub struct Console {
    message: String,
}

impl Console {
    pub fn create(op: CreateOperation) -> Result<Box<dyn Operation>> {
        Ok(Box::new(Self {
            message: op.string("message")?,
        }))
    }
}

#[async_trait]
impl Operation for Console {
    async fn run(&self, env: &Environment) -> Result<OperationResult> {
        env.display_to_console(&self.message);
        Ok(OperationResult::default())
    }
}

/// `stdin{command}`: a line for the running server; dropped when it is offline
pub struct Stdin {
    command: String,
}

impl Stdin {
    pub fn create(op: CreateOperation) -> Result<Box<dyn Operation>> {
        Ok(Box::new(Self {
            command: op.string("command")?,
        }))
    }
}

#[async_trait]
impl Operation for Stdin {
    async fn run(&self, env: &Environment) -> Result<OperationResult> {
        if !env.is_running().await {
            debug!(server = %env.id(), "server offline, console input not sent");
            return Ok(OperationResult::default());
        }
        env.execute_in_main_process(&self.command).await?;
        Ok(OperationResult::default())
    }
}

/// `sleep{duration}`, humantime syntax (`500ms`, `10s`, `1m 30s`)
pub struct Sleep {
    duration: Duration,
}

impl Sleep {
    pub fn create(op: CreateOperation) -> Result<Box<dyn Operation>> {
        let text = op.string("duration")?;
        let duration = humantime::parse_duration(&text)
            .map_err(|e| Error::invalid_argument(format!("invalid duration '{}': {}", text, e)))?;
        Ok(Box::new(Self { duration }))
    }
}

#[async_trait]
impl Operation for Sleep {
    async fn run(&self, _env: &Environment) -> Result<OperationResult> {
        tokio::time::sleep(self.duration).await;
        Ok(OperationResult::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};
    use skyhost_core::{DaemonConfig, EnvironmentSpec};
    use tempfile::TempDir;

    fn op(args: Value) -> CreateOperation {
        CreateOperation::new(args.as_object().cloned().unwrap_or_default())
    }

    async fn environment(tmp: &TempDir) -> Environment {
        let mut config = DaemonConfig::rooted_at(tmp.path());
        config.security.disable_unshare = true;
        let env = Environment::new("console", &EnvironmentSpec::default(), &config, None).unwrap();
        env.create().await.unwrap();
        env
    }

    #[tokio::test]
    async fn test_command_runs_in_order_and_fails_fast() {
        let tmp = TempDir::new().unwrap();
        let env = environment(&tmp).await;

        let result = Command::create(op(json!({
            "commands": ["sh -c \"echo one > one.txt\"", "sh -c \"exit 2\"", "sh -c \"echo three > three.txt\""]
        })))
        .unwrap()
        .run(&env)
        .await;

        assert!(matches!(result, Err(Error::CommandFailed(2))));
        assert!(env.files().exists("one.txt"));
        assert!(!env.files().exists("three.txt"));
        assert!(env.console_buffer().read_all().0.contains("[DAEMON] Executing: sh -c"));
    }

    #[tokio::test]
    async fn test_command_passes_environment() {
        let tmp = TempDir::new().unwrap();
        let env = environment(&tmp).await;

        let mut create = op(json!({"commands": "sh -c \"echo $GAME_MODE\""}));
        create.environment.insert("GAME_MODE".into(), "survival".into());
        Command::create(create).unwrap().run(&env).await.unwrap();

        assert!(env.console_buffer().read_all().0.contains("survival"));
    }

    #[tokio::test]
    async fn test_stdin_offline_is_noop() {
        let tmp = TempDir::new().unwrap();
        let env = environment(&tmp).await;
        Stdin::create(op(json!({"command": "save-all"})))
            .unwrap()
            .run(&env)
            .await
            .unwrap();
    }

    #[test]
    fn test_sleep_parses_duration() {
        assert!(Sleep::create(op(json!({"duration": "1m 30s"}))).is_ok());
        assert!(matches!(
            Sleep::create(op(json!({"duration": "soon"}))),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[tokio::test]
    async fn test_console_message() {
        let tmp = TempDir::new().unwrap();
        let env = environment(&tmp).await;
        Console::create(op(json!({"message": "done"})))
            .unwrap()
            .run(&env)
            .await
            .unwrap();
        assert_eq!(env.console_buffer().read_all().0, "[DAEMON] done\n");
    }
}
