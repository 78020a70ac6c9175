//! Per-server task scheduler
//!
//! Tasks live in `<servers_dir>/<id>.cron`. A task with a cron expression
//! gets a timer job once the scheduler starts; a task without one only runs
//! through [`Scheduler::run_task`]. Every firing looks the server up in the
//! registry and runs the task's operations with the server's current
//! variables. Failures end up in the log and on the console, never here.

use chrono::{DateTime, Local, Utc};
use chrono_tz::Tz;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use skyhost_core::{Bindings, Error, Result, Task, DEFAULT_CONCURRENT_LIMIT, DEFAULT_TIMEZONE};

use crate::registry::ServerRegistry;

/// What a firing does when every slot is taken
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LimitMode {
    /// Block until a slot frees
    #[default]
    Wait,
    /// Skip this firing; the timer fires again next time
    Reschedule,
}

fn default_timezone() -> String {
    DEFAULT_TIMEZONE.to_string()
}

fn default_concurrent_limit() -> usize {
    DEFAULT_CONCURRENT_LIMIT
}

/// The persisted schedule of one server
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Schedule {
    #[serde(default)]
    pub tasks: BTreeMap<String, Task>,
    #[serde(default = "default_timezone", skip_serializing_if = "String::is_empty")]
    pub timezone: String,
    /// Concurrent task runs; 0 means unlimited
    #[serde(default = "default_concurrent_limit")]
    pub concurrent_limit: usize,
    #[serde(default)]
    pub limit_mode: LimitMode,
}

impl Default for Schedule {
    fn default() -> Self {
        Self {
            tasks: BTreeMap::new(),
            timezone: default_timezone(),
            concurrent_limit: DEFAULT_CONCURRENT_LIMIT,
            limit_mode: LimitMode::Wait,
        }
    }
}

/// Parse a cron expression. Five fields are minute precision and get a
/// leading seconds field; six or seven fields are taken as they are.
pub fn parse_cron(expression: &str) -> Result<cron::Schedule> {
    let fields = expression.split_whitespace().count();
    let normalized = match fields {
        5 => format!("0 {}", expression.trim()),
        6 | 7 => expression.trim().to_string(),
        _ => {
            return Err(Error::Schedule(format!(
                "invalid cron expression '{}': expected 5 to 7 fields, got {}",
                expression, fields
            )))
        }
    };
    cron::Schedule::from_str(&normalized)
        .map_err(|e| Error::Schedule(format!("invalid cron expression '{}': {}", expression, e)))
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Zone {
    Local,
    Named(Tz),
}

impl Zone {
    fn parse(name: &str) -> Result<Self> {
        if name.is_empty() || name.eq_ignore_ascii_case(DEFAULT_TIMEZONE) {
            return Ok(Zone::Local);
        }
        name.parse::<Tz>()
            .map(Zone::Named)
            .map_err(|e| Error::Schedule(format!("unknown timezone '{}': {}", name, e)))
    }

    fn next_fire(&self, schedule: &cron::Schedule) -> Option<DateTime<Utc>> {
        let now = Utc::now();
        match self {
            Zone::Local => schedule
                .after(&now.with_timezone(&Local))
                .next()
                .map(|t| t.with_timezone(&Utc)),
            Zone::Named(tz) => schedule
                .after(&now.with_timezone(tz))
                .next()
                .map(|t| t.with_timezone(&Utc)),
        }
    }
}

/// Everything a firing needs, detached from the scheduler
#[derive(Clone)]
struct TaskRunner {
    server_id: String,
    servers: Weak<ServerRegistry>,
    limiter: Option<Arc<Semaphore>>,
    mode: LimitMode,
}

impl TaskRunner {
    fn fire(&self, task: Task) -> JoinHandle<()> {
        let runner = self.clone();
        tokio::spawn(async move {
            let _permit = match &runner.limiter {
                None => None,
                Some(limiter) => match runner.mode {
                    LimitMode::Wait => match limiter.clone().acquire_owned().await {
                        Ok(permit) => Some(permit),
                        Err(_) => return,
                    },
                    LimitMode::Reschedule => match limiter.clone().try_acquire_owned() {
                        Ok(permit) => Some(permit),
                        Err(_) => {
                            debug!(server = %runner.server_id, task = %task.name, "limit reached, skipping run");
                            return;
                        }
                    },
                },
            };
            runner.execute(&task).await;
        })
    }

    async fn execute(&self, task: &Task) {
        let Some(server) = self.servers.upgrade().and_then(|s| s.get(&self.server_id)) else {
            warn!(server = %self.server_id, task = %task.name, "server gone, task not run");
            return;
        };
        if task.operations.is_empty() {
            return;
        }

        let env = server.environment();
        info!(server = %self.server_id, task = %task.name, "running task");
        env.display_to_console(&format!("Running task {}", task.name));
        match server.run_pipeline(&task.operations, Bindings::new()).await {
            Ok(_) => env.display_to_console(&format!("Task {} finished", task.name)),
            Err(e) => {
                error!(server = %self.server_id, task = %task.name, error = %e, "task failed");
                env.display_to_console(&format!("Task {} failed: {}", task.name, e));
            }
        }
    }
}

pub struct Scheduler {
    server_id: String,
    path: PathBuf,
    servers: Weak<ServerRegistry>,
    schedule: Mutex<Schedule>,
    runner: Mutex<Option<TaskRunner>>,
    jobs: Mutex<HashMap<String, JoinHandle<()>>>,
    running: AtomicBool,
}

impl Scheduler {
    pub fn new(server_id: &str, path: PathBuf, servers: Weak<ServerRegistry>) -> Self {
        Self {
            server_id: server_id.to_string(),
            path,
            servers,
            schedule: Mutex::new(Schedule::default()),
            runner: Mutex::new(None),
            jobs: Mutex::new(HashMap::new()),
            running: AtomicBool::new(false),
        }
    }

    /// Read the schedule file; a missing file means an empty schedule
    pub async fn load(&self) -> Result<()> {
        let schedule = match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => serde_json::from_str::<Schedule>(&content)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Schedule::default(),
            Err(e) => return Err(e.into()),
        };
        Zone::parse(&schedule.timezone)?;
        *self.schedule.lock() = schedule;
        Ok(())
    }

    pub async fn save(&self) -> Result<()> {
        let json = serde_json::to_string_pretty(&*self.schedule.lock())?;
        tokio::fs::write(&self.path, json).await?;
        Ok(())
    }

    /// (Re)build the timer jobs from the task map
    pub fn start(&self) -> Result<()> {
        self.stop();

        let schedule = self.schedule.lock().clone();
        let zone = Zone::parse(&schedule.timezone)?;
        let runner = TaskRunner {
            server_id: self.server_id.clone(),
            servers: self.servers.clone(),
            limiter: (schedule.concurrent_limit > 0)
                .then(|| Arc::new(Semaphore::new(schedule.concurrent_limit))),
            mode: schedule.limit_mode,
        };

        let mut jobs = HashMap::new();
        for (name, task) in &schedule.tasks {
            if let Some(job) = spawn_job(&runner, zone, task)? {
                jobs.insert(name.clone(), job);
            }
        }
        debug!(server = %self.server_id, jobs = jobs.len(), "scheduler started");

        *self.jobs.lock() = jobs;
        *self.runner.lock() = Some(runner);
        self.running.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// Abort every timer job. Task runs already in flight finish.
    pub fn stop(&self) {
        for (_, job) in self.jobs.lock().drain() {
            job.abort();
        }
        self.running.store(false, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn tasks(&self) -> BTreeMap<String, Task> {
        self.schedule.lock().tasks.clone()
    }

    pub fn schedule(&self) -> Schedule {
        self.schedule.lock().clone()
    }

    /// Add or replace a task and persist the schedule
    pub async fn add_task(&self, name: &str, mut task: Task) -> Result<()> {
        if name.trim().is_empty() {
            return Err(Error::invalid_argument("task name is required"));
        }
        if !task.cron_schedule.is_empty() {
            parse_cron(&task.cron_schedule)?;
        }
        if task.name.is_empty() {
            task.name = name.to_string();
        }

        let zone = Zone::parse(&self.schedule.lock().timezone)?;
        if let Some(previous) = self.jobs.lock().remove(name) {
            previous.abort();
        }
        if self.is_running() {
            let runner = self.runner.lock().clone();
            if let Some(runner) = runner {
                if let Some(job) = spawn_job(&runner, zone, &task)? {
                    self.jobs.lock().insert(name.to_string(), job);
                }
            }
        }

        info!(server = %self.server_id, task = %name, "task added");
        self.schedule.lock().tasks.insert(name.to_string(), task);
        self.save().await
    }

    pub async fn remove_task(&self, name: &str) -> Result<()> {
        if self.schedule.lock().tasks.remove(name).is_none() {
            return Err(Error::TaskNotFound(name.to_string()));
        }
        if let Some(job) = self.jobs.lock().remove(name) {
            job.abort();
        }
        info!(server = %self.server_id, task = %name, "task removed");
        self.save().await
    }

    /// Run a task now, under the same concurrency limit as timer firings
    pub fn run_task(&self, name: &str) -> Result<JoinHandle<()>> {
        let task = self
            .schedule
            .lock()
            .tasks
            .get(name)
            .cloned()
            .ok_or_else(|| Error::TaskNotFound(name.to_string()))?;

        let runner = self.runner.lock().clone().unwrap_or_else(|| TaskRunner {
            server_id: self.server_id.clone(),
            servers: self.servers.clone(),
            limiter: None,
            mode: LimitMode::Wait,
        });
        Ok(runner.fire(task))
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Timer job for a cron task; tasks without a cron expression get none
fn spawn_job(runner: &TaskRunner, zone: Zone, task: &Task) -> Result<Option<JoinHandle<()>>> {
    if task.cron_schedule.is_empty() {
        return Ok(None);
    }
    let schedule = parse_cron(&task.cron_schedule)?;
    let runner = runner.clone();
    let task = task.clone();

    Ok(Some(tokio::spawn(async move {
        while let Some(next) = zone.next_fire(&schedule) {
            let delay = (next - Utc::now()).to_std().unwrap_or_default();
            tokio::time::sleep(delay).await;
            runner.fire(task.clone());
        }
    })))
}
