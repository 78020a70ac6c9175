//! State shared between an Environment and its running backend

use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use tokio::sync::{watch, Mutex};
use tracing::{debug, info};

use skyhost_core::{
    ConsoleLog, EnvironmentKind, Error, Result, ServerStats, ServerStatus, CONSOLE_PREFIX,
};

use crate::console::ConsoleBuffer;
use crate::stdin::ConsoleInput;
use crate::tracker::Tracker;
use crate::traits::ExitCallback;

/// Console, trackers, exit code and the running flag of one server.
/// The running flag doubles as the wait primitive.
pub struct EnvState {
    id: String,
    kind: EnvironmentKind,
    console: ConsoleBuffer,
    console_tracker: Tracker<ConsoleLog>,
    status_tracker: Tracker<ServerStatus>,
    stats_tracker: Tracker<ServerStats>,
    running: watch::Sender<bool>,
    installing: AtomicBool,
    last_exit_code: AtomicI32,
    pipe: Mutex<Option<Box<dyn ConsoleInput>>>,
    forward_console: bool,
}

impl EnvState {
    pub fn new(id: impl Into<String>, kind: EnvironmentKind, buffer_size: usize, forward_console: bool) -> Self {
        let (running, _) = watch::channel(false);
        Self {
            id: id.into(),
            kind,
            console: ConsoleBuffer::new(buffer_size),
            console_tracker: Tracker::default(),
            status_tracker: Tracker::default(),
            stats_tracker: Tracker::default(),
            running,
            installing: AtomicBool::new(false),
            last_exit_code: AtomicI32::new(0),
            pipe: Mutex::new(None),
            forward_console,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> EnvironmentKind {
        self.kind
    }

    pub fn console(&self) -> &ConsoleBuffer {
        &self.console
    }

    pub fn console_tracker(&self) -> &Tracker<ConsoleLog> {
        &self.console_tracker
    }

    pub fn status_tracker(&self) -> &Tracker<ServerStatus> {
        &self.status_tracker
    }

    pub fn stats_tracker(&self) -> &Tracker<ServerStats> {
        &self.stats_tracker
    }

    /// Record process output and fan it out
    pub fn write_console(&self, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        let chunk = self.console.write(data);
        if self.forward_console {
            debug!(server = %self.id, "{}", chunk.logs.trim_end());
        }
        self.console_tracker.publish(chunk);
    }

    /// Daemon message on the console, always newline terminated
    pub fn display(&self, message: &str) {
        let mut line = String::with_capacity(CONSOLE_PREFIX.len() + message.len() + 1);
        line.push_str(CONSOLE_PREFIX);
        line.push_str(message);
        if !line.ends_with('\n') {
            line.push('\n');
        }
        self.write_console(line.as_bytes());
    }

    pub fn status(&self) -> ServerStatus {
        ServerStatus {
            running: *self.running.borrow(),
            installing: self.installing.load(Ordering::SeqCst),
        }
    }

    pub fn publish_status(&self) {
        self.status_tracker.publish(self.status());
    }

    pub fn is_running(&self) -> bool {
        *self.running.borrow()
    }

    pub fn is_installing(&self) -> bool {
        self.installing.load(Ordering::SeqCst)
    }

    pub fn set_installing(&self, installing: bool) {
        self.installing.store(installing, Ordering::SeqCst);
        self.publish_status();
    }

    pub fn last_exit_code(&self) -> i32 {
        self.last_exit_code.load(Ordering::SeqCst)
    }

    pub fn subscribe_running(&self) -> watch::Receiver<bool> {
        self.running.subscribe()
    }

    /// Atomically take the single process slot
    pub fn try_claim(&self) -> Result<()> {
        let claimed = self.running.send_if_modified(|running| {
            if *running {
                false
            } else {
                *running = true;
                true
            }
        });
        if !claimed {
            return Err(Error::ProcessRunning);
        }
        self.publish_status();
        Ok(())
    }

    /// Give the slot back after a failed start
    pub fn release(&self) {
        self.running.send_replace(false);
        self.publish_status();
    }

    pub async fn set_pipe(&self, input: Option<Box<dyn ConsoleInput>>) {
        *self.pipe.lock().await = input;
    }

    /// Write a line into the local pipe; without one the input is dropped
    pub async fn send_to_pipe(&self, line: &str) -> Result<()> {
        match self.pipe.lock().await.as_mut() {
            Some(pipe) => pipe.send_line(line).await,
            None => {
                debug!(server = %self.id, "no console input attached, dropping line");
                Ok(())
            }
        }
    }

    /// Process ended: store the code, release waiters, publish, run the callback
    pub async fn finish(&self, code: i32, callback: Option<ExitCallback>) {
        self.set_pipe(None).await;
        self.last_exit_code.store(code, Ordering::SeqCst);
        self.running.send_replace(false);
        self.publish_status();
        info!(server = %self.id, code, "process exited");
        if let Some(callback) = callback {
            callback(code);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state() -> EnvState {
        EnvState::new("test", EnvironmentKind::Process, 1024, false)
    }

    #[test]
    fn test_claim_is_exclusive() {
        let state = state();
        state.try_claim().unwrap();
        assert!(matches!(state.try_claim(), Err(Error::ProcessRunning)));
        state.release();
        state.try_claim().unwrap();
    }

    #[test]
    fn test_display_prefix_and_newline() {
        let state = state();
        let mut rx = state.console_tracker().subscribe();
        state.display("Installing server");
        assert_eq!(state.console().read_all().0, "[DAEMON] Installing server\n");
        assert_eq!(rx.try_recv().unwrap().logs, "[DAEMON] Installing server\n");
    }

    #[tokio::test]
    async fn test_finish_runs_callback_and_releases() {
        let state = state();
        let mut status = state.status_tracker().subscribe();
        state.try_claim().unwrap();
        assert!(status.recv().await.unwrap().running);

        let (tx, rx) = tokio::sync::oneshot::channel();
        state
            .finish(3, Some(Box::new(move |code| {
                let _ = tx.send(code);
            })))
            .await;

        assert_eq!(rx.await.unwrap(), 3);
        assert_eq!(state.last_exit_code(), 3);
        assert!(!state.is_running());
        assert!(!status.recv().await.unwrap().running);
    }
}
