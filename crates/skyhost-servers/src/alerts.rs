//! Server alerts derived from the periodic stats sweep

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tracing::{info, warn};

use skyhost_core::{ServerStats, ServiceConfig, DEFAULT_TRACKER_CAPACITY};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    Online,
    Offline,
    CpuHigh,
    MemoryHigh,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Alert {
    Online { server: String },
    Offline { server: String },
    CpuHigh { server: String, cpu: f64 },
    /// `percent` of host memory
    MemoryHigh { server: String, percent: f64 },
}

impl Alert {
    pub fn kind(&self) -> AlertKind {
        match self {
            Alert::Online { .. } => AlertKind::Online,
            Alert::Offline { .. } => AlertKind::Offline,
            Alert::CpuHigh { .. } => AlertKind::CpuHigh,
            Alert::MemoryHigh { .. } => AlertKind::MemoryHigh,
        }
    }

    pub fn server(&self) -> &str {
        match self {
            Alert::Online { server }
            | Alert::Offline { server }
            | Alert::CpuHigh { server, .. }
            | Alert::MemoryHigh { server, .. } => server,
        }
    }
}

#[derive(Debug, Default)]
struct AlertState {
    was_running: bool,
    last_alert: HashMap<AlertKind, Instant>,
}

/// Per-server alert state. The first observation of a server only records
/// whether it runs; later ones raise online/offline transitions and
/// threshold alerts, each kind at most once per cooldown.
pub struct AlertTracker {
    states: Mutex<HashMap<String, AlertState>>,
    sender: broadcast::Sender<Alert>,
    cooldown: Duration,
    cpu_threshold: f64,
    memory_threshold: f64,
    total_memory: f64,
}

impl AlertTracker {
    /// `total_memory` is the host memory in bytes, the base of memory alerts
    pub fn new(config: &ServiceConfig, total_memory: u64) -> Self {
        let (sender, _) = broadcast::channel(DEFAULT_TRACKER_CAPACITY);
        Self {
            states: Mutex::new(HashMap::new()),
            sender,
            cooldown: config.alert_cooldown(),
            cpu_threshold: config.cpu_alert_threshold,
            memory_threshold: config.memory_alert_threshold,
            total_memory: total_memory as f64,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Alert> {
        self.sender.subscribe()
    }

    pub fn observe(&self, server: &str, running: bool, stats: Option<&ServerStats>) -> Vec<Alert> {
        self.observe_at(server, running, stats, Instant::now())
    }

    pub fn observe_at(
        &self,
        server: &str,
        running: bool,
        stats: Option<&ServerStats>,
        now: Instant,
    ) -> Vec<Alert> {
        let mut candidates = Vec::new();
        let mut states = self.states.lock();

        let state = match states.get_mut(server) {
            Some(state) => state,
            None => {
                states.insert(
                    server.to_string(),
                    AlertState {
                        was_running: running,
                        ..Default::default()
                    },
                );
                return Vec::new();
            }
        };

        if running != state.was_running {
            state.was_running = running;
            candidates.push(if running {
                Alert::Online {
                    server: server.to_string(),
                }
            } else {
                Alert::Offline {
                    server: server.to_string(),
                }
            });
        }

        if let (true, Some(stats)) = (running, stats) {
            if stats.cpu > self.cpu_threshold {
                candidates.push(Alert::CpuHigh {
                    server: server.to_string(),
                    cpu: stats.cpu,
                });
            }
            if self.total_memory > 0.0 {
                let percent = stats.memory / self.total_memory * 100.0;
                if percent > self.memory_threshold {
                    candidates.push(Alert::MemoryHigh {
                        server: server.to_string(),
                        percent,
                    });
                }
            }
        }

        let mut raised = Vec::new();
        for alert in candidates {
            let kind = alert.kind();
            let cooling = state
                .last_alert
                .get(&kind)
                .is_some_and(|last| now.saturating_duration_since(*last) < self.cooldown);
            if cooling {
                continue;
            }
            state.last_alert.insert(kind, now);
            raised.push(alert);
        }
        drop(states);

        for alert in &raised {
            match alert {
                Alert::Online { .. } => info!(server = %server, "server online"),
                _ => warn!(server = %server, alert = ?alert, "server alert"),
            }
            let _ = self.sender.send(alert.clone());
        }
        raised
    }

    /// Drop the state of a deleted server
    pub fn forget(&self, server: &str) {
        self.states.lock().remove(server);
    }
}
