//! Table and JSON output

use colored::Colorize;
use serde::Serialize;
use serde_json::Value;
use skyhost_core::{FileDesc, ServerInfo, ServerStats, ServerStatus, Task, Variable};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use tabled::{settings::Style, Table, Tabled};

/// Global flag for JSON output mode
static JSON_MODE: AtomicBool = AtomicBool::new(false);

pub fn set_json_mode(enabled: bool) {
    JSON_MODE.store(enabled, Ordering::SeqCst);
}

pub fn is_json_mode() -> bool {
    JSON_MODE.load(Ordering::SeqCst)
}

/// Print `value` as pretty JSON; true when JSON mode handled the output
fn print_json<T: Serialize + ?Sized>(value: &T) -> bool {
    if !is_json_mode() {
        return false;
    }
    match serde_json::to_string_pretty(value) {
        Ok(json) => println!("{}", json),
        Err(e) => eprintln!("Error serializing to JSON: {}", e),
    }
    true
}

#[derive(Tabled)]
pub struct ServerRow {
    #[tabled(rename = "id")]
    pub id: String,
    #[tabled(rename = "name")]
    pub name: String,
    #[tabled(rename = "environment")]
    pub environment: String,
    #[tabled(rename = "status")]
    pub status: String,
}

fn format_state(running: bool, installing: bool) -> String {
    if installing {
        "installing".yellow().to_string()
    } else if running {
        "online".green().to_string()
    } else {
        "stopped".red().to_string()
    }
}

impl From<&ServerInfo> for ServerRow {
    fn from(info: &ServerInfo) -> Self {
        ServerRow {
            id: info.id.clone(),
            name: info.display.clone(),
            environment: info.environment.clone(),
            status: format_state(info.running, info.installing),
        }
    }
}

pub fn print_servers(servers: &[ServerInfo]) {
    if print_json(servers) {
        return;
    }
    if servers.is_empty() {
        println!("No servers");
        return;
    }
    let rows: Vec<ServerRow> = servers.iter().map(ServerRow::from).collect();
    println!("{}", Table::new(rows).with(Style::rounded()));
}

pub fn print_status(id: &str, status: &ServerStatus) {
    if print_json(status) {
        return;
    }
    println!("{} │ {}", id.bold(), format_state(status.running, status.installing));
}

pub fn print_stats(id: &str, stats: &ServerStats) {
    if print_json(stats) {
        return;
    }
    println!("{}", "─".repeat(40));
    println!("  {} │ {}", "Server".bold(), id);
    println!("  {} │ {:.1}%", "CPU".bold(), stats.cpu);
    println!("  {} │ {}", "Memory".bold(), format_bytes(stats.memory as u64));
    if let Some(jvm) = &stats.jvm {
        println!(
            "  {} │ {} / {}",
            "Heap".bold(),
            format_bytes(jvm.heap_used),
            format_bytes(jvm.heap_total)
        );
        println!(
            "  {} │ {} / {}",
            "Metaspace".bold(),
            format_bytes(jvm.metaspace_used),
            format_bytes(jvm.metaspace_total)
        );
    }
    println!("{}", "─".repeat(40));
}

#[derive(Tabled)]
pub struct VariableRow {
    #[tabled(rename = "name")]
    pub name: String,
    #[tabled(rename = "value")]
    pub value: String,
    #[tabled(rename = "editable")]
    pub editable: String,
}

fn display_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

pub fn print_data(data: &HashMap<String, Variable>) {
    let sorted: BTreeMap<_, _> = data.iter().collect();
    if print_json(&sorted) {
        return;
    }
    if sorted.is_empty() {
        println!("No variables");
        return;
    }
    let rows: Vec<VariableRow> = sorted
        .into_iter()
        .map(|(name, variable)| VariableRow {
            name: name.clone(),
            value: display_value(&variable.value),
            editable: if variable.user_editable { "yes" } else { "no" }.to_string(),
        })
        .collect();
    println!("{}", Table::new(rows).with(Style::rounded()));
}

#[derive(Tabled)]
pub struct BackupRow {
    #[tabled(rename = "file")]
    pub file: String,
    #[tabled(rename = "size")]
    pub size: String,
    #[tabled(rename = "created")]
    pub created: String,
}

pub fn print_backups(backups: &[FileDesc]) {
    if print_json(backups) {
        return;
    }
    if backups.is_empty() {
        println!("No backups");
        return;
    }
    let rows: Vec<BackupRow> = backups
        .iter()
        .map(|b| BackupRow {
            file: b.name.clone(),
            size: format_bytes(b.size),
            created: format_timestamp(b.modified),
        })
        .collect();
    println!("{}", Table::new(rows).with(Style::rounded()));
}

#[derive(Tabled)]
pub struct TaskRow {
    #[tabled(rename = "name")]
    pub name: String,
    #[tabled(rename = "schedule")]
    pub schedule: String,
    #[tabled(rename = "steps")]
    pub steps: usize,
    #[tabled(rename = "description")]
    pub description: String,
}

pub fn print_tasks(tasks: &BTreeMap<String, Task>) {
    if print_json(tasks) {
        return;
    }
    if tasks.is_empty() {
        println!("No tasks");
        return;
    }
    let rows: Vec<TaskRow> = tasks
        .iter()
        .map(|(name, task)| TaskRow {
            name: name.clone(),
            schedule: if task.cron_schedule.is_empty() {
                "-".to_string()
            } else {
                task.cron_schedule.clone()
            },
            steps: task.operations.len(),
            description: task.description.clone(),
        })
        .collect();
    println!("{}", Table::new(rows).with(Style::rounded()));
}

fn format_timestamp(secs: i64) -> String {
    chrono::DateTime::from_timestamp(secs, 0)
        .map(|t| t.with_timezone(&chrono::Local).format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| "-".to_string())
}

pub fn format_bytes(bytes: u64) -> String {
    if bytes >= 1_073_741_824 {
        format!("{:.1}G", bytes as f64 / 1_073_741_824.0)
    } else if bytes >= 1_048_576 {
        format!("{:.1}M", bytes as f64 / 1_048_576.0)
    } else if bytes >= 1024 {
        format!("{:.0}K", bytes as f64 / 1024.0)
    } else {
        format!("{}B", bytes)
    }
}

pub fn print_success(message: &str) {
    if !print_json(&serde_json::json!({"success": true, "message": message})) {
        println!("{} {}", "✓".green(), message);
    }
}

pub fn print_error(message: &str) {
    eprintln!("{} {}", "✗".red(), message);
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_json_mode_toggle() {
        set_json_mode(false);
        assert!(!is_json_mode());
        set_json_mode(true);
        assert!(is_json_mode());
        set_json_mode(false);
        assert!(!is_json_mode());
    }

    #[test]
    fn test_server_row() {
        let row = ServerRow::from(&ServerInfo {
            id: "lobby".into(),
            display: "Lobby".into(),
            environment: "tty".into(),
            running: false,
            installing: false,
        });
        assert_eq!(row.id, "lobby");
        assert!(row.status.contains("stopped"));
    }

    #[test]
    fn test_format_state_prefers_installing() {
        assert!(format_state(true, true).contains("installing"));
        assert!(format_state(true, false).contains("online"));
    }

    #[test]
    fn test_display_value() {
        assert_eq!(display_value(&json!("text")), "text");
        assert_eq!(display_value(&json!(25565)), "25565");
        assert_eq!(display_value(&json!(true)), "true");
    }

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(0), "0B");
        assert_eq!(format_bytes(512), "512B");
        assert_eq!(format_bytes(1024), "1K");
        assert_eq!(format_bytes(1024 * 1024), "1.0M");
        assert_eq!(format_bytes(1024 * 1024 * 1024), "1.0G");
    }

    #[test]
    fn test_format_timestamp() {
        assert_eq!(format_timestamp(i64::MAX), "-");
        assert_eq!(format_timestamp(0).len(), "1970-01-01 00:00".len());
    }
}
