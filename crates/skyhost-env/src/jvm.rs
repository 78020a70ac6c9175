//! JVM heap statistics via `jcmd GC.heap_info`
//!
//! For sandboxed processes the HotSpot attach protocol is spoken directly:
//! create `.attach_pid<N>` in the process's working directory, send SIGQUIT,
//! then talk to `/tmp/.java_pid<N>` as seen from the process's root.

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use once_cell::sync::Lazy;
use regex::Regex;
use std::path::PathBuf;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;
use tracing::debug;

use skyhost_core::{Error, JvmStats, Result};

const ATTACH_TIMEOUT: Duration = Duration::from_secs(5);
const ATTACH_POLL: Duration = Duration::from_millis(100);

static HEAP_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"total\s+(\d+)K,\s+used\s+(\d+)K").expect("Invalid heap regex")
});

static METASPACE_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"Metaspace\s+used\s+(\d+)K,\s+(?:capacity\s+\d+K,\s+)?committed\s+(\d+)K")
        .expect("Invalid metaspace regex")
});

/// Parse the output of `jcmd <pid> GC.heap_info`
pub fn parse_heap_info(output: &str) -> Option<JvmStats> {
    let mut stats = JvmStats::default();
    let mut found = false;

    for line in output.lines() {
        let trimmed = line.trim_start();
        if trimmed.starts_with("Metaspace") {
            if let Some(caps) = METASPACE_REGEX.captures(trimmed) {
                stats.metaspace_used = kib(&caps[1]);
                stats.metaspace_total = kib(&caps[2]);
                found = true;
            }
        } else if trimmed.starts_with("class space") {
            continue;
        } else if let Some(caps) = HEAP_REGEX.captures(trimmed) {
            stats.heap_total += kib(&caps[1]);
            stats.heap_used += kib(&caps[2]);
            found = true;
        }
    }

    found.then_some(stats)
}

fn kib(digits: &str) -> u64 {
    digits.parse::<u64>().unwrap_or(0) * 1024
}

/// Namespace-local pid of a process, from the last `NSpid` entry
fn namespace_pid(pid: u32) -> u32 {
    std::fs::read_to_string(format!("/proc/{}/status", pid))
        .ok()
        .and_then(|status| {
            status
                .lines()
                .find(|l| l.starts_with("NSpid:"))
                .and_then(|l| l.split_whitespace().last())
                .and_then(|n| n.parse().ok())
        })
        .unwrap_or(pid)
}

/// Ask a running JVM for `GC.heap_info` over the attach socket
pub async fn attach_heap_info(pid: u32) -> Result<JvmStats> {
    let ns_pid = namespace_pid(pid);
    let socket = PathBuf::from(format!("/proc/{}/root/tmp/.java_pid{}", pid, ns_pid));

    if !socket.exists() {
        let trigger = PathBuf::from(format!("/proc/{}/cwd/.attach_pid{}", pid, ns_pid));
        tokio::fs::write(&trigger, b"").await?;
        kill(Pid::from_raw(pid as i32), Signal::SIGQUIT)
            .map_err(|e| Error::OperationFailed(format!("signal jvm: {}", e)))?;

        let waited = tokio::time::timeout(ATTACH_TIMEOUT, async {
            while !socket.exists() {
                tokio::time::sleep(ATTACH_POLL).await;
            }
        })
        .await;
        let _ = tokio::fs::remove_file(&trigger).await;
        if waited.is_err() {
            return Err(Error::Timeout("jvm attach socket did not appear".into()));
        }
    }

    let mut stream = UnixStream::connect(&socket).await?;
    // protocol version, command, then exactly three arguments
    stream.write_all(b"1\0jcmd\0GC.heap_info\0\0\0").await?;

    let mut response = String::new();
    tokio::time::timeout(ATTACH_TIMEOUT, stream.read_to_string(&mut response))
        .await
        .map_err(|_| Error::Timeout("jvm attach response".into()))??;

    let (code, body) = response.split_once('\n').unwrap_or((response.as_str(), ""));
    if code.trim() != "0" {
        debug!(pid, code = %code.trim(), "jvm attach returned an error");
        return Err(Error::OperationFailed(format!("jvm attach returned {}", code.trim())));
    }

    parse_heap_info(body).ok_or_else(|| Error::OperationFailed("unrecognised heap info".into()))
}
