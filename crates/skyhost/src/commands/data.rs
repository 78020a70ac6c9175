//! Server variable commands

use anyhow::{bail, Result};
use serde_json::Value;
use skyhost_ipc::{IpcClient, Request, Response};
use std::collections::HashMap;

use crate::cli::SetArgs;
use crate::output::print_data;

pub async fn show(client: &IpcClient, id: &str) -> Result<()> {
    match super::request(client, Request::GetData { id: id.to_string() }).await? {
        Response::Data { data } => {
            print_data(&data);
            Ok(())
        }
        _ => super::unexpected(),
    }
}

pub async fn set(client: &IpcClient, args: SetArgs) -> Result<()> {
    let data = parse_assignments(&args.values)?;
    super::confirm(
        client,
        Request::EditData {
            id: args.id,
            data,
            as_admin: args.admin,
        },
    )
    .await
}

/// Parse `key=value` pairs; values that are valid JSON keep their type
fn parse_assignments(values: &[String]) -> Result<HashMap<String, Value>> {
    let mut data = HashMap::new();
    for assignment in values {
        let Some((key, raw)) = assignment.split_once('=') else {
            bail!("expected key=value, got '{}'", assignment);
        };
        let key = key.trim();
        if key.is_empty() {
            bail!("empty variable name in '{}'", assignment);
        }
        let value = serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
        data.insert(key.to_string(), value);
    }
    Ok(data)
}
