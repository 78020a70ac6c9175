//! Server registration commands

use anyhow::{bail, Result};
use skyhost_core::ServerDefinition;
use skyhost_ipc::{IpcClient, Request};
use std::path::Path;

use crate::cli::CreateArgs;

pub async fn create(client: &IpcClient, args: CreateArgs) -> Result<()> {
    let mut definition: ServerDefinition = super::read_json(&args.file)?;
    definition.id = resolve_id(args.id, &definition.id, &args.file)?;

    super::confirm(
        client,
        Request::Create {
            definition,
            install: args.install,
        },
    )
    .await
}

/// The flag wins, then the id inside the file, then the file name
fn resolve_id(flag: Option<String>, in_file: &str, file: &Path) -> Result<String> {
    if let Some(id) = flag {
        return Ok(id);
    }
    if !in_file.is_empty() {
        return Ok(in_file.to_string());
    }
    match file.file_stem().and_then(|s| s.to_str()) {
        Some(stem) if !stem.is_empty() => Ok(stem.to_string()),
        _ => bail!("cannot derive a server id from {}", file.display()),
    }
}

pub async fn delete(client: &IpcClient, id: &str) -> Result<()> {
    super::confirm(client, Request::Delete { id: id.to_string() }).await
}

pub async fn install(client: &IpcClient, id: &str) -> Result<()> {
    super::confirm(client, Request::Install { id: id.to_string() }).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_id() {
        let file = Path::new("/srv/defs/survival.json");
        assert_eq!(
            resolve_id(Some("flag".into()), "lobby", file).unwrap(),
            "flag"
        );
        assert_eq!(resolve_id(None, "lobby", file).unwrap(), "lobby");
        assert_eq!(resolve_id(None, "", file).unwrap(), "survival");
        assert!(resolve_id(None, "", Path::new("/")).is_err());
    }
}
