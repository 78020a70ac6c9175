//! Port publishing specs: `[ip:][host:]container[/proto]`, ranges allowed

use bollard::models::PortBinding;
use std::collections::HashMap;

use skyhost_core::{Error, Result};

pub type PortMap = HashMap<String, Option<Vec<PortBinding>>>;

fn parse_range(text: &str) -> Result<(u16, u16)> {
    let invalid = || Error::invalid_argument(format!("invalid port '{}'", text));
    match text.split_once('-') {
        Some((start, end)) => {
            let start: u16 = start.trim().parse().map_err(|_| invalid())?;
            let end: u16 = end.trim().parse().map_err(|_| invalid())?;
            if end < start {
                return Err(invalid());
            }
            Ok((start, end))
        }
        None => {
            let port = text.trim().parse().map_err(|_| invalid())?;
            Ok((port, port))
        }
    }
}

/// Expand one spec into `port/proto` keys with their host bindings
pub fn parse_port_spec(spec: &str) -> Result<Vec<(String, PortBinding)>> {
    let (body, proto) = match spec.rsplit_once('/') {
        Some((body, proto)) if !proto.is_empty() => (body, proto.to_lowercase()),
        _ => (spec, "tcp".to_string()),
    };

    let parts: Vec<&str> = body.split(':').collect();
    let (ip, host, container) = match parts.as_slice() {
        [container] => ("", "", *container),
        [host, container] => ("", *host, *container),
        [ip, host, container] => (*ip, *host, *container),
        _ => return Err(Error::invalid_argument(format!("invalid port spec '{}'", spec))),
    };

    let (c_start, c_end) = parse_range(container)?;
    let host_range = if host.is_empty() { None } else { Some(parse_range(host)?) };
    if let Some((h_start, h_end)) = host_range {
        if h_end - h_start != c_end - c_start {
            return Err(Error::invalid_argument(format!(
                "port range size mismatch in '{}'",
                spec
            )));
        }
    }

    Ok((0..=(c_end - c_start))
        .map(|offset| {
            let binding = PortBinding {
                host_ip: (!ip.is_empty()).then(|| ip.to_string()),
                host_port: host_range.map(|(h_start, _)| (h_start + offset).to_string()),
            };
            (format!("{}/{}", c_start + offset, proto), binding)
        })
        .collect())
}

/// Merge several specs into a port map
pub fn port_map(specs: &[String]) -> Result<PortMap> {
    let mut map = PortMap::new();
    for spec in specs {
        for (key, binding) in parse_port_spec(spec)? {
            map.entry(key).or_insert_with(|| Some(Vec::new())).get_or_insert_with(Vec::new).push(binding);
        }
    }
    Ok(map)
}
