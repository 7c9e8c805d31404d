//! Utility functions and helpers

use anyhow::{bail, Result};
use std::time::Duration;

/// Parse a human duration (`250ms`, `30s`, `5m`, `1h`). A bare number is seconds.
pub fn parse_duration(s: &str) -> Result<Duration> {
    let s = s.trim();
    if s.is_empty() {
        bail!("empty duration");
    }

    if let Some(num_str) = s.strip_suffix("ms") {
        Ok(Duration::from_millis(num_str.trim().parse()?))
    } else if let Some(num_str) = s.strip_suffix('s') {
        Ok(Duration::from_secs(num_str.trim().parse()?))
    } else if let Some(num_str) = s.strip_suffix('m') {
        let mins: u64 = num_str.trim().parse()?;
        Ok(Duration::from_secs(mins * 60))
    } else if let Some(num_str) = s.strip_suffix('h') {
        let hours: u64 = num_str.trim().parse()?;
        Ok(Duration::from_secs(hours * 3600))
    } else {
        Ok(Duration::from_secs(s.parse()?))
    }
}

/// Split a `key=value` pair as given on the command line.
pub fn parse_label(s: &str) -> Result<(String, String)> {
    match s.split_once('=') {
        Some((k, v)) if !k.trim().is_empty() => Ok((k.trim().to_string(), v.to_string())),
        _ => bail!("label must be key=value, got {:?}", s),
    }
}
