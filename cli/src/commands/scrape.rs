//! Scrape command implementation

use super::Target;
use crate::output;
use anyhow::{bail, Context, Result};
use clap::Args;
use hyper::{Body, Request};

#[derive(Args, Debug)]
pub struct ScrapeArgs {
    /// Only show metrics whose name contains this string
    #[arg(short, long)]
    pub grep: Option<String>,
}

/// Metric name of an exposition line, including `# HELP`/`# TYPE` headers.
fn metric_name(line: &str) -> Option<&str> {
    if let Some(rest) = line
        .strip_prefix("# HELP ")
        .or_else(|| line.strip_prefix("# TYPE "))
    {
        return rest.split_whitespace().next();
    }
    if line.starts_with('#') || line.trim().is_empty() {
        return None;
    }
    line.split(|c: char| c == '{' || c.is_whitespace()).next()
}

fn filter_exposition(text: &str, pattern: &str) -> String {
    text.lines()
        .filter(|line| metric_name(line).map_or(false, |name| name.contains(pattern)))
        .map(|line| format!("{line}\n"))
        .collect()
}

pub async fn run(target: &Target, args: ScrapeArgs) -> Result<()> {
    let request = Request::get(target.url("/metrics"))
        .body(Body::empty())
        .context("Failed to build request")?;
    let (status, body) = target.send(request).await?;
    let text = String::from_utf8(body).context("Exposition is not UTF-8")?;
    if !status.is_success() {
        bail!("aggregator returned {}: {}", status, text.trim());
    }

    let shown = match &args.grep {
        Some(pattern) => filter_exposition(&text, pattern),
        None => text,
    };
    if shown.is_empty() {
        output::info("no matching metrics");
    } else {
        print!("{shown}");
    }
    Ok(())
}
