//! Push command implementation

use super::Target;
use crate::output;
use anyhow::{bail, Context, Result};
use clap::Args;
use hyper::header::{AUTHORIZATION, CONTENT_TYPE};
use hyper::{Body, Method, Request, StatusCode};
use serde_json::Value;
use std::path::PathBuf;
use tally_shared::utils::parse_label;
use tally_shared::{ErrorResponse, IngestRequest, IngestResponse, RawSample};

#[derive(Args, Debug)]
pub struct PushArgs {
    /// Metric name (omit with --file)
    #[arg(required_unless_present = "file")]
    pub name: Option<String>,

    /// Sample value
    #[arg(required_unless_present = "file")]
    pub value: Option<String>,

    /// Metric type: counter, gauge, histogram, summary
    #[arg(short = 't', long = "type", default_value = "gauge")]
    pub kind: String,

    /// Label as key=value (repeatable)
    #[arg(short, long = "label", value_parser = parse_label)]
    pub labels: Vec<(String, String)>,

    /// JSON batch file: `{"metrics": [...]}` or a bare array
    #[arg(short, long, conflicts_with_all = ["name", "value"])]
    pub file: Option<PathBuf>,

    /// API key for the tenant
    #[arg(long, env = "TALLY_API_KEY", hide_env_values = true)]
    pub api_key: String,
}

/// Numbers go out as JSON numbers, anything else as a string.
fn sample_value(raw: &str) -> Value {
    match serde_json::from_str::<Value>(raw) {
        Ok(v @ Value::Number(_)) => v,
        _ => Value::String(raw.to_string()),
    }
}

fn batch_from_args(args: &PushArgs) -> Result<IngestRequest> {
    if let Some(path) = &args.file {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        return parse_batch(&text).with_context(|| format!("Invalid batch file {}", path.display()));
    }

    let (Some(name), Some(value)) = (&args.name, &args.value) else {
        bail!("a metric name and value are required without --file");
    };
    let sample = args.labels.iter().fold(
        RawSample::new(name.clone(), args.kind.clone(), sample_value(value)),
        |sample, (k, v)| sample.with_label(k.clone(), v.clone()),
    );
    Ok(IngestRequest::new(vec![sample]))
}

fn parse_batch(text: &str) -> Result<IngestRequest> {
    let value: Value = serde_json::from_str(text)?;
    let request = match value {
        Value::Array(metrics) => IngestRequest {
            metrics: Some(metrics),
        },
        other => serde_json::from_value(other)?,
    };
    Ok(request)
}

pub async fn run(target: &Target, args: PushArgs) -> Result<()> {
    let batch = batch_from_args(&args)?;
    let request = Request::builder()
        .method(Method::POST)
        .uri(target.url("/metrics"))
        .header(AUTHORIZATION, format!("Bearer {}", args.api_key))
        .header(CONTENT_TYPE, "application/json")
        .body(Body::from(serde_json::to_vec(&batch)?))
        .context("Failed to build request")?;

    let (status, body) = target.send(request).await?;
    if status == StatusCode::OK {
        let response: IngestResponse =
            serde_json::from_slice(&body).context("Unexpected response from aggregator")?;
        output::success(&format!(
            "processed {}/{} metrics",
            response.processed, response.total
        ));
        response.errors.iter().for_each(output::rejected);
        return Ok(());
    }

    match serde_json::from_slice::<ErrorResponse>(&body) {
        Ok(err) => {
            err.details.iter().flatten().for_each(output::rejected);
            bail!("aggregator returned {}: {}", status, err.error)
        }
        Err(_) => bail!(
            "aggregator returned {}: {}",
            status,
            String::from_utf8_lossy(&body).trim()
        ),
    }
}
