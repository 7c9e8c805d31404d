//! Subcommands and the HTTP plumbing they share.

pub mod push;
pub mod scrape;

use anyhow::{Context, Result};
use hyper::{Body, Client, Request, StatusCode};
use std::time::Duration;
use tracing::debug;

/// Where and how long to talk to the aggregator.
pub struct Target {
    pub base_url: String,
    pub timeout: Duration,
}

impl Target {
    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Send `request` and collect the full response body.
    pub async fn send(&self, request: Request<Body>) -> Result<(StatusCode, Vec<u8>)> {
        debug!(method = %request.method(), uri = %request.uri(), "sending request");
        let exchange = async {
            let response = Client::new()
                .request(request)
                .await
                .context("Failed to reach aggregator")?;
            let status = response.status();
            let body = hyper::body::to_bytes(response.into_body())
                .await
                .context("Failed to read response body")?;
            Ok::<_, anyhow::Error>((status, body.to_vec()))
        };
        tokio::time::timeout(self.timeout, exchange)
            .await
            .with_context(|| format!("Request timed out after {:?}", self.timeout))?
    }
}
