// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! One-shot endpoint reachability probe.
//!
//! A single HEAD request with a bounded timeout. Any HTTP response counts as
//! "responded" regardless of status; status interpretation belongs to the
//! callers (preflight accepts anything, diagnostics treats 500+ as
//! unhealthy).

use std::time::{Duration, Instant};

/// Default probe deadline.
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Outcome of a single HEAD probe.
#[derive(Debug, Clone)]
pub struct ProbeOutcome {
    pub url: String,
    pub responded: bool,
    pub status: Option<u16>,
    pub latency_ms: Option<u64>,
    /// Short failure code when the endpoint did not respond:
    /// `timeout`, `connect`, or `request`.
    pub error: Option<String>,
}

impl ProbeOutcome {
    /// Responded with any status below 500.
    pub fn healthy(&self) -> bool {
        self.responded && self.status.map(|s| s < 500).unwrap_or(false)
    }
}

/// Issue a HEAD request against `url`, bounded by `timeout`.
pub async fn head(url: &str, timeout: Duration) -> ProbeOutcome {
    let client = match reqwest::Client::builder().timeout(timeout).build() {
        Ok(client) => client,
        Err(err) => {
            return ProbeOutcome {
                url: url.to_string(),
                responded: false,
                status: None,
                latency_ms: None,
                error: Some(format!("client: {err}")),
            };
        }
    };

    let started = Instant::now();
    match client.head(url).send().await {
        Ok(response) => ProbeOutcome {
            url: url.to_string(),
            responded: true,
            status: Some(response.status().as_u16()),
            latency_ms: Some(started.elapsed().as_millis() as u64),
            error: None,
        },
        Err(err) => ProbeOutcome {
            url: url.to_string(),
            responded: false,
            status: None,
            latency_ms: None,
            error: Some(error_code(&err).to_string()),
        },
    }
}

fn error_code(err: &reqwest::Error) -> &'static str {
    if err.is_timeout() {
        "timeout"
    } else if err.is_connect() {
        "connect"
    } else {
        "request"
    }
}
