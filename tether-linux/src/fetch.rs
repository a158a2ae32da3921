//! Upstream content fetcher for artwork and lyrics misses.

use std::time::Duration;

use anyhow::{bail, Context};

/// Largest body accepted from upstream; anything bigger could never be chunked anyway.
const MAX_BODY_BYTES: usize = 4 * 1024 * 1024;

pub struct Fetcher {
    client: reqwest::Client,
}

impl Fetcher {
    pub fn new(timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("building http client")?;
        Ok(Self { client })
    }

    /// Fetch raw bytes. `file://` URLs are read from disk.
    pub async fn fetch(&self, url: &str) -> anyhow::Result<Vec<u8>> {
        if let Some(path) = url.strip_prefix("file://") {
            let bytes = tokio::fs::read(path)
                .await
                .with_context(|| format!("reading {path}"))?;
            return check_size(bytes);
        }
        let resp = self
            .client
            .get(url)
            .send()
            .await
            .with_context(|| format!("GET {url}"))?
            .error_for_status()?;
        let bytes = resp.bytes().await.context("reading body")?;
        check_size(bytes.to_vec())
    }
}

fn check_size(bytes: Vec<u8>) -> anyhow::Result<Vec<u8>> {
    if bytes.len() > MAX_BODY_BYTES {
        bail!("body of {} bytes exceeds {MAX_BODY_BYTES}", bytes.len());
    }
    Ok(bytes)
}
