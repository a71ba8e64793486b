use std::time::Duration;

use anyhow::{bail, Context};

/// Probe `/health` on the local server. Exits non-zero when the server is
/// unreachable or unhealthy, which is what container HEALTHCHECKs key off.
pub async fn run(port: u16) -> anyhow::Result<()> {
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(5))
        .build()
        .context("build http client")?;

    let url = format!("http://localhost:{port}/health");
    let response = client
        .get(&url)
        .send()
        .await
        .with_context(|| format!("request {url}"))?;

    if !response.status().is_success() {
        bail!("server returned {}", response.status());
    }

    println!("ok");
    Ok(())
}
