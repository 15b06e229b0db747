//! Build commands.

use anyhow::{Result, bail};
use chrono::{DateTime, Utc};
use isoforge_config::BuildRequest;
use isoforge_core::artifact::ArtifactRef;
use isoforge_core::{BuildConfig, BuildError, BuildId, BuildStatus};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use tokio::fs::File;
use tokio::io::AsyncWriteExt;

use super::ApiClient;

const POLL_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Deserialize)]
struct Submitted {
    build_id: BuildId,
    status: BuildStatus,
    estimated_duration_secs: u64,
    config: BuildConfig,
}

#[derive(Debug, Deserialize)]
struct BuildView {
    build_id: BuildId,
    status: BuildStatus,
    progress: u8,
    stage: String,
    #[serde(default)]
    logs: Vec<String>,
    artifact_ref: Option<ArtifactRef>,
    error: Option<BuildError>,
}

#[derive(Debug, Deserialize)]
struct BuildSummary {
    build_id: BuildId,
    status: BuildStatus,
    progress: u8,
    requester: String,
    created_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
struct Grant {
    url: String,
    size: u64,
    expires_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
struct Cancelled {
    build_id: BuildId,
    status: BuildStatus,
}

pub async fn submit(client: &ApiClient, request: &BuildRequest, wait: bool) -> Result<()> {
    let submitted: Submitted = client.post("api/v1/builds", request).await?;
    println!("Build {} {}", submitted.build_id, submitted.status);
    println!("  services: {}", submitted.config.services.join(", "));
    if !submitted.config.models.is_empty() {
        println!("  models:   {}", submitted.config.models.join(", "));
    }
    println!(
        "  estimate: ~{} min",
        submitted.estimated_duration_secs.div_ceil(60)
    );

    if wait {
        follow(client, submitted.build_id).await?;
    }
    Ok(())
}

/// Poll a build until it reaches a terminal state.
async fn follow(client: &ApiClient, id: BuildId) -> Result<()> {
    let mut last: Option<(BuildStatus, u8)> = None;
    loop {
        let build: BuildView = client.get(&format!("api/v1/builds/{id}?logs=0")).await?;
        if last != Some((build.status, build.progress)) {
            println!("[{:>3}%] {} {}", build.progress, build.status, build.stage);
            last = Some((build.status, build.progress));
        }
        if build.status.is_terminal() {
            return finish(&build);
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

fn finish(build: &BuildView) -> Result<()> {
    match (&build.status, &build.error) {
        (BuildStatus::Completed, _) => {
            println!("Build completed; run `isoforge download {}`", build.build_id);
            Ok(())
        }
        (status, Some(error)) => bail!(
            "build {} {}: {} ({})",
            build.build_id,
            status,
            error.message,
            error.reason
        ),
        (status, None) => bail!("build {} {}", build.build_id, status),
    }
}

pub async fn status(client: &ApiClient, id: &str, logs: usize) -> Result<()> {
    let build: BuildView = client
        .get(&format!("api/v1/builds/{id}?logs={logs}"))
        .await?;
    println!("Build    {}", build.build_id);
    println!("Status   {} ({}%)", build.status, build.progress);
    if !build.stage.is_empty() {
        println!("Stage    {}", build.stage);
    }
    if let Some(artifact) = &build.artifact_ref {
        println!("Artifact {} ({} bytes)", artifact.file_name(), artifact.size);
    }
    if let Some(error) = &build.error {
        println!("Error    {} ({})", error.message, error.reason);
    }
    if !build.logs.is_empty() {
        println!();
        for line in &build.logs {
            println!("  {line}");
        }
    }
    Ok(())
}

pub async fn list(client: &ApiClient, requester: Option<&str>) -> Result<()> {
    let query: Vec<(&str, &str)> = requester.map(|r| ("requester", r)).into_iter().collect();
    let builds: Vec<BuildSummary> = client.get_with_query("api/v1/builds", &query).await?;
    if builds.is_empty() {
        println!("No builds");
        return Ok(());
    }
    for build in builds {
        println!(
            "{}  {:<12} {:>3}%  {:<16} {}",
            build.build_id,
            build.status.as_str(),
            build.progress,
            build.requester,
            build.created_at.format("%Y-%m-%d %H:%M")
        );
    }
    Ok(())
}

pub async fn download(client: &ApiClient, id: &str, output: Option<&Path>) -> Result<()> {
    let grant: Grant = client.get(&format!("api/v1/builds/{id}/download")).await?;

    let Some(output) = output else {
        println!("{}", grant.url);
        println!("Expires {} ({} bytes)", grant.expires_at, grant.size);
        return Ok(());
    };

    let mut response = client.http().get(&grant.url).send().await?;
    if !response.status().is_success() {
        bail!("download failed with {}", response.status());
    }
    let mut file = File::create(output).await?;
    let mut written: u64 = 0;
    while let Some(chunk) = response.chunk().await? {
        file.write_all(&chunk).await?;
        written += chunk.len() as u64;
    }
    file.flush().await?;

    if written != grant.size {
        bail!("short download: got {written} of {} bytes", grant.size);
    }
    println!("Wrote {} ({written} bytes)", output.display());
    Ok(())
}

pub async fn cancel(client: &ApiClient, id: &str) -> Result<()> {
    let cancelled: Cancelled = client
        .post(&format!("api/v1/builds/{id}/cancel"), &serde_json::json!({}))
        .await?;
    println!("Build {} {}", cancelled.build_id, cancelled.status);
    Ok(())
}
