//! Build commands.

use anyhow::{Context, Result};
use conveyor_core::Build;
use reqwest::Method;

use crate::client::ApiClient;

pub async fn trigger(client: &ApiClient, pipeline: &str, job: &str) -> Result<()> {
    let path = format!("api/v1/pipelines/{}/jobs/{}/builds", pipeline, job);
    let response = client.send(client.request(Method::POST, &path)?).await?;
    let build: Build = response.json().await.context("malformed build in response")?;

    println!(
        "Queued {}/{} #{} (build {})",
        pipeline, build.job_name, build.number, build.id
    );
    Ok(())
}
