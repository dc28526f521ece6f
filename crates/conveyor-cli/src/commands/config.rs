//! Config commands.

use anyhow::{Context, Result};
use conveyor_core::{Config, ConfigVersion};
use reqwest::Method;
use reqwest::header::HeaderMap;
use tracing::debug;

use super::load_config;
use crate::client::{ApiClient, CONFIG_ID_HEADER, config_path};

fn config_id(headers: &HeaderMap) -> Result<ConfigVersion> {
    headers
        .get(CONFIG_ID_HEADER)
        .context("response has no config ID")?
        .to_str()
        .context("config ID is not text")?
        .parse()
        .context("config ID is malformed")
}

async fn fetch(client: &ApiClient, pipeline: Option<&str>) -> Result<(Config, ConfigVersion)> {
    let request = client.request(Method::GET, &config_path(pipeline))?;
    let response = client.send(request).await?;
    let version = config_id(response.headers())?;
    let config = response.json().await.context("malformed config in response")?;
    Ok((config, version))
}

pub async fn get(client: &ApiClient, pipeline: Option<&str>) -> Result<()> {
    let (config, version) = fetch(client, pipeline).await?;
    eprintln!("config ID: {}", version);
    println!("{}", serde_json::to_string_pretty(&config)?);
    Ok(())
}

/// Upload a config on top of whatever version the server has now.
pub async fn set(client: &ApiClient, path: &str, pipeline: Option<&str>) -> Result<()> {
    let config = load_config(path)?;
    let (_, current) = fetch(client, pipeline).await?;
    debug!(config_id = %current, "Fetched current config ID");

    let request = client
        .request(Method::PUT, &config_path(pipeline))?
        .header(CONFIG_ID_HEADER, current.to_string())
        .json(&config);
    let response = client.send(request).await?;
    let saved = config_id(response.headers())?;

    println!("Saved config (config ID {} -> {})", current, saved);
    Ok(())
}
