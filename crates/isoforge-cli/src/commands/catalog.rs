//! Catalog commands.

use anyhow::{Context, Result};
use isoforge_config::catalog::parse_catalog;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;

use super::ApiClient;

#[derive(Debug, Deserialize)]
struct ServiceView {
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    depends_on: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct ModelView {
    size_gb: f64,
    #[serde(default)]
    requires_gpu: bool,
}

#[derive(Debug, Deserialize)]
struct CatalogView {
    services: BTreeMap<String, ServiceView>,
    models: BTreeMap<String, ModelView>,
}

pub async fn show(client: &ApiClient) -> Result<()> {
    let catalog: CatalogView = client.get("api/v1/catalog").await?;

    println!("Services:");
    for (name, service) in &catalog.services {
        let deps = if service.depends_on.is_empty() {
            String::new()
        } else {
            format!(" (needs {})", service.depends_on.join(", "))
        };
        println!(
            "  {name:<14}{}{deps}",
            service.description.as_deref().unwrap_or("")
        );
    }

    println!("Models:");
    for (name, model) in &catalog.models {
        let gpu = if model.requires_gpu { ", gpu" } else { "" };
        println!("  {name:<20}{:.1} GB{gpu}", model.size_gb);
    }
    Ok(())
}

/// Parse a catalog file locally and report what it defines.
pub fn validate(path: &Path) -> Result<()> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    let catalog = parse_catalog(&content)
        .with_context(|| format!("{} is not a valid catalog", path.display()))?;
    println!(
        "Catalog is valid: {} services, {} models",
        catalog.services().count(),
        catalog.models().count()
    );
    Ok(())
}
