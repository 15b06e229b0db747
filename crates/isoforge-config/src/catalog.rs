//! Service and model catalog.
//!
//! The catalog is the allow-list of everything a build may request, plus the
//! dependency graph used to close a request. It is written in KDL:
//!
//! ```kdl
//! service "openwebui" {
//!     depends-on "ollama"
//!     minutes 3
//! }
//! model "llama3.1:8b" size-gb=4.7 requires-service="ollama"
//! ```

use kdl::{KdlDocument, KdlNode};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};

use crate::kdl_util::{
    all_string_args, first_string_arg, has_child, number_prop, string_prop, u32_arg,
};
use crate::{ConfigError, ConfigResult};

/// Catalog shipped with the crate.
pub const BUILTIN_CATALOG: &str = include_str!("../catalog.kdl");

/// Fixed install overhead of every image, in minutes.
const BASE_MINUTES: f64 = 8.0;
/// Download and repack time per GB of model weights, in minutes.
const MINUTES_PER_MODEL_GB: f64 = 1.5;
/// GPU driver installation overhead, in minutes.
const GPU_MINUTES: f64 = 5.0;

#[derive(Debug, Clone, Serialize)]
pub struct ServiceEntry {
    pub name: String,
    pub description: Option<String>,
    pub depends_on: Vec<String>,
    /// Estimated install time.
    pub minutes: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct ModelEntry {
    pub name: String,
    pub size_gb: f64,
    /// Service that must be present to serve this model.
    pub requires_service: Option<String>,
    pub requires_gpu: bool,
}

/// The allow-list with its dependency graph.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Catalog {
    services: BTreeMap<String, ServiceEntry>,
    models: BTreeMap<String, ModelEntry>,
}

impl Catalog {
    /// The catalog compiled into the binary.
    pub fn builtin() -> ConfigResult<Self> {
        parse_catalog(BUILTIN_CATALOG)
    }

    pub fn service(&self, name: &str) -> Option<&ServiceEntry> {
        self.services.get(name)
    }

    pub fn model(&self, name: &str) -> Option<&ModelEntry> {
        self.models.get(name)
    }

    pub fn services(&self) -> impl Iterator<Item = &ServiceEntry> {
        self.services.values()
    }

    pub fn models(&self) -> impl Iterator<Item = &ModelEntry> {
        self.models.values()
    }

    /// Close a set of service ids under the `depends-on` relation.
    ///
    /// Worklist traversal with a visited set, so shared and cyclic
    /// dependencies terminate. Unknown ids are kept as-is; callers validate
    /// membership before closing.
    pub fn closure<'a, I>(&self, roots: I) -> BTreeSet<String>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut closed = BTreeSet::new();
        let mut pending: Vec<&str> = roots.into_iter().collect();

        while let Some(name) = pending.pop() {
            if !closed.insert(name.to_string()) {
                continue;
            }
            if let Some(entry) = self.services.get(name) {
                pending.extend(entry.depends_on.iter().map(String::as_str));
            }
        }

        closed
    }

    /// Estimated build duration in seconds for a closed configuration.
    pub fn estimate_secs(&self, services: &[String], models: &[String], gpu: bool) -> u64 {
        let service_minutes: f64 = services
            .iter()
            .filter_map(|s| self.services.get(s))
            .map(|s| f64::from(s.minutes))
            .sum();
        let model_minutes: f64 = models
            .iter()
            .filter_map(|m| self.models.get(m))
            .map(|m| m.size_gb * MINUTES_PER_MODEL_GB)
            .sum();
        let gpu_minutes = if gpu { GPU_MINUTES } else { 0.0 };

        ((BASE_MINUTES + service_minutes + model_minutes + gpu_minutes) * 60.0).round() as u64
    }
}

/// Parse a catalog from KDL text.
pub fn parse_catalog(kdl: &str) -> ConfigResult<Catalog> {
    let doc: KdlDocument = kdl.parse()?;
    let mut catalog = Catalog::default();

    for node in doc.nodes() {
        match node.name().value() {
            "service" => {
                let entry = parse_service(node)?;
                if catalog.services.contains_key(&entry.name) {
                    return Err(ConfigError::Duplicate(format!("service '{}'", entry.name)));
                }
                catalog.services.insert(entry.name.clone(), entry);
            }
            "model" => {
                let entry = parse_model(node)?;
                if catalog.models.contains_key(&entry.name) {
                    return Err(ConfigError::Duplicate(format!("model '{}'", entry.name)));
                }
                catalog.models.insert(entry.name.clone(), entry);
            }
            _ => {} // Ignore unknown nodes
        }
    }

    // Every edge must point at a known service
    for service in catalog.services.values() {
        for dep in &service.depends_on {
            if !catalog.services.contains_key(dep) {
                return Err(ConfigError::InvalidReference(format!(
                    "service '{}' depends on unknown service '{}'",
                    service.name, dep
                )));
            }
        }
    }
    for model in catalog.models.values() {
        if let Some(required) = &model.requires_service {
            if !catalog.services.contains_key(required) {
                return Err(ConfigError::InvalidReference(format!(
                    "model '{}' requires unknown service '{}'",
                    model.name, required
                )));
            }
        }
    }

    Ok(catalog)
}

fn parse_service(node: &KdlNode) -> ConfigResult<ServiceEntry> {
    let name = first_string_arg(node)
        .ok_or_else(|| ConfigError::MissingField("service name".to_string()))?;

    let mut description = None;
    let mut depends_on = Vec::new();
    let mut minutes = 0;

    if let Some(children) = node.children() {
        for child in children.nodes() {
            match child.name().value() {
                "description" => description = first_string_arg(child),
                "depends-on" | "depends_on" => depends_on.extend(all_string_args(child)),
                "minutes" => minutes = u32_arg(child, &format!("minutes of service '{name}'"))?,
                _ => {}
            }
        }
    }

    depends_on.sort();
    depends_on.dedup();

    Ok(ServiceEntry {
        name,
        description,
        depends_on,
        minutes,
    })
}

fn parse_model(node: &KdlNode) -> ConfigResult<ModelEntry> {
    let name = first_string_arg(node)
        .ok_or_else(|| ConfigError::MissingField("model name".to_string()))?;

    let size_gb = number_prop(node, "size-gb").unwrap_or(0.0);
    if !size_gb.is_finite() || size_gb < 0.0 {
        return Err(ConfigError::InvalidValue {
            field: format!("size-gb of model '{name}'"),
            message: format!("{size_gb} is not a valid size"),
        });
    }

    Ok(ModelEntry {
        requires_service: string_prop(node, "requires-service"),
        requires_gpu: has_child(node, "requires-gpu"),
        name,
        size_gb,
    })
}
