//! Pod manifest validation and resource quantity parsing.
//!
//! Callers submit a Kubernetes-style Pod manifest as YAML (JSON is valid YAML).
//! Only the structure the manager relies on is checked here; everything else
//! is passed through to the cluster untouched.

use std::collections::{BTreeMap, HashSet};

use serde::Deserialize;

use super::StackError;

/// Aggregate resource requests of a pod.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResourceRequests {
    pub cpu_milli: i64,
    pub memory_bytes: i64,
}

/// A validated pod manifest.
#[derive(Debug, Clone)]
pub struct PodSpec {
    raw: String,
    manifest: serde_json::Value,
    requests: ResourceRequests,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PodManifest {
    #[serde(default)]
    api_version: Option<String>,
    #[serde(default)]
    kind: Option<String>,
    spec: Option<PodBody>,
}

#[derive(Debug, Deserialize)]
struct PodBody {
    #[serde(default)]
    containers: Vec<Container>,
}

#[derive(Debug, Deserialize)]
struct Container {
    #[serde(default)]
    name: String,
    #[serde(default)]
    image: String,
    #[serde(default)]
    ports: Vec<ContainerPort>,
    #[serde(default)]
    resources: Resources,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ContainerPort {
    container_port: u16,
}

#[derive(Debug, Default, Deserialize)]
struct Resources {
    #[serde(default)]
    requests: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    limits: BTreeMap<String, serde_json::Value>,
}

fn invalid(message: impl Into<String>) -> StackError {
    StackError::PodSpecInvalid(message.into())
}

impl PodSpec {
    /// Parse and validate a manifest for a workload listening on `target_port`.
    pub fn parse(raw: &str, target_port: u16) -> Result<Self, StackError> {
        if raw.trim().is_empty() {
            return Err(invalid("pod spec is empty"));
        }

        let manifest: serde_json::Value =
            serde_yaml::from_str(raw).map_err(|e| invalid(format!("not valid YAML: {e}")))?;
        if !manifest.is_object() {
            return Err(invalid("pod spec must be a mapping"));
        }

        let pod: PodManifest = serde_json::from_value(manifest.clone())
            .map_err(|e| invalid(format!("unexpected structure: {e}")))?;

        if let Some(kind) = pod.kind.as_deref() {
            if kind != "Pod" {
                return Err(invalid(format!("kind must be Pod, got {kind}")));
            }
        }
        if let Some(api_version) = pod.api_version.as_deref() {
            if api_version != "v1" {
                return Err(invalid(format!("apiVersion must be v1, got {api_version}")));
            }
        }

        let Some(body) = pod.spec else {
            return Err(invalid("spec is required"));
        };
        if body.containers.is_empty() {
            return Err(invalid("spec.containers must not be empty"));
        }

        let mut names = HashSet::new();
        let mut declared_ports = Vec::new();
        let mut requests = ResourceRequests::default();

        for (idx, container) in body.containers.iter().enumerate() {
            let name = container.name.trim();
            if name.is_empty() {
                return Err(invalid(format!("containers[{idx}].name is required")));
            }
            if !names.insert(name) {
                return Err(invalid(format!("duplicate container name '{name}'")));
            }
            if container.image.trim().is_empty() {
                return Err(invalid(format!("containers[{idx}].image is required")));
            }

            declared_ports.extend(container.ports.iter().map(|p| p.container_port));

            let own = container_requests(name, &container.resources)?;
            requests.cpu_milli = requests
                .cpu_milli
                .checked_add(own.cpu_milli)
                .ok_or_else(|| invalid("total cpu requests overflow"))?;
            requests.memory_bytes = requests
                .memory_bytes
                .checked_add(own.memory_bytes)
                .ok_or_else(|| invalid("total memory requests overflow"))?;
        }

        if !declared_ports.is_empty() && !declared_ports.contains(&target_port) {
            return Err(invalid(format!(
                "target port {target_port} is not declared by any container"
            )));
        }

        Ok(Self {
            raw: raw.to_string(),
            manifest,
            requests,
        })
    }

    /// The manifest as submitted.
    pub fn raw(&self) -> &str {
        &self.raw
    }

    /// The parsed manifest, ready to be sent to the cluster.
    pub fn manifest(&self) -> &serde_json::Value {
        &self.manifest
    }

    /// Summed container requests.
    pub fn requests(&self) -> ResourceRequests {
        self.requests
    }
}

// Requests fall back to limits, which is what the cluster does on admission.
fn container_requests(name: &str, resources: &Resources) -> Result<ResourceRequests, StackError> {
    let mut out = ResourceRequests::default();

    for (section, values) in [("limits", &resources.limits), ("requests", &resources.requests)] {
        for (key, value) in values {
            let text = quantity_text(value).ok_or_else(|| {
                invalid(format!("{name}: resources.{section}.{key} must be a quantity"))
            })?;
            match key.as_str() {
                "cpu" => {
                    out.cpu_milli = parse_cpu_milli(&text).map_err(|e| {
                        invalid(format!("{name}: resources.{section}.cpu: {e}"))
                    })?;
                }
                "memory" => {
                    out.memory_bytes = parse_bytes(&text).map_err(|e| {
                        invalid(format!("{name}: resources.{section}.memory: {e}"))
                    })?;
                }
                _ => {}
            }
        }
    }

    Ok(out)
}

fn quantity_text(value: &serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::String(s) => Some(s.clone()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Parse a CPU quantity into millicores: `"250m"`, `"1"`, `"0.5"`.
pub fn parse_cpu_milli(s: &str) -> Result<i64, String> {
    let v = s.trim();
    if v.is_empty() {
        return Err("empty value".to_string());
    }

    if let Some(milli) = v.strip_suffix('m') {
        let n: i64 = milli.parse().map_err(|_| "invalid milli cpu".to_string())?;
        if n <= 0 {
            return Err("cpu must be positive".to_string());
        }
        return Ok(n);
    }

    let cores: f64 = v.parse().map_err(|_| "invalid cpu".to_string())?;
    if !cores.is_finite() || cores <= 0.0 {
        return Err("cpu must be positive".to_string());
    }
    Ok((cores * 1000.0).round() as i64)
}

// Two-letter suffixes are checked first so "Mi" is never read as "M".
const BYTE_UNITS: [(&str, f64); 7] = [
    ("KI", 1024.0),
    ("MI", 1024.0 * 1024.0),
    ("GI", 1024.0 * 1024.0 * 1024.0),
    ("TI", 1024.0 * 1024.0 * 1024.0 * 1024.0),
    ("K", 1000.0),
    ("M", 1000.0 * 1000.0),
    ("G", 1000.0 * 1000.0 * 1000.0),
];

/// Parse a memory quantity into bytes: `"512Mi"`, `"1G"`, `"1048576"`.
///
/// Suffixes are case-insensitive.
pub fn parse_bytes(s: &str) -> Result<i64, String> {
    let v = s.trim().to_ascii_uppercase();
    if v.is_empty() {
        return Err("empty value".to_string());
    }

    for (unit, scale) in BYTE_UNITS {
        if let Some(number) = v.strip_suffix(unit) {
            let n: f64 = number.parse().map_err(|_| "invalid memory".to_string())?;
            if !n.is_finite() || n <= 0.0 {
                return Err("memory must be positive".to_string());
            }
            return Ok((n * scale).round() as i64);
        }
    }

    let n: i64 = v.parse().map_err(|_| "invalid memory".to_string())?;
    if n <= 0 {
        return Err("memory must be positive".to_string());
    }
    Ok(n)
}
