//! Kubernetes REST API gateway.
//!
//! Each stack becomes a Pod built from the stored manifest plus a
//! `NodePort` Service that exposes the target port. Both objects are named
//! after the stack's workload handle and carry the ownership labels used by
//! the orphan sweep.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Method, StatusCode};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, warn};

use super::{
    ClusterCapacity, ClusterGateway, GatewayError, LiveWorkload, WorkloadHandle, WorkloadRequest,
    WorkloadStatus,
};
use crate::stack::{parse_bytes, parse_cpu_milli};

pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";
pub const MANAGED_BY_VALUE: &str = "stackd";
pub const STACK_ID_LABEL: &str = "stackd.io/stack-id";

/// Connection settings for the API server.
#[derive(Debug, Clone)]
pub struct KubernetesConfig {
    pub api_url: String,
    pub namespace: String,
    pub token: Option<String>,
    pub ca_pem: Option<Vec<u8>>,
}

/// Gateway backed by the Kubernetes API.
pub struct KubernetesGateway {
    client: reqwest::Client,
    base_url: String,
    namespace: String,
    token: Option<String>,
}

impl KubernetesGateway {
    pub fn new(config: KubernetesConfig) -> Result<Self, GatewayError> {
        let mut builder = reqwest::Client::builder().timeout(Duration::from_secs(30));
        if let Some(pem) = &config.ca_pem {
            let cert = reqwest::Certificate::from_pem(pem)
                .map_err(|e| GatewayError::Request(format!("invalid CA certificate: {e}")))?;
            builder = builder.add_root_certificate(cert);
        }
        let client = builder
            .build()
            .map_err(|e| GatewayError::Request(e.to_string()))?;

        Ok(Self {
            client,
            base_url: config.api_url.trim_end_matches('/').to_string(),
            namespace: config.namespace,
            token: config.token,
        })
    }

    fn pods_url(&self) -> String {
        format!("{}/api/v1/namespaces/{}/pods", self.base_url, self.namespace)
    }

    fn services_url(&self) -> String {
        format!(
            "{}/api/v1/namespaces/{}/services",
            self.base_url, self.namespace
        )
    }

    async fn send(
        &self,
        method: Method,
        url: &str,
        query: &[(&str, &str)],
        body: Option<&Value>,
    ) -> Result<reqwest::Response, GatewayError> {
        let mut request = self.client.request(method, url).query(query);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }
        if let Some(body) = body {
            request = request.json(body);
        }

        request
            .send()
            .await
            .map_err(|e| GatewayError::Request(e.to_string()))
    }

    async fn expect_success(response: reqwest::Response) -> Result<reqwest::Response, GatewayError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let message = response.text().await.unwrap_or_default();
        Err(GatewayError::Api {
            status: status.as_u16(),
            message,
        })
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        url: &str,
        query: &[(&str, &str)],
    ) -> Result<T, GatewayError> {
        let response = self.send(Method::GET, url, query, None).await?;
        Self::expect_success(response)
            .await?
            .json()
            .await
            .map_err(|e| GatewayError::Decode(e.to_string()))
    }

    /// Delete one object; a missing object counts as deleted.
    async fn delete_object(&self, url: &str) -> Result<(), GatewayError> {
        let response = self.send(Method::DELETE, url, &[], None).await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(());
        }
        Self::expect_success(response).await.map(|_| ())
    }
}

#[async_trait]
impl ClusterGateway for KubernetesGateway {
    async fn create_workload(&self, request: WorkloadRequest) -> Result<WorkloadHandle, GatewayError> {
        let handle = WorkloadHandle::for_stack(request.stack_id);
        let pod = pod_manifest(&request, &handle, &self.namespace);
        let service = service_manifest(&handle, &self.namespace, request.target_port, request.node_port);

        let response = self
            .send(Method::POST, &self.pods_url(), &[], Some(&pod))
            .await?;
        Self::expect_success(response).await?;
        debug!(handle = %handle, "Pod created");

        let created = match self
            .send(Method::POST, &self.services_url(), &[], Some(&service))
            .await
        {
            Ok(response) => Self::expect_success(response).await.map(|_| ()),
            Err(e) => Err(e),
        };

        if let Err(e) = created {
            let pod_url = format!("{}/{}", self.pods_url(), handle);
            if let Err(cleanup) = self.delete_object(&pod_url).await {
                warn!(handle = %handle, error = %cleanup, "Failed to remove pod after service creation failed");
            }
            return Err(e);
        }
        debug!(handle = %handle, node_port = request.node_port, "Service created");

        Ok(handle)
    }

    async fn delete_workload(&self, handle: &WorkloadHandle) -> Result<(), GatewayError> {
        self.delete_object(&format!("{}/{}", self.services_url(), handle))
            .await?;
        self.delete_object(&format!("{}/{}", self.pods_url(), handle))
            .await
    }

    async fn workload_status(&self, handle: &WorkloadHandle) -> Result<WorkloadStatus, GatewayError> {
        let url = format!("{}/{}", self.pods_url(), handle);
        let response = self.send(Method::GET, &url, &[], None).await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(WorkloadStatus::Dead);
        }
        let pod: PodObject = Self::expect_success(response)
            .await?
            .json()
            .await
            .map_err(|e| GatewayError::Decode(e.to_string()))?;

        Ok(classify_pod(&pod))
    }

    async fn list_live_workloads(&self) -> Result<Vec<LiveWorkload>, GatewayError> {
        let selector = format!("{MANAGED_BY_LABEL}={MANAGED_BY_VALUE}");
        let pods: PodList = self
            .get_json(&self.pods_url(), &[("labelSelector", selector.as_str())])
            .await?;

        Ok(pods
            .items
            .into_iter()
            .map(|pod| LiveWorkload {
                handle: WorkloadHandle::from_name(pod.metadata.name),
                created_at: pod.metadata.creation_timestamp,
            })
            .collect())
    }

    async fn capacity(&self) -> Result<ClusterCapacity, GatewayError> {
        let nodes: NodeList = self
            .get_json(&format!("{}/api/v1/nodes", self.base_url), &[])
            .await?;
        let pods: PodList = self
            .get_json(
                &format!("{}/api/v1/pods", self.base_url),
                &[(
                    "fieldSelector",
                    "status.phase!=Succeeded,status.phase!=Failed",
                )],
            )
            .await?;

        Ok(sum_capacity(&nodes, &pods))
    }
}

#[derive(Debug, Default, Deserialize)]
struct ObjectMeta {
    #[serde(default)]
    name: String,
    #[serde(rename = "creationTimestamp", default)]
    creation_timestamp: Option<DateTime<Utc>>,
}

#[derive(Debug, Default, Deserialize)]
struct PodCondition {
    #[serde(rename = "type")]
    kind: String,
    status: String,
}

#[derive(Debug, Default, Deserialize)]
struct PodStatusObject {
    #[serde(default)]
    phase: Option<String>,
    #[serde(default)]
    conditions: Vec<PodCondition>,
}

#[derive(Debug, Default, Deserialize)]
struct ContainerResources {
    #[serde(default)]
    requests: std::collections::BTreeMap<String, String>,
}

#[derive(Debug, Default, Deserialize)]
struct ContainerObject {
    #[serde(default)]
    resources: ContainerResources,
}

#[derive(Debug, Default, Deserialize)]
struct PodSpecObject {
    #[serde(default)]
    containers: Vec<ContainerObject>,
}

#[derive(Debug, Default, Deserialize)]
struct PodObject {
    #[serde(default)]
    metadata: ObjectMeta,
    #[serde(default)]
    spec: PodSpecObject,
    #[serde(default)]
    status: Option<PodStatusObject>,
}

#[derive(Debug, Default, Deserialize)]
struct PodList {
    #[serde(default)]
    items: Vec<PodObject>,
}

#[derive(Debug, Default, Deserialize)]
struct NodeStatusObject {
    #[serde(default)]
    allocatable: std::collections::BTreeMap<String, String>,
}

#[derive(Debug, Default, Deserialize)]
struct NodeObject {
    #[serde(default)]
    status: NodeStatusObject,
}

#[derive(Debug, Default, Deserialize)]
struct NodeList {
    #[serde(default)]
    items: Vec<NodeObject>,
}

/// Build the Pod object for a stack from its stored manifest.
fn pod_manifest(request: &WorkloadRequest, handle: &WorkloadHandle, namespace: &str) -> Value {
    let mut pod = request.manifest.clone();
    if !pod.is_object() {
        pod = json!({});
    }

    let metadata = pod
        .as_object_mut()
        .map(|obj| obj.entry("metadata").or_insert_with(|| json!({})));
    if let Some(metadata) = metadata {
        if !metadata.is_object() {
            *metadata = json!({});
        }
        metadata["name"] = json!(handle.as_str());
        metadata["namespace"] = json!(namespace);
        if !metadata["labels"].is_object() {
            metadata["labels"] = json!({});
        }
        metadata["labels"][MANAGED_BY_LABEL] = json!(MANAGED_BY_VALUE);
        metadata["labels"][STACK_ID_LABEL] = json!(handle.as_str());
    }

    pod
}

/// Build the NodePort Service routing `node_port` to the pod's `target_port`.
fn service_manifest(
    handle: &WorkloadHandle,
    namespace: &str,
    target_port: u16,
    node_port: u16,
) -> Value {
    json!({
        "apiVersion": "v1",
        "kind": "Service",
        "metadata": {
            "name": handle.as_str(),
            "namespace": namespace,
            "labels": {
                MANAGED_BY_LABEL: MANAGED_BY_VALUE,
                STACK_ID_LABEL: handle.as_str(),
            },
        },
        "spec": {
            "type": "NodePort",
            "selector": { STACK_ID_LABEL: handle.as_str() },
            "ports": [{
                "protocol": "TCP",
                "port": target_port,
                "targetPort": target_port,
                "nodePort": node_port,
            }],
        },
    })
}

fn classify_pod(pod: &PodObject) -> WorkloadStatus {
    let Some(status) = &pod.status else {
        return WorkloadStatus::Pending;
    };

    match status.phase.as_deref() {
        Some("Failed") | Some("Succeeded") => WorkloadStatus::Dead,
        Some("Running") => {
            let ready = status
                .conditions
                .iter()
                .any(|c| c.kind == "Ready" && c.status == "True");
            if ready {
                WorkloadStatus::Ready
            } else {
                WorkloadStatus::Pending
            }
        }
        _ => WorkloadStatus::Pending,
    }
}

fn sum_capacity(nodes: &NodeList, pods: &PodList) -> ClusterCapacity {
    let mut capacity = ClusterCapacity {
        allocatable_cpu_milli: 0,
        allocatable_memory_bytes: 0,
        requested_cpu_milli: 0,
        requested_memory_bytes: 0,
    };

    for node in &nodes.items {
        let allocatable = &node.status.allocatable;
        capacity.allocatable_cpu_milli = capacity
            .allocatable_cpu_milli
            .saturating_add(quantity(allocatable.get("cpu"), parse_cpu_milli));
        capacity.allocatable_memory_bytes = capacity
            .allocatable_memory_bytes
            .saturating_add(quantity(allocatable.get("memory"), parse_bytes));
    }

    for container in pods.items.iter().flat_map(|p| &p.spec.containers) {
        let requests = &container.resources.requests;
        capacity.requested_cpu_milli = capacity
            .requested_cpu_milli
            .saturating_add(quantity(requests.get("cpu"), parse_cpu_milli));
        capacity.requested_memory_bytes = capacity
            .requested_memory_bytes
            .saturating_add(quantity(requests.get("memory"), parse_bytes));
    }

    capacity
}

/// Unparseable quantities count as zero rather than failing the probe.
fn quantity(value: Option<&String>, parse: fn(&str) -> Result<i64, String>) -> i64 {
    match value {
        Some(raw) => parse(raw).unwrap_or_else(|e| {
            warn!(quantity = %raw, error = %e, "Ignoring unparseable resource quantity");
            0
        }),
        None => 0,
    }
}
