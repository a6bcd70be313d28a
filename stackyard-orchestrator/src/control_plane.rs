//! Control-plane contract and its adapters.
//!
//! The orchestrator only depends on [`ControlPlane`]; which adapter backs it
//! is decided once at startup and injected.

use std::collections::BTreeMap;
use std::time::Duration;

use serde_json::{json, Value};

use stackyard_core::config::ControlPlaneSettings;
use stackyard_core::UnitId;

use crate::error::ControlPlaneError;

/// Result of a namespace creation request. Both answers mean the namespace exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NamespaceCreated {
    Created,
    AlreadyExists,
}

/// Result of a namespace deletion request. Teardown itself is asynchronous.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NamespaceDeletion {
    Accepted,
    NotFound,
}

/// A single-container workload deployed into a stack's namespace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkloadSpec {
    pub name: String,
    pub image: String,
    pub port: u16,
    pub env: BTreeMap<String, String>,
}

/// Random datastore password for one stack.
pub fn generate_password() -> String {
    UnitId::new().0.simple().to_string()
}

impl WorkloadSpec {
    /// The backing datastore every stack gets, without credentials.
    pub fn datastore(image: impl Into<String>, port: u16) -> Self {
        let env = [("POSTGRES_DB", "stack"), ("POSTGRES_USER", "stack")]
            .into_iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Self {
            name: "datastore".to_string(),
            image: image.into(),
            port,
            env,
        }
    }

    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.env
            .insert("POSTGRES_PASSWORD".to_string(), password.into());
        self
    }

    fn to_manifest(&self, namespace: &str) -> Value {
        let env: Vec<Value> = self
            .env
            .iter()
            .map(|(name, value)| json!({ "name": name, "value": value }))
            .collect();
        json!({
            "apiVersion": "apps/v1",
            "kind": "Deployment",
            "metadata": { "name": self.name, "namespace": namespace },
            "spec": {
                "replicas": 1,
                "selector": { "matchLabels": { "app": self.name } },
                "template": {
                    "metadata": { "labels": { "app": self.name } },
                    "spec": {
                        "containers": [{
                            "name": self.name,
                            "image": self.image,
                            "ports": [{ "containerPort": self.port }],
                            "env": env,
                        }]
                    }
                }
            }
        })
    }
}

/// Namespace and workload CRUD against the compute cluster.
///
/// Calls are blocking; the orchestrator runs them on its bounded worker pool.
pub trait ControlPlane: Send + Sync {
    fn create_namespace(&self, name: &str) -> Result<NamespaceCreated, ControlPlaneError>;

    fn delete_namespace(&self, name: &str) -> Result<NamespaceDeletion, ControlPlaneError>;

    fn create_workload(&self, namespace: &str, spec: &WorkloadSpec) -> Result<(), ControlPlaneError>;
}

// ---------------------------------------------------------------------------
// HTTP adapter
// ---------------------------------------------------------------------------

/// Kubernetes-style REST client.
pub struct HttpControlPlane {
    base_url: String,
    token: Option<String>,
    agent: ureq::Agent,
}

impl HttpControlPlane {
    pub fn new(base_url: impl Into<String>, token: Option<String>, timeout: Duration) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        let agent = ureq::AgentBuilder::new().timeout(timeout).build();
        Self {
            base_url,
            token,
            agent,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    fn authorize(&self, request: ureq::Request) -> ureq::Request {
        match &self.token {
            Some(token) => request.set("Authorization", &format!("Bearer {token}")),
            None => request,
        }
    }

    fn post(&self, path: &str, body: Value) -> Result<u16, ControlPlaneError> {
        let url = self.url(path);
        let request = self.authorize(self.agent.post(&url));
        status_of(&url, request.send_json(body))
    }

    fn delete(&self, path: &str) -> Result<u16, ControlPlaneError> {
        let url = self.url(path);
        let request = self.authorize(self.agent.delete(&url));
        status_of(&url, request.call())
    }
}

impl ControlPlane for HttpControlPlane {
    fn create_namespace(&self, name: &str) -> Result<NamespaceCreated, ControlPlaneError> {
        let body = json!({
            "apiVersion": "v1",
            "kind": "Namespace",
            "metadata": { "name": name },
        });
        match self.post("/api/v1/namespaces", body) {
            Ok(_) => Ok(NamespaceCreated::Created),
            Err(ControlPlaneError::Status { status: 409, .. }) => Ok(NamespaceCreated::AlreadyExists),
            Err(err) => Err(err),
        }
    }

    fn delete_namespace(&self, name: &str) -> Result<NamespaceDeletion, ControlPlaneError> {
        match self.delete(&format!("/api/v1/namespaces/{name}")) {
            Ok(_) => Ok(NamespaceDeletion::Accepted),
            Err(ControlPlaneError::Status { status: 404, .. }) => Ok(NamespaceDeletion::NotFound),
            Err(err) => Err(err),
        }
    }

    fn create_workload(&self, namespace: &str, spec: &WorkloadSpec) -> Result<(), ControlPlaneError> {
        let path = format!("/apis/apps/v1/namespaces/{namespace}/deployments");
        match self.post(&path, spec.to_manifest(namespace)) {
            Ok(_) | Err(ControlPlaneError::Status { status: 409, .. }) => Ok(()),
            Err(err) => Err(err),
        }
    }
}

fn status_of(
    url: &str,
    result: Result<ureq::Response, ureq::Error>,
) -> Result<u16, ControlPlaneError> {
    match result {
        Ok(response) => Ok(response.status()),
        Err(ureq::Error::Status(status, response)) => Err(ControlPlaneError::Status {
            url: url.to_string(),
            status,
            body: response.into_string().unwrap_or_default(),
        }),
        Err(ureq::Error::Transport(transport)) => Err(ControlPlaneError::Transport {
            url: url.to_string(),
            message: transport.to_string(),
        }),
    }
}

// ---------------------------------------------------------------------------
// No cluster
// ---------------------------------------------------------------------------

/// Stand-in used when no cluster API is configured. Every call fails.
#[derive(Debug, Clone, Copy, Default)]
pub struct UnavailableControlPlane;

impl ControlPlane for UnavailableControlPlane {
    fn create_namespace(&self, _name: &str) -> Result<NamespaceCreated, ControlPlaneError> {
        Err(ControlPlaneError::Unavailable)
    }

    fn delete_namespace(&self, _name: &str) -> Result<NamespaceDeletion, ControlPlaneError> {
        Err(ControlPlaneError::Unavailable)
    }

    fn create_workload(&self, _namespace: &str, _spec: &WorkloadSpec) -> Result<(), ControlPlaneError> {
        Err(ControlPlaneError::Unavailable)
    }
}

/// Build the adapter the settings describe.
pub fn from_settings(settings: &ControlPlaneSettings, timeout: Duration) -> Box<dyn ControlPlane> {
    match &settings.api_url {
        Some(url) => {
            tracing::info!(api_url = %url, "using HTTP control plane");
            Box::new(HttpControlPlane::new(url.clone(), settings.token.clone(), timeout))
        }
        None => {
            tracing::info!("no control plane configured");
            Box::new(UnavailableControlPlane)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn datastore_manifest_targets_namespace() {
        let spec = WorkloadSpec::datastore("postgres:15-alpine", 5432).with_password("pw");
        let manifest = spec.to_manifest("stack-abc");
        assert_eq!(manifest["metadata"]["namespace"], "stack-abc");
        let container = &manifest["spec"]["template"]["spec"]["containers"][0];
        assert_eq!(container["image"], "postgres:15-alpine");
        assert_eq!(container["ports"][0]["containerPort"], 5432);
        assert_eq!(container["env"].as_array().map(Vec::len), Some(3));
    }

    #[test]
    fn generated_passwords_are_fresh_per_stack() {
        let template = WorkloadSpec::datastore("postgres:15-alpine", 5432);
        let first = template.clone().with_password(generate_password());
        let second = template.with_password(generate_password());
        let (a, b) = (&first.env["POSTGRES_PASSWORD"], &second.env["POSTGRES_PASSWORD"]);
        assert_ne!(a, b);
        assert_eq!(a.len(), 32);
        assert_ne!(a, "stack");
    }

    #[test]
    fn unavailable_control_plane_always_errors() {
        let cp = UnavailableControlPlane;
        assert!(matches!(cp.create_namespace("stack-x"), Err(ControlPlaneError::Unavailable)));
        assert!(matches!(cp.delete_namespace("stack-x"), Err(ControlPlaneError::Unavailable)));
    }

    #[test]
    fn unreachable_cluster_is_a_transport_error() {
        // Port 9 (discard) on localhost is expected to refuse connections.
        let cp = HttpControlPlane::new("http://127.0.0.1:9/", None, Duration::from_secs(2));
        let err = cp.create_namespace("stack-x").unwrap_err();
        assert!(matches!(err, ControlPlaneError::Transport { .. }), "got: {err}");
    }
}
