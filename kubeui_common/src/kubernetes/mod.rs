//! Tools for talking to Kubernetes.

use async_trait::async_trait;

use crate::prelude::*;

mod api;
mod config;
pub mod kubectl;
pub mod resources;

pub use self::api::ApiClient;
pub use self::config::ConnectionConfig;
pub use self::resources::{Endpoints, Service};

/// The namespace where cluster add-ons like the dashboard live.
pub const SYSTEM_NAMESPACE: &str = "kube-system";

/// A namespaced Kubernetes object name.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct ServiceIdentity {
    /// The namespace containing the object.
    pub namespace: String,
    /// The name of the object.
    pub name: String,
}

impl ServiceIdentity {
    /// Create a new identity.
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        ServiceIdentity {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// The same namespace with a different name.
    pub fn with_name(&self, name: &str) -> Self {
        ServiceIdentity::new(self.namespace.clone(), name)
    }

    /// The path of this service's `proxy` subresource, relative to the API
    /// server root, with a trailing slash.
    pub fn service_proxy_path(&self) -> String {
        format!(
            "api/v1/namespaces/{}/services/{}/proxy/",
            self.namespace, self.name,
        )
    }
}

impl fmt::Display for ServiceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// The read-only queries we need to make against the control plane.
///
/// Both methods return `Ok(None)` when the object does not exist, so callers
/// can tell "not found" apart from "couldn't ask".
#[async_trait]
pub trait ControlPlane: Send + Sync {
    /// Look up a service.
    async fn get_service(&self, id: &ServiceIdentity) -> Result<Option<Service>>;

    /// Look up the endpoints object for a service.
    async fn get_endpoints(&self, id: &ServiceIdentity) -> Result<Option<Endpoints>>;
}

#[test]
fn service_identity_formatting() {
    let id = ServiceIdentity::new(SYSTEM_NAMESPACE, "kubernetes-dashboard");
    assert_eq!(id.to_string(), "kube-system/kubernetes-dashboard");
    assert_eq!(
        id.service_proxy_path(),
        "api/v1/namespaces/kube-system/services/kubernetes-dashboard/proxy/",
    );
    assert_eq!(id.with_name("ui").to_string(), "kube-system/ui");
}
