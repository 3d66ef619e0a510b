//! The few Kubernetes API objects we read, with only the fields we use.
//!
//! Kubernetes omits empty lists from its JSON, and some clients send them as
//! `null`, so every list here is an `Option` and is read through an accessor
//! that treats "missing", `null` and `[]` the same way.

use crate::prelude::*;

/// Standard object metadata (heavily trimmed).
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct ObjectMeta {
    /// The object's name.
    #[serde(default)]
    pub name: String,
    /// The object's namespace.
    #[serde(default)]
    pub namespace: Option<String>,
}

/// A `v1/Service`. We only care that it exists.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct Service {
    /// Metadata for this service.
    #[serde(default)]
    pub metadata: ObjectMeta,
}

/// A `v1/Endpoints` object, listing the live backends of a service.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct Endpoints {
    /// Metadata for this object.
    #[serde(default)]
    pub metadata: ObjectMeta,
    /// Groups of addresses which share the same ports.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subsets: Option<Vec<EndpointSubset>>,
}

impl Endpoints {
    /// Our subsets, in the order the API server returned them.
    pub fn subsets(&self) -> &[EndpointSubset] {
        self.subsets.as_deref().unwrap_or_default()
    }
}

/// A set of addresses which all expose the same ports.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EndpointSubset {
    /// Addresses which are ready to receive traffic.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub addresses: Option<Vec<EndpointAddress>>,
    /// Addresses which exist but are not ready. We never use these.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub not_ready_addresses: Option<Vec<EndpointAddress>>,
    /// Ports exposed by every address in this subset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ports: Option<Vec<EndpointPort>>,
}

impl EndpointSubset {
    /// Ready addresses in this subset.
    pub fn addresses(&self) -> &[EndpointAddress] {
        self.addresses.as_deref().unwrap_or_default()
    }

    /// Ports in this subset.
    pub fn ports(&self) -> &[EndpointPort] {
        self.ports.as_deref().unwrap_or_default()
    }

    /// Can we actually connect to anything in this subset?
    pub fn is_usable(&self) -> bool {
        !self.addresses().is_empty() && !self.ports().is_empty()
    }
}

/// A single backend address.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EndpointAddress {
    /// The IP address of the backend.
    pub ip: String,
    /// The hostname of the backend, if it has one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    /// The node hosting the backend.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_name: Option<String>,
}

/// A port exposed by a backend.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct EndpointPort {
    /// The name of the port, which must match the service's port name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// The port number.
    pub port: u16,
    /// `TCP`, `UDP` or `SCTP`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol: Option<String>,
}

/// A `meta/v1/Status`, which the API server returns along with most errors.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct Status {
    /// A human-readable description of the error.
    #[serde(default)]
    pub message: Option<String>,
}

#[test]
fn parse_endpoints_from_api_json() {
    let json = r#"
{
  "kind": "Endpoints",
  "apiVersion": "v1",
  "metadata": { "name": "kubernetes-dashboard", "namespace": "kube-system" },
  "subsets": [
    {
      "notReadyAddresses": [ { "ip": "10.0.0.9" } ],
      "ports": [ { "port": 9090, "protocol": "TCP" } ]
    },
    {
      "addresses": [ { "ip": "10.0.0.5", "nodeName": "node-1" } ],
      "ports": [ { "name": "https", "port": 443, "protocol": "TCP" } ]
    }
  ]
}"#;

    let endpoints: Endpoints = serde_json::from_str(json).expect("parse error");
    assert_eq!(endpoints.metadata.name, "kubernetes-dashboard");
    assert_eq!(endpoints.subsets().len(), 2);
    assert!(!endpoints.subsets()[0].is_usable());
    assert!(endpoints.subsets()[0].addresses().is_empty());
    assert!(endpoints.subsets()[1].is_usable());
    assert_eq!(
        endpoints.subsets()[1].addresses()[0].node_name.as_deref(),
        Some("node-1"),
    );
    assert_eq!(endpoints.subsets()[1].ports()[0].port, 443);
}

#[test]
fn missing_and_null_subsets_are_empty() {
    for json in &[
        r#"{ "metadata": { "name": "ui" } }"#,
        r#"{ "metadata": { "name": "ui" }, "subsets": null }"#,
        r#"{ "metadata": { "name": "ui" }, "subsets": [] }"#,
        r#"{ "metadata": { "name": "ui" }, "subsets": [ { "addresses": null, "ports": null } ] }"#,
    ] {
        let endpoints: Endpoints = serde_json::from_str(json).expect("parse error");
        assert!(endpoints.subsets().iter().all(|ss| !ss.is_usable()));
    }
}
