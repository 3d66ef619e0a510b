//! Finding a directly reachable endpoint for a service.

use crate::kubernetes::Endpoints;
use crate::prelude::*;

/// A single backend address and port, chosen from a service's endpoints.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ResolvedEndpoint {
    /// The backend's IP address, as reported by Kubernetes.
    pub address: String,
    /// The backend's port.
    pub port: u16,
}

impl ResolvedEndpoint {
    /// The URL a browser should open to reach this endpoint.
    pub fn url(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for ResolvedEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Endpoint IPs may be IPv6, which need brackets in a URL.
        if self.address.contains(':') {
            write!(f, "http://[{}]:{}/", self.address, self.port)
        } else {
            write!(f, "http://{}:{}/", self.address, self.port)
        }
    }
}

/// Choose an endpoint: the first address and first port of the first subset
/// that has both, in the order the API server listed them.
///
/// We don't yet distinguish between addresses reachable from outside the
/// cluster and internal-only ones.
pub fn select_endpoint(endpoints: &Endpoints) -> Option<ResolvedEndpoint> {
    endpoints
        .subsets()
        .iter()
        .find(|ss| ss.is_usable())
        .map(|ss| ResolvedEndpoint {
            address: ss.addresses()[0].ip.clone(),
            port: ss.ports()[0].port,
        })
}

/// Look up the endpoints named by `endpoints_id` and pick one.
#[tracing::instrument(level = "debug", skip(control_plane))]
pub async fn resolve_endpoint(
    control_plane: &dyn ControlPlane,
    endpoints_id: &ServiceIdentity,
) -> Result<ResolvedEndpoint, OpenUiError> {
    let endpoints = control_plane
        .get_endpoints(endpoints_id)
        .await
        .map_err(OpenUiError::ControlPlane)?
        .ok_or_else(|| OpenUiError::EndpointsNotRegistered {
            endpoints: endpoints_id.clone(),
        })?;
    trace!("endpoints: {:?}", endpoints);

    let endpoint =
        select_endpoint(&endpoints).ok_or_else(|| OpenUiError::NoUsableEndpoint {
            endpoints: endpoints_id.clone(),
        })?;
    debug!("resolved {} to {}", endpoints_id, endpoint);
    Ok(endpoint)
}

#[cfg(test)]
fn parse_endpoints(json: serde_json::Value) -> Endpoints {
    serde_json::from_value(json).expect("parse error")
}

#[test]
fn selects_first_usable_subset_in_order() {
    let endpoints = parse_endpoints(serde_json::json!({
        "metadata": { "name": "ui" },
        "subsets": [
            { "addresses": [], "ports": [ { "port": 80 } ] },
            { "addresses": [ { "ip": "10.0.0.1" } ] },
            {
                "addresses": [ { "ip": "10.0.0.5" }, { "ip": "10.0.0.6" } ],
                "ports": [ { "port": 443 }, { "port": 8443 } ]
            },
            { "addresses": [ { "ip": "10.0.0.7" } ], "ports": [ { "port": 80 } ] }
        ]
    }));
    let endpoint = select_endpoint(&endpoints).expect("no endpoint");
    assert_eq!(endpoint.address, "10.0.0.5");
    assert_eq!(endpoint.port, 443);
    assert_eq!(endpoint.url(), "http://10.0.0.5:443/");
}

#[test]
fn not_ready_addresses_are_ignored() {
    let endpoints = parse_endpoints(serde_json::json!({
        "subsets": [
            { "notReadyAddresses": [ { "ip": "10.0.0.9" } ], "ports": [ { "port": 80 } ] }
        ]
    }));
    assert_eq!(select_endpoint(&endpoints), None);
}

#[test]
fn ipv6_endpoints_are_bracketed() {
    let endpoint = ResolvedEndpoint {
        address: "fd00::5".to_owned(),
        port: 8443,
    };
    assert_eq!(endpoint.url(), "http://[fd00::5]:8443/");
}
