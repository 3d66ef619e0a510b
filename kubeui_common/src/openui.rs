//! Opening a cluster service's web UI, such as the Kubernetes dashboard.
//!
//! We look for a backend we can reach directly. If there isn't one, we start
//! a local proxy and open the service through the API server's `proxy`
//! subresource instead.

use tokio::task::JoinHandle;

use crate::browser::UrlOpener;
use crate::kubernetes::SYSTEM_NAMESPACE;
use crate::proxy::ProxyLauncher;
use crate::resolver::resolve_endpoint;
use crate::prelude::*;

/// The name of the dashboard's service and endpoints objects.
pub const DASHBOARD_NAME: &str = "kubernetes-dashboard";

/// What to open, and where to listen if we need a proxy.
#[derive(Clone, Debug)]
pub struct OpenUiOptions {
    /// The service whose UI we want.
    pub service: ServiceIdentity,
    /// The endpoints object listing the service's backends. Normally this has
    /// the same name as the service.
    pub endpoints: ServiceIdentity,
    /// The host to bind our proxy to.
    pub bind_host: String,
    /// The port to bind our proxy to.
    pub bind_port: u16,
    /// Should we try to open a browser?
    pub open_browser: bool,
}

impl Default for OpenUiOptions {
    fn default() -> Self {
        let service = ServiceIdentity::new(SYSTEM_NAMESPACE, DASHBOARD_NAME);
        OpenUiOptions {
            endpoints: service.clone(),
            service,
            bind_host: "localhost".to_owned(),
            bind_port: 8084,
            open_browser: true,
        }
    }
}

/// How we're reaching the UI.
#[derive(Debug)]
pub struct UiSession {
    /// The URL we opened (or would have).
    pub url: String,
    /// Our proxy, if we had to start one.
    proxy: Option<JoinHandle<Result<(), OpenUiError>>>,
}

impl UiSession {
    /// Are we serving a proxy?
    pub fn is_proxied(&self) -> bool {
        self.proxy.is_some()
    }

    /// Wait for our proxy to exit, which normally only happens on error.
    /// Returns immediately if we're not proxying.
    pub async fn wait(self) -> Result<(), OpenUiError> {
        match self.proxy {
            Some(handle) => match handle.await {
                Ok(result) => result,
                Err(err) => Err(OpenUiError::ServeFailure { source: err.into() }),
            },
            None => Ok(()),
        }
    }
}

/// Find the UI for `options.service`, start a proxy if we need one, print
/// what we're doing to `out`, and hand the URL to `opener`.
///
/// Failing to open a browser is not an error, because the user can still
/// copy the URL we printed.
#[tracing::instrument(level = "debug", skip(out, control_plane, launcher, opener))]
pub async fn open_ui<W: Write>(
    out: &mut W,
    control_plane: &dyn ControlPlane,
    launcher: &dyn ProxyLauncher,
    opener: &dyn UrlOpener,
    options: &OpenUiOptions,
) -> Result<UiSession, OpenUiError> {
    // Without a service, there can never be endpoints, and the proxy would
    // have nothing to talk to.
    control_plane
        .get_service(&options.service)
        .await
        .map_err(OpenUiError::ControlPlane)?
        .ok_or_else(|| OpenUiError::ServiceNotRegistered {
            service: options.service.clone(),
        })?;

    let session = match resolve_endpoint(control_plane, &options.endpoints).await {
        Ok(endpoint) => UiSession {
            url: endpoint.url(),
            proxy: None,
        },
        Err(err) if err.triggers_proxy_fallback() => {
            debug!("falling back to proxy: {}", err);
            report(
                out,
                format_args!(
                    "Couldn't find any UI service endpoints in {}: {}\n",
                    options.endpoints.namespace, err,
                ),
            );
            let bound = launcher.launch(&options.bind_host, options.bind_port)?;
            report(out, format_args!("Starting to serve on {}\n", bound.address));
            let url = bound.service_proxy_url(&options.service);
            UiSession {
                url,
                proxy: Some(tokio::spawn(bound.serve)),
            }
        }
        Err(err) => return Err(err),
    };

    report(out, format_args!("{}\n", session.url));
    if options.open_browser {
        report(
            out,
            format_args!("Accessing {} via default browser\n", session.url),
        );
        if let Err(err) = opener.open(&session.url) {
            warn!("could not open browser: {}", err);
            report(out, format_args!("Could not open a browser: {}\n", err));
        }
    }
    Ok(session)
}

/// Write a status message. Our output is informational, so a closed pipe
/// shouldn't stop us from serving.
fn report<W: Write>(out: &mut W, args: fmt::Arguments<'_>) {
    if let Err(err) = out.write_fmt(args).and_then(|()| out.flush()) {
        warn!("could not write status message: {}", err);
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use futures::future::{self, FutureExt};
    use std::{
        collections::HashMap,
        sync::{
            atomic::{AtomicUsize, Ordering},
            Mutex,
        },
    };

    use super::*;
    use crate::kubernetes::{Endpoints, Service};
    use crate::proxy::BoundProxy;

    /// An in-memory control plane.
    #[derive(Default)]
    struct FakeControlPlane {
        services: HashMap<ServiceIdentity, Service>,
        endpoints: HashMap<ServiceIdentity, Endpoints>,
        endpoint_lookups: AtomicUsize,
        broken: bool,
    }

    impl FakeControlPlane {
        fn with_dashboard(endpoints: Option<serde_json::Value>) -> Self {
            let id = OpenUiOptions::default().service;
            let mut fake = FakeControlPlane::default();
            fake.services.insert(id.clone(), Service::default());
            if let Some(json) = endpoints {
                fake.endpoints
                    .insert(id, serde_json::from_value(json).expect("bad endpoints"));
            }
            fake
        }
    }

    #[async_trait]
    impl ControlPlane for FakeControlPlane {
        async fn get_service(&self, id: &ServiceIdentity) -> Result<Option<Service>> {
            Ok(self.services.get(id).cloned())
        }

        async fn get_endpoints(&self, id: &ServiceIdentity) -> Result<Option<Endpoints>> {
            self.endpoint_lookups.fetch_add(1, Ordering::SeqCst);
            if self.broken {
                return Err(format_err!("connection refused"));
            }
            Ok(self.endpoints.get(id).cloned())
        }
    }

    /// Records binds, and serves forever without touching the network.
    #[derive(Default)]
    struct FakeLauncher {
        binds: Mutex<Vec<(String, u16)>>,
        port_taken: bool,
    }

    impl ProxyLauncher for FakeLauncher {
        fn launch(&self, host: &str, port: u16) -> Result<BoundProxy, OpenUiError> {
            if self.port_taken {
                return Err(OpenUiError::BindFailure {
                    address: format!("{}:{}", host, port),
                    source: std::io::Error::new(std::io::ErrorKind::AddrInUse, "in use"),
                });
            }
            self.binds.lock().unwrap().push((host.to_owned(), port));
            Ok(BoundProxy {
                address: format!("{}:{}", host, port),
                api_prefix: "/".to_owned(),
                serve: future::pending().boxed(),
            })
        }
    }

    /// Remembers what it was asked to open.
    #[derive(Default)]
    struct FakeOpener {
        opened: Mutex<Vec<String>>,
        unsupported: bool,
    }

    impl UrlOpener for FakeOpener {
        fn open(&self, url: &str) -> Result<(), OpenUiError> {
            if self.unsupported {
                return Err(OpenUiError::UnsupportedPlatform {
                    os: "plan9".to_owned(),
                });
            }
            self.opened.lock().unwrap().push(url.to_owned());
            Ok(())
        }
    }

    async fn run(
        control_plane: &FakeControlPlane,
        launcher: &FakeLauncher,
        opener: &FakeOpener,
    ) -> (Result<UiSession, OpenUiError>, String) {
        let mut out = vec![];
        let result = open_ui(
            &mut out,
            control_plane,
            launcher,
            opener,
            &OpenUiOptions::default(),
        )
        .await;
        (result, String::from_utf8(out).unwrap())
    }

    #[tokio::test]
    async fn usable_endpoint_is_opened_directly() {
        let control_plane = FakeControlPlane::with_dashboard(Some(serde_json::json!({
            "subsets": [ { "addresses": [ { "ip": "10.0.0.5" } ], "ports": [ { "port": 443 } ] } ]
        })));
        let launcher = FakeLauncher::default();
        let opener = FakeOpener::default();

        let (result, out) = run(&control_plane, &launcher, &opener).await;
        let session = result.expect("open_ui failed");
        assert_eq!(session.url, "http://10.0.0.5:443/");
        assert!(!session.is_proxied());
        assert!(launcher.binds.lock().unwrap().is_empty());
        assert_eq!(*opener.opened.lock().unwrap(), vec!["http://10.0.0.5:443/"]);
        assert!(out.contains("Accessing http://10.0.0.5:443/ via default browser"));
        session.wait().await.expect("nothing to wait for");
    }

    #[tokio::test]
    async fn empty_subsets_fall_back_to_proxy() {
        let control_plane = FakeControlPlane::with_dashboard(Some(serde_json::json!({
            "subsets": [ { "addresses": [], "ports": [ { "port": 80 } ] } ]
        })));
        let launcher = FakeLauncher::default();
        let opener = FakeOpener::default();

        let (result, out) = run(&control_plane, &launcher, &opener).await;
        let session = result.expect("open_ui failed");
        assert!(session.is_proxied());
        assert_eq!(
            *launcher.binds.lock().unwrap(),
            vec![("localhost".to_owned(), 8084)],
        );
        assert!(out.contains("Starting to serve on localhost:8084\n"));
        let url = "http://localhost:8084/api/v1/namespaces/kube-system/services/kubernetes-dashboard/proxy/";
        assert_eq!(session.url, url);
        assert_eq!(*opener.opened.lock().unwrap(), vec![url]);
    }

    #[tokio::test]
    async fn missing_endpoints_fall_back_to_proxy() {
        let control_plane = FakeControlPlane::with_dashboard(None);
        let launcher = FakeLauncher::default();
        let opener = FakeOpener::default();

        let (result, out) = run(&control_plane, &launcher, &opener).await;
        assert!(result.expect("open_ui failed").is_proxied());
        assert!(out.starts_with("Couldn't find any UI service endpoints in kube-system"));
    }

    #[tokio::test]
    async fn unregistered_service_is_fatal() {
        let control_plane = FakeControlPlane::default();
        let launcher = FakeLauncher::default();
        let opener = FakeOpener::default();

        let (result, out) = run(&control_plane, &launcher, &opener).await;
        match result {
            Err(OpenUiError::ServiceNotRegistered { service }) => {
                assert_eq!(service.to_string(), "kube-system/kubernetes-dashboard");
            }
            other => panic!("unexpected result: {:?}", other),
        }
        assert_eq!(control_plane.endpoint_lookups.load(Ordering::SeqCst), 0);
        assert!(launcher.binds.lock().unwrap().is_empty());
        assert!(opener.opened.lock().unwrap().is_empty());
        assert!(out.is_empty());
    }

    #[tokio::test]
    async fn bind_failures_are_fatal() {
        let control_plane = FakeControlPlane::with_dashboard(None);
        let launcher = FakeLauncher {
            port_taken: true,
            ..FakeLauncher::default()
        };
        let opener = FakeOpener::default();

        let (result, out) = run(&control_plane, &launcher, &opener).await;
        assert!(matches!(result, Err(OpenUiError::BindFailure { .. })));
        assert!(!out.contains("Starting to serve"));
        assert!(opener.opened.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn control_plane_errors_do_not_trigger_proxy() {
        let mut control_plane = FakeControlPlane::with_dashboard(None);
        control_plane.broken = true;
        let launcher = FakeLauncher::default();
        let opener = FakeOpener::default();

        let (result, _) = run(&control_plane, &launcher, &opener).await;
        assert!(matches!(result, Err(OpenUiError::ControlPlane(_))));
        assert!(launcher.binds.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn unsupported_platform_still_reports_url() {
        let control_plane = FakeControlPlane::with_dashboard(Some(serde_json::json!({
            "subsets": [ { "addresses": [ { "ip": "10.0.0.5" } ], "ports": [ { "port": 443 } ] } ]
        })));
        let launcher = FakeLauncher::default();
        let opener = FakeOpener {
            unsupported: true,
            ..FakeOpener::default()
        };

        let (result, out) = run(&control_plane, &launcher, &opener).await;
        assert_eq!(result.expect("open_ui failed").url, "http://10.0.0.5:443/");
        assert!(out.contains("http://10.0.0.5:443/\n"));
        assert!(out.contains("Could not open a browser"));
    }

    #[tokio::test]
    async fn resolver_distinguishes_missing_from_empty() {
        let empty = FakeControlPlane::with_dashboard(Some(serde_json::json!({ "subsets": [] })));
        let missing = FakeControlPlane::with_dashboard(None);
        let id = OpenUiOptions::default().endpoints;

        assert!(matches!(
            resolve_endpoint(&empty, &id).await,
            Err(OpenUiError::NoUsableEndpoint { .. })
        ));
        assert!(matches!(
            resolve_endpoint(&missing, &id).await,
            Err(OpenUiError::EndpointsNotRegistered { .. })
        ));
    }
}
