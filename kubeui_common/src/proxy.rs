//! A local HTTP proxy to the Kubernetes API server, much like `kubectl
//! proxy`. Browsers can't present our client certificate or token, so we
//! accept plain HTTP on a local port and forward it upstream with our own
//! credentials attached.
//!
//! Starting the proxy happens in two steps, so callers can learn our address
//! before we start serving:
//!
//! 1. [`ProxyServer::listen`] binds the socket and returns a
//!    [`ProxyListener`]. The kernel will queue connections from here on.
//! 2. [`ProxyListener::serve`] accepts and handles connections until
//!    something goes fatally wrong.

use axum::{
    body::{Bytes, StreamBody},
    extract::{DefaultBodyLimit, State},
    http::{header, HeaderMap, HeaderName, Method, StatusCode, Uri},
    response::{IntoResponse, Response},
    Router, Server,
};
use futures::future::{BoxFuture, FutureExt};
use regex::Regex;
use reqwest::Client;
use std::{io, net::SocketAddr, net::TcpListener, sync::Arc};
use tower_http::{services::ServeDir, trace::TraceLayer};
use url::Url;

use crate::kubernetes::ConnectionConfig;
use crate::prelude::*;

/// Headers which only apply to a single connection, and which must not be
/// forwarded.
const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Copy the headers which should be passed on to the next hop. This drops
/// the standard hop-by-hop headers, plus any that `Connection` names.
fn end_to_end_headers(headers: &HeaderMap) -> HeaderMap {
    let listed = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect::<Vec<_>>();

    let mut kept = HeaderMap::new();
    for (name, value) in headers {
        if !HOP_BY_HOP_HEADERS.contains(&name.as_str()) && !listed.contains(name) {
            kept.append(name.clone(), value.clone());
        }
    }
    kept
}

/// Make sure `prefix` starts and ends with `/`.
fn normalize_prefix(prefix: &str) -> String {
    let trimmed = prefix.trim_matches('/');
    if trimmed.is_empty() {
        "/".to_owned()
    } else {
        format!("/{}/", trimmed)
    }
}

/// Decides which incoming requests we're willing to forward. This mirrors
/// `kubectl proxy`'s `--accept-hosts`, `--accept-paths`, `--reject-paths` and
/// `--reject-methods`.
#[derive(Clone, Debug)]
pub struct RequestFilter {
    accept_hosts: Vec<Regex>,
    accept_paths: Vec<Regex>,
    reject_paths: Vec<Regex>,
    reject_methods: Vec<Regex>,
}

/// Compile a list of patterns.
fn compile_all(patterns: &[&str]) -> Result<Vec<Regex>> {
    patterns
        .iter()
        .map(|p| Regex::new(p).with_context(|| format!("invalid filter pattern {:?}", p)))
        .collect()
}

impl RequestFilter {
    /// Build a filter from lists of regular expressions.
    pub fn new(
        accept_hosts: &[&str],
        accept_paths: &[&str],
        reject_paths: &[&str],
        reject_methods: &[&str],
    ) -> Result<RequestFilter> {
        Ok(RequestFilter {
            accept_hosts: compile_all(accept_hosts)?,
            accept_paths: compile_all(accept_paths)?,
            reject_paths: compile_all(reject_paths)?,
            reject_methods: compile_all(reject_methods)?,
        })
    }

    /// Only local browsers, and no attaching to or exec'ing into pods.
    pub fn local_only() -> Result<RequestFilter> {
        RequestFilter::new(
            &[r"^localhost$", r"^127\.0\.0\.1$", r"^\[::1\]$"],
            &[r"^.*"],
            &[r"^/api/.*/pods/.*/exec", r"^/api/.*/pods/.*/attach"],
            &[r"^$"],
        )
    }

    /// Should we forward this request?
    pub fn accepts(&self, method: &Method, path: &str, host: &str) -> bool {
        let host = strip_port(host);
        let matches = |patterns: &[Regex], s: &str| patterns.iter().any(|re| re.is_match(s));
        matches(&self.accept_hosts, host)
            && matches(&self.accept_paths, path)
            && !matches(&self.reject_paths, path)
            && !matches(&self.reject_methods, method.as_str())
    }
}

/// Remove any `:port` from a `Host` header value, keeping IPv6 brackets.
fn strip_port(host: &str) -> &str {
    if host.starts_with('[') {
        match host.find(']') {
            Some(end) => &host[..=end],
            None => host,
        }
    } else {
        match host.rfind(':') {
            Some(colon) if host[colon + 1..].chars().all(|c| c.is_ascii_digit()) => {
                &host[..colon]
            }
            _ => host,
        }
    }
}

/// Shared, immutable state used by our request handler.
#[derive(Debug)]
struct Upstream {
    config: ConnectionConfig,
    client: Client,
    api_prefix: String,
    filter: Option<RequestFilter>,
}

impl Upstream {
    /// Map a local request URI to an API server URL, or `None` if it isn't
    /// under our API prefix.
    fn upstream_url(&self, uri: &Uri) -> Option<String> {
        let path = uri.path();
        let rest = match path.strip_prefix(self.api_prefix.as_str()) {
            Some(rest) => rest,
            // Allow `/prefix` as well as `/prefix/`.
            None if format!("{}/", path) == self.api_prefix => "",
            None => return None,
        };
        let mut url = self.config.server.as_str().trim_end_matches('/').to_owned();
        url.push('/');
        url.push_str(rest);
        if let Some(query) = uri.query() {
            url.push('?');
            url.push_str(query);
        }
        Some(url)
    }

    /// Send a request to the API server and convert the reply into a
    /// streaming response.
    async fn send(
        &self,
        method: Method,
        url: &str,
        headers: &HeaderMap,
        body: Bytes,
    ) -> Result<Response> {
        let mut request = self.client.request(method, url).body(body);
        for (name, value) in &end_to_end_headers(headers) {
            // We supply our own credentials, and never pass the browser's on.
            if *name == header::HOST || *name == header::AUTHORIZATION {
                continue;
            }
            request = request.header(name, value);
        }
        let resp = self
            .config
            .authenticate(request)
            .send()
            .await
            .with_context(|| format!("error forwarding request to {}", url))?;

        let status = resp.status();
        let response_headers = end_to_end_headers(resp.headers());
        Ok((status, response_headers, StreamBody::new(resp.bytes_stream())).into_response())
    }
}

/// Handle any request which isn't for a static file.
async fn forward(
    State(upstream): State<Arc<Upstream>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if let Some(filter) = &upstream.filter {
        let host = headers
            .get(header::HOST)
            .and_then(|h| h.to_str().ok())
            .unwrap_or_default();
        if !filter.accepts(&method, uri.path(), host) {
            warn!("rejecting {} {} for host {:?}", method, uri, host);
            return (StatusCode::FORBIDDEN, "Forbidden\n").into_response();
        }
    }

    let url = match upstream.upstream_url(&uri) {
        Some(url) => url,
        None => return (StatusCode::NOT_FOUND, "404 page not found\n").into_response(),
    };
    trace!("forwarding {} {} to {}", method, uri, url);
    match upstream.send(method, &url, &headers, body).await {
        Ok(resp) => resp,
        Err(err) => {
            error!("proxy error: {:#}", err);
            (StatusCode::BAD_GATEWAY, format!("{:#}\n", err)).into_response()
        }
    }
}

/// A proxy which has not yet been bound to a port.
#[derive(Clone, Debug)]
pub struct ProxyServer {
    upstream: Arc<Upstream>,
    static_prefix: String,
    www_dir: Option<PathBuf>,
}

impl ProxyServer {
    /// Create a proxy which forwards requests under `api_prefix` to the API
    /// server described by `config`. If `www_dir` is specified, we serve files
    /// from it under `static_prefix`.
    pub fn new(
        api_prefix: &str,
        static_prefix: &str,
        www_dir: Option<PathBuf>,
        config: ConnectionConfig,
    ) -> Result<ProxyServer> {
        let static_prefix = normalize_prefix(static_prefix);
        if www_dir.is_some() && static_prefix == "/" {
            return Err(format_err!("cannot serve static files from the root path"));
        }
        let client = config.http_client()?;
        Ok(ProxyServer {
            upstream: Arc::new(Upstream {
                config,
                client,
                api_prefix: normalize_prefix(api_prefix),
                filter: None,
            }),
            static_prefix,
            www_dir,
        })
    }

    /// Only forward requests accepted by `filter`.
    pub fn with_filter(self, filter: RequestFilter) -> ProxyServer {
        let upstream = Upstream {
            config: self.upstream.config.clone(),
            client: self.upstream.client.clone(),
            api_prefix: self.upstream.api_prefix.clone(),
            filter: Some(filter),
        };
        ProxyServer {
            upstream: Arc::new(upstream),
            ..self
        }
    }

    /// The normalized prefix under which we forward requests.
    pub fn api_prefix(&self) -> &str {
        &self.upstream.api_prefix
    }

    /// Build our request router.
    fn router(&self) -> Router {
        let mut router = Router::new();
        if let Some(www_dir) = &self.www_dir {
            router = router.nest_service(
                self.static_prefix.trim_end_matches('/'),
                ServeDir::new(www_dir),
            );
        }
        // `kubectl apply` can send large objects, so don't cap request bodies.
        router
            .fallback(forward)
            .layer(DefaultBodyLimit::disable())
            .layer(TraceLayer::new_for_http())
            .with_state(self.upstream.clone())
    }

    /// Bind our listening socket, but don't start serving yet.
    ///
    /// The port is used exactly as given, and a port that's already taken is
    /// an error rather than a reason to try another one.
    pub fn listen(&self, host: &str, port: u16) -> Result<ProxyListener, OpenUiError> {
        let address = format!("{}:{}", host, port);
        let bind_failure = |source: io::Error| OpenUiError::BindFailure {
            address: address.clone(),
            source,
        };
        let listener = TcpListener::bind((host, port)).map_err(bind_failure)?;
        let local_addr = listener.local_addr().map_err(bind_failure)?;
        debug!("bound {} to {}", address, local_addr);

        Ok(ProxyListener {
            binding: ProxyBinding {
                local_addr,
                // Report the name we were asked to use, with the actual port.
                address: format!("{}:{}", host, local_addr.port()),
                upstream: self.upstream.config.server.clone(),
            },
            listener,
            router: self.router(),
        })
    }
}

/// Describes a bound proxy.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ProxyBinding {
    /// The socket address we actually bound.
    pub local_addr: SocketAddr,
    /// The requested host and the bound port, for showing to people.
    pub address: String,
    /// The API server we forward to.
    pub upstream: Url,
}

/// A proxy with a bound socket, ready to serve.
#[derive(Debug)]
pub struct ProxyListener {
    binding: ProxyBinding,
    listener: TcpListener,
    router: Router,
}

/// Wrap a low-level server error.
fn serve_failure<E>(err: E) -> OpenUiError
where
    E: std::error::Error + Send + Sync + 'static,
{
    OpenUiError::ServeFailure { source: err.into() }
}

impl ProxyListener {
    /// Information about our socket.
    pub fn binding(&self) -> &ProxyBinding {
        &self.binding
    }

    /// The address to show to people, like `localhost:8084`.
    pub fn address(&self) -> &str {
        &self.binding.address
    }

    /// Serve requests until we hit a fatal error. There is no graceful
    /// shutdown; drop the future or exit the process to stop.
    pub async fn serve(self) -> Result<(), OpenUiError> {
        let ProxyListener {
            binding,
            listener,
            router,
        } = self;
        info!("proxying {} to {}", binding.address, binding.upstream);
        let server = Server::from_tcp(listener).map_err(serve_failure)?;
        server
            .serve(router.into_make_service())
            .await
            .map_err(serve_failure)
    }
}

/// A bound proxy, as seen by code which only needs to report its address and
/// run it.
pub struct BoundProxy {
    /// The address to show to people, like `localhost:8084`.
    pub address: String,
    /// The prefix under which the proxy forwards API requests.
    pub api_prefix: String,
    /// Serves until a fatal error.
    pub serve: BoxFuture<'static, Result<(), OpenUiError>>,
}

impl BoundProxy {
    /// The local URL for a service's `proxy` subresource.
    pub fn service_proxy_url(&self, service: &ServiceIdentity) -> String {
        format!(
            "http://{}{}{}",
            self.address,
            self.api_prefix,
            service.service_proxy_path(),
        )
    }
}

impl fmt::Debug for BoundProxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BoundProxy")
            .field("address", &self.address)
            .field("api_prefix", &self.api_prefix)
            .finish()
    }
}

/// Something which can bind a proxy on request.
pub trait ProxyLauncher: Send + Sync {
    /// Bind a proxy to `host` and `port`.
    fn launch(&self, host: &str, port: u16) -> Result<BoundProxy, OpenUiError>;
}

impl ProxyLauncher for ProxyServer {
    fn launch(&self, host: &str, port: u16) -> Result<BoundProxy, OpenUiError> {
        let listener = self.listen(host, port)?;
        Ok(BoundProxy {
            address: listener.address().to_owned(),
            api_prefix: self.api_prefix().to_owned(),
            serve: listener.serve().boxed(),
        })
    }
}

#[cfg(test)]
fn test_server(upstream: &str) -> ProxyServer {
    let mut config = ConnectionConfig::anonymous(Url::parse(upstream).unwrap());
    config.token = Some("proxy-token".to_owned());
    ProxyServer::new("/", "/static/", None, config).expect("could not build proxy")
}

#[test]
fn prefixes_are_normalized() {
    assert_eq!(normalize_prefix(""), "/");
    assert_eq!(normalize_prefix("/"), "/");
    assert_eq!(normalize_prefix("api"), "/api/");
    assert_eq!(normalize_prefix("/static/"), "/static/");
}

#[test]
fn connection_header_names_more_hop_by_hop_headers() {
    let mut headers = HeaderMap::new();
    headers.insert(header::CONNECTION, "keep-alive, X-Trace-Hop".parse().unwrap());
    headers.insert("x-trace-hop", "1".parse().unwrap());
    headers.insert(header::TRANSFER_ENCODING, "chunked".parse().unwrap());
    headers.append("x-custom", "a".parse().unwrap());
    headers.append("x-custom", "b".parse().unwrap());

    let kept = end_to_end_headers(&headers);
    assert!(kept.get(header::CONNECTION).is_none());
    assert!(kept.get("x-trace-hop").is_none());
    assert!(kept.get(header::TRANSFER_ENCODING).is_none());
    assert_eq!(kept.get_all("x-custom").iter().count(), 2);
}

#[test]
fn upstream_urls_strip_the_api_prefix() {
    let config = ConnectionConfig::anonymous(Url::parse("https://k8s.example.com/base/").unwrap());
    let proxy = ProxyServer::new("/k8s", "/static/", None, config).unwrap();
    let upstream = &proxy.upstream;
    let url = |s: &str| upstream.upstream_url(&s.parse::<Uri>().unwrap());
    assert_eq!(
        url("/k8s/api/v1/namespaces?limit=1").as_deref(),
        Some("https://k8s.example.com/base/api/v1/namespaces?limit=1"),
    );
    assert_eq!(url("/k8s").as_deref(), Some("https://k8s.example.com/base/"));
    assert_eq!(url("/other/api"), None);
}

#[test]
fn filter_matches_kubectl_defaults() {
    let filter = RequestFilter::local_only().unwrap();
    assert!(filter.accepts(&Method::GET, "/api/v1/namespaces", "localhost:8001"));
    assert!(filter.accepts(&Method::GET, "/", "127.0.0.1"));
    assert!(filter.accepts(&Method::GET, "/", "[::1]:8001"));
    assert!(!filter.accepts(&Method::GET, "/", "evil.example.com:8001"));
    assert!(!filter.accepts(
        &Method::POST,
        "/api/v1/namespaces/default/pods/web-1/exec",
        "localhost:8001",
    ));
}

#[test]
fn static_files_need_a_prefix() {
    let config = ConnectionConfig::anonymous(Url::parse("http://127.0.0.1:1/").unwrap());
    assert!(ProxyServer::new("/", "/", Some(PathBuf::from(".")), config).is_err());
}

#[tokio::test]
async fn bind_reports_address_before_serving() {
    let proxy = test_server("http://127.0.0.1:1/");
    let listener = proxy.listen("127.0.0.1", 0).expect("bind failed");
    let port = listener.binding().local_addr.port();
    assert_ne!(port, 0);
    assert_eq!(listener.address(), format!("127.0.0.1:{}", port));

    // The socket is already accepting connections, even though nothing is
    // serving them yet.
    tokio::net::TcpStream::connect(listener.binding().local_addr)
        .await
        .expect("could not connect to bound socket");
}

#[tokio::test]
async fn binding_an_occupied_port_fails() {
    let taken = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = taken.local_addr().unwrap().port();

    let proxy = test_server("http://127.0.0.1:1/");
    match proxy.launch("127.0.0.1", port) {
        Err(OpenUiError::BindFailure { address, .. }) => {
            assert_eq!(address, format!("127.0.0.1:{}", port));
        }
        Err(other) => panic!("unexpected error: {}", other),
        Ok(bound) => panic!("unexpectedly bound {}", bound.address),
    }
}

#[tokio::test]
async fn forwards_requests_with_our_credentials() {
    use httpmock::prelude::*;

    let api = MockServer::start_async().await;
    let mock = api
        .mock_async(|when, then| {
            when.method(GET)
                .path("/api/v1/namespaces/kube-system/services/kubernetes-dashboard/proxy/")
                .query_param("tab", "1")
                .header("authorization", "Bearer proxy-token")
                .header("x-custom", "yes");
            then.status(200)
                .header("content-type", "text/html")
                .body("<html>dashboard</html>");
        })
        .await;

    let proxy = test_server(&api.base_url());
    let bound = proxy.launch("127.0.0.1", 0).expect("bind failed");
    let url = format!(
        "{}?tab=1",
        bound.service_proxy_url(&ServiceIdentity::new("kube-system", "kubernetes-dashboard"))
    );
    tokio::spawn(bound.serve);

    let resp = reqwest::Client::new()
        .get(&url)
        .header("authorization", "Bearer browser-token")
        .header("x-custom", "yes")
        .send()
        .await
        .expect("request failed");
    assert_eq!(resp.status(), 200);
    assert_eq!(resp.headers()["content-type"], "text/html");
    assert_eq!(resp.text().await.unwrap(), "<html>dashboard</html>");
    mock.assert_async().await;
}

#[tokio::test]
async fn unreachable_upstream_is_a_bad_gateway() {
    // Grab a free port and release it, so nothing is listening there.
    let dead = TcpListener::bind("127.0.0.1:0").unwrap();
    let dead_url = format!("http://{}/", dead.local_addr().unwrap());
    drop(dead);

    let proxy = test_server(&dead_url);
    let bound = proxy.launch("127.0.0.1", 0).expect("bind failed");
    let url = format!("http://{}/version", bound.address);
    tokio::spawn(bound.serve);

    let resp = reqwest::get(&url).await.expect("request failed");
    assert_eq!(resp.status(), 502);
}

#[tokio::test]
async fn filtered_proxy_rejects_foreign_hosts() {
    let proxy = test_server("http://127.0.0.1:1/")
        .with_filter(RequestFilter::local_only().unwrap());
    let bound = proxy.launch("127.0.0.1", 0).expect("bind failed");
    let url = format!("http://{}/api", bound.address);
    tokio::spawn(bound.serve);

    let resp = reqwest::Client::new()
        .get(&url)
        .header("host", "evil.example.com")
        .send()
        .await
        .expect("request failed");
    assert_eq!(resp.status(), 403);
}

#[tokio::test]
async fn large_request_bodies_are_forwarded() {
    use httpmock::prelude::*;

    let object = "x".repeat(3 * 1024 * 1024);
    let api = MockServer::start_async().await;
    let mock = api
        .mock_async(|when, then| {
            when.method(POST)
                .path("/api/v1/namespaces/default/configmaps")
                .body(object.clone());
            then.status(201).body("created");
        })
        .await;

    let proxy = test_server(&api.base_url());
    let bound = proxy.launch("127.0.0.1", 0).expect("bind failed");
    let url = format!("http://{}/api/v1/namespaces/default/configmaps", bound.address);
    tokio::spawn(bound.serve);

    let resp = reqwest::Client::new()
        .post(&url)
        .body(object)
        .send()
        .await
        .expect("request failed");
    assert_eq!(resp.status(), 201);
    mock.assert_async().await;
}

#[tokio::test]
async fn static_files_are_served_beside_the_api() {
    use httpmock::prelude::*;

    let www = tempfile::tempdir().expect("could not create temp dir");
    std::fs::write(www.path().join("app.js"), "hello").unwrap();

    let api = MockServer::start_async().await;
    let mock = api
        .mock_async(|when, then| {
            when.method(GET).path("/api/v1/namespaces");
            then.status(200).body("namespaces");
        })
        .await;

    let mut config = ConnectionConfig::anonymous(Url::parse(&api.base_url()).unwrap());
    config.token = Some("proxy-token".to_owned());
    let proxy = ProxyServer::new("/", "/static/", Some(www.path().to_owned()), config)
        .expect("could not build proxy");
    let bound = proxy.launch("127.0.0.1", 0).expect("bind failed");
    let base = format!("http://{}", bound.address);
    tokio::spawn(bound.serve);

    let resp = reqwest::get(&format!("{}/static/app.js", base))
        .await
        .expect("request failed");
    assert_eq!(resp.status(), 200);
    assert_eq!(resp.text().await.unwrap(), "hello");

    let resp = reqwest::get(&format!("{}/api/v1/namespaces", base))
        .await
        .expect("request failed");
    assert_eq!(resp.status(), 200);
    assert_eq!(resp.text().await.unwrap(), "namespaces");
    mock.assert_async().await;
}
