//! Where is the API server, and how do we prove who we are?

use reqwest::{Certificate, Client, Identity, RequestBuilder};
use std::{env, fs};
use url::Url;

use super::kubectl::{base64_encoded_data, kubectl_parse_json};
use crate::prelude::*;

/// Where a pod's service account credentials are mounted.
const SERVICE_ACCOUNT_DIR: &str = "/var/run/secrets/kubernetes.io/serviceaccount";

/// Everything we need to talk to an API server.
#[derive(Clone)]
pub struct ConnectionConfig {
    /// The base URL of the API server.
    pub server: Url,
    /// How this configuration was obtained.
    pub via: ConnectVia,
    /// Extra PEM-encoded CA certificates to trust.
    pub certificate_authority: Option<Vec<u8>>,
    /// A PEM-encoded client certificate followed by its private key.
    pub client_identity: Option<Vec<u8>>,
    /// A bearer token.
    pub token: Option<String>,
    /// HTTP basic credentials.
    pub basic_auth: Option<(String, String)>,
    /// Skip verifying the API server's certificate.
    pub insecure_skip_tls_verify: bool,
}

// Hand-written so we never log credentials.
impl fmt::Debug for ConnectionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionConfig")
            .field("server", &self.server.as_str())
            .field("via", &self.via)
            .field("certificate_authority", &self.certificate_authority.is_some())
            .field("client_identity", &self.client_identity.is_some())
            .field("token", &self.token.is_some())
            .field("basic_auth", &self.basic_auth.is_some())
            .field("insecure_skip_tls_verify", &self.insecure_skip_tls_verify)
            .finish()
    }
}

impl ConnectionConfig {
    /// A configuration with no credentials at all, which is mostly useful for
    /// tests and for API servers behind an existing `kubectl proxy`.
    pub fn anonymous(server: Url) -> ConnectionConfig {
        ConnectionConfig {
            server,
            via: ConnectVia::Kubeconfig,
            certificate_authority: None,
            client_identity: None,
            token: None,
            basic_auth: None,
            insecure_skip_tls_verify: false,
        }
    }

    /// Load our configuration.
    ///
    /// `kubeconfig` and `context` are passed through to `kubectl`, and are
    /// ignored when running in the cluster.
    #[tracing::instrument(level = "debug")]
    pub fn load(
        via: ConnectVia,
        kubeconfig: Option<&Path>,
        context: Option<&str>,
    ) -> Result<ConnectionConfig> {
        // Check the environment first, so it can be overridden for testing
        // outside of a full Kubernetes setup.
        if let Ok(server) = env::var("KUBEUI_API_SERVER") {
            let server = Url::parse(&server)
                .with_context(|| format!("could not parse KUBEUI_API_SERVER {:?}", server))?;
            let mut config = ConnectionConfig::anonymous(server);
            config.via = via;
            config.token = env::var("KUBEUI_API_TOKEN").ok();
            return Ok(config);
        }

        match via {
            ConnectVia::Kubeconfig => Self::from_kubectl(kubeconfig, context),
            ConnectVia::Cluster => Self::in_cluster(),
        }
    }

    /// Ask `kubectl` to resolve the current context into a single
    /// self-contained cluster and user.
    fn from_kubectl(
        kubeconfig: Option<&Path>,
        context: Option<&str>,
    ) -> Result<ConnectionConfig> {
        let kubeconfig = kubeconfig.map(|p| p.display().to_string());
        let mut args = vec!["config", "view", "--raw", "--minify", "--flatten", "-o", "json"];
        if let Some(kubeconfig) = &kubeconfig {
            args.extend_from_slice(&["--kubeconfig", kubeconfig.as_str()]);
        }
        if let Some(context) = context {
            args.extend_from_slice(&["--context", context]);
        }
        let kubeconfig: Kubeconfig = kubectl_parse_json(&args)?;
        kubeconfig.into_connection_config()
    }

    /// Use the service account mounted into our pod.
    fn in_cluster() -> Result<ConnectionConfig> {
        let host = env::var("KUBERNETES_SERVICE_HOST")
            .context("couldn't get KUBERNETES_SERVICE_HOST")?;
        let port = env::var("KUBERNETES_SERVICE_PORT")
            .context("couldn't get KUBERNETES_SERVICE_PORT")?;
        // IPv6 service hosts need brackets.
        let host = if host.contains(':') {
            format!("[{}]", host)
        } else {
            host
        };
        let server = Url::parse(&format!("https://{}:{}/", host, port))
            .context("could not build in-cluster API server URL")?;

        let token_path = format!("{}/token", SERVICE_ACCOUNT_DIR);
        let token = fs::read_to_string(&token_path)
            .with_context(|| format!("could not read {}", token_path))?;
        let ca_path = format!("{}/ca.crt", SERVICE_ACCOUNT_DIR);
        let ca = fs::read(&ca_path).with_context(|| format!("could not read {}", ca_path))?;

        Ok(ConnectionConfig {
            server,
            via: ConnectVia::Cluster,
            certificate_authority: Some(ca),
            client_identity: None,
            token: Some(token.trim().to_owned()),
            basic_auth: None,
            insecure_skip_tls_verify: false,
        })
    }

    /// Build an HTTP client which trusts our CA and presents our client
    /// certificate, if any.
    pub fn http_client(&self) -> Result<Client> {
        let mut builder = Client::builder().use_rustls_tls();
        if let Some(ca) = &self.certificate_authority {
            let cert = Certificate::from_pem(ca)
                .context("could not parse certificate authority")?;
            builder = builder.add_root_certificate(cert);
        }
        if let Some(pem) = &self.client_identity {
            let identity = Identity::from_pem(pem)
                .context("could not parse client certificate and key")?;
            builder = builder.identity(identity);
        }
        if self.insecure_skip_tls_verify {
            warn!("not verifying the TLS certificate of {}", self.server);
            builder = builder.danger_accept_invalid_certs(true);
        }
        builder.build().context("could not build HTTP client")
    }

    /// Attach our credentials to an outgoing request.
    pub fn authenticate(&self, request: RequestBuilder) -> RequestBuilder {
        if let Some(token) = &self.token {
            request.bearer_auth(token)
        } else if let Some((username, password)) = &self.basic_auth {
            request.basic_auth(username, Some(password))
        } else {
            request
        }
    }
}

/// The output of `kubectl config view --minify --flatten -o json`.
#[derive(Debug, Deserialize)]
struct Kubeconfig {
    #[serde(default)]
    clusters: Vec<NamedCluster>,
    #[serde(default)]
    users: Vec<NamedUser>,
}

#[derive(Debug, Deserialize)]
struct NamedCluster {
    name: String,
    cluster: Cluster,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct Cluster {
    server: String,
    #[serde(default, with = "base64_encoded_data")]
    certificate_authority_data: Option<Vec<u8>>,
    #[serde(default)]
    insecure_skip_tls_verify: bool,
}

#[derive(Debug, Deserialize)]
struct NamedUser {
    name: String,
    #[serde(default)]
    user: User,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct User {
    #[serde(default, with = "base64_encoded_data")]
    client_certificate_data: Option<Vec<u8>>,
    #[serde(default, with = "base64_encoded_data")]
    client_key_data: Option<Vec<u8>>,
    #[serde(default)]
    token: Option<String>,
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    password: Option<String>,
    #[serde(default)]
    exec: Option<serde_json::Value>,
    #[serde(default)]
    auth_provider: Option<serde_json::Value>,
}

impl Kubeconfig {
    /// Convert a minified kubeconfig into a connection config.
    fn into_connection_config(self) -> Result<ConnectionConfig> {
        let cluster = self
            .clusters
            .into_iter()
            .next()
            .ok_or_else(|| format_err!("kubeconfig has no cluster for the current context"))?;
        let server = Url::parse(&cluster.cluster.server).with_context(|| {
            format!(
                "could not parse server {:?} for cluster {}",
                cluster.cluster.server, cluster.name
            )
        })?;

        let mut config = ConnectionConfig::anonymous(server);
        config.certificate_authority = cluster.cluster.certificate_authority_data;
        config.insecure_skip_tls_verify = cluster.cluster.insecure_skip_tls_verify;

        if let Some(named_user) = self.users.into_iter().next() {
            let user = named_user.user;
            if user.exec.is_some() || user.auth_provider.is_some() {
                warn!(
                    "user {} uses a credential plugin, which kubeui does not support",
                    named_user.name,
                );
            }
            config.client_identity = match (user.client_certificate_data, user.client_key_data) {
                (Some(mut cert), Some(key)) => {
                    cert.push(b'\n');
                    cert.extend_from_slice(&key);
                    Some(cert)
                }
                (None, None) => None,
                _ => {
                    return Err(format_err!(
                        "user {} has a client certificate or key, but not both",
                        named_user.name,
                    ))
                }
            };
            config.token = user.token;
            if let (Some(username), Some(password)) = (user.username, user.password) {
                config.basic_auth = Some((username, password));
            }
        }
        Ok(config)
    }
}

#[test]
fn parse_minified_kubeconfig() {
    let json = r#"
{
  "kind": "Config",
  "apiVersion": "v1",
  "clusters": [
    {
      "name": "minikube",
      "cluster": {
        "server": "https://192.168.49.2:8443",
        "certificate-authority-data": "Q0EgUEVN"
      }
    }
  ],
  "users": [
    {
      "name": "minikube",
      "user": {
        "client-certificate-data": "Q0VSVA==",
        "client-key-data": "S0VZ"
      }
    }
  ],
  "contexts": [
    { "name": "minikube", "context": { "cluster": "minikube", "user": "minikube" } }
  ],
  "current-context": "minikube"
}"#;

    let kubeconfig: Kubeconfig = serde_json::from_str(json).expect("parse error");
    let config = kubeconfig.into_connection_config().expect("conversion error");
    assert_eq!(config.server.as_str(), "https://192.168.49.2:8443/");
    assert_eq!(config.certificate_authority.as_deref(), Some(&b"CA PEM"[..]));
    assert_eq!(config.client_identity.as_deref(), Some(&b"CERT\nKEY"[..]));
    assert_eq!(config.token, None);
    assert!(!config.insecure_skip_tls_verify);
}

#[test]
fn token_users_and_missing_clusters() {
    let json = r#"
{
  "clusters": [
    { "name": "prod", "cluster": { "server": "https://k8s.example.com/k8s/clusters/c-1", "insecure-skip-tls-verify": true } }
  ],
  "users": [ { "name": "admin", "user": { "token": "s3cret" } } ]
}"#;
    let kubeconfig: Kubeconfig = serde_json::from_str(json).expect("parse error");
    let config = kubeconfig.into_connection_config().expect("conversion error");
    assert_eq!(config.token.as_deref(), Some("s3cret"));
    assert!(config.insecure_skip_tls_verify);
    assert!(!format!("{:?}", config).contains("s3cret"));

    let empty: Kubeconfig = serde_json::from_str("{}").expect("parse error");
    assert!(empty.into_connection_config().is_err());
}
