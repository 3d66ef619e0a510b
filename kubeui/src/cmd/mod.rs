//! Our subcommands, and the options they share.

use kubeui_common::{kubernetes::ConnectionConfig, prelude::*};
use structopt::StructOpt;

pub mod endpoint;
pub mod open;
pub mod proxy;

/// How to find and authenticate to the API server.
#[derive(Debug, StructOpt)]
pub struct ConnectOpt {
    /// The kubeconfig file to use, instead of kubectl's default.
    #[structopt(long = "kubeconfig", parse(from_os_str))]
    kubeconfig: Option<PathBuf>,

    /// The kubeconfig context to use, instead of the current one.
    #[structopt(long = "context")]
    context: Option<String>,

    /// Use the service account of the pod we're running in.
    #[structopt(long = "in-cluster")]
    in_cluster: bool,
}

impl ConnectOpt {
    /// How should we connect?
    fn via(&self) -> ConnectVia {
        if self.in_cluster {
            ConnectVia::Cluster
        } else {
            ConnectVia::Kubeconfig
        }
    }

    /// Load our connection configuration.
    pub fn load(&self) -> Result<ConnectionConfig> {
        ConnectionConfig::load(
            self.via(),
            self.kubeconfig.as_deref(),
            self.context.as_deref(),
        )
    }
}

/// Which service to look at.
#[derive(Debug, StructOpt)]
pub struct ServiceOpt {
    /// The namespace containing the service.
    #[structopt(long = "namespace", short = "n", default_value = "kube-system")]
    namespace: String,

    /// The name of the service.
    #[structopt(long = "service", default_value = "kubernetes-dashboard")]
    service: String,

    /// The name of the service's endpoints object, if it differs from the
    /// service name.
    #[structopt(long = "endpoints")]
    endpoints: Option<String>,
}

impl ServiceOpt {
    /// The service we want.
    pub fn service(&self) -> ServiceIdentity {
        ServiceIdentity::new(self.namespace.clone(), self.service.clone())
    }

    /// The endpoints object for our service.
    pub fn endpoints(&self) -> ServiceIdentity {
        let service = self.service();
        match &self.endpoints {
            Some(endpoints) => service.with_name(endpoints),
            None => service,
        }
    }
}

/// Where and how to run a local proxy.
#[derive(Debug, StructOpt)]
pub struct ProxyOpt {
    /// The prefix under which to forward requests to the API server.
    #[structopt(long = "api-prefix", default_value = "/")]
    pub api_prefix: String,

    /// The prefix under which to serve static files.
    #[structopt(long = "static-prefix", default_value = "/static/")]
    pub static_prefix: String,

    /// A directory of static files to serve under `--static-prefix`.
    #[structopt(long = "www", parse(from_os_str))]
    pub www: Option<PathBuf>,

    /// The host name or IP address to listen on.
    #[structopt(long = "address", default_value = "localhost")]
    pub address: String,
}
