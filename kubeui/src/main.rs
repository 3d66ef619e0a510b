use kubeui_common::{
    prelude::*, quick_main, tokio, tracing_support::initialize_tracing,
};
use structopt::StructOpt;

mod cmd;

/// Command-line options, parsed using `structopt`.
#[derive(Debug, StructOpt)]
#[structopt(about = "A tool for opening the web UIs of services on Kubernetes.")]
enum Opt {
    /// Open a service's UI in a browser, proxying to it if we can't reach it
    /// directly.
    #[structopt(name = "open")]
    Open(cmd::open::Opt),

    /// Print the URL of a directly reachable endpoint for a service.
    #[structopt(name = "endpoint")]
    Endpoint(cmd::endpoint::Opt),

    /// Run a local proxy to the Kubernetes API server.
    #[structopt(name = "proxy")]
    Proxy(cmd::proxy::Opt),
}

quick_main!(run);

fn run() -> Result<()> {
    initialize_tracing();
    openssl_probe::init_ssl_cert_env_vars();
    let opt = Opt::from_args();
    debug!("Args: {:?}", opt);

    let runtime = tokio::runtime::Runtime::new().context("could not start tokio runtime")?;
    runtime.block_on(async {
        match &opt {
            Opt::Open(opt) => cmd::open::run(opt).await,
            Opt::Endpoint(opt) => cmd::endpoint::run(opt).await,
            Opt::Proxy(opt) => cmd::proxy::run(opt).await,
        }
    })
}
