//! The `proxy` subcommand.

use kubeui_common::{
    prelude::*,
    proxy::{ProxyServer, RequestFilter},
};
use structopt::StructOpt;

use super::{ConnectOpt, ProxyOpt};

/// Options for `proxy`.
#[derive(Debug, StructOpt)]
pub struct Opt {
    #[structopt(flatten)]
    connect: ConnectOpt,

    #[structopt(flatten)]
    proxy: ProxyOpt,

    /// The port to listen on.
    #[structopt(long = "port", short = "p", default_value = "8001")]
    port: u16,

    /// Accept requests from any host, and allow `exec` and `attach`. This is
    /// dangerous if anything else can reach our port.
    #[structopt(long = "disable-filter")]
    disable_filter: bool,
}

/// Run our proxy in the foreground.
pub async fn run(opt: &Opt) -> Result<()> {
    let mut proxy = ProxyServer::new(
        &opt.proxy.api_prefix,
        &opt.proxy.static_prefix,
        opt.proxy.www.clone(),
        opt.connect.load()?,
    )?;
    if opt.disable_filter {
        warn!("request filtering is disabled");
    } else {
        proxy = proxy.with_filter(RequestFilter::local_only()?);
    }

    let listener = proxy.listen(&opt.proxy.address, opt.port)?;
    println!("Starting to serve on {}", listener.address());
    listener.serve().await?;
    Ok(())
}
