//! The `open` subcommand.

use kubeui_common::{
    browser::system_opener,
    kubernetes::ApiClient,
    openui::{open_ui, OpenUiOptions},
    prelude::*,
    proxy::ProxyServer,
};
use std::io;
use structopt::StructOpt;

use super::{ConnectOpt, ProxyOpt, ServiceOpt};

/// Options for `open`.
#[derive(Debug, StructOpt)]
pub struct Opt {
    #[structopt(flatten)]
    connect: ConnectOpt,

    #[structopt(flatten)]
    service: ServiceOpt,

    #[structopt(flatten)]
    proxy: ProxyOpt,

    /// The port to listen on if we need to start a proxy.
    #[structopt(long = "port", default_value = "8084")]
    port: u16,

    /// Print the URL, but don't try to open a browser.
    #[structopt(long = "no-browser")]
    no_browser: bool,
}

/// Open the UI, and keep serving our proxy if we started one.
pub async fn run(opt: &Opt) -> Result<()> {
    let config = opt.connect.load()?;
    let client = ApiClient::new(config.clone())?;
    let proxy = ProxyServer::new(
        &opt.proxy.api_prefix,
        &opt.proxy.static_prefix,
        opt.proxy.www.clone(),
        config,
    )?;
    let opener = system_opener();
    let options = OpenUiOptions {
        service: opt.service.service(),
        endpoints: opt.service.endpoints(),
        bind_host: opt.proxy.address.clone(),
        bind_port: opt.port,
        open_browser: !opt.no_browser,
    };

    let session = open_ui(&mut io::stdout(), &client, &proxy, opener.as_ref(), &options).await?;
    session.wait().await?;
    Ok(())
}
