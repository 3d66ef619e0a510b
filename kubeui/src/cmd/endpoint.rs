//! The `endpoint` subcommand.

use kubeui_common::{kubernetes::ApiClient, prelude::*, resolver::resolve_endpoint};
use structopt::StructOpt;

use super::{ConnectOpt, ServiceOpt};

/// Options for `endpoint`.
#[derive(Debug, StructOpt)]
pub struct Opt {
    #[structopt(flatten)]
    connect: ConnectOpt,

    #[structopt(flatten)]
    service: ServiceOpt,
}

/// Print out the endpoint URL.
pub async fn run(opt: &Opt) -> Result<()> {
    let client = ApiClient::new(opt.connect.load()?)?;
    let endpoint = resolve_endpoint(&client, &opt.service.endpoints()).await?;
    println!("{}", endpoint.url());
    Ok(())
}
