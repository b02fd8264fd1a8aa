use std::{error::Error, net::SocketAddr};

use clap::Parser;
use log::info;
use surge::stub::StubProxy;

#[derive(Debug, Parser)]
struct Cli {
    /// Listen for new connections at address
    #[arg(default_value = "127.0.0.1:2000")]
    address: SocketAddr,
    /// Connections served at once
    #[arg(long, default_value_t = 256)]
    workers: usize,
}

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();

    let cli = Cli::parse();
    let proxy = StubProxy::bind(cli.address, cli.workers)?;

    let stop = proxy.stop_handle()?;
    ctrlc::set_handler(move || {
        info!("interrupted, stopping");
        stop.stop();
    })?;

    proxy.listen()?;
    Ok(())
}
