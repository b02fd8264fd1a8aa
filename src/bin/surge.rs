use std::{error::Error, process::ExitCode, sync::Arc};

use clap::Parser;
use log::{info, warn};
use surge::{
    Client, Config, ConnectionPool, Orchestrator, TcpConnector, config, protocol::Framing,
};

#[derive(Debug, Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Port for the service
    #[arg(long, default_value_t = config::DEFAULT_PORT)]
    port: u16,
    /// Host on which the service runs
    #[arg(long, default_value = config::DEFAULT_HOST)]
    host: String,
    /// Detect end of response by short reads instead of the document length
    #[arg(long)]
    short_read_framing: bool,
    /// Exit with a failure status if any operation failed
    #[arg(long)]
    strict: bool,
}

fn main() -> Result<ExitCode, Box<dyn Error>> {
    env_logger::init();

    let cli = Cli::parse();
    let mut config = Config::default().with_target(cli.host, cli.port);
    if cli.short_read_framing {
        config.framing = Framing::ShortRead;
    }

    let connector = TcpConnector::from_config(&config)?;
    info!("running against {}", connector.addr());

    let pool = Arc::new(ConnectionPool::open(config.pool.clone(), connector)?);
    let client = Arc::new(Client::new(Arc::clone(&pool), &config));
    let summary = Orchestrator::new(client, &config)?.run();
    pool.shutdown();

    for batch in &summary.batches {
        info!(
            "{}: {}/{} ok in {:?}",
            batch.name,
            batch.succeeded(),
            batch.total(),
            batch.elapsed
        );
    }

    let failed = summary.failed();
    if failed > 0 {
        warn!("{failed} operations failed");
        if cli.strict {
            return Ok(ExitCode::FAILURE);
        }
    }
    Ok(ExitCode::SUCCESS)
}
