use clap::Parser;
use std::sync::Arc;
use std::time::Duration;

use stream_node::demo::{DEMO_TOPOLOGY, demo_catalog};
use stream_node::domain::node::ServiceRequest;
use stream_node::domain::topology::TopologyConfigOverrides;
use stream_node::domain::utils::id::TopologyId;
use stream_node::{logger, start_node};

#[derive(Parser, Debug)]
#[command(name = "stream-node", about = "Runs one node of a stream processing cluster")]
struct Cli {
    /// Node configuration JSON file.
    #[arg(short, long)]
    config: String,

    /// Submit the bundled counting topology once the node is operational.
    #[arg(long)]
    demo: bool,

    /// Log file name below `logs/`.
    #[arg(long)]
    log_file: Option<String>,
}

fn main() {
    let cli = Cli::parse();
    logger::init(cli.log_file.as_deref());

    if let Err(e) = run(&cli) {
        log::error!("Node failed: {}", e);
        std::process::exit(1);
    }
}

fn run(cli: &Cli) -> anyhow::Result<()> {
    let catalog = Arc::new(demo_catalog()?);
    let node = start_node(&cli.config, catalog)?;

    if !node.await_operational(Duration::from_secs(30)) {
        log::warn!("Node {} is not operational yet, continuing anyway", node.descriptor());
    }

    if cli.demo {
        let request = ServiceRequest::RunTopology {
            topology_id: TopologyId::new(format!("{}-{}", DEMO_TOPOLOGY, node.descriptor().service_port)),
            catalog_name: DEMO_TOPOLOGY.to_string(),
            overrides: TopologyConfigOverrides::default(),
        };
        let response = node.call(request, Duration::from_secs(60));
        log::info!("Demo topology: {:?}", response);
    }

    let runtime = tokio::runtime::Builder::new_current_thread().enable_all().build()?;
    runtime.block_on(tokio::signal::ctrl_c())?;
    drop(runtime);

    log::info!("Interrupted, shutting down node {}", node.descriptor());
    node.shutdown();
    Ok(())
}
