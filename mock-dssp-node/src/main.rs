//! Runs the mock gateway on a serial port.
//!
//! ## Usage
//!
//! ```bash
//! # Serve nodes 4 and 16 on a virtual serial pair
//! socat -d -d pty,raw,echo=0 pty,raw,echo=0
//! cargo run -p mock-dssp-node -- --port /dev/pts/3 --node-id 4 --node-id 16
//! ```

use clap::Parser;
use tokio_serial::SerialPortBuilderExt;
use tracing::{error, info};

use mock_dssp_node::{serve, test_node, MockBus};

#[derive(Parser, Debug)]
#[command(author, version, about = "Simulated DSSP CANopen gateway", long_about = None)]
struct Args {
    /// Serial port to serve on
    #[arg(short, long)]
    port: String,

    #[arg(short, long, default_value_t = 115_200)]
    baud: u32,

    /// Node ids behind the gateway, may be repeated
    #[arg(short, long = "node-id", default_values_t = [4u8], value_parser = clap::value_parser!(u8).range(1..=127))]
    node_id: Vec<u8>,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    info!("Mock DSSP gateway starting on {} @ {} baud", args.port, args.baud);

    let mut bus = MockBus::new();
    for &node_id in &args.node_id {
        let node = test_node(node_id);
        info!("Node {}: {} objects", node_id, node.object_dict().len());
        node.object_dict().log_summary();
        bus.add_node(node);
    }

    let port = match tokio_serial::new(&args.port, args.baud).open_native_async() {
        Ok(port) => port,
        Err(e) => {
            error!("Failed to open {}: {}", args.port, e);
            std::process::exit(1);
        }
    };

    if let Err(e) = serve(port, bus).await {
        error!("Link error: {}", e);
        std::process::exit(1);
    }
}
