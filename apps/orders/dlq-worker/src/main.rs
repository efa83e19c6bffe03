//! Orders Dead-Letter Worker
//!
//! Binary entry point for the order pipeline worker.

#[tokio::main]
async fn main() {
    if let Err(e) = orders_dlq_worker::run().await {
        eprintln!("Fatal error: {:#}", e);
        std::process::exit(1);
    }
}
