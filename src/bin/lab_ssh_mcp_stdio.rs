#![deny(warnings)]
#![deny(clippy::unwrap_used)]

use std::sync::Arc;

use dotenv::dotenv;
use lab_ssh_mcp::mcp::LabTools;
use lab_ssh_mcp::mcp::client::RusshConnector;
use lab_ssh_mcp::mcp::lab::LabConfig;
use lab_ssh_mcp::mcp::pool::TransportPool;
use lab_ssh_mcp::mcp::registry::SessionRegistry;
use lab_ssh_mcp::mcp::session::SessionSettings;
use poem_mcpserver::McpServer;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv().ok();

    // stdout carries the protocol
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("info".parse().expect("valid directive")),
        )
        .init();

    let lab = Arc::new(LabConfig::load_from_env()?);
    let pool = Arc::new(TransportPool::new(Arc::new(RusshConnector::from_env())));
    let registry = SessionRegistry::new(pool, SessionSettings::from_env());

    let result =
        poem_mcpserver::stdio::stdio(McpServer::new().tools(LabTools::new(registry.clone(), lab)))
            .await;
    registry.close_all().await;
    result?;
    Ok(())
}
