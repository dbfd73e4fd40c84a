#![deny(warnings)]
#![deny(clippy::unwrap_used)]

use std::sync::Arc;
use std::time::Duration;

use dotenv::dotenv;
use lab_ssh_mcp::mcp::LabTools;
use lab_ssh_mcp::mcp::client::RusshConnector;
use lab_ssh_mcp::mcp::lab::LabConfig;
use lab_ssh_mcp::mcp::pool::TransportPool;
use lab_ssh_mcp::mcp::registry::SessionRegistry;
use lab_ssh_mcp::mcp::session::SessionSettings;
use poem::{EndpointExt, Route, Server, listener::TcpListener, middleware::Tracing};
use poem_mcpserver::{McpServer, streamable_http};
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("info".parse().expect("valid directive")),
        )
        .init();

    let lab = match LabConfig::load_from_env() {
        Ok(lab) => Arc::new(lab),
        Err(e) => {
            error!("Cannot start without a lab description: {}", e);
            return Err(e.into());
        }
    };

    let pool = Arc::new(TransportPool::new(Arc::new(RusshConnector::from_env())));
    let registry = SessionRegistry::new(pool, SessionSettings::from_env());
    let tools = LabTools::new(registry.clone(), lab.clone());

    let mcp_port: u16 = std::env::var("MCP_PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(8000);
    let mcp_addr = format!("0.0.0.0:{}", mcp_port);
    info!("Starting MCP server on {}", mcp_addr);

    let app = Route::new()
        .at(
            "/",
            streamable_http::endpoint(move |_| McpServer::new().tools(tools.clone())),
        )
        .with(Tracing);

    info!(
        "Lab '{}' ready, target {}@{}:{}",
        lab.lab.name, lab.target.ssh_user, lab.target.host, lab.target.ssh_port
    );

    Server::new(TcpListener::bind(mcp_addr))
        .name("Lab SSH MCP Server")
        .run_with_graceful_shutdown(
            app,
            async {
                let _ = tokio::signal::ctrl_c().await;
                info!("Shutdown requested");
            },
            Some(Duration::from_secs(5)),
        )
        .await?;

    let closed = registry.close_all().await;
    info!("Closed {} session(s) on shutdown", closed);
    Ok(())
}
