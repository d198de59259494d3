//! Gateway server demo
//!
//! Runs a synthgate gateway with filesystem storage and the DashScope
//! client, reading overrides from the environment (`DASHSCOPE_API_KEY`,
//! `SYNTHGATE_BIND_ADDRESS`, ...). An optional first argument names a JSON
//! config file.
//!
//! After starting, you can:
//! - View Swagger UI at http://localhost:3000/swagger-ui
//! - Upload a photo via POST http://localhost:3000/api/upload/simple
//! - Submit a job via POST http://localhost:3000/api/create-task

use std::sync::Arc;
use synthgate::api::start_api_server;
use synthgate::{Config, Gateway, run_with_shutdown};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing (optional)
    // Uncomment if you add tracing-subscriber to your dependencies:
    // tracing_subscriber::fmt::init();

    let mut config = match std::env::args().nth(1) {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };
    config.apply_env()?;
    config.validate()?;

    if config.synthesis.api_key.is_none() {
        eprintln!("warning: DASHSCOPE_API_KEY is not set, create-task will fail");
    }

    let address = config.server.bind_address;
    let gateway = Arc::new(Gateway::new(config)?);
    gateway.start_janitor().await;

    println!("Starting synthgate gateway on http://{address}");
    println!("Swagger UI: http://{address}/swagger-ui");
    println!();
    println!("Example commands:");
    println!("  # Upload a reference photo");
    println!("  curl -F file=@photo.png http://{address}/api/upload/simple");
    println!();
    println!("  # Submit a job");
    println!("  curl -X POST http://{address}/api/create-task \\");
    println!("    -H 'Content-Type: application/json' \\");
    println!(
        "    -d '{{\"imageUrl\": \"https://...\", \"videoUrl\": \"https://...\", \"model\": \"std\"}}'"
    );
    println!();
    println!("  # Poll it");
    println!("  curl 'http://{address}/api/query-task?taskId=<id>'");
    println!();
    println!("Press Ctrl+C to stop");

    let server = tokio::spawn(start_api_server(gateway.clone()));
    run_with_shutdown(&gateway).await?;
    server.await??;

    println!("Gateway stopped");
    Ok(())
}
