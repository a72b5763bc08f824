//! Minimal broker binary demonstrating the `amqwire` engine.
//!
//! Accepts connections, negotiates the protocol and discards every message
//! after completing it. Useful as a smoke target for clients.

mod cli;

use std::sync::Arc;

use clap::Parser;
use log::{error, info};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use amqwire::{
    ConnectionDriver,
    DiscardSink,
    DriverConfig,
    EngineConfig,
    SessionRegistry,
    flow::FlowConfig,
};

#[tokio::main]
async fn main() -> std::io::Result<()> {
    // Enable structured logging for the demo binary. Applications embedding
    // the library should install their own subscriber.
    tracing_subscriber::fmt::init();

    let cli = cli::Cli::parse();
    let mut config = EngineConfig::default();
    config.limits.max_frame_size = cli.max_frame_size;
    if cli.max_session_rate > 0 {
        config.flow = Some(FlowConfig {
            rate: cli.max_session_rate,
        });
    }

    let registry = Arc::new(SessionRegistry::default());
    let sink = Arc::new(DiscardSink);
    let shutdown = CancellationToken::new();

    let listener = TcpListener::bind(&cli.listen).await?;
    info!("listening on {}", cli.listen);
    loop {
        let (stream, peer) = listener.accept().await?;
        info!("accepted connection from {peer}");
        let config = config.clone();
        let registry = Arc::clone(&registry);
        let sink = sink.clone();
        let shutdown = shutdown.child_token();
        tokio::spawn(async move {
            match ConnectionDriver::accept(
                stream,
                config,
                DriverConfig::default(),
                sink,
                registry,
                shutdown,
            )
            .await
            {
                Ok(driver) => {
                    if let Err(err) = driver.run().await {
                        error!("{peer}: connection failed: {err}");
                    }
                }
                Err(err) => error!("{peer}: handshake failed: {err}"),
            }
        });
    }
}
