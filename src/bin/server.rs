use anyhow::Result;
use dotio::frame::PayloadBuilder;
use dotio::server::{DEFAULT_ADDRESS, DEFAULT_NAME, Handler};
use dotio::{Application, ApplicationSettings, HandlerError, Inbound, Outbound};
use std::time::Instant;
use tracing_subscriber::EnvFilter;

async fn ping(_inbound: Inbound, _outbound: Outbound) -> Result<(), HandlerError> {
    Ok(())
}

/// Reads one frame from the device and sends its payload straight back.
async fn echo(inbound: Inbound, outbound: Outbound) -> Result<(), HandlerError> {
    let frame = inbound.read_frame().await?;
    outbound.send(frame.payload).await?;
    Ok(())
}

/// Replies with the server's uptime, e.g. `"42s"`.
fn uptime(started: Instant) -> impl Handler {
    move |_inbound: Inbound, outbound: Outbound| {
        let uptime = format!("{}s", started.elapsed().as_secs());
        async move {
            outbound
                .send(PayloadBuilder::new().put_string(&uptime).finish())
                .await?;
            Ok::<(), HandlerError>(())
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let name = std::env::var("DOTIO_NAME").unwrap_or_else(|_| DEFAULT_NAME.to_string());
    let address = std::env::var("DOTIO_ADDRESS").unwrap_or_else(|_| DEFAULT_ADDRESS.to_string());

    let settings = ApplicationSettings::builder()
        .name(name)
        .address(address)
        .build();

    let mut app = Application::bind(settings).await?;
    app.register_post("/ping", ping)?;
    app.register_put("/echo", echo)?;
    app.register_post("/uptime", uptime(Instant::now()))?;

    let shutdown = app.shutdown_handle();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl-C");
            return;
        }
        tracing::info!("Ctrl-C received, shutting down");
        shutdown.trigger();
    });

    app.listen().await?;
    Ok(())
}
