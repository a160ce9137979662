use anyhow::{Context, Result, bail};
use dotio::frame::{Frame, FrameReader, FrameWriter, PayloadBuilder, RESPONSE_ID};
use dotio::{Envelope, WireStatus};
use tokio::net::TcpStream;
use tracing_subscriber::EnvFilter;

/// Usage: `dotio-client [verb] [path] [body]`
///
/// Sends one request and prints any frames the server returns before the status.
#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let address =
        std::env::var("DOTIO_ADDRESS").unwrap_or_else(|_| "127.0.0.1:25010".to_string());
    let mut args = std::env::args().skip(1);
    let verb = args.next().unwrap_or_else(|| "post".to_string());
    let path = args.next().unwrap_or_else(|| "/ping".to_string());
    let body = args.next();

    let stream = TcpStream::connect(&address)
        .await
        .with_context(|| format!("failed to connect to {address}"))?;
    let (read_half, write_half) = stream.into_split();
    let mut reader = FrameReader::new(read_half);
    let mut writer = FrameWriter::new(write_half);

    tracing::info!(address = %address, verb = %verb, path = %path, "Sending request");

    writer.write_frame(&Frame::sentinel()).await?;
    writer
        .write_frame(&Envelope::new(&verb, &path).to_frame())
        .await?;
    if let Some(body) = &body {
        let payload = PayloadBuilder::new().put_string(body).finish();
        writer.write_frame(&Frame::new(1, payload)).await?;
    }

    // Handlers may send data frames of their own; the status frame is always
    // the last one.
    loop {
        let frame = reader.read_frame().await?;
        if frame.id == RESPONSE_ID {
            let status = WireStatus::from_code(frame.reader().read_i32()?);
            tracing::info!(status = %status, code = status.to_code(), "Response");
            if status != WireStatus::Ok {
                bail!("request failed: {status}");
            }
            return Ok(());
        }
        tracing::info!(id = frame.id, bytes = frame.payload.len(), "Frame from server");
    }
}
