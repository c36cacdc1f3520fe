use anyhow::{Context, Result};
use chrono::Utc;
use futures::{SinkExt, Stream, StreamExt};
use tokio::time::timeout;
use tokio_tungstenite::{
    connect_async,
    tungstenite::{self, Message},
};
use tracing::{info, warn};

use crate::{
    cli::ProbeArgs,
    message::{Envelope, LocationRecord},
};

/// Sends a single location update and prints the first frame the hub sends back.
pub async fn run(args: ProbeArgs) -> Result<()> {
    let url = format!(
        "{}?username={}",
        args.server,
        urlencoding::encode(&args.username)
    );
    let (mut socket, _) = connect_async(url.as_str())
        .await
        .with_context(|| format!("failed to connect to {url}"))?;
    info!("connected to {}", url);

    let frame = Envelope::LocationUpdate(LocationRecord {
        username: args.username.clone(),
        latitude: args.lat,
        longitude: args.lon,
        timestamp: Utc::now().timestamp_millis(),
    })
    .encode()?;
    socket
        .send(Message::Text(frame.clone()))
        .await
        .context("failed to send location update")?;
    println!("sent: {frame}");

    match timeout(args.reply_timeout(), next_text(&mut socket)).await {
        Ok(Ok(Some(reply))) => println!("reply: {reply}"),
        Ok(Ok(None)) => warn!("server closed the connection without replying"),
        Ok(Err(err)) => warn!(error = ?err, "failed to read reply"),
        Err(_) => warn!("no reply within {:?}", args.reply_timeout()),
    }

    let _ = socket.close(None).await;
    Ok(())
}

async fn next_text<S>(socket: &mut S) -> Result<Option<String>, tungstenite::Error>
where
    S: Stream<Item = Result<Message, tungstenite::Error>> + Unpin,
{
    while let Some(message) = socket.next().await {
        match message? {
            Message::Text(text) => return Ok(Some(text)),
            Message::Close(_) => return Ok(None),
            _ => continue,
        }
    }
    Ok(None)
}
