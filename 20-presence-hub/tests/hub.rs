use std::{net::SocketAddr, time::Duration};

use anyhow::{Result, anyhow};
use axum::{
    body::{Body, to_bytes},
    http::{Method, Request, StatusCode, header},
};
use futures::{SinkExt, StreamExt};
use presence_hub::{
    config::{HubConfig, SessionConfig},
    hub,
    message::{Envelope, LocationRecord, Notice},
    server::{Server, router},
};
use tokio::{
    net::{TcpListener, TcpStream},
    sync::oneshot,
    task::JoinHandle,
    time::timeout,
};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Message};
use tower::ServiceExt;

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

const WAIT: Duration = Duration::from_secs(1);

struct RunningServer {
    addr: SocketAddr,
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

impl RunningServer {
    async fn stop(self) {
        let _ = self.shutdown.send(());
        let _ = timeout(Duration::from_secs(5), self.task).await;
    }
}

async fn start_server() -> Result<RunningServer> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let server = Server::new(listener, HubConfig::default());
    let addr = server.local_addr()?;

    let (shutdown, shutdown_rx) = oneshot::channel::<()>();
    let task = tokio::spawn(async move {
        let shutdown = async move {
            let _ = shutdown_rx.await;
        };
        let _ = server.run_until(shutdown).await;
    });

    Ok(RunningServer {
        addr,
        shutdown,
        task,
    })
}

async fn join(addr: SocketAddr, username: &str) -> Result<Client> {
    let (client, _) = connect_async(format!("ws://{addr}/ws?username={username}")).await?;
    Ok(client)
}

async fn next_envelope(client: &mut Client) -> Result<Envelope> {
    loop {
        let message = timeout(WAIT, client.next())
            .await?
            .ok_or_else(|| anyhow!("connection ended"))??;
        match message {
            Message::Text(text) => return Ok(Envelope::decode(&text)?),
            Message::Close(frame) => return Err(anyhow!("server closed: {frame:?}")),
            _ => continue,
        }
    }
}

async fn send_location(client: &mut Client, record: LocationRecord) -> Result<()> {
    let frame = Envelope::LocationUpdate(record).encode()?;
    client.send(Message::Text(frame)).await?;
    Ok(())
}

fn location(username: &str, latitude: f64, longitude: f64, timestamp: i64) -> LocationRecord {
    LocationRecord {
        username: username.into(),
        latitude,
        longitude,
        timestamp,
    }
}

fn joined(username: &str) -> Envelope {
    Envelope::UserConnected(Notice::connected(username))
}

#[tokio::test]
async fn presence_round_trip_over_websockets() -> Result<()> {
    let server = start_server().await?;

    let mut bob = join(server.addr, "bob").await?;
    assert_eq!(next_envelope(&mut bob).await?, joined("bob"));

    // Empty store: alice's first frame is her own join notice, not a snapshot.
    let mut alice = join(server.addr, "alice").await?;
    assert_eq!(next_envelope(&mut alice).await?, joined("alice"));
    assert_eq!(next_envelope(&mut bob).await?, joined("alice"));

    send_location(&mut alice, location("alice", 35.0, 135.0, 1000)).await?;
    let update = Envelope::LocationUpdate(location("alice", 35.0, 135.0, 1000));
    assert_eq!(next_envelope(&mut alice).await?, update);
    assert_eq!(next_envelope(&mut bob).await?, update);

    alice.close(None).await?;
    assert_eq!(
        next_envelope(&mut bob).await?,
        Envelope::UserDisconnected(Notice::disconnected("alice"))
    );

    // alice's record went with her, so a newcomer gets no snapshot.
    let mut carol = join(server.addr, "carol").await?;
    assert_eq!(next_envelope(&mut carol).await?, joined("carol"));

    bob.close(None).await?;
    carol.close(None).await?;
    server.stop().await;
    Ok(())
}

#[tokio::test]
async fn newcomer_sees_snapshot_before_own_join() -> Result<()> {
    let server = start_server().await?;

    let mut alice = join(server.addr, "alice").await?;
    assert_eq!(next_envelope(&mut alice).await?, joined("alice"));
    send_location(&mut alice, location("alice", 48.85, 2.35, 42)).await?;
    // Seeing the echo means the hub has applied the update.
    next_envelope(&mut alice).await?;

    let mut bob = join(server.addr, "bob").await?;
    match next_envelope(&mut bob).await? {
        Envelope::CurrentLocations(locations) => {
            assert_eq!(locations.len(), 1);
            assert_eq!(locations.get("alice"), Some(&location("alice", 48.85, 2.35, 42)));
        }
        other => panic!("expected current_locations first, got {other:?}"),
    }
    assert_eq!(next_envelope(&mut bob).await?, joined("bob"));
    assert_eq!(next_envelope(&mut alice).await?, joined("bob"));

    alice.close(None).await?;
    bob.close(None).await?;
    server.stop().await;
    Ok(())
}

#[tokio::test]
async fn spoofed_username_is_ignored() -> Result<()> {
    let server = start_server().await?;

    let mut observer = join(server.addr, "observer").await?;
    next_envelope(&mut observer).await?;
    let mut alice = join(server.addr, "alice").await?;
    next_envelope(&mut alice).await?;
    next_envelope(&mut observer).await?;

    send_location(&mut alice, location("bob", 1.0, 2.0, 3)).await?;
    assert_eq!(
        next_envelope(&mut observer).await?,
        Envelope::LocationUpdate(location("alice", 1.0, 2.0, 3))
    );

    alice.close(None).await?;
    observer.close(None).await?;
    server.stop().await;
    Ok(())
}

#[tokio::test]
async fn missing_username_joins_as_anonymous() -> Result<()> {
    let server = start_server().await?;

    let (mut client, _) = connect_async(format!("ws://{}/ws", server.addr)).await?;
    assert_eq!(next_envelope(&mut client).await?, joined("Anonymous"));

    client.close(None).await?;
    server.stop().await;
    Ok(())
}

#[tokio::test]
async fn health_reports_ok() -> Result<()> {
    let (hub, _task) = hub::spawn(&HubConfig::default());
    let app = router(hub, SessionConfig::default());

    let response = app
        .oneshot(Request::get("/health").body(Body::empty())?)
        .await?;

    assert_eq!(response.status(), StatusCode::OK);
    let body = to_bytes(response.into_body(), usize::MAX).await?;
    assert_eq!(&body[..], b"OK");
    Ok(())
}

#[tokio::test]
async fn root_answers_cors_preflight() -> Result<()> {
    let (hub, _task) = hub::spawn(&HubConfig::default());
    let app = router(hub, SessionConfig::default());

    let preflight = Request::builder()
        .method(Method::OPTIONS)
        .uri("/")
        .header(header::ORIGIN, "http://maps.example")
        .header(header::ACCESS_CONTROL_REQUEST_METHOD, "POST")
        .header(header::ACCESS_CONTROL_REQUEST_HEADERS, "content-type")
        .body(Body::empty())?;
    let response = app.clone().oneshot(preflight).await?;

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers().get(header::ACCESS_CONTROL_ALLOW_ORIGIN),
        Some(&header::HeaderValue::from_static("*"))
    );

    let response = app
        .oneshot(Request::get("/").body(Body::empty())?)
        .await?;
    assert_eq!(response.status(), StatusCode::OK);
    Ok(())
}
