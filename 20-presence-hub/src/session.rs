//! One connected participant.
//!
//! A session registers with the hub before it reads anything, then runs two
//! loops: the inbound loop on the caller's task, and the outbound loop on its
//! own task. Both watch the mailbox's detach signal, so once the hub drops the
//! session neither loop waits on the peer any longer. Every write is bounded
//! by the configured write timeout. Either loop finishing ends the session,
//! and the hub hears about it through a single unregister.

use std::{fmt::Display, ops::ControlFlow, time::Duration};

use axum::extract::ws::Message;
use futures::{Sink, SinkExt, Stream, StreamExt};
use tokio::{
    select,
    sync::{oneshot, watch},
    time::timeout,
};
use tracing::{debug, info, warn};

use crate::{
    config::SessionConfig,
    hub::{HubHandle, Mailbox, SessionId, Subscriber},
    message::{Envelope, LocationRecord},
};

/// Lifecycle of a session. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SessionState {
    Connecting,
    Active,
    Closing,
    Closed,
}

pub struct Session {
    id: SessionId,
    username: String,
    hub: HubHandle,
    config: SessionConfig,
    state: SessionState,
    history: Vec<SessionState>,
}

enum Received<E> {
    Message(Message),
    Ended,
    Failed(E),
    TimedOut,
}

impl Session {
    pub fn new(hub: HubHandle, username: String, config: SessionConfig) -> Self {
        Self {
            id: hub.next_session_id(),
            username,
            hub,
            config,
            state: SessionState::Connecting,
            history: vec![SessionState::Connecting],
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Every state the session has been in, oldest first.
    pub fn history(&self) -> &[SessionState] {
        &self.history
    }

    /// Drives the session until the peer goes away or the hub drops it, and
    /// hands back the closed session.
    ///
    /// `sink` and `stream` are the two halves of the connection endpoint.
    pub async fn run<Tx, Rx, E>(mut self, sink: Tx, stream: Rx) -> Self
    where
        Tx: Sink<Message> + Unpin + Send + 'static,
        Tx::Error: Display + Send,
        Rx: Stream<Item = Result<Message, E>> + Unpin,
        E: Display,
    {
        let (subscriber, mailbox) =
            Subscriber::new(self.id, self.username.clone(), self.config.queue_capacity);

        if let Err(err) = self.hub.register(subscriber).await {
            warn!(session_id = self.id, username = %self.username, error = %err, "registration refused");
            self.advance(SessionState::Closing);
            // The refused subscriber is already dropped, so this only sends
            // the close frame.
            write_outbound(self.id, mailbox, sink, self.config.write_timeout).await;
            self.advance(SessionState::Closed);
            return self;
        }
        self.advance(SessionState::Active);

        let detached = mailbox.detached.clone();
        let (writer_done, writer_finished) = oneshot::channel::<()>();
        let id = self.id;
        let write_timeout = self.config.write_timeout;
        let writer = tokio::spawn(async move {
            write_outbound(id, mailbox, sink, write_timeout).await;
            drop(writer_done);
        });

        self.read_inbound(stream, detached, writer_finished).await;
        self.advance(SessionState::Closing);

        if let Err(err) = self.hub.unregister(self.id).await {
            debug!(session_id = self.id, error = %err, "hub gone before unregister");
        }
        if let Err(err) = writer.await {
            warn!(session_id = self.id, error = ?err, "outbound task failed");
        }
        self.advance(SessionState::Closed);
        self
    }

    async fn read_inbound<Rx, E>(
        &self,
        mut stream: Rx,
        mut detached: watch::Receiver<()>,
        mut writer_finished: oneshot::Receiver<()>,
    ) where
        Rx: Stream<Item = Result<Message, E>> + Unpin,
        E: Display,
    {
        loop {
            let received = select! {
                received = receive(&mut stream, self.config.idle_timeout) => received,
                _ = detached.changed() => {
                    debug!(session_id = self.id, "dropped by hub; closing inbound");
                    return;
                }
                _ = &mut writer_finished => {
                    debug!(session_id = self.id, "outbound loop finished; closing inbound");
                    return;
                }
            };

            match received {
                Received::Message(message) => {
                    if self.handle_message(message).await.is_break() {
                        return;
                    }
                }
                Received::Ended => {
                    debug!(session_id = self.id, "peer closed the connection");
                    return;
                }
                Received::Failed(err) => {
                    info!(session_id = self.id, error = %err, "receive failed");
                    return;
                }
                Received::TimedOut => {
                    info!(session_id = self.id, username = %self.username, "idle timeout");
                    return;
                }
            }
        }
    }

    async fn handle_message(&self, message: Message) -> ControlFlow<()> {
        match message {
            Message::Text(text) => self.handle_text(&text).await,
            Message::Binary(bytes) => match std::str::from_utf8(&bytes) {
                Ok(text) => self.handle_text(text).await,
                Err(_) => {
                    warn!(session_id = self.id, "discarding non UTF-8 binary frame");
                    ControlFlow::Continue(())
                }
            },
            Message::Close(_) => ControlFlow::Break(()),
            Message::Ping(_) | Message::Pong(_) => ControlFlow::Continue(()),
        }
    }

    async fn handle_text(&self, text: &str) -> ControlFlow<()> {
        let Some(record) = location_from(text, &self.username) else {
            return ControlFlow::Continue(());
        };

        debug!(
            session_id = self.id,
            latitude = record.latitude,
            longitude = record.longitude,
            "received location update"
        );
        match self.hub.update_location(self.id, record).await {
            Ok(()) => ControlFlow::Continue(()),
            Err(_) => ControlFlow::Break(()),
        }
    }

    fn advance(&mut self, next: SessionState) {
        if next <= self.state {
            return;
        }
        debug!(session_id = self.id, from = ?self.state, to = ?next, "session state");
        self.state = next;
        self.history.push(next);
    }
}

/// Decodes one client frame. Only location updates come through, and they
/// always carry the session's own identity whatever the client claimed.
pub fn location_from(text: &str, username: &str) -> Option<LocationRecord> {
    match Envelope::decode(text) {
        Ok(Envelope::LocationUpdate(mut record)) => {
            if record.username != username {
                debug!(claimed = %record.username, %username, "replacing claimed username");
            }
            record.username = username.to_string();
            Some(record)
        }
        Ok(other) => {
            debug!(kind = other.kind(), %username, "ignoring frame kind from client");
            None
        }
        Err(err) => {
            warn!(%username, error = %err, "discarding malformed frame");
            None
        }
    }
}

async fn receive<Rx, E>(stream: &mut Rx, idle_timeout: Option<Duration>) -> Received<E>
where
    Rx: Stream<Item = Result<Message, E>> + Unpin,
{
    let next = match idle_timeout {
        Some(limit) => match timeout(limit, stream.next()).await {
            Ok(next) => next,
            Err(_) => return Received::TimedOut,
        },
        None => stream.next().await,
    };

    match next {
        Some(Ok(message)) => Received::Message(message),
        Some(Err(err)) => Received::Failed(err),
        None => Received::Ended,
    }
}

/// Writes queued frames in order until the hub lets go of the session, then
/// says goodbye with a close frame. Frames still queued at that point are
/// skipped: the hub has already announced the departure.
async fn write_outbound<Tx>(id: SessionId, mailbox: Mailbox, mut sink: Tx, write_timeout: Duration)
where
    Tx: Sink<Message> + Unpin,
    Tx::Error: Display,
{
    let Mailbox {
        mut frames,
        mut detached,
    } = mailbox;

    loop {
        let frame = select! {
            biased;
            _ = detached.changed() => break,
            frame = frames.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
        };

        let written = select! {
            biased;
            _ = detached.changed() => break,
            written = timeout(write_timeout, sink.send(Message::Text(frame.to_string()))) => written,
        };
        match written {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                debug!(session_id = id, error = %err, "write failed; stopping outbound loop");
                return;
            }
            Err(_) => {
                warn!(session_id = id, "peer stopped reading; stopping outbound loop");
                return;
            }
        }
    }

    match timeout(write_timeout, sink.send(Message::Close(None))).await {
        Ok(Ok(())) => {}
        Ok(Err(err)) => debug!(session_id = id, error = %err, "failed to send close frame"),
        Err(_) => debug!(session_id = id, "timed out sending close frame"),
    }
    let _ = timeout(write_timeout, sink.close()).await;
}
