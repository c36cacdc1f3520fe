//! The single coordination point for presence state.
//!
//! One task owns a [`Hub`] and consumes [`HubCommand`]s from a bounded inbox.
//! Sessions never touch the session set or the [`PresenceStore`] directly;
//! they go through a cloneable [`HubHandle`]. Because every mutation and every
//! fan-out runs on that one task, a broadcast can never observe a half-applied
//! update, and every subscriber sees broadcasts in the same order.
//!
//! Fan-out uses `try_send` on each session's bounded outbound queue. A full
//! queue gets that session torn down instead of stalling everyone else.

use std::{
    collections::{BTreeMap, HashMap, VecDeque},
    num::NonZeroUsize,
    ops::ControlFlow,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use tokio::{
    sync::{
        mpsc::{self, error::TrySendError},
        oneshot, watch,
    },
    task::JoinHandle,
};
use tracing::{debug, error, info, warn};

use crate::{
    config::{DuplicateIdentity, HubConfig},
    error::HubError,
    message::{Envelope, LocationRecord, Notice},
    presence::PresenceStore,
};

pub type SessionId = u64;

/// An encoded envelope. One allocation is shared by every queue it lands in.
pub type Frame = Arc<str>;

/// The hub's view of a registered session.
///
/// The hub holds the only sender for `outbound`, so dropping a `Subscriber`
/// closes the queue and trips the session's [`Mailbox::detached`] signal.
#[derive(Debug)]
pub struct Subscriber {
    pub id: SessionId,
    pub username: String,
    pub outbound: mpsc::Sender<Frame>,
    _detach: watch::Sender<()>,
}

/// The session's end of a [`Subscriber`].
#[derive(Debug)]
pub struct Mailbox {
    pub frames: mpsc::Receiver<Frame>,
    /// `changed()` fails as soon as the hub lets go of the subscriber, even
    /// while `frames` still holds a backlog.
    pub detached: watch::Receiver<()>,
}

impl Subscriber {
    pub fn new(id: SessionId, username: String, capacity: NonZeroUsize) -> (Self, Mailbox) {
        let (outbound, frames) = mpsc::channel(capacity.get());
        let (detach, detached) = watch::channel(());
        let subscriber = Self {
            id,
            username,
            outbound,
            _detach: detach,
        };
        (subscriber, Mailbox { frames, detached })
    }
}

/// Consistent view of the hub taken between two commands.
#[derive(Debug, Clone, PartialEq)]
pub struct HubSnapshot {
    pub sessions: usize,
    pub presence: BTreeMap<String, LocationRecord>,
}

pub enum HubCommand {
    Register {
        subscriber: Subscriber,
        respond_to: oneshot::Sender<Result<(), HubError>>,
    },
    Unregister {
        id: SessionId,
    },
    UpdateLocation {
        id: SessionId,
        record: LocationRecord,
    },
    Broadcast(Envelope),
    Inspect {
        respond_to: oneshot::Sender<HubSnapshot>,
    },
    Shutdown,
}

/// Starts the hub task and returns a handle to it.
pub fn spawn(config: &HubConfig) -> (HubHandle, JoinHandle<()>) {
    let (commands, inbox) = mpsc::channel(config.inbox_capacity.get());
    let hub = Hub::new(config.duplicate_identity);
    let task = tokio::spawn(hub.run(inbox));
    let handle = HubHandle {
        commands,
        next_id: Arc::new(AtomicU64::new(1)),
    };
    (handle, task)
}

#[derive(Clone)]
pub struct HubHandle {
    commands: mpsc::Sender<HubCommand>,
    next_id: Arc<AtomicU64>,
}

impl HubHandle {
    /// Session ids are never reused for the lifetime of the hub.
    pub fn next_session_id(&self) -> SessionId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Resolves once the subscriber is in the active set and its snapshot has
    /// been queued.
    pub async fn register(&self, subscriber: Subscriber) -> Result<(), HubError> {
        let (respond_to, response) = oneshot::channel();
        self.send(HubCommand::Register {
            subscriber,
            respond_to,
        })
        .await?;
        response.await.map_err(|_| HubError::Closed)?
    }

    pub async fn unregister(&self, id: SessionId) -> Result<(), HubError> {
        self.send(HubCommand::Unregister { id }).await
    }

    pub async fn update_location(
        &self,
        id: SessionId,
        record: LocationRecord,
    ) -> Result<(), HubError> {
        self.send(HubCommand::UpdateLocation { id, record }).await
    }

    /// Fans an arbitrary envelope out to every active session, under the same
    /// slow-consumer policy as presence traffic.
    pub async fn broadcast(&self, envelope: Envelope) -> Result<(), HubError> {
        self.send(HubCommand::Broadcast(envelope)).await
    }

    pub async fn inspect(&self) -> Result<HubSnapshot, HubError> {
        let (respond_to, response) = oneshot::channel();
        self.send(HubCommand::Inspect { respond_to }).await?;
        response.await.map_err(|_| HubError::Closed)
    }

    pub async fn shutdown(&self) -> Result<(), HubError> {
        self.send(HubCommand::Shutdown).await
    }

    async fn send(&self, command: HubCommand) -> Result<(), HubError> {
        self.commands
            .send(command)
            .await
            .map_err(|_| HubError::Closed)
    }
}

pub struct Hub {
    sessions: HashMap<SessionId, Subscriber>,
    presence: PresenceStore,
    duplicate_identity: DuplicateIdentity,
}

impl Hub {
    pub fn new(duplicate_identity: DuplicateIdentity) -> Self {
        Self {
            sessions: HashMap::new(),
            presence: PresenceStore::new(),
            duplicate_identity,
        }
    }

    pub async fn run(mut self, mut inbox: mpsc::Receiver<HubCommand>) {
        while let Some(command) = inbox.recv().await {
            if self.handle(command).is_break() {
                break;
            }
        }
        self.shutdown();
    }

    fn handle(&mut self, command: HubCommand) -> ControlFlow<()> {
        match command {
            HubCommand::Register {
                subscriber,
                respond_to,
            } => {
                let _ = respond_to.send(self.register(subscriber));
            }
            HubCommand::Unregister { id } => {
                self.unregister(id);
            }
            HubCommand::UpdateLocation { id, record } => {
                self.update_location(id, record);
            }
            HubCommand::Broadcast(envelope) => self.broadcast(envelope),
            HubCommand::Inspect { respond_to } => {
                let _ = respond_to.send(self.snapshot());
            }
            HubCommand::Shutdown => return ControlFlow::Break(()),
        }
        ControlFlow::Continue(())
    }

    /// Adds a session, queues the current presence snapshot for it, then
    /// announces it to everyone (itself included).
    pub fn register(&mut self, subscriber: Subscriber) -> Result<(), HubError> {
        if let Some(previous) = self.session_for(&subscriber.username) {
            match self.duplicate_identity {
                DuplicateIdentity::Reject => {
                    info!(username = %subscriber.username, "rejecting duplicate identity");
                    return Err(HubError::IdentityInUse(subscriber.username));
                }
                DuplicateIdentity::EvictPrevious => {
                    // Presence stays: the identity is still connected.
                    self.sessions.remove(&previous);
                    info!(
                        session_id = previous,
                        username = %subscriber.username,
                        "evicted previous session for identity"
                    );
                }
            }
        }

        let id = subscriber.id;
        let username = subscriber.username.clone();
        info!(session_id = id, %username, "session registered");

        if !self.presence.is_empty() {
            let snapshot = Envelope::CurrentLocations(self.presence.snapshot());
            if let Some(frame) = encode(&snapshot) {
                if !offer(&subscriber, &frame) {
                    // Never entered the active set, so nobody is told about it.
                    return Ok(());
                }
            }
        }

        self.sessions.insert(id, subscriber);
        self.broadcast(Envelope::UserConnected(Notice::connected(&username)));
        Ok(())
    }

    /// Returns `false` when the session was already gone.
    pub fn unregister(&mut self, id: SessionId) -> bool {
        match self.remove_session(id) {
            Some(notice) => {
                self.broadcast(notice);
                true
            }
            None => {
                debug!(session_id = id, "unregister for inactive session ignored");
                false
            }
        }
    }

    /// The only path that changes location state. Updates from sessions that
    /// are no longer active are dropped.
    pub fn update_location(&mut self, id: SessionId, record: LocationRecord) -> bool {
        if !self.sessions.contains_key(&id) {
            debug!(session_id = id, "location update from inactive session ignored");
            return false;
        }
        debug!(
            session_id = id,
            username = %record.username,
            latitude = record.latitude,
            longitude = record.longitude,
            "location updated"
        );
        self.presence.upsert(record.clone());
        self.broadcast(Envelope::LocationUpdate(record));
        true
    }

    /// Encodes once and offers the frame to every active session without
    /// waiting. Sessions whose queue is full or closed are removed and their
    /// leave notice is fanned out in turn.
    pub fn broadcast(&mut self, envelope: Envelope) {
        let mut pending = VecDeque::from([envelope]);

        while let Some(envelope) = pending.pop_front() {
            let Some(frame) = encode(&envelope) else {
                continue;
            };

            let dropped: Vec<SessionId> = self
                .sessions
                .values()
                .filter(|subscriber| !offer(subscriber, &frame))
                .map(|subscriber| subscriber.id)
                .collect();

            for id in dropped {
                if let Some(notice) = self.remove_session(id) {
                    pending.push_back(notice);
                }
            }
        }
    }

    pub fn snapshot(&self) -> HubSnapshot {
        HubSnapshot {
            sessions: self.sessions.len(),
            presence: self.presence.snapshot(),
        }
    }

    /// Drops every subscriber. Each session skips whatever is still queued and
    /// sends a close frame.
    pub fn shutdown(&mut self) {
        info!(sessions = self.sessions.len(), "hub shutting down");
        self.sessions.clear();
        self.presence = PresenceStore::new();
    }

    fn session_for(&self, username: &str) -> Option<SessionId> {
        self.sessions
            .values()
            .find(|subscriber| subscriber.username == username)
            .map(|subscriber| subscriber.id)
    }

    /// Dropping the subscriber closes its queue and detaches its session.
    fn remove_session(&mut self, id: SessionId) -> Option<Envelope> {
        let Subscriber { username, .. } = self.sessions.remove(&id)?;
        self.presence.remove(&username);
        info!(session_id = id, %username, "session unregistered");
        Some(Envelope::UserDisconnected(Notice::disconnected(&username)))
    }
}

fn encode(envelope: &Envelope) -> Option<Frame> {
    match envelope.encode() {
        Ok(text) => Some(Frame::from(text)),
        Err(err) => {
            error!(error = ?err, kind = envelope.kind(), "dropping broadcast that failed to encode");
            None
        }
    }
}

fn offer(subscriber: &Subscriber, frame: &Frame) -> bool {
    match subscriber.outbound.try_send(Arc::clone(frame)) {
        Ok(()) => true,
        Err(TrySendError::Full(_)) => {
            warn!(
                session_id = subscriber.id,
                username = %subscriber.username,
                "outbound queue full; disconnecting slow consumer"
            );
            false
        }
        Err(TrySendError::Closed(_)) => {
            debug!(session_id = subscriber.id, "outbound queue already closed");
            false
        }
    }
}
