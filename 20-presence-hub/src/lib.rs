//! Real-time presence hub over WebSockets.
//!
//! Participants connect to `/ws?username=<name>`, report their location, and
//! receive everyone else's location as it changes. Each module focuses on a
//! concrete responsibility:
//!
//! - [`message`] is the JSON envelope codec (`{"type": .., "data": ..}`).
//! - [`presence`] holds the identity → location map.
//! - [`hub`] is the single task that owns presence state and the set of
//!   live sessions, and fans every change out without ever waiting on a
//!   subscriber.
//! - [`session`] bridges one WebSocket to the hub with an inbound and an
//!   outbound loop.
//! - [`server`] wires the axum router (`/ws`, `/health`, CORS) and graceful
//!   shutdown.
//! - [`client`] is a one-shot probe that sends a location and prints the reply.
//! - [`cli`] and [`config`] cover command-line flags and their defaults.
//!
//! Unit tests sit next to each module; `tests/` drives a real listener.

pub mod cli;
pub mod client;
pub mod config;
pub mod error;
pub mod hub;
pub mod message;
pub mod presence;
pub mod server;
pub mod session;
