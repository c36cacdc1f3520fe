use std::{num::NonZeroUsize, time::Duration};

use clap::ValueEnum;

/// Outbound queue depth per session before the hub treats it as a slow consumer.
pub const DEFAULT_QUEUE_CAPACITY: NonZeroUsize = non_zero(256);
/// Pending commands the hub task will buffer before sessions wait on it.
pub const DEFAULT_INBOX_CAPACITY: NonZeroUsize = non_zero(1024);
/// How long one write to a peer may stall before the session gives up on it.
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(10);
/// Identity used when the `username` query parameter is missing or blank.
pub const DEFAULT_IDENTITY: &str = "Anonymous";

/// What the hub does when a session registers under an identity that is
/// already active.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum DuplicateIdentity {
    /// The newer session takes over; the older one is closed without a leave notice.
    #[default]
    EvictPrevious,
    /// The newer session is refused and closed.
    Reject,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionConfig {
    pub queue_capacity: NonZeroUsize,
    /// Close sessions that send nothing for this long. `None` relies on the
    /// transport noticing dead peers.
    pub idle_timeout: Option<Duration>,
    /// Upper bound on each frame written to the peer, close frame included.
    pub write_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            idle_timeout: None,
            write_timeout: DEFAULT_WRITE_TIMEOUT,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HubConfig {
    pub inbox_capacity: NonZeroUsize,
    pub duplicate_identity: DuplicateIdentity,
    pub session: SessionConfig,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            inbox_capacity: DEFAULT_INBOX_CAPACITY,
            duplicate_identity: DuplicateIdentity::default(),
            session: SessionConfig::default(),
        }
    }
}

const fn non_zero(n: usize) -> NonZeroUsize {
    match NonZeroUsize::new(n) {
        Some(n) => n,
        None => panic!("capacity must be non-zero"),
    }
}

/// Falls back to [`DEFAULT_IDENTITY`] for missing or blank names.
pub fn resolve_identity(requested: Option<&str>) -> String {
    match requested.map(str::trim) {
        Some(name) if !name.is_empty() => name.to_string(),
        _ => DEFAULT_IDENTITY.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blank_usernames_become_anonymous() {
        assert_eq!(resolve_identity(None), "Anonymous");
        assert_eq!(resolve_identity(Some("")), "Anonymous");
        assert_eq!(resolve_identity(Some("   ")), "Anonymous");
        assert_eq!(resolve_identity(Some(" alice ")), "alice");
    }

    #[test]
    fn defaults_match_documented_values() {
        let config = HubConfig::default();
        assert_eq!(config.session.queue_capacity.get(), 256);
        assert_eq!(config.inbox_capacity.get(), 1024);
        assert_eq!(config.duplicate_identity, DuplicateIdentity::EvictPrevious);
        assert_eq!(config.session.idle_timeout, None);
        assert_eq!(config.session.write_timeout, Duration::from_secs(10));
    }
}
