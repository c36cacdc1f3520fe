use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum HubError {
    #[error("identity '{0}' is already connected")]
    IdentityInUse(String),
    #[error("hub is no longer running")]
    Closed,
}
