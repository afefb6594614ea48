//! Error taxonomy for the client runtime.
//!
//! Protocol desyncs degrade gracefully where possible (empty placeholder,
//! logged) and set an escalation flag; malformed markup is fatal locally —
//! the only recovery is a full reload at a higher layer; join rejections
//! are never retried and instead surface a navigation fallback.

use livesync_dom::DomError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClientError {
    /// The session's rendered tree and the server disagree about structure.
    #[error("protocol desync: {0}")]
    Desync(String),
    /// Locally unrecoverable: markup the reconciler cannot parse.
    #[error(transparent)]
    Fatal(#[from] DomError),
    /// The remote refused the join; `reason` is one of `stale`,
    /// `unauthorized`, `reload`.
    #[error("join rejected: {reason}")]
    JoinRejected { reason: String },
    /// A channel event referenced a session this client does not own.
    #[error("unknown session: {0}")]
    UnknownSession(String),
    /// The transport reported an error or closed the channel.
    #[error("channel error")]
    ChannelError,
    /// A reply did not arrive in time.
    #[error("reply timeout")]
    Timeout,
}
