//! Client runtime for server-driven live documents.
//!
//! The server owns the source of truth and ships it as fingerprinted
//! static/dynamic diffs; this crate keeps a local [`Document`] in sync
//! while sustaining local interactivity during round-trips:
//!
//! - [`rendered`] — the diff-merge store: merges wire diffs into a
//!   fingerprint tree and serializes markup with change tracking.
//! - [`patch`] — the keyed reconciler that projects serialized markup
//!   into the live document.
//! - [`refs`] — the optimistic lock/loading ref ledger.
//! - [`view`] — the per-session connection state machine.
//! - [`socket`] — the orchestrator tying transport, sessions, hooks,
//!   and transitions together.
//!
//! There is no async runtime: the host lends the document into every
//! entry point, delivers transport replies explicitly, and completes
//! transition timers by handle.
//!
//! [`Document`]: livesync_dom::Document

pub mod error;
pub mod hooks;
pub mod patch;
pub mod protocol;
pub mod refs;
pub mod rendered;
pub mod socket;
pub mod transitions;
pub mod view;

pub use error::ClientError;
pub use hooks::{Hook, HookCtx, HookRegistry};
pub use patch::{Patch, PatchEvent, PatchKind, PatchResult};
pub use refs::{RefKind, RefLedger, RefUndo};
pub use rendered::{Rendered, RenderedOutput};
pub use socket::{
    EventKind, LiveSocket, MainEffect, NavigateKind, PushRef, ReplyStatus, SocketOpts,
    Transport,
};
pub use transitions::{TimerId, TransitionSet};
pub use view::{View, ViewState};
