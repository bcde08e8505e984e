//! Telegram client pool
//!
//! Produces authorized, proxy-wrapped grammers sessions keyed by account and
//! exposes the upstream verbs the forwarder and scheduler need. Sessions are
//! rented for the duration of one logical operation; at most one upstream
//! verb is in flight per session.

pub mod pool;
pub mod rate_limit;

pub use pool::ClientPool;
pub use rate_limit::UpstreamPacer;

use crate::grouping::GroupItem;
use grammers_session::defs::PeerRef;

/// Addressable container type, resolved once per operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityKind {
    User,
    Chat,
    Megagroup,
    Gigagroup,
    Channel,
}

/// An entity resolved through a session, carrying everything downstream
/// steps need so upstream objects are never mutated or re-resolved.
#[derive(Debug, Clone)]
pub struct ResolvedEntity {
    /// Bare numeric id
    pub id: i64,
    /// Display title (or username fallback)
    pub title: String,
    pub kind: EntityKind,
    pub username: Option<String>,
    pub(crate) peer: PeerRef,
}

impl ResolvedEntity {
    pub(crate) fn peer(&self) -> PeerRef {
        self.peer.clone()
    }
}

/// Message snapshot pulled from upstream, with the fields the grouping,
/// dedup, and attribution layers read. The media handle stays attached for
/// later downloads.
#[derive(Clone)]
pub struct FetchedMessage {
    pub id: i32,
    pub sender_id: Option<i64>,
    pub sender_name: Option<String>,
    /// Unix timestamp, seconds
    pub timestamp: i64,
    pub text: String,
    pub filename: Option<String>,
    pub mime: Option<String>,
    /// Upstream file identity, when the message carries a file
    pub file_id: Option<String>,
    pub file_size: i64,
    /// Forum topic the message belongs to
    pub topic_id: Option<i64>,
    pub(crate) media: Option<grammers_client::types::Media>,
}

impl FetchedMessage {
    pub fn has_media(&self) -> bool {
        self.media.is_some()
    }

    pub fn has_file(&self) -> bool {
        self.file_id.is_some()
    }

    /// Name used for scratch files: the declared filename or the file id.
    pub fn scratch_name(&self) -> String {
        self.filename
            .clone()
            .or_else(|| self.file_id.clone())
            .unwrap_or_else(|| format!("msg-{}", self.id))
    }
}

impl std::fmt::Debug for FetchedMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FetchedMessage")
            .field("id", &self.id)
            .field("sender_id", &self.sender_id)
            .field("timestamp", &self.timestamp)
            .field("filename", &self.filename)
            .field("file_id", &self.file_id)
            .field("file_size", &self.file_size)
            .finish()
    }
}

impl GroupItem for FetchedMessage {
    fn id(&self) -> i64 {
        i64::from(self.id)
    }

    fn sender_id(&self) -> Option<i64> {
        self.sender_id
    }

    fn timestamp(&self) -> i64 {
        self.timestamp
    }

    fn filename(&self) -> Option<&str> {
        self.filename.as_deref()
    }
}
