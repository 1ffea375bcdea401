//! Change feed
//!
//! Broadcasts every commit of a store to all connected contexts.
//!
//! A store owns one `ChangeFeed`. Each context subscribes once and gets a
//! `ChangeStream`, which labels each commit as `Origin::Local` or
//! `Origin::Remote` relative to the subscribing context.
//!
//! Commits are published while the store still holds its document lock,
//! so every stream observes commits in backend commit order.
//!
//! A subscriber that falls more than `FeedConfig::capacity` commits behind
//! does not lose them silently: its next `recv` returns `Notice::Lagged`
//! and the subscriber is expected to re-read whatever it caches.

use std::sync::Arc;

use serde_json::Value;
use tokio::sync::broadcast;
use tracing::{trace, warn};

use super::types::{ChangeEvent, Key, Origin};
use crate::config::FeedConfig;
use crate::idgen::ContextId;

/// A committed change, as stored in the broadcast channel
#[derive(Debug)]
struct Commit {
    source: ContextId,
    key: Key,
    value: Option<Value>,
}

impl Commit {
    fn to_event(&self, observer: ContextId) -> ChangeEvent {
        let origin = if self.source == observer {
            Origin::Local
        } else {
            Origin::Remote
        };
        ChangeEvent {
            key: self.key.clone(),
            value: self.value.clone(),
            origin,
        }
    }
}

/// Broadcast side of a store's change notifications
#[derive(Clone)]
pub struct ChangeFeed {
    sender: broadcast::Sender<Arc<Commit>>,
    debug_hint: Arc<str>,
}

impl ChangeFeed {
    #[must_use]
    pub fn new(config: FeedConfig, debug_hint: &str) -> Self {
        let (sender, _rx) = broadcast::channel(config.capacity.max(1));
        Self {
            sender,
            debug_hint: Arc::from(debug_hint),
        }
    }

    /// Publish a commit made by `source`. `None` marks a removal.
    pub fn publish(&self, source: ContextId, key: &str, value: Option<Value>) {
        let commit = Arc::new(Commit {
            source,
            key: key.to_string(),
            value,
        });
        if self.sender.send(commit).is_err() {
            trace!(
                "feed.publish: no subscribers for key '{key}' (hint: {})",
                self.debug_hint
            );
        }
    }

    /// Subscribe on behalf of `context`
    #[must_use]
    pub fn subscribe(&self, context: ContextId) -> ChangeStream {
        ChangeStream {
            receiver: self.sender.subscribe(),
            context,
            debug_hint: Arc::clone(&self.debug_hint),
        }
    }

    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl std::fmt::Debug for ChangeFeed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChangeFeed")
            .field("debug_hint", &self.debug_hint)
            .field("subscriber_count", &self.sender.receiver_count())
            .finish()
    }
}

/// What a change stream delivers next
#[derive(Debug, Clone, PartialEq)]
pub enum Notice {
    Change(ChangeEvent),
    /// The stream fell behind and this many commits were skipped
    Lagged(u64),
}

/// One context's subscription to a change feed
///
/// Drop the stream to unsubscribe.
pub struct ChangeStream {
    receiver: broadcast::Receiver<Arc<Commit>>,
    context: ContextId,
    debug_hint: Arc<str>,
}

impl ChangeStream {
    #[must_use]
    pub fn context(&self) -> ContextId {
        self.context
    }

    /// Wait for the next notice. Returns `None` once the feed is gone.
    pub async fn recv(&mut self) -> Option<Notice> {
        match self.receiver.recv().await {
            Ok(commit) => Some(Notice::Change(commit.to_event(self.context))),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(
                    "stream.recv: {} lagged behind by {skipped} commits (hint: {})",
                    self.context, self.debug_hint
                );
                Some(Notice::Lagged(skipped))
            }
            Err(broadcast::error::RecvError::Closed) => None,
        }
    }
}

impl std::fmt::Debug for ChangeStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChangeStream")
            .field("context", &self.context)
            .field("debug_hint", &self.debug_hint)
            .finish_non_exhaustive()
    }
}
