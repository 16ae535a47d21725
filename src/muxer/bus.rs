//! Completion bus
//!
//! Single-writer, multi-subscriber notification channel for muxer events.
//! Subscribers run synchronously on the publishing thread (the drain thread
//! that delivered the last end-of-stream), so they must not block.

use super::container::TrackKind;
use parking_lot::RwLock;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Per-track totals of a finished segment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackSummary {
    pub kind: TrackKind,
    pub samples: u32,
    /// End of the last sample (pts + duration)
    pub duration_us: u64,
}

/// How a muxer ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SegmentOutcome {
    /// File closed with a valid index
    Complete { tracks: Vec<TrackSummary> },
    /// Aborted, truncated or never started
    Failed { reason: String },
}

impl SegmentOutcome {
    pub fn is_complete(&self) -> bool {
        matches!(self, SegmentOutcome::Complete { .. })
    }

    /// Longest track duration, zero for failed segments
    pub fn duration_us(&self) -> u64 {
        match self {
            SegmentOutcome::Complete { tracks } => {
                tracks.iter().map(|t| t.duration_us).max().unwrap_or(0)
            }
            SegmentOutcome::Failed { .. } => 0,
        }
    }
}

/// Events published by a muxer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MuxerEvent {
    SegmentFinished {
        ordinal: u32,
        path: PathBuf,
        outcome: SegmentOutcome,
    },
}

/// Handle returned by [`CompletionBus::subscribe`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type Subscriber = Arc<dyn Fn(&MuxerEvent) + Send + Sync>;

/// Cloneable fan-out of [`MuxerEvent`]s
#[derive(Clone, Default)]
pub struct CompletionBus {
    subscribers: Arc<RwLock<Vec<(SubscriptionId, Subscriber)>>>,
    next_id: Arc<AtomicU64>,
}

impl CompletionBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe<F>(&self, f: F) -> SubscriptionId
    where
        F: Fn(&MuxerEvent) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.subscribers.write().push((id, Arc::new(f)));
        id
    }

    pub fn unsubscribe(&self, id: SubscriptionId) {
        self.subscribers.write().retain(|(sid, _)| *sid != id);
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }

    pub fn publish(&self, event: &MuxerEvent) {
        // Snapshot so a subscriber may unsubscribe itself
        let subscribers: Vec<Subscriber> =
            self.subscribers.read().iter().map(|(_, s)| s.clone()).collect();
        tracing::debug!("Publishing {:?} to {} subscriber(s)", event, subscribers.len());
        for subscriber in subscribers {
            subscriber(event);
        }
    }
}

impl std::fmt::Debug for CompletionBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompletionBus")
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}
