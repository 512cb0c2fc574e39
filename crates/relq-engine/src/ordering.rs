use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use relq_domain::{Notification, Topic};

// ── Admission verdicts ────────────────────────────────────────────────────────

/// What to do with a notification for (topic, sequence) right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// The sequence is next in line; deliver it.
    Deliver,
    /// An earlier sequence is still outstanding; the notification has been
    /// buffered and will drain once the gap closes or the window expires.
    Buffered,
    /// Behind the watermark: a duplicate or a late arrival past a closed
    /// gap. Deliver only if the record is still non-terminal; the state
    /// machine refuses otherwise.
    Stale,
}

#[derive(Debug, Default)]
struct TopicOrdering {
    /// The sequence the topic is waiting for. `None` until first synced
    /// from the store or observed.
    next_expected: Option<i64>,
    buffer: BTreeMap<i64, Notification>,
    /// Set when the first out-of-order sequence was buffered; the gap is
    /// declared lost once a full sliding window has elapsed since.
    window_opened_at: Option<Instant>,
    /// Set when this node first deferred to a foreign topic owner.
    affinity_deferred_since: Option<Instant>,
}

/// Per-queue reordering state: one sliding-window buffer per topic.
///
/// The lock is held only for map surgery; no I/O happens under it. Buffer
/// contents are advisory — a crashed node loses them, and the notify-orphan
/// sweep re-enqueues notifications for the records left behind.
pub struct OrderingEngine {
    window: Duration,
    topics: Mutex<HashMap<Topic, TopicOrdering>>,
}

impl OrderingEngine {
    pub fn new(window: Duration) -> Self {
        OrderingEngine {
            window,
            topics: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<Topic, TopicOrdering>> {
        self.topics.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn is_tracked(&self, topic: &Topic) -> bool {
        self.lock()
            .get(topic)
            .map_or(false, |st| st.next_expected.is_some())
    }

    /// Initialize the watermark for a topic, typically from the smallest
    /// non-terminal sequence in the state table. No-op once tracked.
    pub fn track(&self, topic: &Topic, next_expected: i64) {
        let mut topics = self.lock();
        let st = topics.entry(topic.clone()).or_default();
        if st.next_expected.is_none() {
            st.next_expected = Some(next_expected);
        }
    }

    /// Gate a notification against the topic watermark.
    pub fn admit(&self, notification: &Notification, now: Instant) -> Admission {
        let mut topics = self.lock();
        let st = topics.entry(notification.topic.clone()).or_default();
        let next = match st.next_expected {
            Some(next) => next,
            None => {
                // Untracked topic: adopt the first observed sequence.
                st.next_expected = Some(notification.sequence);
                notification.sequence
            }
        };
        match notification.sequence.cmp(&next) {
            std::cmp::Ordering::Equal => {
                // Being serviced now; any open window restarts for the
                // remaining buffered gap.
                st.window_opened_at = if st.buffer.is_empty() { None } else { Some(now) };
                Admission::Deliver
            }
            std::cmp::Ordering::Greater => {
                st.buffer
                    .entry(notification.sequence)
                    .or_insert_with(|| notification.clone());
                if st.window_opened_at.is_none() {
                    st.window_opened_at = Some(now);
                }
                Admission::Buffered
            }
            std::cmp::Ordering::Less => Admission::Stale,
        }
    }

    /// A sequence reached a terminal state (delivered, poisoned or
    /// expired); advance the watermark past it.
    pub fn mark_complete(&self, topic: &Topic, sequence: i64) {
        let mut topics = self.lock();
        let st = topics.entry(topic.clone()).or_default();
        if st.next_expected.map_or(true, |next| sequence + 1 > next) {
            st.next_expected = Some(sequence + 1);
        }
        if let Some(next) = st.next_expected {
            // Buffered entries behind the watermark are duplicates now.
            st.buffer.retain(|&s, _| s >= next);
        }
        if st.buffer.is_empty() {
            st.window_opened_at = None;
        }
        st.affinity_deferred_since = None;
    }

    /// Pop the next buffered notification that may be delivered: either the
    /// expected sequence arrived, or the window on a missing earlier
    /// sequence has expired and the gap is declared lost.
    pub fn pop_ready(&self, topic: &Topic, now: Instant) -> Option<Notification> {
        let mut topics = self.lock();
        let st = topics.get_mut(topic)?;
        let next = st.next_expected?;
        let (&smallest, _) = st.buffer.iter().next()?;
        let window_expired = st
            .window_opened_at
            .map_or(false, |opened| now.duration_since(opened) >= self.window);
        if smallest != next && !window_expired {
            return None;
        }
        let notification = st.buffer.remove(&smallest)?;
        if smallest > next {
            // The gap below `smallest` is considered lost.
            st.next_expected = Some(smallest);
        }
        st.window_opened_at = if st.buffer.is_empty() { None } else { Some(now) };
        Some(notification)
    }

    /// Whether to keep deferring to a foreign topic owner. Deferral is
    /// abandoned once it has lasted a full sliding window without the owner
    /// claiming.
    pub fn should_defer_for_affinity(&self, topic: &Topic, now: Instant) -> bool {
        let mut topics = self.lock();
        let st = topics.entry(topic.clone()).or_default();
        match st.affinity_deferred_since {
            None => {
                st.affinity_deferred_since = Some(now);
                true
            }
            Some(since) => {
                if now.duration_since(since) >= self.window {
                    st.affinity_deferred_since = None;
                    false
                } else {
                    true
                }
            }
        }
    }

    pub fn clear_affinity_defer(&self, topic: &Topic) {
        let mut topics = self.lock();
        if let Some(st) = topics.get_mut(topic) {
            st.affinity_deferred_since = None;
        }
    }
}
