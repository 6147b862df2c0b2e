//! Per client mailbox.
//!
//! Every connection owns exactly one [Queue]. Shards deliver into it through
//! [QueueRef], a weak back-reference that never keeps a disconnected
//! client's buffers alive. All operations here are last-line containment
//! against teardown races: whatever arrives after [Queue::stop] becomes a
//! silent no-op, never an error.

#[cfg(any(feature = "fuzzy", test))]
use arbitrary::{Arbitrary, Error as ArbitraryError, Unstructured};

#[cfg(any(feature = "fuzzy", test))]
use std::result;

use uuid::Uuid;

use std::collections::{BTreeSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::fmt;

use crate::TopicName;

/// Unique identity of a client queue, assigned at accept, stable until the
/// connection goes away.
#[derive(Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct QueueId(Uuid);

impl QueueId {
    pub fn new() -> QueueId {
        QueueId(Uuid::new_v4())
    }
}

impl Default for QueueId {
    fn default() -> QueueId {
        QueueId::new()
    }
}

impl fmt::Display for QueueId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A delivered message: the payload plus the topic names that matched the
/// receiving queue in the delivering shard. Immutable after creation; the
/// payload is shared across the whole fan-out.
#[derive(Clone, Eq, PartialEq, Debug)]
pub struct Message {
    pub topics: Vec<TopicName>,
    pub payload: Arc<[u8]>,
}

impl Message {
    pub fn new(topics: Vec<TopicName>, payload: Arc<[u8]>) -> Message {
        Message { topics, payload }
    }
}

#[cfg(any(feature = "fuzzy", test))]
impl<'a> Arbitrary<'a> for Message {
    fn arbitrary(uns: &mut Unstructured<'a>) -> result::Result<Self, ArbitraryError> {
        let mut topics: Vec<TopicName> = vec![];
        for _i in 0..((uns.arbitrary::<u8>()? % 4) + 1) {
            topics.push(uns.arbitrary()?);
        }
        let payload: Vec<u8> = uns.arbitrary()?;

        Ok(Message { topics, payload: payload.into() })
    }
}

struct State {
    entries: VecDeque<Message>,
    topics: BTreeSet<TopicName>,
    stopped: bool,
}

/// Owning handle for a client mailbox, held by the connection for its whole
/// lifetime. Cloning shares the same mailbox.
#[derive(Clone)]
pub struct Queue {
    id: QueueId,
    state: Arc<Mutex<State>>,
}

impl Queue {
    pub fn new(id: QueueId) -> Queue {
        let state = State {
            entries: VecDeque::default(),
            topics: BTreeSet::default(),
            stopped: false,
        };
        Queue { id, state: Arc::new(Mutex::new(state)) }
    }

    pub fn id(&self) -> QueueId {
        self.id
    }

    /// Weak back-reference for shard tables. Upgrading fails once every
    /// owning handle is gone.
    pub fn to_ref(&self) -> QueueRef {
        QueueRef { id: self.id, state: Arc::downgrade(&self.state) }
    }

    /// Atomically return and remove all buffered messages, in the order the
    /// shards appended them. A drained or stopped queue yields an empty
    /// list.
    pub fn drain(&self) -> Vec<Message> {
        let mut state = lock(&self.state);
        state.entries.drain(..).collect()
    }

    /// Mark the queue dead and discard its buffer. Subsequent enqueues are
    /// dropped silently, they race with shard cleanup and must not crash.
    /// Idempotent.
    pub fn stop(&self) {
        let mut state = lock(&self.state);
        state.stopped = true;
        state.entries.clear();
    }

    /// Snapshot of the topics this queue believes it is subscribed to.
    pub fn subscribed_topics(&self) -> Vec<TopicName> {
        let state = lock(&self.state);
        state.topics.iter().cloned().collect()
    }
}

/// Weak reference to a [Queue], the only form shards are allowed to hold.
/// Every operation silently no-ops when the queue is stopped or gone.
#[derive(Clone)]
pub struct QueueRef {
    id: QueueId,
    state: Weak<Mutex<State>>,
}

impl QueueRef {
    pub fn id(&self) -> QueueId {
        self.id
    }

    /// Append one message, in FIFO order. Non-blocking, never fails.
    pub fn enqueue(&self, msg: Message) {
        if let Some(state) = self.state.upgrade() {
            let mut state = lock(&state);
            if !state.stopped {
                state.entries.push_back(msg);
            }
        }
    }

    /// Note `topics` in the queue's own subscription view. Idempotent per
    /// topic.
    pub fn record_subscription(&self, topics: &[TopicName]) {
        if let Some(state) = self.state.upgrade() {
            let mut state = lock(&state);
            if !state.stopped {
                for topic in topics.iter() {
                    state.topics.insert(topic.clone());
                }
            }
        }
    }

    /// Inverse of [QueueRef::record_subscription].
    pub fn forget_subscription(&self, topics: &[TopicName]) {
        if let Some(state) = self.state.upgrade() {
            let mut state = lock(&state);
            for topic in topics.iter() {
                state.topics.remove(topic);
            }
        }
    }
}

// a poisoned mailbox still has to serve teardown
fn lock(state: &Mutex<State>) -> MutexGuard<State> {
    match state.lock() {
        Ok(guard) => guard,
        Err(poison) => poison.into_inner(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn topic(s: &str) -> TopicName {
        TopicName::try_from(s).unwrap()
    }

    fn msg(topic_name: &str, payload: &[u8]) -> Message {
        Message::new(vec![topic(topic_name)], payload.into())
    }

    #[test]
    fn test_fifo_drain() {
        let queue = Queue::new(QueueId::new());
        let qref = queue.to_ref();
        for i in 0..10_u8 {
            qref.enqueue(msg("t", &[i]));
        }

        let entries = queue.drain();
        assert_eq!(entries.len(), 10);
        for (i, entry) in entries.iter().enumerate() {
            assert_eq!(&*entry.payload, &[i as u8]);
        }
    }

    #[test]
    fn test_drain_idempotent_after_empty() {
        let queue = Queue::new(QueueId::new());
        queue.to_ref().enqueue(msg("t", b"x"));
        assert_eq!(queue.drain().len(), 1);
        assert_eq!(queue.drain().len(), 0);
        assert_eq!(queue.drain().len(), 0);
    }

    #[test]
    fn test_enqueue_after_stop_is_noop() {
        let queue = Queue::new(QueueId::new());
        let qref = queue.to_ref();
        qref.enqueue(msg("t", b"kept"));
        queue.stop();
        qref.enqueue(msg("t", b"dropped"));
        assert_eq!(queue.drain().len(), 0);

        queue.stop(); // idempotent
    }

    #[test]
    fn test_enqueue_after_owner_gone_is_noop() {
        let queue = Queue::new(QueueId::new());
        let qref = queue.to_ref();
        std::mem::drop(queue);
        qref.enqueue(msg("t", b"late"));
        qref.record_subscription(&[topic("t")]);
        qref.forget_subscription(&[topic("t")]);
    }

    #[test]
    fn test_subscription_view() {
        let queue = Queue::new(QueueId::new());
        let qref = queue.to_ref();
        qref.record_subscription(&[topic("a"), topic("b")]);
        qref.record_subscription(&[topic("a")]); // idempotent
        assert_eq!(queue.subscribed_topics(), vec![topic("a"), topic("b")]);

        qref.forget_subscription(&[topic("a"), topic("c")]);
        assert_eq!(queue.subscribed_topics(), vec![topic("b")]);
    }
}
