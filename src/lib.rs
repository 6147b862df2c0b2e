//! Topic based publish/subscribe broker.
//!
//! Clients connect over TCP, subscribe to an arbitrary set of topic names,
//! publish messages into topics and drain their per-connection mailbox with
//! an explicit fetch. The wire protocol mimics memcached's line + body
//! framing, refer [memcache], so off-the-shelf cache clients can drive the
//! broker.
//!
//! Internals, bottom up:
//!
//! * [queue], per client mailbox, owned by its connection, weakly referenced
//!   by the routing tables.
//! * [shard], one partition of the topic to subscriber index, serialized on
//!   its own thread.
//! * [router], deterministic topic to shard fan-out, also the shard
//!   supervisor.
//! * [handler], per connection protocol loop.
//! * [listener], bounded admission of TCP clients.
//! * [broker], ties the above into one node, refer [broker::Broker] for the
//!   entry point.

#[macro_use]
pub mod error;

pub mod broker;
pub mod config;
pub mod handler;
pub mod listener;
pub mod memcache;
pub mod queue;
pub mod router;
pub mod shard;
pub mod thread;
pub mod types;
pub mod util;

pub use broker::{AppTx, Broker};
pub use config::Config;
pub use error::{Error, ErrorKind, Result};
pub use queue::{Message, Queue, QueueId, QueueRef};
pub use router::Router;
pub use types::TopicName;

use std::time;

/// Number of mio events pulled in a single poll.
pub const POLL_EVENTS_SIZE: usize = 1024;

/// Bound on a thread's control channel, and on the batch drained from it.
pub const CONTROL_CHAN_SIZE: usize = 1024;

/// Upper bound on a single command line; bodies are unbounded, they are
/// byte counted.
pub const MAX_LINE_SIZE: usize = 1024;

/// Slice used for socket poll timeouts, bounds the latency of noticing the
/// shutdown flag and the idle deadline.
pub const POLL_PERIOD: time::Duration = time::Duration::from_millis(500);
