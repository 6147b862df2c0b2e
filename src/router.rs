//! Router, the deterministic front of the sharded topic index.
//!
//! Topic to shard assignment is a pure function of the topic bytes, so the
//! same topic always lands on the same shard and no global lock exists.
//! Subscribe, unsubscribe and publish partition their topic set by shard,
//! dispatch every partition in parallel and return once all involved shards
//! acknowledged. The router also plays supervisor: a crashed shard is
//! replaced with a fresh one holding empty state.

use log::{error, info, warn};

use std::collections::BTreeMap;
use std::mem;
use std::sync::{mpsc, Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::queue::{Queue, QueueId};
use crate::shard::{self, Shard};
use crate::{Config, TopicName};
use crate::{Error, ErrorKind, Result};

pub struct Router {
    prefix: String,
    config: Config,
    /// Fixed at startup; a slot is only ever written to replace a crashed
    /// shard.
    shards: Vec<RwLock<Shard>>,
}

/// Shard index owning `topic`, a pure function of the topic bytes.
pub fn shard_of(topic: &TopicName, num_shards: u32) -> u32 {
    (cityhash_rs::cityhash_110_128(topic.as_ref()) % (num_shards as u128)) as u32
}

impl Router {
    pub fn from_config(config: Config) -> Result<Router> {
        let num_shards = config.num_shards();
        if num_shards == 0 {
            err!(InvalidInput, desc: "num_router_shards can't be ZERO")?;
        }

        let mut shards = Vec::with_capacity(num_shards as usize);
        for shard_id in 0..num_shards {
            let shard = Shard::from_config(config.clone(), shard_id)?.spawn()?;
            shards.push(RwLock::new(shard));
        }

        let prefix = format!("{}-router", config.name);
        info!("{} spawn num_shards:{} ...", prefix, num_shards);

        Ok(Router { prefix, config, shards })
    }

    pub fn num_shards(&self) -> u32 {
        self.shards.len() as u32
    }

    pub fn shard_of(&self, topic: &TopicName) -> u32 {
        shard_of(topic, self.num_shards())
    }

    /// Install `(queue, topic)` pairs, each in the shard owning the topic.
    /// Returns after every involved shard acknowledged.
    pub fn subscribe(&self, queue: &Queue, topics: Vec<TopicName>) -> Result<()> {
        if topics.is_empty() {
            return Ok(());
        }
        let reqs: Vec<(usize, shard::Request)> = self
            .partition(topics)
            .into_iter()
            .map(|(idx, topics)| {
                (idx, shard::Request::Subscribe { queue: queue.to_ref(), topics })
            })
            .collect();
        self.fanout(reqs)
    }

    pub fn unsubscribe(&self, queue: &Queue, topics: Vec<TopicName>) -> Result<()> {
        if topics.is_empty() {
            return Ok(());
        }
        let reqs: Vec<(usize, shard::Request)> = self
            .partition(topics)
            .into_iter()
            .map(|(idx, topics)| {
                (idx, shard::Request::Unsubscribe { queue: queue.to_ref(), topics })
            })
            .collect();
        self.fanout(reqs)
    }

    /// Deliver `payload` to every queue subscribed to any of `topics`. The
    /// publishing queue is not filtered out: a publisher subscribed to its
    /// own topic receives its own message.
    pub fn publish(&self, topics: Vec<TopicName>, payload: Arc<[u8]>) -> Result<()> {
        if topics.is_empty() {
            return Ok(());
        }
        if topics.len() > self.config.router_min_publish_to_topics_to_warn {
            warn!(
                "{} publish to {} topics, threshold {}",
                self.prefix,
                topics.len(),
                self.config.router_min_publish_to_topics_to_warn
            );
        }

        let reqs: Vec<(usize, shard::Request)> = self
            .partition(topics)
            .into_iter()
            .map(|(idx, topics)| {
                (idx, shard::Request::Publish { topics, payload: Arc::clone(&payload) })
            })
            .collect();
        self.fanout(reqs)
    }

    /// Evict every reference to `id` from every shard. Must run to
    /// completion before the queue's storage is released; every shard is
    /// asked even when one of them fails.
    pub fn drop_queue(&self, id: QueueId) -> Result<()> {
        let reqs = (0..self.shards.len())
            .map(|idx| (idx, shard::Request::DropQueue { id }))
            .collect();
        self.fanout(reqs)
    }

    /// Aggregate point in time counters from every shard, in shard order.
    pub fn stats(&self) -> Result<Vec<shard::Stats>> {
        let mut stats = Vec::with_capacity(self.shards.len());
        for idx in 0..self.shards.len() {
            // bind before matching, the slot guard must not outlive the
            // call or restart_shard below would deadlock on the same slot
            let res = self.read_shard(idx).request(shard::Request::Stats);
            match res {
                Ok(shard::Response::Stats(s)) => stats.push(s),
                Ok(_) => unreachable!(),
                Err(err) => {
                    self.restart_shard(idx);
                    return Err(err);
                }
            }
        }

        Ok(stats)
    }

    /// Close every shard and wait for their threads. Crashed shards are
    /// skipped with an error log.
    pub fn close(&self) -> Result<()> {
        info!("{} closing {} shards ...", self.prefix, self.shards.len());
        for idx in 0..self.shards.len() {
            let shard = {
                let mut slot = self.write_shard(idx);
                mem::replace(&mut *slot, Shard::default())
            };
            match shard.close_wait() {
                Ok(_shard) => (),
                Err(err) => error!("{} shard-{} close: {}", self.prefix, idx, err),
            }
        }

        Ok(())
    }
}

impl Router {
    fn partition(&self, topics: Vec<TopicName>) -> BTreeMap<usize, Vec<TopicName>> {
        let mut parts: BTreeMap<usize, Vec<TopicName>> = BTreeMap::default();
        for topic in topics.into_iter() {
            let idx = self.shard_of(&topic) as usize;
            parts.entry(idx).or_default().push(topic);
        }

        parts
    }

    // Dispatch one request per involved shard, then wait for every ack.
    fn fanout(&self, reqs: Vec<(usize, shard::Request)>) -> Result<()> {
        let mut pending: Vec<(usize, mpsc::Receiver<Result<shard::Response>>)> =
            Vec::with_capacity(reqs.len());

        let mut res = Ok(());
        for (idx, req) in reqs.into_iter() {
            // bind before matching, the slot guard must not outlive the
            // call or restart_shard below would deadlock on the same slot
            let submitted = self.read_shard(idx).submit(req);
            match submitted {
                Ok(resp_rx) => pending.push((idx, resp_rx)),
                Err(err) => {
                    self.restart_shard(idx);
                    if res.is_ok() {
                        res = Err(err);
                    }
                }
            }
        }

        for (idx, resp_rx) in pending.into_iter() {
            match resp_rx.recv() {
                Ok(Ok(_resp)) => (),
                Ok(Err(err)) => {
                    if res.is_ok() {
                        res = Err(err);
                    }
                }
                Err(err) => {
                    self.restart_shard(idx);
                    if res.is_ok() {
                        res = err!(
                            IPCFail,
                            desc: "{} shard-{} lost while waiting: {}",
                            self.prefix,
                            idx,
                            err
                        );
                    }
                }
            }
        }

        res
    }

    // Fail-stop supervision: replace a dead shard with a fresh one holding
    // empty state. Subscriptions buffered in the dead shard are gone, an
    // accepted availability over consistency trade.
    fn restart_shard(&self, idx: usize) {
        let mut slot = self.write_shard(idx);
        if slot.is_alive() {
            // another caller already replaced it
            return;
        }

        let shard_id = idx as u32;
        match Shard::from_config(self.config.clone(), shard_id).and_then(|s| s.spawn()) {
            Ok(shard) => {
                error!("{} shard-{} crashed, restarted with empty state", self.prefix, idx);
                *slot = shard;
            }
            Err(err) => error!("{} shard-{} restart failed: {}", self.prefix, idx, err),
        }
    }

    // a poisoned slot still holds a usable handle
    fn read_shard(&self, idx: usize) -> RwLockReadGuard<Shard> {
        match self.shards[idx].read() {
            Ok(guard) => guard,
            Err(poison) => poison.into_inner(),
        }
    }

    fn write_shard(&self, idx: usize) -> RwLockWriteGuard<Shard> {
        match self.shards[idx].write() {
            Ok(guard) => guard,
            Err(poison) => poison.into_inner(),
        }
    }
}
