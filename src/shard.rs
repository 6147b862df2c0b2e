//! Shard thread owning one partition of the topic to subscriber index.
//!
//! A shard is the linearization point for its share of the topic space:
//! every mutation and every publish touching a topic of this shard goes
//! through the shard's control channel and is applied on the shard thread,
//! one request at a time. Shards never talk to each other, concurrent
//! publishes on disjoint topic partitions proceed in parallel.

use log::{debug, error, info, trace, warn};
use mio::event::Events;

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{mpsc, Arc};
use std::{io, mem};

use crate::queue::{Message, QueueId, QueueRef};
use crate::thread::{pending_requests, Rx, Thread, Threadable};
use crate::{Config, TopicName};
use crate::{Error, ErrorKind, Result};

type ThreadRx = Rx<Request, Result<Response>>;

pub struct Shard {
    /// Shard identifier, unique within this node.
    pub shard_id: u32,
    prefix: String,
    config: Config,
    inner: Inner,
}

enum Inner {
    Init,
    // Held by Router.
    Handle(Arc<mio::Waker>, Thread<Shard, Request, Result<Response>>),
    Main(RunLoop),
}

struct RunLoop {
    /// Mio pooler aggregating waker events from the handle side.
    poll: mio::Poll,
    /// Subscribers of every topic this shard owns.
    subs: BTreeMap<TopicName, BTreeMap<QueueId, QueueRef>>,
    /// Topics of this shard held by each queue, inverse image of `subs`.
    owned: BTreeMap<QueueId, BTreeSet<TopicName>>,
    /// Thread is already closed.
    closed: bool,
}

impl Default for Shard {
    fn default() -> Shard {
        let config = Config::default();
        let mut def = Shard {
            shard_id: u32::default(),
            prefix: String::default(),
            config,
            inner: Inner::Init,
        };
        def.prefix = def.prefix();
        def
    }
}

impl Drop for Shard {
    fn drop(&mut self) {
        let inner = mem::replace(&mut self.inner, Inner::Init);
        match inner {
            Inner::Init => debug!("{} drop ...", self.prefix),
            // a live handle is only dropped when the shard crashed and got
            // replaced, or at close
            Inner::Handle(_waker, _thrd) => info!("{} drop handle ...", self.prefix),
            Inner::Main(_run_loop) => info!("{} drop ...", self.prefix),
        }
    }
}

pub enum Request {
    Subscribe { queue: QueueRef, topics: Vec<TopicName> },
    Unsubscribe { queue: QueueRef, topics: Vec<TopicName> },
    Publish { topics: Vec<TopicName>, payload: Arc<[u8]> },
    DropQueue { id: QueueId },
    Stats,
    Close,
}

pub enum Response {
    Ok,
    Stats(Stats),
}

/// Point in time counters over one shard's index.
#[derive(Clone, Copy, Default, Debug)]
pub struct Stats {
    /// Number of topics with at least one subscriber.
    pub topics: usize,
    /// Number of (queue, topic) pairs installed.
    pub subscriptions: usize,
    /// Number of queues holding at least one topic of this shard.
    pub queues: usize,
}

// Handle shard
impl Shard {
    /// Poll register token for waker event, control requests made to this
    /// thread trigger this event.
    pub const TOKEN_WAKE: mio::Token = mio::Token(1);

    /// Create a shard in `Init` state, to start it call [Shard::spawn].
    pub fn from_config(config: Config, shard_id: u32) -> Result<Shard> {
        let mut val = Shard {
            shard_id,
            prefix: String::default(),
            config,
            inner: Inner::Init,
        };
        val.prefix = val.prefix();

        Ok(val)
    }

    pub fn spawn(self) -> Result<Shard> {
        if matches!(&self.inner, Inner::Handle(_, _) | Inner::Main(_)) {
            err!(InvalidInput, desc: "shard can be spawned only in init-state")?;
        }

        let poll = err!(IOError, try: mio::Poll::new(), "fail creating mio::Poll")?;
        let waker = Arc::new(mio::Waker::new(poll.registry(), Self::TOKEN_WAKE)?);

        let shard = Shard {
            shard_id: self.shard_id,
            prefix: self.prefix.clone(),
            config: self.config.clone(),
            inner: Inner::Main(RunLoop {
                poll,
                subs: BTreeMap::default(),
                owned: BTreeMap::default(),
                closed: false,
            }),
        };
        let thrd = Thread::spawn(&self.prefix, shard);

        let shard = Shard {
            shard_id: self.shard_id,
            prefix: self.prefix.clone(),
            config: self.config.clone(),
            inner: Inner::Handle(waker, thrd),
        };

        Ok(shard)
    }

    /// True while the shard thread is still serving requests.
    pub fn is_alive(&self) -> bool {
        match &self.inner {
            Inner::Handle(_waker, thrd) => !thrd.is_finished(),
            _ => false,
        }
    }
}

// calls to interface with shard-thread.
impl Shard {
    /// Queue `req` on the shard and wake it up; the response can be
    /// collected later from the returned receiver. Lets the router fan a
    /// publish across shards before waiting on any of them.
    pub fn submit(&self, req: Request) -> Result<mpsc::Receiver<Result<Response>>> {
        match &self.inner {
            Inner::Handle(waker, thrd) => {
                let resp_rx = thrd.submit(req)?;
                // wake strictly after the send, lest the wakeup is lost
                err!(IOError, try: waker.wake(), "{} fail waking shard", self.prefix)?;
                Ok(resp_rx)
            }
            _ => unreachable!(),
        }
    }

    pub fn request(&self, req: Request) -> Result<Response> {
        let resp_rx = self.submit(req)?;
        err!(IPCFail, try: resp_rx.recv())?
    }

    pub fn close_wait(mut self) -> Result<Shard> {
        let inner = mem::replace(&mut self.inner, Inner::Init);
        match inner {
            Inner::Handle(waker, thrd) => {
                let resp_rx = thrd.submit(Request::Close)?;
                err!(IOError, try: waker.wake(), "{} fail waking shard", self.prefix)?;
                err!(IPCFail, try: resp_rx.recv())??;
                thrd.close_wait()
            }
            _ => unreachable!(),
        }
    }
}

impl Threadable for Shard {
    type Req = Request;
    type Resp = Result<Response>;

    fn main_loop(mut self, rx: ThreadRx) -> Self {
        info!("{} spawn, one of {} shards ...", self.prefix, self.config.num_shards());

        let mut events = Events::with_capacity(crate::POLL_EVENTS_SIZE);
        let res = loop {
            match self.as_mut_poll().poll(&mut events, None) {
                Ok(()) => (),
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    break err!(IOError, try: Err(err), "{} poll error", self.prefix)
                }
            };

            match self.mio_events(&rx, &events) {
                // Exit or not
                Ok(true) => break Ok(()),
                Ok(false) => (),
                Err(err) => break Err(err),
            };
        };

        let _ = self.handle_close(Request::Close); // handle_close is idempotent.

        match res {
            Ok(()) => info!("{} thread exit ...", self.prefix),
            // crashing the shard is the fail-stop path, the router respawns
            // it with empty state
            Err(err) => error!("{} fatal error, {}", self.prefix, err),
        };

        self
    }
}

impl Shard {
    // return (exit,)
    fn mio_events(&mut self, rx: &ThreadRx, events: &Events) -> Result<bool> {
        let mut count = 0_usize;
        let mut iter = events.iter();
        let res = 'outer: loop {
            match iter.next() {
                Some(event) => {
                    trace!("{} poll-event token:{}", self.prefix, event.token().0);
                    count += 1;

                    match event.token() {
                        Self::TOKEN_WAKE => loop {
                            // keep repeating until all control requests are drained
                            match self.drain_control_chan(rx)? {
                                (_empty, true) => break 'outer Ok(true),
                                (true, _disconnected) => break,
                                (false, false) => (),
                            }
                        },
                        _ => unreachable!(),
                    }
                }
                None => break Ok(false),
            }
        };

        debug!("{} polled and got {} events", self.prefix, count);
        res
    }

    // Return (empty, exit)
    fn drain_control_chan(&mut self, rx: &ThreadRx) -> Result<(bool, bool)> {
        use Request::*;

        let closed = match &self.inner {
            Inner::Main(RunLoop { closed, .. }) => *closed,
            _ => unreachable!(),
        };

        let (mut qs, empty, disconnected) = pending_requests(rx, crate::CONTROL_CHAN_SIZE);

        if closed {
            info!("{} skipping {} requests closed:{}", self.prefix, qs.len(), closed);
            qs.drain(..);
        } else {
            debug!("{} process {} requests closed:{}", self.prefix, qs.len(), closed);
        }

        for q in qs.into_iter() {
            match q {
                (q @ Subscribe { .. }, Some(tx)) => {
                    err!(IPCFail, try: tx.send(self.handle_subscribe(q)))?;
                }
                (q @ Unsubscribe { .. }, Some(tx)) => {
                    err!(IPCFail, try: tx.send(self.handle_unsubscribe(q)))?;
                }
                (q @ Publish { .. }, Some(tx)) => {
                    err!(IPCFail, try: tx.send(self.handle_publish(q)))?;
                }
                (q @ DropQueue { .. }, Some(tx)) => {
                    err!(IPCFail, try: tx.send(self.handle_drop_queue(q)))?;
                }
                (q @ Stats, Some(tx)) => {
                    err!(IPCFail, try: tx.send(self.handle_stats(q)))?;
                }
                (q @ Close, Some(tx)) => {
                    err!(IPCFail, try: tx.send(self.handle_close(q)))?;
                }

                (_, _) => unreachable!(),
            };
        }

        let exit = disconnected
            || matches!(&self.inner, Inner::Main(RunLoop { closed: true, .. }));
        Ok((empty, exit))
    }
}

// Main loop
impl Shard {
    fn handle_subscribe(&mut self, req: Request) -> Result<Response> {
        let (queue, topics) = match req {
            Request::Subscribe { queue, topics } => (queue, topics),
            _ => unreachable!(),
        };
        let RunLoop { subs, owned, .. } = self.as_mut_run_loop();

        for topic in topics.iter() {
            // re-subscribing an installed (queue, topic) pair is a no-op
            subs.entry(topic.clone()).or_default().insert(queue.id(), queue.clone());
            owned.entry(queue.id()).or_default().insert(topic.clone());
        }
        queue.record_subscription(&topics);

        trace!("{} subscribe queue:{} topics:{}", self.prefix, queue.id(), topics.len());
        Ok(Response::Ok)
    }

    fn handle_unsubscribe(&mut self, req: Request) -> Result<Response> {
        let (queue, topics) = match req {
            Request::Unsubscribe { queue, topics } => (queue, topics),
            _ => unreachable!(),
        };
        let RunLoop { subs, owned, .. } = self.as_mut_run_loop();

        for topic in topics.iter() {
            // removing an absent pair is a no-op; empty sets are garbage
            // collected to keep the maps bounded
            if let Some(set) = subs.get_mut(topic) {
                set.remove(&queue.id());
                if set.is_empty() {
                    subs.remove(topic);
                }
            }
            if let Some(set) = owned.get_mut(&queue.id()) {
                set.remove(topic);
                if set.is_empty() {
                    owned.remove(&queue.id());
                }
            }
        }
        queue.forget_subscription(&topics);

        trace!("{} unsubscribe queue:{} topics:{}", self.prefix, queue.id(), topics.len());
        Ok(Response::Ok)
    }

    fn handle_publish(&mut self, req: Request) -> Result<Response> {
        let (topics, payload) = match req {
            Request::Publish { topics, payload } => (topics, payload),
            _ => unreachable!(),
        };
        let min_fanout = self.config.router_min_fanout_to_warn;
        let RunLoop { subs, .. } = self.as_mut_run_loop();

        // distinct targets; a queue matching several topics gets a single
        // entry carrying all of them
        let mut targets: BTreeMap<QueueId, (QueueRef, Vec<TopicName>)> = BTreeMap::default();
        for topic in topics.iter() {
            if let Some(set) = subs.get(topic) {
                for (id, queue) in set.iter() {
                    targets
                        .entry(*id)
                        .or_insert_with(|| (queue.clone(), Vec::default()))
                        .1
                        .push(topic.clone());
                }
            }
        }

        if targets.len() > min_fanout {
            warn!(
                "{} publish fan-out {} queues, threshold {}",
                self.prefix,
                targets.len(),
                min_fanout
            );
        }

        for (_id, (queue, matched)) in targets.into_iter() {
            queue.enqueue(Message::new(matched, Arc::clone(&payload)));
        }

        Ok(Response::Ok)
    }

    fn handle_drop_queue(&mut self, req: Request) -> Result<Response> {
        let id = match req {
            Request::DropQueue { id } => id,
            _ => unreachable!(),
        };
        let RunLoop { subs, owned, .. } = self.as_mut_run_loop();

        if let Some(topics) = owned.remove(&id) {
            for topic in topics.iter() {
                if let Some(set) = subs.get_mut(topic) {
                    set.remove(&id);
                    if set.is_empty() {
                        subs.remove(topic);
                    }
                }
            }
            debug!("{} dropped queue:{} topics:{}", self.prefix, id, topics.len());
        }

        Ok(Response::Ok)
    }

    fn handle_stats(&mut self, _req: Request) -> Result<Response> {
        let prefix = self.prefix.clone();
        let RunLoop { subs, owned, .. } = self.as_mut_run_loop();

        // the two maps must stay inverse images of each other; going out of
        // sync is an internal logic error and fail-stop is the disposition
        for (topic, set) in subs.iter() {
            for id in set.keys() {
                let ok = owned.get(id).map(|ts| ts.contains(topic)).unwrap_or(false);
                if !ok {
                    panic!("{} index out of sync, queue:{} topic:{:?}", prefix, id, topic);
                }
            }
        }
        for (id, ts) in owned.iter() {
            for topic in ts.iter() {
                let ok = subs.get(topic).map(|s| s.contains_key(id)).unwrap_or(false);
                if !ok {
                    panic!("{} index out of sync, queue:{} topic:{:?}", prefix, id, topic);
                }
            }
        }

        let stats = Stats {
            topics: subs.len(),
            subscriptions: subs.values().map(|s| s.len()).sum(),
            queues: owned.len(),
        };

        Ok(Response::Stats(stats))
    }

    fn handle_close(&mut self, _req: Request) -> Result<Response> {
        let RunLoop { subs, owned, closed, .. } = match &mut self.inner {
            Inner::Main(run_loop) => run_loop,
            _ => unreachable!(),
        };

        if *closed == false {
            info!("{} closing, topics:{} queues:{}", self.prefix, subs.len(), owned.len());
            subs.clear();
            owned.clear();
            *closed = true;
        }

        Ok(Response::Ok)
    }
}

impl Shard {
    fn prefix(&self) -> String {
        format!("{}-shard-{}", self.config.name, self.shard_id)
    }

    fn as_mut_poll(&mut self) -> &mut mio::Poll {
        match &mut self.inner {
            Inner::Main(RunLoop { poll, .. }) => poll,
            _ => unreachable!(),
        }
    }

    fn as_mut_run_loop(&mut self) -> &mut RunLoop {
        match &mut self.inner {
            Inner::Main(run_loop) => run_loop,
            _ => unreachable!(),
        }
    }
}
