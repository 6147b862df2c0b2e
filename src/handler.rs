//! Connection handler, one thread per connected client.
//!
//! The handler owns the client's [Queue] for the connection's lifetime and
//! is the crash isolation boundary: whatever way the connection ends, a
//! protocol violation, a timeout, a peer reset or a panic, the same
//! teardown compensation runs: stop the queue, evict it from every shard,
//! release the admission slot. No other connection is affected.

use log::{debug, error, info, trace};
use mio::event::Events;

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering::SeqCst};
use std::sync::Arc;
use std::{cmp, io, mem, net, thread, time};

use crate::memcache::{self, McRead, McWrite};
use crate::queue::{Queue, QueueId};
use crate::router::Router;
use crate::util;
use crate::{Config, Error, ErrorKind, Result};

/// Owning handle for a spawned connection thread, kept by the listener so
/// shutdown can join every live connection.
pub struct Handler {
    pub prefix: String,
    handle: thread::JoinHandle<()>,
}

impl Handler {
    pub fn spawn(
        config: Config,
        mut conn: mio::net::TcpStream,
        addr: net::SocketAddr,
        router: Arc<Router>,
        active: Arc<AtomicUsize>,
        shutdown: Arc<AtomicBool>,
    ) -> Result<Handler> {
        let id = QueueId::new();
        let prefix = format!("{}-{}", config.name, util::client_name(&addr));

        let poll = err!(IOError, try: mio::Poll::new(), "fail creating mio::Poll")?;
        err!(
            IOError,
            try: poll.registry().register(
                &mut conn,
                Session::TOKEN_CONN,
                mio::Interest::READABLE | mio::Interest::WRITABLE,
            ),
            "{} fail registering socket",
            prefix
        )?;

        let queue = Queue::new(id);
        let session = Session {
            prefix: prefix.clone(),
            config,
            conn,
            poll,
            router: Arc::clone(&router),
            queue: queue.clone(),
            shutdown,
            rd: McRead::default(),
            wt: McWrite::default(),
        };

        let thrd_prefix = prefix.clone();
        let handle = thread::Builder::new().name(prefix.clone()).spawn(move || {
            info!("{} accepted, queue:{}", thrd_prefix, id);

            let res = panic::catch_unwind(AssertUnwindSafe(move || session.serve()));
            match &res {
                Ok(Ok(())) => info!("{} connection closed", thrd_prefix),
                Ok(Err(err)) if err.kind() == ErrorKind::Disconnected => {
                    debug!("{} disconnected, {}", thrd_prefix, err)
                }
                Ok(Err(err)) => error!("{} connection failed, {}", thrd_prefix, err),
                Err(_) => error!("{} handler paniced", thrd_prefix),
            }

            // teardown compensation, runs on every exit path
            let topics = queue.subscribed_topics();
            debug!("{} teardown queue:{} topics:{}", thrd_prefix, id, topics.len());
            queue.stop();
            if let Err(err) = router.drop_queue(id) {
                error!("{} dropping queue {}: {}", thrd_prefix, id, err);
            }
            active.fetch_sub(1, SeqCst);
        });
        let handle = err!(IOError, try: handle, "{} fail spawning thread", prefix)?;

        Ok(Handler { prefix, handle })
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    pub fn join(self) -> thread::Result<()> {
        self.handle.join()
    }
}

/// Thread side state for one connection.
struct Session {
    prefix: String,
    config: Config,
    conn: mio::net::TcpStream,
    poll: mio::Poll,
    router: Arc<Router>,
    queue: Queue,
    shutdown: Arc<AtomicBool>,
    rd: McRead,
    wt: McWrite,
}

impl Session {
    const TOKEN_CONN: mio::Token = mio::Token(1);

    fn serve(mut self) -> Result<()> {
        let idle = time::Duration::from_secs(self.config.sock_client_timeout);
        let mut events = Events::with_capacity(crate::POLL_EVENTS_SIZE);
        let mut deadline = time::Instant::now() + idle;

        loop {
            if self.shutdown.load(SeqCst) {
                info!("{} server shutting down", self.prefix);
                break Ok(());
            }
            let now = time::Instant::now();
            if now >= deadline {
                error!("{} no complete request for {:?}, closing", self.prefix, idle);
                break err!(Disconnected, desc: "{} idle timeout", self.prefix);
            }

            let timeout = cmp::min(deadline - now, crate::POLL_PERIOD);
            match self.poll.poll(&mut events, Some(timeout)) {
                Ok(()) => (),
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    break err!(IOError, try: Err(err), "{} poll error", self.prefix)
                }
            }

            match self.read_requests(&mut deadline) {
                Ok(true) => break Ok(()), // quit
                Ok(false) => (),
                Err(err)
                    if err.kind() == ErrorKind::ProtocolError
                        || err.kind() == ErrorKind::InsufficientBytes =>
                {
                    // best effort ERROR reply before dropping the client
                    let _ = self.write_reply(memcache::ERROR.to_vec());
                    break Err(err);
                }
                Err(err) => break Err(err),
            }
        }
    }

    // Drain the socket, dispatching every complete request. Return true
    // when the client said quit.
    fn read_requests(&mut self, deadline: &mut time::Instant) -> Result<bool> {
        loop {
            let rd = mem::replace(&mut self.rd, McRead::None);
            let (rd, would_block) = rd.read(&mut self.conn)?;
            self.rd = rd;

            if let McRead::Fin { .. } = &self.rd {
                let req = self.rd.parse()?;
                let rd = mem::replace(&mut self.rd, McRead::None);
                self.rd = rd.reset();

                let idle = time::Duration::from_secs(self.config.sock_client_timeout);
                *deadline = time::Instant::now() + idle;

                if self.handle_request(req)? {
                    return Ok(true);
                }
            } else if would_block {
                return Ok(false);
            }
        }
    }

    fn handle_request(&mut self, req: memcache::Request) -> Result<bool> {
        use memcache::Request::*;

        match req {
            Quit => {
                trace!("{} quit", self.prefix);
                Ok(true)
            }
            GetMessages => {
                let msgs = self.queue.drain();
                debug!("{} fetched {} messages", self.prefix, msgs.len());
                self.write_reply(memcache::encode_fetch_reply(&msgs))?;
                Ok(false)
            }
            Subscribe { topics } => {
                trace!("{} subscribe {} topics", self.prefix, topics.len());
                self.router.subscribe(&self.queue, topics)?;
                self.write_reply(memcache::STORED.to_vec())?;
                Ok(false)
            }
            Unsubscribe { topics } => {
                trace!("{} unsubscribe {} topics", self.prefix, topics.len());
                self.router.unsubscribe(&self.queue, topics)?;
                self.write_reply(memcache::STORED.to_vec())?;
                Ok(false)
            }
            Publish { msgs } => {
                trace!("{} publish {} messages", self.prefix, msgs.len());
                for msg in msgs.into_iter() {
                    self.router.publish(msg.topics, msg.payload)?;
                }
                self.write_reply(memcache::STORED.to_vec())?;
                Ok(false)
            }
        }
    }

    // Flush one response. The socket write never runs under any shard's
    // serialization, backpressure only stalls this one client.
    fn write_reply(&mut self, data: Vec<u8>) -> Result<()> {
        let wt = mem::replace(&mut self.wt, McWrite::None);
        let mut wt = wt.reset(data);
        let mut events = Events::with_capacity(4);
        let deadline =
            time::Instant::now() + time::Duration::from_secs(self.config.sock_write_timeout);

        loop {
            let (state, _would_block) = wt.write(&mut self.conn)?;
            wt = state;
            if let McWrite::Fin = wt {
                self.wt = wt;
                return Ok(());
            }

            if self.shutdown.load(SeqCst) {
                self.wt = wt;
                return err!(Disconnected, desc: "{} shutdown while writing", self.prefix);
            }
            let now = time::Instant::now();
            if now >= deadline {
                error!("{} write blocked too long, closing", self.prefix);
                self.wt = wt;
                return err!(Disconnected, desc: "{} write timeout", self.prefix);
            }

            let timeout = cmp::min(deadline - now, crate::POLL_PERIOD);
            match self.poll.poll(&mut events, Some(timeout)) {
                Ok(()) => (),
                Err(err) if err.kind() == io::ErrorKind::Interrupted => (),
                Err(err) => {
                    self.wt = wt;
                    return err!(IOError, try: Err(err), "{} poll error", self.prefix);
                }
            }
        }
    }
}
