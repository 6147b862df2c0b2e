//! Listener thread accepting TCP connections, the admission gate.
//!
//! Accepts are bounded by `max_tcp_clients`: past the cap a client gets the
//! busy reply and is dropped without a handler ever existing for it. On
//! close the listener stops accepting, raises the shared shutdown flag and
//! joins every handler thread it spawned, which makes server shutdown
//! cooperative end to end.

use log::{debug, error, info, trace, warn};
use mio::event::Events;

use std::io::Write;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering::SeqCst};
use std::sync::Arc;
use std::{io, mem, net};

use crate::broker::AppTx;
use crate::handler::Handler;
use crate::memcache;
use crate::router::Router;
use crate::thread::{pending_requests, Rx, Thread, Threadable};
use crate::{Config, Error, ErrorKind, Result};

type ThreadRx = Rx<Request, Result<Response>>;

pub struct Listener {
    prefix: String,
    config: Config,
    inner: Inner,
}

enum Inner {
    Init,
    // Held by Broker.
    Handle {
        waker: Arc<mio::Waker>,
        thrd: Thread<Listener, Request, Result<Response>>,
        addr: net::SocketAddr,
    },
    Main(RunLoop),
}

pub enum Request {
    Close,
}

pub enum Response {
    Ok,
}

struct RunLoop {
    /// Mio pooler aggregating listener readiness and waker events.
    poll: mio::Poll,
    listener: mio::net::TcpListener,
    router: Arc<Router>,
    /// Live connection count, shared with every handler.
    active: Arc<AtomicUsize>,
    /// Raised once at close; handlers watch it every poll slice.
    shutdown: Arc<AtomicBool>,
    /// Handler threads spawned so far, reaped opportunistically.
    conns: Vec<Handler>,
    /// Channel to interface with application.
    app_tx: AppTx,
    /// Thread is already closed.
    closed: bool,
}

impl Default for Listener {
    fn default() -> Listener {
        let config = Config::default();
        let mut def = Listener { prefix: String::default(), config, inner: Inner::Init };
        def.prefix = def.prefix();
        def
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        let inner = mem::replace(&mut self.inner, Inner::Init);
        match inner {
            Inner::Init => debug!("{} drop ...", self.prefix),
            Inner::Handle { .. } => info!("{} drop handle ...", self.prefix),
            Inner::Main(_run_loop) => info!("{} drop ...", self.prefix),
        }
    }
}

// Handle listener
impl Listener {
    /// Poll register token for waker event.
    pub const TOKEN_WAKE: mio::Token = mio::Token(1);
    /// Poll register token for the accepting socket.
    pub const TOKEN_LISTENER: mio::Token = mio::Token(2);

    pub fn from_config(config: Config) -> Result<Listener> {
        let mut val = Listener { prefix: String::default(), config, inner: Inner::Init };
        val.prefix = val.prefix();

        Ok(val)
    }

    pub fn spawn(
        self,
        router: Arc<Router>,
        active: Arc<AtomicUsize>,
        shutdown: Arc<AtomicBool>,
        app_tx: AppTx,
    ) -> Result<Listener> {
        if matches!(&self.inner, Inner::Handle { .. } | Inner::Main(_)) {
            err!(InvalidInput, desc: "listener can be spawned only in init-state")?;
        }

        let sock_addr = self.config.listen_address()?;
        let mut listener = err!(
            IOError,
            try: mio::net::TcpListener::bind(sock_addr),
            "{} fail binding {}",
            self.prefix,
            sock_addr
        )?;
        let addr = err!(IOError, try: listener.local_addr(), "{} local_addr", self.prefix)?;

        let poll = err!(IOError, try: mio::Poll::new(), "fail creating mio::Poll")?;
        err!(
            IOError,
            try: poll.registry().register(
                &mut listener,
                Self::TOKEN_LISTENER,
                mio::Interest::READABLE
            ),
            "{} fail registering listener",
            self.prefix
        )?;
        let waker = Arc::new(mio::Waker::new(poll.registry(), Self::TOKEN_WAKE)?);

        info!("{} listening on {} ...", self.prefix, addr);

        let listener = Listener {
            prefix: self.prefix.clone(),
            config: self.config.clone(),
            inner: Inner::Main(RunLoop {
                poll,
                listener,
                router,
                active,
                shutdown,
                conns: Vec::default(),
                app_tx,
                closed: false,
            }),
        };
        let thrd = Thread::spawn(&self.prefix, listener);

        let listener = Listener {
            prefix: self.prefix.clone(),
            config: self.config.clone(),
            inner: Inner::Handle { waker, thrd, addr },
        };

        Ok(listener)
    }

    /// Address the accepting socket is bound to; resolves an ephemeral
    /// port request.
    pub fn local_addr(&self) -> Option<net::SocketAddr> {
        match &self.inner {
            Inner::Handle { addr, .. } => Some(*addr),
            _ => None,
        }
    }

    pub fn close_wait(mut self) -> Result<()> {
        let inner = mem::replace(&mut self.inner, Inner::Init);
        match inner {
            Inner::Handle { waker, thrd, .. } => {
                let resp_rx = thrd.submit(Request::Close)?;
                err!(IOError, try: waker.wake(), "{} fail waking listener", self.prefix)?;
                err!(IPCFail, try: resp_rx.recv())??;
                thrd.close_wait()?;
                Ok(())
            }
            _ => unreachable!(),
        }
    }
}

impl Threadable for Listener {
    type Req = Request;
    type Resp = Result<Response>;

    fn main_loop(mut self, rx: ThreadRx) -> Self {
        info!(
            "{} spawn max_tcp_clients:{} ...",
            self.prefix, self.config.max_tcp_clients
        );

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
            Err(err) => {
                let msg = format!("fatal error, {}", err);
                allow_panic!(self.prefix, self.as_app_tx().send(msg));
            }
        };

        self
    }
}

impl Listener {
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
                            match self.drain_control_chan(rx)? {
                                (_empty, true) => break 'outer Ok(true),
                                (true, _disconnected) => break,
                                (false, false) => (),
                            }
                        },
                        Self::TOKEN_LISTENER => self.accept_conns()?,
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
        }

        for q in qs.into_iter() {
            match q {
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

    fn accept_conns(&mut self) -> Result<()> {
        loop {
            let accepted = match &mut self.inner {
                Inner::Main(RunLoop { listener, .. }) => listener.accept(),
                _ => unreachable!(),
            };
            match accepted {
                Ok((conn, addr)) => self.handle_accept(conn, addr),
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => break Ok(()),
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    // transient accept failures must not take the gate down
                    warn!("{} accept failed: {}", self.prefix, err);
                    break Ok(());
                }
            }
        }
    }

    fn handle_accept(&mut self, mut conn: mio::net::TcpStream, addr: net::SocketAddr) {
        let max_tcp_clients = self.config.max_tcp_clients;
        let config = self.config.clone();
        let prefix = self.prefix.clone();
        let RunLoop { router, active, shutdown, conns, .. } = match &mut self.inner {
            Inner::Main(run_loop) => run_loop,
            _ => unreachable!(),
        };

        // reap handlers that exited on their own
        conns.retain(|handler| !handler.is_finished());

        if active.load(SeqCst) >= max_tcp_clients {
            warn!("{} rejecting {}, {} clients active", prefix, addr, active.load(SeqCst));
            let _ = conn.write(memcache::SERVER_BUSY);
            return; // dropping the stream closes it
        }

        active.fetch_add(1, SeqCst);
        let res = Handler::spawn(
            config,
            conn,
            addr,
            Arc::clone(router),
            Arc::clone(active),
            Arc::clone(shutdown),
        );
        match res {
            Ok(handler) => conns.push(handler),
            Err(err) => {
                active.fetch_sub(1, SeqCst);
                error!("{} handler for {}: {}", prefix, addr, err);
            }
        }
    }

    fn handle_close(&mut self, _req: Request) -> Result<Response> {
        let prefix = self.prefix.clone();
        let RunLoop { shutdown, conns, closed, .. } = match &mut self.inner {
            Inner::Main(run_loop) => run_loop,
            _ => unreachable!(),
        };

        if *closed == false {
            info!("{} closing, {} connections live", prefix, conns.len());
            shutdown.store(true, SeqCst);
            for handler in conns.drain(..) {
                let hndl_prefix = handler.prefix.clone();
                match handler.join() {
                    Ok(()) => trace!("{} joined {}", prefix, hndl_prefix),
                    Err(_) => error!("{} {} paniced at exit", prefix, hndl_prefix),
                }
            }
            *closed = true;
        }

        Ok(Response::Ok)
    }
}

impl Listener {
    fn prefix(&self) -> String {
        format!("{}-listener", self.config.name)
    }

    fn as_mut_poll(&mut self) -> &mut mio::Poll {
        match &mut self.inner {
            Inner::Main(RunLoop { poll, .. }) => poll,
            _ => unreachable!(),
        }
    }

    fn as_app_tx(&self) -> &AppTx {
        match &self.inner {
            Inner::Main(RunLoop { app_tx, .. }) => app_tx,
            _ => unreachable!(),
        }
    }
}
