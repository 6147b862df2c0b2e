//! Threading abstraction used by every long lived component of the broker.
//!
//! A component implements [Threadable] and is started with [Thread::spawn],
//! which hands the `main_loop` the receiving half of a bounded control
//! channel. The owning side keeps the [Thread] handle and talks to the loop
//! with [Thread::post] (fire and forget), [Thread::request] (blocking call)
//! or [Thread::submit] (call, collect the response later). Dropping the
//! handle, via [Thread::close_wait], disconnects the channel, which the
//! `main_loop` treats as its signal to exit.

use std::sync::mpsc;
use std::{mem, thread};

use crate::{Error, ErrorKind, Result};

/// Requests expecting a response carry the sending half of a 1-slot channel.
pub type QReq<Q, R> = (Q, Option<mpsc::SyncSender<R>>);

/// Receiving side of a control channel, owned by the `main_loop`.
pub type Rx<Q, R> = mpsc::Receiver<QReq<Q, R>>;

/// Cloneable sending side of a control channel.
pub struct Tx<Q, R> {
    tx: mpsc::SyncSender<QReq<Q, R>>,
}

impl<Q, R> Clone for Tx<Q, R> {
    fn clone(&self) -> Tx<Q, R> {
        Tx { tx: self.tx.clone() }
    }
}

impl<Q: Send + 'static, R: Send + 'static> Tx<Q, R> {
    /// Send a request that expects no response.
    pub fn post(&self, msg: Q) -> Result<()> {
        err!(IPCFail, try: self.tx.send((msg, None)))
    }

    /// Send a request and block until the response arrives.
    pub fn request(&self, msg: Q) -> Result<R> {
        let rx = self.submit(msg)?;
        err!(IPCFail, try: rx.recv())
    }

    /// Send a request, return a receiver to collect the response later.
    /// Lets a caller fan a batch of requests across several threads before
    /// waiting on any of them.
    pub fn submit(&self, msg: Q) -> Result<mpsc::Receiver<R>> {
        let (resp_tx, resp_rx) = mpsc::sync_channel(1);
        err!(IPCFail, try: self.tx.send((msg, Some(resp_tx))))?;
        Ok(resp_rx)
    }
}

/// Threadable abstracts the main loop of a system thread.
pub trait Threadable: Sized {
    type Req;
    type Resp;

    fn main_loop(self, rx: Rx<Self::Req, Self::Resp>) -> Self;
}

/// Thread is the owning handle for a spawned [Threadable].
pub struct Thread<T, Q, R>
where
    T: 'static + Send + Threadable<Req = Q, Resp = R>,
    Q: 'static + Send,
    R: 'static + Send,
{
    name: String,
    handle: thread::JoinHandle<T>,
    tx: Tx<Q, R>,
}

impl<T, Q, R> Thread<T, Q, R>
where
    T: 'static + Send + Threadable<Req = Q, Resp = R>,
    Q: 'static + Send,
    R: 'static + Send,
{
    /// Spawn a native thread running `thrd.main_loop()`.
    pub fn spawn(name: &str, thrd: T) -> Thread<T, Q, R> {
        let (tx, rx) = mpsc::sync_channel(crate::CONTROL_CHAN_SIZE);
        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || thrd.main_loop(rx));
        let handle = allow_panic!(name, handle);

        Thread { name: name.to_string(), handle, tx: Tx { tx } }
    }

    pub fn to_tx(&self) -> Tx<Q, R> {
        self.tx.clone()
    }

    pub fn post(&self, msg: Q) -> Result<()> {
        self.tx.post(msg)
    }

    pub fn request(&self, msg: Q) -> Result<R> {
        self.tx.request(msg)
    }

    pub fn submit(&self, msg: Q) -> Result<mpsc::Receiver<R>> {
        self.tx.submit(msg)
    }

    /// True once the `main_loop` has returned, for any reason.
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Disconnect the control channel and wait for the `main_loop` to exit.
    pub fn close_wait(self) -> Result<T> {
        let Thread { name, handle, tx } = self;
        mem::drop(tx);
        match handle.join() {
            Ok(thrd) => Ok(thrd),
            Err(_) => err!(IPCFail, desc: "thread {} paniced in main_loop", name),
        }
    }
}

/// Drain upto `max` pending requests from a control channel, without
/// blocking. Returns `(requests, empty, disconnected)`.
pub fn pending_requests<Q, R>(rx: &Rx<Q, R>, max: usize) -> (Vec<QReq<Q, R>>, bool, bool) {
    let mut reqs = vec![];
    let (mut empty, mut disconnected) = (false, false);
    loop {
        if reqs.len() >= max {
            break;
        }
        match rx.try_recv() {
            Ok(req) => reqs.push(req),
            Err(mpsc::TryRecvError::Empty) => {
                empty = true;
                break;
            }
            Err(mpsc::TryRecvError::Disconnected) => {
                disconnected = true;
                break;
            }
        }
    }

    (reqs, empty, disconnected)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Doubler {
        served: usize,
    }

    impl Threadable for Doubler {
        type Req = u32;
        type Resp = u32;

        fn main_loop(mut self, rx: Rx<u32, u32>) -> Self {
            for (msg, resp_tx) in rx.iter() {
                self.served += 1;
                if let Some(tx) = resp_tx {
                    tx.send(msg * 2).unwrap();
                }
            }
            self
        }
    }

    #[test]
    fn test_thread_request_close_wait() {
        let thrd = Thread::spawn("doubler", Doubler { served: 0 });
        assert_eq!(thrd.request(21).unwrap(), 42);
        thrd.post(1).unwrap();
        let rx = thrd.submit(3).unwrap();
        assert_eq!(rx.recv().unwrap(), 6);

        let doubler = thrd.close_wait().unwrap();
        assert_eq!(doubler.served, 3);
    }

    #[test]
    fn test_pending_requests() {
        let (tx, rx) = mpsc::sync_channel::<QReq<u32, u32>>(16);
        for i in 0..4 {
            tx.send((i, None)).unwrap();
        }

        let (reqs, empty, disconnected) = pending_requests(&rx, 2);
        assert_eq!(reqs.len(), 2);
        assert!(!empty && !disconnected);

        let (reqs, empty, disconnected) = pending_requests(&rx, 16);
        assert_eq!(reqs.len(), 2);
        assert!(empty && !disconnected);

        mem::drop(tx);
        let (reqs, _empty, disconnected) = pending_requests(&rx, 16);
        assert_eq!(reqs.len(), 0);
        assert!(disconnected);
    }
}
