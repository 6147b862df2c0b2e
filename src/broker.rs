//! Broker, the top level glue for one node.
//!
//! Spawning a broker brings up the shard set behind a [Router], then the
//! [Listener] in front of it. Closing reverses the order: stop accepting
//! and close every connection first, so no handler can reach a shard that
//! is already gone, then close the shards.

use log::info;

use std::sync::atomic::{AtomicBool, AtomicUsize};
use std::sync::{mpsc, Arc};
use std::{fs, mem, net, process};

use crate::listener::Listener;
use crate::router::Router;
use crate::{Config, Error, ErrorKind, Result};

/// Channel on which fatal sub-system failures reach the application.
pub type AppTx = mpsc::SyncSender<String>;

pub struct Broker {
    prefix: String,
    config: Config,
    inner: Inner,
}

enum Inner {
    Init,
    Main(RunLoop),
}

struct RunLoop {
    router: Arc<Router>,
    listener: Listener,
}

impl Broker {
    /// Create a broker from configuration, in init-state; to start it call
    /// [Broker::spawn].
    pub fn from_config(config: Config) -> Result<Broker> {
        let mut val = Broker { prefix: String::default(), config, inner: Inner::Init };
        val.prefix = val.prefix();

        Ok(val)
    }

    pub fn spawn(self, app_tx: AppTx) -> Result<Broker> {
        if matches!(&self.inner, Inner::Main(_)) {
            err!(InvalidInput, desc: "broker can be spawned only in init-state")?;
        }

        if let Some(path) = &self.config.pid_file {
            let text = format!("{}\n", process::id());
            err!(IOError, try: fs::write(path, text), "fail writing pid_file {:?}", path)?;
            info!("{} pid {} written to {:?}", self.prefix, process::id(), path);
        }

        let router = Arc::new(Router::from_config(self.config.clone())?);
        let active = Arc::new(AtomicUsize::new(0));
        let shutdown = Arc::new(AtomicBool::new(false));
        let listener = Listener::from_config(self.config.clone())?.spawn(
            Arc::clone(&router),
            active,
            shutdown,
            app_tx,
        )?;

        info!(
            "{} spawn num_shards:{} max_tcp_clients:{} ...",
            self.prefix,
            self.config.num_shards(),
            self.config.max_tcp_clients
        );

        let val = Broker {
            prefix: self.prefix.clone(),
            config: self.config.clone(),
            inner: Inner::Main(RunLoop { router, listener }),
        };

        Ok(val)
    }

    /// Address the node is accepting clients on.
    pub fn local_addr(&self) -> Option<net::SocketAddr> {
        match &self.inner {
            Inner::Main(RunLoop { listener, .. }) => listener.local_addr(),
            _ => None,
        }
    }

    /// Cooperative shutdown: stop accepting, close live connections, then
    /// drain the shards.
    pub fn close_wait(mut self) -> Result<()> {
        let inner = mem::replace(&mut self.inner, Inner::Init);
        match inner {
            Inner::Main(RunLoop { router, listener }) => {
                listener.close_wait()?;
                router.close()?;
            }
            Inner::Init => (),
        }

        if let Some(path) = &self.config.pid_file {
            let _ = fs::remove_file(path);
        }

        info!("{} closed", self.prefix);
        Ok(())
    }
}

impl Broker {
    fn prefix(&self) -> String {
        format!("{}-broker", self.config.name)
    }
}
