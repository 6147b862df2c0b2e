//! Broker daemon. Loads a TOML configuration, spawns a broker node and
//! runs until ctrl-c or a fatal sub-system error.

use log::{error, info};
use structopt::StructOpt;

use std::io::Write;
use std::sync::mpsc;
use std::{path, process};

use mybus::{Broker, Config, Result};

#[derive(Debug, StructOpt)]
#[structopt(name = "busd", about = "topic publish/subscribe broker")]
struct Opt {
    /// Location of a TOML configuration file.
    #[structopt(long = "config", short = "c")]
    config: Option<path::PathBuf>,

    /// Debug logging; RUST_LOG overrides this.
    #[structopt(short = "v")]
    v: bool,

    /// Trace logging; RUST_LOG overrides this.
    #[structopt(long = "trace")]
    trace: bool,
}

fn main() {
    let opts = Opt::from_args();
    init_logger(&opts);

    match run(&opts) {
        Ok(()) => (),
        Err(err) => {
            error!("busd failed, {}", err);
            process::exit(1);
        }
    }
}

fn run(opts: &Opt) -> Result<()> {
    let config = match &opts.config {
        Some(path) => Config::from_file(path)?,
        None => Config::default(),
    };
    info!("busd config {:?}", opts.config);

    let (app_tx, app_rx) = mpsc::sync_channel(16);

    let ctrlc_tx = app_tx.clone();
    if let Err(err) = ctrlc::set_handler(move || {
        let _ = ctrlc_tx.send("ctrlc".to_string());
    }) {
        error!("busd fail installing ctrl-c handler, {}", err);
        process::exit(1);
    }

    let broker = Broker::from_config(config)?.spawn(app_tx)?;

    // block until ctrl-c, or until a sub-system reports a fatal error
    match app_rx.recv() {
        Ok(msg) if msg == "ctrlc" => info!("busd received ctrl-c, shutting down ..."),
        Ok(msg) => error!("busd sub-system failure, {}", msg),
        Err(_) => (),
    }

    broker.close_wait()
}

fn init_logger(opts: &Opt) {
    let level = if opts.trace {
        "trace"
    } else if opts.v {
        "debug"
    } else {
        "info"
    };
    let env = env_logger::Env::default().default_filter_or(level);
    env_logger::Builder::from_env(env)
        .format(|buf, record| {
            let ts = chrono::Local::now().format("%Y-%m-%dT%H:%M:%S%.3f");
            writeln!(buf, "{} {:5} {}", ts, record.level(), record.args())
        })
        .init();
}
