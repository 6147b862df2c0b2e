use log::warn;

use std::{fs, net, path};

use crate::{Error, ErrorKind, Result};

/// Configuration for a broker node, immutable once the node is spawned.
///
/// Loaded from a flat TOML table; every option has a default, unknown
/// options are ignored with a warning, a type mismatch is an error.
#[derive(Clone, Debug)]
pub struct Config {
    /// Node name, used as the root of every logging prefix.
    pub name: String,
    /// Interface to bind, `any` means all interfaces.
    pub listen_ip: String,
    /// TCP port for client connections.
    pub tcp_server_port: u16,
    /// Hard cap on concurrent client connections. The cap'th + 1 client is
    /// refused with `SERVER_ERROR Too many clients`.
    pub max_tcp_clients: usize,
    /// Number of router shards, fixed at startup. ZERO means one shard per
    /// logical CPU.
    pub num_router_shards: u32,
    /// Log a warning when a single publish enqueues into more than this
    /// many queues.
    pub router_min_fanout_to_warn: usize,
    /// Log a warning when a single publish names more than this many
    /// topics.
    pub router_min_publish_to_topics_to_warn: usize,
    /// Optional pid file, written on spawn and removed on close.
    pub pid_file: Option<path::PathBuf>,
    /// Close a connection when no complete request arrives within this many
    /// seconds.
    pub sock_client_timeout: u64,
    /// Give up on a connection when a response write stays blocked for this
    /// many seconds.
    pub sock_write_timeout: u64,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            name: "mybus".to_string(),
            listen_ip: "any".to_string(),
            tcp_server_port: 12355,
            max_tcp_clients: 1000,
            num_router_shards: 4,
            router_min_fanout_to_warn: 100,
            router_min_publish_to_topics_to_warn: 20,
            pid_file: None,
            sock_client_timeout: 180,
            sock_write_timeout: 10,
        }
    }
}

impl TryFrom<toml::Value> for Config {
    type Error = Error;

    fn try_from(value: toml::Value) -> Result<Config> {
        let mut config = Config::default();
        let table = match value.as_table() {
            Some(table) => table,
            None => err!(InvalidInput, desc: "config must be a toml table")?,
        };

        for (key, value) in table.iter() {
            match key.as_str() {
                "name" => config.name = as_string(key, value)?,
                "listen_ip" => config.listen_ip = as_string(key, value)?,
                "tcp_server_port" => {
                    config.tcp_server_port = as_int(key, value, 0, 0xFFFF)? as u16;
                }
                "max_tcp_clients" => {
                    config.max_tcp_clients = as_int(key, value, 1, i64::MAX)? as usize;
                }
                "num_router_shards" => {
                    config.num_router_shards = as_int(key, value, 0, u32::MAX as i64)? as u32;
                }
                "router_min_fanout_to_warn" => {
                    config.router_min_fanout_to_warn =
                        as_int(key, value, 0, i64::MAX)? as usize;
                }
                "router_min_publish_to_topics_to_warn" => {
                    config.router_min_publish_to_topics_to_warn =
                        as_int(key, value, 0, i64::MAX)? as usize;
                }
                "pid_file" => {
                    config.pid_file = Some(path::PathBuf::from(as_string(key, value)?));
                }
                "sock_client_timeout" => {
                    config.sock_client_timeout = as_int(key, value, 1, i64::MAX)? as u64;
                }
                "sock_write_timeout" => {
                    config.sock_write_timeout = as_int(key, value, 1, i64::MAX)? as u64;
                }
                _ => warn!("unknown config option {:?}, ignored", key),
            }
        }

        Ok(config)
    }
}

impl Config {
    /// Read and parse a TOML configuration file.
    pub fn from_file<P>(path: P) -> Result<Config>
    where
        P: AsRef<path::Path>,
    {
        let path = path.as_ref();
        let text =
            err!(IOError, try: fs::read_to_string(path), "config file {:?}", path)?;
        let value = err!(
            InvalidInput,
            try: text.parse::<toml::Value>(),
            "config file {:?} bad toml",
            path
        )?;

        Config::try_from(value)
    }

    /// Effective shard count, resolving the ZERO-means-num-cpus convention.
    pub fn num_shards(&self) -> u32 {
        match self.num_router_shards {
            0 => num_cpus::get() as u32,
            n => n,
        }
    }

    /// Socket address to bind the listener to.
    pub fn listen_address(&self) -> Result<net::SocketAddr> {
        let ip = match self.listen_ip.as_str() {
            "any" => net::IpAddr::from(net::Ipv4Addr::UNSPECIFIED),
            ip => err!(InvalidInput, try: ip.parse::<net::IpAddr>(), "listen_ip {:?}", ip)?,
        };

        Ok(net::SocketAddr::new(ip, self.tcp_server_port))
    }
}

fn as_string(key: &str, value: &toml::Value) -> Result<String> {
    match value.as_str() {
        Some(s) => Ok(s.to_string()),
        None => err!(InvalidInput, desc: "config option {:?} expects a string", key),
    }
}

fn as_int(key: &str, value: &toml::Value, min: i64, max: i64) -> Result<i64> {
    match value.as_integer() {
        Some(n) if (min..=max).contains(&n) => Ok(n),
        Some(n) => err!(InvalidInput, desc: "config option {:?} out of range {}", key, n),
        None => err!(InvalidInput, desc: "config option {:?} expects an integer", key),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = Config::default();
        assert_eq!(config.tcp_server_port, 12355);
        assert_eq!(config.max_tcp_clients, 1000);
        assert_eq!(config.num_router_shards, 4);
        assert_eq!(config.num_shards(), 4);
        assert_eq!(
            config.listen_address().unwrap(),
            "0.0.0.0:12355".parse().unwrap()
        );
    }

    #[test]
    fn test_config_parse() {
        let text = r#"
            name = "unit"
            listen_ip = "127.0.0.1"
            tcp_server_port = 2048
            max_tcp_clients = 2
            num_router_shards = 8
            router_min_fanout_to_warn = 5
            router_min_publish_to_topics_to_warn = 3
            pid_file = "/tmp/busd.pid"
            no_such_option = true
        "#;
        let config = Config::try_from(text.parse::<toml::Value>().unwrap()).unwrap();
        assert_eq!(config.name, "unit");
        assert_eq!(config.listen_ip, "127.0.0.1");
        assert_eq!(config.tcp_server_port, 2048);
        assert_eq!(config.max_tcp_clients, 2);
        assert_eq!(config.num_shards(), 8);
        assert_eq!(config.router_min_fanout_to_warn, 5);
        assert_eq!(config.router_min_publish_to_topics_to_warn, 3);
        assert_eq!(config.pid_file, Some(path::PathBuf::from("/tmp/busd.pid")));
        assert_eq!(
            config.listen_address().unwrap(),
            "127.0.0.1:2048".parse().unwrap()
        );
    }

    #[test]
    fn test_config_zero_shards_means_num_cpus() {
        let text = "num_router_shards = 0";
        let config = Config::try_from(text.parse::<toml::Value>().unwrap()).unwrap();
        assert_eq!(config.num_shards() as usize, num_cpus::get());
    }

    #[test]
    fn test_config_bad_values() {
        let res = Config::try_from("tcp_server_port = 65536".parse::<toml::Value>().unwrap());
        assert_eq!(res.unwrap_err().kind(), ErrorKind::InvalidInput);

        let res = Config::try_from("listen_ip = 12355".parse::<toml::Value>().unwrap());
        assert_eq!(res.unwrap_err().kind(), ErrorKind::InvalidInput);

        let config =
            Config::try_from("listen_ip = \"bogus\"".parse::<toml::Value>().unwrap()).unwrap();
        assert_eq!(
            config.listen_address().unwrap_err().kind(),
            ErrorKind::InvalidInput
        );
    }
}
