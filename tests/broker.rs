//! End to end exercises over real TCP connections, driving the broker the
//! way an off-the-shelf memcached client would.

use std::io::{Read, Write};
use std::net;
use std::sync::mpsc;
use std::{thread, time};

use mybus::{Broker, Config};

fn start_broker(config: Config) -> (Broker, net::SocketAddr, mpsc::Receiver<String>) {
    let (app_tx, app_rx) = mpsc::sync_channel(16);
    let broker = Broker::from_config(config).unwrap().spawn(app_tx).unwrap();
    let addr = broker.local_addr().unwrap();
    (broker, addr, app_rx)
}

fn test_config() -> Config {
    let mut config = Config::default();
    config.name = "e2e".to_string();
    config.listen_ip = "127.0.0.1".to_string();
    config.tcp_server_port = 0; // ephemeral
    config
}

struct Client {
    conn: net::TcpStream,
    buf: Vec<u8>,
}

impl Client {
    fn connect(addr: &net::SocketAddr) -> Client {
        let conn = net::TcpStream::connect(addr).unwrap();
        conn.set_read_timeout(Some(time::Duration::from_secs(5))).unwrap();
        Client { conn, buf: Vec::new() }
    }

    fn send(&mut self, bytes: &[u8]) {
        self.conn.write_all(bytes).unwrap();
    }

    // read one CRLF terminated line, including the CRLF
    fn read_line(&mut self) -> Vec<u8> {
        loop {
            if let Some(eol) = self.buf.windows(2).position(|w| w == b"\r\n") {
                return self.buf.drain(..eol + 2).collect();
            }
            self.fill();
        }
    }

    fn read_exact_n(&mut self, n: usize) -> Vec<u8> {
        while self.buf.len() < n {
            self.fill();
        }
        self.buf.drain(..n).collect()
    }

    // true on EOF
    fn at_eof(&mut self) -> bool {
        let mut chunk = [0_u8; 1024];
        match self.conn.read(&mut chunk) {
            Ok(0) => true,
            Ok(n) => {
                self.buf.extend_from_slice(&chunk[..n]);
                false
            }
            Err(err) => panic!("read failed: {}", err),
        }
    }

    fn fill(&mut self) {
        let mut chunk = [0_u8; 1024];
        let n = self.conn.read(&mut chunk).unwrap();
        assert!(n > 0, "peer closed while a reply was expected");
        self.buf.extend_from_slice(&chunk[..n]);
    }

    fn set(&mut self, cmd: &str, payload: &[u8]) -> Vec<u8> {
        let mut req = format!("set {} 0 0 {}\r\n", cmd, payload.len()).into_bytes();
        req.extend_from_slice(payload);
        req.extend_from_slice(b"\r\n");
        self.send(&req);
        self.read_line()
    }

    fn subscribe(&mut self, topics: &str) -> Vec<u8> {
        self.set("subscribe", topics.as_bytes())
    }

    fn unsubscribe(&mut self, topics: &str) -> Vec<u8> {
        self.set("unsubscribe", topics.as_bytes())
    }

    fn publish_one(&mut self, topics: &str, payload: &[u8]) -> Vec<u8> {
        let mut block = format!("MESSAGE {} {}\r\n", topics, payload.len()).into_bytes();
        block.extend_from_slice(payload);
        block.extend_from_slice(b"\r\n");
        self.set("publish", &block)
    }

    // full reply bytes to `get messages`
    fn fetch(&mut self) -> Vec<u8> {
        self.send(b"get messages\r\n");
        let mut reply = self.read_line();
        if reply.starts_with(b"VALUE messages 0 ") {
            let count: usize = std::str::from_utf8(&reply[17..reply.len() - 2])
                .unwrap()
                .parse()
                .unwrap();
            reply.extend_from_slice(&self.read_exact_n(count + 2));
            reply.extend_from_slice(&self.read_line());
        }
        reply
    }
}

#[test]
fn test_single_subscriber_roundtrip() {
    let (broker, addr, _app_rx) = start_broker(test_config());

    let mut c1 = Client::connect(&addr);
    let mut c2 = Client::connect(&addr);

    assert_eq!(c1.subscribe("a"), b"STORED\r\n");
    assert_eq!(c2.publish_one("a", b"m1"), b"STORED\r\n");

    assert_eq!(
        c1.fetch(),
        b"VALUE messages 0 17\r\nMESSAGE a 2\r\nm1\r\n\r\nEND\r\n".to_vec()
    );
    // the mailbox was drained atomically
    assert_eq!(c1.fetch(), b"END\r\n");

    broker.close_wait().unwrap();
}

#[test]
fn test_multi_topic_single_delivery() {
    // a single shard keeps both topics in one serialization domain, the
    // subscriber gets one entry carrying both names
    let mut config = test_config();
    config.num_router_shards = 1;
    let (broker, addr, _app_rx) = start_broker(config);

    let mut c1 = Client::connect(&addr);
    let mut c2 = Client::connect(&addr);

    assert_eq!(c1.subscribe("a b"), b"STORED\r\n");
    assert_eq!(c2.publish_one("a b", b"ok"), b"STORED\r\n");

    assert_eq!(
        c1.fetch(),
        b"VALUE messages 0 19\r\nMESSAGE a b 2\r\nok\r\n\r\nEND\r\n".to_vec()
    );

    broker.close_wait().unwrap();
}

#[test]
fn test_unsubscription() {
    let (broker, addr, _app_rx) = start_broker(test_config());

    let mut c1 = Client::connect(&addr);
    let mut c2 = Client::connect(&addr);

    assert_eq!(c1.subscribe("x"), b"STORED\r\n");
    assert_eq!(c1.unsubscribe("x"), b"STORED\r\n");
    assert_eq!(c2.publish_one("x", b"m"), b"STORED\r\n");

    assert_eq!(c1.fetch(), b"END\r\n");

    broker.close_wait().unwrap();
}

#[test]
fn test_self_delivery() {
    let (broker, addr, _app_rx) = start_broker(test_config());

    let mut c1 = Client::connect(&addr);
    assert_eq!(c1.subscribe("t"), b"STORED\r\n");
    assert_eq!(c1.publish_one("t", b"h"), b"STORED\r\n");

    assert_eq!(
        c1.fetch(),
        b"VALUE messages 0 16\r\nMESSAGE t 1\r\nh\r\n\r\nEND\r\n".to_vec()
    );

    broker.close_wait().unwrap();
}

#[test]
fn test_binary_safe_payload() {
    let (broker, addr, _app_rx) = start_broker(test_config());

    let mut c1 = Client::connect(&addr);
    let mut c2 = Client::connect(&addr);

    let payload = b"a\r\nb\nc\0";
    assert_eq!(c1.subscribe("bin"), b"STORED\r\n");
    assert_eq!(c2.publish_one("bin", payload), b"STORED\r\n");

    let mut want = b"VALUE messages 0 24\r\nMESSAGE bin 7\r\n".to_vec();
    want.extend_from_slice(payload);
    want.extend_from_slice(b"\r\n\r\nEND\r\n");
    assert_eq!(c1.fetch(), want);

    broker.close_wait().unwrap();
}

#[test]
fn test_empty_bodies_are_noops() {
    let (broker, addr, _app_rx) = start_broker(test_config());

    let mut c1 = Client::connect(&addr);
    assert_eq!(c1.subscribe(""), b"STORED\r\n");
    assert_eq!(c1.set("publish", b""), b"STORED\r\n");
    assert_eq!(c1.fetch(), b"END\r\n");

    broker.close_wait().unwrap();
}

#[test]
fn test_publish_block_multiple_entries() {
    let (broker, addr, _app_rx) = start_broker(test_config());

    let mut c1 = Client::connect(&addr);
    let mut c2 = Client::connect(&addr);

    assert_eq!(c1.subscribe("a b"), b"STORED\r\n");
    let block = b"MESSAGE a 2\r\nm1\r\nMESSAGE b 2\r\nm2\r\nMESSAGE c 2\r\nm3\r\n";
    assert_eq!(c2.set("publish", block), b"STORED\r\n");

    let reply = c1.fetch();
    assert!(reply.starts_with(b"VALUE messages 0 "), "{:?}", reply);
    let text = String::from_utf8(reply).unwrap();
    assert!(text.contains("MESSAGE a 2\r\nm1\r\n"), "{:?}", text);
    assert!(text.contains("MESSAGE b 2\r\nm2\r\n"), "{:?}", text);
    assert!(!text.contains("m3"), "{:?}", text);

    broker.close_wait().unwrap();
}

#[test]
fn test_quit_closes_connection() {
    let (broker, addr, _app_rx) = start_broker(test_config());

    let mut c1 = Client::connect(&addr);
    c1.send(b"quit\r\n");
    assert!(c1.at_eof());

    broker.close_wait().unwrap();
}

#[test]
fn test_unknown_command_errors() {
    let (broker, addr, _app_rx) = start_broker(test_config());

    let mut c1 = Client::connect(&addr);
    c1.send(b"frobnicate\r\n");
    assert_eq!(c1.read_line(), b"ERROR\r\n");
    assert!(c1.at_eof());

    broker.close_wait().unwrap();
}

#[test]
fn test_excess_body_bytes_error() {
    let (broker, addr, _app_rx) = start_broker(test_config());

    let mut c1 = Client::connect(&addr);
    c1.send(b"set subscribe 0 0 1\r\na\r\nEXTRA BYTES");
    assert_eq!(c1.read_line(), b"ERROR\r\n");
    assert!(c1.at_eof());

    broker.close_wait().unwrap();
}

#[test]
fn test_too_many_clients() {
    let mut config = test_config();
    config.max_tcp_clients = 1;
    let (broker, addr, _app_rx) = start_broker(config);

    let mut c1 = Client::connect(&addr);
    assert_eq!(c1.subscribe("a"), b"STORED\r\n");

    // the cap + 1'th client is refused and closed
    let mut c2 = Client::connect(&addr);
    assert_eq!(c2.read_line(), b"SERVER_ERROR Too many clients\r\n");
    assert!(c2.at_eof());

    // releasing a slot lets a fresh client in
    c1.send(b"quit\r\n");
    assert!(c1.at_eof());

    let mut c3 = None;
    for _retry in 0..50 {
        let mut c = Client::connect(&addr);
        c.send(b"get messages\r\n");
        match c.read_line().as_slice() {
            b"END\r\n" => {
                c3 = Some(c);
                break;
            }
            b"SERVER_ERROR Too many clients\r\n" => {
                thread::sleep(time::Duration::from_millis(50));
            }
            reply => panic!("unexpected reply {:?}", reply),
        }
    }
    let mut c3 = c3.expect("admission never recovered");
    assert_eq!(c3.subscribe("b"), b"STORED\r\n");

    broker.close_wait().unwrap();
}

#[test]
fn test_disconnect_cleans_subscriptions() {
    let (broker, addr, _app_rx) = start_broker(test_config());

    let topics: Vec<String> = (0..100).map(|i| format!("gone-{}", i)).collect();
    let line = topics.join(" ");

    {
        let mut c1 = Client::connect(&addr);
        assert_eq!(c1.subscribe(&line), b"STORED\r\n");
        // dropped without quit nor unsubscribe
    }

    // a fresh subscriber over the same topics sees a clean baseline: only
    // its own queue receives the publish
    thread::sleep(time::Duration::from_millis(200));
    let mut c2 = Client::connect(&addr);
    assert_eq!(c2.subscribe(&line), b"STORED\r\n");

    let mut c3 = Client::connect(&addr);
    assert_eq!(c3.publish_one("gone-0 gone-99", b"m"), b"STORED\r\n");

    let reply = c2.fetch();
    assert!(reply.starts_with(b"VALUE messages 0 "), "{:?}", reply);
    assert_eq!(c2.fetch(), b"END\r\n");

    broker.close_wait().unwrap();
}

#[test]
fn test_cooperative_shutdown() {
    let (broker, addr, _app_rx) = start_broker(test_config());

    let mut c1 = Client::connect(&addr);
    assert_eq!(c1.subscribe("a"), b"STORED\r\n");

    // close_wait joins the handler serving c1
    broker.close_wait().unwrap();
    assert!(c1.at_eof());
}
