//! Wire protocol codec.
//!
//! The broker speaks a memcached style framing, `<line>` + counted `<body>`,
//! so off-the-shelf cache clients can drive it:
//!
//! ```text
//! set subscribe 0 0 <bytes>\r\n<topic> <topic> ...\r\n      -> STORED\r\n
//! set unsubscribe 0 0 <bytes>\r\n<topic> <topic> ...\r\n    -> STORED\r\n
//! set publish 0 0 <bytes>\r\n<publish-block>\r\n            -> STORED\r\n
//! get messages\r\n                                          -> VALUE ... END\r\n | END\r\n
//! quit\r\n
//! ```
//!
//! A `<publish-block>` is a sequence of entries, each carrying one or more
//! topic names and a counted payload:
//!
//! ```text
//! MESSAGE <topic> .. <topic> <payload_bytes>\r\n<payload>\r\n
//! ```
//!
//! Bodies and payloads are byte counted, never line scanned, which keeps
//! payloads 8-bit clean, CRLF included.

use std::sync::Arc;
use std::{io, str};

use crate::queue::Message;
use crate::{util, Error, ErrorKind, Result, TopicName};

pub const STORED: &[u8] = b"STORED\r\n";
pub const END: &[u8] = b"END\r\n";
pub const ERROR: &[u8] = b"ERROR\r\n";
pub const SERVER_BUSY: &[u8] = b"SERVER_ERROR Too many clients\r\n";

const CRLF: &[u8] = b"\r\n";

// sized to the socket recv buffer, a single request usually fits
const READ_CHUNK_SIZE: usize = 4096;

/// Mutating sub-commands carried on a `set` line.
#[derive(Clone, Copy, Eq, PartialEq, Debug)]
pub enum SetCmd {
    Subscribe,
    Unsubscribe,
    Publish,
}

impl TryFrom<&[u8]> for SetCmd {
    type Error = Error;

    fn try_from(token: &[u8]) -> Result<SetCmd> {
        match token {
            b"subscribe" => Ok(SetCmd::Subscribe),
            b"unsubscribe" => Ok(SetCmd::Unsubscribe),
            b"publish" => Ok(SetCmd::Publish),
            _ => err!(
                ProtocolError,
                desc: "unknown set command {:?}",
                String::from_utf8_lossy(token)
            ),
        }
    }
}

/// A complete request decoded off the wire.
#[derive(Clone, Eq, PartialEq, Debug)]
pub enum Request {
    Quit,
    GetMessages,
    Subscribe { topics: Vec<TopicName> },
    Unsubscribe { topics: Vec<TopicName> },
    Publish { msgs: Vec<Message> },
}

/// Read side of the connection, a two state machine driven by byte counts.
///
/// `Line` accumulates bytes until CRLF and parses the command line. A `set`
/// line moves to `Body`, which counts down exactly `<bytes> + 2` octets
/// before dispatch; everything else completes in `Line` state. `Fin` holds
/// one decoded request plus any pipelined leftover, [McRead::reset] carries
/// the leftover into the next cycle.
#[derive(Debug)]
pub enum McRead {
    Line { data: Vec<u8> },
    Body { cmd: SetCmd, remaining: usize, data: Vec<u8> },
    Fin { req: Request, pending: Vec<u8> },
    None,
}

impl Default for McRead {
    fn default() -> McRead {
        McRead::Line { data: Vec::default() }
    }
}

impl McRead {
    /// Read from `conn` until a complete request is framed, or the socket
    /// would block. Returns `(self, would_block)`; `self` is in `Fin` state
    /// iff a request is ready.
    pub fn read<R: io::Read>(mut self, conn: &mut R) -> Result<(McRead, bool)> {
        // pipelined bytes from the previous cycle may already hold a
        // complete request.
        self = self.advance()?;
        if let McRead::Fin { .. } = self {
            return Ok((self, false));
        }

        let mut chunk = [0_u8; READ_CHUNK_SIZE];
        loop {
            match conn.read(&mut chunk) {
                Ok(0) => break err!(Disconnected, desc: "connection closed by peer"),
                Ok(n) => {
                    self = self.feed(&chunk[..n])?;
                    if let McRead::Fin { .. } = self {
                        break Ok((self, false));
                    }
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    break Ok((self, true))
                }
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => break err!(Disconnected, try: Err(err), "read failed"),
            }
        }
    }

    /// Return the request framed by this `Fin` state.
    pub fn parse(&self) -> Result<Request> {
        match self {
            McRead::Fin { req, .. } => Ok(req.clone()),
            _ => err!(InvalidInput, desc: "parse called before request is framed"),
        }
    }

    /// Fold back to `Line` state, carrying pipelined leftovers along.
    pub fn reset(self) -> McRead {
        match self {
            McRead::Fin { pending, .. } => McRead::Line { data: pending },
            _ => McRead::default(),
        }
    }

    fn feed(self, chunk: &[u8]) -> Result<McRead> {
        match self {
            McRead::Line { mut data } => {
                data.extend_from_slice(chunk);
                McRead::Line { data }.advance()
            }
            McRead::Body { cmd, remaining, mut data } => {
                if data.len() + chunk.len() > remaining {
                    err!(
                        ProtocolError,
                        desc: "body overflow, got {} of {} declared bytes",
                        data.len() + chunk.len(),
                        remaining
                    )?
                }
                data.extend_from_slice(chunk);
                if data.len() == remaining {
                    Self::finish_body(cmd, data)
                } else {
                    Ok(McRead::Body { cmd, remaining, data })
                }
            }
            McRead::Fin { .. } | McRead::None => unreachable!(),
        }
    }

    // Line state only: consume a command line if one is complete.
    fn advance(self) -> Result<McRead> {
        let data = match self {
            McRead::Line { data } => data,
            other => return Ok(other),
        };

        match find_crlf(&data) {
            Some(eol) => {
                let rest = data[eol + 2..].to_vec();
                Self::parse_line(&data[..eol], rest)
            }
            None if data.len() > crate::MAX_LINE_SIZE => {
                err!(ProtocolError, desc: "command line exceeds {} bytes", crate::MAX_LINE_SIZE)
            }
            None => Ok(McRead::Line { data }),
        }
    }

    fn parse_line(line: &[u8], rest: Vec<u8>) -> Result<McRead> {
        let tokens: Vec<&[u8]> =
            line.split(|b| *b == b' ').filter(|t| !t.is_empty()).collect();

        match tokens.as_slice() {
            [b"quit"] => Ok(McRead::Fin { req: Request::Quit, pending: rest }),
            // `get messages ` with a trailing space is also accepted
            [b"get", b"messages"] => {
                Ok(McRead::Fin { req: Request::GetMessages, pending: rest })
            }
            [b"set", cmd, flags, exptime, bytes] => {
                let cmd = SetCmd::try_from(*cmd)?;
                // flags and exptime are wire compatibility only
                parse_decimal(*flags)?;
                parse_decimal(*exptime)?;
                // declared count excludes the terminating CRLF of the body
                let remaining = match parse_decimal(*bytes)?.checked_add(2) {
                    Some(n) => n,
                    None => err!(ProtocolError, desc: "byte count out of range")?,
                };
                if rest.len() > remaining {
                    err!(
                        ProtocolError,
                        desc: "body overflow, got {} of {} declared bytes",
                        rest.len(),
                        remaining
                    )
                } else if rest.len() == remaining {
                    Self::finish_body(cmd, rest)
                } else {
                    Ok(McRead::Body { cmd, remaining, data: rest })
                }
            }
            _ => err!(
                ProtocolError,
                desc: "unrecognized command {:?}",
                String::from_utf8_lossy(line)
            ),
        }
    }

    fn finish_body(cmd: SetCmd, data: Vec<u8>) -> Result<McRead> {
        let n = data.len() - 2;
        if &data[n..] != CRLF {
            err!(ProtocolError, desc: "body not terminated with CRLF")?
        }
        let payload = &data[..n];

        let req = match cmd {
            SetCmd::Subscribe => Request::Subscribe { topics: parse_topics(payload)? },
            SetCmd::Unsubscribe => {
                Request::Unsubscribe { topics: parse_topics(payload)? }
            }
            SetCmd::Publish => Request::Publish { msgs: parse_publish_block(payload)? },
        };

        Ok(McRead::Fin { req, pending: Vec::default() })
    }
}

/// Write side of the connection. Holds the encoded response and retries
/// partial writes until the socket drains it, reporting `would_block`
/// instead of blocking.
pub enum McWrite {
    Init { data: Vec<u8>, start: usize },
    Remain { data: Vec<u8>, start: usize },
    Fin,
    None,
}

impl Default for McWrite {
    fn default() -> McWrite {
        McWrite::Fin
    }
}

impl McWrite {
    /// Arm the state machine with a fresh response.
    pub fn reset(self, data: Vec<u8>) -> McWrite {
        McWrite::Init { data, start: 0 }
    }

    /// Push bytes into `conn` until done or the socket would block.
    /// Returns `(self, would_block)`; `self` is `Fin` once fully written.
    pub fn write<W: io::Write>(self, conn: &mut W) -> Result<(McWrite, bool)> {
        let (data, mut start) = match self {
            McWrite::Init { data, start } => (data, start),
            McWrite::Remain { data, start } => (data, start),
            fin @ McWrite::Fin => return Ok((fin, false)),
            McWrite::None => unreachable!(),
        };

        loop {
            match conn.write(&data[start..]) {
                Ok(0) => break err!(Disconnected, desc: "connection closed while writing"),
                Ok(n) => {
                    start += n;
                    if start == data.len() {
                        break Ok((McWrite::Fin, false));
                    }
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    break Ok((McWrite::Remain { data, start }, true))
                }
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => break err!(Disconnected, try: Err(err), "write failed"),
            }
        }
    }
}

/// Parse the body of a subscribe/unsubscribe into topic names. An empty
/// body is a valid no-op.
fn parse_topics(payload: &[u8]) -> Result<Vec<TopicName>> {
    let mut topics = vec![];
    for token in payload.split(|b| *b == b' ').filter(|t| !t.is_empty()) {
        topics.push(TopicName::try_from(token)?);
    }

    Ok(topics)
}

/// Parse a publish block into messages. Entry headers are space tokenized,
/// every token a topic name except the last, which counts the payload.
pub fn parse_publish_block(block: &[u8]) -> Result<Vec<Message>> {
    let mut msgs = vec![];
    let mut n = 0_usize;
    while n < block.len() {
        let rem = util::advance(block, n)?;
        let eol = match find_crlf(rem) {
            Some(eol) => eol,
            None => err!(ProtocolError, desc: "unterminated MESSAGE header")?,
        };

        let tokens: Vec<&[u8]> =
            rem[..eol].split(|b| *b == b' ').filter(|t| !t.is_empty()).collect();
        match tokens.as_slice() {
            [b"MESSAGE", middle @ .., bytes] if !middle.is_empty() => {
                let size = parse_decimal(*bytes)?;
                let mut topics = Vec::with_capacity(middle.len());
                for token in middle.iter() {
                    topics.push(TopicName::try_from(*token)?);
                }

                let body = util::advance(rem, eol + 2)?;
                if body.len() < size || body.len() - size < 2 {
                    err!(
                        InsufficientBytes,
                        desc: "MESSAGE payload {} of {} bytes",
                        body.len(),
                        size
                    )?
                }
                if &body[size..size + 2] != CRLF {
                    err!(ProtocolError, desc: "MESSAGE payload not terminated with CRLF")?
                }

                let payload: Arc<[u8]> = body[..size].to_vec().into();
                msgs.push(Message::new(topics, payload));

                n += eol + 2 + size + 2;
            }
            _ => err!(
                ProtocolError,
                desc: "bad MESSAGE header {:?}",
                String::from_utf8_lossy(&rem[..eol])
            )?,
        }
    }

    Ok(msgs)
}

/// Encode messages into the publish block grammar, the server side of the
/// fetch path.
pub fn encode_messages(msgs: &[Message]) -> Vec<u8> {
    let mut data = Vec::with_capacity(msgs.iter().map(|m| m.payload.len() + 32).sum());
    for msg in msgs.iter() {
        data.extend_from_slice(b"MESSAGE");
        for topic in msg.topics.iter() {
            data.push(b' ');
            data.extend_from_slice(topic);
        }
        data.push(b' ');
        data.extend_from_slice(msg.payload.len().to_string().as_bytes());
        data.extend_from_slice(CRLF);
        data.extend_from_slice(&msg.payload);
        data.extend_from_slice(CRLF);
    }

    data
}

/// Encode the full reply to `get messages`. The declared count covers the
/// message block without the CRLF that separates it from the final `END`.
pub fn encode_fetch_reply(msgs: &[Message]) -> Vec<u8> {
    if msgs.is_empty() {
        return END.to_vec();
    }

    let block = encode_messages(msgs);
    let mut data = format!("VALUE messages 0 {}\r\n", block.len()).into_bytes();
    data.extend_from_slice(&block);
    data.extend_from_slice(CRLF);
    data.extend_from_slice(END);
    data
}

fn find_crlf(data: &[u8]) -> Option<usize> {
    data.windows(2).position(|w| w == CRLF)
}

fn parse_decimal(token: &[u8]) -> Result<usize> {
    let s = match str::from_utf8(token) {
        Ok(s) => s,
        Err(_) => err!(ProtocolError, desc: "byte count not ascii")?,
    };
    err!(ProtocolError, try: s.parse::<usize>(), "byte count {:?}", s)
}

#[cfg(test)]
mod tests {
    use arbitrary::Unstructured;
    use rand::{random, rngs::StdRng, Rng, SeedableRng};

    use std::collections::VecDeque;

    use super::*;

    // replays a scripted sequence of socket reads, one chunk per call,
    // WouldBlock once the script runs dry
    struct ChunkReader {
        chunks: VecDeque<Vec<u8>>,
    }

    impl ChunkReader {
        fn new() -> ChunkReader {
            ChunkReader { chunks: VecDeque::default() }
        }

        fn chunk(mut self, part: &[u8]) -> ChunkReader {
            self.chunks.push_back(part.to_vec());
            self
        }
    }

    impl io::Read for ChunkReader {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            match self.chunks.pop_front() {
                Some(chunk) => {
                    buf[..chunk.len()].copy_from_slice(&chunk);
                    Ok(chunk.len())
                }
                None => Err(io::Error::new(io::ErrorKind::WouldBlock, "drained")),
            }
        }
    }

    fn read_one(conn: &mut ChunkReader) -> Result<Request> {
        let (rd, _would_block) = McRead::default().read(conn)?;
        rd.parse()
    }

    fn topic(s: &str) -> TopicName {
        TopicName::try_from(s).unwrap()
    }

    #[test]
    fn test_read_line_commands() {
        let mut conn = ChunkReader::new().chunk(b"quit\r\n");
        assert_eq!(read_one(&mut conn).unwrap(), Request::Quit);

        let mut conn = ChunkReader::new().chunk(b"get messages\r\n");
        assert_eq!(read_one(&mut conn).unwrap(), Request::GetMessages);

        // trailing space before CRLF is accepted
        let mut conn = ChunkReader::new().chunk(b"get messages \r\n");
        assert_eq!(read_one(&mut conn).unwrap(), Request::GetMessages);
    }

    #[test]
    fn test_read_subscribe() {
        let mut conn = ChunkReader::new().chunk(b"set subscribe 0 0 3\r\na b\r\n");
        let req = read_one(&mut conn).unwrap();
        assert_eq!(
            req,
            Request::Subscribe { topics: vec![topic("a"), topic("b")] }
        );

        // empty body subscribes to nothing
        let mut conn = ChunkReader::new().chunk(b"set unsubscribe 0 0 0\r\n\r\n");
        let req = read_one(&mut conn).unwrap();
        assert_eq!(req, Request::Unsubscribe { topics: vec![] });
    }

    #[test]
    fn test_read_split_across_chunks() {
        let mut conn = ChunkReader::new()
            .chunk(b"set sub")
            .chunk(b"scribe 0 0 5\r\n")
            .chunk(b"a")
            .chunk(b" b c")
            .chunk(b"\r\n");
        let req = read_one(&mut conn).unwrap();
        assert_eq!(
            req,
            Request::Subscribe { topics: vec![topic("a"), topic("b"), topic("c")] }
        );
    }

    #[test]
    fn test_read_pipelined_lines() {
        let mut conn = ChunkReader::new().chunk(b"get messages\r\nquit\r\n");
        let (rd, _) = McRead::default().read(&mut conn).unwrap();
        assert_eq!(rd.parse().unwrap(), Request::GetMessages);

        // leftover is carried by reset, no further socket read needed
        let (rd, _) = rd.reset().read(&mut conn).unwrap();
        assert_eq!(rd.parse().unwrap(), Request::Quit);
    }

    #[test]
    fn test_read_binary_payload() {
        // payload may contain CRLF and NUL, the framing is byte counted
        let mut conn = ChunkReader::new()
            .chunk(b"set publish 0 0 22\r\nMESSAGE t 7\r\na\r\nb\nc\0\r\n\r\n");
        let req = read_one(&mut conn).unwrap();
        match req {
            Request::Publish { msgs } => {
                assert_eq!(msgs.len(), 1);
                assert_eq!(msgs[0].topics, vec![topic("t")]);
                assert_eq!(&*msgs[0].payload, b"a\r\nb\nc\0");
            }
            req => panic!("unexpected {:?}", req),
        }
    }

    #[test]
    fn test_read_errors() {
        let mut conn = ChunkReader::new().chunk(b"bogus\r\n");
        assert_eq!(
            read_one(&mut conn).unwrap_err().kind(),
            ErrorKind::ProtocolError
        );

        let mut conn = ChunkReader::new().chunk(b"set frobnicate 0 0 2\r\n");
        assert_eq!(
            read_one(&mut conn).unwrap_err().kind(),
            ErrorKind::ProtocolError
        );

        let mut conn = ChunkReader::new().chunk(b"set subscribe 0 0 x\r\n");
        assert_eq!(
            read_one(&mut conn).unwrap_err().kind(),
            ErrorKind::ProtocolError
        );

        // more bytes than the declared body length, in one chunk
        let mut conn = ChunkReader::new().chunk(b"set subscribe 0 0 1\r\na\r\nget messages\r\n");
        assert_eq!(
            read_one(&mut conn).unwrap_err().kind(),
            ErrorKind::ProtocolError
        );

        let mut conn = ChunkReader::new().chunk(b"set subscribe 0 0 1\r\na").chunk(b"\r\nquit\r\n");
        assert_eq!(
            read_one(&mut conn).unwrap_err().kind(),
            ErrorKind::ProtocolError
        );
    }

    #[test]
    fn test_read_eof() {
        let mut conn = ChunkReader::new().chunk(b"get mess");
        conn.chunks.push_back(vec![]); // EOF mid request
        let res = McRead::default().read(&mut conn);
        assert_eq!(res.unwrap_err().kind(), ErrorKind::Disconnected);
    }

    #[test]
    fn test_publish_block_entries() {
        let block = b"MESSAGE a 2\r\nm1\r\nMESSAGE a b 2\r\nok\r\n";
        let msgs = parse_publish_block(block).unwrap();
        assert_eq!(msgs.len(), 2);
        assert_eq!(msgs[0].topics, vec![topic("a")]);
        assert_eq!(&*msgs[0].payload, b"m1");
        assert_eq!(msgs[1].topics, vec![topic("a"), topic("b")]);
        assert_eq!(&*msgs[1].payload, b"ok");

        assert_eq!(parse_publish_block(b"").unwrap(), vec![]);

        // a header needs at least one topic before the byte count
        assert_eq!(
            parse_publish_block(b"MESSAGE 2\r\nm1\r\n").unwrap_err().kind(),
            ErrorKind::ProtocolError
        );
        assert_eq!(
            parse_publish_block(b"EGASSEM a 2\r\nm1\r\n").unwrap_err().kind(),
            ErrorKind::ProtocolError
        );
        assert_eq!(
            parse_publish_block(b"MESSAGE a 5\r\nm1\r\n").unwrap_err().kind(),
            ErrorKind::InsufficientBytes
        );
    }

    #[test]
    fn test_encode_fetch_reply() {
        assert_eq!(encode_fetch_reply(&[]), END);

        let msgs = vec![Message::new(vec![topic("a")], b"m1".to_vec().into())];
        assert_eq!(
            encode_fetch_reply(&msgs),
            b"VALUE messages 0 17\r\nMESSAGE a 2\r\nm1\r\n\r\nEND\r\n".to_vec()
        );
    }

    #[test]
    fn test_publish_block_roundtrip_fuzz() {
        let seed: u64 = random();
        println!("test_publish_block_roundtrip_fuzz seed:{}", seed);
        let mut rng = StdRng::seed_from_u64(seed);

        for _i in 0..128 {
            let bytes: Vec<u8> = (0..2048).map(|_| rng.gen::<u8>()).collect();
            let mut uns = Unstructured::new(&bytes);

            let mut msgs: Vec<Message> = vec![];
            for _j in 0..(uns.arbitrary::<u8>().unwrap() % 8) {
                msgs.push(uns.arbitrary().unwrap());
            }

            let block = encode_messages(&msgs);
            assert_eq!(parse_publish_block(&block).unwrap(), msgs);
        }
    }

    #[test]
    fn test_mc_write() {
        struct DribbleWriter {
            out: Vec<u8>,
            budget: VecDeque<usize>,
        }

        impl io::Write for DribbleWriter {
            fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
                match self.budget.pop_front() {
                    Some(0) => Err(io::Error::new(io::ErrorKind::WouldBlock, "full")),
                    Some(n) => {
                        let n = n.min(buf.len());
                        self.out.extend_from_slice(&buf[..n]);
                        Ok(n)
                    }
                    None => Err(io::Error::new(io::ErrorKind::WouldBlock, "full")),
                }
            }

            fn flush(&mut self) -> io::Result<()> {
                Ok(())
            }
        }

        let mut conn =
            DribbleWriter { out: vec![], budget: VecDeque::from(vec![3, 0, 2, 100]) };
        let mut wt = McWrite::default().reset(STORED.to_vec());
        let mut blocks = 0;
        loop {
            let (state, would_block) = wt.write(&mut conn).unwrap();
            wt = state;
            if let McWrite::Fin = wt {
                break;
            }
            assert!(would_block);
            blocks += 1;
        }
        assert_eq!(blocks, 1);
        assert_eq!(conn.out, STORED);
    }
}
