use std::net;

use crate::{Error, ErrorKind, Result};

/// Return the stream of bytes remaining after skipping the first `n`.
pub fn advance(stream: &[u8], n: usize) -> Result<&[u8]> {
    if n <= stream.len() {
        Ok(&stream[n..])
    } else {
        err!(InsufficientBytes, desc: "insufficient bytes {}/{}", n, stream.len())
    }
}

/// Human readable identifier for a connected client, stable for the lifetime
/// of its connection. Shows up in every log line the connection emits, from
/// accept to teardown.
pub fn client_name(addr: &net::SocketAddr) -> String {
    format!("client-{}", addr)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_advance() {
        let stream = b"hello";
        assert_eq!(advance(stream, 0).unwrap(), b"hello");
        assert_eq!(advance(stream, 2).unwrap(), b"llo");
        assert_eq!(advance(stream, 5).unwrap(), b"");
        assert_eq!(
            advance(stream, 6).unwrap_err().kind(),
            ErrorKind::InsufficientBytes
        );
    }
}
