#[cfg(any(feature = "fuzzy", test))]
use arbitrary::{Arbitrary, Error as ArbitraryError, Unstructured};

#[cfg(any(feature = "fuzzy", test))]
use std::result;

use std::fmt;
use std::ops::Deref;

use crate::{Error, ErrorKind, Result};

/// TopicName is the routing key for subscriptions and publishes.
///
/// Topics are opaque byte strings, compared for identity byte by byte. The
/// wire protocol carries them as space separated tokens, hence a topic can
/// never contain an ASCII space, nor CR or LF. They are not registered
/// anywhere up front, a topic exists only while some shard table refers to
/// it.
#[derive(Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct TopicName(Vec<u8>);

impl Deref for TopicName {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.0
    }
}

impl AsRef<[u8]> for TopicName {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for TopicName {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(&self.0))
    }
}

impl fmt::Debug for TopicName {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}", String::from_utf8_lossy(&self.0))
    }
}

impl TryFrom<&[u8]> for TopicName {
    type Error = Error;

    fn try_from(bytes: &[u8]) -> Result<TopicName> {
        let val = TopicName(bytes.to_vec());
        val.validate()?;
        Ok(val)
    }
}

impl TryFrom<&str> for TopicName {
    type Error = Error;

    fn try_from(s: &str) -> Result<TopicName> {
        TopicName::try_from(s.as_bytes())
    }
}

impl TopicName {
    fn validate(&self) -> Result<()> {
        if self.0.is_empty() {
            err!(ProtocolError, desc: "empty topic name")?
        }
        for byte in self.0.iter() {
            match byte {
                b' ' | b'\r' | b'\n' => {
                    err!(ProtocolError, desc: "forbidden byte {} in topic", byte)?
                }
                _ => (),
            }
        }

        Ok(())
    }
}

#[cfg(any(feature = "fuzzy", test))]
impl<'a> Arbitrary<'a> for TopicName {
    fn arbitrary(uns: &mut Unstructured<'a>) -> result::Result<Self, ArbitraryError> {
        const CHOICE: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789/._-";

        let mut bytes = vec![];
        for _i in 0..((uns.arbitrary::<u8>()? % 12) + 1) {
            bytes.push(CHOICE[uns.arbitrary::<usize>()? % CHOICE.len()]);
        }

        Ok(TopicName(bytes))
    }
}
