use std::{error, fmt, io, result};

/// Short form to compose an [Error] value and return it as `Result<T>`.
///
/// ```ignore
/// err!(InvalidInput, desc: "can't be zero {}", count)
/// err!(IOError, try: fs::read_to_string(path), "config {:?}", path)
/// err!(IPCFail, try: tx.send(resp))
/// ```
#[macro_export]
macro_rules! err {
    ($v:ident, desc: $($arg:expr),+) => {{
        let desc = format!($($arg),+);
        let loc = format!("{}:{}", file!(), line!());
        Err(Error::new(ErrorKind::$v, loc, desc))
    }};
    ($v:ident, try: $res:expr, $($arg:expr),+) => {{
        match $res {
            Ok(val) => Ok(val),
            Err(err) => {
                let desc = format!($($arg),+);
                let loc = format!("{}:{}", file!(), line!());
                Err(Error::new_cause(ErrorKind::$v, loc, desc, Box::new(err)))
            }
        }
    }};
    ($v:ident, try: $res:expr) => {{
        match $res {
            Ok(val) => Ok(val),
            Err(err) => {
                let desc = err.to_string();
                let loc = format!("{}:{}", file!(), line!());
                Err(Error::new_cause(ErrorKind::$v, loc, desc, Box::new(err)))
            }
        }
    }};
}

/// Short form to unwrap a result in places where failure is itself fatal,
/// like failing to notify the application channel about a fatal error.
#[macro_export]
macro_rules! allow_panic {
    ($pfx:expr, $res:expr) => {{
        match $res {
            Ok(val) => val,
            Err(err) => {
                log::error!("{} unexpected failure {:?}", $pfx, err);
                panic!("{} unexpected failure {:?}", $pfx, err);
            }
        }
    }};
}

/// Type alias for Result returned by functions of this package.
pub type Result<T> = result::Result<T, Error>;

/// Error type for this package, constructed via the [err] macro.
pub struct Error {
    kind: ErrorKind,
    description: String,
    loc: String,
    cause: Option<Box<dyn error::Error + Send>>,
    #[cfg(feature = "backtrace")]
    backtrace: std::backtrace::Backtrace,
}

impl Error {
    pub fn new(kind: ErrorKind, loc: String, description: String) -> Error {
        Error {
            kind,
            description,
            loc,
            cause: None,
            #[cfg(feature = "backtrace")]
            backtrace: std::backtrace::Backtrace::capture(),
        }
    }

    pub fn new_cause(
        kind: ErrorKind,
        loc: String,
        description: String,
        cause: Box<dyn error::Error + Send>,
    ) -> Error {
        Error {
            kind,
            description,
            loc,
            cause: Some(cause),
            #[cfg(feature = "backtrace")]
            backtrace: std::backtrace::Backtrace::capture(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}<{},{}>", self.kind, self.description, self.loc)
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match &self.cause {
            Some(cause) => write!(f, "{} cause:{}", self, cause),
            None => write!(f, "{}", self),
        }?;
        #[cfg(feature = "backtrace")]
        write!(f, "\n{}", self.backtrace)?;
        Ok(())
    }
}

impl error::Error for Error {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        self.cause.as_ref().map(|e| e.as_ref() as &(dyn error::Error + 'static))
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Error {
        Error::new_cause(
            ErrorKind::IOError,
            String::default(),
            err.to_string(),
            Box::new(err),
        )
    }
}

/// Broad classification of failures, used to pick the disposition at the
/// failure site: close the connection, restart the shard, or give up.
#[derive(Clone, Copy, Eq, PartialEq, Debug)]
pub enum ErrorKind {
    /// Bad argument or configuration from the application.
    InvalidInput,
    /// Underlying system call failed.
    IOError,
    /// A control channel to another thread broke down.
    IPCFail,
    /// Peer went away, or was timed out; connection level, never fatal to
    /// the process.
    Disconnected,
    /// Client violated the wire protocol.
    ProtocolError,
    /// Framed input ran short of the declared length.
    InsufficientBytes,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_err_macro_forms() {
        let res: Result<()> = err!(InvalidInput, desc: "count {}", 10);
        let err = res.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidInput);
        assert!(err.to_string().contains("count 10"), "{}", err);

        let res: Result<String> = err!(
            IOError,
            try: std::fs::read_to_string("/no/such/file"),
            "reading {}",
            "/no/such/file"
        );
        assert_eq!(res.unwrap_err().kind(), ErrorKind::IOError);

        let parsed: std::result::Result<u32, _> = "x".parse::<u32>();
        let res: Result<u32> = err!(ProtocolError, try: parsed);
        assert_eq!(res.unwrap_err().kind(), ErrorKind::ProtocolError);
    }
}
