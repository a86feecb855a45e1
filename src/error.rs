use std::{error, fmt, result};

/// Short form to compose Error values.
///
/// Here are few possible ways:
///
/// ```ignore
/// use crate::Error;
/// err_at!(ParsingError, msg: "bad record at {}", off);
/// ```
///
/// ```ignore
/// use crate::Error;
/// err_at!(IOError, fs::read(file_path));
/// ```
///
/// ```ignore
/// use crate::Error;
/// err_at!(IOError, fs::read(file_path), "reading {:?}", file_path);
/// ```
#[macro_export]
macro_rules! err_at {
    ($v:ident, msg: $($arg:expr),+) => {{
        let prefix = format!("{}:{}", file!(), line!());
        Err(Error::$v(prefix, format!($($arg),+)))
    }};
    ($v:ident, $e:expr) => {{
        match $e {
            Ok(val) => Ok(val),
            Err(err) => {
                let prefix = format!("{}:{}", file!(), line!());
                Err(Error::$v(prefix, format!("{}", err)))
            }
        }
    }};
    ($v:ident, $e:expr, $($arg:expr),+) => {{
        match $e {
            Ok(val) => Ok(val),
            Err(err) => {
                let prefix = format!("{}:{}", file!(), line!());
                let msg = format!($($arg),+);
                Err(Error::$v(prefix, format!("{} {}", err, msg)))
            }
        }
    }};
}

/// Error variants that are returned by this package's API.
///
/// Each variant carries a prefix, typically the `file:line` where the
/// error was detected, and a human readable message.
#[derive(Clone, Debug, PartialEq)]
pub enum Error {
    /// Unrecoverable breakage, repository left untouched.
    Fatal(String, String),
    /// Underlying system call failed.
    IOError(String, String),
    /// File name or file content does not look like ours.
    InvalidFile(String, String),
    /// Caller supplied an argument we cannot work with.
    InvalidInput(String, String),
    /// Numeric or container conversion failed.
    FailConvert(String, String),
    /// Un-quoting a file name hit a malformed escape group.
    QuotingError(String, String),
    /// Metadata or flat-file record failed to parse.
    ParsingError(String, String),
    /// Signature/delta/patch engine failure.
    RsyncError(String, String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> result::Result<(), fmt::Error> {
        use Error::*;

        match self {
            Fatal(p, m) => write!(f, "Fatal, {} {}", p, m),
            IOError(p, m) => write!(f, "IOError, {} {}", p, m),
            InvalidFile(p, m) => write!(f, "InvalidFile, {} {}", p, m),
            InvalidInput(p, m) => write!(f, "InvalidInput, {} {}", p, m),
            FailConvert(p, m) => write!(f, "FailConvert, {} {}", p, m),
            QuotingError(p, m) => write!(f, "QuotingError, {} {}", p, m),
            ParsingError(p, m) => write!(f, "ParsingError, {} {}", p, m),
            RsyncError(p, m) => write!(f, "RsyncError, {} {}", p, m),
        }
    }
}

impl error::Error for Error {}
