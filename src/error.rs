use std::error::Error as StdError;
use std::fmt;
use std::io::Error as IoError;
use std::result;

/// A convenience wrapper around `Result` for `eas_client::Error`.
pub type Result<T> = result::Result<T, Error>;

/// A set of errors that can occur while talking to an Exchange ActiveSync
/// server.
#[derive(Debug)]
#[non_exhaustive]
pub enum Error {
    /// An `io::Error` that occurred while reading from or writing to the
    /// network, or while encoding or decoding a WBXML stream. Generally
    /// transient; the same request may succeed later.
    Io(IoError),
    /// The HTTP layer failed before a response could be read (DNS, TLS,
    /// connect or read failure). Generally transient.
    Http(Box<ureq::Transport>),
    /// The server rejected our credentials (HTTP 401).
    AuthenticationFailed,
    /// The server understood our credentials but refuses this client or user
    /// (HTTP 403).
    AccessDenied,
    /// The server demands a (re-)provisioning round before it will serve this
    /// command (HTTP 449, or a provisioning command status).
    ProvisioningRequired,
    /// The server answered the command with a non-success EAS status code.
    /// `item_id` is set when the status pertains to a single item rather than
    /// the whole request.
    CommandStatus {
        status: u32,
        item_id: Option<String>,
    },
    /// The response body was empty where a WBXML document was expected. For
    /// some commands an empty body is a valid "nothing changed" answer; the
    /// operations that allow it absorb this before callers see it.
    EmptyStream,
    /// The response could not be decoded as the expected WBXML document.
    MalformedProtocol(String),
    /// The server redirected us more times than we are willing to follow.
    TooManyRedirects,
    /// The sync window grew past its hard cap without the server making
    /// progress. Retrying without operator intervention will not help.
    SyncWindowExhausted,
}

impl From<IoError> for Error {
    fn from(err: IoError) -> Error {
        Error::Io(err)
    }
}

impl From<ureq::Transport> for Error {
    fn from(err: ureq::Transport) -> Error {
        Error::Http(Box::new(err))
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io(e) => write!(f, "io: {}", e),
            Error::Http(e) => write!(f, "http transport: {}", e),
            Error::AuthenticationFailed => {
                f.write_str("authentication failed; check username and password")
            }
            Error::AccessDenied => f.write_str("access denied by server"),
            Error::ProvisioningRequired => {
                f.write_str("server requires provisioning before this command")
            }
            Error::CommandStatus { status, item_id } => match item_id {
                Some(id) => write!(f, "command status {} for item {}", status, id),
                None => write!(f, "command status {}", status),
            },
            Error::EmptyStream => f.write_str("empty response body"),
            Error::MalformedProtocol(msg) => write!(f, "malformed response: {}", msg),
            Error::TooManyRedirects => f.write_str("too many redirects"),
            Error::SyncWindowExhausted => {
                f.write_str("sync window reached its cap without progress")
            }
        }
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            Error::Http(e) => Some(&**e),
            _ => None,
        }
    }
}

impl Error {
    /// Whether retrying the same request later has a chance of succeeding.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Io(_) | Error::Http(_) => true,
            Error::CommandStatus { status, .. } => {
                crate::protocol::sync_status::should_retry(*status)
            }
            _ => false,
        }
    }
}
