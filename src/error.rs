//! Error type for the resolver core.

use std::error;
use std::fmt::{Display, Formatter};
use std::sync::Arc;

/// Error type for the resolver call surface.
#[derive(Clone, Debug)]
pub enum Error {
    /// The query packet is malformed or not one the cache can handle.
    InvalidQuery,

    /// A server address could not be parsed as a numeric address.
    InvalidServer,

    /// The operation referred to a network id that was never created.
    UnknownNetwork,

    /// An answer for this query is already cached.
    ///
    /// Only reachable when the caller bypassed the cache lookup and two
    /// answers for the same query raced each other into `add`.
    AlreadyCached,

    /// The query is not present in the cache.
    NotCached,

    /// A network with this id already exists.
    NetworkExists,

    /// The network has no upstream nameservers configured.
    NoNameservers,

    /// All retries were exhausted but at least one server reacted.
    TimedOut,

    /// All retries were exhausted and no server ever reacted.
    NoContact,

    /// Creating or preparing an upstream socket failed.
    Socket(Arc<std::io::Error>),
}

impl Display for Error {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), std::fmt::Error> {
        match self {
            Error::InvalidQuery => write!(f, "malformed or unsupported query"),
            Error::InvalidServer => {
                write!(f, "nameserver is not a numeric address")
            }
            Error::UnknownNetwork => write!(f, "unknown network id"),
            Error::AlreadyCached => write!(f, "answer already cached"),
            Error::NotCached => write!(f, "query not in cache"),
            Error::NetworkExists => write!(f, "network already exists"),
            Error::NoNameservers => {
                write!(f, "no nameservers configured for network")
            }
            Error::TimedOut => write!(f, "query timed out"),
            Error::NoContact => write!(f, "no nameserver could be reached"),
            Error::Socket(err) => write!(f, "socket error: {}", err),
        }
    }
}

impl error::Error for Error {}
