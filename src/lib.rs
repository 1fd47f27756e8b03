//! A per-network DNS stub resolver core.
//!
//! This crate implements the resolver subsystem an operating system's
//! name-service layer sits on top of: callers hand in raw DNS query
//! packets together with a network id and get raw DNS answer packets
//! back. Per network, the resolver maintains upstream server
//! configuration, search domains, reachability statistics, a small
//! answer cache, and a private DNS (DNS-over-TLS) tracker.
//!
//! The interesting machinery lives in three places:
//!
//! * [`cache`]: the answer cache hashes and compares queries on their
//!   raw octets, expires entries by the smallest answer TTL, evicts the
//!   least recently used entry when full, and collapses concurrent
//!   identical queries into a single upstream request.
//! * [`send`]: the send engine walks the usable upstream servers with
//!   per-attempt timeouts, escalates from UDP to TCP on truncation,
//!   matches responses to queries, and records per-server reachability
//!   samples.
//! * [`pdns`]: the private DNS tracker validates candidate DoT servers
//!   in the background and gates the query path by the network's mode,
//!   falling back to cleartext opportunistically but never in strict
//!   mode.
//!
//! Everything hangs off a [`Resolver`] value; there is no process-global
//! state, so tests (and embedders that want several) simply construct
//! their own. External concerns — the TLS transport, socket tagging,
//! configuration flag overrides, validation event listeners — are
//! injected through the traits on [`Resolver::builder`].
//!
//! ```no_run
//! use netresolv::{QueryFlags, Resolver, ResolvParams};
//!
//! # async fn example(query: &[u8]) -> Result<(), netresolv::Error> {
//! let resolver = Resolver::new();
//! resolver.create_network(30)?;
//! resolver.set_nameservers(
//!     30,
//!     &["8.8.8.8".to_string()],
//!     &[],
//!     ResolvParams::default(),
//! )?;
//!
//! let mut answer = [0u8; 4096];
//! let len = resolver
//!     .resolve(30, query, &mut answer, QueryFlags::empty())
//!     .await?;
//! # let _ = len;
//! # Ok(())
//! # }
//! ```

mod cache;
mod config;
mod error;
mod header;
mod iana;
mod packet;
mod pdns;
mod registry;
mod send;
mod stats;
mod tls;

#[cfg(test)]
mod testutil;

pub use crate::cache::CacheStatus;
pub use crate::config::{ConfigOracle, NullOracle, QueryFlags, ResolvParams};
pub use crate::error::Error;
pub use crate::header::{Header, HeaderCounts};
pub use crate::iana::{Rcode, Rtype};
pub use crate::packet::{answer_min_ttl, fingerprint, is_cacheable_query, queries_equal};
pub use crate::pdns::{
    DotServer, PrivateDnsMode, PrivateDnsStatus, Validation,
    ValidationListener,
};
pub use crate::registry::{
    NetworkInfo, Resolver, ResolverBuilder, MAXDNSRCH, MAXDNSRCHPATH,
};
pub use crate::send::{NullTagger, ResState, SocketTagger, MARK_UNSET};
pub use crate::stats::{Sample, ServerStats, MAXNS};
pub use crate::tls::{
    RustlsDispatcher, RustlsValidator, TlsDispatcher, TlsResponse,
    TlsValidator,
};
