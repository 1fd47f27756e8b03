//! Sending queries to upstream servers.
//!
//! This is the retry state machine behind [`Resolver::nsend`]: walk the
//! usable servers in list order for up to `retry_count` rounds, query
//! each over UDP with a per-attempt timeout that scales with the server
//! index, escalate to TCP when a reply comes back truncated, and feed the
//! outcome of each first attempt into the reachability statistics.
//!
//! All sockets used by one `nsend` call are owned by a [`QueryContext`]
//! created for that call; dropping it releases them on every exit path.
//! UDP sockets are created lazily per (network, server) pair, bound to a
//! random source port and connected; TCP connections are reused across
//! servers within the call as long as the peer and mark still match.

use crate::cache::CacheStatus;
use crate::config::{QueryFlags, ResolvParams};
use crate::error::Error;
use crate::header::Header;
use crate::iana::Rcode;
use crate::packet::{self, HEADER_LEN};
use crate::registry::Resolver;
use crate::stats::{usable_servers, Sample, MAXNS};
use crate::tls::TlsResponse;
use crate::pdns::PrivateDnsMode;
use rand::Rng;
use smallvec::SmallVec;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::os::fd::{AsRawFd, RawFd};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpSocket, TcpStream, UdpSocket};
use tokio::time::{sleep, timeout, timeout_at, Instant};
use tracing::debug;

//------------ Configuration Constants ---------------------------------------

/// Queries longer than this start out over TCP.
const PACKETSZ: usize = 512;

/// How often the strict-mode startup wait polls for a validated server.
const STRICT_STARTUP_POLLS: usize = 42;

/// The interval between those polls.
const STRICT_STARTUP_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// The unset firewall mark.
pub const MARK_UNSET: u32 = 0;

//------------ SocketTagger --------------------------------------------------

/// Hook invoked on every newly created upstream socket.
///
/// The surrounding system uses this to charge DNS traffic to the
/// requesting app and to apply its firewall marking; the resolver core
/// only guarantees the hook runs before the socket carries traffic.
pub trait SocketTagger: Send + Sync {
    /// Tags a freshly created socket.
    fn tag(&self, fd: RawFd, uid: u32, pid: u32);
}

/// The default tagger: does nothing.
#[derive(Clone, Copy, Debug, Default)]
pub struct NullTagger;

impl SocketTagger for NullTagger {
    fn tag(&self, _fd: RawFd, _uid: u32, _pid: u32) {}
}

//------------ ResState ------------------------------------------------------

/// Per-query resolver state.
///
/// Holds the server snapshot a query runs against plus the caller's
/// identity for socket tagging. Reusable across queries; the resolver
/// refreshes the snapshot via [`Resolver::populate`] on every cache miss
/// and remembers per-state conditions like a server that chokes on
/// EDNS0.
#[derive(Debug)]
pub struct ResState {
    /// The network this state queries on.
    pub netid: u32,

    /// Uid of the app the lookup is for.
    pub uid: u32,

    /// Pid of the app the lookup is for.
    pub pid: u32,

    /// Firewall mark to tag request sockets with.
    pub mark: u32,

    /// Whether the queries carry an EDNS0 OPT record.
    pub use_edns: bool,

    /// The response code of the last attempt. Pseudo codes report
    /// timeouts and internal failures.
    pub rcode: Rcode,

    /// The server list snapshot.
    pub(crate) servers: SmallVec<[SocketAddr; MAXNS]>,

    /// The search domain snapshot.
    pub(crate) search_domains: Vec<String>,

    /// The parameter snapshot.
    pub(crate) params: ResolvParams,

    /// The revision the snapshot was taken at.
    pub(crate) revision_id: u32,

    /// Set when a server answered FORMERR to an EDNS0 query. The caller
    /// should rebuild its queries without EDNS0 while this is set.
    pub(crate) edns0_broken: bool,
}

impl ResState {
    /// Creates an empty state for a network.
    ///
    /// [`Resolver::populate`] fills in the server snapshot.
    pub fn new(netid: u32) -> Self {
        ResState {
            netid,
            uid: 0,
            pid: 0,
            mark: MARK_UNSET,
            use_edns: false,
            rcode: Rcode::NOERROR,
            servers: SmallVec::new(),
            search_domains: Vec::new(),
            params: ResolvParams::default(),
            revision_id: 0,
            edns0_broken: false,
        }
    }

    /// Returns the current server snapshot.
    pub fn servers(&self) -> &[SocketAddr] {
        &self.servers
    }

    /// Returns the current search domain snapshot.
    pub fn search_domains(&self) -> &[String] {
        &self.search_domains
    }

    /// Returns whether a server rejected an EDNS0 query outright.
    pub fn edns0_broken(&self) -> bool {
        self.edns0_broken
    }
}

//------------ QueryContext --------------------------------------------------

/// The sockets owned by a single `nsend` call.
///
/// Dropped on every exit path, which closes everything it still holds.
struct QueryContext<'a> {
    /// The tagging hook for new sockets.
    tagger: &'a Arc<dyn SocketTagger>,

    /// Caller identity for tagging.
    uid: u32,
    pid: u32,

    /// Lazily created UDP sockets, one per server index.
    udp: [Option<UdpSocket>; MAXNS],

    /// The current TCP connection, if any.
    tcp: Option<TcpConn>,
}

/// A TCP connection and the identity it was made for.
struct TcpConn {
    stream: TcpStream,
    peer: SocketAddr,
    mark: u32,
}

impl<'a> QueryContext<'a> {
    fn new(tagger: &'a Arc<dyn SocketTagger>, uid: u32, pid: u32) -> Self {
        QueryContext {
            tagger,
            uid,
            pid,
            udp: [(); MAXNS].map(|_| None),
            tcp: None,
        }
    }
}

//------------ Attempt -------------------------------------------------------

/// The outcome of one attempt against one server.
enum Attempt {
    /// A response of this length is in the answer buffer.
    Answer(usize),

    /// This server is done for; move on to the next one.
    NextServer,

    /// The UDP reply was truncated; retry the same server over TCP.
    Escalate,
}

//------------ nsend ---------------------------------------------------------

impl Resolver {
    /// Resolves a raw query packet, creating the query state internally.
    ///
    /// Convenience wrapper around [`populate`][Self::populate] and
    /// [`nsend`][Self::nsend] for callers without state to carry over.
    pub async fn resolve(
        &self,
        netid: u32,
        query: &[u8],
        ans: &mut [u8],
        flags: QueryFlags,
    ) -> Result<usize, Error> {
        let mut state = ResState::new(netid);
        self.populate(&mut state);
        self.nsend(&mut state, query, ans, flags).await
    }

    /// Sends a raw query packet and waits for the answer.
    ///
    /// Consults the cache first, then — subject to the network's private
    /// DNS mode — either the TLS dispatcher or the cleartext send
    /// engine. On success the raw answer is in `ans` and its length is
    /// returned; `statp.rcode` carries the response code of the final
    /// attempt. On failure every waiter blocked on this query is
    /// released before the error is returned.
    pub async fn nsend(
        &self,
        statp: &mut ResState,
        query: &[u8],
        ans: &mut [u8],
        flags: QueryFlags,
    ) -> Result<usize, Error> {
        if ans.len() < HEADER_LEN
            || query.len() < HEADER_LEN
            || query.len() > usize::from(u16::MAX)
        {
            return Err(Error::InvalidQuery);
        }
        statp.rcode = Rcode::NOERROR;

        let (cache_status, cached_len) =
            self.cache_lookup(statp.netid, query, ans, flags).await;
        if cache_status == CacheStatus::Found {
            statp.rcode = Header::for_message_slice(ans).rcode();
            return Ok(cached_len);
        }
        if cache_status != CacheStatus::Unsupported {
            // Cache miss on a known network; refresh the server snapshot
            // so the normal resolve path can do its thing.
            self.populate(statp);
        }
        if statp.servers.is_empty() {
            // Nobody to ask. Fail the query now, or anyone else asking
            // the same question will block for the pending-request
            // timeout instead of failing fast.
            self.cache_query_failed(statp.netid, query, flags);
            return Err(Error::NoNameservers);
        }

        if !flags.contains(QueryFlags::USE_LOCAL_NAMESERVERS) {
            match self.tls_send(statp, query, ans).await {
                TlsOutcome::Answer(len) => {
                    debug!("got answer from DoT");
                    if cache_status == CacheStatus::NotFound {
                        let _ = self.cache_add(statp.netid, query, &ans[..len]);
                    }
                    return Ok(len);
                }
                TlsOutcome::Fallback => {}
                TlsOutcome::Fail(err) => {
                    self.cache_query_failed(statp.netid, query, flags);
                    return Err(err);
                }
            }
        }

        let Some((params, stats, revision_id)) =
            self.resolver_stats(statp.netid)
        else {
            return Err(Error::NoNameservers);
        };
        let nscount = statp.servers.len();
        let (mut usable, usable_count) =
            usable_servers(&params, &stats[..nscount], Instant::now());

        if flags.contains(QueryFlags::NO_RETRY) && usable_count > 1 {
            // A single attempt only; pick one server deterministically
            // from the query id so retries from the caller spread out.
            let selected =
                usize::from(Header::for_message_slice(query).id())
                    % usable_count
                    + 1;
            set_usable_server(selected, nscount, &mut usable);
        }

        let retry_times = if flags.contains(QueryFlags::NO_RETRY) {
            1
        } else {
            params.retry_count as usize
        };
        let mut use_tcp = query.len() > PACKETSZ;
        let mut gotsomewhere = false;
        let mut terrno = Error::TimedOut;
        let mut ctx =
            QueryContext::new(&self.inner.tagger, statp.uid, statp.pid);

        let mut attempt = 0;
        while attempt < retry_times {
            let mut ns = 0;
            while ns < nscount {
                if !usable[ns] {
                    ns += 1;
                    continue;
                }
                statp.rcode = Rcode::INTERNAL_ERROR;
                debug!(server = %statp.servers[ns], ns, "querying server");

                let record_stats = attempt == 0;
                let sampled_at = Instant::now();
                let mut delay_us = 0;
                let outcome = if use_tcp {
                    // TCP: at most one pass over the servers, regardless
                    // of the retry count.
                    attempt = retry_times;
                    send_vc(
                        statp, &mut ctx, &params, query, ans, ns,
                        &mut terrno, &mut delay_us,
                    )
                    .await
                } else {
                    send_dg(
                        statp, &mut ctx, &params, query, ans, ns,
                        &mut terrno, &mut gotsomewhere, &mut delay_us,
                    )
                    .await
                };

                // Only the first attempt feeds the statistics, so a
                // query that fails deterministically (a name that always
                // times out, say) does not unduly poison them.
                if record_stats {
                    self.add_sample(
                        statp.netid,
                        revision_id,
                        ns,
                        Sample {
                            at: sampled_at,
                            rcode: statp.rcode,
                            rtt_us: delay_us,
                        },
                        params.max_samples,
                    );
                }

                match outcome {
                    Attempt::NextServer => ns += 1,
                    Attempt::Escalate => {
                        // Truncated: same server again, over TCP.
                        use_tcp = true;
                    }
                    Attempt::Answer(len) => {
                        debug!(len, "got answer");
                        if cache_status == CacheStatus::NotFound {
                            let _ = self
                                .cache_add(statp.netid, query, &ans[..len]);
                        }
                        return Ok(len);
                    }
                }
            }
            attempt += 1;
        }

        drop(ctx);
        let err = if use_tcp {
            terrno
        } else if gotsomewhere {
            Error::TimedOut
        } else {
            Error::NoContact
        };
        self.cache_query_failed(statp.netid, query, flags);
        Err(err)
    }
}

//------------ Private DNS gating --------------------------------------------

/// The outcome of trying the query over private DNS.
enum TlsOutcome {
    /// A response of this length is in the answer buffer.
    Answer(usize),

    /// Private DNS does not apply; proceed over cleartext.
    Fallback,

    /// Hard failure; no cleartext fallback permitted.
    Fail(Error),
}

impl Resolver {
    /// Runs a query over private DNS according to the network's mode.
    async fn tls_send(
        &self,
        statp: &mut ResState,
        query: &[u8],
        ans: &mut [u8],
    ) -> TlsOutcome {
        let mut status = self.inner.pdns.status(statp.netid);
        if status.mode == PrivateDnsMode::Off {
            return TlsOutcome::Fallback;
        }

        if status.validated_servers().is_empty() {
            if status.mode == PrivateDnsMode::Opportunistic {
                return TlsOutcome::Fallback;
            }
            // A network that just became the default starts taking app
            // traffic before its servers finished their first
            // validation. Poll briefly instead of failing those queries
            // outright.
            for _ in 0..STRICT_STARTUP_POLLS {
                sleep(STRICT_STARTUP_POLL_INTERVAL).await;
                status = self.inner.pdns.status(statp.netid);
                if !status.validated_servers().is_empty() {
                    break;
                }
            }
            if status.validated_servers().is_empty() {
                return TlsOutcome::Fail(Error::TimedOut);
            }
        }

        debug!("performing query over TLS");
        let servers = status.validated_servers();
        let response = self
            .inner
            .dispatcher
            .query(&servers, statp.netid, query, ans)
            .await;
        debug!(?response, "TLS query result");

        match status.mode {
            PrivateDnsMode::Opportunistic => match response {
                TlsResponse::Success(len) => {
                    statp.rcode = Header::for_message_slice(ans).rcode();
                    TlsOutcome::Answer(len)
                }
                // DNS should not fail outright just because a validated
                // opportunistic server became unreachable.
                TlsResponse::NetworkError | TlsResponse::InternalError => {
                    TlsOutcome::Fallback
                }
                TlsResponse::LimitError => {
                    TlsOutcome::Fail(Error::TimedOut)
                }
            },
            PrivateDnsMode::Strict => match response {
                TlsResponse::Success(len) => {
                    statp.rcode = Header::for_message_slice(ans).rcode();
                    TlsOutcome::Answer(len)
                }
                TlsResponse::NetworkError => {
                    statp.rcode = Rcode::TIMEOUT;
                    TlsOutcome::Fail(Error::TimedOut)
                }
                TlsResponse::InternalError | TlsResponse::LimitError => {
                    TlsOutcome::Fail(Error::TimedOut)
                }
            },
            PrivateDnsMode::Off => TlsOutcome::Fallback,
        }
    }
}

//------------ Timeouts and server selection ---------------------------------

/// Computes the timeout for an attempt against the server at index `ns`.
///
/// The legacy schedule scales the base timeout by the server index: with
/// the 5000 ms default and four servers this yields 5000, 2500, 5000 and
/// 10000 ms, giving the first server the base and later ones
/// progressively more. Never shorter than one second, whatever the
/// configuration says.
fn attempt_timeout(
    params: &ResolvParams,
    ns: usize,
    nscount: usize,
) -> Duration {
    let mut msec = u64::from(params.base_timeout_msec) << ns;
    if ns > 0 {
        msec /= nscount as u64;
    }
    if msec < 1000 {
        msec = 1000;
    }
    debug!(msec, "using timeout");
    Duration::from_millis(msec)
}

/// Disables all usable servers other than the `selected`-th one.
fn set_usable_server(
    selected: usize,
    nscount: usize,
    usable: &mut [bool; MAXNS],
) {
    let mut index = 0;
    for ns in 0..nscount {
        if usable[ns] {
            index += 1;
        }
        if index != selected {
            usable[ns] = false;
        }
    }
}

//------------ UDP transport -------------------------------------------------

/// Returns the wildcard address of the server's family.
fn any_addr(server: &SocketAddr) -> IpAddr {
    match server {
        SocketAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        SocketAddr::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
    }
}

/// Binds a datagram socket to a random source port.
///
/// Ten attempts in the non-reserved range; if all of them collide the
/// port table is probably busy and the system picks instead.
async fn bind_udp_random(server: SocketAddr) -> io::Result<UdpSocket> {
    let any = any_addr(&server);
    for _ in 0..10 {
        let port = rand::thread_rng().gen_range(1025..65535);
        if let Ok(sock) = UdpSocket::bind(SocketAddr::new(any, port)).await {
            return Ok(sock);
        }
    }
    UdpSocket::bind(SocketAddr::new(any, 0)).await
}

/// One UDP attempt against the server at index `ns`.
#[allow(clippy::too_many_arguments)]
async fn send_dg(
    statp: &mut ResState,
    ctx: &mut QueryContext<'_>,
    params: &ResolvParams,
    query: &[u8],
    ans: &mut [u8],
    ns: usize,
    terrno: &mut Error,
    gotsomewhere: &mut bool,
    delay_us: &mut u32,
) -> Attempt {
    let server = statp.servers[ns];
    let sock = match ctx.udp[ns].take() {
        Some(sock) => sock,
        None => {
            let sock = match bind_udp_random(server).await {
                Ok(sock) => sock,
                Err(err) => {
                    debug!(%err, "socket(dg)");
                    *terrno = Error::Socket(Arc::new(err));
                    return Attempt::NextServer;
                }
            };
            ctx.tagger.tag(sock.as_raw_fd(), ctx.uid, ctx.pid);
            // A connected socket surfaces an ICMP port-unreachable as an
            // error on the next operation, so an absent nameserver is
            // detected without waiting out the timeout.
            if let Err(err) = sock.connect(server).await {
                debug!(%err, "connect(dg)");
                return Attempt::NextServer;
            }
            debug!("new DG socket");
            sock
        }
    };

    if let Err(err) = sock.send(query).await {
        debug!(%err, "send");
        *terrno = Error::Socket(Arc::new(err));
        return Attempt::NextServer;
    }

    let start = Instant::now();
    let deadline = start + attempt_timeout(params, ns, statp.servers.len());
    loop {
        let (resplen, from) =
            match timeout_at(deadline, sock.recv_from(ans)).await {
                Err(_) => {
                    debug!("timeout");
                    statp.rcode = Rcode::TIMEOUT;
                    *gotsomewhere = true;
                    ctx.udp[ns] = Some(sock);
                    return Attempt::NextServer;
                }
                Ok(Err(err)) => {
                    debug!(%err, "recvfrom");
                    *terrno = Error::Socket(Arc::new(err));
                    return Attempt::NextServer;
                }
                Ok(Ok(received)) => received,
            };
        *gotsomewhere = true;

        if resplen < HEADER_LEN {
            debug!(resplen, "undersized");
            *terrno = Error::Socket(Arc::new(io::Error::new(
                io::ErrorKind::InvalidData,
                "undersized response",
            )));
            return Attempt::NextServer;
        }
        if Header::for_message_slice(ans).id()
            != Header::for_message_slice(query).id()
        {
            // Response to an old query; ignore it.
            debug!("old answer");
            continue;
        }
        if !statp.servers.contains(&from) {
            // Response from a wrong server; ignore it. This protects
            // against blind answer spoofing.
            debug!(%from, "not our server");
            continue;
        }
        let rcode = Header::for_message_slice(ans).rcode();
        if rcode == Rcode::FORMERR && statp.use_edns {
            // The server cannot cope with EDNS0. This has to be caught
            // here: a FORMERR reply carries no question section, so the
            // queries-match check below would just discard it.
            debug!("server rejected query with EDNS0");
            statp.edns0_broken = true;
            return Attempt::NextServer;
        }
        if !packet::queries_match(query, &ans[..resplen]) {
            // Response for a different question; ignore it.
            debug!("wrong query name");
            continue;
        }
        *delay_us = elapsed_us(start);
        if matches!(
            rcode,
            Rcode::SERVFAIL | Rcode::NOTIMP | Rcode::REFUSED
        ) {
            debug!(rcode = rcode.to_int(), "server rejected query");
            statp.rcode = rcode;
            return Attempt::NextServer;
        }
        if Header::for_message_slice(ans).tc() {
            debug!("truncated answer");
            return Attempt::Escalate;
        }
        statp.rcode = rcode;
        ctx.udp[ns] = Some(sock);
        return Attempt::Answer(resplen);
    }
}

//------------ TCP transport -------------------------------------------------

/// Binds a stream socket to a random source port, then connects with a
/// timeout.
async fn connect_tcp(
    server: SocketAddr,
    timeout_dur: Duration,
    tagger: &Arc<dyn SocketTagger>,
    uid: u32,
    pid: u32,
) -> io::Result<TcpStream> {
    let socket = match server {
        SocketAddr::V4(_) => TcpSocket::new_v4()?,
        SocketAddr::V6(_) => TcpSocket::new_v6()?,
    };
    tagger.tag(socket.as_raw_fd(), uid, pid);

    let any = any_addr(&server);
    let mut bound = false;
    for _ in 0..10 {
        let port = rand::thread_rng().gen_range(1025..65535);
        if socket.bind(SocketAddr::new(any, port)).is_ok() {
            bound = true;
            break;
        }
    }
    if !bound {
        socket.bind(SocketAddr::new(any, 0))?;
    }

    match timeout(timeout_dur, socket.connect(server)).await {
        Ok(result) => result,
        Err(_) => Err(io::Error::new(
            io::ErrorKind::TimedOut,
            "connect timed out",
        )),
    }
}

/// One TCP attempt against the server at index `ns`.
#[allow(clippy::too_many_arguments)]
async fn send_vc(
    statp: &mut ResState,
    ctx: &mut QueryContext<'_>,
    params: &ResolvParams,
    query: &[u8],
    ans: &mut [u8],
    ns: usize,
    terrno: &mut Error,
    delay_us: &mut u32,
) -> Attempt {
    let server = statp.servers[ns];
    let mut connreset = false;
    debug!("using send_vc");

    'same_ns: loop {
        let start = Instant::now();

        // Are we still talking to whom we want to talk to?
        let mut conn = match ctx.tcp.take() {
            Some(conn) if conn.peer == server && conn.mark == statp.mark => {
                conn
            }
            _ => {
                let timeout_dur =
                    attempt_timeout(params, ns, statp.servers.len());
                match connect_tcp(
                    server, timeout_dur, ctx.tagger, ctx.uid, ctx.pid,
                )
                .await
                {
                    Ok(stream) => TcpConn {
                        stream,
                        peer: server,
                        mark: statp.mark,
                    },
                    Err(err) => {
                        // The connect path cannot reliably distinguish a
                        // timeout from e.g. a refused connection; both
                        // count as a timed out attempt.
                        debug!(%err, "connect/vc");
                        statp.rcode = Rcode::TIMEOUT;
                        *terrno = Error::Socket(Arc::new(err));
                        return Attempt::NextServer;
                    }
                }
            }
        };

        // Send length and message.
        let len_prefix = (query.len() as u16).to_be_bytes();
        let write_res = async {
            conn.stream.write_all(&len_prefix).await?;
            conn.stream.write_all(query).await
        }
        .await;
        if let Err(err) = write_res {
            debug!(%err, "write failed");
            *terrno = Error::Socket(Arc::new(err));
            return Attempt::NextServer;
        }

        // Receive length and response.
        loop {
            let mut len_buf = [0u8; 2];
            if let Err(err) = conn.stream.read_exact(&mut len_buf).await {
                // A long running process might get its connection reset
                // if the remote server was restarted. Requery the same
                // server instead of moving on, but only once per query
                // to prevent looping.
                if err.kind() == io::ErrorKind::ConnectionReset && !connreset
                {
                    connreset = true;
                    continue 'same_ns;
                }
                debug!(%err, "read failed");
                *terrno = Error::Socket(Arc::new(err));
                return Attempt::NextServer;
            }
            let resplen = usize::from(u16::from_be_bytes(len_buf));
            let truncating = resplen > ans.len();
            let read_len = resplen.min(ans.len());
            if read_len < HEADER_LEN {
                debug!(read_len, "undersized");
                *terrno = Error::Socket(Arc::new(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "undersized response",
                )));
                return Attempt::NextServer;
            }
            if let Err(err) =
                conn.stream.read_exact(&mut ans[..read_len]).await
            {
                debug!(%err, "read(vc)");
                *terrno = Error::Socket(Arc::new(err));
                return Attempt::NextServer;
            }
            if truncating {
                // The caller's buffer is too small for the response.
                // Mark it truncated and flush the rest of the answer so
                // the connection stays in sync.
                debug!("response truncated");
                Header::for_message_slice_mut(ans).set_tc(true);
                let mut left = resplen - read_len;
                let mut junk = [0u8; PACKETSZ];
                while left > 0 {
                    let take = left.min(junk.len());
                    match conn.stream.read(&mut junk[..take]).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => left -= n,
                    }
                }
            }
            if Header::for_message_slice(ans).id()
                != Header::for_message_slice(query).id()
            {
                // The server has got itself confused, or a previous
                // caller bailed out mid-exchange. Drop the packet and
                // wait for the correct one.
                debug!("old answer (unexpected)");
                continue;
            }
            *delay_us = elapsed_us(start);
            statp.rcode = Header::for_message_slice(ans).rcode();
            ctx.tcp = Some(conn);
            return Attempt::Answer(read_len);
        }
    }
}

/// Microseconds elapsed since `start`, saturating.
fn elapsed_us(start: Instant) -> u32 {
    start.elapsed().as_micros().min(u128::from(u32::MAX)) as u32
}

//============ Testing =======================================================

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn timeout_schedule_scales_with_server_index() {
        let params = ResolvParams {
            base_timeout_msec: 5000,
            ..Default::default()
        };
        let schedule: Vec<u64> = (0..4)
            .map(|ns| attempt_timeout(&params, ns, 4).as_millis() as u64)
            .collect();
        assert_eq!(schedule, [5000, 2500, 5000, 10000]);

        // One server always gets the base.
        assert_eq!(
            attempt_timeout(&params, 0, 1),
            Duration::from_millis(5000)
        );
    }

    #[test]
    fn timeout_never_below_one_second() {
        let params = ResolvParams {
            base_timeout_msec: 10,
            ..Default::default()
        };
        assert_eq!(attempt_timeout(&params, 0, 4), Duration::from_secs(1));
        assert_eq!(attempt_timeout(&params, 1, 4), Duration::from_secs(1));
    }

    #[test]
    fn single_server_selection() {
        let mut usable = [true, true, true, true];
        set_usable_server(2, 4, &mut usable);
        assert_eq!(usable, [false, true, false, false]);

        // Selection counts only usable servers.
        let mut usable = [true, false, true, true];
        set_usable_server(2, 4, &mut usable);
        assert_eq!(usable, [false, false, true, false]);
    }

    #[test]
    fn fresh_state_is_empty() {
        let state = ResState::new(30);
        assert_eq!(state.netid, 30);
        assert!(state.servers().is_empty());
        assert!(!state.edns0_broken());
        assert_eq!(state.rcode, Rcode::NOERROR);
    }
}
