//! The per-network registry.
//!
//! A [`Resolver`] owns everything the core knows about its networks: the
//! answer cache, the upstream server list, search domains, resolver
//! parameters and reachability statistics, all keyed by network id. One
//! mutex guards the whole registry; the critical sections are short and
//! every blocking wait happens outside of them.
//!
//! There is deliberately no process-global instance. A `Resolver` is
//! cheap to clone (everything lives behind an `Arc`), so an embedder that
//! wants exactly one simply keeps one.

use crate::cache::AnswerCache;
use crate::config::{
    self, ConfigOracle, NullOracle, ResolvParams,
};
use crate::error::Error;
use crate::pdns::{PrivateDnsConfig, ValidationListener};
use crate::send::{NullTagger, ResState, SocketTagger};
use crate::stats::{Sample, ServerStats, MAXNS};
use crate::tls::{RustlsDispatcher, RustlsValidator, TlsDispatcher, TlsValidator};
use parking_lot::Mutex;
use smallvec::SmallVec;
use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::{debug, warn};

//------------ Configuration Constants ---------------------------------------

/// The maximum number of search domains per network.
pub const MAXDNSRCH: usize = 6;

/// The maximum length of a single search domain, including the NUL the
/// C surface would need.
pub const MAXDNSRCHPATH: usize = 256;

/// The port cleartext nameservers are queried on.
const DNS_PORT: u16 = 53;

//------------ Resolver ------------------------------------------------------

/// A per-network DNS stub resolver.
///
/// This value collects all state needed to answer raw DNS queries on
/// behalf of a set of networks: per-network answer caches, upstream
/// server configuration, reachability statistics and the private DNS
/// tracker. Resolver values can be cloned cheaply as they keep all
/// information behind an arc.
#[derive(Clone)]
pub struct Resolver {
    /// Reference to the shared state.
    pub(crate) inner: Arc<ResolverInner>,
}

/// The shared state of a resolver.
pub(crate) struct ResolverInner {
    /// All per-network state, guarded by the one registry lock.
    pub(crate) networks: Mutex<HashMap<u32, NetworkState>>,

    /// Wakes cache lookups blocked on a pending request.
    ///
    /// This is the condition-variable side of the registry lock: waiters
    /// arm it while still holding the lock so no wakeup can be lost.
    pub(crate) pending_waiters: Notify,

    /// The private DNS tracker.
    pub(crate) pdns: Arc<PrivateDnsConfig>,

    /// Transport used for queries over validated DoT servers.
    pub(crate) dispatcher: Arc<dyn TlsDispatcher>,

    /// Source of named configuration flag overrides.
    pub(crate) oracle: Arc<dyn ConfigOracle>,

    /// Hook invoked on every newly created upstream socket.
    pub(crate) tagger: Arc<dyn SocketTagger>,
}

/// All state the resolver keeps for a single network.
pub(crate) struct NetworkState {
    /// The answer cache.
    pub(crate) cache: AnswerCache,

    /// The configured nameservers, verbatim as passed in.
    pub(crate) nameservers: Vec<String>,

    /// The parsed socket addresses of the nameservers.
    pub(crate) ns_addrs: SmallVec<[SocketAddr; MAXNS]>,

    /// The search domain list.
    pub(crate) search_domains: Vec<String>,

    /// Resolver parameters, with defaults already applied.
    pub(crate) params: ResolvParams,

    /// Per-server reachability statistics.
    pub(crate) stats: [ServerStats; MAXNS],

    /// Bumped whenever the server list or `max_samples` changes, so
    /// samples recorded against an older generation are discarded.
    pub(crate) revision_id: u32,

    /// Event subsampling map: return code to sampling denominator.
    pub(crate) subsampling_map: HashMap<i32, u32>,

    /// How often a cache lookup gave up waiting on a pending request.
    pub(crate) wait_for_pending_req_timeout_count: u32,
}

impl NetworkState {
    fn new(subsampling_map: HashMap<i32, u32>) -> Self {
        NetworkState {
            cache: AnswerCache::new(),
            nameservers: Vec::new(),
            ns_addrs: SmallVec::new(),
            search_domains: Vec::new(),
            params: ResolvParams::default(),
            stats: std::array::from_fn(|_| ServerStats::default()),
            revision_id: 0,
            subsampling_map,
            wait_for_pending_req_timeout_count: 0,
        }
    }
}

//------------ ResolverBuilder -----------------------------------------------

/// A builder wiring a resolver to its external collaborators.
pub struct ResolverBuilder {
    /// The DoT query transport.
    dispatcher: Arc<dyn TlsDispatcher>,

    /// The DoT validation probe.
    validator: Arc<dyn TlsValidator>,

    /// Named-flag configuration reads.
    oracle: Arc<dyn ConfigOracle>,

    /// Socket tagging hook.
    tagger: Arc<dyn SocketTagger>,
}

impl ResolverBuilder {
    /// Replaces the DoT query transport.
    pub fn dispatcher(mut self, dispatcher: Arc<dyn TlsDispatcher>) -> Self {
        self.dispatcher = dispatcher;
        self
    }

    /// Replaces the DoT validation probe.
    pub fn validator(mut self, validator: Arc<dyn TlsValidator>) -> Self {
        self.validator = validator;
        self
    }

    /// Replaces the configuration oracle.
    pub fn oracle(mut self, oracle: Arc<dyn ConfigOracle>) -> Self {
        self.oracle = oracle;
        self
    }

    /// Replaces the socket tagging hook.
    pub fn tagger(mut self, tagger: Arc<dyn SocketTagger>) -> Self {
        self.tagger = tagger;
        self
    }

    /// Creates the resolver.
    pub fn build(self) -> Resolver {
        Resolver {
            inner: Arc::new(ResolverInner {
                networks: Mutex::new(HashMap::new()),
                pending_waiters: Notify::new(),
                pdns: PrivateDnsConfig::new(self.validator),
                dispatcher: self.dispatcher,
                oracle: self.oracle,
                tagger: self.tagger,
            }),
        }
    }
}

impl Default for ResolverBuilder {
    fn default() -> Self {
        ResolverBuilder {
            dispatcher: Arc::new(RustlsDispatcher::new()),
            validator: Arc::new(RustlsValidator::new()),
            oracle: Arc::new(NullOracle),
            tagger: Arc::new(NullTagger),
        }
    }
}

//------------ Network management --------------------------------------------

impl Resolver {
    /// Creates a resolver with default collaborators.
    pub fn new() -> Self {
        Self::builder().build()
    }

    /// Returns a builder for a resolver with custom collaborators.
    pub fn builder() -> ResolverBuilder {
        ResolverBuilder::default()
    }

    /// Registers an observer for private DNS validation outcomes.
    pub fn register_validation_listener(
        &self,
        listener: Arc<dyn ValidationListener>,
    ) {
        self.inner.pdns.register_listener(listener);
    }

    /// Creates the state for a new network.
    pub fn create_network(&self, netid: u32) -> Result<(), Error> {
        let mut networks = self.inner.networks.lock();
        if networks.contains_key(&netid) {
            return Err(Error::NetworkExists);
        }
        networks.insert(
            netid,
            NetworkState::new(config::subsampling_map(&self.inner.oracle)),
        );
        debug!(netid, "network created");
        Ok(())
    }

    /// Destroys a network, dropping its cache and configuration.
    ///
    /// Lookups currently blocked on one of its pending requests are woken
    /// and report a cache miss.
    pub fn destroy_network(&self, netid: u32) {
        let removed = self.inner.networks.lock().remove(&netid);
        if removed.is_some() {
            self.inner.pending_waiters.notify_waiters();
            debug!(netid, "network destroyed");
        }
    }

    /// Returns the ids of all known networks.
    pub fn list_networks(&self) -> Vec<u32> {
        self.inner.networks.lock().keys().copied().collect()
    }

    /// Returns whether the network exists and has nameservers configured.
    pub fn has_nameservers(&self, netid: u32) -> bool {
        self.inner
            .networks
            .lock()
            .get(&netid)
            .map_or(false, |net| !net.ns_addrs.is_empty())
    }
}

//------------ Nameserver configuration --------------------------------------

/// Caps the server list at [`MAXNS`] entries.
///
/// No deduplication happens here; the callers are trusted to not send
/// duplicates and the set-based comparison below tolerates them.
fn filter_nameservers(servers: &[String]) -> Vec<String> {
    let mut res = servers.to_vec();
    if res.len() > MAXNS {
        warn!("too many servers: {}", res.len());
        res.truncate(MAXNS);
    }
    res
}

/// Returns valid domains without duplicates, capped at [`MAXDNSRCH`].
fn filter_domains(domains: &[String]) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut res: Vec<String> = domains
        .iter()
        .filter(|d| d.len() <= MAXDNSRCHPATH - 1 && seen.insert(d.as_str()))
        .cloned()
        .collect();
    if res.len() > MAXDNSRCH {
        warn!(
            "valid domains={}, but MAXDNSRCH={}",
            res.len(),
            MAXDNSRCH
        );
        res.truncate(MAXDNSRCH);
    }
    res
}

/// Parses a nameserver string as a numeric address.
///
/// A bare address gets the default DNS port; an explicit `addr:port`
/// form (`[addr]:port` for IPv6) is used as given. Names are never
/// resolved here.
fn parse_server(server: &str) -> Result<SocketAddr, Error> {
    if let Ok(addr) = server.parse::<SocketAddr>() {
        return Ok(addr);
    }
    let addr: IpAddr = server.parse().map_err(|_| {
        debug!("failed to parse server address {:?}", server);
        Error::InvalidServer
    })?;
    Ok(SocketAddr::new(addr, DNS_PORT))
}

/// Order-insensitive comparison for two sets of servers.
fn is_nameservers_equal(old: &[String], new: &[String]) -> bool {
    let old: HashSet<&str> = old.iter().map(String::as_str).collect();
    let new: HashSet<&str> = new.iter().map(String::as_str).collect();
    old == new
}

impl Resolver {
    /// Sets the nameservers, search domains and parameters of a network.
    ///
    /// Every server must be a numeric address; any parse failure aborts
    /// the whole call with the state unchanged. If the order-insensitive
    /// set of servers is unchanged the per-server statistics survive;
    /// otherwise they are cleared and the revision id is bumped so stale
    /// samples recorded against the old generation are discarded. The
    /// search domains are always replaced: cache entries stay valid since
    /// the domain is part of the cached query bytes.
    pub fn set_nameservers(
        &self,
        netid: u32,
        servers: &[String],
        domains: &[String],
        params: ResolvParams,
    ) -> Result<(), Error> {
        let nameservers = filter_nameservers(servers);
        debug!(netid, numservers = nameservers.len(), "set_nameservers");

        // Parse all addresses before touching any state, so an error
        // leaves the network untouched.
        let mut ns_addrs: SmallVec<[SocketAddr; MAXNS]> = SmallVec::new();
        for server in &nameservers {
            ns_addrs.push(parse_server(server)?);
        }

        let mut networks = self.inner.networks.lock();
        let net = networks.get_mut(&netid).ok_or(Error::UnknownNetwork)?;

        let old_max_samples = net.params.max_samples;
        net.params = params;
        config::apply_experiment_params(&mut net.params, &self.inner.oracle);

        if !is_nameservers_equal(&net.nameservers, &nameservers) {
            net.nameservers = nameservers;
            net.ns_addrs = ns_addrs;
            for stats in &mut net.stats {
                stats.clear();
            }
            net.revision_id += 1;
        } else if net.params.max_samples != old_max_samples {
            // Keeping the most recent samples across a ring resize is not
            // worth the effort; other parameters only affect aggregation
            // and leave the recorded samples valid.
            for stats in &mut net.stats {
                stats.clear();
            }
            net.revision_id += 1;
        }

        net.search_domains = filter_domains(domains);
        Ok(())
    }

    /// Copies the network's current server configuration into a query
    /// state.
    ///
    /// An unknown network leaves the state with an empty server list.
    pub fn populate(&self, state: &mut ResState) {
        let networks = self.inner.networks.lock();
        match networks.get(&state.netid) {
            Some(net) => {
                state.servers = net.ns_addrs.clone();
                state.search_domains = net.search_domains.clone();
                state.params = net.params;
                state.revision_id = net.revision_id;
            }
            None => state.servers.clear(),
        }
    }
}

//------------ Statistics access ---------------------------------------------

/// A read-only snapshot of a network's configuration and statistics.
#[derive(Clone, Debug)]
pub struct NetworkInfo {
    /// The parsed nameserver addresses.
    pub servers: Vec<SocketAddr>,

    /// The search domain list.
    pub domains: Vec<String>,

    /// The effective resolver parameters.
    pub params: ResolvParams,

    /// Per-server reachability statistics.
    pub stats: Vec<ServerStats>,

    /// The current server-list revision.
    pub revision_id: u32,

    /// How often a cache lookup gave up waiting on a pending request.
    pub wait_for_pending_req_timeout_count: u32,
}

impl Resolver {
    /// Returns the params, stats and revision id for a network.
    pub(crate) fn resolver_stats(
        &self,
        netid: u32,
    ) -> Option<(ResolvParams, [ServerStats; MAXNS], u32)> {
        let networks = self.inner.networks.lock();
        let net = networks.get(&netid)?;
        Some((net.params, net.stats.clone(), net.revision_id))
    }

    /// Records a reachability sample, provided the server list has not
    /// been replaced since the caller snapshotted it.
    pub(crate) fn add_sample(
        &self,
        netid: u32,
        revision_id: u32,
        ns: usize,
        sample: Sample,
        max_samples: u8,
    ) {
        if max_samples == 0 || ns >= MAXNS {
            return;
        }
        let mut networks = self.inner.networks.lock();
        if let Some(net) = networks.get_mut(&netid) {
            if net.revision_id == revision_id {
                net.stats[ns].add_sample(sample, max_samples);
            }
        }
    }

    /// Returns a snapshot of a network's configuration and statistics.
    pub fn network_info(&self, netid: u32) -> Option<NetworkInfo> {
        let networks = self.inner.networks.lock();
        let net = networks.get(&netid)?;
        Some(NetworkInfo {
            servers: net.ns_addrs.to_vec(),
            domains: net.search_domains.clone(),
            params: net.params,
            stats: net.stats.to_vec(),
            revision_id: net.revision_id,
            wait_for_pending_req_timeout_count: net
                .wait_for_pending_req_timeout_count,
        })
    }

    /// Returns the event subsampling denominator for a return code.
    ///
    /// Returns 0 (log nothing) for unknown networks and for return codes
    /// with neither their own entry nor a default entry.
    pub fn subsampling_denom(&self, netid: u32, return_code: i32) -> u32 {
        let networks = self.inner.networks.lock();
        let Some(net) = networks.get(&netid) else {
            return 0;
        };
        net.subsampling_map
            .get(&return_code)
            .or_else(|| {
                net.subsampling_map.get(&config::SUBSAMPLING_DEFAULT_KEY)
            })
            .copied()
            .unwrap_or(0)
    }

    /// Renders a network's subsampling map for diagnostics.
    pub fn dump_subsampling_map(&self, netid: u32) -> Vec<String> {
        let networks = self.inner.networks.lock();
        let Some(net) = networks.get(&netid) else {
            return Vec::new();
        };
        net.subsampling_map
            .iter()
            .map(|(code, denom)| {
                if *code == config::SUBSAMPLING_DEFAULT_KEY {
                    format!("default:{}", denom)
                } else {
                    format!("{}:{}", code, denom)
                }
            })
            .collect()
    }
}

impl Default for Resolver {
    fn default() -> Self {
        Self::new()
    }
}

//============ Testing =======================================================
