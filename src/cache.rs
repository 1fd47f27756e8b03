//! The per-network answer cache.
//!
//! This is a small and deliberately *simple* DNS answer cache: raw query
//! packets in, raw answer packets out, kept for the smallest TTL among the
//! answer records. It is not an authoritative DNS cache — two queries that
//! encode the same name differently are distinct keys, and answers are
//! never rewritten.
//!
//! Entries live in an arena of slots addressed by small integer handles;
//! the per-bucket collision chains and the MRU list both store handles
//! rather than pointers. Every entry is in exactly one bucket chain and on
//! the MRU list. When the cache is full, expired entries are evicted
//! first, then the tail of the MRU list.
//!
//! Besides the answers themselves the cache tracks *pending requests*: a
//! lookup that misses registers the query's fingerprint hash, and further
//! lookups for the same fingerprint block until the first caller stores an
//! answer, reports failure, or a 20 second deadline passes. A burst of
//! identical queries — a dual-stack process resolving A and AAAA together,
//! or many threads resolving the same host — thus collapses into a single
//! upstream query.

use crate::config::QueryFlags;
use crate::error::Error;
use crate::packet;
use crate::registry::Resolver;
use std::time::Duration;
use tokio::time::{timeout_at, Instant};
use tracing::debug;

//------------ Configuration Constants ---------------------------------------

/// Number of entries (and buckets) per cache.
///
/// Sized for a system-wide cache serving dual-stack lookups from many
/// processes at once: 64 entries of headroom for a busy site, doubled for
/// the A/AAAA pairing, times five for the shared nature.
const CONFIG_MAX_ENTRIES: usize = 64 * 2 * 5;

/// Maximum time a lookup waits for somebody else's pending request.
const PENDING_REQUEST_TIMEOUT: Duration = Duration::from_secs(20);

//------------ CacheStatus ---------------------------------------------------

/// The outcome of a cache lookup.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CacheStatus {
    /// The cache found the answer; it has been copied into the buffer.
    Found,

    /// The cache does not know about this query. The caller should
    /// resolve it upstream and then store the answer with `cache_add`.
    NotFound,

    /// The cache cannot handle this kind of query, or the answer buffer
    /// is too small. The caller should resolve upstream and *not* store.
    Unsupported,

    /// Bypass the cache entirely; neither wait nor store.
    Skip,
}

//------------ Entry arena ---------------------------------------------------

/// Handle of an entry in the arena.
type EntryId = u32;

/// A cached (query, answer) pair.
///
/// The chain and MRU links conceptually belong to the surrounding tables
/// but are inlined here, one hop cheaper than a separate index.
#[derive(Debug)]
struct Entry {
    /// The query fingerprint hash.
    hash: u32,

    /// The query octets, owned.
    query: Vec<u8>,

    /// The answer octets, owned.
    answer: Vec<u8>,

    /// The absolute time the entry stops being valid.
    expires: Instant,

    /// For debug output.
    debug_id: u64,

    /// Next entry in the bucket collision chain.
    chain_next: Option<EntryId>,

    /// Neighbors on the MRU list. The head is the most recently used.
    mru_prev: Option<EntryId>,
    mru_next: Option<EntryId>,
}

/// A slot of the entry arena.
#[derive(Debug)]
enum Slot {
    /// An unused slot, member of the free list.
    Free {
        /// The next free slot.
        next: Option<EntryId>,
    },

    /// A live entry.
    Used(Entry),
}

//------------ AnswerCache ---------------------------------------------------

/// A single network's answer cache.
#[derive(Debug)]
pub(crate) struct AnswerCache {
    /// Heads of the per-bucket collision chains.
    buckets: Vec<Option<EntryId>>,

    /// The entry arena.
    slots: Vec<Slot>,

    /// Head of the free slot list.
    free: Option<EntryId>,

    /// Most recently used entry.
    mru_head: Option<EntryId>,

    /// Least recently used entry; the eviction victim.
    mru_tail: Option<EntryId>,

    /// Number of live entries.
    num_entries: usize,

    /// Debug id of the most recently created entry.
    last_id: u64,

    /// Fingerprint hashes with a query currently in flight.
    ///
    /// At most one record per hash.
    pending: Vec<u32>,
}

impl AnswerCache {
    /// Creates an empty cache.
    pub(crate) fn new() -> Self {
        AnswerCache {
            buckets: vec![None; CONFIG_MAX_ENTRIES],
            slots: Vec::new(),
            free: None,
            mru_head: None,
            mru_tail: None,
            num_entries: 0,
            last_id: 0,
            pending: Vec::new(),
        }
    }

    /// Returns the number of live entries.
    pub(crate) fn len(&self) -> usize {
        self.num_entries
    }

    fn entry(&self, id: EntryId) -> &Entry {
        match &self.slots[id as usize] {
            Slot::Used(entry) => entry,
            Slot::Free { .. } => unreachable!("free slot in live chain"),
        }
    }

    fn entry_mut(&mut self, id: EntryId) -> &mut Entry {
        match &mut self.slots[id as usize] {
            Slot::Used(entry) => entry,
            Slot::Free { .. } => unreachable!("free slot in live chain"),
        }
    }

    fn bucket_of(&self, hash: u32) -> usize {
        hash as usize % self.buckets.len()
    }

    /// Finds the live entry matching a validated query.
    fn find(&self, hash: u32, query: &[u8]) -> Option<EntryId> {
        let mut cursor = self.buckets[self.bucket_of(hash)];
        while let Some(id) = cursor {
            let entry = self.entry(id);
            if entry.hash == hash && packet::queries_equal(&entry.query, query)
            {
                return Some(id);
            }
            cursor = entry.chain_next;
        }
        None
    }

    fn expires(&self, id: EntryId) -> Instant {
        self.entry(id).expires
    }

    fn answer(&self, id: EntryId) -> &[u8] {
        &self.entry(id).answer
    }

    /// Inserts a new entry at the MRU head.
    fn insert(
        &mut self,
        hash: u32,
        query: &[u8],
        answer: &[u8],
        expires: Instant,
    ) {
        let bucket = self.bucket_of(hash);
        self.last_id += 1;
        let entry = Entry {
            hash,
            query: query.to_vec(),
            answer: answer.to_vec(),
            expires,
            debug_id: self.last_id,
            chain_next: self.buckets[bucket],
            mru_prev: None,
            mru_next: None,
        };
        let id = match self.free {
            Some(id) => {
                self.free = match self.slots[id as usize] {
                    Slot::Free { next } => next,
                    Slot::Used(_) => unreachable!("used slot on free list"),
                };
                self.slots[id as usize] = Slot::Used(entry);
                id
            }
            None => {
                self.slots.push(Slot::Used(entry));
                (self.slots.len() - 1) as EntryId
            }
        };
        self.buckets[bucket] = Some(id);
        self.mru_push_front(id);
        self.num_entries += 1;
        debug!(
            entry = self.entry(id).debug_id,
            count = self.num_entries,
            "cache entry added"
        );
    }

    /// Removes a live entry.
    fn remove(&mut self, id: EntryId) {
        self.chain_unlink(id);
        self.mru_unlink(id);
        self.slots[id as usize] = Slot::Free { next: self.free };
        self.free = Some(id);
        self.num_entries -= 1;
    }

    /// Unlinks an entry from its bucket chain.
    fn chain_unlink(&mut self, id: EntryId) {
        let bucket = self.bucket_of(self.entry(id).hash);
        let next = self.entry(id).chain_next;
        if self.buckets[bucket] == Some(id) {
            self.buckets[bucket] = next;
            return;
        }
        let mut cursor = self.buckets[bucket];
        while let Some(cur) = cursor {
            if self.entry(cur).chain_next == Some(id) {
                self.entry_mut(cur).chain_next = next;
                return;
            }
            cursor = self.entry(cur).chain_next;
        }
        unreachable!("entry not in its bucket chain");
    }

    /// Unlinks an entry from the MRU list.
    fn mru_unlink(&mut self, id: EntryId) {
        let (prev, next) = {
            let entry = self.entry(id);
            (entry.mru_prev, entry.mru_next)
        };
        match prev {
            Some(prev) => self.entry_mut(prev).mru_next = next,
            None => self.mru_head = next,
        }
        match next {
            Some(next) => self.entry_mut(next).mru_prev = prev,
            None => self.mru_tail = prev,
        }
    }

    /// Puts an entry at the head of the MRU list.
    fn mru_push_front(&mut self, id: EntryId) {
        let old_head = self.mru_head;
        {
            let entry = self.entry_mut(id);
            entry.mru_prev = None;
            entry.mru_next = old_head;
        }
        match old_head {
            Some(old) => self.entry_mut(old).mru_prev = Some(id),
            None => self.mru_tail = Some(id),
        }
        self.mru_head = Some(id);
    }

    /// Bumps an entry to the top of the MRU list.
    fn touch(&mut self, id: EntryId) {
        if self.mru_head != Some(id) {
            self.mru_unlink(id);
            self.mru_push_front(id);
        }
    }

    /// Removes all entries that have expired by `now`.
    fn remove_expired(&mut self, now: Instant) {
        let mut cursor = self.mru_head;
        while let Some(id) = cursor {
            cursor = self.entry(id).mru_next;
            if now >= self.entry(id).expires {
                self.remove(id);
            }
        }
    }

    /// Removes the least recently used entry.
    fn remove_oldest(&mut self) {
        if let Some(id) = self.mru_tail {
            debug!(
                entry = self.entry(id).debug_id,
                "cache full - removing oldest"
            );
            self.remove(id);
        }
    }

    /// Drops every entry and every pending request.
    fn flush(&mut self) {
        self.buckets.iter_mut().for_each(|b| *b = None);
        self.slots.clear();
        self.free = None;
        self.mru_head = None;
        self.mru_tail = None;
        self.num_entries = 0;
        self.last_id = 0;
        self.pending.clear();
    }

    /// Returns whether a pending request for this hash exists.
    fn has_pending(&self, hash: u32) -> bool {
        self.pending.contains(&hash)
    }

    /// Registers a pending request for this hash.
    fn add_pending(&mut self, hash: u32) {
        self.pending.push(hash);
    }

    /// Removes the pending request for this hash, if any.
    ///
    /// Returns whether one existed.
    fn remove_pending(&mut self, hash: u32) -> bool {
        match self.pending.iter().position(|&h| h == hash) {
            Some(pos) => {
                self.pending.swap_remove(pos);
                true
            }
            None => false,
        }
    }
}

//------------ Cache operations on the resolver ------------------------------

impl Resolver {
    /// Looks a query up in a network's cache.
    ///
    /// On [`CacheStatus::Found`] the answer has been copied into `ans`
    /// and its length is returned alongside. On a miss the query is
    /// registered as pending so that concurrent duplicates block instead
    /// of launching their own upstream traffic; a caller that received
    /// [`CacheStatus::NotFound`] *must* eventually call either
    /// [`cache_add`][Self::cache_add] or
    /// [`cache_query_failed`][Self::cache_query_failed] for the same
    /// query, or its duplicates will stall for the full pending-request
    /// timeout.
    pub async fn cache_lookup(
        &self,
        netid: u32,
        query: &[u8],
        ans: &mut [u8],
        flags: QueryFlags,
    ) -> (CacheStatus, usize) {
        // Skipping the lookup still permits caching the answer later,
        // unless storing is off too, in which case the cache is not
        // involved at all.
        if flags.contains(QueryFlags::NO_CACHE_LOOKUP) {
            if flags.contains(QueryFlags::NO_CACHE_STORE) {
                return (CacheStatus::Skip, 0);
            }
            return (CacheStatus::NotFound, 0);
        }

        let Some(hash) = packet::fingerprint(query) else {
            debug!("unsupported query");
            return (CacheStatus::Unsupported, 0);
        };

        let deadline = Instant::now() + PENDING_REQUEST_TIMEOUT;
        let mut waited = false;
        let mut timed_out = false;
        loop {
            // Arm the waiter before taking the lock so that a
            // notification between releasing the lock and going to sleep
            // cannot be lost.
            let notified = self.inner.pending_waiters.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            // The registry lock is confined to this block; the wait
            // below must happen without it.
            let step = {
                let mut networks = self.inner.networks.lock();
                // The network may have been destroyed while we slept, so
                // it has to be looked up again on every pass.
                let Some(net) = networks.get_mut(&netid) else {
                    let status = if waited {
                        CacheStatus::NotFound
                    } else {
                        CacheStatus::Unsupported
                    };
                    return (status, 0);
                };

                if timed_out {
                    net.wait_for_pending_req_timeout_count += 1;
                }

                self.lookup_step(
                    net, hash, query, ans, flags, waited, timed_out,
                )
            };

            match step {
                Some(result) => return result,
                None => {
                    waited = true;
                    timed_out =
                        timeout_at(deadline, notified).await.is_err();
                }
            }
        }
    }

    /// One pass of the lookup state machine, under the registry lock.
    ///
    /// Returns the final result, or `None` when the caller has to wait
    /// for a pending request first.
    #[allow(clippy::too_many_arguments)]
    fn lookup_step(
        &self,
        net: &mut crate::registry::NetworkState,
        hash: u32,
        query: &[u8],
        ans: &mut [u8],
        flags: QueryFlags,
        waited: bool,
        timed_out: bool,
    ) -> Option<(CacheStatus, usize)> {
        if waited && !timed_out && net.cache.has_pending(hash) {
            // Woken for some other query; keep waiting.
            return None;
        }

        if let Some(id) = net.cache.find(hash, query) {
            if Instant::now() >= net.cache.expires(id) {
                debug!("stale entry discarded");
                net.cache.remove(id);
                return Some((CacheStatus::NotFound, 0));
            }
            let answer = net.cache.answer(id);
            if answer.len() > ans.len() {
                debug!("answer too long for caller buffer");
                return Some((CacheStatus::Unsupported, 0));
            }
            let len = answer.len();
            ans[..len].copy_from_slice(answer);
            net.cache.touch(id);
            return Some((CacheStatus::Found, len));
        }

        if waited || timed_out {
            return Some((CacheStatus::NotFound, 0));
        }
        if flags.contains(QueryFlags::NO_CACHE_STORE) {
            return Some((CacheStatus::Skip, 0));
        }
        if !net.cache.has_pending(hash) {
            net.cache.add_pending(hash);
            return Some((CacheStatus::NotFound, 0));
        }
        debug!("waiting for previous request");
        None
    }

    /// Stores an answer for a query in a network's cache.
    ///
    /// An answer whose minimum TTL is zero is not cached, but waiters
    /// blocked on the query are still released. Returns
    /// [`Error::AlreadyCached`] without overwriting if an entry already
    /// exists, which can only happen when the lookup was bypassed with
    /// [`QueryFlags::NO_CACHE_LOOKUP`]; waiters are notified in that case
    /// too, so none of them can be left stranded.
    pub fn cache_add(
        &self,
        netid: u32,
        query: &[u8],
        answer: &[u8],
    ) -> Result<(), Error> {
        let Some(hash) = packet::fingerprint(query) else {
            debug!("invalid query passed to cache_add");
            return Err(Error::InvalidQuery);
        };

        let mut networks = self.inner.networks.lock();
        let net = networks.get_mut(&netid).ok_or(Error::UnknownNetwork)?;

        if net.cache.find(hash, query).is_some() {
            debug!("already in cache, ignoring add");
            if net.cache.remove_pending(hash) {
                self.inner.pending_waiters.notify_waiters();
            }
            return Err(Error::AlreadyCached);
        }

        let ttl = packet::answer_min_ttl(answer);
        debug!(ttl, "caching answer");
        if ttl > 0 {
            if net.cache.len() >= CONFIG_MAX_ENTRIES {
                let now = Instant::now();
                net.cache.remove_expired(now);
                if net.cache.len() >= CONFIG_MAX_ENTRIES {
                    net.cache.remove_oldest();
                }
            }
            let expires = Instant::now() + Duration::from_secs(ttl.into());
            net.cache.insert(hash, query, answer, expires);
        }

        if net.cache.remove_pending(hash) {
            self.inner.pending_waiters.notify_waiters();
        }
        Ok(())
    }

    /// Reports that resolving a query failed.
    ///
    /// Releases any waiters blocked on the query. A no-op when the caller
    /// never participated in the cache protocol for this query.
    pub fn cache_query_failed(
        &self,
        netid: u32,
        query: &[u8],
        flags: QueryFlags,
    ) {
        if flags.contains(QueryFlags::NO_CACHE_STORE)
            || flags.contains(QueryFlags::NO_CACHE_LOOKUP)
        {
            return;
        }
        let Some(hash) = packet::fingerprint(query) else {
            return;
        };
        let mut networks = self.inner.networks.lock();
        if let Some(net) = networks.get_mut(&netid) {
            if net.cache.remove_pending(hash) {
                self.inner.pending_waiters.notify_waiters();
            }
        }
    }

    /// Drops all entries and pending requests of a network's cache.
    ///
    /// Never fails; flushing an unknown network does nothing.
    pub fn flush_cache(&self, netid: u32) {
        let mut networks = self.inner.networks.lock();
        if let Some(net) = networks.get_mut(&netid) {
            net.cache.flush();
            self.inner.pending_waiters.notify_waiters();
            debug!(netid, "cache flushed");
        }
    }

    /// Returns the absolute expiry time of a cached query.
    ///
    /// For tests.
    pub fn cache_expiration(
        &self,
        netid: u32,
        query: &[u8],
    ) -> Result<Instant, Error> {
        let Some(hash) = packet::fingerprint(query) else {
            return Err(Error::InvalidQuery);
        };
        let networks = self.inner.networks.lock();
        let net = networks.get(&netid).ok_or(Error::UnknownNetwork)?;
        let id = net.cache.find(hash, query).ok_or(Error::NotCached)?;
        let expires = net.cache.expires(id);
        if Instant::now() >= expires {
            return Err(Error::NotCached);
        }
        Ok(expires)
    }
}

//============ Testing =======================================================
