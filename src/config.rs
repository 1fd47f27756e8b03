//! Resolver parameters and external configuration.

use std::collections::HashMap;
use std::ops::BitOr;
use std::sync::Arc;
use tracing::warn;

//------------ Configuration Constants ---------------------------------------

/// Default number of query attempts per server.
const DEF_RETRY_COUNT: u32 = 2;

/// Default base retransmission timeout in milliseconds.
const DEF_BASE_TIMEOUT_MSEC: u32 = 5000;

/// How long a reachability sample stays relevant, in seconds.
const DEF_SAMPLE_VALIDITY_SECS: u32 = 1800;

/// A server whose success percentage drops below this is considered
/// failing.
const DEF_SUCCESS_THRESHOLD: u8 = 75;

/// Servers with fewer fresh samples than this are always tried.
const DEF_MIN_SAMPLES: u8 = 8;

/// Default capacity of the per-server sample ring.
const DEF_MAX_SAMPLES: u8 = 64;

/// The default event subsampling map.
///
/// Format: space-separated `ReturnCode:rate_denom` pairs; the pseudo code
/// `default` applies to return codes without their own entry.
const DEFAULT_SUBSAMPLING_MAP: &str = "default:1 0:100 7:10";

/// The map key standing in for "any other return code".
pub(crate) const SUBSAMPLING_DEFAULT_KEY: i32 = -1;

//------------ ResolvParams --------------------------------------------------

/// Tunable parameters of a network's resolver behavior.
///
/// A zero `retry_count` or `base_timeout_msec` means "use the platform
/// default", which in turn can be overridden through the [`ConfigOracle`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ResolvParams {
    /// Samples older than this many seconds are ignored by the selector.
    pub sample_validity_secs: u32,

    /// Minimum success percentage for a server to stay usable.
    pub success_threshold: u8,

    /// Below this many fresh samples a server is on probation and always
    /// tried.
    pub min_samples: u8,

    /// Capacity of the per-server sample ring.
    pub max_samples: u8,

    /// Base retransmission timeout in milliseconds. 0 selects the default.
    pub base_timeout_msec: u32,

    /// Number of attempts per usable server. 0 selects the default.
    pub retry_count: u32,
}

impl Default for ResolvParams {
    fn default() -> Self {
        Self {
            sample_validity_secs: DEF_SAMPLE_VALIDITY_SECS,
            success_threshold: DEF_SUCCESS_THRESHOLD,
            min_samples: DEF_MIN_SAMPLES,
            max_samples: DEF_MAX_SAMPLES,
            base_timeout_msec: DEF_BASE_TIMEOUT_MSEC,
            retry_count: DEF_RETRY_COUNT,
        }
    }
}

//------------ QueryFlags ----------------------------------------------------

/// Per-query behavior flags accepted by the lookup and send paths.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct QueryFlags(u32);

impl QueryFlags {
    /// At most one attempt; pick a single server by query id.
    pub const NO_RETRY: QueryFlags = QueryFlags(1 << 0);

    /// Skip insertion of the eventual answer into the cache.
    pub const NO_CACHE_STORE: QueryFlags = QueryFlags(1 << 1);

    /// Skip reading from the cache; still permits insertion.
    pub const NO_CACHE_LOOKUP: QueryFlags = QueryFlags(1 << 2);

    /// Bypass private DNS entirely; cleartext to the configured servers.
    pub const USE_LOCAL_NAMESERVERS: QueryFlags = QueryFlags(1 << 3);

    /// No flags set.
    pub const fn empty() -> Self {
        QueryFlags(0)
    }

    /// Returns whether all flags in `other` are set in `self`.
    pub const fn contains(self, other: QueryFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for QueryFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        QueryFlags(self.0 | rhs.0)
    }
}

//------------ ConfigOracle --------------------------------------------------

/// Read access to named configuration flags maintained outside the
/// resolver.
///
/// The resolver consults the oracle for experiment overrides whenever a
/// caller passes a zero (i.e. "default") parameter, and for the event
/// subsampling map. An oracle returning `None` for everything yields the
/// built-in platform defaults.
pub trait ConfigOracle: Send + Sync {
    /// Returns the value of the named flag, if set.
    fn flag(&self, name: &str) -> Option<String>;
}

/// The default oracle: no flags are ever set.
#[derive(Clone, Copy, Debug, Default)]
pub struct NullOracle;

impl ConfigOracle for NullOracle {
    fn flag(&self, _name: &str) -> Option<String> {
        None
    }
}

/// Replaces zero-valued parameters with their (possibly overridden)
/// defaults.
pub(crate) fn apply_experiment_params(
    params: &mut ResolvParams,
    oracle: &Arc<dyn ConfigOracle>,
) {
    if params.retry_count == 0 {
        params.retry_count = DEF_RETRY_COUNT;
        if let Some(value) = oracle.flag("retry_count") {
            if let Ok(value) = value.parse() {
                params.retry_count = value;
            }
        }
    }
    if params.base_timeout_msec == 0 {
        params.base_timeout_msec = DEF_BASE_TIMEOUT_MSEC;
        if let Some(value) = oracle.flag("retransmission_time_interval") {
            if let Ok(value) = value.parse() {
                params.base_timeout_msec = value;
            }
        }
    }
}

/// Builds the event subsampling map for a new network.
///
/// Malformed pairs are skipped; an empty map means nothing gets sampled.
pub(crate) fn subsampling_map(
    oracle: &Arc<dyn ConfigOracle>,
) -> HashMap<i32, u32> {
    let raw = oracle
        .flag("dns_event_subsample_map")
        .unwrap_or_else(|| DEFAULT_SUBSAMPLING_MAP.into());
    let mut map = HashMap::new();
    for pair in raw.split_ascii_whitespace() {
        let Some((code, denom)) = pair.split_once(':') else {
            warn!("invalid subsampling pair {:?}", pair);
            continue;
        };
        let code = if code == "default" {
            SUBSAMPLING_DEFAULT_KEY
        } else {
            match code.parse() {
                Ok(code) => code,
                Err(_) => {
                    warn!("invalid subsampling pair {:?}", pair);
                    continue;
                }
            }
        };
        let denom = match denom.parse() {
            Ok(denom) => denom,
            Err(_) => {
                warn!("invalid subsampling pair {:?}", pair);
                continue;
            }
        };
        map.insert(code, denom);
    }
    map
}

//============ Testing =======================================================

#[cfg(test)]
mod test {
    use super::*;

    struct MapOracle(HashMap<&'static str, &'static str>);

    impl ConfigOracle for MapOracle {
        fn flag(&self, name: &str) -> Option<String> {
            self.0.get(name).map(|v| v.to_string())
        }
    }

    #[test]
    fn zero_params_take_defaults() {
        let oracle: Arc<dyn ConfigOracle> = Arc::new(NullOracle);
        let mut params = ResolvParams {
            retry_count: 0,
            base_timeout_msec: 0,
            ..Default::default()
        };
        apply_experiment_params(&mut params, &oracle);
        assert_eq!(params.retry_count, 2);
        assert_eq!(params.base_timeout_msec, 5000);
    }

    #[test]
    fn oracle_overrides_only_zero_params() {
        let oracle: Arc<dyn ConfigOracle> = Arc::new(MapOracle(
            [("retry_count", "5"), ("retransmission_time_interval", "750")]
                .into_iter()
                .collect(),
        ));
        let mut params = ResolvParams {
            retry_count: 0,
            base_timeout_msec: 3000,
            ..Default::default()
        };
        apply_experiment_params(&mut params, &oracle);
        assert_eq!(params.retry_count, 5);
        assert_eq!(params.base_timeout_msec, 3000);
    }

    #[test]
    fn subsampling_map_defaults_and_garbage() {
        let oracle: Arc<dyn ConfigOracle> = Arc::new(NullOracle);
        let map = subsampling_map(&oracle);
        assert_eq!(map.get(&SUBSAMPLING_DEFAULT_KEY), Some(&1));
        assert_eq!(map.get(&0), Some(&100));
        assert_eq!(map.get(&7), Some(&10));

        let oracle: Arc<dyn ConfigOracle> = Arc::new(MapOracle(
            [("dns_event_subsample_map", "default:2 junk 3:x 9:4")]
                .into_iter()
                .collect(),
        ));
        let map = subsampling_map(&oracle);
        assert_eq!(map.len(), 2);
        assert_eq!(map.get(&SUBSAMPLING_DEFAULT_KEY), Some(&2));
        assert_eq!(map.get(&9), Some(&4));
    }

    #[test]
    fn flag_algebra() {
        let flags = QueryFlags::NO_CACHE_STORE | QueryFlags::NO_RETRY;
        assert!(flags.contains(QueryFlags::NO_CACHE_STORE));
        assert!(flags.contains(QueryFlags::NO_RETRY));
        assert!(!flags.contains(QueryFlags::NO_CACHE_LOOKUP));
        assert!(QueryFlags::empty().contains(QueryFlags::empty()));
    }
}
