//! Private DNS (DNS-over-TLS) configuration and validation tracking.
//!
//! Each network is in one of three modes: OFF (cleartext only),
//! OPPORTUNISTIC (use DoT servers that happen to validate, fall back to
//! cleartext otherwise) or STRICT (a hostname was configured; never fall
//! back). Candidate servers are validated in the background: a validation
//! task performs the TLS handshake and probe query off the request path
//! and records the outcome, retrying with exponential backoff while the
//! network is in strict mode.
//!
//! The tracker state has its own lock, separate from the registry lock;
//! configuration writers never wait on anything longer than lock
//! acquisition, and validation sleeps happen entirely outside the lock.

use crate::error::Error;
use crate::registry::Resolver;
use crate::tls::TlsValidator;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::sleep;
use tracing::{debug, warn};

//------------ Configuration Constants ---------------------------------------

/// The port DoT servers are contacted on.
const DOT_PORT: u16 = 853;

/// Connect timeout used when the caller does not supply one.
const DEF_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Lower bound for caller-supplied connect timeouts.
const MIN_CONNECT_TIMEOUT: Duration = Duration::from_secs(1);

/// First validation retry delay in strict mode.
const BACKOFF_INITIAL: Duration = Duration::from_secs(60);

/// Cap for the doubling retry delay.
const BACKOFF_MAX: Duration = Duration::from_secs(3600);

/// Total time a single server's validation may spend sleeping between
/// retries before it gives up for good.
const BACKOFF_BUDGET: Duration = Duration::from_secs(24 * 3600);

/// How many validations may run concurrently.
const MAX_CONCURRENT_VALIDATIONS: usize = 8;

//------------ PrivateDnsMode ------------------------------------------------

/// The private DNS mode of a network.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum PrivateDnsMode {
    /// Cleartext only.
    #[default]
    Off,

    /// Use validated DoT servers, fall back to cleartext without any.
    Opportunistic,

    /// A private DNS hostname is configured; never fall back.
    Strict,
}

//------------ Validation ----------------------------------------------------

/// The validation state of a tracked server.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Validation {
    /// A validation task is running for this server.
    InProcess,

    /// The server passed validation and may carry queries.
    Success,

    /// The server failed validation and is not used.
    Fail,
}

//------------ DotServer -----------------------------------------------------

/// A candidate private DNS server.
#[derive(Clone, Debug, Eq)]
pub struct DotServer {
    /// The server address, on the DoT port.
    pub addr: SocketAddr,

    /// The name to present for SNI and certificate validation. Empty for
    /// opportunistic servers.
    pub hostname: String,

    /// An optional pinned CA certificate in PEM form.
    pub ca_pem: Option<String>,

    /// How long to wait for the TCP+TLS connection to come up.
    pub connect_timeout: Duration,
}

impl DotServer {
    /// Returns the identity of the server.
    ///
    /// The connect timeout is a tuning knob, not part of the identity.
    fn identity(&self) -> (&SocketAddr, &str, &Option<String>) {
        (&self.addr, &self.hostname, &self.ca_pem)
    }
}

impl PartialEq for DotServer {
    fn eq(&self, other: &Self) -> bool {
        self.identity() == other.identity()
    }
}

impl Ord for DotServer {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.identity().cmp(&other.identity())
    }
}

impl PartialOrd for DotServer {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

//------------ PrivateDnsStatus ----------------------------------------------

/// A snapshot of a network's private DNS state.
#[derive(Clone, Debug, Default)]
pub struct PrivateDnsStatus {
    /// The network's mode.
    pub mode: PrivateDnsMode,

    /// All tracked servers and their validation state.
    pub servers: Vec<(DotServer, Validation)>,
}

impl PrivateDnsStatus {
    /// Returns the servers that are currently validated.
    pub fn validated_servers(&self) -> Vec<DotServer> {
        self.servers
            .iter()
            .filter(|(_, validation)| *validation == Validation::Success)
            .map(|(server, _)| server.clone())
            .collect()
    }
}

//------------ ValidationListener --------------------------------------------

/// An observer of validation outcomes.
///
/// Called after every validation attempt, successful or not, outside of
/// any tracker lock.
pub trait ValidationListener: Send + Sync {
    /// Reports a validation outcome for a server on a network.
    fn on_validation_event(
        &self,
        netid: u32,
        server: SocketAddr,
        hostname: &str,
        success: bool,
    );
}

//------------ PrivateDnsConfig ----------------------------------------------

/// Mutable tracker state, behind the tracker lock.
#[derive(Default)]
struct PdnsState {
    /// Per-network mode.
    modes: HashMap<u32, PrivateDnsMode>,

    /// Per-network server validation states.
    trackers: HashMap<u32, BTreeMap<DotServer, Validation>>,
}

/// The private DNS tracker.
pub(crate) struct PrivateDnsConfig {
    /// Modes and trackers.
    state: Mutex<PdnsState>,

    /// The validation probe.
    validator: Arc<dyn TlsValidator>,

    /// Validation event observers.
    listeners: Mutex<Vec<Arc<dyn ValidationListener>>>,

    /// Outstanding validation tasks, joined on shutdown.
    tasks: Mutex<JoinSet<()>>,

    /// Bounds the number of concurrently running validations.
    validation_slots: Arc<Semaphore>,

    /// Back-reference handed to validation tasks.
    weak_self: std::sync::Weak<PrivateDnsConfig>,
}

impl PrivateDnsConfig {
    /// Creates an empty tracker using the given validation probe.
    pub(crate) fn new(validator: Arc<dyn TlsValidator>) -> Arc<Self> {
        Arc::new_cyclic(|weak_self| PrivateDnsConfig {
            state: Mutex::new(PdnsState::default()),
            validator,
            listeners: Mutex::new(Vec::new()),
            tasks: Mutex::new(JoinSet::new()),
            validation_slots: Arc::new(Semaphore::new(
                MAX_CONCURRENT_VALIDATIONS,
            )),
            weak_self: weak_self.clone(),
        })
    }

    /// Registers a validation event observer.
    pub(crate) fn register_listener(
        &self,
        listener: Arc<dyn ValidationListener>,
    ) {
        self.listeners.lock().push(listener);
    }

    /// Applies a new private DNS configuration for a network.
    ///
    /// The mode follows from the arguments: a non-empty `sni_name` means
    /// STRICT, otherwise a non-empty server list means OPPORTUNISTIC,
    /// otherwise OFF. Tracked servers that are not in the new set are
    /// dropped; servers that are new or have failed validation are
    /// (re)validated in the background.
    pub(crate) fn set(
        &self,
        netid: u32,
        servers: &[String],
        sni_name: &str,
        ca_pem: &str,
        connect_timeout_ms: i32,
    ) -> Result<(), Error> {
        debug!(
            netid,
            servers = servers.len(),
            sni_name,
            connect_timeout_ms,
            "private DNS set"
        );

        // connect_timeout_ms <= 0 selects the default; positive values
        // are used as given but never below one second.
        let connect_timeout = if connect_timeout_ms <= 0 {
            DEF_CONNECT_TIMEOUT
        } else {
            MIN_CONNECT_TIMEOUT
                .max(Duration::from_millis(connect_timeout_ms as u64))
        };

        let mut tls_servers = BTreeSet::new();
        for server in servers {
            // A bare address gets the DoT port; an explicit `addr:port`
            // form is used as given.
            let addr = match server.parse::<SocketAddr>() {
                Ok(addr) => addr,
                Err(_) => {
                    let addr: IpAddr =
                        server.parse().map_err(|_| Error::InvalidServer)?;
                    SocketAddr::new(addr, DOT_PORT)
                }
            };
            tls_servers.insert(DotServer {
                addr,
                hostname: sni_name.to_string(),
                ca_pem: (!ca_pem.is_empty()).then(|| ca_pem.to_string()),
                connect_timeout,
            });
        }

        let mut state = self.state.lock();
        if !sni_name.is_empty() {
            state.modes.insert(netid, PrivateDnsMode::Strict);
        } else if !tls_servers.is_empty() {
            state.modes.insert(netid, PrivateDnsMode::Opportunistic);
        } else {
            state.modes.insert(netid, PrivateDnsMode::Off);
            state.trackers.remove(&netid);
            return Ok(());
        }

        let tracker = state.trackers.entry(netid).or_default();

        // Drop tracker entries absent from the new set. Equality is
        // exact, including hostname and certificate.
        tracker.retain(|server, _| tls_servers.contains(server));

        // Validate servers that are new or have landed in Fail. Servers
        // still in process keep their running task.
        for server in tls_servers {
            let needs_validation = !matches!(
                tracker.get(&server),
                Some(Validation::InProcess) | Some(Validation::Success)
            );
            if needs_validation {
                tracker.insert(server.clone(), Validation::InProcess);
                debug!(
                    netid,
                    server = %server.addr,
                    "server marked in_process"
                );
                self.spawn_validation(server, netid);
            }
        }
        Ok(())
    }

    /// Returns a network's mode and tracked servers.
    pub(crate) fn status(&self, netid: u32) -> PrivateDnsStatus {
        let state = self.state.lock();
        let Some(&mode) = state.modes.get(&netid) else {
            return PrivateDnsStatus::default();
        };
        let servers = state
            .trackers
            .get(&netid)
            .map(|tracker| {
                tracker
                    .iter()
                    .map(|(server, &validation)| (server.clone(), validation))
                    .collect()
            })
            .unwrap_or_default();
        PrivateDnsStatus { mode, servers }
    }

    /// Forgets everything about a network.
    pub(crate) fn clear(&self, netid: u32) {
        debug!(netid, "private DNS cleared");
        let mut state = self.state.lock();
        state.modes.remove(&netid);
        state.trackers.remove(&netid);
    }

    /// Aborts and joins all outstanding validation tasks.
    pub(crate) async fn shutdown(&self) {
        let mut tasks = { std::mem::take(&mut *self.tasks.lock()) };
        tasks.abort_all();
        while tasks.join_next().await.is_some() {}
    }

    /// Launches the background validation of one server.
    fn spawn_validation(&self, server: DotServer, netid: u32) {
        let Some(this) = self.weak_self.upgrade() else {
            return;
        };
        self.tasks.lock().spawn(async move {
            let Ok(_permit) =
                this.validation_slots.clone().acquire_owned().await
            else {
                return;
            };
            let mut backoff = BackoffSequence::new();
            loop {
                // The probe is a blocking network operation that can take
                // anywhere from milliseconds to the full connect timeout.
                warn!(netid, server = %server.addr, "validating DoT server");
                let success = this.validator.validate(&server, netid).await;
                debug!(
                    netid,
                    server = %server.addr,
                    success,
                    "validation attempt finished"
                );
                if !this.record_validation(&server, netid, success) {
                    break;
                }
                match backoff.next_timeout() {
                    Some(delay) => sleep(delay).await,
                    None => break,
                }
            }
        });
    }

    /// Records a validation outcome.
    ///
    /// Returns whether the server needs to be reevaluated, i.e. whether
    /// the validation task should sleep and try again. The tracker may
    /// have changed while the probe was running: a server that was
    /// removed or reconfigured in the interim is treated as a failure and
    /// its entry, if any, is left untouched — the validation started by
    /// the reconfiguration owns it now.
    fn record_validation(
        &self,
        server: &DotServer,
        netid: u32,
        mut success: bool,
    ) -> bool {
        let mut reevaluate;
        {
            let mut state = self.state.lock();
            let state = &mut *state;

            let Some(&mode) = state.modes.get(&netid) else {
                warn!(netid, "network has no private DNS mode");
                return false;
            };
            let Some(tracker) = state.trackers.get_mut(&netid) else {
                warn!(netid, "network was erased during validation");
                return false;
            };

            // Only strict mode keeps retrying failed servers.
            reevaluate = !success && mode == PrivateDnsMode::Strict;

            let mut overwrite = true;
            match tracker.keys().find(|s| s.addr == server.addr) {
                None => {
                    warn!(
                        netid,
                        server = %server.addr,
                        "server was removed during validation"
                    );
                    success = false;
                    reevaluate = false;
                    overwrite = false;
                }
                Some(current) if current != server => {
                    warn!(
                        netid,
                        server = %server.addr,
                        "server was changed during validation"
                    );
                    success = false;
                    reevaluate = false;
                    overwrite = false;
                }
                Some(_) => {}
            }

            if overwrite {
                let validation = if success {
                    Validation::Success
                } else if reevaluate {
                    Validation::InProcess
                } else {
                    Validation::Fail
                };
                tracker.insert(server.clone(), validation);
            }
        }

        // Broadcast outside the lock; listeners may call back in.
        let listeners = self.listeners.lock().clone();
        for listener in &listeners {
            listener.on_validation_event(
                netid,
                server.addr,
                &server.hostname,
                success,
            );
        }
        debug!(netid, server = %server.addr, success, "validation recorded");

        reevaluate
    }
}

//------------ BackoffSequence -----------------------------------------------

/// The retry delay schedule for strict mode revalidation.
///
/// Starts at one minute and doubles up to an hourly cadence, spending at
/// most [`BACKOFF_BUDGET`] asleep in total. A full validation pass is a
/// few kilobytes of certificates and handshake, so even the hourly
/// cadence costs next to nothing.
struct BackoffSequence {
    /// The next delay to hand out.
    next: Duration,

    /// Sleep time still left.
    budget: Duration,
}

impl BackoffSequence {
    fn new() -> Self {
        BackoffSequence {
            next: BACKOFF_INITIAL,
            budget: BACKOFF_BUDGET,
        }
    }

    /// Returns the next delay, or `None` once the budget is exhausted.
    fn next_timeout(&mut self) -> Option<Duration> {
        if self.budget.is_zero() {
            return None;
        }
        let delay = self.next.min(self.budget);
        self.budget -= delay;
        self.next = (self.next * 2).min(BACKOFF_MAX);
        Some(delay)
    }
}

//------------ Private DNS operations on the resolver ------------------------

impl Resolver {
    /// Configures private DNS for a network.
    ///
    /// See [`PrivateDnsMode`] for how the mode is derived from the
    /// arguments. Returns [`Error::InvalidServer`] if any server is not a
    /// numeric address; the configuration is unchanged in that case.
    pub fn set_private_dns(
        &self,
        netid: u32,
        servers: &[String],
        sni_name: &str,
        ca_pem: &str,
        connect_timeout_ms: i32,
    ) -> Result<(), Error> {
        self.inner
            .pdns
            .set(netid, servers, sni_name, ca_pem, connect_timeout_ms)
    }

    /// Returns the private DNS status of a network.
    pub fn private_dns_status(&self, netid: u32) -> PrivateDnsStatus {
        self.inner.pdns.status(netid)
    }

    /// Drops the private DNS configuration of a network.
    pub fn clear_private_dns(&self, netid: u32) {
        self.inner.pdns.clear(netid)
    }

    /// Joins all outstanding validation tasks.
    ///
    /// Call this before dropping the last resolver clone if deterministic
    /// teardown matters; abandoned tasks are otherwise aborted by the
    /// runtime at its own pace.
    pub async fn shutdown(&self) {
        self.inner.pdns.shutdown().await
    }
}

//============ Testing =======================================================

#[cfg(test)]
mod test {
    use super::*;
    use std::future::Future;
    use std::pin::Pin;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Notify;

    fn server_list(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    /// A validator with a scripted outcome sequence.
    struct ScriptedValidator {
        /// Outcomes to hand out; the last one repeats.
        script: Vec<bool>,
        calls: AtomicUsize,
        /// When set, each call waits here before returning.
        gate: Option<Arc<Notify>>,
    }

    impl ScriptedValidator {
        fn new(script: &[bool]) -> Arc<Self> {
            Arc::new(ScriptedValidator {
                script: script.to_vec(),
                calls: AtomicUsize::new(0),
                gate: None,
            })
        }

        fn gated(script: &[bool], gate: Arc<Notify>) -> Arc<Self> {
            Arc::new(ScriptedValidator {
                script: script.to_vec(),
                calls: AtomicUsize::new(0),
                gate: Some(gate),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl TlsValidator for ScriptedValidator {
        fn validate<'a>(
            &'a self,
            _server: &'a DotServer,
            _netid: u32,
        ) -> Pin<Box<dyn Future<Output = bool> + Send + 'a>> {
            Box::pin(async move {
                if let Some(gate) = &self.gate {
                    gate.notified().await;
                }
                let call = self.calls.fetch_add(1, Ordering::SeqCst);
                *self
                    .script
                    .get(call)
                    .or(self.script.last())
                    .unwrap_or(&false)
            })
        }
    }

    fn tracker_with(validator: Arc<dyn TlsValidator>) -> Arc<PrivateDnsConfig> {
        PrivateDnsConfig::new(validator)
    }

    async fn wait_for<F: Fn() -> bool>(cond: F) {
        // Under a paused clock each sleep advances time to the next
        // pending timer, so this also plays out the backoff schedule.
        for _ in 0..1000 {
            if cond() {
                return;
            }
            sleep(Duration::from_secs(1)).await;
        }
        panic!("condition never became true");
    }

    #[tokio::test(start_paused = true)]
    async fn mode_follows_configuration() {
        let pdns = tracker_with(ScriptedValidator::new(&[true]));

        pdns.set(30, &server_list(&["1.1.1.1"]), "", "", 0).unwrap();
        assert_eq!(pdns.status(30).mode, PrivateDnsMode::Opportunistic);

        pdns.set(30, &server_list(&["1.1.1.1"]), "dot.example", "", 0)
            .unwrap();
        assert_eq!(pdns.status(30).mode, PrivateDnsMode::Strict);

        pdns.set(30, &[], "", "", 0).unwrap();
        let status = pdns.status(30);
        assert_eq!(status.mode, PrivateDnsMode::Off);
        assert!(status.servers.is_empty());

        pdns.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn bad_server_address_is_rejected() {
        let pdns = tracker_with(ScriptedValidator::new(&[true]));
        assert!(matches!(
            pdns.set(30, &server_list(&["dot.example"]), "", "", 0),
            Err(Error::InvalidServer)
        ));
        assert_eq!(pdns.status(30).mode, PrivateDnsMode::Off);
    }

    #[tokio::test(start_paused = true)]
    async fn connect_timeout_is_clamped() {
        let pdns = tracker_with(ScriptedValidator::new(&[true]));

        pdns.set(30, &server_list(&["1.1.1.1"]), "", "", 250).unwrap();
        let status = pdns.status(30);
        assert_eq!(
            status.servers[0].0.connect_timeout,
            Duration::from_secs(1)
        );

        pdns.set(31, &server_list(&["1.1.1.1"]), "", "", 0).unwrap();
        assert_eq!(
            pdns.status(31).servers[0].0.connect_timeout,
            DEF_CONNECT_TIMEOUT
        );

        pdns.set(32, &server_list(&["1.1.1.1"]), "", "", 5000).unwrap();
        assert_eq!(
            pdns.status(32).servers[0].0.connect_timeout,
            Duration::from_secs(5)
        );

        pdns.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn successful_validation_is_recorded() {
        let validator = ScriptedValidator::new(&[true]);
        let pdns = tracker_with(validator.clone());

        pdns.set(30, &server_list(&["1.1.1.1"]), "", "", 0).unwrap();
        wait_for(|| !pdns.status(30).validated_servers().is_empty()).await;
        assert_eq!(validator.calls(), 1);

        // A second set with the same server does not revalidate.
        pdns.set(30, &server_list(&["1.1.1.1"]), "", "", 0).unwrap();
        sleep(Duration::from_millis(100)).await;
        assert_eq!(validator.calls(), 1);

        pdns.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn opportunistic_failure_is_terminal() {
        let validator = ScriptedValidator::new(&[false]);
        let pdns = tracker_with(validator.clone());

        pdns.set(30, &server_list(&["1.1.1.1"]), "", "", 0).unwrap();
        wait_for(|| {
            pdns.status(30)
                .servers
                .first()
                .map_or(false, |(_, v)| *v == Validation::Fail)
        })
        .await;
        // No reevaluation in opportunistic mode.
        sleep(Duration::from_secs(7200)).await;
        assert_eq!(validator.calls(), 1);

        pdns.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn strict_failure_retries_with_backoff() {
        let validator = ScriptedValidator::new(&[false, false, true]);
        let pdns = tracker_with(validator.clone());

        pdns.set(30, &server_list(&["1.1.1.1"]), "dot.example", "", 0)
            .unwrap();
        wait_for(|| !pdns.status(30).validated_servers().is_empty()).await;
        assert_eq!(validator.calls(), 3);

        pdns.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn removed_server_is_not_reinserted() {
        // Hold the validation at its gate so its outcome arrives after
        // the server set has been reconfigured to OFF.
        let gate = Arc::new(Notify::new());
        let validator = ScriptedValidator::gated(&[true], gate.clone());
        let pdns = tracker_with(validator);

        pdns.set(30, &server_list(&["1.1.1.1"]), "", "", 0).unwrap();
        let server = pdns.status(30).servers[0].0.clone();
        pdns.set(30, &[], "", "", 0).unwrap();

        // The late outcome must neither resurrect the tracker nor ask
        // for reevaluation.
        assert!(!pdns.record_validation(&server, 30, true));
        let status = pdns.status(30);
        assert_eq!(status.mode, PrivateDnsMode::Off);
        assert!(status.servers.is_empty());

        gate.notify_waiters();
        pdns.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn changed_server_is_not_overwritten() {
        let gate = Arc::new(Notify::new());
        let validator = ScriptedValidator::gated(&[true, true], gate.clone());
        let pdns = tracker_with(validator);

        pdns.set(30, &server_list(&["1.1.1.1"]), "old.example", "", 0)
            .unwrap();
        let old = pdns.status(30).servers[0].0.clone();
        // Same address, new hostname: the old entry is replaced and a
        // new validation starts.
        pdns.set(30, &server_list(&["1.1.1.1"]), "new.example", "", 0)
            .unwrap();

        // The old probe's late success must not touch the new entry.
        assert!(!pdns.record_validation(&old, 30, true));
        let status = pdns.status(30);
        assert_eq!(status.servers.len(), 1);
        assert_eq!(status.servers[0].0.hostname, "new.example");
        assert_eq!(status.servers[0].1, Validation::InProcess);

        gate.notify_waiters();
        pdns.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn listeners_hear_outcomes() {
        struct Recorder(Mutex<Vec<(u32, bool)>>);
        impl ValidationListener for Recorder {
            fn on_validation_event(
                &self,
                netid: u32,
                _server: SocketAddr,
                _hostname: &str,
                success: bool,
            ) {
                self.0.lock().push((netid, success));
            }
        }

        let pdns = tracker_with(ScriptedValidator::new(&[true]));
        let recorder = Arc::new(Recorder(Mutex::new(Vec::new())));
        pdns.register_listener(recorder.clone());

        pdns.set(30, &server_list(&["1.1.1.1"]), "", "", 0).unwrap();
        wait_for(|| !recorder.0.lock().is_empty()).await;
        assert_eq!(recorder.0.lock()[0], (30, true));

        pdns.shutdown().await;
    }

    #[test]
    fn backoff_schedule() {
        let mut backoff = BackoffSequence::new();
        assert_eq!(backoff.next_timeout(), Some(Duration::from_secs(60)));
        assert_eq!(backoff.next_timeout(), Some(Duration::from_secs(120)));
        assert_eq!(backoff.next_timeout(), Some(Duration::from_secs(240)));
        let mut last = Duration::ZERO;
        let mut total = Duration::from_secs(60 + 120 + 240);
        while let Some(delay) = backoff.next_timeout() {
            assert!(delay <= Duration::from_secs(3600));
            last = delay;
            total += delay;
        }
        assert!(last <= Duration::from_secs(3600));
        assert_eq!(total, BACKOFF_BUDGET);
    }

    #[test]
    fn dot_server_ordering_ignores_timeout() {
        let a = DotServer {
            addr: "1.1.1.1:853".parse().unwrap(),
            hostname: "a.example".into(),
            ca_pem: None,
            connect_timeout: Duration::from_secs(1),
        };
        let mut b = a.clone();
        b.connect_timeout = Duration::from_secs(30);
        assert_eq!(a, b);

        let mut c = a.clone();
        c.hostname = "b.example".into();
        assert!(a < c);
    }
}
