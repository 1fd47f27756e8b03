//! Server reachability statistics and usable-server selection.
//!
//! Every upstream server carries a small ring of recent query outcomes.
//! The send engine records a sample on the *first* attempt of a query
//! only, so a server that fails deterministically is not retried-amplified
//! into the statistics. The selector then masks out servers whose recent
//! success ratio has dropped below the configured threshold.

use crate::config::ResolvParams;
use crate::iana::Rcode;
use tokio::time::Instant;

/// The maximum number of upstream nameservers per network.
pub const MAXNS: usize = 4;

//------------ Sample --------------------------------------------------------

/// A single query outcome against one server.
#[derive(Clone, Copy, Debug)]
pub struct Sample {
    /// When the attempt started.
    pub at: Instant,

    /// The response code of the attempt, possibly a pseudo code.
    pub rcode: Rcode,

    /// Round trip time in microseconds. 0 when the attempt failed.
    pub rtt_us: u32,
}

impl Sample {
    /// Returns whether this sample counts as a success.
    fn is_success(self) -> bool {
        self.rcode.is_success()
    }
}

//------------ ServerStats ---------------------------------------------------

/// A bounded ring of the most recent samples for one server.
#[derive(Clone, Debug, Default)]
pub struct ServerStats {
    /// The recorded samples, at most `max_samples` of them.
    samples: Vec<Sample>,

    /// The ring position the next sample will overwrite.
    sample_next: usize,
}

impl ServerStats {
    /// Appends a sample, overwriting the oldest once the ring is full.
    pub fn add_sample(&mut self, sample: Sample, max_samples: u8) {
        let max_samples = usize::from(max_samples);
        if max_samples == 0 {
            return;
        }
        self.samples.truncate(max_samples);
        if self.samples.len() < max_samples {
            self.samples.push(sample);
        } else {
            self.samples[self.sample_next] = sample;
        }
        self.sample_next = (self.sample_next + 1) % max_samples;
    }

    /// Returns the number of recorded samples.
    pub fn sample_count(&self) -> usize {
        self.samples.len()
    }

    /// Drops all samples.
    pub fn clear(&mut self) {
        self.samples.clear();
        self.sample_next = 0;
    }

    /// Counts (fresh, successful) samples newer than the validity window.
    fn fresh_counts(&self, params: &ResolvParams, now: Instant) -> (u32, u32) {
        let validity = u64::from(params.sample_validity_secs);
        let mut fresh = 0;
        let mut successes = 0;
        for sample in &self.samples {
            if now.duration_since(sample.at).as_secs() > validity {
                continue;
            }
            fresh += 1;
            if sample.is_success() {
                successes += 1;
            }
        }
        (fresh, successes)
    }

    /// Returns whether this server passes the usability test on its own.
    ///
    /// A server with fewer than `min_samples` fresh samples is on
    /// probation and always considered usable; otherwise its integer
    /// success percentage must reach the threshold.
    fn is_usable(&self, params: &ResolvParams, now: Instant) -> bool {
        let (fresh, successes) = self.fresh_counts(params, now);
        if fresh == 0 || fresh < u32::from(params.min_samples) {
            return true;
        }
        successes * 100 / fresh >= u32::from(params.success_threshold)
    }
}

//------------ Selection -----------------------------------------------------

/// Computes the usable-server mask for a network's server list.
///
/// Returns the mask and the number of usable servers. If every server
/// flunks the statistics test the whole pool is considered usable again:
/// consistently failing everywhere usually means the path, not the
/// servers, is broken, and skipping all of them would guarantee failure.
pub fn usable_servers(
    params: &ResolvParams,
    stats: &[ServerStats],
    now: Instant,
) -> ([bool; MAXNS], usize) {
    let mut usable = [false; MAXNS];
    let mut usable_count = 0;
    for (ns, server_stats) in stats.iter().take(MAXNS).enumerate() {
        if server_stats.is_usable(params, now) {
            usable[ns] = true;
            usable_count += 1;
        }
    }
    if usable_count == 0 {
        let count = stats.len().min(MAXNS);
        usable[..count].fill(true);
        return (usable, count);
    }
    (usable, usable_count)
}

//============ Testing =======================================================
