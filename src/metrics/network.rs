//! Network throughput from successive absolute interface counters.

use super::source::{InterfaceCounters, InterfaceRates};
use std::collections::{BTreeMap, HashMap};
use std::time::Instant;

/// Last counters seen for one interface.
#[derive(Debug, Clone)]
pub struct InterfaceCounterSample {
    pub interface_name: String,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    /// When the counters were read
    pub timestamp: Instant,
}

/// Keeps the previous counter sample per interface so each cycle can be
/// turned into a rate. Owned by the aggregator; single writer.
#[derive(Debug, Default)]
pub struct NetworkRateTracker {
    prev_samples: HashMap<String, InterfaceCounterSample>,
}

impl NetworkRateTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rates since each interface's previous sample, timed with the
    /// monotonic clock.
    pub fn observe_now(&mut self, current: &[InterfaceCounters]) -> BTreeMap<String, InterfaceRates> {
        let now = Instant::now();
        self.record(current, now, |prev| {
            now.saturating_duration_since(prev.timestamp).as_secs_f64()
        })
    }

    /// Rates for every interface present in both the previous and current
    /// sample. First sightings are stored but produce no entry, and a
    /// non-positive `elapsed_secs` yields no entries at all.
    pub fn observe(
        &mut self,
        current: &[InterfaceCounters],
        elapsed_secs: f64,
    ) -> BTreeMap<String, InterfaceRates> {
        self.record(current, Instant::now(), |_| elapsed_secs)
    }

    /// Every interface's sample is overwritten, whether or not a rate
    /// came out of it.
    fn record<F>(
        &mut self,
        current: &[InterfaceCounters],
        now: Instant,
        elapsed_since: F,
    ) -> BTreeMap<String, InterfaceRates>
    where
        F: Fn(&InterfaceCounterSample) -> f64,
    {
        let mut rates = BTreeMap::new();

        for counters in current {
            if let Some(prev) = self.prev_samples.get(&counters.name) {
                if let Some(rate) = rate_between(prev, counters, elapsed_since(prev)) {
                    rates.insert(counters.name.clone(), rate);
                }
            }

            self.prev_samples.insert(
                counters.name.clone(),
                InterfaceCounterSample {
                    interface_name: counters.name.clone(),
                    bytes_sent: counters.bytes_sent,
                    bytes_received: counters.bytes_received,
                    timestamp: now,
                },
            );
        }

        rates
    }
}

/// `None` when no time has passed or a counter went backwards (interface
/// reset or wrap); the next cycle measures from the new baseline.
fn rate_between(
    prev: &InterfaceCounterSample,
    current: &InterfaceCounters,
    elapsed_secs: f64,
) -> Option<InterfaceRates> {
    if elapsed_secs <= 0.0 || !elapsed_secs.is_finite() {
        return None;
    }
    let deltas = current
        .bytes_sent
        .checked_sub(prev.bytes_sent)
        .zip(current.bytes_received.checked_sub(prev.bytes_received));
    let Some((sent_delta, recv_delta)) = deltas else {
        log::debug!("{}: counters went backwards, skipping this cycle", prev.interface_name);
        return None;
    };
    Some(InterfaceRates {
        upload_rate: Some(sent_delta as f64 / elapsed_secs),
        download_rate: Some(recv_delta as f64 / elapsed_secs),
        uploaded_total: Some(current.bytes_sent as f64),
        downloaded_total: Some(current.bytes_received as f64),
    })
}

/// Interface with the highest download rate, if any. One without a
/// download rate ranks below every interface that has one.
pub fn busiest_interface<'a, I>(rates: I) -> Option<(&'a str, &'a InterfaceRates)>
where
    I: IntoIterator<Item = (&'a String, &'a InterfaceRates)>,
{
    let mut best: Option<(&str, &InterfaceRates)> = None;
    for (name, rate) in rates {
        match best {
            Some((_, current)) if current.download_rate >= rate.download_rate => {}
            _ => best = Some((name.as_str(), rate)),
        }
    }
    best
}
