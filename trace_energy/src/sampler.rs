//! The sampling loop: capture one sample per timer tick while the child runs,
//! then turn the buffer into per-interval energy deltas.

use std::process::{Child, ExitStatus};
use std::ptr;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use enum_map::EnumMap;
use log::debug;

use energy_probes::msr::ThermalProbe;
use energy_probes::{CounterSnapshot, DomainInfo, EnergyProbe, RaplDomain, ThermalSample};

use crate::signal;
use crate::timer::IntervalTimer;

/// Initial capacity of the sample buffer; it grows on demand past this.
const SAMPLE_CAPACITY_HINT: usize = 1000;

/// One captured instant: a wall-clock timestamp plus the raw value of every
/// tracked counter.
#[derive(Debug, Clone)]
pub struct Sample {
    pub timestamp: SystemTime,
    pub energy: CounterSnapshot,
    pub thermal: Option<ThermalSample>,
}

/// What to do when consecutive captures carry identical counter values,
/// which happens when sampling faster than the hardware updates the counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DuplicatePolicy {
    Keep,
    Suppress,
}

pub struct Sampler {
    probe: Box<dyn EnergyProbe>,
    thermal: Option<ThermalProbe>,
    samples: Vec<Sample>,
    duplicates: DuplicatePolicy,
    warmed_up: bool,
}

impl Sampler {
    pub fn new(probe: Box<dyn EnergyProbe>, thermal: Option<ThermalProbe>, duplicates: DuplicatePolicy) -> Sampler {
        Sampler {
            probe,
            thermal,
            samples: Vec::with_capacity(SAMPLE_CAPACITY_HINT),
            duplicates,
            warmed_up: false,
        }
    }

    /// Captures one sample and appends it to the buffer.
    ///
    /// The very first capture is discarded as warm-up: the interval between
    /// timer arm and first expiry is scheduling jitter, not a real period.
    pub fn capture(&mut self) -> Result<()> {
        let mut energy = CounterSnapshot::default();
        self.probe.read_counters(&mut energy)?;
        let thermal = match &self.thermal {
            Some(probe) => Some(probe.read()?),
            None => None,
        };
        let timestamp = SystemTime::now();

        if !self.warmed_up {
            self.warmed_up = true;
            return Ok(());
        }
        let sample = Sample {
            timestamp,
            energy,
            thermal,
        };
        if self.duplicates == DuplicatePolicy::Suppress && is_duplicate(self.samples.last(), &sample) {
            debug!("suppressing duplicate sample");
            return Ok(());
        }
        self.samples.push(sample);
        Ok(())
    }

    pub fn sample_count(&self) -> usize {
        self.samples.len()
    }

    /// Converts the buffer into output rows, consuming the sampler.
    pub fn finalize(self) -> Vec<TraceRow> {
        deltas(&self.samples, self.probe.domains())
    }
}

/// A sample duplicates the previous one when its package energy counter has
/// not advanced. Sometimes the package counter updates before the DRAM one
/// does, so the DRAM counter is checked as well when it is tracked.
fn is_duplicate(previous: Option<&Sample>, next: &Sample) -> bool {
    let Some(previous) = previous else {
        return false;
    };
    let repeats = |domain: RaplDomain| match (previous.energy[domain], next.energy[domain]) {
        (Some(a), Some(b)) => a == b,
        _ => false,
    };
    repeats(RaplDomain::Package) || repeats(RaplDomain::Dram)
}

/// One output row: the timestamp of the later sample of a consecutive pair,
/// and the scaled difference of each counter over the interval.
#[derive(Debug, Clone)]
pub struct TraceRow {
    /// Seconds since the Unix epoch.
    pub timestamp: f64,
    /// Energy consumed over the interval, in Joules. Absent domains hold the
    /// placeholder 0.
    pub joules: EnumMap<RaplDomain, f64>,
    /// Temperatures at the end of the interval.
    pub temperatures: Option<ThermalSample>,
}

/// Computes one row per consecutive sample pair.
pub fn deltas(samples: &[Sample], domains: &EnumMap<RaplDomain, Option<DomainInfo>>) -> Vec<TraceRow> {
    samples
        .windows(2)
        .map(|pair| {
            let (previous, current) = (&pair[0], &pair[1]);
            TraceRow {
                timestamp: epoch_seconds(current.timestamp),
                joules: EnumMap::from_fn(|domain| {
                    match (domains[domain], previous.energy[domain], current.energy[domain]) {
                        (Some(info), Some(prev), Some(cur)) => scaled_delta(prev, cur, info),
                        // absent counters keep the placeholder delta
                        _ => 0.0,
                    }
                }),
                temperatures: current.thermal.clone(),
            }
        })
        .collect()
}

/// Wrap-corrected difference between two raw counter readings, in Joules.
fn scaled_delta(previous: u64, current: u64, info: DomainInfo) -> f64 {
    let raw = if current < previous {
        // the counter wrapped; one or more overflows may have occured but we
        // cannot know how many, so we correct exactly one
        info.max_raw - previous + current
    } else {
        current - previous
    };
    raw as f64 * info.scale
}

fn epoch_seconds(timestamp: SystemTime) -> f64 {
    timestamp
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// Blocks until the child exits, capturing one sample per timer tick.
///
/// The loop sleeps coarsely and is woken early by the signals; the
/// notification flags are drained here, synchronously, so the buffer is only
/// ever touched by this thread. The coarse period bounds the shutdown latency
/// to about one second after the child exits.
pub fn run(sampler: &mut Sampler, child: &mut Child, timer: &mut IntervalTimer) -> Result<ExitStatus> {
    let status = loop {
        coarse_sleep();
        if signal::take_tick() {
            sampler.capture().context("failed to capture a sample")?;
        }
        if let Some(signo) = signal::take_interrupt() {
            debug!("forwarding signal {signo} to the child");
            unsafe { libc::kill(child.id() as libc::pid_t, signo) };
        }
        if signal::take_child_event() {
            if let Some(status) = child.try_wait().context("failed to wait for the child")? {
                break status;
            }
        }
    };

    // stop the ticks before draining the buffer
    timer.disarm();
    Ok(status)
}

fn coarse_sleep() {
    // a single nanosleep, interrupted early by any delivered signal;
    // std::thread::sleep would transparently restart on EINTR
    let duration = libc::timespec { tv_sec: 1, tv_nsec: 0 };
    unsafe { libc::nanosleep(&duration, ptr::null_mut()) };
}

#[cfg(test)]
mod tests {
    use super::*;
    use enum_map::enum_map;
    use std::time::Duration;

    fn info(scale: f64, max_raw: u64) -> DomainInfo {
        DomainInfo { scale, max_raw }
    }

    fn sample(at_secs: u64, pkg: Option<u64>, dram: Option<u64>) -> Sample {
        Sample {
            timestamp: UNIX_EPOCH + Duration::from_secs(at_secs),
            energy: enum_map! {
                RaplDomain::Package => pkg,
                RaplDomain::PP0 => None,
                RaplDomain::PP1 => None,
                RaplDomain::Dram => dram,
            },
            thermal: None,
        }
    }

    fn all_domains() -> EnumMap<RaplDomain, Option<DomainInfo>> {
        enum_map! {
            RaplDomain::Package => Some(info(1.0, u64::MAX)),
            RaplDomain::PP0 => Some(info(1.0, u64::MAX)),
            RaplDomain::PP1 => Some(info(1.0, u64::MAX)),
            RaplDomain::Dram => Some(info(1.0, u64::MAX)),
        }
    }

    #[test]
    fn test_row_count_is_samples_minus_one() {
        let samples: Vec<Sample> = (0..5).map(|i| sample(i, Some(100 * i), None)).collect();
        let rows = deltas(&samples, &all_domains());
        assert_eq!(rows.len(), 4);
    }

    #[test]
    fn test_no_rows_from_less_than_two_samples() {
        assert!(deltas(&[], &all_domains()).is_empty());
        assert!(deltas(&[sample(1, Some(42), None)], &all_domains()).is_empty());
    }

    #[test]
    fn test_monotone_counters_give_nonnegative_deltas() {
        let values = [10_u64, 10, 35, 700, 701];
        let samples: Vec<Sample> = values
            .iter()
            .enumerate()
            .map(|(i, &v)| sample(i as u64, Some(v), None))
            .collect();
        let rows = deltas(&samples, &all_domains());
        assert_eq!(rows.len(), values.len() - 1);
        for row in &rows {
            assert!(row.joules[RaplDomain::Package] >= 0.0);
        }
        assert_eq!(rows[0].joules[RaplDomain::Package], 0.0);
        assert_eq!(rows[1].joules[RaplDomain::Package], 25.0);
        assert_eq!(rows[2].joules[RaplDomain::Package], 665.0);
    }

    #[test]
    fn test_scale_is_applied() {
        // RAPL energy units are powers of two, so the scaled value is exact
        let samples = vec![sample(0, Some(0), None), sample(1, Some(2000), None)];
        let domains = enum_map! {
            RaplDomain::Package => Some(info(0.5f64.powi(14), u64::MAX)),
            _ => None,
        };
        let rows = deltas(&samples, &domains);
        assert_eq!(rows[0].joules[RaplDomain::Package], 2000.0 * 0.5f64.powi(14));
    }

    #[test]
    fn test_wraparound_is_corrected() {
        let max = u32::MAX as u64;
        let domains = enum_map! {
            RaplDomain::Package => Some(info(1.0, max)),
            _ => None,
        };
        let samples = vec![sample(0, Some(max - 5), None), sample(1, Some(10), None)];
        let rows = deltas(&samples, &domains);
        assert_eq!(rows[0].joules[RaplDomain::Package], 15.0);
    }

    #[test]
    fn test_absent_counter_reports_placeholder() {
        // dram values are present in the samples but the probe does not track
        // the domain: the placeholder must win
        let samples = vec![sample(0, Some(1), Some(100)), sample(1, Some(2), Some(900))];
        let domains = enum_map! {
            RaplDomain::Package => Some(info(1.0, u64::MAX)),
            _ => None,
        };
        let rows = deltas(&samples, &domains);
        assert_eq!(rows[0].joules[RaplDomain::Dram], 0.0);
        assert_eq!(rows[0].joules[RaplDomain::PP0], 0.0);
        assert_eq!(rows[0].joules[RaplDomain::Package], 1.0);
    }

    #[test]
    fn test_row_timestamp_comes_from_the_later_sample() {
        let samples = vec![sample(10, Some(1), None), sample(20, Some(2), None)];
        let rows = deltas(&samples, &all_domains());
        assert_eq!(rows[0].timestamp, 20.0);
    }

    #[test]
    fn test_duplicate_detection() {
        let base = sample(0, Some(100), Some(50));

        // package advanced, dram advanced: genuine sample
        assert!(!is_duplicate(Some(&base), &sample(1, Some(101), Some(51))));
        // package repeated: duplicate
        assert!(is_duplicate(Some(&base), &sample(1, Some(100), Some(51))));
        // dram repeated: duplicate, the dram counter can lag behind the package one
        assert!(is_duplicate(Some(&base), &sample(1, Some(101), Some(50))));
        // nothing to compare against
        assert!(!is_duplicate(None, &sample(1, Some(100), Some(50))));
        // absent counters never flag a duplicate
        assert!(!is_duplicate(Some(&sample(0, None, None)), &sample(1, None, None)));
    }
}
