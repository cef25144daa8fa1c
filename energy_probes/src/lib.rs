use std::{fs, num::ParseIntError};

use clap::ValueEnum;
use enum_map::{Enum, EnumMap};

pub mod msr;
pub mod perf_event;

#[derive(Enum, Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum RaplDomain {
    /// entire socket
    Package,
    /// power plane 0: core
    PP0,
    /// power plane 1: graphics/uncore
    PP1,
    /// DRAM
    Dram,
}

impl RaplDomain {
    /// All the domains, in output column order.
    pub const ALL: [RaplDomain; 4] = [
        RaplDomain::Package,
        RaplDomain::PP0,
        RaplDomain::PP1,
        RaplDomain::Dram,
    ];
}

/// How to interpret the raw counter of one RAPL domain.
#[derive(Debug, Clone, Copy)]
pub struct DomainInfo {
    /// Multiplier that converts a raw counter difference to Joules.
    pub scale: f64,

    /// Value at which the hardware counter wraps around.
    pub max_raw: u64,
}

/// Raw counter values captured at one instant.
/// `None` marks a domain the probe cannot read; it must never be reported as zero.
pub type CounterSnapshot = EnumMap<RaplDomain, Option<u64>>;

/// Temperatures captured at one instant, in degrees Celsius.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThermalSample {
    pub package: i16,
    pub cores: Vec<i16>,
}

pub trait EnergyProbe: Send {
    /// Conversion info for each domain. `None` marks a domain this probe
    /// cannot read (missing hardware support, or not selected).
    fn domains(&self) -> &EnumMap<RaplDomain, Option<DomainInfo>>;

    /// Reads the current raw value of every available counter into `out`.
    /// Absent domains are left `None`.
    ///
    /// RAPL counters are monotonically increasing accumulators that wrap
    /// after some time (under a minute for a busy package on some machines),
    /// so two consecutive readings with `current < previous` mean a single
    /// overflow, provided the sampling frequency is high enough.
    fn read_counters(&mut self, out: &mut CounterSnapshot) -> anyhow::Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CpuId {
    pub cpu: u32,
    pub socket: u32,
}

/// Retrieves the CPU to read the RAPL counters from.
///
/// The perf "cpumask" lists one cpu per socket; we monitor the first one.
/// Machines without the RAPL PMU driver (e.g. msr-only setups) don't have
/// the mask, in which case cpu 0 is assumed.
pub fn monitored_cpu() -> anyhow::Result<CpuId> {
    match fs::read_to_string("/sys/devices/power/cpumask") {
        Ok(mask) => {
            let cpus = parse_cpu_list(&mask)?;
            let first = *cpus
                .first()
                .ok_or_else(|| anyhow::anyhow!("/sys/devices/power/cpumask is empty"))?;
            Ok(CpuId { cpu: first, socket: 0 })
        }
        Err(e) => {
            log::debug!("no perf cpumask ({e}), defaulting to cpu 0");
            Ok(CpuId { cpu: 0, socket: 0 })
        }
    }
}

/// Lists the online CPUs, from the sysfs.
pub fn online_cpus() -> anyhow::Result<Vec<u32>> {
    let list = fs::read_to_string("/sys/devices/system/cpu/online")?;
    parse_cpu_list(&list)
}

fn parse_cpu_list(cpulist: &str) -> anyhow::Result<Vec<u32>> {
    // handles "n" or "start-end"
    fn parse_item(item: &str) -> anyhow::Result<Vec<u32>> {
        let bounds: Vec<u32> = item
            .split('-')
            .map(str::parse)
            .collect::<Result<Vec<u32>, ParseIntError>>()?;

        match bounds.as_slice() {
            &[start, end] => Ok((start..=end).collect()),
            &[n] => Ok(vec![n]),
            _ => Err(anyhow::anyhow!("invalid cpulist item: {}", item)),
        }
    }

    // the list can be "0,64" or "0-1" or a mix like "0-1,64-66"
    let cpus: Vec<u32> = cpulist
        .trim_end()
        .split(',')
        .map(parse_item)
        .collect::<anyhow::Result<Vec<Vec<u32>>>>()?
        .into_iter()
        .flatten()
        .collect();

    Ok(cpus)
}

#[cfg(test)]
mod tests {
    use super::parse_cpu_list;

    #[test]
    fn test_parse_cpu_list() -> anyhow::Result<()> {
        assert_eq!(parse_cpu_list("0")?, vec![0]);
        assert_eq!(parse_cpu_list("0,64")?, vec![0, 64]);
        assert_eq!(parse_cpu_list("0-1")?, vec![0, 1]);
        assert_eq!(parse_cpu_list("1-3,5-6")?, vec![1, 2, 3, 5, 6]);
        assert_eq!(parse_cpu_list("0-3\n")?, vec![0, 1, 2, 3]);
        Ok(())
    }

    #[test]
    fn test_parse_cpu_list_invalid() {
        assert!(parse_cpu_list("abc").is_err());
        assert!(parse_cpu_list("1-2-3").is_err());
    }
}
