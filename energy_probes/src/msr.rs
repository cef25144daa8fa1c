// According to Intel 64 and IA-32 architectures software developer's manual, volume 3B,
// MSR_PKG_ENERGY_STATUS reports the measured energy usage of the package.

use std::{
    fs::File,
    io,
    os::unix::prelude::FileExt,
    process::{Command, Stdio},
};

use anyhow::{anyhow, Context, Result};
use enum_map::EnumMap;
use log::{debug, info, warn};
use regex::Regex;

use super::{CounterSnapshot, CpuId, DomainInfo, EnergyProbe, RaplDomain, ThermalSample};

type Addr = u64;

/// MSR registers' addresses for Intel RAPL domains
mod intel {
    use super::Addr;

    pub const MSR_RAPL_POWER_UNIT: Addr = 0x00000606;
    pub const MSR_PKG_ENERGY_STATUS: Addr = 0x00000611;
    pub const MSR_PP0_ENERGY_STATUS: Addr = 0x00000639;
    pub const MSR_PP1_ENERGY_STATUS: Addr = 0x00000641;
    pub const MSR_DRAM_ENERGY_STATUS: Addr = 0x00000619;
}

/// MSR registers' addresses for AMD RAPL domains
mod amd {
    use super::Addr;

    pub const MSR_RAPL_POWER_UNIT: Addr = 0xc0010299;
    pub const MSR_CORE_ENERGY_STATUS: Addr = 0xc001029a;
    pub const MSR_PKG_ENERGY_STATUS: Addr = 0xc001029b;
}

/// MSR registers' addresses for the thermal sensors (Intel)
mod thermal {
    use super::Addr;

    pub const MSR_IA32_THERM_STATUS: Addr = 0x0000019c;
    pub const MSR_IA32_TEMPERATURE_TARGET: Addr = 0x000001a2;
    pub const MSR_IA32_PACKAGE_THERM_STATUS: Addr = 0x000001b1;
}

/// Mask to apply when reading the energy values
const MSR_ENERGY_MASK: u64 = 0xffff_ffff;

/// Maximum value of the MSR energy counter.
/// Note that this technically depends on the exact hardware, but for our purposes it's good enough.
const MSR_MAX_ENERGY: u64 = u32::MAX as u64;

/// Critical temperature to assume when MSR_IA32_TEMPERATURE_TARGET cannot be read.
const DEFAULT_TJMAX: i16 = 100;

#[derive(Clone, Copy, PartialEq, Eq)]
pub enum RaplVendor {
    Intel,
    Amd,
}

/// Reads the RAPL energy counters via `/dev/cpu/<cpu_id>/msr`.
pub struct MsrProbe {
    /// MSR file descriptor of the monitored cpu.
    fd: File,

    /// Register address of each readable domain.
    addrs: EnumMap<RaplDomain, Option<Addr>>,

    /// Conversion info for the readable domains.
    domains: EnumMap<RaplDomain, Option<DomainInfo>>,
}

impl MsrProbe {
    pub fn new(cpu: &CpuId, selected: &[RaplDomain]) -> Result<MsrProbe> {
        let vendor = cpu_vendor()?;
        let path = format!("/dev/cpu/{}/msr", cpu.cpu);
        let fd = File::open(&path)
            .with_context(|| format!("could not open {path} (is the msr kernel module loaded?)"))?;
        let energy_unit = read_energy_unit(&fd, vendor).context("failed to read MSR_RAPL_POWER_UNIT")?;

        let mut addrs: EnumMap<RaplDomain, Option<Addr>> = EnumMap::default();
        let mut domains: EnumMap<RaplDomain, Option<DomainInfo>> = EnumMap::default();
        for &domain in selected {
            match domain_msr_address(domain, vendor) {
                Some(addr) => {
                    addrs[domain] = Some(addr);
                    domains[domain] = Some(DomainInfo {
                        scale: energy_unit,
                        max_raw: MSR_MAX_ENERGY,
                    });
                }
                None => debug!("RAPL domain {domain:?} has no MSR on this cpu vendor"),
            }
        }
        if domains.values().all(Option::is_none) {
            return Err(anyhow!("no readable RAPL domain in the MSR"));
        }

        Ok(MsrProbe { fd, addrs, domains })
    }
}

impl EnergyProbe for MsrProbe {
    fn domains(&self) -> &EnumMap<RaplDomain, Option<DomainInfo>> {
        &self.domains
    }

    fn read_counters(&mut self, out: &mut CounterSnapshot) -> Result<()> {
        for (domain, addr) in &self.addrs {
            out[domain] = match addr {
                Some(addr) => {
                    let msr_value = read_msr(&self.fd, *addr)
                        .with_context(|| format!("failed to read MSR {addr:#x} for domain {domain:?}"))?;
                    Some(msr_value & MSR_ENERGY_MASK)
                }
                None => None,
            };
        }
        Ok(())
    }
}

fn read_msr(msr: &File, at: Addr) -> io::Result<u64> {
    let mut buf = [0u8; 8];
    msr.read_exact_at(&mut buf, at)?;
    Ok(u64::from_ne_bytes(buf))
}

/// Extract the energy unit from the Model Specific Register `msr`.
///
/// Note that the returned energy unit may not apply to all domains,
/// because some architectures use a different unit for DRAM.
/// This is platform-dependent and not handled here.
///
/// See [Linux source code - rapl.c](https://github.com/torvalds/linux/blob/0036fb00a756a2f6e360d44e2e3d2200a8afbc9b/arch/x86/events/rapl.c#L612)
fn read_energy_unit(msr: &File, vendor: RaplVendor) -> io::Result<f64> {
    let offset = match vendor {
        RaplVendor::Intel => intel::MSR_RAPL_POWER_UNIT,
        RaplVendor::Amd => amd::MSR_RAPL_POWER_UNIT,
    };
    let msr_value = read_msr(msr, offset)?;

    // According to the Intel Software Developer manual, the value we're interested in is
    // "energy status unit" at bits 12:8 (mask 0x1F00)
    let esu = (msr_value & 0x1F00) >> 8;

    // The energy unit, aka "multiplier", is 1/(2^esu) = (1/2)^esu.
    // When we read an energy value from the MSR, the actual value is
    // `msr_value * multiplier` Joules.
    let multiplier = 0.5_f64.powi(esu as i32);
    Ok(multiplier)
}

pub fn cpu_vendor() -> Result<RaplVendor> {
    // run: LC_ALL=C lscpu
    let child = Command::new("lscpu")
        .env("LC_ALL", "C")
        .stdout(Stdio::piped())
        .spawn()
        .context("lscpu should be executable")?;
    let finished = child.wait_with_output()?;
    let stdout = std::str::from_utf8(&finished.stdout)?;

    // find the Vendor ID
    let vendor_regex = Regex::new(r"Vendor ID:\s+(\w+)")?;
    let group = vendor_regex
        .captures(stdout)
        .context("vendor id not found in lscpu output")?
        .get(1)
        .unwrap();
    let vendor = group.as_str().trim();

    match vendor {
        "AuthenticAMD" => Ok(RaplVendor::Amd),
        "GenuineIntel" => Ok(RaplVendor::Intel),
        _ => Err(anyhow!("Unsupported CPU vendor {vendor}")),
    }
}

pub fn domain_msr_address(domain: RaplDomain, vendor: RaplVendor) -> Option<Addr> {
    match vendor {
        RaplVendor::Intel => match domain {
            RaplDomain::Package => Some(intel::MSR_PKG_ENERGY_STATUS),
            RaplDomain::PP0 => Some(intel::MSR_PP0_ENERGY_STATUS),
            RaplDomain::PP1 => Some(intel::MSR_PP1_ENERGY_STATUS),
            RaplDomain::Dram => Some(intel::MSR_DRAM_ENERGY_STATUS),
        },
        RaplVendor::Amd => match domain {
            RaplDomain::Package => Some(amd::MSR_PKG_ENERGY_STATUS),
            RaplDomain::PP0 => Some(amd::MSR_CORE_ENERGY_STATUS),
            RaplDomain::PP1 => None,
            RaplDomain::Dram => None,
        },
    }
}

/// Reads the package and per-core temperatures through the MSR files.
///
/// The readable cores are discovered at startup by probing `/dev/cpu/<n>/msr`
/// for every online cpu, so there is no fixed limit on the core count.
pub struct ThermalProbe {
    cores: Vec<CoreMsr>,
    tjmax: i16,
}

struct CoreMsr {
    cpu: u32,
    fd: File,
}

impl ThermalProbe {
    pub fn new(online_cpus: &[u32]) -> Result<ThermalProbe> {
        let mut cores = Vec::new();
        for &cpu in online_cpus {
            let path = format!("/dev/cpu/{cpu}/msr");
            match File::open(&path) {
                Ok(fd) => cores.push(CoreMsr { cpu, fd }),
                Err(e) => debug!("skipping cpu {cpu} for temperatures: {e}"),
            }
        }
        let first = cores
            .first()
            .ok_or_else(|| anyhow!("no readable MSR file, temperatures are unavailable"))?;

        let tjmax = match read_msr(&first.fd, thermal::MSR_IA32_TEMPERATURE_TARGET) {
            Ok(target) => decode_tjmax(target),
            Err(e) => {
                warn!("failed to read MSR_IA32_TEMPERATURE_TARGET ({e}), using the default of {DEFAULT_TJMAX} for TjMax");
                DEFAULT_TJMAX
            }
        };
        info!("TjMax is {tjmax} degrees C");

        Ok(ThermalProbe { cores, tjmax })
    }

    pub fn tjmax(&self) -> i16 {
        self.tjmax
    }

    pub fn core_count(&self) -> usize {
        self.cores.len()
    }

    /// Reads the package temperature and one temperature per discovered core.
    pub fn read(&self) -> Result<ThermalSample> {
        let package = {
            let status = read_msr(&self.cores[0].fd, thermal::MSR_IA32_PACKAGE_THERM_STATUS)
                .context("failed to read MSR_IA32_PACKAGE_THERM_STATUS")?;
            decode_temperature(self.tjmax, status)
        };
        let cores = self
            .cores
            .iter()
            .map(|core| {
                let status = read_msr(&core.fd, thermal::MSR_IA32_THERM_STATUS)
                    .with_context(|| format!("failed to read MSR_IA32_THERM_STATUS for cpu {}", core.cpu))?;
                Ok(decode_temperature(self.tjmax, status))
            })
            .collect::<Result<Vec<i16>>>()?;

        Ok(ThermalSample { package, cores })
    }
}

fn decode_tjmax(target: u64) -> i16 {
    ((target >> 16) & 0xff) as i16
}

/// The digital readout, bits 22:16 of the thermal status register,
/// is the offset below TjMax.
fn decode_temperature(tjmax: i16, status: u64) -> i16 {
    tjmax - ((status >> 16) & 0x7f) as i16
}

#[cfg(test)]
mod tests {
    use super::{decode_temperature, decode_tjmax};

    #[test]
    fn test_decode_tjmax() {
        assert_eq!(decode_tjmax(100 << 16), 100);
        assert_eq!(decode_tjmax(0x0055_0000), 0x55);
        // other bits of the register must be ignored
        assert_eq!(decode_tjmax((1 << 30) | (90 << 16) | 0xffff), 90);
    }

    #[test]
    fn test_decode_temperature() {
        // readout of 30 degrees below a TjMax of 100
        assert_eq!(decode_temperature(100, 30 << 16), 70);
        // idle core, readout equal to TjMax
        assert_eq!(decode_temperature(100, 100 << 16), 0);
        // status bits outside of the readout must be ignored
        assert_eq!(decode_temperature(100, (1 << 31) | (25 << 16) | 0xff), 75);
    }
}
