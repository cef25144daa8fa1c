// See https://github.com/torvalds/linux/commit/4788e5b4b2338f85fa42a712a182d8afd65d7c58
// for an explaination of the RAPL PMU driver.

use anyhow::{anyhow, Context, Result};
use enum_map::EnumMap;
use log::{debug, warn};
use perf_event_open_sys as sys;
use std::{
    fs::{self, File},
    io::{self, Read},
    os::fd::FromRawFd,
    path::Path,
};

use super::{CounterSnapshot, CpuId, DomainInfo, EnergyProbe, RaplDomain};

/// The perf RAPL counters span the full 64-bit range before wrapping.
const PERF_MAX_ENERGY: u64 = u64::MAX;

/// A RAPL power event advertised in `/sys/devices/power/events`.
#[derive(Debug)]
pub struct PowerEvent {
    /// The name of the power event, as reported by the sysfs ("pkg", "cores", ...).
    pub name: String,
    /// The RAPL domain the event accounts for.
    pub domain: RaplDomain,
    /// The event code to use as a "config" field for perf_event_open.
    pub code: u8,
    /// Should be "Joules".
    pub unit: String,
    /// The scale to apply in order to get joules (`energy_j = count * scale`).
    pub scale: f64,
}

impl PowerEvent {
    /// Make a system call to [perf_event_open](https://www.man7.org/linux/man-pages/man2/perf_event_open.2.html)
    /// with `attr.config = self.code` and `attr.type = pmu_type`.
    fn open(&self, pmu_type: u32, cpu_id: u32) -> io::Result<File> {
        // Only some combinations of (pid, cpu) are valid.
        // For RAPL PMU events, we use (-1, cpu) which means "all processes, one cpu".
        let pid = -1;
        let cpu = cpu_id as i32;

        let mut attr = sys::bindings::perf_event_attr::default();
        attr.config = self.code.into();
        attr.type_ = pmu_type;
        attr.size = core::mem::size_of_val(&attr) as u32;
        debug!("{attr:?}");

        let result = unsafe { sys::perf_event_open(&mut attr, pid, cpu, -1, 0) };
        if result == -1 {
            Err(io::Error::last_os_error())
        } else {
            Ok(unsafe { File::from_raw_fd(result) })
        }
    }
}

/// Retrieves the type of the RAPL PMU (Power Monitoring Unit) in the Linux kernel.
pub fn pmu_type() -> Result<u32> {
    let path = Path::new("/sys/devices/power/type");
    let read = fs::read_to_string(path).with_context(|| format!("Failed to read {path:?}"))?;
    let typ = read
        .trim_end()
        .parse()
        .with_context(|| format!("Failed to parse {path:?}: '{read}'"))?;
    Ok(typ)
}

/// Retrieves the RAPL power events exposed in sysfs that map to a tracked domain.
///
/// The sysfs can expose more events than we track (for instance
/// [`psys`](https://patchwork.kernel.org/project/linux-pm/patch/1458253409-13318-1-git-send-email-srinivas.pandruvada@linux.intel.com/));
/// those are skipped.
pub fn all_power_events() -> Result<Vec<PowerEvent>> {
    fn read_event_code(path: &Path) -> Result<u8> {
        let read = fs::read_to_string(path)?;
        let code_str = read
            .trim_end()
            .strip_prefix("event=0x")
            .with_context(|| format!("Failed to strip {path:?}: '{read}'"))?;
        let code = u8::from_str_radix(code_str, 16).with_context(|| format!("Failed to parse {path:?}: '{read}'"))?; // hexadecimal
        Ok(code)
    }

    fn read_event_unit(main: &Path) -> Result<String> {
        let mut path = main.to_path_buf();
        path.set_extension("unit");
        let unit_str = fs::read_to_string(path)?.trim_end().to_string();
        Ok(unit_str)
    }

    fn read_event_scale(main: &Path) -> Result<f64> {
        let mut path = main.to_path_buf();
        path.set_extension("scale");
        let read = fs::read_to_string(&path)?;
        let scale = read
            .trim_end()
            .parse()
            .with_context(|| format!("Failed to parse {path:?}: '{read}'"))?;
        Ok(scale)
    }

    fn parse_event_name(name: &str) -> Option<RaplDomain> {
        match name {
            "pkg" => Some(RaplDomain::Package),
            "cores" => Some(RaplDomain::PP0),
            "gpu" => Some(RaplDomain::PP1),
            "ram" => Some(RaplDomain::Dram),
            _ => None,
        }
    }

    let mut events: Vec<PowerEvent> = Vec::new();
    for e in fs::read_dir("/sys/devices/power/events")? {
        let entry = e?;
        let path = entry.path();
        let file_name = path.file_name().unwrap().to_string_lossy();
        // only list the main file, not *.unit nor *.scale
        if path.is_file() && !file_name.contains('.') {
            // The files are named "energy-pkg", "energy-dram", ...
            if let Some(event_name) = file_name.strip_prefix("energy-") {
                let Some(domain) = parse_event_name(event_name) else {
                    debug!("skipping untracked RAPL perf event {event_name}");
                    continue;
                };
                events.push(PowerEvent {
                    name: event_name.to_owned(),
                    domain,
                    code: read_event_code(&path)?,
                    unit: read_event_unit(&path)?,
                    scale: read_event_scale(&path)?,
                })
            }
        }
    }
    Ok(events)
}

/// Energy probe based on perf_event for intel RAPL.
pub struct PerfEventProbe {
    /// One opened event per readable domain.
    fds: EnumMap<RaplDomain, Option<File>>,

    /// Conversion info for the readable domains.
    domains: EnumMap<RaplDomain, Option<DomainInfo>>,
}

impl PerfEventProbe {
    pub fn new(cpu: &CpuId, events: &[&PowerEvent]) -> Result<PerfEventProbe> {
        let pmu_type = pmu_type()?;
        let mut fds: EnumMap<RaplDomain, Option<File>> = EnumMap::default();
        let mut domains: EnumMap<RaplDomain, Option<DomainInfo>> = EnumMap::default();
        for event in events {
            // the counters we track all accumulate Joules, anything else would
            // be misinterpreted by the delta computation
            if event.unit != "Joules" {
                warn!("skipping perf event '{}': unexpected unit '{}'", event.name, event.unit);
                continue;
            }
            let fd = event
                .open(pmu_type, cpu.cpu)
                .with_context(|| format!("perf_event_open failed for event '{}'", event.name))?;
            fds[event.domain] = Some(fd);
            domains[event.domain] = Some(DomainInfo {
                scale: event.scale,
                max_raw: PERF_MAX_ENERGY,
            });
        }
        if domains.values().all(Option::is_none) {
            return Err(anyhow!("no usable RAPL perf event found"));
        }
        Ok(PerfEventProbe { fds, domains })
    }
}

impl EnergyProbe for PerfEventProbe {
    fn domains(&self) -> &EnumMap<RaplDomain, Option<DomainInfo>> {
        &self.domains
    }

    fn read_counters(&mut self, out: &mut CounterSnapshot) -> Result<()> {
        for (domain, fd) in &mut self.fds {
            out[domain] = match fd {
                Some(fd) => {
                    let value = read_perf_event(fd)
                        .with_context(|| format!("failed to read perf event for domain {domain:?}"))?;
                    Some(value)
                }
                None => None,
            };
        }
        Ok(())
    }
}

fn read_perf_event(fd: &mut File) -> io::Result<u64> {
    let mut buf = [0u8; 8];
    // rewind() is INVALID for perf events, we must read "at the cursor" every time
    fd.read(&mut buf)?;
    Ok(u64::from_ne_bytes(buf))
}
