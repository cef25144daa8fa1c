//! Writes the finalized trace: a block of `#`-prefixed metadata describing
//! the host and the run, followed by one data row per sampling interval.

use std::env;
use std::io::Write;

use anyhow::Result;
use log::warn;
use time::format_description::well_known::Rfc2822;
use time::OffsetDateTime;

use energy_probes::RaplDomain;

use crate::sampler::TraceRow;
use crate::sys;

pub const TOOL_NAME: &str = "trace-energy";

/// Everything the metadata header needs besides what the host itself provides.
pub struct RunInfo {
    /// When the capture started.
    pub started: OffsetDateTime,
    /// The reconstructed command line of this invocation.
    pub cmdline: String,
}

pub fn write_trace(w: &mut dyn Write, info: &RunInfo, rows: &[TraceRow]) -> Result<()> {
    write_header(w, info)?;
    write_rows(w, rows)?;
    Ok(())
}

fn write_header(w: &mut dyn Write, info: &RunInfo) -> Result<()> {
    writeln!(w, "# {} version {} output", TOOL_NAME, env!("CARGO_PKG_VERSION"))?;

    match info.started.format(&Rfc2822) {
        Ok(formatted) => writeln!(w, "# Capture started: {formatted}")?,
        Err(e) => warn!("could not format the capture start time: {e}"),
    }

    match sys::uname() {
        Ok(u) => {
            writeln!(w, "# System name: {}", u.sysname)?;
            writeln!(w, "# Hostname: {}", u.nodename)?;
            writeln!(w, "# System release: {}", u.release)?;
            writeln!(w, "# System version: {}", u.version)?;
            writeln!(w, "# Architecture: {}", u.machine)?;
        }
        Err(e) => warn!("uname failed: {e}"),
    }

    match procfs::CpuInfo::new() {
        Ok(cpuinfo) => {
            if let Some(model) = cpuinfo.model_name(0) {
                writeln!(w, "# CPU model: {model}")?;
            }
        }
        Err(e) => warn!("failed to read /proc/cpuinfo: {e}"),
    }

    writeln!(w, "# CPUs available: {}", sys::cpus_available())?;
    writeln!(w, "# CPUs online: {}", sys::cpus_online())?;

    match procfs::Meminfo::new() {
        Ok(meminfo) => writeln!(w, "# Total memory: {} kB", meminfo.mem_total / 1024)?,
        Err(e) => warn!("failed to read /proc/meminfo: {e}"),
    }

    if let Ok(wd) = env::current_dir() {
        writeln!(w, "# Working directory: {}", wd.display())?;
    }
    writeln!(w, "# Command line: {}", info.cmdline)?;
    Ok(())
}

fn write_rows(w: &mut dyn Write, rows: &[TraceRow]) -> Result<()> {
    for row in rows {
        write!(w, "{:.6}", row.timestamp)?;
        for domain in RaplDomain::ALL {
            write!(w, ", {:.6}", row.joules[domain])?;
        }
        if let Some(thermal) = &row.temperatures {
            write!(w, ", {}", thermal.package)?;
            for core in &thermal.cores {
                write!(w, ", {core}")?;
            }
        }
        writeln!(w)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use enum_map::enum_map;
    use energy_probes::ThermalSample;

    fn row(timestamp: f64, pkg: f64) -> TraceRow {
        TraceRow {
            timestamp,
            joules: enum_map! {
                RaplDomain::Package => pkg,
                _ => 0.0,
            },
            temperatures: None,
        }
    }

    fn written(info: &RunInfo, rows: &[TraceRow]) -> String {
        let mut buf = Vec::new();
        write_trace(&mut buf, info, rows).expect("writing to a Vec cannot fail");
        String::from_utf8(buf).expect("the trace must be valid utf-8")
    }

    fn run_info() -> RunInfo {
        RunInfo {
            started: OffsetDateTime::UNIX_EPOCH,
            cmdline: String::from("trace-energy sh -c 'sleep 2'"),
        }
    }

    #[test]
    fn test_header_precedes_data_rows() {
        let out = written(&run_info(), &[row(1.0, 0.5), row(2.0, 0.25)]);
        let lines: Vec<&str> = out.lines().collect();

        let first_data = lines
            .iter()
            .position(|l| !l.starts_with('#'))
            .expect("there must be data rows");
        assert!(first_data > 0, "the header must come first");
        assert!(lines[..first_data].iter().all(|l| l.starts_with('#')));
        assert!(lines[first_data..].iter().all(|l| !l.starts_with('#')));
        assert_eq!(lines.len() - first_data, 2);
    }

    #[test]
    fn test_header_contains_run_metadata() {
        let out = written(&run_info(), &[]);
        assert!(out.contains("# trace-energy version"));
        assert!(out.contains("# Capture started: Thu, 01 Jan 1970 00:00:00 +0000"));
        assert!(out.contains("# Command line: trace-energy sh -c 'sleep 2'"));
        assert!(out.contains("# CPUs online: "));
    }

    #[test]
    fn test_row_formatting() {
        let out = written(&run_info(), &[row(1691000000.125, 0.5)]);
        let data = out.lines().last().expect("one data row");
        assert_eq!(data, "1691000000.125000, 0.500000, 0.000000, 0.000000, 0.000000");
    }

    #[test]
    fn test_row_with_temperatures() {
        let mut r = row(2.0, 1.0);
        r.temperatures = Some(ThermalSample {
            package: 54,
            cores: vec![50, 52, 49],
        });
        let out = written(&run_info(), &[r]);
        let data = out.lines().last().expect("one data row");
        assert_eq!(data, "2.000000, 1.000000, 0.000000, 0.000000, 0.000000, 54, 50, 52, 49");
    }
}
