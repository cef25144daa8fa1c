use std::path::PathBuf;

use clap::{Parser, ValueEnum};
use energy_probes::RaplDomain;

/// Runs a command and records a trace of the CPU energy consumption
/// (and optionally of the CPU temperatures) during its execution.
#[derive(Parser)]
#[command(name = "trace-energy", version)]
pub struct Cli {
    /// Sampling frequency, in Hertz.
    #[arg(short = 'F', long, value_parser = parse_frequency, default_value = "200")]
    pub frequency: f64,

    /// Output file for the trace.
    #[arg(short, long, default_value = "energy-trace.csv")]
    pub output: PathBuf,

    /// Pin the child process to a specific core (default: all cores).
    #[arg(short = 'c', long, value_name = "CORE")]
    pub child_affinity: Option<u32>,

    /// How to access the RAPL counters.
    #[arg(long, value_enum, default_value_t = ProbeType::PerfEvent)]
    pub probe: ProbeType,

    /// The RAPL domains to record (default: all of them).
    #[arg(short, long, value_delimiter = ',')]
    pub domains: Vec<RaplDomain>,

    /// Also record the package and per-core temperatures (requires the msr driver).
    #[arg(long)]
    pub temperature: bool,

    /// Drop samples whose energy counters have not advanced since the previous
    /// sample, to avoid zero-energy rows when supersampling.
    #[arg(long)]
    pub suppress_duplicates: bool,

    /// List the available counters, then exit without running anything.
    #[arg(long)]
    pub list_counters: bool,

    /// The command to run, with its arguments.
    #[arg(
        trailing_var_arg = true,
        allow_hyphen_values = true,
        required_unless_present = "list_counters"
    )]
    pub command: Vec<String>,
}

impl Cli {
    /// The domains to track: `-d` if given, everything otherwise.
    pub fn selected_domains(&self) -> Vec<RaplDomain> {
        if self.domains.is_empty() {
            RaplDomain::ALL.to_vec()
        } else {
            self.domains.clone()
        }
    }
}

#[derive(Clone, Copy, ValueEnum, Debug, PartialEq, Eq)]
pub enum ProbeType {
    PerfEvent,
    Msr,
}

fn parse_frequency(s: &str) -> Result<f64, String> {
    let hz: f64 = s.parse().map_err(|_| format!("'{s}' is not a valid number"))?;
    if hz > 0.0 && hz.is_finite() {
        Ok(hz)
    } else {
        Err(String::from("the frequency must be greater than zero"))
    }
}

/// Rebuilds the full invocation for the output header.
/// Arguments that contain spaces are single-quoted, embedded quotes escaped.
pub fn reconstruct_cmdline<I>(args: I) -> String
where
    I: IntoIterator<Item = String>,
{
    let mut cmdline = String::new();
    for (i, arg) in args.into_iter().enumerate() {
        if i > 0 {
            cmdline.push(' ');
        }
        if arg.contains(' ') {
            cmdline.push('\'');
            for c in arg.chars() {
                if c == '\'' {
                    cmdline.push_str("\\'");
                } else {
                    cmdline.push(c);
                }
            }
            cmdline.push('\'');
        } else {
            cmdline.push_str(&arg);
        }
    }
    cmdline
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    fn args(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_cmdline_reconstruction() {
        assert_eq!(reconstruct_cmdline(args(&["trace-energy", "ls", "-l"])), "trace-energy ls -l");
        assert_eq!(
            reconstruct_cmdline(args(&["trace-energy", "sh", "-c", "sleep 2"])),
            "trace-energy sh -c 'sleep 2'"
        );
        assert_eq!(
            reconstruct_cmdline(args(&["t", "echo", "it's here"])),
            r"t echo 'it\'s here'"
        );
    }

    #[test]
    fn test_cli_defaults() {
        let cli = Cli::parse_from(["trace-energy", "sleep", "2"]);
        assert_eq!(cli.frequency, 200.0);
        assert_eq!(cli.output.to_str(), Some("energy-trace.csv"));
        assert_eq!(cli.child_affinity, None);
        assert_eq!(cli.probe, ProbeType::PerfEvent);
        assert!(!cli.temperature);
        assert!(!cli.suppress_duplicates);
        assert_eq!(cli.command, args(&["sleep", "2"]));
        assert_eq!(cli.selected_domains(), RaplDomain::ALL.to_vec());
    }

    #[test]
    fn test_cli_child_flags_not_consumed() {
        // everything after the command name belongs to the child
        let cli = Cli::parse_from(["trace-energy", "-F", "10", "stress", "-c", "4"]);
        assert_eq!(cli.frequency, 10.0);
        assert_eq!(cli.child_affinity, None);
        assert_eq!(cli.command, args(&["stress", "-c", "4"]));
    }

    #[test]
    fn test_cli_domain_selection() {
        let cli = Cli::parse_from(["trace-energy", "-d", "package,dram", "true"]);
        assert_eq!(cli.selected_domains(), vec![RaplDomain::Package, RaplDomain::Dram]);
    }

    #[test]
    fn test_cli_rejects_missing_frequency_value() {
        assert!(Cli::try_parse_from(["trace-energy", "-F"]).is_err());
        // a flag consuming the command name must not be accepted as a number
        assert!(Cli::try_parse_from(["trace-energy", "-F", "sleep", "2"]).is_err());
    }

    #[test]
    fn test_cli_rejects_bad_frequency() {
        assert!(Cli::try_parse_from(["trace-energy", "-F", "0", "sleep", "2"]).is_err());
        assert!(Cli::try_parse_from(["trace-energy", "-F", "-5", "sleep", "2"]).is_err());
        assert!(Cli::try_parse_from(["trace-energy", "-F", "abc", "sleep", "2"]).is_err());
    }

    #[test]
    fn test_cli_requires_a_command() {
        assert!(Cli::try_parse_from(["trace-energy"]).is_err());
        assert!(Cli::try_parse_from(["trace-energy", "--list-counters"]).is_ok());
    }
}
