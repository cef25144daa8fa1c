use std::env;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::os::unix::process::CommandExt;
use std::process::{Child, Command};

use anyhow::Context;
use clap::Parser;
use log::{info, warn};
use time::OffsetDateTime;

use energy_probes::msr::{MsrProbe, ThermalProbe};
use energy_probes::perf_event::{self, PerfEventProbe, PowerEvent};
use energy_probes::EnergyProbe;

use cli::{Cli, ProbeType};
use output::RunInfo;
use sampler::{DuplicatePolicy, Sampler};
use timer::IntervalTimer;

mod cli;
mod output;
mod sampler;
mod signal;
mod sys;
mod timer;

/// Exit code when the child is terminated by a signal, mirroring EXIT_FAILURE.
const EXIT_CODE_SIGNALED: i32 = 1;

fn main() -> anyhow::Result<()> {
    // initialize logger
    let env = env_logger::Env::default().default_filter_or("info");
    env_logger::init_from_env(env);

    // parse CLI arguments
    let cli = Cli::parse();
    let cmdline = cli::reconstruct_cmdline(env::args());

    // the RAPL counters are tied to one core; stay on it
    let cpu = energy_probes::monitored_cpu()?;
    if let Err(e) = sys::pin_to_core(cpu.cpu) {
        warn!("failed to pin the sampler to cpu {}: {e}", cpu.cpu);
    }

    // locate and activate the counters; this is fatal when nothing is usable
    let domains = cli.selected_domains();
    let probe: Box<dyn EnergyProbe> = match cli.probe {
        ProbeType::PerfEvent => {
            let events = perf_event::all_power_events().context("failed to enumerate the RAPL perf events")?;
            let selected: Vec<&PowerEvent> = events.iter().filter(|e| domains.contains(&e.domain)).collect();
            Box::new(PerfEventProbe::new(&cpu, &selected)?)
        }
        ProbeType::Msr => Box::new(MsrProbe::new(&cpu, &domains)?),
    };
    let thermal = if cli.temperature {
        Some(ThermalProbe::new(&energy_probes::online_cpus()?)?)
    } else {
        None
    };

    if cli.list_counters {
        list_counters(probe.as_ref(), thermal.as_ref());
        return Ok(());
    }

    let policy = if cli.suppress_duplicates {
        DuplicatePolicy::Suppress
    } else {
        DuplicatePolicy::Keep
    };
    let mut sampler = Sampler::new(probe, thermal, policy);

    signal::install()?;
    let started = OffsetDateTime::now_local().unwrap_or_else(|_| OffsetDateTime::now_utc());
    let mut child = spawn_child(&cli.command, cli.child_affinity)?;
    if let Err(e) = sys::raise_priority() {
        warn!("failed to raise the sampler priority: {e}");
    }

    let mut timer = IntervalTimer::arm(cli.frequency)?;
    let status = sampler::run(&mut sampler, &mut child, &mut timer)?;

    info!("captured {} samples", sampler.sample_count());
    let rows = sampler.finalize();

    let file = File::create(&cli.output)
        .with_context(|| format!("could not open '{}' for writing", cli.output.display()))?;
    let mut writer = BufWriter::new(file);
    let run_info = RunInfo { started, cmdline };
    output::write_trace(&mut writer, &run_info, &rows)?;
    writer.flush()?;

    let exit_code = match status.code() {
        Some(code) => {
            info!("child exited normally with exit code {code}");
            code
        }
        None => {
            info!("child was terminated by a signal");
            EXIT_CODE_SIGNALED
        }
    };
    std::process::exit(exit_code);
}

fn spawn_child(command: &[String], affinity_core: Option<u32>) -> anyhow::Result<Child> {
    let (program, args) = command.split_first().expect("clap requires a non-empty command");
    let mut cmd = Command::new(program);
    cmd.args(args);
    unsafe {
        // the parent is pinned to the monitored core and the child would
        // inherit that mask, so reset it unless a core was requested
        cmd.pre_exec(move || match affinity_core {
            Some(core) => sys::pin_to_core(core),
            None => sys::allow_all_cores(),
        });
    }
    cmd.spawn().with_context(|| format!("failed to launch '{program}'"))
}

fn list_counters(probe: &dyn EnergyProbe, thermal: Option<&ThermalProbe>) {
    println!("Available RAPL counters:");
    for (domain, info) in probe.domains() {
        match info {
            Some(info) => println!("- {domain:?}: scale {:e} J/unit", info.scale),
            None => println!("- {domain:?}: absent"),
        }
    }
    if let Some(thermal) = thermal {
        println!(
            "Temperatures: TjMax {} degrees C, {} readable cores",
            thermal.tjmax(),
            thermal.core_count()
        );
    }
}
