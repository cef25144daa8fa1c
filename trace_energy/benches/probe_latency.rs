use std::time::Duration;

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use energy_probes::{
    msr::MsrProbe,
    perf_event::{self, PerfEventProbe},
    CounterSnapshot, EnergyProbe, RaplDomain,
};

// Measures the latency of one full counter read, for each probe backend.
// Requires real RAPL hardware and the matching privileges, like the tool itself.

fn init_perf_probe() -> anyhow::Result<PerfEventProbe> {
    let cpu = energy_probes::monitored_cpu()?;
    let events = perf_event::all_power_events()?;
    let selected: Vec<&perf_event::PowerEvent> = events.iter().collect();
    PerfEventProbe::new(&cpu, &selected)
}

fn init_msr_probe() -> anyhow::Result<MsrProbe> {
    let cpu = energy_probes::monitored_cpu()?;
    MsrProbe::new(&cpu, &RaplDomain::ALL)
}

fn criterion_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("counter_read");
    group
        .significance_level(0.01)
        .sample_size(1000)
        .warm_up_time(Duration::from_secs(2))
        .measurement_time(Duration::from_secs(10));

    match init_perf_probe() {
        Ok(mut probe) => {
            let mut snapshot = CounterSnapshot::default();
            group.bench_function("perf-event", |b| {
                b.iter(|| {
                    probe.read_counters(&mut snapshot).unwrap();
                    black_box(&snapshot);
                })
            });
        }
        Err(e) => eprintln!("skipping perf-event benchmark: {e}"),
    }

    match init_msr_probe() {
        Ok(mut probe) => {
            let mut snapshot = CounterSnapshot::default();
            group.bench_function("msr", |b| {
                b.iter(|| {
                    probe.read_counters(&mut snapshot).unwrap();
                    black_box(&snapshot);
                })
            });
        }
        Err(e) => eprintln!("skipping msr benchmark: {e}"),
    }

    group.finish();
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);
