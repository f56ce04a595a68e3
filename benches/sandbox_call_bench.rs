// Call latency benchmark for the in-process sandbox
// Measures one sandboxed invocation end to end: fresh store, linking,
// worker hand-off, classification.

use gradebox::{CodePath, CodeUnit, ExecutionRequest, Sandbox, SandboxConfig, Value, Whitelist};
use std::time::{Duration, Instant};

/// Benchmark configuration
const ITERATIONS: usize = 200;
const WARMUP_ITERATIONS: usize = 20;

const CALC: &str = r#"
(module
  (import "rt.Math" "abs" (func $abs (param i32) (result i32)))
  (func (export "abs") (param i32) (result i32)
    local.get 0
    call $abs))
"#;

/// Sorted call latencies of one scenario
struct Samples(Vec<Duration>);

impl Samples {
    fn collect<F: FnMut()>(mut call: F) -> Self {
        for _ in 0..WARMUP_ITERATIONS {
            call();
        }
        let mut samples: Vec<Duration> = (0..ITERATIONS)
            .map(|_| {
                let start = Instant::now();
                call();
                start.elapsed()
            })
            .collect();
        samples.sort();
        Self(samples)
    }

    fn percentile(&self, p: f64) -> Duration {
        let idx = ((self.0.len() as f64 * p) as usize).min(self.0.len() - 1);
        self.0[idx]
    }
}

/// Print one scenario against its p50/p95 targets; true when both are met.
fn report(scenario: &str, samples: &Samples, p50_target: Duration, p95_target: Duration) -> bool {
    let (p50, p95) = (samples.percentile(0.50), samples.percentile(0.95));
    let passed = p50 < p50_target && p95 < p95_target;
    println!(
        "{:<22} p50 {:>10?} (<{:?})  p95 {:>10?} (<{:?})  {}",
        scenario,
        p50,
        p50_target,
        p95,
        p95_target,
        if passed { "PASS" } else { "FAIL" }
    );
    passed
}

fn restricted() -> CodePath {
    CodePath::new()
        .with_unit(CodeUnit::new("bench.Calc", CALC))
        .expect("fixture unit")
}

fn config(isolated: bool) -> SandboxConfig {
    SandboxConfig::default()
        .with_whitelist(Some(Whitelist::parse("rt.Math.*").expect("whitelist")))
        .with_static_state_isolation(isolated)
}

fn benchmark_call(isolated: bool) -> bool {
    let sandbox = Sandbox::new(&restricted(), &CodePath::new(), config(isolated)).expect("sandbox");
    let request = ExecutionRequest::new("bench.Calc", "abs").with_arg("i32", Value::I32(-7));
    let samples = Samples::collect(|| {
        let result = sandbox.run(&request).expect("run");
        assert!(result.is_success());
    });
    if isolated {
        report("Isolated call", &samples, Duration::from_millis(5), Duration::from_millis(20))
    } else {
        report("Shared-state call", &samples, Duration::from_millis(2), Duration::from_millis(10))
    }
}

/// Sandbox construction with the module cache already warm
fn benchmark_construction() -> bool {
    let path = restricted();
    let samples = Samples::collect(|| {
        Sandbox::new(&path, &CodePath::new(), config(true)).expect("sandbox");
    });
    report("Sandbox construction", &samples, Duration::from_millis(2), Duration::from_millis(10))
}

fn main() {
    println!("gradebox call latency, {} iterations after {} warmup", ITERATIONS, WARMUP_ITERATIONS);

    let outcomes = [
        benchmark_construction(),
        benchmark_call(true),
        benchmark_call(false),
    ];
    let failed = outcomes.iter().filter(|passed| !**passed).count();
    if failed > 0 {
        eprintln!("{} of {} scenarios missed their targets", failed, outcomes.len());
        std::process::exit(1);
    }
}
