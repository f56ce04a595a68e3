// In-process sandbox behaviour over small WAT fixtures.

use gradebox::config::types::{InputMode, OutputMode, StreamModes};
use gradebox::{
    repeat, CodePath, CodeUnit, ExecutionRequest, Outcome, RepetitionConfig, Sandbox,
    SandboxConfig, SandboxError, Value, Whitelist,
};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

const CALC: &str = r#"
(module
  (import "rt.Math" "abs" (func $abs (param i32) (result i32)))
  (import "rt.Files" "<init>" (func $open (param i32 i32) (result i32)))
  (memory (export "memory") 1)
  (data (i32.const 0) "/etc/passwd")
  (func (export "abs") (param i32) (result i32)
    local.get 0
    call $abs)
  (func (export "open") (result i32)
    i32.const 0
    i32.const 11
    call $open))
"#;

const COUNTER: &str = r#"
(module
  (global $count (mut i32) (i32.const 0))
  (func (export "bump") (result i32)
    global.get $count
    i32.const 1
    i32.add
    global.set $count
    global.get $count))
"#;

const RUNAWAY: &str = r#"
(module
  (func (export "spin")
    (loop $forever
      br $forever)))
"#;

const HOG: &str = r#"
(module
  (memory 1)
  (func (export "grow") (result i32)
    i32.const 1000
    memory.grow))
"#;

const CHATTY: &str = r#"
(module
  (import "rt.Console" "println" (func $println (param i32 i32)))
  (import "rt.Console" "print_i32" (func $print_i32 (param i32)))
  (import "rt.Console" "eprintln" (func $eprintln (param i32 i32)))
  (import "rt.Console" "read_byte" (func $read_byte (result i32)))
  (memory (export "memory") 1)
  (data (i32.const 0) "hello")
  (data (i32.const 16) "oops")
  (func (export "greet")
    i32.const 0
    i32.const 5
    call $println
    i32.const 16
    i32.const 4
    call $eprintln)
  (func (export "echo") (param i32)
    local.get 0
    call $print_i32)
  (func (export "read") (result i32)
    call $read_byte))
"#;

// 130 prints of a full 64 KiB page overrun the 8 MiB capture bound
const FLOOD: &str = r#"
(module
  (import "rt.Console" "print" (func $print (param i32 i32)))
  (memory (export "memory") 1)
  (func (export "flood")
    (local $i i32)
    (loop $again
      i32.const 0
      i32.const 65536
      call $print
      local.get $i
      i32.const 1
      i32.add
      local.tee $i
      i32.const 130
      i32.lt_s
      br_if $again)))
"#;

const CHECKS: &str = r#"
(module
  (import "rt.Assert" "equals" (func $equals (param i32 i32)))
  (func (export "one_is_two")
    i32.const 1
    i32.const 2
    call $equals)
  (func (export "trap")
    unreachable))
"#;

fn restricted(name: &str, wat: &str) -> CodePath {
    CodePath::new().with_unit(CodeUnit::new(name, wat)).unwrap()
}

fn sandbox(name: &str, wat: &str, config: SandboxConfig) -> Sandbox {
    Sandbox::new(&restricted(name, wat), &CodePath::new(), config).unwrap()
}

fn math_only() -> SandboxConfig {
    SandboxConfig::default().with_whitelist(Some(Whitelist::parse("rt.Math.*").unwrap()))
}

#[test]
fn whitelisted_call_returns_its_value() {
    let sandbox = sandbox("student.Calc", CALC, math_only());
    let request = ExecutionRequest::new("student.Calc", "abs").with_arg("i32", Value::I32(-3));
    let result = sandbox.run(&request).unwrap();
    assert!(result.is_success());
    assert_eq!(result.value(), &Value::I32(3));
}

#[test]
fn denied_constructor_is_an_illegal_operation() {
    let sandbox = sandbox("student.Calc", CALC, math_only());
    let result = sandbox
        .run(&ExecutionRequest::new("student.Calc", "open"))
        .unwrap();
    assert!(result.is_illegal_operation());
    assert_eq!(result.violation(), "rt.Files.<init>(i32,i32)");
}

#[test]
fn static_state_is_fresh_per_call_when_isolated() {
    let isolated = sandbox("student.Counter", COUNTER, SandboxConfig::default());
    let request = ExecutionRequest::new("student.Counter", "bump");
    assert_eq!(isolated.run(&request).unwrap().value(), &Value::I32(1));
    assert_eq!(isolated.run(&request).unwrap().value(), &Value::I32(1));

    let shared = sandbox(
        "student.Counter",
        COUNTER,
        SandboxConfig::default().with_static_state_isolation(false),
    );
    assert_eq!(shared.run(&request).unwrap().value(), &Value::I32(1));
    assert_eq!(shared.run(&request).unwrap().value(), &Value::I32(2));
    assert_eq!(shared.run(&request).unwrap().value(), &Value::I32(3));
}

#[test]
fn infinite_loop_times_out() {
    let timeout = Duration::from_millis(200);
    let sandbox = sandbox(
        "student.Runaway",
        RUNAWAY,
        SandboxConfig::default().with_timeout(Some(timeout)),
    );
    let started = Instant::now();
    let result = sandbox
        .run(&ExecutionRequest::new("student.Runaway", "spin"))
        .unwrap();
    assert!(result.is_timeout());
    assert!(started.elapsed() < timeout + Duration::from_secs(3));

    // the sandbox stays usable after a kill
    let again = sandbox
        .run(&ExecutionRequest::new("student.Runaway", "spin"))
        .unwrap();
    assert!(again.is_timeout());
}

#[test]
fn memory_growth_past_limit_is_out_of_memory() {
    let sandbox = sandbox(
        "student.Hog",
        HOG,
        SandboxConfig::default().with_memory_limit(16 * 1024 * 1024),
    );
    let result = sandbox
        .run(&ExecutionRequest::new("student.Hog", "grow"))
        .unwrap();
    assert!(result.is_out_of_memory());
    assert_eq!(result.out_of_memory().type_name, "OutOfMemory");
}

#[test]
fn recorded_output_is_returned_with_the_result() {
    let streams = StreamModes {
        stdin: InputMode::Empty,
        stdout: OutputMode::Record,
        stderr: OutputMode::Record,
    };
    let sandbox = sandbox(
        "student.Chatty",
        CHATTY,
        SandboxConfig::default().with_streams(streams),
    );
    let result = sandbox
        .run(&ExecutionRequest::new("student.Chatty", "greet"))
        .unwrap();
    assert!(result.is_success());
    assert_eq!(result.stdout.as_deref(), Some("hello\n"));
    assert_eq!(result.stderr.as_deref(), Some("oops\n"));
    assert!(!result.output_truncated);

    let read = sandbox
        .run(&ExecutionRequest::new("student.Chatty", "read"))
        .unwrap();
    assert_eq!(read.value(), &Value::I32(-1));
}

#[test]
fn oversized_recording_is_flagged_truncated() {
    let streams = StreamModes {
        stdout: OutputMode::Record,
        ..StreamModes::default()
    };
    let sandbox = sandbox(
        "student.Flood",
        FLOOD,
        SandboxConfig::default().with_streams(streams),
    );
    let result = sandbox
        .run(&ExecutionRequest::new("student.Flood", "flood"))
        .unwrap();
    assert!(result.is_success());
    assert!(result.output_truncated);
    assert_eq!(result.stdout.map(|s| s.len()), Some(8 * 1024 * 1024));
}

#[test]
fn closed_stdin_raises_an_io_error() {
    let streams = StreamModes {
        stdin: InputMode::Closed,
        ..StreamModes::default()
    };
    let sandbox = sandbox(
        "student.Chatty",
        CHATTY,
        SandboxConfig::default().with_streams(streams),
    );
    let result = sandbox
        .run(&ExecutionRequest::new("student.Chatty", "read"))
        .unwrap();
    assert!(result.is_exception());
    assert_eq!(result.exception().type_name, "IOError");
}

#[test]
fn concurrent_recordings_stay_separate() {
    let streams = StreamModes {
        stdout: OutputMode::Record,
        ..StreamModes::default()
    };
    let sandbox = Arc::new(sandbox(
        "student.Chatty",
        CHATTY,
        SandboxConfig::default().with_streams(streams),
    ));

    let handles: Vec<_> = (0..8)
        .map(|n| {
            let sandbox = sandbox.clone();
            thread::spawn(move || {
                for _ in 0..10 {
                    let request = ExecutionRequest::new("student.Chatty", "echo")
                        .with_arg("i32", Value::I32(n));
                    let result = sandbox.run(&request).unwrap();
                    assert_eq!(result.stdout.as_deref(), Some(n.to_string().as_str()));
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }
}

#[test]
fn guest_failures_are_exceptions() {
    let sandbox = sandbox("student.Checks", CHECKS, SandboxConfig::default());
    let failed = sandbox
        .run(&ExecutionRequest::new("student.Checks", "one_is_two"))
        .unwrap();
    assert_eq!(failed.exception().type_name, "AssertionError");
    assert_eq!(failed.exception().message, "expected 1 but was 2");

    let trapped = sandbox
        .run(&ExecutionRequest::new("student.Checks", "trap"))
        .unwrap();
    assert_eq!(trapped.exception().type_name, "Trap");
}

#[test]
fn structural_errors_are_not_results() {
    let sandbox = sandbox("student.Calc", CALC, math_only());
    assert!(matches!(
        sandbox.run(&ExecutionRequest::new("student.Missing", "abs")),
        Err(SandboxError::EntryTypeNotFound(_))
    ));
    assert!(matches!(
        sandbox.run(&ExecutionRequest::new("student.Calc", "missing")),
        Err(SandboxError::EntryMemberNotFound { .. })
    ));
    assert!(matches!(
        Sandbox::new(
            &restricted("student.Broken", "(module (func"),
            &CodePath::new(),
            SandboxConfig::default()
        ),
        Err(SandboxError::InvalidUnit { .. })
    ));
}

#[test]
fn stable_operation_repeats_deterministically() {
    let sandbox = sandbox("student.Calc", CALC, math_only());
    let request = ExecutionRequest::new("student.Calc", "abs").with_arg("i32", Value::I32(-5));
    let config = RepetitionConfig {
        repetitions: 4,
        ..RepetitionConfig::default()
    };
    let outcome = repeat(&sandbox, &request, &config).unwrap();
    assert!(outcome.passed);
    assert!(!outcome.non_deterministic);
    assert_eq!(outcome.repetitions_completed, 4);

    let denied = repeat(&sandbox, &ExecutionRequest::new("student.Calc", "open"), &config).unwrap();
    assert!(!denied.passed);
    assert_eq!(denied.illegal_operations, vec!["rt.Files.<init>(i32,i32)".to_string()]);
}

#[test]
fn unrestricted_sandbox_links_everything() {
    let sandbox = sandbox("student.Checks", CHECKS, SandboxConfig::unrestricted());
    let result = sandbox
        .run(&ExecutionRequest::new("student.Checks", "one_is_two"))
        .unwrap();
    assert!(matches!(result.outcome, Outcome::Exception(_)));
}
