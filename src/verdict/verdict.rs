/// Outcome classification
/// Maps whatever a guest invocation raised onto exactly one [`Outcome`].
/// Pure function of the error chain: no clocks, no global state.
use crate::config::types::{ExceptionDescriptor, Outcome};
use crate::runtime::traps::{GuestException, Interrupted, PermissionViolation, ResourceExhausted};
use wasmtime::{MemoryAccessError, Trap, WasmBacktrace};

/// Frames kept from a guest backtrace
const MAX_FRAMES: usize = 64;

/// Verdict classifier - pure function over the raised error
pub struct VerdictClassifier;

impl VerdictClassifier {
    /// Classify a raised error. Precedence: permission, memory, interruption,
    /// host-raised exceptions, traps, anything else.
    pub fn classify(error: &anyhow::Error) -> Outcome {
        if let Some(violation) = error.downcast_ref::<PermissionViolation>() {
            return Outcome::IllegalOperation(violation.0.clone());
        }

        let frames = Self::frames(error);

        if let Some(exhausted) = error.downcast_ref::<ResourceExhausted>() {
            return Outcome::OutOfMemory(
                ExceptionDescriptor::new("OutOfMemory", exhausted.to_string()).with_frames(frames),
            );
        }

        if error.downcast_ref::<Interrupted>().is_some() {
            return Outcome::Timeout;
        }

        if let Some(raised) = error.downcast_ref::<GuestException>() {
            return Outcome::Exception(
                ExceptionDescriptor::new(raised.type_name.clone(), raised.message.clone())
                    .with_frames(frames),
            );
        }

        if let Some(trap) = error.downcast_ref::<Trap>() {
            return match trap {
                Trap::Interrupt => Outcome::Timeout,
                Trap::StackOverflow => Outcome::Exception(
                    ExceptionDescriptor::new("StackOverflow", trap.to_string()).with_frames(frames),
                ),
                other => Outcome::Exception(
                    ExceptionDescriptor::new("Trap", other.to_string()).with_frames(frames),
                ),
            };
        }

        if let Some(access) = error.downcast_ref::<MemoryAccessError>() {
            return Outcome::Exception(
                ExceptionDescriptor::new("Trap", access.to_string()).with_frames(frames),
            );
        }

        Outcome::Exception(
            ExceptionDescriptor::new("LinkageError", format!("{:#}", error)).with_frames(frames),
        )
    }

    /// Guest frames, innermost first
    pub fn frames(error: &anyhow::Error) -> Vec<String> {
        match error.downcast_ref::<WasmBacktrace>() {
            Some(trace) => trace
                .frames()
                .iter()
                .take(MAX_FRAMES)
                .map(|frame| match frame.func_name() {
                    Some(name) => name.to_string(),
                    None => format!("<wasm function {}>", frame.func_index()),
                })
                .collect(),
            None => Vec::new(),
        }
    }

    /// Whether an outcome counts as a pass for repetition purposes
    pub fn is_pass(outcome: &Outcome) -> bool {
        matches!(outcome, Outcome::Success(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_permission_violation_is_illegal_operation() {
        let err: anyhow::Error = PermissionViolation("rt.Files.<init>(i32,i32)".into()).into();
        assert_eq!(
            VerdictClassifier::classify(&err),
            Outcome::IllegalOperation("rt.Files.<init>(i32,i32)".into())
        );
    }

    #[test]
    fn test_context_does_not_hide_cause() {
        let err = anyhow::Error::from(ResourceExhausted {
            requested: 10,
            limit: 5,
        })
        .context("while growing memory");
        match VerdictClassifier::classify(&err) {
            Outcome::OutOfMemory(cause) => assert_eq!(cause.type_name, "OutOfMemory"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_interrupt_is_timeout() {
        assert_eq!(
            VerdictClassifier::classify(&Interrupted.into()),
            Outcome::Timeout
        );
        assert_eq!(
            VerdictClassifier::classify(&Trap::Interrupt.into()),
            Outcome::Timeout
        );
    }

    #[test]
    fn test_guest_exception_keeps_type_and_message() {
        let err: anyhow::Error = GuestException::new("AssertionError", "expected 1 but was 2").into();
        let outcome = VerdictClassifier::classify(&err);
        assert_eq!(
            outcome,
            Outcome::Exception(ExceptionDescriptor::new(
                "AssertionError",
                "expected 1 but was 2"
            ))
        );
        assert!(!VerdictClassifier::is_pass(&outcome));
    }

    #[test]
    fn test_traps() {
        match VerdictClassifier::classify(&Trap::StackOverflow.into()) {
            Outcome::Exception(cause) => assert_eq!(cause.type_name, "StackOverflow"),
            other => panic!("unexpected {:?}", other),
        }
        match VerdictClassifier::classify(&Trap::IntegerDivisionByZero.into()) {
            Outcome::Exception(cause) => assert_eq!(cause.type_name, "Trap"),
            other => panic!("unexpected {:?}", other),
        }
        match VerdictClassifier::classify(&anyhow::anyhow!("incompatible import")) {
            Outcome::Exception(cause) => assert_eq!(cause.type_name, "LinkageError"),
            other => panic!("unexpected {:?}", other),
        }
    }
}
