/*!
   Error type used for the tests.

   Errors are defined with [`flex_error`] so that each failure carries a
   structured detail that can be inspected through [`Error::kind`], while
   untyped failures from lower layers are wrapped as [`eyre::Report`].
*/

use core::fmt;
use core::time::Duration;
use eyre::Report;
use flex_error::{define_error, DisplayOnly, ErrorMessageTracer, TraceError};
use std::io::{Error as IoError, ErrorKind as IoErrorKind};

use crate::relayer::path::PathState;
use crate::types::token::Amount;

define_error! {
    #[derive(Debug, Clone)]
    Error {
        Generic
            [ TraceError<Report> ]
            | _ | { "generic error" },

        Assertion
            { message: String }
            | e | { format_args!("assertion failure: {}", e.message) },

        Io
            [ TraceError<IoError> ]
            | _ | { "io error"},

        CommandNotFound
            { command: String }
            [ TraceError<IoError> ]
            | e | { format_args!("failed to execute command: {}. make sure it is available in $PATH", e.command) },

        ConfigInvalid
            { reason: String }
            | e | { format_args!("invalid configuration: {}", e.reason) },

        UnknownFamily
            { chain_name: String }
            | e | { format_args!("no chain family known for chain `{}` and none was given", e.chain_name) },

        ImageUnavailable
            { image: String, reason: String }
            | e | { format_args!("container image {} is unavailable: {}", e.image, e.reason) },

        RuntimeUnavailable
            { reason: String }
            | e | { format_args!("container runtime is unavailable: {}", e.reason) },

        ContainerNotFound
            { container: String }
            | e | { format_args!("container or resource `{}` not found", e.container) },

        ContainerConflict
            { container: String }
            | e | { format_args!("container or resource `{}` already exists", e.container) },

        Exec
            {
                container: String,
                command: String,
                exit_code: i64,
                stderr: String,
            }
            | e | {
                format_args!("command `{}` in container {} exited with status {}: {}",
                    e.command, e.container, e.exit_code, e.stderr)
            },

        Readiness
            {
                chain: String,
                node: String,
                reason: String,
                log_tail: String,
            }
            | e | {
                format_args!("node {} of chain {} failed to become ready: {}\n--- last container logs ---\n{}",
                    e.node, e.chain, e.reason, e.log_tail)
            },

        HeightStalled
            { chain: String, node: String, height: u64 }
            | e | {
                format_args!("height of node {} on chain {} stalled at {}",
                    e.node, e.chain, e.height)
            },

        FundingMismatch
            {
                chain: String,
                key_name: String,
                expected: Amount,
                actual: Amount,
            }
            | e | {
                format_args!("funded wallet {} on chain {} has balance {} but expected {}",
                    e.key_name, e.chain, e.actual, e.expected)
            },

        TxRejected
            { chain: String, code: u64, raw_log: String }
            | e | {
                format_args!("transaction on chain {} was rejected with code {}: {}",
                    e.chain, e.code, e.raw_log)
            },

        MemoTooLong
            { chain: String, length: usize, max: usize }
            | e | {
                format_args!("memo of {} bytes exceeds the maximum of {} bytes supported by chain {}",
                    e.length, e.max, e.chain)
            },

        InsufficientFunds
            { chain: String, address: String, required: Amount, available: Amount }
            | e | {
                format_args!("address {} on chain {} has {} spendable but {} is required",
                    e.address, e.chain, e.available, e.required)
            },

        KeyNotFound
            { chain: String, key_name: String }
            | e | { format_args!("key `{}` not found in keyring of chain {}", e.key_name, e.chain) },

        UnsupportedCapability
            { chain: String, capability: String }
            | e | { format_args!("chain {} does not support {}", e.chain, e.capability) },

        RelayerStuck
            { path: String, state: PathState, reason: String }
            | e | {
                format_args!("relayer path `{}` failed in state {}: {}",
                    e.path, e.state, e.reason)
            },

        Timeout
            { operation: String, duration: Duration }
            | e | {
                format_args!("operation `{}` timed out after {:?}", e.operation, e.duration)
            },

        PollTimeout
            { description: String, seconds: u64 }
            | e | {
                format_args!("{} did not happen within {} seconds", e.description, e.seconds)
            },

        Cancelled
            { operation: String }
            | e | { format_args!("operation `{}` was cancelled", e.operation) },

        CleanupPartial
            { failures: Vec<String> }
            | e | {
                format_args!("{} cleanup step(s) failed: [{}]",
                    e.failures.len(), e.failures.join("; "))
            },

        Aggregate
            { primary_kind: ErrorKind, failures: Vec<String> }
            | e | {
                format_args!("{} concurrent operation(s) failed: [{}]",
                    e.failures.len(), e.failures.join("; "))
            },

        CleanupAfterFailure
            { primary_kind: ErrorKind, failures: Vec<String> }
            [ DisplayOnly<Error> ]
            | e | {
                format_args!("test failed and {} cleanup step(s) also failed: [{}]",
                    e.failures.len(), e.failures.join("; "))
            },
    }
}

/**
   Coarse classification of an [`Error`], independent of the concrete
   variant that produced it.
*/
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    ConfigInvalid,
    ImageUnavailable,
    RuntimeUnavailable,
    Readiness,
    HeightStalled,
    FundingMismatch,
    TxRejected,
    RelayerStuck,
    Timeout,
    PollTimeout,
    CleanupPartial,
    Cancelled,
    Assertion,
    Other,
}

/// The engine component an error originated from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Component {
    Broker,
    ChainDriver,
    RelayerDriver,
    Factory,
    Assembler,
    Scenario,
    Supervisor,
}

/**
   Process exit status for binaries embedding the framework.
*/
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitStatus {
    Success = 0,
    AssertionFailure = 1,
    EngineFailure = 2,
    CleanupFailure = 3,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self.detail() {
            ErrorDetail::ConfigInvalid(_)
            | ErrorDetail::UnknownFamily(_)
            | ErrorDetail::MemoTooLong(_)
            | ErrorDetail::UnsupportedCapability(_) => ErrorKind::ConfigInvalid,
            ErrorDetail::ImageUnavailable(_) => ErrorKind::ImageUnavailable,
            ErrorDetail::RuntimeUnavailable(_) | ErrorDetail::CommandNotFound(_) => {
                ErrorKind::RuntimeUnavailable
            }
            ErrorDetail::Readiness(_) => ErrorKind::Readiness,
            ErrorDetail::HeightStalled(_) => ErrorKind::HeightStalled,
            ErrorDetail::FundingMismatch(_) | ErrorDetail::InsufficientFunds(_) => {
                ErrorKind::FundingMismatch
            }
            ErrorDetail::TxRejected(_) => ErrorKind::TxRejected,
            ErrorDetail::RelayerStuck(_) => ErrorKind::RelayerStuck,
            ErrorDetail::Timeout(_) => ErrorKind::Timeout,
            ErrorDetail::PollTimeout(_) => ErrorKind::PollTimeout,
            ErrorDetail::CleanupPartial(_) => ErrorKind::CleanupPartial,
            ErrorDetail::CleanupAfterFailure(e) => e.primary_kind,
            ErrorDetail::Aggregate(e) => e.primary_kind,
            ErrorDetail::Cancelled(_) => ErrorKind::Cancelled,
            ErrorDetail::Assertion(_) => ErrorKind::Assertion,
            _ => ErrorKind::Other,
        }
    }

    pub fn component(&self) -> Component {
        match self.detail() {
            ErrorDetail::ImageUnavailable(_)
            | ErrorDetail::RuntimeUnavailable(_)
            | ErrorDetail::CommandNotFound(_)
            | ErrorDetail::ContainerNotFound(_)
            | ErrorDetail::ContainerConflict(_)
            | ErrorDetail::Exec(_) => Component::Broker,
            ErrorDetail::ConfigInvalid(_) | ErrorDetail::UnknownFamily(_) => Component::Factory,
            ErrorDetail::RelayerStuck(_) => Component::RelayerDriver,
            ErrorDetail::CleanupPartial(_) | ErrorDetail::CleanupAfterFailure(_) => {
                Component::Supervisor
            }
            ErrorDetail::PollTimeout(_) | ErrorDetail::Assertion(_) => Component::Scenario,
            ErrorDetail::Generic(_) | ErrorDetail::Io(_) | ErrorDetail::Aggregate(_) => {
                Component::Assembler
            }
            _ => Component::ChainDriver,
        }
    }

    pub fn exit_status(&self) -> ExitStatus {
        match self.detail() {
            ErrorDetail::CleanupPartial(_) => ExitStatus::CleanupFailure,
            _ => match self.kind() {
                ErrorKind::Assertion => ExitStatus::AssertionFailure,
                _ => ExitStatus::EngineFailure,
            },
        }
    }

    /**
       Attach cleanup failures to a primary error. The primary error
       stays the reported cause, and its kind is preserved.
    */
    pub fn with_cleanup_failure(self, cleanup: Error) -> Error {
        let failures = match cleanup.detail() {
            ErrorDetail::CleanupPartial(e) => e.failures.clone(),
            _ => vec![cleanup.to_string()],
        };

        let primary_kind = self.kind();
        Error::cleanup_after_failure(primary_kind, failures, self)
    }
}

/**
   Gather the results of tasks that ran side by side.

   All values are returned in order when every task succeeded. A single
   failure is returned as is. Several failures are combined into one
   `Aggregate` error listing each of them, classified by the first.
*/
pub fn collect_results<T>(
    results: impl IntoIterator<Item = Result<T, Error>>,
) -> Result<Vec<T>, Error> {
    let mut values = Vec::new();
    let mut errors = Vec::new();

    for result in results {
        match result {
            Ok(value) => values.push(value),
            Err(e) => errors.push(e),
        }
    }

    let mut errors = errors.into_iter();

    match (errors.next(), errors.len()) {
        (None, _) => Ok(values),
        (Some(e), 0) => Err(e),
        (Some(first), _) => {
            let primary_kind = first.kind();
            let failures = core::iter::once(first)
                .chain(errors)
                .map(|e| e.to_string())
                .collect();

            Err(Error::aggregate(primary_kind, failures))
        }
    }
}

impl ExitStatus {
    pub fn code(self) -> i32 {
        self as i32
    }

    pub fn from_result<T>(result: &Result<T, Error>) -> Self {
        match result {
            Ok(_) => ExitStatus::Success,
            Err(e) => e.exit_status(),
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

impl Clone for Error {
    fn clone(&self) -> Self {
        Error(self.detail().clone(), ErrorMessageTracer::new_message(self))
    }
}

pub fn handle_generic_error(e: impl Into<Report>) -> Error {
    Error::generic(e.into())
}

pub fn handle_exec_error(command: &str) -> impl FnOnce(IoError) -> Error + '_ {
    |e| match e.kind() {
        IoErrorKind::NotFound => Error::command_not_found(command.to_string(), e),
        _ => Error::io(e),
    }
}

impl From<Report> for Error {
    fn from(e: Report) -> Self {
        Error::generic(e)
    }
}

impl From<IoError> for Error {
    fn from(e: IoError) -> Self {
        Error::io(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cleanup_failure_keeps_primary_kind() {
        let primary = Error::readiness(
            "chainA".into(),
            "val-0".into(),
            "container exited".into(),
            "".into(),
        );
        let cleanup = Error::cleanup_partial(vec!["remove network: not found".into()]);

        let combined = primary.with_cleanup_failure(cleanup);

        assert_eq!(combined.kind(), ErrorKind::Readiness);
        assert_eq!(combined.exit_status(), ExitStatus::EngineFailure);
        assert!(combined.to_string().contains("remove network"));
    }

    #[test]
    fn concurrent_failures_are_all_reported() {
        let results: Vec<Result<u8, Error>> = vec![
            Ok(1),
            Err(Error::readiness("alpha-1".into(), "val-0".into(), "exited".into(), "".into())),
            Err(Error::config_invalid("beta-1 has no image".into())),
        ];

        let err = collect_results(results).unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Readiness);
        assert_eq!(err.component(), Component::Assembler);
        assert!(err.to_string().contains("2 concurrent operation(s) failed"));
        assert!(err.to_string().contains("alpha-1"));
        assert!(err.to_string().contains("beta-1"));

        let single = collect_results(vec![Ok(1), Err(Error::assertion("only".into()))]);
        assert_eq!(single.unwrap_err().kind(), ErrorKind::Assertion);

        assert_eq!(collect_results(vec![Ok::<_, Error>(1), Ok(2)]).unwrap(), vec![1, 2]);
    }

    #[test]
    fn exit_codes() {
        let ok: Result<(), Error> = Ok(());
        assert_eq!(ExitStatus::from_result(&ok).code(), 0);

        let assertion: Result<(), Error> = Err(Error::assertion("balance".into()));
        assert_eq!(ExitStatus::from_result(&assertion).code(), 1);

        let engine: Result<(), Error> = Err(Error::config_invalid("no chains".into()));
        assert_eq!(ExitStatus::from_result(&engine).code(), 2);

        let cleanup: Result<(), Error> = Err(Error::cleanup_partial(vec!["x".into()]));
        assert_eq!(ExitStatus::from_result(&cleanup).code(), 3);
    }
}
