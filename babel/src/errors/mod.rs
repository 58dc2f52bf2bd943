// Copyright 2021-2023 Protocol Labs
// SPDX-License-Identifier: Apache-2.0, MIT

//! Execution errors.
//!
//! Operations inside the core return [`ExecutionError`], which splits the
//! world in two: typed, locally returnable failures carrying a stable
//! [`ErrorCode`], and fatal errors that cannot be handled in place. The
//! classification traits let call sites convert foreign errors without
//! spelling the variants out at every `?`.

use babel_shared::error::ErrorCode;

/// Execution result.
pub type Result<T> = std::result::Result<T, ExecutionError>;

/// A typed failure: a human message plus the stable code reported across
/// the external surface. The message must not leak policy internals or
/// identity secrets; it describes the failing operation, not the rule that
/// failed it.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{0} ({1})")]
pub struct CallError(pub String, pub ErrorCode);

impl CallError {
    pub fn new(code: ErrorCode, msg: impl Into<String>) -> Self {
        CallError(msg.into(), code)
    }

    pub fn message(&self) -> &str {
        &self.0
    }

    pub fn code(&self) -> ErrorCode {
        self.1
    }
}

/// Construct a [`CallError`] with the given code and format-string message.
///
/// ```ignore
/// return Err(call_error!(UnknownLanguage; "no bridge for {}", lang).into());
/// ```
#[macro_export]
macro_rules! call_error {
    ($code:ident) => {
        $crate::errors::CallError(
            String::new(),
            babel_shared::error::ErrorCode::$code,
        )
    };
    ($code:ident; $msg:literal $(, $ex:expr)* $(,)?) => {
        $crate::errors::CallError(
            format!($msg $(, $ex)*),
            babel_shared::error::ErrorCode::$code,
        )
    };
}

/// An error during execution: either a typed failure the caller can match
/// on, or a fatal condition that poisons the affected component.
#[derive(Debug, thiserror::Error)]
pub enum ExecutionError {
    #[error(transparent)]
    Failure(#[from] CallError),
    #[error("fatal error: {0:#}")]
    Fatal(anyhow::Error),
}

impl ExecutionError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, ExecutionError::Fatal(_))
    }

    /// The stable code. Fatal errors report `InternalInvariantViolated`
    /// unless promoted through [`ExecutionError::promote`].
    pub fn code(&self) -> ErrorCode {
        match self {
            ExecutionError::Failure(e) => e.code(),
            ExecutionError::Fatal(_) => ErrorCode::InternalInvariantViolated,
        }
    }

    /// Promote a typed failure to a fatal error with the given code folded
    /// into the message, preserving the underlying cause. Used when a
    /// recovery path itself fails.
    pub fn promote(self, code: ErrorCode) -> ExecutionError {
        match self {
            ExecutionError::Failure(CallError(msg, original)) => ExecutionError::Fatal(
                anyhow::anyhow!("{msg} (was {original})").context(code.name().to_owned()),
            ),
            fatal => fatal,
        }
    }

    /// The message shown at the external surface.
    pub fn message(&self) -> String {
        match self {
            ExecutionError::Failure(e) => e.message().to_owned(),
            // Fatal chains are for operators; external callers get the
            // code only.
            ExecutionError::Fatal(_) => "internal error".to_owned(),
        }
    }
}

impl From<anyhow::Error> for ExecutionError {
    fn from(e: anyhow::Error) -> Self {
        ExecutionError::Fatal(e)
    }
}

/// Extension for classifying foreign results into execution errors.
pub trait ClassifyResult: Sized {
    type Value;
    type Error;

    /// Classify the error as fatal.
    fn or_fatal(self) -> Result<Self::Value>
    where
        Self::Error: Into<anyhow::Error>;

    /// Classify the error as a typed failure with the given code; the
    /// foreign error's display becomes the message.
    fn or_error(self, code: ErrorCode) -> Result<Self::Value>
    where
        Self::Error: std::fmt::Display;

    fn or_illegal_argument(self) -> Result<Self::Value>
    where
        Self::Error: std::fmt::Display,
    {
        self.or_error(ErrorCode::InvalidParameter)
    }
}

impl<T, E> ClassifyResult for std::result::Result<T, E> {
    type Value = T;
    type Error = E;

    fn or_fatal(self) -> Result<T>
    where
        E: Into<anyhow::Error>,
    {
        self.map_err(|e| ExecutionError::Fatal(e.into()))
    }

    fn or_error(self, code: ErrorCode) -> Result<T>
    where
        E: std::fmt::Display,
    {
        self.map_err(|e| CallError(e.to_string(), code).into())
    }
}

/// Extension for attaching context to execution errors without disturbing
/// their classification.
pub trait Context {
    fn context<D: std::fmt::Display>(self, context: D) -> Self;
    fn with_context<D: std::fmt::Display, F: FnOnce() -> D>(self, f: F) -> Self;
}

impl<T> Context for Result<T> {
    fn context<D: std::fmt::Display>(self, context: D) -> Self {
        self.map_err(|e| match e {
            ExecutionError::Failure(CallError(msg, code)) => {
                CallError(format!("{context}: {msg}"), code).into()
            }
            ExecutionError::Fatal(e) => ExecutionError::Fatal(e.context(context.to_string())),
        })
    }

    fn with_context<D: std::fmt::Display, F: FnOnce() -> D>(self, f: F) -> Self {
        self.context(f())
    }
}
