// Copyright 2021-2023 Protocol Labs
// SPDX-License-Identifier: Apache-2.0, MIT

use std::fmt::{Display, Formatter, Result};

use babel_shared::error::ErrorCode;

/// A call trace records the call contexts a failure propagated through,
/// from the failing call at the bottom to the entry call at the top. The
/// original failure is the _cause_.
#[derive(Debug, Default, Clone)]
pub struct CallTrace {
    /// Innermost first.
    pub frames: Vec<Frame>,
    pub cause: Option<Cause>,
}

impl Display for CallTrace {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result {
        for (i, frame) in self.frames.iter().enumerate() {
            writeln!(f, "{:02}: {}", i, frame)?;
        }
        if let Some(cause) = &self.cause {
            writeln!(f, "--> caused by: {}", cause)?;
        }
        Ok(())
    }
}

impl CallTrace {
    pub fn is_empty(&self) -> bool {
        self.frames.is_empty() && self.cause.is_none()
    }
}

/// One call context a failure crossed.
#[derive(Clone, Debug)]
pub struct Frame {
    pub language: String,
    pub function: String,
    pub code: ErrorCode,
}

impl Display for Frame {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result {
        write!(f, "{}::{} -- {}", self.language, self.function, self.code)
    }
}

/// The original failure underneath the frames.
#[derive(Clone, Debug)]
pub enum Cause {
    /// A typed failure returned by a bridge or subsystem.
    Error { code: ErrorCode, message: String },
    /// A fatal error; only its display survives, the chain goes to the
    /// operator log.
    Fatal { message: String },
}

impl Display for Cause {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result {
        match self {
            Cause::Error { code, message } => write!(f, "{}: {}", code, message),
            Cause::Fatal { message } => write!(f, "[FATAL] {}", message),
        }
    }
}
