// Licensed to the Apache Software Foundation (ASF) under one
// or more contributor license agreements.  See the NOTICE file
// distributed with this work for additional information
// regarding copyright ownership.  The ASF licenses this file
// to you under the Apache License, Version 2.0 (the
// "License"); you may not use this file except in compliance
// with the License.  You may obtain a copy of the License at
//
//   http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing,
// software distributed under the License is distributed on an
// "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied.  See the License for the
// specific language governing permissions and limitations
// under the License.
//! Typed execution errors.
//!
//! Responsibilities:
//! - Defines the error taxonomy surfaced by operators, drivers and the hash-join build/probe phases.
//! - Keeps the out-of-memory condition distinct from generic failures so callers can match on it.
//!
//! Key exported interfaces:
//! - Types: `ExecError`, `ExecResult`, `JoinPhase`.

use std::fmt;
use std::sync::Arc;

use arrow::error::ArrowError;
use thiserror::Error;

/// Result alias used across the execution core.
pub type ExecResult<T> = Result<T, ExecError>;

/// Join phase an error is attributed to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JoinPhase {
    Build,
    Probe,
}

impl fmt::Display for JoinPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JoinPhase::Build => f.write_str("build"),
            JoinPhase::Probe => f.write_str("probe"),
        }
    }
}

/// Execution error taxonomy.
///
/// Errors are cloneable because the first failure of a task is recorded once in the
/// shared runtime state and then observed by every live driver of that task.
#[derive(Clone, Debug, Error)]
pub enum ExecError {
    /// A reservation would push a tracker past its hard limit.
    #[error(
        "Query exceeded local memory limit of {limit} bytes (tracker={label}, consumption={consumption}, requested={requested})"
    )]
    MemLimitExceeded {
        label: String,
        limit: i64,
        consumption: i64,
        requested: i64,
    },

    /// Probe and build key specifications do not agree.
    #[error("join specification mismatch: {0}")]
    JoinSpec(String),

    /// The hash build did not publish a lookup source.
    #[error("hash build failed for {join}: {cause}")]
    BuildFailed { join: String, cause: Box<ExecError> },

    #[error("execution cancelled: {0}")]
    Cancelled(String),

    #[error("internal error: {0}")]
    Internal(String),

    #[error("arrow error: {0}")]
    Arrow(#[source] Arc<ArrowError>),

    /// Wraps an error with the join phase that triggered it.
    #[error("{source} (join phase: {phase})")]
    Join {
        phase: JoinPhase,
        #[source]
        source: Box<ExecError>,
    },
}

impl ExecError {
    pub fn internal(msg: impl Into<String>) -> Self {
        ExecError::Internal(msg.into())
    }

    pub fn join_spec(msg: impl Into<String>) -> Self {
        ExecError::JoinSpec(msg.into())
    }

    /// Tag this error with a join phase. Already tagged errors keep their original phase.
    pub fn in_phase(self, phase: JoinPhase) -> Self {
        match self {
            ExecError::Join { .. } => self,
            other => ExecError::Join {
                phase,
                source: Box::new(other),
            },
        }
    }

    /// Phase this error was attributed to, if any.
    pub fn phase(&self) -> Option<JoinPhase> {
        match self {
            ExecError::Join { phase, .. } => Some(*phase),
            ExecError::BuildFailed { cause, .. } => cause.phase(),
            _ => None,
        }
    }

    /// Innermost error with phase and build-failure wrappers removed.
    pub fn root_cause(&self) -> &ExecError {
        match self {
            ExecError::Join { source, .. } => source.root_cause(),
            ExecError::BuildFailed { cause, .. } => cause.root_cause(),
            other => other,
        }
    }

    pub fn is_mem_limit_exceeded(&self) -> bool {
        matches!(self.root_cause(), ExecError::MemLimitExceeded { .. })
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self.root_cause(), ExecError::Cancelled(_))
    }
}

impl From<ArrowError> for ExecError {
    fn from(err: ArrowError) -> Self {
        ExecError::Arrow(Arc::new(err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn oom() -> ExecError {
        ExecError::MemLimitExceeded {
            label: "task".to_string(),
            limit: 100,
            consumption: 80,
            requested: 64,
        }
    }

    #[test]
    fn mem_limit_message_names_limit_and_usage() {
        let msg = oom().to_string();
        assert!(msg.starts_with("Query exceeded local memory limit of 100 bytes"), "{msg}");
        assert!(msg.contains("consumption=80"), "{msg}");
    }

    #[test]
    fn phase_tag_is_sticky_and_transparent() {
        let err = oom().in_phase(JoinPhase::Build).in_phase(JoinPhase::Probe);
        assert_eq!(err.phase(), Some(JoinPhase::Build));
        assert!(err.is_mem_limit_exceeded());
        assert!(err.to_string().starts_with("Query exceeded local memory limit of"));
        assert!(err.to_string().ends_with("(join phase: build)"));
    }

    #[test]
    fn build_failure_exposes_root_cause() {
        let err = ExecError::BuildFailed {
            join: "HASH_JOIN (id=1)".to_string(),
            cause: Box::new(oom().in_phase(JoinPhase::Build)),
        };
        assert!(err.is_mem_limit_exceeded());
        assert_eq!(err.phase(), Some(JoinPhase::Build));
        assert!(!err.is_cancelled());
    }
}
