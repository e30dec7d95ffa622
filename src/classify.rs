//! Exit-status classification for external process failures.
//!
//! A verdict separates file-specific failures (skip the file, keep
//! consuming the queue) from systemic ones (the whole host is in
//! trouble). Current policy records the verdict and always continues; the
//! `pause` action is kept for observability and failure records.

use crate::store::FailureCategory;
use serde::{Deserialize, Serialize};

/// How a child process ended, as seen by a pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitKind {
    /// Normal exit with a code; signal deaths arrive as `128 + signo`.
    Code(i32),
    /// The pipe to the child broke before an exit status was observed.
    PortError,
    /// The processor itself raised while driving the child.
    Exception,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    Pause,
    Continue,
}

#[derive(Debug, Clone)]
pub struct Verdict {
    pub action: Action,
    pub category: FailureCategory,
    pub code: String,
    pub message: &'static str,
}

/// Total over every exit kind: any integer code maps somewhere.
pub fn classify(kind: ExitKind) -> Verdict {
    match kind {
        ExitKind::PortError => Verdict {
            action: Action::Pause,
            category: FailureCategory::ProcessFailure,
            code: "PORT_ERROR".into(),
            message: "Lost the pipe to the child process",
        },
        ExitKind::Exception => Verdict {
            action: Action::Pause,
            category: FailureCategory::ProcessFailure,
            code: "EXCEPTION".into(),
            message: "Processor raised while handling the child process",
        },
        ExitKind::Code(code) => {
            let (action, category, message) = match code {
                137 => (
                    Action::Pause,
                    FailureCategory::ResourceExhaustion,
                    "Process killed by system (OOM)",
                ),
                143 => (
                    Action::Pause,
                    FailureCategory::ResourceExhaustion,
                    "Process terminated (SIGTERM)",
                ),
                2 => (
                    Action::Pause,
                    FailureCategory::Configuration,
                    "Invalid arguments",
                ),
                5 => (
                    Action::Pause,
                    FailureCategory::SystemEnvironment,
                    "I/O error",
                ),
                28 => (
                    Action::Pause,
                    FailureCategory::SystemEnvironment,
                    "No space left on device",
                ),
                110 => (Action::Pause, FailureCategory::Timeout, "Network timeout"),
                1 => (
                    Action::Continue,
                    FailureCategory::ProcessFailure,
                    "Standard encoding failure",
                ),
                13 => (
                    Action::Continue,
                    FailureCategory::FileAccess,
                    "Permission denied",
                ),
                22 => (
                    Action::Continue,
                    FailureCategory::Validation,
                    "Invalid file format",
                ),
                69 => (
                    Action::Continue,
                    FailureCategory::CodecIssues,
                    "Unsupported codec",
                ),
                234 => (
                    Action::Continue,
                    FailureCategory::CodecIssues,
                    "Audio channel layout error",
                ),
                _ => (
                    Action::Continue,
                    FailureCategory::Unknown,
                    "Unknown error (skipping file)",
                ),
            };
            Verdict {
                action,
                category,
                code: format!("EXIT_{}", code),
                message,
            }
        }
    }
}
