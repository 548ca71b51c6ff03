//! Judge status codes shared with the backend over the result queue.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::sandbox::SandboxStatus;

/// Outcome of judging, per testcase and overall.
///
/// The integer codes are the wire representation on the task and result
/// queues and must stay stable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum JudgeStatus {
    Pending = 0,
    RunningJudge = 1,
    CompileError = 2,
    Accepted = 3,
    RuntimeError = 4,
    WrongAnswer = 5,
    TimeLimitExceeded = 6,
    MemoryLimitExceeded = 7,
    OutputLimitExceeded = 8,
    PresentationError = 9,
    SystemError = 10,
    RejudgePending = 11,
    Skipped = 12,
}

impl JudgeStatus {
    /// Overall-verdict priority: the first status found among the testcase
    /// results becomes the submission verdict.
    pub const PRIORITY: [JudgeStatus; 7] = [
        JudgeStatus::SystemError,
        JudgeStatus::OutputLimitExceeded,
        JudgeStatus::MemoryLimitExceeded,
        JudgeStatus::TimeLimitExceeded,
        JudgeStatus::RuntimeError,
        JudgeStatus::WrongAnswer,
        JudgeStatus::PresentationError,
    ];

    /// Map a non-Accepted sandbox run status to the testcase verdict.
    pub fn from_run_status(status: SandboxStatus) -> Self {
        match status {
            SandboxStatus::MemoryLimitExceeded => JudgeStatus::MemoryLimitExceeded,
            SandboxStatus::TimeLimitExceeded => JudgeStatus::TimeLimitExceeded,
            SandboxStatus::OutputLimitExceeded => JudgeStatus::OutputLimitExceeded,
            SandboxStatus::NonzeroExitStatus | SandboxStatus::Signalled => {
                JudgeStatus::RuntimeError
            }
            _ => JudgeStatus::SystemError,
        }
    }

    /// Whether this verdict marks the remaining testcases as skipped.
    ///
    /// Only hard limit breaches skip: a SystemError is our fault, not the
    /// program's, and must not suppress the other testcases.
    pub fn skips_remaining(self) -> bool {
        matches!(
            self,
            JudgeStatus::TimeLimitExceeded
                | JudgeStatus::MemoryLimitExceeded
                | JudgeStatus::OutputLimitExceeded
        )
    }
}

impl From<JudgeStatus> for u8 {
    fn from(status: JudgeStatus) -> u8 {
        status as u8
    }
}

impl TryFrom<u8> for JudgeStatus {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(JudgeStatus::Pending),
            1 => Ok(JudgeStatus::RunningJudge),
            2 => Ok(JudgeStatus::CompileError),
            3 => Ok(JudgeStatus::Accepted),
            4 => Ok(JudgeStatus::RuntimeError),
            5 => Ok(JudgeStatus::WrongAnswer),
            6 => Ok(JudgeStatus::TimeLimitExceeded),
            7 => Ok(JudgeStatus::MemoryLimitExceeded),
            8 => Ok(JudgeStatus::OutputLimitExceeded),
            9 => Ok(JudgeStatus::PresentationError),
            10 => Ok(JudgeStatus::SystemError),
            11 => Ok(JudgeStatus::RejudgePending),
            12 => Ok(JudgeStatus::Skipped),
            other => Err(format!("invalid judge status code: {}", other)),
        }
    }
}

impl fmt::Display for JudgeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JudgeStatus::Pending => "Pending",
            JudgeStatus::RunningJudge => "RunningJudge",
            JudgeStatus::CompileError => "CompileError",
            JudgeStatus::Accepted => "Accepted",
            JudgeStatus::RuntimeError => "RuntimeError",
            JudgeStatus::WrongAnswer => "WrongAnswer",
            JudgeStatus::TimeLimitExceeded => "TimeLimitExceeded",
            JudgeStatus::MemoryLimitExceeded => "MemoryLimitExceeded",
            JudgeStatus::OutputLimitExceeded => "OutputLimitExceeded",
            JudgeStatus::PresentationError => "PresentationError",
            JudgeStatus::SystemError => "SystemError",
            JudgeStatus::RejudgePending => "RejudgePending",
            JudgeStatus::Skipped => "Skipped",
        };
        write!(f, "{}", s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_codes() {
        assert_eq!(serde_json::to_string(&JudgeStatus::Accepted).unwrap(), "3");
        assert_eq!(serde_json::to_string(&JudgeStatus::Skipped).unwrap(), "12");
        let parsed: JudgeStatus = serde_json::from_str("10").unwrap();
        assert_eq!(parsed, JudgeStatus::SystemError);
        assert!(serde_json::from_str::<JudgeStatus>("13").is_err());
    }

    #[test]
    fn test_from_run_status() {
        assert_eq!(
            JudgeStatus::from_run_status(SandboxStatus::TimeLimitExceeded),
            JudgeStatus::TimeLimitExceeded
        );
        assert_eq!(
            JudgeStatus::from_run_status(SandboxStatus::NonzeroExitStatus),
            JudgeStatus::RuntimeError
        );
        assert_eq!(
            JudgeStatus::from_run_status(SandboxStatus::Signalled),
            JudgeStatus::RuntimeError
        );
        assert_eq!(
            JudgeStatus::from_run_status(SandboxStatus::FileError),
            JudgeStatus::SystemError
        );
        assert_eq!(
            JudgeStatus::from_run_status(SandboxStatus::InternalError),
            JudgeStatus::SystemError
        );
    }

    #[test]
    fn test_skip_set() {
        assert!(JudgeStatus::TimeLimitExceeded.skips_remaining());
        assert!(JudgeStatus::MemoryLimitExceeded.skips_remaining());
        assert!(JudgeStatus::OutputLimitExceeded.skips_remaining());
        assert!(!JudgeStatus::SystemError.skips_remaining());
        assert!(!JudgeStatus::RuntimeError.skips_remaining());
        assert!(!JudgeStatus::WrongAnswer.skips_remaining());
    }
}
