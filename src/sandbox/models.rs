//! Wire types for the sandbox HTTP API.
//!
//! Field names follow the sandbox JSON protocol and must be preserved:
//! file references are discriminated by their single key (`src`, `content`,
//! `fileId`), collectors by `{name, max}`, and commands/results use
//! camelCase keys throughout.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::config;

/// Handle to a blob resident inside the sandbox, referenced by opaque id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedFile {
    pub file_id: String,
}

impl PreparedFile {
    pub fn new(file_id: impl Into<String>) -> Self {
        Self {
            file_id: file_id.into(),
        }
    }
}

impl From<PreparedFile> for SandboxFile {
    fn from(file: PreparedFile) -> Self {
        SandboxFile::Prepared {
            file_id: file.file_id,
        }
    }
}

/// A file reference accepted anywhere the sandbox takes input or output
/// data, plus the collector variant used as an output-capture sink.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SandboxFile {
    /// Path readable by the sandbox host.
    Local { src: String },
    /// Inline content.
    Memory { content: String },
    /// Blob already resident in the sandbox.
    #[serde(rename_all = "camelCase")]
    Prepared { file_id: String },
    /// Output-capture sink, bounded by `max` bytes.
    Collector { name: String, max: u64 },
}

impl SandboxFile {
    pub fn memory(content: impl Into<String>) -> Self {
        SandboxFile::Memory {
            content: content.into(),
        }
    }

    /// A collector bounded by the default output cap.
    pub fn collector(name: impl Into<String>) -> Self {
        SandboxFile::Collector {
            name: name.into(),
            max: config::DEFAULT_OUTPUT_LIMIT_BYTES,
        }
    }
}

/// One sandbox invocation.
///
/// `files` binds the command's file descriptors in order; a `None` slot
/// leaves the descriptor dangling for pipe mappings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SandboxCmd {
    pub args: Vec<String>,
    pub env: Vec<String>,
    pub files: Vec<Option<SandboxFile>>,
    /// CPU time limit, ns.
    pub cpu_limit: u64,
    /// Wall-clock limit, ns.
    pub clock_limit: u64,
    /// Memory limit, bytes.
    pub memory_limit: u64,
    pub proc_limit: u64,
    /// 1000 equals one full core.
    pub cpu_rate_limit: u64,
    /// Filename in the sandbox -> file to stage in.
    pub copy_in: HashMap<String, SandboxFile>,
    /// Files returned inline after the run.
    pub copy_out: Vec<String>,
    /// Files retained in the sandbox, returned as new file ids.
    pub copy_out_cached: Vec<String>,
    pub copy_out_max: u64,
}

impl Default for SandboxCmd {
    fn default() -> Self {
        Self {
            args: Vec::new(),
            env: config::SANDBOX_ENV.iter().map(|s| s.to_string()).collect(),
            files: Vec::new(),
            cpu_limit: config::DEFAULT_TIME_LIMIT_NS,
            clock_limit: config::DEFAULT_TIME_LIMIT_NS * 2,
            memory_limit: config::DEFAULT_MEMORY_LIMIT_BYTES,
            proc_limit: config::DEFAULT_PROC_LIMIT,
            cpu_rate_limit: config::DEFAULT_CPU_RATE_LIMIT,
            copy_in: HashMap::new(),
            copy_out: Vec::new(),
            copy_out_cached: Vec::new(),
            copy_out_max: config::DEFAULT_OUTPUT_LIMIT_BYTES,
        }
    }
}

/// Execution status reported by the sandbox for one command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SandboxStatus {
    Accepted,
    #[serde(rename = "Memory Limit Exceeded")]
    MemoryLimitExceeded,
    #[serde(rename = "Time Limit Exceeded")]
    TimeLimitExceeded,
    #[serde(rename = "Output Limit Exceeded")]
    OutputLimitExceeded,
    #[serde(rename = "File Error")]
    FileError,
    #[serde(rename = "Nonzero Exit Status")]
    NonzeroExitStatus,
    Signalled,
    #[serde(rename = "Internal Error")]
    InternalError,
    /// Status string this worker does not know; treated as an internal
    /// error rather than failing the whole batch parse.
    #[serde(other)]
    Unknown,
}

/// Result of one sandbox invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SandboxResult {
    pub status: SandboxStatus,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub exit_status: i64,
    /// CPU time, ns.
    #[serde(default)]
    pub time: u64,
    /// Memory, bytes.
    #[serde(default)]
    pub memory: u64,
    /// Wall-clock time, ns.
    #[serde(default)]
    pub run_time: u64,
    /// copyOut name -> inline content.
    #[serde(default)]
    pub files: HashMap<String, String>,
    /// copyOutCached name -> file id.
    #[serde(default)]
    pub file_ids: HashMap<String, String>,
    #[serde(default)]
    pub file_error: Vec<SandboxFileError>,
}

/// Detailed per-file error attached to a sandbox result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxFileError {
    pub name: String,
    #[serde(rename = "type")]
    pub error_type: String,
    #[serde(default)]
    pub message: Option<String>,
}

/// One end of a pipe mapping: command index and fd number.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PipeIndex {
    pub index: usize,
    pub fd: i32,
}

/// Wires fd `in` of one command to fd `out` of another for interactive
/// judging.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PipeMap {
    #[serde(rename = "in")]
    pub input: PipeIndex,
    pub out: PipeIndex,
}

/// Response of `GET /version`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SandboxVersion {
    pub build_version: String,
    #[serde(default)]
    pub go_version: Option<String>,
    #[serde(default)]
    pub platform: Option<String>,
    #[serde(default)]
    pub os: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_reference_discriminating_keys() {
        let local: SandboxFile = serde_json::from_str(r#"{"src": "/data/1.in"}"#).unwrap();
        assert_eq!(
            local,
            SandboxFile::Local {
                src: "/data/1.in".to_string()
            }
        );

        let memory: SandboxFile = serde_json::from_str(r#"{"content": "1 1\n"}"#).unwrap();
        assert_eq!(memory, SandboxFile::memory("1 1\n"));

        let prepared: SandboxFile = serde_json::from_str(r#"{"fileId": "abc"}"#).unwrap();
        assert_eq!(prepared, SandboxFile::from(PreparedFile::new("abc")));
        assert_eq!(
            serde_json::to_string(&prepared).unwrap(),
            r#"{"fileId":"abc"}"#
        );

        assert!(serde_json::from_str::<SandboxFile>(r#"{"invalid": "x"}"#).is_err());
    }

    #[test]
    fn test_cmd_wire_fields() {
        let cmd = SandboxCmd {
            args: vec!["./Main".to_string()],
            files: vec![
                Some(SandboxFile::memory("")),
                Some(SandboxFile::collector("stdout")),
                None,
            ],
            ..SandboxCmd::default()
        };
        let value = serde_json::to_value(&cmd).unwrap();
        assert_eq!(value["args"][0], "./Main");
        assert_eq!(value["cpuLimit"], 10_000_000_000u64);
        assert_eq!(value["clockLimit"], 20_000_000_000u64);
        assert_eq!(value["procLimit"], 64);
        assert_eq!(value["cpuRateLimit"], 1000);
        assert_eq!(value["files"][1]["name"], "stdout");
        assert!(value["files"][2].is_null());
        assert!(value["copyOutCached"].as_array().unwrap().is_empty());
    }

    #[test]
    fn test_status_strings() {
        let status: SandboxStatus = serde_json::from_str(r#""Memory Limit Exceeded""#).unwrap();
        assert_eq!(status, SandboxStatus::MemoryLimitExceeded);
        let status: SandboxStatus = serde_json::from_str(r#""Nonzero Exit Status""#).unwrap();
        assert_eq!(status, SandboxStatus::NonzeroExitStatus);
        let status: SandboxStatus = serde_json::from_str(r#""Dangerous Syscall""#).unwrap();
        assert_eq!(status, SandboxStatus::Unknown);
    }

    #[test]
    fn test_result_defaults() {
        let result: SandboxResult = serde_json::from_str(
            r#"{"status": "Accepted", "exitStatus": 0, "time": 12000000, "memory": 4096}"#,
        )
        .unwrap();
        assert_eq!(result.status, SandboxStatus::Accepted);
        assert_eq!(result.time, 12_000_000);
        assert!(result.files.is_empty());
        assert!(result.file_ids.is_empty());
        assert!(result.error.is_none());
    }

    #[test]
    fn test_pipe_map_wire_format() {
        let mapping = PipeMap {
            input: PipeIndex { index: 0, fd: 1 },
            out: PipeIndex { index: 1, fd: 0 },
        };
        assert_eq!(
            serde_json::to_string(&mapping).unwrap(),
            r#"{"in":{"index":0,"fd":1},"out":{"index":1,"fd":0}}"#
        );
    }
}
