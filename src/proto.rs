//! Data model shared by the executor and dispatch layers.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::store::Digest;

/// Role a file plays in an execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileRole {
    #[default]
    Input,
    Output,
    Stdin,
    Stdout,
    Stderr,
}

/// Reference to an artifact with its logical name inside the sandbox.
///
/// Request outputs carry name and role only; the executor fills in the
/// digest (and, for small artifacts, the inline contents) on the way back.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileInfo {
    pub name: String,
    #[serde(default)]
    pub role: FileRole,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub digest: Option<Digest>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub executable: bool,
    #[serde(default, skip_serializing_if = "Option::is_none", with = "b64_opt")]
    pub contents: Option<Vec<u8>>,
}

impl FileInfo {
    pub fn new(name: impl Into<String>, role: FileRole) -> Self {
        Self {
            name: name.into(),
            role,
            digest: None,
            executable: false,
            contents: None,
        }
    }

    pub fn with_digest(mut self, digest: Digest) -> Self {
        self.digest = Some(digest);
        self
    }

    pub fn with_executable(mut self, executable: bool) -> Self {
        self.executable = executable;
        self
    }

    pub fn with_contents(mut self, contents: impl Into<Vec<u8>>) -> Self {
        self.contents = Some(contents.into());
        self
    }
}

/// Resource limits for one execution. Zero means "no limit" for that
/// dimension. Times are seconds, sizes are KiB.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceLimits {
    pub cpu_time: f64,
    pub wall_time: f64,
    pub memory_kb: u64,
    pub max_files: u32,
    pub max_procs: u32,
    pub max_file_size_kb: u64,
    pub max_mlock_kb: u64,
    pub max_stack_kb: u64,
}

/// Measured resource usage of one execution.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceUsage {
    pub cpu_time: f64,
    pub sys_time: f64,
    pub wall_time: f64,
    pub memory_kb: u64,
}

/// A single sandboxed execution to perform.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRequest {
    pub executable: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub inputs: Vec<FileInfo>,
    #[serde(default)]
    pub outputs: Vec<FileInfo>,
    #[serde(default)]
    pub limits: ResourceLimits,
    /// Requires the worker to be otherwise idle, for timing-sensitive runs.
    #[serde(default)]
    pub exclusive: bool,
    /// Retain the sandbox workspace after the run, for debugging.
    #[serde(default)]
    pub keep_sandbox: bool,
    /// Reserved; any non-empty value is rejected with `INVALID_ARGUMENT`.
    #[serde(default)]
    pub fifos: Vec<String>,
}

impl ExecutionRequest {
    pub fn new(executable: impl Into<String>) -> Self {
        Self {
            executable: executable.into(),
            args: Vec::new(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            limits: ResourceLimits::default(),
            exclusive: false,
            keep_sandbox: false,
            fifos: Vec::new(),
        }
    }
}

/// Classified outcome of an execution. A normal result, not an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitStatus {
    Success,
    Nonzero,
    Signal,
    TimeLimit,
    MemoryLimit,
    MissingFiles,
    InternalError,
}

impl fmt::Display for ExitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ExitStatus::Success => "success",
            ExitStatus::Nonzero => "nonzero",
            ExitStatus::Signal => "signal",
            ExitStatus::TimeLimit => "time_limit",
            ExitStatus::MemoryLimit => "memory_limit",
            ExitStatus::MissingFiles => "missing_files",
            ExitStatus::InternalError => "internal_error",
        };
        write!(f, "{}", s)
    }
}

/// Result of one execution request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub status: ExitStatus,
    pub resource_usage: ResourceUsage,
    pub status_code: i32,
    pub signal: i32,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error_message: String,
    #[serde(default)]
    pub outputs: Vec<FileInfo>,
}

impl Response {
    pub fn internal_error(message: impl Into<String>) -> Self {
        Self {
            status: ExitStatus::InternalError,
            resource_usage: ResourceUsage::default(),
            status_code: 0,
            signal: 0,
            error_message: message.into(),
            outputs: Vec::new(),
        }
    }

    /// Output entry with the given logical name, if present.
    pub fn output(&self, name: &str) -> Option<&FileInfo> {
        self.outputs.iter().find(|o| o.name == name)
    }
}

/// Base64 (de)serialization for binary payloads embedded in JSON frames.
pub(crate) mod b64 {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        STANDARD.decode(s).map_err(de::Error::custom)
    }
}

pub(crate) mod b64_opt {
    use serde::{Deserialize, Deserializer, Serializer};

    #[derive(serde::Serialize, serde::Deserialize)]
    struct Wrap(#[serde(with = "super::b64")] Vec<u8>);

    pub fn serialize<S: Serializer>(
        bytes: &Option<Vec<u8>>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match bytes {
            Some(b) => serializer.serialize_some(&Wrap(b.clone())),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Vec<u8>>, D::Error> {
        Ok(Option::<Wrap>::deserialize(deserializer)?.map(|w| w.0))
    }
}
