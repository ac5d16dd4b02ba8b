//! Progress events published by the evaluation pipeline.

use serde::{Deserialize, Serialize};

/// Lifecycle state an event reports for its subject.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventStatus {
    Waiting,
    Running,
    Generating,
    Validating,
    Solving,
    Executing,
    Checking,
    Generated,
    Validated,
    Executed,
    Done,
    Failure,
}

/// Outcome payload attached to a finished evaluation.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct EvaluationResult {
    pub score: f32,
    pub message: String,
    pub cpu_time: f64,
    pub wall_time: f64,
    pub memory_kb: u64,
}

/// One progress event. The tag names the pipeline stage, the fields name
/// the subject.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Event {
    Compilation {
        filename: String,
        status: EventStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        stderr: Option<String>,
        #[serde(default)]
        from_cache: bool,
    },
    Generation {
        testcase: i64,
        status: EventStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
        #[serde(default)]
        from_cache: bool,
    },
    Evaluation {
        solution: String,
        testcase: i64,
        status: EventStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<EvaluationResult>,
        #[serde(default)]
        from_cache: bool,
    },
    Checking {
        solution: String,
        testcase: i64,
        status: EventStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
        #[serde(default)]
        from_cache: bool,
    },
    TaskScore {
        solution: String,
        score: f32,
    },
    SubtaskScore {
        solution: String,
        subtask: i64,
        score: f32,
    },
    FatalError {
        message: String,
    },
}
