//! Job model: kinds, typed payloads, lifecycle states and the worker result envelope.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::FromRow;
use typed_builder::TypedBuilder;

use super::error::{JobsError, ValidationError};
use crate::common::utils::derive_job_id;

const MAX_PROMPT_CHARS: usize = 8_000;
const MAX_TOPIC_CHARS: usize = 500;

// ============================================================================
// Enums
// ============================================================================

/// The two logical queues. Distinguished by latency class, not mechanism.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "job_queue", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum QueueName {
    /// Sub-second to few-second handlers, higher worker concurrency
    Interactive,
    /// Multi-second to multi-minute handlers, throttled concurrency
    Background,
}

impl QueueName {
    /// All queues, in status-probe priority order.
    pub const ALL: [QueueName; 2] = [QueueName::Interactive, QueueName::Background];

    pub fn as_str(&self) -> &'static str {
        match self {
            QueueName::Interactive => "interactive",
            QueueName::Background => "background",
        }
    }
}

impl fmt::Display for QueueName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QueueName {
    type Err = JobsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "interactive" => Ok(QueueName::Interactive),
            "background" => Ok(QueueName::Background),
            other => Err(JobsError::UnknownQueue(other.to_string())),
        }
    }
}

/// Lifecycle state stored with each job.
///
/// `waiting -> active -> {completed | failed}`, with `delayed` and `paused`
/// as pre-active detours. Terminal states never transition again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "job_state", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Waiting,
    Active,
    Completed,
    Failed,
    Delayed,
    Paused,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Waiting => "waiting",
            JobState::Active => "active",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
            JobState::Delayed => "delayed",
            JobState::Paused => "paused",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Client-facing state vocabulary. Anything the store reports outside of
/// this closed set collapses to `Unknown`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueState {
    Waiting,
    Active,
    Completed,
    Failed,
    Delayed,
    Paused,
    NotFound,
    Gone,
    Unknown,
}

impl QueueState {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueState::Waiting => "waiting",
            QueueState::Active => "active",
            QueueState::Completed => "completed",
            QueueState::Failed => "failed",
            QueueState::Delayed => "delayed",
            QueueState::Paused => "paused",
            QueueState::NotFound => "not_found",
            QueueState::Gone => "gone",
            QueueState::Unknown => "unknown",
        }
    }

    /// Normalize a raw state string.
    pub fn normalize(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "waiting" | "wait" => QueueState::Waiting,
            "active" => QueueState::Active,
            "completed" => QueueState::Completed,
            "failed" => QueueState::Failed,
            "delayed" => QueueState::Delayed,
            "paused" => QueueState::Paused,
            "not_found" => QueueState::NotFound,
            "gone" => QueueState::Gone,
            _ => QueueState::Unknown,
        }
    }
}

impl From<JobState> for QueueState {
    fn from(state: JobState) -> Self {
        QueueState::normalize(state.as_str())
    }
}

impl From<Option<JobState>> for QueueState {
    fn from(state: Option<JobState>) -> Self {
        state.map(QueueState::from).unwrap_or(QueueState::Unknown)
    }
}

/// Closed set of job kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    /// Interactive chat answer
    Ask,
    /// Tutoring pre-flight check before a session starts
    TutorPreflight,
    /// Lesson-plan generation
    LessonPlan,
    /// Lesson content backfill
    ContentBackfill,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::Ask => "ask",
            JobKind::TutorPreflight => "tutor_preflight",
            JobKind::LessonPlan => "lesson_plan",
            JobKind::ContentBackfill => "content_backfill",
        }
    }

    /// Which queue owns jobs of this kind.
    pub fn queue(&self) -> QueueName {
        match self {
            JobKind::Ask | JobKind::TutorPreflight => QueueName::Interactive,
            JobKind::LessonPlan | JobKind::ContentBackfill => QueueName::Background,
        }
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobKind {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ask" => Ok(JobKind::Ask),
            "tutor_preflight" => Ok(JobKind::TutorPreflight),
            "lesson_plan" => Ok(JobKind::LessonPlan),
            "content_backfill" => Ok(JobKind::ContentBackfill),
            other => Err(ValidationError::UnknownType(other.to_string())),
        }
    }
}

// ============================================================================
// Payloads
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ChatTurn {
    pub role: String,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AskPayload {
    pub prompt: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub history: Vec<ChatTurn>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lesson_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TutorPreflightPayload {
    pub prompt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lesson_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LessonPlanPayload {
    pub topic: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub level: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sections: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ContentBackfillPayload {
    pub topic: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<u32>,
}

/// A validated job submission: one typed payload per job kind.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum JobPayload {
    Ask(AskPayload),
    TutorPreflight(TutorPreflightPayload),
    LessonPlan(LessonPlanPayload),
    ContentBackfill(ContentBackfillPayload),
}

impl JobPayload {
    /// Parse and validate a submission from its wire form.
    pub fn parse(job_type: &str, payload: Value) -> Result<Self, ValidationError> {
        let kind = JobKind::from_str(job_type)?;
        let payload = Self::decode(kind, payload)?;
        payload.validate()?;
        Ok(payload)
    }

    /// Decode a stored payload without re-validating it.
    pub fn decode(kind: JobKind, payload: Value) -> Result<Self, ValidationError> {
        if !payload.is_object() {
            return Err(ValidationError::MissingField("payload"));
        }

        let decoded = match kind {
            JobKind::Ask => serde_json::from_value(payload).map(JobPayload::Ask),
            JobKind::TutorPreflight => {
                serde_json::from_value(payload).map(JobPayload::TutorPreflight)
            }
            JobKind::LessonPlan => serde_json::from_value(payload).map(JobPayload::LessonPlan),
            JobKind::ContentBackfill => {
                serde_json::from_value(payload).map(JobPayload::ContentBackfill)
            }
        };

        decoded.map_err(|e| ValidationError::Malformed(e.to_string()))
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        match self {
            JobPayload::Ask(p) => {
                require_text("prompt", &p.prompt, MAX_PROMPT_CHARS)?;
                for turn in &p.history {
                    if !matches!(turn.role.as_str(), "user" | "assistant") {
                        return Err(ValidationError::invalid(
                            "history",
                            format!("has unsupported role `{}`", turn.role),
                        ));
                    }
                }
                Ok(())
            }
            JobPayload::TutorPreflight(p) => require_text("prompt", &p.prompt, MAX_PROMPT_CHARS),
            JobPayload::LessonPlan(p) => {
                require_text("topic", &p.topic, MAX_TOPIC_CHARS)?;
                if let Some(sections) = p.sections {
                    if !(1..=20).contains(&sections) {
                        return Err(ValidationError::invalid("sections", "must be between 1 and 20"));
                    }
                }
                Ok(())
            }
            JobPayload::ContentBackfill(p) => {
                require_text("topic", &p.topic, MAX_TOPIC_CHARS)?;
                if let Some(limit) = p.limit {
                    if !(1..=100).contains(&limit) {
                        return Err(ValidationError::invalid("limit", "must be between 1 and 100"));
                    }
                }
                Ok(())
            }
        }
    }

    pub fn kind(&self) -> JobKind {
        match self {
            JobPayload::Ask(_) => JobKind::Ask,
            JobPayload::TutorPreflight(_) => JobKind::TutorPreflight,
            JobPayload::LessonPlan(_) => JobKind::LessonPlan,
            JobPayload::ContentBackfill(_) => JobKind::ContentBackfill,
        }
    }

    pub fn queue(&self) -> QueueName {
        self.kind().queue()
    }

    /// The payload as stored, without the kind tag.
    pub fn to_value(&self) -> Result<Value, ValidationError> {
        serde_json::to_value(self).map_err(|e| ValidationError::Malformed(e.to_string()))
    }

    /// Deterministic id for this submission.
    pub fn job_id(&self) -> Result<String, ValidationError> {
        Ok(derive_job_id(self.kind().as_str(), &self.to_value()?))
    }
}

fn require_text(field: &'static str, value: &str, max_chars: usize) -> Result<(), ValidationError> {
    if value.trim().is_empty() {
        return Err(ValidationError::MissingField(field));
    }
    if value.chars().count() > max_chars {
        return Err(ValidationError::invalid(
            field,
            format!("exceeds {} characters", max_chars),
        ));
    }
    Ok(())
}

// ============================================================================
// Stored records
// ============================================================================

/// A job row as persisted by the store.
#[derive(FromRow, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: String,
    pub queue_name: QueueName,
    pub job_type: String,
    pub payload: Value,

    pub state: JobState,
    pub progress: i32,

    // Retry bookkeeping
    pub attempts: i32,
    pub max_attempts: i32,
    pub backoff_base_ms: i64,
    pub run_at: Option<DateTime<Utc>>,

    // Timestamps
    pub created_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,

    // Outcome
    pub result: Option<Value>,
    pub failed_reason: Option<String>,
    pub stacktrace: Option<String>,

    // Lease management
    pub worker_id: Option<String>,
    pub lease_expires_at: Option<DateTime<Utc>>,
}

/// A job about to be inserted.
#[derive(Debug, Clone, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct NewJob {
    pub id: String,
    pub queue_name: QueueName,
    pub job_type: String,
    pub payload: Value,
    #[builder(default = 3)]
    pub max_attempts: i32,
    #[builder(default = 1_000)]
    pub backoff_base_ms: i64,
    #[builder(default, setter(strip_option))]
    pub run_at: Option<DateTime<Utc>>,
}

/// Failure details recorded when a worker gives up on an attempt.
#[derive(Debug, Clone)]
pub struct FailedAttempt {
    pub reason: String,
    pub stacktrace: Option<String>,
    /// Serialized `WorkerResult::Failure` envelope
    pub result: Value,
    /// `Some` schedules a retry (job goes to `delayed`), `None` is terminal.
    pub retry_at: Option<DateTime<Utc>>,
}

/// Per-state counts for one queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateCounts {
    pub waiting: i64,
    pub active: i64,
    pub completed: i64,
    pub failed: i64,
    pub delayed: i64,
    pub paused: i64,
}

impl StateCounts {
    pub fn add(&mut self, state: JobState, count: i64) {
        match state {
            JobState::Waiting => self.waiting += count,
            JobState::Active => self.active += count,
            JobState::Completed => self.completed += count,
            JobState::Failed => self.failed += count,
            JobState::Delayed => self.delayed += count,
            JobState::Paused => self.paused += count,
        }
    }

    pub fn in_flight(&self) -> i64 {
        self.waiting + self.active + self.delayed + self.paused
    }
}

/// Lightweight listing row for operational visibility.
#[derive(FromRow, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobSummary {
    pub id: String,
    pub job_type: String,
    pub state: JobState,
    pub attempts: i32,
    pub created_at: DateTime<Utc>,
}

// ============================================================================
// Worker results
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AskResult {
    pub answer: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PreflightResult {
    pub on_topic: bool,
    pub intent: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LessonPlanResult {
    pub topic: String,
    pub plan: String,
    pub sections: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackfillResult {
    pub topic: String,
    pub queries: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureInfo {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IgnoredInfo {
    pub reason: String,
}

/// Timing breakdown and handler identity attached to every result.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResultMeta {
    /// Claim time minus enqueue time
    pub queue_wait_ms: u64,
    pub handler_ms: u64,
    pub total_ms: u64,
    pub handler: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retrieval_calls: Option<u32>,
    pub attempt: i32,
}

/// Tagged result envelope stored on the job: `{type, result, meta}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerResult {
    Ask { result: AskResult, meta: ResultMeta },
    TutorPreflight { result: PreflightResult, meta: ResultMeta },
    LessonPlan { result: LessonPlanResult, meta: ResultMeta },
    ContentBackfill { result: BackfillResult, meta: ResultMeta },
    Failure { result: FailureInfo, meta: ResultMeta },
    Ignored { result: IgnoredInfo, meta: ResultMeta },
}

impl WorkerResult {
    pub fn failure(message: impl Into<String>, stack: Option<String>) -> Self {
        WorkerResult::Failure {
            result: FailureInfo {
                message: message.into(),
                stack,
            },
            meta: ResultMeta::default(),
        }
    }

    pub fn ignored(reason: impl Into<String>) -> Self {
        WorkerResult::Ignored {
            result: IgnoredInfo {
                reason: reason.into(),
            },
            meta: ResultMeta::default(),
        }
    }

    pub fn meta(&self) -> &ResultMeta {
        match self {
            WorkerResult::Ask { meta, .. }
            | WorkerResult::TutorPreflight { meta, .. }
            | WorkerResult::LessonPlan { meta, .. }
            | WorkerResult::ContentBackfill { meta, .. }
            | WorkerResult::Failure { meta, .. }
            | WorkerResult::Ignored { meta, .. } => meta,
        }
    }

    pub fn meta_mut(&mut self) -> &mut ResultMeta {
        match self {
            WorkerResult::Ask { meta, .. }
            | WorkerResult::TutorPreflight { meta, .. }
            | WorkerResult::LessonPlan { meta, .. }
            | WorkerResult::ContentBackfill { meta, .. }
            | WorkerResult::Failure { meta, .. }
            | WorkerResult::Ignored { meta, .. } => meta,
        }
    }

    pub fn as_failure(&self) -> Option<&FailureInfo> {
        match self {
            WorkerResult::Failure { result, .. } => Some(result),
            _ => None,
        }
    }

    pub fn type_tag(&self) -> &'static str {
        match self {
            WorkerResult::Ask { .. } => "ask",
            WorkerResult::TutorPreflight { .. } => "tutor_preflight",
            WorkerResult::LessonPlan { .. } => "lesson_plan",
            WorkerResult::ContentBackfill { .. } => "content_backfill",
            WorkerResult::Failure { .. } => "failure",
            WorkerResult::Ignored { .. } => "ignored",
        }
    }

    pub fn to_value(&self) -> Value {
        // Every variant is plain data; serialization cannot fail.
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// Pull the handler payload out of a stored `{type, result, meta}` envelope.
///
/// Values that do not look like an envelope are returned unchanged.
pub fn unwrap_result_envelope(stored: &Value) -> Value {
    match stored {
        Value::Object(map) if map.contains_key("type") && map.contains_key("result") => {
            map["result"].clone()
        }
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parse_ask_payload() {
        let payload = JobPayload::parse("ask", json!({"prompt": "hi"})).unwrap();
        assert_eq!(payload.kind(), JobKind::Ask);
        assert_eq!(payload.queue(), QueueName::Interactive);
    }

    #[test]
    fn parse_rejects_unknown_type() {
        let err = JobPayload::parse("summon", json!({})).unwrap_err();
        assert_eq!(err, ValidationError::UnknownType("summon".into()));
    }

    #[test]
    fn parse_rejects_unknown_fields() {
        let err = JobPayload::parse("ask", json!({"prompt": "hi", "extra": 1})).unwrap_err();
        assert!(matches!(err, ValidationError::Malformed(msg) if msg.contains("extra")));

        let err = JobPayload::parse(
            "ask",
            json!({"prompt": "hi", "history": [{"role": "user", "content": "a", "name": "x"}]}),
        )
        .unwrap_err();
        assert!(matches!(err, ValidationError::Malformed(_)));
    }

    #[test]
    fn parse_rejects_blank_prompt() {
        let err = JobPayload::parse("ask", json!({"prompt": "   "})).unwrap_err();
        assert_eq!(err, ValidationError::MissingField("prompt"));
    }

    #[test]
    fn parse_rejects_missing_payload() {
        let err = JobPayload::parse("lesson_plan", Value::Null).unwrap_err();
        assert_eq!(err, ValidationError::MissingField("payload"));
    }

    #[test]
    fn parse_rejects_missing_topic_field() {
        let err = JobPayload::parse("lesson_plan", json!({"level": "intro"})).unwrap_err();
        assert!(matches!(err, ValidationError::Malformed(_)));
    }

    #[test]
    fn parse_rejects_out_of_range_sections() {
        let err =
            JobPayload::parse("lesson_plan", json!({"topic": "tides", "sections": 0})).unwrap_err();
        assert!(matches!(err, ValidationError::Invalid { field: "sections", .. }));
    }

    #[test]
    fn parse_rejects_unknown_history_role() {
        let err = JobPayload::parse(
            "ask",
            json!({"prompt": "hi", "history": [{"role": "system", "content": "x"}]}),
        )
        .unwrap_err();
        assert!(matches!(err, ValidationError::Invalid { field: "history", .. }));
    }

    #[test]
    fn background_kinds_route_to_background_queue() {
        assert_eq!(JobKind::LessonPlan.queue(), QueueName::Background);
        assert_eq!(JobKind::ContentBackfill.queue(), QueueName::Background);
        assert_eq!(JobKind::TutorPreflight.queue(), QueueName::Interactive);
    }

    #[test]
    fn omitted_optional_fields_do_not_change_id() {
        let a = JobPayload::parse("ask", json!({"prompt": "hi"})).unwrap();
        let b = JobPayload::parse("ask", json!({"prompt": "hi", "lesson_id": null})).unwrap();
        assert_eq!(a.job_id().unwrap(), b.job_id().unwrap());
    }

    #[test]
    fn payload_value_has_no_kind_tag() {
        let payload = JobPayload::parse("ask", json!({"prompt": "hi"})).unwrap();
        assert_eq!(payload.to_value().unwrap(), json!({"prompt": "hi"}));
    }

    #[test]
    fn terminal_states() {
        assert!(JobState::Completed.is_terminal());
        assert!(JobState::Failed.is_terminal());
        assert!(!JobState::Active.is_terminal());
        assert!(!JobState::Delayed.is_terminal());
    }

    #[test]
    fn queue_state_normalizes_unknown_vocabulary() {
        assert_eq!(QueueState::normalize("prioritized"), QueueState::Unknown);
        assert_eq!(QueueState::normalize("ACTIVE"), QueueState::Active);
        assert_eq!(QueueState::from(None), QueueState::Unknown);
    }

    #[test]
    fn worker_result_envelope_shape() {
        let result = WorkerResult::Ask {
            result: AskResult {
                answer: "hello".into(),
            },
            meta: ResultMeta::default(),
        };

        let value = result.to_value();
        assert_eq!(value["type"], "ask");
        assert_eq!(value["result"]["answer"], "hello");
        assert!(value["meta"].is_object());

        let decoded: WorkerResult = serde_json::from_value(value).unwrap();
        assert_eq!(decoded, result);
    }

    #[test]
    fn unwrap_envelope_flattens_result() {
        let stored = WorkerResult::failure("boom", None).to_value();
        assert_eq!(unwrap_result_envelope(&stored), json!({"message": "boom"}));
        assert_eq!(unwrap_result_envelope(&json!(42)), json!(42));
    }
}
