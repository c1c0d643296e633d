//! Job testing utilities.
//!
//! [`StubHandlers`] answers every job kind without calling a model:
//! - `ask` echoes the prompt, fails on `"boom"` and panics on `"panic"`
//! - the other kinds return small deterministic results
//!
//! Set a delay to keep jobs `active` long enough to observe.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;

use super::job::{
    AskPayload, AskResult, BackfillResult, ContentBackfillPayload, LessonPlanPayload,
    LessonPlanResult, PreflightResult, TutorPreflightPayload,
};
use super::processor::{Handled, JobHandlers};

pub const STUB_MODEL: &str = "stub-model";

#[derive(Default)]
pub struct StubHandlers {
    calls: AtomicUsize,
    delay: Option<Duration>,
}

impl StubHandlers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_delay(delay: Duration) -> Self {
        Self {
            calls: AtomicUsize::new(0),
            delay: Some(delay),
        }
    }

    /// Number of handler invocations so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    async fn enter(&self) {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
    }
}

#[async_trait]
impl JobHandlers for StubHandlers {
    fn name(&self) -> &str {
        "stub"
    }

    async fn ask(&self, payload: AskPayload) -> Result<Handled<AskResult>> {
        self.enter().await;
        match payload.prompt.as_str() {
            "boom" => bail!("boom"),
            "panic" => panic!("handler exploded"),
            prompt => Ok(Handled::new(AskResult {
                answer: format!("echo: {prompt}"),
            })
            .with_model(STUB_MODEL)),
        }
    }

    async fn tutor_preflight(&self, payload: TutorPreflightPayload) -> Result<Handled<PreflightResult>> {
        self.enter().await;
        Ok(Handled::new(PreflightResult {
            on_topic: payload.lesson_id.is_some(),
            intent: "question".to_string(),
        }))
    }

    async fn lesson_plan(&self, payload: LessonPlanPayload) -> Result<Handled<LessonPlanResult>> {
        self.enter().await;
        let sections = (1..=payload.sections.unwrap_or(3))
            .map(|n| format!("Section {n}"))
            .collect();
        Ok(Handled::new(LessonPlanResult {
            plan: format!("Plan for {}", payload.topic),
            topic: payload.topic,
            sections,
        }))
    }

    async fn content_backfill(
        &self,
        payload: ContentBackfillPayload,
    ) -> Result<Handled<BackfillResult>> {
        self.enter().await;
        let queries = (1..=payload.limit.unwrap_or(2))
            .map(|n| format!("{} {n}", payload.topic))
            .collect::<Vec<_>>();
        Ok(Handled::new(BackfillResult {
            topic: payload.topic,
            queries: queries.clone(),
        })
        .with_retrieval_calls(queries.len() as u32))
    }
}
