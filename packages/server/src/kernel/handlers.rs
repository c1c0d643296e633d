//! Job handlers backed by the tutor model.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;

use super::jobs::{
    AskPayload, AskResult, BackfillResult, ContentBackfillPayload, Handled, JobHandlers,
    LessonPlanPayload, LessonPlanResult, PreflightResult, TutorPreflightPayload,
};
use super::tutor_client::{Message, TutorClient};

const TUTOR_SYSTEM_PROMPT: &str = "You are a patient tutor. Answer the learner's question \
    clearly and concisely, building on what was said earlier in the conversation.";

const PREFLIGHT_SYSTEM_PROMPT: &str = "Classify the learner's message before a tutoring \
    session. Reply with JSON: {\"on_topic\": bool, \"intent\": string}. `intent` is one of \
    question, practice, greeting, off_topic.";

const LESSON_PLAN_SYSTEM_PROMPT: &str = "Write a lesson plan. Reply with JSON: \
    {\"plan\": string, \"sections\": [string]}.";

const BACKFILL_SYSTEM_PROMPT: &str = "Suggest search queries for finding source material \
    on a lesson topic. Reply with JSON: {\"queries\": [string]}.";

const DEFAULT_SECTIONS: u32 = 5;
const DEFAULT_QUERY_LIMIT: u32 = 10;

#[derive(Deserialize)]
struct PreflightVerdict {
    on_topic: bool,
    intent: String,
}

#[derive(Deserialize)]
struct PlanDraft {
    plan: String,
    sections: Vec<String>,
}

#[derive(Deserialize)]
struct QueryDraft {
    queries: Vec<String>,
}

pub struct TutorHandlers {
    client: TutorClient,
}

impl TutorHandlers {
    pub fn new(client: TutorClient) -> Self {
        Self { client }
    }
}

fn lesson_context(lesson_id: Option<&str>) -> Option<Message> {
    lesson_id.map(|id| Message::system(format!("The learner is working on lesson {id}.")))
}

#[async_trait]
impl JobHandlers for TutorHandlers {
    fn name(&self) -> &str {
        "tutor"
    }

    async fn ask(&self, payload: AskPayload) -> Result<Handled<AskResult>> {
        let mut messages = vec![Message::system(TUTOR_SYSTEM_PROMPT)];
        messages.extend(lesson_context(payload.lesson_id.as_deref()));
        messages.extend(payload.history.into_iter().map(|turn| Message {
            role: turn.role,
            content: turn.content,
        }));
        messages.push(Message::user(payload.prompt));

        let response = self
            .client
            .chat(&messages)
            .await
            .context("tutor answer request failed")?;

        Ok(Handled::new(AskResult {
            answer: response.content,
        })
        .with_model(response.model))
    }

    async fn tutor_preflight(&self, payload: TutorPreflightPayload) -> Result<Handled<PreflightResult>> {
        let mut messages = vec![Message::system(PREFLIGHT_SYSTEM_PROMPT)];
        messages.extend(lesson_context(payload.lesson_id.as_deref()));
        messages.push(Message::user(payload.prompt));

        let (verdict, response): (PreflightVerdict, _) = self
            .client
            .chat_json(&messages)
            .await
            .context("preflight classification failed")?;

        Ok(Handled::new(PreflightResult {
            on_topic: verdict.on_topic,
            intent: verdict.intent,
        })
        .with_model(response.model))
    }

    async fn lesson_plan(&self, payload: LessonPlanPayload) -> Result<Handled<LessonPlanResult>> {
        let sections = payload.sections.unwrap_or(DEFAULT_SECTIONS);
        let level = payload.level.as_deref().unwrap_or("general");
        let messages = vec![
            Message::system(LESSON_PLAN_SYSTEM_PROMPT),
            Message::user(format!(
                "Topic: {}\nLevel: {level}\nSections: {sections}",
                payload.topic
            )),
        ];

        let (draft, response): (PlanDraft, _) = self
            .client
            .chat_json(&messages)
            .await
            .context("lesson plan generation failed")?;

        Ok(Handled::new(LessonPlanResult {
            topic: payload.topic,
            plan: draft.plan,
            sections: draft.sections.into_iter().take(sections as usize).collect(),
        })
        .with_model(response.model))
    }

    async fn content_backfill(
        &self,
        payload: ContentBackfillPayload,
    ) -> Result<Handled<BackfillResult>> {
        let limit = payload.limit.unwrap_or(DEFAULT_QUERY_LIMIT);
        let messages = vec![
            Message::system(BACKFILL_SYSTEM_PROMPT),
            Message::user(format!("Topic: {}\nAt most {limit} queries.", payload.topic)),
        ];

        let (draft, response): (QueryDraft, _) = self
            .client
            .chat_json(&messages)
            .await
            .context("content backfill query generation failed")?;

        Ok(Handled::new(BackfillResult {
            topic: payload.topic,
            queries: draft.queries.into_iter().take(limit as usize).collect(),
        })
        .with_model(response.model))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{routing::post, Json, Router};
    use serde_json::{json, Value};

    async fn serve(content: &'static str) -> String {
        let app = Router::new().route(
            "/chat/completions",
            post(move |Json(_body): Json<Value>| async move {
                Json(json!({
                    "model": "tutor-test",
                    "choices": [{"message": {"role": "assistant", "content": content}}]
                }))
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    #[tokio::test]
    async fn ask_returns_model_answer() {
        let handlers = TutorHandlers::new(TutorClient::new(serve("Because of gravity.").await, "m"));

        let handled = handlers
            .ask(AskPayload {
                prompt: "Why do tides happen?".into(),
                history: vec![],
                lesson_id: Some("oceans-1".into()),
            })
            .await
            .unwrap();

        assert_eq!(handled.value.answer, "Because of gravity.");
        assert_eq!(handled.model.as_deref(), Some("tutor-test"));
    }

    #[tokio::test]
    async fn lesson_plan_caps_sections() {
        let handlers = TutorHandlers::new(TutorClient::new(
            serve(r#"{"plan": "Intro to tides", "sections": ["a", "b", "c"]}"#).await,
            "m",
        ));

        let handled = handlers
            .lesson_plan(LessonPlanPayload {
                topic: "tides".into(),
                level: None,
                sections: Some(2),
            })
            .await
            .unwrap();

        assert_eq!(handled.value.sections, vec!["a", "b"]);
        assert_eq!(handled.value.topic, "tides");
    }

    #[tokio::test]
    async fn malformed_json_is_an_error() {
        let handlers = TutorHandlers::new(TutorClient::new(serve("not json").await, "m"));

        let err = handlers
            .tutor_preflight(TutorPreflightPayload {
                prompt: "hello".into(),
                lesson_id: None,
            })
            .await
            .unwrap_err();
        assert!(format!("{err:#}").contains("preflight classification failed"));
    }
}
