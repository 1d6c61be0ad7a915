//! OpenAI-compatible chat completions over HTTP.
use super::{parse_json_object, Completion, CompletionGateway, CompletionRequest};
use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::{Duration, Instant};

pub struct OpenAiGateway {
    agent: ureq::Agent,
    endpoint: String,
    api_key: String,
}

impl OpenAiGateway {
    pub fn new(base_url: &str, api_key: String, timeout: Duration) -> Self {
        let agent: ureq::Agent = ureq::Agent::config_builder()
            .timeout_global(Some(timeout))
            .http_status_as_error(false)
            .build()
            .into();
        Self {
            agent,
            endpoint: format!("{}/chat/completions", base_url.trim_end_matches('/')),
            api_key,
        }
    }
}

impl CompletionGateway for OpenAiGateway {
    fn complete(&self, request: &CompletionRequest) -> Result<Completion> {
        let body = request_body(request);
        let start = Instant::now();
        let mut response = self
            .agent
            .post(&self.endpoint)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .send_json(&body)
            .with_context(|| format!("POST {}", self.endpoint))?;
        let status = response.status();
        let text = response
            .body_mut()
            .read_to_string()
            .context("read completion response body")?;

        tracing::debug!(
            elapsed_ms = start.elapsed().as_millis(),
            status = status.as_u16(),
            response_bytes = text.len(),
            "completion request complete"
        );

        if !status.is_success() {
            return Err(anyhow!(
                "completion service returned {}: {}",
                status,
                error_message(&text)
            ));
        }
        parse_response(&text, request.structured.is_some())
    }

    fn describe(&self) -> String {
        self.endpoint.clone()
    }
}

fn request_body(request: &CompletionRequest) -> Value {
    let mut body = json!({
        "model": request.model,
        "messages": [
            {"role": "system", "content": request.system_message},
            {"role": "user", "content": request.prompt},
        ],
        "max_tokens": request.max_tokens,
        "temperature": request.temperature,
    });
    if let (Some(structured), Some(object)) = (&request.structured, body.as_object_mut()) {
        object.insert(
            "response_format".to_string(),
            json!({
                "type": "json_schema",
                "json_schema": {
                    "name": structured.name,
                    "strict": true,
                    "schema": structured.schema,
                },
            }),
        );
    }
    body
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    refusal: Option<String>,
}

fn parse_response(text: &str, structured: bool) -> Result<Completion> {
    let response: ChatResponse =
        serde_json::from_str(text).context("parse completion response JSON")?;
    let Some(choice) = response.choices.into_iter().next() else {
        return Err(anyhow!("completion response has no choices"));
    };
    if let Some(refusal) = choice.message.refusal.filter(|r| !r.trim().is_empty()) {
        return Err(anyhow!("model refused: {}", refusal.trim()));
    }
    let content = choice.message.content.unwrap_or_default();
    if structured {
        return parse_json_object(&content)
            .map(Completion::Structured)
            .ok_or_else(|| anyhow!("structured response is not a JSON object: {content:?}"));
    }
    Ok(Completion::Text(content))
}

fn error_message(body: &str) -> String {
    serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|value| {
            value
                .pointer("/error/message")
                .and_then(Value::as_str)
                .map(str::to_string)
        })
        .unwrap_or_else(|| body.trim().chars().take(200).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::StructuredOutput;

    fn request(structured: Option<StructuredOutput>) -> CompletionRequest {
        CompletionRequest {
            model: "gpt-4o-mini".to_string(),
            system_message: "You are a helpful assistant.".to_string(),
            prompt: "Classify.\nTask: walk".to_string(),
            max_tokens: 50,
            temperature: 0.7,
            structured,
        }
    }

    #[test]
    fn body_without_schema_has_no_response_format() {
        let body = request_body(&request(None));
        assert_eq!(body["model"], "gpt-4o-mini");
        assert_eq!(body["messages"][0]["role"], "system");
        assert_eq!(body["messages"][1]["content"], "Classify.\nTask: walk");
        assert_eq!(body["max_tokens"], 50);
        assert!(body.get("response_format").is_none());
    }

    #[test]
    fn body_with_schema_requests_strict_json_schema() {
        let body = request_body(&request(Some(StructuredOutput {
            name: "difficulty_response".to_string(),
            schema: json!({"type": "object"}),
        })));
        let format = &body["response_format"];
        assert_eq!(format["type"], "json_schema");
        assert_eq!(format["json_schema"]["name"], "difficulty_response");
        assert_eq!(format["json_schema"]["strict"], true);
        assert_eq!(format["json_schema"]["schema"]["type"], "object");
    }

    #[test]
    fn parses_text_and_structured_content() {
        let text = r#"{"choices":[{"message":{"role":"assistant","content":" medium "}}]}"#;
        assert_eq!(
            parse_response(text, false).expect("text"),
            Completion::Text(" medium ".to_string())
        );

        let structured =
            r#"{"choices":[{"message":{"role":"assistant","content":"{\"difficulty\":\"hard\"}"}}]}"#;
        assert_eq!(
            parse_response(structured, true).expect("structured"),
            Completion::Structured(json!({"difficulty": "hard"}))
        );
    }

    #[test]
    fn malformed_responses_are_errors() {
        assert!(parse_response(r#"{"choices":[]}"#, false).is_err());
        assert!(parse_response("not json", false).is_err());
        let refusal = r#"{"choices":[{"message":{"content":null,"refusal":"no"}}]}"#;
        assert!(parse_response(refusal, true).is_err());
        let prose = r#"{"choices":[{"message":{"content":"hard"}}]}"#;
        assert!(parse_response(prose, true).is_err());
    }

    #[test]
    fn error_message_prefers_api_error_field() {
        assert_eq!(
            error_message(r#"{"error":{"message":"Rate limit reached"}}"#),
            "Rate limit reached"
        );
        assert_eq!(error_message("  bad gateway "), "bad gateway");
    }
}
