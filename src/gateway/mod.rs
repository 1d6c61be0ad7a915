//! Completion service boundary.
//!
//! The engine only sees [`CompletionGateway`]: a prompt plus generation
//! parameters in, free text or a schema-shaped JSON object out. Two
//! implementations ship: an OpenAI-compatible HTTP client and a local command
//! that reads the prompt on stdin.
use anyhow::Result;
use serde_json::Value;

mod command;
mod openai;

pub use command::CommandGateway;
pub use openai::OpenAiGateway;

/// Structured-output contract attached to a request.
#[derive(Debug, Clone, PartialEq)]
pub struct StructuredOutput {
    pub name: String,
    pub schema: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CompletionRequest {
    pub model: String,
    pub system_message: String,
    pub prompt: String,
    pub max_tokens: u32,
    pub temperature: f64,
    pub structured: Option<StructuredOutput>,
}

/// What the service answered.
#[derive(Debug, Clone, PartialEq)]
pub enum Completion {
    Text(String),
    Structured(Value),
}

impl Completion {
    /// Blank text and JSON null carry nothing worth extracting.
    pub fn is_empty(&self) -> bool {
        match self {
            Completion::Text(text) => text.trim().is_empty(),
            Completion::Structured(value) => value.is_null(),
        }
    }
}

pub trait CompletionGateway {
    fn complete(&self, request: &CompletionRequest) -> Result<Completion>;
    /// Short label for logs.
    fn describe(&self) -> String;
}

/// Parse a JSON object out of model text.
///
/// Tries the whole text, then the body of the first markdown fence, then the
/// span from the first `{` to the last `}`.
pub fn parse_json_object(text: &str) -> Option<Value> {
    let text = text.trim();
    [Some(text), fenced_body(text), brace_span(text)]
        .into_iter()
        .flatten()
        .find_map(|candidate| match serde_json::from_str(candidate) {
            Ok(value @ Value::Object(_)) => Some(value),
            _ => None,
        })
}

/// Body of the first ``` fence, without its info string line.
fn fenced_body(text: &str) -> Option<&str> {
    let (_, after_open) = text.split_once("```")?;
    let (info, body) = after_open.split_once('\n').unwrap_or(("", after_open));
    let body = if info.trim_start().starts_with('{') {
        after_open
    } else {
        body
    };
    let (body, _) = body.split_once("```")?;
    Some(body.trim())
}

fn brace_span(text: &str) -> Option<&str> {
    let open = text.find('{')?;
    let close = text.rfind('}')?;
    (open < close).then(|| &text[open..=close])
}
