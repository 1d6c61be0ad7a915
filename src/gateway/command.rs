//! Local command gateway.
//!
//! Spawns a user-configured command (any tool that reads a prompt on stdin and
//! answers on stdout, e.g. `llm`, `ollama run`, or a script) once per request.
//! The command line is split with shell quoting rules and its program resolved
//! up front so a typo fails the run before any row is touched.
use super::{parse_json_object, Completion, CompletionGateway, CompletionRequest};
use anyhow::{anyhow, Context, Result};
use std::io::Write;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::time::Instant;

#[derive(Debug, Clone)]
pub struct CommandGateway {
    program: PathBuf,
    args: Vec<String>,
    command_line: String,
}

impl CommandGateway {
    pub fn new(command_line: &str) -> Result<Self> {
        let args = shell_words::split(command_line)
            .with_context(|| format!("parse gateway command: {command_line}"))?;
        let Some((program, args)) = args.split_first() else {
            return Err(anyhow!("gateway command is empty"));
        };
        let program = which::which(program)
            .with_context(|| format!("resolve gateway command {program:?}"))?;
        Ok(Self {
            program,
            args: args.to_vec(),
            command_line: command_line.to_string(),
        })
    }
}

impl CompletionGateway for CommandGateway {
    fn complete(&self, request: &CompletionRequest) -> Result<Completion> {
        let prompt = render_stdin(request);
        let start = Instant::now();
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("spawn gateway command: {}", self.program.display()))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(prompt.as_bytes())
                .context("write prompt to gateway stdin")?;
        }

        let output = child
            .wait_with_output()
            .context("wait for gateway command")?;
        let elapsed_ms = start.elapsed().as_millis();

        tracing::debug!(
            elapsed_ms,
            prompt_bytes = prompt.len(),
            response_bytes = output.stdout.len(),
            "gateway command complete"
        );

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow!(
                "gateway command failed with status {}: {}",
                output.status,
                stderr.trim()
            ));
        }

        let text = String::from_utf8(output.stdout).context("decode gateway stdout as UTF-8")?;
        if request.structured.is_some() {
            if let Some(value) = parse_json_object(&text) {
                return Ok(Completion::Structured(value));
            }
        }
        Ok(Completion::Text(text))
    }

    fn describe(&self) -> String {
        format!("command `{}`", self.command_line)
    }
}

/// Prompt protocol on stdin: system message, blank line, user prompt, and
/// the response schema when one is requested.
fn render_stdin(request: &CompletionRequest) -> String {
    let mut text = String::new();
    if !request.system_message.trim().is_empty() {
        text.push_str(request.system_message.trim_end());
        text.push_str("\n\n");
    }
    text.push_str(&request.prompt);
    if let Some(structured) = &request.structured {
        text.push_str("\n\nRespond ONLY with a JSON object matching this schema, no other text:\n");
        text.push_str(&structured.schema.to_string());
    }
    text.push('\n');
    text
}
