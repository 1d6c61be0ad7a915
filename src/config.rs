//! Run configuration.
//!
//! The config is a YAML document describing the workbook, the output fields to
//! fill, pacing and retry knobs, an optional row filter and the completion
//! service. Paths are resolved against the directory holding the config file.
use crate::enrich::schema::ResponseSchema;
use anyhow::{anyhow, Context, Result};
use serde::de::{MapAccess, Visitor};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

pub const DEFAULT_SHEET_NAME: &str = "Sheet1";
pub const DEFAULT_API_KEY_ENV_VAR: &str = "OPENAI_API_KEY";
pub const DEFAULT_MODEL: &str = "gpt-4o-mini";
pub const DEFAULT_SYSTEM_MESSAGE: &str = "You are a helpful assistant.";
pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

fn default_sheet_name() -> String {
    DEFAULT_SHEET_NAME.to_string()
}

fn default_max_tokens() -> u32 {
    50
}

fn default_temperature() -> f64 {
    0.7
}

fn default_sleep_time() -> f64 {
    1.0
}

fn default_retry_attempts() -> u32 {
    3
}

fn default_retry_delay() -> f64 {
    5.0
}

fn default_api_key_env_var() -> String {
    DEFAULT_API_KEY_ENV_VAR.to_string()
}

fn default_model() -> String {
    DEFAULT_MODEL.to_string()
}

fn default_system_message() -> String {
    DEFAULT_SYSTEM_MESSAGE.to_string()
}

fn default_base_url() -> String {
    DEFAULT_BASE_URL.to_string()
}

fn default_timeout_secs() -> u64 {
    60
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    pub excel: ExcelConfig,
    pub columns: ColumnsConfig,
    #[serde(default)]
    pub processing: ProcessingConfig,
    #[serde(default)]
    pub filter: FilterConfig,
    #[serde(default)]
    pub openai: OpenAiConfig,
    #[serde(default)]
    pub gateway: GatewayConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExcelConfig {
    pub input_path: PathBuf,
    #[serde(default)]
    pub output_path: Option<PathBuf>,
    #[serde(default = "default_sheet_name")]
    pub sheet_name: String,
}

impl ExcelConfig {
    /// Where the enriched workbook is written.
    pub fn destination(&self) -> &Path {
        self.output_path.as_deref().unwrap_or(self.input_path.as_path())
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ColumnsConfig {
    /// Input columns used by fields that do not list their own.
    #[serde(default)]
    pub input: Vec<String>,
    #[serde(deserialize_with = "deserialize_output_fields")]
    pub output: Vec<OutputFieldSpec>,
}

/// One column to fill, keyed by its header text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OutputFieldSpec {
    #[serde(skip_deserializing)]
    pub name: String,
    pub prompt: String,
    #[serde(default)]
    pub input_columns: Vec<String>,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f64,
    #[serde(default)]
    pub fetch_all: bool,
    #[serde(default, alias = "schema")]
    pub response_format: Option<ResponseSchema>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProcessingConfig {
    /// Pause after each field, in seconds.
    #[serde(default = "default_sleep_time")]
    pub sleep_time: f64,
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,
    /// Pause between failed attempts, in seconds.
    #[serde(default = "default_retry_delay")]
    pub retry_delay: f64,
    #[serde(default)]
    pub max_rows: Option<usize>,
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            sleep_time: default_sleep_time(),
            retry_attempts: default_retry_attempts(),
            retry_delay: default_retry_delay(),
            max_rows: None,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FilterConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub criteria: Vec<FilterCriterion>,
}

impl FilterConfig {
    /// Criteria that take effect; empty when filtering is switched off.
    pub fn active_criteria(&self) -> &[FilterCriterion] {
        if self.enabled {
            &self.criteria
        } else {
            &[]
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FilterCriterion {
    pub column: String,
    #[serde(alias = "operator")]
    pub operation: FilterOperator,
    #[serde(default)]
    pub value: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterOperator {
    Equals,
    Contains,
    In,
    GreaterThan,
    LessThan,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OpenAiConfig {
    #[serde(default = "default_api_key_env_var")]
    pub api_key_env_var: String,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_system_message")]
    pub system_message: String,
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for OpenAiConfig {
    fn default() -> Self {
        Self {
            api_key_env_var: default_api_key_env_var(),
            model: default_model(),
            system_message: default_system_message(),
            base_url: default_base_url(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

/// Selects a local command instead of the HTTP service when set.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GatewayConfig {
    #[serde(default)]
    pub command: Option<String>,
}

fn deserialize_output_fields<'de, D>(deserializer: D) -> Result<Vec<OutputFieldSpec>, D::Error>
where
    D: Deserializer<'de>,
{
    struct OutputFieldsVisitor;

    impl<'de> Visitor<'de> for OutputFieldsVisitor {
        type Value = Vec<OutputFieldSpec>;

        fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
            formatter.write_str("a mapping from column name to field settings")
        }

        fn visit_map<A>(self, mut map: A) -> Result<Self::Value, A::Error>
        where
            A: MapAccess<'de>,
        {
            let mut fields = Vec::new();
            let mut seen = BTreeSet::new();
            while let Some((name, mut spec)) = map.next_entry::<String, OutputFieldSpec>()? {
                let name = name.trim().to_string();
                if !seen.insert(name.clone()) {
                    return Err(serde::de::Error::custom(format!(
                        "output column {name:?} is listed twice"
                    )));
                }
                spec.name = name;
                fields.push(spec);
            }
            Ok(fields)
        }
    }

    deserializer.deserialize_map(OutputFieldsVisitor)
}

/// Load, normalize and validate the config at `path`.
pub fn load_config(path: &Path) -> Result<Config> {
    let text =
        fs::read_to_string(path).with_context(|| format!("read config {}", path.display()))?;
    let mut config: Config = serde_yaml::from_str(&text)
        .with_context(|| format!("parse config {}", path.display()))?;
    let base_dir = path.parent().unwrap_or_else(|| Path::new(""));
    normalize_config(&mut config, base_dir);
    validate_config(&config)?;
    Ok(config)
}

/// Resolve relative paths and fill per-field input columns from the defaults.
pub fn normalize_config(config: &mut Config, base_dir: &Path) {
    if !config.excel.input_path.as_os_str().is_empty() {
        config.excel.input_path = resolve_path(base_dir, &config.excel.input_path);
    }
    if let Some(output) = config.excel.output_path.take() {
        config.excel.output_path = Some(resolve_path(base_dir, &output));
    }
    for field in &mut config.columns.output {
        if field.input_columns.is_empty() {
            field.input_columns = config.columns.input.clone();
        }
    }
}

fn resolve_path(base_dir: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base_dir.join(path)
    }
}

pub fn validate_config(config: &Config) -> Result<()> {
    if config.excel.input_path.as_os_str().is_empty() {
        return Err(anyhow!("excel.input_path must be non-empty"));
    }
    if config.excel.sheet_name.trim().is_empty() {
        return Err(anyhow!("excel.sheet_name must be non-empty"));
    }
    if config.columns.output.is_empty() {
        return Err(anyhow!("columns.output must list at least one column"));
    }
    for field in &config.columns.output {
        validate_field(field)?;
    }
    validate_processing(&config.processing)?;
    for criterion in &config.filter.criteria {
        if criterion.column.trim().is_empty() {
            return Err(anyhow!("filter criteria must name a column"));
        }
    }
    if config.openai.api_key_env_var.trim().is_empty() {
        return Err(anyhow!("openai.api_key_env_var must be non-empty"));
    }
    if config.openai.model.trim().is_empty() {
        return Err(anyhow!("openai.model must be non-empty"));
    }
    if let Some(command) = config.gateway.command.as_deref() {
        if command.trim().is_empty() {
            return Err(anyhow!("gateway.command must be non-empty when set"));
        }
    }
    Ok(())
}

fn validate_field(field: &OutputFieldSpec) -> Result<()> {
    let name = field.name.as_str();
    if name.is_empty() {
        return Err(anyhow!("output column names must be non-empty"));
    }
    if field.prompt.trim().is_empty() {
        return Err(anyhow!("prompt for {name:?} must be non-empty"));
    }
    if field.max_tokens == 0 {
        return Err(anyhow!("max_tokens for {name:?} must be at least 1"));
    }
    if !(0.0..=2.0).contains(&field.temperature) {
        return Err(anyhow!(
            "temperature for {name:?} must be between 0 and 2 (got {})",
            field.temperature
        ));
    }
    if field.input_columns.iter().any(|column| column.trim().is_empty()) {
        return Err(anyhow!("input_columns for {name:?} contains an empty name"));
    }
    if let Some(schema) = &field.response_format {
        schema.validate(name)?;
    }
    Ok(())
}

fn validate_processing(processing: &ProcessingConfig) -> Result<()> {
    if processing.retry_attempts == 0 {
        return Err(anyhow!("processing.retry_attempts must be at least 1"));
    }
    for (label, seconds) in [
        ("processing.sleep_time", processing.sleep_time),
        ("processing.retry_delay", processing.retry_delay),
    ] {
        if !seconds.is_finite() || seconds < 0.0 {
            return Err(anyhow!(
                "{label} must be a non-negative number of seconds (got {seconds})"
            ));
        }
    }
    Ok(())
}

/// Load `.env` from the working directory; a missing file is not an error.
pub fn load_dotenv() {
    match dotenvy::dotenv() {
        Ok(path) => tracing::debug!(path = %path.display(), "loaded environment file"),
        Err(err) if err.not_found() => {}
        Err(err) => tracing::warn!(error = %err, "ignoring unreadable environment file"),
    }
}

/// Read the API key from the configured environment variable.
pub fn resolve_api_key(openai: &OpenAiConfig) -> Result<String> {
    resolve_api_key_with(openai, |name| std::env::var(name).ok())
}

pub fn resolve_api_key_with(
    openai: &OpenAiConfig,
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<String> {
    let name = openai.api_key_env_var.as_str();
    match lookup(name) {
        Some(key) if !key.trim().is_empty() => Ok(key.trim().to_string()),
        _ => Err(anyhow!(
            "API key not found: set {name} in the environment or a .env file"
        )),
    }
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;
