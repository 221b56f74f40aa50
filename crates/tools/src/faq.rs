//! Keyword FAQ lookup over business facts and markdown docs.
//!
//! Business config is flattened into one chunk per leaf (keyed by its dotted
//! path); each markdown file under the docs directory is split into
//! paragraph sections. A question's tokens are scored against every chunk
//! and the best chunk wins.

use async_trait::async_trait;
use chrono::Utc;
use concierge_config::{AddonsConfig, BusinessConfig, CompanyConfig, PoliciesConfig, PricingConfig};
use concierge_core::error::ToolError;
use concierge_core::event::{DomainEvent, EventBus};
use concierge_core::tool::{Tool, ToolContext, parse_arguments};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, warn};

const MAX_ANSWER_CHARS: usize = 600;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceType {
    Kb,
    Doc,
}

impl SourceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Kb => "kb",
            Self::Doc => "doc",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FaqSource {
    pub source_type: SourceType,
    pub source_key: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FaqAnswer {
    pub found: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub answer: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<FaqSource>,
}

impl FaqAnswer {
    fn not_found() -> Self {
        Self {
            found: false,
            answer: None,
            metadata: None,
        }
    }
}

#[derive(Serialize)]
struct Facts<'a> {
    company: &'a CompanyConfig,
    pricing: &'a PricingConfig,
    addons: &'a AddonsConfig,
    policies: &'a PoliciesConfig,
}

#[derive(Debug)]
struct Chunk {
    key: String,
    text: String,
    lowercase: String,
    source_type: SourceType,
}

impl Chunk {
    fn new(key: String, text: String, source_type: SourceType) -> Self {
        let lowercase = text.to_lowercase();
        Self {
            key,
            text,
            lowercase,
            source_type,
        }
    }

    fn score(&self, tokens: &[String]) -> usize {
        tokens.iter().filter(|t| self.lowercase.contains(t.as_str())).count()
    }
}

/// Searchable knowledge, built once at startup.
#[derive(Debug, Default)]
pub struct FaqIndex {
    chunks: Vec<Chunk>,
}

impl FaqIndex {
    /// Index the business facts plus any markdown under `docs_dir`.
    pub fn from_business(business: &BusinessConfig) -> Self {
        let facts = serde_json::to_value(Facts {
            company: &business.company,
            pricing: &business.pricing,
            addons: &business.addons,
            policies: &business.policies,
        })
        .unwrap_or_default();
        let docs = business
            .docs_dir
            .as_deref()
            .map(read_docs)
            .unwrap_or_default();
        Self::from_parts(&facts, docs)
    }

    /// Index a facts tree and `(file name, contents)` documents.
    pub fn from_parts(facts: &Value, docs: Vec<(String, String)>) -> Self {
        let mut chunks = Vec::new();
        flatten(facts, "", &mut chunks);

        for (file, content) in docs {
            let content = content.replace("\r\n", "\n");
            let sections: Vec<&str> = content
                .split("\n\n")
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .collect();
            let numbered = sections.len() > 1;
            for (i, section) in sections.iter().enumerate() {
                let key = if numbered {
                    format!("{file}#{}", i + 1)
                } else {
                    file.clone()
                };
                chunks.push(Chunk::new(key, section.to_string(), SourceType::Doc));
            }
        }

        debug!(chunks = chunks.len(), "FAQ index built");
        Self { chunks }
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// Best-scoring chunk for the question. Ties keep the earliest chunk,
    /// so business facts win over docs.
    pub fn answer(&self, question: &str) -> FaqAnswer {
        let tokens = tokenize(question);
        if tokens.is_empty() {
            return FaqAnswer::not_found();
        }

        let mut best: Option<(&Chunk, usize)> = None;
        for chunk in &self.chunks {
            let score = chunk.score(&tokens);
            if score > best.map_or(0, |(_, s)| s) {
                best = Some((chunk, score));
            }
        }

        match best {
            Some((chunk, _)) => FaqAnswer {
                found: true,
                answer: Some(truncate(&chunk.text)),
                metadata: Some(FaqSource {
                    source_type: chunk.source_type,
                    source_key: chunk.key.clone(),
                }),
            },
            None => FaqAnswer::not_found(),
        }
    }
}

/// Lowercased alphanumeric runs longer than two characters.
fn tokenize(question: &str) -> Vec<String> {
    question
        .to_lowercase()
        .split(|c: char| !(c.is_ascii_lowercase() || c.is_ascii_digit()))
        .filter(|t| t.len() > 2)
        .map(String::from)
        .collect()
}

fn truncate(text: &str) -> String {
    if text.chars().count() <= MAX_ANSWER_CHARS {
        return text.to_string();
    }
    let head: String = text.chars().take(MAX_ANSWER_CHARS - 3).collect();
    format!("{head}...")
}

fn flatten(value: &Value, prefix: &str, out: &mut Vec<Chunk>) {
    match value {
        Value::Null => {}
        Value::Object(map) => {
            for (key, inner) in map {
                let path = if prefix.is_empty() {
                    key.clone()
                } else {
                    format!("{prefix}.{key}")
                };
                flatten(inner, &path, out);
            }
        }
        other => {
            let text = render(other);
            if !text.trim().is_empty() {
                out.push(Chunk::new(prefix.to_string(), text, SourceType::Kb));
            }
        }
    }
}

fn render(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Number(n) => match n.as_f64() {
            Some(f) if f.fract() == 0.0 && f.abs() < 1e15 => format!("{}", f as i64),
            _ => n.to_string(),
        },
        Value::Bool(b) => b.to_string(),
        Value::Array(items) => items.iter().map(render).collect::<Vec<_>>().join(", "),
        Value::Object(map) => map
            .iter()
            .map(|(k, v)| format!("{k}: {}", render(v)))
            .collect::<Vec<_>>()
            .join("; "),
    }
}

fn read_docs(dir: &Path) -> Vec<(String, String)> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            warn!(dir = %dir.display(), error = %e, "FAQ docs directory unreadable");
            return Vec::new();
        }
    };

    let mut docs: Vec<(String, String)> = entries
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| {
            let name = entry.file_name().to_string_lossy().into_owned();
            if !name.to_lowercase().ends_with(".md") {
                return None;
            }
            match std::fs::read_to_string(entry.path()) {
                Ok(content) => Some((name, content)),
                Err(e) => {
                    warn!(file = %name, error = %e, "Skipping unreadable FAQ doc");
                    None
                }
            }
        })
        .collect();
    docs.sort_by(|a, b| a.0.cmp(&b.0));
    docs
}

#[derive(Deserialize)]
struct FaqArgs {
    question: String,
}

pub struct FaqTool {
    index: Arc<FaqIndex>,
    events: Arc<EventBus>,
}

impl FaqTool {
    pub fn new(index: Arc<FaqIndex>, events: Arc<EventBus>) -> Self {
        Self { index, events }
    }

    fn parse(&self, arguments: &Value) -> Result<FaqArgs, ToolError> {
        let args: FaqArgs = parse_arguments(arguments)?;
        if args.question.trim().is_empty() {
            return Err(ToolError::InvalidArguments("question is required".into()));
        }
        Ok(args)
    }
}

#[async_trait]
impl Tool for FaqTool {
    fn name(&self) -> &str {
        "faq_lookup"
    }

    fn description(&self) -> &str {
        "Answer policy or pricing questions using the cleaning knowledge base and approved docs. Respond with not_found when information is unavailable."
    }

    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "required": ["question"],
            "properties": {
                "question": { "type": "string" }
            }
        })
    }

    fn validate(&self, arguments: &Value) -> Result<(), ToolError> {
        self.parse(arguments).map(|_| ())
    }

    async fn execute(&self, arguments: Value, _context: &ToolContext) -> Result<Value, ToolError> {
        let args = self.parse(&arguments)?;
        let answer = self.index.answer(&args.question);

        if let Some(source) = &answer.metadata {
            self.events.publish(DomainEvent::FaqDeflected {
                source_type: source.source_type.as_str().to_string(),
                source_key: source.source_key.clone(),
                timestamp: Utc::now(),
            });
        }

        serde_json::to_value(answer).map_err(|e| ToolError::failed("faq_lookup", e.to_string()))
    }
}
