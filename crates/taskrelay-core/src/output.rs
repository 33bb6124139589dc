//! Parser for the agent's `stream-json` output.
//!
//! Each stdout line is one JSON event. `assistant` events carry content
//! blocks that become [`Step`]s; `result` events carry the final outcome.
//! Everything else (system/init, user tool results) is ignored, as are lines
//! that are not valid JSON.

use serde::Deserialize;
use serde_json::Value;

use crate::job::Step;

/// Per-argument limit for tool use summaries.
pub const MAX_ARG_CHARS: usize = 50;
/// Limit for a whole tool use summary.
pub const MAX_SUMMARY_CHARS: usize = 200;

const ELLIPSIS: &str = "...";

/// Final event emitted by the agent.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct AgentResult {
    #[serde(default)]
    pub subtype: Option<String>,
    #[serde(default)]
    pub is_error: bool,
    #[serde(default)]
    pub result: Option<String>,
    #[serde(default, alias = "cost_usd")]
    pub total_cost_usd: Option<f64>,
    #[serde(default)]
    pub duration_ms: Option<u64>,
}

impl AgentResult {
    /// Text describing the outcome, falling back to the subtype for errors
    /// that carry no message.
    pub fn text(&self) -> Option<String> {
        let text = self
            .result
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(str::to_string);
        if text.is_none() && self.is_error {
            return Some(
                self.subtype
                    .clone()
                    .unwrap_or_else(|| "agent reported an error".to_string()),
            );
        }
        text
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedOutput {
    pub steps: Vec<Step>,
    /// Last `result` event seen, if any.
    pub result: Option<AgentResult>,
}

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum StreamEvent {
    Assistant { message: AssistantMessage },
    Result(AgentResult),
    #[serde(other)]
    Other,
}

#[derive(Deserialize)]
struct AssistantMessage {
    #[serde(default)]
    content: Vec<ContentBlock>,
}

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentBlock {
    Text {
        text: String,
    },
    ToolUse {
        name: String,
        #[serde(default)]
        input: Value,
    },
    #[serde(other)]
    Other,
}

/// Parses a full stdout capture.
pub fn parse_output(raw: &str) -> ParsedOutput {
    parse_lines(raw.lines())
}

/// Parses stream-json lines into steps and the final result.
pub fn parse_lines<'a>(lines: impl IntoIterator<Item = &'a str>) -> ParsedOutput {
    let mut parsed = ParsedOutput::default();

    for line in lines {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let Ok(event) = serde_json::from_str::<StreamEvent>(line) else {
            continue;
        };
        match event {
            StreamEvent::Assistant { message } => {
                for block in message.content {
                    match block {
                        ContentBlock::Text { text } => {
                            let text = text.trim();
                            if !text.is_empty() {
                                parsed.steps.push(Step::text(text));
                            }
                        }
                        ContentBlock::ToolUse { name, input } => {
                            parsed.steps.push(Step::tool_use(format_tool_use(&name, &input)));
                        }
                        ContentBlock::Other => {}
                    }
                }
            }
            StreamEvent::Result(result) => parsed.result = Some(result),
            StreamEvent::Other => {}
        }
    }

    parsed
}

/// Renders a tool call as `name(key="value", key2=value2)`.
pub fn format_tool_use(name: &str, input: &Value) -> String {
    let args = match input {
        Value::Null => String::new(),
        Value::Object(map) => map
            .iter()
            .map(|(key, value)| match value {
                Value::String(s) => format!("{key}=\"{}\"", truncate(s, MAX_ARG_CHARS)),
                other => format!("{key}={}", truncate(&other.to_string(), MAX_ARG_CHARS)),
            })
            .collect::<Vec<_>>()
            .join(", "),
        other => truncate(&other.to_string(), MAX_ARG_CHARS),
    };
    truncate(&format!("{name}({args})"), MAX_SUMMARY_CHARS)
}

/// Truncates to at most `max` characters, ending in `...` when shortened.
pub fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        return s.to_string();
    }
    let keep = max.saturating_sub(ELLIPSIS.len());
    let mut out: String = s.chars().take(keep).collect();
    out.push_str(ELLIPSIS);
    out
}
