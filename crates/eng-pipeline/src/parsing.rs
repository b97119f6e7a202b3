use eng_core::types::{GateRule, OutputFormat, ResourceCounters, ResultMode};
use regex::Regex;
use serde_json::Value;
use std::sync::OnceLock;

/// Try, in order, to pull a structured JSON value out of an agent's raw
/// output: the whole text as JSON, a `result`/`structured_output` field
/// from a streamed `result` event, a greedy `{...}` match, then a lazy
/// `{...}` match. Each candidate only counts if it actually parses — a
/// later strategy is never consulted once an earlier one succeeds.
///
/// Only attempted for structured formats, and only on a stage's first
/// attempt: redo attempts replay as free-form text per the approval flow.
pub fn extract_structured_output(
    raw_output: &str,
    attempt_number: i64,
    output_format: OutputFormat,
) -> Option<Value> {
    if !output_format.is_structured() || attempt_number > 1 {
        return None;
    }

    let trimmed = raw_output.trim();
    if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
        if value.is_object() || value.is_array() {
            return Some(value);
        }
    }

    if let Some(value) = extract_from_stream_events(raw_output) {
        return Some(value);
    }

    if let Some(value) = greedy_regex()
        .find(raw_output)
        .and_then(|m| serde_json::from_str::<Value>(m.as_str()).ok())
    {
        return Some(value);
    }

    lazy_regex()
        .find(raw_output)
        .and_then(|m| serde_json::from_str::<Value>(m.as_str()).ok())
}

/// Scan each line for a `{"type": "result", ...}` event and pull its
/// `structured_output` field (already-embedded JSON), falling back to a
/// `result` field that is itself a JSON-encoded string. The last matching
/// line wins, mirroring a streamed transcript where later events
/// supersede earlier partial ones.
fn extract_from_stream_events(raw_output: &str) -> Option<Value> {
    let mut found = None;
    for line in raw_output.lines() {
        let Ok(event) = serde_json::from_str::<Value>(line.trim()) else {
            continue;
        };
        if event.get("type").and_then(Value::as_str) != Some("result") {
            continue;
        }
        if let Some(structured) = event.get("structured_output") {
            if !structured.is_null() {
                found = Some(structured.clone());
                continue;
            }
        }
        if let Some(result) = event.get("result") {
            if let Some(text) = result.as_str() {
                if let Ok(value) = serde_json::from_str::<Value>(text) {
                    found = Some(value);
                    continue;
                }
            } else if !result.is_null() {
                found = Some(result.clone());
            }
        }
    }
    found
}

/// Scan every `{"type": "result", ...}` event in the stream for its `usage`,
/// `total_cost_usd`, `duration_ms` and `num_turns` fields, per §4.1.1 step
/// 11 ("Update usage counters from `result` events"). Later events win,
/// same as `extract_from_stream_events`, since a longer-running attempt's
/// last `result` event carries the cumulative totals.
pub fn extract_usage_counters(raw_output: &str) -> ResourceCounters {
    let mut counters = ResourceCounters::default();
    for line in raw_output.lines() {
        let Ok(event) = serde_json::from_str::<Value>(line.trim()) else {
            continue;
        };
        if event.get("type").and_then(Value::as_str) != Some("result") {
            continue;
        }
        if let Some(usage) = event.get("usage") {
            if let Some(n) = usage.get("input_tokens").and_then(Value::as_u64) {
                counters.input_tokens = n;
            }
            if let Some(n) = usage.get("output_tokens").and_then(Value::as_u64) {
                counters.output_tokens = n;
            }
        }
        if let Some(cost) = event.get("total_cost_usd").and_then(Value::as_f64) {
            counters.cost_usd = cost;
        }
        if let Some(ms) = event.get("duration_ms").and_then(Value::as_u64) {
            counters.duration_ms = ms;
        }
        if let Some(turns) = event.get("num_turns").and_then(Value::as_u64) {
            counters.num_turns = turns as u32;
        }
    }
    counters
}

fn greedy_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)\{.*\}").expect("valid regex"))
}

fn lazy_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)\{.*?\}").expect("valid regex"))
}

/// Render the text that becomes a stage's `stage_result` for this attempt,
/// before `result_mode` folds it against whatever the previous attempt (or
/// stage, for `append`/`passthrough`) produced. Mirrors the per-format table
/// in §4.1.2: each structured envelope contributes a specific field rather
/// than its whole JSON shape.
pub fn render_view(
    output_format: OutputFormat,
    parsed: Option<&Value>,
    raw_output: &str,
    decision: Option<&Value>,
    attempt_number: i64,
) -> String {
    let raw = raw_output.trim();
    match output_format {
        OutputFormat::Research => field_or_raw(parsed, "research", raw),
        OutputFormat::Plan => field_or_raw(parsed, "plan", raw),
        OutputFormat::Options => render_options_view(parsed, decision, raw),
        OutputFormat::Findings if attempt_number <= 1 => field_or_raw(parsed, "summary", raw),
        _ => raw.to_string(),
    }
}

/// Pull a named field out of a structured envelope as text (joining array
/// elements with newlines), falling back to the raw text when the field is
/// absent or the envelope itself never parsed.
fn field_or_raw(parsed: Option<&Value>, field: &str, raw: &str) -> String {
    match parsed.and_then(|v| v.get(field)) {
        Some(Value::String(s)) => s.trim().to_string(),
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(|v| v.as_str().map(str::to_string).or_else(|| Some(v.to_string())))
            .collect::<Vec<_>>()
            .join("\n"),
        Some(other) => serde_json::to_string_pretty(other).unwrap_or_else(|_| raw.to_string()),
        None => raw.to_string(),
    }
}

/// If a decision selecting one option is present, format "Selected Approach:
/// … " with its pros/cons; otherwise fall back to the raw envelope text.
fn render_options_view(parsed: Option<&Value>, decision: Option<&Value>, raw: &str) -> String {
    let (Some(parsed), Some(decision)) = (parsed, decision) else {
        return raw.to_string();
    };
    let Some(options) = parsed.get("options").and_then(Value::as_array) else {
        return raw.to_string();
    };
    let Some(selected_id) = selected_option_id(decision) else {
        return raw.to_string();
    };
    let Some(option) = options.iter().find(|o| {
        o.get("id").and_then(Value::as_str) == Some(selected_id.as_str())
            || o.get("title").and_then(Value::as_str) == Some(selected_id.as_str())
    }) else {
        return raw.to_string();
    };

    let title = option.get("title").and_then(Value::as_str).unwrap_or(&selected_id);
    let mut out = format!("Selected Approach: {title}");
    if let Some(description) = option.get("description").and_then(Value::as_str) {
        out.push_str("\n\n");
        out.push_str(description.trim());
    }
    if let Some(pros) = option.get("pros").and_then(Value::as_array) {
        out.push_str("\n\nPros:\n");
        out.push_str(&bullet_list(pros));
    }
    if let Some(cons) = option.get("cons").and_then(Value::as_array) {
        out.push_str("\n\nCons:\n");
        out.push_str(&bullet_list(cons));
    }
    out
}

fn bullet_list(items: &[Value]) -> String {
    items
        .iter()
        .filter_map(Value::as_str)
        .map(|s| format!("- {s}"))
        .collect::<Vec<_>>()
        .join("\n")
}

/// A decision for an `options` gate is normally `require_selection{1,1}`: a
/// single-element array, or (per §4.1.3) a bare scalar treated as one
/// selection.
fn selected_option_id(decision: &Value) -> Option<String> {
    match decision {
        Value::Array(items) => items.first().and_then(selected_option_id),
        Value::String(s) => Some(s.clone()),
        Value::Object(map) => map
            .get("id")
            .or_else(|| map.get("selected"))
            .and_then(Value::as_str)
            .map(str::to_string),
        _ => None,
    }
}

/// Fold a newly-rendered view into the stage's persisted `stage_result`
/// per `result_mode`.
pub fn compose_stage_result(result_mode: ResultMode, new_view: &str, previous: Option<&str>) -> String {
    match result_mode {
        ResultMode::Replace => new_view.to_string(),
        ResultMode::Append => match previous {
            Some(prev) if !prev.trim().is_empty() => format!("{prev}\n\n---\n\n{new_view}"),
            _ => new_view.to_string(),
        },
        ResultMode::Passthrough => previous.map(str::to_string).unwrap_or_else(|| new_view.to_string()),
    }
}

const MAX_SUMMARY_SENTENCES: usize = 3;

/// A short human-readable summary of an attempt's output, used to fill
/// `{{stage_summaries}}` in later prompts and as the PR-preparation
/// description text. Follows the per-format table in §4.1.2.
pub fn render_summary(
    output_format: OutputFormat,
    parsed: Option<&Value>,
    raw_output: &str,
    decision: Option<&Value>,
    attempt_number: i64,
) -> String {
    let raw = raw_output.trim();
    match output_format {
        OutputFormat::Research => first_sentences(&field_or_raw(parsed, "research", raw)),
        OutputFormat::Plan => first_sentences(&field_or_raw(parsed, "plan", raw)),
        OutputFormat::Options => render_options_summary(parsed, decision, raw),
        OutputFormat::Findings if attempt_number <= 1 => parsed
            .and_then(|v| v.get("summary"))
            .and_then(Value::as_str)
            .map(|s| s.trim().to_string())
            .unwrap_or_else(|| first_sentences(raw)),
        OutputFormat::Findings | OutputFormat::PrReview => first_sentences(raw),
        OutputFormat::Text => text_summary(raw),
        _ => first_sentences(raw),
    }
}

fn render_options_summary(parsed: Option<&Value>, decision: Option<&Value>, raw: &str) -> String {
    let Some(parsed) = parsed else { return first_sentences(raw) };
    let Some(options) = parsed.get("options").and_then(Value::as_array) else {
        return first_sentences(raw);
    };
    let Some(selected_id) = decision.and_then(selected_option_id) else {
        return first_sentences(raw);
    };
    let Some(option) = options.iter().find(|o| {
        o.get("id").and_then(Value::as_str) == Some(selected_id.as_str())
            || o.get("title").and_then(Value::as_str) == Some(selected_id.as_str())
    }) else {
        return first_sentences(raw);
    };
    let title = option.get("title").and_then(Value::as_str).unwrap_or(&selected_id);
    let detail = option
        .get("description")
        .and_then(Value::as_str)
        .map(str::trim)
        .unwrap_or("");
    if detail.is_empty() {
        format!("Selected: {title}")
    } else {
        format!("Selected: {title} — {detail}")
    }
}

/// The last non-empty paragraph of `raw`, unless it contains an explicit
/// `Summary` or `Changes Made` section header, in which case that section's
/// body is used instead.
fn text_summary(raw: &str) -> String {
    if let Some(section) = named_section(raw, "summary").or_else(|| named_section(raw, "changes made")) {
        return section;
    }
    raw.split("\n\n")
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .last()
        .unwrap_or(raw)
        .to_string()
}

/// Find a `## Summary` / `Summary:` style heading (case-insensitive) and
/// return the text up to the next heading or end of input.
fn named_section(raw: &str, heading: &str) -> Option<String> {
    let lower = raw.to_lowercase();
    let heading_lower = heading.to_lowercase();
    let start = lower
        .lines()
        .scan(0usize, |pos, line| {
            let line_start = *pos;
            *pos += line.len() + 1;
            Some((line_start, line))
        })
        .find(|(_, line)| {
            let trimmed = line.trim_start_matches('#').trim().trim_end_matches(':').trim();
            trimmed.eq_ignore_ascii_case(&heading_lower)
        })
        .map(|(pos, line)| pos + line.len() + 1)?;

    let rest = &raw[start.min(raw.len())..];
    let end = rest
        .lines()
        .scan(0usize, |pos, line| {
            let line_start = *pos;
            *pos += line.len() + 1;
            Some((line_start, line))
        })
        .find(|(_, line)| line.trim_start().starts_with('#') || line.trim_end().ends_with(':'))
        .map(|(pos, _)| pos)
        .unwrap_or(rest.len());

    let section = rest[..end.min(rest.len())].trim();
    if section.is_empty() { None } else { Some(section.to_string()) }
}

/// The first `MAX_SUMMARY_SENTENCES` sentences of `text`, split on
/// `.`/`!`/`?` followed by whitespace.
fn first_sentences(text: &str) -> String {
    let text = text.trim();
    if text.is_empty() {
        return String::new();
    }
    let mut sentences = Vec::new();
    let mut start = 0;
    let chars: Vec<(usize, char)> = text.char_indices().collect();
    for i in 0..chars.len() {
        let (idx, c) = chars[i];
        if matches!(c, '.' | '!' | '?') {
            let next_is_boundary = chars.get(i + 1).map(|(_, n)| n.is_whitespace()).unwrap_or(true);
            if next_is_boundary {
                let end = idx + c.len_utf8();
                sentences.push(text[start..end].trim().to_string());
                start = end;
                if sentences.len() == MAX_SUMMARY_SENTENCES {
                    break;
                }
            }
        }
    }
    if sentences.is_empty() {
        return text.to_string();
    }
    if start < text.len() && sentences.len() < MAX_SUMMARY_SENTENCES {
        let rest = text[start..].trim();
        if !rest.is_empty() {
            sentences.push(rest.to_string());
        }
    }
    sentences.join(" ")
}

/// Validate a user's approval decision against a stage template's gate
/// rule. Returns the reason for failure, if any.
pub fn validate_gate(rule: &GateRule, decision: Option<&Value>) -> Result<(), String> {
    match rule {
        GateRule::RequireApproval => Ok(()),

        GateRule::RequireSelection { min, max } => {
            let count = match decision {
                Some(Value::Array(items)) => items.len(),
                Some(Value::Null) | None => 0,
                Some(_) => 1,
            };
            if count < *min || count > *max {
                Err(format!(
                    "selection of {count} item(s) is outside the allowed range [{min}, {max}]"
                ))
            } else {
                Ok(())
            }
        }

        GateRule::RequireAllChecked => {
            let items = decision
                .and_then(Value::as_array)
                .ok_or_else(|| "expected an array of checkable items".to_string())?;
            let all_checked = items
                .iter()
                .all(|item| item.get("checked").and_then(Value::as_bool).unwrap_or(false));
            if all_checked {
                Ok(())
            } else {
                Err("not every item is checked".to_string())
            }
        }

        GateRule::RequireFields { fields } => {
            let object = decision
                .and_then(Value::as_object)
                .ok_or_else(|| "expected an object of field values".to_string())?;
            for field in fields {
                let non_empty = object
                    .get(field)
                    .and_then(Value::as_str)
                    .map(|s| !s.trim().is_empty())
                    .unwrap_or(false);
                if !non_empty {
                    return Err(format!("missing or empty required field '{field}'"));
                }
            }
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn extracts_whole_text_json() {
        let raw = r#"{"summary": "did the thing", "findings": []}"#;
        let value = extract_structured_output(raw, 1, OutputFormat::Findings).unwrap();
        assert_eq!(value["summary"], "did the thing");
    }

    #[test]
    fn skips_structured_extraction_on_redo_attempts() {
        let raw = r#"{"summary": "did the thing"}"#;
        assert!(extract_structured_output(raw, 2, OutputFormat::Findings).is_none());
    }

    #[test]
    fn skips_structured_extraction_for_text_format() {
        let raw = r#"{"summary": "did the thing"}"#;
        assert!(extract_structured_output(raw, 1, OutputFormat::Text).is_none());
    }

    #[test]
    fn extracts_from_streamed_result_event() {
        let raw = "{\"type\":\"assistant\",\"content\":\"thinking\"}\n\
                    {\"type\":\"result\",\"structured_output\":{\"plan\":[\"step 1\"]},\"result\":\"ok\"}\n";
        let value = extract_structured_output(raw, 1, OutputFormat::Plan).unwrap();
        assert_eq!(value["plan"][0], "step 1");
    }

    #[test]
    fn extracts_from_result_field_encoded_as_json_string() {
        let raw = "{\"type\":\"result\",\"result\":\"{\\\"options\\\":[1,2]}\"}\n";
        let value = extract_structured_output(raw, 1, OutputFormat::Options).unwrap();
        assert_eq!(value["options"][1], 2);
    }

    #[test]
    fn extract_usage_counters_reads_last_result_event() {
        let raw = "{\"type\":\"assistant\",\"message\":{}}\n\
                    {\"type\":\"result\",\"usage\":{\"input_tokens\":10,\"output_tokens\":5},\"total_cost_usd\":0.01,\"duration_ms\":1200,\"num_turns\":1}\n\
                    {\"type\":\"result\",\"usage\":{\"input_tokens\":30,\"output_tokens\":20},\"total_cost_usd\":0.05,\"duration_ms\":4000,\"num_turns\":3}\n";
        let counters = extract_usage_counters(raw);
        assert_eq!(counters.input_tokens, 30);
        assert_eq!(counters.output_tokens, 20);
        assert_eq!(counters.cost_usd, 0.05);
        assert_eq!(counters.duration_ms, 4000);
        assert_eq!(counters.num_turns, 3);
    }

    #[test]
    fn falls_back_to_greedy_regex_when_surrounded_by_prose() {
        let raw = "Here is my plan:\n{\"plan\": [\"a\", \"b\"]}\nLet me know what you think.";
        let value = extract_structured_output(raw, 1, OutputFormat::Plan).unwrap();
        assert_eq!(value["plan"][0], "a");
    }

    #[test]
    fn compose_stage_result_replace_ignores_previous() {
        let out = compose_stage_result(ResultMode::Replace, "new", Some("old"));
        assert_eq!(out, "new");
    }

    #[test]
    fn compose_stage_result_append_joins_previous_and_new() {
        let out = compose_stage_result(ResultMode::Append, "new", Some("old"));
        assert_eq!(out, "old\n\n---\n\nnew");
    }

    #[test]
    fn compose_stage_result_passthrough_keeps_previous() {
        let out = compose_stage_result(ResultMode::Passthrough, "new", Some("old"));
        assert_eq!(out, "old");
    }

    #[test]
    fn gate_require_selection_enforces_bounds() {
        let rule = GateRule::RequireSelection { min: 1, max: 2 };
        assert!(validate_gate(&rule, Some(&json!(["a"]))).is_ok());
        assert!(validate_gate(&rule, Some(&json!([]))).is_err());
        assert!(validate_gate(&rule, Some(&json!(["a", "b", "c"]))).is_err());
    }

    #[test]
    fn gate_require_all_checked_fails_on_any_unchecked() {
        let rule = GateRule::RequireAllChecked;
        let decision = json!([{ "checked": true }, { "checked": false }]);
        assert!(validate_gate(&rule, Some(&decision)).is_err());
    }

    #[test]
    fn gate_require_fields_rejects_blank_values() {
        let rule = GateRule::RequireFields {
            fields: vec!["title".to_string()],
        };
        assert!(validate_gate(&rule, Some(&json!({ "title": "  " }))).is_err());
        assert!(validate_gate(&rule, Some(&json!({ "title": "ok" }))).is_ok());
    }

    #[test]
    fn render_view_research_extracts_research_field() {
        let parsed = json!({ "research": "the bug is in auth.rs", "questions": [] });
        let view = render_view(OutputFormat::Research, Some(&parsed), "raw", None, 1);
        assert_eq!(view, "the bug is in auth.rs");
    }

    #[test]
    fn render_view_findings_phase_two_is_raw_text() {
        let view = render_view(OutputFormat::Findings, None, "applied fix for f1 and f2", None, 2);
        assert_eq!(view, "applied fix for f1 and f2");
    }

    #[test]
    fn render_view_options_formats_selected_approach_with_pros_and_cons() {
        let parsed = json!({
            "options": [
                { "id": "a", "title": "Cache in Redis", "pros": ["fast"], "cons": ["more infra"] },
                { "id": "b", "title": "Cache in memory", "pros": ["simple"], "cons": ["not shared"] },
            ]
        });
        let decision = json!(["a"]);
        let view = render_view(OutputFormat::Options, Some(&parsed), "raw", Some(&decision), 1);
        assert!(view.starts_with("Selected Approach: Cache in Redis"));
        assert!(view.contains("Pros:\n- fast"));
        assert!(view.contains("Cons:\n- more infra"));
    }

    #[test]
    fn render_view_options_without_decision_falls_back_to_raw() {
        let parsed = json!({ "options": [{ "id": "a", "title": "A" }] });
        let view = render_view(OutputFormat::Options, Some(&parsed), "raw text", None, 1);
        assert_eq!(view, "raw text");
    }

    #[test]
    fn render_summary_findings_phase_one_uses_summary_field_verbatim() {
        let parsed = json!({ "summary": "one short line.", "findings": [] });
        let summary = render_summary(OutputFormat::Findings, Some(&parsed), "raw", None, 1);
        assert_eq!(summary, "one short line.");
    }

    #[test]
    fn render_summary_options_selected_title_and_detail() {
        let parsed = json!({ "options": [{ "id": "a", "title": "Cache in Redis", "description": "shared across pods" }] });
        let decision = json!(["a"]);
        let summary = render_summary(OutputFormat::Options, Some(&parsed), "raw", Some(&decision), 1);
        assert_eq!(summary, "Selected: Cache in Redis — shared across pods");
    }

    #[test]
    fn first_sentences_caps_at_three() {
        let text = "One. Two. Three. Four. Five.";
        assert_eq!(first_sentences(text), "One. Two. Three.");
    }

    #[test]
    fn first_sentences_falls_back_to_whole_text_without_punctuation() {
        assert_eq!(first_sentences("no terminal punctuation here"), "no terminal punctuation here");
    }

    #[test]
    fn text_summary_prefers_explicit_summary_section() {
        let raw = "## Changes\nDid some stuff.\n\n## Summary\nFixed the login bug and added a test.\n";
        assert_eq!(text_summary(raw), "Fixed the login bug and added a test.");
    }

    #[test]
    fn text_summary_falls_back_to_last_paragraph() {
        let raw = "First paragraph.\n\nSecond paragraph with the actual takeaway.";
        assert_eq!(text_summary(raw), "Second paragraph with the actual takeaway.");
    }
}
