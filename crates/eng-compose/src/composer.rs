use std::collections::HashMap;

/// Inputs available to a stage-template render, one optional slot per
/// substitution hole named in a template.
#[derive(Debug, Clone, Default)]
pub struct ComposeContext {
    values: HashMap<&'static str, String>,
}

impl ComposeContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(mut self, name: &'static str, value: impl Into<String>) -> Self {
        let value = value.into();
        if !value.is_empty() {
            self.values.insert(name, value);
        }
        self
    }

    pub fn set_opt(self, name: &'static str, value: Option<impl Into<String>>) -> Self {
        match value {
            Some(v) => self.set(name, v),
            None => self,
        }
    }

    fn get(&self, name: &str) -> &str {
        self.values.get(name).map(String::as_str).unwrap_or("")
    }

    fn has(&self, name: &str) -> bool {
        self.values.contains_key(name)
    }
}

/// Render a template with Handlebars-style holes (`{{task_description}}`,
/// `{{previous_output}}`, `{{user_input}}`, `{{user_decision}}`,
/// `{{prior_attempt_output}}`, `{{stage_summaries}}`) and `{{#if name}}…{{/if}}`
/// conditionals. A missing value becomes an empty string and suppresses the
/// `{{#if}}` block that names it. Pure and deterministic: no I/O, no clock.
pub fn render(template: &str, ctx: &ComposeContext) -> String {
    let after_conditionals = strip_if_blocks(template, ctx);
    substitute_vars(&after_conditionals, ctx)
}

fn strip_if_blocks(template: &str, ctx: &ComposeContext) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    loop {
        let Some(start) = rest.find("{{#if ") else {
            out.push_str(rest);
            break;
        };
        out.push_str(&rest[..start]);
        let after_tag_start = &rest[start + "{{#if ".len()..];
        let Some(name_end) = after_tag_start.find("}}") else {
            out.push_str(&rest[start..]);
            break;
        };
        let name = after_tag_start[..name_end].trim();
        let after_open = &after_tag_start[name_end + "}}".len()..];

        let close_tag = "{{/if}}";
        let Some(close_pos) = after_open.find(close_tag) else {
            out.push_str(&rest[start..]);
            break;
        };
        let body = &after_open[..close_pos];

        if ctx.has(name) {
            out.push_str(&strip_if_blocks(body, ctx));
        }

        rest = &after_open[close_pos + close_tag.len()..];
    }

    out
}

fn substitute_vars(template: &str, ctx: &ComposeContext) -> String {
    const NAMES: &[&str] = &[
        "task_description",
        "previous_output",
        "user_input",
        "user_decision",
        "prior_attempt_output",
        "stage_summaries",
    ];

    let mut out = template.to_string();
    for name in NAMES {
        let hole = format!("{{{{{name}}}}}");
        out = out.replace(&hole, ctx.get(name));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn substitutes_present_values() {
        let ctx = ComposeContext::new().set("task_description", "Fix the login bug");
        let rendered = render("Task: {{task_description}}", &ctx);
        assert_eq!(rendered, "Task: Fix the login bug");
    }

    #[test]
    fn missing_value_becomes_empty_string() {
        let ctx = ComposeContext::new();
        let rendered = render("Input: [{{user_input}}]", &ctx);
        assert_eq!(rendered, "Input: []");
    }

    #[test]
    fn if_block_kept_when_value_present() {
        let ctx = ComposeContext::new().set("previous_output", "earlier result");
        let rendered = render(
            "{{#if previous_output}}Previous: {{previous_output}}{{/if}}",
            &ctx,
        );
        assert_eq!(rendered, "Previous: earlier result");
    }

    #[test]
    fn if_block_suppressed_when_value_absent() {
        let ctx = ComposeContext::new();
        let rendered = render(
            "before {{#if previous_output}}Previous: {{previous_output}}{{/if}} after",
            &ctx,
        );
        assert_eq!(rendered, "before  after");
    }

    #[test]
    fn rendering_is_pure_and_repeatable() {
        let ctx = ComposeContext::new().set("user_decision", "approved");
        let a = render("{{user_decision}}", &ctx);
        let b = render("{{user_decision}}", &ctx);
        assert_eq!(a, b);
    }
}
