//! Prompt builder for candidate generation requests.

use std::sync::LazyLock;

use anyhow::Result;
use minijinja::{Environment, context};
use regex::Regex;
use tracing::debug;

const INITIAL_TEMPLATE: &str = include_str!("prompts/initial.md");
const REFINE_TEMPLATE: &str = include_str!("prompts/refine.md");

static SECTION_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<!--\s*section:(\w+)\s+(required|droppable)\s*-->").unwrap());

/// Droppable sections, least important first.
const DROP_ORDER: [&str; 2] = ["oracle", "previous"];

fn templates() -> Environment<'static> {
    let mut env = Environment::new();
    env.add_template("initial", INITIAL_TEMPLATE)
        .expect("initial template should be valid");
    env.add_template("refine", REFINE_TEMPLATE)
        .expect("refine template should be valid");
    env
}

fn non_empty(text: Option<&str>) -> Option<&str> {
    text.map(str::trim).filter(|t| !t.is_empty())
}

/// A parsed section from rendered template output.
#[derive(Debug, Clone)]
struct ParsedSection {
    key: String,
    required: bool,
    content: String,
}

/// Split rendered output at `<!-- section:KEY required|droppable -->` markers.
fn parse_sections(rendered: &str) -> Vec<ParsedSection> {
    let markers: Vec<_> = SECTION_RE.captures_iter(rendered).collect();
    let mut sections = Vec::with_capacity(markers.len());

    for (i, caps) in markers.iter().enumerate() {
        let (Some(whole), Some(key), Some(kind)) = (caps.get(0), caps.get(1), caps.get(2)) else {
            continue;
        };
        let end = markers
            .get(i + 1)
            .and_then(|next| next.get(0))
            .map_or(rendered.len(), |m| m.start());
        let content = rendered[whole.end()..end].trim().to_string();
        let required = kind.as_str() == "required";
        if !content.is_empty() || required {
            sections.push(ParsedSection {
                key: key.as_str().to_string(),
                required,
                content,
            });
        }
    }

    sections
}

fn total_len(sections: &[ParsedSection]) -> usize {
    sections.iter().map(|s| s.content.len()).sum()
}

/// Drop droppable sections until the prompt fits, then truncate the last one.
fn apply_budget(sections: &mut Vec<ParsedSection>, budget: usize) {
    for key in DROP_ORDER {
        if total_len(sections) <= budget {
            return;
        }
        if let Some(idx) = sections.iter().position(|s| s.key == key && !s.required) {
            debug!(
                section = key,
                bytes_dropped = sections[idx].content.len(),
                "dropped section for budget"
            );
            sections.remove(idx);
        }
    }

    let total = total_len(sections);
    if total <= budget {
        return;
    }
    let Some(last) = sections.last_mut() else {
        return;
    };
    let allowed = budget.saturating_sub(total - last.content.len());
    let before_len = last.content.len();
    let mut cut = allowed.saturating_sub(12);
    while !last.content.is_char_boundary(cut) {
        cut -= 1;
    }
    last.content.truncate(cut);
    last.content.push_str("\n[truncated]");
    debug!(
        section = %last.key,
        before_len,
        after_len = last.content.len(),
        "truncated section for budget"
    );
}

/// Everything a generation prompt is built from.
#[derive(Debug, Clone, Copy, Default)]
pub struct PromptInputs<'a> {
    pub specification: &'a str,
    pub oracle: &'a str,
    /// Rendered failure feedback; selects the refinement template when present.
    pub feedback: Option<&'a str>,
    pub previous_candidate: Option<&'a str>,
}

/// Builds prompts within a byte budget, dropping less critical sections first.
///
/// Non-empty feedback selects the refinement template; otherwise the
/// initial-attempt template is used.
#[derive(Debug, Clone)]
pub struct PromptBuilder {
    env: Environment<'static>,
    budget_bytes: usize,
}

impl PromptBuilder {
    pub fn new(budget_bytes: usize) -> Self {
        Self {
            env: templates(),
            budget_bytes,
        }
    }

    fn render(&self, input: &PromptInputs<'_>) -> Result<String> {
        let feedback = non_empty(input.feedback);
        let name = if feedback.is_some() { "refine" } else { "initial" };
        let rendered = self.env.get_template(name)?.render(context! {
            specification => input.specification.trim(),
            oracle => non_empty(Some(input.oracle)),
            feedback => feedback,
            previous => non_empty(input.previous_candidate),
        })?;
        Ok(rendered)
    }

    pub fn build(&self, input: &PromptInputs<'_>) -> Result<String> {
        let rendered = self.render(input)?;
        let mut sections = parse_sections(&rendered);
        apply_budget(&mut sections, self.budget_bytes);
        Ok(sections
            .iter()
            .map(|s| s.content.as_str())
            .collect::<Vec<_>>()
            .join("\n\n"))
    }
}
