//! Normalization of generator replies into candidate source.
//!
//! Two bounded passes: [`extract_code`] pulls Python out of a chat-style
//! reply, and [`repair_missing_colons`] patches compound-statement headers
//! that lost their trailing colon. Neither guarantees valid syntax; callers
//! re-validate afterwards.

use std::sync::LazyLock;

use regex::Regex;

static CODE_START_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*(?:async\s+def\s|def\s|class\s|import\s|from\s+\S+\s+import\s|@)").unwrap()
});
static BLOCK_HEADER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*(?:if|elif|while|for|with|except|async\s+for|async\s+with)\b").unwrap()
});
static BARE_HEADER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*(?:else|try|finally|except)\s*$").unwrap());
static DEF_HEADER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*(?:async\s+)?(?:def|class)\s+\w+").unwrap());
static RETURN_ANNOTATION_END_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"->\s*[\w\[\]., |]+$").unwrap());

const TYPING_NAMES: [(&str, &str); 6] = [
    ("Any", "Any"),
    ("List[", "List"),
    ("Dict[", "Dict"),
    ("Optional[", "Optional"),
    ("Tuple[", "Tuple"),
    ("Union[", "Union"),
];

/// Extract candidate source from a free-form reply.
///
/// Prefers a ```` ```python ```` fence, then any fence, then the raw text.
/// Prose before the first line that looks like code is dropped and missing
/// `typing` imports are added.
pub fn extract_code(response: &str) -> String {
    let fenced = fenced_block(response, "```python")
        .or_else(|| fenced_block(response, "```"))
        .unwrap_or(response);

    let lines: Vec<&str> = fenced.lines().collect();
    let body = match lines.iter().position(|line| CODE_START_RE.is_match(line)) {
        Some(start) if start > 0 => lines[start..].join("\n"),
        _ => fenced.to_string(),
    };

    ensure_typing_imports(body.trim()).trim().to_string()
}

fn fenced_block<'a>(text: &'a str, opener: &str) -> Option<&'a str> {
    let start = text.find(opener)? + opener.len();
    // Skip the rest of the opener line (language tag or nothing).
    let body_start = text[start..].find('\n').map_or(text.len(), |i| start + i + 1);
    let end = text[body_start..].find("```")?;
    Some(text[body_start..body_start + end].trim_matches('\n'))
}

/// Prepend `from typing import ...` when hints are used but nothing imports from `typing`.
pub fn ensure_typing_imports(code: &str) -> String {
    if code.contains("from typing import") {
        return code.to_string();
    }
    let names: Vec<&str> = TYPING_NAMES
        .iter()
        .filter(|(marker, _)| contains_word_prefix(code, marker))
        .map(|(_, name)| *name)
        .collect();
    if names.is_empty() {
        return code.to_string();
    }
    format!("from typing import {}\n\n{code}", names.join(", "))
}

/// `marker` appears in `code` not preceded by an identifier character.
fn contains_word_prefix(code: &str, marker: &str) -> bool {
    code.match_indices(marker).any(|(i, _)| {
        let before = code[..i].chars().next_back();
        let after = code[i + marker.len()..].chars().next();
        let starts_word = !before.is_some_and(|c| c.is_alphanumeric() || c == '_');
        // Bare `Any` must also end a word; bracketed markers already do.
        let ends_word = marker.ends_with('[')
            || !after.is_some_and(|c| c.is_alphanumeric() || c == '_');
        starts_word && ends_word
    })
}

/// Append a missing `:` to single-line compound-statement headers.
///
/// Returns `None` when nothing was changed.
pub fn repair_missing_colons(code: &str) -> Option<String> {
    let mut changed = false;
    let repaired: Vec<String> = code
        .lines()
        .map(|line| {
            if needs_colon(line) {
                changed = true;
                format!("{}:", line.trim_end())
            } else {
                line.to_string()
            }
        })
        .collect();

    if !changed {
        return None;
    }
    let mut out = repaired.join("\n");
    if code.ends_with('\n') {
        out.push('\n');
    }
    Some(out)
}

fn needs_colon(line: &str) -> bool {
    let trimmed = line.trim_end();
    if trimmed.is_empty() || trimmed.ends_with(':') || trimmed.trim_start().starts_with('#') {
        return false;
    }
    if ends_with_continuation(trimmed) {
        return false;
    }

    if DEF_HEADER_RE.is_match(trimmed) {
        return trimmed.ends_with(')')
            || RETURN_ANNOTATION_END_RE.is_match(trimmed)
            || !trimmed.contains('(');
    }
    if BARE_HEADER_RE.is_match(trimmed) {
        return true;
    }
    BLOCK_HEADER_RE.is_match(trimmed) && !trimmed.contains(':') && brackets_balanced(trimmed)
}

fn ends_with_continuation(line: &str) -> bool {
    matches!(line.chars().last(), Some('(' | '[' | '{' | ',' | '\\'))
}

fn brackets_balanced(line: &str) -> bool {
    let mut depth = 0i32;
    for c in line.chars() {
        match c {
            '(' | '[' | '{' => depth += 1,
            ')' | ']' | '}' => depth -= 1,
            _ => {}
        }
        if depth < 0 {
            return false;
        }
    }
    depth == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_python_fence_and_drops_prose() {
        let reply = "Here is the fix:\n\n```python\ndef add(a, b):\n    return a + b\n```\nHope it helps.";
        assert_eq!(extract_code(reply), "def add(a, b):\n    return a + b");
    }

    #[test]
    fn extracts_bare_fence() {
        let reply = "```\nimport math\n\ndef area(r):\n    return math.pi * r * r\n```";
        assert_eq!(
            extract_code(reply),
            "import math\n\ndef area(r):\n    return math.pi * r * r"
        );
    }

    #[test]
    fn unfenced_reply_starts_at_first_code_line() {
        let reply = "Sure! The function below works.\ndef neg(x):\n    return -x\n";
        assert_eq!(extract_code(reply), "def neg(x):\n    return -x");
    }

    #[test]
    fn adds_missing_typing_imports() {
        let code = "def first(xs: List[int]) -> Optional[int]:\n    return xs[0] if xs else None";
        let extracted = extract_code(code);
        assert!(extracted.starts_with("from typing import List, Optional\n\n"));
    }

    #[test]
    fn typing_detection_ignores_substrings() {
        assert_eq!(ensure_typing_imports("Many = 3"), "Many = 3");
        assert_eq!(
            ensure_typing_imports("from typing import Any\nx: Any = 1"),
            "from typing import Any\nx: Any = 1"
        );
    }

    #[test]
    fn repairs_headers_missing_colons() {
        let code = "def f(x)\n    if x > 0\n        return x\n    else\n        return -x\n";
        let repaired = repair_missing_colons(code).expect("changed");
        assert_eq!(
            repaired,
            "def f(x):\n    if x > 0:\n        return x\n    else:\n        return -x\n"
        );
    }

    #[test]
    fn repairs_annotated_def() {
        let repaired = repair_missing_colons("def f(x: int) -> int\n    return x").expect("changed");
        assert_eq!(repaired, "def f(x: int) -> int:\n    return x");
    }

    #[test]
    fn leaves_valid_and_ambiguous_lines_alone() {
        assert_eq!(repair_missing_colons("if x: return 1\n"), None);
        assert_eq!(repair_missing_colons("for i in range(\n    10):\n"), None);
        assert_eq!(repair_missing_colons("elsewhere = 1\n"), None);
        assert_eq!(repair_missing_colons("# if this\n"), None);
        assert_eq!(repair_missing_colons("def f(a,\n      b):\n    pass\n"), None);
    }
}
