//! Tree-sitter based analysis of Python candidates.

use std::cell::RefCell;

use tracing::debug;
use tree_sitter::{Node, Parser, Tree};

use super::{AnalysisConfig, QualityAnalyzer};
use crate::core::types::{ComplexityClass, Construct, QualityMetrics, Smell, SourceProfile};

thread_local! {
    static PYTHON_PARSER: RefCell<Parser> = RefCell::new({
        let mut p = Parser::new();
        // A language mismatch surfaces as a missing tree at parse time.
        let _ = p.set_language(&tree_sitter_python::LANGUAGE.into());
        p
    });
}

fn parse(source: &str) -> Option<Tree> {
    PYTHON_PARSER.with(|p| p.borrow_mut().parse(source, None))
}

/// Functions longer than this many lines are a smell.
const LONG_FUNCTION_LINES: usize = 50;
const MIN_DOCSTRING_CHARS: usize = 10;

const DECISION_KINDS: [&str; 10] = [
    "if_statement",
    "elif_clause",
    "for_statement",
    "while_statement",
    "except_clause",
    "boolean_operator",
    "conditional_expression",
    "for_in_clause",
    "if_clause",
    "case_clause",
];

#[derive(Debug, Clone, Default)]
pub struct PythonAnalyzer {
    config: AnalysisConfig,
}

impl PythonAnalyzer {
    pub fn new(config: AnalysisConfig) -> Self {
        Self { config }
    }
}

impl QualityAnalyzer for PythonAnalyzer {
    fn analyze(&self, source: &str) -> QualityMetrics {
        let line_count = source.lines().filter(|l| !l.trim().is_empty()).count();
        let lint_error_count = lint_errors(source, self.config.max_line_length);

        let Some(tree) = parse(source) else {
            return QualityMetrics {
                has_syntax_error: true,
                lint_error_count,
                line_count: to_u32(line_count),
                ..QualityMetrics::default()
            };
        };
        let root = tree.root_node();
        if root.has_error() {
            return QualityMetrics {
                has_syntax_error: true,
                lint_error_count,
                security_issue_count: Scan::new(source, &self.config).run(root).security_issues,
                line_count: to_u32(line_count),
                profile: SourceProfile::default(),
                complexity: 0,
            };
        }

        let scan = Scan::new(source, &self.config).run(root);
        let complexity_class = scan.complexity_class(source);
        debug!(
            complexity = scan.complexity,
            functions = scan.function_complexities.len(),
            %complexity_class,
            "analyzed candidate"
        );

        QualityMetrics {
            complexity: scan.complexity,
            lint_error_count,
            security_issue_count: scan.security_issues,
            has_syntax_error: false,
            line_count: to_u32(line_count),
            profile: SourceProfile {
                function_complexities: scan.function_complexities,
                constructs: scan.constructs,
                smells: scan.smells,
                documented_items: scan.documented_items,
                max_loop_depth: scan.max_loop_depth,
                has_recursion: scan.recursion != Recursion::None,
                complexity_class,
            },
        }
    }

    fn syntax_error(&self, source: &str) -> Option<String> {
        let Some(tree) = parse(source) else {
            return Some("parser produced no tree".to_string());
        };
        let root = tree.root_node();
        if !root.has_error() {
            return None;
        }
        let offending = first_error(root).unwrap_or(root);
        let pos = offending.start_position();
        let what = if offending.is_missing() {
            format!("missing `{}`", offending.kind())
        } else {
            "invalid syntax".to_string()
        };
        Some(format!("line {}, column {}: {what}", pos.row + 1, pos.column + 1))
    }
}

fn to_u32(n: usize) -> u32 {
    u32::try_from(n).unwrap_or(u32::MAX)
}

fn children<'t>(node: Node<'t>) -> impl Iterator<Item = Node<'t>> {
    (0..node.child_count()).filter_map(move |i| node.child(i))
}

fn named_children<'t>(node: Node<'t>) -> impl Iterator<Item = Node<'t>> {
    (0..node.named_child_count()).filter_map(move |i| node.named_child(i))
}

fn text<'s>(node: Node<'_>, source: &'s str) -> &'s str {
    node.utf8_text(source.as_bytes()).unwrap_or_default()
}

/// First ERROR or MISSING node in document order.
fn first_error(root: Node<'_>) -> Option<Node<'_>> {
    let mut cursor = root.walk();
    loop {
        let node = cursor.node();
        if node.is_error() || node.is_missing() {
            return Some(node);
        }
        if node.has_error() && cursor.goto_first_child() {
            continue;
        }
        while !cursor.goto_next_sibling() {
            if !cursor.goto_parent() {
                return None;
            }
        }
    }
}

/// Overlong lines, trailing whitespace and tab indentation, one count per offending line and rule.
fn lint_errors(source: &str, max_line_length: usize) -> u32 {
    let count = source
        .lines()
        .map(|line| {
            usize::from(line.chars().count() > max_line_length)
                + usize::from(line.len() != line.trim_end().len())
                + usize::from(line.starts_with('\t'))
        })
        .sum();
    to_u32(count)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Recursion {
    None,
    /// Each recursive function calls itself at most once per body.
    Linear,
    /// Some function calls itself more than once.
    Branching,
}

struct Scan<'a> {
    source: &'a str,
    config: &'a AnalysisConfig,
    complexity: u32,
    function_complexities: Vec<u32>,
    constructs: Vec<Construct>,
    smells: Vec<Smell>,
    documented_items: u32,
    max_loop_depth: u32,
    loop_count: u32,
    recursion: Recursion,
    recursive_names: Vec<String>,
    halving: bool,
    halving_in_while: bool,
    sorts: bool,
    magic_numbers: bool,
    security_issues: u32,
}

impl<'a> Scan<'a> {
    fn new(source: &'a str, config: &'a AnalysisConfig) -> Self {
        Self {
            source,
            config,
            complexity: 1,
            function_complexities: Vec::new(),
            constructs: Vec::new(),
            smells: Vec::new(),
            documented_items: 0,
            max_loop_depth: 0,
            loop_count: 0,
            recursion: Recursion::None,
            recursive_names: Vec::new(),
            halving: false,
            halving_in_while: false,
            sorts: false,
            magic_numbers: false,
            security_issues: 0,
        }
    }

    fn run(mut self, root: Node<'_>) -> Self {
        self.max_loop_depth = loop_depth(root);
        let mut stack = vec![(root, false)];
        while let Some((node, in_while)) = stack.pop() {
            self.visit(node, in_while);
            let in_while = in_while || node.kind() == "while_statement";
            push_children(&mut stack, node, |child| (child, in_while));
        }
        if self.magic_numbers {
            self.smells.push(Smell::MagicNumbers);
        }
        self
    }

    fn visit(&mut self, node: Node<'_>, in_while: bool) {
        let kind = node.kind();
        if DECISION_KINDS.contains(&kind) {
            self.complexity += 1;
        }

        match kind {
            "function_definition" => self.function(node),
            "class_definition" => {
                if has_docstring(node, self.source) {
                    self.documented_items += 1;
                }
            }
            "for_statement" | "while_statement" => self.loop_count += 1,
            "list_comprehension" => self.constructs.push(Construct::ListComprehension),
            "dictionary_comprehension" => self.constructs.push(Construct::DictComprehension),
            "generator_expression" => self.constructs.push(Construct::GeneratorExpression),
            "with_statement" => self.constructs.push(Construct::ContextManager),
            "string" if is_f_string(node, self.source) => self.constructs.push(Construct::FString),
            "except_clause" if is_bare_except(node) => self.smells.push(Smell::BareExcept),
            "global_statement" => self.smells.push(Smell::GlobalStatement),
            "integer" | "float" => {
                let digits = text(node, self.source)
                    .chars()
                    .take_while(char::is_ascii_digit)
                    .count();
                if digits >= 3 {
                    self.magic_numbers = true;
                }
            }
            "augmented_assignment" | "binary_operator" if is_halving(node, self.source) => {
                self.halving = true;
                self.halving_in_while |= in_while;
            }
            "call" => self.call(node),
            "import_statement" | "import_from_statement" => self.import(node),
            _ => {}
        }
    }

    fn function(&mut self, node: Node<'_>) {
        let name = node
            .child_by_field_name("name")
            .map(|n| text(n, self.source).to_string())
            .unwrap_or_default();

        let body = node.child_by_field_name("body");
        let complexity = 1 + body.map_or(0, decision_points);
        self.function_complexities.push(complexity);

        if has_docstring(node, self.source) {
            self.documented_items += 1;
        }

        let lines = node.end_position().row - node.start_position().row;
        if lines > LONG_FUNCTION_LINES {
            self.smells.push(Smell::LongFunction {
                name: name.clone(),
                lines,
            });
        }

        let self_calls = body.map_or(0, |b| count_calls_to(b, &name, self.source));
        if self_calls > 0 {
            self.recursive_names.push(name);
            let shape = if self_calls > 1 {
                Recursion::Branching
            } else {
                Recursion::Linear
            };
            if self.recursion != Recursion::Branching {
                self.recursion = shape;
            }
        }
    }

    fn call(&mut self, node: Node<'_>) {
        let Some(function) = node.child_by_field_name("function") else {
            return;
        };
        let callee = text(function, self.source);
        if function.kind() == "identifier" {
            if callee == "sorted" {
                self.sorts = true;
            }
            if self.config.dangerous_calls.iter().any(|c| c == callee) {
                self.security_issues += 1;
            }
        } else if function.kind() == "attribute" && callee.ends_with(".sort") {
            self.sorts = true;
        }
    }

    fn import(&mut self, node: Node<'_>) {
        let modules: Vec<&str> = if node.kind() == "import_from_statement" {
            node.child_by_field_name("module_name")
                .map(|m| vec![text(m, self.source)])
                .unwrap_or_default()
        } else {
            named_children(node)
                .map(|child| match child.child_by_field_name("name") {
                    Some(name) => text(name, self.source),
                    None => text(child, self.source),
                })
                .collect()
        };
        for module in modules {
            let root = module.split('.').next().unwrap_or(module);
            if self.config.blocked_imports.iter().any(|b| b == root) {
                self.security_issues += 1;
            }
        }
    }

    fn complexity_class(&self, source: &str) -> ComplexityClass {
        let memoized = ["memo", "lru_cache", "@cache"]
            .iter()
            .any(|marker| source.contains(marker));

        if self.recursion != Recursion::None {
            let fibonacci_like = self
                .recursive_names
                .iter()
                .any(|name| name.to_lowercase().contains("fib"));
            if (self.recursion == Recursion::Branching || fibonacci_like) && !memoized {
                return ComplexityClass::Exponential;
            }
            if self.halving {
                return ComplexityClass::Logarithmic;
            }
            return ComplexityClass::Linear;
        }

        match self.max_loop_depth {
            0 if self.sorts => ComplexityClass::Linearithmic,
            0 => ComplexityClass::Constant,
            1 if self.halving_in_while && self.loop_count == 1 && !self.sorts => {
                ComplexityClass::Logarithmic
            }
            1 if self.sorts || self.halving => ComplexityClass::Linearithmic,
            1 => ComplexityClass::Linear,
            2 => ComplexityClass::Quadratic,
            _ => ComplexityClass::Cubic,
        }
    }
}

/// Push `node`'s children so they pop in document order.
fn push_children<'t, T>(stack: &mut Vec<T>, node: Node<'t>, entry: impl Fn(Node<'t>) -> T) {
    let start = stack.len();
    stack.extend(children(node).map(entry));
    stack[start..].reverse();
}

/// Every node strictly below `root`, pre-order, without entering subtrees
/// whose top node satisfies `prune`.
///
/// Walks use an explicit stack: generated code can nest far deeper than the
/// thread's call stack allows.
fn descendants<'t>(root: Node<'t>, prune: impl Fn(Node<'t>) -> bool) -> Vec<Node<'t>> {
    let mut found = Vec::new();
    let mut stack = Vec::new();
    push_children(&mut stack, root, |child| child);
    while let Some(node) = stack.pop() {
        found.push(node);
        if !prune(node) {
            push_children(&mut stack, node, |child| child);
        }
    }
    found
}

/// Decision points inside `node`, not descending into nested functions.
fn decision_points(node: Node<'_>) -> u32 {
    let count = descendants(node, |n| n.kind() == "function_definition")
        .into_iter()
        .filter(|n| DECISION_KINDS.contains(&n.kind()))
        .count();
    to_u32(count)
}

/// Most loops stacked on one root-to-leaf path.
fn loop_depth(root: Node<'_>) -> u32 {
    let mut deepest = 0;
    let mut stack = vec![(root, 0u32)];
    while let Some((node, above)) = stack.pop() {
        let depth = above + u32::from(matches!(node.kind(), "for_statement" | "while_statement"));
        deepest = deepest.max(depth);
        push_children(&mut stack, node, |child| (child, depth));
    }
    deepest
}

fn count_calls_to(node: Node<'_>, name: &str, source: &str) -> usize {
    descendants(node, |_| false)
        .into_iter()
        .filter(|n| {
            n.kind() == "call"
                && n.child_by_field_name("function")
                    .is_some_and(|f| f.kind() == "identifier" && text(f, source) == name)
        })
        .count()
}

fn has_docstring(definition: Node<'_>, source: &str) -> bool {
    let Some(first) = definition
        .child_by_field_name("body")
        .and_then(|body| body.named_child(0))
    else {
        return false;
    };
    if first.kind() != "expression_statement" {
        return false;
    }
    let Some(string) = first.named_child(0).filter(|n| n.kind() == "string") else {
        return false;
    };
    let content: String = named_children(string)
        .filter(|n| n.kind() == "string_content")
        .map(|n| text(n, source))
        .collect();
    content.trim().chars().count() > MIN_DOCSTRING_CHARS
}

fn is_f_string(node: Node<'_>, source: &str) -> bool {
    children(node)
        .find(|n| n.kind() == "string_start")
        .is_some_and(|start| text(start, source).contains(['f', 'F']))
}

fn is_bare_except(node: Node<'_>) -> bool {
    named_children(node).all(|n| matches!(n.kind(), "block" | "comment"))
}

/// `x // 2`, `x >> 1`, `x //= 2`, `x /= 2` and `x >>= 1`.
fn is_halving(node: Node<'_>, source: &str) -> bool {
    let (Some(operator), Some(right)) = (
        node.child_by_field_name("operator"),
        node.child_by_field_name("right"),
    ) else {
        return false;
    };
    let rhs = text(right, source).trim();
    match text(operator, source) {
        "//" | "//=" | "/=" => rhs == "2",
        ">>" | ">>=" => rhs == "1",
        _ => false,
    }
}
