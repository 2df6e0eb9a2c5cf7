//! Static analysis of Python test sources with tree-sitter.
//!
//! Nothing here executes test code. Call sites are found syntactically:
//! `<anything>.get|post|put|patch|delete(<url>, ...)` where the URL is a
//! string, f-string or `BASE_URL + "..."` concatenation.

use crate::error::CapabilityError;
use std::cell::RefCell;
use tree_sitter::{Node, Parser, Tree};

const HTTP_METHODS: &[&str] = &["get", "post", "put", "patch", "delete"];

thread_local! {
    static PYTHON_PARSER: RefCell<Parser> = RefCell::new({
        let mut p = Parser::new();
        // Ignore error here - will be caught at parse time if language fails
        let _ = p.set_language(&tree_sitter_python::LANGUAGE.into());
        p
    });
}

fn parse(content: &str) -> anyhow::Result<Tree> {
    PYTHON_PARSER
        .with(|p| p.borrow_mut().parse(content, None))
        .ok_or_else(|| anyhow::anyhow!("Failed to parse Python source"))
}

/// One HTTP call found in a test source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallSite {
    /// Upper-case HTTP method.
    pub method: String,
    /// Normalized path template, e.g. `/users/{id}`.
    pub template: String,
    /// Enclosing function, if any.
    pub function: Option<String>,
    pub line: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SourceSummary {
    pub calls: Vec<CallSite>,
    /// Every function definition name, in source order.
    pub functions: Vec<String>,
}

pub fn analyze(content: &str, base_url: &str) -> anyhow::Result<SourceSummary> {
    let tree = parse(content)?;
    let mut summary = SourceSummary::default();
    let mut stack: Vec<(Node, Option<String>)> = vec![(tree.root_node(), None)];

    while let Some((node, function)) = stack.pop() {
        let mut scope = function;
        match node.kind() {
            "function_definition" => {
                if let Some(name) = node.child_by_field_name("name") {
                    let name = node_text(&name, content).to_string();
                    summary.functions.push(name.clone());
                    scope = Some(name);
                }
            }
            "call" => {
                if let Some(call) = extract_call(&node, content, base_url) {
                    summary.calls.push(CallSite {
                        method: call.0,
                        template: call.1,
                        function: scope.clone(),
                        line: node.start_position().row + 1,
                    });
                }
            }
            _ => {}
        }

        // Reverse so the stack yields children in source order.
        let mut cursor = node.walk();
        let children: Vec<Node> = node.children(&mut cursor).collect();
        for child in children.into_iter().rev() {
            stack.push((child, scope.clone()));
        }
    }
    Ok(summary)
}

/// Names of all functions defined in `content`.
pub fn function_names(content: &str) -> Vec<String> {
    analyze(content, "")
        .map(|summary| summary.functions)
        .unwrap_or_default()
}

/// A top-level function definition, decorators included. Rows are 0-based.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DefinitionSpan {
    pub name: String,
    pub start_row: usize,
    pub end_row: usize,
    pub start_byte: usize,
    pub end_byte: usize,
}

/// Every top-level function in `content`, in source order.
pub fn top_level_definitions(content: &str) -> anyhow::Result<Vec<DefinitionSpan>> {
    let tree = parse(content)?;
    let root = tree.root_node();
    let mut cursor = root.walk();
    let spans = root
        .named_children(&mut cursor)
        .filter_map(|node| definition_span(&node, content))
        .collect();
    Ok(spans)
}

fn definition_span(node: &Node, content: &str) -> Option<DefinitionSpan> {
    let function = match node.kind() {
        "function_definition" => *node,
        "decorated_definition" => {
            let inner = node.child_by_field_name("definition")?;
            if inner.kind() != "function_definition" {
                return None;
            }
            inner
        }
        _ => return None,
    };
    let name = node_text(&function.child_by_field_name("name")?, content).to_string();
    Some(DefinitionSpan {
        name,
        start_row: node.start_position().row,
        end_row: node.end_position().row,
        start_byte: node.start_byte(),
        end_byte: node.end_byte(),
    })
}

/// The one top-level test function of a generated candidate: its name and
/// source, decorators included.
///
/// Top-level comments are dropped. Any other top-level statement, a second
/// function, or a non-`test_` name makes the candidate `SyntaxInvalid`.
pub fn single_test_function(code: &str) -> Result<(String, String), CapabilityError> {
    check_syntax(code)?;
    let invalid = |message: String| CapabilityError::SyntaxInvalid { message };
    let tree = parse(code).map_err(|e| invalid(e.to_string()))?;
    let root = tree.root_node();
    let mut cursor = root.walk();
    let mut found: Option<DefinitionSpan> = None;

    for node in root.named_children(&mut cursor) {
        if node.kind() == "comment" {
            continue;
        }
        let Some(span) = definition_span(&node, code) else {
            return Err(invalid(format!(
                "unexpected top-level {} at line {}",
                node.kind(),
                node.start_position().row + 1
            )));
        };
        if let Some(first) = &found {
            return Err(invalid(format!(
                "candidate defines more than one function ({}, {})",
                first.name, span.name
            )));
        }
        found = Some(span);
    }

    let span = found.ok_or_else(|| invalid("candidate defines no test function".to_string()))?;
    if !span.name.starts_with("test_") {
        return Err(invalid(format!("{} is not a test function", span.name)));
    }
    let source = code[span.start_byte..span.end_byte].to_string();
    Ok((span.name, source))
}

/// Parse `code` on its own; any error node makes it `SyntaxInvalid`.
pub fn check_syntax(code: &str) -> Result<(), CapabilityError> {
    let tree = parse(code).map_err(|e| CapabilityError::SyntaxInvalid {
        message: e.to_string(),
    })?;
    let root = tree.root_node();
    if !root.has_error() {
        return Ok(());
    }
    let line = first_error_line(&root).unwrap_or(1);
    Err(CapabilityError::SyntaxInvalid {
        message: format!("parse error near line {}", line),
    })
}

fn first_error_line(root: &Node) -> Option<usize> {
    let mut cursor = root.walk();
    loop {
        let node = cursor.node();
        if node.is_error() || node.is_missing() {
            return Some(node.start_position().row + 1);
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

fn extract_call(node: &Node, content: &str, base_url: &str) -> Option<(String, String)> {
    let function = node.child_by_field_name("function")?;
    if function.kind() != "attribute" {
        return None;
    }
    let method = node_text(&function.child_by_field_name("attribute")?, content).to_string();
    if !HTTP_METHODS.contains(&method.as_str()) {
        return None;
    }

    let arguments = node.child_by_field_name("arguments")?;
    let mut cursor = arguments.walk();
    let first = arguments
        .named_children(&mut cursor)
        .find(|c| c.kind() != "comment")?;
    let url_node = match first.kind() {
        "keyword_argument" => {
            let name = first.child_by_field_name("name")?;
            if node_text(&name, content) != "url" {
                return None;
            }
            first.child_by_field_name("value")?
        }
        _ => first,
    };

    let raw = url_literal(&url_node, content)?;
    let template = normalize_target(&raw, base_url)?;
    Some((method.to_ascii_uppercase(), template))
}

/// Text of a string literal (quotes and prefix removed), following
/// `BASE + "..."` concatenations to their literal parts.
fn url_literal(node: &Node, content: &str) -> Option<String> {
    match node.kind() {
        "string" => Some(strip_string_literal(node_text(node, content))),
        "concatenated_string" => {
            let mut cursor = node.walk();
            let parts: Vec<String> = node
                .named_children(&mut cursor)
                .filter(|c| c.kind() == "string")
                .map(|c| strip_string_literal(node_text(&c, content)))
                .collect();
            Some(parts.concat())
        }
        "binary_operator" => {
            let left = node.child_by_field_name("left")?;
            let right = node.child_by_field_name("right")?;
            let left_text = url_literal(&left, content).unwrap_or_else(|| "{base}".to_string());
            let right_text = url_literal(&right, content)?;
            Some(format!("{}{}", left_text, right_text))
        }
        _ => None,
    }
}

fn strip_string_literal(text: &str) -> String {
    let body = text.trim_start_matches(|c: char| c.is_ascii_alphabetic());
    for quote in ["\"\"\"", "'''", "\"", "'"] {
        if let Some(inner) = body
            .strip_prefix(quote)
            .and_then(|rest| rest.strip_suffix(quote))
        {
            return inner.to_string();
        }
    }
    body.to_string()
}

/// Normalize a URL or path literal into a template.
///
/// The configured base URL, any scheme/host, a leading `{...}` base
/// interpolation and the query string are dropped. Interpolated, numeric and
/// opaque identifier segments collapse to `{id}`.
pub fn normalize_target(raw: &str, base_url: &str) -> Option<String> {
    let mut rest = raw.trim();
    let base = base_url.trim_end_matches('/');
    if !base.is_empty() {
        if let Some(stripped) = rest.strip_prefix(base) {
            rest = stripped;
        }
    }
    if let Some(after_scheme) = rest
        .strip_prefix("https://")
        .or_else(|| rest.strip_prefix("http://"))
    {
        rest = after_scheme.find('/').map(|i| &after_scheme[i..]).unwrap_or("");
    }
    if rest.starts_with('{') {
        let end = rest.find('}')?;
        rest = &rest[end + 1..];
    }
    let rest = rest.split(['?', '#']).next().unwrap_or("");
    // Dictionary lookups like `data.get("key")` are not requests.
    if !rest.starts_with('/') {
        return None;
    }

    let segments: Vec<String> = rest
        .split('/')
        .filter(|s| !s.is_empty())
        .map(|segment| {
            if is_identifier_segment(segment) {
                "{id}".to_string()
            } else {
                segment.to_string()
            }
        })
        .collect();
    if segments.is_empty() {
        return None;
    }
    Some(format!("/{}", segments.join("/")))
}

fn is_identifier_segment(segment: &str) -> bool {
    if segment.starts_with('{') && segment.ends_with('}') {
        return true;
    }
    if segment.chars().all(|c| c.is_ascii_digit()) {
        return true;
    }
    // uuid / hash / slug-with-digits style ids
    segment.len() >= 8
        && segment.chars().any(|c| c.is_ascii_digit())
        && segment
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

fn node_text<'a>(node: &Node, content: &'a str) -> &'a str {
    &content[node.start_byte()..node.end_byte()]
}
