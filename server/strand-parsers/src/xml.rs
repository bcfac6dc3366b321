use std::collections::HashMap;

use regex::Regex;
use serde_json::{Map, Value};
use strand_types::{ToolCall, XmlBinding, XmlSource};

/// Extracts XML tool calls embedded in assistant text.
///
/// Top-level occurrences of registered tags are located with a tag scan, then
/// each chunk is parsed with a real XML parser under a synthetic root so
/// nested tags are respected. Chunks that fail to parse are skipped with a
/// warning; extraction never raises.
///
/// Call ids are synthetic (`xml-<seq>`) and assigned per extraction; they are
/// not stable across a re-run of the same prompt and consumers must not
/// depend on them.
pub struct XmlToolParser {
    bindings: HashMap<String, XmlBinding>,
    open_tag_re: Option<Regex>,
    max_xml_tool_calls: usize,
}

#[derive(Debug, Default)]
pub struct XmlExtraction {
    pub calls: Vec<ToolCall>,
    /// Set when more top-level tool tags were present than the per-response
    /// cap allows; the excess calls are dropped.
    pub limit_reached: bool,
}

impl XmlToolParser {
    pub fn new(bindings: HashMap<String, XmlBinding>, max_xml_tool_calls: usize) -> Self {
        let open_tag_re = if bindings.is_empty() {
            None
        } else {
            let mut tags: Vec<String> = bindings.keys().map(|t| regex::escape(t)).collect();
            // Longest first so e.g. `ask-user` is not shadowed by `ask`.
            tags.sort_by_key(|t| std::cmp::Reverse(t.len()));
            let pattern = format!(r"<({})(\s[^<>]*)?/?>", tags.join("|"));
            match Regex::new(&pattern) {
                Ok(re) => Some(re),
                Err(e) => {
                    tracing::warn!("failed to build xml tag scanner: {e}");
                    None
                }
            }
        };
        Self {
            bindings,
            open_tag_re,
            max_xml_tool_calls,
        }
    }

    pub fn bindings(&self) -> &HashMap<String, XmlBinding> {
        &self.bindings
    }

    pub fn extract(&self, content: &str) -> XmlExtraction {
        let mut extraction = XmlExtraction::default();
        let re = match &self.open_tag_re {
            Some(re) => re,
            None => return extraction,
        };

        let mut pos = 0;
        let mut seq = 0;
        while let Some(captures) = re.captures_at(content, pos) {
            let whole = captures.get(0).expect("match always has group 0");
            let tag = captures.get(1).expect("tag group").as_str().to_string();
            let self_closing = whole.as_str().ends_with("/>");

            let chunk_end = if self_closing {
                Some(whole.end())
            } else {
                find_chunk_end(content, &tag, whole.end())
            };

            let chunk_end = match chunk_end {
                Some(end) => end,
                None => {
                    // No matching close tag; skip past the opener.
                    pos = whole.end();
                    continue;
                }
            };
            let chunk = &content[whole.start()..chunk_end];
            pos = chunk_end;

            if extraction.calls.len() >= self.max_xml_tool_calls {
                extraction.limit_reached = true;
                break;
            }

            let binding = self
                .bindings
                .get(&tag)
                .expect("scanner only matches registered tags");
            match parse_chunk(chunk, binding) {
                Some(arguments) => {
                    extraction.calls.push(ToolCall::xml(seq, &tag, arguments));
                    seq += 1;
                }
                None => {
                    tracing::warn!(tag = %tag, "skipping unparseable xml tool call");
                }
            }
        }

        extraction
    }
}

/// Returns the byte offset just past the `</tag>` that closes an element
/// opened right before `open_end`, honoring same-tag nesting.
fn find_chunk_end(content: &str, tag: &str, open_end: usize) -> Option<usize> {
    let open_prefix = format!("<{tag}");
    let close_prefix = format!("</{tag}");
    let mut depth = 1usize;
    let mut pos = open_end;

    loop {
        let close_abs = content[pos..].find(&close_prefix).map(|i| i + pos)?;
        let open_abs = content[pos..].find(&open_prefix).map(|i| i + pos);

        if let Some(open_abs) = open_abs {
            if open_abs < close_abs {
                let after = content[open_abs + open_prefix.len()..].chars().next();
                match after {
                    Some(ch) if ch.is_whitespace() || ch == '>' || ch == '/' => {
                        let gt = content[open_abs..].find('>').map(|i| i + open_abs)?;
                        if !content[open_abs..gt].ends_with('/') {
                            depth += 1;
                        }
                        pos = gt + 1;
                        continue;
                    }
                    _ => {
                        // `<tagname...` of a longer tag; not an opener.
                        pos = open_abs + open_prefix.len();
                        continue;
                    }
                }
            }
        }

        let gt = content[close_abs..].find('>').map(|i| i + close_abs)?;
        depth -= 1;
        pos = gt + 1;
        if depth == 0 {
            return Some(pos);
        }
    }
}

fn parse_chunk(chunk: &str, binding: &XmlBinding) -> Option<Value> {
    let wrapped = format!("<strand-wrapper>{chunk}</strand-wrapper>");
    let parsed = roxmltree::Document::parse(&wrapped);
    let repaired;
    let document = match parsed {
        Ok(document) => document,
        Err(first_error) => {
            repaired = escape_stray_ampersands(&wrapped);
            match roxmltree::Document::parse(&repaired) {
                Ok(document) => document,
                Err(_) => {
                    tracing::warn!("xml parse failed: {first_error}");
                    return None;
                }
            }
        }
    };

    let element = document
        .root_element()
        .children()
        .find(|n| n.is_element())?;
    Some(apply_binding(binding, element, chunk))
}

fn apply_binding(binding: &XmlBinding, element: roxmltree::Node, raw_chunk: &str) -> Value {
    if binding.fields.is_empty() {
        return infer_arguments(element);
    }

    let mut arguments = Map::new();
    for field in &binding.fields {
        let raw = match &field.source {
            XmlSource::Attribute(name) => element.attribute(name.as_str()).map(str::to_string),
            XmlSource::Element(tag) => element
                .descendants()
                .filter(|n| n.is_element())
                .find(|n| n.has_tag_name(tag.as_str()))
                .map(text_content),
            XmlSource::Content => Some(text_content(element).trim().to_string()),
            XmlSource::Root => Some(raw_chunk.to_string()),
            XmlSource::XPath(expr) => eval_child_path(element, expr).map(text_content),
        };
        if let Some(raw) = raw {
            arguments.insert(field.param_name.clone(), field.value_type.coerce(&raw));
        }
    }
    Value::Object(arguments)
}

/// Fallback mapping for bindings without declared fields: child elements
/// become the argument map, plain text content becomes a single value.
fn infer_arguments(element: roxmltree::Node) -> Value {
    let children: Vec<roxmltree::Node> =
        element.children().filter(|n| n.is_element()).collect();

    if children.is_empty() {
        return infer_scalar(text_content(element).trim());
    }

    let mut arguments = Map::new();
    for child in children {
        let name = child.tag_name().name().to_string();
        let value = if child.children().any(|n| n.is_element()) {
            infer_arguments(child)
        } else {
            infer_scalar(text_content(child).trim())
        };
        arguments.insert(name, value);
    }
    Value::Object(arguments)
}

fn infer_scalar(trimmed: &str) -> Value {
    if trimmed.is_empty() {
        return Value::String(String::new());
    }
    if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
        return value;
    }
    if let Ok(number) = trimmed.parse::<f64>() {
        if number.fract() == 0.0 && number.abs() < i64::MAX as f64 {
            return Value::Number((number as i64).into());
        }
        if let Some(number) = serde_json::Number::from_f64(number) {
            return Value::Number(number);
        }
    }
    if let Ok(boolean) = trimmed.parse::<bool>() {
        return Value::Bool(boolean);
    }
    Value::String(trimmed.to_string())
}

fn text_content(node: roxmltree::Node) -> String {
    node.descendants()
        .filter(|n| n.is_text())
        .filter_map(|n| n.text())
        .collect()
}

/// Restricted child-axis path walker standing in for full XPath.
fn eval_child_path<'a, 'input>(
    node: roxmltree::Node<'a, 'input>,
    expr: &str,
) -> Option<roxmltree::Node<'a, 'input>> {
    let mut current = node;
    for step in expr.split('/') {
        let step = step.trim();
        if step.is_empty() || step == "." {
            continue;
        }
        current = current
            .children()
            .find(|c| c.is_element() && c.has_tag_name(step))?;
    }
    Some(current)
}

/// LLMs routinely emit bare `&` inside tag bodies; escape anything that is
/// not already an entity so the strict parser gets a second chance.
fn escape_stray_ampersands(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let bytes = input.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'&' {
            let rest = &input[i + 1..];
            if is_entity_start(rest) {
                out.push('&');
            } else {
                out.push_str("&amp;");
            }
            i += 1;
        } else {
            let ch = input[i..].chars().next().unwrap();
            out.push(ch);
            i += ch.len_utf8();
        }
    }
    out
}

fn is_entity_start(rest: &str) -> bool {
    for known in ["amp;", "lt;", "gt;", "quot;", "apos;"] {
        if rest.starts_with(known) {
            return true;
        }
    }
    if let Some(numeric) = rest.strip_prefix('#') {
        let digits: String = numeric.chars().take_while(|c| *c != ';').collect();
        return numeric.len() > digits.len()
            && !digits.is_empty()
            && (digits.chars().all(|c| c.is_ascii_digit())
                || (digits.starts_with('x')
                    && digits[1..].chars().all(|c| c.is_ascii_hexdigit())));
    }
    false
}
