//! Compact line-oriented text form of a [`Graph`], used by test fixtures and
//! debug logging.
//!
//! ```text
//! graph layer {
//!   input x: f32[B, 4]
//!   init w: f32[4, 3]
//!   node mm: MatMul(x, w) -> y
//!   node ln: LayerNormalization(y, s, _) -> (z, mean, inv_std) {axis = -1}
//!   node g: ReluGrad@com.microsoft(dz, z) -> dy backward priority=-10
//!   output z
//! }
//! ```
//!
//! `_` stands for an omitted optional input or output. Initializer payloads are
//! not part of the text form; parsed initializers are zero-filled.

use std::collections::BTreeMap;
use std::fmt;

use thiserror::Error;

use super::{Attribute, DType, Dimension, Graph, Initializer, NodeSpec, PassTag, Shape, TypeInfo};
use crate::error::GraphError;

#[derive(Debug, Error)]
pub enum TextError {
    #[error("line {line}: {message}")]
    Syntax { line: usize, message: String },
    #[error(transparent)]
    Graph(#[from] GraphError),
}

/// Parses a graph. The result is indexed but not resolved.
///
/// # Example
/// ```
/// use gradsplit::graph::text::parse_graph;
///
/// let graph = parse_graph(r#"
/// graph tiny {
///   input x: f32[2]
///   node r: Relu(x) -> y
///   output y
/// }
/// "#).expect("valid graph");
/// assert_eq!(graph.name(), "tiny");
/// assert_eq!(graph.len(), 1);
/// ```
pub fn parse_graph(src: &str) -> Result<Graph, TextError> {
    Parser::default().parse(src)
}

/// Parses and resolves a graph written in the text format, panicking on error.
#[macro_export]
macro_rules! dataflow_graph {
    ($src:expr) => {{
        let mut graph = $crate::graph::text::parse_graph($src)
            .expect("failed to parse dataflow graph text");
        graph
            .resolve()
            .expect("dataflow graph text does not resolve");
        graph
    }};
}

#[derive(Default)]
struct Parser {
    line: usize,
}

impl Parser {
    fn err(&self, message: impl Into<String>) -> TextError {
        TextError::Syntax {
            line: self.line,
            message: message.into(),
        }
    }

    fn parse(&mut self, src: &str) -> Result<Graph, TextError> {
        let mut graph: Option<Graph> = None;
        let mut closed = false;
        let mut provenance: Vec<(String, String)> = Vec::new();

        for (idx, raw) in src.lines().enumerate() {
            self.line = idx + 1;
            let line = raw.split("//").next().unwrap_or_default().trim();
            if line.is_empty() {
                continue;
            }
            if closed {
                return Err(self.err("unexpected text after closing `}`"));
            }
            if graph.is_none() {
                graph = Some(self.parse_header(line)?);
                continue;
            }
            let Some(current) = graph.as_mut() else {
                continue;
            };
            if line == "}" {
                closed = true;
                continue;
            }
            let (keyword, rest) = line.split_once(char::is_whitespace).unwrap_or((line, ""));
            let rest = rest.trim();
            match keyword {
                "input" => {
                    let (name, ty) = self.parse_typed_name(rest)?;
                    current.set_value_type(&name, ty.unwrap_or_default());
                    let mut inputs = current.inputs().to_vec();
                    inputs.push(name);
                    current.set_inputs(inputs);
                }
                "init" => {
                    let (name, ty) = self.parse_typed_name(rest)?;
                    let ty = ty.ok_or_else(|| self.err("initializers need a type"))?;
                    let dtype = ty.dtype.ok_or_else(|| self.err("initializers need a dtype"))?;
                    let dims = ty
                        .shape
                        .as_ref()
                        .map(|shape| shape.static_dims())
                        .unwrap_or(Some(Vec::new()))
                        .ok_or_else(|| self.err("initializer shapes must be static"))?;
                    current.add_initializer(name, Initializer::zeros(dtype, dims));
                }
                "value" => {
                    let (name, ty) = self.parse_typed_name(rest)?;
                    current.set_value_type(&name, ty.unwrap_or_default());
                }
                "output" => {
                    let mut outputs = current.outputs().to_vec();
                    outputs.extend(
                        split_top_level(rest, ',')
                            .into_iter()
                            .map(|name| name.to_string()),
                    );
                    current.set_outputs(outputs);
                }
                "twin" => {
                    let (original, twin) = rest
                        .split_once("->")
                        .ok_or_else(|| self.err("expected `twin <name> -> <name>`"))?;
                    current.record_recompute_twin(original.trim(), twin.trim());
                }
                "node" => {
                    let (spec, recompute_of) = self.parse_node(rest)?;
                    let name = spec.name.clone();
                    current.add_node(spec)?;
                    if let Some(original) = recompute_of {
                        provenance.push((name, original));
                    }
                }
                other => return Err(self.err(format!("unknown statement `{other}`"))),
            }
        }

        let mut graph = graph.ok_or_else(|| self.err("input is empty"))?;
        if !closed {
            return Err(self.err("missing `}` to end graph body"));
        }
        for (duplicate, original) in provenance {
            let original_id = graph
                .node_by_name(&original)
                .map(|node| node.id)
                .ok_or_else(|| self.err(format!("recompute_of names unknown node `{original}`")))?;
            let Some(duplicate_id) = graph.node_by_name(&duplicate).map(|node| node.id) else {
                continue;
            };
            if let Some(node) = graph.nodes.get_mut(&duplicate_id) {
                node.recompute_of = Some(original_id);
            }
        }
        Ok(graph)
    }

    fn parse_header(&self, line: &str) -> Result<Graph, TextError> {
        let rest = line
            .strip_prefix("graph")
            .ok_or_else(|| self.err("expected `graph <name> {`"))?;
        let name = rest
            .trim()
            .strip_suffix('{')
            .ok_or_else(|| self.err("missing `{` to start graph body"))?
            .trim();
        if name.is_empty() {
            return Err(self.err("graph name is missing"));
        }
        Ok(Graph::new(name))
    }

    fn parse_typed_name(&self, src: &str) -> Result<(String, Option<TypeInfo>), TextError> {
        match src.split_once(':') {
            Some((name, ty)) => Ok((self.ident(name)?, Some(self.parse_type(ty.trim())?))),
            None => Ok((self.ident(src)?, None)),
        }
    }

    fn ident(&self, src: &str) -> Result<String, TextError> {
        let name = src.trim();
        if name.is_empty() || name.contains(char::is_whitespace) {
            return Err(self.err(format!("invalid name `{name}`")));
        }
        Ok(name.to_string())
    }

    fn parse_type(&self, src: &str) -> Result<TypeInfo, TextError> {
        let (head, shape) = match src.find('[') {
            Some(open) => {
                let body = src[open + 1..]
                    .strip_suffix(']')
                    .ok_or_else(|| self.err(format!("unterminated shape in `{src}`")))?;
                let dims = split_top_level(body, ',')
                    .into_iter()
                    .map(|dim| match dim.parse::<i64>() {
                        Ok(value) => Dimension::Static(value),
                        Err(_) => Dimension::Symbolic(dim.to_string()),
                    })
                    .collect();
                (src[..open].trim(), Some(Shape::new(dims)))
            }
            None => (src.trim(), None),
        };
        let dtype = match head {
            "?" => None,
            other => Some(other.parse::<DType>().map_err(|msg| self.err(msg))?),
        };
        Ok(TypeInfo { dtype, shape })
    }

    fn parse_node(&self, src: &str) -> Result<(NodeSpec, Option<String>), TextError> {
        let (name, rest) = src
            .split_once(':')
            .ok_or_else(|| self.err("expected `node <name>: <Op>(...) -> ...`"))?;
        let name = self.ident(name)?;
        let rest = rest.trim();

        let open = rest
            .find('(')
            .ok_or_else(|| self.err(format!("node `{name}` is missing its operand list")))?;
        let close = rest[open..]
            .find(')')
            .map(|offset| open + offset)
            .ok_or_else(|| self.err(format!("node `{name}` has an unterminated operand list")))?;
        let (op_type, domain) = match rest[..open].trim().split_once('@') {
            Some((op, domain)) => (op.trim(), domain.trim()),
            None => (rest[..open].trim(), ""),
        };
        if op_type.is_empty() {
            return Err(self.err(format!("node `{name}` is missing its op type")));
        }
        let inputs = names_list(&rest[open + 1..close]);

        let rest = rest[close + 1..]
            .trim_start()
            .strip_prefix("->")
            .ok_or_else(|| self.err(format!("node `{name}` is missing `->`")))?
            .trim_start();
        let (outputs, mut rest) = if let Some(list) = rest.strip_prefix('(') {
            let end = list
                .find(')')
                .ok_or_else(|| self.err(format!("node `{name}` has an unterminated output list")))?;
            (names_list(&list[..end]), list[end + 1..].trim_start())
        } else {
            let end = rest
                .find(|c: char| c.is_whitespace() || c == '{')
                .unwrap_or(rest.len());
            (names_list(&rest[..end]), rest[end..].trim_start())
        };

        let mut spec = NodeSpec::new(name, op_type)
            .domain(domain)
            .inputs(inputs)
            .outputs(outputs);

        if let Some(body) = rest.strip_prefix('{') {
            let end = find_closing_brace(body)
                .ok_or_else(|| self.err(format!("node `{}` has unterminated attributes", spec.name)))?;
            spec.attributes = self.parse_attributes(&body[..end])?;
            rest = body[end + 1..].trim_start();
        }

        let mut recompute_of = None;
        for flag in split_flags(rest) {
            if flag == "backward" {
                spec.pass = PassTag::Backward;
            } else if let Some(value) = flag.strip_prefix("priority=") {
                spec.priority = value
                    .parse()
                    .map_err(|_| self.err(format!("invalid priority `{value}`")))?;
            } else if let Some(value) = flag.strip_prefix("desc=") {
                spec.description = self.unquote(value)?;
            } else if let Some(value) = flag.strip_prefix("recompute_of=") {
                recompute_of = Some(value.to_string());
            } else {
                return Err(self.err(format!("unknown node flag `{flag}`")));
            }
        }
        Ok((spec, recompute_of))
    }

    fn parse_attributes(&self, body: &str) -> Result<BTreeMap<String, Attribute>, TextError> {
        let mut attributes = BTreeMap::new();
        for entry in split_top_level(body, ',') {
            let (key, value) = entry
                .split_once('=')
                .ok_or_else(|| self.err(format!("attribute `{entry}` is missing `=`")))?;
            attributes.insert(key.trim().to_string(), self.parse_attribute(value.trim())?);
        }
        Ok(attributes)
    }

    fn parse_attribute(&self, src: &str) -> Result<Attribute, TextError> {
        if src.starts_with('"') {
            return Ok(Attribute::Str(self.unquote(src)?));
        }
        if let Some(body) = src.strip_prefix('[') {
            let body = body
                .strip_suffix(']')
                .ok_or_else(|| self.err(format!("unterminated list `{src}`")))?;
            let items = split_top_level(body, ',');
            if items.iter().any(|item| item.starts_with('"')) {
                let strings = items
                    .iter()
                    .map(|item| self.unquote(item))
                    .collect::<Result<Vec<String>, _>>()?;
                return Ok(Attribute::Strs(strings));
            }
            if let Ok(ints) = items
                .iter()
                .map(|item| item.parse::<i64>())
                .collect::<Result<Vec<i64>, _>>()
            {
                return Ok(Attribute::Ints(ints));
            }
            let floats = items
                .iter()
                .map(|item| item.parse::<f64>())
                .collect::<Result<Vec<f64>, _>>()
                .map_err(|_| self.err(format!("invalid numeric list `{src}`")))?;
            return Ok(Attribute::Floats(floats));
        }
        if let Ok(value) = src.parse::<i64>() {
            return Ok(Attribute::Int(value));
        }
        src.parse::<f64>()
            .map(Attribute::Float)
            .map_err(|_| self.err(format!("invalid attribute value `{src}`")))
    }

    fn unquote(&self, src: &str) -> Result<String, TextError> {
        let inner = src
            .strip_prefix('"')
            .and_then(|s| s.strip_suffix('"'))
            .ok_or_else(|| self.err(format!("expected a quoted string, got `{src}`")))?;
        let mut out = String::with_capacity(inner.len());
        let mut chars = inner.chars();
        while let Some(ch) = chars.next() {
            if ch == '\\' {
                match chars.next() {
                    Some('n') => out.push('\n'),
                    Some(other) => out.push(other),
                    None => return Err(self.err("dangling escape in string")),
                }
            } else {
                out.push(ch);
            }
        }
        Ok(out)
    }
}

fn names_list(src: &str) -> Vec<String> {
    split_top_level(src, ',')
        .into_iter()
        .map(|name| if name == "_" { String::new() } else { name.to_string() })
        .collect()
}

/// Splits on `delimiter` outside of brackets and string literals.
fn split_top_level(input: &str, delimiter: char) -> Vec<&str> {
    let mut pieces = Vec::new();
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    let mut start = 0usize;
    for (idx, ch) in input.char_indices() {
        if in_string {
            match ch {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '[' | '(' => depth += 1,
            ']' | ')' => depth = depth.saturating_sub(1),
            c if c == delimiter && depth == 0 => {
                pieces.push(input[start..idx].trim());
                start = idx + c.len_utf8();
            }
            _ => {}
        }
    }
    let tail = input[start..].trim();
    if !tail.is_empty() || !pieces.is_empty() {
        pieces.push(tail);
    }
    pieces
}

fn find_closing_brace(body: &str) -> Option<usize> {
    let mut in_string = false;
    let mut escaped = false;
    for (idx, ch) in body.char_indices() {
        if in_string {
            match ch {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '}' => return Some(idx),
            _ => {}
        }
    }
    None
}

/// Splits trailing node flags on whitespace, keeping quoted descriptions whole.
fn split_flags(src: &str) -> Vec<&str> {
    let mut flags = Vec::new();
    let mut in_string = false;
    let mut escaped = false;
    let mut start: Option<usize> = None;
    for (idx, ch) in src.char_indices() {
        if in_string {
            match ch {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        if ch.is_whitespace() {
            if let Some(begin) = start.take() {
                flags.push(&src[begin..idx]);
            }
            continue;
        }
        if start.is_none() {
            start = Some(idx);
        }
        if ch == '"' {
            in_string = true;
        }
    }
    if let Some(begin) = start {
        flags.push(&src[begin..]);
    }
    flags
}

fn quote(value: &str) -> String {
    format!("{value:?}")
}

fn join_names(names: &[String]) -> String {
    names
        .iter()
        .map(|name| if name.is_empty() { "_" } else { name.as_str() })
        .collect::<Vec<_>>()
        .join(", ")
}

impl fmt::Display for Graph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "graph {} {{", self.name)?;
        for input in &self.inputs {
            match self.type_of(input).filter(|ty| !ty.is_unknown()) {
                Some(ty) => writeln!(f, "  input {input}: {ty}")?,
                None => writeln!(f, "  input {input}")?,
            }
        }
        for (name, init) in &self.initializers {
            writeln!(f, "  init {name}: {}", init.type_info())?;
        }
        for value in self.values.values() {
            if value.ty.is_unknown()
                || self.is_input(&value.name)
                || self.initializers.contains_key(&value.name)
            {
                continue;
            }
            writeln!(f, "  value {}: {}", value.name, value.ty)?;
        }
        for node in self.nodes.values() {
            write!(f, "  node {}: {}", node.name, node.op_type)?;
            if !node.domain.is_empty() {
                write!(f, "@{}", node.domain)?;
            }
            write!(f, "({}) -> ", join_names(&node.inputs))?;
            if node.outputs.len() == 1 && !node.outputs[0].is_empty() {
                write!(f, "{}", node.outputs[0])?;
            } else {
                write!(f, "({})", join_names(&node.outputs))?;
            }
            if !node.attributes.is_empty() {
                let attrs: Vec<String> = node
                    .attributes
                    .iter()
                    .map(|(key, value)| format!("{key} = {value}"))
                    .collect();
                write!(f, " {{{}}}", attrs.join(", "))?;
            }
            if node.is_backward() {
                f.write_str(" backward")?;
            }
            if node.priority != 0 {
                write!(f, " priority={}", node.priority)?;
            }
            if !node.description.is_empty() {
                write!(f, " desc={}", quote(&node.description))?;
            }
            if let Some(original) = node.recompute_of.and_then(|id| self.node(id)) {
                write!(f, " recompute_of={}", original.name)?;
            }
            writeln!(f)?;
        }
        for (original, twin) in &self.recompute_twins {
            writeln!(f, "  twin {original} -> {twin}")?;
        }
        if !self.outputs.is_empty() {
            writeln!(f, "  output {}", self.outputs.join(", "))?;
        }
        f.write_str("}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_top_level_respects_brackets_and_strings() {
        assert_eq!(
            split_top_level(r#"a = [1, 2], b = "x, y", c = 3"#, ','),
            vec!["a = [1, 2]", r#"b = "x, y""#, "c = 3"]
        );
        assert!(split_top_level("  ", ',').is_empty());
    }

    #[test]
    fn flags_keep_quoted_descriptions_together() {
        assert_eq!(
            split_flags(r#"backward desc="Backward pass" priority=-10"#),
            vec!["backward", r#"desc="Backward pass""#, "priority=-10"]
        );
    }

    #[test]
    fn omitted_slots_use_underscore() {
        assert_eq!(names_list("x, _, z"), vec!["x", "", "z"]);
    }
}
