//! Markup template transpiler.
//!
//! A template mixes literal output with `<% code %>` blocks. The transpiler
//! walks it once with a three-state machine and emits a script unit declaring
//! `<Type>Window`, a subclass whose `Render` method writes each literal run and
//! splices each code block in place.
//!
//! Quoted runs in the literal text (`"..."` or `'...'`) are copied verbatim, so
//! a `<%` inside an attribute value or a quoted sentence never opens a block.

use std::path::Path;

use crate::domain::Diagnostic;

/// Suffix appended to a type name to form its synthesized template subclass.
pub const WINDOW_SUFFIX: &str = "Window";

/// Base type used when a template has no code-behind script.
pub const DEFAULT_TEMPLATE_BASE: &str = "Kiln.Page";

const ENTRY_METHOD: &str = "Render";
const STANDARD_USINGS: &[&str] = &["Kiln"];

/// Piece of a template after segmentation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    Literal(String),
    Code(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Literal,
    Quoted(char),
    Code,
}

/// A template awaiting transpilation. Lives for one compile cycle.
#[derive(Debug, Clone)]
pub struct TemplateUnit<'a> {
    /// Logical `namespace.type` of the code-behind.
    pub type_name: &'a str,
    /// Markup file, used for diagnostics.
    pub markup_path: &'a Path,
    pub markup: &'a str,
    /// Whether a code-behind script declares `type_name`.
    pub has_code_behind: bool,
}

/// Name of the class synthesized for a template-derived unit.
pub fn window_type_name(type_name: &str) -> String {
    format!("{type_name}{WINDOW_SUFFIX}")
}

/// Split markup into literal and code segments.
///
/// An unterminated code block is reported as a malformed template. An
/// unterminated quote is plain text and stays literal.
pub fn segment(markup: &str, markup_path: &Path) -> Result<Vec<Segment>, Diagnostic> {
    let mut segments = Vec::new();
    let mut buffer = String::new();
    let mut state = State::Literal;
    let mut chars = markup.chars().peekable();

    let (mut line, mut column) = (1u32, 1u32);
    let mut code_opened_at = (1u32, 1u32);

    while let Some(ch) = chars.next() {
        let position = (line, column);
        if ch == '\n' {
            line += 1;
            column = 1;
        } else {
            column += 1;
        }

        match state {
            State::Literal => {
                if ch == '<' && chars.peek() == Some(&'%') {
                    chars.next();
                    column += 1;
                    flush_literal(&mut buffer, &mut segments);
                    code_opened_at = position;
                    state = State::Code;
                } else {
                    if ch == '"' || ch == '\'' {
                        state = State::Quoted(ch);
                    }
                    buffer.push(ch);
                }
            }
            State::Quoted(delimiter) => {
                buffer.push(ch);
                if ch == delimiter {
                    state = State::Literal;
                }
            }
            State::Code => {
                if ch == '%' && chars.peek() == Some(&'>') {
                    chars.next();
                    column += 1;
                    let code = buffer.trim();
                    if !code.is_empty() {
                        segments.push(Segment::Code(code.to_string()));
                    }
                    buffer.clear();
                    state = State::Literal;
                } else {
                    buffer.push(ch);
                }
            }
        }
    }

    if state == State::Code {
        let (line, column) = code_opened_at;
        return Err(
            Diagnostic::error("malformed template: code block opened with `<%` is never closed")
                .at(markup_path, line, column),
        );
    }

    flush_literal(&mut buffer, &mut segments);
    Ok(segments)
}

fn flush_literal(buffer: &mut String, segments: &mut Vec<Segment>) {
    if !buffer.is_empty() {
        segments.push(Segment::Literal(std::mem::take(buffer)));
    }
}

/// Transpile a template into a compilable script unit.
pub fn transpile(unit: &TemplateUnit<'_>) -> Result<String, Diagnostic> {
    let segments = segment(unit.markup, unit.markup_path)?;
    Ok(render_unit(unit, &segments))
}

fn render_unit(unit: &TemplateUnit<'_>, segments: &[Segment]) -> String {
    let (namespace, short_name) = match unit.type_name.rsplit_once('.') {
        Some((namespace, short_name)) => (Some(namespace), short_name),
        None => (None, unit.type_name),
    };
    let base = if unit.has_code_behind {
        short_name.to_string()
    } else {
        DEFAULT_TEMPLATE_BASE.to_string()
    };

    let mut out = String::new();
    for using in STANDARD_USINGS {
        out.push_str(&format!("using {using};\n"));
    }
    out.push('\n');

    let indent = if namespace.is_some() { "    " } else { "" };
    if let Some(namespace) = namespace {
        out.push_str(&format!("namespace {namespace}\n{{\n"));
    }
    out.push_str(&format!(
        "{indent}public class {short_name}{WINDOW_SUFFIX} : {base}\n{indent}{{\n"
    ));
    out.push_str(&format!(
        "{indent}    public override void {ENTRY_METHOD}()\n{indent}    {{\n"
    ));
    for segment in segments {
        match segment {
            Segment::Literal(text) => {
                out.push_str(&format!(
                    "{indent}        Response.WriteLiteral(@\"{}\");\n",
                    text.replace('"', "\"\"")
                ));
            }
            Segment::Code(code) => {
                out.push_str(&format!("{indent}        {code}\n"));
            }
        }
    }
    out.push_str(&format!("{indent}    }}\n{indent}}}\n"));
    if namespace.is_some() {
        out.push_str("}\n");
    }
    out
}
