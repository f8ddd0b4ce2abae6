use serde::Deserialize;

use crate::blocks::registry::{
    BlockKind, Conversion, ParamDef, ParamType, PortDef, SignalClass,
};
use crate::context::{CodegenContext, format_real};
use crate::diag::Diagnostic;
use crate::graph::ParamValue;

/// Frontmatter of an ATL file: JSON between `---` delimiters. Unknown
/// fields (editor color, width, ...) are ignored.
#[derive(Debug, Deserialize)]
struct FrontMatter {
    #[serde(rename = "type")]
    type_id: String,
    #[serde(default)]
    category: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    inputs: Vec<PortSpec>,
    #[serde(default)]
    outputs: Vec<PortSpec>,
    #[serde(default)]
    parameters: Vec<ParamSpec>,
    #[serde(default)]
    registers: Vec<String>,
    #[serde(default)]
    memo: Vec<MemoSpec>,
}

#[derive(Debug, Deserialize)]
struct PortSpec {
    id: String,
    #[serde(default)]
    name: String,
    #[serde(rename = "type", default)]
    class: String,
    #[serde(default)]
    required: bool,
}

#[derive(Debug, Deserialize)]
struct ParamSpec {
    id: String,
    #[serde(default)]
    name: String,
    #[serde(rename = "type", default)]
    ty: String,
    #[serde(default)]
    default: serde_json::Value,
    #[serde(default)]
    min: Option<f64>,
    #[serde(default)]
    max: Option<f64>,
    #[serde(default)]
    conversion: String,
    #[serde(default)]
    options: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct MemoSpec {
    name: String,
    size: usize,
}

/// A template body node after parsing.
#[derive(Debug, Clone)]
enum Node {
    Line(String),
    Comment(String),
    If {
        condition: Cond,
        then: Vec<Node>,
        otherwise: Vec<Node>,
    },
}

/// Conditions of `@if`: parameter/connection tests with equality and
/// negation.
#[derive(Debug, Clone)]
enum Cond {
    Truthy(Operand),
    Not(Box<Cond>),
    Equals(Operand, Operand, bool),
}

#[derive(Debug, Clone)]
enum Operand {
    Param(String),
    PinConnected(String),
    Number(f64),
    Text(String),
    Bool(bool),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Section {
    Header,
    Init,
    Main,
}

/// A block kind defined by a declarative ATL template.
pub struct TemplateKind {
    type_id: String,
    category: String,
    display_name: String,
    inputs: Vec<PortDef>,
    outputs: Vec<PortDef>,
    parameters: Vec<ParamDef>,
    memos: Vec<MemoSpec>,
    registers: Vec<String>,
    header: Vec<Node>,
    init: Vec<Node>,
    main: Vec<Node>,
}

impl TemplateKind {
    /// Parse frontmatter and body. Problems (malformed JSON, unknown
    /// directive, unbalanced `@if`) are fatal template diagnostics.
    pub fn parse(source: &str) -> Result<Self, Diagnostic> {
        let (front, body) = split_frontmatter(source)?;
        let front: FrontMatter = serde_json::from_str(front)
            .map_err(|e| Diagnostic::error(format!("template frontmatter: {e}")))?;

        let display_name = if front.name.is_empty() {
            front.type_id.clone()
        } else {
            front.name.clone()
        };
        let mut kind = Self {
            type_id: front.type_id,
            category: front.category,
            display_name,
            inputs: front.inputs.iter().map(port_def).collect(),
            outputs: front.outputs.iter().map(port_def).collect(),
            parameters: front
                .parameters
                .iter()
                .map(param_def)
                .collect::<Result<_, _>>()?,
            memos: front.memo,
            registers: front.registers,
            header: Vec::new(),
            init: Vec::new(),
            main: Vec::new(),
        };
        kind.parse_body(body)?;
        Ok(kind)
    }

    fn parse_body(&mut self, body: &str) -> Result<(), Diagnostic> {
        struct Frame {
            condition: Cond,
            then: Vec<Node>,
            otherwise: Vec<Node>,
            in_else: bool,
        }
        let mut section = Section::Main;
        let mut stack: Vec<Frame> = Vec::new();
        for (index, raw) in body.lines().enumerate() {
            let line_no = index + 1;
            let line = raw.trim();
            if line.is_empty() {
                continue;
            }
            let err =
                |message: String| Diagnostic::error(format!("template line {line_no}: {message}"));
            let node = if let Some(rest) = line.strip_prefix('@') {
                let (directive, argument) = match rest.split_once(char::is_whitespace) {
                    Some((d, a)) => (d, a.trim()),
                    None => (rest, ""),
                };
                match directive {
                    "section" => {
                        if !stack.is_empty() {
                            return Err(err("@section inside @if".into()));
                        }
                        section = match argument {
                            "header" => Section::Header,
                            "init" => Section::Init,
                            "main" => Section::Main,
                            other => return Err(err(format!("unknown section `{other}`"))),
                        };
                        continue;
                    }
                    "if" => {
                        let condition = parse_cond(argument).map_err(err)?;
                        stack.push(Frame {
                            condition,
                            then: Vec::new(),
                            otherwise: Vec::new(),
                            in_else: false,
                        });
                        continue;
                    }
                    "else" => {
                        let frame = stack
                            .last_mut()
                            .ok_or_else(|| err("@else without @if".into()))?;
                        if frame.in_else {
                            return Err(err("duplicate @else".into()));
                        }
                        frame.in_else = true;
                        continue;
                    }
                    "endif" => {
                        let frame = stack
                            .pop()
                            .ok_or_else(|| err("@endif without @if".into()))?;
                        Node::If {
                            condition: frame.condition,
                            then: frame.then,
                            otherwise: frame.otherwise,
                        }
                    }
                    "comment" => Node::Comment(argument.to_owned()),
                    other => return Err(err(format!("unknown directive `@{other}`"))),
                }
            } else {
                Node::Line(line.to_owned())
            };
            let sink = match stack.last_mut() {
                Some(frame) if frame.in_else => &mut frame.otherwise,
                Some(frame) => &mut frame.then,
                None => match section {
                    Section::Header => &mut self.header,
                    Section::Init => &mut self.init,
                    Section::Main => &mut self.main,
                },
            };
            sink.push(node);
        }
        if !stack.is_empty() {
            return Err(Diagnostic::error("template: missing @endif"));
        }
        Ok(())
    }

    fn emit(
        &self,
        nodes: &[Node],
        section: Section,
        ctx: &mut CodegenContext<'_>,
    ) -> Result<(), Diagnostic> {
        for node in nodes {
            match node {
                Node::Comment(text) => {
                    let line = format!("; {text}");
                    match section {
                        Section::Header => ctx.push_header_comment(text.clone()),
                        Section::Init => ctx.push_init(line),
                        Section::Main => ctx.push_main(line),
                    }
                }
                Node::Line(text) => {
                    let line = self.substitute(text, ctx)?;
                    match section {
                        Section::Header => self.header_line(&line, ctx)?,
                        Section::Init => ctx.push_init(line),
                        Section::Main => ctx.push_main(line),
                    }
                }
                Node::If {
                    condition,
                    then,
                    otherwise,
                } => {
                    let branch = if self.eval(condition, ctx)? {
                        then
                    } else {
                        otherwise
                    };
                    self.emit(branch, section, ctx)?;
                }
            }
        }
        Ok(())
    }

    /// Header-section lines declare constants; anything else is carried
    /// as a header comment.
    fn header_line(&self, line: &str, ctx: &mut CodegenContext<'_>) -> Result<(), Diagnostic> {
        let mut parts = line.split_whitespace();
        match (parts.next(), parts.next(), parts.next()) {
            (Some(keyword), Some(name), Some(value)) if keyword.eq_ignore_ascii_case("equ") => {
                ctx.register_equ(&name.to_ascii_lowercase(), value);
                Ok(())
            }
            _ => {
                ctx.push_header_comment(line.trim_start_matches(';').trim().to_owned());
                Ok(())
            }
        }
    }

    fn substitute(&self, text: &str, ctx: &mut CodegenContext<'_>) -> Result<String, Diagnostic> {
        let mut out = String::with_capacity(text.len());
        let mut rest = text;
        while let Some(start) = rest.find("${") {
            out.push_str(&rest[..start]);
            let after = &rest[start + 2..];
            let Some(end) = after.find('}') else {
                return Err(self.fail(ctx, format!("unterminated placeholder in `{text}`")));
            };
            let key = &after[..end];
            let value = self.resolve(key, ctx)?;
            out.push_str(&value);
            rest = &after[end + 1..];
        }
        out.push_str(rest);
        Ok(out)
    }

    fn resolve(&self, key: &str, ctx: &mut CodegenContext<'_>) -> Result<String, Diagnostic> {
        if let Some(port) = key.strip_prefix("input.") {
            return ctx.input_register(port).ok_or_else(|| {
                self.fail(ctx, format!("placeholder ${{input.{port}}}: not connected"))
            });
        }
        if let Some(port) = key.strip_prefix("output.") {
            return ctx.allocate_register(port);
        }
        if let Some(local) = key.strip_prefix("reg.") {
            if !self.registers.iter().any(|r| r == local) {
                return Err(self.fail(ctx, format!("undeclared local register `{local}`")));
            }
            return ctx.allocate_register(local);
        }
        if let Some(local) = key.strip_prefix("mem.") {
            let Some(memo) = self.memos.iter().find(|m| m.name == local) else {
                return Err(self.fail(ctx, format!("undeclared memory `{local}`")));
            };
            return Ok(ctx.allocate_memory_named(&memo.name, memo.size)?.name);
        }
        match self.parameter_def(key) {
            Some(def) => Ok(match ctx.parameter(key) {
                Some(ParamValue::Number(value)) => format_real(def.conversion.apply(*value)),
                Some(ParamValue::Bool(value)) => if *value { "1" } else { "0" }.to_owned(),
                Some(ParamValue::Text(value)) => value.clone(),
                None => match &def.default {
                    ParamValue::Number(value) => format_real(def.conversion.apply(*value)),
                    ParamValue::Bool(value) => if *value { "1" } else { "0" }.to_owned(),
                    ParamValue::Text(value) => value.clone(),
                },
            }),
            None => Err(self.fail(ctx, format!("unresolved placeholder `${{{key}}}`"))),
        }
    }

    fn eval(&self, condition: &Cond, ctx: &mut CodegenContext<'_>) -> Result<bool, Diagnostic> {
        Ok(match condition {
            Cond::Not(inner) => !self.eval(inner, ctx)?,
            Cond::Truthy(operand) => match self.value(operand, ctx)? {
                ParamValue::Bool(value) => value,
                ParamValue::Number(value) => value != 0.0,
                ParamValue::Text(value) => !value.is_empty(),
            },
            Cond::Equals(lhs, rhs, negated) => {
                let equal = match (self.value(lhs, ctx)?, self.value(rhs, ctx)?) {
                    (ParamValue::Number(a), ParamValue::Number(b)) => a == b,
                    (ParamValue::Bool(a), ParamValue::Bool(b)) => a == b,
                    (ParamValue::Text(a), ParamValue::Text(b)) => a == b,
                    _ => false,
                };
                equal != *negated
            }
        })
    }

    fn value(
        &self,
        operand: &Operand,
        ctx: &mut CodegenContext<'_>,
    ) -> Result<ParamValue, Diagnostic> {
        Ok(match operand {
            Operand::Number(value) => ParamValue::Number(*value),
            Operand::Text(value) => ParamValue::Text(value.clone()),
            Operand::Bool(value) => ParamValue::Bool(*value),
            Operand::PinConnected(port) => {
                let connected = if self.inputs.iter().any(|p| p.id == *port) {
                    ctx.input_register(port).is_some()
                } else if self.outputs.iter().any(|p| p.id == *port) {
                    ctx.is_output_connected(port)
                } else {
                    return Err(self.fail(ctx, format!("pinConnected: unknown port `{port}`")));
                };
                ParamValue::Bool(connected)
            }
            Operand::Param(name) => match ctx.parameter(name) {
                Some(value) => value.clone(),
                None => match self.parameter_def(name) {
                    Some(def) => def.default.clone(),
                    None => {
                        return Err(self.fail(ctx, format!("unknown parameter `{name}`")));
                    }
                },
            },
        })
    }

    fn fail(&self, ctx: &CodegenContext<'_>, message: String) -> Diagnostic {
        Diagnostic::error_for(ctx.block_id().to_owned(), message)
    }
}

impl BlockKind for TemplateKind {
    fn type_id(&self) -> &str {
        &self.type_id
    }

    fn category(&self) -> &str {
        &self.category
    }

    fn display_name(&self) -> &str {
        &self.display_name
    }

    fn inputs(&self) -> &[PortDef] {
        &self.inputs
    }

    fn outputs(&self) -> &[PortDef] {
        &self.outputs
    }

    fn parameters(&self) -> &[ParamDef] {
        &self.parameters
    }

    fn declare(&self, ctx: &mut CodegenContext<'_>) -> Result<(), Diagnostic> {
        // Memos are laid out during the first visit so their bases do
        // not depend on which placeholder is hit first.
        for memo in &self.memos {
            ctx.allocate_memory_named(&memo.name, memo.size)?;
        }
        self.emit(&self.header, Section::Header, ctx)
    }

    fn emit_init(&self, ctx: &mut CodegenContext<'_>) -> Result<(), Diagnostic> {
        self.emit(&self.init, Section::Init, ctx)
    }

    fn emit_main(&self, ctx: &mut CodegenContext<'_>) -> Result<(), Diagnostic> {
        self.emit(&self.main, Section::Main, ctx)
    }
}

fn split_frontmatter(source: &str) -> Result<(&str, &str), Diagnostic> {
    let source = source.trim_start_matches('\u{feff}');
    let mut rest = source;
    // Skip leading blank lines before the first delimiter.
    loop {
        match rest.split_once('\n') {
            Some((line, tail)) if line.trim().is_empty() => rest = tail,
            Some((line, tail)) if line.trim() == "---" => {
                rest = tail;
                break;
            }
            _ => return Err(Diagnostic::error("template: missing `---` frontmatter")),
        }
    }
    let mut offset = 0;
    for line in rest.lines() {
        if line.trim() == "---" {
            let front = &rest[..offset];
            let body = &rest[offset + line.len()..];
            let body = body.strip_prefix('\n').unwrap_or(body);
            return Ok((front, body));
        }
        offset += line.len() + 1;
    }
    Err(Diagnostic::error("template: unterminated frontmatter"))
}

fn port_def(spec: &PortSpec) -> PortDef {
    PortDef {
        id: spec.id.clone(),
        name: if spec.name.is_empty() {
            spec.id.clone()
        } else {
            spec.name.clone()
        },
        class: if spec.class.eq_ignore_ascii_case("control") {
            SignalClass::Control
        } else {
            SignalClass::Audio
        },
        required: spec.required,
    }
}

fn param_def(spec: &ParamSpec) -> Result<ParamDef, Diagnostic> {
    let ty = match spec.ty.to_ascii_lowercase().as_str() {
        "" | "number" => ParamType::Number,
        "boolean" | "bool" => ParamType::Boolean,
        "select" => ParamType::Select,
        "string" | "text" => ParamType::Text,
        other => {
            return Err(Diagnostic::error(format!(
                "template parameter `{}`: unknown type `{other}`",
                spec.id
            )));
        }
    };
    let default = match (&spec.default, ty) {
        (serde_json::Value::Null, ParamType::Number) => ParamValue::Number(0.0),
        (serde_json::Value::Null, ParamType::Boolean) => ParamValue::Bool(false),
        (serde_json::Value::Null, _) => {
            ParamValue::Text(spec.options.first().cloned().unwrap_or_default())
        }
        (serde_json::Value::Bool(value), _) => ParamValue::Bool(*value),
        (serde_json::Value::Number(value), _) => {
            ParamValue::Number(value.as_f64().unwrap_or(0.0))
        }
        (serde_json::Value::String(value), _) => ParamValue::Text(value.clone()),
        (other, _) => {
            return Err(Diagnostic::error(format!(
                "template parameter `{}`: unsupported default `{other}`",
                spec.id
            )));
        }
    };
    Ok(ParamDef {
        id: spec.id.clone(),
        name: if spec.name.is_empty() {
            spec.id.clone()
        } else {
            spec.name.clone()
        },
        ty,
        default,
        min: spec.min,
        max: spec.max,
        conversion: match spec.conversion.to_ascii_uppercase().as_str() {
            "LOGFREQ" => Conversion::LogFreq,
            "DBLEVEL" => Conversion::DbLevel,
            _ => Conversion::None,
        },
        options: spec.options.clone(),
    })
}

/// Condition grammar: `!* primary (('==' | '!=') !* primary)?` where a
/// primary is `pinConnected(port)`, a quoted string, a number, `true`,
/// `false`, or a parameter name.
fn parse_cond(text: &str) -> Result<Cond, String> {
    let mut input = text.trim();
    let cond = parse_unary(&mut input)?;
    let input_trimmed = input.trim_start();
    if let Some(rest) = input_trimmed.strip_prefix("==") {
        let mut rest = rest.trim_start();
        let rhs = parse_operand(&mut rest)?;
        ensure_end(rest)?;
        return Ok(equals(cond, rhs, false));
    }
    if let Some(rest) = input_trimmed.strip_prefix("!=") {
        let mut rest = rest.trim_start();
        let rhs = parse_operand(&mut rest)?;
        ensure_end(rest)?;
        return Ok(equals(cond, rhs, true));
    }
    ensure_end(input_trimmed)?;
    Ok(cond)
}

fn equals(lhs: Cond, rhs: Operand, negated: bool) -> Cond {
    match lhs {
        Cond::Truthy(operand) => Cond::Equals(operand, rhs, negated),
        Cond::Not(inner) => Cond::Not(Box::new(equals(*inner, rhs, negated))),
        other => other,
    }
}

fn ensure_end(rest: &str) -> Result<(), String> {
    if rest.trim().is_empty() {
        Ok(())
    } else {
        Err(format!("trailing input `{}`", rest.trim()))
    }
}

fn parse_unary(input: &mut &str) -> Result<Cond, String> {
    let trimmed = input.trim_start();
    if let Some(rest) = trimmed.strip_prefix('!') {
        if !rest.trim_start().starts_with('=') {
            *input = rest;
            return Ok(Cond::Not(Box::new(parse_unary(input)?)));
        }
    }
    *input = trimmed;
    Ok(Cond::Truthy(parse_operand(input)?))
}

fn parse_operand(input: &mut &str) -> Result<Operand, String> {
    let trimmed = input.trim_start();
    if let Some(rest) = trimmed.strip_prefix('"') {
        let Some(end) = rest.find('"') else {
            return Err("unterminated string".into());
        };
        *input = &rest[end + 1..];
        return Ok(Operand::Text(rest[..end].to_owned()));
    }
    let end = trimmed
        .find(|c: char| !(c.is_alphanumeric() || c == '_' || c == '.' || c == '-'))
        .unwrap_or(trimmed.len());
    if end == 0 {
        return Err(format!("expected an operand at `{trimmed}`"));
    }
    let word = &trimmed[..end];
    let rest = &trimmed[end..];
    if word == "pinConnected" {
        let rest = rest.trim_start();
        let Some(args) = rest.strip_prefix('(') else {
            return Err("pinConnected needs a (port)".into());
        };
        let Some(close) = args.find(')') else {
            return Err("pinConnected: missing `)`".into());
        };
        *input = &args[close + 1..];
        return Ok(Operand::PinConnected(args[..close].trim().to_owned()));
    }
    *input = rest;
    Ok(match word {
        "true" => Operand::Bool(true),
        "false" => Operand::Bool(false),
        _ => match word.parse::<f64>() {
            Ok(number) => Operand::Number(number),
            Err(_) => Operand::Param(word.to_owned()),
        },
    })
}
