use std::collections::HashMap;

use tracing::debug;

use crate::assembler::Assembler;
use crate::blocks::registry::{BlockKind, Registry};
use crate::config::CompilerOptions;
use crate::context::CodegenContext;
use crate::diag::{self, Diagnostic};
use crate::graph::{BlockGraph, ParamValue};
use crate::topo;

/// Resource use of a successful compile.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Statistics {
    /// Instructions emitted, before NOP padding.
    pub instructions: usize,
    /// Permanent registers allocated.
    pub registers: usize,
    /// Delay RAM words reserved.
    pub memory_words: usize,
    /// Blocks visited.
    pub blocks: usize,
}

/// Outcome of a graph compile: generated assembly and statistics when
/// successful, and the full diagnostic list either way.
#[derive(Debug, Clone)]
pub struct CompileResult {
    pub success: bool,
    pub assembly: Option<String>,
    pub statistics: Option<Statistics>,
    pub diagnostics: Vec<Diagnostic>,
}

impl CompileResult {
    fn failure(diagnostics: Vec<Diagnostic>) -> Self {
        Self {
            success: false,
            assembly: None,
            statistics: None,
            diagnostics,
        }
    }

    pub fn errors(&self) -> impl Iterator<Item = &Diagnostic> {
        self.diagnostics.iter().filter(|d| d.fatal)
    }

    pub fn warnings(&self) -> impl Iterator<Item = &Diagnostic> {
        self.diagnostics.iter().filter(|d| !d.fatal)
    }
}

/// Compile a block graph to FV-1 assembly text.
#[must_use]
pub fn compile(graph: &BlockGraph, registry: &Registry, options: &CompilerOptions) -> CompileResult {
    let mut diagnostics = validate(graph, registry);
    if diag::any_fatal(&diagnostics) {
        return CompileResult::failure(diagnostics);
    }
    debug!(blocks = graph.blocks.len(), "graph validated");

    let sorted = topo::sort(graph);
    if !sorted.feedback.is_empty() {
        diagnostics.push(Diagnostic::warning(format!(
            "{} feedback connection(s): {}",
            sorted.feedback.len(),
            sorted.feedback.join(", ")
        )));
    }
    debug!(order = ?sorted.order, feedback = sorted.feedback.len(), "blocks ordered");

    let mut ctx = CodegenContext::new(options, graph);

    // Reserve a register for every connected output up front; a feedback
    // reader then finds its source allocated no matter the visit order.
    for block_id in &sorted.order {
        let block = graph.block(block_id).expect("ordered block exists");
        let kind = registry.get(&block.kind).expect("validated block kind");
        for port in kind.outputs() {
            if graph.is_source(block_id, &port.id) {
                let ordinal = ctx.ordinal(block_id, kind.type_id());
                if let Err(diagnostic) =
                    ctx.allocate_output(block_id, kind.type_id(), ordinal, &port.id)
                {
                    diagnostics.push(diagnostic);
                }
            }
        }
    }
    if diag::any_fatal(&diagnostics) {
        return CompileResult::failure(diagnostics);
    }

    if options.verbose {
        ctx.push_header_comment(format!(
            "{} block(s), {} connection(s)",
            graph.blocks.len(),
            graph.connections.len()
        ));
        for block_id in &sorted.order {
            let block = graph.block(block_id).expect("ordered block exists");
            ctx.push_header_comment(format!("  {block_id}: {}", block.kind));
        }
    }

    // Pass 1: EQU contributions, memory reservations, init code.
    for block_id in &sorted.order {
        let block = graph.block(block_id).expect("ordered block exists");
        let kind = registry.get(&block.kind).expect("validated block kind");
        ctx.set_current(block_id, kind.type_id(), merged_parameters(kind, block));
        let init_mark = ctx.init_lines().len();
        if let Err(diagnostic) = kind.declare(&mut ctx).and_then(|()| kind.emit_init(&mut ctx)) {
            ctx.diagnostics.push(diagnostic);
        }
        if ctx.init_lines().len() > init_mark {
            ctx.insert_init_comment(init_mark, format!("; init: {} ({block_id})", block.kind));
        }
    }
    debug!(init_lines = ctx.init_lines().len(), "pass 1 complete");

    // Pass 2: main body, one banner per block.
    for block_id in &sorted.order {
        let block = graph.block(block_id).expect("ordered block exists");
        let kind = registry.get(&block.kind).expect("validated block kind");
        ctx.set_current(block_id, kind.type_id(), merged_parameters(kind, block));
        banner(&mut ctx, kind);
        if let Err(diagnostic) = kind.emit_main(&mut ctx) {
            ctx.diagnostics.push(diagnostic);
        }
    }
    debug!(main_lines = ctx.main_lines().len(), "pass 2 complete");

    diagnostics.append(&mut ctx.diagnostics);
    if diag::any_fatal(&diagnostics) {
        return CompileResult::failure(diagnostics);
    }

    let assembly = render(graph, &ctx);
    let instructions = count_instructions(&assembly);
    if instructions > options.prog_size {
        diagnostics.push(Diagnostic::error(format!(
            "program needs {instructions} instructions but only {} fit",
            options.prog_size
        )));
        return CompileResult::failure(diagnostics);
    }
    if instructions * 10 >= options.prog_size * 9 {
        diagnostics.push(Diagnostic::warning(format!(
            "program uses {instructions} of {} instruction slots",
            options.prog_size
        )));
    }

    let statistics = Statistics {
        instructions,
        registers: ctx.registers_used(),
        memory_words: ctx.memory_used(),
        blocks: sorted.order.len(),
    };
    debug!(?statistics, "compile finished");
    CompileResult {
        success: true,
        assembly: Some(assembly),
        statistics: Some(statistics),
        diagnostics,
    }
}

/// Compile a graph all the way to the program image.
#[must_use]
pub fn compile_to_program(
    graph: &BlockGraph,
    registry: &Registry,
    options: &CompilerOptions,
) -> (CompileResult, Option<Vec<u32>>) {
    let mut result = compile(graph, registry, options);
    let Some(assembly) = result.assembly.as_deref() else {
        return (result, None);
    };
    let output = Assembler::new(options.clone()).assemble(assembly);
    let ok = output.is_ok();
    // Both stages watch the instruction budget; report each warning once.
    let seen: Vec<String> = result
        .diagnostics
        .iter()
        .filter(|d| !d.fatal)
        .map(|d| d.message.clone())
        .collect();
    result.diagnostics.extend(
        output
            .diagnostics
            .into_iter()
            .filter(|d| d.fatal || !seen.contains(&d.message)),
    );
    if ok {
        (result, Some(output.program))
    } else {
        result.success = false;
        (result, None)
    }
}

/// Structural validation, front to back; every problem is reported, not
/// just the first.
fn validate(graph: &BlockGraph, registry: &Registry) -> Vec<Diagnostic> {
    let mut diagnostics = Vec::new();
    if graph.blocks.is_empty() {
        diagnostics.push(Diagnostic::error("the graph has no blocks"));
        return diagnostics;
    }

    let mut kinds: HashMap<&str, &dyn BlockKind> = HashMap::new();
    for block in &graph.blocks {
        match registry.get(&block.kind) {
            Some(kind) => {
                kinds.insert(&block.id, kind);
            }
            None => diagnostics.push(Diagnostic::error_for(
                block.id.clone(),
                format!("unknown block kind `{}`", block.kind),
            )),
        }
    }

    if !graph.blocks.iter().any(|b| {
        kinds
            .get(b.id.as_str())
            .is_some_and(|k| k.inputs().is_empty() && !k.outputs().is_empty())
    }) {
        diagnostics.push(Diagnostic::warning(
            "no input blocks; the program will be silent",
        ));
    }
    if !graph.blocks.iter().any(|b| {
        kinds
            .get(b.id.as_str())
            .is_some_and(|k| k.outputs().is_empty())
    }) {
        diagnostics.push(Diagnostic::warning(
            "no output blocks; nothing reaches the codec",
        ));
    }

    let mut sinks: HashMap<(&str, &str), &str> = HashMap::new();
    for connection in &graph.connections {
        let from = &connection.from;
        let to = &connection.to;
        let (Some(src), Some(dst)) = (
            kinds.get(from.block_id.as_str()),
            kinds.get(to.block_id.as_str()),
        ) else {
            diagnostics.push(Diagnostic::error(format!(
                "connection `{}` references a missing block",
                connection.id
            )));
            continue;
        };
        let (Some(out_port), Some(in_port)) = (src.output(&from.port_id), dst.input(&to.port_id))
        else {
            diagnostics.push(Diagnostic::error(format!(
                "connection `{}` references a missing port",
                connection.id
            )));
            continue;
        };
        if from.block_id == to.block_id {
            diagnostics.push(Diagnostic::error_for(
                from.block_id.clone(),
                "a block cannot feed its own input",
            ));
            continue;
        }
        if out_port.class != in_port.class {
            diagnostics.push(Diagnostic::error_for_port(
                to.block_id.clone(),
                to.port_id.clone(),
                format!(
                    "cannot connect {} output `{}` to {} input",
                    out_port.class.name(),
                    from.port_id,
                    in_port.class.name()
                ),
            ));
        }
        if let Some(previous) =
            sinks.insert((to.block_id.as_str(), to.port_id.as_str()), &connection.id)
        {
            diagnostics.push(Diagnostic::error_for_port(
                to.block_id.clone(),
                to.port_id.clone(),
                format!(
                    "input is driven twice (connections `{previous}` and `{}`)",
                    connection.id
                ),
            ));
        }
    }

    for block in &graph.blocks {
        let Some(kind) = kinds.get(block.id.as_str()) else {
            continue;
        };
        for port in kind.inputs() {
            if port.required && graph.connection_to(&block.id, &port.id).is_none() {
                diagnostics.push(Diagnostic::error_for_port(
                    block.id.clone(),
                    port.id.clone(),
                    "required input is not connected",
                ));
            }
        }
    }
    diagnostics
}

/// The kind's parameter defaults overlaid with the instance's values.
fn merged_parameters(
    kind: &dyn BlockKind,
    block: &crate::graph::Block,
) -> HashMap<String, ParamValue> {
    let mut parameters = HashMap::new();
    for def in kind.parameters() {
        parameters.insert(def.id.clone(), def.default.clone());
    }
    for (id, value) in &block.parameters {
        parameters.insert(id.clone(), value.clone());
    }
    parameters
}

fn banner(ctx: &mut CodegenContext<'_>, kind: &dyn BlockKind) {
    let block_id = ctx.block_id().to_owned();
    ctx.push_main(format!("; --- {} ({block_id}) ---", kind.display_name()));
    for port in kind.inputs() {
        let alias = ctx.input_register(&port.id);
        ctx.push_main(format!(
            ";   in  {}: {}",
            port.id,
            alias.as_deref().unwrap_or("(none)")
        ));
    }
    for port in kind.outputs() {
        let line = if ctx.is_output_connected(&port.id) {
            match ctx.allocate_register(&port.id) {
                Ok(alias) => format!(";   out {}: {alias}", port.id),
                Err(_) => format!(";   out {}: (unallocated)", port.id),
            }
        } else {
            format!(";   out {}: (open)", port.id)
        };
        ctx.push_main(line);
    }
    for def in kind.parameters() {
        let value = ctx
            .parameter(&def.id)
            .map(ToString::to_string)
            .unwrap_or_default();
        ctx.push_main(format!(";   {} = {value}", def.id));
    }
}

/// Stitch the final program text together: header, EQU and MEM tables,
/// the run-once init section behind its skip guard, then the body.
fn render(graph: &BlockGraph, ctx: &CodegenContext<'_>) -> String {
    let mut out = String::new();
    let mut push = |line: &str| {
        out.push_str(line);
        out.push('\n');
    };

    let meta = &graph.metadata;
    if !meta.name.is_empty() {
        push(&format!("; {}", meta.name));
    }
    if !meta.author.is_empty() {
        push(&format!("; by {}", meta.author));
    }
    if !meta.description.is_empty() {
        push(&format!("; {}", meta.description));
    }
    for line in ctx.header_lines() {
        push(line);
    }
    push("");

    for (name, value) in ctx.equs() {
        push(&format!("equ {name} {value}"));
    }
    for region in ctx.memories() {
        push(&format!("mem {} {}", region.name, region.size));
    }
    push("");

    if !ctx.init_lines().is_empty() {
        push("skp run, start");
        for line in ctx.init_lines() {
            push(line);
        }
        push("start:");
    }
    for line in ctx.main_lines() {
        push(line);
    }
    out
}

/// Instructions in the rendered text: everything that is not a comment,
/// a blank, a label, or an `equ`/`mem` declaration.
fn count_instructions(assembly: &str) -> usize {
    assembly
        .lines()
        .map(str::trim)
        .filter(|line| {
            !(line.is_empty()
                || line.starts_with(';')
                || line.ends_with(':')
                || line.to_ascii_lowercase().starts_with("equ ")
                || line.to_ascii_lowercase().starts_with("mem "))
        })
        .count()
}
