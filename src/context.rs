use std::collections::{HashMap, HashSet};

use crate::config::CompilerOptions;
use crate::diag::Diagnostic;
use crate::graph::{BlockGraph, ParamValue};

/// A reserved span of delay RAM.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemRegion {
    pub name: String,
    pub base: usize,
    pub size: usize,
}

/// Fixed-point values common enough to earn a named `EQU`; anything
/// else is emitted as a plain literal.
const STANDARD_CONSTANTS: &[(&str, f64)] = &[
    ("c_zero", 0.0),
    ("c_quarter", 0.25),
    ("c_neg_quarter", -0.25),
    ("c_half", 0.5),
    ("c_neg_half", -0.5),
    ("c_three_quarters", 0.75),
    ("c_neg_three_quarters", -0.75),
    ("c_one", 1.0),
    ("c_neg_one", -1.0),
    ("c_milli", 0.001),
];

/// Format a real for emission into assembly text. Whole values keep one
/// fractional digit so they read as reals, not raw field bits.
#[must_use]
pub fn format_real(value: f64) -> String {
    if value == value.trunc() && value.abs() < 1e9 {
        format!("{value:.1}")
    } else {
        format!("{value}")
    }
}

struct CurrentBlock {
    id: String,
    kind: String,
    ordinal: usize,
    parameters: HashMap<String, ParamValue>,
}

/// The resource ledger every block's code generator works against.
///
/// Permanent registers grow from `REG0` upward and live for the whole
/// program; scratch registers grow from the top down and are recycled
/// between blocks. The two watermarks meeting is register exhaustion.
/// Delay memory is handed out bottom-up; `EQU` bindings and the three
/// text sections (header, init, main) accumulate across both passes.
pub struct CodegenContext<'a> {
    options: &'a CompilerOptions,
    graph: &'a BlockGraph,

    permanent_next: usize,
    scratch_used: usize,
    output_aliases: HashMap<(String, String), String>,

    memories: Vec<MemRegion>,
    memory_by_key: HashMap<(String, String), usize>,
    mem_next: usize,

    alias_equs: Vec<(String, String)>,
    other_equs: Vec<(String, String)>,
    equ_names: HashSet<String>,

    ordinals: HashMap<String, usize>,
    kind_counts: HashMap<String, usize>,

    sine_lfos: usize,
    ramp_lfos: usize,
    lfo_by_block: HashMap<String, usize>,

    header: Vec<String>,
    init: Vec<String>,
    main: Vec<String>,

    current: Option<CurrentBlock>,
    pub(crate) diagnostics: Vec<Diagnostic>,
}

impl<'a> CodegenContext<'a> {
    pub fn new(options: &'a CompilerOptions, graph: &'a BlockGraph) -> Self {
        Self {
            options,
            graph,
            permanent_next: 0,
            scratch_used: 0,
            output_aliases: HashMap::new(),
            memories: Vec::new(),
            memory_by_key: HashMap::new(),
            mem_next: 0,
            alias_equs: Vec::new(),
            other_equs: Vec::new(),
            equ_names: HashSet::new(),
            ordinals: HashMap::new(),
            kind_counts: HashMap::new(),
            sine_lfos: 0,
            ramp_lfos: 0,
            lfo_by_block: HashMap::new(),
            header: Vec::new(),
            init: Vec::new(),
            main: Vec::new(),
            current: None,
            diagnostics: Vec::new(),
        }
    }

    /// Instance ordinal of a block within its kind, assigned on first
    /// sight; part of every derived name.
    pub(crate) fn ordinal(&mut self, block_id: &str, kind: &str) -> usize {
        if let Some(&ordinal) = self.ordinals.get(block_id) {
            return ordinal;
        }
        let counter = self.kind_counts.entry(kind.to_owned()).or_insert(0);
        *counter += 1;
        let ordinal = *counter;
        self.ordinals.insert(block_id.to_owned(), ordinal);
        ordinal
    }

    /// Enter a block before running its hooks. Parameters are the kind's
    /// defaults overlaid with the instance's values; the scratch
    /// watermark resets here.
    pub(crate) fn set_current(
        &mut self,
        block_id: &str,
        kind: &str,
        parameters: HashMap<String, ParamValue>,
    ) {
        let ordinal = self.ordinal(block_id, kind);
        self.scratch_used = 0;
        self.current = Some(CurrentBlock {
            id: block_id.to_owned(),
            kind: kind.to_owned(),
            ordinal,
            parameters,
        });
    }

    fn current(&self) -> &CurrentBlock {
        self.current
            .as_ref()
            .expect("block hook ran outside a block visit")
    }

    /// Id of the block currently being emitted.
    #[must_use]
    pub fn block_id(&self) -> &str {
        &self.current().id
    }

    // ---- registers ----------------------------------------------------

    /// The alias feeding `port`, or `None` when the port is unconnected.
    #[must_use]
    pub fn input_register(&mut self, port: &str) -> Option<String> {
        let current = self.current();
        let connection = self.graph.connection_to(&current.id, port)?;
        let key = (
            connection.from.block_id.clone(),
            connection.from.port_id.clone(),
        );
        let block = current.id.clone();
        match self.output_aliases.get(&key) {
            Some(alias) => Some(alias.clone()),
            None => {
                // Pre-allocation covers every connected output; reaching
                // this means the driver skipped it.
                self.diagnostics.push(Diagnostic::error_for_port(
                    block,
                    port,
                    "input has a connection but its source was never allocated",
                ));
                None
            }
        }
    }

    /// True when any connection is driven by `port` of the current block.
    #[must_use]
    pub fn is_output_connected(&self, port: &str) -> bool {
        self.graph.is_source(&self.current().id, port)
    }

    /// Bind `port` of the current block to the next permanent register.
    /// Idempotent per `(block, port)`; the alias comes back.
    pub fn allocate_register(&mut self, port: &str) -> Result<String, Diagnostic> {
        let current = self.current();
        let (id, kind, ordinal) = (current.id.clone(), current.kind.clone(), current.ordinal);
        self.allocate_output(&id, &kind, ordinal, port)
    }

    pub(crate) fn allocate_output(
        &mut self,
        block_id: &str,
        kind: &str,
        ordinal: usize,
        port: &str,
    ) -> Result<String, Diagnostic> {
        let key = (block_id.to_owned(), port.to_owned());
        if let Some(alias) = self.output_aliases.get(&key) {
            return Ok(alias.clone());
        }
        let index = self.permanent_next;
        if index as i64 > self.scratch_next() {
            return Err(Diagnostic::error_for(
                block_id,
                format!(
                    "out of registers: all {} are in use",
                    self.options.reg_count
                ),
            ));
        }
        self.permanent_next = index + 1;
        let alias = self.unique_name(&format!("{kind}{ordinal}_{port}"));
        self.bind_equ(&alias, &format!("REG{index}"), true);
        self.output_aliases.insert(key, alias.clone());
        Ok(alias)
    }

    /// Next free scratch register for the current block. Not idempotent;
    /// the pool resets when the next block starts.
    pub fn scratch_register(&mut self) -> Result<String, Diagnostic> {
        let index = self.scratch_next();
        if index < self.permanent_next as i64 {
            return Err(Diagnostic::error_for(
                self.block_id().to_owned(),
                format!(
                    "out of scratch registers: all {} are in use",
                    self.options.reg_count
                ),
            ));
        }
        self.scratch_used += 1;
        Ok(format!("REG{index}"))
    }

    fn scratch_next(&self) -> i64 {
        self.options.reg_count as i64 - 1 - self.scratch_used as i64
    }

    /// Permanent registers handed out so far.
    #[must_use]
    pub fn registers_used(&self) -> usize {
        self.permanent_next
    }

    // ---- delay memory -------------------------------------------------

    /// Reserve `size` words of delay RAM for the current block.
    /// Idempotent per block; the region keeps its first size.
    pub fn allocate_memory(&mut self, size: usize) -> Result<MemRegion, Diagnostic> {
        self.allocate_memory_named("mem", size)
    }

    /// Reserve a named region (templates may declare several per block).
    pub(crate) fn allocate_memory_named(
        &mut self,
        local: &str,
        size: usize,
    ) -> Result<MemRegion, Diagnostic> {
        let current = self.current();
        let key = (current.id.clone(), local.to_owned());
        if let Some(&slot) = self.memory_by_key.get(&key) {
            return Ok(self.memories[slot].clone());
        }
        let (kind, ordinal, block) = (current.kind.clone(), current.ordinal, current.id.clone());
        // The assembler pads every region by one cell in compatibility
        // mode; account the same footprint here so its budget check
        // cannot fail later.
        let footprint = size + usize::from(self.options.spinasm_mem_bug);
        if size == 0 || self.mem_next + footprint > self.options.delay_size {
            return Err(Diagnostic::error_for(
                block,
                format!(
                    "out of delay memory: {size} words requested, {} of {} left",
                    self.options.delay_size.saturating_sub(self.mem_next),
                    self.options.delay_size
                ),
            ));
        }
        let name = self.unique_name(&format!("{kind}{ordinal}_{local}"));
        let region = MemRegion {
            name,
            base: self.mem_next,
            size,
        };
        self.mem_next += footprint;
        self.memory_by_key.insert(key, self.memories.len());
        self.memories.push(region.clone());
        Ok(region)
    }

    /// Delay RAM words reserved so far (compat padding included).
    #[must_use]
    pub fn memory_used(&self) -> usize {
        self.mem_next
    }

    #[must_use]
    pub fn memories(&self) -> &[MemRegion] {
        &self.memories
    }

    // ---- EQU table ----------------------------------------------------

    /// Canonical name for a common constant, interning its `EQU` on
    /// first use; uncommon values come back as plain literals.
    pub fn standard_constant(&mut self, value: f64) -> String {
        for &(name, constant) in STANDARD_CONSTANTS {
            if (value - constant).abs() < 1e-12 {
                if !self.has_equ(name) {
                    self.bind_equ(name, &format_real(constant), false);
                }
                return name.to_owned();
            }
        }
        format_real(value)
    }

    /// Bind an arbitrary named constant. Re-binding an existing name is
    /// ignored so hooks stay idempotent across passes.
    pub fn register_equ(&mut self, name: &str, value: &str) {
        self.bind_equ(name, value, false);
    }

    #[must_use]
    pub fn has_equ(&self, name: &str) -> bool {
        self.equ_names.contains(name)
    }

    fn bind_equ(&mut self, name: &str, value: &str, alias: bool) {
        if self.equ_names.contains(name) {
            return;
        }
        self.equ_names.insert(name.to_owned());
        let list = if alias {
            &mut self.alias_equs
        } else {
            &mut self.other_equs
        };
        list.push((name.to_owned(), value.to_owned()));
    }

    /// Constant `EQU`s in first-use order, then register aliases.
    pub fn equs(&self) -> impl Iterator<Item = &(String, String)> {
        self.other_equs.iter().chain(self.alias_equs.iter())
    }

    fn unique_name(&mut self, base: &str) -> String {
        let mut name = sanitize(base);
        let mut tie = 1;
        while self.equ_names.contains(&name)
            || self.memories.iter().any(|m| m.name == name)
        {
            tie += 1;
            name = sanitize(&format!("{base}_{tie}"));
        }
        name
    }

    // ---- LFOs ---------------------------------------------------------

    /// Claim a hardware LFO of the given flavour for the current block.
    /// Idempotent per block; the FV-1 has two of each.
    pub fn allocate_lfo(&mut self, ramp: bool) -> Result<usize, Diagnostic> {
        let block = self.block_id().to_owned();
        if let Some(&index) = self.lfo_by_block.get(&block) {
            return Ok(index);
        }
        let counter = if ramp {
            &mut self.ramp_lfos
        } else {
            &mut self.sine_lfos
        };
        if *counter >= 2 {
            return Err(Diagnostic::error_for(
                block,
                format!(
                    "out of {} LFOs: the FV-1 has two",
                    if ramp { "ramp" } else { "sine" }
                ),
            ));
        }
        let index = *counter;
        *counter += 1;
        self.lfo_by_block.insert(block, index);
        Ok(index)
    }

    // ---- parameters ---------------------------------------------------

    /// Value of a parameter of the current block (instance value or the
    /// kind's default).
    #[must_use]
    pub fn parameter(&self, id: &str) -> Option<&ParamValue> {
        self.current().parameters.get(id)
    }

    #[must_use]
    pub fn number_parameter(&self, id: &str) -> Option<f64> {
        self.parameter(id).and_then(ParamValue::as_number)
    }

    #[must_use]
    pub fn bool_parameter(&self, id: &str) -> Option<bool> {
        self.parameter(id).and_then(ParamValue::as_bool)
    }

    #[must_use]
    pub fn text_parameter(&self, id: &str) -> Option<&str> {
        self.parameter(id).and_then(ParamValue::as_text)
    }

    // ---- sections -----------------------------------------------------

    pub fn push_header_comment(&mut self, line: impl Into<String>) {
        self.header.push(format!("; {}", line.into()));
    }

    pub fn push_init(&mut self, line: impl Into<String>) {
        self.init.push(line.into());
    }

    pub fn push_main(&mut self, line: impl Into<String>) {
        self.main.push(line.into());
    }

    /// Label a block's init snippet after the fact; the driver only
    /// knows a block emitted init code once its hook returns.
    pub(crate) fn insert_init_comment(&mut self, at: usize, line: String) {
        self.init.insert(at, line);
    }

    /// Attach a non-fatal note to the current block.
    pub fn push_warning(&mut self, message: impl Into<String>) {
        let block = self.block_id().to_owned();
        self.diagnostics
            .push(Diagnostic::warning_for(block, message));
    }

    #[must_use]
    pub fn header_lines(&self) -> &[String] {
        &self.header
    }

    #[must_use]
    pub fn init_lines(&self) -> &[String] {
        &self.init
    }

    #[must_use]
    pub fn main_lines(&self) -> &[String] {
        &self.main
    }
}

/// Lowercase, `[a-z0-9_]` only, at most 32 characters, never starting
/// with a digit.
fn sanitize(name: &str) -> String {
    let mut out = String::with_capacity(name.len().min(32));
    for c in name.chars() {
        let c = c.to_ascii_lowercase();
        if out.is_empty() && c.is_ascii_digit() {
            out.push('_');
        }
        out.push(if c.is_ascii_alphanumeric() || c == '_' {
            c
        } else {
            '_'
        });
        if out.len() >= 32 {
            break;
        }
    }
    out.truncate(32);
    if out.is_empty() {
        out.push('_');
    }
    out
}
