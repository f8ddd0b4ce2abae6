use std::collections::HashMap;

use tracing::debug;

use crate::config::CompilerOptions;
use crate::diag::{self, Diagnostic};
use crate::lexer;
use crate::parser::{self, BinOp, Expr, ParsedLine, Statement};
use crate::schema::opcodes::{
    CHO_COS_BIT, ChoMode, Field, FieldKind, Mnemonic, NOP_WORD, cho_layout,
};
use crate::schema::symbols;

/// Result of assembling one source: the program image and every problem
/// found along the way. The image is always exactly `prog_size` words,
/// but must only be used when no diagnostic is fatal.
#[derive(Debug, Clone)]
pub struct AsmOutput {
    pub program: Vec<u32>,
    pub diagnostics: Vec<Diagnostic>,
}

impl AsmOutput {
    /// True when no fatal diagnostic was reported.
    #[must_use]
    pub fn is_ok(&self) -> bool {
        !diag::any_fatal(&self.diagnostics)
    }
}

/// A resolved operand value. Integers and reals stay distinct all the
/// way to field encoding: integers pass into coefficient fields as raw
/// bits, reals go through the fixed-point encoder.
#[derive(Debug, Clone, Copy, PartialEq)]
enum Value {
    Int(i64),
    Real(f64),
}

/// Two-pass FV-1 assembler.
///
/// Pass 1 collects `EQU` bindings, lays out `MEM` regions and records
/// label positions; pass 2 encodes instructions. Diagnostics accumulate
/// across both passes so a single bad line does not hide later problems.
#[derive(Debug, Clone)]
pub struct Assembler {
    options: CompilerOptions,
}

impl Assembler {
    #[must_use]
    pub fn new(options: CompilerOptions) -> Self {
        Self { options }
    }

    #[must_use]
    pub fn assemble(&self, source: &str) -> AsmOutput {
        let (lines, mut diagnostics) = lexer::tokenize(source);
        let (parsed, parse_diagnostics) = parser::parse(&lines);
        diagnostics.extend(parse_diagnostics);

        let mut state = State::new(&self.options);
        state.collect(&parsed, &mut diagnostics);
        debug!(
            symbols = state.symbols.len(),
            labels = state.labels.len(),
            "pass 1 complete"
        );

        let mut program = Vec::with_capacity(self.options.prog_size);
        state.emit(&parsed, &mut program, &mut diagnostics);
        debug!(words = program.len(), "pass 2 complete");

        let used = program.len();
        if used > self.options.prog_size {
            diagnostics.push(Diagnostic::error(format!(
                "program needs {used} instructions but only {} fit",
                self.options.prog_size
            )));
            program.truncate(self.options.prog_size);
        } else if used * 10 >= self.options.prog_size * 9 {
            diagnostics.push(Diagnostic::warning(format!(
                "program uses {used} of {} instruction slots",
                self.options.prog_size
            )));
        }
        program.resize(self.options.prog_size, NOP_WORD);

        AsmOutput {
            program,
            diagnostics,
        }
    }
}

struct State<'o> {
    options: &'o CompilerOptions,
    symbols: HashMap<String, Value>,
    labels: HashMap<String, usize>,
    mem_next: usize,
}

impl<'o> State<'o> {
    fn new(options: &'o CompilerOptions) -> Self {
        let mut symbols = HashMap::new();
        for &(name, value) in symbols::HARDWARE_REGISTERS {
            symbols.insert(name.to_owned(), Value::Int(i64::from(value)));
        }
        for index in 0..options.reg_count {
            symbols.insert(
                format!("reg{index}"),
                Value::Int(i64::from(symbols::REG_BASE) + index as i64),
            );
        }
        for &(name, value) in symbols::NAMED_CONSTANTS {
            symbols.insert(name.to_owned(), Value::Int(i64::from(value)));
        }
        Self {
            options,
            symbols,
            labels: HashMap::new(),
            mem_next: 0,
        }
    }

    /// Pass 1: bindings, memory layout, label positions.
    fn collect(&mut self, parsed: &[ParsedLine], diagnostics: &mut Vec<Diagnostic>) {
        let mut instruction = 0usize;
        for line in parsed {
            for statement in &line.statements {
                match statement {
                    Statement::Equ { name, value } => {
                        if symbols::is_register_name(name, self.options.reg_count) {
                            diagnostics.push(Diagnostic::error_at(
                                line.number,
                                format!("`{name}` is a register name and cannot be redefined"),
                            ));
                            continue;
                        }
                        match self.eval(value, line.number) {
                            Ok(resolved) => {
                                self.symbols.insert(name.clone(), resolved);
                            }
                            Err(diagnostic) => diagnostics.push(diagnostic),
                        }
                    }
                    Statement::Mem { name, size } => {
                        if let Err(diagnostic) = self.declare_mem(name, size, line.number) {
                            diagnostics.push(diagnostic);
                        }
                    }
                    Statement::Label(name) => {
                        if self.labels.insert(name.clone(), instruction).is_some() {
                            diagnostics.push(Diagnostic::error_at(
                                line.number,
                                format!("label `{name}` is defined twice"),
                            ));
                        }
                    }
                    Statement::Instruction { .. } => instruction += 1,
                }
            }
        }
    }

    fn declare_mem(&mut self, name: &str, size: &Expr, line: usize) -> Result<(), Diagnostic> {
        if symbols::is_register_name(name, self.options.reg_count) {
            return Err(Diagnostic::error_at(
                line,
                format!("`{name}` is a register name and cannot label memory"),
            ));
        }
        let size = match self.eval(size, line)? {
            Value::Int(v) if v > 0 => v as usize,
            _ => {
                return Err(Diagnostic::error_at(
                    line,
                    format!("memory `{name}` needs a positive integer size"),
                ));
            }
        };
        // The reference assembler reserves one cell beyond the declared
        // size for every region; `spinasm_mem_bug` keeps that layout.
        let footprint = size + usize::from(self.options.spinasm_mem_bug);
        if self.mem_next + footprint > self.options.delay_size {
            return Err(Diagnostic::error_at(
                line,
                format!(
                    "memory `{name}` needs {footprint} words but only {} of {} remain",
                    self.options.delay_size - self.mem_next,
                    self.options.delay_size
                ),
            ));
        }
        let start = self.mem_next;
        self.mem_next += footprint;
        self.symbols
            .insert(name.to_owned(), Value::Int(start as i64));
        self.symbols
            .insert(format!("{name}^"), Value::Int((start + size / 2) as i64));
        self.symbols
            .insert(format!("{name}#"), Value::Int((start + size) as i64));
        Ok(())
    }

    /// Pass 2: encode every instruction statement.
    fn emit(
        &mut self,
        parsed: &[ParsedLine],
        program: &mut Vec<u32>,
        diagnostics: &mut Vec<Diagnostic>,
    ) {
        let mut index = 0usize;
        for line in parsed {
            for statement in &line.statements {
                let Statement::Instruction { mnemonic, operands } = statement else {
                    continue;
                };
                match self.encode(*mnemonic, operands, index, line.number) {
                    Ok(word) => program.push(word),
                    Err(diagnostic) => diagnostics.push(diagnostic),
                }
                index += 1;
            }
        }
    }

    fn encode(
        &self,
        mnemonic: Mnemonic,
        operands: &[Expr],
        index: usize,
        line: usize,
    ) -> Result<u32, Diagnostic> {
        let (layout, operands) = if mnemonic == Mnemonic::Cho {
            let mode = match operands.first() {
                Some(Expr::Symbol(name)) => match name.as_str() {
                    "rda" => ChoMode::Rda,
                    "sof" => ChoMode::Sof,
                    "rdal" => ChoMode::Rdal,
                    other => {
                        return Err(Diagnostic::error_at(
                            line,
                            format!("unknown cho mode `{other}`"),
                        ));
                    }
                },
                _ => {
                    return Err(Diagnostic::error_at(
                        line,
                        "cho needs a mode: rda, sof or rdal",
                    ));
                }
            };
            (cho_layout(mode), &operands[1..])
        } else {
            (mnemonic.layout(), operands)
        };

        let expected = layout
            .iter()
            .filter(|f| !matches!(f.kind, FieldKind::Const(_)))
            .count();
        if operands.len() != expected {
            return Err(Diagnostic::error_at(
                line,
                format!(
                    "{mnemonic:?} takes {expected} operand(s), found {}",
                    operands.len()
                ),
            ));
        }

        let mut word = 0u32;
        let mut cos_tap = false;
        let mut next = operands.iter();
        for field in layout {
            let bits = match field.kind {
                FieldKind::Const(value) => value,
                _ => {
                    let operand = next.next().expect("operand count was checked");
                    self.encode_field(field, operand, index, line, &mut cos_tap)?
                }
            };
            word |= (bits & field.mask()) << field.shift;
        }
        // A COS selector is a plain sine selector plus the COS flag.
        if cos_tap && mnemonic == Mnemonic::Cho {
            word |= CHO_COS_BIT;
        }
        Ok(word)
    }

    fn encode_field(
        &self,
        field: &Field,
        operand: &Expr,
        index: usize,
        line: usize,
        cos_tap: &mut bool,
    ) -> Result<u32, Diagnostic> {
        let out_of_range = |value: i64| {
            Diagnostic::error_at(
                line,
                format!("{value} does not fit the {} field", field.name),
            )
        };
        match field.kind {
            FieldKind::Const(_) => unreachable!("const fields consume no operand"),
            FieldKind::Real(format) => match self.eval(operand, line)? {
                Value::Real(value) => format
                    .encode(value, self.options.clamp_reals)
                    .map_err(|error| Diagnostic::error_at(line, error.to_string())),
                // Integers bypass the encoder and land as raw field bits.
                Value::Int(value) => Ok((value & i64::from(field.mask())) as u32),
            },
            FieldKind::Uint => match self.eval(operand, line)? {
                Value::Int(value) if (0..=i64::from(field.mask())).contains(&value) => {
                    Ok(value as u32)
                }
                Value::Int(value) => Err(out_of_range(value)),
                Value::Real(_) => Err(Diagnostic::error_at(
                    line,
                    format!("the {} field takes an integer", field.name),
                )),
            },
            FieldKind::Int => match self.eval(operand, line)? {
                Value::Int(value)
                    if value >= -(1i64 << (field.width - 1))
                        && value <= i64::from(field.mask()) =>
                {
                    Ok((value & i64::from(field.mask())) as u32)
                }
                Value::Int(value) => Err(out_of_range(value)),
                Value::Real(_) => Err(Diagnostic::error_at(
                    line,
                    format!("the {} field takes an integer", field.name),
                )),
            },
            FieldKind::RegAddr => match self.eval(operand, line)? {
                Value::Int(value) if (0..64).contains(&value) => Ok(value as u32),
                Value::Int(value) => Err(Diagnostic::error_at(
                    line,
                    format!("{value} is not a register address"),
                )),
                Value::Real(_) => Err(Diagnostic::error_at(line, "expected a register")),
            },
            FieldKind::MemAddr => match self.eval(operand, line)? {
                Value::Int(value) if (0..=i64::from(field.mask())).contains(&value) => {
                    Ok(value as u32)
                }
                Value::Int(value) => Err(Diagnostic::error_at(
                    line,
                    format!("{value} is not a delay memory address"),
                )),
                Value::Real(_) => Err(Diagnostic::error_at(line, "expected a memory address")),
            },
            FieldKind::LfoSel => match self.eval(operand, line)? {
                Value::Int(value) if (0..=9).contains(&value) => {
                    if value & 0x8 != 0 {
                        *cos_tap = true;
                    }
                    Ok(value as u32 & field.mask())
                }
                _ => Err(Diagnostic::error_at(line, "expected an LFO selector")),
            },
            FieldKind::SkpOffset => {
                if let Expr::Symbol(name) = operand {
                    if let Some(&target) = self.labels.get(name.as_str()) {
                        let offset = target as i64 - index as i64 - 1;
                        if !(0..=i64::from(field.mask())).contains(&offset) {
                            return Err(Diagnostic::error_at(
                                line,
                                format!("label `{name}` is out of skip range ({offset})"),
                            ));
                        }
                        return Ok(offset as u32);
                    }
                }
                match self.eval(operand, line)? {
                    Value::Int(value) if (0..=i64::from(field.mask())).contains(&value) => {
                        Ok(value as u32)
                    }
                    _ => Err(Diagnostic::error_at(line, "invalid skip offset")),
                }
            }
            FieldKind::RampAmp => match self.eval(operand, line)? {
                Value::Int(4096) => Ok(0),
                Value::Int(2048) => Ok(1),
                Value::Int(1024) => Ok(2),
                Value::Int(512) => Ok(3),
                Value::Int(value) if (0..4).contains(&value) => Ok(value as u32),
                _ => Err(Diagnostic::error_at(
                    line,
                    "ramp amplitude must be 4096, 2048, 1024, 512 or a raw code",
                )),
            },
        }
    }

    fn eval(&self, expr: &Expr, line: usize) -> Result<Value, Diagnostic> {
        match expr {
            Expr::Int(value) => Ok(Value::Int(*value)),
            Expr::Real(value) => Ok(Value::Real(*value)),
            Expr::Symbol(name) => self.symbols.get(name.as_str()).copied().ok_or_else(|| {
                Diagnostic::error_at(line, format!("undefined symbol `{name}`"))
            }),
            Expr::Neg(inner) => Ok(match self.eval(inner, line)? {
                Value::Int(value) => Value::Int(-value),
                Value::Real(value) => Value::Real(-value),
            }),
            Expr::Binary(op, lhs, rhs) => {
                let lhs = self.eval(lhs, line)?;
                let rhs = self.eval(rhs, line)?;
                self.apply(*op, lhs, rhs, line)
            }
        }
    }

    fn apply(&self, op: BinOp, lhs: Value, rhs: Value, line: usize) -> Result<Value, Diagnostic> {
        use Value::{Int, Real};
        let real = |v: Value| match v {
            Int(i) => i as f64,
            Real(r) => r,
        };
        Ok(match (op, lhs, rhs) {
            (BinOp::Add, Int(a), Int(b)) => Int(a.wrapping_add(b)),
            (BinOp::Sub, Int(a), Int(b)) => Int(a.wrapping_sub(b)),
            (BinOp::Mul, Int(a), Int(b)) => Int(a.wrapping_mul(b)),
            (BinOp::Div, Int(a), Int(b)) => {
                if b == 0 {
                    return Err(Diagnostic::error_at(line, "division by zero"));
                }
                Int(a / b)
            }
            (BinOp::Add, a, b) => Real(real(a) + real(b)),
            (BinOp::Sub, a, b) => Real(real(a) - real(b)),
            (BinOp::Mul, a, b) => Real(real(a) * real(b)),
            (BinOp::Div, a, b) => {
                let d = real(b);
                if d == 0.0 {
                    return Err(Diagnostic::error_at(line, "division by zero"));
                }
                Real(real(a) / d)
            }
            (BinOp::And, Int(a), Int(b)) => Int(a & b),
            (BinOp::Or, Int(a), Int(b)) => Int(a | b),
            (BinOp::Xor, Int(a), Int(b)) => Int(a ^ b),
            (BinOp::Shl, Int(a), Int(b)) if (0..64).contains(&b) => Int(a << b),
            (BinOp::Shr, Int(a), Int(b)) if (0..64).contains(&b) => Int(a >> b),
            (BinOp::And | BinOp::Or | BinOp::Xor | BinOp::Shl | BinOp::Shr, _, _) => {
                return Err(Diagnostic::error_at(
                    line,
                    "bitwise operators take integer operands",
                ));
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assemble(source: &str) -> AsmOutput {
        Assembler::new(CompilerOptions::default()).assemble(source)
    }

    fn words(source: &str) -> Vec<u32> {
        let output = assemble(source);
        assert!(output.is_ok(), "{:?}", output.diagnostics);
        output.program
    }

    #[test]
    fn sof_bit_pattern() {
        let program = words("sof 0.5, 0.25");
        assert_eq!(0x2000_200D, program[0]);
    }

    #[test]
    fn rdax_wrax_mulx() {
        let program = words("rdax ADCL, 1.0\nmulx POT0\nwrax DACL, 0.0");
        assert_eq!((0x4000 << 16) | (0x14 << 5) | 0x04, program[0]);
        assert_eq!((0x10 << 5) | 0x0A, program[1]);
        assert_eq!((0x16 << 5) | 0x06, program[2]);
    }

    #[test]
    fn nop_padding_to_exact_size() {
        let program = words("clr");
        assert_eq!(128, program.len());
        assert_eq!(0x0E, program[0]);
        assert!(program[1..].iter().all(|&w| w == NOP_WORD));
    }

    #[test]
    fn skp_forward_label() {
        let program = words("skp run, done\nclr\nclr\ndone: absa");
        // Condition RUN=0x10 at bit 27, offset 2 at bit 21.
        assert_eq!((0x10 << 27) | (2 << 21) | 0x11, program[0]);
    }

    #[test]
    fn undefined_symbol_reports_line_and_continues() {
        let output = assemble("clr\nrdax FOO, 1.0\nabsa");
        assert!(!output.is_ok());
        let fatal: Vec<_> = output.diagnostics.iter().filter(|d| d.fatal).collect();
        assert_eq!(1, fatal.len());
        assert_eq!(crate::diag::Location::Line(2), fatal[0].location);
        // The failing line produced no word; the rest still assembled.
        assert_eq!(0x0E, output.program[0]);
        assert_eq!(0x09, output.program[1]);
    }

    #[test]
    fn mem_modifiers() {
        let program = words("mem d 100\nrda d, 0.5\nrda d^, 0.5\nrda d#, 0.5");
        let coeff = 0x100u32 << 21; // 0.5 in S1.9
        assert_eq!(coeff | 0x00, program[0]);
        assert_eq!(coeff | (50 << 5), program[1]);
        assert_eq!(coeff | (100 << 5), program[2]);
    }

    #[test]
    fn mem_bug_layout() {
        // Second region starts one past the declared size.
        let program = words("mem a 10\nmem b 10\nrda b, 0.0");
        assert_eq!(11 << 5, program[0]);

        let mut options = CompilerOptions::default();
        options.spinasm_mem_bug = false;
        let output = Assembler::new(options).assemble("mem a 10\nmem b 10\nrda b, 0.0");
        assert!(output.is_ok());
        assert_eq!(10 << 5, output.program[0]);
    }

    #[test]
    fn mem_budget_depends_on_compat_bug() {
        let source = "mem d 16384\nmem e 16383";
        assert!(!assemble(source).is_ok());

        let mut options = CompilerOptions::default();
        options.spinasm_mem_bug = false;
        assert!(Assembler::new(options).assemble(source).is_ok());
    }

    #[test]
    fn equ_shadowing_rules() {
        assert!(words("equ gain 0.5\nsof gain, 0.0").len() == 128);
        let output = assemble("equ adcl 5");
        assert!(!output.is_ok());
    }

    #[test]
    fn clamp_toggle() {
        assert_eq!((0x7FFF << 16) | 0x0D, words("sof 3.0, 0.0")[0]);
        let mut options = CompilerOptions::default();
        options.clamp_reals = false;
        assert!(!Assembler::new(options).assemble("sof 3.0, 0.0").is_ok());
    }

    #[test]
    fn cho_encodings() {
        let program = words(
            "mem d 1000\n\
             cho rda, sin0, sin|reg|compc, d\n\
             cho rda, cos0, 0, d\n\
             cho rdal, sin1\n\
             cho sof, rmp0, na, 0.0",
        );
        assert_eq!((0x06 << 24) | 0x14, program[0]);
        // COS selector folds into the flag bits.
        assert_eq!((0x01 << 24) | 0x14, program[1]);
        assert_eq!((0b11 << 30) | (1 << 21) | 0x14, program[2]);
        assert_eq!(
            (0b10u32 << 30) | (0x20 << 24) | (2 << 21) | 0x14,
            program[3]
        );
    }

    #[test]
    fn lfo_loads() {
        let program = words("wlds sin0, 100, 16384\nwldr rmp0, -8192, 4096\njam rmp1");
        assert_eq!((100 << 20) | (16384 << 5) | 0x12, program[0]);
        let freq = (-8192i64 & 0xFFFF) as u32;
        assert_eq!((1 << 30) | (freq << 13) | 0x12, program[1]);
        assert_eq!((1 << 6) | (1 << 7) | 0x13, program[2]);
    }

    #[test]
    fn pseudo_ops() {
        let program = words("clr\nnot\nabsa\nldax ADCL\nnop");
        assert_eq!(0x0000_000E, program[0]);
        assert_eq!(0xFFFF_FF10, program[1]);
        assert_eq!(0x0000_0009, program[2]);
        assert_eq!((0x14 << 5) | 0x05, program[3]);
        assert_eq!(0x0000_0011, program[4]);
    }

    #[test]
    fn expression_operands() {
        let program = words("equ base 8\nor base|3\nand $FF << 8\nsof -1.0, 1.0/2");
        assert_eq!((0x0B << 8) | 0x0F, program[0]);
        assert_eq!((0xFF00 << 8) | 0x0E, program[1]);
        assert_eq!((0xC000u32 << 16) | (0x200 << 5) | 0x0D, program[2]);
    }

    #[test]
    fn program_overflow_is_fatal() {
        let source = "clr\n".repeat(129);
        let output = assemble(&source);
        assert!(!output.is_ok());
        assert_eq!(128, output.program.len());
    }

    #[test]
    fn near_limit_warning() {
        let source = "clr\n".repeat(120);
        let output = assemble(&source);
        assert!(output.is_ok());
        assert!(output.diagnostics.iter().any(|d| !d.fatal));
    }
}
