/// Per-compile configuration shared by the graph compiler and the assembler.
///
/// The defaults describe a stock FV-1: 128 instruction slots, 32 general
/// registers, 32768 words of delay RAM. The two compatibility toggles
/// reproduce reference-assembler behavior and default to on; turn them off
/// only when bit-compatibility with SpinASM output is not wanted.
#[derive(Debug, Clone)]
pub struct CompilerOptions {
    /// Size of the program image in 32-bit words.
    pub prog_size: usize,
    /// Number of general-purpose registers (REG0..REG{n-1}).
    pub reg_count: usize,
    /// Delay RAM budget in words.
    pub delay_size: usize,
    /// Reproduce the reference assembler's `MEM` layout, where every
    /// region occupies one cell more than its declared size.
    pub spinasm_mem_bug: bool,
    /// Silently clamp out-of-range fixed-point literals instead of
    /// reporting them as errors.
    pub clamp_reals: bool,
    /// Emit per-block parameter and port detail into generated comments.
    pub verbose: bool,
}

impl Default for CompilerOptions {
    fn default() -> Self {
        Self {
            prog_size: 128,
            reg_count: 32,
            delay_size: 32768,
            spinasm_mem_bug: true,
            clamp_reals: true,
            verbose: false,
        }
    }
}
