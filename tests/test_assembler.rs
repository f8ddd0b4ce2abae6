use fv1_compiler::{Assembler, CompilerOptions};

fn assemble(source: &str) -> Vec<u32> {
    let output = Assembler::new(CompilerOptions::default()).assemble(source);
    assert!(output.is_ok(), "{:?}", output.diagnostics);
    output.program
}

#[test]
fn test_simple_echo_program() {
    let source = "\
; stereo-in mono echo
equ fbk 0.45
mem echo 8192

skp run, start
wlds sin0, 8, 100
start:
rdax ADCL, 0.5
rdax ADCR, 0.5
rda echo#, fbk
wra echo, 0.0
rda echo#, 1.0
wrax DACL, 1.0
wrax DACR, 0.0
";
    let program = assemble(source);
    assert_eq!(128, program.len());

    // skp run, start: condition 0x10, offset over the single init word.
    assert_eq!((0x10 << 27) | (1 << 21) | 0x11, program[0]);
    assert_eq!((8 << 20) | (100 << 5) | 0x12, program[1]);
    // rdax ADCL, 0.5
    assert_eq!((0x2000 << 16) | (0x14 << 5) | 0x04, program[2]);
    // rda echo#, 0.45 -> address 8192, S1.9 coefficient trunc(0.45 * 512).
    assert_eq!((230 << 21) | (8192 << 5), program[4]);
    // wra echo, 0.0
    assert_eq!(0x02, program[5]);
    // Padding after the last instruction is all NOPs.
    assert!(program[9..].iter().all(|&word| word == 0x11));
}

#[test]
fn test_fixed_point_fields_of_sof() {
    // S1.14 coefficient 0x2000, S.10 offset 0x100, opcode 0b01101.
    assert_eq!(0x2000_200D, assemble("sof 0.5, 0.25")[0]);
}

#[test]
fn test_undefined_symbol_keeps_processing() {
    let output = Assembler::new(CompilerOptions::default())
        .assemble("rdax FOO, 1.0\nrdax BAR, 1.0\nclr");
    assert!(!output.is_ok());
    let lines: Vec<_> = output
        .diagnostics
        .iter()
        .filter(|d| d.fatal)
        .map(|d| d.location.clone())
        .collect();
    assert_eq!(
        vec![
            fv1_compiler::Location::Line(1),
            fv1_compiler::Location::Line(2)
        ],
        lines
    );
    // Only the good line produced a word.
    assert_eq!(0x0E, output.program[0]);
}

#[test]
fn test_mem_compat_boundary() {
    let source = "mem d 16384\nmem e 16383";
    let strict = Assembler::new(CompilerOptions::default()).assemble(source);
    assert!(!strict.is_ok());

    let mut options = CompilerOptions::default();
    options.spinasm_mem_bug = false;
    let relaxed = Assembler::new(options).assemble(source);
    assert!(relaxed.is_ok(), "{:?}", relaxed.diagnostics);
}

#[test]
fn test_assembling_twice_is_identical() {
    let source = "mem d 1000\nrda d^, 0.33\nwrax DACL, 0.0";
    let first = assemble(source);
    let second = assemble(source);
    assert_eq!(first, second);
}

#[test]
fn test_decode_encode_round_trip_within_one_lsb() {
    use fv1_compiler::SFormat;
    for format in [SFormat::S1_14, SFormat::S1_9, SFormat::S0_10, SFormat::S4_6] {
        for step in -40..40 {
            let value = step as f64 / 19.0;
            let (lo, hi) = format.range();
            if value < lo || value > hi {
                continue;
            }
            let bits = format.encode(value, false).unwrap();
            assert!((format.decode(bits) - value).abs() < format.lsb());
        }
    }
}
