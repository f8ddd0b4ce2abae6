use fv1_compiler::{BlockGraph, CompilerOptions, Registry, compile, compile_to_program};

fn parse(doc: &str) -> BlockGraph {
    BlockGraph::from_json(doc).unwrap()
}

const NULL_GRAPH: &str = r#"{
    "metadata": {"name": "bypass", "author": "test", "description": "in to out"},
    "blocks": [
        {"id": "adc", "type": "input", "parameters": {"channel": "left"}},
        {"id": "dac", "type": "output", "parameters": {"channel": "left"}}
    ],
    "connections": [
        {"id": "c1", "from": {"blockId": "adc", "portId": "out"},
                     "to": {"blockId": "dac", "portId": "in"}}
    ]
}"#;

#[test]
fn test_null_graph_copies_input_to_output() {
    let graph = parse(NULL_GRAPH);
    let registry = Registry::with_builtins();
    let options = CompilerOptions::default();
    let (result, program) = compile_to_program(&graph, &registry, &options);
    assert!(result.success, "{:?}", result.diagnostics);

    let stats = result.statistics.unwrap();
    assert!((3..=5).contains(&stats.instructions), "{stats:?}");
    assert_eq!(1, stats.registers);
    assert_eq!(0, stats.memory_words);
    assert_eq!(2, stats.blocks);

    let program = program.unwrap();
    assert_eq!(128, program.len());
    // rdax ADCL, 1.0 / wrax REG0, 0 / rdax REG0, 1.0 / wrax DACL, 0
    assert_eq!((0x4000 << 16) | (0x14 << 5) | 0x04, program[0]);
    assert_eq!((0x20 << 5) | 0x06, program[1]);
    assert_eq!((0x4000 << 16) | (0x20 << 5) | 0x04, program[2]);
    assert_eq!((0x16 << 5) | 0x06, program[3]);
    assert_eq!(0x11, program[4]);
}

fn pot_gain_doc(smooth: bool) -> String {
    format!(
        r#"{{
        "metadata": {{"name": "pot gain", "author": "", "description": ""}},
        "blocks": [
            {{"id": "adc", "type": "input"}},
            {{"id": "p", "type": "pot", "parameters": {{"pot": "pot0", "smooth": {smooth}}}}},
            {{"id": "g", "type": "gain", "parameters": {{"gain": 0.5}}}},
            {{"id": "dac", "type": "output"}}
        ],
        "connections": [
            {{"id": "c1", "from": {{"blockId": "adc", "portId": "out"}},
                          "to": {{"blockId": "g", "portId": "in"}}}},
            {{"id": "c2", "from": {{"blockId": "p", "portId": "out"}},
                          "to": {{"blockId": "g", "portId": "cv"}}}},
            {{"id": "c3", "from": {{"blockId": "g", "portId": "out"}},
                          "to": {{"blockId": "dac", "portId": "in"}}}}
        ]
    }}"#
    )
}

#[test]
fn test_pot_controlled_gain() {
    let registry = Registry::with_builtins();
    let options = CompilerOptions::default();

    let rough = compile(&parse(&pot_gain_doc(false)), &registry, &options);
    assert!(rough.success, "{:?}", rough.diagnostics);
    assert_eq!(1, rough.warnings().count(), "{:?}", rough.diagnostics);
    let assembly = rough.assembly.unwrap();
    assert!(assembly.contains("rdax ADCL, 1.0"), "{assembly}");
    assert!(assembly.contains("rdax input1_out, 0.5"), "{assembly}");
    assert!(assembly.contains("mulx pot1_out"), "{assembly}");
    assert!(assembly.contains("wrax DACL, 0.0"), "{assembly}");

    let smooth = compile(&parse(&pot_gain_doc(true)), &registry, &options);
    assert!(smooth.success);
    assert_eq!(0, smooth.warnings().count(), "{:?}", smooth.diagnostics);
    let assembly = smooth.assembly.unwrap();
    // The smoothing filter interns its coefficients as named constants.
    assert!(assembly.contains("equ c_milli 0.001"), "{assembly}");
    assert!(assembly.contains("wrlx pot1_flt, c_neg_three_quarters"));
    assert!(assembly.contains("rdax pot1_out, c_three_quarters"));
}

const FEEDBACK_GRAPH: &str = r#"{
    "metadata": {"name": "echo loop", "author": "", "description": ""},
    "blocks": [
        {"id": "adc", "type": "input"},
        {"id": "d", "type": "delay", "parameters": {"time_ms": 100, "feedback": 0.5}},
        {"id": "f", "type": "filter_1p", "parameters": {"cutoff_hz": 2500}},
        {"id": "dac", "type": "output"}
    ],
    "connections": [
        {"id": "c1", "from": {"blockId": "adc", "portId": "out"},
                     "to": {"blockId": "d", "portId": "in"}},
        {"id": "c2", "from": {"blockId": "d", "portId": "out"},
                     "to": {"blockId": "f", "portId": "in"}},
        {"id": "c3", "from": {"blockId": "f", "portId": "out"},
                     "to": {"blockId": "dac", "portId": "in"}},
        {"id": "c4", "from": {"blockId": "f", "portId": "out"},
                     "to": {"blockId": "d", "portId": "fb"}}
    ]
}"#;

#[test]
fn test_feedback_cycle_compiles_with_one_warning() {
    let graph = parse(FEEDBACK_GRAPH);
    let registry = Registry::with_builtins();
    let options = CompilerOptions::default();
    let (result, program) = compile_to_program(&graph, &registry, &options);
    assert!(result.success, "{:?}", result.diagnostics);
    assert!(program.is_some());

    let feedback: Vec<_> = result
        .warnings()
        .filter(|w| w.message.contains("feedback"))
        .collect();
    assert_eq!(1, feedback.len());
    assert!(feedback[0].message.contains("c4"));

    // The delay reads the filter's output even though the filter is
    // emitted later; both sides name the same aliases.
    let assembly = result.assembly.unwrap();
    assert!(assembly.contains("rdax filter_1p1_out, 0.5"), "{assembly}");
    assert!(assembly.contains("rdax delay1_out, 1.0"), "{assembly}");
    assert!(assembly.contains("mem delay1_mem 3277"), "{assembly}");
}

#[test]
fn test_recompilation_is_byte_identical() {
    let registry = Registry::with_builtins();
    let options = CompilerOptions::default();
    let graph = parse(FEEDBACK_GRAPH);
    let (first, first_program) = compile_to_program(&graph, &registry, &options);
    let (second, second_program) = compile_to_program(&graph, &registry, &options);
    assert_eq!(first.assembly, second.assembly);
    assert_eq!(first_program, second_program);
}

#[test]
fn test_lfo_init_is_guarded() {
    let doc = r#"{
        "blocks": [
            {"id": "adc", "type": "input"},
            {"id": "lfo", "type": "lfo_sine", "parameters": {"rate_hz": 2.0, "depth": 1.0}},
            {"id": "g", "type": "gain"},
            {"id": "dac", "type": "output"}
        ],
        "connections": [
            {"id": "c1", "from": {"blockId": "adc", "portId": "out"},
                         "to": {"blockId": "g", "portId": "in"}},
            {"id": "c2", "from": {"blockId": "lfo", "portId": "out"},
                         "to": {"blockId": "g", "portId": "cv"}},
            {"id": "c3", "from": {"blockId": "g", "portId": "out"},
                         "to": {"blockId": "dac", "portId": "in"}}
        ]
    }"#;
    let registry = Registry::with_builtins();
    let options = CompilerOptions::default();
    let (result, program) = compile_to_program(&parse(doc), &registry, &options);
    assert!(result.success, "{:?}", result.diagnostics);

    let assembly = result.assembly.unwrap();
    assert!(assembly.contains("skp run, start"), "{assembly}");
    assert!(assembly.contains("wlds sin0, 8, 32767"), "{assembly}");
    assert!(assembly.contains("start:"), "{assembly}");
    assert!(assembly.contains("cho rdal, sin0"), "{assembly}");

    let program = program.unwrap();
    assert_eq!((0x10 << 27) | (1 << 21) | 0x11, program[0]);
    assert_eq!((8 << 20) | (32767 << 5) | 0x12, program[1]);
}

#[test]
fn test_modulated_delay_uses_pointer_reads() {
    let doc = r#"{
        "blocks": [
            {"id": "adc", "type": "input"},
            {"id": "lfo", "type": "lfo_ramp"},
            {"id": "d", "type": "delay", "parameters": {"time_ms": 50, "feedback": 0.0}},
            {"id": "dac", "type": "output"}
        ],
        "connections": [
            {"id": "c1", "from": {"blockId": "adc", "portId": "out"},
                         "to": {"blockId": "d", "portId": "in"}},
            {"id": "c2", "from": {"blockId": "lfo", "portId": "out"},
                         "to": {"blockId": "d", "portId": "mod"}},
            {"id": "c3", "from": {"blockId": "d", "portId": "out"},
                         "to": {"blockId": "dac", "portId": "in"}}
        ]
    }"#;
    let registry = Registry::with_builtins();
    let options = CompilerOptions::default();
    let (result, program) = compile_to_program(&parse(doc), &registry, &options);
    assert!(result.success, "{:?}", result.diagnostics);
    let assembly = result.assembly.unwrap();
    assert!(assembly.contains("wrax ADDR_PTR, 0.0"), "{assembly}");
    assert!(assembly.contains("rmpa 1.0"), "{assembly}");
    assert!(assembly.contains("wldr rmp0"), "{assembly}");
    assert!(program.is_some());
}

#[test]
fn test_validation_rejects_bad_graphs() {
    let registry = Registry::with_builtins();
    let options = CompilerOptions::default();

    // Empty graph.
    let result = compile(&parse(r#"{"blocks": [], "connections": []}"#), &registry, &options);
    assert!(!result.success);

    // Unknown kind.
    let result = compile(
        &parse(r#"{"blocks": [{"id": "x", "type": "chorusizer"}], "connections": []}"#),
        &registry,
        &options,
    );
    assert!(!result.success);
    assert!(result.errors().any(|e| e.message.contains("chorusizer")));

    // Missing required input.
    let result = compile(
        &parse(r#"{"blocks": [{"id": "dac", "type": "output"}], "connections": []}"#),
        &registry,
        &options,
    );
    assert!(!result.success);
    assert!(
        result
            .errors()
            .any(|e| e.message.contains("required input"))
    );

    // Signal class mismatch: audio output into a control input.
    let doc = r#"{
        "blocks": [
            {"id": "adc", "type": "input"},
            {"id": "g", "type": "gain"},
            {"id": "dac", "type": "output"}
        ],
        "connections": [
            {"id": "c1", "from": {"blockId": "adc", "portId": "out"},
                         "to": {"blockId": "g", "portId": "in"}},
            {"id": "c2", "from": {"blockId": "adc", "portId": "out"},
                         "to": {"blockId": "g", "portId": "cv"}},
            {"id": "c3", "from": {"blockId": "g", "portId": "out"},
                         "to": {"blockId": "dac", "portId": "in"}}
        ]
    }"#;
    let result = compile(&parse(doc), &registry, &options);
    assert!(!result.success);
    assert!(result.errors().any(|e| e.message.contains("audio")));

    // Duplicate sink.
    let doc = r#"{
        "blocks": [
            {"id": "a", "type": "input"},
            {"id": "b", "type": "input"},
            {"id": "dac", "type": "output"}
        ],
        "connections": [
            {"id": "c1", "from": {"blockId": "a", "portId": "out"},
                         "to": {"blockId": "dac", "portId": "in"}},
            {"id": "c2", "from": {"blockId": "b", "portId": "out"},
                         "to": {"blockId": "dac", "portId": "in"}}
        ]
    }"#;
    let result = compile(&parse(doc), &registry, &options);
    assert!(!result.success);
    assert!(result.errors().any(|e| e.message.contains("driven twice")));
}

#[test]
fn test_delay_memory_exhaustion() {
    let doc = r#"{
        "blocks": [
            {"id": "adc", "type": "input"},
            {"id": "d1", "type": "delay", "parameters": {"time_ms": 990}},
            {"id": "d2", "type": "delay", "parameters": {"time_ms": 990}},
            {"id": "dac", "type": "output"}
        ],
        "connections": [
            {"id": "c1", "from": {"blockId": "adc", "portId": "out"},
                         "to": {"blockId": "d1", "portId": "in"}},
            {"id": "c2", "from": {"blockId": "d1", "portId": "out"},
                         "to": {"blockId": "d2", "portId": "in"}},
            {"id": "c3", "from": {"blockId": "d2", "portId": "out"},
                         "to": {"blockId": "dac", "portId": "in"}}
        ]
    }"#;
    let registry = Registry::with_builtins();
    let options = CompilerOptions::default();
    let result = compile(&parse(doc), &registry, &options);
    assert!(!result.success);
    assert!(
        result
            .errors()
            .any(|e| e.message.contains("out of delay memory")),
        "{:?}",
        result.diagnostics
    );
}

#[test]
fn test_width_block_uses_scratch_registers() {
    let doc = r#"{
        "blocks": [
            {"id": "l", "type": "input", "parameters": {"channel": "left"}},
            {"id": "r", "type": "input", "parameters": {"channel": "right"}},
            {"id": "w", "type": "width", "parameters": {"width": 1.5}},
            {"id": "ol", "type": "output", "parameters": {"channel": "left"}},
            {"id": "or", "type": "output", "parameters": {"channel": "right"}}
        ],
        "connections": [
            {"id": "c1", "from": {"blockId": "l", "portId": "out"},
                         "to": {"blockId": "w", "portId": "in_l"}},
            {"id": "c2", "from": {"blockId": "r", "portId": "out"},
                         "to": {"blockId": "w", "portId": "in_r"}},
            {"id": "c3", "from": {"blockId": "w", "portId": "out_l"},
                         "to": {"blockId": "ol", "portId": "in"}},
            {"id": "c4", "from": {"blockId": "w", "portId": "out_r"},
                         "to": {"blockId": "or", "portId": "in"}}
        ]
    }"#;
    let registry = Registry::with_builtins();
    let options = CompilerOptions::default();
    let (result, program) = compile_to_program(&parse(doc), &registry, &options);
    assert!(result.success, "{:?}", result.diagnostics);
    let assembly = result.assembly.unwrap();
    // The mid/side temporaries come from the top of the register file.
    assert!(assembly.contains("wrax REG31, 0.0"), "{assembly}");
    assert!(assembly.contains("wrax REG30, 0.0"), "{assembly}");
    assert!(assembly.contains("sof 1.5, 0.0"), "{assembly}");
    assert!(assembly.contains("wrax width1_out_l, 0.0"), "{assembly}");
    assert!(assembly.contains("wrax width1_out_r, 0.0"), "{assembly}");
    assert!(program.is_some());

    // Permanent aliases never collide with the scratch frontier.
    let stats = result.statistics.unwrap();
    assert!(stats.registers < 30);
}

#[test]
fn test_template_block_compiles_alongside_builtins() {
    let template = r#"---
{
  "type": "atten",
  "category": "level",
  "name": "Attenuator",
  "inputs": [{"id": "in", "type": "audio", "required": true}],
  "outputs": [{"id": "out", "type": "audio"}],
  "parameters": [{"id": "level", "type": "number", "default": 0.25}]
}
---
@section main
@if pinConnected(out)
rdax ${input.in}, ${level}
wrax ${output.out}, 0.0
@endif
"#;
    let doc = r#"{
        "blocks": [
            {"id": "adc", "type": "input"},
            {"id": "a", "type": "atten"},
            {"id": "dac", "type": "output"}
        ],
        "connections": [
            {"id": "c1", "from": {"blockId": "adc", "portId": "out"},
                         "to": {"blockId": "a", "portId": "in"}},
            {"id": "c2", "from": {"blockId": "a", "portId": "out"},
                         "to": {"blockId": "dac", "portId": "in"}}
        ]
    }"#;
    let mut registry = Registry::with_builtins();
    registry.register_template(template).unwrap();
    let options = CompilerOptions::default();
    let (result, program) = compile_to_program(&parse(doc), &registry, &options);
    assert!(result.success, "{:?}", result.diagnostics);
    let assembly = result.assembly.unwrap();
    assert!(assembly.contains("rdax input1_out, 0.25"), "{assembly}");
    assert!(assembly.contains("wrax atten1_out, 0.0"), "{assembly}");
    assert!(program.is_some());
}
