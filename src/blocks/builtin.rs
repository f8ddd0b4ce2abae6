use crate::blocks::registry::{
    BlockKind, Conversion, ParamDef, PortDef, SAMPLE_RATE,
};
use crate::context::{CodegenContext, format_real};
use crate::diag::Diagnostic;

/// The built-in block kinds, ready for a [`crate::Registry`].
#[must_use]
pub fn all() -> Vec<Box<dyn BlockKind>> {
    Kind::ALL.iter().map(|&kind| Builtin::boxed(kind)).collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
    Input,
    Output,
    Pot,
    Gain,
    Mixer2,
    Width,
    LfoSine,
    LfoRamp,
    Delay,
    Filter1p,
}

impl Kind {
    const ALL: [Kind; 10] = [
        Kind::Input,
        Kind::Output,
        Kind::Pot,
        Kind::Gain,
        Kind::Mixer2,
        Kind::Width,
        Kind::LfoSine,
        Kind::LfoRamp,
        Kind::Delay,
        Kind::Filter1p,
    ];
}

/// One built-in kind: a tag plus its port and parameter tables. All
/// code generation dispatches on the tag.
pub struct Builtin {
    kind: Kind,
    type_id: &'static str,
    category: &'static str,
    display_name: &'static str,
    inputs: Vec<PortDef>,
    outputs: Vec<PortDef>,
    parameters: Vec<ParamDef>,
}

impl Builtin {
    fn boxed(kind: Kind) -> Box<dyn BlockKind> {
        Box::new(match kind {
            Kind::Input => Self {
                kind,
                type_id: "input",
                category: "io",
                display_name: "Audio In",
                inputs: vec![],
                outputs: vec![PortDef::audio("out", "Out", false)],
                parameters: vec![ParamDef::select("channel", "Channel", &["left", "right"])],
            },
            Kind::Output => Self {
                kind,
                type_id: "output",
                category: "io",
                display_name: "Audio Out",
                inputs: vec![PortDef::audio("in", "In", true)],
                outputs: vec![],
                parameters: vec![ParamDef::select("channel", "Channel", &["left", "right"])],
            },
            Kind::Pot => Self {
                kind,
                type_id: "pot",
                category: "control",
                display_name: "Pot",
                inputs: vec![],
                outputs: vec![PortDef::control("out", "Value")],
                parameters: vec![
                    ParamDef::select("pot", "Pot", &["pot0", "pot1", "pot2"]),
                    ParamDef::boolean("smooth", "Smooth", true),
                    ParamDef::boolean("invert", "Invert", false),
                ],
            },
            Kind::Gain => Self {
                kind,
                type_id: "gain",
                category: "level",
                display_name: "Gain",
                inputs: vec![
                    PortDef::audio("in", "In", true),
                    PortDef::control("cv", "CV"),
                ],
                outputs: vec![PortDef::audio("out", "Out", false)],
                parameters: vec![ParamDef::number("gain", "Gain", 1.0, 0.0, 1.999)],
            },
            Kind::Mixer2 => Self {
                kind,
                type_id: "mixer2",
                category: "level",
                display_name: "Mixer",
                inputs: vec![
                    PortDef::audio("in1", "In 1", false),
                    PortDef::audio("in2", "In 2", false),
                ],
                outputs: vec![PortDef::audio("out", "Out", false)],
                parameters: vec![
                    ParamDef::number("level1", "Level 1", 0.0, -40.0, 6.0)
                        .with_conversion(Conversion::DbLevel),
                    ParamDef::number("level2", "Level 2", 0.0, -40.0, 6.0)
                        .with_conversion(Conversion::DbLevel),
                ],
            },
            Kind::Width => Self {
                kind,
                type_id: "width",
                category: "level",
                display_name: "Stereo Width",
                inputs: vec![
                    PortDef::audio("in_l", "In L", true),
                    PortDef::audio("in_r", "In R", true),
                ],
                outputs: vec![
                    PortDef::audio("out_l", "Out L", false),
                    PortDef::audio("out_r", "Out R", false),
                ],
                parameters: vec![ParamDef::number("width", "Width", 1.0, 0.0, 1.999)],
            },
            Kind::LfoSine => Self {
                kind,
                type_id: "lfo_sine",
                category: "modulation",
                display_name: "Sine LFO",
                inputs: vec![
                    PortDef::control("rate", "Rate"),
                    PortDef::control("depth", "Depth"),
                ],
                outputs: vec![PortDef::control("out", "Out")],
                parameters: vec![
                    ParamDef::number("rate_hz", "Rate (Hz)", 2.0, 0.05, 20.0),
                    ParamDef::number("depth", "Depth", 1.0, 0.0, 1.0),
                ],
            },
            Kind::LfoRamp => Self {
                kind,
                type_id: "lfo_ramp",
                category: "modulation",
                display_name: "Ramp LFO",
                inputs: vec![PortDef::control("rate", "Rate")],
                outputs: vec![PortDef::control("out", "Out")],
                parameters: vec![
                    ParamDef::number("rate_hz", "Rate (Hz)", 0.5, 0.05, 20.0),
                    ParamDef::select("span", "Span", &["4096", "2048", "1024", "512"]),
                ],
            },
            Kind::Delay => Self {
                kind,
                type_id: "delay",
                category: "time",
                display_name: "Delay",
                inputs: vec![
                    PortDef::audio("in", "In", true),
                    PortDef::audio("fb", "Feedback", false),
                    PortDef::control("mod", "Mod"),
                ],
                outputs: vec![PortDef::audio("out", "Out", false)],
                parameters: vec![
                    ParamDef::number("time_ms", "Time (ms)", 250.0, 1.0, 990.0),
                    ParamDef::number("feedback", "Feedback", 0.3, -0.95, 0.95),
                ],
            },
            Kind::Filter1p => Self {
                kind,
                type_id: "filter_1p",
                category: "filter",
                display_name: "One-Pole Filter",
                inputs: vec![PortDef::audio("in", "In", true)],
                outputs: vec![PortDef::audio("out", "Out", false)],
                parameters: vec![
                    ParamDef::number("cutoff_hz", "Cutoff (Hz)", 1000.0, 20.0, 16000.0)
                        .with_conversion(Conversion::LogFreq),
                    ParamDef::select("mode", "Mode", &["lowpass", "highpass"]),
                ],
            },
        })
    }

    /// Numeric parameter, clamped to its declared range, with the
    /// display-unit conversion applied.
    fn number(&self, ctx: &CodegenContext<'_>, id: &str) -> f64 {
        let def = self.parameter_def(id).expect("declared parameter");
        let mut value = ctx
            .number_parameter(id)
            .or_else(|| def.default.as_number())
            .unwrap_or(0.0);
        if let Some(min) = def.min {
            value = value.max(min);
        }
        if let Some(max) = def.max {
            value = value.min(max);
        }
        def.conversion.apply(value)
    }

    fn text(&self, ctx: &CodegenContext<'_>, id: &str) -> String {
        ctx.text_parameter(id)
            .or_else(|| self.parameter_def(id).and_then(|d| d.default.as_text()))
            .unwrap_or("")
            .to_owned()
    }

    fn flag(&self, ctx: &CodegenContext<'_>, id: &str) -> bool {
        ctx.bool_parameter(id)
            .or_else(|| {
                self.parameter_def(id)
                    .and_then(|d| d.default.as_bool())
            })
            .unwrap_or(false)
    }

    fn delay_samples(&self, ctx: &CodegenContext<'_>) -> usize {
        let time = self.number(ctx, "time_ms");
        ((time / 1000.0 * SAMPLE_RATE).round() as usize).max(1)
    }
}

fn require_input(ctx: &mut CodegenContext<'_>, port: &str) -> Result<String, Diagnostic> {
    match ctx.input_register(port) {
        Some(alias) => Ok(alias),
        None => Err(Diagnostic::error_for_port(
            ctx.block_id().to_owned(),
            port,
            "required input is not connected",
        )),
    }
}

/// True (and emits code) only when someone listens to `out`; a silent
/// block gets a warning instead.
fn output_or_warn(ctx: &mut CodegenContext<'_>) -> bool {
    if ctx.is_output_connected("out") {
        true
    } else {
        ctx.push_warning("output is not connected; block is silent");
        false
    }
}

impl BlockKind for Builtin {
    fn type_id(&self) -> &str {
        self.type_id
    }

    fn category(&self) -> &str {
        self.category
    }

    fn display_name(&self) -> &str {
        self.display_name
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
        if self.kind == Kind::Delay {
            let samples = self.delay_samples(ctx);
            ctx.allocate_memory(samples)?;
        }
        Ok(())
    }

    fn emit_init(&self, ctx: &mut CodegenContext<'_>) -> Result<(), Diagnostic> {
        match self.kind {
            Kind::LfoSine => {
                let index = ctx.allocate_lfo(false)?;
                let rate = self.number(ctx, "rate_hz");
                let depth = self.number(ctx, "depth");
                // Kf = f * 2^17 / Fs per the sine LFO rate register.
                let freq = ((rate * 131_072.0 / SAMPLE_RATE).round() as i64).clamp(0, 511);
                let amp = ((depth * 32767.0).round() as i64).clamp(0, 32767);
                ctx.push_init(format!("wlds sin{index}, {freq}, {amp}"));
            }
            Kind::LfoRamp => {
                let index = ctx.allocate_lfo(true)?;
                let rate = self.number(ctx, "rate_hz");
                let span = self.text(ctx, "span");
                let freq = ((rate * 524_288.0 / SAMPLE_RATE).round() as i64).clamp(-16384, 32767);
                ctx.push_init(format!("wldr rmp{index}, {freq}, {span}"));
            }
            _ => {}
        }
        Ok(())
    }

    fn emit_main(&self, ctx: &mut CodegenContext<'_>) -> Result<(), Diagnostic> {
        match self.kind {
            Kind::Input => {
                if !output_or_warn(ctx) {
                    return Ok(());
                }
                let out = ctx.allocate_register("out")?;
                let adc = if self.text(ctx, "channel") == "right" {
                    "ADCR"
                } else {
                    "ADCL"
                };
                ctx.push_main(format!("rdax {adc}, 1.0"));
                ctx.push_main(format!("wrax {out}, 0.0"));
            }
            Kind::Output => {
                let input = require_input(ctx, "in")?;
                let dac = if self.text(ctx, "channel") == "right" {
                    "DACR"
                } else {
                    "DACL"
                };
                ctx.push_main(format!("rdax {input}, 1.0"));
                ctx.push_main(format!("wrax {dac}, 0.0"));
            }
            Kind::Pot => {
                if !output_or_warn(ctx) {
                    return Ok(());
                }
                let out = ctx.allocate_register("out")?;
                let pot = self.text(ctx, "pot").to_ascii_uppercase();
                if self.flag(ctx, "smooth") {
                    // Response shaper: heavy low-pass, -0.75 shelf, then
                    // 0.75 of the previous output mixed back.
                    let state = ctx.allocate_register("flt")?;
                    let lp = ctx.standard_constant(0.001);
                    let shelf = ctx.standard_constant(-0.75);
                    let mix = ctx.standard_constant(0.75);
                    ctx.push_main(format!("rdax {pot}, 1.0"));
                    ctx.push_main(format!("rdfx {state}, {lp}"));
                    ctx.push_main(format!("wrlx {state}, {shelf}"));
                    ctx.push_main(format!("rdax {out}, {mix}"));
                } else {
                    ctx.push_warning("smoothing disabled; pot changes may step audibly");
                    ctx.push_main(format!("rdax {pot}, 1.0"));
                }
                if self.flag(ctx, "invert") {
                    let minus = ctx.standard_constant(-1.0);
                    let one = ctx.standard_constant(1.0);
                    ctx.push_main(format!("sof {minus}, {one}"));
                }
                ctx.push_main(format!("wrax {out}, 0.0"));
            }
            Kind::Gain => {
                if !output_or_warn(ctx) {
                    return Ok(());
                }
                let input = require_input(ctx, "in")?;
                let gain = self.number(ctx, "gain");
                ctx.push_main(format!("rdax {input}, {}", format_real(gain)));
                if let Some(cv) = ctx.input_register("cv") {
                    ctx.push_main(format!("mulx {cv}"));
                }
                let out = ctx.allocate_register("out")?;
                ctx.push_main(format!("wrax {out}, 0.0"));
            }
            Kind::Mixer2 => {
                if !output_or_warn(ctx) {
                    return Ok(());
                }
                let mut summed = false;
                for (port, level) in [("in1", "level1"), ("in2", "level2")] {
                    if let Some(alias) = ctx.input_register(port) {
                        let linear = self.number(ctx, level);
                        ctx.push_main(format!("rdax {alias}, {}", format_real(linear)));
                        summed = true;
                    }
                }
                if !summed {
                    ctx.push_warning("no inputs connected; output is silence");
                    ctx.push_main("clr");
                }
                let out = ctx.allocate_register("out")?;
                ctx.push_main(format!("wrax {out}, 0.0"));
            }
            Kind::Width => {
                let left_used = ctx.is_output_connected("out_l");
                let right_used = ctx.is_output_connected("out_r");
                if !left_used && !right_used {
                    ctx.push_warning("no output is connected; block is silent");
                    return Ok(());
                }
                let left = require_input(ctx, "in_l")?;
                let right = require_input(ctx, "in_r")?;
                let width = self.number(ctx, "width");
                // Mid/side: scale the side signal, rebuild both channels.
                let mid = ctx.scratch_register()?;
                let side = ctx.scratch_register()?;
                ctx.push_main(format!("rdax {left}, 0.5"));
                ctx.push_main(format!("rdax {right}, 0.5"));
                ctx.push_main(format!("wrax {mid}, 0.0"));
                ctx.push_main(format!("rdax {left}, 0.5"));
                ctx.push_main(format!("rdax {right}, -0.5"));
                ctx.push_main(format!("sof {}, 0.0", format_real(width)));
                ctx.push_main(format!("wrax {side}, 0.0"));
                if left_used {
                    let out = ctx.allocate_register("out_l")?;
                    ctx.push_main(format!("rdax {mid}, 1.0"));
                    ctx.push_main(format!("rdax {side}, 1.0"));
                    ctx.push_main(format!("wrax {out}, 0.0"));
                }
                if right_used {
                    let out = ctx.allocate_register("out_r")?;
                    ctx.push_main(format!("rdax {mid}, 1.0"));
                    ctx.push_main(format!("rdax {side}, -1.0"));
                    ctx.push_main(format!("wrax {out}, 0.0"));
                }
            }
            Kind::LfoSine => {
                let index = ctx.allocate_lfo(false)?;
                if let Some(rate) = ctx.input_register("rate") {
                    ctx.push_main(format!("rdax {rate}, 1.0"));
                    ctx.push_main(format!("wrax SIN{index}_RATE, 0.0"));
                }
                if let Some(depth) = ctx.input_register("depth") {
                    ctx.push_main(format!("rdax {depth}, 1.0"));
                    ctx.push_main(format!("wrax SIN{index}_RANGE, 0.0"));
                }
                if !output_or_warn(ctx) {
                    return Ok(());
                }
                let out = ctx.allocate_register("out")?;
                ctx.push_main(format!("cho rdal, sin{index}"));
                ctx.push_main(format!("wrax {out}, 0.0"));
            }
            Kind::LfoRamp => {
                let index = ctx.allocate_lfo(true)?;
                if let Some(rate) = ctx.input_register("rate") {
                    ctx.push_main(format!("rdax {rate}, 1.0"));
                    ctx.push_main(format!("wrax RMP{index}_RATE, 0.0"));
                }
                if !output_or_warn(ctx) {
                    return Ok(());
                }
                let out = ctx.allocate_register("out")?;
                ctx.push_main(format!("cho rdal, rmp{index}"));
                ctx.push_main(format!("wrax {out}, 0.0"));
            }
            Kind::Delay => {
                let samples = self.delay_samples(ctx);
                let region = ctx.allocate_memory(samples)?;
                let input = require_input(ctx, "in")?;
                let feedback = self.number(ctx, "feedback");
                if let Some(fb) = ctx.input_register("fb") {
                    ctx.push_main(format!("rdax {fb}, {}", format_real(feedback)));
                } else if feedback != 0.0 {
                    ctx.push_main(format!("rda {}#, {}", region.name, format_real(feedback)));
                }
                ctx.push_main(format!("rdax {input}, 1.0"));
                ctx.push_main(format!("wra {}, 0.0", region.name));
                if !output_or_warn(ctx) {
                    return Ok(());
                }
                if let Some(modulation) = ctx.input_register("mod") {
                    // Steer ADDR_PTR across the line: the offset is
                    // rounded up to the S.10 grid and the sweep is
                    // narrowed by one grid step, so a control value in
                    // [0, 1] can never leave the region.
                    let step = 32usize;
                    let offset = region.base.div_ceil(step) * step;
                    let sweep = region.size.saturating_sub(1 + step);
                    ctx.push_main(format!(
                        "rdax {modulation}, {}",
                        format_real(sweep as f64 / 32768.0)
                    ));
                    ctx.push_main(format!(
                        "sof 1.0, {}",
                        format_real(offset as f64 / 32768.0)
                    ));
                    ctx.push_main("wrax ADDR_PTR, 0.0");
                    ctx.push_main("rmpa 1.0");
                } else {
                    ctx.push_main(format!("rda {}#, 1.0", region.name));
                }
                let out = ctx.allocate_register("out")?;
                ctx.push_main(format!("wrax {out}, 0.0"));
            }
            Kind::Filter1p => {
                if !output_or_warn(ctx) {
                    return Ok(());
                }
                let input = require_input(ctx, "in")?;
                let coefficient = self.number(ctx, "cutoff_hz");
                let state = ctx.allocate_register("flt")?;
                ctx.push_main(format!("rdax {input}, 1.0"));
                ctx.push_main(format!("rdfx {state}, {}", format_real(coefficient)));
                if self.text(ctx, "mode") == "highpass" {
                    let minus = ctx.standard_constant(-1.0);
                    ctx.push_main(format!("wrhx {state}, {minus}"));
                } else {
                    ctx.push_main(format!("wrax {state}, 1.0"));
                }
                let out = ctx.allocate_register("out")?;
                ctx.push_main(format!("wrax {out}, 0.0"));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_kind_has_consistent_metadata() {
        for kind in all() {
            assert!(!kind.type_id().is_empty());
            assert!(!kind.category().is_empty());
            for port in kind.inputs().iter().chain(kind.outputs()) {
                assert!(!port.id.is_empty());
            }
            for parameter in kind.parameters() {
                assert!(!parameter.id.is_empty());
            }
        }
    }

    #[test]
    fn delay_time_converts_to_samples() {
        use crate::config::CompilerOptions;
        use crate::graph::{BlockGraph, ParamValue};
        use std::collections::HashMap;

        let options = CompilerOptions::default();
        let graph = BlockGraph::default();
        let mut ctx = crate::context::CodegenContext::new(&options, &graph);
        let mut parameters = HashMap::new();
        parameters.insert("time_ms".to_owned(), ParamValue::Number(500.0));
        ctx.set_current("d1", "delay", parameters);

        let delay = Builtin::boxed(Kind::Delay);
        delay.declare(&mut ctx).unwrap();
        assert_eq!(16384, ctx.memories()[0].size);
    }
}
