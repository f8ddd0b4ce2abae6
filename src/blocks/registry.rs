use std::collections::HashMap;

use crate::blocks::{builtin, template};
use crate::context::CodegenContext;
use crate::diag::Diagnostic;
use crate::graph::ParamValue;

/// Whether a port carries an audio-rate or control-rate signal. Only
/// like classes may be connected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalClass {
    Audio,
    Control,
}

impl SignalClass {
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Audio => "audio",
            Self::Control => "control",
        }
    }
}

/// One input or output of a block kind.
#[derive(Debug, Clone)]
pub struct PortDef {
    pub id: String,
    pub name: String,
    pub class: SignalClass,
    /// Required inputs must be connected; meaningless on outputs.
    pub required: bool,
}

impl PortDef {
    pub fn audio(id: &str, name: &str, required: bool) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            class: SignalClass::Audio,
            required,
        }
    }

    pub fn control(id: &str, name: &str) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            class: SignalClass::Control,
            required: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamType {
    Number,
    Boolean,
    Select,
    Text,
}

/// Display-unit conversion applied when a parameter value is used as a
/// DSP quantity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Conversion {
    #[default]
    None,
    /// Cutoff in Hz to a one-pole coefficient at the FV-1 sample rate.
    LogFreq,
    /// Level in dB to linear gain.
    DbLevel,
}

/// FV-1 sample rate with a crystal-clocked codec.
pub const SAMPLE_RATE: f64 = 32768.0;

impl Conversion {
    /// Turn the displayed value into the quantity code generation uses.
    #[must_use]
    pub fn apply(self, value: f64) -> f64 {
        match self {
            Self::None => value,
            Self::LogFreq => 1.0 - (-2.0 * std::f64::consts::PI * value / SAMPLE_RATE).exp(),
            Self::DbLevel => 10f64.powf(value / 20.0),
        }
    }
}

/// One parameter of a block kind.
#[derive(Debug, Clone)]
pub struct ParamDef {
    pub id: String,
    pub name: String,
    pub ty: ParamType,
    pub default: ParamValue,
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub conversion: Conversion,
    /// Choices for `Select` parameters.
    pub options: Vec<String>,
}

impl ParamDef {
    pub fn number(id: &str, name: &str, default: f64, min: f64, max: f64) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            ty: ParamType::Number,
            default: ParamValue::Number(default),
            min: Some(min),
            max: Some(max),
            conversion: Conversion::None,
            options: Vec::new(),
        }
    }

    pub fn boolean(id: &str, name: &str, default: bool) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            ty: ParamType::Boolean,
            default: ParamValue::Bool(default),
            min: None,
            max: None,
            conversion: Conversion::None,
            options: Vec::new(),
        }
    }

    pub fn select(id: &str, name: &str, options: &[&str]) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            ty: ParamType::Select,
            default: ParamValue::Text(options[0].into()),
            min: None,
            max: None,
            conversion: Conversion::None,
            options: options.iter().map(|&o| o.into()).collect(),
        }
    }

    #[must_use]
    pub fn with_conversion(mut self, conversion: Conversion) -> Self {
        self.conversion = conversion;
        self
    }
}

/// A kind of block: static metadata plus its code generation hooks.
///
/// The hooks run against the shared [`CodegenContext`]; `declare` and
/// `emit_init` during the first visit of each block, `emit_main` during
/// the second. All three default to emitting nothing.
pub trait BlockKind {
    fn type_id(&self) -> &str;
    fn category(&self) -> &str;
    fn display_name(&self) -> &str;
    fn inputs(&self) -> &[PortDef];
    fn outputs(&self) -> &[PortDef];
    fn parameters(&self) -> &[ParamDef];

    /// Contribute `EQU` definitions and reserve delay memory.
    fn declare(&self, _ctx: &mut CodegenContext<'_>) -> Result<(), Diagnostic> {
        Ok(())
    }

    /// Emit code that runs once, on the first sample after load.
    fn emit_init(&self, _ctx: &mut CodegenContext<'_>) -> Result<(), Diagnostic> {
        Ok(())
    }

    /// Emit the per-sample body.
    fn emit_main(&self, ctx: &mut CodegenContext<'_>) -> Result<(), Diagnostic>;

    fn input(&self, id: &str) -> Option<&PortDef> {
        self.inputs().iter().find(|p| p.id == id)
    }

    fn output(&self, id: &str) -> Option<&PortDef> {
        self.outputs().iter().find(|p| p.id == id)
    }

    fn parameter_def(&self, id: &str) -> Option<&ParamDef> {
        self.parameters().iter().find(|p| p.id == id)
    }
}

/// The catalogue of known block kinds.
#[derive(Default)]
pub struct Registry {
    kinds: Vec<Box<dyn BlockKind>>,
    by_id: HashMap<String, usize>,
}

impl Registry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry seeded with every built-in kind.
    #[must_use]
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        for kind in builtin::all() {
            registry.register(kind);
        }
        registry
    }

    /// Add a kind, replacing any previous kind with the same type id.
    pub fn register(&mut self, kind: Box<dyn BlockKind>) {
        let id = kind.type_id().to_owned();
        if let Some(&slot) = self.by_id.get(&id) {
            self.kinds[slot] = kind;
        } else {
            self.by_id.insert(id, self.kinds.len());
            self.kinds.push(kind);
        }
    }

    /// Parse an ATL template source and add the resulting kind.
    pub fn register_template(&mut self, source: &str) -> Result<(), Diagnostic> {
        let kind = template::TemplateKind::parse(source)?;
        self.register(Box::new(kind));
        Ok(())
    }

    #[must_use]
    pub fn get(&self, type_id: &str) -> Option<&dyn BlockKind> {
        self.by_id
            .get(type_id)
            .map(|&slot| self.kinds[slot].as_ref())
    }

    pub fn iter(&self) -> impl Iterator<Item = &dyn BlockKind> {
        self.kinds.iter().map(Box::as_ref)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.kinds.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.kinds.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtins_are_catalogued() {
        let registry = Registry::with_builtins();
        for id in [
            "input", "output", "pot", "gain", "mixer2", "width", "lfo_sine", "lfo_ramp",
            "delay", "filter_1p",
        ] {
            assert!(registry.get(id).is_some(), "missing builtin `{id}`");
        }
    }

    #[test]
    fn conversions() {
        assert_eq!(1.0, Conversion::DbLevel.apply(0.0));
        assert!((Conversion::DbLevel.apply(-6.0) - 0.501187).abs() < 1e-6);
        let k = Conversion::LogFreq.apply(1000.0);
        assert!(k > 0.0 && k < 1.0);
        assert!(Conversion::LogFreq.apply(100.0) < k);
        assert_eq!(3.5, Conversion::None.apply(3.5));
    }

    #[test]
    fn registering_twice_replaces() {
        let mut registry = Registry::with_builtins();
        let before = registry.len();
        registry.register(
            builtin::all()
                .into_iter()
                .find(|k| k.type_id() == "gain")
                .unwrap(),
        );
        assert_eq!(before, registry.len());
    }
}
