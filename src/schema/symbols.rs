use bitflags::bitflags;
use num_enum::TryFromPrimitive;

bitflags! {
    /// Condition bits of the `SKP` instruction.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SkpCondition: u32 {
        /// Accumulator is negative.
        const NEG = 0x01;
        /// Accumulator is zero or positive.
        const GEZ = 0x02;
        /// Accumulator is zero.
        const ZRO = 0x04;
        /// Accumulator crossed zero since the previous sample.
        const ZRC = 0x08;
        /// Not the first sample since program load.
        const RUN = 0x10;
    }
}

bitflags! {
    /// Behavior flags of the `CHO` instruction. `SIN` is the empty set.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ChoFlags: u32 {
        /// Use the cosine output of the selected LFO.
        const COS = 0x01;
        /// Hold the LFO value registered at the last `CHO`.
        const REG = 0x02;
        /// Complement the interpolation coefficient.
        const COMPC = 0x04;
        /// Complement the LFO address/value.
        const COMPA = 0x08;
        /// Use the second ramp pointer, offset by half the ramp span.
        const RPTR2 = 0x10;
        /// Suppress the delay-address sum (ramp crossfade reads).
        const NA = 0x20;
    }
}

/// LFO selector values as they appear in source text. `Cos0`/`Cos1`
/// address the same oscillators as `Sin0`/`Sin1`; bit 3 marks the cosine
/// tap and is folded into [`ChoFlags::COS`] during encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
#[repr(u8)]
pub enum LfoSelector {
    Sin0 = 0,
    Sin1 = 1,
    Rmp0 = 2,
    Rmp1 = 3,
    Cos0 = 8,
    Cos1 = 9,
}

/// Register slot of the indirect delay pointer.
pub const ADDR_PTR: u32 = 0x18;
/// First general-purpose register slot; `REGn` lives at `0x20 + n`.
pub const REG_BASE: u32 = 0x20;

/// Hardware register slots, addressable by every register-operand
/// instruction. General registers are appended per configured count.
pub const HARDWARE_REGISTERS: &[(&str, u32)] = &[
    ("sin0_rate", 0x00),
    ("sin0_range", 0x01),
    ("sin1_rate", 0x02),
    ("sin1_range", 0x03),
    ("rmp0_rate", 0x04),
    ("rmp0_range", 0x05),
    ("rmp1_rate", 0x06),
    ("rmp1_range", 0x07),
    ("pot0", 0x10),
    ("pot1", 0x11),
    ("pot2", 0x12),
    ("adcl", 0x14),
    ("adcr", 0x15),
    ("dacl", 0x16),
    ("dacr", 0x17),
    ("addr_ptr", ADDR_PTR),
];

/// Named constants the assembler pre-defines besides the register slots.
/// These may be shadowed by user `EQU`s; the register names may not.
pub const NAMED_CONSTANTS: &[(&str, u32)] = &[
    ("sin0", LfoSelector::Sin0 as u32),
    ("sin1", LfoSelector::Sin1 as u32),
    ("rmp0", LfoSelector::Rmp0 as u32),
    ("rmp1", LfoSelector::Rmp1 as u32),
    ("cos0", LfoSelector::Cos0 as u32),
    ("cos1", LfoSelector::Cos1 as u32),
    ("sin", 0),
    ("cos", ChoFlags::COS.bits()),
    ("reg", ChoFlags::REG.bits()),
    ("compc", ChoFlags::COMPC.bits()),
    ("compa", ChoFlags::COMPA.bits()),
    ("rptr2", ChoFlags::RPTR2.bits()),
    ("na", ChoFlags::NA.bits()),
    ("neg", SkpCondition::NEG.bits()),
    ("gez", SkpCondition::GEZ.bits()),
    ("zro", SkpCondition::ZRO.bits()),
    ("zrc", SkpCondition::ZRC.bits()),
    ("run", SkpCondition::RUN.bits()),
];

/// True for names bound to hardware register slots, which user `EQU`s
/// must not shadow. `name` must already be lowercase.
#[must_use]
pub fn is_register_name(name: &str, reg_count: usize) -> bool {
    if HARDWARE_REGISTERS.iter().any(|&(n, _)| n == name) {
        return true;
    }
    general_register(name).is_some_and(|n| (n as usize) < reg_count)
}

/// Parse a `regN` name into its index.
#[must_use]
pub fn general_register(name: &str) -> Option<u32> {
    let digits = name.strip_prefix("reg")?;
    if digits.is_empty() || digits.len() > 2 || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    // No leading zeros: the canonical spelling is reg0..reg31.
    if digits.len() > 1 && digits.starts_with('0') {
        return None;
    }
    digits.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_names() {
        assert!(is_register_name("adcl", 32));
        assert!(is_register_name("addr_ptr", 32));
        assert!(is_register_name("reg0", 32));
        assert!(is_register_name("reg31", 32));
        assert!(!is_register_name("reg31", 16));
        assert!(!is_register_name("reg32", 32));
        assert!(!is_register_name("reg01", 32));
        assert!(!is_register_name("sin0", 32));
        assert!(!is_register_name("run", 32));
    }

    #[test]
    fn selector_cosine_bit() {
        assert_eq!(8, LfoSelector::Cos0 as u32 & 0x8);
        assert_eq!(0, LfoSelector::Cos0 as u32 & 0x3);
        assert_eq!(1, LfoSelector::Cos1 as u32 & 0x3);
    }

    #[test]
    fn skp_conditions_match_hardware() {
        assert_eq!(0x10, SkpCondition::RUN.bits());
        assert_eq!(
            0x1F,
            (SkpCondition::NEG
                | SkpCondition::GEZ
                | SkpCondition::ZRO
                | SkpCondition::ZRC
                | SkpCondition::RUN)
                .bits()
        );
    }
}
