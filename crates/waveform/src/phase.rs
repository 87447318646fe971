//! Core waveform vocabulary: phases, intensities, and mode kinds.

use core::fmt;
use core::str::FromStr;

/// Electrical command applied to one display cell during one frame.
///
/// Electrophoretic cells are driven by moving charged pigment particles:
/// a phase either leaves the cell alone or pulls one pigment to the surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum Phase {
    /// Leave the cell in its present state
    #[default]
    Noop = 0b00,

    /// Apply a current that brings black particles to the top
    Black = 0b01,

    /// Apply a current that brings white particles to the top
    White = 0b10,
}

impl Phase {
    /// Decode a two-bit phase value.
    ///
    /// The reserved value `0b11` never appears in well-formed waveform data
    /// and decodes to `Noop`.
    pub fn from_bits(bits: u8) -> Self {
        match bits & 0b11 {
            0b01 => Phase::Black,
            0b10 => Phase::White,
            _ => Phase::Noop,
        }
    }

    /// Two-bit encoding of this phase.
    pub fn bits(self) -> u8 {
        self as u8
    }
}

/// Cell grayscale intensity (5 bits).
///
/// Only even values are used. 0 denotes full black, 30 full white.
pub type Intensity = u8;

/// Number of representable intensity levels.
pub const INTENSITY_VALUES: usize = 1 << 5;

/// Mask that clamps a byte to the valid intensity range.
pub const INTENSITY_MASK: u8 = (INTENSITY_VALUES - 1) as u8;

/// Lookup table giving the phase to apply to transition between two
/// intensities during one frame.
///
/// Rows are source intensities, columns are targets.
pub type PhaseMatrix = [[Phase; INTENSITY_VALUES]; INTENSITY_VALUES];

/// Ordered sequence of phase matrices.
///
/// Applying every matrix in order completes a transition from any source
/// intensity to any target intensity. Length depends on the mode and on the
/// panel temperature.
pub type Waveform = Vec<PhaseMatrix>;

/// Numeric mode index, as updates identify modes on the wire.
pub type ModeId = u8;

/// Panel temperature in Celsius.
pub type Temperature = i8;

/// Semantic classification of a waveform mode.
///
/// Panels ship several waveforms trading off image fidelity against
/// rendering speed. The WBF container only numbers them; the kind is
/// recovered by inspecting which transitions each waveform defines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModeKind {
    /// Mode whose behavior could not be recognized
    Unknown,

    /// Initialization mode that forces all cells back to a known white state
    Init,

    /// Fast, non-flashy update that only supports transitions to black or white
    Du,

    /// Same as DU but supports 4 gray tones
    Du4,

    /// Faster than DU, only supports transitions *between* black and white
    A2,

    /// Full fidelity mode (16 gray tones)
    Gc16,

    /// Full fidelity mode with support for Regal transitions
    Glr16,
}

impl ModeKind {
    /// Short uppercase name, matching the vendor mode declaration sheets.
    pub fn name(self) -> &'static str {
        match self {
            ModeKind::Unknown => "UNKNOWN",
            ModeKind::Init => "INIT",
            ModeKind::Du => "DU",
            ModeKind::Du4 => "DU4",
            ModeKind::A2 => "A2",
            ModeKind::Gc16 => "GC16",
            ModeKind::Glr16 => "GLR16",
        }
    }
}

impl fmt::Display for ModeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ModeKind {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "INIT" => Ok(ModeKind::Init),
            "DU" => Ok(ModeKind::Du),
            "DU4" => Ok(ModeKind::Du4),
            "A2" => Ok(ModeKind::A2),
            "GC16" => Ok(ModeKind::Gc16),
            "GLR16" => Ok(ModeKind::Glr16),
            "UNKNOWN" => Ok(ModeKind::Unknown),
            _ => Err(()),
        }
    }
}

/// A phase matrix with every entry set to the same phase.
pub fn uniform_matrix(phase: Phase) -> PhaseMatrix {
    [[phase; INTENSITY_VALUES]; INTENSITY_VALUES]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_bits_round_trip() {
        for phase in [Phase::Noop, Phase::Black, Phase::White] {
            assert_eq!(Phase::from_bits(phase.bits()), phase);
        }
    }

    #[test]
    fn test_phase_reserved_bits() {
        assert_eq!(Phase::from_bits(0b11), Phase::Noop);
        // Upper bits are ignored
        assert_eq!(Phase::from_bits(0b110), Phase::White);
    }

    #[test]
    fn test_mode_kind_name_round_trip() {
        for kind in [
            ModeKind::Unknown,
            ModeKind::Init,
            ModeKind::Du,
            ModeKind::Du4,
            ModeKind::A2,
            ModeKind::Gc16,
            ModeKind::Glr16,
        ] {
            assert_eq!(kind.name().parse::<ModeKind>(), Ok(kind));
        }
    }

    #[test]
    fn test_mode_kind_from_unknown_string() {
        assert!("GC12".parse::<ModeKind>().is_err());
    }
}
