//! Waveform table storage and `(mode, temperature)` lookup.

use std::collections::HashMap;
use std::fmt;
use std::path::Path;

use tracing::warn;

use crate::parser::{self, ParseError, DEFAULT_FRAME_RATE};
use crate::phase::{ModeId, ModeKind, Phase, Temperature, Waveform, INTENSITY_VALUES};

/// Temperature at which modes are sampled for classification.
const CLASSIFY_TEMPERATURE: i32 = 21;

/// Errors raised by waveform lookups.
#[derive(Debug, PartialEq, Eq)]
pub enum LookupError {
    /// The mode id is outside the table
    UnknownMode { mode: ModeId, mode_count: ModeId },
    /// No mode with the requested kind exists in this table
    UnknownKind(ModeKind),
    /// Temperature below the first threshold
    TemperatureTooLow { temperature: i32, minimum: Temperature },
    /// Temperature at or above the last threshold
    TemperatureTooHigh { temperature: i32, maximum: Temperature },
}

impl fmt::Display for LookupError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LookupError::UnknownMode { mode, mode_count } => write!(
                f,
                "mode {} not supported, available modes are 0-{}",
                mode,
                mode_count.saturating_sub(1)
            ),
            LookupError::UnknownKind(kind) => {
                write!(f, "mode kind {} is not supported", kind)
            }
            LookupError::TemperatureTooLow {
                temperature,
                minimum,
            } => write!(
                f,
                "temperature {} \u{b0}C too low, minimum operating temperature is {} \u{b0}C",
                temperature, minimum
            ),
            LookupError::TemperatureTooHigh {
                temperature,
                maximum,
            } => write!(
                f,
                "temperature {} \u{b0}C too high, maximum operating temperature is {} \u{b0}C",
                temperature,
                maximum - 1
            ),
        }
    }
}

impl std::error::Error for LookupError {}

/// Errors raised when assembling a table from its parts.
#[derive(Debug, PartialEq, Eq)]
pub enum TableError {
    /// Fewer than two temperature thresholds (no usable range)
    NoTemperatureRanges,
    /// Thresholds not strictly ascending
    TemperaturesNotAscending,
    /// Empty lookup table
    NoModes,
    /// More modes than a `ModeId` can address
    TooManyModes(usize),
    /// A mode's row does not cover every temperature range
    LookupShape { mode: usize },
    /// A lookup entry points outside the waveform pool
    LookupIndex {
        mode: usize,
        range: usize,
        index: usize,
    },
}

impl fmt::Display for TableError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TableError::NoTemperatureRanges => {
                write!(f, "a waveform table needs at least two temperature thresholds")
            }
            TableError::TemperaturesNotAscending => {
                write!(f, "temperature thresholds must be strictly ascending")
            }
            TableError::NoModes => write!(f, "a waveform table needs at least one mode"),
            TableError::TooManyModes(count) => {
                write!(f, "too many modes for an 8-bit mode id: {}", count)
            }
            TableError::LookupShape { mode } => write!(
                f,
                "lookup row for mode {} does not cover every temperature range",
                mode
            ),
            TableError::LookupIndex { mode, range, index } => write!(
                f,
                "lookup entry for mode {} range {} points at waveform {} which does not exist",
                mode, range, index
            ),
        }
    }
}

impl std::error::Error for TableError {}

/// Waveform definitions for one panel, indexed by mode and temperature.
///
/// Immutable once loaded. The waveform pool is deduplicated; the lookup
/// table maps every `(mode, temperature range)` pair to a pool entry.
#[derive(Debug, Clone, PartialEq)]
pub struct WaveformTable {
    frame_rate: u8,
    mode_count: ModeId,
    temperatures: Vec<Temperature>,
    waveforms: Vec<Waveform>,
    lookup: Vec<Vec<usize>>,
    mode_kind_by_id: Vec<ModeKind>,
    mode_id_by_kind: HashMap<ModeKind, ModeId>,
}

impl WaveformTable {
    /// Read waveform definitions from a WBF file on disk.
    pub fn from_wbf<P: AsRef<Path>>(path: P) -> Result<Self, ParseError> {
        Self::from_bytes(&std::fs::read(path)?)
    }

    /// Read waveform definitions from an in-memory WBF container.
    pub fn from_bytes(buffer: &[u8]) -> Result<Self, ParseError> {
        let container = parser::parse(buffer)?;

        let frame_rate = match container.header.frame_rate {
            0 => DEFAULT_FRAME_RATE,
            rate => rate,
        };

        Ok(Self::from_parts(
            frame_rate,
            container.temperatures,
            container.waveforms,
            container.lookup,
        )?)
    }

    /// Assemble a table from pre-decoded parts, validating its invariants.
    ///
    /// `lookup[mode][range]` must index into `waveforms` for every mode and
    /// every temperature range; `temperatures` must be strictly ascending,
    /// with the last value being the exclusive maximum operating temperature.
    pub fn from_parts(
        frame_rate: u8,
        temperatures: Vec<Temperature>,
        waveforms: Vec<Waveform>,
        lookup: Vec<Vec<usize>>,
    ) -> Result<Self, TableError> {
        if temperatures.len() < 2 {
            return Err(TableError::NoTemperatureRanges);
        }

        if temperatures.windows(2).any(|pair| pair[0] >= pair[1]) {
            return Err(TableError::TemperaturesNotAscending);
        }

        if lookup.is_empty() {
            return Err(TableError::NoModes);
        }

        if lookup.len() > usize::from(ModeId::MAX) + 1 {
            return Err(TableError::TooManyModes(lookup.len()));
        }

        let range_count = temperatures.len() - 1;

        for (mode, row) in lookup.iter().enumerate() {
            if row.len() != range_count {
                return Err(TableError::LookupShape { mode });
            }

            for (range, &index) in row.iter().enumerate() {
                if index >= waveforms.len() {
                    return Err(TableError::LookupIndex { mode, range, index });
                }
            }
        }

        let mut table = WaveformTable {
            frame_rate,
            mode_count: lookup.len() as ModeId,
            temperatures,
            waveforms,
            lookup,
            mode_kind_by_id: Vec::new(),
            mode_id_by_kind: HashMap::new(),
        };

        table.populate_mode_kinds();
        Ok(table)
    }

    /// Look up the waveform for a mode at a given temperature.
    ///
    /// The temperature range is selected by strict upper bound: a reading
    /// equal to a threshold belongs to the range above it. A reading at or
    /// beyond the last threshold is out of the panel's operating range.
    pub fn lookup(&self, mode: ModeId, temperature: i32) -> Result<&Waveform, LookupError> {
        if mode >= self.mode_count {
            return Err(LookupError::UnknownMode {
                mode,
                mode_count: self.mode_count,
            });
        }

        let upper = self
            .temperatures
            .partition_point(|&t| i32::from(t) <= temperature);

        if upper == 0 {
            return Err(LookupError::TemperatureTooLow {
                temperature,
                minimum: self.temperatures[0],
            });
        }

        if upper == self.temperatures.len() {
            return Err(LookupError::TemperatureTooHigh {
                temperature,
                maximum: *self.temperatures.last().expect("validated non-empty"),
            });
        }

        Ok(&self.waveforms[self.lookup[usize::from(mode)][upper - 1]])
    }

    /// Display frame rate in Hz.
    pub fn frame_rate(&self) -> u8 {
        self.frame_rate
    }

    /// Number of available modes.
    pub fn mode_count(&self) -> ModeId {
        self.mode_count
    }

    /// Operating temperature thresholds.
    ///
    /// The last value is the exclusive maximum operating temperature.
    pub fn temperatures(&self) -> &[Temperature] {
        &self.temperatures
    }

    /// Kind of the given mode, if the mode exists.
    pub fn mode_kind(&self, mode: ModeId) -> Option<ModeKind> {
        self.mode_kind_by_id.get(usize::from(mode)).copied()
    }

    /// Mode id carrying the given kind, if any mode was classified as such.
    pub fn mode_id(&self, kind: ModeKind) -> Option<ModeId> {
        self.mode_id_by_kind.get(&kind).copied()
    }

    /// Scan available modes and classify them by the transitions they define.
    fn populate_mode_kinds(&mut self) {
        self.mode_kind_by_id = Vec::with_capacity(usize::from(self.mode_count));
        self.mode_id_by_kind.clear();

        for mode in 0..self.mode_count {
            let kind = match self.lookup(mode, CLASSIFY_TEMPERATURE) {
                Ok(waveform) => classify_mode_kind(waveform),
                Err(_) => ModeKind::Unknown,
            };

            if kind == ModeKind::Unknown {
                warn!("could not detect mode kind for mode #{}", mode);
            } else {
                // First mode of each kind wins
                self.mode_id_by_kind.entry(kind).or_insert(mode);
            }

            self.mode_kind_by_id.push(kind);
        }
    }
}

/// Classify a mode from a sample waveform, using heuristics on the set of
/// transitions the waveform defines.
fn classify_mode_kind(waveform: &Waveform) -> ModeKind {
    // An init waveform applies the same phase to every cell regardless of
    // the source or target intensity
    let is_init = waveform.iter().all(|matrix| {
        let reference = matrix[0][0];
        matrix.iter().all(|row| row.iter().all(|&p| p == reference))
    });

    if is_init {
        return ModeKind::Init;
    }

    // Transitions that no matrix ever drives are no-ops for this mode
    let mut no_ops = [[true; INTENSITY_VALUES]; INTENSITY_VALUES];

    for matrix in waveform {
        for from in 0..INTENSITY_VALUES {
            for to in 0..INTENSITY_VALUES {
                if matrix[from][to] != Phase::Noop {
                    no_ops[from][to] = false;
                }
            }
        }
    }

    // Regal waveforms drive these edge transitions near white
    let regalable = !no_ops[28][29]
        && !no_ops[28][31]
        && !no_ops[29][29]
        && !no_ops[29][31]
        && !no_ops[30][29]
        && !no_ops[30][31];

    let mut defined_sources = 0usize;
    let mut defined_transitions = 0usize;

    for row in &no_ops {
        let driven = row.iter().filter(|&&no_op| !no_op).count();
        if driven > 0 {
            defined_sources += 1;
            defined_transitions += driven;
        }
    }

    if defined_sources == 0 {
        return ModeKind::Unknown;
    }

    let defined_targets = defined_transitions as f64 / defined_sources as f64;

    if defined_sources >= 16 {
        if defined_targets < 2.0 {
            return ModeKind::Du;
        }

        if defined_targets < 4.0 {
            return ModeKind::Du4;
        }

        if defined_targets >= 16.0 {
            if regalable {
                return ModeKind::Glr16;
            }

            return ModeKind::Gc16;
        }
    }

    if defined_sources <= 8 && defined_targets <= 1.0 {
        return ModeKind::A2;
    }

    ModeKind::Unknown
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::phase::{uniform_matrix, Intensity};

    /// Matrix driving `from -> to` with the given phase, noop elsewhere.
    fn single_transition(from: Intensity, to: Intensity, phase: Phase) -> Waveform {
        let mut matrix = uniform_matrix(Phase::Noop);
        matrix[usize::from(from)][usize::from(to)] = phase;
        vec![matrix]
    }

    /// A waveform where every source drives the black and white targets,
    /// with self transitions left alone.
    fn du_waveform() -> Waveform {
        let mut matrix = uniform_matrix(Phase::Noop);
        for from in 0..INTENSITY_VALUES {
            if from != 0 {
                matrix[from][0] = Phase::Black;
            }
            if from != 30 {
                matrix[from][30] = Phase::White;
            }
        }
        vec![matrix]
    }

    /// A waveform driving every transition except black-to-black.
    fn dense_waveform(regal: bool) -> Waveform {
        let mut matrix = uniform_matrix(Phase::Black);
        matrix[0][0] = Phase::Noop;
        if !regal {
            // Knock out one of the probed Regal transitions
            matrix[29][31] = Phase::Noop;
        }
        vec![matrix]
    }

    fn table_with(waveform: Waveform) -> WaveformTable {
        WaveformTable::from_parts(85, vec![0, 50], vec![waveform], vec![vec![0]]).unwrap()
    }

    #[test]
    fn test_from_parts_rejects_bad_temperatures() {
        assert_eq!(
            WaveformTable::from_parts(85, vec![10], vec![], vec![vec![]]),
            Err(TableError::NoTemperatureRanges)
        );
        assert_eq!(
            WaveformTable::from_parts(85, vec![10, 10], vec![], vec![vec![0]]),
            Err(TableError::TemperaturesNotAscending)
        );
    }

    #[test]
    fn test_from_parts_rejects_bad_lookup() {
        assert_eq!(
            WaveformTable::from_parts(85, vec![0, 50], vec![Waveform::new()], vec![]),
            Err(TableError::NoModes)
        );
        assert_eq!(
            WaveformTable::from_parts(85, vec![0, 25, 50], vec![Waveform::new()], vec![vec![0]]),
            Err(TableError::LookupShape { mode: 0 })
        );
        assert_eq!(
            WaveformTable::from_parts(85, vec![0, 50], vec![Waveform::new()], vec![vec![1]]),
            Err(TableError::LookupIndex {
                mode: 0,
                range: 0,
                index: 1
            })
        );
    }

    #[test]
    fn test_lookup_temperature_ranges() {
        let wf_cold = single_transition(0, 30, Phase::White);
        let wf_warm = single_transition(30, 0, Phase::Black);
        let table = WaveformTable::from_parts(
            85,
            vec![0, 20, 50],
            vec![wf_cold.clone(), wf_warm.clone()],
            vec![vec![0, 1]],
        )
        .unwrap();

        assert_eq!(table.lookup(0, 10).unwrap(), &wf_cold);
        // Equality with a threshold selects the range above it
        assert_eq!(table.lookup(0, 20).unwrap(), &wf_warm);
        assert_eq!(table.lookup(0, 0).unwrap(), &wf_cold);
        assert_eq!(table.lookup(0, 49).unwrap(), &wf_warm);
    }

    #[test]
    fn test_lookup_out_of_range() {
        let table = table_with(du_waveform());

        assert!(matches!(
            table.lookup(0, -1),
            Err(LookupError::TemperatureTooLow { .. })
        ));
        assert!(matches!(
            table.lookup(0, 50),
            Err(LookupError::TemperatureTooHigh { .. })
        ));
        assert!(matches!(
            table.lookup(1, 20),
            Err(LookupError::UnknownMode { .. })
        ));
    }

    #[test]
    fn test_classify_init() {
        let table = table_with(vec![uniform_matrix(Phase::White)]);
        assert_eq!(table.mode_kind(0), Some(ModeKind::Init));
    }

    #[test]
    fn test_classify_du() {
        let table = table_with(du_waveform());
        assert_eq!(table.mode_kind(0), Some(ModeKind::Du));
    }

    #[test]
    fn test_classify_gc16_and_glr16() {
        assert_eq!(
            table_with(dense_waveform(false)).mode_kind(0),
            Some(ModeKind::Gc16)
        );
        assert_eq!(
            table_with(dense_waveform(true)).mode_kind(0),
            Some(ModeKind::Glr16)
        );
    }

    #[test]
    fn test_classify_a2() {
        // Two sources, one target each
        let mut matrix = uniform_matrix(Phase::Noop);
        matrix[0][30] = Phase::White;
        matrix[30][0] = Phase::Black;
        let table = table_with(vec![matrix]);
        assert_eq!(table.mode_kind(0), Some(ModeKind::A2));
    }

    #[test]
    fn test_mode_id_reverse_map_keeps_first() {
        let table = WaveformTable::from_parts(
            85,
            vec![0, 50],
            vec![du_waveform()],
            vec![vec![0], vec![0]],
        )
        .unwrap();

        assert_eq!(table.mode_kind(0), Some(ModeKind::Du));
        assert_eq!(table.mode_kind(1), Some(ModeKind::Du));
        assert_eq!(table.mode_id(ModeKind::Du), Some(0));
        assert_eq!(table.mode_id(ModeKind::Gc16), None);
    }
}
