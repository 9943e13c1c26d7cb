//! Data model for the resolved layout graph.
//!
//! These structures capture everything a notation-rendering backend needs
//! to draw the score: systems, measures, visual staves, voices of tickable
//! events, and the flat collections of beams, tuplets and connectors.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::config::FontSpec;

/// Index of a render event in [`LayoutGraph::events`]. Events are owned by
/// the graph's arena; everything else refers to them by index, so a voice,
/// a beam and a curve can all point at the same note without shared
/// ownership.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct EventIx(pub usize);

/// Stem direction of a note, either explicit or derived from the layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum StemDir {
    Up,
    Down,
}

/// Pitch of a note (lowercase pitch name plus octave).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Pitch {
    /// Pitch name: a–g
    pub name: String,
    /// Octave number (middle C = c4)
    pub octave: i32,
    /// Accidental code ("#", "b", "##", "bb", "n")
    pub accidental: Option<String>,
}

impl Pitch {
    pub fn new(name: &str, octave: i32) -> Self {
        Self {
            name: name.to_lowercase(),
            octave,
            accidental: None,
        }
    }

    /// Key equality for tie matching: same pitch name and octave,
    /// accidentals ignored.
    pub fn same_position(&self, other: &Pitch) -> bool {
        self.name == other.name && self.octave == other.octave
    }
}

/// The closed set of tickable event kinds a layer can produce.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum EventKind {
    Note { pitch: Pitch },
    Chord { pitches: Vec<Pitch> },
    Rest,
    /// Whole-measure rest; its duration is the measure's nominal length.
    MeasureRest,
    /// Invisible spacer occupying time but drawing nothing.
    Space,
}

/// Vertical placement of an annotation relative to the stave.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Placement {
    Above,
    Below,
}

/// A modifier attached to a single render event.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum EventModifier {
    /// A mid-measure clef change displayed before this event.
    ClefChange { clef: String },
    Fermata { above: bool },
    Ornament {
        upper_accidental: Option<String>,
        lower_accidental: Option<String>,
    },
    /// Grace notes/chords preceding this event, in document order.
    GraceGroup { events: Vec<EventIx> },
    /// A text annotation (directive, dynamic or syllable).
    Text {
        text: String,
        font: FontSpec,
        placement: Placement,
        /// Horizontal shift in staff-space units.
        x_shift: f64,
    },
}

/// One tickable render event (note, chord, rest, multi-rest or space).
///
/// Created exactly once when its source element is walked; immutable
/// afterwards except for modifier attachment and the x position assigned
/// during justification.
#[derive(Debug, Clone, Serialize)]
pub struct RenderEvent {
    pub kind: EventKind,
    /// Duration in ticks (see [`crate::tables::RESOLUTION`]).
    pub ticks: u32,
    pub dots: u8,
    pub stem_dir: Option<StemDir>,
    /// Staff line per pitch (one entry for single notes and rests).
    pub lines: Vec<f64>,
    pub stave_n: i32,
    pub grace: bool,
    /// Whether the event can participate in a beam group.
    pub beamable: bool,
    pub modifiers: Vec<EventModifier>,
    /// X offset within the measure's note area, assigned by justification.
    pub x: f64,
}

impl RenderEvent {
    /// Whether the event carries a stem (anything shorter than a whole note).
    pub fn has_stem(&self) -> bool {
        !matches!(
            self.kind,
            EventKind::Rest | EventKind::MeasureRest | EventKind::Space
        ) && self.ticks < crate::tables::RESOLUTION
    }

    /// The staff line used for layout queries (first pitch, or the rest line).
    pub fn line(&self) -> f64 {
        self.lines.first().copied().unwrap_or(3.0)
    }
}

// ─── Connectors ──────────────────────────────────────────────────────

/// Direction a curve bends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CurveDir {
    Above,
    Below,
}

/// Anchor position of a curve endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CurvePosition {
    NearHead,
    NearTop,
}

/// A tie or slur connector. A resolved connector has both endpoints; a
/// cross-system span is emitted as two partial connectors, each with one
/// endpoint, so the backend can draw the curve running off the stave.
#[derive(Debug, Clone, Serialize)]
pub struct Curve {
    pub start: Option<EventIx>,
    pub end: Option<EventIx>,
    /// Pitch indices within a chord the curve attaches to.
    pub start_indices: Vec<usize>,
    pub end_indices: Vec<usize>,
    pub direction: Option<CurveDir>,
    pub position: Option<CurvePosition>,
    pub position_end: Option<CurvePosition>,
    pub invert: bool,
    pub y_shift_start: Option<f64>,
    pub y_shift_end: Option<f64>,
}

impl Curve {
    pub fn new(start: Option<EventIx>, end: Option<EventIx>) -> Self {
        Self {
            start,
            end,
            start_indices: Vec::new(),
            end_indices: Vec::new(),
            direction: None,
            position: None,
            position_end: None,
            invert: false,
            y_shift_start: None,
            y_shift_end: None,
        }
    }
}

/// Crescendo or diminuendo wedge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum HairpinKind {
    Crescendo,
    Diminuendo,
}

#[derive(Debug, Clone, Serialize)]
pub struct Hairpin {
    pub kind: HairpinKind,
    pub start: EventIx,
    pub end: EventIx,
    pub place: Option<Placement>,
}

/// A beam group over consecutive beamable events.
#[derive(Debug, Clone, Serialize)]
pub struct Beam {
    pub events: Vec<EventIx>,
    /// Whether the backend should stem the group automatically (no layer
    /// direction and no explicit stem direction inside the beam).
    pub auto_stem: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct Tuplet {
    pub events: Vec<EventIx>,
    pub num_notes: u32,
    pub beats_occupied: u32,
    pub ratioed: bool,
    pub bracketed: bool,
    /// 1 = above, -1 = below, None = backend default.
    pub location: Option<i32>,
}

// ─── Staves, measures, systems ───────────────────────────────────────

/// Meter in effect on a stave.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Meter {
    pub count: u32,
    pub unit: u32,
}

impl Default for Meter {
    fn default() -> Self {
        Self { count: 4, unit: 4 }
    }
}

/// A volta bracket (1st/2nd ending) on a stave.
#[derive(Debug, Clone, Serialize)]
pub struct Volta {
    pub number: Option<String>,
    pub start: bool,
    pub end: bool,
}

/// A displayed key signature, x-aligned across the measure's staves.
#[derive(Debug, Clone, Serialize)]
pub struct KeySigDisplay {
    /// Canonical major-key spec, e.g. "Bb".
    pub spec: String,
    pub fifths: i32,
    /// X offset from the stave start (uniform across the measure).
    pub x: f64,
}

/// A displayed time signature, x-aligned across the measure's staves.
#[derive(Debug, Clone, Serialize)]
pub struct TimeSigDisplay {
    pub meter: Meter,
    pub x: f64,
}

/// The visual stave object for one stave number in one measure.
#[derive(Debug, Clone, Serialize)]
pub struct VisualStave {
    pub stave_n: i32,
    pub y: f64,
    /// Clef displayed at the stave start, if any.
    pub clef: Option<String>,
    /// Clef displayed at the stave end (upcoming clef change).
    pub end_clef: Option<String>,
    pub key_signature: Option<KeySigDisplay>,
    pub time_signature: Option<TimeSigDisplay>,
    pub volta: Option<Volta>,
    pub left_barline: Option<String>,
    pub right_barline: Option<String>,
    /// Where the note area begins, after all start modifiers.
    pub note_start_x: f64,
    pub width: f64,
}

/// An ordered sequence of tickables for one (stave, layer) pair.
/// Voices are non-strict: a total duration that does not match the
/// nominal measure length is tolerated.
#[derive(Debug, Clone, Serialize)]
pub struct Voice {
    pub stave_n: i32,
    pub layer_n: i32,
    pub meter: Meter,
    pub events: Vec<EventIx>,
}

/// A tempo marking collected from a measure.
#[derive(Debug, Clone, Serialize)]
pub struct TempoMark {
    pub text: Option<String>,
    pub bpm: Option<f64>,
    pub font: FontSpec,
}

/// One measure of the layout graph.
#[derive(Debug, Clone, Serialize)]
pub struct MeasureLayout {
    /// Document-order measure index (zero-based, global).
    pub index: usize,
    /// Visual staves by stave number.
    pub staves: BTreeMap<i32, VisualStave>,
    pub voices: Vec<Voice>,
    pub tempo_marks: Vec<TempoMark>,
    pub rehearsal_marks: Vec<String>,
    /// Minimum width the measure's voices require.
    pub min_width: f64,
    pub x: f64,
    pub width: f64,
}

/// One system (line) of music.
#[derive(Debug, Clone, Serialize)]
pub struct System {
    pub index: usize,
    pub x: f64,
    pub y: f64,
    pub width: f64,
    /// Y coordinate per stave number.
    pub stave_ys: BTreeMap<i32, f64>,
    /// Label per stave number (empty map when labels are disabled).
    pub labels: BTreeMap<i32, String>,
    pub measures: Vec<MeasureLayout>,
}

/// The complete conversion result: the layout graph consumed by a
/// rendering backend.
#[derive(Debug, Clone, Serialize)]
pub struct LayoutGraph {
    pub systems: Vec<System>,
    /// Arena of all render events, in creation order.
    pub events: Vec<RenderEvent>,
    pub beams: Vec<Beam>,
    pub tuplets: Vec<Tuplet>,
    pub ties: Vec<Curve>,
    pub slurs: Vec<Curve>,
    pub hairpins: Vec<Hairpin>,
}

impl LayoutGraph {
    /// Total number of measures across all systems.
    pub fn measure_count(&self) -> usize {
        self.systems.iter().map(|s| s.measures.len()).sum()
    }

    /// Total number of voices across all measures.
    pub fn voice_count(&self) -> usize {
        self.systems
            .iter()
            .flat_map(|s| s.measures.iter())
            .map(|m| m.voices.len())
            .sum()
    }
}
