//! The document walker.
//!
//! Traverses an MEI score once in document order, building systems,
//! measures, staves and voices, registering every identified event, and
//! feeding the annotation collections. A finalization pass then resolves
//! all spanning annotations against the completed registry, and a
//! formatting pass distributes measure widths and justifies the voices.

mod hairpins;
mod links;
mod pointers;
mod registry;
mod slurs;
mod staves;
mod ties;
mod voices;

use std::collections::{BTreeMap, HashMap};

use log::{debug, error, info, warn};
use roxmltree::Node;

use crate::config::{BreakPolicy, Config, LabelMode, PrintSpace};
use crate::error::ConvertError;
use crate::model::{
    Beam, EventIx, EventKind, EventModifier, LayoutGraph, MeasureLayout, Pitch, Placement,
    RenderEvent, StemDir, System, TempoMark, Tuplet, Volta, VisualStave, KeySigDisplay,
    TimeSigDisplay, Voice,
};
use crate::tables::{self, RESOLUTION};

use hairpins::Hairpins;
use links::{
    event_at_tstamp, DeferredTable, EventLink, LinkParams, LocationKey, PendingKind, PendingRef,
};
use pointers::{PointerCollection, PointerKind, PointerModel};
use registry::{EventRecord, EventRegistry};
use slurs::{parse_slur_tokens, Slurs};
use staves::ScoreContext;
use ties::Ties;

// ─── Stave modifier metrics ──────────────────────────────────────────

const CLEF_WIDTH: f64 = 32.0;
/// Gap between the widest clef and the key signature column.
const KEY_GAP: f64 = 10.0;
/// Gap between the widest key signature and the time signature column.
const TIME_GAP: f64 = 15.0;
const KEY_ACCIDENTAL_WIDTH: f64 = 10.0;
const TIME_SIG_WIDTH: f64 = 18.0;
/// Padding between the last start modifier and the note area, and between
/// the note area and the right barline.
const NOTE_AREA_PAD: f64 = 12.0;

/// Prints the start tag of an element for log and error messages.
pub(crate) fn serialize_element(node: &Node) -> String {
    let mut out = format!("<{}", node.tag_name().name());
    for attr in node.attributes() {
        out.push_str(&format!(" {}=\"{}\"", attr.name(), attr.value()));
    }
    out.push('>');
    out
}

fn strip_ref(value: Option<&str>) -> Option<String> {
    value.map(|v| v.trim_start_matches('#').to_string())
}

/// Parses a time-position range end: either "Xm+Y" (X measures ahead,
/// beat Y) or a plain beat in the current measure.
fn parse_tstamp2(value: &str) -> Option<(usize, f64)> {
    match value.split_once("m+") {
        Some((measures, beat)) => Some((measures.parse().ok()?, beat.parse().ok()?)),
        None => Some((0, value.parse().ok()?)),
    }
}

fn collect_text(node: &Node) -> Option<String> {
    let mut raw = String::new();
    for descendant in node.descendants() {
        if descendant.is_text() {
            raw.push_str(descendant.text().unwrap_or(""));
        }
    }
    let text = raw.split_whitespace().collect::<Vec<_>>().join(" ");
    (!text.is_empty()).then_some(text)
}

fn read_placement(node: &Node) -> Option<Placement> {
    match node.attribute("place") {
        Some("above") => Some(Placement::Above),
        Some("below") => Some(Placement::Below),
        _ => None,
    }
}

// ─── Element classification ──────────────────────────────────────────

/// The closed set of elements a section (or ending) may contain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SectionChildKind {
    Measure,
    ScoreDef,
    StaffDef,
    SystemBreak,
    PageBreak,
    Ending,
    Section,
    Unsupported,
}

impl SectionChildKind {
    fn classify(tag: &str) -> Self {
        match tag {
            "measure" => Self::Measure,
            "scoreDef" => Self::ScoreDef,
            "staffDef" => Self::StaffDef,
            "sb" => Self::SystemBreak,
            "pb" => Self::PageBreak,
            "ending" => Self::Ending,
            "section" => Self::Section,
            _ => Self::Unsupported,
        }
    }
}

/// The closed set of note-like elements a layer may contain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NoteLikeKind {
    Note,
    Chord,
    Rest,
    MeasureRest,
    Space,
    Beam,
    Tuplet,
    Clef,
    BowedTremolo,
    Unsupported,
}

impl NoteLikeKind {
    fn classify(tag: &str) -> Self {
        match tag {
            "note" => Self::Note,
            "chord" => Self::Chord,
            "rest" => Self::Rest,
            "mRest" => Self::MeasureRest,
            "space" => Self::Space,
            "beam" => Self::Beam,
            "tuplet" => Self::Tuplet,
            "clef" => Self::Clef,
            "bTrem" => Self::BowedTremolo,
            _ => Self::Unsupported,
        }
    }
}

// ─── Walk state ──────────────────────────────────────────────────────

/// Volta bracket state while walking an ending element.
#[derive(Debug)]
struct VoltaState {
    number: Option<String>,
    first_done: bool,
    end: bool,
}

/// Per-staff processing context, shared by all layers of one staff
/// element.
struct LayerContext {
    stave_n: i32,
    system: usize,
    layer_dir: Option<StemDir>,
    /// Number of beams the current events are nested under.
    in_beam_no: u32,
    /// Whether a stem direction has been set inside the current beam.
    has_stem_dir_in_beam: bool,
    /// Grace events waiting to be attached to the next non-grace event.
    grace_queue: Vec<EventIx>,
    /// A mid-measure clef change waiting for its next note-like event.
    pending_clef: Option<String>,
    /// Ids of the events created in this staff, for onset bookkeeping.
    ids: Vec<(EventIx, String)>,
}

pub(crate) struct Converter {
    cfg: Config,
    print_space: PrintSpace,
    score_ctx: ScoreContext,

    events: Vec<RenderEvent>,
    registry: EventRegistry,
    systems: Vec<System>,
    beams: Vec<Beam>,
    tuplets: Vec<Tuplet>,

    ties: Ties,
    slurs: Slurs,
    hairpins: Hairpins,
    directives: PointerCollection,
    dynamics: PointerCollection,
    fermatas: PointerCollection,
    trills: PointerCollection,

    deferred: DeferredTable,
    /// Beat-position onsets per walked location, for time-position
    /// references.
    onsets: HashMap<LocationKey, Vec<(f64, String)>>,

    pending_system_break: bool,
    pending_section_break: bool,
    current_volta: Option<VoltaState>,
    measure_count: usize,
    generated_ids: usize,
}

impl Converter {
    pub fn new(cfg: Config) -> Self {
        let print_space = PrintSpace::from_config(&cfg);
        let annot_font = cfg.annot_font.clone();
        let dynam_font = cfg.dynam_font.clone();
        Self {
            cfg,
            print_space,
            score_ctx: ScoreContext::default(),
            events: Vec::new(),
            registry: EventRegistry::default(),
            systems: Vec::new(),
            beams: Vec::new(),
            tuplets: Vec::new(),
            ties: Ties::default(),
            slurs: Slurs::default(),
            hairpins: Hairpins::default(),
            directives: PointerCollection::new(PointerKind::Directive, annot_font.clone()),
            dynamics: PointerCollection::new(PointerKind::Dynamic, dynam_font),
            fermatas: PointerCollection::new(PointerKind::Fermata, annot_font.clone()),
            trills: PointerCollection::new(PointerKind::Ornament, annot_font),
            deferred: DeferredTable::default(),
            onsets: HashMap::new(),
            pending_system_break: false,
            // the first measure always starts a fresh system
            pending_section_break: true,
            current_volta: None,
            measure_count: 0,
            generated_ids: 0,
        }
    }

    /// Converts a document rooted at (or containing) a score element.
    pub fn run(mut self, root: Node) -> Result<LayoutGraph, ConvertError> {
        let score = if root.tag_name().name() == "score" {
            root
        } else {
            root.descendants()
                .find(|n| n.is_element() && n.tag_name().name() == "score")
                .ok_or(ConvertError::NoScore)?
        };

        for child in score.children().filter(|n| n.is_element()) {
            self.process_score_child(&child)?;
        }
        debug!(
            "walked {} measures, {} identified events",
            self.measure_count,
            self.registry.len()
        );

        self.directives.finalize(&self.registry, &mut self.events);
        self.dynamics.finalize(&self.registry, &mut self.events);
        self.fermatas.finalize(&self.registry, &mut self.events);
        self.trills.finalize(&self.registry, &mut self.events);
        let ties = self.ties.finalize(&self.registry);
        let slurs = self.slurs.finalize(&self.registry, &self.events);
        let hairpins = self.hairpins.finalize(&self.registry);

        self.format_systems();

        Ok(LayoutGraph {
            systems: self.systems,
            events: self.events,
            beams: self.beams,
            tuplets: self.tuplets,
            ties,
            slurs,
            hairpins,
        })
    }

    // ─── Score and section traversal ─────────────────────────────────

    fn process_score_child(&mut self, element: &Node) -> Result<(), ConvertError> {
        match SectionChildKind::classify(element.tag_name().name()) {
            SectionChildKind::ScoreDef => self.score_ctx.process_score_def(element),
            SectionChildKind::StaffDef => self.score_ctx.process_staff_def(element),
            SectionChildKind::PageBreak => {
                self.on_page_break();
                Ok(())
            }
            SectionChildKind::Ending => self.process_ending(element),
            SectionChildKind::Section => self.process_section(element),
            _ => {
                info!(
                    "Element {} is not supported in <score>. Ignoring element.",
                    serialize_element(element)
                );
                Ok(())
            }
        }
    }

    fn process_section(&mut self, element: &Node) -> Result<(), ConvertError> {
        for child in element.children().filter(|n| n.is_element()) {
            self.process_section_child(&child)?;
        }
        Ok(())
    }

    fn process_section_child(&mut self, element: &Node) -> Result<(), ConvertError> {
        match SectionChildKind::classify(element.tag_name().name()) {
            SectionChildKind::Measure => self.process_measure(element),
            SectionChildKind::ScoreDef => self.score_ctx.process_score_def(element),
            SectionChildKind::StaffDef => self.score_ctx.process_staff_def(element),
            SectionChildKind::SystemBreak => {
                self.on_system_break();
                Ok(())
            }
            SectionChildKind::PageBreak => {
                self.on_page_break();
                Ok(())
            }
            SectionChildKind::Ending => self.process_ending(element),
            SectionChildKind::Section => self.process_section(element),
            SectionChildKind::Unsupported => {
                info!(
                    "Element {} is not supported in <section>. Ignoring element.",
                    serialize_element(element)
                );
                Ok(())
            }
        }
    }

    /// Walks an ending element, attaching a volta bracket to each measure
    /// in it: the first measure opens the bracket, the last one closes it.
    fn process_ending(&mut self, element: &Node) -> Result<(), ConvertError> {
        let children: Vec<Node> = element.children().filter(|n| n.is_element()).collect();
        self.current_volta = Some(VoltaState {
            number: element.attribute("n").map(String::from),
            first_done: false,
            end: false,
        });
        let count = children.len();
        for (i, child) in children.iter().enumerate() {
            if i + 1 == count {
                if let Some(volta) = &mut self.current_volta {
                    volta.end = true;
                }
            }
            self.process_section_child(child)?;
        }
        self.current_volta = None;
        Ok(())
    }

    fn on_system_break(&mut self) {
        match self.cfg.on_system_break {
            BreakPolicy::Ignore => {}
            BreakPolicy::SystemBreak => self.pending_system_break = true,
            BreakPolicy::PageBreak => info!("Page breaks are not implemented."),
        }
    }

    fn on_page_break(&mut self) {
        match self.cfg.on_page_break {
            BreakPolicy::Ignore => {}
            BreakPolicy::SystemBreak => self.pending_system_break = true,
            BreakPolicy::PageBreak => info!("Page breaks are not implemented."),
        }
    }

    // ─── Systems ─────────────────────────────────────────────────────

    fn create_new_system(&mut self) {
        debug!("creating system {}", self.systems.len());
        self.pending_system_break = false;

        let index = self.systems.len();
        let y = if index == 0 {
            self.print_space.top
        } else {
            self.score_ctx.lowest_y + self.cfg.system_spacing
        };
        let stave_ys = self.score_ctx.stave_ys(y, self.cfg.stave_spacing);
        self.score_ctx.lowest_y =
            stave_ys.values().copied().fold(y, f64::max) + staves::STAVE_HEIGHT;

        let labels = self.stave_labels();

        if self.pending_section_break {
            self.pending_section_break = false;
            self.score_ctx.force_section_start_infos();
        } else {
            self.score_ctx.force_stave_start_infos();
        }

        self.systems.push(System {
            index,
            x: self.print_space.left,
            y,
            width: self.print_space.width,
            stave_ys,
            labels,
            measures: Vec::new(),
        });
    }

    fn stave_labels(&self) -> BTreeMap<i32, String> {
        let mut labels = BTreeMap::new();
        if self.cfg.label_mode == LabelMode::None {
            return labels;
        }
        let use_full =
            self.cfg.label_mode == LabelMode::FullThenAbbreviated && self.systems.is_empty();
        for (&stave_n, info) in self.score_ctx.all_staves() {
            let label = if use_full {
                info.label.as_ref()
            } else {
                info.label_abbr.as_ref()
            };
            if let Some(label) = label {
                labels.insert(stave_n, label.clone());
            }
        }
        labels
    }

    // ─── Measures ────────────────────────────────────────────────────

    fn process_measure(&mut self, element: &Node) -> Result<(), ConvertError> {
        let at_system_start = self.pending_section_break || self.pending_system_break;
        if at_system_start {
            self.create_new_system();
        }

        debug!("processing measure {}", self.measure_count);

        let left_barline = element.attribute("left").map(String::from);
        let right_barline = element.attribute("right").map(String::from);

        // single classification pass over all measure descendants
        let mut stave_els = Vec::new();
        let mut dir_els = Vec::new();
        let mut tie_els = Vec::new();
        let mut slur_els = Vec::new();
        let mut hairpin_els = Vec::new();
        let mut tempo_els = Vec::new();
        let mut dynam_els = Vec::new();
        let mut fermata_els = Vec::new();
        let mut trill_els = Vec::new();
        let mut reh_els = Vec::new();
        for descendant in element.descendants().filter(|n| n.is_element()) {
            match descendant.tag_name().name() {
                "staff" => stave_els.push(descendant),
                "dir" => dir_els.push(descendant),
                "tie" => tie_els.push(descendant),
                "slur" => slur_els.push(descendant),
                "hairpin" => hairpin_els.push(descendant),
                "tempo" => tempo_els.push(descendant),
                "dynam" => dynam_els.push(descendant),
                "fermata" => fermata_els.push(descendant),
                "trill" => trill_els.push(descendant),
                "reh" => reh_els.push(descendant),
                _ => {}
            }
        }

        let measure_index = self.measure_count;
        self.measure_count += 1;

        let (mut measure_staves, end_clefs) = self.initialize_staves(
            &stave_els,
            left_barline,
            right_barline,
            at_system_start,
        )?;

        // a clef redisplayed mid-system is shown at the end of the
        // preceding measure instead of the start of this one
        if !end_clefs.is_empty() {
            if let Some(previous) = self
                .systems
                .last_mut()
                .and_then(|s| s.measures.last_mut())
            {
                for (stave_n, clef) in end_clefs {
                    if let Some(stave) = previous.staves.get_mut(&stave_n) {
                        stave.end_clef = Some(clef);
                    }
                }
            }
        }

        let mut measure_voices = Vec::new();
        for stave_el in &stave_els {
            self.process_stave_events(
                &mut measure_staves,
                stave_el,
                measure_index,
                &mut measure_voices,
            )?;
        }

        for el in &dir_els {
            if let Some(model) = self.pointer_model(el, measure_index) {
                self.directives.add(model);
            }
        }
        for el in &dynam_els {
            if let Some(model) = self.pointer_model(el, measure_index) {
                self.dynamics.add(model);
            }
        }
        for el in &fermata_els {
            if let Some(model) = self.pointer_model(el, measure_index) {
                self.fermatas.add(model);
            }
        }
        for el in &trill_els {
            if let Some(model) = self.pointer_model(el, measure_index) {
                self.trills.add(model);
            }
        }
        self.create_span_infos(&tie_els, measure_index, PendingKind::Tie);
        self.create_span_infos(&slur_els, measure_index, PendingKind::Slur);
        self.create_span_infos(&hairpin_els, measure_index, PendingKind::Hairpin);

        let tempo_marks = tempo_els
            .iter()
            .map(|el| TempoMark {
                text: collect_text(el),
                bpm: el.attribute("mm").and_then(|v| v.parse().ok()),
                font: self.cfg.tempo_font.clone(),
            })
            .collect();
        let rehearsal_marks = reh_els.iter().filter_map(collect_text).collect();

        let note_start_x = measure_staves
            .values()
            .map(|s| s.note_start_x)
            .fold(0.0, f64::max);
        let min_width = note_start_x
            + voices::pre_calculate_min_width(&measure_voices, &self.events)
            + NOTE_AREA_PAD;

        if let Some(system) = self.systems.last_mut() {
            system.measures.push(MeasureLayout {
                index: measure_index,
                staves: measure_staves,
                voices: measure_voices,
                tempo_marks,
                rehearsal_marks,
                min_width,
                x: 0.0,
                width: 0.0,
            });
        }
        Ok(())
    }

    /// Builds the visual stave objects of a measure in three runs: clefs
    /// first, then key signatures x-aligned at the widest clef, then time
    /// signatures x-aligned at the widest key signature. Returns the
    /// staves plus any end-of-measure clefs for the preceding measure.
    fn initialize_staves(
        &mut self,
        stave_els: &[Node],
        left_barline: Option<String>,
        right_barline: Option<String>,
        at_system_start: bool,
    ) -> Result<(BTreeMap<i32, VisualStave>, Vec<(i32, String)>), ConvertError> {
        let mut measure_staves: BTreeMap<i32, VisualStave> = BTreeMap::new();
        let mut end_clefs: Vec<(i32, String)> = Vec::new();
        let mut clef_offsets: BTreeMap<i32, f64> = BTreeMap::new();
        let mut max_clef_offset = 0.0f64;

        let preceding_staves: Vec<i32> = if at_system_start {
            Vec::new()
        } else {
            self.systems
                .last()
                .and_then(|s| s.measures.last())
                .map(|m| m.staves.keys().copied().collect())
                .unwrap_or_default()
        };
        let stave_ys = self
            .systems
            .last()
            .map(|s| s.stave_ys.clone())
            .unwrap_or_default();

        // first run: voltas and clefs
        let mut is_first = true;
        for stave_el in stave_els {
            let stave_n = stave_el
                .attribute("n")
                .and_then(|v| v.parse::<i32>().ok())
                .ok_or_else(|| ConvertError::InvalidStaveNumber {
                    element: serialize_element(stave_el),
                })?;
            let Some(info) = self.score_ctx.stave(stave_n) else {
                return Err(ConvertError::UnknownStave {
                    element: serialize_element(stave_el),
                    stave_n,
                });
            };

            let mut stave = VisualStave {
                stave_n,
                y: stave_ys.get(&stave_n).copied().unwrap_or(0.0),
                clef: None,
                end_clef: None,
                key_signature: None,
                time_signature: None,
                volta: None,
                left_barline: left_barline.clone(),
                right_barline: right_barline.clone(),
                note_start_x: 0.0,
                width: 0.0,
            };

            if is_first {
                if let Some(state) = &mut self.current_volta {
                    stave.volta = Some(Volta {
                        number: state.number.clone(),
                        start: !state.first_done,
                        end: state.end,
                    });
                    state.first_done = true;
                }
            }
            is_first = false;

            let clef_offset = if preceding_staves.contains(&stave_n) {
                if info.show_clef_check() {
                    end_clefs.push((stave_n, info.clef().to_string()));
                }
                0.0
            } else if info.show_clef_check() {
                stave.clef = Some(info.clef().to_string());
                CLEF_WIDTH
            } else {
                0.0
            };
            clef_offsets.insert(stave_n, clef_offset);
            max_clef_offset = max_clef_offset.max(clef_offset);
            measure_staves.insert(stave_n, stave);
        }

        // second run: key signatures
        let mut key_ends: BTreeMap<i32, f64> = BTreeMap::new();
        let mut max_key_end = max_clef_offset;
        for (&stave_n, stave) in measure_staves.iter_mut() {
            let mut key_end = clef_offsets.get(&stave_n).copied().unwrap_or(0.0);
            if let Some(info) = self.score_ctx.stave(stave_n) {
                if let Some(fifths) = info.show_key_check() {
                    let x = max_clef_offset + KEY_GAP;
                    stave.key_signature = Some(KeySigDisplay {
                        spec: tables::key_spec(fifths).to_string(),
                        fifths,
                        x,
                    });
                    key_end = x + fifths.unsigned_abs() as f64 * KEY_ACCIDENTAL_WIDTH;
                }
            }
            key_ends.insert(stave_n, key_end);
            max_key_end = max_key_end.max(key_end);
        }

        // third run: time signatures
        let mut note_start_x = 0.0f64;
        for (&stave_n, stave) in measure_staves.iter_mut() {
            let mut extent = key_ends.get(&stave_n).copied().unwrap_or(0.0);
            if let Some(info) = self.score_ctx.stave(stave_n) {
                if let Some(meter) = info.show_time_check() {
                    let x = max_key_end + TIME_GAP;
                    stave.time_signature = Some(TimeSigDisplay { meter, x });
                    extent = x + TIME_SIG_WIDTH;
                }
            }
            note_start_x = note_start_x.max(extent);
        }
        note_start_x += NOTE_AREA_PAD;
        for stave in measure_staves.values_mut() {
            stave.note_start_x = note_start_x;
        }

        Ok((measure_staves, end_clefs))
    }

    // ─── Stave and layer events ──────────────────────────────────────

    fn process_stave_events(
        &mut self,
        measure_staves: &mut BTreeMap<i32, VisualStave>,
        stave_el: &Node,
        measure_index: usize,
        measure_voices: &mut Vec<Voice>,
    ) -> Result<(), ConvertError> {
        let stave_n = stave_el
            .attribute("n")
            .and_then(|v| v.parse::<i32>().ok())
            .unwrap_or(1);
        let meter = self
            .score_ctx
            .stave_ref(stave_n)
            .map(|info| info.meter())
            .unwrap_or_default();

        let layer_els: Vec<Node> = stave_el
            .descendants()
            .filter(|n| n.is_element() && n.tag_name().name() == "layer")
            .collect();
        let layer_count = layer_els.len();

        let mut lctx = LayerContext {
            stave_n,
            system: self.systems.len().saturating_sub(1),
            layer_dir: None,
            in_beam_no: 0,
            has_stem_dir_in_beam: false,
            grace_queue: Vec::new(),
            pending_clef: None,
            ids: Vec::new(),
        };

        for (i, layer_el) in layer_els.iter().enumerate() {
            lctx.layer_dir = if layer_count > 1 {
                if i == 0 {
                    Some(StemDir::Up)
                } else if i == layer_count - 1 {
                    Some(StemDir::Down)
                } else {
                    None
                }
            } else {
                None
            };

            let events = self.process_note_like_children(&mut lctx, layer_el)?;

            let layer_n = layer_el
                .attribute("n")
                .and_then(|v| v.parse::<i32>().ok())
                .unwrap_or(1);
            let id_of: HashMap<usize, &String> =
                lctx.ids.iter().map(|(ix, id)| (ix.0, id)).collect();
            let ticks_per_beat = (RESOLUTION / meter.unit) as f64;
            let mut onsets = Vec::new();
            let mut t = 0u32;
            for &ix in &events {
                if let Some(id) = id_of.get(&ix.0) {
                    onsets.push((1.0 + t as f64 / ticks_per_beat, (*id).clone()));
                }
                t += self.events[ix.0].ticks;
            }

            let key = LocationKey {
                measure: measure_index,
                stave: stave_n,
                layer: layer_n,
            };
            self.resolve_deferred(&key, &onsets);
            self.onsets.insert(key, onsets);

            measure_voices.push(Voice {
                stave_n,
                layer_n,
                meter,
                events,
            });
        }

        // a clef change not attached to any following event is displayed
        // at the end of the stave
        if let Some(clef) = lctx.pending_clef.take() {
            if let Some(stave) = measure_staves.get_mut(&stave_n) {
                stave.end_clef = Some(clef);
            }
        }
        Ok(())
    }

    fn resolve_deferred(&mut self, key: &LocationKey, onsets: &[(f64, String)]) {
        for pending in self.deferred.take(key) {
            match event_at_tstamp(onsets, pending.tstamp) {
                Some(id) => {
                    let id = id.to_string();
                    match pending.kind {
                        PendingKind::Tie => self.ties.set_end(pending.link, id),
                        PendingKind::Slur => self.slurs.set_end(pending.link, id),
                        PendingKind::Hairpin => self.hairpins.set_end(pending.link, id),
                    }
                }
                None => warn!(
                    "Could not find an event at beat {} in measure {}, stave {}, \
                     layer {}. Dropping reference.",
                    pending.tstamp, key.measure, key.stave, key.layer
                ),
            }
        }
    }

    fn process_note_like_children(
        &mut self,
        lctx: &mut LayerContext,
        element: &Node,
    ) -> Result<Vec<EventIx>, ConvertError> {
        let mut events = Vec::new();
        for child in element.children().filter(|n| n.is_element()) {
            match NoteLikeKind::classify(child.tag_name().name()) {
                NoteLikeKind::Note => {
                    if let Some(ix) = self.process_note(lctx, &child)? {
                        events.push(ix);
                    }
                }
                NoteLikeKind::Chord => {
                    if let Some(ix) = self.process_chord(lctx, &child)? {
                        events.push(ix);
                    }
                }
                NoteLikeKind::Rest => events.push(self.process_rest(lctx, &child)),
                NoteLikeKind::MeasureRest => events.push(self.process_mrest(lctx, &child)),
                NoteLikeKind::Space => {
                    if let Some(ix) = self.process_space(lctx, &child) {
                        events.push(ix);
                    }
                }
                NoteLikeKind::Beam => events.extend(self.process_beam(lctx, &child)?),
                NoteLikeKind::Tuplet => events.extend(self.process_tuplet(lctx, &child)?),
                NoteLikeKind::Clef => self.process_clef(lctx, &child),
                NoteLikeKind::BowedTremolo => {
                    info!("Element <bTrem> not implemented. Processing child nodes.");
                    events.extend(self.process_note_like_children(lctx, &child)?);
                }
                NoteLikeKind::Unsupported => info!(
                    "Element \"{}\" is not supported. Ignoring element.",
                    child.tag_name().name()
                ),
            }
        }
        Ok(events)
    }

    fn process_note(
        &mut self,
        lctx: &mut LayerContext,
        element: &Node,
    ) -> Result<Option<EventIx>, ConvertError> {
        let xml_id = self.xml_id(element);
        let clef = self.current_clef(lctx.stave_n);

        let mut pitch = read_pitch(element);
        apply_accidental(&mut pitch, element);
        let line = tables::staff_line(&pitch.name, pitch.octave, &clef);

        let (base_ticks, dots) = self.read_duration(element);
        let grace = element.has_attribute("grace");

        let explicit_stem = read_stem_dir(element);
        if explicit_stem.is_some() && lctx.in_beam_no > 0 {
            lctx.has_stem_dir_in_beam = true;
        }
        let stem_dir = explicit_stem
            .or(lctx.layer_dir)
            .or(Some(auto_stem_dir(line)));

        let mut modifiers = Vec::new();
        for syl in element
            .descendants()
            .filter(|n| n.is_element() && n.tag_name().name() == "syl")
        {
            if let Some(text) = collect_text(&syl) {
                modifiers.push(EventModifier::Text {
                    text,
                    font: self.cfg.lyrics_font.clone(),
                    placement: Placement::Below,
                    x_shift: 0.0,
                });
            }
        }
        if self.cfg.render_fermata_attributes {
            if let Some(fermata) = element.attribute("fermata") {
                modifiers.push(EventModifier::Fermata {
                    above: fermata != "below",
                });
            }
        }
        if let Some(clef_change) = lctx.pending_clef.take() {
            modifiers.push(EventModifier::ClefChange { clef: clef_change });
        }

        let ix = self.push_event(RenderEvent {
            kind: EventKind::Note {
                pitch: pitch.clone(),
            },
            ticks: tables::dotted_ticks(base_ticks, dots),
            dots,
            stem_dir,
            lines: vec![line],
            stave_n: lctx.stave_n,
            grace,
            beamable: !grace && base_ticks <= RESOLUTION / 8,
            modifiers,
            x: 0.0,
        });

        if let Some(tie) = element.attribute("tie") {
            self.process_attr_tie(tie, &xml_id, &pitch, lctx.stave_n);
        }
        if let Some(slur) = element.attribute("slur") {
            self.process_slur_attribute(slur, &xml_id)?;
        }

        self.registry.insert(
            xml_id.clone(),
            EventRecord {
                event: ix,
                system: lctx.system,
                layer_dir: lctx.layer_dir,
                chord_indices: vec![],
            },
        );
        lctx.ids.push((ix, xml_id));

        if grace {
            lctx.grace_queue.push(ix);
            Ok(None)
        } else {
            self.attach_grace_queue(lctx, ix);
            Ok(Some(ix))
        }
    }

    fn process_chord(
        &mut self,
        lctx: &mut LayerContext,
        element: &Node,
    ) -> Result<Option<EventIx>, ConvertError> {
        let note_els: Vec<Node> = element
            .descendants()
            .filter(|n| n.is_element() && n.tag_name().name() == "note")
            .collect();
        let xml_id = self.xml_id(element);
        let clef = self.current_clef(lctx.stave_n);

        // chords may carry the duration themselves or on their first note
        let dur_holder = if element.has_attribute("dur") {
            *element
        } else {
            note_els
                .iter()
                .find(|n| n.has_attribute("dur"))
                .copied()
                .unwrap_or(*element)
        };
        let (base_ticks, dots) = self.read_duration(&dur_holder);
        let grace = element.has_attribute("grace");

        let explicit_stem = read_stem_dir(element);
        if explicit_stem.is_some() && lctx.in_beam_no > 0 {
            lctx.has_stem_dir_in_beam = true;
        }

        let mut pitches = Vec::new();
        let mut lines = Vec::new();
        for note_el in &note_els {
            let mut pitch = read_pitch(note_el);
            apply_accidental(&mut pitch, note_el);
            lines.push(tables::staff_line(&pitch.name, pitch.octave, &clef));
            pitches.push(pitch);
        }
        let stem_dir = explicit_stem
            .or(lctx.layer_dir)
            .or(Some(auto_stem_dir(lines.first().copied().unwrap_or(3.0))));

        let mut modifiers = Vec::new();
        if let Some(clef_change) = lctx.pending_clef.take() {
            modifiers.push(EventModifier::ClefChange { clef: clef_change });
        }

        let ix = self.push_event(RenderEvent {
            kind: EventKind::Chord {
                pitches: pitches.clone(),
            },
            ticks: tables::dotted_ticks(base_ticks, dots),
            dots,
            stem_dir,
            lines,
            stave_n: lctx.stave_n,
            grace,
            beamable: !grace && base_ticks <= RESOLUTION / 8,
            modifiers,
            x: 0.0,
        });

        for (i, note_el) in note_els.iter().enumerate() {
            let note_id = self.xml_id(note_el);
            if let Some(tie) = note_el.attribute("tie") {
                self.process_attr_tie(tie, &note_id, &pitches[i], lctx.stave_n);
            }
            if let Some(slur) = note_el.attribute("slur") {
                self.process_slur_attribute(slur, &note_id)?;
            }
            if self.cfg.render_fermata_attributes {
                if let Some(fermata) = note_el.attribute("fermata") {
                    self.events[ix.0].modifiers.push(EventModifier::Fermata {
                        above: fermata != "below",
                    });
                }
            }
            self.registry.insert(
                note_id,
                EventRecord {
                    event: ix,
                    system: lctx.system,
                    layer_dir: lctx.layer_dir,
                    chord_indices: vec![i],
                },
            );
        }
        self.registry.insert(
            xml_id.clone(),
            EventRecord {
                event: ix,
                system: lctx.system,
                layer_dir: lctx.layer_dir,
                chord_indices: (0..note_els.len()).collect(),
            },
        );
        lctx.ids.push((ix, xml_id));

        if grace {
            lctx.grace_queue.push(ix);
            Ok(None)
        } else {
            self.attach_grace_queue(lctx, ix);
            Ok(Some(ix))
        }
    }

    fn process_rest(&mut self, lctx: &mut LayerContext, element: &Node) -> EventIx {
        let xml_id = self.xml_id(element);
        let (base_ticks, dots) = self.read_duration(element);
        let line = self.rest_line(lctx.stave_n, element);

        let mut modifiers = Vec::new();
        if let Some(clef_change) = lctx.pending_clef.take() {
            modifiers.push(EventModifier::ClefChange { clef: clef_change });
        }

        let ix = self.push_event(RenderEvent {
            kind: EventKind::Rest,
            ticks: tables::dotted_ticks(base_ticks, dots),
            dots,
            stem_dir: None,
            lines: vec![line],
            stave_n: lctx.stave_n,
            grace: false,
            beamable: false,
            modifiers,
            x: 0.0,
        });
        self.registry.insert(
            xml_id.clone(),
            EventRecord {
                event: ix,
                system: lctx.system,
                layer_dir: lctx.layer_dir,
                chord_indices: vec![],
            },
        );
        lctx.ids.push((ix, xml_id));
        ix
    }

    fn process_mrest(&mut self, lctx: &mut LayerContext, element: &Node) -> EventIx {
        let xml_id = self.xml_id(element);
        let meter = self
            .score_ctx
            .stave_ref(lctx.stave_n)
            .map(|info| info.meter())
            .unwrap_or_default();
        let ticks = meter.count * (RESOLUTION / meter.unit);
        let line = self.rest_line(lctx.stave_n, element);

        let ix = self.push_event(RenderEvent {
            kind: EventKind::MeasureRest,
            ticks,
            dots: 0,
            stem_dir: None,
            lines: vec![line],
            stave_n: lctx.stave_n,
            grace: false,
            beamable: false,
            modifiers: Vec::new(),
            x: 0.0,
        });
        self.registry.insert(
            xml_id.clone(),
            EventRecord {
                event: ix,
                system: lctx.system,
                layer_dir: lctx.layer_dir,
                chord_indices: vec![],
            },
        );
        lctx.ids.push((ix, xml_id));
        ix
    }

    fn process_space(&mut self, lctx: &mut LayerContext, element: &Node) -> Option<EventIx> {
        if !element.has_attribute("dur") {
            info!(
                "No duration attribute in {}. Ignoring element.",
                serialize_element(element)
            );
            return None;
        }
        let (base_ticks, dots) = self.read_duration(element);
        Some(self.push_event(RenderEvent {
            kind: EventKind::Space,
            ticks: tables::dotted_ticks(base_ticks, dots),
            dots,
            stem_dir: None,
            lines: vec![3.0],
            stave_n: lctx.stave_n,
            grace: false,
            beamable: false,
            modifiers: Vec::new(),
            x: 0.0,
        }))
    }

    fn process_beam(
        &mut self,
        lctx: &mut LayerContext,
        element: &Node,
    ) -> Result<Vec<EventIx>, ConvertError> {
        lctx.in_beam_no += 1;
        let events = self.process_note_like_children(lctx, element)?;

        let beamable: Vec<EventIx> = events
            .iter()
            .copied()
            .filter(|ix| self.events[ix.0].beamable)
            .collect();
        if !events.is_empty() {
            if beamable.len() > 1 {
                self.beams.push(Beam {
                    events: beamable,
                    auto_stem: lctx.layer_dir.is_none() && !lctx.has_stem_dir_in_beam,
                });
            } else {
                error!(
                    "An error occurred processing {}: too few beamable notes. \
                     Ignoring beam.",
                    serialize_element(element)
                );
            }
        }

        lctx.in_beam_no -= 1;
        if lctx.in_beam_no == 0 {
            lctx.has_stem_dir_in_beam = false;
        }
        Ok(events)
    }

    fn process_tuplet(
        &mut self,
        lctx: &mut LayerContext,
        element: &Node,
    ) -> Result<Vec<EventIx>, ConvertError> {
        let events = self.process_note_like_children(lctx, element)?;
        if events.is_empty() {
            warn!(
                "No content found in {}. Ignoring tuplet.",
                serialize_element(element)
            );
            return Ok(events);
        }

        self.tuplets.push(Tuplet {
            events: events.clone(),
            num_notes: element
                .attribute("num")
                .and_then(|v| v.parse().ok())
                .unwrap_or(3),
            beats_occupied: element
                .attribute("numbase")
                .and_then(|v| v.parse().ok())
                .unwrap_or(2),
            ratioed: element.attribute("num.format") == Some("ratio"),
            bracketed: element.attribute("bracket.visible") == Some("true"),
            location: match element.attribute("bracket.place") {
                Some("above") => Some(1),
                Some("below") => Some(-1),
                _ => None,
            },
        });
        Ok(events)
    }

    fn process_clef(&mut self, lctx: &mut LayerContext, element: &Node) {
        let shape = element.attribute("shape").unwrap_or("G");
        let line = element
            .attribute("line")
            .and_then(|v| v.parse::<i32>().ok())
            .unwrap_or(0);
        let clef = tables::clef_name(shape, line).to_string();
        if let Some(info) = self.score_ctx.stave(lctx.stave_n) {
            lctx.pending_clef = Some(info.clef_change_in_measure(clef));
        }
    }

    fn attach_grace_queue(&mut self, lctx: &mut LayerContext, host: EventIx) {
        if !lctx.grace_queue.is_empty() {
            let events = std::mem::take(&mut lctx.grace_queue);
            self.events[host.0]
                .modifiers
                .push(EventModifier::GraceGroup { events });
        }
    }

    // ─── Inline spanning attributes ──────────────────────────────────

    fn process_attr_tie(&mut self, value: &str, xml_id: &str, pitch: &Pitch, stave_n: i32) {
        for c in value.chars() {
            if c == 't' || c == 'm' {
                self.ties.terminate_tie(xml_id, pitch.clone(), stave_n);
            }
            if c == 'i' || c == 'm' {
                self.ties.start_tie(xml_id, pitch.clone(), stave_n);
            }
        }
    }

    fn process_slur_attribute(&mut self, value: &str, xml_id: &str) -> Result<(), ConvertError> {
        for token in parse_slur_tokens(value)? {
            match token.letter {
                't' => self.slurs.terminate_slur(xml_id, token.nesting_level),
                _ => self.slurs.start_slur(xml_id, token.nesting_level),
            }
        }
        Ok(())
    }

    // ─── Element-based annotations ───────────────────────────────────

    fn create_span_infos(&mut self, elements: &[Node], measure_index: usize, kind: PendingKind) {
        for element in elements {
            let mut link = EventLink::new(
                strip_ref(element.attribute("startid")),
                strip_ref(element.attribute("endid")),
            );
            link.params = LinkParams {
                stave_n: element
                    .attribute("staff")
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(1),
                curve_dir: match element.attribute("curvedir") {
                    Some("above") => Some(crate::model::CurveDir::Above),
                    Some("below") => Some(crate::model::CurveDir::Below),
                    _ => None,
                },
                place: read_placement(element),
                form: element.attribute("form").map(String::from),
                y_shift_start: element.attribute("startvo").and_then(|v| v.parse().ok()),
                y_shift_end: element.attribute("endvo").and_then(|v| v.parse().ok()),
                ..Default::default()
            };
            let stave_n = link.params.stave_n;
            let layer_n = element
                .attribute("layer")
                .and_then(|v| v.parse().ok())
                .unwrap_or(1);

            if link.start_id.is_none() {
                if let Some(tstamp) = element.attribute("tstamp").and_then(|v| v.parse().ok()) {
                    let key = LocationKey {
                        measure: measure_index,
                        stave: stave_n,
                        layer: layer_n,
                    };
                    match self
                        .onsets
                        .get(&key)
                        .and_then(|onsets| event_at_tstamp(onsets, tstamp))
                    {
                        Some(id) => link.start_id = Some(id.to_string()),
                        None => warn!(
                            "Could not find an event at @tstamp \"{tstamp}\" in {}.",
                            serialize_element(element)
                        ),
                    }
                }
            }

            let end_missing = link.end_id.is_none();
            let tstamp2 = element.attribute("tstamp2").map(String::from);
            let index = match kind {
                PendingKind::Tie => self.ties.add_link(link),
                PendingKind::Slur => self.slurs.add_link(link),
                PendingKind::Hairpin => self.hairpins.add_link(link),
            };

            if !end_missing {
                continue;
            }
            let Some(raw) = tstamp2 else { continue };
            match parse_tstamp2(&raw) {
                Some((measure_offset, beat)) => {
                    let key = LocationKey {
                        measure: measure_index + measure_offset,
                        stave: stave_n,
                        layer: layer_n,
                    };
                    if measure_offset == 0 {
                        // the referenced location has already been walked
                        match self
                            .onsets
                            .get(&key)
                            .and_then(|onsets| event_at_tstamp(onsets, beat))
                        {
                            Some(id) => {
                                let id = id.to_string();
                                match kind {
                                    PendingKind::Tie => self.ties.set_end(index, id),
                                    PendingKind::Slur => self.slurs.set_end(index, id),
                                    PendingKind::Hairpin => self.hairpins.set_end(index, id),
                                }
                            }
                            None => warn!(
                                "Could not find an event at @tstamp2 \"{raw}\" in {}.",
                                serialize_element(element)
                            ),
                        }
                    } else {
                        self.deferred.register(
                            key,
                            PendingRef {
                                kind,
                                link: index,
                                tstamp: beat,
                            },
                        );
                    }
                }
                None => warn!(
                    "@tstamp2 \"{raw}\" in {} could not be parsed. Skipping.",
                    serialize_element(element)
                ),
            }
        }
    }

    fn pointer_model(&self, element: &Node, measure_index: usize) -> Option<PointerModel> {
        let start_id = strip_ref(element.attribute("startid")).or_else(|| {
            let tstamp: f64 = element.attribute("tstamp")?.parse().ok()?;
            let key = LocationKey {
                measure: measure_index,
                stave: element
                    .attribute("staff")
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(1),
                layer: element
                    .attribute("layer")
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(1),
            };
            self.onsets
                .get(&key)
                .and_then(|onsets| event_at_tstamp(onsets, tstamp))
                .map(String::from)
        });
        let Some(start_id) = start_id else {
            warn!(
                "Could not determine the startid or tstamp of {}. Skipping element.",
                serialize_element(element)
            );
            return None;
        };
        Some(PointerModel {
            start_id,
            text: collect_text(element),
            place: read_placement(element),
            x_shift: element
                .attribute("ho")
                .and_then(|v| v.parse().ok())
                .unwrap_or(0.0),
            form: element.attribute("form").map(String::from),
            accid_upper: element.attribute("accidupper").map(String::from),
            accid_lower: element.attribute("accidlower").map(String::from),
        })
    }

    // ─── Shared element readers ──────────────────────────────────────

    fn xml_id(&mut self, element: &Node) -> String {
        let id = element
            .attribute(("http://www.w3.org/XML/1998/namespace", "id"))
            .or_else(|| element.attribute("id"));
        match id {
            Some(id) => id.to_string(),
            None => {
                self.generated_ids += 1;
                format!("meilayout-{}", self.generated_ids)
            }
        }
    }

    fn current_clef(&self, stave_n: i32) -> String {
        self.score_ctx
            .stave_ref(stave_n)
            .map(|info| info.clef().to_string())
            .unwrap_or_else(|| "treble".to_string())
    }

    fn read_duration(&self, element: &Node) -> (u32, u8) {
        let base = match element.attribute("dur") {
            Some(dur) => tables::translate_duration(dur),
            None => {
                warn!(
                    "@dur expected in {}. Using quarter duration.",
                    serialize_element(element)
                );
                RESOLUTION / 4
            }
        };
        let dots = element
            .attribute("dots")
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        (base, dots)
    }

    fn rest_line(&self, stave_n: i32, element: &Node) -> f64 {
        match (element.attribute("ploc"), element.attribute("oloc")) {
            (Some(ploc), Some(oloc)) => {
                let octave = oloc.parse().unwrap_or(4);
                let clef = self.current_clef(stave_n);
                tables::staff_line(ploc, octave, &clef)
            }
            _ => 3.0,
        }
    }

    fn push_event(&mut self, event: RenderEvent) -> EventIx {
        self.events.push(event);
        EventIx(self.events.len() - 1)
    }

    // ─── Formatting ──────────────────────────────────────────────────

    /// Distributes each system's width over its measures proportionally
    /// to their minimum widths, then justifies the voices of every
    /// measure into its note area.
    fn format_systems(&mut self) {
        for system in &mut self.systems {
            let total_min: f64 = system.measures.iter().map(|m| m.min_width).sum();
            if total_min <= 0.0 {
                continue;
            }
            let scale = system.width / total_min;
            let mut x = system.x;
            for measure in &mut system.measures {
                measure.x = x;
                measure.width = measure.min_width * scale;
                let note_start = measure
                    .staves
                    .values()
                    .map(|s| s.note_start_x)
                    .fold(0.0, f64::max);
                for stave in measure.staves.values_mut() {
                    stave.width = measure.width;
                }
                let justify = (measure.width - note_start - NOTE_AREA_PAD).max(0.0);
                voices::align_rests(&measure.voices, &mut self.events);
                voices::format_voices(&measure.voices, &mut self.events, justify);
                x += measure.width;
            }
        }
    }
}

// ─── Attribute readers ───────────────────────────────────────────────

fn read_pitch(element: &Node) -> Pitch {
    match (
        element.attribute("pname"),
        element.attribute("oct").and_then(|v| v.parse::<i32>().ok()),
    ) {
        (Some(pname), Some(octave)) => Pitch::new(pname, octave),
        _ => {
            warn!(
                "Could not retrieve @pname and @oct of {}. Setting default pitch c/4.",
                serialize_element(element)
            );
            Pitch::new("c", 4)
        }
    }
}

fn apply_accidental(pitch: &mut Pitch, element: &Node) {
    let accid = element.attribute("accid").map(String::from).or_else(|| {
        element
            .children()
            .find(|c| c.is_element() && c.tag_name().name() == "accid")
            .and_then(|c| c.attribute("accid"))
            .map(String::from)
    });
    if let Some(accid) = accid {
        match tables::accidental(&accid) {
            Some(code) => pitch.accidental = Some(code.to_string()),
            None => warn!("Accidental \"{accid}\" is not supported. Skipping accidental."),
        }
    }
}

fn read_stem_dir(element: &Node) -> Option<StemDir> {
    match element.attribute("stem.dir") {
        Some("up") => Some(StemDir::Up),
        Some("down") => Some(StemDir::Down),
        _ => None,
    }
}

/// Default stem direction when neither the element nor the layer gives
/// one: notes on or above the middle line stem down.
fn auto_stem_dir(line: f64) -> StemDir {
    if line >= 3.0 {
        StemDir::Down
    } else {
        StemDir::Up
    }
}
