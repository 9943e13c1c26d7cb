//! Slur resolution.
//!
//! Attribute slurs use a compact token grammar: each whitespace-separated
//! token is a letter (`i` or `t`, implicit level 0) optionally followed by
//! a single non-zero digit giving the nesting level. Matching pairs the
//! oldest open slur of the same nesting level. The curve direction and
//! anchor positions, when not given explicitly, come from layer direction,
//! chord position and the relative staff lines of the endpoints.

use crate::error::ConvertError;
use crate::model::{Curve, CurveDir, CurvePosition, RenderEvent, StemDir};

use super::links::{resolve_endpoints, EventLink, LinkCollection, LinkParams};
use super::registry::{EventRecord, EventRegistry};

/// One parsed slur attribute token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct SlurToken {
    pub letter: char,
    pub nesting_level: i32,
}

/// Parses a slur attribute value into tokens. Any malformed token aborts
/// the conversion.
pub(crate) fn parse_slur_tokens(value: &str) -> Result<Vec<SlurToken>, ConvertError> {
    let mut tokens = Vec::new();
    for raw in value.split_whitespace() {
        let malformed = || ConvertError::MalformedSlurAttribute {
            token: raw.to_string(),
        };
        let mut chars = raw.chars();
        let letter = chars.next().ok_or_else(malformed)?;
        if letter != 'i' && letter != 't' {
            return Err(malformed());
        }
        let nesting_level = match chars.next() {
            None => 0,
            Some(d @ '1'..='9') if chars.next().is_none() => d as i32 - '0' as i32,
            Some(_) => return Err(malformed()),
        };
        tokens.push(SlurToken {
            letter,
            nesting_level,
        });
    }
    Ok(tokens)
}

#[derive(Debug, Default)]
pub(crate) struct Slurs {
    links: LinkCollection,
}

impl Slurs {
    pub fn start_slur(&mut self, id: &str, nesting_level: i32) {
        self.links.open_start(
            id,
            LinkParams {
                nesting_level,
                ..Default::default()
            },
        );
    }

    /// Closes the oldest open slur at the same nesting level; opens an
    /// end-only slur if none is open.
    pub fn terminate_slur(&mut self, id: &str, nesting_level: i32) {
        self.links.close(
            id,
            LinkParams {
                nesting_level,
                ..Default::default()
            },
            |open, new| open.nesting_level == new.nesting_level,
        );
    }

    pub fn add_link(&mut self, link: EventLink) -> usize {
        self.links.push(link)
    }

    pub fn set_end(&mut self, index: usize, end_id: String) {
        self.links.set_end(index, end_id);
    }

    pub fn finalize(&self, registry: &EventRegistry, events: &[RenderEvent]) -> Vec<Curve> {
        let mut curves = Vec::new();
        for link in self.links.iter() {
            let Some((first, last)) = resolve_endpoints(registry, link, "slur") else {
                continue;
            };

            let mut curve_dir = link.params.curve_dir;
            if curve_dir.is_none() {
                curve_dir = match first.layer_dir.or(last.layer_dir) {
                    Some(StemDir::Up) => Some(CurveDir::Above),
                    Some(StemDir::Down) => Some(CurveDir::Below),
                    // outer pitches of a chord curve outwards
                    None => chord_outward_dir(first, events)
                        .or_else(|| chord_outward_dir(last, events)),
                };
            }

            if first.system != last.system {
                curves.push(single_slur(Some(first), None, curve_dir, link, events));
                // the trailing partial bends away from the first stem
                let tail_dir = curve_dir.or(Some(
                    match events[first.event.0].stem_dir {
                        Some(StemDir::Down) => CurveDir::Above,
                        _ => CurveDir::Below,
                    },
                ));
                curves.push(single_slur(None, Some(last), tail_dir, link, events));
            } else {
                curves.push(single_slur(Some(first), Some(last), curve_dir, link, events));
            }
        }
        curves
    }
}

/// For an endpoint addressing one pitch inside a chord, the outward curve
/// direction of that pitch (bottom pitch curves below, top pitch above).
fn chord_outward_dir(record: &EventRecord, events: &[RenderEvent]) -> Option<CurveDir> {
    let event = &events[record.event.0];
    let pitch_count = event.lines.len();
    if pitch_count < 2 {
        return None;
    }
    match record.chord_indices.first() {
        Some(0) => Some(CurveDir::Below),
        Some(&i) if i == pitch_count - 1 => Some(CurveDir::Above),
        _ => None,
    }
}

fn single_slur(
    first: Option<&EventRecord>,
    last: Option<&EventRecord>,
    curve_dir: Option<CurveDir>,
    link: &EventLink,
    events: &[RenderEvent],
) -> Curve {
    let f_event = first.map(|r| &events[r.event.0]);
    let l_event = last.map(|r| &events[r.event.0]);
    let first_stem = f_event.and_then(|e| e.stem_dir);
    let last_stem = l_event.and_then(|e| e.stem_dir);

    let mut curve = Curve::new(first.map(|r| r.event), last.map(|r| r.event));
    curve.start_indices = first.map(|r| r.chord_indices.clone()).unwrap_or_default();
    curve.end_indices = last.map(|r| r.chord_indices.clone()).unwrap_or_default();
    curve.direction = curve_dir;
    curve.y_shift_start = link.params.y_shift_start;
    curve.y_shift_end = link.params.y_shift_end;

    match curve_dir {
        Some(dir) => {
            // a curve bending into the end note's stem is drawn inverted
            if (dir == CurveDir::Above && last_stem == Some(StemDir::Up))
                || (dir == CurveDir::Below && last_stem == Some(StemDir::Down))
            {
                curve.invert = true;
            }
            if let (Some(fe), Some(le)) = (f_event, l_event) {
                let distance = fe.line() - le.line();
                if first_stem != last_stem {
                    if (distance < -0.5 && dir == CurveDir::Above)
                        || (distance > 0.5 && dir == CurveDir::Below)
                    {
                        // first note noticeably lower than last note
                        curve.position = Some(CurvePosition::NearTop);
                        curve.position_end = Some(CurvePosition::NearHead);
                    } else if (distance > 0.5 && dir == CurveDir::Above)
                        || (distance < -0.5 && dir == CurveDir::Below)
                    {
                        // first note noticeably higher than last note
                        curve.position_end = Some(CurvePosition::NearTop);
                    }
                } else if curve.invert {
                    curve.position = Some(CurvePosition::NearTop);
                }
            }
        }
        None => {
            if first.and_then(|r| r.layer_dir).is_some()
                || last.and_then(|r| r.layer_dir).is_some()
            {
                // multi-layer stave: point the slur outwards
                curve.invert = true;
                let both_stemmed = matches!((f_event, l_event), (Some(f), Some(l))
                    if f.has_stem() && l.has_stem());
                if both_stemmed {
                    curve.position = Some(CurvePosition::NearTop);
                    if first_stem != last_stem {
                        curve.position_end = Some(CurvePosition::NearHead);
                    }
                }
            }
            // single layer without any derivable direction keeps the
            // backend's default placement
        }
    }
    curve
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{EventIx, EventKind, Pitch};
    use crate::tables::RESOLUTION;

    fn note_event(line: f64, stem_dir: StemDir) -> RenderEvent {
        RenderEvent {
            kind: EventKind::Note {
                pitch: Pitch::new("c", 4),
            },
            ticks: RESOLUTION / 4,
            dots: 0,
            stem_dir: Some(stem_dir),
            lines: vec![line],
            stave_n: 1,
            grace: false,
            beamable: false,
            modifiers: vec![],
            x: 0.0,
        }
    }

    fn record(event: usize, system: usize, layer_dir: Option<StemDir>) -> EventRecord {
        EventRecord {
            event: EventIx(event),
            system,
            layer_dir,
            chord_indices: vec![],
        }
    }

    #[test]
    fn token_grammar_accepts_plain_and_levelled_tokens() {
        let tokens = parse_slur_tokens("i t2").unwrap();
        assert_eq!(
            tokens,
            vec![
                SlurToken { letter: 'i', nesting_level: 0 },
                SlurToken { letter: 't', nesting_level: 2 },
            ]
        );
    }

    #[test]
    fn token_grammar_rejects_malformed_tokens() {
        assert!(matches!(
            parse_slur_tokens("i12"),
            Err(ConvertError::MalformedSlurAttribute { .. })
        ));
        assert!(matches!(
            parse_slur_tokens("x1"),
            Err(ConvertError::MalformedSlurAttribute { .. })
        ));
        assert!(matches!(
            parse_slur_tokens("i0"),
            Err(ConvertError::MalformedSlurAttribute { .. })
        ));
    }

    #[test]
    fn nesting_levels_do_not_cross_match() {
        let mut slurs = Slurs::default();
        slurs.start_slur("a", 1);
        slurs.start_slur("b", 2);
        slurs.terminate_slur("c", 2);
        slurs.terminate_slur("d", 1);

        let mut registry = EventRegistry::default();
        let events = vec![
            note_event(2.0, StemDir::Up),
            note_event(3.0, StemDir::Up),
            note_event(3.0, StemDir::Up),
            note_event(2.0, StemDir::Up),
        ];
        registry.insert("a".into(), record(0, 0, None));
        registry.insert("b".into(), record(1, 0, None));
        registry.insert("c".into(), record(2, 0, None));
        registry.insert("d".into(), record(3, 0, None));

        let curves = slurs.finalize(&registry, &events);
        assert_eq!(curves.len(), 2);
        assert_eq!(curves[0].start, Some(EventIx(0)));
        assert_eq!(curves[0].end, Some(EventIx(3)));
        assert_eq!(curves[1].start, Some(EventIx(1)));
        assert_eq!(curves[1].end, Some(EventIx(2)));
    }

    #[test]
    fn layer_direction_sets_curve_direction() {
        let mut slurs = Slurs::default();
        slurs.start_slur("a", 0);
        slurs.terminate_slur("b", 0);

        let mut registry = EventRegistry::default();
        let events = vec![
            note_event(2.0, StemDir::Up),
            note_event(2.0, StemDir::Up),
        ];
        registry.insert("a".into(), record(0, 0, Some(StemDir::Up)));
        registry.insert("b".into(), record(1, 0, Some(StemDir::Up)));

        let curves = slurs.finalize(&registry, &events);
        assert_eq!(curves[0].direction, Some(CurveDir::Above));
        assert!(curves[0].invert, "curve into an up-stem is inverted");
    }

    #[test]
    fn ascending_line_with_opposed_stems_anchors_near_top() {
        let mut registry = EventRegistry::default();
        let events = vec![
            note_event(1.0, StemDir::Up),
            note_event(4.0, StemDir::Down),
        ];
        registry.insert("a".into(), record(0, 0, None));
        registry.insert("b".into(), record(1, 0, None));

        // explicit direction via an element-style link
        let mut slurs = Slurs::default();
        let mut link = EventLink::new(Some("a".into()), Some("b".into()));
        link.params.curve_dir = Some(CurveDir::Above);
        slurs.add_link(link);

        let curves = slurs.finalize(&registry, &events);
        assert_eq!(curves[0].position, Some(CurvePosition::NearTop));
        assert_eq!(curves[0].position_end, Some(CurvePosition::NearHead));
    }

    #[test]
    fn cross_system_slur_splits_into_two_partial_curves() {
        let mut slurs = Slurs::default();
        slurs.start_slur("a", 0);
        slurs.terminate_slur("b", 0);

        let mut registry = EventRegistry::default();
        let events = vec![
            note_event(3.0, StemDir::Down),
            note_event(3.0, StemDir::Down),
        ];
        registry.insert("a".into(), record(0, 0, None));
        registry.insert("b".into(), record(1, 1, None));

        let curves = slurs.finalize(&registry, &events);
        assert_eq!(curves.len(), 2);
        assert_eq!(curves[0].end, None);
        assert_eq!(curves[1].start, None);
        // trailing partial bends away from the first note's down stem
        assert_eq!(curves[1].direction, Some(CurveDir::Above));
    }
}
