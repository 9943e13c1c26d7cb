//! Tie resolution.
//!
//! Attribute ties (`tie="i"`, `"m"`, `"t"` on notes) are matched by pitch
//! position and stave: a terminating note closes the oldest open tie whose
//! start has the same pitch name, octave and stave. Element ties carry
//! explicit references and bypass matching.

use crate::model::{Curve, EventIx, Pitch};

use super::links::{resolve_endpoints, EventLink, LinkCollection, LinkParams};
use super::registry::EventRegistry;

#[derive(Debug, Default)]
pub(crate) struct Ties {
    links: LinkCollection,
}

impl Ties {
    /// Opens a tie starting at the given note.
    pub fn start_tie(&mut self, id: &str, pitch: Pitch, stave_n: i32) {
        self.links.open_start(
            id,
            LinkParams {
                pitch: Some(pitch),
                stave_n,
                ..Default::default()
            },
        );
    }

    /// Closes the oldest open tie matching the note's pitch position and
    /// stave; opens an end-only tie if none matches.
    pub fn terminate_tie(&mut self, id: &str, pitch: Pitch, stave_n: i32) {
        self.links.close(
            id,
            LinkParams {
                pitch: Some(pitch),
                stave_n,
                ..Default::default()
            },
            |open, new| {
                open.stave_n == new.stave_n
                    && match (&open.pitch, &new.pitch) {
                        (Some(a), Some(b)) => a.same_position(b),
                        _ => false,
                    }
            },
        );
    }

    /// Adds an element-based tie; returns its index for deferred
    /// resolution.
    pub fn add_link(&mut self, link: EventLink) -> usize {
        self.links.push(link)
    }

    pub fn set_end(&mut self, index: usize, end_id: String) {
        self.links.set_end(index, end_id);
    }

    /// Resolves all ties into curve connectors. A tie whose endpoints sit
    /// in different systems becomes two partial curves; a tie with an
    /// unresolvable endpoint is reported and skipped.
    pub fn finalize(&self, registry: &EventRegistry) -> Vec<Curve> {
        let mut curves = Vec::new();
        for link in self.links.iter() {
            let Some((first, last)) = resolve_endpoints(registry, link, "tie") else {
                continue;
            };
            if first.system != last.system {
                let mut head = partial_curve(Some(first.event), None, link);
                head.start_indices = first.chord_indices.clone();
                let mut tail = partial_curve(None, Some(last.event), link);
                tail.end_indices = last.chord_indices.clone();
                curves.push(head);
                curves.push(tail);
            } else {
                let mut curve = partial_curve(Some(first.event), Some(last.event), link);
                curve.start_indices = first.chord_indices.clone();
                curve.end_indices = last.chord_indices.clone();
                curves.push(curve);
            }
        }
        curves
    }
}

fn partial_curve(start: Option<EventIx>, end: Option<EventIx>, link: &EventLink) -> Curve {
    let mut curve = Curve::new(start, end);
    curve.direction = link.params.curve_dir;
    curve.y_shift_start = link.params.y_shift_start;
    curve.y_shift_end = link.params.y_shift_end;
    curve
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::converter::registry::EventRecord;
    use crate::model::EventIx;

    fn record(event: usize, system: usize) -> EventRecord {
        EventRecord {
            event: EventIx(event),
            system,
            layer_dir: None,
            chord_indices: vec![],
        }
    }

    #[test]
    fn ties_match_by_pitch_position_and_stave() {
        let mut ties = Ties::default();
        ties.start_tie("a", Pitch::new("c", 4), 1);
        ties.start_tie("b", Pitch::new("e", 4), 1);
        // terminates the e4 tie, not the older c4 one
        ties.terminate_tie("c", Pitch::new("e", 4), 1);

        let mut registry = EventRegistry::default();
        registry.insert("a".into(), record(0, 0));
        registry.insert("b".into(), record(1, 0));
        registry.insert("c".into(), record(2, 0));

        let curves = ties.finalize(&registry);
        assert_eq!(curves.len(), 1);
        assert_eq!(curves[0].start, Some(EventIx(1)));
        assert_eq!(curves[0].end, Some(EventIx(2)));
    }

    #[test]
    fn accidentals_do_not_affect_tie_matching() {
        let mut sharp = Pitch::new("f", 5);
        sharp.accidental = Some("#".into());
        let mut ties = Ties::default();
        ties.start_tie("a", sharp, 1);
        ties.terminate_tie("b", Pitch::new("f", 5), 1);

        let mut registry = EventRegistry::default();
        registry.insert("a".into(), record(0, 0));
        registry.insert("b".into(), record(1, 0));
        assert_eq!(ties.finalize(&registry).len(), 1);
    }

    #[test]
    fn cross_system_tie_splits_into_two_partial_curves() {
        let mut ties = Ties::default();
        ties.start_tie("a", Pitch::new("g", 4), 1);
        ties.terminate_tie("b", Pitch::new("g", 4), 1);

        let mut registry = EventRegistry::default();
        registry.insert("a".into(), record(0, 0));
        registry.insert("b".into(), record(1, 1));

        let curves = ties.finalize(&registry);
        assert_eq!(curves.len(), 2);
        assert_eq!(curves[0].start, Some(EventIx(0)));
        assert_eq!(curves[0].end, None);
        assert_eq!(curves[1].start, None);
        assert_eq!(curves[1].end, Some(EventIx(1)));
    }

    #[test]
    fn unresolved_tie_is_skipped_entirely() {
        let mut ties = Ties::default();
        ties.start_tie("a", Pitch::new("c", 4), 1);
        // "a" never registered, end never arrives
        let registry = EventRegistry::default();
        assert!(ties.finalize(&registry).is_empty());
    }
}
