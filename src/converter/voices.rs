//! Voice width calculation and horizontal justification.
//!
//! All voices of a measure are formatted together: onsets are merged
//! across voices so simultaneous events in different voices and staves
//! land on the same x position.

use std::collections::BTreeMap;

use crate::model::{EventKind, EventModifier, RenderEvent, Voice};

/// Minimum horizontal room one tickable needs.
const MIN_EVENT_WIDTH: f64 = 22.0;
/// Extra room per grace note in front of its host event.
const GRACE_EVENT_WIDTH: f64 = 12.0;
/// Extra room for a mid-measure clef change drawn before an event.
const CLEF_CHANGE_WIDTH: f64 = 28.0;

fn event_width(event: &RenderEvent) -> f64 {
    let mut width = MIN_EVENT_WIDTH + event.dots as f64 * 5.0;
    for modifier in &event.modifiers {
        match modifier {
            EventModifier::ClefChange { .. } => width += CLEF_CHANGE_WIDTH,
            EventModifier::GraceGroup { events } => {
                width += events.len() as f64 * GRACE_EVENT_WIDTH
            }
            _ => {}
        }
    }
    width
}

/// Merged onset map of a measure: for each distinct onset tick, the widest
/// event starting there across all voices.
fn merged_onsets(voices: &[Voice], events: &[RenderEvent]) -> BTreeMap<u32, f64> {
    let mut onsets: BTreeMap<u32, f64> = BTreeMap::new();
    for voice in voices {
        let mut t = 0u32;
        for &ix in &voice.events {
            let event = &events[ix.0];
            let width = event_width(event);
            let slot = onsets.entry(t).or_insert(0.0);
            if width > *slot {
                *slot = width;
            }
            t += event.ticks;
        }
    }
    onsets
}

/// The minimum note-area width the measure's voices require.
pub(crate) fn pre_calculate_min_width(voices: &[Voice], events: &[RenderEvent]) -> f64 {
    merged_onsets(voices, events).values().sum()
}

/// Assigns each event its x offset within the measure's note area.
///
/// Distinct onsets share the justified width proportionally to the room
/// their widest event requires, so a chord in one voice and an eighth in
/// another line up whenever they sound together.
pub(crate) fn format_voices(voices: &[Voice], events: &mut [RenderEvent], justify_width: f64) {
    let onsets = merged_onsets(voices, events);
    let min_total: f64 = onsets.values().sum();
    if min_total <= 0.0 {
        return;
    }
    let scale = (justify_width / min_total).max(1.0);

    // x position of each onset slot
    let mut slot_x: BTreeMap<u32, f64> = BTreeMap::new();
    let mut x = 0.0;
    for (&t, &width) in &onsets {
        slot_x.insert(t, x);
        x += width * scale;
    }

    for voice in voices {
        let mut t = 0u32;
        for &ix in &voice.events {
            let ticks = events[ix.0].ticks;
            if let Some(&x) = slot_x.get(&t) {
                events[ix.0].x = x;
            }
            t += ticks;
        }
    }
}

/// Aligns rests with the surrounding notes of their own voice when more
/// than one voice shares a stave, so the voices do not collide visually.
pub(crate) fn align_rests(voices: &[Voice], events: &mut [RenderEvent]) {
    for voice in voices {
        let shared = voices
            .iter()
            .filter(|v| v.stave_n == voice.stave_n)
            .count()
            > 1;
        if !shared {
            continue;
        }
        for (i, &ix) in voice.events.iter().enumerate() {
            if !matches!(events[ix.0].kind, EventKind::Rest) {
                continue;
            }
            // nearest note line in this voice, preferring the previous event
            let neighbour = voice.events[..i]
                .iter()
                .rev()
                .chain(voice.events[i + 1..].iter())
                .map(|&n| &events[n.0])
                .find(|e| matches!(e.kind, EventKind::Note { .. } | EventKind::Chord { .. }))
                .map(|e| e.line());
            if let Some(line) = neighbour {
                // snap to a line or space
                events[ix.0].lines = vec![(line * 2.0).round() / 2.0];
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{EventIx, Meter};
    use crate::tables::RESOLUTION;

    fn note(ticks: u32, line: f64) -> RenderEvent {
        RenderEvent {
            kind: EventKind::Note {
                pitch: crate::model::Pitch::new("c", 4),
            },
            ticks,
            dots: 0,
            stem_dir: None,
            lines: vec![line],
            stave_n: 1,
            grace: false,
            beamable: ticks <= RESOLUTION / 8,
            modifiers: vec![],
            x: 0.0,
        }
    }

    fn rest(ticks: u32) -> RenderEvent {
        RenderEvent {
            kind: EventKind::Rest,
            lines: vec![3.0],
            ..note(ticks, 3.0)
        }
    }

    fn voice(stave_n: i32, events: Vec<usize>) -> Voice {
        Voice {
            stave_n,
            layer_n: 1,
            meter: Meter::default(),
            events: events.into_iter().map(EventIx).collect(),
        }
    }

    #[test]
    fn simultaneous_events_share_an_x_position() {
        let mut events = vec![
            note(RESOLUTION / 2, 3.0),
            note(RESOLUTION / 2, 3.0),
            note(RESOLUTION / 4, 2.0),
            note(RESOLUTION / 4, 2.0),
            note(RESOLUTION / 2, 2.0),
        ];
        let voices = vec![voice(1, vec![0, 1]), voice(1, vec![2, 3, 4])];
        format_voices(&voices, &mut events, 300.0);

        assert_eq!(events[0].x, events[2].x);
        assert_eq!(events[1].x, events[4].x);
        assert!(events[3].x > events[2].x && events[3].x < events[1].x);
    }

    #[test]
    fn min_width_merges_onsets_across_voices() {
        let events = vec![
            note(RESOLUTION / 4, 3.0),
            note(RESOLUTION / 4, 3.0),
            note(RESOLUTION / 2, 2.0),
        ];
        let voices = vec![voice(1, vec![0, 1]), voice(1, vec![2])];
        // two distinct onsets, not three
        assert_eq!(
            pre_calculate_min_width(&voices, &events),
            2.0 * MIN_EVENT_WIDTH
        );
    }

    #[test]
    fn rests_follow_neighbouring_note_lines_in_shared_staves() {
        let mut events = vec![
            note(RESOLUTION / 4, 4.5),
            rest(RESOLUTION / 4),
            note(RESOLUTION / 2, 1.0),
            note(RESOLUTION / 2, 1.0),
        ];
        let voices = vec![voice(1, vec![0, 1]), voice(1, vec![2, 3])];
        align_rests(&voices, &mut events);
        assert_eq!(events[1].lines, vec![4.5]);
    }

    #[test]
    fn rests_keep_their_line_on_single_voice_staves() {
        let mut events = vec![note(RESOLUTION / 4, 5.0), rest(RESOLUTION / 4)];
        let voices = vec![voice(1, vec![0, 1])];
        align_rests(&voices, &mut events);
        assert_eq!(events[1].lines, vec![3.0]);
    }
}
