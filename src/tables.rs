//! Static vocabulary tables — durations, accidentals, clefs, key
//! signatures and staff-line positions. Pure lookups, no logic beyond the
//! two historical duration aliases.

use log::{info, warn};

/// Ticks per whole note. All event durations are expressed in these units.
pub const RESOLUTION: u32 = 16384;

// ─── Durations ───────────────────────────────────────────────────────

/// Translate an MEI duration token into ticks.
///
/// `brevis` and `longa` are accepted as historical aliases of `breve` and
/// `long` (with an info-level note); any other unknown token falls back to
/// a quarter with a warning.
pub fn translate_duration(mei_dur: &str) -> u32 {
    if let Some(ticks) = duration_ticks(mei_dur) {
        return ticks;
    }
    let alias = match mei_dur {
        "brevis" => Some("breve"),
        "longa" => Some("long"),
        _ => None,
    };
    if let Some(alias) = alias {
        info!(
            "Duration \"{mei_dur}\" is not supported. Using \"{alias}\" instead."
        );
        return duration_ticks(alias).unwrap_or(RESOLUTION / 4);
    }
    warn!(
        "Duration \"{mei_dur}\" is not supported. Using \"4\" instead. \
         May lead to display errors."
    );
    RESOLUTION / 4
}

fn duration_ticks(token: &str) -> Option<u32> {
    match token {
        "long" => Some(RESOLUTION * 4),
        "breve" => Some(RESOLUTION * 2),
        "1" => Some(RESOLUTION),
        "2" => Some(RESOLUTION / 2),
        "4" => Some(RESOLUTION / 4),
        "8" => Some(RESOLUTION / 8),
        "16" => Some(RESOLUTION / 16),
        "32" => Some(RESOLUTION / 32),
        "64" => Some(RESOLUTION / 64),
        "128" => Some(RESOLUTION / 128),
        _ => None,
    }
}

/// Apply dot augmentation to a tick count (each dot adds half the
/// previous value).
pub fn dotted_ticks(ticks: u32, dots: u8) -> u32 {
    let mut total = ticks;
    let mut add = ticks / 2;
    for _ in 0..dots {
        total += add;
        add /= 2;
    }
    total
}

// ─── Accidentals ─────────────────────────────────────────────────────

/// Translate an MEI accidental token into a backend accidental code.
/// Returns `None` for unknown tokens (caller logs and skips).
pub fn accidental(mei_accid: &str) -> Option<&'static str> {
    match mei_accid {
        "s" => Some("#"),
        "f" => Some("b"),
        "ss" | "x" => Some("##"),
        "ff" => Some("bb"),
        "n" => Some("n"),
        "nf" => Some("b"),
        "ns" => Some("#"),
        _ => None,
    }
}

// ─── Clefs ───────────────────────────────────────────────────────────

/// Translate an MEI clef shape/line pair into a backend clef name.
/// Unknown combinations default to treble with a warning.
pub fn clef_name(shape: &str, line: i32) -> &'static str {
    match (shape, line) {
        ("G", 2) | ("G", 0) => "treble",
        ("F", 4) | ("F", 0) => "bass",
        ("F", 3) => "baritone-f",
        ("C", 3) => "alto",
        ("C", 4) => "tenor",
        ("C", 1) => "soprano",
        ("C", 2) => "mezzo-soprano",
        _ => {
            warn!("Clef \"{shape}{line}\" is not supported. Using treble clef.");
            "treble"
        }
    }
}

// ─── Key signatures ──────────────────────────────────────────────────

/// Parse an MEI `key.sig` value ("3s", "2f", "0") into a fifths count.
pub fn key_sig_fifths(key_sig: &str) -> Option<i32> {
    if key_sig == "0" {
        return Some(0);
    }
    let (count, suffix) = key_sig.split_at(key_sig.len().checked_sub(1)?);
    let n: i32 = count.parse().ok()?;
    match suffix {
        "s" => Some(n),
        "f" => Some(-n),
        _ => None,
    }
}

/// The canonical major-key spec for a fifths count, as consumed by the
/// rendering backend's key signature modifier.
pub fn key_spec(fifths: i32) -> &'static str {
    const CIRCLE: [&str; 15] = [
        "Cb", "Gb", "Db", "Ab", "Eb", "Bb", "F", "C", "G", "D", "A", "E", "B", "F#", "C#",
    ];
    CIRCLE[(fifths.clamp(-7, 7) + 7) as usize]
}

// ─── Staff lines ─────────────────────────────────────────────────────

fn step_index(pname: &str) -> Option<i32> {
    match pname {
        "c" => Some(0),
        "d" => Some(1),
        "e" => Some(2),
        "f" => Some(3),
        "g" => Some(4),
        "a" => Some(5),
        "b" => Some(6),
        _ => None,
    }
}

/// The staff line a pitch sits on for a given clef, in half-line steps
/// where line 1 is the bottom staff line and line 5 the top (line 3 is the
/// middle line; values outside 1..=5 are ledger positions).
pub fn staff_line(pname: &str, octave: i32, clef: &str) -> f64 {
    let step = match step_index(pname) {
        Some(s) => s,
        None => return 3.0,
    };
    let position = octave * 7 + step;
    // diatonic position of the pitch sitting on the bottom staff line
    let bottom_line = match clef {
        "bass" => 2 * 7 + 4,          // G2
        "baritone-f" => 2 * 7 + 6,    // B2
        "alto" => 3 * 7 + 3,          // F3
        "tenor" => 3 * 7 + 1,         // D3
        "soprano" => 4 * 7 + 0,       // C4
        "mezzo-soprano" => 3 * 7 + 5, // A3
        _ => 4 * 7 + 2,               // E4 (treble)
    };
    1.0 + (position - bottom_line) as f64 * 0.5
}
