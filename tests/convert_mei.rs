//! End-to-end conversion tests on small handwritten MEI documents.

use meilayout::model::{EventKind, EventModifier};
use meilayout::{convert_mei, Config, ConvertError, LayoutGraph};
use pretty_assertions::assert_eq;

fn convert(xml: &str) -> LayoutGraph {
    convert_mei(xml, &Config::default()).expect("conversion failed")
}

fn score(body: &str) -> String {
    format!(
        r#"<mei><music><body><mdiv><score>
            <scoreDef meter.count="4" meter.unit="4" key.sig="0">
                <staffGrp><staffDef n="1" clef.shape="G" clef.line="2"/></staffGrp>
            </scoreDef>
            <section>{body}</section>
        </score></mdiv></body></music></mei>"#
    )
}

fn quarter(id: &str, pname: &str, oct: i32) -> String {
    format!(r#"<note xml:id="{id}" pname="{pname}" oct="{oct}" dur="4"/>"#)
}

#[test]
fn single_measure_produces_one_system_with_start_modifiers() {
    let graph = convert(&score(
        r#"<measure n="1"><staff n="1"><layer n="1">
            <note pname="c" oct="5" dur="4"/>
            <note pname="d" oct="5" dur="4"/>
            <note pname="e" oct="5" dur="2"/>
        </layer></staff></measure>"#,
    ));

    assert_eq!(graph.systems.len(), 1);
    assert_eq!(graph.measure_count(), 1);
    assert_eq!(graph.voice_count(), 1);
    assert_eq!(graph.events.len(), 3);

    let stave = &graph.systems[0].measures[0].staves[&1];
    assert_eq!(stave.clef.as_deref(), Some("treble"));
    assert_eq!(stave.key_signature.as_ref().map(|k| k.fifths), Some(0));
    let meter = stave.time_signature.as_ref().map(|t| t.meter);
    assert_eq!(meter.map(|m| (m.count, m.unit)), Some((4, 4)));
}

#[test]
fn context_is_not_redisplayed_within_a_system() {
    let graph = convert(&score(&format!(
        r#"<measure n="1"><staff n="1"><layer n="1">{}</layer></staff></measure>
           <measure n="2"><staff n="1"><layer n="1">{}</layer></staff></measure>"#,
        quarter("a", "c", 5),
        quarter("b", "c", 5),
    )));

    assert_eq!(graph.systems.len(), 1);
    let second = &graph.systems[0].measures[1].staves[&1];
    assert_eq!(second.clef, None);
    assert!(second.key_signature.is_none());
    assert!(second.time_signature.is_none());
}

#[test]
fn system_break_forces_a_new_system_and_redisplays_the_clef() {
    let graph = convert(&score(&format!(
        r#"<measure n="1"><staff n="1"><layer n="1">{}</layer></staff></measure>
           <sb/>
           <measure n="2"><staff n="1"><layer n="1">{}</layer></staff></measure>"#,
        quarter("a", "c", 5),
        quarter("b", "c", 5),
    )));

    assert_eq!(graph.systems.len(), 2);
    let second = &graph.systems[1].measures[0].staves[&1];
    assert_eq!(second.clef.as_deref(), Some("treble"));
    // the second system sits below the first
    assert!(graph.systems[1].y > graph.systems[0].y);
}

#[test]
fn attribute_tie_connects_notes_across_measures() {
    let graph = convert(&score(
        r#"<measure n="1"><staff n="1"><layer n="1">
            <note xml:id="a" pname="g" oct="4" dur="1" tie="i"/>
        </layer></staff></measure>
        <measure n="2"><staff n="1"><layer n="1">
            <note xml:id="b" pname="g" oct="4" dur="1" tie="t"/>
        </layer></staff></measure>"#,
    ));

    assert_eq!(graph.ties.len(), 1);
    assert!(graph.ties[0].start.is_some());
    assert!(graph.ties[0].end.is_some());
}

#[test]
fn medial_tie_closes_and_reopens_at_the_middle_note() {
    let graph = convert(&score(
        r#"<measure n="1"><staff n="1"><layer n="1">
            <note xml:id="a" pname="g" oct="4" dur="1" tie="i"/>
        </layer></staff></measure>
        <measure n="2"><staff n="1"><layer n="1">
            <note xml:id="b" pname="g" oct="4" dur="1" tie="m"/>
        </layer></staff></measure>
        <measure n="3"><staff n="1"><layer n="1">
            <note xml:id="c" pname="g" oct="4" dur="1" tie="t"/>
        </layer></staff></measure>"#,
    ));

    use meilayout::model::EventIx;
    assert_eq!(graph.ties.len(), 2);
    assert_eq!(graph.ties[0].start, Some(EventIx(0)));
    assert_eq!(graph.ties[0].end, Some(EventIx(1)));
    assert_eq!(graph.ties[1].start, Some(EventIx(1)));
    assert_eq!(graph.ties[1].end, Some(EventIx(2)));
}

#[test]
fn attribute_ties_match_by_pitch_within_a_chord() {
    let graph = convert(&score(
        r#"<measure n="1"><staff n="1"><layer n="1">
            <chord dur="2">
                <note pname="c" oct="4" tie="i"/>
                <note pname="e" oct="4"/>
            </chord>
            <chord dur="2">
                <note pname="c" oct="4" tie="t"/>
                <note pname="e" oct="4"/>
            </chord>
        </layer></staff></measure>"#,
    ));

    assert_eq!(graph.ties.len(), 1);
    // both endpoints address the bottom chord pitch
    assert_eq!(graph.ties[0].start_indices, vec![0]);
    assert_eq!(graph.ties[0].end_indices, vec![0]);
}

#[test]
fn nested_slur_attributes_pair_by_level() {
    let graph = convert(&score(
        r#"<measure n="1"><staff n="1"><layer n="1">
            <note xml:id="a" pname="c" oct="5" dur="4" slur="i1"/>
            <note xml:id="b" pname="d" oct="5" dur="4" slur="i2"/>
            <note xml:id="c" pname="e" oct="5" dur="4" slur="t2"/>
            <note xml:id="d" pname="f" oct="5" dur="4" slur="t1"/>
        </layer></staff></measure>"#,
    ));

    assert_eq!(graph.slurs.len(), 2);
    use meilayout::model::EventIx;
    // the level-1 slur spans all four notes, the level-2 slur the middle two
    assert_eq!(graph.slurs[0].start, Some(EventIx(0)));
    assert_eq!(graph.slurs[0].end, Some(EventIx(3)));
    assert_eq!(graph.slurs[1].start, Some(EventIx(1)));
    assert_eq!(graph.slurs[1].end, Some(EventIx(2)));
}

#[test]
fn malformed_slur_attribute_is_fatal() {
    let result = convert_mei(
        &score(
            r#"<measure n="1"><staff n="1"><layer n="1">
                <note pname="c" oct="5" dur="4" slur="i12"/>
            </layer></staff></measure>"#,
        ),
        &Config::default(),
    );
    assert!(matches!(
        result,
        Err(ConvertError::MalformedSlurAttribute { .. })
    ));
}

#[test]
fn slur_element_with_explicit_references_and_direction() {
    let graph = convert(&score(&format!(
        r##"<measure n="1">
            <staff n="1"><layer n="1">{}{}</layer></staff>
            <slur startid="#a" endid="#b" curvedir="below"/>
        </measure>"##,
        quarter("a", "c", 5),
        quarter("b", "e", 5),
    )));

    assert_eq!(graph.slurs.len(), 1);
    assert_eq!(
        graph.slurs[0].direction,
        Some(meilayout::model::CurveDir::Below)
    );
}

#[test]
fn hairpin_end_in_a_later_measure_resolves_when_walked() {
    let graph = convert(&score(&format!(
        r#"<measure n="1">
            <staff n="1"><layer n="1">{}</layer></staff>
            <hairpin form="cres" staff="1" tstamp="1" tstamp2="1m+1"/>
        </measure>
        <measure n="2"><staff n="1"><layer n="1">{}</layer></staff></measure>"#,
        quarter("a", "c", 5),
        quarter("b", "d", 5),
    )));

    assert_eq!(graph.hairpins.len(), 1);
    assert_eq!(
        graph.hairpins[0].kind,
        meilayout::model::HairpinKind::Crescendo
    );
}

#[test]
fn hairpin_into_a_never_visited_measure_is_dropped() {
    let graph = convert(&score(&format!(
        r#"<measure n="1">
            <staff n="1"><layer n="1">{}</layer></staff>
            <hairpin form="dim" staff="1" tstamp="1" tstamp2="5m+1"/>
        </measure>"#,
        quarter("a", "c", 5),
    )));
    assert!(graph.hairpins.is_empty());
}

#[test]
fn duplicate_ids_resolve_to_the_later_event() {
    let graph = convert(&score(
        r##"<measure n="1">
            <staff n="1"><layer n="1">
                <note xml:id="dup" pname="c" oct="5" dur="2"/>
                <note xml:id="dup" pname="g" oct="5" dur="2"/>
            </layer></staff>
            <dynam startid="#dup">p</dynam>
        </measure>"##,
    ));

    assert!(graph.events[0].modifiers.is_empty());
    assert!(matches!(
        graph.events[1].modifiers[0],
        EventModifier::Text { .. }
    ));
}

#[test]
fn grace_notes_attach_to_the_following_event() {
    let graph = convert(&score(
        r#"<measure n="1"><staff n="1"><layer n="1">
            <note pname="b" oct="4" dur="8" grace="acc"/>
            <note pname="c" oct="5" dur="1"/>
        </layer></staff></measure>"#,
    ));

    let voice = &graph.systems[0].measures[0].voices[0];
    assert_eq!(voice.events.len(), 1, "grace notes are not voice members");
    let host = &graph.events[voice.events[0].0];
    assert!(matches!(
        &host.modifiers[0],
        EventModifier::GraceGroup { events } if events.len() == 1
    ));
}

#[test]
fn beams_collect_beamable_events() {
    let graph = convert(&score(
        r#"<measure n="1"><staff n="1"><layer n="1">
            <beam>
                <note pname="c" oct="5" dur="8"/>
                <note pname="d" oct="5" dur="8"/>
                <note pname="e" oct="5" dur="8"/>
                <note pname="f" oct="5" dur="8"/>
            </beam>
            <note pname="g" oct="5" dur="2"/>
        </layer></staff></measure>"#,
    ));

    assert_eq!(graph.beams.len(), 1);
    assert_eq!(graph.beams[0].events.len(), 4);
    assert!(graph.beams[0].auto_stem);
}

#[test]
fn explicit_stem_direction_inside_a_beam_disables_auto_stemming() {
    let graph = convert(&score(
        r#"<measure n="1"><staff n="1"><layer n="1">
            <beam>
                <note pname="c" oct="5" dur="8" stem.dir="up"/>
                <note pname="d" oct="5" dur="8"/>
            </beam>
        </layer></staff></measure>"#,
    ));
    assert!(!graph.beams[0].auto_stem);
}

#[test]
fn tuplet_carries_its_ratio_and_bracket() {
    let graph = convert(&score(
        r#"<measure n="1"><staff n="1"><layer n="1">
            <tuplet num="3" numbase="2" bracket.visible="true" bracket.place="below">
                <note pname="c" oct="5" dur="8"/>
                <note pname="d" oct="5" dur="8"/>
                <note pname="e" oct="5" dur="8"/>
            </tuplet>
        </layer></staff></measure>"#,
    ));

    assert_eq!(graph.tuplets.len(), 1);
    let tuplet = &graph.tuplets[0];
    assert_eq!(tuplet.num_notes, 3);
    assert_eq!(tuplet.beats_occupied, 2);
    assert!(tuplet.bracketed);
    assert_eq!(tuplet.location, Some(-1));
    assert_eq!(tuplet.events.len(), 3);
}

#[test]
fn measure_rest_takes_the_nominal_measure_duration() {
    let xml = r#"<mei><score>
        <scoreDef meter.count="3" meter.unit="4">
            <staffGrp><staffDef n="1" clef.shape="G" clef.line="2"/></staffGrp>
        </scoreDef>
        <section><measure n="1"><staff n="1"><layer n="1">
            <mRest/>
        </layer></staff></measure></section>
    </score></mei>"#;
    let graph = convert(xml);

    assert!(matches!(graph.events[0].kind, EventKind::MeasureRest));
    assert_eq!(graph.events[0].ticks, 3 * (meilayout::tables::RESOLUTION / 4));
}

#[test]
fn absurd_meter_falls_back_to_the_default_for_measure_rests() {
    let xml = r#"<mei><score>
        <scoreDef meter.count="2000000000" meter.unit="4">
            <staffGrp><staffDef n="1" clef.shape="G" clef.line="2"/></staffGrp>
        </scoreDef>
        <section><measure n="1"><staff n="1"><layer n="1">
            <mRest/>
        </layer></staff></measure></section>
    </score></mei>"#;
    let graph = convert(xml);

    // the unusable meter is ignored, so the rest spans a 4/4 measure
    assert_eq!(graph.events[0].ticks, meilayout::tables::RESOLUTION);
}

#[test]
fn note_without_duration_falls_back_to_a_quarter() {
    let graph = convert(&score(
        r#"<measure n="1"><staff n="1"><layer n="1">
            <note pname="c" oct="5"/>
        </layer></staff></measure>"#,
    ));
    assert_eq!(graph.events[0].ticks, meilayout::tables::RESOLUTION / 4);
}

#[test]
fn note_without_pitch_attributes_falls_back_to_c4() {
    let graph = convert(&score(
        r#"<measure n="1"><staff n="1"><layer n="1">
            <note dur="4"/>
        </layer></staff></measure>"#,
    ));

    match &graph.events[0].kind {
        EventKind::Note { pitch } => {
            assert_eq!(pitch.name, "c");
            assert_eq!(pitch.octave, 4);
        }
        other => panic!("expected a note, got {other:?}"),
    }
}

#[test]
fn ending_brackets_span_their_measures() {
    let graph = convert(&score(&format!(
        r#"<ending n="2">
            <measure n="1"><staff n="1"><layer n="1">{}</layer></staff></measure>
            <measure n="2"><staff n="1"><layer n="1">{}</layer></staff></measure>
        </ending>"#,
        quarter("a", "c", 5),
        quarter("b", "d", 5),
    )));

    let first = graph.systems[0].measures[0].staves[&1].volta.as_ref().unwrap();
    let last = graph.systems[0].measures[1].staves[&1].volta.as_ref().unwrap();
    assert_eq!(first.number.as_deref(), Some("2"));
    assert!(first.start && !first.end);
    assert!(!last.start && last.end);
}

#[test]
fn staff_without_integer_n_is_fatal() {
    let result = convert_mei(
        &score(r#"<measure n="1"><staff n="one"><layer n="1"/></staff></measure>"#),
        &Config::default(),
    );
    assert!(matches!(
        result,
        Err(ConvertError::InvalidStaveNumber { .. })
    ));
}

#[test]
fn staff_without_definition_is_fatal() {
    let result = convert_mei(
        &score(r#"<measure n="1"><staff n="9"><layer n="1"/></staff></measure>"#),
        &Config::default(),
    );
    assert!(matches!(
        result,
        Err(ConvertError::UnknownStave { stave_n: 9, .. })
    ));
}

#[test]
fn document_without_score_is_fatal() {
    let result = convert_mei("<mei><music/></mei>", &Config::default());
    assert!(matches!(result, Err(ConvertError::NoScore)));
}

#[test]
fn conversion_is_deterministic() {
    let xml = score(&format!(
        r##"<measure n="1">
            <staff n="1"><layer n="1">{}{}</layer></staff>
            <slur startid="#a" endid="#b"/>
        </measure>"##,
        quarter("a", "c", 5),
        quarter("b", "e", 5),
    ));
    let first = meilayout::graph_to_json(&convert(&xml)).unwrap();
    let second = meilayout::graph_to_json(&convert(&xml)).unwrap();
    assert_eq!(first, second);
}
