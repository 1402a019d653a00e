use falconx::listmode::{
    gate_word, numbered_packet, pulse_word, stats_packet, sync_word, toa_word, words_to_bytes,
    LmDecoder, LmEvent, LmStats, STREAM_ALIGN_WORD,
};
use proptest::prelude::*;
use rand::Rng;

fn drain(dec: &mut LmDecoder) -> Vec<LmEvent> {
    std::iter::from_fn(|| dec.next_event()).collect()
}

fn decode_whole(bytes: &[u8]) -> Vec<LmEvent> {
    let mut dec = LmDecoder::new();
    dec.push(bytes);
    dec.finish();
    drain(&mut dec)
}

/// One well-formed packet as words.
fn packet() -> impl Strategy<Value = Vec<u32>> {
    let amplitude = -(1i32 << 23)..(1i32 << 23);
    prop_oneof![
        (amplitude.clone(), any::<bool>()).prop_map(|(a, invalid)| vec![pulse_word(a, invalid)]),
        (amplitude, 0u16..0x1000, any::<u8>(), any::<bool>()).prop_map(|(a, ts, sub, marked)| {
            vec![pulse_word(a, false), toa_word(ts, sub, marked)]
        }),
        (0u32..0x100_0000).prop_map(|ts| vec![sync_word(ts)]),
        (any::<bool>(), 0u32..0x100_0000).prop_map(|(high, ts)| vec![gate_word(high, ts)]),
        (
            prop::sample::select(vec![0xa, 0xb, 0xe]),
            0u32..0x100_0000,
            0u32..0x100_0000,
            any::<bool>()
        )
            .prop_map(|(tag, accepted, ts, gate)| stats_packet(
                tag,
                &LmStats {
                    time_elapsed: u64::from(accepted) << 8,
                    pulses_accepted: accepted,
                    gate_state: gate.then_some(true),
                    timestamp: ts,
                    ..Default::default()
                },
            )),
        (prop::collection::vec((0u32..6, 0u32..0x100_0000), 0..6), 0u32..0x100_0000)
            .prop_map(|(axes, ts)| numbered_packet(0xc, &axes, ts)),
    ]
}

/// A word the decoder cannot start a record with and whose bytes cannot
/// form part of an alignment word.
fn corrupt_word() -> impl Strategy<Value = u32> {
    (0x90u32..0xa0, 0x80u32..0x100, 0x80u32..0x100, 0x80u32..0x100)
        .prop_map(|(a, b, c, d)| (a << 24) | (b << 16) | (c << 8) | d)
}

proptest! {
    #[test]
    fn every_record_consumes_input(
        bytes in prop::collection::vec(any::<u8>(), 0..512),
        chunk in 1usize..64,
    ) {
        let mut dec = LmDecoder::new();
        let mut last = dec.position();
        let mut records = 0usize;
        for piece in bytes.chunks(chunk) {
            dec.push(piece);
            while let Some(_) = dec.next_event() {
                prop_assert!(dec.position() > last);
                last = dec.position();
                records += 1;
            }
        }
        dec.finish();
        while let Some(_) = dec.next_event() {
            prop_assert!(dec.position() > last);
            last = dec.position();
            records += 1;
        }
        prop_assert!(records <= bytes.len());
        prop_assert!(dec.position() <= bytes.len() as u64);
    }

    #[test]
    fn well_formed_streams_decode_cleanly(packets in prop::collection::vec(packet(), 0..40)) {
        let mut words = vec![STREAM_ALIGN_WORD];
        for p in &packets {
            words.extend(p);
        }
        let events = decode_whole(&words_to_bytes(&words));
        prop_assert!(!events.iter().any(|e| matches!(e, LmEvent::Error(_))));
        prop_assert_eq!(events.len(), packets.len() + 1);
    }

    #[test]
    fn corrupt_head_resyncs_at_alignment(
        head in corrupt_word(),
        junk in prop::collection::vec(corrupt_word(), 0..8),
        packets in prop::collection::vec(packet(), 0..10),
    ) {
        let mut words = vec![head];
        words.extend(&junk);
        let align_at = 4 * words.len() as u64;
        words.push(STREAM_ALIGN_WORD);
        for p in &packets {
            words.extend(p);
        }

        let mut dec = LmDecoder::new();
        dec.push(&words_to_bytes(&words));
        dec.finish();
        prop_assert!(matches!(dec.next_event(), Some(LmEvent::Error(_))));
        prop_assert!(dec.is_scanning());
        prop_assert_eq!(dec.next_event(), Some(LmEvent::StreamAlign(STREAM_ALIGN_WORD)));
        prop_assert_eq!(dec.position(), align_at + 4);
        let rest = drain(&mut dec);
        prop_assert_eq!(rest.len(), packets.len());
        prop_assert_eq!(dec.errors(), 1);
    }

    #[test]
    fn pulse_amplitude_round_trip(amplitude in -(1i32 << 23)..(1i32 << 23), invalid in any::<bool>()) {
        let events = decode_whole(&words_to_bytes(&[pulse_word(amplitude, invalid)]));
        match events.as_slice() {
            [LmEvent::Pulse(p)] => {
                prop_assert_eq!(p.amplitude, amplitude);
                prop_assert_eq!(p.invalid, invalid);
            }
            other => prop_assert!(false, "unexpected records {:?}", other),
        }
    }
}

#[test]
fn random_chunking_matches_single_push() {
    let mut words = vec![STREAM_ALIGN_WORD];
    for i in 0..200 {
        words.push(pulse_word(i, false));
        if i % 3 == 0 {
            words.push(toa_word(i as u16, 7, false));
        }
        if i % 50 == 49 {
            words.extend(stats_packet(
                0xe,
                &LmStats {
                    pulses_accepted: i as u32,
                    ..Default::default()
                },
            ));
        }
    }
    let bytes = words_to_bytes(&words);
    let expected = decode_whole(&bytes);

    let mut rng = rand::rng();
    for _ in 0..20 {
        let mut dec = LmDecoder::new();
        let mut events = Vec::new();
        let mut rest = bytes.as_slice();
        while !rest.is_empty() {
            let n = rng.random_range(1..=rest.len().min(13));
            let (piece, tail) = rest.split_at(n);
            dec.push(piece);
            events.extend(drain(&mut dec));
            rest = tail;
        }
        dec.finish();
        events.extend(drain(&mut dec));
        assert_eq!(events, expected);
    }
}
