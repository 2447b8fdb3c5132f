//! End-to-end codec pipeline: encoder → Annex-B byte stream → parser →
//! decoder, with no network in between.

use bytes::Bytes;
use crossbeam_channel::bounded;
use std::time::Duration;

use vidlink_codec::decoder::{Decoder, DecoderCore};
use vidlink_codec::encoder::{package_output, Encoder, EncoderConfig};
use vidlink_codec::engine::{CompressedSample, EngineOutput, RawFrame};
use vidlink_codec::format::{FormatDescription, MediaTime};
use vidlink_codec::intra::{render, IntraEngine, INTRA_PPS};
use vidlink_codec::sps::SpsInfo;
use vidlink_codec::stage::NaluStream;
use vidlink_transport::nal::{NalKind, START_CODE};
use vidlink_transport::parser::{NaluParser, ParserConfig};

const TIMEOUT: Duration = Duration::from_secs(5);

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter("debug")
        .try_init();
}

fn gradient(width: u32, height: u32, seed: u8) -> RawFrame {
    let len = RawFrame::i420_len(width, height);
    let data: Vec<u8> = (0..len)
        .map(|i| if i % 7 == 0 { 0 } else { (i as u8).wrapping_add(seed) })
        .collect();
    RawFrame::new(width, height, Bytes::from(data)).unwrap()
}

#[test]
fn keyframe_yields_exactly_one_decoded_buffer() {
    let format = FormatDescription::from_sps_pps(
        SpsInfo::baseline(320, 240, 20).to_nal(),
        Bytes::from_static(&INTRA_PPS),
    )
    .unwrap();
    let output = EngineOutput::sample(CompressedSample {
        data: Some(Bytes::from_static(&[0, 0, 0, 4, 0x65, 0x88, 0x84, 0x21])),
        format: Some(format),
        keyframe: true,
        presentation: MediaTime::ZERO,
        duration: MediaTime::new(1, 30),
    });

    let packaged = package_output(output).unwrap();
    assert_eq!(packaged.units.len(), 3);
    assert!(packaged.units.iter().all(|u| u.starts_with(&START_CODE)));

    let mut stream: Vec<u8> = packaged.units.concat();
    // Terminate the last unit.
    stream.extend_from_slice(&START_CODE);

    let mut parser = NaluParser::new(ParserConfig::default());
    parser.feed(&stream).unwrap();
    let units: Vec<_> = parser.drain_units().collect();
    let kinds: Vec<_> = units.iter().map(|u| u.kind()).collect();
    assert_eq!(
        kinds,
        vec![
            NalKind::SequenceParams,
            NalKind::PictureParams,
            NalKind::CodedSlice
        ]
    );

    let mut decoder = DecoderCore::new();
    let samples: Vec<_> = units.into_iter().filter_map(|u| decoder.push(u)).collect();
    assert_eq!(samples.len(), 1);
    assert_eq!(samples[0].format().dimensions(), (320, 240));
    assert_eq!(decoder.stats().format_builds, 1);
}

#[test]
fn threaded_pipeline_roundtrips_pictures() {
    init_tracing();
    let (width, height) = (48, 32);
    let frames: Vec<RawFrame> = (0..6).map(|n| gradient(width, height, n * 17)).collect();

    let (display_tx, display_rx) = bounded(32);
    let decoder = Decoder::spawn(64, display_tx).unwrap();
    let (stream_unit_tx, stream_unit_rx) = bounded(64);
    let stream = NaluStream::spawn(ParserConfig::default(), 64, stream_unit_tx).unwrap();

    let (annexb_tx, annexb_rx) = bounded(64);
    let config = EncoderConfig {
        width,
        height,
        keyframe_interval: 3,
        queue_capacity: 16,
        ..EncoderConfig::default()
    };
    let mut encoder = Encoder::new(IntraEngine::new(), config, annexb_tx).unwrap();
    for (n, frame) in frames.iter().enumerate() {
        encoder
            .encode(frame.clone(), MediaTime::new(n as i64, 30), MediaTime::new(1, 30))
            .unwrap();
    }
    encoder.shutdown();

    // Concatenate and re-chunk the byte stream at awkward sizes.
    let mut wire: Vec<u8> = annexb_rx.try_iter().flat_map(|u| u.to_vec()).collect();
    wire.extend_from_slice(&START_CODE);
    for chunk in wire.chunks(333) {
        stream.feed(Bytes::copy_from_slice(chunk)).unwrap();
    }

    for _ in 0..(6 + 2 * 2) {
        let unit = stream_unit_rx.recv_timeout(TIMEOUT).unwrap();
        decoder.decode(unit).unwrap();
    }

    let decoded: Vec<RawFrame> = (0..6)
        .map(|_| render(&display_rx.recv_timeout(TIMEOUT).unwrap()).unwrap())
        .collect();
    assert_eq!(decoded, frames);

    let stats = decoder.stats();
    assert_eq!(stats.format_builds, 2);
    assert_eq!(stats.slices_dropped, 0);
}
