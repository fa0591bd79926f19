// tests/test_frame.rs — raw I420 file source and sink.

use std::io::Write;

use pyramid_me::error::FrameError;
use pyramid_me::frame::{
    i420_frame_size, FieldSelect, Frame, FrameSink, FrameSource, Pattern, Polarity, SyntheticSource,
    YuvFileSink, YuvFileSource,
};

fn write_clip(path: &std::path::Path, width: u32, height: u32, frames: usize) -> Vec<u8> {
    let size = i420_frame_size(width, height);
    let bytes: Vec<u8> = (0..size * frames).map(|i| (i * 31 % 251) as u8).collect();
    std::fs::File::create(path).unwrap().write_all(&bytes).unwrap();
    bytes
}

#[test]
fn source_counts_whole_frames_only() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("clip.yuv");
    let mut bytes = write_clip(&path, 16, 8, 3);
    // A trailing partial frame is not counted.
    bytes.extend_from_slice(&[0; 10]);
    std::fs::write(&path, &bytes).unwrap();

    let src = YuvFileSource::open(&path, 16, 8).unwrap();
    assert_eq!(src.frame_count(), 3);
}

#[test]
fn source_reads_requested_frame() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("clip.yuv");
    let bytes = write_clip(&path, 16, 8, 3);
    let size = i420_frame_size(16, 8);

    let mut src = YuvFileSource::open(&path, 16, 8).unwrap();
    let mut frame = Frame::new(0, 0);
    src.get_sample(2, &mut frame, FieldSelect::Frame).unwrap();
    let mut out = Vec::new();
    frame.write_i420(&mut out);
    assert_eq!(out, bytes[2 * size..3 * size].to_vec());

    // Random access backwards.
    src.get_sample(0, &mut frame, FieldSelect::Frame).unwrap();
    assert_eq!(frame.luma().get(1, 0), bytes[1]);
}

#[test]
fn source_field_select_halves_height() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("clip.yuv");
    let bytes = write_clip(&path, 8, 8, 1);
    let mut src = YuvFileSource::open(&path, 8, 8).unwrap();
    let mut field = Frame::new(0, 0);
    src.get_sample(0, &mut field, FieldSelect::Field(Polarity::Bottom)).unwrap();
    assert_eq!((field.width(), field.height()), (8, 4));
    // Field row 0 is frame row 1.
    assert_eq!(field.luma().row(0), &bytes[8..16]);
}

#[test]
fn source_out_of_range() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("clip.yuv");
    write_clip(&path, 8, 8, 2);
    let mut src = YuvFileSource::open(&path, 8, 8).unwrap();
    let mut frame = Frame::new(8, 8);
    let err = src.get_sample(5, &mut frame, FieldSelect::Frame).unwrap_err();
    assert!(matches!(err, FrameError::OutOfRange { index: 5, count: 2 }));
}

#[test]
fn missing_file_is_io_error() {
    let dir = tempfile::tempdir().unwrap();
    let err = YuvFileSource::open(dir.path().join("nope.yuv"), 8, 8).err().unwrap();
    assert!(matches!(err, FrameError::Io { .. }));
}

#[test]
fn sink_writes_frames_in_order() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("out.yuv");
    let src = SyntheticSource::new(16, 16, 2, Pattern::Moving { dx: 1, dy: 0 });
    let mut sink = YuvFileSink::new();
    sink.append_frame(&src.render(0)).unwrap();
    sink.append_frame(&src.render(1)).unwrap();
    sink.write_to_file(&path).unwrap();

    let written = std::fs::read(&path).unwrap();
    let mut expected = Vec::new();
    src.render(0).write_i420(&mut expected);
    src.render(1).write_i420(&mut expected);
    assert_eq!(written, expected);
}

#[test]
fn sink_rejects_size_change() {
    let mut sink = YuvFileSink::new();
    sink.append_frame(&Frame::new(16, 16)).unwrap();
    let err = sink.append_frame(&Frame::new(32, 16)).unwrap_err();
    assert!(matches!(err, FrameError::SizeMismatch { actual_w: 32, .. }));
}

#[test]
fn file_round_trip_through_sink_and_source() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("rt.yuv");
    let synth = SyntheticSource::new(24, 12, 3, Pattern::Gradient { dx: 2, dy: 1 });
    let mut sink = YuvFileSink::new();
    for i in 0..3 {
        sink.append_frame(&synth.render(i)).unwrap();
    }
    sink.write_to_file(&path).unwrap();

    let mut src = YuvFileSource::open(&path, 24, 12).unwrap();
    let mut frame = Frame::new(0, 0);
    for i in 0..3 {
        src.get_sample(i, &mut frame, FieldSelect::Frame).unwrap();
        assert_eq!(frame, synth.render(i), "frame {i}");
    }
}
