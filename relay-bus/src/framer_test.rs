use bytes::Bytes;

use super::{FixedFramer, MarkerFramer};
use crate::layout::{PixelFormat, PixelLayout};

fn yuv_4x2_framer() -> FixedFramer {
    let layout = PixelLayout::new(PixelFormat::PackedYuv422, 4, 2).unwrap();
    FixedFramer::new(layout.frame_size())
}

fn feed_fixed(framer: &mut FixedFramer, data: &[u8], chunk: usize) -> Vec<Bytes> {
    let mut frames = Vec::new();
    for piece in data.chunks(chunk) {
        frames.extend(framer.push(piece));
    }
    frames
}

fn feed_marker(framer: &mut MarkerFramer, data: &[u8], chunk: usize) -> Vec<Bytes> {
    let mut frames = Vec::new();
    for piece in data.chunks(chunk) {
        frames.extend(framer.push(piece));
    }
    frames
}

fn jpeg_stream() -> Vec<u8> {
    vec![
        0x00, 0x13, 0x37, // garbage
        0xFF, 0xD8, 0x01, 0xFF, 0xD9, //
        0xFF, 0xD8, 0x02, 0xFF, 0xD9,
    ]
}

// ------------------------------------------------------------------------
// FixedFramer
// ------------------------------------------------------------------------

#[test]
fn test_fixed_exact_frame() {
    let mut framer = yuv_4x2_framer();
    assert_eq!(framer.frame_size(), 16);

    let frames: Vec<Bytes> = framer.push(&[7u8; 16]).collect();
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].len(), 16);
    assert_eq!(framer.remainder_len(), 0);
}

#[test]
fn test_fixed_two_frames_and_remainder() {
    let mut framer = yuv_4x2_framer();
    let data: Vec<u8> = (0..40u8).collect();

    let frames: Vec<Bytes> = framer.push(&data).collect();
    assert_eq!(frames.len(), 2);
    assert_eq!(&frames[0][..], &data[0..16]);
    assert_eq!(&frames[1][..], &data[16..32]);
    assert_eq!(framer.remainder_len(), 8);

    // The remainder completes with the next chunk
    let frames: Vec<Bytes> = framer.push(&[0xAA; 8]).collect();
    assert_eq!(frames.len(), 1);
    assert_eq!(&frames[0][..8], &data[32..40]);
    assert_eq!(framer.remainder_len(), 0);
}

#[test]
fn test_fixed_unconsumed_frames_are_yielded_next_time() {
    let mut framer = yuv_4x2_framer();
    let data: Vec<u8> = (0..48u8).collect();

    let first = framer.push(&data).next().unwrap();
    assert_eq!(&first[..], &data[0..16]);

    let rest: Vec<Bytes> = framer.push(&[]).collect();
    assert_eq!(rest.len(), 2);
    assert_eq!(&rest[1][..], &data[32..48]);
}

#[test]
fn test_fixed_chunking_does_not_change_output() {
    let data: Vec<u8> = (0..1000u32).map(|i| (i % 251) as u8).collect();
    let reference = feed_fixed(&mut yuv_4x2_framer(), &data, data.len());
    assert_eq!(reference.len(), 1000 / 16);

    for chunk in [1, 3, 7, 15, 16, 17, 64, 333] {
        let frames = feed_fixed(&mut yuv_4x2_framer(), &data, chunk);
        assert_eq!(frames, reference, "chunk size {}", chunk);
    }
}

#[test]
fn test_fixed_remainder_never_exceeds_frame() {
    let mut framer = yuv_4x2_framer();
    for _ in 0..100 {
        let _ = framer.push(&[1u8; 37]).count();
        assert!(framer.remainder_len() < 16);
    }
}

#[test]
fn test_fixed_skip_keeps_alignment() {
    let data: Vec<u8> = (0..160u8).collect();
    let mut framer = yuv_4x2_framer();

    // Skip 2.5 frames, then frame the rest
    assert_eq!(framer.skip(&data[..40]), 2);
    let frames: Vec<Bytes> = framer.push(&data[40..]).collect();
    assert_eq!(frames.len(), 7);
    assert_eq!(&frames[0][..], &data[48..64]);
    assert_eq!(&frames[6][..], &data[144..160]);
}

#[test]
fn test_fixed_skip_completes_partial_frame() {
    let data: Vec<u8> = (0..64u8).collect();
    let mut framer = yuv_4x2_framer();

    let _ = framer.push(&data[..10]).count();
    assert_eq!(framer.skip(&data[10..20]), 1);
    assert_eq!(framer.remainder_len(), 4);

    let frames: Vec<Bytes> = framer.push(&data[20..]).collect();
    assert_eq!(frames.len(), 2);
    assert_eq!(&frames[0][..], &data[32..48]);
}

#[test]
fn test_fixed_skip_counts_frames_across_chunks() {
    let mut framer = yuv_4x2_framer();
    let skipped: usize = [10usize, 10, 10, 20, 14]
        .iter()
        .map(|n| framer.skip(&vec![0u8; *n]))
        .sum();
    assert_eq!(skipped, 4);
    assert_eq!(framer.remainder_len(), 0);
}

#[test]
fn test_fixed_reset_drops_remainder() {
    let mut framer = yuv_4x2_framer();
    let _ = framer.push(&[0u8; 20]).count();
    framer.reset();
    assert_eq!(framer.remainder_len(), 0);
}

// ------------------------------------------------------------------------
// MarkerFramer
// ------------------------------------------------------------------------

#[test]
fn test_marker_extracts_frames_and_drops_garbage() {
    let mut framer = MarkerFramer::new();
    let frames: Vec<Bytes> = framer.push(&jpeg_stream()).collect();

    assert_eq!(frames.len(), 2);
    assert_eq!(&frames[0][..], &[0xFF, 0xD8, 0x01, 0xFF, 0xD9]);
    assert_eq!(&frames[1][..], &[0xFF, 0xD8, 0x02, 0xFF, 0xD9]);
    assert_eq!(framer.buffered_len(), 0);
}

#[test]
fn test_marker_chunking_does_not_change_output() {
    let mut data = jpeg_stream();
    data.extend_from_slice(&[0xFF, 0xD8, 0xFF, 0x00, 0x03, 0x04, 0xFF, 0xD9, 0x55]);
    let reference = feed_marker(&mut MarkerFramer::new(), &data, data.len());
    assert_eq!(reference.len(), 3);

    for chunk in 1..data.len() {
        let frames = feed_marker(&mut MarkerFramer::new(), &data, chunk);
        assert_eq!(frames, reference, "chunk size {}", chunk);
    }
}

#[test]
fn test_marker_keeps_incomplete_frame() {
    let mut framer = MarkerFramer::new();
    assert_eq!(framer.push(&[0x01, 0x02, 0xFF, 0xD8, 0x10, 0x11]).count(), 0);
    // Leading garbage is gone, the open frame is retained
    assert_eq!(framer.buffered_len(), 4);

    let frames: Vec<Bytes> = framer.push(&[0x12, 0xFF, 0xD9]).collect();
    assert_eq!(frames.len(), 1);
    assert_eq!(&frames[0][..], &[0xFF, 0xD8, 0x10, 0x11, 0x12, 0xFF, 0xD9]);
}

#[test]
fn test_marker_end_must_follow_start() {
    // FF D8 D9: the end marker may not overlap the start marker
    let mut framer = MarkerFramer::new();
    assert_eq!(framer.push(&[0xFF, 0xD8, 0xD9]).count(), 0);
    let frames: Vec<Bytes> = framer.push(&[0xFF, 0xD9]).collect();
    assert_eq!(&frames[0][..], &[0xFF, 0xD8, 0xD9, 0xFF, 0xD9]);
}

#[test]
fn test_marker_buffer_stays_bounded_without_markers() {
    let mut framer = MarkerFramer::new();
    let noise: Vec<u8> = (0..4096u32).map(|i| (i % 200) as u8).collect();
    for _ in 0..1000 {
        assert_eq!(framer.push(&noise).count(), 0);
        assert!(framer.buffered_len() <= 1);
    }
}

#[test]
fn test_marker_start_split_across_chunks() {
    let mut framer = MarkerFramer::new();
    assert_eq!(framer.push(&[0x00, 0x00, 0xFF]).count(), 0);
    assert_eq!(framer.buffered_len(), 1);
    let frames: Vec<Bytes> = framer.push(&[0xD8, 0x42, 0xFF, 0xD9]).collect();
    assert_eq!(&frames[0][..], &[0xFF, 0xD8, 0x42, 0xFF, 0xD9]);
}

#[test]
fn test_fixed_skip_passes_over_unpulled_frames() {
    let data: Vec<u8> = (0..64u8).collect();
    let mut framer = yuv_4x2_framer();

    // 2.5 frames buffered, only the first pulled
    let first = framer.push(&data[..40]).next().unwrap();
    assert_eq!(&first[..], &data[0..16]);

    assert_eq!(framer.skip(&data[40..44]), 1);
    assert_eq!(framer.remainder_len(), 12);

    let frames: Vec<Bytes> = framer.push(&data[44..]).collect();
    assert_eq!(frames.len(), 2);
    assert_eq!(&frames[0][..], &data[32..48]);
    assert_eq!(&frames[1][..], &data[48..64]);
}
