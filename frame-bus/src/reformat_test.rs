// ============================================================================
// Reformatter Tests
// ============================================================================

use bytes::Bytes;

use super::Reformatter;
use crate::{
    error::RelayError,
    frame::{Frame, FrameGeometry, PixelFormat},
    half::half_table,
};

fn reformatter() -> Reformatter {
    Reformatter::new(half_table())
}

/// Packs RGBA half-float pixels the way a browser `Uint16Array` lays them out.
fn half_pixels(pixels: &[[u16; 4]]) -> Vec<u8> {
    pixels
        .iter()
        .flat_map(|px| px.iter().flat_map(|c| c.to_le_bytes()))
        .collect()
}

fn read_f32s(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

// ------------------------------------------------------------------------
// Passthrough
// ------------------------------------------------------------------------

#[test]
fn test_rgba8_is_identity() {
    let geometry = FrameGeometry::new(3, 2, PixelFormat::Rgba8);
    let data: Vec<u8> = (0..geometry.input_len() as u8).collect();
    let frame = Frame::new(geometry, data.clone());

    let out = reformatter().reformat(frame).unwrap();
    assert_eq!(out.as_ref(), data.as_slice());
}

#[test]
fn test_rgba8_passthrough_does_not_copy() {
    let geometry = FrameGeometry::new(1, 1, PixelFormat::Rgba8);
    let data = Bytes::from_static(&[1, 2, 3, 4]);
    let ptr = data.as_ptr();

    let out = reformatter().reformat(Frame::new(geometry, data)).unwrap();
    assert_eq!(out.as_ptr(), ptr);
}

#[test]
fn test_rgba8_wrong_length_is_malformed() {
    let geometry = FrameGeometry::new(2, 2, PixelFormat::Rgba8);
    let err = reformatter()
        .reformat(Frame::new(geometry, vec![0u8; 12]))
        .unwrap_err();
    assert_eq!(
        err,
        RelayError::MalformedFrame {
            expected: 16,
            actual: 12
        }
    );
}

// ------------------------------------------------------------------------
// Half float -> planar f32
// ------------------------------------------------------------------------

#[test]
fn test_single_pixel_plane_order_and_clamp() {
    let geometry = FrameGeometry::new(1, 1, PixelFormat::Rgba16Half);
    // R = 1.0, G = 0.0, B = -1.0, A = 0.5
    let frame = Frame::new(geometry, half_pixels(&[[0x3c00, 0x0000, 0xbc00, 0x3800]]));

    let out = reformatter().reformat(frame).unwrap();
    assert_eq!(out.len(), 12);
    assert_eq!(read_f32s(&out), vec![0.0, 0.0, 1.0]);
}

#[test]
fn test_planes_are_indexed_by_pixel() {
    let geometry = FrameGeometry::new(2, 1, PixelFormat::Rgba16Half);
    let frame = Frame::new(
        geometry,
        half_pixels(&[
            // R = 1.0, G = 2.0, B = 0.5
            [0x3c00, 0x4000, 0x3800, 0x3c00],
            // R = 4.0, G = 0.25, B = 8.0
            [0x4400, 0x3400, 0x4800, 0x0000],
        ]),
    );

    let out = reformatter().reformat(frame).unwrap();
    assert_eq!(out.len(), geometry.output_len());
    assert_eq!(
        read_f32s(&out),
        vec![
            2.0, 0.25, // G plane
            0.5, 8.0, // B plane
            1.0, 4.0, // R plane
        ]
    );
}

#[test]
fn test_nan_infinity_and_negative_zero() {
    let geometry = FrameGeometry::new(1, 1, PixelFormat::Rgba16Half);
    // R = +inf, G = NaN, B = -0.0
    let frame = Frame::new(geometry, half_pixels(&[[0x7c00, 0x7e00, 0x8000, 0xffff]]));

    let out = read_f32s(&reformatter().reformat(frame).unwrap());
    assert_eq!(out[0].to_bits(), 0.0f32.to_bits());
    assert_eq!(out[1].to_bits(), 0.0f32.to_bits());
    assert_eq!(out[2], f32::INFINITY);
}

#[test]
fn test_half_length_not_multiple_of_eight_is_malformed() {
    let geometry = FrameGeometry::new(1, 1, PixelFormat::Rgba16Half);
    let err = reformatter()
        .reformat(Frame::new(geometry, vec![0u8; 7]))
        .unwrap_err();
    assert!(matches!(
        err,
        RelayError::MalformedFrame {
            expected: 8,
            actual: 7
        }
    ));
}

#[test]
fn test_half_extra_pixel_is_not_truncated() {
    let geometry = FrameGeometry::new(1, 1, PixelFormat::Rgba16Half);
    let result = reformatter().reformat(Frame::new(geometry, vec![0u8; 16]));
    assert!(matches!(result, Err(RelayError::MalformedFrame { .. })));
}

#[tokio::test]
async fn test_reformat_blocking_matches_inline() {
    let geometry = FrameGeometry::new(4, 4, PixelFormat::Rgba16Half);
    let data: Vec<u8> = (0..geometry.input_len())
        .map(|i| (i * 37 % 251) as u8)
        .collect();

    let inline = reformatter()
        .reformat(Frame::new(geometry, data.clone()))
        .unwrap();
    let blocking = reformatter()
        .reformat_blocking(Frame::new(geometry, data))
        .await
        .unwrap();
    assert_eq!(inline, blocking);
}

#[test]
fn test_nan_channels_are_not_passed_through() {
    let geometry = FrameGeometry::new(1, 1, PixelFormat::Rgba16Half);
    // quiet, negative and signalling NaN patterns
    let frame = Frame::new(geometry, half_pixels(&[[0x7e00, 0xfe00, 0x7c01, 0x7e00]]));

    let out = read_f32s(&reformatter().reformat(frame).unwrap());
    assert!(out.iter().all(|v| v.to_bits() == 0.0f32.to_bits()));
}
