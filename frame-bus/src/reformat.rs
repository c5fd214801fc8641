use bytes::Bytes;

use crate::{
    error::{RelayError, RelayResult},
    frame::{Frame, PixelFormat},
    half::HalfTable,
};

/// Converts inbound frames into the byte layout the encoder reads.
///
/// * `Rgba8`: passthrough, the payload is returned as is.
/// * `Rgba16Half`: R, G, B are decoded, floored at 0.0 and written as three
///   little-endian f32 planes in G, B, R order (`gbrpf32le`). Alpha is dropped.
#[derive(Clone, Copy)]
pub struct Reformatter {
    table: &'static HalfTable,
}

impl Reformatter {
    pub fn new(table: &'static HalfTable) -> Self {
        Self { table }
    }

    pub fn reformat(&self, frame: Frame) -> RelayResult<Bytes> {
        frame.check_len()?;
        match frame.geometry().format {
            PixelFormat::Rgba8 => Ok(frame.into_data()),
            PixelFormat::Rgba16Half => Ok(self.half_to_planar(frame.data())),
        }
    }

    /// Same as [`Reformatter::reformat`], run on the blocking pool.
    pub async fn reformat_blocking(&self, frame: Frame) -> RelayResult<Bytes> {
        let this = *self;
        match tokio::task::spawn_blocking(move || this.reformat(frame)).await {
            Ok(result) => result,
            Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
            Err(_) => Err(RelayError::Cancelled),
        }
    }

    fn half_to_planar(&self, src: &[u8]) -> Bytes {
        let pixels = src.len() / 8;
        let plane = pixels * size_of::<f32>();
        let mut out = vec![0u8; plane * 3];

        let (g_plane, rest) = out.split_at_mut(plane);
        let (b_plane, r_plane) = rest.split_at_mut(plane);

        let planes = g_plane
            .chunks_exact_mut(4)
            .zip(b_plane.chunks_exact_mut(4))
            .zip(r_plane.chunks_exact_mut(4));
        for (px, ((g, b), r)) in src.chunks_exact(8).zip(planes) {
            r.copy_from_slice(&self.channel(px[0], px[1]).to_le_bytes());
            g.copy_from_slice(&self.channel(px[2], px[3]).to_le_bytes());
            b.copy_from_slice(&self.channel(px[4], px[5]).to_le_bytes());
        }

        Bytes::from(out)
    }

    #[inline]
    fn channel(&self, lo: u8, hi: u8) -> f32 {
        let v = self.table.decode(u16::from_le_bytes([lo, hi]));
        // negatives (including -0.0) become +0.0; NaN is not passed through
        // to the encoder either, it is written as +0.0
        if v > 0.0 { v } else { 0.0 }
    }
}

#[cfg(test)]
#[path = "reformat_test.rs"]
mod reformat_test;
