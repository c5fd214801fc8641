//! Frame relay primitives: half-float decoding, pixel reformatting, the encoder
//! sink and the single-producer session coordinator.
//!
//! Data Flow:
//! ```text
//! producer ──► Session::push_frame ──► Reformatter ──► SinkWriter ──► ffmpeg stdin
//!                     ▲                                    ▲
//!                     │                                    │
//!              Relay::connect ──────── SinkOpener::open ───┘
//! ```

pub mod encoder;
pub mod error;
pub mod frame;
pub mod half;
pub mod reformat;
pub mod relay;
pub mod sink;

/// Builds the shared half-float table. Call once at startup so the first
/// frame of the first session does not pay for it.
pub fn init() -> &'static half::HalfTable {
    half::half_table()
}
