pub mod frame_ws;
pub mod status;
