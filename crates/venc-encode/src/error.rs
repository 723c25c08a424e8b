use std::ffi::c_int;

use thiserror::Error;
use venc_ffmpeg::LoadError;

/// Errors returned by encoder sessions.
#[derive(Debug, Error)]
pub enum EncodeError {
    #[error("invalid codec settings: {0}")]
    Parameter(String),

    #[error("hardware encoder unavailable: {0}")]
    Load(#[from] LoadError),

    #[error("FFmpeg encoder not found: {0}")]
    EncoderNotFound(String),

    #[error("failed to allocate encoder context")]
    ContextAlloc,

    #[error("failed to set encoder option {name}: {message}")]
    Option {
        name: String,
        code: c_int,
        message: String,
    },

    #[error("avcodec_open2 failed: {message}")]
    Open { code: c_int, message: String },

    #[error("failed to allocate input frame")]
    FrameAlloc,

    #[error("failed to allocate input frame buffer: {message}")]
    FrameBuffer { code: c_int, message: String },

    #[error("input frame plane {plane} has no usable buffer")]
    FrameLayout { plane: usize },

    #[error("failed to allocate output packet")]
    PacketAlloc,

    #[error("encoder already initialized")]
    AlreadyInitialized,

    #[error("encoder has been released; create a new one to re-open")]
    Closed,

    #[error("encoder not initialized")]
    Uninitialized,

    #[error("encoder initialized but no encode-complete callback registered")]
    NoCallback,

    #[error("input frame is {actual_width}x{actual_height}, encoder expects {width}x{height}")]
    FrameSize {
        width: u32,
        height: u32,
        actual_width: u32,
        actual_height: u32,
    },

    #[error("invalid plane layout: {0}")]
    PlaneLayout(String),

    #[error("av_frame_make_writable failed: {message}")]
    MakeWritable { code: c_int, message: String },

    #[error("avcodec_send_frame failed: {message}")]
    SendFrame { code: c_int, message: String },

    #[error("avcodec_receive_packet failed: {message}")]
    ReceivePacket { code: c_int, message: String },

    #[error("encoding pipeline error: {0}")]
    Pipeline(String),
}

/// `WEBRTC_VIDEO_CODEC_*` style status codes for hosts that speak them.
pub mod status {
    pub const OK: i32 = 0;
    pub const ERROR: i32 = -1;
    pub const ERR_PARAMETER: i32 = -4;
    pub const UNINITIALIZED: i32 = -7;
    pub const FALLBACK_SOFTWARE: i32 = -13;
}

impl EncodeError {
    /// Map to a host status code.
    ///
    /// Load failures map to `FALLBACK_SOFTWARE` so a host can switch paths.
    #[must_use]
    pub fn status_code(&self) -> i32 {
        match self {
            Self::Parameter(_) | Self::FrameSize { .. } | Self::PlaneLayout(_) => {
                status::ERR_PARAMETER
            }
            Self::Uninitialized | Self::NoCallback | Self::Closed => status::UNINITIALIZED,
            Self::Load(_) | Self::EncoderNotFound(_) => status::FALLBACK_SOFTWARE,
            _ => status::ERROR,
        }
    }

    /// Whether the error only affected the current frame.
    ///
    /// The session stays usable after these.
    #[must_use]
    pub fn is_per_frame(&self) -> bool {
        matches!(
            self,
            Self::FrameSize { .. }
                | Self::FrameLayout { .. }
                | Self::MakeWritable { .. }
                | Self::SendFrame { .. }
                | Self::ReceivePacket { .. }
        )
    }
}
