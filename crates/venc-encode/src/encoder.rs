//! The host-facing encoder interface.

use std::sync::Arc;

use crate::encoded::{CodecType, EncodedImageCallback, FrameType};
use crate::error::EncodeError;
use crate::frame::VideoFrame;

/// Full-rate entry in [`EncoderInfo::fps_allocation`].
pub const MAX_FRAMERATE_FRACTION: u8 = 255;

/// Negotiated stream parameters passed to [`VideoEncoder::init_encode`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodecSettings {
    pub codec_type: CodecType,
    pub width: u16,
    pub height: u16,
    pub max_framerate: u32,
    pub max_bitrate_kbps: u32,
    pub start_bitrate_kbps: u32,
    /// Frames between keyframes; `<= 0` lets the encoder choose.
    pub key_frame_interval: i32,
}

impl CodecSettings {
    #[must_use]
    pub fn h264(width: u16, height: u16) -> Self {
        Self {
            codec_type: CodecType::H264,
            width,
            height,
            max_framerate: 30,
            max_bitrate_kbps: 0,
            start_bitrate_kbps: 0,
            key_frame_interval: 0,
        }
    }
}

/// Runtime environment hints for the encoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncoderSettings {
    pub number_of_cores: u32,
    pub max_payload_size: usize,
    pub loss_notification: bool,
}

impl Default for EncoderSettings {
    fn default() -> Self {
        Self {
            number_of_cores: 1,
            max_payload_size: 1200,
            loss_notification: false,
        }
    }
}

/// Target rates from the bandwidth estimator.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateControlParameters {
    pub bitrate_sum_kbps: u32,
    pub framerate_fps: f64,
}

/// Static encoder capabilities reported to the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncoderInfo {
    pub implementation_name: String,
    pub is_hardware_accelerated: bool,
    pub supports_native_handle: bool,
    pub has_trusted_rate_controller: bool,
    /// Width and height must be multiples of this.
    pub requested_resolution_alignment: u32,
    pub supports_simulcast: bool,
    /// Per spatial layer, the cumulative framerate fraction of each
    /// temporal layer (out of [`MAX_FRAMERATE_FRACTION`]).
    pub fps_allocation: [Vec<u8>; 4],
}

/// A video encoder instance.
///
/// All methods take `&self`; implementations serialize internally so a
/// boxed encoder can be shared across threads.
pub trait VideoEncoder: Send + Sync {
    /// Open the encoder for the negotiated settings.
    ///
    /// # Errors
    ///
    /// Returns [`EncodeError`] if the settings are invalid or the encoder
    /// cannot be opened.
    fn init_encode(
        &self,
        settings: &CodecSettings,
        encoder_settings: &EncoderSettings,
    ) -> Result<(), EncodeError>;

    /// Install (or with `None`, remove) the sole output callback.
    fn register_encode_complete_callback(&self, callback: Option<Arc<dyn EncodedImageCallback>>);

    /// Encode one frame. Output is delivered through the callback.
    ///
    /// A [`FrameType::Key`] anywhere in `frame_types` forces a keyframe.
    ///
    /// # Errors
    ///
    /// Returns [`EncodeError`] if the encoder is not ready or the frame
    /// could not be encoded.
    fn encode(
        &self,
        frame: &VideoFrame,
        frame_types: Option<&[FrameType]>,
    ) -> Result<(), EncodeError>;

    /// Apply new target rates. Ignored when not initialized.
    fn set_rates(&self, parameters: &RateControlParameters);

    /// Free all encoder resources. Safe to call more than once.
    fn release(&self);

    fn encoder_info(&self) -> EncoderInfo;
}

/// Whether any requested frame type asks for a keyframe.
#[must_use]
pub fn wants_key_frame(frame_types: Option<&[FrameType]>) -> bool {
    frame_types.is_some_and(|types| types.contains(&FrameType::Key))
}
