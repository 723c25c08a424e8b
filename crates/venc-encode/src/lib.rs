// Video encoder sessions for the hardware/software selection layer.
//
// Provides the VideoEncoder trait and implementations:
// - nvenc.rs: H.264 via late-bound FFmpeg `h264_nvenc`
// - gstreamer_enc.rs: x264/VP8 software encoding (feature `gstreamer`)
// - frame.rs / encoded.rs: input frames and encoded output

pub mod encoded;
pub mod encoder;
pub mod error;
pub mod frame;
#[cfg(feature = "gstreamer")]
pub mod gstreamer_enc;
mod native;
pub mod nvenc;

#[cfg(test)]
mod fake_api;

pub use encoded::{
    CallbackResult, CodecSpecificInfo, CodecType, EncodedImage, EncodedImageCallback, FrameType,
    H264PacketizationMode, H264SpecificInfo,
};
pub use encoder::{
    CodecSettings, EncoderInfo, EncoderSettings, RateControlParameters, VideoEncoder,
    MAX_FRAMERATE_FRACTION,
};
pub use error::EncodeError;
pub use frame::{BgraBuffer, ColorSpace, I420Buffer, VideoFrame, VideoFrameBuffer};
pub use nvenc::{NvH264Encoder, SessionState};
#[cfg(feature = "gstreamer")]
pub use gstreamer_enc::{GstSoftwareEncoder, SoftwareCodec};
