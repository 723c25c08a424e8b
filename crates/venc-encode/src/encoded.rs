//! Encoded output and the delivery callback.

use bytes::Bytes;

use crate::frame::ColorSpace;

/// Frame type requested for, or produced by, an encode call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FrameType {
    /// Nothing was produced.
    #[default]
    Empty,
    /// IDR keyframe.
    Key,
    /// Inter-predicted frame.
    Delta,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodecType {
    H264,
    Vp8,
    Vp9,
    Av1,
}

impl CodecType {
    /// Name as it appears in SDP (`a=rtpmap`).
    #[must_use]
    pub fn sdp_name(self) -> &'static str {
        match self {
            Self::H264 => "H264",
            Self::Vp8 => "VP8",
            Self::Vp9 => "VP9",
            Self::Av1 => "AV1",
        }
    }
}

impl std::fmt::Display for CodecType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.sdp_name())
    }
}

/// RFC 6184 packetization mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum H264PacketizationMode {
    /// Mode 1: STAP-A and FU-A allowed.
    NonInterleaved,
    /// Mode 0: one NAL unit per packet.
    SingleNalUnit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct H264SpecificInfo {
    pub packetization_mode: H264PacketizationMode,
    pub idr_frame: bool,
}

/// Per-frame metadata the packetizer needs besides the payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodecSpecificInfo {
    H264(H264SpecificInfo),
    /// Codecs whose packetizer needs nothing beyond the payload.
    Generic(CodecType),
}

impl CodecSpecificInfo {
    #[must_use]
    pub fn codec_type(&self) -> CodecType {
        match self {
            Self::H264(_) => CodecType::H264,
            Self::Generic(codec) => *codec,
        }
    }
}

/// One encoded access unit.
#[derive(Debug, Clone, Default)]
pub struct EncodedImage {
    /// Annex B byte stream for H.264.
    pub data: Bytes,
    pub rtp_timestamp: u32,
    pub capture_time_us: i64,
    pub color_space: Option<ColorSpace>,
    pub encoded_width: u32,
    pub encoded_height: u32,
    pub frame_type: FrameType,
}

impl EncodedImage {
    #[must_use]
    pub fn is_key(&self) -> bool {
        self.frame_type == FrameType::Key
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// What the host wants the encoder to do after a delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackResult {
    Ok,
    /// The host could not take the frame; the encoder keeps going.
    SendFailed,
}

/// Receiver for encoded output.
///
/// Invoked synchronously from within `encode`, on the encoding thread,
/// while the session is locked. Implementations must not call back into
/// the encoder that delivered the image.
pub trait EncodedImageCallback: Send + Sync {
    fn on_encoded_image(&self, image: &EncodedImage, info: &CodecSpecificInfo) -> CallbackResult;
}

impl<F> EncodedImageCallback for F
where
    F: Fn(&EncodedImage, &CodecSpecificInfo) -> CallbackResult + Send + Sync,
{
    fn on_encoded_image(&self, image: &EncodedImage, info: &CodecSpecificInfo) -> CallbackResult {
        self(image, info)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn closures_are_callbacks() {
        let cb = |image: &EncodedImage, info: &CodecSpecificInfo| {
            assert_eq!(info.codec_type(), CodecType::H264);
            if image.is_key() {
                CallbackResult::Ok
            } else {
                CallbackResult::SendFailed
            }
        };
        let info = CodecSpecificInfo::H264(H264SpecificInfo {
            packetization_mode: H264PacketizationMode::NonInterleaved,
            idr_frame: true,
        });
        let image = EncodedImage {
            data: Bytes::from_static(&[0, 0, 0, 1, 0x65]),
            frame_type: FrameType::Key,
            ..EncodedImage::default()
        };

        assert_eq!(cb.on_encoded_image(&image, &info), CallbackResult::Ok);
        assert_eq!(image.len(), 5);
    }

    #[test]
    fn sdp_names() {
        assert_eq!(CodecType::H264.to_string(), "H264");
        assert_eq!(CodecType::Vp8.sdp_name(), "VP8");
    }
}
