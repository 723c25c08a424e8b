//! `GStreamer` software backend.

use venc_encode::gstreamer_enc::{is_encoder_available, GstSoftwareEncoder, SoftwareCodec};
use venc_encode::VideoEncoder;

use crate::factory::{CodecSupport, EncoderBackendFactory};
use crate::format::{h264_format, H264Level, H264Profile, ScalabilityMode, SdpVideoFormat};

/// Software catalog: VP8 via `vp8enc`, Constrained Baseline H.264 via
/// `x264enc`. Formats whose element is not installed are left out.
#[derive(Debug, Default, Clone, Copy)]
pub struct GstSoftwareFactory;

impl EncoderBackendFactory for GstSoftwareFactory {
    fn supported_formats(&self) -> Vec<SdpVideoFormat> {
        let mut formats = Vec::new();
        if is_encoder_available(SoftwareCodec::Vp8) {
            formats.push(
                SdpVideoFormat::new("VP8").with_scalability_modes(&[ScalabilityMode::L1T1]),
            );
        }
        if is_encoder_available(SoftwareCodec::X264) {
            for mode in ["1", "0"] {
                formats.push(
                    h264_format(H264Profile::ConstrainedBaseline, H264Level::L3_1, mode)
                        .with_scalability_modes(&[ScalabilityMode::L1T1]),
                );
            }
        }
        formats
    }

    fn create(&self, format: &SdpVideoFormat) -> Option<Box<dyn VideoEncoder>> {
        let codec = SoftwareCodec::for_codec_name(&format.name)?;
        Some(Box::new(GstSoftwareEncoder::new(codec)))
    }

    fn query_codec_support(
        &self,
        format: &SdpVideoFormat,
        scalability_mode: Option<&str>,
    ) -> CodecSupport {
        let known = SoftwareCodec::for_codec_name(&format.name).is_some();
        CodecSupport {
            is_supported: known && scalability_mode.is_none_or(|m| m == "L1T1"),
            is_power_efficient: false,
        }
    }
}
