//! Hardware/software encoder dispatch.

use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use venc_config::{EncodeConfig, NvencConfig};
use venc_encode::{NvH264Encoder, VideoEncoder};
use venc_ffmpeg::CodecApi;

use crate::controller::HwController;
use crate::format::{
    fuzzy_match, supported_h264_codecs, ScalabilityMode, SdpVideoFormat, H264_SCALABILITY_MODES,
};

/// Answer to a codec support query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CodecSupport {
    pub is_supported: bool,
    pub is_power_efficient: bool,
}

/// One family of encoders with its own format catalog.
///
/// `create` and `query_codec_support` are only ever called with formats
/// taken from `supported_formats`.
pub trait EncoderBackendFactory: Send + Sync {
    fn supported_formats(&self) -> Vec<SdpVideoFormat>;

    fn create(&self, format: &SdpVideoFormat) -> Option<Box<dyn VideoEncoder>>;

    fn query_codec_support(
        &self,
        format: &SdpVideoFormat,
        scalability_mode: Option<&str>,
    ) -> CodecSupport;
}

/// Hardware H.264 via `FFmpeg` NVENC.
///
/// Creating an encoder never touches `FFmpeg`; the libraries are loaded when
/// the first session is opened.
pub struct NvencBackend {
    tuning: NvencConfig,
    api: Option<Arc<dyn CodecApi>>,
}

impl Default for NvencBackend {
    fn default() -> Self {
        Self::new(NvencConfig::default())
    }
}

impl NvencBackend {
    #[must_use]
    pub fn new(tuning: NvencConfig) -> Self {
        Self { tuning, api: None }
    }

    /// Backend whose sessions drive `api` instead of the shared load.
    #[must_use]
    pub fn with_api(api: Arc<dyn CodecApi>, tuning: NvencConfig) -> Self {
        Self { tuning, api: Some(api) }
    }
}

impl EncoderBackendFactory for NvencBackend {
    fn supported_formats(&self) -> Vec<SdpVideoFormat> {
        supported_h264_codecs(true)
    }

    fn create(&self, format: &SdpVideoFormat) -> Option<Box<dyn VideoEncoder>> {
        if !format.is_h264() {
            return None;
        }
        let encoder = match &self.api {
            Some(api) => NvH264Encoder::with_api(Arc::clone(api), self.tuning.clone()),
            None => NvH264Encoder::with_config(self.tuning.clone()),
        };
        Some(Box::new(encoder))
    }

    fn query_codec_support(
        &self,
        format: &SdpVideoFormat,
        scalability_mode: Option<&str>,
    ) -> CodecSupport {
        let mode_ok = scalability_mode.is_none_or(|name| {
            ScalabilityMode::parse(name).is_some_and(|mode| H264_SCALABILITY_MODES.contains(&mode))
        });
        let is_supported = format.is_h264() && mode_ok;
        CodecSupport {
            is_supported,
            is_power_efficient: is_supported,
        }
    }
}

/// The backend chosen for one factory call.
#[derive(Clone, Copy)]
pub enum Backend<'a> {
    Hardware(&'a dyn EncoderBackendFactory),
    Software(&'a dyn EncoderBackendFactory),
}

impl<'a> Backend<'a> {
    fn factory(self) -> &'a dyn EncoderBackendFactory {
        match self {
            Self::Hardware(f) | Self::Software(f) => f,
        }
    }

    fn label(self) -> &'static str {
        match self {
            Self::Hardware(_) => "hardware",
            Self::Software(_) => "software",
        }
    }
}

/// Encoder factory that serves either the hardware or the software catalog,
/// as selected by a shared [`HwController`].
pub struct BetterEncoderFactory {
    controller: Arc<HwController>,
    hardware: Arc<dyn EncoderBackendFactory>,
    software: Arc<dyn EncoderBackendFactory>,
}

impl BetterEncoderFactory {
    /// Factory using the default NVENC backend for the hardware path.
    #[must_use]
    pub fn new(controller: Arc<HwController>, software: Arc<dyn EncoderBackendFactory>) -> Self {
        Self::with_backends(controller, Arc::new(NvencBackend::default()), software)
    }

    #[must_use]
    pub fn with_backends(
        controller: Arc<HwController>,
        hardware: Arc<dyn EncoderBackendFactory>,
        software: Arc<dyn EncoderBackendFactory>,
    ) -> Self {
        Self {
            controller,
            hardware,
            software,
        }
    }

    /// Factory and controller built from configuration.
    #[must_use]
    pub fn from_config(
        config: &EncodeConfig,
        software: Arc<dyn EncoderBackendFactory>,
    ) -> (Self, Arc<HwController>) {
        let controller = Arc::new(HwController::from_config(config));
        let hardware = Arc::new(NvencBackend::new(config.nvenc.clone()));
        (
            Self::with_backends(Arc::clone(&controller), hardware, software),
            controller,
        )
    }

    /// Factory and controller built from a TOML config file.
    ///
    /// `None` reads the default location; a missing file yields defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read, parsed or
    /// validated.
    pub fn from_config_file(
        path: Option<&Path>,
        software: Arc<dyn EncoderBackendFactory>,
    ) -> Result<(Self, Arc<HwController>)> {
        let config = venc_config::load(path)?;
        Ok(Self::from_config(&config, software))
    }

    #[must_use]
    pub fn controller(&self) -> &Arc<HwController> {
        &self.controller
    }

    /// Read the selection flag once.
    fn backend(&self) -> Backend<'_> {
        if self.controller.use_hw() {
            Backend::Hardware(&*self.hardware)
        } else {
            Backend::Software(&*self.software)
        }
    }

    /// Formats of the currently selected backend.
    #[must_use]
    pub fn supported_formats(&self) -> Vec<SdpVideoFormat> {
        self.backend().factory().supported_formats()
    }

    /// Create an encoder for the closest format in the selected catalog.
    ///
    /// Returns `None` when nothing in that catalog matches.
    #[must_use]
    pub fn create(&self, format: &SdpVideoFormat) -> Option<Box<dyn VideoEncoder>> {
        let backend = self.backend();
        let catalog = backend.factory().supported_formats();
        let Some(matched) = fuzzy_match(&catalog, format) else {
            tracing::debug!(backend = backend.label(), %format, "No encoder for format");
            return None;
        };
        tracing::info!(backend = backend.label(), format = %matched, "Creating encoder");
        backend.factory().create(matched)
    }

    #[must_use]
    pub fn query_codec_support(
        &self,
        format: &SdpVideoFormat,
        scalability_mode: Option<&str>,
    ) -> CodecSupport {
        let backend = self.backend();
        let catalog = backend.factory().supported_formats();
        fuzzy_match(&catalog, format).map_or_else(CodecSupport::default, |matched| {
            backend.factory().query_codec_support(matched, scalability_mode)
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use venc_encode::{
        CodecSettings, EncodeError, EncodedImageCallback, EncoderInfo, EncoderSettings, FrameType,
        RateControlParameters, VideoFrame, MAX_FRAMERATE_FRACTION,
    };

    use super::*;
    use crate::format::{PACKETIZATION_MODE, PROFILE_LEVEL_ID};

    struct NullEncoder(&'static str);

    impl VideoEncoder for NullEncoder {
        fn init_encode(&self, _: &CodecSettings, _: &EncoderSettings) -> Result<(), EncodeError> {
            Ok(())
        }
        fn register_encode_complete_callback(&self, _: Option<Arc<dyn EncodedImageCallback>>) {}
        fn encode(&self, _: &VideoFrame, _: Option<&[FrameType]>) -> Result<(), EncodeError> {
            Ok(())
        }
        fn set_rates(&self, _: &RateControlParameters) {}
        fn release(&self) {}
        fn encoder_info(&self) -> EncoderInfo {
            EncoderInfo {
                implementation_name: self.0.to_string(),
                is_hardware_accelerated: false,
                supports_native_handle: false,
                has_trusted_rate_controller: false,
                requested_resolution_alignment: 1,
                supports_simulcast: false,
                fps_allocation: [vec![MAX_FRAMERATE_FRACTION], Vec::new(), Vec::new(), Vec::new()],
            }
        }
    }

    /// Software catalog of VP8 and VP9; counts catalog reads.
    #[derive(Default)]
    struct SoftwareStub {
        catalog_reads: AtomicUsize,
    }

    impl EncoderBackendFactory for SoftwareStub {
        fn supported_formats(&self) -> Vec<SdpVideoFormat> {
            self.catalog_reads.fetch_add(1, Ordering::SeqCst);
            vec![SdpVideoFormat::new("VP8"), SdpVideoFormat::new("VP9")]
        }

        fn create(&self, format: &SdpVideoFormat) -> Option<Box<dyn VideoEncoder>> {
            let name = if format.name == "VP8" { "libvpx VP8" } else { "libvpx VP9" };
            Some(Box::new(NullEncoder(name)))
        }

        fn query_codec_support(&self, _: &SdpVideoFormat, _: Option<&str>) -> CodecSupport {
            CodecSupport {
                is_supported: true,
                is_power_efficient: false,
            }
        }
    }

    fn factory(use_hw: bool) -> (BetterEncoderFactory, Arc<HwController>, Arc<SoftwareStub>) {
        let controller = Arc::new(HwController::new(use_hw));
        let software = Arc::new(SoftwareStub::default());
        let factory = BetterEncoderFactory::new(Arc::clone(&controller), software.clone());
        (factory, controller, software)
    }

    fn h264_request() -> SdpVideoFormat {
        SdpVideoFormat::new("H264")
            .with_parameter(PROFILE_LEVEL_ID, "42e01f")
            .with_parameter(PACKETIZATION_MODE, "1")
    }

    #[test]
    fn hardware_path_creates_nvenc_session() {
        let (factory, _controller, software) = factory(true);
        let encoder = factory.create(&h264_request()).unwrap();
        let info = encoder.encoder_info();
        assert!(info.is_hardware_accelerated);
        assert_eq!(info.implementation_name, "FFmpeg h264_nvenc");
        assert_eq!(software.catalog_reads.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn hardware_flag_with_software_only_format_yields_none() {
        let (factory, _controller, software) = factory(true);
        assert!(factory.create(&SdpVideoFormat::new("VP8")).is_none());
        assert!(!factory.query_codec_support(&SdpVideoFormat::new("VP8"), None).is_supported);
        assert_eq!(software.catalog_reads.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn software_path_uses_software_catalog() {
        let (factory, _controller, _software) = factory(false);
        let encoder = factory.create(&SdpVideoFormat::new("vp9")).unwrap();
        assert_eq!(encoder.encoder_info().implementation_name, "libvpx VP9");
        assert!(factory.create(&h264_request()).is_none());
    }

    #[test]
    fn supported_formats_follow_flag() {
        let (factory, controller, _software) = factory(false);
        let names: Vec<String> = factory.supported_formats().into_iter().map(|f| f.name).collect();
        assert_eq!(names, ["VP8", "VP9"]);

        controller.set_use_hw(true);
        let formats = factory.supported_formats();
        assert_eq!(formats.len(), 6);
        assert!(formats.iter().all(SdpVideoFormat::is_h264));
    }

    #[test]
    fn flag_is_read_per_call() {
        let (factory, controller, _software) = factory(false);
        let sw = factory.create(&SdpVideoFormat::new("VP8")).unwrap();
        controller.set_use_hw(true);
        let hw = factory.create(&h264_request()).unwrap();

        assert!(!sw.encoder_info().is_hardware_accelerated);
        assert!(hw.encoder_info().is_hardware_accelerated);
    }

    #[test]
    fn format_in_neither_catalog_is_unsupported() {
        let av1 = SdpVideoFormat::new("AV1");
        for use_hw in [false, true] {
            let (factory, _controller, _software) = factory(use_hw);
            assert_eq!(factory.query_codec_support(&av1, None), CodecSupport::default());
            assert!(factory.create(&av1).is_none());
        }
    }

    #[test]
    fn hardware_scalability_modes() {
        let (factory, _controller, _software) = factory(true);
        let request = h264_request();

        let support = factory.query_codec_support(&request, Some("L1T3"));
        assert!(support.is_supported);
        assert!(support.is_power_efficient);

        assert!(factory.query_codec_support(&request, None).is_supported);
        assert!(!factory.query_codec_support(&request, Some("L2T2")).is_supported);
        assert!(!factory.query_codec_support(&request, Some("bogus")).is_supported);
    }

    #[test]
    fn hardware_unknown_profile_is_unsupported() {
        let (factory, _controller, _software) = factory(true);
        let high = SdpVideoFormat::new("H264")
            .with_parameter(PROFILE_LEVEL_ID, "640032")
            .with_parameter(PACKETIZATION_MODE, "1");
        assert!(!factory.query_codec_support(&high, None).is_supported);
        assert!(factory.create(&high).is_none());
    }

    #[test]
    fn from_config_seeds_controller() {
        let config = EncodeConfig {
            prefer_hardware: true,
            ..EncodeConfig::default()
        };
        let (factory, controller) =
            BetterEncoderFactory::from_config(&config, Arc::new(SoftwareStub::default()));
        assert!(controller.use_hw());
        assert!(Arc::ptr_eq(&controller, factory.controller()));
        assert!(factory.create(&h264_request()).is_some());
    }

    #[test]
    fn from_config_file_reads_selection() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "prefer_hardware = true\n[nvenc]\npreset = \"p1\"\n").unwrap();

        let (factory, controller) =
            BetterEncoderFactory::from_config_file(Some(&path), Arc::new(SoftwareStub::default()))
                .unwrap();
        assert!(controller.use_hw());
        assert_eq!(factory.supported_formats(), supported_h264_codecs(true));

        let (_factory, controller) = BetterEncoderFactory::from_config_file(
            Some(&dir.path().join("absent.toml")),
            Arc::new(SoftwareStub::default()),
        )
        .unwrap();
        assert!(!controller.use_hw());
    }

    #[test]
    fn from_config_file_surfaces_parse_errors() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "prefer_hardware = 3").unwrap();

        let result =
            BetterEncoderFactory::from_config_file(Some(&path), Arc::new(SoftwareStub::default()));
        assert!(result.is_err());
    }
}
