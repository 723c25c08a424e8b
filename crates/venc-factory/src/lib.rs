// Runtime hardware/software encoder selection.
//
// - controller.rs: the shared selection flag
// - format.rs: SDP format catalogs and fuzzy matching
// - factory.rs: backend trait, NVENC backend and the dispatching factory
// - software.rs: GStreamer software backend (feature `gstreamer`)

pub mod controller;
pub mod factory;
pub mod format;
#[cfg(feature = "gstreamer")]
pub mod software;

pub use controller::HwController;
pub use factory::{Backend, BetterEncoderFactory, CodecSupport, EncoderBackendFactory, NvencBackend};
pub use format::{fuzzy_match, supported_h264_codecs, H264Profile, ScalabilityMode, SdpVideoFormat};
#[cfg(feature = "gstreamer")]
pub use software::GstSoftwareFactory;
