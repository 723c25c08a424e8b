//! H.264 hardware encoder session over late-bound `FFmpeg` (`h264_nvenc`).
//!
//! Lifecycle: `Uninitialized -> Ready -> Closed`. `Closed` is terminal;
//! build a new [`NvH264Encoder`] to encode again.
//!
//! Every call locks the session for its full duration, so the encoder can
//! be shared across threads behind `&self`.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use bytes::BytesMut;
use venc_config::NvencConfig;
use venc_ffmpeg::CodecApi;

use crate::encoded::{
    CallbackResult, CodecSpecificInfo, CodecType, EncodedImage, EncodedImageCallback, FrameType,
    H264PacketizationMode, H264SpecificInfo,
};
use crate::encoder::{
    wants_key_frame, CodecSettings, EncoderInfo, EncoderSettings, RateControlParameters,
    VideoEncoder, MAX_FRAMERATE_FRACTION,
};
use crate::error::EncodeError;
use crate::frame::{VideoFrame, VideoFrameBuffer};
use crate::native::{NativeEncoder, OpenParams};

/// Presentation timestamps, shared by every session in the process.
static NEXT_PTS: AtomicI64 = AtomicI64::new(0);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Uninitialized,
    Ready,
    Closed,
}

enum ApiSource {
    /// The process-wide `FFmpeg` load, performed on first open.
    Shared,
    Fixed(Arc<dyn CodecApi>),
}

impl ApiSource {
    fn get(&self) -> Result<Arc<dyn CodecApi>, EncodeError> {
        match self {
            Self::Shared => venc_ffmpeg::shared_api().map_err(|e| {
                tracing::error!("FFmpeg unavailable, hardware encoding disabled: {e}");
                EncodeError::Load(e)
            }),
            Self::Fixed(api) => Ok(Arc::clone(api)),
        }
    }
}

struct Inner {
    state: SessionState,
    native: Option<NativeEncoder>,
    fps: u32,
    bit_rate: i64,
    callback: Option<Arc<dyn EncodedImageCallback>>,
    out_buf: BytesMut,
}

/// Hardware H.264 encoder session.
pub struct NvH264Encoder {
    tuning: NvencConfig,
    api: ApiSource,
    inner: Mutex<Inner>,
}

impl Default for NvH264Encoder {
    fn default() -> Self {
        Self::new()
    }
}

impl NvH264Encoder {
    /// Session using the default NVENC tuning and the shared `FFmpeg` load.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(NvencConfig::default())
    }

    #[must_use]
    pub fn with_config(tuning: NvencConfig) -> Self {
        Self::build(tuning, ApiSource::Shared)
    }

    /// Session driving an explicit [`CodecApi`] instead of the shared load.
    #[must_use]
    pub fn with_api(api: Arc<dyn CodecApi>, tuning: NvencConfig) -> Self {
        Self::build(tuning, ApiSource::Fixed(api))
    }

    fn build(tuning: NvencConfig, api: ApiSource) -> Self {
        Self {
            tuning,
            api,
            inner: Mutex::new(Inner {
                state: SessionState::Uninitialized,
                native: None,
                fps: 0,
                bit_rate: 0,
                callback: None,
                out_buf: BytesMut::new(),
            }),
        }
    }

    /// Lock the session, logging a warning if the mutex was poisoned.
    fn lock_inner(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| {
            tracing::warn!("NVENC: session mutex was poisoned, recovering");
            e.into_inner()
        })
    }

    #[must_use]
    pub fn state(&self) -> SessionState {
        self.lock_inner().state
    }

    /// Target bitrate in bits per second (0 before open).
    #[must_use]
    pub fn current_bitrate(&self) -> i64 {
        self.lock_inner().bit_rate
    }

    #[must_use]
    pub fn current_fps(&self) -> u32 {
        self.lock_inner().fps
    }

    /// Negotiated frame size, once open.
    #[must_use]
    pub fn dimensions(&self) -> Option<(u32, u32)> {
        self.lock_inner()
            .native
            .as_ref()
            .map(|native| (native.width(), native.height()))
    }

    fn bit_rate_for(&self, settings: &CodecSettings) -> i64 {
        if settings.max_bitrate_kbps > 0 {
            i64::from(settings.max_bitrate_kbps) * 1000
        } else if settings.start_bitrate_kbps > 0 {
            i64::from(settings.start_bitrate_kbps) * 1000
        } else {
            self.tuning.default_bitrate
        }
    }
}

fn gop_for(settings: &CodecSettings, fps: u32) -> i32 {
    if settings.key_frame_interval > 0 {
        settings.key_frame_interval
    } else {
        i32::try_from(fps.saturating_mul(2)).unwrap_or(i32::MAX)
    }
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn round_fps(fps: f64) -> u32 {
    (fps.round().min(f64::from(u32::MAX)) as u32).max(1)
}

impl VideoEncoder for NvH264Encoder {
    fn init_encode(
        &self,
        settings: &CodecSettings,
        _encoder_settings: &EncoderSettings,
    ) -> Result<(), EncodeError> {
        let mut inner = self.lock_inner();
        match inner.state {
            SessionState::Ready => return Err(EncodeError::AlreadyInitialized),
            SessionState::Closed => return Err(EncodeError::Closed),
            SessionState::Uninitialized => {}
        }

        if settings.width == 0 || settings.height == 0 {
            return Err(EncodeError::Parameter(format!(
                "frame size {}x{}",
                settings.width, settings.height
            )));
        }

        if settings.codec_type != CodecType::H264 {
            return Err(EncodeError::Parameter(format!(
                "{} requested from an H.264 encoder",
                settings.codec_type
            )));
        }

        let fps = settings.max_framerate.max(1);
        let params = OpenParams {
            width: u32::from(settings.width),
            height: u32::from(settings.height),
            fps,
            bit_rate: self.bit_rate_for(settings),
            gop: gop_for(settings, fps),
        };

        let api = self.api.get()?;
        let native = NativeEncoder::open(api, params, &self.tuning)?;

        inner.native = Some(native);
        inner.fps = fps;
        inner.bit_rate = params.bit_rate;
        inner.state = SessionState::Ready;

        tracing::info!(
            encoder = %self.tuning.encoder,
            width = params.width,
            height = params.height,
            fps,
            bit_rate = params.bit_rate,
            gop = params.gop,
            "Hardware H.264 encoder opened"
        );
        Ok(())
    }

    fn register_encode_complete_callback(&self, callback: Option<Arc<dyn EncodedImageCallback>>) {
        self.lock_inner().callback = callback;
    }

    fn encode(
        &self,
        frame: &VideoFrame,
        frame_types: Option<&[FrameType]>,
    ) -> Result<(), EncodeError> {
        let mut guard = self.lock_inner();
        let inner = &mut *guard;

        let (SessionState::Ready, Some(native)) = (inner.state, inner.native.as_mut()) else {
            return Err(EncodeError::Uninitialized);
        };
        let Some(callback) = inner.callback.clone() else {
            return Err(EncodeError::NoCallback);
        };

        let (width, height) = (native.width(), native.height());
        if frame.width() != width || frame.height() != height {
            return Err(EncodeError::FrameSize {
                width,
                height,
                actual_width: frame.width(),
                actual_height: frame.height(),
            });
        }

        let force_key = wants_key_frame(frame_types);
        let image = frame.buffer.to_i420();
        if image.width() != width || image.height() != height {
            return Err(EncodeError::FrameSize {
                width,
                height,
                actual_width: image.width(),
                actual_height: image.height(),
            });
        }
        let pts = NEXT_PTS.fetch_add(1, Ordering::Relaxed);

        native.fill_frame(&image, pts, force_key).inspect_err(|e| {
            tracing::warn!(pts, "NVENC: failed to prepare input frame: {e}");
        })?;
        native.send_frame().inspect_err(|e| {
            tracing::warn!(pts, "NVENC: {e}");
        })?;

        while let Some(packet) = native.receive_packet().inspect_err(|e| {
            tracing::warn!(pts, "NVENC: {e}");
        })? {
            let key = packet.is_key();
            inner.out_buf.extend_from_slice(packet.data());

            let encoded = EncodedImage {
                data: inner.out_buf.split().freeze(),
                rtp_timestamp: frame.rtp_timestamp,
                capture_time_us: frame.timestamp_us,
                color_space: frame.color_space,
                encoded_width: width,
                encoded_height: height,
                frame_type: if key { FrameType::Key } else { FrameType::Delta },
            };
            let info = CodecSpecificInfo::H264(H264SpecificInfo {
                packetization_mode: H264PacketizationMode::NonInterleaved,
                idr_frame: key,
            });

            tracing::trace!(pts, key, size = encoded.len(), "NVENC: packet");
            if callback.on_encoded_image(&encoded, &info) == CallbackResult::SendFailed {
                tracing::debug!(
                    rtp_timestamp = frame.rtp_timestamp,
                    "Encoded image not accepted by host"
                );
            }
            drop(packet);
        }

        Ok(())
    }

    fn set_rates(&self, parameters: &RateControlParameters) {
        let mut guard = self.lock_inner();
        let inner = &mut *guard;
        let (SessionState::Ready, Some(native)) = (inner.state, inner.native.as_mut()) else {
            tracing::debug!("NVENC: set_rates ignored, encoder not ready");
            return;
        };
        if parameters.bitrate_sum_kbps == 0 {
            return;
        }

        let bit_rate = i64::from(parameters.bitrate_sum_kbps) * 1000;
        let ret = native.set_bit_rate(bit_rate);
        if ret < 0 {
            tracing::warn!(bit_rate, code = ret, "NVENC: bitrate update rejected");
        }
        inner.bit_rate = bit_rate;

        if parameters.framerate_fps > 0.0 {
            let fps = round_fps(parameters.framerate_fps);
            let ret = native.set_frame_rate(fps);
            if ret < 0 {
                tracing::warn!(fps, code = ret, "NVENC: framerate update rejected");
            }
            inner.fps = fps;
        }

        tracing::debug!(bit_rate, fps = inner.fps, "NVENC: rates updated");
    }

    fn release(&self) {
        let mut inner = self.lock_inner();
        if inner.state == SessionState::Closed {
            return;
        }
        let was_open = inner.native.take().is_some();
        inner.out_buf = BytesMut::new();
        inner.callback = None;
        inner.state = SessionState::Closed;
        if was_open {
            tracing::info!("Hardware H.264 encoder released");
        }
    }

    fn encoder_info(&self) -> EncoderInfo {
        EncoderInfo {
            implementation_name: format!("FFmpeg {}", self.tuning.encoder),
            is_hardware_accelerated: true,
            supports_native_handle: false,
            has_trusted_rate_controller: true,
            requested_resolution_alignment: 2,
            supports_simulcast: false,
            fps_allocation: [vec![MAX_FRAMERATE_FRACTION], Vec::new(), Vec::new(), Vec::new()],
        }
    }
}

impl Drop for NvH264Encoder {
    fn drop(&mut self) {
        self.release();
    }
}
