//! `GStreamer` software encoding pipeline.
//!
//! Pipeline: `appsrc ! encoder [! h264parse] ! appsink`
//!
//! `x264enc` for H.264 (Annex B byte-stream, one access unit per buffer)
//! and `vp8enc` for VP8. Input is pushed as I420 so no colour conversion
//! happens inside the pipeline.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

use bytes::Bytes;
use gstreamer as gst;
use gstreamer::prelude::*;
use gstreamer_app as gst_app;
use gstreamer_video as gst_video;

use crate::encoded::{
    CallbackResult, CodecSpecificInfo, CodecType, EncodedImage, EncodedImageCallback, FrameType,
    H264PacketizationMode, H264SpecificInfo,
};
use crate::encoder::{
    wants_key_frame, CodecSettings, EncoderInfo, EncoderSettings, RateControlParameters,
    VideoEncoder, MAX_FRAMERATE_FRACTION,
};
use crate::error::EncodeError;
use crate::frame::{copy_plane, ColorSpace, VideoFrame};

/// Software codec backing a [`GstSoftwareEncoder`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SoftwareCodec {
    /// `x264enc`.
    X264,
    /// `vp8enc`.
    Vp8,
}

impl SoftwareCodec {
    /// `GStreamer` element factory name for this encoder.
    #[must_use]
    pub fn element_name(self) -> &'static str {
        match self {
            Self::X264 => "x264enc",
            Self::Vp8 => "vp8enc",
        }
    }

    #[must_use]
    pub fn codec_type(self) -> CodecType {
        match self {
            Self::X264 => CodecType::H264,
            Self::Vp8 => CodecType::Vp8,
        }
    }

    /// Software codec for an SDP codec name, if one exists.
    #[must_use]
    pub fn for_codec_name(name: &str) -> Option<Self> {
        if name.eq_ignore_ascii_case("H264") {
            Some(Self::X264)
        } else if name.eq_ignore_ascii_case("VP8") {
            Some(Self::Vp8)
        } else {
            None
        }
    }
}

impl std::fmt::Display for SoftwareCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::X264 => write!(f, "x264 (software)"),
            Self::Vp8 => write!(f, "VP8 (software)"),
        }
    }
}

/// Check if a `GStreamer` element factory is available.
///
/// Initializes `GStreamer` on first use; returns `false` if that fails.
#[must_use]
pub fn is_encoder_available(codec: SoftwareCodec) -> bool {
    gst::init().is_ok() && gst::ElementFactory::find(codec.element_name()).is_some()
}

struct Pipeline {
    pipeline: gst::Pipeline,
    appsrc: gst_app::AppSrc,
    appsink: gst_app::AppSink,
    encoder: gst::Element,
    info: gst_video::VideoInfo,
    frame_duration: gst::ClockTime,
}

/// Inputs the encoder may hold before output metadata is abandoned.
const MAX_PENDING: usize = 64;

/// Input metadata waiting for its encoded output.
#[derive(Debug, Clone, Copy, PartialEq)]
struct PendingFrame {
    pts: gst::ClockTime,
    rtp_timestamp: u32,
    capture_time_us: i64,
    color_space: Option<ColorSpace>,
}

struct Inner {
    pipeline: Option<Pipeline>,
    closed: bool,
    callback: Option<Arc<dyn EncodedImageCallback>>,
    pending: VecDeque<PendingFrame>,
    next_frame: u64,
}

/// Software encoder using a `GStreamer` pipeline.
pub struct GstSoftwareEncoder {
    codec: SoftwareCodec,
    inner: Mutex<Inner>,
}

impl GstSoftwareEncoder {
    #[must_use]
    pub fn new(codec: SoftwareCodec) -> Self {
        Self {
            codec,
            inner: Mutex::new(Inner {
                pipeline: None,
                closed: false,
                callback: None,
                pending: VecDeque::new(),
                next_frame: 0,
            }),
        }
    }

    /// The codec this encoder produces.
    #[must_use]
    pub fn codec(&self) -> SoftwareCodec {
        self.codec
    }

    fn lock_inner(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| {
            tracing::warn!("GStreamer encoder: mutex was poisoned, recovering");
            e.into_inner()
        })
    }

    fn codec_info(&self, key: bool) -> CodecSpecificInfo {
        match self.codec {
            SoftwareCodec::X264 => CodecSpecificInfo::H264(H264SpecificInfo {
                packetization_mode: H264PacketizationMode::NonInterleaved,
                idr_frame: key,
            }),
            SoftwareCodec::Vp8 => CodecSpecificInfo::Generic(CodecType::Vp8),
        }
    }
}

fn stop(pipeline: &Pipeline) {
    let _ = pipeline.pipeline.set_state(gst::State::Null);
}

/// Metadata for the input an output buffer was encoded from.
///
/// Outputs carry their input's PTS. Entries older than `pts` belong to
/// frames the encoder dropped and are discarded. Outputs without a PTS take
/// the oldest entry.
fn take_pending(
    pending: &mut VecDeque<PendingFrame>,
    pts: Option<gst::ClockTime>,
) -> Option<PendingFrame> {
    let Some(pts) = pts else {
        return pending.pop_front();
    };
    let mut dropped = 0usize;
    while pending.front().is_some_and(|p| p.pts < pts) {
        pending.pop_front();
        dropped += 1;
    }
    if dropped > 0 {
        tracing::debug!(dropped, %pts, "Encoder skipped input frames");
    }
    if pending.front().is_some_and(|p| p.pts == pts) {
        pending.pop_front()
    } else {
        None
    }
}

/// Queue metadata for a pushed input, discarding the oldest beyond the cap.
fn push_pending(pending: &mut VecDeque<PendingFrame>, frame: PendingFrame) {
    pending.push_back(frame);
    while pending.len() > MAX_PENDING {
        if let Some(stale) = pending.pop_front() {
            tracing::warn!(
                rtp_timestamp = stale.rtp_timestamp,
                "No output for input frame, dropping its metadata"
            );
        }
    }
}

fn pipeline_err(e: impl std::fmt::Display) -> EncodeError {
    EncodeError::Pipeline(e.to_string())
}

/// Create a `GStreamer` element by factory name.
fn make_element(factory_name: &str, element_name: &str) -> Result<gst::Element, EncodeError> {
    gst::ElementFactory::make(factory_name)
        .name(element_name)
        .build()
        .map_err(|e| EncodeError::Pipeline(format!("cannot create {factory_name}: {e}")))
}

/// Configure encoder-specific properties.
fn configure_encoder(encoder: &gst::Element, codec: SoftwareCodec, settings: &CodecSettings) {
    let bitrate_kbps = if settings.start_bitrate_kbps > 0 {
        settings.start_bitrate_kbps
    } else {
        settings.max_bitrate_kbps.max(300)
    };
    let key_interval = if settings.key_frame_interval > 0 {
        settings.key_frame_interval
    } else {
        i32::try_from(settings.max_framerate.max(1).saturating_mul(2)).unwrap_or(i32::MAX)
    };

    match codec {
        SoftwareCodec::X264 => {
            encoder.set_property("bitrate", bitrate_kbps);
            encoder.set_property("key-int-max", key_interval.unsigned_abs());
            encoder.set_property("bframes", 0u32);
            encoder.set_property_from_str("tune", "zerolatency");
            encoder.set_property_from_str("speed-preset", "ultrafast");
        }
        SoftwareCodec::Vp8 => {
            let bits = i32::try_from(u64::from(bitrate_kbps) * 1000).unwrap_or(i32::MAX);
            encoder.set_property("target-bitrate", bits);
            encoder.set_property("keyframe-max-dist", key_interval);
            encoder.set_property("deadline", 1i64); // realtime
            encoder.set_property("cpu-used", 4i32);
        }
    }

    tracing::debug!(%codec, bitrate_kbps, key_interval, "Encoder configured");
}

/// Build the encoding pipeline.
///
/// `appsrc(I420) ! encoder [! h264parse] ! appsink`
fn build_pipeline(codec: SoftwareCodec, settings: &CodecSettings) -> Result<Pipeline, EncodeError> {
    let width = u32::from(settings.width);
    let height = u32::from(settings.height);
    let framerate = i32::try_from(settings.max_framerate.max(1)).unwrap_or(i32::MAX);

    let info = gst_video::VideoInfo::builder(gst_video::VideoFormat::I420, width, height)
        .fps(gst::Fraction::new(framerate, 1))
        .build()
        .map_err(pipeline_err)?;
    let caps = info.to_caps().map_err(pipeline_err)?;

    let appsrc = gst_app::AppSrc::builder()
        .name("source")
        .caps(&caps)
        .format(gst::Format::Time)
        .is_live(true)
        .build();

    let encoder = make_element(codec.element_name(), "encoder")?;
    configure_encoder(&encoder, codec, settings);

    let sink_caps = match codec {
        SoftwareCodec::X264 => gst::Caps::builder("video/x-h264")
            .field("stream-format", "byte-stream")
            .field("alignment", "au")
            .build(),
        SoftwareCodec::Vp8 => gst::Caps::builder("video/x-vp8").build(),
    };
    let appsink = gst_app::AppSink::builder()
        .name("sink")
        .caps(&sink_caps)
        .sync(false)
        .build();

    let mut chain: Vec<gst::Element> = vec![appsrc.clone().upcast(), encoder.clone()];
    if codec == SoftwareCodec::X264 {
        chain.push(make_element("h264parse", "parser")?);
    }
    chain.push(appsink.clone().upcast());

    let pipeline = gst::Pipeline::new();
    pipeline.add_many(chain.iter()).map_err(pipeline_err)?;
    gst::Element::link_many(chain.iter()).map_err(pipeline_err)?;

    if let Err(e) = pipeline.set_state(gst::State::Playing) {
        let _ = pipeline.set_state(gst::State::Null);
        return Err(pipeline_err(e));
    }

    tracing::info!(%codec, width, height, framerate, "GStreamer software pipeline started");

    Ok(Pipeline {
        pipeline,
        appsrc,
        appsink,
        encoder,
        info,
        frame_duration: gst::ClockTime::from_nseconds(
            1_000_000_000 / u64::from(framerate.unsigned_abs()),
        ),
    })
}

impl VideoEncoder for GstSoftwareEncoder {
    fn init_encode(
        &self,
        settings: &CodecSettings,
        _encoder_settings: &EncoderSettings,
    ) -> Result<(), EncodeError> {
        let mut inner = self.lock_inner();
        if inner.closed {
            return Err(EncodeError::Closed);
        }
        if inner.pipeline.is_some() {
            return Err(EncodeError::AlreadyInitialized);
        }
        if settings.width == 0 || settings.height == 0 {
            return Err(EncodeError::Parameter(format!(
                "frame size {}x{}",
                settings.width, settings.height
            )));
        }
        if settings.codec_type != self.codec.codec_type() {
            return Err(EncodeError::Parameter(format!(
                "{} encoder cannot produce {}",
                self.codec, settings.codec_type
            )));
        }

        gst::init().map_err(pipeline_err)?;
        inner.pipeline = Some(build_pipeline(self.codec, settings)?);
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
        let Some(pipeline) = inner.pipeline.as_ref() else {
            return Err(EncodeError::Uninitialized);
        };
        let Some(callback) = inner.callback.clone() else {
            return Err(EncodeError::NoCallback);
        };

        let (width, height) = (pipeline.info.width(), pipeline.info.height());
        if frame.width() != width || frame.height() != height {
            return Err(EncodeError::FrameSize {
                width,
                height,
                actual_width: frame.width(),
                actual_height: frame.height(),
            });
        }

        let image = frame.buffer.to_i420();
        let pts_ns = pipeline.frame_duration.nseconds() * inner.next_frame;
        let pts = gst::ClockTime::from_nseconds(pts_ns);
        let mut buffer = gst::Buffer::with_size(pipeline.info.size()).map_err(pipeline_err)?;
        {
            let buffer_ref = buffer
                .get_mut()
                .ok_or_else(|| EncodeError::Pipeline("buffer not writable".into()))?;
            buffer_ref.set_pts(pts);
            buffer_ref.set_duration(pipeline.frame_duration);
            let mut map = buffer_ref.map_writable().map_err(pipeline_err)?;

            let (w, h) = (width as usize, height as usize);
            let (cw, ch) = (w.div_ceil(2), h.div_ceil(2));
            let planes: [(&[u8], usize, usize, usize); 3] = [
                (image.data_y(), image.stride_y(), w, h),
                (image.data_u(), image.stride_u(), cw, ch),
                (image.data_v(), image.stride_v(), cw, ch),
            ];
            for (i, (src, src_stride, pw, rows)) in planes.into_iter().enumerate() {
                let offset = pipeline.info.offset()[i];
                let Ok(stride) = usize::try_from(pipeline.info.stride()[i]) else {
                    return Err(EncodeError::FrameLayout { plane: i });
                };
                copy_plane(&mut map[offset..], stride, src, src_stride, pw, rows);
            }
        }

        if wants_key_frame(frame_types) {
            let event = gst_video::DownstreamForceKeyUnitEvent::builder()
                .all_headers(true)
                .build();
            pipeline.appsrc.send_event(event);
            tracing::debug!("Forced keyframe requested");
        }

        pipeline.appsrc.push_buffer(buffer).map_err(pipeline_err)?;
        inner.next_frame += 1;
        let current = PendingFrame {
            pts,
            rtp_timestamp: frame.rtp_timestamp,
            capture_time_us: frame.timestamp_us,
            color_space: frame.color_space,
        };
        push_pending(&mut inner.pending, current);

        // Non-blocking pull with 1ms timeout
        let timeout = gst::ClockTime::from_mseconds(1);
        while let Some(sample) = pipeline.appsink.try_pull_sample(timeout) {
            let buffer = sample
                .buffer()
                .ok_or_else(|| EncodeError::Pipeline("sample has no buffer".into()))?;
            let map = buffer.map_readable().map_err(pipeline_err)?;

            // DELTA_UNIT flag means it's NOT a keyframe
            let key = !buffer.flags().contains(gst::BufferFlags::DELTA_UNIT);
            let source = take_pending(&mut inner.pending, buffer.pts()).unwrap_or(current);

            let encoded = EncodedImage {
                data: Bytes::copy_from_slice(map.as_slice()),
                rtp_timestamp: source.rtp_timestamp,
                capture_time_us: source.capture_time_us,
                color_space: source.color_space,
                encoded_width: width,
                encoded_height: height,
                frame_type: if key { FrameType::Key } else { FrameType::Delta },
            };
            let result = callback.on_encoded_image(&encoded, &self.codec_info(key));
            if result == CallbackResult::SendFailed {
                tracing::debug!(
                    rtp_timestamp = encoded.rtp_timestamp,
                    "Encoded image not accepted by host"
                );
            }
        }

        Ok(())
    }

    fn set_rates(&self, parameters: &RateControlParameters) {
        let inner = self.lock_inner();
        let Some(pipeline) = inner.pipeline.as_ref() else {
            return;
        };
        if parameters.bitrate_sum_kbps == 0 {
            return;
        }
        match self.codec {
            SoftwareCodec::X264 => {
                pipeline.encoder.set_property("bitrate", parameters.bitrate_sum_kbps);
            }
            SoftwareCodec::Vp8 => {
                let bits = u64::from(parameters.bitrate_sum_kbps) * 1000;
                let bits = i32::try_from(bits).unwrap_or(i32::MAX);
                pipeline.encoder.set_property("target-bitrate", bits);
            }
        }
        tracing::debug!(bitrate_kbps = parameters.bitrate_sum_kbps, "Encoder bitrate updated");
    }

    fn release(&self) {
        let mut inner = self.lock_inner();
        if let Some(pipeline) = inner.pipeline.take() {
            stop(&pipeline);
            tracing::info!(codec = %self.codec, "Encoder pipeline stopped");
        }
        inner.callback = None;
        inner.pending.clear();
        inner.closed = true;
    }

    fn encoder_info(&self) -> EncoderInfo {
        EncoderInfo {
            implementation_name: format!("GStreamer {}", self.codec.element_name()),
            is_hardware_accelerated: false,
            supports_native_handle: false,
            has_trusted_rate_controller: false,
            requested_resolution_alignment: 1,
            supports_simulcast: false,
            fps_allocation: [vec![MAX_FRAMERATE_FRACTION], Vec::new(), Vec::new(), Vec::new()],
        }
    }
}

impl Drop for GstSoftwareEncoder {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codec_names() {
        assert_eq!(SoftwareCodec::for_codec_name("h264"), Some(SoftwareCodec::X264));
        assert_eq!(SoftwareCodec::for_codec_name("VP8"), Some(SoftwareCodec::Vp8));
        assert_eq!(SoftwareCodec::for_codec_name("AV1"), None);
        assert_eq!(SoftwareCodec::X264.element_name(), "x264enc");
    }

    #[test]
    fn encode_before_init_is_uninitialized() {
        let encoder = GstSoftwareEncoder::new(SoftwareCodec::X264);
        let frame = VideoFrame::new(Arc::new(crate::frame::I420Buffer::new(16, 16)), 0);
        assert!(matches!(encoder.encode(&frame, None), Err(EncodeError::Uninitialized)));
    }

    #[test]
    fn wrong_codec_rejected() {
        let encoder = GstSoftwareEncoder::new(SoftwareCodec::Vp8);
        let err = encoder
            .init_encode(&CodecSettings::h264(64, 64), &EncoderSettings::default())
            .unwrap_err();
        assert!(matches!(err, EncodeError::Parameter(_)));
    }

    #[allow(clippy::cast_possible_truncation)]
    fn pending(frame: u64) -> PendingFrame {
        PendingFrame {
            pts: gst::ClockTime::from_mseconds(frame * 33),
            rtp_timestamp: frame as u32 * 3000,
            capture_time_us: 0,
            color_space: None,
        }
    }

    #[test]
    fn outputs_matched_by_pts() {
        let mut queue: VecDeque<PendingFrame> = (0..4).map(pending).collect();

        assert_eq!(take_pending(&mut queue, Some(pending(0).pts)), Some(pending(0)));
        // Frames 1 and 2 were dropped by the encoder.
        assert_eq!(take_pending(&mut queue, Some(pending(3).pts)), Some(pending(3)));
        assert!(queue.is_empty());
    }

    #[test]
    fn unknown_pts_leaves_queue_alone() {
        let mut queue: VecDeque<PendingFrame> = (5..7).map(pending).collect();

        assert_eq!(take_pending(&mut queue, Some(pending(2).pts)), None);
        assert_eq!(queue.len(), 2);
        assert_eq!(take_pending(&mut queue, None), Some(pending(5)));
    }

    #[test]
    fn pending_is_bounded() {
        let mut queue = VecDeque::new();
        for i in 0..(MAX_PENDING as u64 + 10) {
            push_pending(&mut queue, pending(i));
        }
        assert_eq!(queue.len(), MAX_PENDING);
        assert_eq!(queue.front(), Some(&pending(10)));
    }

    #[test]
    fn x264_round_trip_when_available() {
        if !is_encoder_available(SoftwareCodec::X264) {
            return;
        }
        let encoder = GstSoftwareEncoder::new(SoftwareCodec::X264);
        encoder
            .init_encode(&CodecSettings::h264(64, 64), &EncoderSettings::default())
            .unwrap();
        let count = Arc::new(Mutex::new(0usize));
        let sink = Arc::clone(&count);
        encoder.register_encode_complete_callback(Some(Arc::new(
            move |image: &EncodedImage, _: &CodecSpecificInfo| {
                assert!(!image.is_empty());
                *sink.lock().unwrap() += 1;
                CallbackResult::Ok
            },
        )));
        for i in 0..10 {
            let frame = VideoFrame::new(Arc::new(crate::frame::I420Buffer::new(64, 64)), i * 3000);
            encoder.encode(&frame, None).unwrap();
        }
        encoder.release();
        let frame = VideoFrame::new(Arc::new(crate::frame::I420Buffer::new(64, 64)), 0);
        assert!(encoder.encode(&frame, None).is_err());
    }
}
