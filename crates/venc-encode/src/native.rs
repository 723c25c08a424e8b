//! Owned native encoder resources.
//!
//! Each native allocation is wrapped in an owner that frees it on drop, so
//! every early return during open releases exactly what was allocated.
//! [`NativeEncoder`] declares its fields so they drop packet, frame, then
//! context.

use std::ffi::c_int;
use std::ptr::NonNull;
use std::sync::Arc;

use venc_config::NvencConfig;
use venc_ffmpeg::ffi::{
    self, AVCodec, AVCodecContext, AVFrame, AVPacket, AVERROR_EAGAIN, AVERROR_EOF,
};
use venc_ffmpeg::CodecApi;

use crate::error::EncodeError;
use crate::frame::{chroma_size, copy_plane, I420Buffer};

/// Negotiated session parameters applied at open time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct OpenParams {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub bit_rate: i64,
    pub gop: i32,
}

struct OwnedContext {
    ptr: NonNull<AVCodecContext>,
    api: Arc<dyn CodecApi>,
}

impl OwnedContext {
    fn alloc(api: &Arc<dyn CodecApi>, codec: NonNull<AVCodec>) -> Result<Self, EncodeError> {
        let ptr = api.alloc_context(codec).ok_or(EncodeError::ContextAlloc)?;
        Ok(Self {
            ptr,
            api: Arc::clone(api),
        })
    }
}

impl Drop for OwnedContext {
    fn drop(&mut self) {
        // SAFETY: allocated by `api` and exclusively owned here.
        unsafe { self.api.free_context(self.ptr) };
    }
}

struct OwnedFrame {
    ptr: NonNull<AVFrame>,
    api: Arc<dyn CodecApi>,
}

impl OwnedFrame {
    fn alloc(api: &Arc<dyn CodecApi>) -> Result<Self, EncodeError> {
        let ptr = api.alloc_frame().ok_or(EncodeError::FrameAlloc)?;
        Ok(Self {
            ptr,
            api: Arc::clone(api),
        })
    }

    fn fields(&mut self) -> &mut AVFrame {
        // SAFETY: the frame is live for `self`'s lifetime and only touched
        // through this exclusive borrow.
        unsafe { self.ptr.as_mut() }
    }
}

impl Drop for OwnedFrame {
    fn drop(&mut self) {
        // SAFETY: allocated by `api` and exclusively owned here.
        unsafe { self.api.free_frame(self.ptr) };
    }
}

struct OwnedPacket {
    ptr: NonNull<AVPacket>,
    api: Arc<dyn CodecApi>,
}

impl OwnedPacket {
    fn alloc(api: &Arc<dyn CodecApi>) -> Result<Self, EncodeError> {
        let ptr = api.alloc_packet().ok_or(EncodeError::PacketAlloc)?;
        Ok(Self {
            ptr,
            api: Arc::clone(api),
        })
    }
}

impl Drop for OwnedPacket {
    fn drop(&mut self) {
        // SAFETY: allocated by `api` and exclusively owned here.
        unsafe { self.api.free_packet(self.ptr) };
    }
}

/// An opened `FFmpeg` encoder with its persistent input frame and output
/// packet.
pub(crate) struct NativeEncoder {
    packet: OwnedPacket,
    frame: OwnedFrame,
    context: OwnedContext,
    api: Arc<dyn CodecApi>,
    width: u32,
    height: u32,
}

// SAFETY: the native objects are owned exclusively by this value and the
// session only touches them while holding its mutex.
unsafe impl Send for NativeEncoder {}

impl NativeEncoder {
    /// Find, configure and open the encoder, then allocate the frame and
    /// packet.
    ///
    /// # Errors
    ///
    /// Returns the first failing step. Everything allocated up to that
    /// point has been freed when this returns.
    pub(crate) fn open(
        api: Arc<dyn CodecApi>,
        params: OpenParams,
        tuning: &NvencConfig,
    ) -> Result<Self, EncodeError> {
        let codec = api
            .find_encoder(&tuning.encoder)
            .ok_or_else(|| EncodeError::EncoderNotFound(tuning.encoder.clone()))?;

        let context = OwnedContext::alloc(&api, codec)?;
        configure(&*api, context.ptr, params, tuning)?;

        // SAFETY: `context` is live, configured and not yet opened.
        let ret = unsafe { api.open(context.ptr, codec) };
        if ret < 0 {
            let message = api.error_string(ret);
            tracing::error!(
                code = ret,
                %message,
                encoder = %tuning.encoder,
                "avcodec_open2 failed"
            );
            return Err(EncodeError::Open { code: ret, message });
        }

        let mut frame = OwnedFrame::alloc(&api)?;
        {
            let fields = frame.fields();
            fields.format = ffi::AV_PIX_FMT_YUV420P;
            fields.width = to_c_int(params.width)?;
            fields.height = to_c_int(params.height)?;
        }
        // SAFETY: `frame` is live with format and size set.
        let ret = unsafe { api.frame_get_buffer(frame.ptr, ffi::FRAME_ALIGN) };
        if ret < 0 {
            let message = api.error_string(ret);
            tracing::error!(code = ret, %message, "av_frame_get_buffer failed");
            return Err(EncodeError::FrameBuffer { code: ret, message });
        }

        let packet = OwnedPacket::alloc(&api)?;

        Ok(Self {
            packet,
            frame,
            context,
            api,
            width: params.width,
            height: params.height,
        })
    }

    pub(crate) fn width(&self) -> u32 {
        self.width
    }

    pub(crate) fn height(&self) -> u32 {
        self.height
    }

    /// Copy an I420 picture into the persistent frame and stamp it.
    ///
    /// `force_key` marks the picture as intra so the encoder emits an IDR.
    ///
    /// # Errors
    ///
    /// Returns [`EncodeError::MakeWritable`] or [`EncodeError::FrameLayout`].
    pub(crate) fn fill_frame(
        &mut self,
        image: &I420Buffer,
        pts: i64,
        force_key: bool,
    ) -> Result<(), EncodeError> {
        // SAFETY: the frame is live; the encoder may still hold references
        // to its previous buffers, which this call detaches.
        let ret = unsafe { self.api.frame_make_writable(self.frame.ptr) };
        if ret < 0 {
            return Err(EncodeError::MakeWritable {
                code: ret,
                message: self.api.error_string(ret),
            });
        }

        let (w, h) = (self.width as usize, self.height as usize);
        let (cw, ch) = chroma_size(w, h);
        let chroma_rows = h.div_ceil(2);
        let fields = self.frame.fields();

        let planes: [(&[u8], usize, usize, usize, usize); 3] = [
            (image.data_y(), image.stride_y(), w, h, h),
            (image.data_u(), image.stride_u(), cw, ch, chroma_rows),
            (image.data_v(), image.stride_v(), cw, ch, chroma_rows),
        ];
        for (plane, (src, src_stride, width, rows, alloc_rows)) in planes.into_iter().enumerate() {
            let data = fields.data[plane];
            let Ok(linesize) = usize::try_from(fields.linesize[plane]) else {
                return Err(EncodeError::FrameLayout { plane });
            };
            if data.is_null() || linesize < width.max(1) {
                return Err(EncodeError::FrameLayout { plane });
            }
            // SAFETY: av_frame_get_buffer allocated `linesize` bytes for each
            // of the plane's rows, and make_writable made them exclusive.
            let dst = unsafe { std::slice::from_raw_parts_mut(data, linesize * alloc_rows) };
            copy_plane(dst, linesize, src, src_stride, width, rows);
        }

        fields.pts = pts;
        fields.pict_type = if force_key {
            ffi::AV_PICTURE_TYPE_I
        } else {
            ffi::AV_PICTURE_TYPE_NONE
        };
        Ok(())
    }

    /// Submit the persistent frame.
    ///
    /// # Errors
    ///
    /// Returns [`EncodeError::SendFrame`] on a negative native result.
    pub(crate) fn send_frame(&mut self) -> Result<(), EncodeError> {
        // SAFETY: context is open, frame is live.
        let ret = unsafe { self.api.send_frame(self.context.ptr, self.frame.ptr) };
        if ret < 0 {
            return Err(EncodeError::SendFrame {
                code: ret,
                message: self.api.error_string(ret),
            });
        }
        Ok(())
    }

    /// Pull the next encoded packet, if one is ready.
    ///
    /// `Ok(None)` means the encoder needs more input (or is flushed).
    ///
    /// # Errors
    ///
    /// Returns [`EncodeError::ReceivePacket`] on any other negative result.
    pub(crate) fn receive_packet(&mut self) -> Result<Option<PacketRef<'_>>, EncodeError> {
        // SAFETY: context is open; the packet is unreferenced because every
        // previous `PacketRef` unref'd it on drop.
        let ret = unsafe { self.api.receive_packet(self.context.ptr, self.packet.ptr) };
        match ret {
            AVERROR_EAGAIN | AVERROR_EOF => Ok(None),
            code if code < 0 => Err(EncodeError::ReceivePacket {
                code,
                message: self.api.error_string(code),
            }),
            _ => Ok(Some(PacketRef {
                packet: self.packet.ptr,
                api: &*self.api,
            })),
        }
    }

    /// Update the target bitrate on the open context.
    pub(crate) fn set_bit_rate(&mut self, bit_rate: i64) -> c_int {
        // SAFETY: context is live.
        unsafe { self.api.set_option_int(self.context.ptr, "b", bit_rate) }
    }

    /// Rewrite `time_base` and `framerate` for a new frame rate.
    pub(crate) fn set_frame_rate(&mut self, fps: u32) -> c_int {
        let ctx = self.context.ptr;
        // SAFETY: context is live.
        let ret = unsafe { self.api.set_option(ctx, "time_base", &format!("1/{fps}")) };
        if ret < 0 {
            return ret;
        }
        // SAFETY: context is live.
        let ret = unsafe { self.api.set_option(ctx, "framerate", &format!("{fps}/1")) };
        if ret < 0 {
            tracing::debug!(code = ret, "framerate option not applied");
        }
        0
    }
}

/// A received packet. Unreferenced when dropped.
pub(crate) struct PacketRef<'a> {
    packet: NonNull<AVPacket>,
    api: &'a dyn CodecApi,
}

impl PacketRef<'_> {
    fn fields(&self) -> &AVPacket {
        // SAFETY: the packet is live and was just filled by receive_packet.
        unsafe { self.packet.as_ref() }
    }

    pub(crate) fn data(&self) -> &[u8] {
        let fields = self.fields();
        match usize::try_from(fields.size) {
            Ok(len) if len > 0 && !fields.data.is_null() => {
                // SAFETY: FFmpeg guarantees `size` readable bytes at `data`
                // while the packet holds its reference.
                unsafe { std::slice::from_raw_parts(fields.data, len) }
            }
            _ => &[],
        }
    }

    pub(crate) fn is_key(&self) -> bool {
        self.fields().flags & ffi::AV_PKT_FLAG_KEY != 0
    }
}

impl Drop for PacketRef<'_> {
    fn drop(&mut self) {
        // SAFETY: packet is live.
        unsafe { self.api.unref_packet(self.packet) };
    }
}

fn to_c_int(v: u32) -> Result<c_int, EncodeError> {
    c_int::try_from(v).map_err(|_| EncodeError::Parameter(format!("dimension {v} out of range")))
}

fn option_error(api: &dyn CodecApi, name: &str, code: c_int) -> EncodeError {
    let message = api.error_string(code);
    tracing::error!(option = name, code, %message, "failed to set encoder option");
    EncodeError::Option {
        name: name.to_string(),
        code,
        message,
    }
}

/// Apply stream parameters and tuning to an unopened context.
fn configure(
    api: &dyn CodecApi,
    ctx: NonNull<AVCodecContext>,
    params: OpenParams,
    tuning: &NvencConfig,
) -> Result<(), EncodeError> {
    let required: [(&str, String); 3] = [
        ("video_size", format!("{}x{}", params.width, params.height)),
        ("pixel_format", "yuv420p".to_string()),
        ("time_base", format!("1/{}", params.fps)),
    ];
    for (name, value) in &required {
        // SAFETY: `ctx` is live and unopened.
        let ret = unsafe { api.set_option(ctx, name, value) };
        if ret < 0 {
            return Err(option_error(api, name, ret));
        }
    }

    let ints: [(&str, i64); 3] = [("b", params.bit_rate), ("g", i64::from(params.gop)), ("bf", 0)];
    for (name, value) in ints {
        // SAFETY: as above.
        let ret = unsafe { api.set_option_int(ctx, name, value) };
        if ret < 0 {
            return Err(option_error(api, name, ret));
        }
    }

    // Best effort from here on: private options vary across FFmpeg builds
    // and the encoder ignores ones it does not know.
    let fps = format!("{}/1", params.fps);
    let strings: [(&str, &str); 4] = [
        ("framerate", fps.as_str()),
        ("profile", tuning.profile.as_str()),
        ("preset", tuning.preset.as_str()),
        ("rc", tuning.rc.as_str()),
    ];
    for (name, value) in strings {
        // SAFETY: as above.
        let ret = unsafe { api.set_option(ctx, name, value) };
        if ret < 0 {
            tracing::warn!(option = name, value, code = ret, "encoder option not applied");
        }
    }

    let flags: [(&str, i64); 3] = [
        ("zerolatency", i64::from(tuning.zerolatency)),
        ("annexb", i64::from(tuning.annexb)),
        ("forced-idr", 1),
    ];
    for (name, value) in flags {
        // SAFETY: as above.
        let ret = unsafe { api.set_option_int(ctx, name, value) };
        if ret < 0 {
            tracing::warn!(option = name, value, code = ret, "encoder option not applied");
        }
    }

    tracing::debug!(
        width = params.width,
        height = params.height,
        fps = params.fps,
        bit_rate = params.bit_rate,
        gop = params.gop,
        "Encoder context configured"
    );
    Ok(())
}
