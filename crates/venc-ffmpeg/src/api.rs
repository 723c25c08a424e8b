//! The encoder-facing capability interface.
//!
//! [`CodecApi`] has one method per native operation. The encoder session
//! only ever talks to this trait, so the real `FFmpeg` implementation
//! ([`FfmpegApi`]) can be swapped for an in-memory double in tests.

use std::ffi::{c_char, c_int, CString};
use std::ptr::NonNull;
use std::sync::Arc;

use crate::error::LoadError;
use crate::ffi::{self, AVCodec, AVCodecContext, AVFrame, AVPacket};
use crate::loader::InitOnce;
use crate::symbols::{CodecSymbols, UtilSymbols};

/// `AVERROR(EINVAL)`, returned for names that cannot cross the C boundary.
const AVERROR_EINVAL: c_int = -22;

/// Versioned `libavcodec` module name.
#[cfg(windows)]
pub const AVCODEC_MODULE: &str = "avcodec-61.dll";
/// Versioned `libavutil` module name.
#[cfg(windows)]
pub const AVUTIL_MODULE: &str = "avutil-59.dll";

/// Versioned `libavcodec` module name.
#[cfg(target_os = "macos")]
pub const AVCODEC_MODULE: &str = "libavcodec.61.dylib";
/// Versioned `libavutil` module name.
#[cfg(target_os = "macos")]
pub const AVUTIL_MODULE: &str = "libavutil.59.dylib";

/// Versioned `libavcodec` module name.
#[cfg(not(any(windows, target_os = "macos")))]
pub const AVCODEC_MODULE: &str = "libavcodec.so.61";
/// Versioned `libavutil` module name.
#[cfg(not(any(windows, target_os = "macos")))]
pub const AVUTIL_MODULE: &str = "libavutil.so.59";

/// Native encoder operations.
///
/// Methods taking pointers are `unsafe`: callers must pass pointers that
/// were produced by the same implementation and have not been freed.
/// Negative `c_int` results are `AVERROR` codes.
pub trait CodecApi: Send + Sync {
    /// Look up an encoder by name (`avcodec_find_encoder_by_name`).
    fn find_encoder(&self, name: &str) -> Option<NonNull<AVCodec>>;

    /// Allocate a context for `codec` (`avcodec_alloc_context3`).
    fn alloc_context(&self, codec: NonNull<AVCodec>) -> Option<NonNull<AVCodecContext>>;

    /// Set a string option on the context or its private data (`av_opt_set`).
    ///
    /// # Safety
    ///
    /// `ctx` must be a live context from [`CodecApi::alloc_context`].
    unsafe fn set_option(&self, ctx: NonNull<AVCodecContext>, name: &str, value: &str) -> c_int;

    /// Set an integer option on the context or its private data (`av_opt_set_int`).
    ///
    /// # Safety
    ///
    /// `ctx` must be a live context from [`CodecApi::alloc_context`].
    unsafe fn set_option_int(&self, ctx: NonNull<AVCodecContext>, name: &str, value: i64) -> c_int;

    /// Open the context (`avcodec_open2`).
    ///
    /// # Safety
    ///
    /// `ctx` must be a live, unopened context allocated for `codec`.
    unsafe fn open(&self, ctx: NonNull<AVCodecContext>, codec: NonNull<AVCodec>) -> c_int;

    /// Free the context (`avcodec_free_context`).
    ///
    /// # Safety
    ///
    /// `ctx` must be live and must not be used afterwards.
    unsafe fn free_context(&self, ctx: NonNull<AVCodecContext>);

    /// Allocate an empty frame (`av_frame_alloc`).
    fn alloc_frame(&self) -> Option<NonNull<AVFrame>>;

    /// Allocate plane buffers for a frame whose format and size are set
    /// (`av_frame_get_buffer`).
    ///
    /// # Safety
    ///
    /// `frame` must be live.
    unsafe fn frame_get_buffer(&self, frame: NonNull<AVFrame>, align: c_int) -> c_int;

    /// Ensure the frame's buffers are not shared (`av_frame_make_writable`).
    ///
    /// # Safety
    ///
    /// `frame` must be live.
    unsafe fn frame_make_writable(&self, frame: NonNull<AVFrame>) -> c_int;

    /// Free the frame and its buffers (`av_frame_free`).
    ///
    /// # Safety
    ///
    /// `frame` must be live and must not be used afterwards.
    unsafe fn free_frame(&self, frame: NonNull<AVFrame>);

    /// Submit a frame to the encoder (`avcodec_send_frame`).
    ///
    /// # Safety
    ///
    /// `ctx` must be opened and `frame` live.
    unsafe fn send_frame(&self, ctx: NonNull<AVCodecContext>, frame: NonNull<AVFrame>) -> c_int;

    /// Allocate an empty packet (`av_packet_alloc`).
    fn alloc_packet(&self) -> Option<NonNull<AVPacket>>;

    /// Retrieve one encoded packet (`avcodec_receive_packet`).
    ///
    /// # Safety
    ///
    /// `ctx` must be opened and `packet` live and unreferenced.
    unsafe fn receive_packet(
        &self,
        ctx: NonNull<AVCodecContext>,
        packet: NonNull<AVPacket>,
    ) -> c_int;

    /// Drop the packet's payload reference (`av_packet_unref`).
    ///
    /// # Safety
    ///
    /// `packet` must be live.
    unsafe fn unref_packet(&self, packet: NonNull<AVPacket>);

    /// Free the packet (`av_packet_free`).
    ///
    /// # Safety
    ///
    /// `packet` must be live and must not be used afterwards.
    unsafe fn free_packet(&self, packet: NonNull<AVPacket>);

    /// Human-readable text for an `AVERROR` code.
    fn error_string(&self, code: c_int) -> String {
        format!("error {code}")
    }
}

/// [`CodecApi`] backed by dynamically loaded `FFmpeg` modules.
#[derive(Debug)]
pub struct FfmpegApi {
    codec: CodecSymbols,
    util: UtilSymbols,
}

impl FfmpegApi {
    /// Load both entry-point groups from the platform's default modules.
    ///
    /// # Errors
    ///
    /// See [`FfmpegApi::load_from`].
    pub fn load() -> Result<Self, LoadError> {
        Self::load_from(AVCODEC_MODULE, AVUTIL_MODULE)
    }

    /// Load the codec group from `codec_module` and the utility group from
    /// `util_module`.
    ///
    /// The utility module is not touched when the codec group fails, since
    /// no encoding is possible without it.
    ///
    /// # Errors
    ///
    /// Returns the first group's [`LoadError`].
    pub fn load_from(codec_module: &str, util_module: &str) -> Result<Self, LoadError> {
        Self::load_groups(
            || {
                tracing::info!(module = codec_module, "Loading FFmpeg codec entry points");
                CodecSymbols::load(codec_module).inspect_err(|e| {
                    tracing::error!("open {codec_module} failed: {e}");
                })
            },
            || {
                tracing::info!(module = util_module, "Loading FFmpeg utility entry points");
                UtilSymbols::load(util_module).inspect_err(|e| {
                    tracing::error!("open {util_module} failed: {e}");
                })
            },
        )
    }

    fn load_groups(
        codec: impl FnOnce() -> Result<CodecSymbols, LoadError>,
        util: impl FnOnce() -> Result<UtilSymbols, LoadError>,
    ) -> Result<Self, LoadError> {
        let codec = codec()?;
        let util = util()?;
        Ok(Self { codec, util })
    }
}

/// Invoke an option setter with C strings, mapping interior NULs to `EINVAL`.
fn with_c_name<F>(name: &str, f: F) -> c_int
where
    F: FnOnce(*const c_char) -> c_int,
{
    match CString::new(name) {
        Ok(name) => f(name.as_ptr()),
        Err(_) => AVERROR_EINVAL,
    }
}

impl CodecApi for FfmpegApi {
    fn find_encoder(&self, name: &str) -> Option<NonNull<AVCodec>> {
        let name = CString::new(name).ok()?;
        // SAFETY: `name` is a valid NUL-terminated string for the call.
        let codec = unsafe { (self.codec.find_encoder_by_name)(name.as_ptr()) };
        NonNull::new(codec.cast_mut())
    }

    fn alloc_context(&self, codec: NonNull<AVCodec>) -> Option<NonNull<AVCodecContext>> {
        // SAFETY: `codec` came from `find_encoder` and codecs are static.
        NonNull::new(unsafe { (self.codec.alloc_context3)(codec.as_ptr()) })
    }

    unsafe fn set_option(&self, ctx: NonNull<AVCodecContext>, name: &str, value: &str) -> c_int {
        let Ok(value) = CString::new(value) else {
            return AVERROR_EINVAL;
        };
        with_c_name(name, |name| {
            // SAFETY: `ctx` is live per the caller contract; strings outlive the call.
            unsafe {
                (self.util.opt_set)(
                    ctx.as_ptr().cast(),
                    name,
                    value.as_ptr(),
                    ffi::AV_OPT_SEARCH_CHILDREN,
                )
            }
        })
    }

    unsafe fn set_option_int(&self, ctx: NonNull<AVCodecContext>, name: &str, value: i64) -> c_int {
        with_c_name(name, |name| {
            // SAFETY: `ctx` is live per the caller contract.
            unsafe {
                (self.util.opt_set_int)(
                    ctx.as_ptr().cast(),
                    name,
                    value,
                    ffi::AV_OPT_SEARCH_CHILDREN,
                )
            }
        })
    }

    unsafe fn open(&self, ctx: NonNull<AVCodecContext>, codec: NonNull<AVCodec>) -> c_int {
        // SAFETY: forwarded caller contract.
        unsafe { (self.codec.open2)(ctx.as_ptr(), codec.as_ptr(), std::ptr::null_mut()) }
    }

    unsafe fn free_context(&self, ctx: NonNull<AVCodecContext>) {
        let mut ptr = ctx.as_ptr();
        // SAFETY: forwarded caller contract.
        unsafe { (self.codec.free_context)(&raw mut ptr) };
    }

    fn alloc_frame(&self) -> Option<NonNull<AVFrame>> {
        // SAFETY: no preconditions.
        NonNull::new(unsafe { (self.util.frame_alloc)() })
    }

    unsafe fn frame_get_buffer(&self, frame: NonNull<AVFrame>, align: c_int) -> c_int {
        // SAFETY: forwarded caller contract.
        unsafe { (self.util.frame_get_buffer)(frame.as_ptr(), align) }
    }

    unsafe fn frame_make_writable(&self, frame: NonNull<AVFrame>) -> c_int {
        // SAFETY: forwarded caller contract.
        unsafe { (self.util.frame_make_writable)(frame.as_ptr()) }
    }

    unsafe fn free_frame(&self, frame: NonNull<AVFrame>) {
        let mut ptr = frame.as_ptr();
        // SAFETY: forwarded caller contract.
        unsafe { (self.util.frame_free)(&raw mut ptr) };
    }

    unsafe fn send_frame(&self, ctx: NonNull<AVCodecContext>, frame: NonNull<AVFrame>) -> c_int {
        // SAFETY: forwarded caller contract.
        unsafe { (self.codec.send_frame)(ctx.as_ptr(), frame.as_ptr()) }
    }

    fn alloc_packet(&self) -> Option<NonNull<AVPacket>> {
        // SAFETY: no preconditions.
        NonNull::new(unsafe { (self.codec.packet_alloc)() })
    }

    unsafe fn receive_packet(
        &self,
        ctx: NonNull<AVCodecContext>,
        packet: NonNull<AVPacket>,
    ) -> c_int {
        // SAFETY: forwarded caller contract.
        unsafe { (self.codec.receive_packet)(ctx.as_ptr(), packet.as_ptr()) }
    }

    unsafe fn unref_packet(&self, packet: NonNull<AVPacket>) {
        // SAFETY: forwarded caller contract.
        unsafe { (self.codec.packet_unref)(packet.as_ptr()) };
    }

    unsafe fn free_packet(&self, packet: NonNull<AVPacket>) {
        let mut ptr = packet.as_ptr();
        // SAFETY: forwarded caller contract.
        unsafe { (self.codec.packet_free)(&raw mut ptr) };
    }

    fn error_string(&self, code: c_int) -> String {
        let mut buf = [0 as c_char; 256];
        // SAFETY: `buf` is writable for its full length.
        let ret = unsafe { (self.util.strerror)(code, buf.as_mut_ptr(), buf.len()) };
        if ret < 0 {
            return format!("error {code}");
        }
        // SAFETY: av_strerror always NUL-terminates within the buffer.
        unsafe { std::ffi::CStr::from_ptr(buf.as_ptr()) }
            .to_string_lossy()
            .into_owned()
    }
}

static FFMPEG: InitOnce<FfmpegApi> = InitOnce::new();

/// Load `FFmpeg` once per process and return the shared entry points.
///
/// The first call performs the load; every later call (including racing
/// concurrent ones) returns the same outcome without touching the modules
/// again.
///
/// # Errors
///
/// Returns the cached [`LoadError`] if the first attempt failed.
pub fn init_avcodec() -> Result<Arc<FfmpegApi>, LoadError> {
    FFMPEG.get_or_load(FfmpegApi::load)
}

/// [`init_avcodec`] erased to the capability interface.
///
/// # Errors
///
/// See [`init_avcodec`].
pub fn shared_api() -> Result<Arc<dyn CodecApi>, LoadError> {
    init_avcodec().map(|api| api as Arc<dyn CodecApi>)
}
