//! Raw `FFmpeg` ABI surface used by the encoder.
//!
//! Nothing here is linked at build time. Function pointer types describe
//! the entry points resolved by [`crate::symbols`], and the structs mirror
//! only the leading fields of `AVFrame` and `AVPacket` that the encoder
//! touches. Layouts match `FFmpeg` 7 (`avcodec-61`, `avutil-59`).
//!
//! `AVCodecContext` is treated as opaque: every field the encoder sets goes
//! through the `AVOptions` API instead.

use std::ffi::{c_char, c_int, c_void};

/// Number of data pointers in an `AVFrame`.
pub const AV_NUM_DATA_POINTERS: usize = 8;

/// `AV_PIX_FMT_YUV420P`: planar 4:2:0, 12bpp.
pub const AV_PIX_FMT_YUV420P: c_int = 0;

/// `AV_PICTURE_TYPE_NONE`: let the encoder decide.
pub const AV_PICTURE_TYPE_NONE: c_int = 0;

/// `AV_PICTURE_TYPE_I`: intra picture, used to force a keyframe.
pub const AV_PICTURE_TYPE_I: c_int = 1;

/// Packet flag marking a keyframe.
pub const AV_PKT_FLAG_KEY: c_int = 0x0001;

/// Search the object's children (codec private data) for the option.
pub const AV_OPT_SEARCH_CHILDREN: c_int = 1;

/// Buffer alignment for the persistent input frame.
pub const FRAME_ALIGN: c_int = 32;

/// `AVERROR(EAGAIN)`: output not available in the current state.
///
/// `FFmpeg` negates the platform errno, so this is -11 on Linux and
/// Windows but -35 on macOS and the BSDs.
pub const AVERROR_EAGAIN: c_int = -libc::EAGAIN;

/// Build an `FFmpeg` four-character error tag.
const fn fferrtag(a: u8, b: u8, c: u8, d: u8) -> c_int {
    -((a as c_int) | ((b as c_int) << 8) | ((c as c_int) << 16) | ((d as c_int) << 24))
}

/// `AVERROR_EOF`: the encoder has been fully flushed.
pub const AVERROR_EOF: c_int = fferrtag(b'E', b'O', b'F', b' ');

/// `AVERROR_OPTION_NOT_FOUND`.
pub const AVERROR_OPTION_NOT_FOUND: c_int = fferrtag(0xF8, b'O', b'P', b'T');

/// Opaque `AVCodec`.
#[repr(C)]
pub struct AVCodec {
    _private: [u8; 0],
}

/// Opaque `AVCodecContext`.
#[repr(C)]
pub struct AVCodecContext {
    _private: [u8; 0],
}

/// Opaque `AVDictionary`.
#[repr(C)]
pub struct AVDictionary {
    _private: [u8; 0],
}

/// `AVRational`.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AVRational {
    pub num: c_int,
    pub den: c_int,
}

/// Leading fields of `AVFrame`.
///
/// Only ever accessed through pointers returned by `av_frame_alloc` (or a
/// test double allocating at least this much), never constructed by value
/// on the `FFmpeg` side.
#[repr(C)]
#[derive(Debug)]
pub struct AVFrame {
    pub data: [*mut u8; AV_NUM_DATA_POINTERS],
    pub linesize: [c_int; AV_NUM_DATA_POINTERS],
    pub extended_data: *mut *mut u8,
    pub width: c_int,
    pub height: c_int,
    pub nb_samples: c_int,
    pub format: c_int,
    pub key_frame: c_int,
    pub pict_type: c_int,
    pub sample_aspect_ratio: AVRational,
    pub pts: i64,
}

/// Leading fields of `AVPacket`.
#[repr(C)]
#[derive(Debug)]
pub struct AVPacket {
    pub buf: *mut c_void,
    pub pts: i64,
    pub dts: i64,
    pub data: *mut u8,
    pub size: c_int,
    pub stream_index: c_int,
    pub flags: c_int,
}

// -- libavcodec --

pub type AvPacketAllocFn = unsafe extern "C" fn() -> *mut AVPacket;
pub type AvPacketFreeFn = unsafe extern "C" fn(pkt: *mut *mut AVPacket);
pub type AvcodecFindEncoderByNameFn = unsafe extern "C" fn(name: *const c_char) -> *const AVCodec;
pub type AvcodecAllocContext3Fn =
    unsafe extern "C" fn(codec: *const AVCodec) -> *mut AVCodecContext;
pub type AvcodecOpen2Fn = unsafe extern "C" fn(
    ctx: *mut AVCodecContext,
    codec: *const AVCodec,
    options: *mut *mut AVDictionary,
) -> c_int;
pub type AvcodecFreeContextFn = unsafe extern "C" fn(ctx: *mut *mut AVCodecContext);
pub type AvcodecSendFrameFn =
    unsafe extern "C" fn(ctx: *mut AVCodecContext, frame: *const AVFrame) -> c_int;
pub type AvcodecReceivePacketFn =
    unsafe extern "C" fn(ctx: *mut AVCodecContext, pkt: *mut AVPacket) -> c_int;
pub type AvPacketUnrefFn = unsafe extern "C" fn(pkt: *mut AVPacket);

// -- libavutil --

pub type AvOptSetFn = unsafe extern "C" fn(
    obj: *mut c_void,
    name: *const c_char,
    val: *const c_char,
    search_flags: c_int,
) -> c_int;
pub type AvOptSetIntFn =
    unsafe extern "C" fn(
        obj: *mut c_void,
        name: *const c_char,
        val: i64,
        search_flags: c_int,
    ) -> c_int;
pub type AvFrameAllocFn = unsafe extern "C" fn() -> *mut AVFrame;
pub type AvFrameGetBufferFn = unsafe extern "C" fn(frame: *mut AVFrame, align: c_int) -> c_int;
pub type AvFrameFreeFn = unsafe extern "C" fn(frame: *mut *mut AVFrame);
pub type AvFrameMakeWritableFn = unsafe extern "C" fn(frame: *mut AVFrame) -> c_int;
pub type AvStrerrorFn =
    unsafe extern "C" fn(errnum: c_int, errbuf: *mut c_char, errbuf_size: usize) -> c_int;
