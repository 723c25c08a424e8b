//! Typed entry-point groups.
//!
//! Each group is built only from a [`ResolvedModule`] in which every name
//! in its list resolved, and keeps that module loaded for as long as the
//! function pointers are reachable.

use crate::error::LoadError;
use crate::ffi;
use crate::loader::{resolve, ResolvedModule};

/// Entry points required from `libavcodec`.
pub const CODEC_ENTRY_POINTS: [&str; 9] = [
    "av_packet_alloc",
    "av_packet_free",
    "avcodec_find_encoder_by_name",
    "avcodec_alloc_context3",
    "avcodec_open2",
    "avcodec_free_context",
    "avcodec_send_frame",
    "avcodec_receive_packet",
    "av_packet_unref",
];

/// Entry points required from `libavutil`.
pub const UTIL_ENTRY_POINTS: [&str; 7] = [
    "av_opt_set",
    "av_opt_set_int",
    "av_frame_alloc",
    "av_frame_get_buffer",
    "av_frame_free",
    "av_frame_make_writable",
    "av_strerror",
];

/// Packet, context and encode entry points from `libavcodec`.
#[derive(Debug)]
pub struct CodecSymbols {
    pub packet_alloc: ffi::AvPacketAllocFn,
    pub packet_free: ffi::AvPacketFreeFn,
    pub find_encoder_by_name: ffi::AvcodecFindEncoderByNameFn,
    pub alloc_context3: ffi::AvcodecAllocContext3Fn,
    pub open2: ffi::AvcodecOpen2Fn,
    pub free_context: ffi::AvcodecFreeContextFn,
    pub send_frame: ffi::AvcodecSendFrameFn,
    pub receive_packet: ffi::AvcodecReceivePacketFn,
    pub packet_unref: ffi::AvPacketUnrefFn,
    _module: ResolvedModule,
}

impl CodecSymbols {
    /// Resolve the codec group from `module`.
    ///
    /// # Errors
    ///
    /// Returns [`LoadError`] if the module is absent or incomplete.
    pub fn load(module: &str) -> Result<Self, LoadError> {
        Self::from_module(resolve(module, &CODEC_ENTRY_POINTS)?)
    }

    fn from_module(module: ResolvedModule) -> Result<Self, LoadError> {
        // SAFETY: every type below is the `FFmpeg` 7 signature of the
        // entry point it is looked up by.
        let (
            Some(packet_alloc),
            Some(packet_free),
            Some(find_encoder_by_name),
            Some(alloc_context3),
            Some(open2),
            Some(free_context),
            Some(send_frame),
            Some(receive_packet),
            Some(packet_unref),
        ) = (unsafe {
            (
                module.function::<ffi::AvPacketAllocFn>("av_packet_alloc"),
                module.function::<ffi::AvPacketFreeFn>("av_packet_free"),
                module.function::<ffi::AvcodecFindEncoderByNameFn>("avcodec_find_encoder_by_name"),
                module.function::<ffi::AvcodecAllocContext3Fn>("avcodec_alloc_context3"),
                module.function::<ffi::AvcodecOpen2Fn>("avcodec_open2"),
                module.function::<ffi::AvcodecFreeContextFn>("avcodec_free_context"),
                module.function::<ffi::AvcodecSendFrameFn>("avcodec_send_frame"),
                module.function::<ffi::AvcodecReceivePacketFn>("avcodec_receive_packet"),
                module.function::<ffi::AvPacketUnrefFn>("av_packet_unref"),
            )
        })
        else {
            return Err(unexpected_miss(&module));
        };

        Ok(Self {
            packet_alloc,
            packet_free,
            find_encoder_by_name,
            alloc_context3,
            open2,
            free_context,
            send_frame,
            receive_packet,
            packet_unref,
            _module: module,
        })
    }
}

/// Option and frame entry points from `libavutil`.
#[derive(Debug)]
pub struct UtilSymbols {
    pub opt_set: ffi::AvOptSetFn,
    pub opt_set_int: ffi::AvOptSetIntFn,
    pub frame_alloc: ffi::AvFrameAllocFn,
    pub frame_get_buffer: ffi::AvFrameGetBufferFn,
    pub frame_free: ffi::AvFrameFreeFn,
    pub frame_make_writable: ffi::AvFrameMakeWritableFn,
    pub strerror: ffi::AvStrerrorFn,
    _module: ResolvedModule,
}

impl UtilSymbols {
    /// Resolve the utility group from `module`.
    ///
    /// # Errors
    ///
    /// Returns [`LoadError`] if the module is absent or incomplete.
    pub fn load(module: &str) -> Result<Self, LoadError> {
        Self::from_module(resolve(module, &UTIL_ENTRY_POINTS)?)
    }

    fn from_module(module: ResolvedModule) -> Result<Self, LoadError> {
        // SAFETY: see `CodecSymbols::from_module`.
        let (
            Some(opt_set),
            Some(opt_set_int),
            Some(frame_alloc),
            Some(frame_get_buffer),
            Some(frame_free),
            Some(frame_make_writable),
            Some(strerror),
        ) = (unsafe {
            (
                module.function::<ffi::AvOptSetFn>("av_opt_set"),
                module.function::<ffi::AvOptSetIntFn>("av_opt_set_int"),
                module.function::<ffi::AvFrameAllocFn>("av_frame_alloc"),
                module.function::<ffi::AvFrameGetBufferFn>("av_frame_get_buffer"),
                module.function::<ffi::AvFrameFreeFn>("av_frame_free"),
                module.function::<ffi::AvFrameMakeWritableFn>("av_frame_make_writable"),
                module.function::<ffi::AvStrerrorFn>("av_strerror"),
            )
        })
        else {
            return Err(unexpected_miss(&module));
        };

        Ok(Self {
            opt_set,
            opt_set_int,
            frame_alloc,
            frame_get_buffer,
            frame_free,
            frame_make_writable,
            strerror,
            _module: module,
        })
    }
}

/// A name verified by `resolve` disappeared on the typed lookup.
fn unexpected_miss(module: &ResolvedModule) -> LoadError {
    tracing::error!(module = module.module(), "Entry point vanished after resolution");
    LoadError::MissingSymbols {
        module: module.module().to_string(),
        report: module.report().clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn groups_have_no_duplicates() {
        for group in [&CODEC_ENTRY_POINTS[..], &UTIL_ENTRY_POINTS[..]] {
            let mut names = group.to_vec();
            names.sort_unstable();
            names.dedup();
            assert_eq!(names.len(), group.len());
        }
    }

    #[test]
    fn absent_module_fails_the_group() {
        let err = CodecSymbols::load("libno-such-avcodec.so.0").unwrap_err();
        assert!(matches!(err, LoadError::ModuleNotFound { .. }));
    }
}
