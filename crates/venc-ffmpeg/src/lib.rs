// Late-bound FFmpeg for hardware H.264 encoding.
//
// - loader.rs: module resolution and the process-wide one-time cache
// - symbols.rs: typed avcodec/avutil entry-point groups
// - api.rs: CodecApi capability trait and the FFmpeg implementation
// - ffi.rs: ABI types, constants and function pointer signatures

pub mod api;
pub mod error;
pub mod ffi;
pub mod loader;
pub mod symbols;

pub use api::{init_avcodec, shared_api, CodecApi, FfmpegApi, AVCODEC_MODULE, AVUTIL_MODULE};
pub use error::{LoadError, ResolutionReport};
pub use loader::{resolve, InitOnce, ResolvedModule};
