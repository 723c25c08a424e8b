//! In-memory `CodecApi` for session tests.
//!
//! Allocations are real heap objects and every one is counted, so a leak
//! or double free shows up in the live counters.

use std::collections::VecDeque;
use std::ffi::c_int;
use std::ptr::NonNull;
use std::sync::{Mutex, MutexGuard};

use venc_ffmpeg::ffi::{
    self, AVCodec, AVCodecContext, AVFrame, AVPacket, AVERROR_EAGAIN, AVERROR_OPTION_NOT_FOUND,
};
use venc_ffmpeg::CodecApi;

/// Knobs for making individual native calls fail.
#[derive(Debug, Default, Clone)]
pub(crate) struct Failures {
    pub missing_encoder: bool,
    pub alloc_context: bool,
    pub open: Option<c_int>,
    pub frame_buffer: Option<c_int>,
    pub alloc_packet: bool,
    pub make_writable: Option<c_int>,
    pub send_frame: Option<c_int>,
    pub receive_packet: Option<c_int>,
    pub rejected_options: Vec<&'static str>,
}

/// A frame as the encoder saw it at submission, planes copied tightly.
#[derive(Debug, Clone)]
pub(crate) struct SentFrame {
    pub pts: i64,
    pub pict_type: c_int,
    pub y: Vec<u8>,
    pub u: Vec<u8>,
    pub v: Vec<u8>,
}

#[derive(Debug, Default)]
struct FakeState {
    fail: Failures,
    packets_per_frame: usize,
    encoder_lookups: Vec<String>,
    options: Vec<(String, String)>,
    live_contexts: usize,
    live_frames: usize,
    live_packets: usize,
    outstanding_refs: usize,
    frames_sent: usize,
    sent: Vec<SentFrame>,
    pending: VecDeque<(Vec<u8>, i64, bool)>,
}

pub(crate) struct FakeApi {
    state: Mutex<FakeState>,
}

struct FakeContext {
    opened: bool,
}

#[repr(C)]
struct FakeFrame {
    av: AVFrame,
    buffers: Vec<Vec<u8>>,
}

#[repr(C)]
struct FakePacket {
    av: AVPacket,
    payload: Vec<u8>,
    referenced: bool,
}

/// Fill byte for fresh plane buffers, so untouched bytes are visible.
pub(crate) const FILL: u8 = 0xAA;

impl FakeApi {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(FakeState {
                packets_per_frame: 1,
                ..FakeState::default()
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    pub(crate) fn fail(&self, f: impl FnOnce(&mut Failures)) {
        f(&mut self.lock().fail);
    }

    pub(crate) fn set_packets_per_frame(&self, n: usize) {
        self.lock().packets_per_frame = n;
    }

    /// `(contexts, frames, packets)` currently allocated.
    pub(crate) fn live(&self) -> (usize, usize, usize) {
        let s = self.lock();
        (s.live_contexts, s.live_frames, s.live_packets)
    }

    pub(crate) fn outstanding_refs(&self) -> usize {
        self.lock().outstanding_refs
    }

    pub(crate) fn encoder_lookups(&self) -> Vec<String> {
        self.lock().encoder_lookups.clone()
    }

    pub(crate) fn options(&self) -> Vec<(String, String)> {
        self.lock().options.clone()
    }

    /// Last value set for `name`.
    pub(crate) fn option(&self, name: &str) -> Option<String> {
        self.lock()
            .options
            .iter()
            .rev()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.clone())
    }

    pub(crate) fn sent(&self) -> Vec<SentFrame> {
        self.lock().sent.clone()
    }

    fn gop(state: &FakeState) -> usize {
        state
            .options
            .iter()
            .rev()
            .find(|(n, _)| n == "g")
            .and_then(|(_, v)| v.parse().ok())
            .filter(|&g: &usize| g > 0)
            .unwrap_or(12)
    }
}

fn empty_frame() -> AVFrame {
    AVFrame {
        data: [std::ptr::null_mut(); ffi::AV_NUM_DATA_POINTERS],
        linesize: [0; ffi::AV_NUM_DATA_POINTERS],
        extended_data: std::ptr::null_mut(),
        width: 0,
        height: 0,
        nb_samples: 0,
        format: -1,
        key_frame: 0,
        pict_type: ffi::AV_PICTURE_TYPE_NONE,
        sample_aspect_ratio: ffi::AVRational { num: 0, den: 1 },
        pts: i64::MIN,
    }
}

fn empty_packet() -> AVPacket {
    AVPacket {
        buf: std::ptr::null_mut(),
        pts: i64::MIN,
        dts: i64::MIN,
        data: std::ptr::null_mut(),
        size: 0,
        stream_index: 0,
        flags: 0,
    }
}

/// Plane sizes `(width, rows)` the buffer allocator uses for 4:2:0.
fn plane_dims(width: usize, height: usize) -> [(usize, usize); 3] {
    let chroma = (width.div_ceil(2), height.div_ceil(2));
    [(width, height), chroma, chroma]
}

#[allow(clippy::cast_sign_loss)]
fn dims(frame: &AVFrame) -> (usize, usize) {
    (frame.width.max(0) as usize, frame.height.max(0) as usize)
}

impl CodecApi for FakeApi {
    fn find_encoder(&self, name: &str) -> Option<NonNull<AVCodec>> {
        let mut s = self.lock();
        s.encoder_lookups.push(name.to_string());
        if s.fail.missing_encoder {
            None
        } else {
            Some(NonNull::dangling())
        }
    }

    fn alloc_context(&self, _codec: NonNull<AVCodec>) -> Option<NonNull<AVCodecContext>> {
        let mut s = self.lock();
        if s.fail.alloc_context {
            return None;
        }
        s.live_contexts += 1;
        Some(NonNull::from(Box::leak(Box::new(FakeContext { opened: false }))).cast())
    }

    unsafe fn set_option(&self, _ctx: NonNull<AVCodecContext>, name: &str, value: &str) -> c_int {
        let mut s = self.lock();
        if s.fail.rejected_options.contains(&name) {
            return AVERROR_OPTION_NOT_FOUND;
        }
        s.options.push((name.to_string(), value.to_string()));
        0
    }

    unsafe fn set_option_int(&self, ctx: NonNull<AVCodecContext>, name: &str, value: i64) -> c_int {
        // SAFETY: forwarded.
        unsafe { self.set_option(ctx, name, &value.to_string()) }
    }

    unsafe fn open(&self, ctx: NonNull<AVCodecContext>, _codec: NonNull<AVCodec>) -> c_int {
        if let Some(code) = self.lock().fail.open {
            return code;
        }
        // SAFETY: contexts are `FakeContext`s from `alloc_context`.
        let ctx = unsafe { ctx.cast::<FakeContext>().as_mut() };
        assert!(!ctx.opened, "context opened twice");
        ctx.opened = true;
        0
    }

    unsafe fn free_context(&self, ctx: NonNull<AVCodecContext>) {
        // SAFETY: leaked from a Box in `alloc_context`.
        drop(unsafe { Box::from_raw(ctx.cast::<FakeContext>().as_ptr()) });
        self.lock().live_contexts -= 1;
    }

    fn alloc_frame(&self) -> Option<NonNull<AVFrame>> {
        self.lock().live_frames += 1;
        let frame = Box::new(FakeFrame {
            av: empty_frame(),
            buffers: Vec::new(),
        });
        Some(NonNull::from(Box::leak(frame)).cast())
    }

    unsafe fn frame_get_buffer(&self, frame: NonNull<AVFrame>, align: c_int) -> c_int {
        if let Some(code) = self.lock().fail.frame_buffer {
            return code;
        }
        // SAFETY: frames are `FakeFrame`s with `av` first.
        let frame = unsafe { frame.cast::<FakeFrame>().as_mut() };
        assert_eq!(frame.av.format, ffi::AV_PIX_FMT_YUV420P);
        let (w, h) = dims(&frame.av);
        #[allow(clippy::cast_sign_loss)]
        let align = align.max(1) as usize;

        for (i, (pw, rows)) in plane_dims(w, h).into_iter().enumerate() {
            // Always leave some padding past the visible width.
            let linesize = pw.next_multiple_of(align) + align;
            let mut buf = vec![FILL; linesize * rows];
            frame.av.data[i] = buf.as_mut_ptr();
            #[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
            {
                frame.av.linesize[i] = linesize as c_int;
            }
            frame.buffers.push(buf);
        }
        0
    }

    unsafe fn frame_make_writable(&self, _frame: NonNull<AVFrame>) -> c_int {
        self.lock().fail.make_writable.unwrap_or(0)
    }

    unsafe fn free_frame(&self, frame: NonNull<AVFrame>) {
        // SAFETY: leaked from a Box in `alloc_frame`.
        drop(unsafe { Box::from_raw(frame.cast::<FakeFrame>().as_ptr()) });
        self.lock().live_frames -= 1;
    }

    unsafe fn send_frame(&self, ctx: NonNull<AVCodecContext>, frame: NonNull<AVFrame>) -> c_int {
        let mut s = self.lock();
        if let Some(code) = s.fail.send_frame {
            return code;
        }
        // SAFETY: see `open` and `frame_get_buffer`.
        let (ctx, frame) =
            unsafe { (ctx.cast::<FakeContext>().as_ref(), frame.cast::<FakeFrame>().as_ref()) };
        assert!(ctx.opened, "send_frame on unopened context");

        let (w, h) = dims(&frame.av);
        let [(yw, yh), (cw, ch), _] = plane_dims(w, h);
        #[allow(clippy::cast_sign_loss)]
        let tight = |plane: usize, pw: usize, rows: usize| -> Vec<u8> {
            let stride = frame.av.linesize[plane] as usize;
            frame.buffers[plane]
                .chunks(stride)
                .take(rows)
                .flat_map(|row| row[..pw].iter().copied())
                .collect()
        };
        let sent = SentFrame {
            pts: frame.av.pts,
            pict_type: frame.av.pict_type,
            y: tight(0, yw, yh),
            u: tight(1, cw, ch),
            v: tight(2, cw, ch),
        };

        let key = sent.pict_type == ffi::AV_PICTURE_TYPE_I || s.frames_sent % Self::gop(&s) == 0;
        s.frames_sent += 1;
        for i in 0..s.packets_per_frame {
            #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
            let payload = vec![0, 0, 0, 1, if key { 0x65 } else { 0x41 }, sent.pts as u8, i as u8];
            s.pending.push_back((payload, sent.pts, key));
        }
        s.sent.push(sent);
        0
    }

    fn alloc_packet(&self) -> Option<NonNull<AVPacket>> {
        let mut s = self.lock();
        if s.fail.alloc_packet {
            return None;
        }
        s.live_packets += 1;
        let packet = Box::new(FakePacket {
            av: empty_packet(),
            payload: Vec::new(),
            referenced: false,
        });
        Some(NonNull::from(Box::leak(packet)).cast())
    }

    unsafe fn receive_packet(
        &self,
        _ctx: NonNull<AVCodecContext>,
        packet: NonNull<AVPacket>,
    ) -> c_int {
        let mut s = self.lock();
        if let Some(code) = s.fail.receive_packet {
            return code;
        }
        // SAFETY: packets are `FakePacket`s with `av` first.
        let packet = unsafe { packet.cast::<FakePacket>().as_mut() };
        assert!(!packet.referenced, "receive_packet into a referenced packet");
        let Some((payload, pts, key)) = s.pending.pop_front() else {
            return AVERROR_EAGAIN;
        };
        packet.payload = payload;
        packet.referenced = true;
        packet.av.data = packet.payload.as_mut_ptr();
        #[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
        {
            packet.av.size = packet.payload.len() as c_int;
        }
        packet.av.pts = pts;
        packet.av.flags = if key { ffi::AV_PKT_FLAG_KEY } else { 0 };
        s.outstanding_refs += 1;
        0
    }

    unsafe fn unref_packet(&self, packet: NonNull<AVPacket>) {
        // SAFETY: see `receive_packet`.
        let packet = unsafe { packet.cast::<FakePacket>().as_mut() };
        if packet.referenced {
            self.lock().outstanding_refs -= 1;
        }
        packet.payload = Vec::new();
        packet.referenced = false;
        packet.av = empty_packet();
    }

    unsafe fn free_packet(&self, packet: NonNull<AVPacket>) {
        // SAFETY: leaked from a Box in `alloc_packet`.
        drop(unsafe { Box::from_raw(packet.cast::<FakePacket>().as_ptr()) });
        self.lock().live_packets -= 1;
    }

    fn error_string(&self, code: c_int) -> String {
        format!("fake error {code}")
    }
}
