//! Raw input frames.
//!
//! Encoders consume any [`VideoFrameBuffer`] and convert it to planar
//! 4:2:0 ([`I420Buffer`]) before copying it into native memory.

use std::borrow::Cow;
use std::sync::Arc;

use crate::error::EncodeError;

/// Color description carried alongside a frame and copied onto its
/// encoded output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ColorSpace {
    /// ISO/IEC 23091-2 colour primaries code point.
    pub primaries: u8,
    /// Transfer characteristics code point.
    pub transfer: u8,
    /// Matrix coefficients code point.
    pub matrix: u8,
    /// Full (0-255) rather than limited (16-235) range.
    pub full_range: bool,
}

impl ColorSpace {
    /// BT.709 primaries, transfer and matrix, full range.
    #[must_use]
    pub fn bt709_full() -> Self {
        Self {
            primaries: 1,
            transfer: 1,
            matrix: 1,
            full_range: true,
        }
    }
}

/// Anything an encoder can turn into planar 4:2:0.
pub trait VideoFrameBuffer: Send + Sync {
    fn width(&self) -> u32;
    fn height(&self) -> u32;

    /// Borrow or produce an I420 view of this buffer.
    fn to_i420(&self) -> Cow<'_, I420Buffer>;
}

/// A frame submitted for encoding.
#[derive(Clone)]
pub struct VideoFrame {
    pub buffer: Arc<dyn VideoFrameBuffer>,
    /// 90 kHz RTP timestamp, copied to the encoded output.
    pub rtp_timestamp: u32,
    /// Capture time in microseconds.
    pub timestamp_us: i64,
    pub color_space: Option<ColorSpace>,
}

impl VideoFrame {
    #[must_use]
    pub fn new(buffer: Arc<dyn VideoFrameBuffer>, rtp_timestamp: u32) -> Self {
        Self {
            buffer,
            rtp_timestamp,
            timestamp_us: 0,
            color_space: None,
        }
    }

    #[must_use]
    pub fn with_color_space(mut self, color_space: ColorSpace) -> Self {
        self.color_space = Some(color_space);
        self
    }

    #[must_use]
    pub fn width(&self) -> u32 {
        self.buffer.width()
    }

    #[must_use]
    pub fn height(&self) -> u32 {
        self.buffer.height()
    }
}

impl std::fmt::Debug for VideoFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VideoFrame")
            .field("width", &self.width())
            .field("height", &self.height())
            .field("rtp_timestamp", &self.rtp_timestamp)
            .field("timestamp_us", &self.timestamp_us)
            .field("color_space", &self.color_space)
            .finish()
    }
}

/// Dimensions of the chroma planes copied for a `width`x`height` frame.
///
/// Halves round toward zero (33 -> 16).
#[must_use]
pub fn chroma_size(width: usize, height: usize) -> (usize, usize) {
    (width / 2, height / 2)
}

/// Copy `height` rows of `width` bytes between buffers with independent
/// strides. Bytes past `width` in each destination row are left untouched.
pub fn copy_plane(
    dst: &mut [u8],
    dst_stride: usize,
    src: &[u8],
    src_stride: usize,
    width: usize,
    height: usize,
) {
    if width == 0 || height == 0 {
        return;
    }
    for (dst_row, src_row) in dst
        .chunks_mut(dst_stride)
        .zip(src.chunks(src_stride))
        .take(height)
    {
        dst_row[..width].copy_from_slice(&src_row[..width]);
    }
}

/// Minimum length of a plane with `rows` rows of `width` bytes at `stride`.
fn plane_len(stride: usize, width: usize, rows: usize) -> usize {
    if rows == 0 {
        0
    } else {
        stride * (rows - 1) + width
    }
}

/// Planar YUV 4:2:0 image with per-plane strides.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct I420Buffer {
    width: u32,
    height: u32,
    y: Vec<u8>,
    u: Vec<u8>,
    v: Vec<u8>,
    stride_y: usize,
    stride_u: usize,
    stride_v: usize,
}

impl I420Buffer {
    /// Allocate a black frame with tightly packed planes.
    #[must_use]
    pub fn new(width: u32, height: u32) -> Self {
        let (w, h) = (width as usize, height as usize);
        let (cw, ch) = (w.div_ceil(2), h.div_ceil(2));
        Self {
            width,
            height,
            y: vec![0; w * h],
            u: vec![128; cw * ch],
            v: vec![128; cw * ch],
            stride_y: w,
            stride_u: cw,
            stride_v: cw,
        }
    }

    /// Wrap existing planes.
    ///
    /// # Errors
    ///
    /// Returns [`EncodeError::PlaneLayout`] if a stride is narrower than its
    /// plane or a plane is too short for its stride and row count.
    #[allow(clippy::too_many_arguments)]
    pub fn from_planes(
        width: u32,
        height: u32,
        y: Vec<u8>,
        stride_y: usize,
        u: Vec<u8>,
        stride_u: usize,
        v: Vec<u8>,
        stride_v: usize,
    ) -> Result<Self, EncodeError> {
        let (w, h) = (width as usize, height as usize);
        let (cw, ch) = (w.div_ceil(2), h.div_ceil(2));

        for (name, plane, stride, pw, ph) in [
            ("Y", &y, stride_y, w, h),
            ("U", &u, stride_u, cw, ch),
            ("V", &v, stride_v, cw, ch),
        ] {
            if stride < pw {
                return Err(EncodeError::PlaneLayout(format!(
                    "{name} stride {stride} narrower than {pw}"
                )));
            }
            let needed = plane_len(stride, pw, ph);
            if plane.len() < needed {
                return Err(EncodeError::PlaneLayout(format!(
                    "{name} plane has {} bytes, needs {needed}",
                    plane.len()
                )));
            }
        }

        Ok(Self {
            width,
            height,
            y,
            u,
            v,
            stride_y,
            stride_u,
            stride_v,
        })
    }

    #[must_use]
    pub fn data_y(&self) -> &[u8] {
        &self.y
    }

    #[must_use]
    pub fn data_u(&self) -> &[u8] {
        &self.u
    }

    #[must_use]
    pub fn data_v(&self) -> &[u8] {
        &self.v
    }

    pub fn data_y_mut(&mut self) -> &mut [u8] {
        &mut self.y
    }

    pub fn data_u_mut(&mut self) -> &mut [u8] {
        &mut self.u
    }

    pub fn data_v_mut(&mut self) -> &mut [u8] {
        &mut self.v
    }

    #[must_use]
    pub fn stride_y(&self) -> usize {
        self.stride_y
    }

    #[must_use]
    pub fn stride_u(&self) -> usize {
        self.stride_u
    }

    #[must_use]
    pub fn stride_v(&self) -> usize {
        self.stride_v
    }
}

impl VideoFrameBuffer for I420Buffer {
    fn width(&self) -> u32 {
        self.width
    }

    fn height(&self) -> u32 {
        self.height
    }

    fn to_i420(&self) -> Cow<'_, I420Buffer> {
        Cow::Borrowed(self)
    }
}

/// Packed 8-bit BGRA/BGRx frame, e.g. straight from a screen capture.
#[derive(Debug, Clone)]
pub struct BgraBuffer {
    /// Raw pixel data, top-to-bottom row order.
    data: Vec<u8>,
    width: u32,
    height: u32,
    /// Row stride in bytes, never zero.
    stride: usize,
}

impl BgraBuffer {
    /// # Errors
    ///
    /// Returns [`EncodeError::PlaneLayout`] if `stride` or `data` is too
    /// small for the dimensions.
    pub fn new(data: Vec<u8>, width: u32, height: u32, stride: usize) -> Result<Self, EncodeError> {
        let row = width as usize * 4;
        if stride == 0 || stride < row {
            return Err(EncodeError::PlaneLayout(format!(
                "BGRA stride {stride} narrower than {}",
                row.max(1)
            )));
        }
        let needed = plane_len(stride, row, height as usize);
        if data.len() < needed {
            return Err(EncodeError::PlaneLayout(format!(
                "BGRA buffer has {} bytes, needs {needed}",
                data.len()
            )));
        }
        Ok(Self {
            data,
            width,
            height,
            stride,
        })
    }

    #[must_use]
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Row stride in bytes.
    #[must_use]
    pub fn stride(&self) -> usize {
        self.stride
    }

    /// Give back the pixel buffer.
    #[must_use]
    pub fn into_data(self) -> Vec<u8> {
        self.data
    }

    /// Set every alpha byte to 0xFF.
    ///
    /// `BGRx` captures leave the padding byte undefined.
    pub fn ensure_alpha_opaque(&mut self) {
        let row = self.width as usize * 4;
        for line in self.data.chunks_mut(self.stride) {
            let end = row.min(line.len());
            for px in line[..end].chunks_exact_mut(4) {
                px[3] = 0xFF;
            }
        }
    }

    fn pixel(&self, x: usize, y: usize) -> (i32, i32, i32) {
        let off = y * self.stride + x * 4;
        (
            i32::from(self.data[off + 2]),
            i32::from(self.data[off + 1]),
            i32::from(self.data[off]),
        )
    }
}

#[allow(clippy::cast_sign_loss, clippy::cast_possible_truncation)]
fn clamp_u8(v: i32) -> u8 {
    v.clamp(0, 255) as u8
}

impl VideoFrameBuffer for BgraBuffer {
    fn width(&self) -> u32 {
        self.width
    }

    fn height(&self) -> u32 {
        self.height
    }

    /// BT.709 full-range conversion with 2x2 chroma averaging.
    fn to_i420(&self) -> Cow<'_, I420Buffer> {
        let mut out = I420Buffer::new(self.width, self.height);
        let (w, h) = (self.width as usize, self.height as usize);

        for y in 0..h {
            for x in 0..w {
                let (r, g, b) = self.pixel(x, y);
                out.y[y * out.stride_y + x] = clamp_u8((54 * r + 183 * g + 19 * b + 128) >> 8);
            }
        }

        for cy in 0..h.div_ceil(2) {
            for cx in 0..w.div_ceil(2) {
                let (mut r, mut g, mut b, mut n) = (0, 0, 0, 0);
                for (x, y) in [(0, 0), (1, 0), (0, 1), (1, 1)] {
                    let (px, py) = (cx * 2 + x, cy * 2 + y);
                    if px < w && py < h {
                        let (pr, pg, pb) = self.pixel(px, py);
                        r += pr;
                        g += pg;
                        b += pb;
                        n += 1;
                    }
                }
                let (r, g, b) = (r / n, g / n, b / n);
                let u = ((-29 * r - 99 * g + 128 * b + 128) >> 8) + 128;
                let v = ((128 * r - 116 * g - 12 * b + 128) >> 8) + 128;
                out.u[cy * out.stride_u + cx] = clamp_u8(u);
                out.v[cy * out.stride_v + cx] = clamp_u8(v);
            }
        }

        Cow::Owned(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chroma_halves_round_down() {
        assert_eq!(chroma_size(64, 64), (32, 32));
        assert_eq!(chroma_size(33, 33), (16, 16));
        assert_eq!(chroma_size(1, 1), (0, 0));
    }

    #[test]
    fn copy_plane_honors_both_strides() {
        let (w, h) = (64usize, 64usize);
        let src_stride = 80;
        let dst_stride = 96;
        #[allow(clippy::cast_possible_truncation)]
        let src: Vec<u8> = (0..src_stride * h).map(|i| (i % 251) as u8).collect();
        let mut dst = vec![0xEE; dst_stride * h];

        copy_plane(&mut dst, dst_stride, &src, src_stride, w, h);

        for row in 0..h {
            let d = &dst[row * dst_stride..(row + 1) * dst_stride];
            let s = &src[row * src_stride..row * src_stride + w];
            assert_eq!(&d[..w], s, "row {row}");
            assert!(d[w..].iter().all(|&b| b == 0xEE), "stride gap touched in row {row}");
        }
    }

    #[test]
    fn copy_plane_odd_chroma() {
        let (cw, ch) = chroma_size(33, 33);
        let src = vec![7u8; 17 * 17];
        let mut dst = vec![0u8; 32 * 17];

        copy_plane(&mut dst, 32, &src, 17, cw, ch);

        for row in 0..17 {
            let line = &dst[row * 32..(row + 1) * 32];
            if row < 16 {
                assert!(line[..16].iter().all(|&b| b == 7));
                assert!(line[16..].iter().all(|&b| b == 0));
            } else {
                assert!(line.iter().all(|&b| b == 0));
            }
        }
    }

    #[test]
    fn from_planes_rejects_short_planes() {
        let err = I420Buffer::from_planes(4, 4, vec![0; 15], 4, vec![0; 4], 2, vec![0; 4], 2)
            .unwrap_err();
        assert!(err.to_string().contains("Y plane"));

        let err = I420Buffer::from_planes(4, 4, vec![0; 16], 4, vec![0; 4], 1, vec![0; 4], 2)
            .unwrap_err();
        assert!(err.to_string().contains("U stride"));
    }

    #[test]
    fn from_planes_accepts_padded_strides() {
        let buf = I420Buffer::from_planes(4, 4, vec![1; 8 * 3 + 4], 8, vec![2; 6], 4, vec![3; 6], 4)
            .unwrap();
        assert_eq!(buf.stride_y(), 8);
        assert_eq!(buf.data_u()[0], 2);
    }

    #[test]
    fn bgra_gray_converts_to_neutral_chroma() {
        let gray = [0x80u8, 0x80, 0x80, 0x00];
        let data: Vec<u8> = gray.iter().copied().cycle().take(4 * 4 * 4).collect();
        let frame = BgraBuffer::new(data, 4, 4, 16).unwrap();

        let i420 = frame.to_i420();
        assert!(i420.data_y().iter().all(|&y| y == 0x80));
        assert!(i420.data_u().iter().all(|&u| u == 128));
        assert!(i420.data_v().iter().all(|&v| v == 128));
    }

    #[test]
    fn bgra_white_is_full_range() {
        let frame = BgraBuffer::new(vec![0xFF; 2 * 2 * 4], 2, 2, 8).unwrap();
        let i420 = frame.to_i420();
        assert_eq!(i420.data_y(), &[255, 255, 255, 255]);
    }

    #[test]
    fn bgra_red_has_high_v() {
        // B, G, R, x
        let frame = BgraBuffer::new([0, 0, 255, 0].repeat(4), 2, 2, 8).unwrap();
        let i420 = frame.to_i420();
        assert!(i420.data_v()[0] > 200);
        assert!(i420.data_u()[0] < 128);
    }

    #[test]
    fn alpha_forced_opaque() {
        let mut frame = BgraBuffer::new(vec![0; 2 * 4 + 4], 2, 1, 12).unwrap();
        frame.ensure_alpha_opaque();
        assert_eq!(frame.data()[3], 0xFF);
        assert_eq!(frame.data()[7], 0xFF);
        // Stride padding is not pixel data.
        assert_eq!(frame.data()[11], 0);
        assert_eq!(frame.stride(), 12);
    }

    #[test]
    fn bgra_layout_checked() {
        let err = BgraBuffer::new(Vec::new(), 0, 0, 0).unwrap_err();
        assert!(matches!(err, EncodeError::PlaneLayout(_)));
        assert!(BgraBuffer::new(vec![0; 8], 2, 1, 4).is_err());
        assert!(BgraBuffer::new(vec![0; 8], 2, 2, 8).is_err());

        let frame = BgraBuffer::new(vec![1; 8], 2, 1, 8).unwrap();
        assert_eq!(frame.into_data(), vec![1; 8]);
    }
}
