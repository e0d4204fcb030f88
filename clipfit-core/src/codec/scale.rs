//! Pure-Rust frame scaler.

use super::{CodecError, CodecResult, FrameScaler};
use crate::media::{Plane, VideoFrame};

/// Box-filter scaler for I420 frames.
///
/// Each destination sample is the mean of the source samples its footprint
/// covers, which is what a downscale wants. Upscaling degenerates to nearest
/// neighbour.
#[derive(Debug, Default, Clone, Copy)]
pub struct AreaScaler;

impl AreaScaler {
    pub fn new() -> Self {
        Self
    }
}

impl FrameScaler for AreaScaler {
    fn scale(&mut self, frame: &VideoFrame, width: u32, height: u32) -> CodecResult<VideoFrame> {
        if width == 0 || height == 0 {
            return Err(CodecError::ScaleFailed {
                reason: format!("cannot scale to {width}x{height}"),
            });
        }

        let mut output = VideoFrame::blank(width, height, frame.timestamp_us, frame.duration_us);
        for plane in [Plane::Y, Plane::U, Plane::V] {
            let (src_w, src_h) = frame.plane_dims(plane);
            let (dst_w, dst_h) = output.plane_dims(plane);
            resample_plane(
                frame.plane(plane),
                (src_w as usize, src_h as usize),
                output.plane_mut(plane),
                (dst_w as usize, dst_h as usize),
            );
        }
        Ok(output)
    }
}

fn resample_plane(src: &[u8], src_dims: (usize, usize), dst: &mut [u8], dst_dims: (usize, usize)) {
    let (src_w, src_h) = src_dims;
    let (dst_w, dst_h) = dst_dims;

    let columns: Vec<(usize, usize)> = (0..dst_w).map(|dx| footprint(dx, src_w, dst_w)).collect();
    let mut column_sums = vec![0u64; src_w];

    for (dy, out_row) in dst.chunks_exact_mut(dst_w).take(dst_h).enumerate() {
        let (y0, y1) = footprint(dy, src_h, dst_h);

        column_sums.fill(0);
        for line in src[y0 * src_w..y1 * src_w].chunks_exact(src_w) {
            for (sum, &value) in column_sums.iter_mut().zip(line) {
                *sum += u64::from(value);
            }
        }

        let rows = (y1 - y0) as u64;
        for (out, &(x0, x1)) in out_row.iter_mut().zip(&columns) {
            let sum: u64 = column_sums[x0..x1].iter().sum();
            let count = rows * (x1 - x0) as u64;
            *out = ((sum + count / 2) / count) as u8;
        }
    }
}

/// Source index range covered by destination index `index`; never empty.
fn footprint(index: usize, src_len: usize, dst_len: usize) -> (usize, usize) {
    let start = (index * src_len / dst_len).min(src_len - 1);
    let end = ((index + 1) * src_len)
        .div_ceil(dst_len)
        .clamp(start + 1, src_len);
    (start, end)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gradient_frame(width: u32, height: u32) -> VideoFrame {
        let mut frame = VideoFrame::blank(width, height, 40_000, 33_333);
        for (index, value) in frame.plane_mut(Plane::Y).iter_mut().enumerate() {
            *value = (index % 256) as u8;
        }
        frame
    }

    #[test]
    fn test_downscale_preserves_timing_and_dims() {
        let source = gradient_frame(1920, 1080);
        let scaled = AreaScaler::new().scale(&source, 1280, 720).unwrap();

        assert!(scaled.has_dimensions(1280, 720));
        assert_eq!(scaled.timestamp_us, 40_000);
        assert_eq!(scaled.duration_us, 33_333);
        assert_eq!(scaled.as_bytes().len(), VideoFrame::i420_len(1280, 720));
    }

    #[test]
    fn test_half_scale_averages_blocks() {
        let mut source = VideoFrame::blank(4, 2, 0, 0);
        source
            .plane_mut(Plane::Y)
            .copy_from_slice(&[10, 20, 100, 100, 30, 40, 0, 200]);

        let scaled = AreaScaler::new().scale(&source, 2, 1).unwrap();
        assert_eq!(scaled.plane(Plane::Y), &[25, 100]);
        assert_eq!(scaled.plane(Plane::U), &[0x80]);
    }

    #[test]
    fn test_upscale_is_nearest_neighbour() {
        let mut source = VideoFrame::blank(2, 2, 0, 0);
        source.plane_mut(Plane::Y).copy_from_slice(&[1, 2, 3, 4]);

        let scaled = AreaScaler::new().scale(&source, 4, 4).unwrap();
        assert_eq!(&scaled.plane(Plane::Y)[..4], &[1, 1, 2, 2]);
        assert_eq!(&scaled.plane(Plane::Y)[12..], &[3, 3, 4, 4]);
    }

    #[test]
    fn test_matches_per_pixel_box_filter() {
        fn box_filter(src: &[u8], (sw, sh): (usize, usize), (dw, dh): (usize, usize)) -> Vec<u8> {
            let mut out = Vec::with_capacity(dw * dh);
            for dy in 0..dh {
                let (y0, y1) = footprint(dy, sh, dh);
                for dx in 0..dw {
                    let (x0, x1) = footprint(dx, sw, dw);
                    let mut sum = 0u64;
                    for y in y0..y1 {
                        for x in x0..x1 {
                            sum += u64::from(src[y * sw + x]);
                        }
                    }
                    let count = ((y1 - y0) * (x1 - x0)) as u64;
                    out.push(((sum + count / 2) / count) as u8);
                }
            }
            out
        }

        let mut source = VideoFrame::blank(37, 23, 0, 0);
        for (index, value) in source.plane_mut(Plane::Y).iter_mut().enumerate() {
            *value = (index * 7 % 251) as u8;
        }
        for (index, value) in source.plane_mut(Plane::U).iter_mut().enumerate() {
            *value = (index * 13 % 256) as u8;
        }

        for (width, height) in [(10, 6), (18, 12), (37, 23), (50, 30)] {
            let scaled = AreaScaler::new().scale(&source, width, height).unwrap();
            for plane in [Plane::Y, Plane::U, Plane::V] {
                let (sw, sh) = source.plane_dims(plane);
                let (dw, dh) = scaled.plane_dims(plane);
                let expected = box_filter(
                    source.plane(plane),
                    (sw as usize, sh as usize),
                    (dw as usize, dh as usize),
                );
                assert_eq!(scaled.plane(plane), expected.as_slice(), "{width}x{height} {plane:?}");
            }
        }
    }

    #[test]
    fn test_zero_target_rejected() {
        let source = VideoFrame::blank(4, 4, 0, 0);
        assert!(matches!(
            AreaScaler::new().scale(&source, 0, 2),
            Err(CodecError::ScaleFailed { .. })
        ));
    }
}
