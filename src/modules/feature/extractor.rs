use crate::modules::media::decoder::Frame;

/// Dimensionality of the feature space: a 6x6 downscale with three HSV
/// channels, flattened channel-major.
pub const FEATURE_DIM: usize = 108;

const GRID: usize = 6;

/// Hue is stored as the legacy byte-domain quantization: degrees are halved
/// into the byte range first and normalized by 255 afterwards. Changing this
/// constant invalidates every vector in the index.
const HUE_DIVISOR: f32 = 2.0 * 2.0 * 255.0;

/// Computes the 108-dimensional HSV feature vector of a frame.
///
/// Deterministic and pure: the same frame always produces bit-identical
/// output, and a frame already sized 6x6 is taken as-is.
pub fn feature_vector(frame: &Frame) -> [f32; FEATURE_DIM] {
    let scaled = resize_area(frame);

    let mut out = [0f32; FEATURE_DIM];
    for (i, [b, g, r]) in scaled.iter().enumerate() {
        let (h, s, v) = bgr_to_hsv(*b, *g, *r);
        out[i] = h / HUE_DIVISOR;
        out[GRID * GRID + i] = s;
        out[2 * GRID * GRID + i] = v;
    }
    out
}

/// Area-interpolation resize to 6x6, matching OpenCV's INTER_AREA for
/// downscaling: every destination cell is the average of the source pixels
/// it covers, with fractional coverage at the cell borders.
fn resize_area(frame: &Frame) -> [[f32; 3]; GRID * GRID] {
    let w = frame.width as usize;
    let h = frame.height as usize;
    let scale_x = w as f64 / GRID as f64;
    let scale_y = h as f64 / GRID as f64;

    let mut out = [[0f32; 3]; GRID * GRID];
    for cy in 0..GRID {
        let y0 = cy as f64 * scale_y;
        let y1 = (cy + 1) as f64 * scale_y;
        for cx in 0..GRID {
            let x0 = cx as f64 * scale_x;
            let x1 = (cx + 1) as f64 * scale_x;

            let mut acc = [0f64; 3];
            let mut area = 0f64;
            let mut sy = y0.floor() as usize;
            while (sy as f64) < y1 && sy < h {
                let wy = overlap(y0, y1, sy);
                let mut sx = x0.floor() as usize;
                while (sx as f64) < x1 && sx < w {
                    let wx = overlap(x0, x1, sx);
                    let weight = wx * wy;
                    let px = (sy * w + sx) * 3;
                    acc[0] += weight * frame.data[px] as f64;
                    acc[1] += weight * frame.data[px + 1] as f64;
                    acc[2] += weight * frame.data[px + 2] as f64;
                    area += weight;
                    sx += 1;
                }
                sy += 1;
            }
            let cell = &mut out[cy * GRID + cx];
            for c in 0..3 {
                cell[c] = (acc[c] / (area * 255.0)) as f32;
            }
        }
    }
    out
}

/// Length of the intersection between span `[a0, a1)` and pixel `p`.
fn overlap(a0: f64, a1: f64, p: usize) -> f64 {
    let lo = a0.max(p as f64);
    let hi = a1.min((p + 1) as f64);
    (hi - lo).max(0.0)
}

/// BGR in [0,1] to HSV with H in degrees [0,360) and S,V in [0,1].
/// Zero-chroma pixels get hue 0.
fn bgr_to_hsv(b: f32, g: f32, r: f32) -> (f32, f32, f32) {
    let max = b.max(g).max(r);
    let min = b.min(g).min(r);
    let delta = max - min;

    let v = max;
    let s = if max > 0.0 { delta / max } else { 0.0 };
    let h = if delta <= 0.0 {
        0.0
    } else if max == r {
        60.0 * (g - b) / delta
    } else if max == g {
        120.0 + 60.0 * (b - r) / delta
    } else {
        240.0 + 60.0 * (r - g) / delta
    };
    let h = if h < 0.0 { h + 360.0 } else { h };
    (h, s, v)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn solid_frame(width: u32, height: u32, bgr: [u8; 3]) -> Frame {
        let data = bgr
            .iter()
            .copied()
            .cycle()
            .take(width as usize * height as usize * 3)
            .collect();
        Frame::new(width, height, data)
    }

    #[test]
    fn dimensionality_and_range() {
        let frame = solid_frame(64, 48, [13, 200, 77]);
        let vec = feature_vector(&frame);
        assert_eq!(vec.len(), FEATURE_DIM);
        for v in vec {
            assert!((0.0..=1.0).contains(&v), "dimension out of range: {v}");
        }
    }

    #[test]
    fn is_deterministic() {
        let frame = solid_frame(33, 21, [5, 120, 250]);
        let a = feature_vector(&frame);
        let b = feature_vector(&frame);
        assert_eq!(a.map(f32::to_bits), b.map(f32::to_bits));
    }

    #[test]
    fn pure_red_frame() {
        // BGR (0, 0, 255) is hue 0, full saturation, full value.
        let vec = feature_vector(&solid_frame(10, 10, [0, 0, 255]));
        for i in 0..36 {
            assert_eq!(vec[i], 0.0, "hue dim {i}");
            assert_eq!(vec[36 + i], 1.0, "saturation dim {i}");
            assert_eq!(vec[72 + i], 1.0, "value dim {i}");
        }
    }

    #[test]
    fn pure_blue_hue_quantization() {
        // Blue is 240 degrees; the stored dimension is 240 / (2*2*255).
        let vec = feature_vector(&solid_frame(6, 6, [255, 0, 0]));
        let expected = 240.0 / 1020.0;
        for i in 0..36 {
            assert!((vec[i] - expected).abs() < 1e-6);
        }
    }

    #[test]
    fn black_frame_is_all_zero() {
        let vec = feature_vector(&solid_frame(7, 3, [0, 0, 0]));
        assert!(vec.iter().all(|v| *v == 0.0));
    }

    #[test]
    fn stable_under_prior_resize() {
        // A 12x12 image built from 2x2 blocks of a 6x6 pattern must produce
        // the same vector as the 6x6 pattern itself, because the extractor
        // resizes to 6x6 first.
        let mut small = Vec::new();
        let mut large = vec![0u8; 12 * 12 * 3];
        for y in 0..6u32 {
            for x in 0..6u32 {
                let bgr = [(x * 40) as u8, (y * 40) as u8, ((x + y) * 20) as u8];
                small.extend_from_slice(&bgr);
                for dy in 0..2 {
                    for dx in 0..2 {
                        let py = (y * 2 + dy) as usize;
                        let px = (x * 2 + dx) as usize;
                        large[(py * 12 + px) * 3..(py * 12 + px) * 3 + 3].copy_from_slice(&bgr);
                    }
                }
            }
        }
        let small_frame = Frame::new(6, 6, small);
        let large_frame = Frame::new(12, 12, large);
        assert_eq!(
            feature_vector(&small_frame).map(f32::to_bits),
            feature_vector(&large_frame).map(f32::to_bits)
        );
    }

    #[test]
    fn six_by_six_input_is_identity_sampled() {
        // Same logical image fed at native 6x6 resolution: each cell maps to
        // exactly one pixel.
        let mut data = Vec::new();
        for i in 0..36u32 {
            data.extend_from_slice(&[(i * 7 % 256) as u8, (i * 5 % 256) as u8, (i * 3 % 256) as u8]);
        }
        let frame = Frame::new(6, 6, data.clone());
        let vec = feature_vector(&frame);
        // Spot-check the value channel of the first cell: V = max(B,G,R)/255.
        let expected_v = data[0].max(data[1]).max(data[2]) as f32 / 255.0;
        assert!((vec[72] - expected_v).abs() < 1e-6);
    }

    #[test]
    fn hsv_conversion_reference_points() {
        let (h, s, v) = bgr_to_hsv(0.0, 1.0, 0.0);
        assert_eq!((h, s, v), (120.0, 1.0, 1.0));
        let (h, s, v) = bgr_to_hsv(1.0, 0.0, 0.0);
        assert_eq!((h, s, v), (240.0, 1.0, 1.0));
        let (h, _, _) = bgr_to_hsv(1.0, 0.0, 1.0);
        assert_eq!(h, 300.0);
        // Greyscale: no chroma, hue pinned to 0.
        let (h, s, v) = bgr_to_hsv(0.5, 0.5, 0.5);
        assert_eq!((h, s), (0.0, 0.0));
        assert_eq!(v, 0.5);
    }
}
