//! Five-point face alignment for the ArcFace encoder.
//!
//! A 4-DOF similarity transform (scale, rotation, translation) is fitted by
//! least squares from the detected landmarks to the InsightFace reference
//! positions, and the colour frame is warped into a 112×112 crop.

use image::{Rgb, RgbImage};

/// ArcFace reference landmarks for a 112×112 output.
pub const REFERENCE_LANDMARKS_112: [(f32, f32); 5] = [
    (38.2946, 51.6963), // left eye
    (73.5318, 51.5014), // right eye
    (56.0252, 71.7366), // nose
    (41.5493, 92.3655), // left mouth
    (70.7299, 92.2041), // right mouth
];

pub const ALIGNED_SIZE: u32 = 112;

/// Least-squares similarity transform from `src` to `dst`.
///
/// Returns `[a, -b, tx, b, a, ty]`, i.e. the matrix
/// ```text
/// | a  -b  tx |
/// | b   a  ty |
/// ```
fn estimate_similarity_transform(src: &[(f32, f32); 5], dst: &[(f32, f32); 5]) -> [f32; 6] {
    // Each pair contributes two rows of A·[a, b, tx, ty]ᵀ = B:
    //   sx·a - sy·b + tx = dx
    //   sy·a + sx·b + ty = dy
    let mut ata = [[0.0f32; 4]; 4];
    let mut atb = [0.0f32; 4];

    for (&(sx, sy), &(dx, dy)) in src.iter().zip(dst) {
        let r1 = [sx, -sy, 1.0, 0.0];
        let r2 = [sy, sx, 0.0, 1.0];
        for j in 0..4 {
            for k in 0..4 {
                ata[j][k] += r1[j] * r1[k] + r2[j] * r2[k];
            }
            atb[j] += r1[j] * dx + r2[j] * dy;
        }
    }

    let [a, b, tx, ty] = solve_4x4(ata, atb);
    [a, -b, tx, b, a, ty]
}

/// Gaussian elimination with partial pivoting. A singular system yields the
/// identity scale so the warp degrades to a plain copy.
#[allow(clippy::needless_range_loop)]
fn solve_4x4(ata: [[f32; 4]; 4], atb: [f32; 4]) -> [f32; 4] {
    let mut m = [[0.0f32; 5]; 4];
    for i in 0..4 {
        m[i][..4].copy_from_slice(&ata[i]);
        m[i][4] = atb[i];
    }

    for col in 0..4 {
        let pivot_row = (col..4)
            .max_by(|&r1, &r2| m[r1][col].abs().total_cmp(&m[r2][col].abs()))
            .unwrap_or(col);
        m.swap(col, pivot_row);

        let pivot = m[col][col];
        if pivot.abs() < 1e-12 {
            return [1.0, 0.0, 0.0, 0.0];
        }
        for row in (col + 1)..4 {
            let factor = m[row][col] / pivot;
            for j in col..5 {
                m[row][j] -= factor * m[col][j];
            }
        }
    }

    let mut x = [0.0f32; 4];
    for i in (0..4).rev() {
        x[i] = m[i][4];
        for j in (i + 1)..4 {
            x[i] -= m[i][j] * x[j];
        }
        x[i] /= m[i][i];
    }
    x
}

/// Inverse-map every output pixel through `matrix` with bilinear sampling.
/// Pixels that fall outside the source are black.
fn warp_affine(frame: &RgbImage, matrix: &[f32; 6], out_size: u32) -> RgbImage {
    let (a, tx, b, ty) = (matrix[0], matrix[2], matrix[3], matrix[5]);
    let mut output = RgbImage::new(out_size, out_size);

    let det = a * a + b * b;
    if det.abs() < 1e-12 {
        return output;
    }
    let ia = a / det;
    let ib = b / det;
    let (width, height) = (frame.width() as i64, frame.height() as i64);

    let sample = |x: i64, y: i64, c: usize| -> f32 {
        if x >= 0 && x < width && y >= 0 && y < height {
            frame.get_pixel(x as u32, y as u32)[c] as f32
        } else {
            0.0
        }
    };

    for (ox, oy, pixel) in output.enumerate_pixels_mut() {
        let dx = ox as f32 - tx;
        let dy = oy as f32 - ty;
        let sx = ia * dx + ib * dy;
        let sy = -ib * dx + ia * dy;

        let x0 = sx.floor() as i64;
        let y0 = sy.floor() as i64;
        let fx = sx - x0 as f32;
        let fy = sy - y0 as f32;

        let mut rgb = [0u8; 3];
        for (c, channel) in rgb.iter_mut().enumerate() {
            let v = sample(x0, y0, c) * (1.0 - fx) * (1.0 - fy)
                + sample(x0 + 1, y0, c) * fx * (1.0 - fy)
                + sample(x0, y0 + 1, c) * (1.0 - fx) * fy
                + sample(x0 + 1, y0 + 1, c) * fx * fy;
            *channel = v.round().clamp(0.0, 255.0) as u8;
        }
        *pixel = Rgb(rgb);
    }

    output
}

/// Warp the face described by `landmarks` into a canonical 112×112 crop.
pub fn align_face(frame: &RgbImage, landmarks: &[(f32, f32); 5]) -> RgbImage {
    let matrix = estimate_similarity_transform(landmarks, &REFERENCE_LANDMARKS_112);
    warp_affine(frame, &matrix, ALIGNED_SIZE)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_transform() {
        let pts = REFERENCE_LANDMARKS_112;
        let m = estimate_similarity_transform(&pts, &pts);
        assert!((m[0] - 1.0).abs() < 1e-4, "a = {}", m[0]);
        assert!(m[1].abs() < 1e-4, "-b = {}", m[1]);
        assert!(m[2].abs() < 1e-3, "tx = {}", m[2]);
        assert!(m[3].abs() < 1e-4, "b = {}", m[3]);
        assert!(m[5].abs() < 1e-3, "ty = {}", m[5]);
    }

    #[test]
    fn test_double_size_landmarks_halve_scale() {
        let src = REFERENCE_LANDMARKS_112.map(|(x, y)| (x * 2.0, y * 2.0));
        let m = estimate_similarity_transform(&src, &REFERENCE_LANDMARKS_112);
        assert!((m[0] - 0.5).abs() < 1e-3, "a = {}", m[0]);
        assert!(m[3].abs() < 1e-3, "b = {}", m[3]);
    }

    #[test]
    fn test_rotated_landmarks_recover_rotation() {
        // 90° clockwise about the origin: (x, y) -> (-y, x)
        let src = REFERENCE_LANDMARKS_112.map(|(x, y)| (-y, x));
        let m = estimate_similarity_transform(&src, &REFERENCE_LANDMARKS_112);
        assert!(m[0].abs() < 1e-3, "a = {}", m[0]);
        assert!((m[3] + 1.0).abs() < 1e-3, "b = {}", m[3]);
    }

    #[test]
    fn test_align_face_output_size() {
        let frame = RgbImage::from_pixel(640, 480, Rgb([128, 64, 32]));
        let aligned = align_face(&frame, &REFERENCE_LANDMARKS_112);
        assert_eq!(aligned.dimensions(), (ALIGNED_SIZE, ALIGNED_SIZE));
        assert_eq!(aligned.get_pixel(56, 56), &Rgb([128, 64, 32]));
    }

    #[test]
    fn test_left_eye_lands_on_reference() {
        let mut frame = RgbImage::new(200, 200);
        let src: [(f32, f32); 5] = [
            (80.0, 60.0),
            (120.0, 60.0),
            (100.0, 85.0),
            (85.0, 110.0),
            (115.0, 110.0),
        ];
        for y in 58..63 {
            for x in 78..83 {
                frame.put_pixel(x, y, Rgb([255, 0, 0]));
            }
        }

        let aligned = align_face(&frame, &src);
        let ref_x = REFERENCE_LANDMARKS_112[0].0.round() as u32;
        let ref_y = REFERENCE_LANDMARKS_112[0].1.round() as u32;
        let brightest = (ref_y - 1..=ref_y + 1)
            .flat_map(|y| (ref_x - 1..=ref_x + 1).map(move |x| (x, y)))
            .map(|(x, y)| aligned.get_pixel(x, y)[0])
            .max()
            .unwrap_or(0);
        assert!(brightest > 100, "left eye not near ({ref_x}, {ref_y}): {brightest}");
        assert_eq!(aligned.get_pixel(ref_x, ref_y)[1], 0);
    }
}
