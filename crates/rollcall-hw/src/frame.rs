//! Raw buffer conversion to 8-bit grayscale, and dark-frame detection.

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("buffer too short: expected {expected} bytes, got {actual}")]
    InvalidLength { expected: usize, actual: usize },
}

fn check_len(buf: &[u8], expected: usize) -> Result<(), FrameError> {
    if buf.len() < expected {
        return Err(FrameError::InvalidLength {
            expected,
            actual: buf.len(),
        });
    }
    Ok(())
}

/// Convert packed YUYV (4:2:2) to grayscale by extracting the Y channel.
///
/// YUYV packs two pixels per 4 bytes: [Y0, U, Y1, V].
pub fn yuyv_to_grayscale(yuyv: &[u8], width: u32, height: u32) -> Result<Vec<u8>, FrameError> {
    let expected = (width * height * 2) as usize;
    check_len(yuyv, expected)?;
    Ok(yuyv[..expected].iter().step_by(2).copied().collect())
}

pub fn grey_to_grayscale(buf: &[u8], pixels: usize) -> Result<Vec<u8>, FrameError> {
    check_len(buf, pixels)?;
    Ok(buf[..pixels].to_vec())
}

/// Y16 little-endian, keeping the high byte.
pub fn y16_to_grayscale(buf: &[u8], pixels: usize) -> Result<Vec<u8>, FrameError> {
    check_len(buf, pixels * 2)?;
    Ok(buf[..pixels * 2].chunks_exact(2).map(|px| px[1]).collect())
}

/// True if more than `threshold_pct` of pixels fall in the darkest bucket (0–31).
pub fn is_dark_frame(gray: &[u8], threshold_pct: f32) -> bool {
    if gray.is_empty() {
        return true;
    }
    let dark_count = gray.iter().filter(|&&p| p < 32).count();
    (dark_count as f32 / gray.len() as f32) > threshold_pct
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_yuyv_to_grayscale() {
        // 2x1 image: [Y0=100, U=128, Y1=200, V=128]
        let gray = yuyv_to_grayscale(&[100, 128, 200, 128], 2, 1).unwrap();
        assert_eq!(gray, vec![100, 200]);
    }

    #[test]
    fn test_yuyv_invalid_length() {
        assert!(yuyv_to_grayscale(&[100, 128], 2, 1).is_err());
    }

    #[test]
    fn test_y16_keeps_high_byte() {
        let gray = y16_to_grayscale(&[0xff, 0x12, 0x00, 0xab], 2).unwrap();
        assert_eq!(gray, vec![0x12, 0xab]);
        assert!(y16_to_grayscale(&[0, 0, 0], 2).is_err());
    }

    #[test]
    fn test_grey_truncates_padding() {
        assert_eq!(grey_to_grayscale(&[1, 2, 3, 4], 3).unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn test_dark_frame_thresholds() {
        assert!(is_dark_frame(&[], 0.95));
        assert!(is_dark_frame(&[0u8; 1000], 0.95));
        assert!(!is_dark_frame(&[128u8; 1000], 0.95));

        let mut mostly_dark = vec![10u8; 960];
        mostly_dark.extend(vec![128u8; 40]);
        assert!(is_dark_frame(&mostly_dark, 0.95));

        let mut borderline = vec![10u8; 940];
        borderline.extend(vec![128u8; 60]);
        assert!(!is_dark_frame(&borderline, 0.95));
    }
}
