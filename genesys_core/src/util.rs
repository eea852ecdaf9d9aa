//! Small integer helpers shared by the session and register code.

#[inline]
pub fn align_multiple_floor(x: u64, multiple: u64) -> u64 {
    if multiple == 0 {
        return x;
    }
    (x / multiple) * multiple
}

#[inline]
pub fn align_multiple_ceil(x: u64, multiple: u64) -> u64 {
    if multiple == 0 {
        return x;
    }
    x.div_ceil(multiple) * multiple
}

/// Bytes needed for `pixels` samples of `depth` bits (1, 8 or 16).
#[inline]
pub fn multiply_by_depth_ceil(pixels: u64, depth: u32) -> u64 {
    if depth == 1 {
        pixels.div_ceil(8)
    } else {
        pixels * u64::from(depth / 8)
    }
}

/// Millimetres to motor/sensor units at `dpi`.
#[inline]
pub fn mm_to_units(mm: f32, dpi: u32) -> u32 {
    if mm <= 0.0 {
        return 0;
    }
    ((mm * dpi as f32) / 25.4) as u32
}

/// Mean of a slice of samples, 0 when empty.
pub fn mean(values: &[u32]) -> u32 {
    if values.is_empty() {
        return 0;
    }
    (values.iter().map(|&v| u64::from(v)).sum::<u64>() / values.len() as u64) as u32
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(7, 1, 1)]
    #[case(8, 1, 1)]
    #[case(9, 1, 2)]
    #[case(10, 8, 10)]
    #[case(10, 16, 20)]
    fn depth_rounds_up_for_lineart(#[case] pixels: u64, #[case] depth: u32, #[case] bytes: u64) {
        assert_eq!(multiply_by_depth_ceil(pixels, depth), bytes);
    }

    #[test]
    fn alignment_helpers() {
        assert_eq!(align_multiple_floor(17, 4), 16);
        assert_eq!(align_multiple_ceil(17, 4), 20);
        assert_eq!(align_multiple_ceil(16, 4), 16);
        assert_eq!(align_multiple_floor(5, 0), 5);
    }

    #[test]
    fn mm_conversion_truncates() {
        assert_eq!(mm_to_units(25.4, 600), 600);
        assert_eq!(mm_to_units(-1.0, 600), 0);
    }
}
