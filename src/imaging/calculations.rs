//! Pure calculation functions for image dimensions.
//!
//! All functions here are pure and testable without any I/O or images.

/// Scale `original` proportionally to fit the requested box.
///
/// Either bound may be omitted. The result never exceeds the original
/// (no upscaling) and never collapses below 1×1.
///
/// # Examples
/// ```
/// # use avifier::imaging::scale_to_fit;
/// // Width-constrained landscape: 2000x1000 → 800x400
/// assert_eq!(scale_to_fit((2000, 1000), Some(800), None), (800, 400));
///
/// // Box fit picks the tighter side: 2000x1000 into 800x200 → 400x200
/// assert_eq!(scale_to_fit((2000, 1000), Some(800), Some(200)), (400, 200));
/// ```
pub fn scale_to_fit(original: (u32, u32), width: Option<u32>, height: Option<u32>) -> (u32, u32) {
    let (orig_w, orig_h) = original;
    if orig_w == 0 || orig_h == 0 {
        return original;
    }

    let ratio_w = width.map(|w| w as f64 / orig_w as f64);
    let ratio_h = height.map(|h| h as f64 / orig_h as f64);
    let ratio = match (ratio_w, ratio_h) {
        (Some(a), Some(b)) => a.min(b),
        (Some(a), None) | (None, Some(a)) => a,
        (None, None) => 1.0,
    }
    .min(1.0);

    let w = ((orig_w as f64 * ratio).round() as u32).max(1);
    let h = ((orig_h as f64 * ratio).round() as u32).max(1);
    (w, h)
}

/// Dimensions for each width breakpoint narrower than the original.
///
/// Breakpoints at or above the original width are skipped; the original
/// itself is always converted separately.
pub fn breakpoint_sizes(original: (u32, u32), breakpoints: &[u32]) -> Vec<(u32, u32)> {
    let mut sizes: Vec<(u32, u32)> = breakpoints
        .iter()
        .filter(|&&bp| bp > 0 && bp < original.0)
        .map(|&bp| scale_to_fit(original, Some(bp), None))
        .collect();
    sizes.dedup();
    sizes
}

#[cfg(test)]
mod tests {
    use super::*;

    // =========================================================================
    // scale_to_fit tests
    // =========================================================================

    #[test]
    fn width_only_keeps_aspect() {
        assert_eq!(scale_to_fit((2000, 1500), Some(1000), None), (1000, 750));
    }

    #[test]
    fn height_only_keeps_aspect() {
        assert_eq!(scale_to_fit((1500, 2000), None, Some(1000)), (750, 1000));
    }

    #[test]
    fn box_uses_tighter_constraint() {
        // 4:3 into a square box: width is the binding side
        assert_eq!(scale_to_fit((800, 600), Some(400), Some(400)), (400, 300));
        // 3:4 into a square box: height is the binding side
        assert_eq!(scale_to_fit((600, 800), Some(400), Some(400)), (300, 400));
    }

    #[test]
    fn never_upscales() {
        assert_eq!(scale_to_fit((500, 400), Some(1200), None), (500, 400));
        assert_eq!(scale_to_fit((500, 400), None, None), (500, 400));
    }

    #[test]
    fn extreme_aspect_never_collapses_to_zero() {
        assert_eq!(scale_to_fit((10000, 10), Some(100), None), (100, 1));
    }

    // =========================================================================
    // breakpoint_sizes tests
    // =========================================================================

    #[test]
    fn breakpoints_skip_sizes_at_or_above_original() {
        let sizes = breakpoint_sizes((1600, 1200), &[800, 1200, 1600, 2400]);
        assert_eq!(sizes, vec![(800, 600), (1200, 900)]);
    }

    #[test]
    fn small_original_gets_no_breakpoints() {
        assert!(breakpoint_sizes((640, 480), &[800, 1200]).is_empty());
    }

    #[test]
    fn breakpoints_preserve_order() {
        let sizes = breakpoint_sizes((3000, 2000), &[800, 1200, 1600]);
        assert_eq!(sizes.len(), 3);
        assert_eq!(sizes[0].0, 800);
        assert_eq!(sizes[2].0, 1600);
    }
}
