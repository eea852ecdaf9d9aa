use genesys_config::AsicType;
use genesys_core::session::{ColorFilter, ScanMode};
use genesys_core::tables::DeviceTables;
use genesys_core::{GenesysError, ScanFlags, ScanSession, ScanSessionParams, for_asic};
use proptest::prelude::*;
use rstest::rstest;

fn tables(model: &str) -> DeviceTables {
    let db = genesys_config::builtin().unwrap();
    DeviceTables::from_database(&db, model).unwrap()
}

fn params(xres: u32, pixels: u32, lines: u32, depth: u32, channels: u32) -> ScanSessionParams {
    ScanSessionParams {
        xres,
        yres: xres,
        startx: 0,
        starty: 0,
        pixels,
        lines,
        depth,
        channels,
        scan_mode: if channels == 3 { ScanMode::Color } else { ScanMode::Gray },
        color_filter: ColorFilter::Green,
        flags: ScanFlags::empty(),
    }
}

fn compute(model: &str, asic: AsicType, p: &ScanSessionParams) -> genesys_core::Result<ScanSession> {
    let rules = for_asic(asic).session_rules();
    ScanSession::compute(p, &tables(model), &rules)
}

#[rstest]
#[case("canon-lide-110", AsicType::Gl124)]
#[case("canon-lide-35", AsicType::Gl841)]
#[case("canon-lide-100", AsicType::Gl847)]
fn lineart_packs_eight_pixels_per_byte(#[case] model: &str, #[case] asic: AsicType) {
    let s = compute(model, asic, &params(300, 2550, 10, 1, 1)).unwrap();
    assert_eq!(s.total_bytes_to_read, 2550u64.div_ceil(8) * 10);
}

#[rstest]
#[case("canon-lide-110", AsicType::Gl124)]
#[case("canon-lide-35", AsicType::Gl841)]
#[case("canon-lide-100", AsicType::Gl847)]
fn resolution_beyond_the_sensor_is_rejected(#[case] model: &str, #[case] asic: AsicType) {
    let err = compute(model, asic, &params(9600, 100, 10, 8, 3)).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<GenesysError>(),
        Some(GenesysError::UnsupportedResolution { resolution: 9600, .. })
    ));
}

#[test]
fn empty_area_is_invalid() {
    let err = compute("canon-lide-35", AsicType::Gl841, &params(300, 0, 10, 8, 3)).unwrap_err();
    assert!(matches!(err.downcast_ref::<GenesysError>(), Some(GenesysError::InvalidArgument(_))));
}

proptest! {
    #[test]
    fn session_sizes_follow_the_request(
        dpi_idx in 0usize..4,
        pixels in 1u32..5000,
        lines in 1u32..2000,
        color in any::<bool>(),
        wide in any::<bool>(),
    ) {
        let xres = [150u32, 300, 600, 1200][dpi_idx];
        let channels = if color { 3 } else { 1 };
        let depth = if wide { 16 } else { 8 };
        let s = compute("canon-lide-100", AsicType::Gl847, &params(xres, pixels, lines, depth, channels)).unwrap();

        prop_assert_eq!(
            s.total_bytes_to_read,
            u64::from(pixels) * u64::from(lines) * u64::from(depth / 8) * u64::from(channels)
        );
        prop_assert!(s.output_pixels >= pixels);
        prop_assert!(s.output_resolution <= s.optical_resolution);
        prop_assert!(s.output_line_count >= lines);
        prop_assert_eq!(s.output_line_bytes % u64::from(channels), 0);
        prop_assert!(s.buffers.read >= s.buffers.shrink);
    }
}
