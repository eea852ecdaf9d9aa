use std::io::Write;

use genesys_config::{AsicType, FrontendKind, builtin, load_database, load_toml};
use rstest::rstest;

#[test]
fn empty_settings_use_defaults() {
    let cfg = load_toml("").expect("parse TOML");
    cfg.validate().unwrap();
    assert_eq!(cfg.scan.resolution, 300);
    assert_eq!(cfg.scan.depth, 8);
    assert_eq!(cfg.timeouts.poll_retries, 300);
    assert_eq!(cfg.timeouts.poll_interval_ms, 100);
    assert_eq!(cfg.timeouts.stop_retries, 10);
    assert_eq!(cfg.calibration.led_max_iterations, 100);
    assert_eq!(cfg.calibration.offset_max_passes, 32);
    assert_eq!(cfg.calibration.cache_expiry_s, 1800);
}

#[rstest]
#[case("[scan]\ndepth = 12\n", "scan.depth must be 1, 8 or 16")]
#[case("[scan]\nmode = \"lineart\"\ndepth = 8\n", "must be 1 for lineart")]
#[case("[scan]\nresolution = 0\n", "scan.resolution must be > 0")]
#[case("[scan]\nwidth_mm = 0.0\n", "scan.width_mm and scan.height_mm must be > 0")]
#[case("[timeouts]\npoll_retries = 0\n", "timeouts.poll_retries must be >= 1")]
#[case("[timeouts]\npoll_interval_ms = 20000\n", "unreasonably large")]
#[case("[timeouts]\nstop_retries = 0\n", "timeouts.stop_retries must be >= 1")]
#[case("[calibration]\nled_max_iterations = 0\n", "led_max_iterations must be >= 1")]
#[case("[calibration]\noffset_max_passes = 0\n", "offset_max_passes must be >= 1")]
#[case("[calibration]\nled_tolerance_divisor = 0\n", "led_tolerance_divisor must be >= 1")]
#[case("[logging]\nrotation = \"weekly\"\n", "logging.rotation must be one of")]
fn invalid_settings_are_rejected(#[case] toml: &str, #[case] needle: &str) {
    let cfg = load_toml(toml).expect("parse TOML");
    let err = cfg.validate().expect_err("should be rejected");
    assert!(format!("{err}").contains(needle), "{err}");
}

#[test]
fn unknown_scan_mode_fails_to_parse() {
    assert!(load_toml("[scan]\nmode = \"sepia\"\n").is_err());
}

#[test]
fn builtin_models_reference_expected_asics() {
    let db = builtin().unwrap();
    let asic = |id: &str| db.model(id).unwrap().asic;
    assert_eq!(asic("canon-lide-110"), AsicType::Gl124);
    assert_eq!(asic("canon-lide-120"), AsicType::Gl124);
    assert_eq!(asic("canon-lide-210"), AsicType::Gl124);
    assert_eq!(asic("canon-lide-220"), AsicType::Gl124);
    assert_eq!(asic("canon-lide-100"), AsicType::Gl847);
    assert_eq!(asic("canon-lide-200"), AsicType::Gl847);
    assert_eq!(asic("canon-lide-35"), AsicType::Gl841);

    let fe = db.frontend(&db.model("canon-lide-110").unwrap().frontend).unwrap();
    assert_eq!(fe.kind, FrontendKind::Ti);
    assert_eq!(fe.close_value, Some(0x11));
}

#[test]
fn builtin_lide110_profiles_cover_every_hwdpi() {
    let db = builtin().unwrap();
    let mut dpis: Vec<(u32, u32)> = db
        .sensor_profiles
        .iter()
        .filter(|p| p.sensor == "cis-canon-lide-110")
        .map(|p| (p.dpi, p.ccd_size_divisor))
        .collect();
    dpis.sort_unstable();
    assert_eq!(dpis, vec![(600, 1), (600, 2), (1200, 1), (2400, 1)]);
}

#[test]
fn database_rejects_unknown_sensor_reference() {
    let text = r#"
[[models]]
id = "m"
vendor = "v"
name = "n"
asic = "gl124"
sensor = "missing"
motor = "x"
frontend = "f"
xdpi_values = [300]
ydpi_values = [300]
x_offset_mm = 0.0
y_offset_mm = 0.0
x_size_mm = 100.0
y_size_mm = 100.0
is_cis = true
"#;
    let db = load_database(text).unwrap();
    let err = db.validate().unwrap_err();
    assert!(err.to_string().contains("unknown sensor 'missing'"), "{err}");
}

#[test]
fn database_rejects_increasing_motor_table() {
    let text = r#"
[[motors]]
id = "m"
base_ydpi = 1200
optical_ydpi = 2400
max_step_type = 1
slopes = [{ maximum_start_speed = 3000, maximum_speed = 1000, minimum_steps = 16, g = 0.8 }]

[[motor_profiles]]
motor = "m"
exposure = 1000
step_type = 0
table = [4000, 3000, 3500]
"#;
    let db = load_database(text).unwrap();
    let err = db.validate().unwrap_err();
    assert!(err.to_string().contains("non-increasing"), "{err}");
}

#[test]
fn database_rejects_non_permutation_segment_order() {
    let text = r#"
[[sensor_profiles]]
sensor = "s"
dpi = 1200
exposure_lperiod = 10000
exposure = { red = 1, green = 1, blue = 1 }
segment_order = [0, 0]
"#;
    let db = load_database(text).unwrap();
    let err = db.validate().unwrap_err();
    assert!(err.to_string().contains("permutation"), "{err}");
}

#[test]
fn settings_can_point_at_external_database() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("db.toml");
    let mut f = std::fs::File::create(&path).unwrap();
    writeln!(f, "# no models").unwrap();
    drop(f);

    let toml = format!("[database]\npath = {:?}\n", path.display().to_string());
    let cfg = load_toml(&toml).unwrap();
    let db = cfg.load_database().unwrap();
    assert!(db.models.is_empty());
}

#[test]
fn settings_with_missing_database_file_fail() {
    let cfg = load_toml("[database]\npath = \"/definitely/not/here.toml\"\n").unwrap();
    let err = cfg.load_database().unwrap_err();
    assert!(err.to_string().contains("read database"));
}
