use std::fs::File;
use std::io::Write;

use genesys_config::{CalibrationRow, CalibrationValues, load_calibration_csv, write_calibration_csv};
use rstest::rstest;
use tempfile::tempdir;

fn row(channel: &str, gain: u8, offset: u8, exposure: u16) -> CalibrationRow {
    CalibrationRow {
        channel: channel.to_string(),
        gain,
        offset,
        exposure,
    }
}

#[rstest]
fn from_rows_accepts_any_channel_order() {
    let rows = vec![
        row("blue", 127, 121, 900),
        row("red", 130, 118, 1180),
        row("green", 128, 120, 1040),
    ];
    let v = CalibrationValues::from_rows(&rows).unwrap();
    assert_eq!(v.gain, [130, 128, 127]);
    assert_eq!(v.offset, [118, 120, 121]);
    assert_eq!(v.exposure, [1180, 1040, 900]);
}

#[rstest]
fn from_rows_rejects_duplicate_channel() {
    let rows = vec![
        row("red", 1, 1, 1),
        row("red", 2, 2, 2),
        row("blue", 3, 3, 3),
    ];
    let err = CalibrationValues::from_rows(&rows).unwrap_err();
    assert!(err.to_string().contains("appears twice"));
}

#[rstest]
#[case(vec![])]
#[case(vec![row("red", 1, 1, 1)])]
fn from_rows_requires_three_rows(#[case] rows: Vec<CalibrationRow>) {
    let err = CalibrationValues::from_rows(&rows).unwrap_err();
    assert!(err.to_string().contains("exactly three rows"));
}

#[rstest]
fn from_rows_rejects_unknown_channel() {
    let rows = vec![
        row("red", 1, 1, 1),
        row("green", 2, 2, 2),
        row("infrared", 3, 3, 3),
    ];
    let err = CalibrationValues::from_rows(&rows).unwrap_err();
    assert!(err.to_string().contains("infrared"));
}

#[rstest]
fn csv_written_values_load_back() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("calib.csv");
    let values = CalibrationValues {
        gain: [130, 128, 127],
        offset: [118, 120, 121],
        exposure: [1180, 1040, 900],
    };
    write_calibration_csv(&path, &values).unwrap();
    let text = std::fs::read_to_string(&path).unwrap();
    assert!(text.starts_with("channel,gain,offset,exposure"));
    assert_eq!(load_calibration_csv(&path).unwrap(), values);
}

#[rstest]
fn csv_with_wrong_headers_is_rejected() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("bad.csv");
    let mut f = File::create(&path).unwrap();
    writeln!(f, "chan,gain,offset,exposure").unwrap();
    writeln!(f, "red,1,2,3").unwrap();
    drop(f);

    let err = load_calibration_csv(&path).unwrap_err();
    assert!(
        err.to_string()
            .contains("must have headers 'channel,gain,offset,exposure'")
    );
}

#[rstest]
fn csv_with_out_of_range_gain_reports_row() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("range.csv");
    let mut f = File::create(&path).unwrap();
    writeln!(f, "channel,gain,offset,exposure").unwrap();
    writeln!(f, "red,1,2,3").unwrap();
    writeln!(f, "green,300,2,3").unwrap();
    writeln!(f, "blue,1,2,3").unwrap();
    drop(f);

    let err = load_calibration_csv(&path).unwrap_err();
    assert!(err.to_string().contains("invalid CSV row 3"), "{err}");
}

#[rstest]
fn missing_csv_file_is_an_error() {
    let dir = tempdir().unwrap();
    let err = load_calibration_csv(&dir.path().join("nope.csv")).unwrap_err();
    assert!(err.to_string().contains("open calibration CSV"));
}
