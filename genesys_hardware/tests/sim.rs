use genesys_hardware::{SimProfile, SimulatedAsic};
use genesys_traits::Transport;
use rstest::rstest;

const HOMESNR: u8 = 0x08;
const FEEDFSH: u8 = 0x20;
const MOTORENB: u8 = 0x01;
const BUFEMPTY: u8 = 0x40;

fn status(asic: &mut SimulatedAsic, profile: &SimProfile) -> u8 {
    asic.read_register(profile.status).unwrap()
}

#[rstest]
#[case::gl124(SimProfile::gl124())]
#[case::gl841(SimProfile::gl841())]
#[case::gl847(SimProfile::gl847())]
fn powered_idle_asic_reports_home_and_empty_buffer(#[case] profile: SimProfile) {
    let mut asic = SimulatedAsic::new(profile.clone());
    let s = status(&mut asic, &profile);
    assert_ne!(s & 0x80, 0, "power bit");
    assert_ne!(s & HOMESNR, 0);
    assert_ne!(s & BUFEMPTY, 0);
    assert_eq!(s & MOTORENB, 0);
}

#[test]
fn forward_move_without_scan_bit_finishes_as_feed() {
    let profile = SimProfile::gl847();
    let mut asic = SimulatedAsic::new(profile.clone()).with_move_polls(3);
    asic.write_register(0x02, 0x10).unwrap();
    asic.write_register(0x0f, 0x01).unwrap();
    assert!(!asic.is_at_home());

    let mut polls = 0;
    while status(&mut asic, &profile) & FEEDFSH == 0 {
        polls += 1;
        assert!(polls < 10, "feed never finished");
    }
    assert_eq!(polls, 2);
    assert_eq!(status(&mut asic, &profile) & MOTORENB, 0);
}

#[test]
fn clearing_scan_bit_stops_a_running_scan() {
    let profile = SimProfile::gl124();
    let mut asic = SimulatedAsic::new(profile.clone());
    asic.write_register(0x01, 0x01).unwrap();
    asic.write_register(0x0f, 0x01).unwrap();
    let state = asic.read_register(profile.scan_state).unwrap();
    assert_eq!(state & 0x03, 0x03);

    asic.write_register(0x01, 0x00).unwrap();
    let state = asic.read_register(profile.scan_state).unwrap();
    assert_eq!(state & 0x03, 0);
}

#[test]
fn stuck_motor_ignores_stop() {
    let profile = SimProfile::gl841();
    let mut asic = SimulatedAsic::new(profile.clone()).with_head_away();
    asic.set_stuck_motor(true);
    asic.write_register(0x02, 0x04).unwrap();
    asic.write_register(0x0f, 0x01).unwrap();
    asic.write_register(0x01, 0x00).unwrap();
    for _ in 0..20 {
        let s = status(&mut asic, &profile);
        assert_eq!(s & HOMESNR, 0);
        assert_ne!(s & MOTORENB, 0);
    }
}

#[test]
fn soft_reset_clears_register_file() {
    let mut asic = SimulatedAsic::new(SimProfile::gl847());
    asic.write_register(0x2e, 0x80).unwrap();
    asic.write_register(0x0e, 0x01).unwrap();
    assert_eq!(asic.register(0x2e), 0);
    assert_eq!(asic.register(0x04), SimProfile::gl847().reg04);
}

#[test]
fn dark_pixels_precede_brighter_ones_in_each_line() {
    let profile = SimProfile::gl841();
    let mut asic = SimulatedAsic::new(profile).with_black_pixels(4);
    // two lines of 16 8-bit samples
    asic.write_registers(&[(0x25, 0), (0x26, 0), (0x27, 2), (0x10, 0x0e), (0x12, 0x0c), (0x14, 0x0a)])
        .unwrap();
    asic.write_registers(&[(0x51, 0x20), (0x3a, 0), (0x3b, 60)]).unwrap();
    let mut buf = vec![0u8; 32];
    asic.bulk_read(0x45, &mut buf).unwrap();
    for line in buf.chunks(16) {
        assert!(line[..4].iter().all(|&v| v == line[0]));
        assert!(line[4..].iter().all(|&v| v > line[0]));
    }
}

#[test]
fn sixteen_bit_data_is_little_endian() {
    let profile = SimProfile::gl847();
    let mut asic = SimulatedAsic::new(profile).with_black_pixels(0);
    asic.write_registers(&[(0x04, 0x42), (0x25, 0), (0x26, 0), (0x27, 1), (0x10, 0x01), (0x11, 0x00)])
        .unwrap();
    let mut buf = vec![0u8; 8];
    asic.bulk_read(0x45, &mut buf).unwrap();
    let first = u16::from_le_bytes([buf[0], buf[1]]);
    let second = u16::from_le_bytes([buf[2], buf[3]]);
    assert_eq!(first, second);
    assert!(first > 0);
}

#[test]
fn bulk_and_ahb_writes_are_recorded() {
    let mut asic = SimulatedAsic::new(SimProfile::gl124());
    asic.bulk_write(0x3c, &[1, 2, 3]).unwrap();
    asic.write_ahb(0x1000_0000, &[4, 5]).unwrap();
    assert_eq!(asic.bulk_writes(), vec![(0x3c, vec![1, 2, 3])]);
    assert_eq!(asic.ahb_writes(), vec![(0x1000_0000, vec![4, 5])]);
}
