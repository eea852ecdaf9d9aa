use genesys_core::slope::{self, SLOPE_TABLE_SIZE};
use proptest::prelude::*;
use rstest::rstest;

fn database() -> genesys_config::Database {
    genesys_config::builtin().unwrap()
}

proptest! {
    #[test]
    fn generated_ramps_only_accelerate(
        vstart in 1000u16..60000,
        span in 0u16..50000,
        steps in 2u32..512,
        use_steps in 1u32..1024,
        g in 0.3f32..1.5,
    ) {
        let vend = vstart.saturating_sub(span).max(1);
        let ramp = slope::generate_slope_table(SLOPE_TABLE_SIZE, use_steps, vend, vstart, vend, steps, g);

        prop_assert_eq!(ramp.table.len(), SLOPE_TABLE_SIZE);
        prop_assert!(ramp.table.windows(2).all(|w| w[0] >= w[1]));
        prop_assert!(ramp.table.iter().all(|&v| v >= ramp.vfinal));
        prop_assert!(ramp.used_steps as usize <= SLOPE_TABLE_SIZE);
        let ramp_sum: u64 = ramp.table[..ramp.used_steps as usize - 1].iter().map(|&v| u64::from(v)).sum();
        prop_assert_eq!(ramp.sum, ramp_sum + u64::from(ramp.vfinal));
    }
}

#[rstest]
#[case(0)]
#[case(1)]
#[case(2)]
fn motor_ramps_settle_on_their_final_interval(#[case] step_type: u8) {
    let db = database();
    let motor = db.motor("canon-lide-100-motor").unwrap();
    let ramp = slope::create_slope_table3(motor, SLOPE_TABLE_SIZE, 255, step_type, 4608, 300).unwrap();
    assert_eq!(ramp.table.len(), SLOPE_TABLE_SIZE);
    assert!(ramp.table.windows(2).all(|w| w[0] >= w[1]));
    let last = *ramp.table.last().unwrap();
    assert_eq!(ramp.final_exposure, u32::from(last) * motor.base_ydpi / 300);
    assert!(ramp.used_steps > 1);
}

#[test]
fn missing_step_type_is_an_error() {
    let db = database();
    let motor = db.motor("canon-lide-35-motor").unwrap();
    assert!(slope::create_slope_table3(motor, SLOPE_TABLE_SIZE, 255, 7, 4608, 300).is_err());
}

#[test]
fn profile_tables_are_padded_to_the_factor() {
    let db = database();
    let profile = db.motor_profiles.first().unwrap();
    let table = slope::slope_table(300, profile.exposure, 1200, profile.step_type, 4, &profile.motor, &db.motor_profiles)
        .unwrap();
    assert!(table.steps >= 2);
    assert_eq!(table.table.len(), SLOPE_TABLE_SIZE);
    assert!(table.table.windows(2).all(|w| w[0] >= w[1]));
}

#[test]
fn zero_exposure_cannot_build_a_table() {
    let db = database();
    let profile = db.motor_profiles.first().unwrap();
    assert!(slope::slope_table(300, 0, 1200, 0, 1, &profile.motor, &db.motor_profiles).is_err());
}

#[test]
fn table_bytes_are_little_endian() {
    assert_eq!(slope::to_le_bytes(&[0x1234, 0xabcd]), vec![0x34, 0x12, 0xcd, 0xab]);
}
