use genesys_core::Scanner;
use genesys_core::error::BuildError;
use genesys_core::mocks::MockTransport;
use rstest::rstest;

#[rstest]
fn unknown_model_yields_typed_build_error() {
    let err = Scanner::builder()
        .with_transport(MockTransport::new())
        .with_model("canon-lide-9000")
        .try_build()
        .expect_err("should fail with UnknownModel");

    match err.downcast_ref::<BuildError>() {
        Some(BuildError::UnknownModel(id)) => assert_eq!(id, "canon-lide-9000"),
        other => panic!("expected UnknownModel, got: {other:?}"),
    }
}

#[rstest]
fn dangling_sensor_reference_is_reported() {
    let mut db = genesys_config::builtin().unwrap();
    db.sensors.retain(|s| s.id != "cis-canon-lide-35");
    let err = Scanner::builder()
        .with_transport(MockTransport::new())
        .with_model("canon-lide-35")
        .with_database(db)
        .try_build()
        .expect_err("should fail with UnknownReference");

    match err.downcast_ref::<BuildError>() {
        Some(BuildError::UnknownReference { kind, id }) => {
            assert_eq!(*kind, "sensor");
            assert_eq!(id, "cis-canon-lide-35");
        }
        other => panic!("expected UnknownReference, got: {other:?}"),
    }
}
