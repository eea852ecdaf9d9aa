use genesys_config::AsicType;
use genesys_core::mocks::{FakeClock, MockTransport, device_for};
use genesys_core::{GenesysError, Status, status_of};
use rstest::rstest;

#[rstest]
#[case(GenesysError::io("bulk read timed out"), Status::IoError)]
#[case(GenesysError::Transport("stall".into()), Status::IoError)]
#[case(GenesysError::Jammed("gear slip".into()), Status::Jammed)]
#[case(GenesysError::UnsupportedResolution { resolution: 75, optical: 1200 }, Status::Invalid)]
#[case(GenesysError::invalid("bad area"), Status::Invalid)]
#[case(GenesysError::RegisterNotFound(0x1234), Status::Invalid)]
#[case(GenesysError::NotSupported { operation: "eject", asic: AsicType::Gl847 }, Status::Unsupported)]
#[case(GenesysError::Cancelled, Status::Cancelled)]
fn every_error_has_a_status(#[case] err: GenesysError, #[case] status: Status) {
    assert_eq!(err.status(), status);
    assert_eq!(status_of(&eyre::Report::new(err)), Some(status));
}

#[test]
fn status_names_are_stable() {
    assert_eq!(Status::IoError.to_string(), "io_error");
    assert_eq!(Status::NoDocs.to_string(), "no_docs");
}

#[test]
fn context_does_not_hide_the_status() {
    use eyre::WrapErr;
    let report = Err::<(), _>(GenesysError::Cancelled)
        .wrap_err("while scanning")
        .unwrap_err();
    assert_eq!(status_of(&report), Some(Status::Cancelled));
}

#[test]
fn failed_register_write_surfaces_as_transport_error() {
    let mock = MockTransport::new();
    mock.fail_writes_to(0x01, 1);
    let clock = FakeClock::new();
    let mut dev = device_for("canon-lide-35", mock.clone(), &clock).unwrap();

    let err = dev.write_register(0x01, 0x20).unwrap_err();
    assert_eq!(status_of(&err), Some(Status::IoError));
    assert!(format!("{err:#}").contains("injected write failure"));

    dev.write_register(0x01, 0x20).unwrap();
    assert_eq!(mock.register(0x01), Some(0x20));
}

#[test]
fn untyped_reports_have_no_status() {
    assert_eq!(status_of(&eyre::eyre!("plain message")), None);
}
