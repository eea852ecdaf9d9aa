//! Human-readable error descriptions and structured JSON error formatting.

use genesys_core::error::{BuildError, GenesysError, Status};

/// Map an eyre::Report to a human-readable explanation with likely causes and fix hints.
pub fn humanize(err: &eyre::Report) -> String {
    // Typed matches first
    if let Some(be) = err.downcast_ref::<BuildError>() {
        return match be {
            BuildError::MissingTransport => {
                "What happened: No transport was provided to the scanner.\nLikely causes: The device could not be opened or was not wired into the builder.\nHow to fix: Pass a transport via with_transport(...).".to_string()
            }
            BuildError::MissingModel => {
                "What happened: No scanner model was selected.\nLikely causes: Neither --model nor [device] model was given.\nHow to fix: Pass --model (see `genesys models`) or set [device] model in the settings file.".to_string()
            }
            BuildError::UnknownModel(id) => format!(
                "What happened: Model '{id}' is not in the device database.\nLikely causes: A typo, or a custom [database] path without this model.\nHow to fix: Run `genesys models` for the list of known ids."
            ),
            BuildError::UnknownReference { kind, id } => format!(
                "What happened: The model refers to {kind} '{id}', which the database does not define.\nLikely causes: An incomplete custom device database.\nHow to fix: Add the missing [[{kind}s]] entry or fix the model's reference."
            ),
            BuildError::InvalidConfig(msg) => format!(
                "What happened: Invalid configuration ({msg}).\nLikely causes: Missing or out-of-range values in the TOML.\nHow to fix: Edit the settings file, then rerun."
            ),
        };
    }

    if let Some(ge) = err.downcast_ref::<GenesysError>() {
        return match ge {
            GenesysError::Jammed(msg) => format!(
                "What happened: The scanner head is locked ({msg}).\nLikely causes: The transport lock switch is engaged.\nHow to fix: Unlock the scan head and retry."
            ),
            GenesysError::UnsupportedResolution { resolution, optical } => format!(
                "What happened: {resolution} dpi is not available (optical resolution {optical} dpi).\nLikely causes: The requested resolution exceeds what the sensor delivers in this mode.\nHow to fix: Choose a resolution listed by `genesys models`."
            ),
            GenesysError::NotSupported { operation, asic } => format!(
                "What happened: {operation} is not available on {asic} scanners.\nLikely causes: The operation only exists on other models (e.g. sheet-fed).\nHow to fix: Skip this step for the selected model."
            ),
            GenesysError::Cancelled => {
                "What happened: The operation was cancelled.\nLikely causes: Ctrl-C was pressed.\nHow to fix: Rerun the command.".to_string()
            }
            GenesysError::Io { message } => format!(
                "What happened: {message}.\nLikely causes: The motor did not finish its move or the device stopped answering.\nHow to fix: Check the scanner is powered and connected; raise [timeouts] poll_retries if moves are slow."
            ),
            other => format!(
                "What happened: {other}.\nLikely causes: See logs.\nHow to fix: Re-run with --log-level=debug or set RUST_LOG for more detail."
            ),
        };
    }

    let msg = err.to_string();
    let lower = msg.to_ascii_lowercase();

    // Calibration CSV header special-case
    if lower.contains("calibration csv must have headers") {
        return "Invalid headers in calibration CSV. Expected 'channel,gain,offset,exposure'.".to_string();
    }

    if lower.contains("parse settings") || lower.contains("read settings") {
        return format!(
            "What happened: The settings file could not be loaded.\nLikely causes: A missing file or a TOML syntax error.\nHow to fix: Check the path and syntax. Details: {msg}"
        );
    }

    // Generic fallback
    let mut cause = String::new();
    if let Some(src) = err.source() {
        cause = format!(" Cause: {src}");
    }
    format!(
        "Something went wrong.{cause}\nHow to fix: Re-run with --log-level=debug for details. Original: {msg}"
    )
}

/// Stable process exit code for each backend status; build errors map to 2,
/// anything untyped to 1.
pub fn exit_code_for_error(err: &eyre::Report) -> i32 {
    if err.downcast_ref::<BuildError>().is_some() {
        return 2;
    }
    match genesys_core::status_of(err) {
        Some(Status::Unsupported) => 3,
        Some(Status::Cancelled) => 4,
        Some(Status::DeviceBusy) => 5,
        Some(Status::Invalid) => 6,
        Some(Status::Eof) => 7,
        Some(Status::Jammed) => 8,
        Some(Status::NoDocs) => 9,
        Some(Status::CoverOpen) => 10,
        Some(Status::IoError) => 11,
        Some(Status::NoMem) => 12,
        Some(Status::AccessDenied) => 13,
        None => 1,
    }
}

/// Structured JSON for errors when --json is enabled.
pub fn format_error_json(err: &eyre::Report) -> String {
    use serde_json::json;

    let reason = match genesys_core::status_of(err) {
        Some(status) => status.as_str(),
        None if err.downcast_ref::<BuildError>().is_some() => "build",
        None => "error",
    };
    json!({
        "reason": reason,
        "exit_code": exit_code_for_error(err),
        "message": humanize(err),
    })
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use genesys_config::AsicType;
    use rstest::rstest;

    #[rstest]
    #[case(GenesysError::Cancelled, 4)]
    #[case(GenesysError::io("timeout while waiting for scanhead to go home"), 11)]
    #[case(GenesysError::Jammed("lock".into()), 8)]
    #[case(GenesysError::invalid("x"), 6)]
    #[case(GenesysError::NotSupported { operation: "eject", asic: AsicType::Gl124 }, 3)]
    fn statuses_have_stable_exit_codes(#[case] err: GenesysError, #[case] code: i32) {
        assert_eq!(exit_code_for_error(&eyre::Report::new(err)), code);
    }

    #[test]
    fn unknown_model_suggests_listing_models() {
        let err = eyre::Report::new(BuildError::UnknownModel("x".into()));
        assert!(humanize(&err).contains("genesys models"));
        assert_eq!(exit_code_for_error(&err), 2);
    }

    #[test]
    fn json_errors_carry_the_status_name() {
        let err = eyre::Report::new(GenesysError::Cancelled);
        let v: serde_json::Value = serde_json::from_str(&format_error_json(&err)).unwrap();
        assert_eq!(v["reason"], "cancelled");
        assert_eq!(v["exit_code"], 4);
    }
}
