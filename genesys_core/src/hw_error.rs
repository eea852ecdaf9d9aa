//! Maps `Box<dyn Error>` from trait boundaries to typed `GenesysError`.
//!
//! The traits in `genesys_traits` use `Box<dyn Error + Send + Sync>` so any
//! transport can plug in; this module converts those to our typed error enum,
//! with an optional feature-gated path for `genesys_hardware::HwError`
//! downcasting.

use crate::error::{GenesysError, Result};
use genesys_traits::BoxError;

/// Map a trait-boundary error to a typed `GenesysError`.
///
/// Attempts to downcast known hardware error types first, then falls back
/// to string-based heuristics.
pub fn map_hw_error(e: &(dyn std::error::Error + 'static)) -> GenesysError {
    #[cfg(feature = "hardware-errors")]
    {
        use genesys_hardware::error::HwError;
        if let Some(hw) = e.downcast_ref::<HwError>() {
            return match hw {
                HwError::Timeout => GenesysError::io("usb transfer timed out"),
                HwError::RegisterOutOfRange(addr) => GenesysError::RegisterNotFound(*addr),
                other => GenesysError::Transport(other.to_string()),
            };
        }
    }

    let s = e.to_string();
    if s.to_lowercase().contains("timeout") || s.to_lowercase().contains("timed out") {
        GenesysError::io(s)
    } else {
        GenesysError::Transport(s)
    }
}

/// Lift a transport result into the crate's `Result`, attaching context.
pub(crate) trait HwResultExt<T> {
    fn hw(self, what: &'static str) -> Result<T>;
}

impl<T> HwResultExt<T> for std::result::Result<T, BoxError> {
    fn hw(self, what: &'static str) -> Result<T> {
        use eyre::WrapErr;
        self.map_err(|e| eyre::Report::new(map_hw_error(&*e)))
            .wrap_err(what)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn string_fallback_detects_timeouts() {
        let e = std::io::Error::other("bulk read timeout");
        assert_eq!(map_hw_error(&e).status(), crate::error::Status::IoError);
        assert!(matches!(map_hw_error(&e), GenesysError::Io { .. }));
        let e = std::io::Error::other("stall");
        assert_eq!(map_hw_error(&e), GenesysError::Transport("stall".into()));
    }

    #[cfg(feature = "hardware-errors")]
    #[test]
    fn hardware_errors_are_downcast() {
        use genesys_hardware::error::HwError;
        assert_eq!(
            map_hw_error(&HwError::RegisterOutOfRange(0x1ff)),
            GenesysError::RegisterNotFound(0x1ff)
        );
        assert!(matches!(
            map_hw_error(&HwError::Injected("x".into())),
            GenesysError::Transport(_)
        ));
    }
}
