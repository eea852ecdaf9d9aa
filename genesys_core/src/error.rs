use genesys_config::AsicType;
use thiserror::Error;

/// Status vocabulary shared with frontends and the CLI exit codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Status {
    Unsupported,
    Cancelled,
    DeviceBusy,
    Invalid,
    Eof,
    Jammed,
    NoDocs,
    CoverOpen,
    IoError,
    NoMem,
    AccessDenied,
}

impl Status {
    pub fn as_str(self) -> &'static str {
        match self {
            Status::Unsupported => "unsupported",
            Status::Cancelled => "cancelled",
            Status::DeviceBusy => "device_busy",
            Status::Invalid => "invalid",
            Status::Eof => "eof",
            Status::Jammed => "jammed",
            Status::NoDocs => "no_docs",
            Status::CoverOpen => "cover_open",
            Status::IoError => "io_error",
            Status::NoMem => "no_mem",
            Status::AccessDenied => "access_denied",
        }
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GenesysError {
    #[error("i/o error: {message}")]
    Io { message: String },
    #[error("scanner head is locked: {0}")]
    Jammed(String),
    #[error("resolution {resolution} dpi is not supported (optical resolution {optical} dpi)")]
    UnsupportedResolution { resolution: u32, optical: u32 },
    #[error("register 0x{0:04x} is not part of the register set")]
    RegisterNotFound(u16),
    #[error("{operation} is not supported on {asic}")]
    NotSupported {
        operation: &'static str,
        asic: AsicType,
    },
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("operation cancelled")]
    Cancelled,
    #[error("transport error: {0}")]
    Transport(String),
}

impl GenesysError {
    pub fn io(message: impl Into<String>) -> Self {
        GenesysError::Io {
            message: message.into(),
        }
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        GenesysError::InvalidArgument(message.into())
    }

    pub fn status(&self) -> Status {
        match self {
            GenesysError::Io { .. } | GenesysError::Transport(_) => Status::IoError,
            GenesysError::Jammed(_) => Status::Jammed,
            GenesysError::UnsupportedResolution { .. }
            | GenesysError::InvalidArgument(_)
            | GenesysError::RegisterNotFound(_) => Status::Invalid,
            GenesysError::NotSupported { .. } => Status::Unsupported,
            GenesysError::Cancelled => Status::Cancelled,
        }
    }
}

#[derive(Debug, Error, Clone)]
pub enum BuildError {
    #[error("missing transport")]
    MissingTransport,
    #[error("missing model")]
    MissingModel,
    #[error("unknown model '{0}'")]
    UnknownModel(String),
    #[error("model references unknown {kind} '{id}'")]
    UnknownReference { kind: &'static str, id: String },
    #[error("invalid config: {0}")]
    InvalidConfig(&'static str),
}

pub type Result<T> = eyre::Result<T>;
pub use eyre::Report;

/// Status of the typed error carried by `report`, if there is one.
pub fn status_of(report: &Report) -> Option<Status> {
    report.downcast_ref::<GenesysError>().map(GenesysError::status)
}
