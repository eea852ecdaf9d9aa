use thiserror::Error;

#[derive(Debug, Error)]
pub enum HwError {
    #[error("usb transfer failed: {0}")]
    Usb(String),
    #[error("invalid read of register 0x{register:02x} (ack 0x{ack:02x}), scanner unplugged?")]
    InvalidRead { register: u16, ack: u8 },
    #[error("short transfer: expected {expected} bytes, got {actual}")]
    ShortTransfer { expected: usize, actual: usize },
    #[error("unsupported register number 0x{0:04x}")]
    RegisterOutOfRange(u16),
    #[error("usb timeout")]
    Timeout,
    #[error("simulated fault: {0}")]
    Injected(String),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, HwError>;
