use std::result::Result as StdResult;

/// Errors surfaced at the boundary of every public operation in this crate.
///
/// Every variant carries enough context (address, size, response code) to
/// reproduce the failure without re-running the operation with logging
/// turned up.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("no serial port found (and none was specified)")]
    NoPort,

    #[error("failed to open serial port: {0}")]
    OpenFailed(String),

    #[error(
        "no \"pong\" received from the bootloader after 30 attempts; things that could be wrong:\n\
         \x20 - the bootloader is not flashed on the chip\n\
         \x20 - the DTR/RTS lines are not wired\n\
         \x20 - the serial port being used is incorrect\n\
         \x20 - the bootloader protocol has drifted from what this tool expects"
    )]
    NoPong,

    #[error("malformed response frame header: {got_header:02x?}")]
    FramingError { got_header: [u8; 2] },

    #[error("unexpected response code: expected {expected:#04x}, got {got:#04x}")]
    UnexpectedResponse { expected: u8, got: u8 },

    #[error("short read: expected {expected} bytes, got {got}")]
    ShortRead { expected: usize, got: usize },

    #[error("bootloader reported a bad address")]
    BadAddress,

    #[error("bootloader reported bad arguments")]
    BadArgs,

    #[error("bootloader reported an internal error")]
    InternalTargetError,

    #[error("opaque bootloader response code: {0:#04x}")]
    OpaqueResponse(u8),

    #[error("CRC mismatch: local {local:#010x}, remote {remote:#010x}")]
    CrcMismatch { local: u32, remote: u32 },

    #[error("unknown AppHeader version: {version}")]
    UnknownHeaderVersion { version: u32 },

    #[error("variants in the same bundle disagree on their package name")]
    NameMismatch,

    #[error("size mismatch: want {want} bytes, have {have} bytes")]
    SizeMismatch { want: u32, have: u32 },

    #[error("no installed app named {name:?} was found")]
    AppNotFound { name: String },

    #[error("cannot shrink below {minimum} bytes (requested {requested})")]
    TooSmall { requested: u32, minimum: u32 },

    #[error("app header is not valid UTF-8 or is out of bounds")]
    MalformedHeader,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = StdResult<T, Error>;
