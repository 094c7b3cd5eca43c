use std::fmt;

use crate::uuid::ParseUuidError;

/// A result type hardwired to use [`Error`] as its error type.
pub type Result<T> = std::result::Result<T, Error>;

/// The primary error type used throughout this library.
///
/// Precondition failures that can be detected from local state are reported before any remote
/// call is made. Failures raised by the bus itself are passed through unmodified and can be
/// inspected via [`Error::kind`].
#[derive(Debug)]
pub struct Error {
    inner: ErrorKind,
}

impl Error {
    pub(crate) fn from(e: impl Into<ErrorKind>) -> Self {
        Self { inner: e.into() }
    }

    /// Returns the [`ErrorKind`] describing what went wrong.
    pub fn kind(&self) -> &ErrorKind {
        &self.inner
    }

    pub(crate) fn is(&self, kind: &ErrorKind) -> bool {
        std::mem::discriminant(&self.inner) == std::mem::discriminant(kind)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.inner {
            ErrorKind::AlreadyDiscovering => f.write_str("discovery already in progress"),
            ErrorKind::NotDiscovering => f.write_str("no discovery started"),
            ErrorKind::DeviceNotFound => f.write_str("device not found"),
            ErrorKind::AdapterNotFound => f.write_str("adapter not found"),
            ErrorKind::NoAdaptersFound => f.write_str("no available adapters found"),
            ErrorKind::ServiceNotAvailable => f.write_str("service not available"),
            ErrorKind::CharacteristicNotAvailable => f.write_str("characteristic not available"),
            ErrorKind::InvalidPayloadType => f.write_str("only byte buffers can be written"),
            ErrorKind::PropsUnavailable => f.write_str("properties not available"),
            ErrorKind::UnrecognizedType => f.write_str("unrecognized type"),
            ErrorKind::OperationTimedOut => f.write_str("operation timed out"),
            ErrorKind::Zbus(e) => e.fmt(f),
            ErrorKind::Fdo(e) => e.fmt(f),
            ErrorKind::ParseUuid(e) => e.fmt(f),
            ErrorKind::Other(e) => e.fmt(f),
        }
    }
}

impl std::error::Error for Error {}

/// Classifies an [`Error`].
#[derive(Debug)]
#[non_exhaustive]
pub enum ErrorKind {
    /// Discovery was requested while the adapter is already discovering.
    AlreadyDiscovering,
    /// Stopping discovery was requested while the adapter is not discovering.
    NotDiscovering,
    /// The requested device is not known to the adapter.
    DeviceNotFound,
    /// The requested adapter does not exist.
    AdapterNotFound,
    /// The system has no Bluetooth adapters.
    NoAdaptersFound,
    /// The GATT server exposes no service with the requested UUID.
    ServiceNotAvailable,
    /// The GATT service exposes no characteristic with the requested UUID.
    CharacteristicNotAvailable,
    /// A characteristic write was attempted with something other than a byte buffer.
    InvalidPayloadType,
    /// Property access was attempted on a proxy that has properties disabled.
    PropsUnavailable,
    /// A typed value was requested for an unknown type tag.
    UnrecognizedType,
    /// A wait operation ran out of time.
    OperationTimedOut,
    /// The D-Bus connection reported an error.
    Zbus(zbus::Error),
    /// A standard D-Bus interface reported an error.
    Fdo(zbus::fdo::Error),
    /// A remote UUID could not be parsed.
    ParseUuid(ParseUuidError),
    /// Any other failure.
    Other(String),
}

impl From<zbus::Error> for ErrorKind {
    fn from(value: zbus::Error) -> Self {
        Self::Zbus(value)
    }
}

impl From<zbus::fdo::Error> for ErrorKind {
    fn from(value: zbus::fdo::Error) -> Self {
        Self::Fdo(value)
    }
}

impl From<zbus::zvariant::Error> for ErrorKind {
    fn from(value: zbus::zvariant::Error) -> Self {
        Self::Zbus(zbus::Error::Variant(value))
    }
}

impl From<zbus::names::Error> for ErrorKind {
    fn from(value: zbus::names::Error) -> Self {
        Self::Zbus(zbus::Error::from(value))
    }
}

impl From<ParseUuidError> for ErrorKind {
    fn from(value: ParseUuidError) -> Self {
        Self::ParseUuid(value)
    }
}

impl From<String> for ErrorKind {
    fn from(value: String) -> Self {
        Self::Other(value)
    }
}

impl From<&str> for ErrorKind {
    fn from(value: &str) -> Self {
        Self::Other(value.to_string())
    }
}
