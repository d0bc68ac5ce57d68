//! Customized unified error type.

use std::error;
use std::fmt;
use std::io;
use std::net;
use std::num;
use std::string;

/// Customized error type for shardgrid.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct GridError(pub String);

impl GridError {
    pub fn msg(msg: impl ToString) -> Self {
        GridError(msg.to_string())
    }
}

impl fmt::Display for GridError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0) // do not display literal quotes
    }
}

impl error::Error for GridError {}

// Helper macro for saving boiler-plate `impl From<X>`s for transparent
// conversion from various common error types to `GridError`.
macro_rules! impl_from_error {
    ($error:ty) => {
        impl From<$error> for GridError {
            fn from(e: $error) -> Self {
                // just store the source error's string representation
                GridError(e.to_string())
            }
        }
    };
}

// Helper macro for saving boiler-plate `impl From<X<T>>`s for transparent
// conversion from various common generic error types to `GridError`.
macro_rules! impl_from_error_generic {
    ($error:ty) => {
        impl<T> From<$error> for GridError {
            fn from(e: $error) -> GridError {
                GridError::msg(e.to_string())
            }
        }
    };
}

impl_from_error!(io::Error);
impl_from_error!(string::FromUtf8Error);
impl_from_error!(num::ParseIntError);
impl_from_error!(num::ParseFloatError);
impl_from_error!(net::AddrParseError);
impl_from_error!(rmp_serde::encode::Error);
impl_from_error!(rmp_serde::decode::Error);
impl_from_error!(toml::ser::Error);
impl_from_error!(toml::de::Error);
impl_from_error!(tokio::sync::mpsc::error::TryRecvError);
impl_from_error!(tokio::sync::broadcast::error::RecvError);
impl_from_error!(tokio::sync::oneshot::error::RecvError);
impl_from_error!(tokio::task::JoinError);
impl_from_error!(tokio::time::error::Elapsed);

impl_from_error_generic!(tokio::sync::SetError<T>);
impl_from_error_generic!(tokio::sync::watch::error::SendError<T>);
impl_from_error_generic!(tokio::sync::mpsc::error::SendError<T>);
impl_from_error_generic!(tokio::sync::broadcast::error::SendError<T>);

#[cfg(test)]
mod error_tests {
    use super::*;

    #[test]
    fn error_display() {
        let e = GridError("oops what now?".into());
        assert_eq!(format!("{}", e), String::from("oops what now?"));
    }

    #[test]
    fn from_io_error() {
        let io_error = io::Error::new(io::ErrorKind::NotFound, "oh no!");
        let e = GridError::from(io_error);
        assert!(e.0.contains("oh no!"));
    }
}
