// Copyright 2022 Ryan Seipp
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Completion and error codes surfaced by the manager and its callbacks.

use std::io;

/// Errors delivered to callbacks and returned by manager operations.
///
/// Success is the `Ok` arm of [`Result`]; everything that can end an
/// operation early lives here. Kernel socket errors are mapped through
/// [`From<io::Error>`], TLS layer failures collapse into [`Error::Tls`].
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// The operation was canceled by `cancel_read`, shutdown, or close.
    #[error("operation canceled")]
    Canceled,
    /// A connect or read idle-timeout fired.
    #[error("operation timed out")]
    TimedOut,
    /// Clean peer close: TLS close_notify or TCP FIN.
    #[error("end of file")]
    Eof,
    /// Unrecoverable TLS layer failure.
    #[error("TLS error")]
    Tls,
    /// Accept refused by admission control.
    #[error("quota reached")]
    Quota,
    /// Accept admitted, but the soft quota limit was exceeded.
    #[error("soft quota reached")]
    SoftQuota,
    /// The client disconnected before the accept completed.
    #[error("not connected")]
    NotConnected,
    /// The kernel is out of descriptors, buffers, or ports.
    #[error("not enough free resources")]
    NoResources,
    /// The requested address family is not supported.
    #[error("address family not supported")]
    FamilyNotSupported,
    /// The address is already in use.
    #[error("address in use")]
    AddrInUse,
    /// The address is not available on this host.
    #[error("address not available")]
    AddrNotAvailable,
    /// The peer refused the connection.
    #[error("connection refused")]
    ConnectionRefused,
    /// The connection was reset by the peer.
    #[error("connection reset")]
    ConnectionReset,
    /// The manager is shutting down; no new work is admitted.
    #[error("shutting down")]
    ShuttingDown,
    /// Anything the mapping tables do not cover.
    #[error("unexpected error")]
    Unexpected,
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::TimedOut => Error::TimedOut,
            io::ErrorKind::UnexpectedEof => Error::Eof,
            io::ErrorKind::AddrInUse => Error::AddrInUse,
            io::ErrorKind::AddrNotAvailable => Error::AddrNotAvailable,
            io::ErrorKind::ConnectionRefused => Error::ConnectionRefused,
            io::ErrorKind::ConnectionReset | io::ErrorKind::ConnectionAborted => {
                Error::ConnectionReset
            }
            io::ErrorKind::NotConnected => Error::NotConnected,
            io::ErrorKind::OutOfMemory => Error::NoResources,
            io::ErrorKind::Unsupported => Error::FamilyNotSupported,
            _ => match err.raw_os_error() {
                Some(libc::EMFILE) | Some(libc::ENFILE) | Some(libc::ENOBUFS)
                | Some(libc::ENOMEM) => Error::NoResources,
                Some(libc::EAFNOSUPPORT) | Some(libc::EPROTONOSUPPORT) => {
                    Error::FamilyNotSupported
                }
                _ => Error::Unexpected,
            },
        }
    }
}

impl From<rustls::Error> for Error {
    fn from(_: rustls::Error) -> Self {
        Error::Tls
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_errno_to_resource_errors() {
        let err = io::Error::from_raw_os_error(libc::EMFILE);
        assert_eq!(Error::from(err), Error::NoResources);

        let err = io::Error::from_raw_os_error(libc::EAFNOSUPPORT);
        assert_eq!(Error::from(err), Error::FamilyNotSupported);
    }

    #[test]
    fn maps_connection_error_kinds() {
        let err = io::Error::new(io::ErrorKind::ConnectionRefused, "refused");
        assert_eq!(Error::from(err), Error::ConnectionRefused);

        let err = io::Error::new(io::ErrorKind::ConnectionAborted, "aborted");
        assert_eq!(Error::from(err), Error::ConnectionReset);

        let err = io::Error::new(io::ErrorKind::UnexpectedEof, "eof");
        assert_eq!(Error::from(err), Error::Eof);
    }

    #[test]
    fn unknown_errors_are_unexpected() {
        let err = io::Error::new(io::ErrorKind::Other, "mystery");
        assert_eq!(Error::from(err), Error::Unexpected);
    }
}
