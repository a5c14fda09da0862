// DvrStream
// Copyright (c) 2025 The DvrStream Developers.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The `errors` module defines the common error type.

use std::error::Error as StdError;
use std::fmt;
use std::io;
use std::result;

/// `Error` provides an enumeration of all possible errors reported by DvrStream.
#[derive(Debug)]
pub enum Error {
    /// An invalid parameter was provided to an operation.
    InvalidArgument(&'static str),
    /// The ring buffer or the HTTP transfer handle could not be set up.
    Allocation(&'static str),
    /// The transport layer failed before a usable HTTP response was produced.
    Transport(Box<dyn StdError + Send + Sync>),
    /// The transfer completed with an HTTP status code outside 200-299.
    HttpStatus(u32),
    /// The HTTP response violated the expectations of the stream.
    Protocol(&'static str),
    /// The stream does not support seek operations.
    Unseekable,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Error::InvalidArgument(param) => {
                write!(f, "invalid argument: {}", param)
            }
            Error::Allocation(resource) => {
                write!(f, "failed to allocate {}", resource)
            }
            Error::Transport(ref err) => {
                write!(f, "transport error: {}", err)
            }
            Error::HttpStatus(code) => {
                write!(f, "http error: response code {}", code)
            }
            Error::Protocol(msg) => {
                write!(f, "protocol error: {}", msg)
            }
            Error::Unseekable => {
                write!(f, "stream is not seekable")
            }
        }
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match *self {
            Error::Transport(ref err) => Some(err.as_ref()),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Error {
        Error::Transport(Box::new(err))
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Error {
        Error::Transport(Box::new(err))
    }
}

impl From<Error> for io::Error {
    fn from(err: Error) -> io::Error {
        let kind = match err {
            Error::InvalidArgument(_) => io::ErrorKind::InvalidInput,
            Error::Unseekable => io::ErrorKind::Unsupported,
            _ => io::ErrorKind::Other,
        };
        io::Error::new(kind, err)
    }
}

pub type Result<T> = result::Result<T, Error>;

/// Convenience function to create an invalid argument error.
pub fn invalid_argument_error<T>(param: &'static str) -> Result<T> {
    Err(Error::InvalidArgument(param))
}

/// Convenience function to create an allocation error.
pub fn allocation_error<T>(resource: &'static str) -> Result<T> {
    Err(Error::Allocation(resource))
}

/// Convenience function to create a transport error from a bare description.
pub fn transport_error<T>(desc: &'static str) -> Result<T> {
    Err(Error::Transport(Box::new(io::Error::new(io::ErrorKind::Other, desc))))
}

/// Convenience function to create a protocol error.
pub fn protocol_error<T>(msg: &'static str) -> Result<T> {
    Err(Error::Protocol(msg))
}
