// SPDX-License-Identifier: LGPL-3.0-or-later
// Copyright (c) 2024 Takashi Sakamoto

//! Pure logic to detect the frame rate of played movies and to select the
//! closest display mode supported by the HDMI transmitter of AMLogic based
//! set-top boxes. The service runtime feeds it with kernel uevents, decoder
//! statistics and sysfs attribute contents; nothing in this crate performs
//! I/O by itself.
//!
//! Refresh rates are expressed in 24.8 fixed-point Hz; e.g. `60 * 256`
//! stands for 60.00 Hz and `6138` for 23.976 Hz (the NTSC variant of 24).

pub mod mode;
pub mod mstime;
pub mod rate;
pub mod uevent;

use std::io;

/// The error to report detail of failure in this crate as well as in the
/// service runtime built on top of it.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// I/O against a kernel interface failed; the operation may succeed when
    /// retried later.
    #[error("transient I/O failure on {path}: {source}")]
    TransientIo {
        path: String,
        #[source]
        source: io::Error,
    },
    /// Input from the kernel, the configuration or a peer was malformed.
    #[error("parse failure: {0}")]
    Parse(String),
    /// The operation is valid but not available in the current setup.
    #[error("not supported: {0}")]
    NotSupported(String),
    /// The operation was refused by policy.
    #[error("denied: {0}")]
    Denied(String),
    /// Shutdown was requested while the operation was in progress.
    #[error("shutdown requested")]
    Shutdown,
}

impl Error {
    pub fn transient_io(path: &str, source: io::Error) -> Self {
        Error::TransientIo {
            path: path.to_string(),
            source,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Build a 24.8 fixed-point Hz value from integer and milli parts.
pub const fn fp8(units: i32, milli: i32) -> i32 {
    units * 256 + (milli * 256 + 500) / 1000
}

/// Adapter to print a 24.8 fixed-point Hz value as `23.97`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Hz(pub i32);

impl std::fmt::Display for Hz {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}.{:02}", self.0 >> 8, (100 * (self.0 & 255)) >> 8)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn fp8_fixed_point() {
        assert_eq!(fp8(60, 0), 15360);
        assert_eq!(fp8(23, 976), 6138);
        assert_eq!(fp8(29, 970), 7672);
        assert_eq!(fp8(59, 940), 15345);
    }

    #[test]
    fn hz_display() {
        assert_eq!(Hz(fp8(60, 0)).to_string(), "60.00");
        assert_eq!(Hz(fp8(23, 976)).to_string(), "23.97");
        assert_eq!(Hz(fp8(25, 0)).to_string(), "25.00");
    }
}
