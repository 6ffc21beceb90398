// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (c) 2024 Takashi Sakamoto

//! Thin gateway to kernel attribute files.
//!
//! All failures are reported as transient; the attribute may appear or
//! disappear with the device and callers degrade instead of aborting.

use {
    amlogic_afr_protocols::{Error, Result},
    std::fs,
    tracing::warn,
};

/// Read an attribute file into a trimmed string.
pub fn read(path: &str) -> Result<String> {
    fs::read_to_string(path)
        .map(|text| text.trim().to_string())
        .map_err(|err| {
            warn!("failed to read sysfs attr from {}", path);
            Error::transient_io(path, err)
        })
}

pub fn read_attr(device: &str, attr: &str) -> Result<String> {
    read(&format!("{}/{}", device, attr))
}

/// Read an attribute as an integer. Some attributes report `KEY=value`;
/// the prefix up to `=` is skipped, anything after the number is ignored.
pub fn read_int(path: &str) -> Result<i64> {
    read(path).map(|text| parse_int_text(&text))
}

fn parse_int_text(text: &str) -> i64 {
    let text = match text.split_once('=') {
        Some((_, value)) => value,
        None => text,
    }
    .trim();

    let (negative, digits) = match text.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, text.strip_prefix('+').unwrap_or(text)),
    };

    let end = digits
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or_else(|| digits.len());
    let value = digits[..end].parse::<i64>().unwrap_or(0);

    if negative {
        -value
    } else {
        value
    }
}

/// Write a string to an attribute file, truncating previous content.
pub fn write(path: &str, value: &str) -> Result<()> {
    fs::write(path, value).map_err(|err| {
        warn!("failed to write attr [{}] into {}", value, path);
        Error::transient_io(path, err)
    })
}

pub fn write_attr(device: &str, attr: &str, value: &str) -> Result<()> {
    write(&format!("{}/{}", device, attr), value)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn read_trims_and_write_truncates() {
        let dir = tempfile::tempdir().unwrap();
        let dev = dir.path().to_str().unwrap().to_string();

        write_attr(&dev, "mode", "1080p60hz").unwrap();
        assert_eq!(read_attr(&dev, "mode").unwrap(), "1080p60hz");

        write_attr(&dev, "mode", "null").unwrap();
        assert_eq!(read_attr(&dev, "mode").unwrap(), "null");

        std::fs::write(dir.path().join("state"), "1\n").unwrap();
        assert_eq!(read_attr(&dev, "state").unwrap(), "1");

        assert!(read_attr(&dev, "missing").is_err());
    }

    #[test]
    fn int_parsing() {
        assert_eq!(parse_int_text("1"), 1);
        assert_eq!(parse_int_text("6 extra"), 6);
        assert_eq!(parse_int_text("STATE=7"), 7);
        assert_eq!(parse_int_text("-2"), -2);
        assert_eq!(parse_int_text(""), 0);
        assert_eq!(parse_int_text("none"), 0);
    }
}
