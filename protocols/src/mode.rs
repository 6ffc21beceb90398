// SPDX-License-Identifier: LGPL-3.0-or-later
// Copyright (c) 2024 Takashi Sakamoto

//! Display mode names, fixed-point refresh rates and mode selection.
//!
//! The HDMI transmitter driver reports supported modes as short names such
//! as `1080p24hz`, `2160p60hz420` or `smpte24hz`. A mode carries an integer
//! frame rate; the fractional flag selects the NTSC variant (rate scaled by
//! 1000/1001) for the bases which have one.

use {super::*, tracing::debug};

/// The name written to the mode attribute to blank the display while a mode
/// transition is in progress.
pub const NULL_MODE_NAME: &str = "null";

/// A display mode supported by the HDMI transmitter.
#[derive(Clone, Debug, Default)]
pub struct DisplayMode {
    pub name: String,
    pub width: u32,
    pub height: u32,
    pub framerate: u32,
    pub interlaced: bool,
    pub fractional: bool,
}

fn take_int(s: &str) -> (u32, &str) {
    let end = s
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or_else(|| s.len());
    (s[..end].parse().unwrap_or(0), &s[end..])
}

impl DisplayMode {
    /// Parse a mode name from the capability list or the mode attribute.
    ///
    /// Grammar: `smpte<rate>...` (4096x2160), `<width>x<height><scan><rate>...`
    /// or `<height><scan><rate>...` with the width implied by the height.
    /// `<scan>` is `i`, `p` or `fp` (an alias of `p` in the kernel). Anything
    /// after the frame rate, like the `hz` suffix or a trailing color space
    /// token, is ignored.
    pub fn parse(desc: &str) -> Result<DisplayMode> {
        let mut mode = DisplayMode {
            name: desc.to_string(),
            ..Default::default()
        };

        let rest = if let Some(rest) = desc.strip_prefix("smpte") {
            mode.width = 4096;
            mode.height = 2160;
            rest
        } else {
            let (v, rest) = take_int(desc);
            let rest = if let Some(rest) = rest.strip_prefix('x') {
                mode.width = v;
                let (h, rest) = take_int(rest);
                mode.height = h;
                rest
            } else {
                mode.height = v;
                mode.width = match v {
                    480 => 640,
                    576 => 720,
                    720 => 1280,
                    1080 => 1920,
                    2160 => 3840,
                    _ => {
                        let label = format!("unrecognized mode name: {}", desc);
                        return Err(Error::Parse(label));
                    }
                };
                rest
            };

            let mut chars = rest.chars();
            let mut c = chars.next();
            if c == Some('f') {
                c = chars.next();
            }
            match c {
                Some('i') => mode.interlaced = true,
                Some('p') => mode.interlaced = false,
                _ => {
                    let label = format!("unrecognized mode name: {}", desc);
                    return Err(Error::Parse(label));
                }
            }
            chars.as_str()
        };

        let (framerate, _) = take_int(rest);
        mode.framerate = framerate;

        Ok(mode)
    }

    /// The refresh rate in 24.8 fixed-point Hz. For fractional modes the
    /// canonical NTSC equivalents are returned for the supported bases;
    /// other bases have no fractional variant and report the integer rate.
    pub fn hz(&self) -> i32 {
        if self.fractional {
            match self.framerate {
                24 => return (2997 * 256 + 62) / 125,
                30 => return (2997 * 256 + 50) / 100,
                60 => return (5994 * 256 + 50) / 100,
                120 => return (11988 * 256 + 50) / 100,
                240 => return (23976 * 256 + 50) / 100,
                _ => (),
            }
        }

        (self.framerate as i32) * 256
    }

    /// Choose the fractional or the integer variant of the mode, whichever
    /// comes closer to an integer multiple of `hz`. When the mode has no
    /// fractional variant the flag is cleared.
    pub fn set_hz(&mut self, hz: i32) {
        self.fractional = true;
        let hz_frac = self.hz();
        let hz_int = (self.framerate as i32) * 256;

        if hz_frac == hz_int {
            self.fractional = false;
            return;
        }

        if hz <= 0 {
            self.fractional = false;
            return;
        }

        // find the multiple of hz closest to the integer rate
        let mut hz_n = 1;
        let mut best_hz = hz;
        let mut best_diff = (hz - hz_int).abs();
        loop {
            hz_n += 1;
            let multiple_hz = hz * hz_n;
            let multiple_diff = (multiple_hz - hz_int).abs();
            if multiple_diff > best_diff {
                break;
            }
            best_hz = multiple_hz;
            best_diff = multiple_diff;
        }

        if (hz_int - best_hz).abs() < (hz_frac - best_hz).abs() {
            self.fractional = false;
        }
    }
}

/// Modes are equal when geometry, scan type and the effective refresh rate
/// all match, thus the integer and the fractional variant of one mode name
/// are distinct.
impl PartialEq for DisplayMode {
    fn eq(&self, other: &Self) -> bool {
        self.width == other.width
            && self.height == other.height
            && self.interlaced == other.interlaced
            && self.hz() == other.hz()
    }
}

impl std::fmt::Display for DisplayMode {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "{} ({}x{}@{}Hz{})",
            self.name,
            self.width,
            self.height,
            Hz(self.hz()),
            if self.interlaced { ", interlaced" } else { "" }
        )
    }
}

pub fn rate_is_blacklisted(blacklist: &[i32], rate: i32) -> bool {
    blacklist.iter().any(|b| (b - rate).abs() <= 1)
}

/// Find the best mode to display a movie at `hz` (24.8 fixed-point).
///
/// Candidates must share geometry and scan type with the current mode and
/// their frame rate must closely divide by `hz`: with `rate` the 16.16
/// quotient of the two reduced below 0x180 to avoid locking on
/// sub-harmonics, the error `|rate - 0x100|` may not exceed 11 (about
/// 4.3%, the distance between 23.976 and 25 Hz). A smaller error rates
/// higher; among the divisors, `prefer_exact` rates the closest frame rate
/// highest, otherwise the fastest one. Each candidate is resolved to its
/// fractional or integer variant before being accepted, flipping the
/// variant once when the resolved rate is blacklisted.
pub fn select_mode(
    modes: &[DisplayMode],
    current: &DisplayMode,
    hz: i32,
    prefer_exact: bool,
    blacklist: &[i32],
) -> Option<DisplayMode> {
    if hz <= 0 {
        return None;
    }

    let mut best: Option<DisplayMode> = None;
    let mut best_rating = 0;

    for mode in modes {
        if mode.width != current.width
            || mode.height != current.height
            || mode.interlaced != current.interlaced
        {
            continue;
        }

        let mut rate_n: i64 = 1;
        let mut rate = ((mode.framerate as i64) << 16) / (hz as i64);
        while rate > 0x180 {
            rate_n += 1;
            rate = ((mode.framerate as i64) << 16) / (hz as i64 * rate_n);
        }

        let delta = (rate - 0x100).abs();
        if delta > 11 {
            continue;
        }

        let mut rating = (11 - delta) * 16;
        let n = (rate_n - 1).min(3);
        rating += 4 * if prefer_exact { 3 - n } else { n };

        if rating > best_rating {
            let mut candidate = mode.clone();
            candidate.set_hz(hz);

            if rate_is_blacklisted(blacklist, candidate.hz()) {
                candidate.fractional = !candidate.fractional;
                if rate_is_blacklisted(blacklist, candidate.hz()) {
                    debug!("both variants of {} are blacklisted", candidate.name);
                    continue;
                }
            }

            best_rating = rating;
            best = Some(candidate);
        }
    }

    best
}
