// SPDX-License-Identifier: LGPL-3.0-or-later
// Copyright (c) 2024 Takashi Sakamoto

//! Multi-source frame rate estimation.
//!
//! The frame rate of the played movie can be learnt from several sources of
//! different quality: the FRAME_RATE_HINT uevent attribute, the decoder pts
//! dump, the decoder block counters and the decoder status attribute. Each
//! sample carries the weight of its source; a rate is committed once enough
//! agreeing samples accumulate.

use {
    super::{mstime::OneShot, *},
    tracing::{debug, trace},
};

/// Accept a rate once agreeing samples accumulate this much weight.
pub const ACCEPT_HZ_WEIGHT: i32 = 100;

/// The minimum sane refresh rate, 24.8 fixed-point.
pub const HZ_MIN: i32 = fp8(10, 0);
/// The maximum sane refresh rate, 24.8 fixed-point.
pub const HZ_MAX: i32 = fp8(100, 0);

/// The sources of frame rate samples in descending order of reliability.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RateSource {
    /// FRAME_RATE_HINT from a uevent or the API, immediately usable.
    Hint,
    /// Presentation time stamps from dump_vdec_chunks, needs 2 agreements.
    Chunks,
    /// Block counters from dump_vdec_blocks, needs 3 agreements.
    Blocks,
    /// The frame rate reported by vdec_status, needs 4 agreements.
    Status,
}

impl RateSource {
    pub const ALL: [RateSource; 4] = [
        RateSource::Hint,
        RateSource::Chunks,
        RateSource::Blocks,
        RateSource::Status,
    ];

    pub fn weight(self) -> i32 {
        match self {
            RateSource::Hint => 100,
            RateSource::Chunks => 50,
            RateSource::Blocks => 34,
            RateSource::Status => 25,
        }
    }
}

/// Check whether two rates are no further apart than a rounding error:
/// within one fixed-point unit or within 0.5%. By intention the test
/// reports a fractional rate as "close" to its integer base; it filters off
/// data that is way off the mainline, not variants of one rate.
pub fn hz_close(hz1: i32, hz2: i32) -> bool {
    if (hz1 - hz2).abs() <= 1 {
        return true;
    }

    if hz2 == 0 {
        return false;
    }

    let hz1 = hz1 as i64;
    let hz2 = hz2 as i64;
    (10000 - (hz1 * 10000 + hz2 / 2) / hz2).abs() <= 50
}

const SANE_HZ: [i32; 8] = [
    fp8(23, 976),
    fp8(24, 0),
    fp8(25, 0),
    fp8(29, 970),
    fp8(30, 0),
    fp8(50, 0),
    fp8(59, 940),
    fp8(60, 0),
];

/// Round a rate to the nearest standard frame rate, or return 0 when it is
/// not close to any of them.
pub fn hz_round(hz: i32) -> i32 {
    let mut closest_hz = 0;
    let mut closest_delta = i32::MAX;

    for &sane in SANE_HZ.iter() {
        let delta = (sane - hz).abs();
        if delta < closest_delta {
            closest_delta = delta;
            closest_hz = sane;
        }
    }

    trace!("hz {} closest {}", Hz(hz), Hz(closest_hz));

    if hz_close(hz, closest_hz) {
        closest_hz
    } else {
        0
    }
}

/// Convert a FRAME_RATE_HINT value, the frame period in units of 1/96000
/// second, to a 24.8 fixed-point rate.
pub fn hint_period_to_hz(period: u32) -> i32 {
    if period == 0 {
        return 0;
    }

    let period = period as i64;
    ((256 * 96000 + period / 2) / period) as i32
}

#[derive(Clone, Copy, Debug, Default)]
struct SourceStat {
    // last seen value from this source
    hz: i32,
    // total weight of agreeing samples
    weight: i32,
    // expiration timer for collecting data from this source
    timeout: OneShot,
}

/// Frame rate detector accumulating samples from every source.
#[derive(Debug, Default)]
pub struct RateDetector {
    stats: [SourceStat; 4],
    // stamp to detect when dump_vdec_blocks stays still
    blocks_stamp: u64,
}

impl RateDetector {
    pub fn reset(&mut self) {
        *self = Default::default();
    }

    /// Account a sample. A sample which does not agree with the previous
    /// one from the same source restarts that source from scratch. The
    /// per-source collection window is extended by `hold_ms` on every
    /// sample.
    pub fn accumulate(&mut self, hz: i32, src: RateSource, now: i64, hold_ms: i64) {
        let stat = &mut self.stats[src as usize];

        if stat.weight != 0 && !hz_close(hz, stat.hz) {
            debug!("resetting {:?} weight", src);
            stat.weight = 0;
        }

        stat.hz = hz;
        stat.weight += src.weight();
        stat.timeout.arm(now, hold_ms);

        debug!(
            "accumulating {}fps src {:?} weight {} total {}",
            Hz(hz),
            src,
            src.weight(),
            stat.weight
        );
    }

    /// Account a dump_vdec_blocks observation. The sample only counts when
    /// the decoder made progress since the last observation and covers
    /// enough frames and time to be meaningful.
    pub fn feed_blocks(&mut self, stats: &BlocksStats, now: i64, hold_ms: i64) -> bool {
        if stats.frames < 5 || stats.dur_ms < 120 || self.blocks_stamp == stats.dsize {
            return false;
        }

        self.blocks_stamp = stats.dsize;

        let frames = stats.frames as i64;
        let dur = stats.dur_ms as i64;
        let hz = hz_round(((frames * 256000 + dur / 2) / dur) as i32);
        if hz == 0 {
            return false;
        }

        debug!(
            "{} frames played over last {}ms at {}fps",
            stats.frames, stats.dur_ms, Hz(hz)
        );
        self.accumulate(hz, RateSource::Blocks, now, hold_ms);
        true
    }

    /// Guess the best rate from the accumulated data. Without `last_chance`
    /// only sources whose collection window is still open are considered
    /// and full confidence is required; on the last chance any source at
    /// half confidence is taken.
    pub fn best(&self, last_chance: bool, now: i64) -> i32 {
        let accept_weight = if last_chance {
            ACCEPT_HZ_WEIGHT / 2
        } else {
            ACCEPT_HZ_WEIGHT
        };

        let mut best_stat: Option<&SourceStat> = None;
        let mut best_prio = 0;

        for &src in RateSource::ALL.iter() {
            if best_prio > src.weight() {
                continue;
            }

            let stat = &self.stats[src as usize];
            if stat.weight == 0 {
                continue;
            }

            if last_chance {
                trace!("last chance src {:?} weight {}", src, stat.weight);
                if stat.weight < accept_weight {
                    continue;
                }
            } else if stat.timeout.left(now) <= 0 {
                continue;
            }

            best_prio = src.weight();
            best_stat = Some(stat);
        }

        match best_stat {
            Some(stat) if stat.weight >= accept_weight => {
                trace!("best {}Hz weight {}", Hz(stat.hz), stat.weight);
                stat.hz
            }
            _ => 0,
        }
    }

    /// Shift the per-source collection windows after a clock jump.
    pub fn adjust(&mut self, delta: i64) {
        for stat in self.stats.iter_mut() {
            stat.timeout.adjust(delta);
        }
    }
}

fn find_u64(line: &str, prefix: &str) -> Option<u64> {
    let pos = line.find(prefix)? + prefix.len();
    let rest = &line[pos..];
    let end = rest
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or_else(|| rest.len());
    if end == 0 {
        return None;
    }
    rest[..end].parse().ok()
}

/// One observation of the decoder block counters.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BlocksStats {
    /// Total amount of decoded data, used as a progress stamp.
    pub dsize: u64,
    /// Frames decoded within the measurement window.
    pub frames: u32,
    /// Length of the measurement window in milliseconds.
    pub dur_ms: u32,
}

/// Extract the decoder counters from the single line of dump_vdec_blocks.
pub fn parse_blocks(line: &str) -> Option<BlocksStats> {
    let dsize = find_u64(line, ",dsize=")?;
    let frames = find_u64(line, ",frames:")? as u32;
    let dur_ms = find_u64(line, ",dur:")? as u32;

    trace!("dsize {} frames {} dur {}", dsize, frames, dur_ms);

    Some(BlocksStats {
        dsize,
        frames,
        dur_ms,
    })
}

/// Derive the frame rate from the pts dump of the decoder.
///
/// Up to 64 stamps are collected and sorted, then the inter-frame deltas
/// are averaged. A delta about twice the base is a skipped frame and counts
/// for two; a delta about half the base means all the previous deltas were
/// skips; a delta more than 1500 us off the base is discarded entirely.
pub fn parse_chunks(text: &str) -> Option<i32> {
    if text.len() < 100 {
        return None;
    }

    let mut pts: Vec<i64> = Vec::with_capacity(64);
    let mut base64 = 0;

    for line in text.lines() {
        if let Some(pts64) = find_u64(line, "pts64=") {
            if pts.is_empty() {
                base64 = pts64;
            }
            pts.push(pts64.wrapping_sub(base64) as i64);
            if pts.len() >= 64 {
                break;
            }
        }
    }

    if pts.len() < 5 {
        return None;
    }

    pts.sort_unstable();

    // transform to usecs per frame
    let deltas: Vec<i64> = pts.windows(2).map(|w| w[1] - w[0]).collect();

    let mut base_pts = deltas[0];
    if base_pts <= 0 {
        return None;
    }

    let mut avg_pts = base_pts;
    let mut avg_count: i64 = 1;
    for &delta in deltas[1..].iter() {
        let ratio = 128 * delta / base_pts;
        if (247..=264).contains(&ratio) {
            // this delta covers a skipped frame
            avg_count += 1;
        } else if (62..=66).contains(&ratio) {
            // all the previous deltas were frame skips
            avg_count *= 2;
            base_pts = delta;
        } else if delta > base_pts + 1500 || delta < base_pts - 1500 {
            continue;
        }
        avg_count += 1;
        avg_pts += delta;
    }

    if avg_count < 3 {
        return None;
    }

    trace!("{} pts in {} us, base pts {}", avg_count, avg_pts, base_pts);

    let dur_ms = avg_pts / 1000;
    if dur_ms <= 0 {
        return None;
    }

    let hz = hz_round(((avg_count * 256 * 1000) / dur_ms) as i32);
    if hz == 0 {
        return None;
    }

    Some(hz)
}

/// Derive the frame rate from the colon-separated vdec_status attribute.
///
/// The `frame dur` value (in 1/96000 second units) is preferred since it
/// carries sub-fps precision; the integer `frame rate` is only trusted when
/// it spells one of the standard rates.
pub fn parse_vdec_status(text: &str) -> Option<i32> {
    let mut fps = 0;
    let mut frame_dur = 0;

    for line in text.lines() {
        let (attr, val) = match line.split_once(':') {
            Some((attr, val)) => (attr.trim(), val.trim()),
            None => continue,
        };

        trace!("attr [{}] val [{}]", attr, val);

        if attr == "frame rate" {
            let end = val
                .find(|c: char| !c.is_ascii_digit())
                .unwrap_or_else(|| val.len());
            let tail = val[end..].trim();
            if tail.is_empty() || tail == "fps" {
                fps = val[..end].parse().unwrap_or(0);
            } else {
                debug!("garbage at end of 'frame rate': [{}]", tail);
            }
        } else if attr == "frame dur" {
            frame_dur = val.parse().unwrap_or_else(|_| {
                debug!("garbage at end of 'frame dur': [{}]", val);
                0
            });
        }
    }

    let mut hz = 0;
    if frame_dur != 0 {
        hz = hz_round(hint_period_to_hz(frame_dur));
    }

    if hz == 0 && fps != 0 {
        hz = match fps {
            23 => (2997 * 256 + 62) / 125,
            29 => (2997 * 256 + 50) / 100,
            59 => (5994 * 256 + 50) / 100,
            24 | 25 | 30 | 50 | 60 => fps << 8,
            _ => {
                debug!("ignoring non-standard frame rate {} fps", fps);
                0
            }
        };
    }

    if hz != 0 {
        Some(hz)
    } else {
        None
    }
}
