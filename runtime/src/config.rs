// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (c) 2024 Takashi Sakamoto

//! Service configuration.
//!
//! The configuration file is a flat list of `key = value` lines with `#`
//! comments. The file is read once into a map and snapshotted into a typed
//! structure; the scheduler polls the file modification time and restarts
//! the service cleanly when it changes.

use {
    amlogic_afr_protocols::{Error, Hz, Result},
    std::{collections::HashMap, fs, path::Path, path::PathBuf, time::SystemTime},
    tracing::{debug, info},
};

const DEFAULT_HDMI_DEV: &str = "/sys/class/amhdmitx/amhdmitx0";
const DEFAULT_HDMI_STATE: &str = "/sys/class/switch/hdmi/state";
const DEFAULT_VIDEO_MODE: &str = "/sys/class/display/mode";
const DEFAULT_VDEC_SYSFS: &str = "/sys/class/vdec";
const DEFAULT_SWITCH_DELAY_ON: i64 = 250;
const DEFAULT_SWITCH_DELAY_OFF: i64 = 5000;
const DEFAULT_SWITCH_DELAY_RETRY: i64 = 500;
const DEFAULT_SWITCH_TIMEOUT: i64 = 3000;
const DEFAULT_SWITCH_BLACKOUT: i64 = 50;
const DEFAULT_SWITCH_IGNORE: i64 = 0;
const DEFAULT_SWITCH_HDMI: i64 = 300;

/// Parsed `key = value` content of a configuration file.
pub struct Ini {
    entries: HashMap<String, String>,
}

impl Ini {
    pub fn load(path: &Path) -> Result<Ini> {
        let text = fs::read_to_string(path)
            .map_err(|err| Error::transient_io(&path.display().to_string(), err))?;

        let mut entries = HashMap::new();
        for line in text.lines() {
            let line = match line.find('#') {
                Some(pos) => &line[..pos],
                None => line,
            };
            if let Some((key, value)) = line.split_once('=') {
                entries.insert(key.trim().to_string(), value.trim().to_string());
            }
        }

        Ok(Ini { entries })
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(|v| v.as_str())
    }

    fn get_str(&self, key: &str, default: &str) -> String {
        self.get(key).unwrap_or(default).to_string()
    }

    fn get_int(&self, key: &str, default: i64) -> i64 {
        self.get(key)
            .and_then(|v| v.parse().ok())
            .unwrap_or(default)
    }

    fn get_list(&self, key: &str) -> Vec<String> {
        self.get(key)
            .map(|v| v.split_whitespace().map(|s| s.to_string()).collect())
            .unwrap_or_default()
    }
}

/// How to resolve the fractional/integer variant of the selected mode.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FractUse {
    /// Pick whichever variant is closer to the detected rate.
    Auto,
    ForceFractional,
    ForceInteger,
}

/// Typed snapshot of the configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub path: PathBuf,
    pub enable: bool,
    pub hdmi_dev: String,
    pub hdmi_state: String,
    pub mode_path: String,
    pub vdec_sysfs: String,
    pub mode_prefer_exact: bool,
    pub mode_use_fract: FractUse,
    pub mode_blacklist_rates: Vec<i32>,
    pub mode_extra: Vec<String>,
    pub switch_delay_on: i64,
    pub switch_delay_off: i64,
    pub switch_delay_retry: i64,
    pub switch_timeout: i64,
    pub switch_blackout: i64,
    pub switch_ignore: i64,
    pub switch_hdmi: i64,
    pub filter_frhint: Option<String>,
    pub filter_vdec: Option<String>,
    pub filter_hdmi: Option<String>,
    pub vdec_blacklist: Vec<String>,
    pub frhint_vdec_blacklist: Vec<String>,
    pub cs_list_path: Option<String>,
    pub cs_path: Option<String>,
    pub cs_select: Option<String>,
    pub log_enable: bool,
    pub log_file: Option<String>,
}

impl Config {
    pub fn load(path: &Path) -> Result<Config> {
        info!("loading config file '{}'", path.display());
        let ini = Ini::load(path)?;
        Ok(Config::from_ini(path, &ini))
    }

    fn from_ini(path: &Path, ini: &Ini) -> Config {
        let cfg = Config {
            path: path.to_path_buf(),
            enable: ini.get_int("enable", 1) != 0,
            hdmi_dev: ini.get_str("hdmi.sysfs", DEFAULT_HDMI_DEV),
            hdmi_state: ini.get_str("hdmi.state", DEFAULT_HDMI_STATE),
            mode_path: ini.get_str("mode.path", DEFAULT_VIDEO_MODE),
            vdec_sysfs: ini.get_str("vdec.sysfs", DEFAULT_VDEC_SYSFS),
            mode_prefer_exact: ini.get_int("mode.prefer.exact", 0) != 0,
            mode_use_fract: match ini.get_int("mode.use.fract", 0) {
                1 => FractUse::ForceFractional,
                2 => FractUse::ForceInteger,
                _ => FractUse::Auto,
            },
            mode_blacklist_rates: blacklist_rates(ini.get("mode.blacklist.rates")),
            mode_extra: ini.get_list("mode.extra"),
            switch_delay_on: ini.get_int("switch.delay.on", DEFAULT_SWITCH_DELAY_ON),
            switch_delay_off: ini.get_int("switch.delay.off", DEFAULT_SWITCH_DELAY_OFF),
            switch_delay_retry: ini.get_int("switch.delay.retry", DEFAULT_SWITCH_DELAY_RETRY),
            switch_timeout: ini.get_int("switch.timeout", DEFAULT_SWITCH_TIMEOUT),
            switch_blackout: ini.get_int("switch.blackout", DEFAULT_SWITCH_BLACKOUT),
            switch_ignore: ini.get_int("switch.ignore", DEFAULT_SWITCH_IGNORE),
            switch_hdmi: ini.get_int("switch.hdmi", DEFAULT_SWITCH_HDMI),
            filter_frhint: ini.get("uevent.filter.frhint").map(|s| s.to_string()),
            filter_vdec: ini.get("uevent.filter.vdec").map(|s| s.to_string()),
            filter_hdmi: ini.get("uevent.filter.hdmi").map(|s| s.to_string()),
            vdec_blacklist: ini.get_list("vdec.blacklist"),
            frhint_vdec_blacklist: ini.get_list("frhint.vdec.blacklist"),
            cs_list_path: ini.get("cs.list.path").map(|s| s.to_string()),
            cs_path: ini.get("cs.path").map(|s| s.to_string()),
            cs_select: ini.get("cs.select").map(|s| s.to_string()),
            log_enable: ini.get_int("log.enable", 1) != 0,
            log_file: ini.get("log.file").map(|s| s.to_string()),
        };

        info!(
            "refresh rate selection: use fractional {:?}, exact {}",
            cfg.mode_use_fract, cfg.mode_prefer_exact
        );
        info!(
            "switch delays: on {}, off {}, retry {} ms",
            cfg.switch_delay_on, cfg.switch_delay_off, cfg.switch_delay_retry
        );
        info!(
            "timeout {} ms, blackout {} ms, ignore {} ms",
            cfg.switch_timeout, cfg.switch_blackout, cfg.switch_ignore
        );

        cfg
    }
}

fn blacklist_rates(value: Option<&str>) -> Vec<i32> {
    let mut rates = Vec::new();

    if let Some(value) = value {
        info!("loading blacklisted rates");
        for token in value.split_whitespace() {
            match token.parse::<f64>() {
                Ok(rate) if (1.0..=1000.0).contains(&rate) => {
                    let rate = (256.0 * rate + 0.5) as i32;
                    debug!("+ {}Hz", Hz(rate));
                    rates.push(rate);
                }
                _ => debug!("ignoring unusable blacklist rate: {}", token),
            }
        }
    }

    rates
}

/// The modification time of a file, used to detect config changes.
pub fn file_mtime(path: &Path) -> Option<SystemTime> {
    fs::metadata(path).and_then(|meta| meta.modified()).ok()
}
