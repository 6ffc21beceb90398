// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (c) 2024 Takashi Sakamoto

//! Colorspace sub-selection.
//!
//! Next to the mode name the HDMI transmitter takes a colorspace attribute
//! of the shape `444,8bit,full`. The configuration may pin colorspaces to
//! mode names with `cs.select` filters (`moderegex=params`); on every mode
//! switch the first filter matching the new mode name, restricted to what
//! the display declares as supported, is merged over the current setting.
//! Without a match the setting captured at startup is put back.

use {
    crate::{config::Config, sysfs},
    regex::Regex,
    std::fmt,
    tracing::{debug, info, warn},
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Space {
    Rgb444,
    Yuv422,
    Yuv444,
    Yuv420,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Depth {
    B24,
    B30,
    B36,
    B48,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Range {
    Limited,
    Full,
}

fn parse_space(token: &str) -> Option<Space> {
    match token {
        "rgb" => Some(Space::Rgb444),
        "422" => Some(Space::Yuv422),
        "444" => Some(Space::Yuv444),
        "420" => Some(Space::Yuv420),
        _ => None,
    }
}

fn parse_depth(token: &str) -> Option<Depth> {
    match token {
        "8bit" => Some(Depth::B24),
        "10bit" => Some(Depth::B30),
        "12bit" => Some(Depth::B36),
        "16bit" => Some(Depth::B48),
        _ => None,
    }
}

fn parse_range(token: &str) -> Option<Range> {
    match token {
        "limit" => Some(Range::Limited),
        "full" => Some(Range::Full),
        _ => None,
    }
}

/// A colorspace description; unset fields act as wildcards.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ColorParams {
    space: Option<Space>,
    depth: Option<Depth>,
    range: Option<Range>,
}

impl ColorParams {
    /// Parse a comma-separated parameter list like `420,10bit,limit`. Every
    /// token must spell a known space, depth or range.
    fn parse(text: &str) -> Option<ColorParams> {
        let mut params = ColorParams::default();

        for token in text.split(',') {
            let token = token.trim();
            if token.is_empty() {
                continue;
            }
            if let Some(space) = parse_space(token) {
                params.space = Some(space);
            } else if let Some(depth) = parse_depth(token) {
                params.depth = Some(depth);
            } else if let Some(range) = parse_range(token) {
                params.range = Some(range);
            } else {
                return None;
            }
        }

        Some(params)
    }

    fn merge(self, over: ColorParams) -> ColorParams {
        ColorParams {
            space: over.space.or(self.space),
            depth: over.depth.or(self.depth),
            range: over.range.or(self.range),
        }
    }

    /// Whether a display-supported entry admits these parameters; fields
    /// left unset on either side do not constrain.
    fn admitted_by(&self, supported: &ColorParams) -> bool {
        fn compatible<T: PartialEq>(a: Option<T>, b: Option<T>) -> bool {
            match (a, b) {
                (Some(a), Some(b)) => a == b,
                _ => true,
            }
        }

        compatible(self.space, supported.space)
            && compatible(self.depth, supported.depth)
            && compatible(self.range, supported.range)
    }
}

impl fmt::Display for ColorParams {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let mut sep = "";
        if let Some(space) = self.space {
            let name = match space {
                Space::Rgb444 => "rgb",
                Space::Yuv422 => "422",
                Space::Yuv444 => "444",
                Space::Yuv420 => "420",
            };
            write!(f, "{}", name)?;
            sep = ",";
        }
        if let Some(depth) = self.depth {
            let name = match depth {
                Depth::B24 => "8bit",
                Depth::B30 => "10bit",
                Depth::B36 => "12bit",
                Depth::B48 => "16bit",
            };
            write!(f, "{}{}", sep, name)?;
            sep = ",";
        }
        if let Some(range) = self.range {
            let name = match range {
                Range::Limited => "limit",
                Range::Full => "full",
            };
            write!(f, "{}{}", sep, name)?;
        }
        Ok(())
    }
}

fn fallback_params() -> ColorParams {
    ColorParams {
        space: Some(Space::Yuv444),
        depth: Some(Depth::B24),
        range: Some(Range::Full),
    }
}

/// Mode-name driven colorspace selection. Inert unless both attribute
/// paths are configured.
pub struct ColorSpace {
    list_path: Option<String>,
    path: Option<String>,
    filters: Vec<(Regex, ColorParams)>,
    supported: Vec<ColorParams>,
    saved_default: Option<String>,
    override_params: Option<ColorParams>,
}

impl ColorSpace {
    pub fn new(cfg: &Config) -> ColorSpace {
        let mut cs = ColorSpace {
            list_path: cfg.cs_list_path.clone(),
            path: cfg.cs_path.clone(),
            filters: Vec::new(),
            supported: Vec::new(),
            saved_default: None,
            override_params: None,
        };

        if cs.list_path.is_none() || cs.path.is_none() {
            return cs;
        }

        if let Some(select) = cfg.cs_select.as_deref() {
            info!("loading colorspace selector");
            for token in select.split_whitespace() {
                let (rex, params) = match token.split_once('=') {
                    Some(pair) => pair,
                    None => {
                        warn!("invalid colorspace selector: {}", token);
                        continue;
                    }
                };

                let params = match ColorParams::parse(params) {
                    Some(params) => params,
                    None => {
                        warn!("ignoring invalid colorspace: {}", params);
                        continue;
                    }
                };

                match Regex::new(&format!("^(?:{})$", rex)) {
                    Ok(rex) => {
                        debug!("+ [{}] if mode matches {}", params, rex);
                        cs.filters.push((rex, params));
                    }
                    Err(err) => warn!("ignoring bad regex: {}: {}", rex, err),
                }
            }
        }

        cs.refresh();
        cs
    }

    /// Reload the colorspaces supported by the display and remember the
    /// current setting as the default to restore.
    pub fn refresh(&mut self) {
        self.supported.clear();

        let (list_path, path) = match (self.list_path.as_deref(), self.path.as_deref()) {
            (Some(list_path), Some(path)) => (list_path, path),
            _ => return,
        };

        let list = match sysfs::read(list_path) {
            Ok(list) => list,
            Err(_) => return,
        };

        info!("loading available colorspaces");
        for token in list.split_whitespace() {
            match ColorParams::parse(token) {
                Some(params) => {
                    debug!("+ {}", params);
                    self.supported.push(params);
                }
                None => warn!("ignoring invalid colorspace: {}", token),
            }
        }

        self.saved_default = sysfs::read(path).ok();
    }

    /// Override the filters from the API; an empty spec restores the
    /// configured behavior.
    pub fn set_override(&mut self, spec: &str) {
        let spec = spec.trim();
        if spec.is_empty() {
            self.override_params = None;
            return;
        }

        match ColorParams::parse(spec) {
            Some(params) => self.override_params = Some(params),
            None => warn!("ignoring invalid colorspace override: {}", spec),
        }
    }

    fn admitted(&self, params: &ColorParams) -> bool {
        self.supported.iter().any(|s| params.admitted_by(s))
    }

    /// Write the colorspace for the given mode name.
    pub fn apply(&self, mode_name: &str) {
        let path = match self.path.as_deref() {
            Some(path) => path,
            None => return,
        };

        let default_params = self
            .saved_default
            .as_deref()
            .and_then(ColorParams::parse)
            .unwrap_or_else(fallback_params);

        let mut current = default_params;
        if let Ok(text) = sysfs::read(path) {
            if let Some(params) = ColorParams::parse(&text) {
                current = current.merge(params);
            }
        }

        let selected = self
            .override_params
            .iter()
            .chain(
                self.filters
                    .iter()
                    .filter(|(rex, _)| rex.is_match(mode_name))
                    .map(|(_, params)| params),
            )
            .find(|params| self.admitted(*params));

        let chosen = match selected {
            Some(params) => current.merge(*params),
            None => default_params,
        };

        info!("setting colorspace to {}", chosen);
        let _ = sysfs::write(path, &chosen.to_string());
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::fs;

    #[test]
    fn params_parse_and_format() {
        let params = ColorParams::parse("420,10bit,limit").unwrap();
        assert_eq!(params.to_string(), "420,10bit,limit");

        let params = ColorParams::parse("rgb").unwrap();
        assert_eq!(params.to_string(), "rgb");

        assert!(ColorParams::parse("420,funky").is_none());
    }

    #[test]
    fn merge_overrides_set_fields_only() {
        let base = ColorParams::parse("444,8bit,full").unwrap();
        let over = ColorParams::parse("420").unwrap();
        assert_eq!(base.merge(over).to_string(), "420,8bit,full");
    }

    #[test]
    fn wildcard_admission() {
        let supported = ColorParams::parse("420,10bit").unwrap();
        assert!(ColorParams::parse("420").unwrap().admitted_by(&supported));
        assert!(ColorParams::parse("420,10bit,limit")
            .unwrap()
            .admitted_by(&supported));
        assert!(!ColorParams::parse("444").unwrap().admitted_by(&supported));
    }

    fn config_with_cs(dir: &std::path::Path, select: &str) -> Config {
        let path = dir.join("afr.ini");
        fs::write(
            &path,
            format!(
                "cs.list.path = {}\ncs.path = {}\ncs.select = {}\n",
                dir.join("cs_list").display(),
                dir.join("cs").display(),
                select
            ),
        )
        .unwrap();
        Config::load(&path).unwrap()
    }

    #[test]
    fn filter_applies_for_matching_mode() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("cs_list"), "420,8bit 420,10bit 444,8bit\n").unwrap();
        fs::write(dir.path().join("cs"), "444,8bit,full\n").unwrap();

        let cfg = config_with_cs(dir.path(), "2160p.*=420,10bit");
        let cs = ColorSpace::new(&cfg);

        cs.apply("2160p60hz");
        let written = fs::read_to_string(dir.path().join("cs")).unwrap();
        assert_eq!(written, "420,10bit,full");

        // non-matching mode restores the saved default
        cs.apply("1080p60hz");
        let written = fs::read_to_string(dir.path().join("cs")).unwrap();
        assert_eq!(written, "444,8bit,full");
    }

    #[test]
    fn unsupported_selection_falls_back() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("cs_list"), "444,8bit\n").unwrap();
        fs::write(dir.path().join("cs"), "444,8bit,full\n").unwrap();

        let cfg = config_with_cs(dir.path(), "2160p.*=420,10bit");
        let cs = ColorSpace::new(&cfg);

        cs.apply("2160p60hz");
        let written = fs::read_to_string(dir.path().join("cs")).unwrap();
        assert_eq!(written, "444,8bit,full");
    }

    #[test]
    fn inert_without_paths() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("afr.ini");
        fs::write(&path, "enable = 1\n").unwrap();
        let cfg = Config::load(&path).unwrap();

        let cs = ColorSpace::new(&cfg);
        cs.apply("1080p60hz");
    }
}
