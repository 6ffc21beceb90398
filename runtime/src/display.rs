// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (c) 2024 Takashi Sakamoto

//! Catalog of display modes supported by the HDMI transmitter, and the
//! actual mode switching.

use {
    amlogic_afr_protocols::{
        mode::{DisplayMode, NULL_MODE_NAME},
        Result,
    },
    crate::{colorspace::ColorSpace, config::Config, hdcp::Hdcp, sysfs},
    tracing::{debug, info, warn},
};

pub struct DisplayCatalog {
    hdmi_dev: String,
    mode_path: String,
    modes: Vec<DisplayMode>,
    current: Option<DisplayMode>,
    blackened: bool,
}

impl DisplayCatalog {
    pub fn new(cfg: &Config) -> DisplayCatalog {
        DisplayCatalog {
            hdmi_dev: cfg.hdmi_dev.clone(),
            mode_path: cfg.mode_path.clone(),
            modes: Vec::new(),
            current: None,
            blackened: false,
        }
    }

    pub fn modes(&self) -> &[DisplayMode] {
        &self.modes
    }

    pub fn current(&self) -> Option<&DisplayMode> {
        self.current.as_ref()
    }

    pub fn is_blackened(&self) -> bool {
        self.blackened
    }

    /// Register a mode unless an equivalent one is listed already. Only
    /// non-fractional modes are kept; the fractional variant is selected at
    /// switch time.
    pub fn add(&mut self, mode: &DisplayMode) {
        let mut mode = mode.clone();
        mode.fractional = false;

        if self.modes.iter().any(|m| *m == mode) {
            return;
        }

        debug!("{}", mode);
        self.modes.push(mode);
    }

    /// Rebuild the mode list from the capability attribute, the current
    /// mode and the extra modes named in the configuration.
    pub fn refresh(&mut self, extra: &[String]) -> Result<()> {
        self.modes.clear();

        let caps = sysfs::read_attr(&self.hdmi_dev, "disp_cap")?;

        debug!("parsing supported video modes");
        for token in caps.split_whitespace() {
            let token = token.strip_suffix('*').unwrap_or(token);
            match DisplayMode::parse(token) {
                Ok(mode) => self.add(&mode),
                Err(_) => debug!("{}: unrecognized mode", token),
            }
        }

        self.read_current();

        // on some configurations the current mode is not listed in disp_cap
        if let Some(current) = self.current.clone() {
            self.add(&current);
        }

        for desc in extra {
            match DisplayMode::parse(desc) {
                Ok(mode) => self.add(&mode),
                Err(_) => debug!("{}: unrecognized extra mode", desc),
            }
        }

        Ok(())
    }

    /// Drop the mode list, e.g. when the HDMI link goes down.
    pub fn clear(&mut self) {
        self.modes.clear();
    }

    /// Read back the active mode and the fractional rate policy.
    pub fn read_current(&mut self) {
        let text = match sysfs::read(&self.mode_path) {
            Ok(text) => text,
            Err(_) => return,
        };

        if text == NULL_MODE_NAME {
            info!("current video mode is null");
            return;
        }

        let mut mode = match DisplayMode::parse(&text) {
            Ok(mode) => mode,
            Err(_) => {
                info!("failed to recognize current video mode '{}'", text);
                return;
            }
        };

        match sysfs::read_attr(&self.hdmi_dev, "frac_rate_policy") {
            Ok(policy) => mode.fractional = policy.parse::<i32>().unwrap_or(0) != 0,
            Err(_) => warn!("failed to read frac_rate_policy"),
        }

        self.current = Some(mode);
    }

    /// Switch the display to `mode`. Nothing is written when the display
    /// already runs an equal mode, unless forced or blackened. A change of
    /// the fractional policy under an unchanged mode name must pass through
    /// the null mode to take effect.
    pub fn switch_to(&mut self, mode: &DisplayMode, force: bool, cs: &ColorSpace, hdcp: &Hdcp) {
        if !self.blackened && !force {
            if let Some(current) = self.current.as_ref() {
                if current == mode {
                    info!("display mode is already {}", mode);
                    return;
                }
            }
        }

        let fractional_flip = self.current.as_ref().map_or(false, |current| {
            current.name == mode.name && current.fractional != mode.fractional
        });
        if force || fractional_flip {
            self.write_null();
        }

        info!("switching display mode to {}", mode);

        let policy = if mode.fractional { "1" } else { "0" };
        let _ = sysfs::write_attr(&self.hdmi_dev, "frac_rate_policy", policy);

        cs.apply(&mode.name);

        let _ = sysfs::write(&self.mode_path, &mode.name);
        self.current = Some(mode.clone());
        self.blackened = false;

        hdcp.restore();
    }

    /// Blank the display through the null mode.
    pub fn blackout(&mut self) {
        self.write_null();
    }

    fn write_null(&mut self) {
        if self.blackened {
            return;
        }

        debug!("blackout screen");
        let _ = sysfs::write(&self.mode_path, NULL_MODE_NAME);
        self.blackened = true;
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::fs;

    struct Fixture {
        dir: tempfile::TempDir,
        cfg: Config,
    }

    fn fixture(disp_cap: &str, mode: &str) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("disp_cap"), disp_cap).unwrap();
        fs::write(dir.path().join("frac_rate_policy"), "0").unwrap();
        fs::write(dir.path().join("mode"), mode).unwrap();
        fs::write(dir.path().join("state"), "1").unwrap();

        let ini = dir.path().join("afr.ini");
        fs::write(
            &ini,
            format!(
                "hdmi.sysfs = {0}\n\
                 hdmi.state = {0}/state\n\
                 mode.path = {0}/mode\n\
                 vdec.sysfs = {0}\n",
                dir.path().display()
            ),
        )
        .unwrap();
        let cfg = Config::load(&ini).unwrap();

        Fixture { dir, cfg }
    }

    fn mode_file(fx: &Fixture) -> String {
        fs::read_to_string(fx.dir.path().join("mode")).unwrap()
    }

    fn frac_file(fx: &Fixture) -> String {
        fs::read_to_string(fx.dir.path().join("frac_rate_policy")).unwrap()
    }

    #[test]
    fn refresh_parses_capabilities() {
        let fx = fixture("1080p60hz*\n1080p24hz\n2160p30hz\nbogus\n", "1080p60hz");
        let mut catalog = DisplayCatalog::new(&fx.cfg);
        catalog.refresh(&[]).unwrap();

        let names: Vec<&str> = catalog.modes().iter().map(|m| m.name.as_str()).collect();
        assert_eq!(names, vec!["1080p60hz", "1080p24hz", "2160p30hz"]);
        assert_eq!(catalog.current().unwrap().name, "1080p60hz");
        assert!(!catalog.current().unwrap().fractional);
    }

    #[test]
    fn refresh_registers_unlisted_current_and_extras() {
        let fx = fixture("1080p60hz\n", "1080p50hz");
        let mut catalog = DisplayCatalog::new(&fx.cfg);
        catalog.refresh(&["720p60hz".to_string()]).unwrap();

        let names: Vec<&str> = catalog.modes().iter().map(|m| m.name.as_str()).collect();
        assert_eq!(names, vec!["1080p60hz", "1080p50hz", "720p60hz"]);
    }

    #[test]
    fn add_ignores_fractional_duplicates() {
        let fx = fixture("1080p60hz\n", "1080p60hz");
        let mut catalog = DisplayCatalog::new(&fx.cfg);
        catalog.refresh(&[]).unwrap();
        assert_eq!(catalog.modes().len(), 1);

        let mut dup = DisplayMode::parse("1080p60hz").unwrap();
        dup.fractional = true;
        catalog.add(&dup);
        assert_eq!(catalog.modes().len(), 1);
    }

    #[test]
    fn switch_writes_policy_and_mode() {
        let fx = fixture("1080p60hz*\n1080p24hz\n", "1080p60hz");
        let mut catalog = DisplayCatalog::new(&fx.cfg);
        catalog.refresh(&[]).unwrap();

        let cs = ColorSpace::new(&fx.cfg);
        let hdcp = Hdcp::probe(&fx.cfg);

        let mut target = DisplayMode::parse("1080p24hz").unwrap();
        target.fractional = true;
        catalog.switch_to(&target, false, &cs, &hdcp);

        assert_eq!(mode_file(&fx), "1080p24hz");
        assert_eq!(frac_file(&fx), "1");
        assert_eq!(catalog.current().unwrap(), &target);
        assert!(!catalog.is_blackened());
    }

    #[test]
    fn switch_to_equal_mode_is_a_noop() {
        let fx = fixture("1080p60hz*\n", "1080p60hz");
        let mut catalog = DisplayCatalog::new(&fx.cfg);
        catalog.refresh(&[]).unwrap();

        fs::write(fx.dir.path().join("mode"), "sentinel").unwrap();
        let target = DisplayMode::parse("1080p60hz").unwrap();
        let cs = ColorSpace::new(&fx.cfg);
        let hdcp = Hdcp::probe(&fx.cfg);
        catalog.switch_to(&target, false, &cs, &hdcp);
        assert_eq!(mode_file(&fx), "sentinel");

        // forced switches always write
        catalog.switch_to(&target, true, &cs, &hdcp);
        assert_eq!(mode_file(&fx), "1080p60hz");
    }

    #[test]
    fn fractional_flip_passes_through_null() {
        let fx = fixture("1080p60hz*\n", "1080p60hz");
        let mut catalog = DisplayCatalog::new(&fx.cfg);
        catalog.refresh(&[]).unwrap();

        let cs = ColorSpace::new(&fx.cfg);
        let hdcp = Hdcp::probe(&fx.cfg);
        let mut target = DisplayMode::parse("1080p60hz").unwrap();
        target.fractional = true;

        catalog.switch_to(&target, false, &cs, &hdcp);
        // the final state is the new mode, after a null transition
        assert_eq!(mode_file(&fx), "1080p60hz");
        assert_eq!(frac_file(&fx), "1");
    }

    #[test]
    fn blackout_is_idempotent() {
        let fx = fixture("1080p60hz*\n", "1080p60hz");
        let mut catalog = DisplayCatalog::new(&fx.cfg);
        catalog.refresh(&[]).unwrap();

        catalog.blackout();
        assert!(catalog.is_blackened());
        assert_eq!(mode_file(&fx), "null");

        fs::write(fx.dir.path().join("mode"), "sentinel").unwrap();
        catalog.blackout();
        assert_eq!(mode_file(&fx), "sentinel");
    }
}
