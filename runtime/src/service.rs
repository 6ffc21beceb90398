// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (c) 2024 Takashi Sakamoto

//! The scheduler: one poll loop multiplexing the kernel uevent socket, the
//! API socket and the one-shot timers, driving the switch state machine.
//!
//! Mode switching is debounced: a burst of uevents re-arms a short timer
//! and only its expiry acts. While the detection of the movie frame rate
//! is in progress the switch timer retries on a short period until the
//! estimator commits a rate or the overall detection deadline passes.

use {
    amlogic_afr_protocols::{
        mode::{select_mode, DisplayMode},
        mstime::{MsClock, OneShot},
        rate::{self, RateDetector, RateSource},
        uevent::{Uevent, UeventFilter},
        Error, Hz, Result,
    },
    crate::{
        apisock::{self, ApiCommand, ApiSock},
        colorspace::ColorSpace,
        config::{self, Config, FractUse},
        display::DisplayCatalog,
        hdcp::Hdcp,
        netlink::UeventSocket,
        shmem::{self, ServiceStatus, ShmemWriter},
        sysfs,
    },
    nix::poll::{poll, PollFd, PollFlags},
    std::{
        fs,
        net::SocketAddr,
        os::unix::io::AsRawFd,
        path::Path,
        sync::atomic::{AtomicBool, Ordering},
        time::SystemTime,
    },
    tracing::{debug, info, trace, warn},
};

/// Period of config file timestamp checks.
const CONFIG_CHECK_PERIOD: i64 = 5000;

/// Why the scheduler returned.
#[derive(Debug, PartialEq, Eq)]
pub enum Outcome {
    Shutdown,
    /// The config file changed on disk; tear down and start over.
    Reconfigure,
}

#[derive(Default)]
struct SwitchState {
    // true to restore the original display mode, false to match the movie
    restore: bool,
    // desired refresh rate (24.8 fixed-point) if known, 0 if not yet
    hz: i32,
    // the mode to restore when playback ends
    orig_mode: Option<DisplayMode>,
    // active video decoder driver name
    modalias: String,
    // overall frame rate detection deadline
    hz_ost: OneShot,
    detector: RateDetector,
}

#[derive(Default)]
struct HintPromise {
    stamp: OneShot,
    // the declared movie frame rate, 24.8 fixed-point
    fps: i32,
}

pub struct Service {
    cfg: Config,
    clock: MsClock,
    now: i64,
    catalog: DisplayCatalog,
    colorspace: ColorSpace,
    hdcp: Hdcp,
    filter_frhint: Option<UeventFilter>,
    filter_vdec: Option<UeventFilter>,
    filter_hdmi: Option<UeventFilter>,
    state: SwitchState,
    hint: HintPromise,
    ost_switch: OneShot,
    ost_hdmi: OneShot,
    ost_blackout: OneShot,
    ost_config: OneShot,
    ost_off: OneShot,
    uevent_sock: Option<UeventSocket>,
    api: ApiSock,
    shmem: Option<ShmemWriter>,
    status: ServiceStatus,
    status_crc: u32,
    vdec_ok: bool,
    config_mtime: Option<SystemTime>,
}

fn build_filter(name: &str, expr: Option<&str>) -> Option<UeventFilter> {
    let expr = expr?;
    info!("loading filter {}", name);
    match UeventFilter::parse(name, expr) {
        Ok(filter) => Some(filter),
        Err(err) => {
            warn!("{}", err);
            None
        }
    }
}

fn matched(filter: &Option<UeventFilter>) -> bool {
    filter.as_ref().map_or(false, |f| f.satisfied())
}

fn min_time(to: i64, left: i64) -> i64 {
    if to < 0 || (left >= 0 && left < to) {
        left
    } else {
        to
    }
}

impl Service {
    /// Load the configuration and open every resource of the service. A
    /// missing config file or a failure to open the uevent socket is fatal.
    pub fn new(config_path: &Path, ipc_dir: &Path) -> Result<Service> {
        let cfg = Config::load(config_path)?;

        let uevent_sock = UeventSocket::open(16 * 1024).map_err(|err| {
            warn!("failed to open uevent socket");
            err
        })?;

        let shmem = match ShmemWriter::create(ipc_dir) {
            Ok(writer) => Some(writer),
            Err(err) => {
                warn!("failed to open shared status block: {}", err);
                None
            }
        };

        let mut service = Service::assemble(cfg, Some(uevent_sock), ApiSock::new(), shmem);

        let extra = service.cfg.mode_extra.clone();
        if service.catalog.refresh(&extra).is_err() {
            warn!("failed to read the list of supported video modes");
        }

        Ok(service)
    }

    fn assemble(
        cfg: Config,
        uevent_sock: Option<UeventSocket>,
        api: ApiSock,
        shmem: Option<ShmemWriter>,
    ) -> Service {
        let filter_frhint = build_filter("uevent.filter.frhint", cfg.filter_frhint.as_deref());
        let filter_vdec = build_filter("uevent.filter.vdec", cfg.filter_vdec.as_deref());
        let filter_hdmi = build_filter("uevent.filter.hdmi", cfg.filter_hdmi.as_deref());

        let catalog = DisplayCatalog::new(&cfg);
        let colorspace = ColorSpace::new(&cfg);
        let hdcp = Hdcp::probe(&cfg);

        let clock = MsClock::new();
        let now = clock.now();
        let config_mtime = config::file_mtime(&cfg.path);

        Service {
            cfg,
            clock,
            now,
            catalog,
            colorspace,
            hdcp,
            filter_frhint,
            filter_vdec,
            filter_hdmi,
            state: Default::default(),
            hint: Default::default(),
            ost_switch: Default::default(),
            ost_hdmi: Default::default(),
            ost_blackout: Default::default(),
            ost_config: Default::default(),
            ost_off: Default::default(),
            uevent_sock,
            api,
            shmem,
            status: Default::default(),
            status_crc: 0,
            vdec_ok: true,
            config_mtime,
        }
    }

    /// The main loop. Returns when shutdown is flagged or the config file
    /// changed; either way the display is restored first.
    pub fn run(&mut self, shutdown: &AtomicBool) -> Result<Outcome> {
        if self.uevent_sock.is_none() {
            return Err(Error::NotSupported("no uevent socket".to_string()));
        }

        info!("service running");

        self.now = self.clock.now();
        self.ost_switch.disable();
        self.ost_hdmi.disable();
        self.ost_blackout.disable();
        self.ost_off.disable();

        self.ost_config.arm(self.now, 1);
        self.config_mtime = config::file_mtime(&self.cfg.path);

        self.update_stats();

        let mut outcome = Outcome::Shutdown;

        while !shutdown.load(Ordering::Relaxed) {
            self.safe_time_update(0);

            let mut to = self.ost_switch.left(self.now);
            to = min_time(to, self.ost_hdmi.left(self.now));
            to = min_time(to, self.ost_blackout.left(self.now));
            to = min_time(to, self.ost_config.left(self.now));

            // the config timer is normally armed, but never sleep forever
            // or the clock jump detection has no chance to run
            if to < 0 {
                to = 60000;
            }

            self.api.ensure_open();

            let mut uevent_ready = false;
            let mut api_revents = None;
            {
                let mut fds: Vec<PollFd> = Vec::with_capacity(2);
                let uevent_idx = self.uevent_sock.as_ref().map(|sock| {
                    fds.push(PollFd::new(sock.as_raw_fd(), PollFlags::POLLIN));
                    fds.len() - 1
                });
                let api_idx = self.api.raw_fd().map(|fd| {
                    fds.push(PollFd::new(fd, PollFlags::POLLIN));
                    fds.len() - 1
                });

                if let Ok(count) = poll(&mut fds, to.min(60000) as i32) {
                    if count > 0 {
                        uevent_ready = uevent_idx
                            .and_then(|i| fds[i].revents())
                            .map_or(false, |r| r.contains(PollFlags::POLLIN));
                        api_revents = api_idx.and_then(|i| fds[i].revents());
                    }
                }
            }

            // catch system time change events, they break the timers
            self.safe_time_update(to);

            if uevent_ready {
                self.drain_uevents();
            }
            if let Some(revents) = api_revents {
                self.handle_api(revents);
            }

            if let Some(signal) = self.dispatch_timers() {
                outcome = signal;
                break;
            }
        }

        // restore the display, just in case
        self.state.restore = true;
        self.switch_now(false);

        Ok(outcome)
    }

    /// Fire expired timers, in a fixed order so that ties are stable:
    /// blackout, switch, hdmi, config.
    fn dispatch_timers(&mut self) -> Option<Outcome> {
        if self.ost_blackout.expired(self.now) && !self.state.restore {
            self.blackout();
        }

        if self.ost_switch.expired(self.now) {
            self.switch_now(false);
        }

        if self.ost_hdmi.expired(self.now) {
            self.handle_hdmi_change();
        }

        if self.ost_config.expired(self.now) {
            // when other work is pending, don't hog the device
            if !self.ost_blackout.enabled()
                && !self.ost_switch.enabled()
                && !self.ost_hdmi.enabled()
            {
                self.ost_config.arm(self.now, CONFIG_CHECK_PERIOD);
                let mtime = config::file_mtime(&self.cfg.path);
                if mtime.is_some() && mtime != self.config_mtime {
                    info!("config file {} changed, reloading", self.cfg.path.display());
                    return Some(Outcome::Reconfigure);
                }
            } else {
                self.ost_config.arm(self.now, 1000);
            }
        }

        None
    }

    /// Refresh the millisecond stamp. A step far beyond the expected sleep
    /// means the system clock was adjusted or the box was suspended; shift
    /// every armed timer by the excess so none of them fires early.
    fn safe_time_update(&mut self, to: i64) {
        let old = self.now;
        self.now = self.clock.now();

        let delta = self.now - old;
        if delta < 0 || delta > to + 10000 {
            let excess = delta - to;
            info!("system timer changed, adjusting all timers by {} ms", excess);
            self.ost_switch.adjust(excess);
            self.ost_hdmi.adjust(excess);
            self.ost_blackout.adjust(excess);
            self.ost_config.adjust(excess);
            self.ost_off.adjust(excess);
            self.state.hz_ost.adjust(excess);
            self.hint.stamp.adjust(excess);
            self.state.detector.adjust(excess);
        }
    }

    fn drain_uevents(&mut self) {
        loop {
            let data = match self.uevent_sock.as_ref() {
                Some(sock) => sock.recv(),
                None => return,
            };
            match data {
                Some(data) => self.handle_uevent(&data),
                None => return,
            }
        }
    }

    fn handle_uevent(&mut self, data: &[u8]) {
        let ev = match Uevent::parse(data) {
            Some(ev) => ev,
            None => return,
        };

        debug!("parsing uevent {}", ev.summary());

        if let Some(filter) = self.filter_frhint.as_mut() {
            filter.reset();
        }
        if let Some(filter) = self.filter_vdec.as_mut() {
            filter.reset();
        }
        if let Some(filter) = self.filter_hdmi.as_mut() {
            filter.reset();
        }

        for (attr, value) in ev.pairs() {
            trace!("> {}={}", attr, value);
            if let Some(filter) = self.filter_frhint.as_mut() {
                filter.feed(attr, value);
            }
            if let Some(filter) = self.filter_vdec.as_mut() {
                filter.feed(attr, value);
            }
            if let Some(filter) = self.filter_hdmi.as_mut() {
                filter.feed(attr, value);
            }
        }

        let modalias = ev
            .attr("MODALIAS")
            .map(|m| m.strip_prefix("platform:").unwrap_or(m).to_string());
        let modalias = modalias.as_deref();

        if matched(&self.filter_frhint) {
            if let Some(hint) = ev.attr("FRAME_RATE_HINT") {
                let period = hint.parse::<u32>().unwrap_or(0);
                if period != 0 {
                    if self
                        .cfg
                        .frhint_vdec_blacklist
                        .iter()
                        .any(|b| *b == self.state.modalias)
                    {
                        info!(
                            "vdec {} blacklisted for FRAME_RATE_HINT, skipping",
                            self.state.modalias
                        );
                        return;
                    }

                    let hz = rate::hint_period_to_hz(period);
                    self.delay_switch(false, hz, modalias);
                }
            } else if ev.attr("FRAME_RATE_END_HINT").is_some() {
                self.delay_switch(true, 0, modalias);
            }
        } else if matched(&self.filter_vdec) {
            match ev.attr("ACTION") {
                Some("add") => self.delay_switch(false, 0, modalias),
                Some("remove") => self.delay_switch(true, 0, modalias),
                _ => (),
            }
        } else if matched(&self.filter_hdmi) && self.cfg.switch_hdmi > 0 {
            info!("HDMI state changed, will handle in {} ms", self.cfg.switch_hdmi);
            self.ost_hdmi.arm(self.now, self.cfg.switch_hdmi);
        } else {
            debug!("unrecognized uevent");
        }
    }

    /// Schedule a debounced mode switch or restoration.
    ///
    /// `restore` selects the direction, `hz` carries a frame rate when the
    /// event brought one (24.8 fixed-point, 0 when unknown), `modalias`
    /// names the decoder the event came from.
    fn delay_switch(&mut self, restore: bool, hz: i32, modalias: Option<&str>) {
        self.ost_blackout.disable();
        self.ost_switch.disable();

        if self.cfg.switch_ignore > 0 {
            if restore {
                self.ost_off.arm(self.now, self.cfg.switch_ignore);
            } else if self.ost_off.enabled()
                && !self.ost_off.expired(self.now)
                && !self.catalog.is_blackened()
            {
                info!(
                    "ignoring frame rate switch, restore was {} ms ago",
                    self.cfg.switch_ignore - self.ost_off.left(self.now)
                );
                self.state.restore = false;
                self.ost_blackout.disable();
                self.ost_switch.disable();
                self.update_stats();
                return;
            }
        }

        let mut delay = if restore {
            self.cfg.switch_delay_off
        } else {
            self.cfg.switch_delay_on
        };

        if restore && self.cfg.switch_delay_off == 0 {
            info!("refresh rate restoration disabled by user");
            self.restore_mode(true);
            self.state = Default::default();
            self.update_stats();
            return;
        }

        if let Some(modalias) = modalias {
            if self.cfg.vdec_blacklist.iter().any(|b| b == modalias) {
                info!("blacklisted vdec {}, skipping", modalias);
                return;
            }

            self.state.modalias = modalias.to_string();
        }

        if self.state.restore != restore {
            self.state.restore = restore;
            self.state.hz = hz;
            // start collecting rate samples all over again
            self.state.detector.reset();
        }

        // a blackened screen should not stay dark for the full off delay
        if restore && self.catalog.is_blackened() {
            delay = self.cfg.switch_delay_on;
        }

        let mut hz = hz;
        if !restore && self.hint.stamp.enabled() && !self.hint.stamp.expired(self.now) {
            hz = self.hint.fps;
        }

        if hz != 0 && hz >= rate::HZ_MIN && hz < rate::HZ_MAX {
            self.state.detector.accumulate(
                hz,
                RateSource::Hint,
                self.now,
                self.cfg.switch_delay_retry * 2,
            );
            self.state.hz = self.state.detector.best(false, self.now);
        }

        if self.state.hz != 0 {
            info!("delaying switch to {}Hz by {} ms", Hz(self.state.hz), delay);
        } else if restore {
            info!("delaying refresh rate restoration by {} ms", delay);
        } else {
            info!("starting frame rate detection in {} ms", delay);
        }

        self.ost_switch.arm(self.now, delay);

        if restore {
            self.state.hz_ost.disable();
        } else {
            self.state.hz_ost.arm(self.now, self.cfg.switch_timeout);
            // until the actual frame rate is known, keep the screen dark
            if self.cfg.enable
                && self.cfg.switch_blackout > 0
                && self.state.hz == 0
                && self.state.orig_mode.is_none()
            {
                self.ost_blackout.arm(self.now, self.cfg.switch_blackout);
            }
        }
    }

    /// The switch timer fired, or a forced switch was requested: pick and
    /// apply the best mode for the detected rate, or restore, or retry.
    fn switch_now(&mut self, force: bool) {
        if self.state.restore {
            if self.state.orig_mode.is_none() {
                info!("no saved display mode to restore");
            }
            self.restore_mode(false);
            return;
        }

        if !self.cfg.enable {
            info!("frame rate switching disabled by user");
            self.restore_mode(true);
            return;
        }

        if self.state.hz == 0 && self.state.hz_ost.expired(self.now) {
            self.state.hz = self.state.detector.best(true, self.now);
            if self.state.hz == 0 {
                info!("timeout detecting movie frame rate, giving up");
                self.restore_mode(true);
                return;
            }
        }

        // ask every source until we have a usable refresh rate
        if self.state.hz == 0 {
            self.query_decoder_sources();
            self.state.hz = self.state.detector.best(false, self.now);
            if self.state.hz == 0 {
                if self.cfg.switch_delay_retry > 0 {
                    self.ost_switch.arm(self.now, self.cfg.switch_delay_retry);
                }
                return;
            }
        }

        // user override of the fractional/integer choice
        if self.cfg.mode_use_fract != FractUse::Auto {
            let probe = DisplayMode {
                framerate: ((self.state.hz + 0x80) >> 8) as u32,
                fractional: self.cfg.mode_use_fract == FractUse::ForceFractional,
                ..Default::default()
            };
            self.state.hz = probe.hz();
        }

        let current = match self.catalog.current().cloned() {
            Some(current) => current,
            None => {
                info!("current video mode unknown");
                self.restore_mode(true);
                return;
            }
        };

        info!("current mode is {}", current);
        info!(
            "looking for display mode closest to {}x{}@{}Hz",
            current.width,
            current.height,
            Hz(self.state.hz)
        );

        let best = select_mode(
            self.catalog.modes(),
            &current,
            self.state.hz,
            self.cfg.mode_prefer_exact,
            &self.cfg.mode_blacklist_rates,
        );

        let best = match best {
            Some(best) => best,
            None => {
                info!("failed to find a suitable display mode");
                self.restore_mode(true);
                return;
            }
        };

        // avoid irritating switches in the middle of playback when the
        // current refresh is already near enough
        if self.state.orig_mode.is_some()
            && !self.catalog.is_blackened()
            && !force
            && rate::hz_close(best.hz(), current.hz())
        {
            info!("skipping mode switch, current refresh is close enough");
            self.restore_mode(true);
            return;
        }

        self.ost_blackout.disable();

        if self.state.orig_mode.is_none() {
            self.state.orig_mode = Some(current);
        }

        self.catalog
            .switch_to(&best, force, &self.colorspace, &self.hdcp);
        self.update_stats();
    }

    /// Switch back to the mode remembered before playback, or at least
    /// leave the blackout, then clear all switch state.
    fn restore_mode(&mut self, only_if_black: bool) {
        self.ost_blackout.disable();
        self.ost_switch.disable();

        if only_if_black && !self.catalog.is_blackened() {
            return;
        }

        let target = self
            .state
            .orig_mode
            .clone()
            .or_else(|| self.catalog.current().cloned());
        if let Some(target) = target {
            self.catalog
                .switch_to(&target, false, &self.colorspace, &self.hdcp);
        }

        self.state = Default::default();
        self.update_stats();
    }

    /// The blackout timer fired: remember the current mode and blank the
    /// screen until the real rate is known.
    fn blackout(&mut self) {
        self.ost_blackout.disable();

        if self.catalog.is_blackened() {
            return;
        }

        self.catalog.read_current();
        match self.catalog.current().cloned() {
            Some(current) => {
                self.state.orig_mode = Some(current);
                self.catalog.blackout();
            }
            None => debug!("current mode unknown, not blacking out"),
        }

        self.update_stats();
    }

    fn query_decoder_sources(&mut self) {
        if !self.vdec_ok {
            return;
        }

        let hold = self.cfg.switch_delay_retry * 2;

        debug!("querying vdec_chunks");
        if let Ok(text) = fs::read_to_string(format!("{}/dump_vdec_chunks", self.cfg.vdec_sysfs)) {
            if let Some(hz) = rate::parse_chunks(&text) {
                self.state
                    .detector
                    .accumulate(hz, RateSource::Chunks, self.now, hold);
            }
        }

        debug!("querying vdec_blocks");
        if let Ok(text) = fs::read_to_string(format!("{}/dump_vdec_blocks", self.cfg.vdec_sysfs)) {
            if let Some(stats) = text.lines().next().and_then(rate::parse_blocks) {
                self.state.detector.feed_blocks(&stats, self.now, hold);
            }
        }

        debug!("querying vdec_status");
        match fs::read_to_string(format!("{}/vdec_status", self.cfg.vdec_sysfs)) {
            Ok(text) => {
                if let Some(hz) = rate::parse_vdec_status(&text) {
                    self.state
                        .detector
                        .accumulate(hz, RateSource::Status, self.now, hold);
                }
            }
            Err(_) => {
                warn!("failed to open {}/vdec_status", self.cfg.vdec_sysfs);
                self.vdec_ok = false;
            }
        }
    }

    /// The HDMI settle timer fired: query the link state and rebuild or
    /// drop the mode list.
    fn handle_hdmi_change(&mut self) {
        let state = sysfs::read_int(&self.cfg.hdmi_state).unwrap_or(-1);
        if state <= 0 {
            info!("HDMI not active, clearing video mode list");
            self.catalog.clear();
            self.state.orig_mode = None;
        } else {
            let extra = self.cfg.mode_extra.clone();
            if self.catalog.refresh(&extra).is_err() {
                warn!("failed to re-read the list of supported video modes");
            }
            self.colorspace.refresh();
        }
    }

    fn handle_api(&mut self, revents: PollFlags) {
        if revents.intersects(PollFlags::POLLHUP | PollFlags::POLLERR | PollFlags::POLLNVAL) {
            self.api.close();
            return;
        }

        if !revents.contains(PollFlags::POLLIN) {
            return;
        }

        while let Some((text, addr)) = self.api.recv() {
            self.handle_api_datagram(&text, addr);
        }
    }

    fn handle_api_datagram(&mut self, text: &str, addr: SocketAddr) {
        for command in apisock::parse_commands(text) {
            match command {
                ApiCommand::Help => self.api.send(apisock::HELP_TEXT, addr),
                ApiCommand::FrameRateHint(milli_fps) => {
                    self.frame_rate_hint((milli_fps * 256 / 1000) as i32)
                }
                ApiCommand::RefreshRate(milli_hz) => {
                    self.refresh_rate((milli_hz * 256 / 1000) as i32)
                }
                ApiCommand::ColorSpace(spec) => self.colorspace.set_override(&spec),
                ApiCommand::Status => {
                    let status = self.status_text();
                    self.api.send(&status, addr);
                }
                ApiCommand::Reconf => self.request_reconf(),
            }
        }
    }

    /// Record an out-of-band frame rate hint, consulted by the next
    /// debounced switch within one second.
    fn frame_rate_hint(&mut self, hz: i32) {
        self.hint.fps = hz;
        self.hint.stamp.arm(self.now, 1000);
    }

    /// Force an immediate switch to the given rate; zero or insane rates
    /// restore the original mode.
    fn refresh_rate(&mut self, hz: i32) {
        let ok = hz != 0 && hz >= rate::HZ_MIN && hz < rate::HZ_MAX;

        self.state.restore = !ok;
        self.state.hz = if ok { hz } else { 0 };
        self.switch_now(true);
    }

    /// Trigger a config reload on the next loop turn.
    fn request_reconf(&mut self) {
        self.ost_config.arm(self.now, 0);
        self.config_mtime = None;
    }

    fn status_text(&self) -> String {
        let (major, minor, micro) = shmem::version();
        format!(
            "stamp:{}\n\
             enabled:{}\n\
             active:{}\n\
             blackened:{}\n\
             version:{}.{}.{}\n\
             build:{}\n\
             current hz:{}\n\
             original hz:{}\n",
            self.status_crc,
            self.status.enabled as i32,
            self.status.switched as i32,
            self.status.blackened as i32,
            major,
            minor,
            micro,
            shmem::build_date(),
            (self.status.current_hz as i64) * 1000 / 256,
            (self.status.original_hz as i64) * 1000 / 256,
        )
    }

    fn update_stats(&mut self) {
        let current_hz = self.catalog.current().map_or(0, |mode| mode.hz());
        let original_hz = self
            .state
            .orig_mode
            .as_ref()
            .map_or(current_hz, |mode| mode.hz());

        self.status = ServiceStatus {
            enabled: self.cfg.enable,
            switched: self.state.orig_mode.is_some(),
            blackened: self.catalog.is_blackened(),
            current_hz,
            original_hz,
        };

        if let Some(writer) = self.shmem.as_mut() {
            self.status_crc = writer.update(&self.status);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use amlogic_afr_protocols::fp8;
    use std::fs;

    fn datagram(tokens: &[&str]) -> Vec<u8> {
        let mut data = Vec::new();
        for token in tokens {
            data.extend_from_slice(token.as_bytes());
            data.push(0);
        }
        data
    }

    fn fixture(config_extra: &str, disp_cap: &str, mode: &str) -> (tempfile::TempDir, Service) {
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
                 vdec.sysfs = {0}/vdec\n\
                 uevent.filter.frhint = SUBSYSTEM=tv\n\
                 uevent.filter.vdec = ACTION=add|remove MODALIAS=platform:.*\n\
                 uevent.filter.hdmi = DEVNAME=hdmi\n\
                 {1}",
                dir.path().display(),
                config_extra
            ),
        )
        .unwrap();
        let cfg = Config::load(&ini).unwrap();

        let mut service = Service::assemble(cfg, None, ApiSock::closed(), None);
        let extra = service.cfg.mode_extra.clone();
        service.catalog.refresh(&extra).unwrap();
        service.now = 1000;
        (dir, service)
    }

    fn mode_file(dir: &tempfile::TempDir) -> String {
        fs::read_to_string(dir.path().join("mode")).unwrap()
    }

    fn frac_file(dir: &tempfile::TempDir) -> String {
        fs::read_to_string(dir.path().join("frac_rate_policy")).unwrap()
    }

    fn run_until_idle(service: &mut Service) {
        let deadline = service.now + 60000;
        while service.ost_switch.enabled() || service.ost_blackout.enabled() {
            service.now += 50;
            service.dispatch_timers();
            assert!(service.now < deadline, "timers never settled");
        }
    }

    #[test]
    fn hint_uevent_switches_to_fractional_24p() {
        let (dir, mut service) = fixture("", "1080p60hz*\n1080p24hz\n", "1080p60hz");

        let data = datagram(&[
            "change@/devices/virtual/tv/tv",
            "SUBSYSTEM=tv",
            "FRAME_RATE_HINT=4004",
        ]);
        service.handle_uevent(&data);

        // the switch is debounced, nothing happened yet
        assert!(service.ost_switch.enabled());
        assert_eq!(mode_file(&dir), "1080p60hz");
        assert_eq!(service.state.hz, fp8(23, 976));

        service.now += service.cfg.switch_delay_on + 1;
        service.dispatch_timers();

        assert_eq!(mode_file(&dir), "1080p24hz");
        assert_eq!(frac_file(&dir), "1");
        assert_eq!(service.state.orig_mode.as_ref().unwrap().name, "1080p60hz");
        assert_eq!(service.catalog.current().unwrap().hz(), fp8(23, 976));
    }

    #[test]
    fn end_hint_restores_original_mode() {
        let (dir, mut service) = fixture("", "1080p60hz*\n1080p24hz\n", "1080p60hz");

        service.handle_uevent(&datagram(&[
            "change@tv",
            "SUBSYSTEM=tv",
            "FRAME_RATE_HINT=4004",
        ]));
        service.now += service.cfg.switch_delay_on + 1;
        service.dispatch_timers();
        assert_eq!(mode_file(&dir), "1080p24hz");

        service.handle_uevent(&datagram(&[
            "change@tv",
            "SUBSYSTEM=tv",
            "FRAME_RATE_END_HINT=",
        ]));
        service.now += service.cfg.switch_delay_off + 1;
        service.dispatch_timers();

        assert_eq!(mode_file(&dir), "1080p60hz");
        assert_eq!(frac_file(&dir), "0");
        assert!(!service.state.restore);
        assert_eq!(service.state.hz, 0);
        assert!(service.state.orig_mode.is_none());
    }

    #[test]
    fn blacklisted_rate_falls_back_to_integer() {
        let (dir, mut service) = fixture(
            "mode.blacklist.rates = 23.976\n",
            "1080p60hz*\n1080p24hz\n",
            "1080p60hz",
        );

        service.handle_uevent(&datagram(&[
            "change@tv",
            "SUBSYSTEM=tv",
            "FRAME_RATE_HINT=4004",
        ]));
        service.now += service.cfg.switch_delay_on + 1;
        service.dispatch_timers();

        assert_eq!(mode_file(&dir), "1080p24hz");
        assert_eq!(frac_file(&dir), "0");
    }

    #[test]
    fn undetectable_rate_gives_up_and_unblackens() {
        let (dir, mut service) = fixture("", "1080p60hz*\n1080p24hz\n", "1080p60hz");

        // decoder appears but its stats never materialize
        service.handle_uevent(&datagram(&[
            "add@/devices/platform/amvdec",
            "ACTION=add",
            "MODALIAS=platform:amvdec_h264",
        ]));
        assert_eq!(service.state.modalias, "amvdec_h264");
        assert!(service.ost_blackout.enabled());

        run_until_idle(&mut service);

        assert_eq!(mode_file(&dir), "1080p60hz");
        assert!(!service.catalog.is_blackened());
        assert!(!service.state.restore);
        assert_eq!(service.state.hz, 0);
        assert!(service.state.orig_mode.is_none());
    }

    #[test]
    fn quiet_period_swallows_fresh_hints() {
        let (dir, mut service) = fixture(
            "switch.ignore = 2000\nswitch.delay.off = 100\n",
            "1080p60hz*\n1080p24hz\n",
            "1080p60hz",
        );

        // a full restore arms the quiet window
        service.delay_switch(true, 0, None);
        assert!(service.ost_off.enabled());
        service.now += 101;
        service.dispatch_timers();

        // a fresh hint 200 ms later is discarded
        service.now += 200;
        service.handle_uevent(&datagram(&[
            "change@tv",
            "SUBSYSTEM=tv",
            "FRAME_RATE_HINT=4004",
        ]));

        assert!(!service.ost_switch.enabled());
        assert!(!service.state.restore);
        assert_eq!(mode_file(&dir), "1080p60hz");

        // once the window passes, hints act again
        service.now += 2000;
        service.handle_uevent(&datagram(&[
            "change@tv",
            "SUBSYSTEM=tv",
            "FRAME_RATE_HINT=4004",
        ]));
        assert!(service.ost_switch.enabled());
    }

    #[test]
    fn blacklisted_vdec_is_ignored() {
        let (_dir, mut service) = fixture(
            "vdec.blacklist = amvdec_mpeg12\n",
            "1080p60hz*\n",
            "1080p60hz",
        );

        service.handle_uevent(&datagram(&[
            "add@/devices/platform/amvdec",
            "ACTION=add",
            "MODALIAS=platform:amvdec_mpeg12",
        ]));

        assert!(!service.ost_switch.enabled());
        assert!(service.state.modalias.is_empty());
    }

    #[test]
    fn unmatched_uevent_is_a_noop() {
        let (_dir, mut service) = fixture("", "1080p60hz*\n", "1080p60hz");

        service.handle_uevent(&datagram(&[
            "add@/devices/usb",
            "ACTION=add",
            "SUBSYSTEM=usb",
        ]));

        assert!(!service.ost_switch.enabled());
        assert!(!service.ost_hdmi.enabled());
    }

    #[test]
    fn hdmi_uevent_coalesces_into_settle_timer() {
        let (dir, mut service) = fixture("", "1080p60hz*\n1080p24hz\n", "1080p60hz");

        service.handle_uevent(&datagram(&["change@hdmi", "DEVNAME=hdmi"]));
        assert!(service.ost_hdmi.enabled());
        service.handle_uevent(&datagram(&["change@hdmi", "DEVNAME=hdmi"]));

        // link down: the catalog empties
        fs::write(dir.path().join("state"), "0").unwrap();
        service.now += service.cfg.switch_hdmi + 1;
        service.dispatch_timers();
        assert!(service.catalog.modes().is_empty());

        // link back up: the catalog is rebuilt
        service.handle_uevent(&datagram(&["change@hdmi", "DEVNAME=hdmi"]));
        fs::write(dir.path().join("state"), "1").unwrap();
        service.now += service.cfg.switch_hdmi + 1;
        service.dispatch_timers();
        assert_eq!(service.catalog.modes().len(), 2);
    }

    #[test]
    fn api_hint_feeds_next_detection_within_ttl() {
        let (dir, mut service) = fixture("", "1080p60hz*\n1080p24hz\n", "1080p60hz");

        service.handle_api_datagram(
            "frame_rate_hint 23976\n",
            "127.0.0.1:40000".parse().unwrap(),
        );

        service.now += 500;
        service.handle_uevent(&datagram(&[
            "add@/devices/platform/amvdec",
            "ACTION=add",
            "MODALIAS=platform:amvdec_h265",
        ]));
        assert_eq!(service.state.hz, 23976 * 256 / 1000);

        service.now += service.cfg.switch_delay_on + 1;
        service.dispatch_timers();
        assert_eq!(mode_file(&dir), "1080p24hz");
    }

    #[test]
    fn api_hint_expires_after_a_second() {
        let (_dir, mut service) = fixture("", "1080p60hz*\n1080p24hz\n", "1080p60hz");

        service.handle_api_datagram(
            "frame_rate_hint 23976\n",
            "127.0.0.1:40000".parse().unwrap(),
        );

        service.now += 1500;
        service.handle_uevent(&datagram(&[
            "add@/devices/platform/amvdec",
            "ACTION=add",
            "MODALIAS=platform:amvdec_h265",
        ]));
        assert_eq!(service.state.hz, 0);
    }

    #[test]
    fn api_refresh_rate_is_forced_and_restores() {
        let (dir, mut service) = fixture("", "1080p60hz*\n1080p24hz\n", "1080p60hz");
        let addr: SocketAddr = "127.0.0.1:40000".parse().unwrap();

        service.handle_api_datagram("refresh_rate 24000\n", addr);
        assert_eq!(mode_file(&dir), "1080p24hz");
        assert_eq!(frac_file(&dir), "0");
        assert!(service.state.orig_mode.is_some());

        service.handle_api_datagram("refresh_rate\n", addr);
        assert_eq!(mode_file(&dir), "1080p60hz");
        assert!(service.state.orig_mode.is_none());
    }

    #[test]
    fn reconf_signal_reaches_the_loop() {
        let (_dir, mut service) = fixture("", "1080p60hz*\n", "1080p60hz");

        service.request_reconf();
        service.now += 1;
        assert_eq!(service.dispatch_timers(), Some(Outcome::Reconfigure));
    }

    #[test]
    fn status_text_reports_milli_hz() {
        let (_dir, mut service) = fixture("", "1080p60hz*\n", "1080p60hz");
        service.update_stats();

        let text = service.status_text();
        assert!(text.contains("enabled:1\n"));
        assert!(text.contains("active:0\n"));
        assert!(text.contains("current hz:60000\n"));
        assert!(text.contains("original hz:60000\n"));
    }

    fn write_chunks(dir: &tempfile::TempDir, period_us: i64) {
        let vdec = dir.path().join("vdec");
        fs::create_dir_all(&vdec).unwrap();

        let mut text = String::new();
        let mut pts = 1_000_000i64;
        for _ in 0..20 {
            text.push_str(&format!("idx 0: st 0 et 0 pts64={}\n", pts));
            pts += period_us;
        }
        fs::write(vdec.join("dump_vdec_chunks"), text).unwrap();
        // present but useless, so the decoder query path stays alive
        fs::write(vdec.join("vdec_status"), "vdec channel 0 statistics:\n").unwrap();
    }

    #[test]
    fn decoder_stats_commit_after_retries() {
        let (dir, mut service) = fixture(
            "switch.blackout = 0\n",
            "1080p60hz*\n1080p24hz\n",
            "1080p60hz",
        );
        write_chunks(&dir, 41708);

        service.handle_uevent(&datagram(&[
            "add@/devices/platform/amvdec",
            "ACTION=add",
            "MODALIAS=platform:amvdec_h265",
        ]));

        // first firing accumulates one chunks estimate (weight 50) and
        // rearms for a retry instead of switching
        service.now += service.cfg.switch_delay_on + 1;
        service.dispatch_timers();
        assert_eq!(mode_file(&dir), "1080p60hz");
        assert!(service.ost_switch.enabled());
        assert_eq!(service.state.hz, 0);

        // the second estimate agrees, reaches the acceptance weight and
        // commits the switch
        service.now += service.cfg.switch_delay_retry + 1;
        service.dispatch_timers();
        assert_eq!(service.state.hz, fp8(23, 976));
        assert_eq!(mode_file(&dir), "1080p24hz");
        assert_eq!(frac_file(&dir), "1");
    }

    #[test]
    fn disabled_service_never_switches() {
        let (dir, mut service) = fixture("enable = 0\n", "1080p60hz*\n1080p24hz\n", "1080p60hz");

        service.handle_uevent(&datagram(&[
            "change@tv",
            "SUBSYSTEM=tv",
            "FRAME_RATE_HINT=4004",
        ]));
        // switching disabled: no blackout pending either
        assert!(!service.ost_blackout.enabled());

        service.now += service.cfg.switch_delay_on + 1;
        service.dispatch_timers();

        assert_eq!(mode_file(&dir), "1080p60hz");
        assert!(service.state.orig_mode.is_none());
    }

    #[test]
    fn fract_override_pins_the_variant() {
        let (dir, mut service) = fixture(
            "mode.use.fract = 2\n",
            "1080p60hz*\n1080p24hz\n",
            "1080p60hz",
        );

        service.handle_uevent(&datagram(&[
            "change@tv",
            "SUBSYSTEM=tv",
            "FRAME_RATE_HINT=4004",
        ]));
        service.now += service.cfg.switch_delay_on + 1;
        service.dispatch_timers();

        // 23.976 was detected but the integer variant is enforced
        assert_eq!(mode_file(&dir), "1080p24hz");
        assert_eq!(frac_file(&dir), "0");
    }

    #[test]
    fn close_enough_rate_skips_mid_playback_switch() {
        let (dir, mut service) = fixture("", "1080p60hz*\n1080p24hz\n", "1080p60hz");

        service.handle_uevent(&datagram(&[
            "change@tv",
            "SUBSYSTEM=tv",
            "FRAME_RATE_HINT=4004",
        ]));
        service.now += service.cfg.switch_delay_on + 1;
        service.dispatch_timers();
        assert_eq!(mode_file(&dir), "1080p24hz");
        assert_eq!(frac_file(&dir), "1");

        // an integer 24 fps hint mid-playback is within tolerance of the
        // running 23.976: no switch, the saved mode stays
        service.handle_uevent(&datagram(&[
            "change@tv",
            "SUBSYSTEM=tv",
            "FRAME_RATE_HINT=4000",
        ]));
        service.now += service.cfg.switch_delay_on + 1;
        service.dispatch_timers();

        assert_eq!(mode_file(&dir), "1080p24hz");
        assert_eq!(frac_file(&dir), "1");
        assert_eq!(service.state.orig_mode.as_ref().unwrap().name, "1080p60hz");
    }

    #[test]
    fn mid_playback_rate_change_keeps_original_mode() {
        let (dir, mut service) = fixture(
            "",
            "1080p60hz*\n1080p24hz\n1080p50hz\n",
            "1080p60hz",
        );

        service.handle_uevent(&datagram(&[
            "change@tv",
            "SUBSYSTEM=tv",
            "FRAME_RATE_HINT=4004",
        ]));
        service.now += service.cfg.switch_delay_on + 1;
        service.dispatch_timers();
        assert_eq!(mode_file(&dir), "1080p24hz");

        // the movie changes to 25 fps: switch again, original mode stays
        service.handle_uevent(&datagram(&[
            "change@tv",
            "SUBSYSTEM=tv",
            "FRAME_RATE_HINT=3840",
        ]));
        service.now += service.cfg.switch_delay_on + 1;
        service.dispatch_timers();

        assert_eq!(mode_file(&dir), "1080p50hz");
        assert_eq!(service.state.orig_mode.as_ref().unwrap().name, "1080p60hz");
    }
}
