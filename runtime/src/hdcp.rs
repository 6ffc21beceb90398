// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (c) 2024 Takashi Sakamoto

//! HDCP mode guard. Mode switches may drop the content protection setting
//! of the transmitter, so the mode found at startup is re-asserted after
//! every switch.

use {
    crate::{config::Config, sysfs},
    tracing::info,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum HdcpMode {
    Off,
    Hdcp14,
    Hdcp22,
}

pub struct Hdcp {
    dev: String,
    mode: HdcpMode,
}

impl Hdcp {
    pub fn probe(cfg: &Config) -> Hdcp {
        let mode = match sysfs::read_attr(&cfg.hdmi_dev, "hdcp_mode").as_deref() {
            Ok("off") => {
                info!("HDCP is not enabled");
                HdcpMode::Off
            }
            Ok("14") => {
                info!("HDCP 1.4 is enabled");
                HdcpMode::Hdcp14
            }
            Ok("22") => {
                info!("HDCP 2.2 is enabled");
                HdcpMode::Hdcp22
            }
            Ok(other) => {
                info!("unrecognized HDCP mode: {}", other);
                HdcpMode::Off
            }
            Err(_) => HdcpMode::Off,
        };

        Hdcp {
            dev: cfg.hdmi_dev.clone(),
            mode,
        }
    }

    /// Re-assert the HDCP mode captured at startup.
    pub fn restore(&self) {
        let value = match self.mode {
            HdcpMode::Off => return,
            HdcpMode::Hdcp14 => "14",
            HdcpMode::Hdcp22 => "22",
        };

        info!("setting HDCP mode to {}", value);
        let _ = sysfs::write_attr(&self.dev, "hdcp_mode", value);
    }
}
