// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (c) 2024 Takashi Sakamoto

//! The control plane: a line-oriented text protocol over a UDP socket on
//! loopback. External processes inject frame rate hints, force a refresh
//! rate, query the service status or trigger a configuration reload.

use {
    std::{
        net::{Ipv4Addr, SocketAddr, UdpSocket},
        os::unix::io::{AsRawFd, RawFd},
    },
    tracing::{debug, info, warn},
};

/// The fixed port of the service API.
pub const API_PORT: u16 = 50505;

pub const HELP_TEXT: &str = "\
help\n\tdisplay this help text\n\
frame_rate_hint <fr>\n\ttell the service the video starting in <1.0 seconds will use <fr>/1000 frames per second (e.g. 23976 = 23.976 fps)\n\
refresh_rate <rr>\n\ttell the service to set display refresh rate as close to <rr>/1000 Hz as possible, no arg to restore original rate\n\
color_space <cs>\n\toverride colorspace, empty arg to restore default behavior\n\
status\n\tget current service status\n\
reconf\n\ttell the service to reload configuration file as soon as possible\n";

/// One command received over the API socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApiCommand {
    Help,
    /// The declared frame rate of the upcoming video, milli-fps.
    FrameRateHint(i64),
    /// The refresh rate to force, milli-Hz; zero restores the original.
    RefreshRate(i64),
    ColorSpace(String),
    Status,
    Reconf,
}

/// Split a datagram into commands, one per line. Unknown commands and
/// malformed arguments are logged and dropped.
pub fn parse_commands(text: &str) -> Vec<ApiCommand> {
    let mut commands = Vec::new();

    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        debug!("API command: [{}]", line);

        let (keyword, arg) = match line.split_once(char::is_whitespace) {
            Some((keyword, arg)) => (keyword, arg.trim()),
            None => (line, ""),
        };

        let command = match keyword {
            "help" => Some(ApiCommand::Help),
            "frame_rate_hint" => parse_milli_arg(arg).map(ApiCommand::FrameRateHint),
            "refresh_rate" => parse_milli_arg(arg).map(ApiCommand::RefreshRate),
            "color_space" => Some(ApiCommand::ColorSpace(arg.to_string())),
            "status" => Some(ApiCommand::Status),
            "reconf" => Some(ApiCommand::Reconf),
            _ => {
                debug!("unknown command");
                None
            }
        };

        match command {
            Some(command) => commands.push(command),
            None => debug!("bad args"),
        }
    }

    commands
}

fn parse_milli_arg(arg: &str) -> Option<i64> {
    if arg.is_empty() {
        return Some(0);
    }
    arg.parse().ok()
}

/// The API socket with lazy reopening after errors.
pub struct ApiSock {
    sock: Option<UdpSocket>,
}

impl ApiSock {
    pub fn new() -> ApiSock {
        let mut api = ApiSock { sock: None };
        api.ensure_open();
        api
    }

    /// A socketless instance, for unit tests of the engine.
    #[cfg(test)]
    pub fn closed() -> ApiSock {
        ApiSock { sock: None }
    }

    pub fn ensure_open(&mut self) {
        if self.sock.is_some() {
            return;
        }

        match UdpSocket::bind((Ipv4Addr::LOCALHOST, API_PORT)) {
            Ok(sock) => {
                if let Err(err) = sock.set_nonblocking(true) {
                    warn!("failed to make the API socket non-blocking: {}", err);
                    return;
                }
                info!("service API available at 127.0.0.1:{} UDP", API_PORT);
                self.sock = Some(sock);
            }
            Err(err) => warn!("failed to bind API socket to port {}: {}", API_PORT, err),
        }
    }

    pub fn close(&mut self) {
        self.sock = None;
    }

    pub fn raw_fd(&self) -> Option<RawFd> {
        self.sock.as_ref().map(|s| s.as_raw_fd())
    }

    /// Receive one datagram, or None once the socket runs dry.
    pub fn recv(&self) -> Option<(String, SocketAddr)> {
        let sock = self.sock.as_ref()?;
        let mut buf = [0u8; 1024];
        match sock.recv_from(&mut buf) {
            Ok((len, addr)) => Some((String::from_utf8_lossy(&buf[..len]).into_owned(), addr)),
            Err(_) => None,
        }
    }

    /// Best-effort reply to a client.
    pub fn send(&self, text: &str, to: SocketAddr) {
        if let Some(sock) = self.sock.as_ref() {
            let _ = sock.send_to(text.as_bytes(), to);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn commands_one_per_line() {
        let commands = parse_commands("help\nstatus\nreconf\n");
        assert_eq!(
            commands,
            vec![ApiCommand::Help, ApiCommand::Status, ApiCommand::Reconf]
        );
    }

    #[test]
    fn numeric_arguments() {
        assert_eq!(
            parse_commands("frame_rate_hint 23976"),
            vec![ApiCommand::FrameRateHint(23976)]
        );
        assert_eq!(
            parse_commands("refresh_rate 59940\n"),
            vec![ApiCommand::RefreshRate(59940)]
        );
        // no argument means restore
        assert_eq!(parse_commands("refresh_rate"), vec![ApiCommand::RefreshRate(0)]);
        // trailing whitespace is fine, garbage is not
        assert_eq!(
            parse_commands("refresh_rate 50000  \n"),
            vec![ApiCommand::RefreshRate(50000)]
        );
        assert!(parse_commands("refresh_rate fast").is_empty());
    }

    #[test]
    fn unknown_commands_are_dropped() {
        assert!(parse_commands("dance\n").is_empty());
        assert_eq!(
            parse_commands("dance\nstatus\n"),
            vec![ApiCommand::Status]
        );
    }

    #[test]
    fn color_space_takes_rest_of_line() {
        assert_eq!(
            parse_commands("color_space 420,10bit"),
            vec![ApiCommand::ColorSpace("420,10bit".to_string())]
        );
        assert_eq!(
            parse_commands("color_space"),
            vec![ApiCommand::ColorSpace(String::new())]
        );
    }
}
