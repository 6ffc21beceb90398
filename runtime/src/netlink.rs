// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (c) 2024 Takashi Sakamoto

//! Receiver for kernel uevent broadcasts.
//!
//! The kernel announces device events on a NETLINK_KOBJECT_UEVENT datagram
//! socket. Anyone may multicast on netlink, so SO_PASSCRED is enabled and
//! only messages carrying the credentials of the kernel itself (pid 0 at
//! both the socket and the netlink level) are handed out.

use {
    amlogic_afr_protocols::{Error, Result},
    nix::{
        cmsg_space,
        errno::Errno,
        sys::socket::{
            bind, recvmsg, setsockopt, socket, sockopt, AddressFamily, ControlMessageOwned,
            MsgFlags, NetlinkAddr, SockFlag, SockProtocol, SockType,
        },
        unistd::{close, getpid},
    },
    std::{
        io::IoSliceMut,
        os::unix::io::{AsRawFd, RawFd},
    },
    tracing::warn,
};

pub struct UeventSocket {
    fd: RawFd,
}

impl UeventSocket {
    /// Open and bind the kobject-uevent socket, subscribed to all multicast
    /// groups, with the receive buffer forced to `rcvbuf` bytes.
    pub fn open(rcvbuf: usize) -> Result<UeventSocket> {
        let fd = socket(
            AddressFamily::Netlink,
            SockType::Datagram,
            SockFlag::SOCK_CLOEXEC | SockFlag::SOCK_NONBLOCK,
            SockProtocol::NetlinkKObjectUEvent,
        )
        .map_err(|err| Error::transient_io("netlink", err.into()))?;

        let sock = UeventSocket { fd };

        if setsockopt(fd, sockopt::RcvBufForce, &rcvbuf).is_err() {
            // needs CAP_NET_ADMIN; the plain limit is good enough then
            let _ = setsockopt(fd, sockopt::RcvBuf, &rcvbuf);
        }
        setsockopt(fd, sockopt::PassCred, &true)
            .map_err(|err| Error::transient_io("netlink", err.into()))?;

        let addr = NetlinkAddr::new(getpid().as_raw() as u32, u32::MAX);
        bind(fd, &addr).map_err(|err| Error::transient_io("netlink", err.into()))?;

        Ok(sock)
    }

    /// Receive the next kernel-originated datagram, skipping messages from
    /// other senders. None once the socket runs dry.
    pub fn recv(&self) -> Option<Vec<u8>> {
        loop {
            let mut buf = [0u8; 4096];

            let received = {
                let mut iov = [IoSliceMut::new(&mut buf)];
                let mut space = cmsg_space!(nix::sys::socket::UnixCredentials);
                match recvmsg::<NetlinkAddr>(
                    self.fd,
                    &mut iov,
                    Some(&mut space),
                    MsgFlags::MSG_DONTWAIT,
                ) {
                    Err(Errno::EAGAIN) => return None,
                    Err(err) => {
                        warn!("uevent receive failed: {}", err);
                        return None;
                    }
                    Ok(msg) => {
                        let from_kernel_pid = msg.cmsgs().any(|cmsg| match cmsg {
                            ControlMessageOwned::ScmCredentials(creds) => creds.pid() == 0,
                            _ => false,
                        });
                        let from_kernel_addr =
                            msg.address.map_or(false, |addr: NetlinkAddr| addr.pid() == 0);

                        if from_kernel_pid && from_kernel_addr {
                            Some(msg.bytes)
                        } else {
                            None
                        }
                    }
                }
            };

            if let Some(bytes) = received {
                return Some(buf[..bytes].to_vec());
            }
        }
    }
}

impl AsRawFd for UeventSocket {
    fn as_raw_fd(&self) -> RawFd {
        self.fd
    }
}

impl Drop for UeventSocket {
    fn drop(&mut self) {
        let _ = close(self.fd);
    }
}
