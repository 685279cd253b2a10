//! UDP endpoint with pktinfo recovery. The descriptor sits behind an
//! `RwLock` so bind and unbind wait until no in-flight call still holds
//! a usage reference, while receive/send/poll share it freely. Sockets
//! are non-blocking; callers gate `receive` with `poll`, and a lost race
//! surfaces as `WouldBlock` rather than a stall.

use crate::datagram::{Datagram, DatagramFactory};
use crate::logging;
use crate::support::{NetError, NetResult};
use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags};
use nix::sys::socket::{
    bind, getsockname, recvmsg, sendto, setsockopt, socket, sockopt, AddressFamily,
    ControlMessageOwned, InetAddr, MsgFlags, SockAddr, SockFlag, SockType,
};
use nix::sys::uio::IoVec;
use nix::unistd::close;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU8, Ordering};
use std::sync::RwLock;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum SocketState {
    Inactive = 0,
    Binding = 1,
    Bound = 2,
    Unbinding = 3,
}

impl SocketState {
    #[inline]
    fn from_u8(raw: u8) -> SocketState {
        match raw {
            1 => SocketState::Binding,
            2 => SocketState::Bound,
            3 => SocketState::Unbinding,
            _ => SocketState::Inactive,
        }
    }
}

pub struct UdpEndpoint {
    state: AtomicU8,
    local_port: AtomicU16,
    ipv6: AtomicBool,
    fd: RwLock<Option<RawFd>>,
    log: logging::Logger,
}

impl UdpEndpoint {
    pub fn new<'a, L: Into<Option<&'a logging::Logger>>>(log: L) -> UdpEndpoint {
        let log = match log.into() {
            Some(log) => log.new(logging::o!()),
            None => logging::null(),
        };

        UdpEndpoint {
            state: AtomicU8::new(SocketState::Inactive as u8),
            local_port: AtomicU16::new(0),
            ipv6: AtomicBool::new(false),
            fd: RwLock::new(None),
            log,
        }
    }

    #[inline]
    pub fn state(&self) -> SocketState {
        SocketState::from_u8(self.state.load(Ordering::Acquire))
    }

    #[inline]
    pub fn is_bound(&self) -> bool {
        self.state() == SocketState::Bound
    }

    #[inline]
    pub fn is_ipv6(&self) -> bool {
        self.ipv6.load(Ordering::Acquire)
    }

    /// Port actually bound; differs from the requested one when binding
    /// with port 0 asks the OS for an ephemeral port.
    #[inline]
    pub fn local_port(&self) -> u16 {
        self.local_port.load(Ordering::Acquire)
    }

    /// Binds to `host:port`. `host` must be an address literal.
    pub fn bind(&self, host: &str, port: u16) -> NetResult<()> {
        let addr: IpAddr = host.parse()?;

        if self
            .state
            .compare_exchange(
                SocketState::Inactive as u8,
                SocketState::Binding as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            return Err(NetError::AlreadyBound);
        }

        match Self::open_socket(addr, port) {
            Ok((fd, local_port)) => {
                {
                    let mut guard = self.fd.write().unwrap();
                    *guard = Some(fd);
                }
                self.local_port.store(local_port, Ordering::Release);
                self.ipv6.store(addr.is_ipv6(), Ordering::Release);
                self.state.store(SocketState::Bound as u8, Ordering::Release);

                logging::debug!(self.log, "socket bound";
                                "context" => "bind",
                                "host" => host,
                                "port" => local_port);
                Ok(())
            }
            Err(err) => {
                self.state
                    .store(SocketState::Inactive as u8, Ordering::Release);

                logging::error!(self.log, "bind failed";
                                "context" => "bind",
                                "host" => host,
                                "port" => port,
                                "error" => ?err);
                Err(err)
            }
        }
    }

    /// Idempotent. Waits until in-flight receive/send/poll calls release
    /// the descriptor before closing it.
    pub fn unbind(&self) -> NetResult<()> {
        if self
            .state
            .compare_exchange(
                SocketState::Bound as u8,
                SocketState::Unbinding as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            return Ok(());
        }

        {
            let mut guard = self.fd.write().unwrap();
            if let Some(fd) = guard.take() {
                // Nothing useful to do about a close error at teardown.
                let _ = close(fd);
            }
        }

        self.local_port.store(0, Ordering::Release);
        self.state
            .store(SocketState::Inactive as u8, Ordering::Release);

        logging::debug!(self.log, "socket unbound"; "context" => "unbind");
        Ok(())
    }

    /// Waits up to `timeout_ms` for a readable datagram.
    pub fn poll(&self, timeout_ms: u32) -> NetResult<bool> {
        let guard = self.fd.read().unwrap();
        let fd = guard.ok_or(NetError::NotBound)?;

        let mut fds = [PollFd::new(fd, PollFlags::POLLIN)];

        loop {
            match poll(&mut fds, timeout_ms as i32) {
                Ok(0) => return Ok(false),
                Ok(_) => return Ok(true),
                Err(Errno::EINTR) => continue,
                Err(err) => return Err(err.into()),
            }
        }
    }

    #[inline]
    pub fn has_datagram(&self) -> NetResult<bool> {
        self.poll(0)
    }

    /// Receives one datagram into buffers rented from `factory`,
    /// recovering the destination address from pktinfo ancillary data.
    pub fn receive(&self, factory: &DatagramFactory) -> NetResult<Datagram> {
        let guard = self.fd.read().unwrap();
        let fd = guard.ok_or(NetError::NotBound)?;

        let mut assembly = factory.start_assembly();

        let (bytes, source, dest_ip, broadcast) = {
            let (data, control) = assembly
                .split_buffers_mut()
                .ok_or(NetError::NoBuffers)?;

            let iov = [IoVec::from_mut_slice(data)];
            let msg = recvmsg(fd, &iov, Some(control), MsgFlags::empty())?;

            let source = match msg.address {
                Some(SockAddr::Inet(inet)) => inet.to_std(),
                _ => return Err(NetError::InvalidDatagram),
            };

            let mut dest_ip = None;
            let mut broadcast = false;

            for cmsg in msg.cmsgs() {
                match cmsg {
                    ControlMessageOwned::Ipv4PacketInfo(info) => {
                        let ip = Ipv4Addr::from(u32::from_be(info.ipi_addr.s_addr));
                        broadcast = ip.is_broadcast();
                        dest_ip = Some(IpAddr::V4(ip));
                    }
                    ControlMessageOwned::Ipv6PacketInfo(info) => {
                        dest_ip = Some(IpAddr::V6(Ipv6Addr::from(info.ipi6_addr.s6_addr)));
                    }
                    _ => {}
                }
            }

            (msg.bytes, source, dest_ip, broadcast)
        };

        let dest_ip = dest_ip.unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED));
        let dest = SocketAddr::new(dest_ip, self.local_port());

        assembly
            .set_data_size(bytes)
            .set_source(source)
            .set_destination(dest)
            .set_broadcast(broadcast);

        logging::trace!(self.log, "datagram received";
                        "context" => "receive",
                        "bytes" => bytes,
                        "source" => %source,
                        "dest" => %dest);

        assembly.finalize().ok_or(NetError::NoBuffers)
    }

    /// Sends the datagram to its destination address.
    pub fn send(&self, datagram: &Datagram) -> NetResult<usize> {
        let guard = self.fd.read().unwrap();
        let fd = guard.ok_or(NetError::NotBound)?;

        let addr = SockAddr::new_inet(InetAddr::from_std(&datagram.dest()));
        let sent = sendto(fd, datagram.data(), &addr, MsgFlags::empty())?;

        logging::trace!(self.log, "datagram sent";
                        "context" => "send",
                        "bytes" => sent,
                        "dest" => %datagram.dest());

        Ok(sent)
    }

    fn open_socket(addr: IpAddr, port: u16) -> NetResult<(RawFd, u16)> {
        let family = match addr {
            IpAddr::V4(_) => AddressFamily::Inet,
            IpAddr::V6(_) => AddressFamily::Inet6,
        };

        let fd = socket(family, SockType::Datagram, SockFlag::SOCK_NONBLOCK, None)?;

        match Self::configure_and_bind(fd, addr, port) {
            Ok(local_port) => Ok((fd, local_port)),
            Err(err) => {
                let _ = close(fd);
                Err(err)
            }
        }
    }

    fn configure_and_bind(fd: RawFd, addr: IpAddr, port: u16) -> NetResult<u16> {
        setsockopt(fd, sockopt::ReuseAddr, &true)?;

        match addr {
            IpAddr::V4(_) => setsockopt(fd, sockopt::Ipv4PacketInfo, &true)?,
            IpAddr::V6(_) => setsockopt(fd, sockopt::Ipv6RecvPacketInfo, &true)?,
        }

        let sockaddr = SockAddr::new_inet(InetAddr::from_std(&SocketAddr::new(addr, port)));
        bind(fd, &sockaddr)?;

        let local_port = match getsockname(fd)? {
            SockAddr::Inet(inet) => inet.to_std().port(),
            _ => 0,
        };

        Ok(local_port)
    }
}

impl Drop for UdpEndpoint {
    fn drop(&mut self) {
        if let Ok(mut guard) = self.fd.write() {
            if let Some(fd) = guard.take() {
                let _ = close(fd);
            }
        }
    }
}
