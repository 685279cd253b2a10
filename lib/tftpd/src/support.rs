use nix::errno::Errno;
use std::io;
use std::net;
use std::path::PathBuf;

pub type NetResult<T> = Result<T, NetError>;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum NetError {
    NotBound,
    AlreadyBound,
    WouldBlock,
    NoBuffers,
    InvalidDatagram,
    AddrParse,
    Sys(Errno),
    Io(io::ErrorKind),
}

impl From<Errno> for NetError {
    #[inline]
    fn from(errno: Errno) -> Self {
        match errno {
            Errno::EAGAIN => NetError::WouldBlock,
            errno => NetError::Sys(errno),
        }
    }
}

impl From<io::Error> for NetError {
    #[inline]
    fn from(io_error: io::Error) -> Self {
        match io_error.kind() {
            io::ErrorKind::WouldBlock => NetError::WouldBlock,
            kind => NetError::Io(kind),
        }
    }
}

impl From<net::AddrParseError> for NetError {
    #[inline]
    fn from(_: net::AddrParseError) -> Self {
        NetError::AddrParse
    }
}

/// Errors surfaced by `Server::start`. Configuration problems are caught
/// before any socket or thread is created.
#[derive(Debug)]
pub enum ServerError {
    RootNotSet,
    RootMissing(PathBuf),
    RootNotADirectory(PathBuf),
    Bind(NetError),
}

impl From<NetError> for ServerError {
    #[inline]
    fn from(err: NetError) -> Self {
        ServerError::Bind(err)
    }
}
