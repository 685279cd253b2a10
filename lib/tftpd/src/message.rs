//! TFTP wire format (RFC 1350). Every message starts with a big-endian
//! 16-bit opcode; DATA/ACK/ERROR carry a further big-endian 16-bit field.
//! All parsers take the received byte length into account and never read
//! past it.

use byteorder::{BigEndian, ByteOrder, WriteBytesExt};
use std::io;
use std::io::Write;
use std::str;

pub const DEFAULT_PORT: u16 = 69;
pub const DEFAULT_BLOCK_SIZE: usize = 512;

pub const OPCODE_SIZE: usize = 2;
/// Opcode + block number.
pub const DATA_HEADER_SIZE: usize = 4;
pub const ACK_SIZE: usize = 4;
/// Opcode plus at least the two terminating NULs of filename and mode.
pub const MIN_REQUEST_SIZE: usize = 4;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum OpCode {
    Rrq = 1,
    Wrq = 2,
    Data = 3,
    Ack = 4,
    Error = 5,
    Oack = 6,
}

impl OpCode {
    #[inline]
    pub fn from_u16(raw: u16) -> Option<OpCode> {
        match raw {
            1 => Some(OpCode::Rrq),
            2 => Some(OpCode::Wrq),
            3 => Some(OpCode::Data),
            4 => Some(OpCode::Ack),
            5 => Some(OpCode::Error),
            6 => Some(OpCode::Oack),
            _ => None,
        }
    }

    #[inline]
    pub fn as_str(self) -> &'static str {
        match self {
            OpCode::Rrq => "RRQ",
            OpCode::Wrq => "WRQ",
            OpCode::Data => "DATA",
            OpCode::Ack => "ACK",
            OpCode::Error => "ERROR",
            OpCode::Oack => "OACK",
        }
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Mode {
    Netascii,
    Octet,
    /// Obsolete; requests carrying it are rejected after parsing.
    Mail,
}

impl Mode {
    /// Mode strings are case-insensitive on the wire.
    #[inline]
    pub fn from_str(raw: &str) -> Option<Mode> {
        if raw.eq_ignore_ascii_case("netascii") {
            Some(Mode::Netascii)
        } else if raw.eq_ignore_ascii_case("octet") {
            Some(Mode::Octet)
        } else if raw.eq_ignore_ascii_case("mail") {
            Some(Mode::Mail)
        } else {
            None
        }
    }

    #[inline]
    pub fn as_str(self) -> &'static str {
        match self {
            Mode::Netascii => "netascii",
            Mode::Octet => "octet",
            Mode::Mail => "mail",
        }
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ErrorCode {
    Undefined = 0,
    FileNotFound = 1,
    AccessViolation = 2,
    DiskFull = 3,
    IllegalOperation = 4,
    UnknownTransferId = 5,
    FileExists = 6,
    NoSuchUser = 7,
}

impl ErrorCode {
    #[inline]
    pub fn from_u16(raw: u16) -> Option<ErrorCode> {
        match raw {
            0 => Some(ErrorCode::Undefined),
            1 => Some(ErrorCode::FileNotFound),
            2 => Some(ErrorCode::AccessViolation),
            3 => Some(ErrorCode::DiskFull),
            4 => Some(ErrorCode::IllegalOperation),
            5 => Some(ErrorCode::UnknownTransferId),
            6 => Some(ErrorCode::FileExists),
            7 => Some(ErrorCode::NoSuchUser),
            _ => None,
        }
    }

    #[inline]
    pub fn default_message(self) -> &'static str {
        match self {
            ErrorCode::Undefined => "Not defined",
            ErrorCode::FileNotFound => "File not found",
            ErrorCode::AccessViolation => "Access violation",
            ErrorCode::DiskFull => "Disk full or allocation exceeded",
            ErrorCode::IllegalOperation => "Illegal TFTP operation",
            ErrorCode::UnknownTransferId => "Unknown transfer ID",
            ErrorCode::FileExists => "File already exists",
            ErrorCode::NoSuchUser => "No such user",
        }
    }
}

#[derive(Debug, Eq, PartialEq)]
pub enum WireError {
    Truncated,
    UnknownOpcode(u16),
    UnexpectedOpcode(OpCode),
    MissingNul,
    BadString,
    UnknownMode,
}

pub type WireResult<T> = Result<T, WireError>;

/// Reads the leading opcode without touching the rest of the message.
#[inline]
pub fn peek_opcode(buffer: &[u8]) -> WireResult<OpCode> {
    if buffer.len() < OPCODE_SIZE {
        return Err(WireError::Truncated);
    }

    let raw = BigEndian::read_u16(&buffer[..OPCODE_SIZE]);
    OpCode::from_u16(raw).ok_or(WireError::UnknownOpcode(raw))
}

/// A parsed RRQ or WRQ. Borrowing the filename keeps the parse
/// allocation-free; the datagram outlives the request handling.
#[derive(Debug, Eq, PartialEq)]
pub struct Request<'a> {
    pub op: OpCode,
    pub filename: &'a str,
    pub mode: Mode,
}

impl<'a> Request<'a> {
    /// Parses and validates a request message. Fails on any truncation
    /// that removes the filename NUL or the mode NUL, and on unknown
    /// mode strings. `mail` parses successfully; rejecting it is the
    /// caller's decision so it can be reported distinctly.
    pub fn parse(buffer: &'a [u8]) -> WireResult<Request<'a>> {
        let op = peek_opcode(buffer)?;
        if op != OpCode::Rrq && op != OpCode::Wrq {
            return Err(WireError::UnexpectedOpcode(op));
        }

        let (filename, rest) = read_cstr(&buffer[OPCODE_SIZE..])?;
        let (mode, _) = read_cstr(rest)?;
        let mode = Mode::from_str(mode).ok_or(WireError::UnknownMode)?;

        Ok(Request { op, filename, mode })
    }
}

/// Parses a DATA message into its block number and payload.
pub fn parse_data(buffer: &[u8]) -> WireResult<(u16, &[u8])> {
    let op = peek_opcode(buffer)?;
    if op != OpCode::Data {
        return Err(WireError::UnexpectedOpcode(op));
    }

    if buffer.len() < DATA_HEADER_SIZE {
        return Err(WireError::Truncated);
    }

    let block = BigEndian::read_u16(&buffer[OPCODE_SIZE..DATA_HEADER_SIZE]);
    Ok((block, &buffer[DATA_HEADER_SIZE..]))
}

/// Parses an ACK message into its block number.
pub fn parse_ack(buffer: &[u8]) -> WireResult<u16> {
    let op = peek_opcode(buffer)?;
    if op != OpCode::Ack {
        return Err(WireError::UnexpectedOpcode(op));
    }

    if buffer.len() < ACK_SIZE {
        return Err(WireError::Truncated);
    }

    Ok(BigEndian::read_u16(&buffer[OPCODE_SIZE..ACK_SIZE]))
}

/// Parses an ERROR message. The error code is returned raw since peers
/// may send values outside the RFC table; the message text is recovered
/// lossily for logging.
pub fn parse_error(buffer: &[u8]) -> WireResult<(u16, String)> {
    let op = peek_opcode(buffer)?;
    if op != OpCode::Error {
        return Err(WireError::UnexpectedOpcode(op));
    }

    if buffer.len() < DATA_HEADER_SIZE {
        return Err(WireError::Truncated);
    }

    let code = BigEndian::read_u16(&buffer[OPCODE_SIZE..DATA_HEADER_SIZE]);
    let tail = &buffer[DATA_HEADER_SIZE..];
    let text = match tail.iter().position(|&b| b == 0) {
        Some(nul) => String::from_utf8_lossy(&tail[..nul]).into_owned(),
        None => String::from_utf8_lossy(tail).into_owned(),
    };

    Ok((code, text))
}

pub fn encode_request(
    buffer: &mut [u8],
    op: OpCode,
    filename: &str,
    mode: Mode,
) -> io::Result<usize> {
    let mut stream = io::Cursor::new(buffer);

    stream.write_u16::<BigEndian>(op as u16)?;
    stream.write_all(filename.as_bytes())?;
    stream.write_u8(0)?;
    stream.write_all(mode.as_str().as_bytes())?;
    stream.write_u8(0)?;

    Ok(stream.position() as usize)
}

/// Writes the 4-byte DATA header; the payload follows in place.
pub fn encode_data_header(buffer: &mut [u8], block: u16) -> io::Result<usize> {
    let mut stream = io::Cursor::new(buffer);

    stream.write_u16::<BigEndian>(OpCode::Data as u16)?;
    stream.write_u16::<BigEndian>(block)?;

    Ok(stream.position() as usize)
}

pub fn encode_ack(buffer: &mut [u8], block: u16) -> io::Result<usize> {
    let mut stream = io::Cursor::new(buffer);

    stream.write_u16::<BigEndian>(OpCode::Ack as u16)?;
    stream.write_u16::<BigEndian>(block)?;

    Ok(stream.position() as usize)
}

pub fn encode_error(buffer: &mut [u8], code: ErrorCode, message: &str) -> io::Result<usize> {
    let mut stream = io::Cursor::new(buffer);

    stream.write_u16::<BigEndian>(OpCode::Error as u16)?;
    stream.write_u16::<BigEndian>(code as u16)?;
    stream.write_all(message.as_bytes())?;
    stream.write_u8(0)?;

    Ok(stream.position() as usize)
}

fn read_cstr(buffer: &[u8]) -> WireResult<(&str, &[u8])> {
    let nul = buffer
        .iter()
        .position(|&b| b == 0)
        .ok_or(WireError::MissingNul)?;

    let text = str::from_utf8(&buffer[..nul]).map_err(|_| WireError::BadString)?;

    Ok((text, &buffer[nul + 1..]))
}
