//! Block-oriented file access for transfers. Writes land in a temp file
//! next to the target and are promoted atomically on `finalize`; a
//! writer dropped early takes its temp file with it and leaves the
//! target untouched. The netascii write path rewrites line endings
//! through the halo buffer with one block of look-ahead.

use crate::halo::HaloBuffer;
use std::fs::File;
use std::io;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum EolMode {
    None,
    ForceNative,
}

#[cfg(windows)]
const NATIVE_EOL: &[u8] = b"\r\n";
#[cfg(not(windows))]
const NATIVE_EOL: &[u8] = b"\n";

pub struct FileReader {
    file: File,
}

impl FileReader {
    pub fn open(path: &Path) -> io::Result<FileReader> {
        Ok(FileReader {
            file: File::open(path)?,
        })
    }

    /// Fills the buffer unless the file ends first. A short count marks
    /// the final block; 0 means the previous block ended exactly at EOF.
    pub fn read_block(&mut self, buffer: &mut [u8]) -> io::Result<usize> {
        let mut filled = 0;

        while filled < buffer.len() {
            match self.file.read(&mut buffer[filled..]) {
                Ok(0) => break,
                Ok(count) => filled += count,
                Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err),
            }
        }

        Ok(filled)
    }
}

pub struct FileWriter {
    temp: NamedTempFile,
    target: PathBuf,
    eol: EolMode,
    native: &'static [u8],
    halo: HaloBuffer,
    /// Bytes kept back for look-ahead; one full block.
    hold: usize,
    /// Source bytes staged into the halo.
    staged: usize,
    /// Source bytes rewritten and pushed to the temp file.
    consumed: usize,
    scratch: Vec<u8>,
}

impl FileWriter {
    /// `block_size` bounds a single `write_block`; the halo holds two
    /// blocks so staging never overruns the unconsumed tail.
    pub fn create(target: &Path, block_size: usize, eol: EolMode) -> io::Result<FileWriter> {
        let dir = target.parent().ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "target has no parent directory")
        })?;

        Ok(FileWriter {
            temp: NamedTempFile::new_in(dir)?,
            target: target.to_path_buf(),
            eol,
            native: NATIVE_EOL,
            halo: HaloBuffer::new(block_size * 2),
            hold: block_size,
            staged: 0,
            consumed: 0,
            scratch: Vec::with_capacity(block_size * 2),
        })
    }

    pub fn write_block(&mut self, block: &[u8]) -> io::Result<()> {
        match self.eol {
            EolMode::None => self.temp.write_all(block),
            EolMode::ForceNative => {
                debug_assert!(block.len() <= self.hold, "block exceeds the hold window");

                self.halo.write(self.staged, block);
                self.staged += block.len();

                let limit = self.staged.saturating_sub(self.hold);
                self.emit_rewritten(limit)
            }
        }
    }

    /// Flushes the held tail and atomically replaces the target with the
    /// temp file.
    pub fn finalize(mut self) -> io::Result<()> {
        if self.eol == EolMode::ForceNative {
            let staged = self.staged;
            self.emit_rewritten(staged)?;
        }

        self.temp.flush()?;

        let FileWriter { temp, target, .. } = self;
        temp.persist(&target).map_err(|err| err.error)?;

        Ok(())
    }

    /// Rewrites staged bytes up to `limit`. A `\r\n` pair passes through
    /// unchanged; a lone `\n` becomes the native ending. A trailing `\r`
    /// may look one byte past `limit` (never past `staged`), which is
    /// why one block stays in reserve between calls.
    fn emit_rewritten(&mut self, limit: usize) -> io::Result<()> {
        self.scratch.clear();
        let mut cursor = self.consumed;

        while cursor < limit {
            let byte = self.halo.get(cursor);

            if byte == b'\r' && cursor + 1 < self.staged && self.halo.get(cursor + 1) == b'\n' {
                self.scratch.extend_from_slice(b"\r\n");
                cursor += 2;
            } else if byte == b'\n' {
                self.scratch.extend_from_slice(self.native);
                cursor += 1;
            } else {
                self.scratch.push(byte);
                cursor += 1;
            }
        }

        self.consumed = cursor;

        if !self.scratch.is_empty() {
            self.temp.write_all(&self.scratch)?;
        }

        Ok(())
    }
}
