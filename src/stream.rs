// SPDX-License-Identifier: GPL-3.0-only

use std::io::{self, Read, Write};

use crate::util;

/// A trait for seekable readers. This is only needed because `dyn Read + Seek`
/// is not a valid construct in Rust yet.
pub trait ReadSeek: Read + io::Seek {}

impl<R: Read + io::Seek> ReadSeek for R {}

/// Common function for reading a structure from a reader.
pub trait FromReader<R: Read>: Sized {
    type Error;

    fn from_reader(reader: R) -> Result<Self, Self::Error>;
}

/// Extensions for readers to read fixed-size buffers.
pub trait ReadFixedSizeExt {
    /// Read fixed-size array.
    fn read_array_exact<const N: usize>(&mut self) -> io::Result<[u8; N]>;

    /// Read fixed-sized [`Vec`].
    fn read_vec_exact(&mut self, size: usize) -> io::Result<Vec<u8>>;
}

impl<R: Read> ReadFixedSizeExt for R {
    fn read_array_exact<const N: usize>(&mut self) -> io::Result<[u8; N]> {
        let mut buf = [0u8; N];
        self.read_exact(&mut buf)?;
        Ok(buf)
    }

    fn read_vec_exact(&mut self, size: usize) -> io::Result<Vec<u8>> {
        let mut buf = vec![0u8; size];
        self.read_exact(&mut buf)?;
        Ok(buf)
    }
}

/// Extensions for writers to easily write zeros (eg. for ZERO operations).
pub trait WriteZerosExt {
    fn write_zeros(&mut self, size: u64) -> io::Result<u64>;

    fn write_zeros_exact(&mut self, size: u64) -> io::Result<()> {
        let n = self.write_zeros(size)?;
        if n != size {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("Expected to write {size} bytes, but reached EOF after {n} bytes"),
            ));
        }
        Ok(())
    }
}

impl<W: Write> WriteZerosExt for W {
    fn write_zeros(&mut self, size: u64) -> io::Result<u64> {
        // We don't use std::io::copy() on std::io::repeat(0) because it fails
        // if the writer hits EOF before all data is written.
        let mut written = 0;

        while written < size {
            let to_write = (size - written).min(util::ZEROS.len() as u64) as usize;
            let n = self.write(&util::ZEROS[..to_write])?;
            written += n as u64;

            if n < to_write {
                break;
            }
        }

        Ok(written)
    }
}
