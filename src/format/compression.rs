// SPDX-License-Identifier: GPL-3.0-only

use std::{
    io::{self, Read, Write},
    process::{Command, Stdio},
    thread,
};

use bzip2::read::BzDecoder;
use thiserror::Error;
use tracing::debug;
use xz2::read::XzDecoder;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Failed to decompress bzip2 stream")]
    Bzip2(#[source] io::Error),
    #[error("Failed to decompress xz stream natively and via the xz command")]
    Xz(#[source] io::Error),
    #[error("Failed to decompress zstd stream")]
    Zstd(#[source] io::Error),
}

type Result<T> = std::result::Result<T, Error>;

/// Codecs used for install operation data and for the inner streams of
/// bsdiff patches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodecKind {
    /// Stored as-is, no compression.
    Stored,
    Bzip2,
    Xz,
    Zstd,
}

/// Decompress `data` into a freshly allocated buffer. Operation outputs
/// address bounded extents, so everything is materialized in memory rather
/// than streamed.
pub fn decompress(kind: CodecKind, data: &[u8]) -> Result<Vec<u8>> {
    match kind {
        CodecKind::Stored => Ok(data.to_vec()),
        CodecKind::Bzip2 => {
            let mut buf = Vec::new();
            BzDecoder::new(data)
                .read_to_end(&mut buf)
                .map_err(Error::Bzip2)?;
            Ok(buf)
        }
        CodecKind::Xz => decompress_xz(data),
        CodecKind::Zstd => zstd::stream::decode_all(data).map_err(Error::Zstd),
    }
}

/// Some real-world payloads contain xz streams that the native decoder
/// rejects, but that the reference xz tool accepts. Fall back to piping the
/// data through the `xz` executable before reporting a failure.
fn decompress_xz(data: &[u8]) -> Result<Vec<u8>> {
    let native_err = match decompress_xz_native(data) {
        Ok(buf) => return Ok(buf),
        Err(e) => e,
    };

    match decompress_xz_command(data) {
        Ok(buf) => {
            debug!("Native xz decoder failed, but the xz command succeeded: {native_err}");
            Ok(buf)
        }
        Err(command_err) => {
            debug!("xz command fallback also failed: {command_err}");
            Err(Error::Xz(native_err))
        }
    }
}

fn decompress_xz_native(data: &[u8]) -> io::Result<Vec<u8>> {
    let mut buf = Vec::new();
    XzDecoder::new(data).read_to_end(&mut buf)?;
    Ok(buf)
}

fn decompress_xz_command(data: &[u8]) -> io::Result<Vec<u8>> {
    let mut child = Command::new("xz")
        .args(["-d", "-c"])
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()?;

    let Some(mut stdin) = child.stdin.take() else {
        return Err(io::Error::other("Child stdin was not piped"));
    };
    let Some(mut stdout) = child.stdout.take() else {
        return Err(io::Error::other("Child stdout was not piped"));
    };

    // Feed stdin from a separate thread to avoid deadlocking when the child
    // fills its stdout pipe before consuming all of its input.
    let (result, write_result) = thread::scope(|scope| {
        let writer = scope.spawn(move || stdin.write_all(data));

        let mut buf = Vec::new();
        let result = stdout.read_to_end(&mut buf).map(|_| buf);

        (result, writer.join())
    });

    let buf = result?;

    let status = child.wait()?;
    if !status.success() {
        return Err(io::Error::other(format!("xz command failed: {status}")));
    }

    match write_result {
        Ok(r) => {
            // EPIPE with a successful exit just means the child stopped
            // reading early.
            r.or_else(|e| {
                if e.kind() == io::ErrorKind::BrokenPipe {
                    Ok(())
                } else {
                    Err(e)
                }
            })?;
        }
        Err(_) => return Err(io::Error::other("xz writer thread panicked")),
    }

    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::io::Write;

    #[test]
    fn stored_is_identity() {
        let data = b"raw bytes".to_vec();
        assert_eq!(decompress(CodecKind::Stored, &data).unwrap(), data);
    }

    #[test]
    fn bzip2_round_trip() {
        let data = b"bzip2-compressed data".repeat(100);

        let mut encoder =
            bzip2::write::BzEncoder::new(Vec::new(), bzip2::Compression::default());
        encoder.write_all(&data).unwrap();
        let compressed = encoder.finish().unwrap();

        assert_eq!(decompress(CodecKind::Bzip2, &compressed).unwrap(), data);
    }

    #[test]
    fn xz_round_trip() {
        let data = b"xz-compressed data".repeat(100);

        let mut encoder = xz2::write::XzEncoder::new(Vec::new(), 6);
        encoder.write_all(&data).unwrap();
        let compressed = encoder.finish().unwrap();

        assert_eq!(decompress(CodecKind::Xz, &compressed).unwrap(), data);
    }

    #[test]
    fn zstd_round_trip() {
        let data = b"zstd-compressed data".repeat(100);
        let compressed = zstd::encode_all(data.as_slice(), 0).unwrap();

        assert_eq!(decompress(CodecKind::Zstd, &compressed).unwrap(), data);
    }

    #[test]
    fn garbage_input_fails() {
        assert!(decompress(CodecKind::Bzip2, b"not bzip2").is_err());
        assert!(decompress(CodecKind::Zstd, b"not zstd").is_err());
    }
}
