// SPDX-License-Identifier: GPL-3.0-only

//! Applier for the bsdiff patches carried by SOURCE_BSDIFF and BROTLI_BSDIFF
//! install operations. Two container variants exist: classic `BSDIFF40`,
//! where the control, diff, and extra streams are all bzip2, and `BSDF2`,
//! which declares a codec per stream in the header.

use std::io::{self, Read};

use byteorder::{LittleEndian, ReadBytesExt};
use thiserror::Error;

use crate::{
    format::compression::{self, CodecKind},
    stream::ReadFixedSizeExt,
};

const BSDIFF40_MAGIC: &[u8; 8] = b"BSDIFF40";
const BSDF2_MAGIC: &[u8; 5] = b"BSDF2";

#[derive(Debug, Error)]
pub enum Error {
    #[error("Unknown patch magic: {0:?}")]
    UnknownMagic([u8; 8]),
    #[error("Unknown inner codec selector: {0}")]
    UnknownCodec(u8),
    #[error("{0:?} field is out of range: {1}")]
    FieldOutOfRange(&'static str, i64),
    #[error("Failed to decompress {0:?} stream")]
    Decompress(&'static str, #[source] compression::Error),
    #[error("I/O error")]
    Io(#[from] io::Error),
}

type Result<T> = std::result::Result<T, Error>;

fn stream_codec(selector: u8) -> Result<CodecKind> {
    match selector {
        0 => Ok(CodecKind::Stored),
        1 => Ok(CodecKind::Bzip2),
        2 => Ok(CodecKind::Zstd),
        s => Err(Error::UnknownCodec(s)),
    }
}

fn non_negative(name: &'static str, value: i64) -> Result<usize> {
    usize::try_from(value).map_err(|_| Error::FieldOutOfRange(name, value))
}

/// Old-buffer reads are clamped rather than failing: a negative seek can move
/// the cursor out of bounds and the add phase then treats the old byte as
/// zero.
fn old_byte(old: &[u8], pos: i64, index: usize) -> u8 {
    pos.checked_add_unsigned(index as u64)
        .and_then(|p| usize::try_from(p).ok())
        .and_then(|p| old.get(p).copied())
        .unwrap_or(0)
}

/// Apply a patch to `old`, producing the new buffer at the size declared in
/// the patch header. Control triples are consumed until the declared size is
/// reached or the control stream runs out; exhausted diff/extra streams leave
/// the remaining bytes zero.
pub fn apply(old: &[u8], patch: &[u8]) -> Result<Vec<u8>> {
    let mut reader = patch;

    let magic = reader.read_array_exact::<8>()?;

    let (alg_ctrl, alg_diff, alg_extra) = if magic == *BSDIFF40_MAGIC {
        (CodecKind::Bzip2, CodecKind::Bzip2, CodecKind::Bzip2)
    } else if magic[..BSDF2_MAGIC.len()] == *BSDF2_MAGIC {
        (
            stream_codec(magic[5])?,
            stream_codec(magic[6])?,
            stream_codec(magic[7])?,
        )
    } else {
        return Err(Error::UnknownMagic(magic));
    };

    let ctrl_len = reader.read_i64::<LittleEndian>()?;
    let diff_len = reader.read_i64::<LittleEndian>()?;
    let new_size = reader.read_i64::<LittleEndian>()?;

    let ctrl_raw = reader.read_vec_exact(non_negative("ctrl_len", ctrl_len)?)?;
    let diff_raw = reader.read_vec_exact(non_negative("diff_len", diff_len)?)?;
    let mut extra_raw = Vec::new();
    reader.read_to_end(&mut extra_raw)?;

    let ctrl = compression::decompress(alg_ctrl, &ctrl_raw)
        .map_err(|e| Error::Decompress("ctrl", e))?;
    let diff = compression::decompress(alg_diff, &diff_raw)
        .map_err(|e| Error::Decompress("diff", e))?;
    let extra = compression::decompress(alg_extra, &extra_raw)
        .map_err(|e| Error::Decompress("extra", e))?;

    let new_size = non_negative("new_size", new_size)?;
    let mut new = vec![0u8; new_size];

    let mut ctrl_reader = ctrl.as_slice();
    let mut old_pos: i64 = 0;
    let mut new_pos = 0usize;
    let mut diff_pos = 0usize;
    let mut extra_pos = 0usize;

    while new_pos < new_size {
        let Ok(add) = ctrl_reader.read_i64::<LittleEndian>() else {
            break;
        };
        let Ok(copy) = ctrl_reader.read_i64::<LittleEndian>() else {
            break;
        };
        let Ok(seek) = ctrl_reader.read_i64::<LittleEndian>() else {
            break;
        };

        let add = non_negative("add", add)?;
        let copy = non_negative("copy", copy)?;

        for i in 0..add {
            if new_pos + i >= new_size || diff_pos + i >= diff.len() {
                break;
            }

            new[new_pos + i] = old_byte(old, old_pos, i).wrapping_add(diff[diff_pos + i]);
        }

        new_pos = new_pos.saturating_add(add);
        old_pos = old_pos.saturating_add_unsigned(add as u64);
        diff_pos = diff_pos.saturating_add(add);

        for i in 0..copy {
            if new_pos + i >= new_size || extra_pos + i >= extra.len() {
                break;
            }

            new[new_pos + i] = extra[extra_pos + i];
        }

        new_pos = new_pos.saturating_add(copy);
        extra_pos = extra_pos.saturating_add(copy);
        old_pos = old_pos.saturating_add(seek);
    }

    Ok(new)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Build a BSDF2 patch with stored inner streams.
    fn stored_patch(ctrl: &[(i64, i64, i64)], diff: &[u8], extra: &[u8], new_size: i64) -> Vec<u8> {
        let mut ctrl_raw = Vec::new();
        for (add, copy, seek) in ctrl {
            ctrl_raw.extend_from_slice(&add.to_le_bytes());
            ctrl_raw.extend_from_slice(&copy.to_le_bytes());
            ctrl_raw.extend_from_slice(&seek.to_le_bytes());
        }

        let mut patch = Vec::new();
        patch.extend_from_slice(BSDF2_MAGIC);
        patch.extend_from_slice(&[0, 0, 0]);
        patch.extend_from_slice(&(ctrl_raw.len() as i64).to_le_bytes());
        patch.extend_from_slice(&(diff.len() as i64).to_le_bytes());
        patch.extend_from_slice(&new_size.to_le_bytes());
        patch.extend_from_slice(&ctrl_raw);
        patch.extend_from_slice(diff);
        patch.extend_from_slice(extra);
        patch
    }

    #[test]
    fn unknown_magic() {
        let patch = b"NOTADIFFxxxxxxxxxxxxxxxxxxxxxxxx";
        assert!(matches!(
            apply(b"", patch),
            Err(Error::UnknownMagic(m)) if &m == b"NOTADIFF",
        ));
    }

    #[test]
    fn unknown_codec_selector() {
        let mut patch = stored_patch(&[], b"", b"", 0);
        patch[5] = 9;
        assert!(matches!(apply(b"", &patch), Err(Error::UnknownCodec(9))));
    }

    #[test]
    fn add_and_copy() {
        // First four bytes come from old + diff, last four from extra.
        let patch = stored_patch(&[(4, 4, 0)], &[1, 1, 1, 1], b"tail", 8);
        let new = apply(&[10, 20, 30, 40], &patch).unwrap();
        assert_eq!(new, [11, 21, 31, 41, b't', b'a', b'i', b'l']);
    }

    #[test]
    fn add_wraps_bytes() {
        let patch = stored_patch(&[(1, 0, 0)], &[2], b"", 1);
        let new = apply(&[0xff], &patch).unwrap();
        assert_eq!(new, [1]);
    }

    #[test]
    fn old_reads_past_end_use_zero() {
        // add of 4 with only 2 old bytes: the tail is diff-only.
        let patch = stored_patch(&[(4, 0, 0)], &[5, 5, 5, 5], b"", 4);
        let new = apply(&[1, 2], &patch).unwrap();
        assert_eq!(new, [6, 7, 5, 5]);
    }

    #[test]
    fn negative_seek_rereads_old_data() {
        // Two add rounds over the same old bytes.
        let patch = stored_patch(&[(2, 0, -2), (2, 0, 0)], &[0, 0, 1, 1], b"", 4);
        let new = apply(&[7, 8], &patch).unwrap();
        assert_eq!(new, [7, 8, 8, 9]);
    }

    #[test]
    fn seek_below_zero_is_tolerated() {
        let patch = stored_patch(&[(0, 0, -100), (2, 0, 0)], &[3, 4], b"", 2);
        let new = apply(&[50, 60], &patch).unwrap();
        // old_pos is far negative, so the add phase sees zeros.
        assert_eq!(new, [3, 4]);
    }

    #[test]
    fn exhausted_control_leaves_zeros() {
        let patch = stored_patch(&[(1, 0, 0)], &[9], b"", 4);
        let new = apply(b"", &patch).unwrap();
        assert_eq!(new, [9, 0, 0, 0]);
    }

    #[test]
    fn exhausted_extra_leaves_zeros() {
        let patch = stored_patch(&[(0, 4, 0)], b"", b"ab", 4);
        let new = apply(b"", &patch).unwrap();
        assert_eq!(new, [b'a', b'b', 0, 0]);
    }

    #[test]
    fn negative_add_is_rejected() {
        let patch = stored_patch(&[(-1, 0, 0)], b"", b"", 4);
        assert!(matches!(
            apply(b"", &patch),
            Err(Error::FieldOutOfRange("add", -1)),
        ));
    }

    #[test]
    fn negative_copy_is_rejected() {
        let patch = stored_patch(&[(0, -3, 0)], b"", b"", 4);
        assert!(matches!(
            apply(b"", &patch),
            Err(Error::FieldOutOfRange("copy", -3)),
        ));
    }

    #[test]
    fn negative_new_size_is_rejected() {
        let patch = stored_patch(&[], b"", b"", -1);
        assert!(matches!(
            apply(b"", &patch),
            Err(Error::FieldOutOfRange("new_size", -1)),
        ));
    }

    #[test]
    fn truncated_header() {
        assert!(matches!(apply(b"", b"BSDF2\x00\x00"), Err(Error::Io(_))));
    }

    #[test]
    fn bsdiff40_uses_bzip2_streams() {
        use std::io::Write;

        let compress = |data: &[u8]| {
            let mut encoder =
                bzip2::write::BzEncoder::new(Vec::new(), bzip2::Compression::default());
            encoder.write_all(data).unwrap();
            encoder.finish().unwrap()
        };

        let mut ctrl_raw = Vec::new();
        for field in [4i64, 0, 0] {
            ctrl_raw.extend_from_slice(&field.to_le_bytes());
        }

        let ctrl = compress(&ctrl_raw);
        let diff = compress(&[1, 1, 1, 1]);
        let extra = compress(b"");

        let mut patch = Vec::new();
        patch.extend_from_slice(BSDIFF40_MAGIC);
        patch.extend_from_slice(&(ctrl.len() as i64).to_le_bytes());
        patch.extend_from_slice(&(diff.len() as i64).to_le_bytes());
        patch.extend_from_slice(&4i64.to_le_bytes());
        patch.extend_from_slice(&ctrl);
        patch.extend_from_slice(&diff);
        patch.extend_from_slice(&extra);

        let new = apply(&[1, 2, 3, 4], &patch).unwrap();
        assert_eq!(new, [2, 3, 4, 5]);
    }
}
