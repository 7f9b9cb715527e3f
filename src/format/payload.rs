// SPDX-License-Identifier: GPL-3.0-only

use std::{
    collections::HashSet,
    fs::File,
    io::{self, Read, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
};

use byteorder::{BigEndian, ReadBytesExt};
use num_traits::ToPrimitive;
use prost::Message;
use ring::digest;
use thiserror::Error;
use tracing::{info, warn};

use crate::{
    format::{
        bsdiff,
        compression::{self, CodecKind},
    },
    protobuf::chromeos_update_engine::{
        install_operation::Type, DeltaArchiveManifest, Extent, InstallOperation, PartitionUpdate,
    },
    stream::{FromReader, ReadFixedSizeExt, WriteZerosExt},
    util::NumBytes,
};

const OTA_MAGIC: &[u8; 4] = b"CrAU";
const PAYLOAD_VERSION: u64 = 2;
const DEFAULT_BLOCK_SIZE: u32 = 4096;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Unknown magic: {0:?}")]
    UnknownMagic([u8; 4]),
    #[error("Unsupported payload version: {0}")]
    UnsupportedVersion(u64),
    #[error("Failed to decode payload manifest")]
    ManifestDecode(#[from] prost::DecodeError),
    #[error("Unsupported partition operation: {0}")]
    UnsupportedOperation(i32),
    #[error("Expected sha256 {expected}, but have {actual}")]
    MismatchedDigest { expected: String, actual: String },
    #[error("Operation requires an old image, but none is available")]
    MissingOldImage,
    #[error("Operation has no destination extents")]
    MissingDstExtents,
    #[error("{0:?} field is missing")]
    MissingField(&'static str),
    #[error("{0:?} field exceeds integer bounds")]
    IntegerTooLarge(&'static str),
    #[error("No partitions match the requested image names")]
    NoMatchingPartitions,
    #[error("Failed to extract partition {name}")]
    Partition {
        name: String,
        #[source]
        source: Box<Error>,
    },
    #[error("Failed to apply bsdiff patch")]
    Bsdiff(#[from] bsdiff::Error),
    #[error("Decompression error")]
    Compression(#[from] compression::Error),
    #[error("I/O error")]
    Io(#[from] io::Error),
}

type Result<T> = std::result::Result<T, Error>;

#[derive(Clone, Debug)]
pub struct PayloadHeader {
    pub version: u64,
    pub manifest: DeltaArchiveManifest,
    pub metadata_signature_size: u32,
    /// Offset of the first blob byte within the payload. Operation
    /// `data_offset` values are relative to this.
    pub blob_offset: u64,
}

impl PayloadHeader {
    pub fn block_size(&self) -> u32 {
        self.manifest.block_size.unwrap_or(DEFAULT_BLOCK_SIZE)
    }

    pub fn is_full_ota(&self) -> bool {
        self.manifest
            .partitions
            .iter()
            .all(|p| p.old_partition_info.is_none())
    }
}

impl<R: Read + Seek> FromReader<R> for PayloadHeader {
    type Error = Error;

    /// Parse the header from an OTA payload file. After this function returns,
    /// the file position is set to the beginning of the blob section.
    fn from_reader(mut reader: R) -> Result<Self> {
        let magic = reader.read_array_exact::<4>()?;
        if magic != *OTA_MAGIC {
            return Err(Error::UnknownMagic(magic));
        }

        let version = reader.read_u64::<BigEndian>()?;
        if version != PAYLOAD_VERSION {
            return Err(Error::UnsupportedVersion(version));
        }

        let manifest_size = reader
            .read_u64::<BigEndian>()?
            .to_usize()
            .ok_or(Error::IntegerTooLarge("manifest_size"))?;
        let metadata_signature_size = reader.read_u32::<BigEndian>()?;

        let manifest_raw = reader.read_vec_exact(manifest_size)?;
        let manifest = DeltaArchiveManifest::decode(manifest_raw.as_slice())?;

        // Skip the metadata signatures without reading them.
        reader.seek(SeekFrom::Current(metadata_signature_size.into()))?;

        Ok(Self {
            version,
            manifest,
            metadata_signature_size,
            blob_offset: reader.stream_position()?,
        })
    }
}

fn operation_type(op: &InstallOperation) -> Result<Type> {
    Type::try_from(op.r#type).map_err(|_| Error::UnsupportedOperation(op.r#type))
}

/// Compute an extent's byte offset and length.
fn extent_range(extent: &Extent, block_size: u32) -> Result<(u64, u64)> {
    let start_block = extent
        .start_block
        .ok_or(Error::MissingField("start_block"))?;
    let num_blocks = extent.num_blocks.ok_or(Error::MissingField("num_blocks"))?;

    let offset = start_block
        .checked_mul(block_size.into())
        .ok_or(Error::IntegerTooLarge("start_block"))?;
    let length = num_blocks
        .checked_mul(block_size.into())
        .ok_or(Error::IntegerTooLarge("num_blocks"))?;

    Ok((offset, length))
}

/// Read an operation's blob data and verify its digest when one is declared.
/// The digest covers the bytes exactly as stored, before any decompression.
fn read_operation_data(
    reader: &mut (impl Read + Seek),
    blob_offset: u64,
    op: &InstallOperation,
) -> Result<Vec<u8>> {
    let data_length = op.data_length.unwrap_or(0);
    if data_length == 0 {
        return Ok(Vec::new());
    }

    let data_offset = op.data_offset.ok_or(Error::MissingField("data_offset"))?;
    let offset = blob_offset
        .checked_add(data_offset)
        .ok_or(Error::IntegerTooLarge("data_offset"))?;

    reader.seek(SeekFrom::Start(offset))?;

    let data = reader.read_vec_exact(
        data_length
            .to_usize()
            .ok_or(Error::IntegerTooLarge("data_length"))?,
    )?;

    if let Some(expected) = &op.data_sha256_hash {
        let actual = digest::digest(&digest::SHA256, &data);

        if actual.as_ref() != expected.as_slice() {
            return Err(Error::MismatchedDigest {
                expected: hex::encode(expected),
                actual: hex::encode(actual),
            });
        }
    }

    Ok(data)
}

/// Write `data` at the byte offset of the first destination extent. Source
/// and destination extent lists may differ in cardinality, so the data forms
/// one contiguous region anchored at the first destination extent.
fn write_anchored(
    writer: &mut (impl Write + Seek),
    op: &InstallOperation,
    block_size: u32,
    data: &[u8],
) -> Result<()> {
    let first = op.dst_extents.first().ok_or(Error::MissingDstExtents)?;
    let (offset, _) = extent_range(first, block_size)?;

    writer.seek(SeekFrom::Start(offset))?;
    writer.write_all(data)?;

    Ok(())
}

fn write_zero(
    writer: &mut (impl Write + Seek),
    op: &InstallOperation,
    block_size: u32,
) -> Result<()> {
    for extent in &op.dst_extents {
        let (offset, length) = extent_range(extent, block_size)?;

        writer.seek(SeekFrom::Start(offset))?;
        writer.write_zeros_exact(length)?;
    }

    Ok(())
}

/// Concatenate the byte ranges of all source extents into one buffer.
fn gather_source(
    old_file: &mut (impl Read + Seek),
    op: &InstallOperation,
    block_size: u32,
) -> Result<Vec<u8>> {
    let mut data = Vec::new();

    for extent in &op.src_extents {
        let (offset, length) = extent_range(extent, block_size)?;
        let length = length
            .to_usize()
            .ok_or(Error::IntegerTooLarge("num_blocks"))?;

        old_file.seek(SeekFrom::Start(offset))?;

        let start = data.len();
        data.resize(start + length, 0);
        old_file.read_exact(&mut data[start..])?;
    }

    Ok(data)
}

fn source_copy(
    writer: &mut (impl Write + Seek),
    old_file: Option<&mut File>,
    op: &InstallOperation,
    block_size: u32,
) -> Result<()> {
    let old_file = old_file.ok_or(Error::MissingOldImage)?;
    let data = gather_source(old_file, op, block_size)?;

    write_anchored(writer, op, block_size, &data)
}

/// Gather the source extents, apply the bsdiff patch, and scatter the result
/// across the destination extents in order. A result shorter than the
/// destination extents leaves the trailing extents unwritten.
fn source_bsdiff(
    writer: &mut (impl Write + Seek),
    old_file: Option<&mut File>,
    op: &InstallOperation,
    block_size: u32,
    patch: &[u8],
) -> Result<()> {
    let old_file = old_file.ok_or(Error::MissingOldImage)?;
    let old_data = gather_source(old_file, op, block_size)?;

    let patched = bsdiff::apply(&old_data, patch)?;

    let mut pos = 0;
    for extent in &op.dst_extents {
        if pos == patched.len() {
            break;
        }

        let (offset, length) = extent_range(extent, block_size)?;
        let length = length
            .to_usize()
            .ok_or(Error::IntegerTooLarge("num_blocks"))?;
        let end = patched.len().min(pos + length);

        writer.seek(SeekFrom::Start(offset))?;
        writer.write_all(&patched[pos..end])?;

        pos = end;
    }

    Ok(())
}

/// Apply a single install operation, reading blob data from `reader` and
/// writing image data to `writer`.
pub fn apply_operation(
    reader: &mut (impl Read + Seek),
    writer: &mut (impl Write + Seek),
    old_file: Option<&mut File>,
    block_size: u32,
    blob_offset: u64,
    op: &InstallOperation,
) -> Result<()> {
    let data = read_operation_data(reader, blob_offset, op)?;

    match operation_type(op)? {
        Type::Replace => write_anchored(writer, op, block_size, &data),
        Type::ReplaceBz => {
            let data = compression::decompress(CodecKind::Bzip2, &data)?;
            write_anchored(writer, op, block_size, &data)
        }
        Type::ReplaceXz => {
            let data = compression::decompress(CodecKind::Xz, &data)?;
            write_anchored(writer, op, block_size, &data)
        }
        Type::Zstd => {
            let data = compression::decompress(CodecKind::Zstd, &data)?;
            write_anchored(writer, op, block_size, &data)
        }
        Type::Zero => write_zero(writer, op, block_size),
        Type::SourceCopy => source_copy(writer, old_file, op, block_size),
        Type::SourceBsdiff | Type::BrotliBsdiff => {
            source_bsdiff(writer, old_file, op, block_size, &data)
        }
        _ => Err(Error::UnsupportedOperation(op.r#type)),
    }
}

/// Sum of the destination extent sizes across all of a partition's
/// operations. Used as the expected image size when the manifest doesn't
/// declare one.
fn dst_extents_size(partition: &PartitionUpdate, block_size: u32) -> u64 {
    partition
        .operations
        .iter()
        .flat_map(|op| &op.dst_extents)
        .map(|extent| {
            extent
                .num_blocks
                .unwrap_or(0)
                .saturating_mul(block_size.into())
        })
        .fold(0u64, u64::saturating_add)
}

fn extract_partition(
    reader: &mut (impl Read + Seek),
    partition: &PartitionUpdate,
    block_size: u32,
    blob_offset: u64,
    out_dir: &Path,
    old_dir: &Path,
    use_diff: bool,
) -> Result<()> {
    let name = &partition.partition_name;

    let mut out_file = File::create(out_dir.join(format!("{name}.img")))?;

    // Absence is tolerated here. Only operations that actually need the old
    // image fail without it.
    let mut old_file = if use_diff {
        File::open(old_dir.join(format!("{name}.img"))).ok()
    } else {
        None
    };

    let extents_size = dst_extents_size(partition, block_size);
    let image_size = match partition.new_partition_info.as_ref().and_then(|i| i.size) {
        Some(size) => {
            if extents_size != 0 && size != extents_size {
                warn!(
                    "Partition {name} declares {size} bytes, but operations cover {extents_size}"
                );
            }
            size
        }
        None => extents_size,
    };

    // Pre-size the image so unwritten ranges read back as zeros.
    out_file.set_len(image_size)?;

    info!(
        "Extracting {name} ({} operations, {:?})",
        partition.operations.len(),
        NumBytes(image_size),
    );

    for op in &partition.operations {
        apply_operation(
            reader,
            &mut out_file,
            old_file.as_mut(),
            block_size,
            blob_offset,
            op,
        )?;
    }

    Ok(())
}

/// A single-payload extraction session. Owns the payload reader and the
/// decoded header and extracts one partition at a time, sequentially, in
/// manifest order.
pub struct Extractor<R: Read + Seek> {
    reader: R,
    header: PayloadHeader,
    out_dir: PathBuf,
    old_dir: PathBuf,
    use_diff: bool,
}

impl<R: Read + Seek> Extractor<R> {
    pub fn new(
        mut reader: R,
        out_dir: impl Into<PathBuf>,
        old_dir: impl Into<PathBuf>,
        use_diff: bool,
    ) -> Result<Self> {
        let header = PayloadHeader::from_reader(&mut reader)?;

        Ok(Self {
            reader,
            header,
            out_dir: out_dir.into(),
            old_dir: old_dir.into(),
            use_diff,
        })
    }

    pub fn header(&self) -> &PayloadHeader {
        &self.header
    }

    /// Extract the named partitions, or every partition if `images` is empty.
    /// Names are matched case-sensitively after trimming surrounding
    /// whitespace. The first failing partition aborts the session.
    pub fn extract(&mut self, images: &[String]) -> Result<()> {
        let block_size = self.header.block_size();
        let blob_offset = self.header.blob_offset;

        let selection = if images.is_empty() {
            None
        } else {
            Some(images.iter().map(|n| n.trim()).collect::<HashSet<_>>())
        };

        let partitions = self
            .header
            .manifest
            .partitions
            .iter()
            .filter(|p| match &selection {
                Some(wanted) => wanted.contains(p.partition_name.as_str()),
                None => true,
            })
            .collect::<Vec<_>>();

        if partitions.is_empty() && selection.is_some() {
            return Err(Error::NoMatchingPartitions);
        }

        for partition in partitions {
            extract_partition(
                &mut self.reader,
                partition,
                block_size,
                blob_offset,
                &self.out_dir,
                &self.old_dir,
                self.use_diff,
            )
            .map_err(|e| Error::Partition {
                name: partition.partition_name.clone(),
                source: Box::new(e),
            })?;
        }

        Ok(())
    }
}
