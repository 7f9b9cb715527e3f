// SPDX-License-Identifier: GPL-3.0-only

//! Payload acquisition. The extraction core consumes any seekable byte
//! source; this module produces one from a local file, an HTTP(S) URL, or a
//! ZIP archive (local or remote) containing a `payload.bin` member.

use std::{
    fs::File,
    io::{self, BufReader, Cursor, Read, Seek},
    path::Path,
};

use thiserror::Error;
use tracing::debug;
use zip::{result::ZipError, ZipArchive};

use crate::stream::ReadSeek;

const PAYLOAD_MEMBER: &str = "payload.bin";

#[derive(Debug, Error)]
pub enum Error {
    #[error("Archive has no {PAYLOAD_MEMBER} member")]
    MissingPayloadMember,
    #[error("Failed to fetch {0:?}")]
    Fetch(String, #[source] attohttpc::Error),
    #[error("Request for {0:?} failed with status {1}")]
    FetchStatus(String, attohttpc::StatusCode),
    #[error("Failed to read ZIP archive")]
    Zip(#[from] ZipError),
    #[error("I/O error")]
    Io(#[from] io::Error),
}

type Result<T> = std::result::Result<T, Error>;

fn is_zip(name: &str) -> bool {
    name.to_ascii_lowercase().ends_with(".zip")
}

/// Extract the `payload.bin` member of a ZIP archive fully into memory. OTA
/// zips store the payload uncompressed, so this is a plain copy.
fn read_payload_member(reader: impl Read + Seek) -> Result<Vec<u8>> {
    let mut archive = ZipArchive::new(reader)?;

    let mut entry = match archive.by_name(PAYLOAD_MEMBER) {
        Ok(entry) => entry,
        Err(ZipError::FileNotFound) => return Err(Error::MissingPayloadMember),
        Err(e) => return Err(e.into()),
    };

    let mut data = Vec::with_capacity(entry.size() as usize);
    entry.read_to_end(&mut data)?;

    Ok(data)
}

fn open_path(path: &Path) -> Result<Box<dyn ReadSeek>> {
    let file = File::open(path)?;

    if path
        .extension()
        .is_some_and(|e| e.eq_ignore_ascii_case("zip"))
    {
        let data = read_payload_member(BufReader::new(file))?;
        Ok(Box::new(Cursor::new(data)))
    } else {
        Ok(Box::new(BufReader::new(file)))
    }
}

fn open_url(url: &str) -> Result<Box<dyn ReadSeek>> {
    let response = attohttpc::get(url)
        .send()
        .map_err(|e| Error::Fetch(url.to_owned(), e))?;

    if !response.is_success() {
        return Err(Error::FetchStatus(url.to_owned(), response.status()));
    }

    let data = response
        .bytes()
        .map_err(|e| Error::Fetch(url.to_owned(), e))?;

    debug!("Downloaded {} bytes from {url}", data.len());

    if is_zip(url) {
        let data = read_payload_member(Cursor::new(data))?;
        Ok(Box::new(Cursor::new(data)))
    } else {
        Ok(Box::new(Cursor::new(data)))
    }
}

/// Open a payload from a local path or an HTTP(S) URL. The returned reader is
/// positioned at offset 0 of the payload bytes.
pub fn open(path_or_url: &str) -> Result<Box<dyn ReadSeek>> {
    if path_or_url.starts_with("http://") || path_or_url.starts_with("https://") {
        open_url(path_or_url)
    } else {
        open_path(Path::new(path_or_url))
    }
}
