//! Extraction of the extension list from an exported extension-manifest image
//!
//! The manifest image carries a single `image-digests` file with one
//! `registry/repository:tag@digest` entry per line.

use std::io::{self, BufRead, BufReader, Read};

use tracing::debug;

use crate::catalog::error::ExtractError;
use crate::catalog::reference::{ExtensionRef, TaggedReference};

/// Name of the archive entry listing the extension images
pub const DIGESTS_FILE: &str = "image-digests";

/// Longest accepted `image-digests` line in bytes, excluding the newline (64 KiB)
pub const MAX_LINE_LEN: usize = 64 * 1024;

/// Read the extension refs out of a tar stream.
///
/// The archive is consumed entry by entry without buffering it, and no more
/// than one line of `image-digests` is held in memory at a time. Lines without
/// an `@` separator are skipped, but a line whose reference part does not parse
/// fails the whole extraction. Refs are returned in the order they appear.
pub fn extract_extension_list<R: Read>(reader: R) -> Result<Vec<ExtensionRef>, ExtractError> {
    let mut archive = tar::Archive::new(reader);
    let mut extensions = Vec::new();

    for entry in archive.entries().map_err(ExtractError::ReadHeader)? {
        let mut entry = entry.map_err(ExtractError::ReadHeader)?;

        if &*entry.path_bytes() != DIGESTS_FILE.as_bytes() {
            continue;
        }

        let mut reader = BufReader::new(&mut entry);
        let mut buf = Vec::new();
        while read_line(&mut reader, &mut buf).map_err(ExtractError::ReadDigests)? {
            let line = std::str::from_utf8(&buf)
                .map_err(|e| ExtractError::ReadDigests(io::Error::new(io::ErrorKind::InvalidData, e)))?
                .trim();

            let Some((tagged, digest)) = line.split_once('@') else {
                if !line.is_empty() {
                    debug!("Skipping {} line without digest: {}", DIGESTS_FILE, line);
                }
                continue;
            };

            let tagged_reference: TaggedReference =
                tagged
                    .parse()
                    .map_err(|source| ExtractError::InvalidReference {
                        reference: tagged.to_string(),
                        source,
                    })?;

            extensions.push(ExtensionRef {
                tagged_reference,
                digest: digest.to_string(),
            });
        }
    }

    // An empty digests file is treated the same as a missing one
    if extensions.is_empty() {
        return Err(ExtractError::DigestsNotFound);
    }

    Ok(extensions)
}

/// Read the next line into `buf` without its newline; `false` at end of input.
///
/// Fails with `InvalidData` once a line grows past [`MAX_LINE_LEN`], without
/// reading the rest of it.
fn read_line<R: BufRead>(reader: &mut R, buf: &mut Vec<u8>) -> io::Result<bool> {
    buf.clear();

    let read = reader
        .by_ref()
        .take(MAX_LINE_LEN as u64 + 1)
        .read_until(b'\n', buf)?;
    if read == 0 {
        return Ok(false);
    }

    if buf.last() == Some(&b'\n') {
        buf.pop();
    } else if buf.len() > MAX_LINE_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("line longer than {} bytes", MAX_LINE_LEN),
        ));
    }

    Ok(true)
}
