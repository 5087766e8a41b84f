//! Flattening of image layers into a single filesystem tar stream

use std::collections::BTreeMap;
use std::io::{self, Read};
use std::path::{Component, Path, PathBuf};

use tar::EntryType;

/// Prefix marking a file removed by an upper layer
const WHITEOUT_PREFIX: &str = ".wh.";

/// Marker hiding every lower-layer entry of its directory
const OPAQUE_WHITEOUT: &str = ".wh..wh..opq";

/// Largest file accepted from a layer (100 MiB)
pub const MAX_ENTRY_SIZE: u64 = 100 * 1024 * 1024;

struct ExportEntry {
    header: tar::Header,
    link_name: Option<PathBuf>,
    data: Vec<u8>,
}

enum Whiteout {
    File(PathBuf),
    Opaque(PathBuf),
}

/// Merge uncompressed layer tarballs (lowest first) into one tar archive.
///
/// Upper layers replace entries at the same path and apply OCI whiteouts
/// to the layers below them. Entries are written in path order. A file larger
/// than [`MAX_ENTRY_SIZE`] fails the export with `InvalidData`.
///
/// Blocking: decompression and copying happen synchronously.
pub fn flatten_layers<R: Read>(layers: Vec<R>) -> io::Result<Vec<u8>> {
    flatten_layers_with_limit(layers, MAX_ENTRY_SIZE)
}

fn flatten_layers_with_limit<R: Read>(layers: Vec<R>, max_entry_size: u64) -> io::Result<Vec<u8>> {
    let mut merged: BTreeMap<PathBuf, ExportEntry> = BTreeMap::new();

    for layer in layers {
        let mut archive = tar::Archive::new(layer);
        let mut whiteouts = Vec::new();
        let mut added = Vec::new();

        for entry in archive.entries()? {
            let mut entry = entry?;

            if entry.header().entry_type() == EntryType::XGlobalHeader {
                continue;
            }

            let path = normalize(&entry.path()?);
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            let parent = path.parent().unwrap_or(Path::new("")).to_path_buf();

            if name == OPAQUE_WHITEOUT {
                whiteouts.push(Whiteout::Opaque(parent));
                continue;
            }
            if let Some(hidden) = name.strip_prefix(WHITEOUT_PREFIX) {
                whiteouts.push(Whiteout::File(parent.join(hidden)));
                continue;
            }

            let size = entry.size();
            if size > max_entry_size {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!(
                        "layer entry {} too large ({} bytes, max {} bytes)",
                        path.display(),
                        size,
                        max_entry_size
                    ),
                ));
            }

            let link_name = entry.link_name()?.map(|link| link.into_owned());
            let mut data = Vec::with_capacity(size as usize);
            entry.by_ref().take(max_entry_size).read_to_end(&mut data)?;

            added.push((
                path,
                ExportEntry {
                    header: entry.header().clone(),
                    link_name,
                    data,
                },
            ));
        }

        // Whiteouts only affect the layers below
        for whiteout in whiteouts {
            match whiteout {
                Whiteout::File(target) => merged.retain(|path, _| !path.starts_with(&target)),
                Whiteout::Opaque(dir) => {
                    merged.retain(|path, _| path == &dir || !path.starts_with(&dir))
                }
            }
        }
        merged.extend(added);
    }

    let mut builder = tar::Builder::new(Vec::new());
    for (path, mut entry) in merged {
        match entry.link_name {
            Some(link) => builder.append_link(&mut entry.header, &path, &link)?,
            None => builder.append_data(&mut entry.header, &path, entry.data.as_slice())?,
        }
    }
    builder.into_inner()
}

/// Strip `./` and leading `/` so that paths from different layers compare equal
fn normalize(path: &Path) -> PathBuf {
    path.components()
        .filter(|c| matches!(c, Component::Normal(_)))
        .collect()
}
