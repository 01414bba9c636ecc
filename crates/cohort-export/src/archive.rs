//! ZIP assembly for exports.
//!
//! Entries are laid out as `{participant}/{stream}/{timeBin}.{ext}` with the
//! `:` separators of the time bin replaced by `_`, so archives unpack on
//! filesystems that reject colons.

use std::collections::{HashMap, HashSet};
use std::io::{Cursor, Write};

use cohort_core::Chunk;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

/// Entry holding the updated manifest in raw-mode archives
pub const MANIFEST_ENTRY: &str = "registry";

/// File name offered for download-mode archives
pub const DOWNLOAD_FILE_NAME: &str = "data.zip";

/// Archive entry name for a chunk.
pub fn entry_name(chunk: &Chunk) -> String {
    format!(
        "{}/{}/{}.{}",
        chunk.participant_id,
        chunk.data_stream,
        chunk.time_bin_label().replace(':', "_"),
        chunk.data_stream.archive_extension()
    )
}

/// In-memory deflate ZIP writer.
///
/// Two chunks can share a participant, stream and hour; the second and later
/// get a `-1`, `-2`, ... suffix before the extension instead of colliding.
pub struct ArchiveWriter {
    zip: ZipWriter<Cursor<Vec<u8>>>,
    options: SimpleFileOptions,
    next_suffix: HashMap<String, usize>,
    used: HashSet<String>,
}

impl ArchiveWriter {
    pub fn new() -> Self {
        Self {
            zip: ZipWriter::new(Cursor::new(Vec::new())),
            options: SimpleFileOptions::default().compression_method(CompressionMethod::Deflated),
            next_suffix: HashMap::new(),
            used: HashSet::new(),
        }
    }

    /// Add an entry, returning the name it was written under.
    pub fn add(&mut self, name: &str, data: &[u8]) -> zip::result::ZipResult<String> {
        let name = self.unique_name(name);
        self.zip.start_file(name.as_str(), self.options)?;
        self.zip.write_all(data)?;
        Ok(name)
    }

    pub fn finish(self) -> zip::result::ZipResult<Vec<u8>> {
        Ok(self.zip.finish()?.into_inner())
    }

    fn unique_name(&mut self, name: &str) -> String {
        if self.used.insert(name.to_string()) {
            return name.to_string();
        }
        let split = name
            .rsplit_once('.')
            .filter(|(stem, ext)| !stem.is_empty() && !ext.contains('/'));
        let next = self.next_suffix.entry(name.to_string()).or_insert(1);
        loop {
            let candidate = match split {
                Some((stem, ext)) => format!("{stem}-{next}.{ext}"),
                None => format!("{name}-{next}"),
            };
            *next += 1;
            if self.used.insert(candidate.clone()) {
                return candidate;
            }
        }
    }
}

impl Default for ArchiveWriter {
    fn default() -> Self {
        Self::new()
    }
}
