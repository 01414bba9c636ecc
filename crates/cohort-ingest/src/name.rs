//! Uploaded file names: `{participant}_{streamToken}_..._{unixMillis}.{ext}`.
//!
//! The name is also the storage layout: `_` becomes `/` under the study
//! prefix, so one participant's stream lands in one directory. Every
//! component is a single path segment; names that could climb out of the
//! study prefix are rejected.

use chrono::NaiveDateTime;
use cohort_core::types::time_bin_from_millis;
use cohort_core::DataStream;

/// A parsed, valid upload name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadName {
    pub participant_id: String,
    pub data_stream: DataStream,
    pub timestamp_ms: i64,
    pub extension: String,
    /// Stem components between the stream token and the timestamp
    middle: Vec<String>,
    stream_token: String,
}

impl UploadName {
    /// Parse a file name. Returns `None` for anything that doesn't follow the
    /// device naming scheme.
    pub fn parse(file_name: &str) -> Option<Self> {
        let (stem, extension) = file_name.rsplit_once('.')?;
        let parts: Vec<&str> = stem.split('_').collect();
        if parts.len() < 3 || !parts.iter().all(|p| is_segment(p)) || !is_segment(extension) {
            return None;
        }

        let data_stream = DataStream::from_upload_token(parts[1])?;
        let timestamp_ms: i64 = parts[parts.len() - 1].parse().ok()?;
        if timestamp_ms < 0 {
            return None;
        }

        Some(Self {
            participant_id: parts[0].to_string(),
            data_stream,
            timestamp_ms,
            extension: extension.to_ascii_lowercase(),
            middle: parts[2..parts.len() - 1].iter().map(|p| p.to_string()).collect(),
            stream_token: parts[1].to_string(),
        })
    }

    /// Object store path: `{study}/{participant}/{token}/.../{millis}.{ext}`.
    pub fn storage_path(&self, study_id: &str) -> String {
        let mut path = format!("{study_id}/{}/{}", self.participant_id, self.stream_token);
        for part in &self.middle {
            path.push('/');
            path.push_str(part);
        }
        path.push_str(&format!("/{}.{}", self.timestamp_ms, self.extension));
        path
    }

    /// Start of the hour the upload's timestamp falls in.
    pub fn time_bin(&self) -> Option<NaiveDateTime> {
        time_bin_from_millis(self.timestamp_ms)
    }
}

/// Lower-cased extension after the last `.`, if any.
pub fn extension(file_name: &str) -> Option<String> {
    file_name
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .filter(|ext| !ext.is_empty())
}

/// One path segment: non-empty, not `.`/`..`, no separators or NUL.
fn is_segment(part: &str) -> bool {
    !part.is_empty() && part != "." && part != ".." && !part.contains(['/', '\\', '\0'])
}
