use chrono::{DateTime, NaiveDateTime};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::CohortError;

/// Time format used by the export API and by chunk time bins
pub const API_TIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

/// Width of a chunk time bin in seconds
pub const TIME_BIN_SECS: i64 = 3600;

/// A data stream collected by the mobile app
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataStream {
    Accelerometer,
    AndroidLog,
    /// Streaming audio; archived with a video-container extension
    AudioRecordings,
    Bluetooth,
    Calls,
    Devicemotion,
    Gps,
    Gyro,
    Identifiers,
    ImageSurvey,
    IosLog,
    Magnetometer,
    PowerState,
    Proximity,
    Reachability,
    SurveyAnswers,
    SurveyTimings,
    Texts,
    Wifi,
}

impl DataStream {
    pub const ALL: [DataStream; 19] = [
        DataStream::Accelerometer,
        DataStream::AndroidLog,
        DataStream::AudioRecordings,
        DataStream::Bluetooth,
        DataStream::Calls,
        DataStream::Devicemotion,
        DataStream::Gps,
        DataStream::Gyro,
        DataStream::Identifiers,
        DataStream::ImageSurvey,
        DataStream::IosLog,
        DataStream::Magnetometer,
        DataStream::PowerState,
        DataStream::Proximity,
        DataStream::Reachability,
        DataStream::SurveyAnswers,
        DataStream::SurveyTimings,
        DataStream::Texts,
        DataStream::Wifi,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            DataStream::Accelerometer => "accelerometer",
            DataStream::AndroidLog => "android_log",
            DataStream::AudioRecordings => "audio_recordings",
            DataStream::Bluetooth => "bluetooth",
            DataStream::Calls => "calls",
            DataStream::Devicemotion => "devicemotion",
            DataStream::Gps => "gps",
            DataStream::Gyro => "gyro",
            DataStream::Identifiers => "identifiers",
            DataStream::ImageSurvey => "image_survey",
            DataStream::IosLog => "ios_log",
            DataStream::Magnetometer => "magnetometer",
            DataStream::PowerState => "power_state",
            DataStream::Proximity => "proximity",
            DataStream::Reachability => "reachability",
            DataStream::SurveyAnswers => "survey_answers",
            DataStream::SurveyTimings => "survey_timings",
            DataStream::Texts => "texts",
            DataStream::Wifi => "wifi",
        }
    }

    /// Token the devices put in uploaded file names for this stream.
    pub fn upload_token(&self) -> &'static str {
        match self {
            DataStream::Accelerometer => "accel",
            DataStream::AndroidLog => "logFile",
            DataStream::AudioRecordings => "voiceRecording",
            DataStream::Bluetooth => "bluetoothLog",
            DataStream::Calls => "callLog",
            DataStream::Devicemotion => "devicemotion",
            DataStream::Gps => "gps",
            DataStream::Gyro => "gyro",
            DataStream::Identifiers => "identifiers",
            DataStream::ImageSurvey => "imageSurvey",
            DataStream::IosLog => "iosLog",
            DataStream::Magnetometer => "magnetometer",
            DataStream::PowerState => "powerState",
            DataStream::Proximity => "proximity",
            DataStream::Reachability => "reachability",
            DataStream::SurveyAnswers => "surveyAnswers",
            DataStream::SurveyTimings => "surveyTimings",
            DataStream::Texts => "textsLog",
            DataStream::Wifi => "wifiLog",
        }
    }

    pub fn from_upload_token(token: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|s| s.upload_token() == token)
    }

    /// File extension used for this stream's entries in an export archive.
    pub fn archive_extension(&self) -> &'static str {
        match self {
            DataStream::AudioRecordings => "mp4",
            _ => "csv",
        }
    }
}

impl fmt::Display for DataStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DataStream {
    type Err = CohortError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|stream| stream.as_str() == s)
            .ok_or_else(|| CohortError::UnknownDataStream(s.to_string()))
    }
}

/// One stored unit of a participant's data for one stream and time bin.
///
/// Chunks are immutable once written and identified by `storage_path`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    pub study_id: String,
    pub participant_id: String,
    pub data_stream: DataStream,
    pub time_bin: NaiveDateTime,
    pub byte_size: u64,
    /// base64 of the BLAKE3 digest of the chunk plaintext
    pub content_hash: String,
    pub storage_path: String,
}

impl Chunk {
    /// The time bin rendered in the API time format.
    pub fn time_bin_label(&self) -> String {
        self.time_bin.format(API_TIME_FORMAT).to_string()
    }
}

/// Parse an API time string (`YYYY-MM-DDThh:mm:ss`).
pub fn parse_api_time(value: &str) -> Result<NaiveDateTime, CohortError> {
    NaiveDateTime::parse_from_str(value, API_TIME_FORMAT).map_err(|_| CohortError::InvalidTime {
        value: value.to_string(),
    })
}

/// Floor a unix-millisecond timestamp to the start of its time bin.
pub fn time_bin_from_millis(millis: i64) -> Option<NaiveDateTime> {
    let secs = millis.div_euclid(1000);
    let start = secs - secs.rem_euclid(TIME_BIN_SECS);
    DateTime::from_timestamp(start, 0).map(|dt| dt.naive_utc())
}
