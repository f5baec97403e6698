use std::path::Path;

use log::{debug, info};
use serde::{Deserialize, Serialize};

use crate::command::CommandInvocation;
use crate::error::{MetadataError, ToolRole, TranscodeResult};
use crate::options::{Size, TextOrNumber};
use crate::supervisor::ExecutionSupervisor;

/// Builds the ffprobe invocation requesting container and stream metadata as JSON.
pub fn probe_invocation(ffprobe: &str, asset: &Path) -> CommandInvocation {
    CommandInvocation::argv(ToolRole::Probe, ffprobe)
        .args(["-v", "error", "-print_format", "json", "-show_format", "-show_streams"])
        .arg(asset)
        .capture_stdout(true)
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawFormat {
    #[serde(default)]
    pub duration: Option<TextOrNumber>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawStream {
    #[serde(default)]
    pub codec_type: Option<String>,
    #[serde(default)]
    pub codec_name: Option<String>,
    #[serde(default)]
    pub color_space: Option<String>,
    #[serde(default)]
    pub width: Option<u32>,
    #[serde(default)]
    pub height: Option<u32>,
    #[serde(default)]
    pub sample_aspect_ratio: Option<String>,
    #[serde(default)]
    pub display_aspect_ratio: Option<String>,
    #[serde(default)]
    pub r_frame_rate: Option<String>,
    #[serde(default)]
    pub bit_rate: Option<TextOrNumber>,
    #[serde(default)]
    pub sample_rate: Option<TextOrNumber>,
    #[serde(default)]
    pub channels: Option<TextOrNumber>,
    #[serde(default)]
    pub bits_per_sample: Option<TextOrNumber>,
}

/// ffprobe output, as parsed from its JSON writer.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawProbeResult {
    #[serde(default)]
    pub format: Option<RawFormat>,
    #[serde(default)]
    pub streams: Vec<RawStream>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VideoInfo {
    pub codec: String,
    pub color: Option<String>,
    pub resolution: Size,
    pub sar: Option<String>,
    pub dar: Option<String>,
    pub framerate: String,
    pub bitrate: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AudioInfo {
    pub codec: String,
    pub frequency: u32,
    pub channels: u32,
    pub depth: u32,
    pub bitrate: u64,
}

/// Canonical description of a media file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metadata {
    pub duration: f64,
    pub video: Option<VideoInfo>,
    pub audio: Option<AudioInfo>,
}

impl RawProbeResult {
    pub fn normalize(&self) -> Result<Metadata, MetadataError> {
        let duration = self
            .format
            .as_ref()
            .and_then(|f| f.duration.as_ref())
            .and_then(loose_f64)
            .filter(|d| *d >= 0.0)
            .unwrap_or(0.0);

        Ok(Metadata {
            duration,
            video: self.last_stream("video").map(video_info).transpose()?,
            audio: self.last_stream("audio").map(audio_info).transpose()?,
        })
    }

    // When a file carries several streams of a kind, the last one wins.
    fn last_stream(&self, kind: &str) -> Option<&RawStream> {
        let mut matching = self
            .streams
            .iter()
            .filter(|s| s.codec_type.as_deref() == Some(kind));
        let count = matching.clone().count();
        if count > 1 {
            debug!("Found {} {} streams, using the last one", count, kind);
        }
        matching.next_back()
    }
}

fn video_info(stream: &RawStream) -> Result<VideoInfo, MetadataError> {
    let missing = |field| MetadataError::MissingField {
        stream: "video",
        field,
    };
    let width = stream.width.ok_or_else(|| missing("width"))?;
    let height = stream.height.ok_or_else(|| missing("height"))?;
    Ok(VideoInfo {
        codec: codec_name(stream).ok_or_else(|| missing("codec_name"))?,
        color: stream.color_space.clone(),
        resolution: Size::new(width, height),
        sar: stream.sample_aspect_ratio.clone(),
        dar: stream.display_aspect_ratio.clone(),
        framerate: stream
            .r_frame_rate
            .clone()
            .ok_or_else(|| missing("r_frame_rate"))?,
        bitrate: stream.bit_rate.as_ref().and_then(loose_u64),
    })
}

fn audio_info(stream: &RawStream) -> Result<AudioInfo, MetadataError> {
    let missing = |field| MetadataError::MissingField {
        stream: "audio",
        field,
    };
    let required = |value: &Option<TextOrNumber>, field| {
        value.as_ref().and_then(loose_u64).ok_or_else(|| missing(field))
    };
    let required_u32 = |value: &Option<TextOrNumber>, field| {
        let wide = required(value, field)?;
        u32::try_from(wide).map_err(|_| MetadataError::OutOfRange {
            stream: "audio",
            field,
            value: wide,
        })
    };
    Ok(AudioInfo {
        codec: codec_name(stream).ok_or_else(|| missing("codec_name"))?,
        frequency: required_u32(&stream.sample_rate, "sample_rate")?,
        channels: required_u32(&stream.channels, "channels")?,
        depth: required_u32(&stream.bits_per_sample, "bits_per_sample")?,
        bitrate: required(&stream.bit_rate, "bit_rate")?,
    })
}

fn codec_name(stream: &RawStream) -> Option<String> {
    stream
        .codec_name
        .as_ref()
        .map(|c| c.trim().to_string())
        .filter(|c| !c.is_empty())
}

fn loose_f64(value: &TextOrNumber) -> Option<f64> {
    match value {
        TextOrNumber::Number(n) => n.as_f64(),
        TextOrNumber::Text(s) => s.trim().parse().ok(),
    }
}

fn loose_u64(value: &TextOrNumber) -> Option<u64> {
    match value {
        TextOrNumber::Number(n) => n.as_u64(),
        TextOrNumber::Text(s) => s.trim().parse().ok(),
    }
}

/// Runs ffprobe against assets and normalizes the result.
#[derive(Debug, Clone)]
pub struct AssetProbe {
    ffprobe: String,
    supervisor: ExecutionSupervisor,
}

impl AssetProbe {
    pub fn new(ffprobe: impl Into<String>, supervisor: ExecutionSupervisor) -> Self {
        AssetProbe {
            ffprobe: ffprobe.into(),
            supervisor,
        }
    }

    pub fn probe(&self, asset: &Path) -> TranscodeResult<RawProbeResult> {
        let invocation = probe_invocation(&self.ffprobe, asset);
        let command = invocation.to_string();
        info!("Probing {:?}", asset);
        let result = self.supervisor.execute_quiet(&invocation)?;
        if result.stdout.trim().is_empty() {
            return Err(MetadataError::NoProbeOutput {
                command,
                diagnostics: result.stderr,
            }
            .into());
        }
        let raw = serde_json::from_str(&result.stdout)
            .map_err(|source| MetadataError::InvalidProbeOutput { command, source })?;
        Ok(raw)
    }

    pub fn metadata(&self, asset: &Path) -> TranscodeResult<Metadata> {
        Ok(self.probe(asset)?.normalize()?)
    }
}
