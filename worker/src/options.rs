use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::ConfigError;

/// A frame size, written `WidthxHeight` on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Size {
    pub width: u32,
    pub height: u32,
}

impl Size {
    pub fn new(width: u32, height: u32) -> Self {
        Size { width, height }
    }

    /// The `W:H` form the ffmpeg scale filter expects.
    pub fn scale_arg(&self) -> String {
        format!("{}:{}", self.width, self.height)
    }

    pub fn exceeds(&self, other: &Size) -> bool {
        self.width > other.width || self.height > other.height
    }
}

impl fmt::Display for Size {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

impl FromStr for Size {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ConfigError::InvalidSize {
            value: s.to_string(),
        };
        let (w, h) = s.trim().split_once('x').ok_or_else(invalid)?;
        let width = w.trim().parse::<u32>().map_err(|_| invalid())?;
        let height = h.trim().parse::<u32>().map_err(|_| invalid())?;
        Ok(Size { width, height })
    }
}

impl Serialize for Size {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Size {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Callers send frame rates and similar values either as JSON numbers or strings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TextOrNumber {
    Number(serde_json::Number),
    Text(String),
}

impl fmt::Display for TextOrNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TextOrNumber::Number(n) => write!(f, "{}", n),
            TextOrNumber::Text(s) => f.write_str(s),
        }
    }
}

/// Boolean flag that also accepts the strings "true"/"false".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Flag {
    Bool(bool),
    Text(String),
}

impl Flag {
    pub fn is_true(&self) -> bool {
        match self {
            Flag::Bool(b) => *b,
            Flag::Text(s) => s.trim().eq_ignore_ascii_case("true"),
        }
    }

    pub fn is_false(&self) -> bool {
        match self {
            Flag::Bool(b) => !*b,
            Flag::Text(s) => s.trim().eq_ignore_ascii_case("false"),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OutputFileInfo {
    pub basename: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawWatermark {
    pub bucket: String,
    pub file: String,
    pub opacity: f64,
    pub size: String,
    pub x: i64,
    pub y: i64,
}

/// Output description exactly as the caller sends it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawOutputSpec {
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preset: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_cmd: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub video_codec: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audio_codec: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub video_bitrate: Option<TextOrNumber>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audio_bitrate: Option<TextOrNumber>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frame_rate: Option<TextOrNumber>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keep_ratio: Option<Flag>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allow_upscale: Option<Flag>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub watermark: Option<RawWatermark>,
    #[serde(default)]
    pub output_file_info: OutputFileInfo,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot_sec: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub intervals: Option<f64>,
}

/// Overlay request. Negative offsets anchor to the right/bottom edge.
#[derive(Debug, Clone, PartialEq)]
pub struct WatermarkSpec {
    pub bucket: String,
    pub key: String,
    pub opacity: f64,
    pub size: Size,
    pub x: i64,
    pub y: i64,
}

impl TryFrom<&RawWatermark> for WatermarkSpec {
    type Error = ConfigError;

    fn try_from(raw: &RawWatermark) -> Result<Self, Self::Error> {
        if !(0.0..=1.0).contains(&raw.opacity) {
            return Err(ConfigError::invalid_output(format!(
                "watermark opacity {} is outside [0, 1]",
                raw.opacity
            )));
        }
        if raw.file.trim().is_empty() {
            return Err(ConfigError::invalid_output("watermark file is empty"));
        }
        Ok(WatermarkSpec {
            bucket: raw.bucket.clone(),
            key: raw.file.clone(),
            opacity: raw.opacity,
            size: raw.size.parse()?,
            x: raw.x,
            y: raw.y,
        })
    }
}

/// Per-output values that take precedence over the preset.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct VideoOverrides {
    pub size: Option<Size>,
    pub video_codec: Option<String>,
    pub audio_codec: Option<String>,
    pub video_bitrate: Option<String>,
    pub audio_bitrate: Option<String>,
    pub frame_rate: Option<String>,
}

impl VideoOverrides {
    pub fn is_complete(&self) -> bool {
        self.size.is_some()
            && self.video_codec.is_some()
            && self.audio_codec.is_some()
            && self.video_bitrate.is_some()
            && self.audio_bitrate.is_some()
            && self.frame_rate.is_some()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct VideoOutput {
    pub overrides: VideoOverrides,
    pub keep_ratio: bool,
    pub allow_upscale: bool,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ThumbnailMode {
    Snapshot { at_sec: Option<f64> },
    Intervals { every_sec: Option<f64> },
}

#[derive(Debug, Clone, PartialEq)]
pub struct ThumbnailOutput {
    pub size: Option<Size>,
    pub mode: ThumbnailMode,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CustomOutput {
    pub template: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum OutputTarget {
    Video(VideoOutput),
    Thumbnail(ThumbnailOutput),
    Custom(CustomOutput),
}

/// A validated output description. The variant is decided once, here.
#[derive(Debug, Clone, PartialEq)]
pub struct OutputSpec {
    pub raw: RawOutputSpec,
    pub preset: Option<String>,
    pub basename: String,
    pub watermark: Option<WatermarkSpec>,
    pub target: OutputTarget,
}

impl OutputSpec {
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let raw: RawOutputSpec = serde_json::from_str(json)
            .map_err(|e| ConfigError::invalid_output(format!("not a valid output object: {}", e)))?;
        OutputSpec::try_from(raw)
    }
}

impl TryFrom<RawOutputSpec> for OutputSpec {
    type Error = ConfigError;

    fn try_from(raw: RawOutputSpec) -> Result<Self, Self::Error> {
        let basename = raw.output_file_info.basename.trim().to_string();
        if basename.is_empty() || basename.contains('/') {
            return Err(ConfigError::invalid_output(format!(
                "output_file_info.basename '{}' must be a plain file name",
                raw.output_file_info.basename
            )));
        }

        let preset = raw
            .preset
            .as_ref()
            .map(|p| p.trim().to_string())
            .filter(|p| !p.is_empty());
        let watermark = raw.watermark.as_ref().map(WatermarkSpec::try_from).transpose()?;
        let size = raw.size.as_deref().map(str::parse::<Size>).transpose()?;

        let custom = raw.custom_cmd.as_ref().filter(|c| !c.trim().is_empty());
        let target = if let Some(template) = custom {
            OutputTarget::Custom(CustomOutput {
                template: template.clone(),
            })
        } else {
            match raw.kind.as_deref() {
                Some("video") => OutputTarget::Video(VideoOutput {
                    overrides: VideoOverrides {
                        size,
                        video_codec: raw.video_codec.clone(),
                        audio_codec: raw.audio_codec.clone(),
                        video_bitrate: raw.video_bitrate.as_ref().map(ToString::to_string),
                        audio_bitrate: raw.audio_bitrate.as_ref().map(ToString::to_string),
                        frame_rate: raw.frame_rate.as_ref().map(ToString::to_string),
                    },
                    keep_ratio: raw.keep_ratio.as_ref().is_none_or(Flag::is_true),
                    allow_upscale: raw.allow_upscale.as_ref().is_some_and(|f| !f.is_false()),
                }),
                Some("thumb") | Some("thumbnail") => {
                    let mode = match raw.mode.as_deref() {
                        Some("snapshot") => ThumbnailMode::Snapshot {
                            at_sec: raw.snapshot_sec,
                        },
                        Some("intervals") => ThumbnailMode::Intervals {
                            every_sec: raw.intervals,
                        },
                        Some(other) => {
                            return Err(ConfigError::invalid_output(format!(
                                "unknown thumbnail mode '{}'",
                                other
                            )));
                        }
                        None => {
                            return Err(ConfigError::invalid_output(
                                "thumbnail output requires a mode (snapshot or intervals)",
                            ));
                        }
                    };
                    OutputTarget::Thumbnail(ThumbnailOutput { size, mode })
                }
                Some(other) => {
                    return Err(ConfigError::invalid_output(format!(
                        "unknown output type '{}'",
                        other
                    )));
                }
                None => {
                    return Err(ConfigError::invalid_output(
                        "output has neither a type nor a custom_cmd",
                    ));
                }
            }
        };

        Ok(OutputSpec {
            raw,
            preset,
            basename,
            watermark,
            target,
        })
    }
}
