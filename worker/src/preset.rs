use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::{debug, info};
use serde::Deserialize;

use crate::error::ConfigError;
use crate::options::{OutputSpec, OutputTarget, Size, TextOrNumber, ThumbnailMode};

pub const PRESET_EXTENSION: &str = "json";
pub const SNAPSHOT_SEC_DEFAULT: f64 = 0.0;
pub const INTERVALS_DEFAULT: f64 = 10.0;

/// Default encode parameters loaded from `<presets_dir>/<name>.json`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Preset {
    pub size: Size,
    pub video_codec: String,
    pub audio_codec: String,
    pub video_bitrate: TextOrNumber,
    pub audio_bitrate: TextOrNumber,
    pub frame_rate: TextOrNumber,
    pub video_codec_options: String,
}

impl Preset {
    /// Reads a single preset file by name.
    pub fn load(dir: &Path, name: &str) -> Result<Preset, ConfigError> {
        let path = dir.join(format!("{}.{}", name, PRESET_EXTENSION));
        Self::load_file(&path)
    }

    fn load_file(path: &Path) -> Result<Preset, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::PresetUnreadable {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&content).map_err(|source| ConfigError::PresetMalformed {
            path: path.to_path_buf(),
            source,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct VideoParams {
    pub size: Size,
    pub video_codec: String,
    pub audio_codec: String,
    pub video_bitrate: String,
    pub audio_bitrate: String,
    pub frame_rate: String,
    pub codec_options: Option<String>,
    pub keep_ratio: bool,
    pub allow_upscale: bool,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FrameSelection {
    Snapshot { at_sec: f64 },
    Intervals { every_sec: f64 },
}

#[derive(Debug, Clone, PartialEq)]
pub struct ThumbnailParams {
    pub size: Size,
    pub frames: FrameSelection,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CustomParams {
    pub template: String,
}

/// Final parameters after merging overrides, preset values and defaults.
#[derive(Debug, Clone, PartialEq)]
pub enum ResolvedParams {
    Video(VideoParams),
    Thumbnail(ThumbnailParams),
    Custom(CustomParams),
}

/// Immutable name -> preset table, built once at startup.
#[derive(Debug, Clone, Default)]
pub struct PresetStore {
    presets: HashMap<String, Arc<Preset>>,
}

impl PresetStore {
    /// Loads every `*.json` file in `dir`. A single unreadable or malformed preset fails the whole load.
    pub fn open(dir: &Path) -> Result<Self, ConfigError> {
        let dir_err = |source| ConfigError::PresetDirUnreadable {
            path: dir.to_path_buf(),
            source,
        };
        let mut presets = HashMap::new();
        for entry in fs::read_dir(dir).map_err(dir_err)? {
            let path: PathBuf = entry.map_err(dir_err)?.path();
            if !path.is_file() || path.extension().is_none_or(|ext| ext != PRESET_EXTENSION) {
                continue;
            }
            let Some(name) = path.file_stem().map(|s| s.to_string_lossy().into_owned()) else {
                continue;
            };
            let preset = Preset::load_file(&path)?;
            debug!("Loaded preset '{}' from {:?}", name, path);
            presets.insert(name, Arc::new(preset));
        }
        info!("Loaded {} presets from {:?}", presets.len(), dir);
        Ok(PresetStore { presets })
    }

    pub fn from_presets(presets: impl IntoIterator<Item = (String, Preset)>) -> Self {
        PresetStore {
            presets: presets
                .into_iter()
                .map(|(name, preset)| (name, Arc::new(preset)))
                .collect(),
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<Preset>> {
        self.presets.get(name).cloned()
    }

    pub fn len(&self) -> usize {
        self.presets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.presets.is_empty()
    }

    /// Checks that the output names a preset this store knows.
    pub fn validate(&self, spec: &OutputSpec) -> Result<bool, ConfigError> {
        self.lookup(spec).map(|_| true)
    }

    fn lookup(&self, spec: &OutputSpec) -> Result<Arc<Preset>, ConfigError> {
        let name = spec.preset.as_deref().ok_or(ConfigError::MissingPreset)?;
        self.get(name).ok_or_else(|| ConfigError::UnknownPreset {
            name: name.to_string(),
        })
    }

    /// Merges override > preset > default for the output's variant.
    pub fn resolve(&self, spec: &OutputSpec) -> Result<ResolvedParams, ConfigError> {
        match &spec.target {
            OutputTarget::Custom(custom) => Ok(ResolvedParams::Custom(CustomParams {
                template: custom.template.clone(),
            })),
            OutputTarget::Video(video) => {
                let o = &video.overrides;
                let preset = if o.is_complete() && spec.preset.is_none() {
                    None
                } else {
                    Some(self.lookup(spec)?)
                };
                let pick = |value: &Option<String>, from_preset: fn(&Preset) -> String| {
                    value
                        .clone()
                        .or_else(|| preset.as_deref().map(from_preset))
                        .ok_or(ConfigError::MissingPreset)
                };
                Ok(ResolvedParams::Video(VideoParams {
                    size: o
                        .size
                        .or_else(|| preset.as_deref().map(|p| p.size))
                        .ok_or(ConfigError::MissingPreset)?,
                    video_codec: pick(&o.video_codec, |p| p.video_codec.clone())?,
                    audio_codec: pick(&o.audio_codec, |p| p.audio_codec.clone())?,
                    video_bitrate: pick(&o.video_bitrate, |p| p.video_bitrate.to_string())?,
                    audio_bitrate: pick(&o.audio_bitrate, |p| p.audio_bitrate.to_string())?,
                    frame_rate: pick(&o.frame_rate, |p| p.frame_rate.to_string())?,
                    codec_options: preset
                        .as_deref()
                        .map(|p| p.video_codec_options.clone())
                        .filter(|opts| !opts.trim().is_empty()),
                    keep_ratio: video.keep_ratio,
                    allow_upscale: video.allow_upscale,
                }))
            }
            OutputTarget::Thumbnail(thumb) => {
                let size = match thumb.size {
                    Some(size) if spec.preset.is_none() => size,
                    Some(size) => {
                        self.lookup(spec)?;
                        size
                    }
                    None => self.lookup(spec)?.size,
                };
                let frames = match thumb.mode {
                    ThumbnailMode::Snapshot { at_sec } => FrameSelection::Snapshot {
                        at_sec: positive_or(at_sec, SNAPSHOT_SEC_DEFAULT),
                    },
                    ThumbnailMode::Intervals { every_sec } => FrameSelection::Intervals {
                        every_sec: positive_or(every_sec, INTERVALS_DEFAULT),
                    },
                };
                Ok(ResolvedParams::Thumbnail(ThumbnailParams { size, frames }))
            }
        }
    }
}

fn positive_or(value: Option<f64>, default: f64) -> f64 {
    value.filter(|v| *v > 0.0).unwrap_or(default)
}
