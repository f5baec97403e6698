use std::fmt;
use std::path::PathBuf;

/// Longest diagnostic tail carried into error messages.
const DIAGNOSTIC_TAIL_BYTES: usize = 2048;

/// Role an external tool plays in the pipeline. Used to label failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolRole {
    Probe,
    Transcode,
    Thumbnail,
    Composite,
    Custom,
}

impl fmt::Display for ToolRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ToolRole::Probe => "probe (ffprobe)",
            ToolRole::Transcode => "transcode (ffmpeg)",
            ToolRole::Thumbnail => "thumbnail (ffmpeg)",
            ToolRole::Composite => "watermark composite (convert)",
            ToolRole::Custom => "custom command",
        };
        f.write_str(name)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("No preset selected for output")]
    MissingPreset,

    #[error("Unknown preset '{name}'")]
    UnknownPreset { name: String },

    #[error("Can't read preset file {path:?}: {source}")]
    PresetUnreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Bad preset format in {path:?}: {source}")]
    PresetMalformed {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Unable to open preset directory {path:?}: {source}")]
    PresetDirUnreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid size '{value}', expected WidthxHeight")]
    InvalidSize { value: String },

    #[error("Invalid output spec: {message}")]
    InvalidOutputSpec { message: String },
}

impl ConfigError {
    pub fn invalid_output(msg: impl Into<String>) -> Self {
        Self::InvalidOutputSpec {
            message: msg.into(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ExecutionError {
    #[error("Failed to start {tool}: {source}. Command: {command}")]
    Spawn {
        tool: ToolRole,
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Lost track of {tool} process: {source}. Command: {command}")]
    Supervise {
        tool: ToolRole,
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error(
        "{tool} exited with {}. Command: {command}\n{}",
        exit_label(*code),
        tail(diagnostics)
    )]
    Failed {
        tool: ToolRole,
        command: String,
        code: Option<i32>,
        diagnostics: String,
    },

    #[error("{tool} was interrupted: {source}. Command: {command}\n{}", tail(diagnostics))]
    Interrupted {
        tool: ToolRole,
        command: String,
        diagnostics: String,
        #[source]
        source: SinkError,
    },
}

impl ExecutionError {
    pub fn command(&self) -> &str {
        match self {
            ExecutionError::Spawn { command, .. }
            | ExecutionError::Supervise { command, .. }
            | ExecutionError::Failed { command, .. }
            | ExecutionError::Interrupted { command, .. } => command,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ValidationError {
    #[error("Output {path:?} hasn't been created")]
    MissingOutput { path: PathBuf },

    #[error("Output directory {path:?} is empty")]
    EmptyOutput { path: PathBuf },
}

#[derive(Debug, thiserror::Error)]
pub enum MetadataError {
    #[error("Probe returned no output. Command: {command}\n{}", tail(diagnostics))]
    NoProbeOutput { command: String, diagnostics: String },

    #[error("Probe output is not valid JSON: {source}. Command: {command}")]
    InvalidProbeOutput {
        command: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("{stream} stream is missing required field '{field}'")]
    MissingField { stream: &'static str, field: &'static str },

    #[error("{stream} stream field '{field}' is out of range: {value}")]
    OutOfRange {
        stream: &'static str,
        field: &'static str,
        value: u64,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum WatermarkError {
    #[error("Failed to fetch watermark s3://{bucket}/{key}: {message}")]
    FetchFailed {
        bucket: String,
        key: String,
        message: String,
    },

    #[error("Error transforming watermark file {path:?}. Command: {command}\n{}", tail(diagnostics))]
    TransformFailed {
        path: PathBuf,
        command: String,
        diagnostics: String,
    },
}

/// Failure raised by a progress sink. Any sink failure aborts the running invocation.
#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("cancelled by coordinator: {reason}")]
    Cancelled { reason: String },

    #[error("heartbeat transport failed: {0}")]
    Transport(#[from] redis::RedisError),

    #[error("heartbeat payload could not be encoded: {0}")]
    Encode(#[from] serde_json::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum TranscodeError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Execution(#[from] ExecutionError),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Metadata(#[from] MetadataError),

    #[error(transparent)]
    Watermark(#[from] WatermarkError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type TranscodeResult<T> = Result<T, TranscodeError>;

fn exit_label(code: Option<i32>) -> String {
    match code {
        Some(code) => format!("status {}", code),
        None => "no status (killed by signal)".to_string(),
    }
}

/// Last part of a diagnostic buffer, cut on a char boundary.
pub fn tail(diagnostics: &str) -> &str {
    let trimmed = diagnostics.trim_end();
    if trimmed.len() <= DIAGNOSTIC_TAIL_BYTES {
        return trimmed;
    }
    let mut start = trimmed.len() - DIAGNOSTIC_TAIL_BYTES;
    while !trimmed.is_char_boundary(start) {
        start += 1;
    }
    &trimmed[start..]
}
