use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::{info, warn};

use crate::command::{CommandInvocation, shell_quote};
use crate::error::{ToolRole, TranscodeResult, WatermarkError};
use crate::options::{Size, WatermarkSpec};
use crate::s3::ObjectStore;
use crate::supervisor::ExecutionSupervisor;

/// Overlay offset on one axis: non-negative values are literal, negative ones anchor to the far edge.
pub fn overlay_offset(value: i64, main: &str, overlay: &str) -> String {
    if value >= 0 {
        value.to_string()
    } else {
        format!("{}-{}-{}", main, overlay, value.unsigned_abs())
    }
}

/// Watermark compositing as ffmpeg filter text: scale the overlay, then place it on the main frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OverlayFragment {
    pub overlay_path: PathBuf,
    pub size: Size,
    pub x: String,
    pub y: String,
}

impl OverlayFragment {
    pub fn new(overlay_path: PathBuf, size: Size, x: i64, y: i64) -> Self {
        OverlayFragment {
            overlay_path,
            size,
            x: overlay_offset(x, "main_w", "overlay_w"),
            y: overlay_offset(y, "main_h", "overlay_h"),
        }
    }

    fn movie_source(&self) -> String {
        format!(
            "movie={},scale={}[wm]",
            filter_escape(&self.overlay_path.to_string_lossy()),
            self.size.scale_arg()
        )
    }

    /// Full `-vf` graph that scales the main frame to `main_size` before compositing.
    pub fn filter_graph(&self, main_size: Option<Size>) -> String {
        match main_size {
            Some(main) => format!(
                "{};[in]scale={}[main];[main][wm]overlay={}:{}[out]",
                self.movie_source(),
                main.scale_arg(),
                self.x,
                self.y
            ),
            None => format!(
                "{};[in][wm]overlay={}:{}[out]",
                self.movie_source(),
                self.x,
                self.y
            ),
        }
    }

    /// Shell-ready `-vf '<graph>'` text for custom command templates.
    pub fn to_options(&self) -> String {
        format!("-vf {}", shell_quote(&self.filter_graph(None)))
    }
}

// A movie= path is an option value inside a graph, so it is escaped at both levels.
fn filter_escape(path: &str) -> String {
    let option_value = escape_chars(path, &['\\', '\'', ':']);
    escape_chars(&option_value, &['\\', '\'', '[', ']', ',', ';'])
}

fn escape_chars(value: &str, special: &[char]) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        if special.contains(&c) {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

pub fn opacity_invocation(convert: &str, source: &Path, opacity: f64, target: &Path) -> CommandInvocation {
    CommandInvocation::argv(ToolRole::Composite, convert)
        .arg(source)
        .args(["-alpha", "on", "-channel", "A", "-evaluate", "Multiply"])
        .arg(opacity.to_string())
        .arg("+channel")
        .arg(target)
        .capture_stdout(true)
}

/// Fetches a watermark image, applies its opacity and describes where to composite it.
#[derive(Clone)]
pub struct WatermarkCompositor {
    store: Arc<dyn ObjectStore>,
    convert: String,
    supervisor: ExecutionSupervisor,
}

impl WatermarkCompositor {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        convert: impl Into<String>,
        supervisor: ExecutionSupervisor,
    ) -> Self {
        WatermarkCompositor {
            store,
            convert: convert.into(),
            supervisor,
        }
    }

    /// Temporary names derive from the source file name, so `work_dir` must be task-private.
    pub fn prepare(&self, work_dir: &Path, spec: &WatermarkSpec) -> TranscodeResult<OverlayFragment> {
        let file_name = Path::new(&spec.key)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "watermark".to_string());
        let source = work_dir.join(&file_name);
        let target = work_dir.join(format!("new-{}", file_name));

        let outcome = self.store.fetch(&spec.bucket, &spec.key, &source);
        if !outcome.is_fetched() {
            return Err(WatermarkError::FetchFailed {
                bucket: spec.bucket.clone(),
                key: spec.key.clone(),
                message: outcome.message,
            }
            .into());
        }
        info!("{}", outcome.message);

        let invocation = opacity_invocation(&self.convert, &source, spec.opacity, &target);
        let result = self.supervisor.run(&invocation, |_| Ok(()))?;

        let produced = fs::metadata(&target).map(|m| m.len() > 0).unwrap_or(false);
        let diagnostics = result.stderr.trim();
        if !diagnostics.is_empty() {
            if !produced {
                return Err(WatermarkError::TransformFailed {
                    path: source,
                    command: invocation.to_string(),
                    diagnostics: result.stderr,
                }
                .into());
            }
            warn!("Watermark transform reported: {}", diagnostics);
        } else if !produced {
            warn!(
                "Watermark transform produced no file at {:?} (exit {}); compositing will likely fail",
                target, result.status
            );
        }

        Ok(OverlayFragment::new(target, spec.size, spec.x, spec.y))
    }
}
