use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::{debug, error, info};
use serde::Serialize;

use crate::compiler::{CommandCompiler, CompiledOutput};
use crate::config::ToolPaths;
use crate::error::{ExecutionError, TranscodeResult, ValidationError};
use crate::options::{OutputSpec, RawOutputSpec};
use crate::preset::{FrameSelection, PresetStore, ResolvedParams};
use crate::probe::{AssetProbe, Metadata};
use crate::progress::{Heartbeat, ProgressSink, ProgressTracker};
use crate::s3::ObjectStore;
use crate::supervisor::ExecutionSupervisor;
use crate::watermark::WatermarkCompositor;

/// What a successful transcode hands back to the coordinator.
#[derive(Debug, Clone, Serialize)]
pub struct TranscodeOutcome {
    pub output: RawOutputSpec,
    pub output_path: PathBuf,
    pub output_info: Option<Metadata>,
}

/// Spec -> command -> supervised run -> validated result.
#[derive(Clone)]
pub struct Transcoder {
    presets: Arc<PresetStore>,
    compiler: CommandCompiler,
    supervisor: ExecutionSupervisor,
    probe: AssetProbe,
}

impl Transcoder {
    pub fn new(
        presets: Arc<PresetStore>,
        tools: ToolPaths,
        supervisor: ExecutionSupervisor,
        store: Option<Arc<dyn ObjectStore>>,
    ) -> Self {
        let watermarks =
            store.map(|store| WatermarkCompositor::new(store, tools.convert.clone(), supervisor));
        Transcoder {
            presets,
            probe: AssetProbe::new(tools.ffprobe.clone(), supervisor),
            compiler: CommandCompiler::new(tools, watermarks),
            supervisor,
        }
    }

    pub fn probe(&self) -> &AssetProbe {
        &self.probe
    }

    /// Produces one output of `input` into `output_dir`, reporting progress to `sink`.
    ///
    /// `work_dir` holds intermediate files (the watermark) and must not be shared between tasks.
    pub fn transcode_asset(
        &self,
        input: &Path,
        work_dir: &Path,
        output_dir: &Path,
        metadata: Option<&Metadata>,
        spec: &OutputSpec,
        sink: &dyn ProgressSink,
    ) -> TranscodeResult<TranscodeOutcome> {
        info!("Start transcoding asset {:?} into {:?}", input, output_dir);
        if let Some(meta) = metadata {
            debug!("Input metadata: {:?}", meta);
        }

        let resolved = self.presets.resolve(spec)?;
        fs::create_dir_all(work_dir)?;
        fs::create_dir_all(output_dir)?;

        let compiled = self.compiler.compile(spec, &resolved, input, work_dir, output_dir, metadata)?;

        match self.run_compiled(&compiled, &resolved, metadata, spec, sink, output_dir) {
            Ok(outcome) => {
                info!("Transcoding successful: {:?} -> {:?}", input, outcome.output_path);
                Ok(outcome)
            }
            Err(e) => {
                error!(
                    "Execution of command '{}' failed. Input metadata: {:?}. {}",
                    compiled.invocation, metadata, e
                );
                Err(e)
            }
        }
    }

    fn run_compiled(
        &self,
        compiled: &CompiledOutput,
        resolved: &ResolvedParams,
        metadata: Option<&Metadata>,
        spec: &OutputSpec,
        sink: &dyn ProgressSink,
        output_dir: &Path,
    ) -> TranscodeResult<TranscodeOutcome> {
        let duration = metadata.map(|m| m.duration).unwrap_or(0.0);
        sink.heartbeat(&Heartbeat::started(&spec.raw, duration))
            .map_err(|source| ExecutionError::Interrupted {
                tool: compiled.invocation.role,
                command: compiled.invocation.to_string(),
                diagnostics: String::new(),
                source,
            })?;

        let mut tracker = ProgressTracker::new(duration);
        self.supervisor.execute(&compiled.invocation, |diagnostics| {
            let state = tracker.observe(diagnostics);
            info!("Progress: {:.2}s / {}%", state.elapsed, state.percent);
            sink.heartbeat(&Heartbeat::from_state(&spec.raw, &state))
        })?;

        validate_output_dir(output_dir)?;

        let sequence = matches!(
            resolved,
            ResolvedParams::Thumbnail(params) if matches!(params.frames, FrameSelection::Intervals { .. })
        );
        let output_info = if sequence {
            None
        } else {
            if !compiled.output_path.is_file() {
                return Err(ValidationError::MissingOutput {
                    path: compiled.output_path.clone(),
                }
                .into());
            }
            Some(self.probe.metadata(&compiled.output_path)?)
        };

        Ok(TranscodeOutcome {
            output: spec.raw.clone(),
            output_path: compiled.output_path.clone(),
            output_info,
        })
    }
}

/// Fails unless `dir` exists and holds at least one entry.
pub fn validate_output_dir(dir: &Path) -> Result<(), ValidationError> {
    let mut entries = fs::read_dir(dir).map_err(|_| ValidationError::MissingOutput {
        path: dir.to_path_buf(),
    })?;
    if entries.next().is_none() {
        return Err(ValidationError::EmptyOutput {
            path: dir.to_path_buf(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn missing_output_dir_is_a_validation_error() {
        let dir = TempDir::new().unwrap();
        let err = validate_output_dir(&dir.path().join("never-created")).unwrap_err();
        assert!(matches!(err, ValidationError::MissingOutput { .. }));
    }

    #[test]
    fn empty_output_dir_is_a_validation_error() {
        let dir = TempDir::new().unwrap();
        let err = validate_output_dir(dir.path()).unwrap_err();
        assert!(matches!(err, ValidationError::EmptyOutput { .. }));
    }

    #[test]
    fn populated_output_dir_passes() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("out.mp4"), b"data").unwrap();
        assert!(validate_output_dir(dir.path()).is_ok());
    }
}
