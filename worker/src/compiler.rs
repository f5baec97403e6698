use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use log::{debug, info, warn};
use regex::{Captures, Regex};

use crate::command::{CommandInvocation, shell_quote_path};
use crate::config::ToolPaths;
use crate::error::{ConfigError, ToolRole, TranscodeResult};
use crate::options::{OutputSpec, Size, WatermarkSpec};
use crate::preset::{CustomParams, FrameSelection, ResolvedParams, ThumbnailParams, VideoParams};
use crate::probe::{Metadata, probe_invocation};
use crate::watermark::{OverlayFragment, WatermarkCompositor};

const THUMBNAIL_QUALITY: &str = "8";
const SEQUENCE_PLACEHOLDER: &str = "%06d";

static REGEX_PLACEHOLDER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\{(input_file|watermark_options|output_file)\}").expect("valid placeholder regex")
});

/// A compiled command plus where its output lands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompiledOutput {
    pub invocation: CommandInvocation,
    pub output_path: PathBuf,
}

/// Turns resolved output parameters into concrete tool invocations.
#[derive(Clone)]
pub struct CommandCompiler {
    tools: ToolPaths,
    watermarks: Option<WatermarkCompositor>,
}

impl CommandCompiler {
    pub fn new(tools: ToolPaths, watermarks: Option<WatermarkCompositor>) -> Self {
        CommandCompiler { tools, watermarks }
    }

    pub fn compile_probe(&self, asset: &Path) -> CommandInvocation {
        probe_invocation(&self.tools.ffprobe, asset)
    }

    /// Compiles `spec` for `input`. Watermark files are staged in `work_dir`.
    pub fn compile(
        &self,
        spec: &OutputSpec,
        resolved: &ResolvedParams,
        input: &Path,
        work_dir: &Path,
        output_dir: &Path,
        metadata: Option<&Metadata>,
    ) -> TranscodeResult<CompiledOutput> {
        let overlay = match &spec.watermark {
            Some(watermark) if !matches!(resolved, ResolvedParams::Thumbnail(_)) => {
                Some(self.overlay(work_dir, watermark)?)
            }
            Some(_) => {
                warn!("Watermarks are not applied to thumbnails, ignoring");
                None
            }
            None => None,
        };

        let compiled = match resolved {
            ResolvedParams::Video(params) => self.compile_video_transcode(
                input,
                output_dir,
                &spec.basename,
                metadata,
                params,
                overlay.as_ref(),
            ),
            ResolvedParams::Thumbnail(params) => {
                self.compile_thumbnail(input, output_dir, &spec.basename, params)
            }
            ResolvedParams::Custom(params) => {
                self.compile_custom(params, input, output_dir, &spec.basename, overlay.as_ref())
            }
        };
        info!("Compiled {} command: {}", compiled.invocation.role, compiled.invocation);
        Ok(compiled)
    }

    fn overlay(&self, work_dir: &Path, watermark: &WatermarkSpec) -> TranscodeResult<OverlayFragment> {
        let compositor = self.watermarks.as_ref().ok_or_else(|| {
            ConfigError::invalid_output("watermark requested but no object store is configured")
        })?;
        compositor.prepare(work_dir, watermark)
    }

    pub fn compile_video_transcode(
        &self,
        input: &Path,
        output_dir: &Path,
        basename: &str,
        metadata: Option<&Metadata>,
        params: &VideoParams,
        overlay: Option<&OverlayFragment>,
    ) -> CompiledOutput {
        let size = output_video_size(params, metadata);
        let filter = match overlay {
            Some(fragment) => fragment.filter_graph(Some(size)),
            None => format!("scale={}", size.scale_arg()),
        };
        let output_path = output_dir.join(basename);

        let invocation = CommandInvocation::argv(ToolRole::Transcode, &self.tools.ffmpeg)
            .arg("-i")
            .arg(input)
            .args(["-y", "-threads", "0", "-vf"])
            .arg(filter)
            .args(["-vcodec", params.video_codec.as_str()])
            .args(["-acodec", params.audio_codec.as_str()])
            .args(["-b:v", params.video_bitrate.as_str()])
            .args(["-b:a", params.audio_bitrate.as_str()])
            .args(["-r", params.frame_rate.as_str()])
            .args(codec_option_flags(params.codec_options.as_deref().unwrap_or("")))
            .arg(&output_path);

        CompiledOutput {
            invocation,
            output_path,
        }
    }

    pub fn compile_thumbnail(
        &self,
        input: &Path,
        output_dir: &Path,
        basename: &str,
        params: &ThumbnailParams,
    ) -> CompiledOutput {
        let scale = format!("scale={}", params.size.scale_arg());
        let base = CommandInvocation::argv(ToolRole::Thumbnail, &self.tools.ffmpeg)
            .arg("-i")
            .arg(input)
            .args(["-y", "-threads", "0"]);

        let (invocation, output_path) = match params.frames {
            FrameSelection::Snapshot { at_sec } => (
                base.args(["-vf", scale.as_str()])
                    .args(["-ss", format_timestamp(at_sec).as_str()])
                    .args(["-vframes", "1"]),
                output_dir.join(basename),
            ),
            FrameSelection::Intervals { every_sec } => (
                base.arg("-vf")
                    .arg(format!("{},fps=fps=1/{}", scale, every_sec)),
                output_dir.join(sequence_name(basename)),
            ),
        };

        let invocation = invocation
            .args(["-f", "image2", "-q:v", THUMBNAIL_QUALITY])
            .arg(&output_path);
        CompiledOutput {
            invocation,
            output_path,
        }
    }

    pub fn compile_custom(
        &self,
        params: &CustomParams,
        input: &Path,
        output_dir: &Path,
        basename: &str,
        overlay: Option<&OverlayFragment>,
    ) -> CompiledOutput {
        let output_path = output_dir.join(basename);
        let watermark_options = overlay.map(OverlayFragment::to_options).unwrap_or_default();
        let input_file = shell_quote_path(input);
        let output_file = shell_quote_path(&output_path);
        // Single pass, so substituted paths are never scanned for placeholders again.
        let line = REGEX_PLACEHOLDER
            .replace_all(&params.template, |caps: &Captures| match &caps[1] {
                "input_file" => input_file.clone(),
                "output_file" => output_file.clone(),
                _ => watermark_options.clone(),
            })
            .into_owned();

        CompiledOutput {
            invocation: CommandInvocation::shell(ToolRole::Custom, line),
            output_path,
        }
    }
}

/// Requested size after the ratio check and the no-upscale clamp.
pub fn output_video_size(params: &VideoParams, metadata: Option<&Metadata>) -> Size {
    let requested = params.size;
    let Some(input) = metadata.and_then(|m| m.video.as_ref()).map(|v| v.resolution) else {
        return requested;
    };

    if params.keep_ratio && !same_ratio(requested, input) {
        warn!(
            "Output size {} does not keep the input ratio of {}; set keep_ratio=false to silence this",
            requested, input
        );
    }

    if !params.allow_upscale && requested.exceeds(&input) {
        info!(
            "Requested transcode size {} is bigger than the original {}. `allow_upscale` option not provided, using {}",
            requested, input, input
        );
        return input;
    }
    requested
}

// Ratios within 1% count as equal.
fn same_ratio(a: Size, b: Size) -> bool {
    if a.height == 0 || b.height == 0 {
        return true;
    }
    let ra = a.width as f64 / a.height as f64;
    let rb = b.width as f64 / b.height as f64;
    ((ra - rb) / rb).abs() < 0.01
}

/// `Profile=high,Level=41,MaxReferenceFrames=4` to ffmpeg flags. Other keys are dropped.
pub fn codec_option_flags(options: &str) -> Vec<String> {
    let mut flags = Vec::new();
    for option in options.split(',').map(str::trim).filter(|o| !o.is_empty()) {
        let Some((key, value)) = option.split_once('=') else {
            debug!("Ignoring codec option without a value: '{}'", option);
            continue;
        };
        let flag = match key.trim() {
            "Profile" => "-profile:v",
            "Level" => "-level",
            "MaxReferenceFrames" => "-refs",
            other => {
                debug!("Ignoring unsupported codec option '{}'", other);
                continue;
            }
        };
        flags.push(flag.to_string());
        flags.push(value.trim().to_string());
    }
    flags
}

/// Seconds to `HH:MM:SS.mmm`.
pub fn format_timestamp(seconds: f64) -> String {
    let total_ms = (seconds.max(0.0) * 1000.0).round() as u64;
    let ms = total_ms % 1000;
    let total_secs = total_ms / 1000;
    format!(
        "{:02}:{:02}:{:02}.{:03}",
        total_secs / 3600,
        (total_secs / 60) % 60,
        total_secs % 60,
        ms
    )
}

/// `thumb.jpg` to `thumb%06d.jpg`.
pub fn sequence_name(basename: &str) -> String {
    match basename.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => format!("{}{}.{}", stem, SEQUENCE_PLACEHOLDER, ext),
        _ => format!("{}{}", basename, SEQUENCE_PLACEHOLDER),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::VideoInfo;
    use proptest::prelude::*;

    fn compiler() -> CommandCompiler {
        CommandCompiler::new(ToolPaths::default(), None)
    }

    #[test]
    fn probe_requests_json_streams_and_format() {
        let inv = compiler().compile_probe(Path::new("/in/source.mov"));
        assert_eq!(inv.role, ToolRole::Probe);
        assert!(inv.capture_stdout);
        assert_eq!(
            inv.to_string(),
            "ffprobe -v error -print_format json -show_format -show_streams /in/source.mov"
        );
    }

    fn video_params(size: Size) -> VideoParams {
        VideoParams {
            size,
            video_codec: "libx264".to_string(),
            audio_codec: "aac".to_string(),
            video_bitrate: "2500k".to_string(),
            audio_bitrate: "128k".to_string(),
            frame_rate: "30".to_string(),
            codec_options: Some("Profile=main,Level=31,MaxReferenceFrames=3,Tune=film".to_string()),
            keep_ratio: true,
            allow_upscale: false,
        }
    }

    fn metadata(resolution: Size) -> Metadata {
        Metadata {
            duration: 60.0,
            video: Some(VideoInfo {
                codec: "h264".to_string(),
                color: None,
                resolution,
                sar: Some("1:1".to_string()),
                dar: Some("16:9".to_string()),
                framerate: "25/1".to_string(),
                bitrate: None,
            }),
            audio: None,
        }
    }

    #[test]
    fn video_command_carries_resolved_parameters() {
        let compiled = compiler().compile_video_transcode(
            Path::new("/in/source.mov"),
            Path::new("/out"),
            "720p.mp4",
            None,
            &video_params(Size::new(1280, 720)),
            None,
        );
        let inv = &compiled.invocation;
        assert_eq!(inv.role, ToolRole::Transcode);
        assert_eq!(inv.flag_value("-i"), Some("/in/source.mov"));
        assert_eq!(inv.flag_value("-vf"), Some("scale=1280:720"));
        assert_eq!(inv.flag_value("-vcodec"), Some("libx264"));
        assert_eq!(inv.flag_value("-b:v"), Some("2500k"));
        assert_eq!(inv.flag_value("-r"), Some("30"));
        assert_eq!(inv.flag_value("-profile:v"), Some("main"));
        assert_eq!(inv.flag_value("-level"), Some("31"));
        assert_eq!(inv.flag_value("-refs"), Some("3"));
        assert!(!inv.arg_list().iter().any(|a| a.contains("film")));
        assert_eq!(compiled.output_path, PathBuf::from("/out/720p.mp4"));
        assert_eq!(inv.arg_list().last().map(String::as_str), Some("/out/720p.mp4"));
    }

    #[test]
    fn upscale_is_clamped_to_input() {
        let meta = metadata(Size::new(640, 360));
        let size = output_video_size(&video_params(Size::new(1280, 720)), Some(&meta));
        assert_eq!(size, Size::new(640, 360));

        let mut allowed = video_params(Size::new(1280, 720));
        allowed.allow_upscale = true;
        assert_eq!(output_video_size(&allowed, Some(&meta)), Size::new(1280, 720));
    }

    #[test]
    fn no_metadata_means_no_clamp() {
        let size = output_video_size(&video_params(Size::new(3840, 2160)), None);
        assert_eq!(size, Size::new(3840, 2160));
    }

    #[test]
    fn watermark_merges_into_single_filter_graph() {
        let fragment = OverlayFragment::new(
            PathBuf::from("/work/new-logo.png"),
            Size::new(100, 50),
            -10,
            -10,
        );
        let compiled = compiler().compile_video_transcode(
            Path::new("/in/a.mp4"),
            Path::new("/out"),
            "a.mp4",
            None,
            &video_params(Size::new(1280, 720)),
            Some(&fragment),
        );
        let vf_count = compiled
            .invocation
            .arg_list()
            .iter()
            .filter(|a| *a == "-vf")
            .count();
        assert_eq!(vf_count, 1);
        let graph = compiled.invocation.flag_value("-vf").unwrap();
        assert!(graph.contains("[in]scale=1280:720[main]"));
        assert!(graph.contains("overlay=main_w-overlay_w-10:main_h-overlay_h-10"));
    }

    #[test]
    fn snapshot_seeks_and_extracts_one_frame() {
        let params = ThumbnailParams {
            size: Size::new(320, 180),
            frames: FrameSelection::Snapshot { at_sec: 5.0 },
        };
        let compiled =
            compiler().compile_thumbnail(Path::new("/in/a.mp4"), Path::new("/out"), "poster.jpg", &params);
        let inv = &compiled.invocation;
        assert_eq!(inv.role, ToolRole::Thumbnail);
        assert_eq!(inv.flag_value("-ss"), Some("00:00:05.000"));
        assert_eq!(inv.flag_value("-vframes"), Some("1"));
        assert_eq!(inv.flag_value("-vf"), Some("scale=320:180"));
        assert_eq!(inv.flag_value("-f"), Some("image2"));
        assert_eq!(inv.flag_value("-q:v"), Some("8"));
        assert_eq!(compiled.output_path, PathBuf::from("/out/poster.jpg"));
    }

    #[test]
    fn intervals_sample_and_number_outputs() {
        let params = ThumbnailParams {
            size: Size::new(320, 180),
            frames: FrameSelection::Intervals { every_sec: 10.0 },
        };
        let compiled =
            compiler().compile_thumbnail(Path::new("/in/a.mp4"), Path::new("/out"), "thumb.jpg", &params);
        let inv = &compiled.invocation;
        assert_eq!(inv.flag_value("-vf"), Some("scale=320:180,fps=fps=1/10"));
        assert_eq!(inv.flag_value("-vframes"), None);
        assert_eq!(compiled.output_path, PathBuf::from("/out/thumb%06d.jpg"));
    }

    #[test]
    fn custom_template_substitutes_placeholders() {
        let params = CustomParams {
            template: "ffmpeg -i ${input_file} ${watermark_options} -c copy ${output_file}".to_string(),
        };
        let compiled = compiler().compile_custom(
            &params,
            Path::new("/in/my clip.mp4"),
            Path::new("/out"),
            "copy.mkv",
            None,
        );
        assert_eq!(
            compiled.invocation.to_string(),
            "ffmpeg -i '/in/my clip.mp4'  -c copy /out/copy.mkv"
        );
        assert_eq!(compiled.invocation.role, ToolRole::Custom);
    }

    #[test]
    fn placeholder_text_inside_paths_is_left_alone() {
        let params = CustomParams {
            template: "cp ${input_file} ${output_file}".to_string(),
        };
        let compiled = compiler().compile_custom(
            &params,
            Path::new("/in/${output_file}${watermark_options}.mp4"),
            Path::new("/out"),
            "b.mp4",
            None,
        );
        assert_eq!(
            compiled.invocation.to_string(),
            "cp '/in/${output_file}${watermark_options}.mp4' /out/b.mp4"
        );
    }

    #[test]
    fn custom_template_receives_watermark_options() {
        let params = CustomParams {
            template: "ffmpeg -i ${input_file} ${watermark_options} ${output_file}".to_string(),
        };
        let fragment = OverlayFragment::new(PathBuf::from("/w/new-l.png"), Size::new(10, 10), 5, -5);
        let compiled = compiler().compile_custom(
            &params,
            Path::new("/in/a.mp4"),
            Path::new("/out"),
            "b.mp4",
            Some(&fragment),
        );
        assert!(compiled
            .invocation
            .to_string()
            .contains("overlay=5:main_h-overlay_h-5"));
    }

    #[test]
    fn ratio_mismatch_keeps_requested_size() {
        let params = video_params(Size::new(640, 480));
        let input = metadata(Size::new(1920, 1080));
        assert!(!same_ratio(params.size, Size::new(1920, 1080)));
        assert_eq!(output_video_size(&params, Some(&input)), Size::new(640, 480));

        let loose = VideoParams {
            keep_ratio: false,
            ..video_params(Size::new(640, 480))
        };
        assert_eq!(output_video_size(&loose, Some(&input)), Size::new(640, 480));
    }

    #[test]
    fn near_equal_ratios_count_as_equal() {
        assert!(same_ratio(Size::new(854, 480), Size::new(1920, 1080)));
        assert!(same_ratio(Size::new(10, 0), Size::new(1920, 1080)));
    }

    #[test]
    fn timestamps_and_sequence_names() {
        assert_eq!(format_timestamp(0.0), "00:00:00.000");
        assert_eq!(format_timestamp(3725.5), "01:02:05.500");
        assert_eq!(sequence_name("thumb.jpg"), "thumb%06d.jpg");
        assert_eq!(sequence_name("frames"), "frames%06d");
        assert_eq!(sequence_name("a.b.png"), "a.b%06d.png");
    }

    #[test]
    fn codec_options_keep_only_known_keys() {
        assert_eq!(
            codec_option_flags("Profile=high, Level=4.1,Bogus=1,novalue"),
            vec!["-profile:v", "high", "-level", "4.1"]
        );
        assert!(codec_option_flags("").is_empty());
    }

    proptest! {
        #[test]
        fn clamped_size_never_exceeds_input(
            rw in 16u32..4096, rh in 16u32..4096, iw in 16u32..4096, ih in 16u32..4096
        ) {
            let meta = metadata(Size::new(iw, ih));
            let size = output_video_size(&video_params(Size::new(rw, rh)), Some(&meta));
            if rw > iw || rh > ih {
                prop_assert_eq!(size, Size::new(iw, ih));
            } else {
                prop_assert_eq!(size, Size::new(rw, rh));
            }
        }
    }
}
