#![cfg(unix)]

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tempfile::TempDir;

use transcode_worker::config::ToolPaths;
use transcode_worker::error::{ExecutionError, SinkError, TranscodeError, ValidationError};
use transcode_worker::options::TextOrNumber;
use transcode_worker::preset::Preset;
use transcode_worker::probe::Metadata;
use transcode_worker::s3::{FetchOutcome, ObjectStore};
use transcode_worker::supervisor::ExecutionSupervisor;
use transcode_worker::{Heartbeat, OutputSpec, PresetStore, ProgressSink, Transcoder};

const PROBE_JSON: &str = r#"{
    "streams": [
        {"codec_type": "video", "codec_name": "h264", "width": 1280, "height": 720,
         "r_frame_rate": "30/1", "sample_aspect_ratio": "1:1", "display_aspect_ratio": "16:9"},
        {"codec_type": "audio", "codec_name": "aac", "sample_rate": "44100",
         "channels": 2, "bits_per_sample": 0, "bit_rate": "128000"}
    ],
    "format": {"duration": "20.000000"}
}"#;

// Writes progress for 5s and 10s of a 20s input, then the file named by the last argument.
const FFMPEG_PROGRESS: &str = r#"
for last; do :; done
echo "$@" > "$(dirname "$0")/ffmpeg.args"
echo "frame=  150 fps=30 q=28.0 size=256kB time=00:00:05.00 bitrate=419.4kbits/s speed=1x" >&2
sleep 0.2
echo "frame=  300 fps=30 q=28.0 size=512kB time=00:00:10.00 bitrate=419.4kbits/s speed=1x" >&2
sleep 0.2
printf data > "$last"
"#;

#[derive(Default)]
struct RecordingSink {
    beats: Mutex<Vec<(f64, u32)>>,
    fail_after: Option<usize>,
}

impl RecordingSink {
    fn failing_after(count: usize) -> Self {
        RecordingSink {
            beats: Mutex::new(Vec::new()),
            fail_after: Some(count),
        }
    }

    fn beats(&self) -> Vec<(f64, u32)> {
        self.beats.lock().unwrap().clone()
    }
}

impl ProgressSink for RecordingSink {
    fn heartbeat(&self, beat: &Heartbeat<'_>) -> Result<(), SinkError> {
        let mut beats = self.beats.lock().unwrap();
        if self.fail_after.is_some_and(|n| beats.len() >= n) {
            return Err(SinkError::Cancelled {
                reason: "test".to_string(),
            });
        }
        beats.push((beat.done, beat.progress));
        Ok(())
    }
}

struct CopyStore;

impl ObjectStore for CopyStore {
    fn fetch(&self, bucket: &str, key: &str, local_path: &Path) -> FetchOutcome {
        fs::write(local_path, b"png").unwrap();
        FetchOutcome::fetched(format!("{}/{}", bucket, key))
    }
}

struct Fixture {
    dir: TempDir,
    input: PathBuf,
}

impl Fixture {
    fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let input = dir.path().join("input.mov");
        fs::write(&input, b"not really a movie").unwrap();
        let fixture = Fixture { dir, input };
        fixture.script("ffprobe", &format!("cat <<'EOF'\n{}\nEOF", PROBE_JSON));
        fixture.script("convert", r#"for last; do :; done; cp "$1" "$last""#);
        fixture
    }

    fn script(&self, name: &str, body: &str) -> String {
        let path = self.dir.path().join(name);
        fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
        path.to_string_lossy().into_owned()
    }

    fn tools(&self) -> ToolPaths {
        let bin = |name: &str| self.dir.path().join(name).to_string_lossy().into_owned();
        ToolPaths {
            ffmpeg: bin("ffmpeg"),
            ffprobe: bin("ffprobe"),
            convert: bin("convert"),
        }
    }

    fn transcoder(&self) -> Transcoder {
        let presets = PresetStore::from_presets([(
            "720p".to_string(),
            Preset {
                size: "1280x720".parse().unwrap(),
                video_codec: "libx264".to_string(),
                audio_codec: "aac".to_string(),
                video_bitrate: TextOrNumber::Text("2400k".to_string()),
                audio_bitrate: TextOrNumber::Text("128k".to_string()),
                frame_rate: TextOrNumber::Text("30".to_string()),
                video_codec_options: "Profile=main".to_string(),
            },
        )]);
        let supervisor = ExecutionSupervisor::new(Duration::from_millis(10), 1);
        let store: Arc<dyn ObjectStore> = Arc::new(CopyStore);
        Transcoder::new(Arc::new(presets), self.tools(), supervisor, Some(store))
    }

    fn work_dir(&self) -> PathBuf {
        self.dir.path().join("work")
    }

    fn output_dir(&self) -> PathBuf {
        self.dir.path().join("work").join("output")
    }

    fn ffmpeg_args(&self) -> String {
        fs::read_to_string(self.dir.path().join("ffmpeg.args")).unwrap_or_default()
    }

    fn input_metadata(&self, transcoder: &Transcoder) -> Metadata {
        transcoder.probe().metadata(&self.input).unwrap()
    }

    fn run(
        &self,
        spec_json: &str,
        sink: &RecordingSink,
    ) -> Result<transcode_worker::TranscodeOutcome, TranscodeError> {
        let transcoder = self.transcoder();
        let metadata = self.input_metadata(&transcoder);
        let spec = OutputSpec::from_json(spec_json).unwrap();
        transcoder.transcode_asset(
            &self.input,
            &self.work_dir(),
            &self.output_dir(),
            Some(&metadata),
            &spec,
            sink,
        )
    }
}

const VIDEO_SPEC: &str =
    r#"{"type":"video","preset":"720p","output_file_info":{"basename":"out.mp4"}}"#;

#[test]
fn video_transcode_reports_progress_and_probes_output() {
    let fixture = Fixture::new();
    fixture.script("ffmpeg", FFMPEG_PROGRESS);
    let sink = RecordingSink::default();

    let outcome = fixture.run(VIDEO_SPEC, &sink).unwrap();

    assert_eq!(outcome.output_path, fixture.output_dir().join("out.mp4"));
    let info = outcome.output_info.unwrap();
    assert_eq!(info.duration, 20.0);
    assert_eq!(info.video.unwrap().codec, "h264");

    let beats = sink.beats();
    assert_eq!(beats[0], (0.0, 0));
    assert!(beats.len() >= 2, "expected progress heartbeats, got {:?}", beats);
    assert!(beats.windows(2).all(|w| w[0].1 <= w[1].1));
    assert!(beats.iter().any(|(_, progress)| *progress >= 25));

    let args = fixture.ffmpeg_args();
    assert!(args.contains("-vf scale=1280:720"), "{}", args);
    assert!(args.contains("-vcodec libx264 -acodec aac -b:v 2400k -b:a 128k -r 30"));
    assert!(args.contains("-profile:v main"));
}

#[test]
fn non_zero_exit_is_an_execution_error() {
    let fixture = Fixture::new();
    fixture.script("ffmpeg", r#"echo "Unknown encoder 'libx264'" >&2; exit 1"#);

    let err = fixture.run(VIDEO_SPEC, &RecordingSink::default()).unwrap_err();
    match err {
        TranscodeError::Execution(ExecutionError::Failed {
            code, diagnostics, ..
        }) => {
            assert_eq!(code, Some(1));
            assert!(diagnostics.contains("Unknown encoder"));
        }
        other => panic!("unexpected error: {:?}", other),
    }
}

#[test]
fn empty_output_dir_is_a_validation_error() {
    let fixture = Fixture::new();
    fixture.script("ffmpeg", "exit 0");

    let err = fixture.run(VIDEO_SPEC, &RecordingSink::default()).unwrap_err();
    assert!(matches!(
        err,
        TranscodeError::Validation(ValidationError::EmptyOutput { .. })
    ));
}

#[test]
fn unknown_preset_fails_before_anything_runs() {
    let fixture = Fixture::new();
    fixture.script("ffmpeg", FFMPEG_PROGRESS);
    let sink = RecordingSink::default();

    let err = fixture
        .run(
            r#"{"type":"video","preset":"4k","output_file_info":{"basename":"out.mp4"}}"#,
            &sink,
        )
        .unwrap_err();
    assert!(matches!(err, TranscodeError::Config(_)));
    assert!(sink.beats().is_empty());
    assert!(fixture.ffmpeg_args().is_empty());
}

#[test]
fn snapshot_thumbnail_seeks_to_requested_time() {
    let fixture = Fixture::new();
    fixture.script("ffmpeg", FFMPEG_PROGRESS);

    let outcome = fixture
        .run(
            r#"{"type":"thumb","mode":"snapshot","snapshot_sec":2.5,"size":"320x180",
                "output_file_info":{"basename":"thumb.jpg"}}"#,
            &RecordingSink::default(),
        )
        .unwrap();

    assert_eq!(outcome.output_path, fixture.output_dir().join("thumb.jpg"));
    assert!(outcome.output_info.is_some());
    let args = fixture.ffmpeg_args();
    assert!(args.contains("-ss 00:00:02.500"), "{}", args);
    assert!(args.contains("-vframes 1"));
    assert!(args.contains("-f image2 -q:v 8"));
}

#[test]
fn interval_thumbnails_skip_the_output_probe() {
    let fixture = Fixture::new();
    fixture.script(
        "ffmpeg",
        r#"for last; do :; done; echo "$@" > "$(dirname "$0")/ffmpeg.args"; printf x > "$(printf "$last" 1)""#,
    );

    let outcome = fixture
        .run(
            r#"{"type":"thumbnail","mode":"intervals","intervals":5,"size":"320x180",
                "output_file_info":{"basename":"frame.jpg"}}"#,
            &RecordingSink::default(),
        )
        .unwrap();

    assert!(outcome.output_info.is_none());
    assert!(fixture.output_dir().join("frame000001.jpg").is_file());
    assert!(fixture.ffmpeg_args().contains("fps=fps=1/5"));
}

#[test]
fn watermark_offsets_anchor_to_bottom_right() {
    let fixture = Fixture::new();
    fixture.script("ffmpeg", FFMPEG_PROGRESS);

    fixture
        .run(
            r#"{"type":"video","preset":"720p","output_file_info":{"basename":"out.mp4"},
                "watermark":{"bucket":"brand","file":"logos/logo.png","opacity":0.5,
                             "size":"100x50","x":-10,"y":-10}}"#,
            &RecordingSink::default(),
        )
        .unwrap();

    assert!(fixture.work_dir().join("new-logo.png").is_file());
    let args = fixture.ffmpeg_args();
    assert!(args.contains("scale=100:50[wm]"), "{}", args);
    assert!(args.contains("overlay=main_w-overlay_w-10:main_h-overlay_h-10"));
}

#[test]
fn custom_command_substitutes_paths() {
    let fixture = Fixture::new();

    let outcome = fixture
        .run(
            r#"{"custom_cmd":"cp ${input_file} ${output_file}",
                "output_file_info":{"basename":"copy.mov"}}"#,
            &RecordingSink::default(),
        )
        .unwrap();

    let copied = fs::read(&outcome.output_path).unwrap();
    assert_eq!(copied, b"not really a movie");
}

#[test]
fn cancellation_kills_the_running_tool() {
    let fixture = Fixture::new();
    fixture.script("ffmpeg", "exec sleep 5");
    // The initial heartbeat goes through, the first progress heartbeat is refused.
    let sink = RecordingSink::failing_after(1);

    let started = Instant::now();
    let err = fixture.run(VIDEO_SPEC, &sink).unwrap_err();

    assert!(started.elapsed() < Duration::from_secs(3));
    assert!(matches!(
        err,
        TranscodeError::Execution(ExecutionError::Interrupted {
            source: SinkError::Cancelled { .. },
            ..
        })
    ));
    assert_eq!(sink.beats(), vec![(0.0, 0)]);
}

#[test]
fn refused_initial_heartbeat_never_spawns_the_tool() {
    let fixture = Fixture::new();
    fixture.script("ffmpeg", FFMPEG_PROGRESS);

    let err = fixture
        .run(VIDEO_SPEC, &RecordingSink::failing_after(0))
        .unwrap_err();

    assert!(matches!(
        err,
        TranscodeError::Execution(ExecutionError::Interrupted { .. })
    ));
    assert!(fixture.ffmpeg_args().is_empty());
}
