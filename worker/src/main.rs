use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, warn};
use redis::aio::MultiplexedConnection;
use redis::streams::{StreamReadOptions, StreamReadReply};
use redis::{AsyncCommands, RedisResult};
use serde::Serialize;
use tokio::runtime::Handle;
use tokio::signal;
use tokio::time::sleep;
use uuid::Uuid;

use transcode_worker::config::WorkerConfig;
use transcode_worker::heartbeat::ValkeyHeartbeatSink;
use transcode_worker::job::{
    RESULT_STREAM_KEY, TASK_CONSUMER_GROUP, TASK_STREAM_KEY, Task, TaskPayload,
    parse_task_from_map,
};
use transcode_worker::s3::{ObjectStore, S3ObjectStore, download_file, new_s3_client, upload_file};
use transcode_worker::{
    OutputSpec, PresetStore, TranscodeOutcome, Transcoder, ensure_consumer_group_exists,
    get_consumer_hostname,
};

const WORKER_LOOP_DELAY_MS: u64 = 1000;
const STREAM_BLOCK_TIMEOUT_MS: usize = 5000;
const INPUT_SUBDIR: &str = "input";
const OUTPUT_SUBDIR: &str = "output";

struct Worker {
    transcoder: Arc<Transcoder>,
    s3_client: aws_sdk_s3::Client,
    valkey_client: redis::Client,
    work_root: PathBuf,
}

struct TaskReport {
    outcome: TranscodeOutcome,
    uploaded_keys: Vec<String>,
}

#[derive(Serialize)]
struct TaskResult<'a> {
    task_id: &'a str,
    status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    outcome: Option<&'a TranscodeOutcome>,
    uploaded_keys: &'a [String],
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<&'a str>,
}

fn object_key(prefix: &str, file_name: &str) -> String {
    let prefix = prefix.trim_end_matches('/');
    if prefix.is_empty() {
        file_name.to_string()
    } else {
        format!("{}/{}", prefix, file_name)
    }
}

async fn upload_outputs(
    s3_client: &aws_sdk_s3::Client,
    payload: &TaskPayload,
    output_dir: &Path,
) -> Result<Vec<String>, String> {
    let mut entries = tokio::fs::read_dir(output_dir)
        .await
        .map_err(|e| format!("Failed to list output dir {:?}: {}", output_dir, e))?;

    let mut files = Vec::new();
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| format!("Failed to list output dir {:?}: {}", output_dir, e))?
    {
        let path = entry.path();
        if path.is_file() {
            files.push((entry.file_name().to_string_lossy().into_owned(), path));
        }
    }
    files.sort();

    let mut uploaded_keys = Vec::with_capacity(files.len());
    for (name, path) in files {
        let key = object_key(&payload.output_prefix, &name);
        upload_file(s3_client, &payload.output_bucket, &key, &path).await?;
        uploaded_keys.push(key);
    }
    Ok(uploaded_keys)
}

async fn run_task(worker: &Worker, task: &Task, work_dir: &Path) -> Result<TaskReport, String> {
    let payload = &task.payload;
    let task_id = payload.task_id.clone();

    let input_name = Path::new(&payload.input_object_key)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "input".to_string());
    let input_path = work_dir.join(INPUT_SUBDIR).join(input_name);
    let output_dir = work_dir.join(OUTPUT_SUBDIR);

    info!(
        "[Task {}] Downloading s3://{}/{} to {:?}",
        task_id, payload.input_bucket, payload.input_object_key, input_path
    );
    download_file(
        &worker.s3_client,
        &payload.input_bucket,
        &payload.input_object_key,
        &input_path,
    )
    .await
    .map_err(|e| format!("S3 Download failed: {}", e))?;

    // Probing and transcoding block on child processes.
    let transcoder = Arc::clone(&worker.transcoder);
    let valkey_client = worker.valkey_client.clone();
    let payload_for_blocking = payload.clone();
    let work_dir_for_blocking = work_dir.to_path_buf();
    let output_dir_for_blocking = output_dir.clone();

    let outcome = tokio::task::spawn_blocking(move || -> Result<TranscodeOutcome, String> {
        let TaskPayload {
            task_id,
            output,
            metadata,
            ..
        } = payload_for_blocking;

        let sink = ValkeyHeartbeatSink::connect(&valkey_client, &task_id)
            .map_err(|e| format!("Failed to open heartbeat connection: {}", e))?;
        let spec = OutputSpec::try_from(output).map_err(|e| format!("Invalid output spec: {}", e))?;
        let metadata = match metadata {
            Some(metadata) => metadata,
            None => {
                debug!("[Task {}] No input metadata supplied, probing {:?}", task_id, input_path);
                transcoder
                    .probe()
                    .metadata(&input_path)
                    .map_err(|e| format!("Probing input failed: {}", e))?
            }
        };

        transcoder
            .transcode_asset(
                &input_path,
                &work_dir_for_blocking,
                &output_dir_for_blocking,
                Some(&metadata),
                &spec,
                &sink,
            )
            .map_err(|e| format!("Transcoding failed: {}", e))
    })
    .await
    .map_err(|e| format!("Transcoding task failed (panic/cancellation): {}", e))??;

    let uploaded_keys = upload_outputs(&worker.s3_client, payload, &output_dir).await?;
    info!(
        "[Task {}] Uploaded {} file(s) to s3://{}/{}",
        task_id,
        uploaded_keys.len(),
        payload.output_bucket,
        payload.output_prefix
    );

    Ok(TaskReport {
        outcome,
        uploaded_keys,
    })
}

async fn process_single_task(worker: &Worker, task: &Task) -> Result<TaskReport, String> {
    let task_id = &task.payload.task_id;
    info!(
        "[Task {}] Processing. Input: s3://{}/{}, Output: s3://{}/{}",
        task_id,
        task.payload.input_bucket,
        task.payload.input_object_key,
        task.payload.output_bucket,
        task.payload.output_prefix
    );
    debug!("[Task {}] Output spec: {:?}", task_id, task.payload.output);

    // Watermark intermediates are named after their source file, so no two tasks may share this.
    let work_dir = worker
        .work_root
        .join(format!("{}-{}", task_id, Uuid::new_v4()));
    tokio::fs::create_dir_all(&work_dir)
        .await
        .map_err(|e| format!("[Task {}] Failed to create work dir {:?}: {}", task_id, work_dir, e))?;

    let result = run_task(worker, task, &work_dir)
        .await
        .map_err(|e| format!("[Task {}] {}", task_id, e));

    debug!("[Task {}] Cleaning up work dir {:?}", task_id, work_dir);
    if let Err(e) = tokio::fs::remove_dir_all(&work_dir).await {
        warn!("[Task {}] Failed to remove work dir {:?}: {}", task_id, work_dir, e);
    }
    result
}

async fn publish_result(con: &mut MultiplexedConnection, result: &TaskResult<'_>) {
    let payload = match serde_json::to_string(result) {
        Ok(payload) => payload,
        Err(e) => {
            error!("[Task {}] Failed to encode result: {}", result.task_id, e);
            return;
        }
    };
    let published: RedisResult<String> = con
        .xadd(
            RESULT_STREAM_KEY,
            "*",
            &[
                ("task_id", result.task_id),
                ("status", result.status),
                ("payload", payload.as_str()),
            ],
        )
        .await;
    match published {
        Ok(entry_id) => debug!(
            "[Task {}] Published {} result as {}",
            result.task_id, result.status, entry_id
        ),
        Err(e) => error!("[Task {}] Failed to publish result: {}", result.task_id, e),
    }
}

async fn tasks_processing_loop(
    mut valkey_con: MultiplexedConnection,
    worker: Worker,
    stream_key: &str,
    group_name: &str,
    consumer_name: &str,
) {
    info!(
        "Worker '{}' starting to process tasks from stream '{}', group '{}'",
        consumer_name, stream_key, group_name
    );

    loop {
        let read_opts = StreamReadOptions::default()
            .group(group_name, consumer_name)
            .count(1)
            .block(STREAM_BLOCK_TIMEOUT_MS);

        let result: RedisResult<Option<StreamReadReply>> = valkey_con
            .xread_options(&[stream_key], &[">"], &read_opts)
            .await;

        match result {
            Ok(Some(reply)) => {
                for stream_key_entry in reply.keys {
                    for message_entry in stream_key_entry.ids {
                        let task = match parse_task_from_map(message_entry.id.clone(), message_entry.map) {
                            Ok(t) => t,
                            Err(e) => {
                                error!(
                                    "Failed to parse task (Valkey ID: {}): {}. Skipping.",
                                    message_entry.id, e
                                );
                                continue;
                            }
                        };
                        let task_id = task.payload.task_id.as_str();

                        match process_single_task(&worker, &task).await {
                            Ok(report) => {
                                info!("[Task {}] Successfully processed.", task_id);
                                publish_result(
                                    &mut valkey_con,
                                    &TaskResult {
                                        task_id,
                                        status: "done",
                                        outcome: Some(&report.outcome),
                                        uploaded_keys: &report.uploaded_keys,
                                        error: None,
                                    },
                                )
                                .await;
                                match valkey_con
                                    .xack::<_, _, _, i64>(stream_key, group_name, &[&task.message_id])
                                    .await
                                {
                                    Ok(acked_count) if acked_count > 0 => info!(
                                        "[Task {}] ACKed Valkey message_id: {}",
                                        task_id, task.message_id
                                    ),
                                    Ok(_) => warn!(
                                        "[Task {}] ACK for Valkey message_id {} returned 0.",
                                        task_id, task.message_id
                                    ),
                                    Err(e) => error!(
                                        "[Task {}] Failed to ACK Valkey message_id {}: {}",
                                        task_id, task.message_id, e
                                    ),
                                }
                            }
                            Err(message) => {
                                error!(
                                    "Task failed: {}. Valkey message {} will NOT be ACKed.",
                                    message, task.message_id
                                );
                                publish_result(
                                    &mut valkey_con,
                                    &TaskResult {
                                        task_id,
                                        status: "failed",
                                        outcome: None,
                                        uploaded_keys: &[],
                                        error: Some(message.as_str()),
                                    },
                                )
                                .await;
                            }
                        }
                    }
                }
            }
            Ok(None) => {
                debug!(
                    "No messages received for consumer '{}' within timeout, re-checking.",
                    consumer_name
                );
            }
            Err(e) => {
                error!(
                    "Error reading from Valkey stream '{}': {}. Retrying after delay.",
                    stream_key, e
                );
                sleep(Duration::from_millis(WORKER_LOOP_DELAY_MS)).await;
            }
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = WorkerConfig::from_env();
    let consumer_name = format!("worker-{}-{}", get_consumer_hostname(), Uuid::new_v4());
    info!("Starting worker with consumer name: {}", consumer_name);

    let presets = PresetStore::open(&config.presets_dir).map_err(|e| {
        error!("Failed to load presets from {:?}: {}", config.presets_dir, e);
        e
    })?;
    info!("Loaded {} preset(s) from {:?}", presets.len(), config.presets_dir);

    let s3_client = new_s3_client(&config.storage).await;
    info!("S3 client initialized.");
    let store: Arc<dyn ObjectStore> =
        Arc::new(S3ObjectStore::new(s3_client.clone(), Handle::current()));
    let transcoder = Transcoder::new(
        Arc::new(presets),
        config.tools.clone(),
        config.supervisor(),
        Some(store),
    );

    tokio::fs::create_dir_all(&config.work_root).await?;

    info!("Connecting to Valkey at: {}", config.valkey_url);
    let valkey_client = redis::Client::open(config.valkey_url.as_str())?;
    let mut valkey_con = valkey_client
        .get_multiplexed_async_connection()
        .await
        .map_err(|e| {
            error!("Failed to connect to Valkey: {}", e);
            e
        })?;
    info!("Successfully connected to Valkey.");

    if let Err(e) =
        ensure_consumer_group_exists(&mut valkey_con, TASK_STREAM_KEY, TASK_CONSUMER_GROUP).await
    {
        error!("Could not ensure consumer group exists: {}. Exiting.", e);
        return Err(e.into());
    }

    let worker = Worker {
        transcoder: Arc::new(transcoder),
        s3_client,
        valkey_client,
        work_root: config.work_root.clone(),
    };

    tokio::select! {
        _ = tasks_processing_loop(valkey_con, worker, TASK_STREAM_KEY, TASK_CONSUMER_GROUP, &consumer_name) => {
            error!("Task processing loop exited unexpectedly.");
        }
        _ = signal::ctrl_c() => {
            info!("CTRL-C received, shutting down worker '{}'.", consumer_name);
        }
    }

    info!("Worker {} finished.", consumer_name);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn object_keys_join_prefix_and_name() {
        assert_eq!(object_key("", "a.mp4"), "a.mp4");
        assert_eq!(object_key("videos/42", "a.mp4"), "videos/42/a.mp4");
        assert_eq!(object_key("videos/42/", "a.mp4"), "videos/42/a.mp4");
    }
}
