use log::{error, info};
use redis::{AsyncCommands, RedisError, RedisResult, aio::MultiplexedConnection};

pub mod command;
pub mod compiler;
pub mod config;
pub mod error;
pub mod heartbeat;
pub mod job;
pub mod options;
pub mod preset;
pub mod probe;
pub mod progress;
pub mod s3;
pub mod supervisor;
pub mod transcoder;
pub mod watermark;

pub use error::{TranscodeError, TranscodeResult};
pub use options::OutputSpec;
pub use preset::PresetStore;
pub use progress::{Heartbeat, ProgressSink};
pub use transcoder::{TranscodeOutcome, Transcoder};

// Helper to get hostname or a default
pub fn get_consumer_hostname() -> String {
    hostname::get()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "unknown-host".to_string())
}

pub async fn ensure_consumer_group_exists(
    con: &mut MultiplexedConnection,
    stream_key: &str,
    group_name: &str,
) -> RedisResult<()> {
    // "0" lets a new group pick up tasks queued before any worker started.
    let result: Result<(), RedisError> = con
        .xgroup_create_mkstream(stream_key, group_name, "0")
        .await;

    match result {
        Ok(()) => {
            info!(
                "Consumer group '{}' created for stream '{}'",
                group_name, stream_key
            );
            Ok(())
        }
        Err(e) if e.to_string().contains("BUSYGROUP") => {
            info!(
                "Consumer group '{}' already exists for stream '{}'",
                group_name, stream_key
            );
            Ok(())
        }
        Err(e) => {
            error!(
                "Failed to create consumer group '{}' for stream '{}': {}",
                group_name, stream_key, e
            );
            Err(e)
        }
    }
}
