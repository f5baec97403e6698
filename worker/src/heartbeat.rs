use std::sync::{Mutex, PoisonError};

use log::{debug, warn};
use redis::{Commands, Connection, RedisResult};

use crate::error::SinkError;
use crate::progress::{Heartbeat, ProgressSink};

pub const HEARTBEAT_STREAM_KEY: &str = "transcode_heartbeats";
pub const CANCEL_KEY_PREFIX: &str = "transcode_cancel:";

pub fn cancel_key(task_id: &str) -> String {
    format!("{}{}", CANCEL_KEY_PREFIX, task_id)
}

/// Publishes heartbeats to a Valkey stream and reports cancellation requests.
///
/// The coordinator cancels a task by setting `transcode_cancel:<task_id>`; the next
/// heartbeat then fails and the supervisor kills the running tool.
pub struct ValkeyHeartbeatSink {
    connection: Mutex<Connection>,
    task_id: String,
    cancel_key: String,
}

impl ValkeyHeartbeatSink {
    pub fn connect(client: &redis::Client, task_id: &str) -> RedisResult<Self> {
        let connection = client.get_connection()?;
        Ok(ValkeyHeartbeatSink {
            connection: Mutex::new(connection),
            task_id: task_id.to_string(),
            cancel_key: cancel_key(task_id),
        })
    }
}

impl ProgressSink for ValkeyHeartbeatSink {
    fn heartbeat(&self, beat: &Heartbeat<'_>) -> Result<(), SinkError> {
        let payload = serde_json::to_string(beat)?;
        let mut con = self.connection.lock().unwrap_or_else(PoisonError::into_inner);

        let entry_id: String = con.xadd(
            HEARTBEAT_STREAM_KEY,
            "*",
            &[("task_id", self.task_id.as_str()), ("payload", payload.as_str())],
        )?;
        debug!(
            "[Task {}] Heartbeat {} ({}%)",
            self.task_id, entry_id, beat.progress
        );

        let cancelled: bool = con.exists(&self.cancel_key)?;
        if cancelled {
            warn!("[Task {}] Cancellation requested by coordinator", self.task_id);
            return Err(SinkError::Cancelled {
                reason: format!("{} is set", self.cancel_key),
            });
        }
        Ok(())
    }
}
