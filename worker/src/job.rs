use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::options::RawOutputSpec;
use crate::probe::Metadata;

pub const TASK_STREAM_KEY: &str = "transcode_tasks";
pub const TASK_CONSUMER_GROUP: &str = "transcode_workers";
pub const RESULT_STREAM_KEY: &str = "transcode_results";

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct TaskPayload {
    pub task_id: String,
    pub input_bucket: String,
    pub input_object_key: String,
    pub output_bucket: String,
    pub output_prefix: String,
    pub output: RawOutputSpec,
    /// Probe result of the input, when the coordinator already has one.
    pub metadata: Option<Metadata>,
}

#[derive(Debug, Clone)]
pub struct Task {
    pub message_id: String, // Valkey message ID
    pub payload: TaskPayload,
}

fn string_field(fields: &HashMap<String, redis::Value>, name: &str) -> Result<String, String> {
    let value = fields
        .get(name)
        .ok_or_else(|| format!("Missing {} field", name))?;
    redis::from_redis_value(value).map_err(|e| format!("Failed to parse {}: {}", name, e))
}

pub fn parse_task_from_map(
    message_id: String,
    fields: HashMap<String, redis::Value>,
) -> Result<Task, String> {
    let task_id = string_field(&fields, "task_id")?;

    let output_json = string_field(&fields, "output_json")?;
    let output: RawOutputSpec = serde_json::from_str(&output_json)
        .map_err(|e| format!("Failed to deserialize output spec from JSON: {}", e))?;

    let metadata = match fields.get("metadata_json") {
        Some(_) => {
            let metadata_json = string_field(&fields, "metadata_json")?;
            Some(
                serde_json::from_str(&metadata_json)
                    .map_err(|e| format!("Failed to deserialize metadata from JSON: {}", e))?,
            )
        }
        None => None,
    };

    Ok(Task {
        message_id,
        payload: TaskPayload {
            task_id,
            input_bucket: string_field(&fields, "input_bucket")?,
            input_object_key: string_field(&fields, "input_object_key")?,
            output_bucket: string_field(&fields, "output_bucket")?,
            output_prefix: string_field(&fields, "output_prefix").unwrap_or_default(),
            output,
            metadata,
        },
    })
}
