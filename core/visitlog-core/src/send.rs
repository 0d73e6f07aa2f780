//! Outbound hand-off of composed transcripts.
//!
//! The engine only knows whether a hand-off was attempted and accepted by the
//! channel; delivery belongs to whatever drains the channel.

use chrono::{DateTime, Utc};
use fs_err::OpenOptions;
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;

pub trait SendChannel: Send + Sync {
    fn hand_off(&self, destination: &str, text: &str) -> Result<(), String>;
}

/// Marks `encodeURIComponent` leaves unescaped.
const URI_COMPONENT_MARKS: [(&str, &str); 5] = [
    ("%21", "!"),
    ("%27", "'"),
    ("%28", "("),
    ("%29", ")"),
    ("%2A", "*"),
];

/// `sms:` link that opens the device's messaging app with the body pre-filled.
pub fn sms_uri(phone: &str, body: &str) -> String {
    let encoded = URI_COMPONENT_MARKS
        .iter()
        .fold(urlencoding::encode(body).into_owned(), |acc, (escaped, mark)| {
            acc.replace(escaped, mark)
        });
    format!("sms:{}&body={}", phone.trim(), encoded)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboxEntry {
    pub destination: String,
    pub body: String,
    pub sms_uri: String,
    pub queued_at: DateTime<Utc>,
}

/// Appends one JSON line per hand-off to a local outbox file.
pub struct OutboxChannel {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl OutboxChannel {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    pub fn read_entries(&self) -> Result<Vec<OutboxEntry>, String> {
        let content = match fs_err::read_to_string(&self.path) {
            Ok(content) => content,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(format!("Failed to read outbox: {}", err)),
        };

        content
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| {
                serde_json::from_str(line)
                    .map_err(|err| format!("Failed to parse outbox entry: {}", err))
            })
            .collect()
    }
}

impl SendChannel for OutboxChannel {
    fn hand_off(&self, destination: &str, text: &str) -> Result<(), String> {
        let entry = OutboxEntry {
            destination: destination.to_string(),
            body: text.to_string(),
            sms_uri: sms_uri(destination, text),
            queued_at: Utc::now(),
        };
        let mut line = serde_json::to_string(&entry)
            .map_err(|err| format!("Failed to serialize outbox entry: {}", err))?;
        line.push('\n');

        let _guard = self
            .write_lock
            .lock()
            .map_err(|_| "Outbox lock poisoned".to_string())?;
        if let Some(parent) = self.path.parent() {
            fs_err::create_dir_all(parent)
                .map_err(|err| format!("Failed to create outbox dir: {}", err))?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|err| format!("Failed to open outbox: {}", err))?;
        file.write_all(line.as_bytes())
            .map_err(|err| format!("Failed to write outbox: {}", err))?;
        file.flush()
            .map_err(|err| format!("Failed to flush outbox: {}", err))?;

        tracing::info!(destination = %destination, bytes = text.len(), "Transcript queued in outbox");
        Ok(())
    }
}
