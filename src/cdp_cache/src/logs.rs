use ic_canister_log::{declare_log_buffer, export as export_logs, GlobalBuffer};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

// High-priority messages.
declare_log_buffer!(name = INFO, capacity = 1000);

// Low-priority info messages.
declare_log_buffer!(name = DEBUG, capacity = 1000);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Priority {
    Info,
    Debug,
}

impl FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "info" => Ok(Priority::Info),
            "debug" => Ok(Priority::Debug),
            _ => Err("could not recognize priority".to_string()),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: u64,
    pub priority: Priority,
    pub file: String,
    pub line: u32,
    pub message: String,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Log {
    pub entries: Vec<LogEntry>,
}

impl Log {
    pub fn push_logs(&mut self, priority: Priority) {
        let buffer: &'static GlobalBuffer = match priority {
            Priority::Info => &INFO,
            Priority::Debug => &DEBUG,
        };
        for entry in export_logs(buffer) {
            self.entries.push(LogEntry {
                timestamp: entry.timestamp,
                priority,
                file: entry.file.to_string(),
                line: entry.line,
                message: entry.message,
            });
        }
    }

    pub fn push_all(&mut self) {
        self.push_logs(Priority::Info);
        self.push_logs(Priority::Debug);
    }

    /// JSON rendering of the newest entries that fit in `max_body_size` bytes.
    pub fn serialize_logs(&self, max_body_size: usize) -> String {
        let mut entries: Vec<&LogEntry> = self.entries.iter().collect();
        entries.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));

        let mut kept: Vec<&LogEntry> = vec![];
        let mut size = 2;
        for entry in entries {
            let entry_size = serde_json::to_string(entry).map(|s| s.len()).unwrap_or(0) + 1;
            if size + entry_size > max_body_size {
                break;
            }
            size += entry_size;
            kept.push(entry);
        }
        serde_json::to_string(&kept).unwrap_or_else(|_| "[]".to_string())
    }
}
