//! Mailbox delivery target: the simplest possible downstream collaborator.
//! Each accepted `send` is appended as one line of JSON to a per-instance
//! file under the registry directory, for a host that has no richer
//! capture pipeline to hand payloads to.

use std::io::Write as _;
use std::path::PathBuf;
use std::sync::Mutex;

use bridgefabric_core::identity::now_ms;
use bridgefabric_core::{DeliveryError, DeliveryTarget};
use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize, Deserialize)]
struct MailboxEntry {
    #[serde(rename = "receivedAt")]
    received_at: i64,
    content: String,
}

pub struct MailboxDelivery {
    path: Mutex<PathBuf>,
}

impl MailboxDelivery {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path: Mutex::new(path),
        }
    }
}

#[async_trait::async_trait]
impl DeliveryTarget for MailboxDelivery {
    async fn deliver(&self, content: String) -> Result<(), DeliveryError> {
        let path = self.path.lock().expect("mailbox path lock poisoned").clone();
        tokio::task::spawn_blocking(move || append_entry(&path, content))
            .await
            .map_err(|e| DeliveryError::Failed(format!("mailbox task panicked: {e}")))?
    }
}

fn append_entry(path: &std::path::Path, content: String) -> Result<(), DeliveryError> {
    let entry = MailboxEntry {
        received_at: now_ms(),
        content,
    };
    let line = serde_json::to_string(&entry)
        .map_err(|e| DeliveryError::Failed(format!("could not serialize mailbox entry: {e}")))?;

    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| DeliveryError::Failed(format!("could not open mailbox file: {e}")))?;

    writeln!(file, "{line}").map_err(|e| DeliveryError::Failed(format!("could not write mailbox entry: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn delivered_content_is_appended_as_a_json_line() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mailbox.jsonl");
        let delivery = MailboxDelivery::new(path.clone());

        delivery.deliver("hello".to_string()).await.unwrap();
        delivery.deliver("world".to_string()).await.unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 2);
        let first: MailboxEntry = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first.content, "hello");
    }
}
