//! Entry change events

use serde::{Deserialize, Serialize};

/// A chunk of file content stored as a needle
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileChunk {
    /// `<volumeId>,<key><cookie>`
    pub file_id: String,
    pub offset: u64,
    pub size: u64,
}

/// A path-addressed entry (file or directory)
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    pub full_path: String,
    pub is_directory: bool,
    #[serde(default)]
    pub chunks: Vec<FileChunk>,
    /// Modification time, seconds since the epoch
    #[serde(default)]
    pub mtime: u64,
    #[serde(default)]
    pub mode: u32,
}

impl Entry {
    pub fn file(full_path: impl Into<String>, chunks: Vec<FileChunk>) -> Self {
        Self {
            full_path: full_path.into(),
            chunks,
            ..Default::default()
        }
    }

    pub fn directory(full_path: impl Into<String>) -> Self {
        Self {
            full_path: full_path.into(),
            is_directory: true,
            ..Default::default()
        }
    }

    /// Total bytes across all chunks
    #[must_use]
    pub fn size(&self) -> u64 {
        self.chunks.iter().map(|c| c.size).sum()
    }
}

/// One entry change: create (no old entry), delete (no new entry) or update
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventNotification {
    pub old_entry: Option<Entry>,
    pub new_entry: Option<Entry>,
    /// Whether the chunks of the removed entry should be deleted too
    #[serde(default)]
    pub delete_chunks: bool,
}

impl EventNotification {
    /// Key the event is published under: the old entry's path, else the new
    /// entry's; `None` when there is neither.
    #[must_use]
    pub fn key(&self) -> Option<&str> {
        self.old_entry
            .as_ref()
            .or(self.new_entry.as_ref())
            .map(|entry| entry.full_path.as_str())
    }

    pub fn to_json(&self) -> crate::Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(text: &str) -> crate::Result<Self> {
        Ok(serde_json::from_str(text)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_prefers_old_entry() {
        let event = EventNotification {
            old_entry: Some(Entry::file("/a/old", vec![])),
            new_entry: Some(Entry::file("/a/new", vec![])),
            delete_chunks: false,
        };
        assert_eq!(event.key(), Some("/a/old"));

        let created = EventNotification {
            new_entry: Some(Entry::directory("/a/dir")),
            ..Default::default()
        };
        assert_eq!(created.key(), Some("/a/dir"));

        assert_eq!(EventNotification::default().key(), None);
    }

    #[test]
    fn test_json_form() {
        let event = EventNotification {
            old_entry: None,
            new_entry: Some(Entry::file(
                "/docs/readme",
                vec![FileChunk {
                    file_id: "3,01637037d6".into(),
                    offset: 0,
                    size: 42,
                }],
            )),
            delete_chunks: true,
        };

        let json = event.to_json().unwrap();
        assert!(json.contains("\"full_path\":\"/docs/readme\""));
        let parsed = EventNotification::from_json(&json).unwrap();
        assert_eq!(parsed, event);
        assert_eq!(parsed.new_entry.unwrap().size(), 42);
    }
}
