use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;
use tracing::warn;

use crate::config::CONFIG;
use crate::error::{StudioError, StudioResult};

#[derive(Debug, Clone)]
pub struct SourceImage {
    pub bytes: Vec<u8>,
    pub mime_type: String,
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone)]
pub struct Critique {
    pub changes: Vec<String>,
    pub new_prompt: Value,
}

#[derive(Debug, Clone)]
pub struct HistoryEntry {
    pub index: usize,
    pub description: Value,
    pub image_bytes: Vec<u8>,
    pub image_mime: String,
    pub critique: Option<Critique>,
}

// Append-only. Entry n's description derives from entry n-1's critique;
// entry 0's comes straight from the source analysis.
#[derive(Debug, Default)]
pub struct History {
    entries: Vec<HistoryEntry>,
}

impl History {
    pub fn append(
        &mut self,
        description: Value,
        image_bytes: Vec<u8>,
        image_mime: String,
        critique: Option<Critique>,
    ) -> &HistoryEntry {
        let index = self.entries.len();
        self.entries.push(HistoryEntry {
            index,
            description,
            image_bytes,
            image_mime,
            critique,
        });
        if self.entries.len() > CONFIG.history_soft_limit {
            warn!(
                "History holds {} in-memory images (soft limit {}); memory keeps growing until a new upload.",
                self.entries.len(),
                CONFIG.history_soft_limit
            );
        }
        self.entries.last().expect("entry was just pushed")
    }

    pub fn get(&self, index: usize) -> Option<&HistoryEntry> {
        self.entries.get(index)
    }

    pub fn entries(&self) -> &[HistoryEntry] {
        &self.entries
    }

    pub fn latest(&self) -> Option<&HistoryEntry> {
        self.entries.last()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Debug, Default)]
pub struct Session {
    pub source: Option<SourceImage>,
    pub history: History,
    pub busy: bool,
}

impl Session {
    // A new upload starts the session over; prior generations are dropped.
    pub fn reset_with_source(&mut self, source: SourceImage) {
        self.source = Some(source);
        self.history = History::default();
        self.busy = false;
    }

    pub fn require_source(&self) -> StudioResult<&SourceImage> {
        self.source
            .as_ref()
            .ok_or_else(|| StudioError::UserInput("Upload an image before running an action.".to_string()))
    }
}

pub type SharedSession = Arc<Mutex<Session>>;

pub fn new_shared_session() -> SharedSession {
    Arc::new(Mutex::new(Session::default()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn source() -> SourceImage {
        SourceImage {
            bytes: vec![1, 2, 3],
            mime_type: "image/png".to_string(),
            width: 2,
            height: 2,
        }
    }

    #[test]
    fn append_assigns_sequential_indices() {
        let mut history = History::default();
        let first = history
            .append(json!({"subject": "cat"}), vec![9], "image/png".into(), None)
            .index;
        let second = history
            .append(
                json!({"subject": "cat, fixed"}),
                vec![8],
                "image/png".into(),
                Some(Critique {
                    changes: vec!["ears too small".into()],
                    new_prompt: json!({"subject": "cat, fixed"}),
                }),
            )
            .index;
        assert_eq!((first, second), (0, 1));
        assert_eq!(history.len(), 2);
    }

    #[test]
    fn stored_image_bytes_are_returned_unmodified() {
        let mut history = History::default();
        let bytes = vec![0xDE, 0xAD, 0xBE, 0xEF];
        history.append(json!({}), bytes.clone(), "image/png".into(), None);
        assert_eq!(history.get(0).unwrap().image_bytes, bytes);
    }

    #[test]
    fn get_out_of_range_is_none() {
        let history = History::default();
        assert!(history.get(0).is_none());
    }

    #[test]
    fn first_entry_carries_no_critique() {
        let mut history = History::default();
        history.append(json!({"subject": "dog"}), vec![1], "image/png".into(), None);
        assert!(history.get(0).unwrap().critique.is_none());
    }

    #[test]
    fn failed_action_appends_nothing() {
        let mut session = Session::default();
        session.reset_with_source(source());

        // The pipeline only appends after every model call succeeded.
        let critique: StudioResult<Critique> =
            Err(StudioError::Transport("connection reset".into()));
        if let Ok(critique) = critique {
            session
                .history
                .append(critique.new_prompt.clone(), vec![], "image/png".into(), Some(critique));
        }
        assert!(session.history.is_empty());
    }

    #[test]
    fn new_upload_resets_history() {
        let mut session = Session::default();
        session.reset_with_source(source());
        session
            .history
            .append(json!({}), vec![1], "image/png".into(), None);
        session.reset_with_source(source());
        assert!(session.history.is_empty());
        assert!(session.source.is_some());
    }

    #[test]
    fn require_source_fails_before_upload() {
        let session = Session::default();
        let err = session.require_source().unwrap_err();
        assert_eq!(err.kind(), "user_input");
    }
}
