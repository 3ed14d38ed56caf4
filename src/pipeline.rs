use serde::Serialize;
use serde_json::Value;
use tracing::info;

use crate::error::{StudioError, StudioResult};
use crate::llm;
use crate::session::{History, HistoryEntry, SharedSession};

#[derive(Debug, Clone, Serialize)]
pub struct EntryView {
    pub index: usize,
    pub description: Value,
    pub changes: Vec<String>,
    pub mime: String,
}

impl EntryView {
    pub fn from_entry(entry: &HistoryEntry) -> Self {
        EntryView {
            index: entry.index,
            description: entry.description.clone(),
            changes: entry
                .critique
                .as_ref()
                .map(|critique| critique.changes.clone())
                .unwrap_or_default(),
            mime: entry.image_mime.clone(),
        }
    }
}

// Serializes Remake/Refine: a second action while one is in flight is
// rejected instead of interleaving appends. Reset on drop.
struct BusyGuard {
    session: SharedSession,
}

impl BusyGuard {
    fn acquire(session: &SharedSession) -> StudioResult<BusyGuard> {
        let mut locked = session.lock();
        if locked.busy {
            return Err(StudioError::UserInput(
                "Another action is still running. Wait for it to finish.".to_string(),
            ));
        }
        locked.busy = true;
        Ok(BusyGuard {
            session: session.clone(),
        })
    }
}

impl Drop for BusyGuard {
    fn drop(&mut self) {
        self.session.lock().busy = false;
    }
}

// Remake: analyze the source, render the description, and start a new
// refinement chain. Prior attempts are dropped, so the new entry is index 0
// and every later entry derives from its predecessor's critique. Nothing is
// stored unless both model calls succeeded.
pub async fn run_remake(
    session: &SharedSession,
    api_key_override: Option<&str>,
) -> StudioResult<EntryView> {
    let _busy = BusyGuard::acquire(session)?;

    // Snapshot what the calls need; the lock is never held across an await.
    let (source_bytes, source_mime) = {
        let locked = session.lock();
        let source = locked.require_source()?;
        info!(
            "Remake started: analyzing {}x{} {} source",
            source.width, source.height, source.mime_type
        );
        (source.bytes.clone(), source.mime_type.clone())
    };
    let api_key = llm::resolve_api_key(api_key_override)?;

    let description = llm::analyze_image(&api_key, &source_bytes, &source_mime).await?;
    let (image_bytes, image_mime) = llm::generate_image(&api_key, &description).await?;

    let mut locked = session.lock();
    locked.history = History::default();
    let entry = locked
        .history
        .append(description, image_bytes, image_mime, None);
    info!("Remake complete: history entry {}", entry.index);
    Ok(EntryView::from_entry(entry))
}

// Refine: critique (source vs latest attempt), render the revised
// description, append with the critique that produced it.
pub async fn run_refine(
    session: &SharedSession,
    api_key_override: Option<&str>,
) -> StudioResult<EntryView> {
    let _busy = BusyGuard::acquire(session)?;

    let (source_bytes, source_mime, latest_bytes, latest_mime, current_description) = {
        let locked = session.lock();
        let source = locked.require_source()?;
        let latest = locked.history.latest().ok_or_else(|| {
            StudioError::UserInput("Run a remake before refining.".to_string())
        })?;
        (
            source.bytes.clone(),
            source.mime_type.clone(),
            latest.image_bytes.clone(),
            latest.image_mime.clone(),
            latest.description.clone(),
        )
    };
    let api_key = llm::resolve_api_key(api_key_override)?;

    let critique = llm::critique_image(
        &api_key,
        (&source_bytes, &source_mime),
        (&latest_bytes, &latest_mime),
        &current_description,
    )
    .await?;
    let (image_bytes, image_mime) = llm::generate_image(&api_key, &critique.new_prompt).await?;

    let mut locked = session.lock();
    let description = critique.new_prompt.clone();
    let entry = locked
        .history
        .append(description, image_bytes, image_mime, Some(critique));
    info!(
        "Refine complete: history entry {} ({} change(s))",
        entry.index,
        entry
            .critique
            .as_ref()
            .map(|critique| critique.changes.len())
            .unwrap_or(0)
    );
    Ok(EntryView::from_entry(entry))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{new_shared_session, SourceImage};

    fn session_with_source() -> SharedSession {
        let session = new_shared_session();
        session.lock().reset_with_source(SourceImage {
            bytes: vec![1, 2, 3],
            mime_type: "image/png".to_string(),
            width: 1,
            height: 1,
        });
        session
    }

    #[tokio::test]
    async fn remake_without_upload_is_a_user_error_and_appends_nothing() {
        let session = new_shared_session();
        let err = run_remake(&session, None).await.unwrap_err();
        assert_eq!(err.kind(), "user_input");
        assert!(session.lock().history.is_empty());
        assert!(!session.lock().busy);
    }

    #[tokio::test]
    async fn refine_without_remake_is_a_user_error() {
        let session = session_with_source();
        let err = run_refine(&session, None).await.unwrap_err();
        assert_eq!(err.kind(), "user_input");
        assert!(session.lock().history.is_empty());
    }

    #[tokio::test]
    async fn concurrent_action_is_rejected() {
        let session = session_with_source();
        session.lock().busy = true;
        let err = run_remake(&session, None).await.unwrap_err();
        assert_eq!(err.kind(), "user_input");
        // The rejected action must not clear the flag the running one owns.
        assert!(session.lock().busy);
    }

    #[test]
    fn busy_guard_resets_on_drop() {
        let session = session_with_source();
        {
            let _guard = BusyGuard::acquire(&session).expect("session was idle");
            assert!(session.lock().busy);
            assert!(BusyGuard::acquire(&session).is_err());
        }
        assert!(!session.lock().busy);
    }

    #[test]
    fn entry_view_carries_critique_changes() {
        use crate::session::{Critique, History};
        use serde_json::json;

        let mut history = History::default();
        history.append(
            json!({"subject": "cat"}),
            vec![1],
            "image/png".into(),
            Some(Critique {
                changes: vec!["ears enlarged".into()],
                new_prompt: json!({"subject": "cat"}),
            }),
        );
        let view = EntryView::from_entry(history.get(0).unwrap());
        assert_eq!(view.changes, vec!["ears enlarged".to_string()]);
        assert_eq!(view.mime, "image/png");
    }
}
