use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::conversation::{ChatMessage, SessionId, Utterance};
use crate::error::{Result, VoxError};

/// Append-only record of completed turns, keyed by session.
pub trait HistoryStore: Send + Sync {
    fn append(&self, utterance: &Utterance) -> Result<()>;

    /// All utterances of a session in the order they were appended.
    fn session_messages(&self, session: &SessionId) -> Result<Vec<Utterance>>;

    /// Drop every utterance of a session; returns how many were removed.
    fn clear_session(&self, session: &SessionId) -> Result<usize>;

    /// Prior context for a chat request.
    fn chat_messages(&self, session: &SessionId) -> Result<Vec<ChatMessage>> {
        Ok(self
            .session_messages(session)?
            .iter()
            .map(ChatMessage::from)
            .collect())
    }
}

/// Timestamped snapshot of one session, written as pretty JSON.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TranscriptExport {
    pub timestamp: DateTime<Utc>,
    pub session: SessionId,
    pub message_count: usize,
    pub messages: Vec<Utterance>,
}

impl TranscriptExport {
    pub fn build(store: &dyn HistoryStore, session: &SessionId) -> Result<Self> {
        let messages = store.session_messages(session)?;
        Ok(Self {
            timestamp: Utc::now(),
            session: session.clone(),
            message_count: messages.len(),
            messages,
        })
    }

    #[must_use]
    pub fn default_file_name(session: &SessionId) -> String {
        format!("voxloop_{session}.json")
    }

    pub fn write(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| VoxError::History(format!("failed to serialize export: {e}")))?;
        fs::write(path, json).map_err(|e| {
            VoxError::History(format!("failed to write export {}: {e}", path.display()))
        })
    }
}

/// History kept in a single JSON array on disk, shared by every session.
pub struct JsonHistoryStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl JsonHistoryStore {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        Ok(Self {
            path: path.to_path_buf(),
            lock: Mutex::new(()),
        })
    }

    fn read_all(&self) -> Result<Vec<Utterance>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let data = fs::read_to_string(&self.path).map_err(|e| {
            VoxError::History(format!("failed to read {}: {e}", self.path.display()))
        })?;
        if data.trim().is_empty() {
            return Ok(Vec::new());
        }
        serde_json::from_str(&data).map_err(|e| {
            VoxError::History(format!("failed to parse {}: {e}", self.path.display()))
        })
    }

    /// Writes `{path}.part`, then renames it over the store.
    fn write_all(&self, utterances: &[Utterance]) -> Result<()> {
        let json = serde_json::to_string(utterances)
            .map_err(|e| VoxError::History(format!("failed to serialize history: {e}")))?;
        let part_path = self.path.with_extension("json.part");
        fs::write(&part_path, json)?;
        fs::rename(&part_path, &self.path)?;
        Ok(())
    }
}

impl HistoryStore for JsonHistoryStore {
    fn append(&self, utterance: &Utterance) -> Result<()> {
        let _guard = self.lock.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let mut all = self.read_all()?;
        all.push(utterance.clone());
        self.write_all(&all)?;
        tracing::debug!(
            "history: appended {:?} utterance to {}",
            utterance.role,
            utterance.session
        );
        Ok(())
    }

    fn session_messages(&self, session: &SessionId) -> Result<Vec<Utterance>> {
        let _guard = self.lock.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        Ok(self
            .read_all()?
            .into_iter()
            .filter(|u| &u.session == session)
            .collect())
    }

    fn clear_session(&self, session: &SessionId) -> Result<usize> {
        let _guard = self.lock.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let all = self.read_all()?;
        let before = all.len();
        let kept: Vec<Utterance> = all.into_iter().filter(|u| &u.session != session).collect();
        let removed = before - kept.len();
        self.write_all(&kept)?;
        tracing::info!("history: cleared {removed} utterances of {session}");
        Ok(removed)
    }
}

/// History that lives as long as the process. Used when persistence is turned off.
#[derive(Default)]
pub struct MemoryHistoryStore {
    utterances: Mutex<Vec<Utterance>>,
}

impl MemoryHistoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl HistoryStore for MemoryHistoryStore {
    fn append(&self, utterance: &Utterance) -> Result<()> {
        self.utterances
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(utterance.clone());
        Ok(())
    }

    fn session_messages(&self, session: &SessionId) -> Result<Vec<Utterance>> {
        Ok(self
            .utterances
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .iter()
            .filter(|u| &u.session == session)
            .cloned()
            .collect())
    }

    fn clear_session(&self, session: &SessionId) -> Result<usize> {
        let mut all = self
            .utterances
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let before = all.len();
        all.retain(|u| &u.session != session);
        Ok(before - all.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conversation::{Modality, Role, Session};

    fn store_in(dir: &Path) -> JsonHistoryStore {
        JsonHistoryStore::open(&dir.join("nested/history.json")).unwrap_or_else(|e| panic!("{e}"))
    }

    #[test]
    fn appends_and_reads_back_in_order() {
        let dir = tempfile::tempdir().unwrap_or_else(|e| panic!("{e}"));
        let store = store_in(dir.path());
        let session = Session::new(SessionId::from("a"));

        for (i, role) in [Role::User, Role::Assistant, Role::User].into_iter().enumerate() {
            let u = session.utterance(role, Modality::Text, format!("msg {i}"), None);
            store.append(&u).unwrap_or_else(|e| panic!("{e}"));
        }

        let msgs = store
            .session_messages(session.id())
            .unwrap_or_else(|e| panic!("{e}"));
        assert_eq!(msgs.len(), 3);
        assert_eq!(msgs[0].content, "msg 0");
        assert_eq!(msgs[1].role, Role::Assistant);
        assert!(msgs.windows(2).all(|w| w[0].created_at < w[1].created_at));
    }

    #[test]
    fn sessions_are_isolated_and_clearable() {
        let dir = tempfile::tempdir().unwrap_or_else(|e| panic!("{e}"));
        let store = store_in(dir.path());
        let a = Session::new(SessionId::from("a"));
        let b = Session::new(SessionId::from("b"));

        store
            .append(&a.utterance(Role::User, Modality::Text, "from a", None))
            .unwrap_or_else(|e| panic!("{e}"));
        store
            .append(&b.utterance(Role::User, Modality::Voice, "from b", None))
            .unwrap_or_else(|e| panic!("{e}"));

        let removed = store.clear_session(a.id()).unwrap_or_else(|e| panic!("{e}"));
        assert_eq!(removed, 1);
        assert!(store.session_messages(a.id()).unwrap_or_else(|e| panic!("{e}")).is_empty());
        assert_eq!(
            store.session_messages(b.id()).unwrap_or_else(|e| panic!("{e}")).len(),
            1
        );
    }

    #[test]
    fn chat_messages_strip_metadata() {
        let store = MemoryHistoryStore::new();
        let session = Session::new(SessionId::from("a"));
        store
            .append(&session.utterance(Role::User, Modality::Voice, "hello", Some("x.wav".into())))
            .unwrap_or_else(|e| panic!("{e}"));

        let msgs = store.chat_messages(session.id()).unwrap_or_else(|e| panic!("{e}"));
        assert_eq!(
            msgs,
            vec![ChatMessage {
                role: Role::User,
                content: "hello".to_string()
            }]
        );
    }

    #[test]
    fn export_contains_count_and_messages() {
        let dir = tempfile::tempdir().unwrap_or_else(|e| panic!("{e}"));
        let store = store_in(dir.path());
        let session = Session::new(SessionId::from("export-me"));
        store
            .append(&session.utterance(Role::User, Modality::Text, "one", None))
            .unwrap_or_else(|e| panic!("{e}"));
        store
            .append(&session.utterance(Role::Assistant, Modality::Text, "two", None))
            .unwrap_or_else(|e| panic!("{e}"));

        let export =
            TranscriptExport::build(&store, session.id()).unwrap_or_else(|e| panic!("{e}"));
        let path = dir
            .path()
            .join(TranscriptExport::default_file_name(session.id()));
        export.write(&path).unwrap_or_else(|e| panic!("{e}"));

        let json: serde_json::Value = serde_json::from_str(
            &fs::read_to_string(&path).unwrap_or_else(|e| panic!("{e}")),
        )
        .unwrap_or_else(|e| panic!("{e}"));
        assert_eq!(json["session"], "export-me");
        assert_eq!(json["messageCount"], 2);
        assert_eq!(json["messages"][1]["content"], "two");
        assert!(path.ends_with("voxloop_export-me.json"));
    }

    #[test]
    fn missing_file_reads_as_empty() {
        let dir = tempfile::tempdir().unwrap_or_else(|e| panic!("{e}"));
        let store = store_in(dir.path());
        assert!(
            store
                .session_messages(&SessionId::from("nobody"))
                .unwrap_or_else(|e| panic!("{e}"))
                .is_empty()
        );
    }
}
