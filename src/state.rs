use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::{fs, io};
use tokio::sync::{Mutex, RwLock};
use tracing::warn;

use crate::ai::AiQuestionClient;
use crate::auth::RateLimiter;
use crate::config::AppConfig;
use crate::generation::SessionRegistry;
use crate::models::{GenerationStatus, SourceType, StartGenerationRequest};
use crate::sources::UploadedSource;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: String,
    pub external_id: String,
    pub email: Option<String>,
    pub balance: i64,
    #[serde(default)]
    pub usage_reset_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryRecord {
    pub id: String,
    pub user_id: String,
    pub session_id: String,
    pub date: DateTime<Utc>,
    pub status: GenerationStatus,
    pub source_type: SourceType,
    pub question_count: u32,
    pub cost: i64,
    pub outcome: String,
}

/// Users and history are snapshotted to disk; uploads and generation
/// sessions live only in memory.
pub struct InMemoryDb {
    pub users: RwLock<HashMap<String, User>>,
    pub history: RwLock<Vec<HistoryRecord>>,
    pub uploads: DashMap<String, UploadedSource>,
    state_path: Option<PathBuf>,
    // Held across snapshot and write so files land in mutation order.
    persist_guard: Mutex<()>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct PersistentSnapshot {
    users: HashMap<String, User>,
    history: Vec<HistoryRecord>,
}

impl InMemoryDb {
    pub fn new(state_path: Option<PathBuf>) -> Self {
        let snapshot = state_path
            .as_deref()
            .and_then(|path| match fs::read_to_string(path) {
                Ok(raw) => match serde_json::from_str::<PersistentSnapshot>(&raw) {
                    Ok(s) => Some(s),
                    Err(err) => {
                        warn!("failed to read local snapshot {}: {}", path.display(), err);
                        None
                    }
                },
                Err(err) if err.kind() == io::ErrorKind::NotFound => None,
                Err(err) => {
                    warn!("failed to open local snapshot {}: {}", path.display(), err);
                    None
                }
            })
            .unwrap_or_default();

        Self {
            users: RwLock::new(snapshot.users),
            history: RwLock::new(snapshot.history),
            uploads: DashMap::new(),
            state_path,
            persist_guard: Mutex::new(()),
        }
    }

    async fn snapshot(&self) -> PersistentSnapshot {
        PersistentSnapshot {
            users: self.users.read().await.clone(),
            history: self.history.read().await.clone(),
        }
    }

    pub async fn persist(&self) -> anyhow::Result<()> {
        let Some(path) = self.state_path.as_ref() else {
            return Ok(());
        };
        let _guard = self.persist_guard.lock().await;
        let snapshot = self.snapshot().await;
        let serialized = serde_json::to_vec_pretty(&snapshot)?;
        if let Some(parent) = Path::new(path).parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut tmp = path.clone().into_os_string();
        tmp.push(".tmp");
        tokio::fs::write(&tmp, serialized).await?;
        tokio::fs::rename(&tmp, path).await?;
        Ok(())
    }

    pub(crate) async fn persist_or_warn(&self, action: &str) {
        if let Err(err) = self.persist().await {
            warn!("failed to persist local state after {}: {}", action, err);
        }
    }

    pub async fn find_user(&self, external_id: &str) -> Option<User> {
        self.users.read().await.get(external_id).cloned()
    }

    /// Creates the user unless one with the same external id already exists.
    pub async fn create_user(&self, external_id: &str, email: Option<String>, credits: i64) -> User {
        let user = {
            let mut users = self.users.write().await;
            users
                .entry(external_id.to_string())
                .or_insert_with(|| User {
                    id: uuid::Uuid::new_v4().to_string(),
                    external_id: external_id.to_string(),
                    email,
                    balance: credits,
                    usage_reset_at: None,
                    created_at: Utc::now(),
                })
                .clone()
        };
        self.persist_or_warn("create_user").await;
        user
    }

    pub async fn update_email(&self, external_id: &str, email: Option<String>) -> bool {
        let updated = {
            let mut users = self.users.write().await;
            match users.get_mut(external_id) {
                Some(user) => {
                    user.email = email;
                    true
                }
                None => false,
            }
        };
        if updated {
            self.persist_or_warn("update_email").await;
        }
        updated
    }

    /// Removes the user together with their history and uploads.
    pub async fn delete_user(&self, external_id: &str) -> bool {
        let removed = self.users.write().await.remove(external_id).is_some();
        if removed {
            self.history.write().await.retain(|h| h.user_id != external_id);
            self.uploads.retain(|_, upload| upload.owner != external_id);
            self.persist_or_warn("delete_user").await;
        }
        removed
    }
}

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub db: Arc<InMemoryDb>,
    pub sessions: Arc<SessionRegistry>,
    pub ai_client: Arc<dyn AiQuestionClient>,
    pub output_validator: Arc<jsonschema::Validator>,
    pub api_limiter: Arc<RateLimiter>,
    pub generation_limiter: Arc<RateLimiter>,
}

impl AppState {
    pub fn new(config: AppConfig, ai_client: Arc<dyn AiQuestionClient>, output_validator: jsonschema::Validator) -> Self {
        let db = InMemoryDb::new(config.state_path.clone());
        Self {
            api_limiter: Arc::new(RateLimiter::new(config.api_rate_limit)),
            generation_limiter: Arc::new(RateLimiter::new(config.generation_rate_limit)),
            config: Arc::new(config),
            db: Arc::new(db),
            sessions: Arc::new(SessionRegistry::new()),
            ai_client,
            output_validator: Arc::new(output_validator),
        }
    }

    /// Extracted text of the PDF a request points at, if any.
    pub fn source_excerpt(&self, owner: &str, request: &StartGenerationRequest) -> Option<String> {
        if request.source_type != SourceType::Pdf {
            return None;
        }
        let file_id = request.source_file_id.as_deref()?;
        self.db
            .find_upload(owner, file_id)
            .and_then(|upload| upload.extracted_text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("quizgen-{}-{}.json", name, uuid::Uuid::new_v4()))
    }

    #[tokio::test]
    async fn users_survive_a_reload() {
        let path = temp_path("reload");
        let db = InMemoryDb::new(Some(path.clone()));
        db.create_user("user_a", Some("a@example.com".into()), 500).await;

        let reloaded = InMemoryDb::new(Some(path.clone()));
        let user = reloaded.find_user("user_a").await.unwrap();
        assert_eq!(user.balance, 500);
        assert_eq!(user.email.as_deref(), Some("a@example.com"));
        let _ = std::fs::remove_file(path);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_mutations_leave_a_complete_snapshot() {
        let path = temp_path("concurrent");
        let db = Arc::new(InMemoryDb::new(Some(path.clone())));

        for round in 0..3 {
            let tasks: Vec<_> = (0..16)
                .map(|i| {
                    let db = db.clone();
                    tokio::spawn(async move {
                        db.create_user(&format!("user_{round}_{i}"), None, 10).await;
                    })
                })
                .collect();
            for task in tasks {
                task.await.unwrap();
            }

            let raw = std::fs::read_to_string(&path).unwrap();
            let on_disk: PersistentSnapshot = serde_json::from_str(&raw).unwrap();
            assert_eq!(on_disk.users.len(), 16 * (round + 1));
            let reloaded = InMemoryDb::new(Some(path.clone()));
            assert!(reloaded.find_user(&format!("user_{round}_15")).await.is_some());
        }
        let mut tmp = path.clone().into_os_string();
        tmp.push(".tmp");
        assert!(!PathBuf::from(tmp).exists());
        let _ = std::fs::remove_file(path);
    }

    #[tokio::test]
    async fn create_user_is_idempotent() {
        let db = InMemoryDb::new(None);
        let first = db.create_user("user_a", None, 100).await;
        let second = db.create_user("user_a", Some("x@example.com".into()), 999).await;
        assert_eq!(first.id, second.id);
        assert_eq!(second.balance, 100);
    }

    #[tokio::test]
    async fn delete_user_drops_everything() {
        let db = InMemoryDb::new(None);
        db.create_user("user_a", None, 100).await;
        assert!(db.update_email("user_a", Some("new@example.com".into())).await);
        assert!(db.delete_user("user_a").await);
        assert!(db.find_user("user_a").await.is_none());
        assert!(!db.delete_user("user_a").await);
        assert!(!db.update_email("user_a", None).await);
    }
}
