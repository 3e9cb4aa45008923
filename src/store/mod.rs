use crate::model::{AuthState, Creds, KeyStore};
use async_trait::async_trait;
use base64::{engine::general_purpose, Engine as _};
use serde::{Deserialize, Serialize};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

const CREDS_FILE: &str = "creds.json";
const KEY_FILE_PREFIX: &str = "key-";
const FILE_SUFFIX: &str = ".json";

type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("credential store unavailable at {}: {source}", .path.display())]
    Unavailable {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("credential write failed at {}: {source}", .path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("credential file {} is corrupt: {source}", .path.display())]
    Corrupt {
        path: PathBuf,
        #[source]
        source: BoxError,
    },
}

/// Durable home of the session credentials.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn load(&self) -> Result<AuthState, StoreError>;
    async fn save(&self, state: &AuthState) -> Result<(), StoreError>;
}

#[derive(Debug, Serialize, Deserialize)]
struct KeyFile {
    name: String,
    data: String,
}

/// One `creds.json` plus one `key-<name>.json` per keying-material entry.
#[derive(Debug)]
pub struct FileCredentialStore {
    folder: PathBuf,
    // Keys as last written, so a save only touches entries that changed.
    on_disk: Mutex<KeyStore>,
}

impl FileCredentialStore {
    pub fn new(folder: impl Into<PathBuf>) -> Self {
        Self {
            folder: folder.into(),
            on_disk: Mutex::new(KeyStore::default()),
        }
    }

    pub fn folder(&self) -> &Path {
        &self.folder
    }

    /// Drops every stored credential; the next run starts a fresh pairing.
    pub async fn clear(&self) -> Result<(), StoreError> {
        match tokio::fs::remove_dir_all(&self.folder).await {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(source) => {
                return Err(StoreError::Write {
                    path: self.folder.clone(),
                    source,
                })
            }
        }
        *self.on_disk.lock().unwrap() = KeyStore::default();
        Ok(())
    }

    fn key_path(&self, name: &str) -> PathBuf {
        self.folder
            .join(format!("{KEY_FILE_PREFIX}{}{FILE_SUFFIX}", escape_key_name(name)))
    }

    async fn read_creds(&self) -> Result<Creds, StoreError> {
        let path = self.folder.join(CREDS_FILE);
        let raw = match tokio::fs::read_to_string(&path).await {
            Ok(raw) => raw,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Creds::new()),
            Err(source) => return Err(StoreError::Unavailable { path, source }),
        };
        serde_json::from_str(&raw).map_err(|err| StoreError::Corrupt {
            path,
            source: Box::new(err),
        })
    }

    async fn read_keys(&self) -> Result<KeyStore, StoreError> {
        let unavailable = |source| StoreError::Unavailable {
            path: self.folder.clone(),
            source,
        };
        let mut keys = KeyStore::default();
        let mut dir = tokio::fs::read_dir(&self.folder).await.map_err(unavailable)?;
        while let Some(entry) = dir.next_entry().await.map_err(unavailable)? {
            let file_name = entry.file_name().to_string_lossy().to_string();
            if !file_name.starts_with(KEY_FILE_PREFIX) || !file_name.ends_with(FILE_SUFFIX) {
                continue;
            }
            let path = entry.path();
            let raw = tokio::fs::read_to_string(&path)
                .await
                .map_err(|source| StoreError::Unavailable {
                    path: path.clone(),
                    source,
                })?;
            let file: KeyFile = serde_json::from_str(&raw).map_err(|err| StoreError::Corrupt {
                path: path.clone(),
                source: Box::new(err),
            })?;
            let data = general_purpose::STANDARD
                .decode(&file.data)
                .map_err(|err| StoreError::Corrupt {
                    path,
                    source: Box::new(err),
                })?;
            keys.set(file.name, data);
        }
        Ok(keys)
    }
}

#[async_trait]
impl CredentialStore for FileCredentialStore {
    async fn load(&self) -> Result<AuthState, StoreError> {
        match tokio::fs::metadata(&self.folder).await {
            Ok(meta) if meta.is_dir() => {}
            Ok(_) => {
                return Err(StoreError::Unavailable {
                    path: self.folder.clone(),
                    source: io::Error::new(io::ErrorKind::Other, "auth path is not a directory"),
                })
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                tracing::info!(folder = %self.folder.display(), "no stored credentials, starting fresh");
                *self.on_disk.lock().unwrap() = KeyStore::default();
                return Ok(AuthState::default());
            }
            Err(source) => {
                return Err(StoreError::Unavailable {
                    path: self.folder.clone(),
                    source,
                })
            }
        }

        let creds = self.read_creds().await?;
        let keys = self.read_keys().await?;
        tracing::debug!(
            folder = %self.folder.display(),
            keys = keys.len(),
            "loaded stored credentials"
        );
        *self.on_disk.lock().unwrap() = keys.clone();
        Ok(AuthState { creds, keys })
    }

    async fn save(&self, state: &AuthState) -> Result<(), StoreError> {
        tokio::fs::create_dir_all(&self.folder)
            .await
            .map_err(|source| StoreError::Write {
                path: self.folder.clone(),
                source,
            })?;

        let creds = serde_json::to_vec_pretty(&state.creds).map_err(|err| StoreError::Corrupt {
            path: self.folder.join(CREDS_FILE),
            source: Box::new(err),
        })?;
        write_atomic(&self.folder.join(CREDS_FILE), &creds).await?;

        let previous = self.on_disk.lock().unwrap().clone();
        for (name, data) in state.keys.iter() {
            if previous.get(name) == Some(data) {
                continue;
            }
            let file = KeyFile {
                name: name.to_string(),
                data: general_purpose::STANDARD.encode(data),
            };
            let path = self.key_path(name);
            let body = serde_json::to_vec(&file).map_err(|err| StoreError::Corrupt {
                path: path.clone(),
                source: Box::new(err),
            })?;
            write_atomic(&path, &body).await?;
        }
        for (name, _) in previous.iter() {
            if state.keys.get(name).is_some() {
                continue;
            }
            let path = self.key_path(name);
            match tokio::fs::remove_file(&path).await {
                Ok(()) => {}
                Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                Err(source) => return Err(StoreError::Write { path, source }),
            }
        }

        *self.on_disk.lock().unwrap() = state.keys.clone();
        Ok(())
    }
}

/// Percent-escapes every byte outside `[A-Za-z0-9._-]`, so distinct key
/// names never share a file.
fn escape_key_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for byte in name.bytes() {
        if byte.is_ascii_alphanumeric() || matches!(byte, b'.' | b'_' | b'-') {
            out.push(byte as char);
        } else {
            out.push_str(&format!("%{byte:02X}"));
        }
    }
    out
}

async fn write_atomic(path: &Path, data: &[u8]) -> Result<(), StoreError> {
    let tmp = path.with_extension("json.tmp");
    let write_err = |source| StoreError::Write {
        path: path.to_path_buf(),
        source,
    };
    tokio::fs::write(&tmp, data).await.map_err(write_err)?;
    tokio::fs::rename(&tmp, path).await.map_err(write_err)
}

#[derive(Debug, Default)]
struct Latest {
    generation: u64,
    state: Option<AuthState>,
}

/// Serializes saves: at most one `save` runs at a time, and a caller that
/// queued behind it writes the newest state seen so far (last write wins).
pub struct CredsWriter<S: ?Sized> {
    store: Arc<S>,
    latest: Mutex<Latest>,
    // Generation of the last state that reached the store.
    flushed: tokio::sync::Mutex<u64>,
}

impl<S: CredentialStore + ?Sized> CredsWriter<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self {
            store,
            latest: Mutex::new(Latest::default()),
            flushed: tokio::sync::Mutex::new(0),
        }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub async fn persist(&self, state: AuthState) -> Result<(), StoreError> {
        let generation = {
            let mut latest = self.latest.lock().unwrap();
            latest.generation += 1;
            latest.state = Some(state);
            latest.generation
        };

        let mut flushed = self.flushed.lock().await;
        if *flushed >= generation {
            tracing::trace!(generation, "credential save already covered by a newer write");
            return Ok(());
        }

        let (target, snapshot) = {
            let latest = self.latest.lock().unwrap();
            match latest.state.clone() {
                Some(state) => (latest.generation, state),
                None => return Ok(()),
            }
        };
        self.store.save(&snapshot).await?;
        *flushed = target;
        tracing::debug!(generation = target, "credentials saved");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn file_store_round_trips_creds_and_keys() {
        let dir = tempfile::tempdir().unwrap();
        let folder = dir.path().join("auth");
        let store = FileCredentialStore::new(&folder);

        let fresh = store.load().await.unwrap();
        assert_eq!(fresh, AuthState::default());

        let mut state = AuthState::default();
        state.creds.insert("registered".into(), json!(true));
        state.keys.set("pre-key-1", vec![1, 2, 3]);
        state.keys.set("session-123:4", vec![0xff]);
        store.save(&state).await.unwrap();

        let reloaded = FileCredentialStore::new(&folder).load().await.unwrap();
        assert_eq!(reloaded, state);
        assert!(folder.join("key-session-123%3A4.json").exists());
    }

    #[tokio::test]
    async fn similar_key_names_keep_separate_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCredentialStore::new(dir.path());

        let mut state = AuthState::default();
        for (name, byte) in [("a/b", 1u8), ("a__b", 2), ("x:y", 3), ("x-y", 4)] {
            state.keys.set(name, vec![byte]);
        }
        store.save(&state).await.unwrap();
        let reloaded = FileCredentialStore::new(dir.path()).load().await.unwrap();
        assert_eq!(reloaded.keys.len(), 4);

        state.keys.remove("a/b");
        state.keys.remove("x:y");
        store.save(&state).await.unwrap();

        let reloaded = FileCredentialStore::new(dir.path()).load().await.unwrap();
        assert_eq!(reloaded, state);
        assert_eq!(reloaded.keys.get("a__b"), Some(&[2u8][..]));
        assert_eq!(reloaded.keys.get("x-y"), Some(&[4u8][..]));
    }

    #[tokio::test]
    async fn file_store_removes_deleted_keys() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCredentialStore::new(dir.path());

        let mut state = AuthState::default();
        state.keys.set("pre-key-1", vec![1]);
        state.keys.set("pre-key-2", vec![2]);
        store.save(&state).await.unwrap();

        state.keys.remove("pre-key-1");
        store.save(&state).await.unwrap();

        assert!(!dir.path().join("key-pre-key-1.json").exists());
        let reloaded = FileCredentialStore::new(dir.path()).load().await.unwrap();
        assert_eq!(reloaded.keys.len(), 1);
        assert_eq!(reloaded.keys.get("pre-key-2"), Some(&[2u8][..]));
    }

    #[tokio::test]
    async fn file_store_reports_corrupt_creds() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(CREDS_FILE), "{not json").unwrap();
        let err = FileCredentialStore::new(dir.path()).load().await.unwrap_err();
        assert!(matches!(err, StoreError::Corrupt { .. }));
    }

    #[tokio::test]
    async fn file_store_rejects_non_directory_path() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("plain");
        std::fs::write(&file, "x").unwrap();
        let err = FileCredentialStore::new(&file).load().await.unwrap_err();
        assert!(matches!(err, StoreError::Unavailable { .. }));
    }

    #[derive(Default)]
    struct SlowStore {
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
        saved: Mutex<Vec<AuthState>>,
    }

    #[async_trait]
    impl CredentialStore for SlowStore {
        async fn load(&self) -> Result<AuthState, StoreError> {
            Ok(AuthState::default())
        }

        async fn save(&self, state: &AuthState) -> Result<(), StoreError> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(30)).await;
            self.saved.lock().unwrap().push(state.clone());
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn state_with(n: u64) -> AuthState {
        let mut state = AuthState::default();
        state.creds.insert("n".into(), json!(n));
        state
    }

    #[tokio::test]
    async fn writer_never_overlaps_saves_and_keeps_latest() {
        let store = Arc::new(SlowStore::default());
        let writer = CredsWriter::new(store.clone());

        let (a, b, c) = tokio::join!(
            writer.persist(state_with(1)),
            writer.persist(state_with(2)),
            writer.persist(state_with(3)),
        );
        a.unwrap();
        b.unwrap();
        c.unwrap();

        assert_eq!(store.max_in_flight.load(Ordering::SeqCst), 1);
        let saved = store.saved.lock().unwrap();
        assert_eq!(saved.first(), Some(&state_with(1)));
        assert_eq!(saved.last(), Some(&state_with(3)));
        assert!(saved.len() <= 3);
    }

    #[tokio::test]
    async fn writer_saves_every_sequential_mutation() {
        let store = Arc::new(SlowStore::default());
        let writer = CredsWriter::new(store.clone());
        writer.persist(state_with(1)).await.unwrap();
        writer.persist(state_with(2)).await.unwrap();
        assert_eq!(
            *store.saved.lock().unwrap(),
            vec![state_with(1), state_with(2)]
        );
    }
}
