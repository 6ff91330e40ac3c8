use super::check_version;
use async_trait::async_trait;
use flowcore::{FlowFilter, FlowId, FlowState, FlowStore, PageRequest, PagedResult, StoreError};
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;

/// One pretty-printed JSON document per flow under a directory.
///
/// Writes go through a temporary file and a rename, so a crash mid-write
/// leaves the previous version in place. Compare-and-swap is serialized by an
/// in-process lock; the store assumes a single engine process per directory.
pub struct FileFlowStore {
    dir: PathBuf,
    write_lock: Mutex<()>,
}

impl FileFlowStore {
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir).await?;
        tracing::debug!("Opened flow store at {}", dir.display());
        Ok(Self {
            dir,
            write_lock: Mutex::new(()),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, flow_id: FlowId) -> PathBuf {
        self.dir.join(format!("{}.json", flow_id))
    }

    async fn read(path: &Path) -> Result<Option<FlowState>, StoreError> {
        match tokio::fs::read(path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl FlowStore for FileFlowStore {
    async fn save(&self, state: &FlowState) -> Result<u64, StoreError> {
        let _guard = self.write_lock.lock().await;
        let path = self.path_for(state.flow_id);
        let existing = Self::read(&path).await?;
        let version = check_version(state, existing.as_ref())?;

        let mut stored = state.clone();
        stored.version = version;
        let json = serde_json::to_vec_pretty(&stored)?;

        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(version)
    }

    async fn load(&self, flow_id: FlowId) -> Result<FlowState, StoreError> {
        Self::read(&self.path_for(flow_id))
            .await?
            .ok_or(StoreError::NotFound(flow_id))
    }

    async fn query(&self, filter: &FlowFilter, page: PageRequest) -> Result<PagedResult<FlowState>, StoreError> {
        let mut matching = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension() != Some("json".as_ref()) {
                continue;
            }
            match Self::read(&path).await {
                Ok(Some(state)) if filter.matches(&state) => matching.push(state),
                Ok(_) => {}
                Err(e) => tracing::warn!("Skipping unreadable flow document {}: {}", path.display(), e),
            }
        }
        Ok(PagedResult::from_sorted(matching, page, |f| (f.created_at, f.flow_id)))
    }
}
