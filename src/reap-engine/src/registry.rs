//! Owns all registered [`Snapshot`]s by id. Insertion/removal is guarded by a single
//! registry mutex; mutations to an individual snapshot's state go through its own mutex
//! (§5) and never hold the registry lock while doing so.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use reap_utils::ids::{clone_suffix, new_snapshot_id};

use crate::error::SnapshotError;
use crate::snapshot::Snapshot;

#[derive(Default)]
pub struct SnapshotRegistry {
    snapshots: Mutex<HashMap<String, Arc<Snapshot>>>,
}

impl SnapshotRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a brand-new snapshot under `id` (the host's request surface already
    /// picked an id, or leaves it to us if empty).
    #[allow(clippy::too_many_arguments)]
    pub fn register(
        &self,
        id: Option<String>,
        vmm_state_path: PathBuf,
        mem_path: PathBuf,
        base_dir: PathBuf,
        mem_size: u64,
        block_size: u64,
        ws_single_read: bool,
        ws_file_direct_io: bool,
    ) -> Result<Arc<Snapshot>, SnapshotError> {
        let id = id.unwrap_or_else(new_snapshot_id);
        let snapshot = Arc::new(Snapshot::register_with_options(
            id.clone(),
            vmm_state_path,
            mem_path,
            base_dir,
            mem_size,
            block_size,
            ws_single_read,
            ws_file_direct_io,
        )?);
        let mut snapshots = self.snapshots.lock().unwrap();
        if snapshots.contains_key(&id) {
            return Err(SnapshotError::AlreadyExists(id));
        }
        snapshots.insert(id, Arc::clone(&snapshot));
        Ok(snapshot)
    }

    pub fn get(&self, id: &str) -> Result<Arc<Snapshot>, SnapshotError> {
        self.snapshots
            .lock()
            .unwrap()
            .get(id)
            .cloned()
            .ok_or_else(|| SnapshotError::NotFound(id.to_string()))
    }

    pub fn remove(&self, id: &str) -> Result<Arc<Snapshot>, SnapshotError> {
        self.snapshots
            .lock()
            .unwrap()
            .remove(id)
            .ok_or_else(|| SnapshotError::NotFound(id.to_string()))
    }

    /// Clones `src_id` into a freshly registered snapshot, copying the memory file (and
    /// the ws file, if any) to `new_mem_path`'s directory. `share_ws_single_read` mirrors
    /// the request surface's `wsSingleRead` flag: when set, the clone shares the
    /// parent's one-shot ws-load primitive instead of getting an independent one.
    pub fn clone(
        &self,
        src_id: &str,
        new_mem_path: PathBuf,
        share_ws_single_read: bool,
    ) -> Result<Arc<Snapshot>, SnapshotError> {
        let src = self.get(src_id)?;
        let new_id = format!("{}{}", src_id, clone_suffix());
        let cloned = src.clone_snapshot(new_id.clone(), new_mem_path, share_ws_single_read)?;

        let mut snapshots = self.snapshots.lock().unwrap();
        if snapshots.contains_key(&new_id) {
            return Err(SnapshotError::AlreadyExists(new_id));
        }
        let cloned = Arc::new(cloned);
        snapshots.insert(new_id, Arc::clone(&cloned));
        Ok(cloned)
    }

    pub fn len(&self) -> usize {
        self.snapshots.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use vmm_sys_util::tempfile::TempFile;

    #[test]
    fn test_register_and_get() {
        let registry = SnapshotRegistry::new();
        let mem = TempFile::new().unwrap();
        mem.as_file().write_all(&[0u8; 4096]).unwrap();
        let vmm_state = TempFile::new().unwrap();

        let snap = registry
            .register(
                Some("ss_abc12345".to_string()),
                vmm_state.as_path().to_path_buf(),
                mem.as_path().to_path_buf(),
                std::env::temp_dir(),
                4096,
                4096,
                false,
                false,
            )
            .unwrap();
        assert_eq!(snap.id, "ss_abc12345");
        assert!(registry.get("ss_abc12345").is_ok());
        assert!(registry.get("nonexistent").is_err());
    }

    #[test]
    fn test_register_duplicate_id_fails() {
        let registry = SnapshotRegistry::new();
        let mem = TempFile::new().unwrap();
        mem.as_file().write_all(&[0u8; 4096]).unwrap();
        let vmm_state = TempFile::new().unwrap();

        registry
            .register(
                Some("dup".to_string()),
                vmm_state.as_path().to_path_buf(),
                mem.as_path().to_path_buf(),
                std::env::temp_dir(),
                4096,
                4096,
                false,
                false,
            )
            .unwrap();
        let err = registry
            .register(
                Some("dup".to_string()),
                vmm_state.as_path().to_path_buf(),
                mem.as_path().to_path_buf(),
                std::env::temp_dir(),
                4096,
                4096,
                false,
                false,
            )
            .unwrap_err();
        assert!(matches!(err, SnapshotError::AlreadyExists(_)));
    }

    #[test]
    fn test_clone_creates_independent_record() {
        let registry = SnapshotRegistry::new();
        let mem = TempFile::new().unwrap();
        mem.as_file().write_all(&[1u8; 4096]).unwrap();
        let vmm_state = TempFile::new().unwrap();

        registry
            .register(
                Some("ss_orig0001".to_string()),
                vmm_state.as_path().to_path_buf(),
                mem.as_path().to_path_buf(),
                std::env::temp_dir(),
                4096,
                4096,
                false,
                false,
            )
            .unwrap();

        let mut new_mem_path = std::env::temp_dir();
        new_mem_path.push(format!("reap-registry-clone-{}", std::process::id()));
        let cloned = registry
            .clone("ss_orig0001", new_mem_path.clone(), false)
            .unwrap();
        assert!(cloned.id.starts_with("ss_orig0001-"));
        assert_eq!(registry.len(), 2);
        std::fs::remove_file(&new_mem_path).ok();
    }
}
