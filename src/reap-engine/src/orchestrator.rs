//! Composes the engine's components into the request surface (§6) a control plane binds
//! to a transport. Owns no global state: one `Orchestrator` is constructed per daemon
//! process and handed to whatever exposes it (HTTP, in `reapd`; direct calls, in tests).

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use crate::characterizer;
use crate::error::EngineError;
use crate::registry::SnapshotRegistry;
use crate::residency::Trigger;
use crate::snapshot::{MincoreSummary, Snapshot};
use crate::uffd::Instance;
use crate::working_set::BuildConfig;

/// Fields accepted by the `register` request (§6).
#[derive(Debug, Clone)]
pub struct RegisterRequest {
    pub id: Option<String>,
    pub vmm_state_path: PathBuf,
    pub guest_mem_path: PathBuf,
    pub base_dir: PathBuf,
    pub mem_size: u64,
    pub block_size: u64,
    pub ws_file_direct_io: bool,
    pub ws_single_read: bool,
}

/// A background residency-sampling scan started by `scanMincore` and stopped later by
/// `stopMincoreScan` (or implicitly, by the Orchestrator, once the caller's own restore
/// request completes — §4.7's "stop channel fires after the user's request completes").
struct ScanHandle {
    stop: Arc<AtomicBool>,
    join: JoinHandle<Result<(), EngineError>>,
}

/// Owns the two top-level indices (snapshots by id, instances by id) and composes
/// external requests into ordered calls across the engine (§4.7).
#[derive(Default)]
pub struct Orchestrator {
    pub registry: SnapshotRegistry,
    instances: Mutex<HashMap<String, Arc<Instance>>>,
    scans: Mutex<HashMap<String, ScanHandle>>,
}

impl Orchestrator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, req: RegisterRequest) -> Result<String, EngineError> {
        let snapshot = self.registry.register(
            req.id,
            req.vmm_state_path,
            req.guest_mem_path,
            req.base_dir,
            req.mem_size,
            req.block_size,
            req.ws_single_read,
            req.ws_file_direct_io,
        )?;
        Ok(snapshot.id.clone())
    }

    pub fn clone_snapshot(
        &self,
        src_id: &str,
        new_mem_path: PathBuf,
    ) -> Result<String, EngineError> {
        let src = self.registry.get(src_id)?;
        let cloned = self
            .registry
            .clone(src_id, new_mem_path, src.ws_single_read)?;
        Ok(cloned.id.clone())
    }

    pub fn deregister(&self, id: &str) -> Result<(), EngineError> {
        {
            let instances = self.instances.lock().unwrap();
            if let Some(instance) = instances.get(id) {
                if instance.state() != crate::uffd::State::Deactivated
                    && instance.state() != crate::uffd::State::Registered
                {
                    return Err(EngineError::InvalidState(format!(
                        "instance {id} is still active; deactivate before deregistering"
                    )));
                }
            }
        }
        self.instances.lock().unwrap().remove(id);
        self.registry.remove(id)?;
        Ok(())
    }

    /// Activate instance `{id}` (§6): creates (or reuses) the instance for this
    /// snapshot's id and runs the UFFD setup sequence, blocking until ready.
    pub fn activate(&self, id: &str) -> Result<(), EngineError> {
        let snapshot = self.registry.get(id)?;
        let base_dir = snapshot.base_dir.clone();
        let instance = {
            let mut instances = self.instances.lock().unwrap();
            Arc::clone(
                instances
                    .entry(id.to_string())
                    .or_insert_with(|| Arc::new(Instance::new(id.to_string(), snapshot, base_dir))),
            )
        };
        instance.activate()?;
        Ok(())
    }

    /// Deactivate instance `{id}` (§6): stops the fault loop, promotes its trace into the
    /// snapshot's canonical record, and returns the recorded offsets alongside this
    /// activation's fault metrics and wall-clock duration (§10.4).
    pub fn deactivate(
        &self,
        id: &str,
    ) -> Result<(Vec<u64>, crate::uffd::FaultMetrics, std::time::Duration), EngineError> {
        let instance = self.instance(id)?;
        Ok(instance.deactivate()?)
    }

    fn instance(&self, id: &str) -> Result<Arc<Instance>, EngineError> {
        self.instances
            .lock()
            .unwrap()
            .get(id)
            .cloned()
            .ok_or_else(|| EngineError::NotFound(id.to_string()))
    }

    /// `scanMincore{interval | sizeIncr}` (§6): starts a background residency-sampling
    /// scan against `pid`'s view of the memory file, running until `stop_scan` is called
    /// (or the process exits). Exactly one scan may be in flight per snapshot.
    pub fn start_scan_mincore(
        &self,
        id: &str,
        pid_for_rss: Option<u32>,
        interval_ms: Option<u64>,
        size_incr_bytes: Option<u64>,
    ) -> Result<(), EngineError> {
        let snapshot = self.registry.get(id)?;
        let trigger = match (interval_ms, size_incr_bytes, pid_for_rss) {
            (Some(ms), None, _) => Trigger::Interval(std::time::Duration::from_millis(ms)),
            (None, Some(bytes), Some(pid)) => Trigger::RssGrowth {
                pid,
                bytes_per_layer: bytes,
            },
            (None, Some(_), None) => {
                return Err(EngineError::InvalidArgument(
                    "sizeIncr sampling requires a target pid".into(),
                ))
            }
            (Some(_), Some(_), _) => {
                return Err(EngineError::InvalidArgument(
                    "interval and sizeIncr are mutually exclusive".into(),
                ))
            }
            (None, None, _) => {
                return Err(EngineError::InvalidArgument(
                    "scanMincore requires interval or sizeIncr".into(),
                ))
            }
        };

        let mut scans = self.scans.lock().unwrap();
        if scans.contains_key(id) {
            return Err(EngineError::ResourceConflict(format!(
                "a mincore scan is already running for {id}"
            )));
        }
        let stop = Arc::new(AtomicBool::new(false));
        let stop_clone = Arc::clone(&stop);
        let start_layer = snapshot.current_layer();
        let join = std::thread::spawn(move || -> Result<(), EngineError> {
            let (layer, final_layer) = crate::snapshot::scan_residency_for(
                &snapshot.mem_path,
                snapshot.size,
                start_layer,
                trigger,
                &stop_clone,
            )?;
            snapshot.apply_sampled_layer(layer, final_layer)?;
            Ok(())
        });
        scans.insert(id.to_string(), ScanHandle { stop, join });
        Ok(())
    }

    /// Stops a running `scanMincore` scan and joins it, applying its result to the
    /// snapshot's `layer[]`. A no-op (not an error) if no scan is in flight, matching the
    /// "stop channel fires after the user's request completes" wording in §4.7 for the
    /// common case where the caller stops unconditionally at the end of a request.
    pub fn stop_scan_mincore(&self, id: &str) -> Result<(), EngineError> {
        let handle = self.scans.lock().unwrap().remove(id);
        if let Some(handle) = handle {
            handle.stop.store(true, Ordering::SeqCst);
            handle
                .join
                .join()
                .map_err(|_| EngineError::InvalidState("scan thread panicked".into()))??;
        }
        Ok(())
    }

    pub fn emulate_mincore(&self, id: &str, layer_size: Option<u32>) -> Result<(), EngineError> {
        let snapshot = self.registry.get(id)?;
        snapshot.emulate_mincore(layer_size)?;
        Ok(())
    }

    pub fn insert_mincore_layer(
        &self,
        id: &str,
        from_diff_id: &str,
        position: u32,
    ) -> Result<(), EngineError> {
        let dst = self.registry.get(id)?;
        let other = self.registry.get(from_diff_id)?;
        let mask = characterizer::diff_mask(
            &std::fs::read(&dst.mem_path).map_err(crate::error::SnapshotError::Io)?,
            &std::fs::read(&other.mem_path).map_err(crate::error::SnapshotError::Io)?,
            dst.page_size as usize,
        );
        dst.insert_mincore_layer(&mask, position)?;
        Ok(())
    }

    pub fn copy_mincore(&self, id: &str, src_id: &str) -> Result<(), EngineError> {
        let dst = self.registry.get(id)?;
        let src = self.registry.get(src_id)?;
        dst.copy_mincore_from(&src)?;
        Ok(())
    }

    pub fn mincore_summary(&self, id: &str) -> Result<MincoreSummary, EngineError> {
        let snapshot = self.registry.get(id)?;
        Ok(snapshot.mincore_summary()?)
    }

    pub fn record_regions(
        &self,
        id: &str,
        size_threshold: usize,
        interval_threshold: usize,
    ) -> Result<(), EngineError> {
        let snapshot = self.registry.get(id)?;
        snapshot.record_regions(size_threshold, interval_threshold)?;
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    pub fn create_ws_file(
        &self,
        id: &str,
        target_path: PathBuf,
        with_inactive: bool,
        with_zero: bool,
        size_threshold: usize,
        interval_threshold: usize,
    ) -> Result<(), EngineError> {
        let snapshot = self.registry.get(id)?;
        snapshot.create_ws_file(
            target_path,
            BuildConfig {
                with_inactive,
                with_zero,
                size_threshold,
                interval_threshold,
            },
        )?;
        Ok(())
    }

    pub fn pre_warm_mincore(&self, id: &str, layers: &[u32]) -> Result<(), EngineError> {
        let snapshot = self.registry.get(id)?;
        snapshot.pre_warm_layers(layers)?;
        Ok(())
    }

    /// No-op passthrough; see SPEC_FULL.md §9's open question on `trimMincoreRegions`.
    pub fn trim_mincore_regions(&self, id: &str) -> Result<(), EngineError> {
        let snapshot = self.registry.get(id)?;
        snapshot.trim_mincore_regions()?;
        Ok(())
    }

    pub fn update_cache_state(
        &self,
        id: &str,
        dig_hole: bool,
        load_cache: bool,
        drop_cache: bool,
    ) -> Result<(), EngineError> {
        let snapshot = self.registry.get(id)?;
        snapshot.update_cache_state(dig_hole, load_cache, drop_cache)?;
        if load_cache {
            // `updateCacheState{loadCache}` also implies warming any built ws file, the
            // way a restore would need both warmed before the VMM connects.
            if snapshot.ws_path().is_some() {
                snapshot.load_ws_file()?;
            }
        }
        Ok(())
    }

    pub fn drop_ws_cache(&self, id: &str) -> Result<(), EngineError> {
        let snapshot = self.registry.get(id)?;
        snapshot.drop_ws_cache()?;
        Ok(())
    }

    /// `{id}` clear-reap-cache (§6): drops both the ws file's cache and the memory
    /// image's cache, the full teardown of everything a restore would have warmed.
    pub fn clear_reap_cache(&self, id: &str) -> Result<(), EngineError> {
        let snapshot = self.registry.get(id)?;
        snapshot.drop_ws_cache()?;
        snapshot.update_cache_state(false, false, true)?;
        Ok(())
    }
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("snapshots", &self.registry.len())
            .field("instances", &self.instances.lock().unwrap().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use vmm_sys_util::tempfile::TempFile;

    fn register_test_snapshot(orch: &Orchestrator, pages: usize) -> (TempFile, String) {
        let ps = reap_utils::page_size();
        let mem = TempFile::new().unwrap();
        {
            let mut f = mem.as_file();
            for i in 0..pages {
                f.write_all(&vec![(i + 1) as u8; ps]).unwrap();
            }
        }
        let vmm_state = TempFile::new().unwrap();
        let id = orch
            .register(RegisterRequest {
                id: None,
                vmm_state_path: vmm_state.as_path().to_path_buf(),
                guest_mem_path: mem.as_path().to_path_buf(),
                base_dir: std::env::temp_dir(),
                mem_size: (pages * ps) as u64,
                block_size: 4096,
                ws_file_direct_io: false,
                ws_single_read: false,
            })
            .unwrap();
        (mem, id)
    }

    #[test]
    fn test_register_then_get_summary() {
        let orch = Orchestrator::new();
        let (_mem, id) = register_test_snapshot(&orch, 4);
        orch.record_regions(&id, 1, 1).unwrap();
        let summary = orch.mincore_summary(&id).unwrap();
        assert_eq!(summary.n_nz_regions, 1);
    }

    #[test]
    fn test_clone_then_independent_cache_ops() {
        let orch = Orchestrator::new();
        let (_mem, id) = register_test_snapshot(&orch, 2);
        orch.record_regions(&id, 1, 1).unwrap();

        let mut new_mem_path = std::env::temp_dir();
        new_mem_path.push(format!("reap-orch-clone-{}", std::process::id()));
        let clone_id = orch.clone_snapshot(&id, new_mem_path.clone()).unwrap();
        assert_ne!(clone_id, id);

        orch.clear_reap_cache(&id).unwrap();
        assert!(orch.registry.get(&clone_id).is_ok());
        std::fs::remove_file(&new_mem_path).ok();
    }

    #[test]
    fn test_deactivate_before_activate_fails() {
        let orch = Orchestrator::new();
        let (_mem, id) = register_test_snapshot(&orch, 1);
        let err = orch.deactivate(&id).unwrap_err();
        assert!(matches!(err, EngineError::NotFound(_)));
    }

    #[test]
    fn test_deregister_unknown_id_fails() {
        let orch = Orchestrator::new();
        let err = orch.deregister("nonexistent").unwrap_err();
        assert!(matches!(err, EngineError::Snapshot(_)));
    }

    #[test]
    fn test_emulate_then_create_ws_file_end_to_end() {
        let orch = Orchestrator::new();
        let (_mem, id) = register_test_snapshot(&orch, 4);
        let snapshot = orch.registry.get(&id).unwrap();
        snapshot.set_records(vec![0, 4096, 8192, 12288]);
        orch.emulate_mincore(&id, Some(2)).unwrap();
        orch.record_regions(&id, 1, 1).unwrap();

        let ws_target = {
            let mut p = std::env::temp_dir();
            p.push(format!("reap-orch-ws-{}", std::process::id()));
            p
        };
        orch.create_ws_file(&id, ws_target.clone(), false, false, 1, 1)
            .unwrap();
        let summary = orch.mincore_summary(&id).unwrap();
        assert!(summary.n_ws_regions > 0);
        std::fs::remove_file(&ws_target).ok();
    }
}
