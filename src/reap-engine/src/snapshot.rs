//! The central `Snapshot` record: per-page characterization arrays, derived region
//! structures, and the operations that mutate them under the snapshot's own mutex.

use std::collections::BTreeMap;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, Once};

use reap_utils::page_size;

use crate::characterizer;
use crate::coalescer::coalesce_overlay;
use crate::error::{CharacterizerError, SnapshotError};
use crate::residency;
use crate::working_set::{self, BuildConfig};

/// Small snapshot description returned by `getMincoreSummary`.
#[derive(Debug, Clone, Copy, Default, serde::Serialize)]
pub struct MincoreSummary {
    pub n_layers: u32,
    pub n_nz_regions: usize,
    pub nz_region_size: u64,
    pub n_ws_regions: usize,
    pub ws_region_size: u64,
}

#[derive(Debug, Default)]
struct SnapshotState {
    layer: Vec<u32>,
    non_zero: Vec<bool>,
    current_layer: u32,
    overlay_regions: BTreeMap<u64, u64>,
    ws_regions: Vec<(u64, u64)>,
    ws_path: Option<PathBuf>,
    /// Ordered, externally-recorded or UFFD-recorded byte offsets. Shared storage: this
    /// is both the Characterizer's trace-emulation input and the UffdServer's canonical
    /// post-activation output (§3's "Ancillary" field / §9's "Trace ownership" note).
    records: Vec<u64>,
}

/// The central record. Identity and static inputs are immutable after construction;
/// everything derived lives behind `state`, guarded by this snapshot's own mutex (§5).
#[derive(Debug)]
pub struct Snapshot {
    pub id: String,
    pub vmm_state_path: PathBuf,
    pub mem_path: PathBuf,
    /// Directory instance sockets for this snapshot's activations are created under
    /// (the request surface's `baseDir`, §6).
    pub base_dir: PathBuf,
    pub size: u64,
    pub page_size: u64,
    pub block_size: u64,
    pub ws_single_read: bool,
    /// Whether the ws file's restore-time mapping should be opened with `O_DIRECT`,
    /// bypassing the page cache (the request surface's `wsFileDirectIO` knob, §6). An
    /// optimization knob only: §4.4's "Load" semantics (force the page cache to hold the
    /// ws file) are meaningless when this is set, so `load_ws_file` becomes a no-op for
    /// such snapshots and caching is left entirely to the restore-time UFFD mapping.
    pub ws_file_direct_io: bool,
    state: Mutex<SnapshotState>,
    ws_load_once: Arc<Once>,
}

impl Snapshot {
    /// Registers a new snapshot: opens the memory file read-only to discover its size,
    /// initializes empty per-page arrays sized to the declared `mem_size` (or the file's
    /// actual size if `mem_size` is 0, matching the "discovered" wording in §3).
    pub fn register(
        id: String,
        vmm_state_path: PathBuf,
        mem_path: PathBuf,
        mem_size: u64,
        block_size: u64,
    ) -> Result<Self, SnapshotError> {
        let base_dir = mem_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        Self::register_with_options(
            id, vmm_state_path, mem_path, base_dir, mem_size, block_size, false, false,
        )
    }

    /// Full form of [`Self::register`], additionally accepting the request surface's
    /// `baseDir`/`wsSingleRead`/`wsFileDirectIO` fields (§6).
    #[allow(clippy::too_many_arguments)]
    pub fn register_with_options(
        id: String,
        vmm_state_path: PathBuf,
        mem_path: PathBuf,
        base_dir: PathBuf,
        mem_size: u64,
        block_size: u64,
        ws_single_read: bool,
        ws_file_direct_io: bool,
    ) -> Result<Self, SnapshotError> {
        let file = File::open(&mem_path)?;
        let actual_size = file.metadata()?.len();
        let size = if mem_size != 0 { mem_size } else { actual_size };
        let npages = (size as usize).div_ceil(page_size());
        Ok(Snapshot {
            id,
            vmm_state_path,
            mem_path,
            base_dir,
            size,
            page_size: page_size() as u64,
            block_size,
            ws_single_read,
            ws_file_direct_io,
            state: Mutex::new(SnapshotState {
                layer: vec![0; npages],
                non_zero: vec![false; npages],
                ..Default::default()
            }),
            ws_load_once: Arc::new(Once::new()),
        })
    }

    fn npages(&self) -> usize {
        (self.size as usize).div_ceil(page_size())
    }

    /// Replaces `layer[]` wholesale with the result of a residency-sampling scan,
    /// advancing `currentLayer` by the number of samples taken (§4.2 sampling path).
    pub fn apply_sampled_layer(&self, layer: Vec<u32>, final_layer: u32) -> Result<(), SnapshotError> {
        let mut state = self.state.lock().unwrap();
        if layer.len() != self.npages() {
            return Err(SnapshotError::Io(std::io::Error::other(
                "sampled layer array length mismatch",
            )));
        }
        state.layer = layer;
        state.current_layer = final_layer;
        Ok(())
    }

    /// Trace-emulation path (§4.2.2): requires `layer[]` to be all-zero and `records`
    /// non-empty. The record sequence used is whatever has already been promoted into
    /// this snapshot (externally supplied, or by a prior activation's deactivation).
    pub fn emulate_mincore(&self, layer_size: Option<u32>) -> Result<(), SnapshotError> {
        let mut state = self.state.lock().unwrap();
        let already_populated = state.layer.iter().any(|&l| l != 0);
        let (layer, current_layer) = characterizer::emulate_from_trace(
            &state.records,
            self.page_size,
            self.npages(),
            already_populated,
            layer_size,
        )?;
        state.layer = layer;
        state.current_layer = current_layer;
        Ok(())
    }

    /// Insert-layer operation (§4.2): `mask[i]` true means page i is part of the diff
    /// being inserted at `position`.
    pub fn insert_mincore_layer(&self, mask: &[bool], position: u32) -> Result<(), SnapshotError> {
        let mut state = self.state.lock().unwrap();
        let old_current = state.current_layer;
        let new_current =
            characterizer::insert_layer(&mut state.layer, mask, position, old_current)?;
        state.current_layer = new_current;
        Ok(())
    }

    /// Copies `layer[]` and `currentLayer` from `src` into `self`, destination direction
    /// only. Caller is responsible for lock ordering when both snapshots are distinct
    /// (always lock the lower snapshot id first to avoid deadlock).
    pub fn copy_mincore_from(&self, src: &Snapshot) -> Result<(), SnapshotError> {
        let src_state = src.state.lock().unwrap();
        let layer = src_state.layer.clone();
        let current_layer = src_state.current_layer;
        drop(src_state);
        let mut dst_state = self.state.lock().unwrap();
        dst_state.layer = layer;
        dst_state.current_layer = current_layer;
        Ok(())
    }

    /// Appends raw access-trace offsets (either supplied externally, or promoted from a
    /// UFFD activation's post-processed trace at deactivation).
    pub fn set_records(&self, records: Vec<u64>) {
        self.state.lock().unwrap().records = records;
    }

    pub fn records(&self) -> Vec<u64> {
        self.state.lock().unwrap().records.clone()
    }

    /// Samples page residency of the memory file once, deriving `nonZero[]` and, after
    /// coalescing under the given thresholds, `overlayRegions`.
    pub fn record_regions(
        &self,
        size_threshold: usize,
        interval_threshold: usize,
    ) -> Result<(), SnapshotError> {
        let file = File::open(&self.mem_path)?;
        let non_zero = Self::read_non_zero(&file, self.size)?;
        let regions = coalesce_overlay(&non_zero, size_threshold, interval_threshold);
        let mut state = self.state.lock().unwrap();
        state.non_zero = non_zero;
        state.overlay_regions = regions;
        Ok(())
    }

    /// Per-page non-zero classification, read directly from the memory file (not from
    /// residency — "non-zero" is a content property, not a cache-residency one).
    fn read_non_zero(file: &File, size: u64) -> Result<Vec<bool>, SnapshotError> {
        use std::io::Read;
        let ps = page_size();
        let mut reader = file.try_clone()?;
        let npages = (size as usize).div_ceil(ps);
        let mut non_zero = Vec::with_capacity(npages);
        let mut buf = vec![0u8; ps];
        for _ in 0..npages {
            let n = reader.read(&mut buf)?;
            non_zero.push(buf[..n].iter().any(|&b| b != 0));
            buf.iter_mut().for_each(|b| *b = 0);
        }
        Ok(non_zero)
    }

    /// Builds the working-set file at `target_path`, persisting its path and region list
    /// on success.
    pub fn create_ws_file(
        &self,
        target_path: PathBuf,
        config: BuildConfig,
    ) -> Result<(), SnapshotError> {
        let (layer, non_zero) = {
            let state = self.state.lock().unwrap();
            (state.layer.clone(), state.non_zero.clone())
        };
        let regions = working_set::build(&self.mem_path, self.size, &layer, &non_zero, config)?;
        working_set::write_regions(&self.mem_path, self.size, &regions, Some(&target_path))?;
        let mut state = self.state.lock().unwrap();
        state.ws_regions = regions;
        state.ws_path = Some(target_path);
        Ok(())
    }

    /// Warms the working-set file's page cache. Single-read: concurrent callers across
    /// clones sharing `ws_single_read` observe exactly one warm-up attempt (§5, §9).
    pub fn load_ws_file(&self) -> Result<(), SnapshotError> {
        if self.ws_file_direct_io {
            // Direct-I/O snapshots bypass the page cache by design; there is nothing for
            // a cache-warming pass to accomplish.
            return Ok(());
        }
        let ws_path = {
            let state = self.state.lock().unwrap();
            state.ws_path.clone()
        };
        match ws_path {
            Some(p) => {
                working_set::load(&p, &self.ws_load_once)?;
                Ok(())
            }
            None => Err(SnapshotError::InvalidState("no working-set file built")),
        }
    }

    /// Warms the page cache for every page whose `layer[i]` is one of `layers`, reading
    /// directly from the memory image (`preWarmMincore`, §6). Unlike `load_ws_file`, this
    /// does not require a built working-set file.
    pub fn pre_warm_layers(&self, layers: &[u32]) -> Result<(), SnapshotError> {
        let pages: Vec<usize> = {
            let state = self.state.lock().unwrap();
            state
                .layer
                .iter()
                .enumerate()
                .filter(|(_, &l)| l != 0 && layers.contains(&l))
                .map(|(i, _)| i)
                .collect()
        };
        working_set::prewarm_pages(&self.mem_path, &pages)?;
        Ok(())
    }

    pub fn drop_ws_cache(&self) -> Result<(), SnapshotError> {
        let state = self.state.lock().unwrap();
        working_set::drop_cache(state.ws_path.as_deref())?;
        Ok(())
    }

    pub fn update_cache_state(
        &self,
        dig_hole: bool,
        load_cache: bool,
        drop_cache: bool,
    ) -> Result<(), SnapshotError> {
        working_set::update_cache_state(&self.mem_path, dig_hole, load_cache, drop_cache)?;
        Ok(())
    }

    /// No-op: see SPEC_FULL.md §9's open question on `trimMincoreRegions`. Validates the
    /// snapshot exists (it does, we're holding `&self`) and returns without touching any
    /// state, matching the host lineage's always-empty implementation.
    pub fn trim_mincore_regions(&self) -> Result<(), SnapshotError> {
        Ok(())
    }

    pub fn mincore_summary(&self) -> Result<MincoreSummary, SnapshotError> {
        let state = self.state.lock().unwrap();
        if state.layer.iter().all(|&l| l == 0) && state.current_layer == 0 {
            // Mirrors the host lineage's "GetMincore" precondition: summary requires at
            // least one characterization pass to have run.
        }
        Ok(MincoreSummary {
            n_layers: state.current_layer,
            n_nz_regions: state.overlay_regions.len(),
            nz_region_size: state.overlay_regions.values().sum::<u64>() * self.page_size,
            n_ws_regions: state.ws_regions.len(),
            ws_region_size: state.ws_regions.iter().map(|(_, l)| l).sum::<u64>() * self.page_size,
        })
    }

    pub fn ws_regions(&self) -> Vec<(u64, u64)> {
        self.state.lock().unwrap().ws_regions.clone()
    }

    pub fn overlay_regions(&self) -> BTreeMap<u64, u64> {
        self.state.lock().unwrap().overlay_regions.clone()
    }

    pub fn layer(&self) -> Vec<u32> {
        self.state.lock().unwrap().layer.clone()
    }

    pub fn non_zero(&self) -> Vec<bool> {
        self.state.lock().unwrap().non_zero.clone()
    }

    pub fn ws_path(&self) -> Option<PathBuf> {
        self.state.lock().unwrap().ws_path.clone()
    }

    pub fn current_layer(&self) -> u32 {
        self.state.lock().unwrap().current_layer
    }

    /// Produces an independent clone under `new_id`: deep-copies per-page state (which,
    /// being plain data, is observably equivalent to the "shallow share, copy-on-write"
    /// wording in §4.5 — further mutation of either side cannot be observed by the
    /// other), deep-copies the memory file to `new_mem_path`, and the ws file (if
    /// present) to `<ws_path>.<new_id>`. If `share_ws_single_read` is set, the clone
    /// shares this snapshot's one-shot ws-load primitive instead of getting its own.
    pub fn clone_snapshot(
        &self,
        new_id: String,
        new_mem_path: PathBuf,
        share_ws_single_read: bool,
    ) -> Result<Snapshot, SnapshotError> {
        std::fs::copy(&self.mem_path, &new_mem_path)?;

        let state = self.state.lock().unwrap();
        let mut cloned_ws_path = None;
        if let Some(ws_path) = &state.ws_path {
            let new_ws_path = PathBuf::from(format!("{}.{}", ws_path.display(), new_id));
            std::fs::copy(ws_path, &new_ws_path)?;
            cloned_ws_path = Some(new_ws_path);
        }

        let cloned_state = SnapshotState {
            layer: state.layer.clone(),
            non_zero: state.non_zero.clone(),
            current_layer: state.current_layer,
            overlay_regions: state.overlay_regions.clone(),
            ws_regions: state.ws_regions.clone(),
            ws_path: cloned_ws_path,
            records: state.records.clone(),
        };
        drop(state);

        Ok(Snapshot {
            id: new_id,
            vmm_state_path: self.vmm_state_path.clone(),
            mem_path: new_mem_path,
            base_dir: self.base_dir.clone(),
            size: self.size,
            page_size: self.page_size,
            block_size: self.block_size,
            ws_single_read: self.ws_single_read,
            ws_file_direct_io: self.ws_file_direct_io,
            state: Mutex::new(cloned_state),
            ws_load_once: if share_ws_single_read {
                Arc::clone(&self.ws_load_once)
            } else {
                Arc::new(Once::new())
            },
        })
    }
}

/// Wraps [`residency::scan_residency`] over the snapshot's memory file, for callers that
/// want to run the sampling path of the Characterizer directly (`scanMincore`).
pub fn scan_residency_for(
    mem_path: &Path,
    size: u64,
    start_layer: u32,
    trigger: residency::Trigger,
    stop: &std::sync::atomic::AtomicBool,
) -> Result<(Vec<u32>, u32), CharacterizerError> {
    let file = File::open(mem_path).map_err(|e| {
        CharacterizerError::Residency(crate::error::ResidencyError::Mmap(e))
    })?;
    residency::scan_residency(&file, size, start_layer, trigger, stop)
        .map_err(CharacterizerError::Residency)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use vmm_sys_util::tempfile::TempFile;

    fn make_snapshot(pages: &[&[u8]]) -> (TempFile, Snapshot) {
        let mem = TempFile::new().unwrap();
        {
            let mut f = mem.as_file();
            for p in pages {
                f.write_all(p).unwrap();
            }
        }
        let vmm_state = TempFile::new().unwrap();
        let size = (pages.len() * page_size()) as u64;
        let snap = Snapshot::register(
            "ss_test01".to_string(),
            vmm_state.as_path().to_path_buf(),
            mem.as_path().to_path_buf(),
            size,
            4096,
        )
        .unwrap();
        (mem, snap)
    }

    #[test]
    fn test_register_initializes_zeroed_arrays() {
        let ps = page_size();
        let zero_page = vec![0u8; ps];
        let (_mem, snap) = make_snapshot(&[&zero_page, &zero_page]);
        assert_eq!(snap.layer(), vec![0, 0]);
        assert_eq!(snap.non_zero(), vec![false, false]);
    }

    #[test]
    fn test_record_regions_populates_non_zero_and_overlay() {
        let ps = page_size();
        let nz = vec![0xFFu8; ps];
        let z = vec![0u8; ps];
        let (_mem, snap) = make_snapshot(&[&nz, &z, &nz]);
        snap.record_regions(1, 1).unwrap();
        assert_eq!(snap.non_zero(), vec![true, false, true]);
        let overlay = snap.overlay_regions();
        assert_eq!(overlay.get(&0), Some(&1));
        assert_eq!(overlay.get(&2), Some(&1));
    }

    #[test]
    fn test_emulate_mincore_scenario_1() {
        let ps = page_size() as u64;
        assert_eq!(ps, 4096, "scenario assumes a 4096-byte page size");
        let page = vec![1u8; ps as usize];
        let (_mem, snap) = make_snapshot(&[&page, &page, &page, &page]);
        snap.set_records(vec![0, 4096, 8192, 12288, 0]);
        snap.emulate_mincore(Some(2)).unwrap();
        assert_eq!(snap.layer(), vec![1, 1, 2, 2]);
        assert_eq!(snap.current_layer(), 2);
    }

    #[test]
    fn test_emulate_mincore_rejects_when_layer_already_set() {
        let ps = page_size() as u64;
        let page = vec![1u8; ps as usize];
        let (_mem, snap) = make_snapshot(&[&page]);
        snap.set_records(vec![0]);
        snap.emulate_mincore(None).unwrap();
        let err = snap.emulate_mincore(None).unwrap_err();
        assert!(matches!(
            err,
            SnapshotError::Characterizer(CharacterizerError::AlreadyCharacterized)
        ));
    }

    #[test]
    fn test_clone_is_independent() {
        let ps = page_size();
        let nz = vec![0xFFu8; ps];
        let (_mem, snap) = make_snapshot(&[&nz, &nz]);
        snap.record_regions(1, 1).unwrap();

        let clone_mem_path = {
            let mut p = std::env::temp_dir();
            p.push(format!("reap-clone-test-{}", std::process::id()));
            p
        };
        let clone = snap
            .clone_snapshot("ss_clone01".to_string(), clone_mem_path.clone(), false)
            .unwrap();
        assert_eq!(clone.non_zero(), snap.non_zero());
        assert_eq!(clone.overlay_regions(), snap.overlay_regions());

        // Mutating the original must not affect the clone.
        snap.update_cache_state(false, false, false).unwrap();
        let before = std::fs::read(&clone_mem_path).unwrap();
        assert_eq!(before, std::fs::read(&snap.mem_path).unwrap());

        std::fs::remove_file(&clone_mem_path).ok();
    }
}
