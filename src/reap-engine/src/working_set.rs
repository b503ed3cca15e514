//! Builds, loads, and drops the packed working-set file: a concatenation of only the
//! pages a snapshot's characterization marked as worth prefetching.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::os::unix::io::AsRawFd;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Once;

use reap_utils::page_size;

use crate::coalescer::coalesce_working_set;
use crate::error::WorkingSetError;

/// Knobs for [`build`], mirroring the request surface's `createWsFile` parameters.
#[derive(Debug, Clone, Copy)]
pub struct BuildConfig {
    pub with_inactive: bool,
    pub with_zero: bool,
    pub size_threshold: usize,
    pub interval_threshold: usize,
}

/// Per-page include predicate from §4.4's truth table.
fn include(with_inactive: bool, with_zero: bool, layer: u32, non_zero: bool) -> bool {
    match (with_inactive, with_zero) {
        (false, false) => layer > 0 && non_zero,
        (false, true) => layer > 0,
        (true, false) => non_zero,
        (true, true) => layer > 0 || non_zero,
    }
}

/// Runs the include predicate over every page and coalesces the result into the
/// `wsRegions` list to be persisted on the snapshot. Callers write the region bytes
/// out separately via [`write_regions`].
pub fn build(
    mem_path: &Path,
    mem_size: u64,
    layer: &[u32],
    non_zero: &[bool],
    config: BuildConfig,
) -> Result<Vec<(u64, u64)>, WorkingSetError> {
    let _ = (mem_path, mem_size);
    let include_mask: Vec<bool> = layer
        .iter()
        .zip(non_zero)
        .map(|(&l, &nz)| include(config.with_inactive, config.with_zero, l, nz))
        .collect();

    let regions = coalesce_working_set(
        &include_mask,
        layer,
        config.size_threshold,
        config.interval_threshold,
    );

    Ok(regions)
}

/// Writes `regions` (in order) as the concatenation of their page bytes, read from
/// `mem_path`, to `target_path`. Shared by [`build`] and by callers rebuilding a ws file
/// from an already-known region list (e.g. after a clone).
pub fn write_regions(
    mem_path: &Path,
    mem_size: u64,
    regions: &[(u64, u64)],
    target_path: Option<&Path>,
) -> Result<(), WorkingSetError> {
    let target_path = match target_path {
        Some(p) => p,
        None => return Ok(()),
    };
    let ps = page_size() as u64;

    if mem_size == 0 || regions.is_empty() {
        File::create(target_path)?;
        return Ok(());
    }

    let mem_file = File::open(mem_path)?;
    // SAFETY: `mem_file` stays open and `mem_size` is its known byte length.
    let addr = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            mem_size as usize,
            libc::PROT_READ,
            libc::MAP_PRIVATE,
            mem_file.as_raw_fd(),
            0,
        )
    };
    if addr == libc::MAP_FAILED {
        return Err(WorkingSetError::Mmap(std::io::Error::last_os_error()));
    }
    let result = (|| -> Result<(), WorkingSetError> {
        let mut target = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(target_path)?;
        for &(start_page, length) in regions {
            let byte_start = start_page * ps;
            let byte_len = (length * ps) as usize;
            if byte_start + byte_len as u64 > mem_size {
                continue;
            }
            // SAFETY: `addr + byte_start` stays within the `mem_size`-byte mapping
            // established above, for `byte_len` bytes.
            let slice = unsafe {
                std::slice::from_raw_parts(addr.add(byte_start as usize) as *const u8, byte_len)
            };
            target.write_all(slice)?;
        }
        Ok(())
    })();
    // SAFETY: `addr`/`mem_size` came from the successful mmap above.
    unsafe {
        libc::munmap(addr, mem_size as usize);
    }
    if result.is_err() {
        let _ = std::fs::remove_file(target_path);
    }
    result
}

/// Loads the ws file at `ws_path` into the page cache by touching one byte per page.
/// Idempotent: concurrent callers observe exactly one warm-up attempt via `once`.
pub fn load(ws_path: &Path, once: &Once) -> Result<(), WorkingSetError> {
    let mut outcome: Result<(), WorkingSetError> = Ok(());
    once.call_once(|| {
        outcome = load_uncached(ws_path);
    });
    outcome
}

fn load_uncached(ws_path: &Path) -> Result<(), WorkingSetError> {
    let mut file = File::open(ws_path)?;
    let len = file.metadata()?.len();
    if len == 0 {
        return Ok(());
    }
    let ps = page_size() as u64;
    let mut sink: u8 = 0;
    let mut buf = [0u8; 1];
    let npages = len.div_ceil(ps);
    for p in 0..npages {
        file.seek(SeekFrom::Start(p * ps))?;
        if file.read(&mut buf)? > 0 {
            sink ^= buf[0];
        }
    }
    std::hint::black_box(sink);
    Ok(())
}

/// Forces the page cache to hold `pages` (page indices into `mem_path`) by touching one
/// byte of each, the same technique [`load`] uses for the packed ws file. Used by
/// `preWarmMincore`, which targets specific layers directly in the memory image rather
/// than through a built working-set file.
pub fn prewarm_pages(mem_path: &Path, pages: &[usize]) -> Result<(), WorkingSetError> {
    if pages.is_empty() {
        return Ok(());
    }
    let mut file = File::open(mem_path)?;
    let ps = page_size() as u64;
    let mut sink: u8 = 0;
    let mut buf = [0u8; 1];
    for &p in pages {
        file.seek(SeekFrom::Start(p as u64 * ps))?;
        if file.read(&mut buf)? > 0 {
            sink ^= buf[0];
        }
    }
    std::hint::black_box(sink);
    Ok(())
}

/// Advises the kernel to discard the ws file's page cache. No-op if `ws_path` is `None`.
pub fn drop_cache(ws_path: Option<&Path>) -> Result<(), WorkingSetError> {
    let ws_path = match ws_path {
        Some(p) => p,
        None => return Ok(()),
    };
    let file = File::open(ws_path)?;
    let len = file.metadata()?.len();
    // SAFETY: valid fd, offset/length within the file.
    let ret = unsafe { libc::posix_fadvise(file.as_raw_fd(), 0, len as i64, libc::POSIX_FADV_DONTNEED) };
    if ret != 0 {
        return Err(WorkingSetError::Io(std::io::Error::from_raw_os_error(ret)));
    }
    Ok(())
}

/// Updates the memory image's cache state: optionally punches holes over zero ranges
/// (`dig_hole`, via the `fallocate` utility's zero-detection mode), loads its pages into
/// cache (`load_cache`), or drops them (`drop_cache`). Order: hole-punch, then load, then
/// drop (loading after a hole-punch simply re-faults the surviving non-zero pages).
pub fn update_cache_state(
    mem_path: &Path,
    dig_hole: bool,
    load_cache: bool,
    drop_cache_flag: bool,
) -> Result<(), WorkingSetError> {
    if dig_hole {
        let status = std::process::Command::new("fallocate")
            .arg("-d")
            .arg(mem_path)
            .status()?;
        if !status.success() {
            return Err(WorkingSetError::Io(std::io::Error::other(
                "fallocate -d failed",
            )));
        }
    }
    if load_cache {
        let mut file = File::open(mem_path)?;
        std::io::copy(&mut file, &mut std::io::sink())?;
    }
    if drop_cache_flag {
        let file = File::open(mem_path)?;
        let len = file.metadata()?.len();
        // SAFETY: valid fd, offset/length within the file.
        let ret =
            unsafe { libc::posix_fadvise(file.as_raw_fd(), 0, len as i64, libc::POSIX_FADV_DONTNEED) };
        if ret != 0 {
            return Err(WorkingSetError::Io(std::io::Error::from_raw_os_error(ret)));
        }
    }
    Ok(())
}

/// A cancellable load-in-progress flag, used so a caller can poll whether the one-shot
/// [`Once`]-guarded loader above is still running before deciding to wait on it.
pub fn is_loading(flag: &AtomicBool) -> bool {
    flag.load(Ordering::SeqCst)
}

#[cfg(test)]
mod tests {
    use super::*;
    use vmm_sys_util::tempfile::TempFile;

    #[test]
    fn test_include_predicate_table() {
        assert!(!include(false, false, 0, true));
        assert!(include(false, false, 1, true));
        assert!(include(false, true, 1, false));
        assert!(!include(false, true, 0, true));
        assert!(include(true, false, 0, true));
        assert!(!include(true, false, 1, false));
        assert!(include(true, true, 1, false));
        assert!(include(true, true, 0, true));
        assert!(!include(true, true, 0, false));
    }

    #[test]
    fn test_build_empty_image_yields_empty_ws_file() {
        let mem = TempFile::new().unwrap();
        let target = TempFile::new().unwrap();
        let regions = build(
            mem.as_path(),
            0,
            &[],
            &[],
            BuildConfig {
                with_inactive: false,
                with_zero: false,
                size_threshold: 1,
                interval_threshold: 1,
            },
        )
        .unwrap();
        assert!(regions.is_empty());
        write_regions(mem.as_path(), 0, &regions, Some(target.as_path())).unwrap();
        assert_eq!(std::fs::metadata(target.as_path()).unwrap().len(), 0);
    }

    #[test]
    fn test_build_writes_selected_pages_in_region_order() {
        let ps = page_size() as u64;
        let mem = TempFile::new().unwrap();
        {
            let mut f = mem.as_file();
            f.write_all(&vec![1u8; ps as usize]).unwrap();
            f.write_all(&vec![2u8; ps as usize]).unwrap();
            f.write_all(&vec![3u8; ps as usize]).unwrap();
            f.write_all(&vec![4u8; ps as usize]).unwrap();
        }
        let layer = vec![2u32, 0, 1, 0];
        let non_zero = vec![true, false, true, true];
        let target = TempFile::new().unwrap();
        let regions = build(
            mem.as_path(),
            ps * 4,
            &layer,
            &non_zero,
            BuildConfig {
                with_inactive: false,
                with_zero: false,
                size_threshold: 1,
                interval_threshold: 1,
            },
        )
        .unwrap();
        assert_eq!(regions, vec![(2, 1), (0, 1)]);
        write_regions(mem.as_path(), ps * 4, &regions, Some(target.as_path())).unwrap();
        let contents = std::fs::read(target.as_path()).unwrap();
        assert_eq!(contents.len(), (ps * 2) as usize);
        assert!(contents[..ps as usize].iter().all(|&b| b == 3));
        assert!(contents[ps as usize..].iter().all(|&b| b == 1));
    }

    #[test]
    fn test_load_is_single_shot() {
        let ps = page_size();
        let tmp = TempFile::new().unwrap();
        tmp.as_file().write_all(&vec![7u8; ps]).unwrap();
        let once = Once::new();
        load(tmp.as_path(), &once).unwrap();
        load(tmp.as_path(), &once).unwrap();
    }
}
