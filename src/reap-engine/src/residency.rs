//! Kernel page-residency introspection via `mmap(2)` + `mincore(2)`.
//!
//! Grounded on the `PROT_NONE | MAP_SHARED` + `mincore` pattern used to sample the
//! page cache without ever touching page contents, and on the host repository's own
//! raw-`libc` mmap style (`vmm::vstate::memory`).

use std::fs::File;
use std::os::unix::io::AsRawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use reap_utils::page_size;

use crate::error::ResidencyError;

/// What causes a new residency sample to be taken during [`scan_residency`].
#[derive(Debug, Clone)]
pub enum Trigger {
    /// Sample every `interval`.
    Interval(Duration),
    /// Sample whenever `pid`'s RSS (read from `/proc/<pid>/smaps_rollup`) has grown by at
    /// least `bytes_per_layer` since the last sample.
    RssGrowth { pid: u32, bytes_per_layer: u64 },
}

struct ResidencyMapping {
    addr: *mut libc::c_void,
    len: usize,
}

impl ResidencyMapping {
    fn new(file: &File, size: u64) -> Result<Option<Self>, ResidencyError> {
        if size == 0 {
            return Ok(None);
        }
        // SAFETY: `file` outlives the mapping (we hold it for the full call), `size` is
        // the file's known byte length, and the mapping is never dereferenced directly —
        // only passed to `mincore`.
        let addr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                size as usize,
                libc::PROT_NONE,
                libc::MAP_SHARED,
                file.as_raw_fd(),
                0,
            )
        };
        if addr == libc::MAP_FAILED {
            return Err(ResidencyError::Mmap(std::io::Error::last_os_error()));
        }
        Ok(Some(ResidencyMapping {
            addr,
            len: size as usize,
        }))
    }

    fn sample(&self) -> Result<Vec<u8>, ResidencyError> {
        let npages = self.len.div_ceil(page_size());
        let mut vec = vec![0u8; npages];
        // SAFETY: `vec` is sized to exactly one byte per page of the mapping, as mincore
        // requires.
        let ret = unsafe { libc::mincore(self.addr, self.len, vec.as_mut_ptr()) };
        if ret != 0 {
            return Err(ResidencyError::Mincore(std::io::Error::last_os_error()));
        }
        Ok(vec)
    }
}

impl Drop for ResidencyMapping {
    fn drop(&mut self) {
        // SAFETY: `addr`/`len` came from a successful mmap of exactly this size.
        unsafe {
            libc::munmap(self.addr, self.len);
        }
    }
}

/// Returns one boolean per page of `file` (first `size` bytes), true iff that page was
/// resident in the page cache at the instant of the call. Empty file yields an empty
/// sequence. The mapping is always torn down before returning.
pub fn residency(file: &File, size: u64) -> Result<Vec<bool>, ResidencyError> {
    let mapping = match ResidencyMapping::new(file, size)? {
        Some(m) => m,
        None => return Ok(Vec::new()),
    };
    let vec = mapping.sample()?;
    Ok(vec.into_iter().map(|b| b & 1 != 0).collect())
}

/// Repeatedly samples residency under `trigger` until `stop` is set, assigning each
/// newly-resident page the 1-based index of the sample that first observed it (plus
/// `start_layer`). Returns the per-page layer array and the final layer reached.
///
/// `layer[i] == 0` means page i was never observed resident during the scan.
pub fn scan_residency(
    file: &File,
    size: u64,
    start_layer: u32,
    trigger: Trigger,
    stop: &AtomicBool,
) -> Result<(Vec<u32>, u32), ResidencyError> {
    let mapping = match ResidencyMapping::new(file, size)? {
        Some(m) => m,
        None => return Ok((Vec::new(), start_layer)),
    };

    let npages = mapping.len.div_ceil(page_size());
    let mut layer = vec![0u32; npages];
    let mut nsamples: u32 = 0;
    let mut last_rss: u64 = 0;

    loop {
        match &trigger {
            Trigger::Interval(d) => {
                let step = Duration::from_millis(20).min(*d);
                let mut waited = Duration::ZERO;
                while waited < *d {
                    if stop.load(Ordering::SeqCst) {
                        break;
                    }
                    std::thread::sleep(step);
                    waited += step;
                }
            }
            Trigger::RssGrowth {
                pid,
                bytes_per_layer,
            } => loop {
                if stop.load(Ordering::SeqCst) {
                    break;
                }
                let rss = read_rss(*pid)?;
                if rss >= last_rss + *bytes_per_layer {
                    last_rss = rss;
                    break;
                }
                std::thread::sleep(Duration::from_millis(4));
            },
        }

        if stop.load(Ordering::SeqCst) {
            break;
        }

        nsamples += 1;
        let sample = mapping.sample()?;
        for (i, b) in sample.iter().enumerate() {
            if *b & 1 != 0 && layer[i] == 0 {
                layer[i] = start_layer + nsamples;
            }
        }
    }

    Ok((layer, start_layer + nsamples))
}

/// Reads the current resident-set size, in bytes, from `/proc/<pid>/smaps_rollup`'s
/// `Rss:` line (reported in kB).
fn read_rss(pid: u32) -> Result<u64, ResidencyError> {
    let path = format!("/proc/{pid}/smaps_rollup");
    let data = std::fs::read_to_string(&path)
        .map_err(|e| ResidencyError::RssRead(pid, e))?;
    for line in data.lines() {
        if let Some(rest) = line.strip_prefix("Rss:") {
            if let Some(kb) = rest.split_whitespace().next() {
                if let Ok(kb) = kb.parse::<u64>() {
                    return Ok(kb * 1024);
                }
            }
        }
    }
    Err(ResidencyError::RssRead(
        pid,
        std::io::Error::new(std::io::ErrorKind::NotFound, "Rss: line not found"),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use vmm_sys_util::tempfile::TempFile;

    #[test]
    fn test_residency_empty_file() {
        let tmp = TempFile::new().unwrap();
        let file = tmp.into_file();
        assert_eq!(residency(&file, 0).unwrap(), Vec::<bool>::new());
    }

    #[test]
    fn test_residency_nonempty_file_is_resident_after_read() {
        let tmp = TempFile::new().unwrap();
        let mut file = tmp.into_file();
        let ps = page_size();
        file.write_all(&vec![0xAAu8; ps * 2]).unwrap();
        file.sync_all().unwrap();

        // Force both pages into the cache by reading them back.
        use std::io::{Read, Seek, SeekFrom};
        file.seek(SeekFrom::Start(0)).unwrap();
        let mut buf = vec![0u8; ps * 2];
        file.read_exact(&mut buf).unwrap();

        let result = residency(&file, (ps * 2) as u64).unwrap();
        assert_eq!(result.len(), 2);
    }

    #[test]
    fn test_scan_residency_interval_terminates_on_stop() {
        let tmp = TempFile::new().unwrap();
        let mut file = tmp.into_file();
        let ps = page_size();
        file.write_all(&vec![1u8; ps]).unwrap();
        file.sync_all().unwrap();

        let stop = AtomicBool::new(false);
        std::thread::scope(|scope| {
            scope.spawn(|| {
                std::thread::sleep(Duration::from_millis(30));
                stop.store(true, Ordering::SeqCst);
            });
            let (layer, final_layer) =
                scan_residency(&file, ps as u64, 0, Trigger::Interval(Duration::from_millis(10)), &stop)
                    .unwrap();
            assert_eq!(layer.len(), 1);
            assert!(final_layer >= 1);
        });
    }
}
