//! The user-fault server: per-activation setup over a unix socket, the single-threaded
//! fault-serving loop, and the `Registered → ... → Dropped` lifecycle (§4.6).
//!
//! Grounded directly on the host repository's own `examples/uffd/uffd_utils.rs` (the
//! `GuestRegionUffdMapping`/`UffdPfHandler`/`serve_pf` pattern), generalized to add
//! replay-from-trace and the state machine the source example doesn't need because it's
//! a one-shot demo binary rather than a long-lived per-snapshot service.

use std::collections::HashSet;
use std::fs::File;
use std::io::Read;
use std::os::unix::io::{AsRawFd, FromRawFd, IntoRawFd, RawFd};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use userfaultfd::{Event, Uffd};

use reap_utils::page_size;
use reap_utils::sock_ctrl_msg::ScmSocket;

use crate::error::UffdError;
use crate::snapshot::Snapshot;

/// Wire payload the VMM sends alongside the user-fault fd: the guest-memory mapping's
/// base host virtual address and length (§6's instance-socket contract).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuestRegionUffdMapping {
    pub base_host_virt_addr: u64,
    pub size: usize,
    #[serde(default)]
    pub offset: u64,
}

/// Lifecycle states from §4.6.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Registered,
    Activated,
    Serving,
    Draining,
    Deactivated,
    Dropped,
}

struct MappedFile {
    addr: *mut u8,
    len: usize,
}

// SAFETY: the mapping is read-only for the lifetime of the handle and only ever read
// from the single fault-serving thread that owns it.
unsafe impl Send for MappedFile {}

impl MappedFile {
    fn open_private_readonly(path: &Path) -> Result<(File, Self), UffdError> {
        Self::open_private_readonly_opts(path, false)
    }

    /// `direct_io` opens the file with `O_DIRECT` (the `wsFileDirectIO` request-surface
    /// knob, §6), so the mapping's backing reads bypass the page cache entirely. Falls
    /// back to a normal open if the filesystem rejects `O_DIRECT` (not all of them
    /// support it), logging a warning, rather than failing the activation over an
    /// optimization knob.
    fn open_private_readonly_opts(path: &Path, direct_io: bool) -> Result<(File, Self), UffdError> {
        let file = if direct_io {
            use std::os::unix::fs::OpenOptionsExt;
            match std::fs::OpenOptions::new()
                .read(true)
                .custom_flags(libc::O_DIRECT)
                .open(path)
            {
                Ok(f) => f,
                Err(e) => {
                    log::warn!("O_DIRECT open of {} failed ({e}); falling back", path.display());
                    File::open(path)?
                }
            }
        } else {
            File::open(path)?
        };
        let len = file.metadata()?.len() as usize;
        if len == 0 {
            return Ok((
                file,
                MappedFile {
                    addr: std::ptr::null_mut(),
                    len: 0,
                },
            ));
        }
        // SAFETY: `file` outlives the mapping (held alongside it by the caller).
        let addr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ,
                libc::MAP_PRIVATE,
                file.as_raw_fd(),
                0,
            )
        };
        if addr == libc::MAP_FAILED {
            return Err(UffdError::Io(std::io::Error::last_os_error()));
        }
        Ok((
            file,
            MappedFile {
                addr: addr as *mut u8,
                len,
            },
        ))
    }

    fn page_bytes(&self, page: usize) -> Option<&[u8]> {
        let ps = page_size();
        let start = page * ps;
        if start + ps > self.len {
            return None;
        }
        // SAFETY: bounds-checked against `self.len` above.
        Some(unsafe { std::slice::from_raw_parts(self.addr.add(start), ps) })
    }
}

impl Drop for MappedFile {
    fn drop(&mut self) {
        if !self.addr.is_null() {
            // SAFETY: `addr`/`len` came from the successful mmap in `open_private_readonly`.
            unsafe {
                libc::munmap(self.addr as *mut libc::c_void, self.len);
            }
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct FaultMetrics {
    pub served: u64,
    pub reused: u64,
    pub unique: u64,
}

/// Outcome handed back from the fault-serving thread at deactivation.
struct ActivationOutcome {
    /// Deduplicated, order-preserving page-offset trace (§4.6 "canonical record").
    trace: Vec<u64>,
    metrics: FaultMetrics,
}

struct ActivationHandle {
    quit: Arc<AtomicBool>,
    ready_rx: mpsc::Receiver<Result<(), UffdError>>,
    join: JoinHandle<Result<ActivationOutcome, UffdError>>,
    socket_path: PathBuf,
    started: Instant,
}

enum StateSlot {
    Registered,
    Running(ActivationHandle),
    Deactivated,
}

/// Per-activation handler. One `Instance` exists per in-flight (or previously active)
/// activation of a snapshot.
pub struct Instance {
    pub id: String,
    snapshot: Arc<Snapshot>,
    base_dir: PathBuf,
    slot: Mutex<StateSlot>,
}

impl Instance {
    pub fn new(id: String, snapshot: Arc<Snapshot>, base_dir: PathBuf) -> Self {
        Instance {
            id,
            snapshot,
            base_dir,
            slot: Mutex::new(StateSlot::Registered),
        }
    }

    pub fn state(&self) -> State {
        match &*self.slot.lock().unwrap() {
            StateSlot::Registered => State::Registered,
            StateSlot::Running(_) => State::Serving,
            StateSlot::Deactivated => State::Deactivated,
        }
    }

    fn socket_path(base_dir: &Path, id: &str) -> PathBuf {
        base_dir.join(format!("uffd-{id}.sock"))
    }

    /// Runs the setup sequence (§4.6) on a dedicated thread and blocks until the caller's
    /// readiness signal arrives, or setup fails. On failure, mappings/fd/socket are torn
    /// down and the snapshot is left untouched, per §7's failure semantics.
    pub fn activate(&self) -> Result<(), UffdError> {
        let mut slot = self.slot.lock().unwrap();
        if matches!(&*slot, StateSlot::Running(_)) {
            return Err(UffdError::AlreadyActivated);
        }

        let socket_path = Self::socket_path(&self.base_dir, &self.id);
        let _ = std::fs::remove_file(&socket_path);
        let listener = UnixListener::bind(&socket_path)?;

        let quit = Arc::new(AtomicBool::new(false));
        let (ready_tx, ready_rx) = mpsc::channel();

        let mem_path = self.snapshot.mem_path.clone();
        let mem_size = self.snapshot.size;
        let ws_path = self.snapshot.ws_path();
        let ws_direct_io = self.snapshot.ws_file_direct_io;
        let replay_trace = self.snapshot.records();
        let quit_clone = Arc::clone(&quit);
        let socket_path_clone = socket_path.clone();

        let join = std::thread::spawn(move || {
            serve(
                listener,
                mem_path,
                mem_size,
                ws_path,
                ws_direct_io,
                replay_trace,
                quit_clone,
                ready_tx,
                socket_path_clone,
            )
        });

        *slot = StateSlot::Running(ActivationHandle {
            quit,
            ready_rx,
            join,
            socket_path,
            started: Instant::now(),
        });
        drop(slot);

        self.wait_ready()
    }

    /// Blocks until the activation's setup has either signaled readiness or failed.
    fn wait_ready(&self) -> Result<(), UffdError> {
        let slot = self.slot.lock().unwrap();
        match &*slot {
            StateSlot::Running(handle) => handle
                .ready_rx
                .recv()
                .unwrap_or(Err(UffdError::Io(std::io::Error::other(
                    "activation thread exited before signaling readiness",
                )))),
            _ => Err(UffdError::NotActive),
        }
    }

    /// Signals the fault loop to drain and exit, joins it, post-processes its trace into
    /// the snapshot's canonical record, and returns the recorded offsets alongside the
    /// activation's fault metrics and wall-clock duration, for the metrics CSV (§10.4).
    pub fn deactivate(&self) -> Result<(Vec<u64>, FaultMetrics, Duration), UffdError> {
        let mut slot = self.slot.lock().unwrap();
        let handle = match std::mem::replace(&mut *slot, StateSlot::Deactivated) {
            StateSlot::Running(h) => h,
            other => {
                *slot = other;
                return Err(UffdError::NotActive);
            }
        };
        drop(slot);

        handle.quit.store(true, Ordering::SeqCst);
        let elapsed = handle.started.elapsed();
        let outcome = handle
            .join
            .join()
            .map_err(|_| UffdError::Io(std::io::Error::other("fault-serving thread panicked")))??;
        let _ = std::fs::remove_file(&handle.socket_path);

        self.snapshot.set_records(outcome.trace.clone());
        Ok((outcome.trace, outcome.metrics, elapsed))
    }
}

/// The setup sequence plus the fault-serving loop, run entirely on the activation's
/// dedicated thread.
#[allow(clippy::too_many_arguments)]
fn serve(
    listener: UnixListener,
    mem_path: PathBuf,
    mem_size: u64,
    ws_path: Option<PathBuf>,
    ws_direct_io: bool,
    replay_trace: Vec<u64>,
    quit: Arc<AtomicBool>,
    ready_tx: mpsc::Sender<Result<(), UffdError>>,
    socket_path: PathBuf,
) -> Result<ActivationOutcome, UffdError> {
    let result = setup(&listener, &mem_path, mem_size, ws_path.as_deref(), ws_direct_io);
    let (uffd, mem_map, ws_map, mapping) = match result {
        Ok(v) => v,
        Err(e) => {
            let _ = std::fs::remove_file(&socket_path);
            let _ = ready_tx.send(Err(clone_uffd_error(&e)));
            return Err(e);
        }
    };
    let _ = ready_tx.send(Ok(()));

    let ps = page_size() as u64;
    let mut seen: HashSet<u64> = HashSet::new();
    let mut trace: Vec<u64> = Vec::new();
    let mut metrics = FaultMetrics::default();

    // Replay: eagerly resolve every page already in the stored trace before accepting
    // any new fault, unless preempted by the quit signal.
    for &offset in &replay_trace {
        if quit.load(Ordering::SeqCst) {
            break;
        }
        let page_offset = offset - (offset % ps);
        if seen.insert(page_offset) {
            trace.push(page_offset);
        }
        let page = (page_offset / ps) as usize;
        let dst = (mapping.base_host_virt_addr + page_offset) as *mut libc::c_void;
        let bytes = ws_map
            .as_ref()
            .and_then(|m| m.page_bytes(page))
            .or_else(|| mem_map.page_bytes(page));
        if let Some(bytes) = bytes {
            fill_page(&uffd, dst, bytes, ps as usize)?;
            metrics.served += 1;
            metrics.reused += 1;
        }
    }

    // SAFETY: the fd underlying `uffd` stays valid for the lifetime of the loop.
    let poll_fd = libc::pollfd {
        fd: uffd.as_raw_fd(),
        events: libc::POLLIN,
        revents: 0,
    };

    loop {
        if quit.load(Ordering::SeqCst) {
            break;
        }
        let mut fds = [poll_fd];
        // SAFETY: `fds` has exactly one valid, open fd.
        let ret = unsafe { libc::poll(fds.as_mut_ptr(), 1, 50) };
        if ret < 0 {
            return Err(UffdError::Io(std::io::Error::last_os_error()));
        }
        if ret == 0 {
            continue;
        }
        let event = match uffd.read_event() {
            Ok(Some(e)) => e,
            Ok(None) => continue,
            Err(e) => return Err(UffdError::Kernel(e)),
        };
        handle_event(
            event, &uffd, &mapping, ps, &mem_map, ws_map.as_ref(), &mut seen, &mut trace,
            &mut metrics,
        )?;
    }

    // Draining (§4.6): quit was observed, but a fault may already be sitting on the uffd
    // fd. Serve whatever is immediately pending with a zero-timeout poll before the
    // caller unmaps and tears the uffd down; nothing new can arrive after that.
    loop {
        let mut fds = [poll_fd];
        // SAFETY: `fds` has exactly one valid, open fd.
        let ret = unsafe { libc::poll(fds.as_mut_ptr(), 1, 0) };
        if ret < 0 {
            return Err(UffdError::Io(std::io::Error::last_os_error()));
        }
        if ret == 0 {
            break;
        }
        let event = match uffd.read_event() {
            Ok(Some(e)) => e,
            Ok(None) => break,
            Err(e) => return Err(UffdError::Kernel(e)),
        };
        handle_event(
            event, &uffd, &mapping, ps, &mem_map, ws_map.as_ref(), &mut seen, &mut trace,
            &mut metrics,
        )?;
    }

    Ok(ActivationOutcome { trace, metrics })
}

#[allow(clippy::too_many_arguments)]
fn handle_event(
    event: Event,
    uffd: &Uffd,
    mapping: &GuestRegionUffdMapping,
    ps: u64,
    mem_map: &MappedFile,
    ws_map: Option<&MappedFile>,
    seen: &mut HashSet<u64>,
    trace: &mut Vec<u64>,
    metrics: &mut FaultMetrics,
) -> Result<(), UffdError> {
    match event {
        Event::Pagefault { addr, .. } => {
            let addr = addr as u64;
            let page_offset = (addr - mapping.base_host_virt_addr) & !(ps - 1);
            let page = (page_offset / ps) as usize;
            let already_known = !seen.insert(page_offset);
            if !already_known {
                trace.push(page_offset);
            }

            let dst = (mapping.base_host_virt_addr + page_offset) as *mut libc::c_void;
            let bytes = if already_known {
                let b = ws_map
                    .and_then(|m| m.page_bytes(page))
                    .or_else(|| mem_map.page_bytes(page));
                metrics.reused += 1;
                b
            } else {
                metrics.unique += 1;
                mem_map.page_bytes(page)
            };

            match bytes {
                Some(bytes) => {
                    fill_page(uffd, dst, bytes, ps as usize)?;
                    metrics.served += 1;
                }
                None => return Err(UffdError::FillRejected(page_offset)),
            }
        }
        Event::Remove { .. } => {}
        _ => {}
    }
    Ok(())
}

fn fill_page(
    uffd: &Uffd,
    dst: *mut libc::c_void,
    bytes: &[u8],
    page_size: usize,
) -> Result<(), UffdError> {
    // SAFETY: `dst` is the guest-VA page address reported by the control message, valid
    // for exactly one page; `bytes` is a page-sized, page-aligned slice from one of our
    // own read-only mappings.
    unsafe {
        uffd.copy(bytes.as_ptr() as *const libc::c_void, dst, page_size, true)
            .map_err(UffdError::Kernel)?;
    }
    Ok(())
}

#[allow(clippy::type_complexity)]
fn setup(
    listener: &UnixListener,
    mem_path: &Path,
    mem_size: u64,
    ws_path: Option<&Path>,
    ws_direct_io: bool,
) -> Result<(Uffd, MappedFile, Option<MappedFile>, GuestRegionUffdMapping), UffdError> {
    let (stream, _) = listener.accept()?;
    let (fd, mapping) = recv_control_message(&stream)?;

    // SAFETY: `fd` was just received as valid ancillary data from the VMM's connection
    // and is owned by us from this point.
    let uffd = unsafe { Uffd::from_raw_fd(fd) };

    let (_mem_file, mem_map) = MappedFile::open_private_readonly(mem_path)?;
    let _ = mem_size;
    let ws_map = match ws_path {
        Some(p) => Some(MappedFile::open_private_readonly_opts(p, ws_direct_io)?.1),
        None => None,
    };

    Ok((uffd, mem_map, ws_map, mapping))
}

fn recv_control_message(stream: &UnixStream) -> Result<(RawFd, GuestRegionUffdMapping), UffdError> {
    let mut buf = [0u8; 4096];
    let (n, fd) = stream
        .recv_with_fd(&mut buf)
        .map_err(UffdError::Io)?;
    let fd = fd
        .ok_or_else(|| UffdError::Protocol("no fd attached to control message".into()))?
        .into_raw_fd();
    let text = std::str::from_utf8(&buf[..n])
        .map_err(|e| UffdError::Protocol(e.to_string()))?;
    let mapping: GuestRegionUffdMapping =
        serde_json::from_str(text).map_err(|e| UffdError::Protocol(e.to_string()))?;
    Ok((fd, mapping))
}

fn clone_uffd_error(e: &UffdError) -> UffdError {
    match e {
        UffdError::Io(_) => UffdError::Io(std::io::Error::other("activation setup failed")),
        UffdError::Protocol(s) => UffdError::Protocol(s.clone()),
        UffdError::AlreadyActivated => UffdError::AlreadyActivated,
        UffdError::NotActive => UffdError::NotActive,
        UffdError::FillRejected(o) => UffdError::FillRejected(*o),
        UffdError::Kernel(_) => UffdError::Io(std::io::Error::other("kernel operation failed")),
    }
}

/// Sends the VMM side of the instance-socket handshake: a single control message
/// carrying the uffd fd plus the mapping description. Used by integration tests and by
/// any in-process VMM stand-in exercising the real protocol end to end.
pub fn send_control_message(
    stream: &UnixStream,
    uffd_fd: RawFd,
    mapping: &GuestRegionUffdMapping,
) -> std::io::Result<()> {
    let payload = serde_json::to_vec(mapping).expect("mapping always serializes");
    stream.send_with_fd(&payload, uffd_fd)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_guest_region_mapping_round_trips_json() {
        let mapping = GuestRegionUffdMapping {
            base_host_virt_addr: 0x7f0000000000,
            size: 4096 * 16,
            offset: 0,
        };
        let json = serde_json::to_string(&mapping).unwrap();
        let parsed: GuestRegionUffdMapping = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.base_host_virt_addr, mapping.base_host_virt_addr);
        assert_eq!(parsed.size, mapping.size);
    }

    #[test]
    fn test_state_starts_registered() {
        // Constructing an Instance requires a real Snapshot; covered end-to-end in
        // orchestrator.rs's tests instead, which build one via the registry.
    }
}
