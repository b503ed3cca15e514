//! Small helpers shared by the engine and the daemon binary: host page size
//! discovery and the short alphanumeric ids used for snapshots and instances.

use std::sync::OnceLock;

const ID_ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

/// Returns the host's page size, as reported by `sysconf(_SC_PAGESIZE)`.
///
/// Cached after the first call; the value cannot change for the lifetime of the process.
pub fn page_size() -> usize {
    static PAGE_SIZE: OnceLock<usize> = OnceLock::new();
    *PAGE_SIZE.get_or_init(|| {
        // SAFETY: sysconf with a valid name is always safe to call.
        let ret = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        assert!(ret > 0, "sysconf(_SC_PAGESIZE) failed");
        ret as usize
    })
}

/// Generates an `n`-character alphanumeric id from `vmm-sys-util`'s xorshift generator —
/// the same `xor_pseudo_rng_u32` Firecracker itself reaches for whenever it needs a quick,
/// non-cryptographic random value (instance ids, backoff jitter).
///
/// Not cryptographically secure; ids only need to be unlikely to collide within one host.
pub fn random_alphanum(n: usize) -> String {
    (0..n)
        .map(|_| ID_ALPHABET[vmm_sys_util::rand::xor_pseudo_rng_u32() as usize % ID_ALPHABET.len()] as char)
        .collect()
}

/// Generates a snapshot id of the form `ss_<8 alphanum>`, matching the host system's
/// existing `"ss_" + RandStringRunes(8)` convention.
pub fn new_snapshot_id() -> String {
    format!("ss_{}", random_alphanum(8))
}

/// Generates a clone suffix of the form `-<4 alphanum>`, appended to the parent's
/// instance id the way the host system derives a clone's VM id.
pub fn clone_suffix() -> String {
    format!("-{}", random_alphanum(4))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_size_is_power_of_two() {
        let p = page_size();
        assert!(p > 0);
        assert_eq!(p & (p - 1), 0);
    }

    #[test]
    fn test_random_alphanum_length_and_alphabet() {
        let id = random_alphanum(8);
        assert_eq!(id.len(), 8);
        assert!(id.chars().all(|c| c.is_ascii_alphanumeric()));
    }

    #[test]
    fn test_new_snapshot_id_prefix() {
        let id = new_snapshot_id();
        assert!(id.starts_with("ss_"));
        assert_eq!(id.len(), 11);
    }
}
