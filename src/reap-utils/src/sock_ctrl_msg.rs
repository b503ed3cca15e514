//! Send/receive a single file descriptor as ancillary (`SCM_RIGHTS`) data over a
//! unix stream socket. This is how the instance socket (§6) hands the UFFD fd to
//! the server without ever putting it in the byte stream itself.
//!
//! `vmm-sys-util` already ships exactly this (the same module Firecracker's own
//! `examples/uffd/uffd_utils.rs` imports from its predecessor `utils` crate); re-export
//! it rather than reimplementing `sendmsg`/`recvmsg` ancillary-data plumbing by hand.

pub use vmm_sys_util::sock_ctrl_msg::ScmSocket;

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::io::AsRawFd;
    use std::os::unix::net::UnixStream;

    #[test]
    fn test_send_recv_fd() {
        let (sock1, sock2) = UnixStream::pair().unwrap();
        let null = std::fs::File::open("/dev/null").unwrap();

        let payload = b"hello";
        sock1.send_with_fd(payload, null.as_raw_fd()).unwrap();

        let mut buf = [0u8; 5];
        let (n, fd) = sock2.recv_with_fd(&mut buf).unwrap();
        assert_eq!(n, 5);
        assert_eq!(&buf, payload);
        // `recv_with_fd` hands back an owned `File`; dropping it closes the descriptor.
        assert!(fd.is_some());
    }
}
