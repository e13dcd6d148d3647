//! Unix descriptor plumbing: SCM_RIGHTS passing over local stream sockets,
//! plus the small raw-fd helpers the session loop needs for an inherited
//! client socket that has no typed tokio wrapper.

use std::fs::File;
use std::io::{self, IoSlice, IoSliceMut, Read, Write};
use std::mem::ManuallyDrop;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

use nix::cmsg_space;
use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::sys::socket::{recvmsg, sendmsg, ControlMessage, ControlMessageOwned, MsgFlags, Shutdown};

/// Send `data` over a unix stream socket with `fds` attached as SCM_RIGHTS
/// ancillary data. The receiver gets duplicates of the descriptors.
pub fn send_with_fds(sock: RawFd, data: &[u8], fds: &[RawFd]) -> io::Result<usize> {
    let iov = [IoSlice::new(data)];
    let cmsgs = [ControlMessage::ScmRights(fds)];
    sendmsg::<()>(sock, &iov, &cmsgs, MsgFlags::empty(), None).map_err(io::Error::from)
}

pub fn send_with_fd(sock: RawFd, data: &[u8], fd: RawFd) -> io::Result<usize> {
    send_with_fds(sock, data, &[fd])
}

/// Receive into `buf`, appending any SCM_RIGHTS descriptors to `fds`.
/// Returns the number of data bytes read (0 on EOF).
pub fn recv_with_fds(sock: RawFd, buf: &mut [u8], fds: &mut Vec<OwnedFd>) -> io::Result<usize> {
    let mut iov = [IoSliceMut::new(buf)];
    let mut cmsg_buffer = cmsg_space!([RawFd; 8]);
    let msg = recvmsg::<()>(sock, &mut iov, Some(&mut cmsg_buffer), MsgFlags::empty())
        .map_err(io::Error::from)?;
    for cmsg in msg.cmsgs() {
        if let ControlMessageOwned::ScmRights(received) = cmsg {
            for fd in received {
                fds.push(unsafe { OwnedFd::from_raw_fd(fd) });
            }
        }
    }
    Ok(msg.bytes)
}

pub fn set_nonblocking(fd: &impl AsRawFd) -> io::Result<()> {
    let raw = fd.as_raw_fd();
    let flags = fcntl(raw, FcntlArg::F_GETFL).map_err(io::Error::from)?;
    let mut oflag = OFlag::from_bits_truncate(flags);
    oflag.insert(OFlag::O_NONBLOCK);
    fcntl(raw, FcntlArg::F_SETFL(oflag)).map_err(io::Error::from)?;
    Ok(())
}

pub fn shutdown_rdwr(fd: RawFd) -> io::Result<()> {
    nix::sys::socket::shutdown(fd, Shutdown::Both).map_err(io::Error::from)
}

/// read(2) on a raw descriptor without taking ownership of it.
pub fn fd_read(fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
    let mut file = ManuallyDrop::new(unsafe { File::from_raw_fd(fd) });
    file.read(buf)
}

/// write(2) on a raw descriptor without taking ownership of it.
pub fn fd_write(fd: RawFd, buf: &[u8]) -> io::Result<usize> {
    let mut file = ManuallyDrop::new(unsafe { File::from_raw_fd(fd) });
    file.write(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::net::UnixStream;

    #[test]
    fn passes_a_descriptor_across_a_socketpair() {
        let (left, right) = UnixStream::pair().unwrap();
        let (payload_tx, payload_rx) = UnixStream::pair().unwrap();

        let sent = send_with_fd(left.as_raw_fd(), b"X", payload_tx.as_raw_fd()).unwrap();
        assert_eq!(sent, 1);

        let mut buf = [0u8; 16];
        let mut fds = Vec::new();
        let n = recv_with_fds(right.as_raw_fd(), &mut buf, &mut fds).unwrap();
        assert_eq!(&buf[..n], b"X");
        assert_eq!(fds.len(), 1);

        // the duplicate must reach the payload socket's peer
        let dup = fds.remove(0);
        assert_eq!(fd_write(dup.as_raw_fd(), b"hello").unwrap(), 5);
        let mut out = [0u8; 5];
        let mut payload_rx = &payload_rx;
        payload_rx.read_exact(&mut out).unwrap();
        assert_eq!(&out, b"hello");
    }

    #[test]
    fn recv_without_ancillary_data_leaves_fds_untouched() {
        let (mut left, right) = UnixStream::pair().unwrap();
        left.write_all(b"plain").unwrap();
        let mut buf = [0u8; 16];
        let mut fds = Vec::new();
        let n = recv_with_fds(right.as_raw_fd(), &mut buf, &mut fds).unwrap();
        assert_eq!(&buf[..n], b"plain");
        assert!(fds.is_empty());
    }
}
