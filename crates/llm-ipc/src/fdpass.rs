//! `SCM_RIGHTS` descriptor passing over the shared bus socket.
//!
//! `OpenSession` replies carry the client's two pipe descriptors (its read
//! end and its write end) as ancillary data on a one-byte payload.

use std::io::{IoSlice, IoSliceMut};
use std::os::fd::{FromRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixStream;
use std::os::unix::prelude::AsRawFd;

use nix::sys::socket::{recvmsg, sendmsg, ControlMessage, ControlMessageOwned, MsgFlags};

fn errno_to_io(err: nix::errno::Errno) -> std::io::Error {
    std::io::Error::from_raw_os_error(err as i32)
}

/// Sends `payload` over `stream` with `fds` attached as `SCM_RIGHTS`
/// ancillary data.
pub fn send_with_fds(stream: &UnixStream, payload: &[u8], fds: &[RawFd]) -> std::io::Result<usize> {
    let iov = [IoSlice::new(payload)];
    let cmsgs = [ControlMessage::ScmRights(fds)];
    sendmsg::<()>(stream.as_raw_fd(), &iov, &cmsgs, MsgFlags::empty(), None)
        .map_err(errno_to_io)
}

/// Receives a payload into `buf`, collecting any descriptors attached to the
/// message. The returned descriptors are owned; dropping them closes them.
pub fn recv_with_fds(
    stream: &UnixStream,
    buf: &mut [u8],
) -> std::io::Result<(usize, Vec<OwnedFd>)> {
    let mut cmsg_space = nix::cmsg_space!([RawFd; 2]);
    let mut iov = [IoSliceMut::new(buf)];
    let msg = recvmsg::<()>(
        stream.as_raw_fd(),
        &mut iov,
        Some(&mut cmsg_space),
        MsgFlags::empty(),
    )
    .map_err(errno_to_io)?;

    let mut fds = Vec::new();
    for cmsg in msg.cmsgs() {
        if let ControlMessageOwned::ScmRights(received) = cmsg {
            for fd in received {
                // SAFETY: the kernel just handed us this descriptor; nothing
                // else owns it.
                fds.push(unsafe { OwnedFd::from_raw_fd(fd) });
            }
        }
    }
    Ok((msg.bytes, fds))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};

    #[test]
    fn pipe_fds_survive_the_trip() {
        let (tx, rx) = UnixStream::pair().unwrap();
        let (pipe_read, pipe_write) = nix::unistd::pipe().unwrap();

        send_with_fds(&tx, b"S", &[pipe_read]).unwrap();
        let mut buf = [0u8; 1];
        let (n, fds) = recv_with_fds(&rx, &mut buf).unwrap();
        assert_eq!(n, 1);
        assert_eq!(buf[0], b'S');
        assert_eq!(fds.len(), 1);

        // Write through the original end, read through the received one.
        let mut writer = unsafe { std::fs::File::from_raw_fd(pipe_write) };
        writer.write_all(b"hello").unwrap();
        drop(writer);

        let mut reader = std::fs::File::from(fds.into_iter().next().unwrap());
        let mut read_back = String::new();
        reader.read_to_string(&mut read_back).unwrap();
        assert_eq!(read_back, "hello");

        // The local duplicate of the read end is still ours to close.
        nix::unistd::close(pipe_read).unwrap();
    }
}
