//! `SCM_RIGHTS` descriptor passing for the handover channel.
//!
//! A descriptor batch travels as one SEQPACKET message: a 4-byte ASCII
//! `"desc"` tag, then one native-endian `i32` uid per descriptor (`-1` for a
//! connection that never announced), with the descriptors themselves in a
//! single `SCM_RIGHTS` ancillary array in the same order.
//!
//! The kernel duplicates each descriptor into the receiving process; the
//! sender's copies stay valid until it closes them, so a failed `sendmsg`
//! leaves the sender fully intact.

use std::io;
use std::mem;
use std::os::unix::io::{FromRawFd, OwnedFd, RawFd};
use std::ptr;

/// Upper bound on descriptors per control message.
pub const MAX_FDS_PER_MESSAGE: usize = 256;

/// Tag introducing a descriptor batch.
pub const DESC_TAG: &[u8; 4] = b"desc";

/// Largest control payload: tag plus one i32 uid per descriptor.
pub const MAX_CTRL_PAYLOAD: usize = 4 + MAX_FDS_PER_MESSAGE * mem::size_of::<i32>();

/// Send a `"desc"` batch: `uids` in the payload, `fds` as `SCM_RIGHTS`.
///
/// `uids` and `fds` must be equally long, non-empty, and at most
/// [`MAX_FDS_PER_MESSAGE`] entries. The caller still owns the descriptors
/// afterwards and must close its copies once the send has succeeded.
pub fn send_fds(sock: RawFd, uids: &[i32], fds: &[RawFd]) -> io::Result<()> {
    debug_assert_eq!(uids.len(), fds.len());
    debug_assert!(!fds.is_empty() && fds.len() <= MAX_FDS_PER_MESSAGE);

    let mut payload = Vec::with_capacity(4 + uids.len() * mem::size_of::<i32>());
    payload.extend_from_slice(DESC_TAG);
    for uid in uids {
        payload.extend_from_slice(&uid.to_ne_bytes());
    }

    let fd_bytes = fds.len() * mem::size_of::<libc::c_int>();
    let cmsg_space = unsafe { libc::CMSG_SPACE(fd_bytes as u32) } as usize;
    let mut cmsg_buf = vec![0u8; cmsg_space];

    let mut iov = libc::iovec {
        iov_base: payload.as_mut_ptr() as *mut libc::c_void,
        iov_len: payload.len(),
    };
    let mut msg: libc::msghdr = unsafe { mem::zeroed() };
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;
    msg.msg_control = cmsg_buf.as_mut_ptr() as *mut libc::c_void;
    msg.msg_controllen = cmsg_space as _;

    // Populate the single cmsghdr with SOL_SOCKET / SCM_RIGHTS and the fds.
    unsafe {
        let cmsg = libc::CMSG_FIRSTHDR(&msg);
        (*cmsg).cmsg_level = libc::SOL_SOCKET;
        (*cmsg).cmsg_type = libc::SCM_RIGHTS;
        (*cmsg).cmsg_len = libc::CMSG_LEN(fd_bytes as u32) as _;
        let data = libc::CMSG_DATA(cmsg) as *mut libc::c_int;
        for (i, fd) in fds.iter().enumerate() {
            ptr::write_unaligned(data.add(i), *fd);
        }
    }

    let n = unsafe { libc::sendmsg(sock, &msg, libc::MSG_NOSIGNAL) };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Receive one control message, capturing any `SCM_RIGHTS` descriptors.
///
/// Returns the message bytes and the received descriptors (owned — they
/// close on drop if the caller abandons them). A clean peer close surfaces
/// as an empty payload with no descriptors.
pub fn recv_message(sock: RawFd) -> io::Result<(Vec<u8>, Vec<OwnedFd>)> {
    let mut data_buf = vec![0u8; MAX_CTRL_PAYLOAD];
    let fd_bytes = MAX_FDS_PER_MESSAGE * mem::size_of::<libc::c_int>();
    let cmsg_space = unsafe { libc::CMSG_SPACE(fd_bytes as u32) } as usize;
    let mut cmsg_buf = vec![0u8; cmsg_space];

    let mut iov = libc::iovec {
        iov_base: data_buf.as_mut_ptr() as *mut libc::c_void,
        iov_len: data_buf.len(),
    };
    let mut msg: libc::msghdr = unsafe { mem::zeroed() };
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;
    msg.msg_control = cmsg_buf.as_mut_ptr() as *mut libc::c_void;
    msg.msg_controllen = cmsg_buf.len() as _;

    let n = unsafe { libc::recvmsg(sock, &mut msg, 0) };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }
    data_buf.truncate(n as usize);

    // Walk the ancillary data for SCM_RIGHTS arrays.
    let mut fds = Vec::new();
    unsafe {
        let mut cmsg = libc::CMSG_FIRSTHDR(&msg);
        while !cmsg.is_null() {
            if (*cmsg).cmsg_level == libc::SOL_SOCKET && (*cmsg).cmsg_type == libc::SCM_RIGHTS {
                let data = libc::CMSG_DATA(cmsg);
                let count = ((*cmsg).cmsg_len as usize - libc::CMSG_LEN(0) as usize)
                    / mem::size_of::<libc::c_int>();
                for i in 0..count {
                    let fd: libc::c_int = ptr::read_unaligned(
                        data.add(i * mem::size_of::<libc::c_int>()) as *const libc::c_int,
                    );
                    fds.push(OwnedFd::from_raw_fd(fd));
                }
            }
            cmsg = libc::CMSG_NXTHDR(&msg, cmsg);
        }
    }

    Ok((data_buf, fds))
}

/// Plain byte receive for the tag-only commands (`unlisten`, `unlistening`).
pub fn recv_bytes(sock: RawFd, buf: &mut [u8]) -> io::Result<usize> {
    let n = unsafe { libc::read(sock, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(n as usize)
}

/// Plain byte send for the tag-only commands.
pub fn send_bytes(sock: RawFd, data: &[u8]) -> io::Result<()> {
    let n = unsafe {
        libc::send(
            sock,
            data.as_ptr() as *const libc::c_void,
            data.len(),
            libc::MSG_NOSIGNAL,
        )
    };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::os::unix::io::AsRawFd;

    /// Blocking SEQPACKET socketpair for driving the helpers directly.
    fn seqpacket_pair() -> (socket2::Socket, socket2::Socket) {
        socket2::Socket::pair(socket2::Domain::UNIX, socket2::Type::SEQPACKET, None)
            .expect("socketpair")
    }

    fn pipe_pair() -> (OwnedFd, OwnedFd) {
        let mut fds: [libc::c_int; 2] = [0; 2];
        let ret = unsafe { libc::pipe(fds.as_mut_ptr()) };
        assert_eq!(ret, 0, "pipe: {}", io::Error::last_os_error());
        unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) }
    }

    #[test]
    fn test_desc_batch_round_trip_preserves_order() {
        let (tx, rx) = seqpacket_pair();

        // Three pipes; we pass each read end and keep the write ends.
        let pipes: Vec<(OwnedFd, OwnedFd)> = (0..3).map(|_| pipe_pair()).collect();
        let uids = [5i32, 6, 7];
        let raw: Vec<RawFd> = pipes.iter().map(|(r, _)| r.as_raw_fd()).collect();

        send_fds(tx.as_raw_fd(), &uids, &raw).expect("send_fds");

        let (data, fds) = recv_message(rx.as_raw_fd()).expect("recv_message");
        assert_eq!(&data[..4], DESC_TAG);
        let got_uids: Vec<i32> = data[4..]
            .chunks_exact(4)
            .map(|c| i32::from_ne_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        assert_eq!(got_uids, uids);
        assert_eq!(fds.len(), 3);

        // Each received descriptor must pair with the pipe at the same
        // position: write a distinct byte per pipe and read it back.
        for (i, (_, write_end)) in pipes.iter().enumerate() {
            let marker = [b'0' + i as u8];
            let n = unsafe {
                libc::write(
                    write_end.as_raw_fd(),
                    marker.as_ptr() as *const libc::c_void,
                    1,
                )
            };
            assert_eq!(n, 1);
            let mut got = [0u8; 1];
            let n = unsafe {
                libc::read(fds[i].as_raw_fd(), got.as_mut_ptr() as *mut libc::c_void, 1)
            };
            assert_eq!(n, 1);
            assert_eq!(got, marker, "descriptor {i} out of order");
        }
    }

    #[test]
    fn test_received_fd_outlives_sender_copy() {
        let (tx, rx) = seqpacket_pair();
        let (read_end, write_end) = pipe_pair();

        send_fds(tx.as_raw_fd(), &[-1], &[read_end.as_raw_fd()]).expect("send_fds");
        let (_, fds) = recv_message(rx.as_raw_fd()).expect("recv_message");
        assert_eq!(fds.len(), 1);

        // Close the sender's copy; the kernel-duplicated fd must still work.
        drop(read_end);
        let msg = b"independent copy";
        let n = unsafe {
            libc::write(
                write_end.as_raw_fd(),
                msg.as_ptr() as *const libc::c_void,
                msg.len(),
            )
        };
        assert_eq!(n as usize, msg.len());

        let mut got = vec![0u8; msg.len()];
        let n = unsafe {
            libc::read(
                fds[0].as_raw_fd(),
                got.as_mut_ptr() as *mut libc::c_void,
                got.len(),
            )
        };
        assert_eq!(n as usize, msg.len());
        assert_eq!(&got, msg);
    }

    #[test]
    fn test_tag_only_commands_round_trip() {
        let (a, b) = seqpacket_pair();
        send_bytes(a.as_raw_fd(), b"unlisten").expect("send");
        let mut buf = [0u8; 32];
        let n = recv_bytes(b.as_raw_fd(), &mut buf).expect("recv");
        assert_eq!(&buf[..n], b"unlisten");

        send_bytes(b.as_raw_fd(), b"unlistening").expect("send");
        let n = recv_bytes(a.as_raw_fd(), &mut buf).expect("recv");
        assert!(buf[..n].starts_with(b"unlistening"));
    }

    #[test]
    fn test_recv_reports_clean_close_as_empty() {
        let (a, b) = seqpacket_pair();
        drop(a);
        let (data, fds) = recv_message(b.as_raw_fd()).expect("recv_message");
        assert!(data.is_empty());
        assert!(fds.is_empty());
    }
}
