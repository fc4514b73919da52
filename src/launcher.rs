//! Control protocol of the privileged session launcher.
//!
//! The launcher runs as a separate, privileged process and hands device file
//! descriptors to the unprivileged toolkit process over a `SOCK_SEQPACKET`
//! socketpair. Every message starts with a little-endian `u32` opcode. The
//! only request is `Open`: opcode, `i32` open flags, then a NUL-terminated
//! device path. The reply is an errno-style `i32` status with the opened fd
//! attached as `SCM_RIGHTS` ancillary data on success. The launcher also
//! sends unsolicited `Activate`/`Deactivate` notifications around virtual
//! terminal switches.
//!
//! Only character devices on the input or drm majors may be opened; the
//! launcher is not a general file server for a process running with lesser
//! privileges.

use std::ffi::CString;
use std::io::{IoSlice, IoSliceMut};
use std::mem::MaybeUninit;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::io::{AsFd, BorrowedFd, OwnedFd};
use std::path::{Path, PathBuf};

use rustix::fs::{fstat, major, open, FileType, Mode, OFlags};
use rustix::io::Errno;
use rustix::net::{
    recvmsg, sendmsg, socketpair, AddressFamily, RecvAncillaryBuffer, RecvAncillaryMessage,
    RecvFlags, SendAncillaryBuffer, SendAncillaryMessage, SendFlags, SocketFlags, SocketType,
};

pub const INPUT_MAJOR: u32 = 13;
pub const DRM_MAJOR: u32 = 226;

/// Exit code when the launcher itself fails to set the session up.
pub const EXIT_SETUP_FAILURE: i32 = 1;

const OPCODE_OPEN: u32 = 0;
const OPCODE_ACTIVATE: u32 = 1;
const OPCODE_DEACTIVATE: u32 = 2;

const MAX_MESSAGE: usize = 4096;

#[derive(Debug, thiserror::Error)]
pub enum LauncherError {
    #[error("launcher channel i/o failed: {0}")]
    Os(#[from] Errno),
    #[error("malformed launcher message")]
    Malformed,
    #[error("launcher channel closed")]
    Closed,
    /// The launcher refused the request; carries the errno-style status it
    /// sent back.
    #[error("launcher refused to open the device (status {0})")]
    Refused(i32),
}

/// Messages the client side can receive.
#[derive(Debug)]
pub enum LauncherEvent {
    /// The session lost the virtual terminal; release device masters and
    /// stop rendering.
    Deactivate,
    /// The virtual terminal came back.
    Activate,
}

#[derive(Debug, PartialEq, Eq)]
pub enum LauncherRequest {
    Open { flags: i32, path: PathBuf },
}

/// How the supervised compositor process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildStatus {
    Exited(i32),
    Signaled(i32),
}

/// The launcher's own exit code for a finished child: the child's code when
/// it exited, `10 + N` when signal `N` killed it. Distinct from the shell's
/// `128 + N` so the two deaths can be told apart.
pub fn exit_status(status: ChildStatus) -> i32 {
    match status {
        ChildStatus::Exited(code) => code,
        ChildStatus::Signaled(signal) => 10 + signal,
    }
}

pub(crate) fn encode_open(path: &Path, flags: i32) -> Result<Vec<u8>, LauncherError> {
    let path = CString::new(path.as_os_str().as_bytes()).map_err(|_| LauncherError::Malformed)?;
    let bytes = path.as_bytes_with_nul();
    let mut message = Vec::with_capacity(8 + bytes.len());
    message.extend_from_slice(&OPCODE_OPEN.to_le_bytes());
    message.extend_from_slice(&flags.to_le_bytes());
    message.extend_from_slice(bytes);
    Ok(message)
}

pub(crate) fn decode_request(message: &[u8]) -> Result<LauncherRequest, LauncherError> {
    if message.len() < 4 {
        return Err(LauncherError::Malformed);
    }
    let opcode = u32::from_le_bytes([message[0], message[1], message[2], message[3]]);
    match opcode {
        OPCODE_OPEN => {
            if message.len() < 9 {
                return Err(LauncherError::Malformed);
            }
            let flags = i32::from_le_bytes([message[4], message[5], message[6], message[7]]);
            let path = &message[8..];
            // The path must be NUL-terminated and non-empty.
            let nul = path.iter().position(|&b| b == 0).ok_or(LauncherError::Malformed)?;
            if nul == 0 {
                return Err(LauncherError::Malformed);
            }
            let path = PathBuf::from(std::ffi::OsStr::from_bytes(&path[..nul]));
            Ok(LauncherRequest::Open { flags, path })
        }
        _ => Err(LauncherError::Malformed),
    }
}

/// Whether the launcher may hand this already-opened fd to the client.
pub fn device_allowed(fd: BorrowedFd<'_>) -> bool {
    let Ok(stat) = fstat(fd) else {
        return false;
    };
    if !FileType::from_raw_mode(stat.st_mode).is_char_device() {
        return false;
    }
    let dev_major = major(stat.st_rdev);
    dev_major == INPUT_MAJOR || dev_major == DRM_MAJOR
}

fn send_status(sock: BorrowedFd<'_>, status: i32, fd: Option<BorrowedFd<'_>>) -> Result<(), LauncherError> {
    let payload = status.to_le_bytes();
    let fds;
    let mut space = [MaybeUninit::<u8>::uninit(); rustix::cmsg_space!(ScmRights(1))];
    let mut ancillary = SendAncillaryBuffer::new(&mut space);
    if let Some(fd) = fd {
        fds = [fd];
        ancillary.push(SendAncillaryMessage::ScmRights(&fds));
    }
    sendmsg(sock, &[IoSlice::new(&payload)], &mut ancillary, SendFlags::empty())?;
    Ok(())
}

fn send_opcode(sock: BorrowedFd<'_>, opcode: u32) -> Result<(), LauncherError> {
    let payload = opcode.to_le_bytes();
    let mut ancillary = SendAncillaryBuffer::new(&mut []);
    sendmsg(sock, &[IoSlice::new(&payload)], &mut ancillary, SendFlags::empty())?;
    Ok(())
}

/// The privileged end of the channel.
pub struct LauncherSession {
    sock: OwnedFd,
}

impl LauncherSession {
    /// Create the channel; the returned fd is passed to the client process.
    pub fn pair() -> Result<(LauncherSession, OwnedFd), LauncherError> {
        let (server, client) = socketpair(
            AddressFamily::UNIX,
            SocketType::SEQPACKET,
            SocketFlags::CLOEXEC,
            None,
        )?;
        Ok((LauncherSession { sock: server }, client))
    }

    pub fn from_fd(sock: OwnedFd) -> LauncherSession {
        LauncherSession { sock }
    }

    /// Read and answer one request. Returns `Closed` when the client went
    /// away.
    pub fn process(&mut self) -> Result<(), LauncherError> {
        let mut buf = [0u8; MAX_MESSAGE];
        let received = recvmsg(
            &self.sock,
            &mut [IoSliceMut::new(&mut buf)],
            &mut RecvAncillaryBuffer::new(&mut []),
            RecvFlags::empty(),
        )?;
        if received.bytes == 0 {
            return Err(LauncherError::Closed);
        }
        match decode_request(&buf[..received.bytes]) {
            Ok(LauncherRequest::Open { flags, path }) => self.handle_open(flags, &path),
            Err(err) => {
                tracing::warn!(%err, "dropping malformed launcher request");
                send_status(self.sock.as_fd(), -Errno::INVAL.raw_os_error(), None)
            }
        }
    }

    fn handle_open(&mut self, flags: i32, path: &Path) -> Result<(), LauncherError> {
        let flags = OFlags::from_bits_truncate(flags as u32);
        match open(path, flags, Mode::empty()) {
            Ok(fd) if device_allowed(fd.as_fd()) => {
                tracing::debug!(?path, "opened device for client");
                send_status(self.sock.as_fd(), 0, Some(fd.as_fd()))
            }
            Ok(_) => {
                tracing::warn!(?path, "refusing non-input, non-drm device");
                send_status(self.sock.as_fd(), -Errno::PERM.raw_os_error(), None)
            }
            Err(errno) => {
                tracing::warn!(?path, %errno, "failed to open device");
                send_status(self.sock.as_fd(), -errno.raw_os_error(), None)
            }
        }
    }

    /// Tell the client the session lost its virtual terminal.
    pub fn notify_deactivate(&mut self) -> Result<(), LauncherError> {
        send_opcode(self.sock.as_fd(), OPCODE_DEACTIVATE)
    }

    /// Tell the client the virtual terminal came back.
    pub fn notify_activate(&mut self) -> Result<(), LauncherError> {
        send_opcode(self.sock.as_fd(), OPCODE_ACTIVATE)
    }
}

/// The unprivileged end of the channel.
pub struct LauncherClient {
    sock: OwnedFd,
}

impl LauncherClient {
    pub fn from_fd(sock: OwnedFd) -> LauncherClient {
        LauncherClient { sock }
    }

    pub fn as_fd(&self) -> BorrowedFd<'_> {
        self.sock.as_fd()
    }

    /// Ask the launcher to open a device. Blocks until the reply arrives.
    pub fn open_device(&mut self, path: &Path, flags: i32) -> Result<OwnedFd, LauncherError> {
        let message = encode_open(path, flags)?;
        sendmsg(
            &self.sock,
            &[IoSlice::new(&message)],
            &mut SendAncillaryBuffer::new(&mut []),
            SendFlags::empty(),
        )?;

        let mut buf = [0u8; 4];
        let mut space = [MaybeUninit::<u8>::uninit(); rustix::cmsg_space!(ScmRights(1))];
        let mut ancillary = RecvAncillaryBuffer::new(&mut space);
        let received = recvmsg(
            &self.sock,
            &mut [IoSliceMut::new(&mut buf)],
            &mut ancillary,
            RecvFlags::empty(),
        )?;
        if received.bytes == 0 {
            return Err(LauncherError::Closed);
        }
        if received.bytes < 4 {
            return Err(LauncherError::Malformed);
        }
        let status = i32::from_le_bytes(buf);
        if status < 0 {
            return Err(LauncherError::Refused(status));
        }
        for message in ancillary.drain() {
            if let RecvAncillaryMessage::ScmRights(mut fds) = message {
                if let Some(fd) = fds.next() {
                    return Ok(fd);
                }
            }
        }
        Err(LauncherError::Malformed)
    }

    /// Read one pending notification.
    pub fn read_event(&mut self) -> Result<LauncherEvent, LauncherError> {
        let mut buf = [0u8; 4];
        let received = recvmsg(
            &self.sock,
            &mut [IoSliceMut::new(&mut buf)],
            &mut RecvAncillaryBuffer::new(&mut []),
            RecvFlags::empty(),
        )?;
        if received.bytes == 0 {
            return Err(LauncherError::Closed);
        }
        if received.bytes < 4 {
            return Err(LauncherError::Malformed);
        }
        match u32::from_le_bytes(buf) {
            OPCODE_ACTIVATE => Ok(LauncherEvent::Activate),
            OPCODE_DEACTIVATE => Ok(LauncherEvent::Deactivate),
            _ => Err(LauncherError::Malformed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rustix::fs::{memfd_create, MemfdFlags};
    use rustix::io::write;

    #[test]
    fn open_request_round_trips_through_the_framing() {
        let message = encode_open(Path::new("/dev/input/event3"), 2).unwrap();
        assert_eq!(&message[..4], &0u32.to_le_bytes());
        assert_eq!(*message.last().unwrap(), 0);
        let request = decode_request(&message).unwrap();
        assert_eq!(
            request,
            LauncherRequest::Open {
                flags: 2,
                path: PathBuf::from("/dev/input/event3"),
            }
        );
    }

    #[test]
    fn truncated_and_unknown_messages_are_rejected() {
        assert!(matches!(decode_request(&[0, 0]), Err(LauncherError::Malformed)));
        assert!(matches!(
            decode_request(&9u32.to_le_bytes()),
            Err(LauncherError::Malformed)
        ));
        // Open with an empty path.
        let mut message = Vec::new();
        message.extend_from_slice(&0u32.to_le_bytes());
        message.extend_from_slice(&0i32.to_le_bytes());
        message.push(0);
        assert!(matches!(decode_request(&message), Err(LauncherError::Malformed)));
    }

    #[test]
    fn regular_files_never_pass_the_device_gate() {
        let fd = memfd_create("launcher-gate", MemfdFlags::CLOEXEC).unwrap();
        assert!(!device_allowed(fd.as_fd()));
    }

    #[test]
    fn open_of_a_plain_file_is_refused() {
        let (mut session, client) = LauncherSession::pair().unwrap();
        let mut client = LauncherClient::from_fd(client);
        let dir = std::env::temp_dir();
        let path = dir.join("launcher-refused-test");
        std::fs::write(&path, b"not a device").unwrap();

        // Queue the request, serve it, then read the reply; seqpacket
        // preserves message boundaries so this works single threaded.
        let message = encode_open(&path, 0).unwrap();
        sendmsg(
            client.as_fd(),
            &[IoSlice::new(&message)],
            &mut SendAncillaryBuffer::new(&mut []),
            SendFlags::empty(),
        )
        .unwrap();
        session.process().unwrap();
        let err = client.recv_reply_for_tests();
        std::fs::remove_file(&path).ok();
        match err {
            Err(LauncherError::Refused(status)) => {
                assert_eq!(status, -Errno::PERM.raw_os_error());
            }
            other => panic!("expected a refusal, got {other:?}"),
        }
    }

    #[test]
    fn open_of_a_missing_path_reports_the_errno() {
        let (mut session, client) = LauncherSession::pair().unwrap();
        let mut client = LauncherClient::from_fd(client);
        let message = encode_open(Path::new("/nonexistent/device"), 0).unwrap();
        sendmsg(
            client.as_fd(),
            &[IoSlice::new(&message)],
            &mut SendAncillaryBuffer::new(&mut []),
            SendFlags::empty(),
        )
        .unwrap();
        session.process().unwrap();
        match client.recv_reply_for_tests() {
            Err(LauncherError::Refused(status)) => {
                assert_eq!(status, -Errno::NOENT.raw_os_error());
            }
            other => panic!("expected a refusal, got {other:?}"),
        }
    }

    #[test]
    fn a_successful_reply_carries_the_fd() {
        // Exercise the ancillary-data plumbing with a memfd standing in for
        // a device the gate would allow.
        let (server, client) = socketpair(
            AddressFamily::UNIX,
            SocketType::SEQPACKET,
            SocketFlags::CLOEXEC,
            None,
        )
        .unwrap();
        let mut client = LauncherClient::from_fd(client);
        let payload = memfd_create("launcher-payload", MemfdFlags::CLOEXEC).unwrap();
        write(&payload, b"marker").unwrap();
        send_status(server.as_fd(), 0, Some(payload.as_fd())).unwrap();

        let received = client.recv_reply_for_tests().unwrap();
        let mut contents = Vec::new();
        let mut file = std::fs::File::from(received);
        use std::io::{Read, Seek};
        file.rewind().unwrap();
        file.read_to_end(&mut contents).unwrap();
        assert_eq!(contents, b"marker");
    }

    #[test]
    fn notifications_round_trip() {
        let (mut session, client) = LauncherSession::pair().unwrap();
        let mut client = LauncherClient::from_fd(client);
        session.notify_deactivate().unwrap();
        session.notify_activate().unwrap();
        assert!(matches!(client.read_event(), Ok(LauncherEvent::Deactivate)));
        assert!(matches!(client.read_event(), Ok(LauncherEvent::Activate)));
    }

    #[test]
    fn exit_codes_distinguish_signals_from_plain_exits() {
        assert_eq!(exit_status(ChildStatus::Exited(0)), 0);
        assert_eq!(exit_status(ChildStatus::Exited(3)), 3);
        assert_eq!(exit_status(ChildStatus::Signaled(11)), 21);
        assert_eq!(EXIT_SETUP_FAILURE, 1);
    }

    impl LauncherClient {
        /// The reply-reading half of `open_device`, for tests that queue the
        /// request manually.
        fn recv_reply_for_tests(&mut self) -> Result<OwnedFd, LauncherError> {
            let mut buf = [0u8; 4];
            let mut space = [MaybeUninit::<u8>::uninit(); rustix::cmsg_space!(ScmRights(1))];
            let mut ancillary = RecvAncillaryBuffer::new(&mut space);
            let received = recvmsg(
                &self.sock,
                &mut [IoSliceMut::new(&mut buf)],
                &mut ancillary,
                RecvFlags::empty(),
            )?;
            if received.bytes < 4 {
                return Err(LauncherError::Malformed);
            }
            let status = i32::from_le_bytes(buf);
            if status < 0 {
                return Err(LauncherError::Refused(status));
            }
            for message in ancillary.drain() {
                if let RecvAncillaryMessage::ScmRights(mut fds) = message {
                    if let Some(fd) = fds.next() {
                        return Ok(fd);
                    }
                }
            }
            Err(LauncherError::Malformed)
        }
    }
}
