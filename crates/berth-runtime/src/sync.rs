//! Parent/companion synchronization channel.
//!
//! The channel is one end of a `socketpair(2)`. Every message is a frame:
//! a big-endian `u32` length followed by that many bytes of JSON,
//! `{"type": ..., "arg": ..., "has_fd": ...}`. When `has_fd` is set, the
//! frame is followed by a single byte carrying one descriptor as
//! `SCM_RIGHTS` ancillary data.
//!
//! The protocol is strictly half-duplex request/acknowledge:
//!
//! | companion sends | parent answers |
//! |-----------------|----------------|
//! | `hooks`         | `resume`       |
//! | `ready`         | `run`          |
//! | `seccomp` + fd  | `seccompDone`  |
//!
//! `error` is terminal. End-of-file at a frame boundary is reported as
//! [`SyncError::Closed`], never as an error message.

use std::fmt;
use std::io::{Read, Write};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixStream;
use std::path::Path;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::SyncError;

/// Largest frame either side accepts.
const MAX_FRAME: u32 = 16 * 1024 * 1024;

/// Handshake message types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SyncType {
    /// Companion failure, with `{"message": ...}`.
    Error,
    /// Companion finished setup and waits for `Run`.
    Ready,
    /// Parent lets the companion proceed past `Ready`.
    Run,
    /// Companion asks the parent to run prestart hooks.
    Hooks,
    /// Parent finished the hooks.
    Resume,
    /// Companion hands over its seccomp notify descriptor.
    Seccomp,
    /// Parent finished with the seccomp descriptor.
    SeccompDone,
}

impl SyncType {
    const fn takes_arg(self) -> bool {
        matches!(self, Self::Error)
    }

    const fn takes_fd(self) -> bool {
        matches!(self, Self::Seccomp)
    }
}

impl fmt::Display for SyncType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Error => "error",
            Self::Ready => "ready",
            Self::Run => "run",
            Self::Hooks => "hooks",
            Self::Resume => "resume",
            Self::Seccomp => "seccomp",
            Self::SeccompDone => "seccompDone",
        };
        f.write_str(name)
    }
}

/// A received handshake message.
#[derive(Debug)]
pub struct SyncMessage {
    /// Message type.
    pub ty: SyncType,
    /// Optional JSON argument.
    pub arg: Option<Value>,
    /// Optional attached descriptor.
    pub file: Option<OwnedFd>,
}

impl SyncMessage {
    /// The message text of an `Error` frame.
    #[must_use]
    pub fn error_message(&self) -> String {
        self.arg
            .as_ref()
            .and_then(|a| a.get("message"))
            .and_then(Value::as_str)
            .unwrap_or("companion reported an unspecified error")
            .to_string()
    }
}

#[derive(Serialize, Deserialize)]
struct Envelope<T> {
    #[serde(rename = "type")]
    ty: T,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    arg: Option<Value>,
    #[serde(default)]
    has_fd: bool,
}

/// One end of the synchronization socket pair.
#[derive(Debug)]
pub struct SyncChannel {
    stream: UnixStream,
}

impl SyncChannel {
    /// Creates a connected pair of channel ends.
    ///
    /// # Errors
    ///
    /// Returns an error if `socketpair(2)` fails.
    pub fn pair() -> Result<(Self, Self), SyncError> {
        let (a, b) = UnixStream::pair()?;
        Ok((Self { stream: a }, Self { stream: b }))
    }

    /// Wraps an inherited descriptor.
    #[must_use]
    pub fn from_fd(fd: OwnedFd) -> Self {
        Self {
            stream: UnixStream::from(fd),
        }
    }

    /// Sends a message without argument or descriptor.
    ///
    /// # Errors
    ///
    /// Returns an error if the socket write fails.
    pub fn send(&mut self, ty: SyncType) -> Result<(), SyncError> {
        self.write_envelope(&Envelope { ty, arg: None, has_fd: false }, None)
    }

    /// Sends a message with an attached descriptor.
    ///
    /// # Errors
    ///
    /// Returns an error if the socket write fails.
    pub fn send_with_fd(&mut self, ty: SyncType, fd: BorrowedFd<'_>) -> Result<(), SyncError> {
        self.write_envelope(&Envelope { ty, arg: None, has_fd: true }, Some(fd))
    }

    /// Sends a terminal `Error` carrying `message`.
    ///
    /// # Errors
    ///
    /// Returns an error if the socket write fails.
    pub fn send_error(&mut self, message: &str) -> Result<(), SyncError> {
        let arg = serde_json::json!({ "message": message });
        self.write_envelope(
            &Envelope {
                ty: SyncType::Error,
                arg: Some(arg),
                has_fd: false,
            },
            None,
        )
    }

    /// Receives the next handshake message, whatever its type.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Closed`] at end-of-file, or a decoding error for
    /// malformed frames and misplaced arguments or descriptors.
    pub fn recv(&mut self) -> Result<SyncMessage, SyncError> {
        let (envelope, file) = self.read_envelope::<SyncType>()?;
        let ty = envelope.ty;
        if envelope.arg.is_some() && !ty.takes_arg() {
            return Err(SyncError::UnexpectedArgument(ty.to_string()));
        }
        if file.is_some() && !ty.takes_fd() {
            return Err(SyncError::UnexpectedFile(ty.to_string()));
        }
        Ok(SyncMessage {
            ty,
            arg: envelope.arg,
            file,
        })
    }

    /// Receives a message and requires it to be `expected`. An `Error`
    /// frame is turned into [`SyncError::Remote`].
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Unexpected`] for any other type.
    pub fn expect(&mut self, expected: SyncType) -> Result<SyncMessage, SyncError> {
        let msg = self.recv()?;
        if msg.ty == expected {
            return Ok(msg);
        }
        if msg.ty == SyncType::Error {
            return Err(SyncError::Remote(msg.error_message()));
        }
        Err(SyncError::Unexpected {
            expected: expected.to_string(),
            got: msg.ty.to_string(),
        })
    }

    /// Sends `request` and waits for `reply`.
    ///
    /// # Errors
    ///
    /// Returns the send error or the [`Self::expect`] error.
    pub fn handshake(&mut self, request: SyncType, reply: SyncType) -> Result<(), SyncError> {
        self.send(request)?;
        let _ = self.expect(reply)?;
        Ok(())
    }

    /// Sends an envelope of a different message family (used by the
    /// bootstrap stage), sharing this channel's framing.
    pub(crate) fn send_typed<T: Serialize>(&mut self, ty: T, arg: Option<Value>) -> Result<(), SyncError> {
        self.write_envelope(&Envelope { ty, arg, has_fd: false }, None)
    }

    /// Receives an envelope of a different message family.
    pub(crate) fn recv_typed<T: DeserializeOwned>(&mut self) -> Result<(T, Option<Value>), SyncError> {
        let (envelope, file) = self.read_envelope::<T>()?;
        if file.is_some() {
            return Err(SyncError::UnexpectedFile("bootstrap".into()));
        }
        Ok((envelope.ty, envelope.arg))
    }

    /// Sends `value` as a bare JSON frame.
    pub(crate) fn send_json<T: Serialize>(&mut self, value: &T) -> Result<(), SyncError> {
        let payload = serde_json::to_vec(value).map_err(|e| SyncError::Malformed(e.to_string()))?;
        self.write_frame(&payload)
    }

    /// Receives a bare JSON frame.
    pub(crate) fn recv_json<T: DeserializeOwned>(&mut self) -> Result<T, SyncError> {
        let payload = self.read_frame()?;
        serde_json::from_slice(&payload).map_err(|e| SyncError::Malformed(e.to_string()))
    }

    /// Writes one length-prefixed frame.
    pub(crate) fn write_frame(&mut self, payload: &[u8]) -> Result<(), SyncError> {
        let len = u32::try_from(payload.len())
            .ok()
            .filter(|len| *len <= MAX_FRAME)
            .ok_or_else(|| SyncError::Malformed(format!("frame of {} bytes", payload.len())))?;
        self.stream.write_all(&len.to_be_bytes())?;
        self.stream.write_all(payload)?;
        Ok(())
    }

    /// Reads one length-prefixed frame. End-of-file before the first byte
    /// of the length is a clean close; anywhere else it is a truncation.
    pub(crate) fn read_frame(&mut self) -> Result<Vec<u8>, SyncError> {
        let mut header = [0u8; 4];
        let mut filled = 0;
        while filled < header.len() {
            match self.stream.read(&mut header[filled..]) {
                Ok(0) if filled == 0 => return Err(SyncError::Closed),
                Ok(0) => return Err(SyncError::Malformed("truncated frame header".into())),
                Ok(n) => filled += n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e.into()),
            }
        }
        let len = u32::from_be_bytes(header);
        if len > MAX_FRAME {
            return Err(SyncError::Malformed(format!("frame length {len} exceeds limit")));
        }
        let mut payload = vec![0u8; len as usize];
        self.stream.read_exact(&mut payload).map_err(|e| {
            if e.kind() == std::io::ErrorKind::UnexpectedEof {
                SyncError::Malformed("truncated frame body".into())
            } else {
                SyncError::Io(e)
            }
        })?;
        Ok(payload)
    }

    fn write_envelope<T: Serialize>(
        &mut self,
        envelope: &Envelope<T>,
        fd: Option<BorrowedFd<'_>>,
    ) -> Result<(), SyncError> {
        let payload =
            serde_json::to_vec(envelope).map_err(|e| SyncError::Malformed(e.to_string()))?;
        self.write_frame(&payload)?;
        if let Some(fd) = fd {
            send_fd(self.stream.as_raw_fd(), fd.as_raw_fd())?;
        }
        Ok(())
    }

    fn read_envelope<T: DeserializeOwned>(
        &mut self,
    ) -> Result<(Envelope<T>, Option<OwnedFd>), SyncError> {
        let payload = self.read_frame()?;
        let envelope: Envelope<T> =
            serde_json::from_slice(&payload).map_err(|e| SyncError::Malformed(e.to_string()))?;
        let file = if envelope.has_fd {
            Some(recv_fd(self.stream.as_raw_fd())?)
        } else {
            None
        };
        Ok((envelope, file))
    }
}

impl AsFd for SyncChannel {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.stream.as_fd()
    }
}

impl From<SyncChannel> for OwnedFd {
    fn from(channel: SyncChannel) -> Self {
        channel.stream.into()
    }
}

/// Passes `fd` to the agent listening on the Unix socket at `path`, as
/// `SCM_RIGHTS` data on a one-byte message.
///
/// # Errors
///
/// Returns [`SyncError::Io`] if the socket cannot be reached or the
/// descriptor cannot be sent.
pub fn send_to_listener(path: &Path, fd: BorrowedFd<'_>) -> Result<(), SyncError> {
    let stream = UnixStream::connect(path)?;
    send_fd(stream.as_raw_fd(), fd.as_raw_fd())
}

fn fd_cmsg_space() -> usize {
    // SAFETY: CMSG_SPACE only performs arithmetic.
    unsafe { libc::CMSG_SPACE(std::mem::size_of::<RawFd>() as u32) as usize }
}

fn send_fd(sock: RawFd, fd: RawFd) -> Result<(), SyncError> {
    let mut byte = [0u8; 1];
    let mut iov = libc::iovec {
        iov_base: byte.as_mut_ptr().cast(),
        iov_len: byte.len(),
    };
    let space = fd_cmsg_space();
    // u64 backing keeps the control buffer aligned for cmsghdr.
    let mut control = vec![0u64; space.div_ceil(8)];

    // SAFETY: msghdr is plain data; every pointer set below outlives the
    // sendmsg call, and the control buffer holds exactly one cmsg.
    unsafe {
        let mut msg: libc::msghdr = std::mem::zeroed();
        msg.msg_iov = &raw mut iov;
        msg.msg_iovlen = 1;
        msg.msg_control = control.as_mut_ptr().cast();
        msg.msg_controllen = space as _;

        let cmsg = libc::CMSG_FIRSTHDR(&raw const msg);
        (*cmsg).cmsg_level = libc::SOL_SOCKET;
        (*cmsg).cmsg_type = libc::SCM_RIGHTS;
        (*cmsg).cmsg_len = libc::CMSG_LEN(std::mem::size_of::<RawFd>() as u32) as _;
        std::ptr::write_unaligned(libc::CMSG_DATA(cmsg).cast::<RawFd>(), fd);

        if libc::sendmsg(sock, &raw const msg, libc::MSG_NOSIGNAL) < 0 {
            return Err(SyncError::Io(std::io::Error::last_os_error()));
        }
    }
    Ok(())
}

pub(crate) fn recv_fd(sock: RawFd) -> Result<OwnedFd, SyncError> {
    let mut byte = [0u8; 1];
    let mut iov = libc::iovec {
        iov_base: byte.as_mut_ptr().cast(),
        iov_len: byte.len(),
    };
    let space = fd_cmsg_space();
    let mut control = vec![0u64; space.div_ceil(8)];

    // SAFETY: as in `send_fd`; the received descriptor is owned by us once
    // recvmsg returns it.
    unsafe {
        let mut msg: libc::msghdr = std::mem::zeroed();
        msg.msg_iov = &raw mut iov;
        msg.msg_iovlen = 1;
        msg.msg_control = control.as_mut_ptr().cast();
        msg.msg_controllen = space as _;

        let n = libc::recvmsg(sock, &raw mut msg, libc::MSG_CMSG_CLOEXEC);
        if n < 0 {
            return Err(SyncError::Io(std::io::Error::last_os_error()));
        }
        if n == 0 {
            return Err(SyncError::Malformed("channel closed before descriptor".into()));
        }
        if msg.msg_flags & libc::MSG_CTRUNC != 0 {
            return Err(SyncError::Malformed("descriptor control data truncated".into()));
        }
        let cmsg = libc::CMSG_FIRSTHDR(&raw const msg);
        if cmsg.is_null()
            || (*cmsg).cmsg_level != libc::SOL_SOCKET
            || (*cmsg).cmsg_type != libc::SCM_RIGHTS
        {
            return Err(SyncError::Malformed("frame announced a descriptor but none arrived".into()));
        }
        let fd = std::ptr::read_unaligned(libc::CMSG_DATA(cmsg).cast::<RawFd>());
        Ok(OwnedFd::from_raw_fd(fd))
    }
}
