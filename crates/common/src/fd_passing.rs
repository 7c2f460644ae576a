//! Framed message transport over Unix stream sockets
//!
//! Frames use the protocol crate's length-prefixed layout. A descriptor can
//! be attached to a frame as `SCM_RIGHTS` ancillary data; it is sent with the
//! first chunk of the frame and collected on the receiving side while the
//! frame is read back.
//!
//! All functions take `&UnixStream`, so one task can read while another
//! writes on the same socket.

use crate::{Error, Result};
use nix::sys::socket::{ControlMessage, ControlMessageOwned, MsgFlags, recvmsg, sendmsg};
use protocol::{FRAME_HEADER_LEN, Message, decode_message, encode_framed, frame_length};
use std::io::{self, IoSlice, IoSliceMut};
use std::os::fd::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use tokio::io::Interest;
use tokio::net::UnixStream;
use tracing::{trace, warn};

/// Most descriptors accepted by a single receive call
const MAX_FDS_PER_RECV: usize = 4;

/// A message together with the descriptors that arrived with its frame
#[derive(Debug)]
pub struct ReceivedMessage {
    pub message: Message,
    pub fds: Vec<OwnedFd>,
}

impl ReceivedMessage {
    /// Split off the first descriptor; any extras are closed
    pub fn into_single_fd(self) -> (Message, Option<OwnedFd>) {
        let mut fds = self.fds.into_iter();
        let first = fds.next();
        let extra = fds.count();
        if extra > 0 {
            warn!(extra, "closing unexpected extra descriptors");
        }
        (self.message, first)
    }
}

/// Send a framed message
pub async fn send_message(stream: &UnixStream, message: &Message) -> Result<()> {
    send_frame(stream, message, None).await
}

/// Send a framed message carrying a descriptor
///
/// The kernel holds its own reference to the descriptor while it is in
/// flight, so the caller may close `fd` as soon as this returns.
pub async fn send_message_with_fd(
    stream: &UnixStream,
    message: &Message,
    fd: BorrowedFd<'_>,
) -> Result<()> {
    send_frame(stream, message, Some(fd)).await
}

async fn send_frame(stream: &UnixStream, message: &Message, fd: Option<BorrowedFd<'_>>) -> Result<()> {
    let frame = encode_framed(message)?;
    let socket = stream.as_raw_fd();
    let flags = MsgFlags::MSG_NOSIGNAL;
    let mut offset = 0;

    while offset < frame.len() {
        let attach = if offset == 0 {
            fd.map(|fd| fd.as_raw_fd())
        } else {
            None
        };

        let sent = stream
            .async_io(Interest::WRITABLE, || {
                let iov = [IoSlice::new(&frame[offset..])];
                let result = match attach {
                    Some(raw) => {
                        let fds = [raw];
                        let cmsgs = [ControlMessage::ScmRights(&fds)];
                        sendmsg::<()>(socket, &iov, &cmsgs, flags, None)
                    }
                    None => sendmsg::<()>(socket, &iov, &[], flags, None),
                };
                result.map_err(io::Error::from)
            })
            .await?;

        if sent == 0 {
            return Err(Error::Io(io::Error::new(
                io::ErrorKind::WriteZero,
                "socket accepted no bytes mid-frame",
            )));
        }
        offset += sent;
    }

    trace!(
        kind = message.payload.kind(),
        bytes = frame.len(),
        with_fd = fd.is_some(),
        "sent frame"
    );
    Ok(())
}

/// Receive one framed message and any descriptors sent with it
///
/// Returns `Ok(None)` when the peer closed the connection cleanly between
/// frames.
pub async fn recv_message(stream: &UnixStream) -> Result<Option<ReceivedMessage>> {
    let mut fds = Vec::new();

    let mut header = [0u8; FRAME_HEADER_LEN];
    if !recv_exact(stream, &mut header, &mut fds).await? {
        return Ok(None);
    }
    let length = frame_length(header)?;

    let mut body = vec![0u8; length];
    if !recv_exact(stream, &mut body, &mut fds).await? {
        return Err(Error::ConnectionClosed);
    }

    let message = decode_message(&body)?;
    trace!(
        kind = message.payload.kind(),
        fds = fds.len(),
        "received frame"
    );
    Ok(Some(ReceivedMessage { message, fds }))
}

/// Fill `buf` completely, collecting descriptors along the way
///
/// Returns `false` if the peer closed before the first byte.
async fn recv_exact(stream: &UnixStream, buf: &mut [u8], fds: &mut Vec<OwnedFd>) -> Result<bool> {
    let socket = stream.as_raw_fd();
    let mut filled = 0;

    while filled < buf.len() {
        let (read, received) = stream
            .async_io(Interest::READABLE, || {
                let mut iov = [IoSliceMut::new(&mut buf[filled..])];
                let mut cmsg_space = nix::cmsg_space!([RawFd; MAX_FDS_PER_RECV]);
                let msg = recvmsg::<()>(
                    socket,
                    &mut iov,
                    Some(&mut cmsg_space),
                    MsgFlags::MSG_CMSG_CLOEXEC,
                )
                .map_err(io::Error::from)?;

                let mut received = Vec::new();
                for cmsg in msg.cmsgs().map_err(io::Error::from)? {
                    if let ControlMessageOwned::ScmRights(raw_fds) = cmsg {
                        for raw in raw_fds {
                            // SAFETY: the kernel installed this descriptor in our table and
                            // nothing else refers to it yet.
                            received.push(unsafe { OwnedFd::from_raw_fd(raw) });
                        }
                    }
                }
                Ok((msg.bytes, received))
            })
            .await?;

        fds.extend(received);

        if read == 0 {
            if filled == 0 {
                return Ok(false);
            }
            return Err(Error::ConnectionClosed);
        }
        filled += read;
    }

    Ok(true)
}
