//! Frames exchanged between seeds and peers.
//!
//! Every frame is a 4-byte big-endian length prefix followed by a MessagePack-encoded [`WireMessage`].
//! A clean end-of-stream between two frames is reported as `Ok(None)`; end-of-stream in the middle of a frame is
//! an error.

use std::io;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::{
    address::Address,
    error::{MembershipError, Result},
    gossip::GossipMessage,
    liveness::DeadNodeReport,
};

/// Length of the frame length prefix.
pub const LENGTH_PREFIX_LEN: usize = 4;

/// Default upper bound on a frame body.
pub const DEFAULT_MAX_FRAME_LEN: usize = 64 * 1024;

/// Every message of the registration, dead-node, connection, liveness and gossip protocols.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum WireMessage {
    /// Peer to seed: add or refresh my record.
    Register {
        /// The registering peer's listen address.
        address: Address,
    },
    /// Seed to peer: the directory, excluding the registering peer.
    Snapshot {
        /// Known peer addresses.
        peers: Vec<Address>,
    },
    /// Peer to seed: a monitored peer has been declared dead. No reply.
    DeadNode(DeadNodeReport),
    /// Peer to peer: request a long-lived link.
    Connect {
        /// The dialing peer's listen address.
        address: Address,
    },
    /// Reply to [`Connect`](WireMessage::Connect): link established.
    ConnectAccepted,
    /// Reply to [`Connect`](WireMessage::Connect): at capacity or already linked.
    ConnectRejected,
    /// Liveness probe request.
    Ping {
        /// Echoed back in the matching pong.
        nonce: u64,
    },
    /// Liveness probe response.
    Pong {
        /// Nonce of the ping being answered.
        nonce: u64,
    },
    /// A gossip message. No reply.
    Gossip(GossipMessage),
}

impl WireMessage {
    /// Short name of the message kind, for logs and errors.
    pub fn kind(&self) -> &'static str {
        match self {
            WireMessage::Register { .. } => "Register",
            WireMessage::Snapshot { .. } => "Snapshot",
            WireMessage::DeadNode(_) => "DeadNode",
            WireMessage::Connect { .. } => "Connect",
            WireMessage::ConnectAccepted => "ConnectAccepted",
            WireMessage::ConnectRejected => "ConnectRejected",
            WireMessage::Ping { .. } => "Ping",
            WireMessage::Pong { .. } => "Pong",
            WireMessage::Gossip(_) => "Gossip",
        }
    }

    /// Builds the error for receiving this message where `expected` was required.
    pub fn unexpected(&self, expected: &'static str) -> MembershipError {
        MembershipError::UnexpectedMessage {
            expected,
            got: self.kind(),
        }
    }
}

/// Encodes a message into a complete frame, length prefix included.
pub fn encode_frame(msg: &WireMessage) -> Result<Vec<u8>> {
    let body = rmp_serde::to_vec_named(msg)?;
    let len = u32::try_from(body.len()).map_err(|_| MembershipError::FrameTooLarge {
        size: body.len(),
        max: u32::MAX as usize,
    })?;

    let mut frame = Vec::with_capacity(LENGTH_PREFIX_LEN + body.len());
    frame.extend_from_slice(&len.to_be_bytes());
    frame.extend_from_slice(&body);
    Ok(frame)
}

/// Decodes a frame body (without its length prefix).
pub fn decode_body(body: &[u8]) -> Result<WireMessage> {
    Ok(rmp_serde::from_slice(body)?)
}

/// Writes one frame and flushes it.
pub async fn write_frame<W>(writer: &mut W, msg: &WireMessage) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let frame = encode_frame(msg)?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

/// Reads one frame, or `None` on a clean end-of-stream before the first prefix byte.
pub async fn read_frame<R>(reader: &mut R, max_frame_len: usize) -> Result<Option<WireMessage>>
where
    R: AsyncRead + Unpin,
{
    let mut prefix = [0u8; LENGTH_PREFIX_LEN];
    let first = reader.read(&mut prefix[..1]).await?;
    if first == 0 {
        return Ok(None);
    }
    reader.read_exact(&mut prefix[1..]).await?;

    let len = u32::from_be_bytes(prefix) as usize;
    if len > max_frame_len {
        return Err(MembershipError::FrameTooLarge {
            size: len,
            max: max_frame_len,
        });
    }

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await.map_err(|err| {
        if err.kind() == io::ErrorKind::UnexpectedEof {
            MembershipError::ConnectionClosed
        } else {
            MembershipError::Network(err)
        }
    })?;

    decode_body(&body).map(Some)
}
