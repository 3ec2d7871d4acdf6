//! One TCP socket to one box's control port, speaking the binary
//! remote-control protocol.
//!
//! The box talks first: it streams short preamble chunks and expects each
//! one echoed back (the first 12 bytes of the opening chunk, then a single
//! byte per chunk) until it sends a block of 24 or more bytes, at which
//! point the channel accepts commands. Each key press is a fixed 8-byte
//! key-down frame followed by its key-up twin; the box acknowledges by
//! writing bytes back. These byte layouts are validated strictly by the
//! firmware and must not change.
//!
//! The protocol has no sequence numbers, so correctness depends on one
//! outstanding command at a time per channel. The owning session enforces
//! that; this layer never retries anything.

use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

use super::{DeviceEndpoint, DeviceError};

pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(3);
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(3);
pub const ACK_TIMEOUT: Duration = Duration::from_secs(3);

/// A preamble chunk of this size or larger means the box is ready.
const READY_BLOCK_LEN: usize = 24;
/// Echo length for the opening banner chunk; later chunks echo one byte.
const BANNER_ECHO_LEN: usize = 12;

/// Key-down and key-up frames for one wire code.
fn command_frames(code: u8) -> ([u8; 8], [u8; 8]) {
    let hi = 0xE0 + (code >> 4);
    let lo = code & 0x0F;
    let down = [0x04, 0x01, 0x00, 0x00, 0x00, 0x00, hi, lo];
    let mut up = down;
    up[1] = 0x00;
    (down, up)
}

#[derive(Debug)]
pub struct RemoteChannel {
    stream: TcpStream,
}

impl RemoteChannel {
    /// Connect and run the preamble exchange.
    pub async fn open(endpoint: &DeviceEndpoint) -> Result<Self, DeviceError> {
        let addr = endpoint.control_addr();
        let stream = match timeout(CONNECT_TIMEOUT, TcpStream::connect(&addr)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                return Err(DeviceError::HandshakeFailed(format!("connect {addr}: {e}")));
            }
            Err(_) => return Err(DeviceError::Timeout(CONNECT_TIMEOUT)),
        };

        let mut channel = Self { stream };
        channel.handshake().await?;
        debug!("control channel to {} ready", addr);
        Ok(channel)
    }

    async fn handshake(&mut self) -> Result<(), DeviceError> {
        let mut buf = [0u8; 64];
        let mut echo_len = BANNER_ECHO_LEN;
        loop {
            let n = match timeout(HANDSHAKE_TIMEOUT, self.stream.read(&mut buf)).await {
                Ok(Ok(n)) => n,
                Ok(Err(e)) => return Err(DeviceError::HandshakeFailed(e.to_string())),
                Err(_) => {
                    return Err(DeviceError::HandshakeFailed(format!(
                        "no preamble within {HANDSHAKE_TIMEOUT:?}"
                    )));
                }
            };
            if n == 0 {
                return Err(DeviceError::HandshakeFailed(
                    "connection closed during preamble".into(),
                ));
            }
            if n >= READY_BLOCK_LEN {
                return Ok(());
            }
            let reply = echo_len.min(n);
            self.stream
                .write_all(&buf[..reply])
                .await
                .map_err(|e| DeviceError::HandshakeFailed(e.to_string()))?;
            echo_len = 1;
        }
    }

    /// Write one command and wait for the box's acknowledgement. Any
    /// write/read failure means the channel is dead; the caller decides
    /// whether to reconnect.
    pub async fn send(&mut self, code: u8) -> Result<(), DeviceError> {
        let (down, up) = command_frames(code);
        self.stream
            .write_all(&down)
            .await
            .map_err(|e| DeviceError::ChannelBroken(e.to_string()))?;
        self.stream
            .write_all(&up)
            .await
            .map_err(|e| DeviceError::ChannelBroken(e.to_string()))?;

        let mut ack = [0u8; 32];
        let n = match timeout(ACK_TIMEOUT, self.stream.read(&mut ack)).await {
            Ok(Ok(n)) => n,
            Ok(Err(e)) => return Err(DeviceError::ChannelBroken(e.to_string())),
            Err(_) => return Err(DeviceError::Timeout(ACK_TIMEOUT)),
        };
        if n == 0 {
            return Err(DeviceError::ChannelBroken(
                "connection closed awaiting acknowledgement".into(),
            ));
        }
        Ok(())
    }

    /// Release the socket. Safe to call on an already-broken channel.
    pub async fn close(&mut self) {
        let _ = self.stream.shutdown().await;
    }
}
