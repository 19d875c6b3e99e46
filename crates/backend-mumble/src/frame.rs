//! Length-prefixed frame codec: `[u16 type][u32 length][payload]`, big-endian.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

use backend_core::BackendError;

/// Size of the fixed frame header.
pub const HEADER_LEN: usize = 6;
/// Largest payload accepted before the stream is treated as corrupt.
pub const DEFAULT_MAX_PAYLOAD_LEN: usize = 8 * 1024 * 1024;

/// Frame types defined by the control protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum MessageKind {
    Version = 0,
    UdpTunnel = 1,
    Authenticate = 2,
    Ping = 3,
    Reject = 4,
    ServerSync = 5,
    ChannelRemove = 6,
    ChannelState = 7,
    UserRemove = 8,
    UserState = 9,
    BanList = 10,
    TextMessage = 11,
    PermissionDenied = 12,
    Acl = 13,
    QueryUsers = 14,
    CryptSetup = 15,
    ContextActionModify = 16,
    ContextAction = 17,
    UserList = 18,
    VoiceTarget = 19,
    PermissionQuery = 20,
    CodecVersion = 21,
    UserStats = 22,
    RequestBlob = 23,
    ServerConfig = 24,
    SuggestConfig = 25,
}

impl MessageKind {
    pub fn from_u16(value: u16) -> Option<Self> {
        use MessageKind::*;

        let kind = match value {
            0 => Version,
            1 => UdpTunnel,
            2 => Authenticate,
            3 => Ping,
            4 => Reject,
            5 => ServerSync,
            6 => ChannelRemove,
            7 => ChannelState,
            8 => UserRemove,
            9 => UserState,
            10 => BanList,
            11 => TextMessage,
            12 => PermissionDenied,
            13 => Acl,
            14 => QueryUsers,
            15 => CryptSetup,
            16 => ContextActionModify,
            17 => ContextAction,
            18 => UserList,
            19 => VoiceTarget,
            20 => PermissionQuery,
            21 => CodecVersion,
            22 => UserStats,
            23 => RequestBlob,
            24 => ServerConfig,
            25 => SuggestConfig,
            _ => return None,
        };
        Some(kind)
    }

    pub fn as_u16(self) -> u16 {
        self as u16
    }
}

/// One undecoded frame. `kind` stays raw so unknown types survive decoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawFrame {
    pub kind: u16,
    pub payload: Bytes,
}

impl RawFrame {
    pub fn new(kind: MessageKind, payload: impl Into<Bytes>) -> Self {
        Self {
            kind: kind.as_u16(),
            payload: payload.into(),
        }
    }

    /// Serialize a payload record into a frame of the given type.
    pub fn from_message<M: prost::Message>(kind: MessageKind, message: &M) -> Self {
        Self::new(kind, message.encode_to_vec())
    }

    pub fn known_kind(&self) -> Option<MessageKind> {
        MessageKind::from_u16(self.kind)
    }

    /// Parse the payload as the record type matching this frame.
    pub fn decode<M: prost::Message + Default>(&self) -> Result<M, BackendError> {
        M::decode(self.payload.as_ref()).map_err(|err| {
            BackendError::protocol(
                "frame_decode_error",
                format!("failed to decode frame type {}: {err}", self.kind),
            )
        })
    }
}

/// Errors raised by [`FrameCodec`].
#[derive(Debug, Error)]
pub enum FrameError {
    /// The declared payload length is over the configured limit.
    #[error("frame payload of {len} bytes exceeds limit of {limit} bytes")]
    TooLarge { len: usize, limit: usize },
    #[error("frame transport failed: {0}")]
    Io(#[from] std::io::Error),
}

impl From<FrameError> for BackendError {
    fn from(err: FrameError) -> Self {
        match err {
            FrameError::TooLarge { .. } => BackendError::protocol("frame_too_large", err.to_string()),
            FrameError::Io(io) => BackendError::from(io),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct FrameCodec {
    max_payload_len: usize,
}

impl FrameCodec {
    pub fn with_max_payload_len(max_payload_len: usize) -> Self {
        Self { max_payload_len }
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::with_max_payload_len(DEFAULT_MAX_PAYLOAD_LEN)
    }
}

impl Decoder for FrameCodec {
    type Item = RawFrame;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<RawFrame>, FrameError> {
        if src.len() < HEADER_LEN {
            return Ok(None);
        }

        let kind = u16::from_be_bytes([src[0], src[1]]);
        let len = u32::from_be_bytes([src[2], src[3], src[4], src[5]]) as usize;
        if len > self.max_payload_len {
            return Err(FrameError::TooLarge {
                len,
                limit: self.max_payload_len,
            });
        }

        let total = HEADER_LEN + len;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        src.advance(HEADER_LEN);
        let payload = src.split_to(len).freeze();
        Ok(Some(RawFrame { kind, payload }))
    }
}

impl Encoder<RawFrame> for FrameCodec {
    type Error = FrameError;

    fn encode(&mut self, frame: RawFrame, dst: &mut BytesMut) -> Result<(), FrameError> {
        let len = frame.payload.len();
        if len > self.max_payload_len {
            return Err(FrameError::TooLarge {
                len,
                limit: self.max_payload_len,
            });
        }

        dst.reserve(HEADER_LEN + len);
        dst.put_u16(frame.kind);
        dst.put_u32(len as u32);
        dst.extend_from_slice(&frame.payload);
        Ok(())
    }
}
