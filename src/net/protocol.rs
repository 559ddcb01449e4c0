// Wire protocol — every message is a framed, checksummed JSON payload:
//
//   header  = command[12] (ASCII, NUL right-padded)
//          || payload_len u32 LE
//          || checksum[4]          (double SHA-256 of payload, first 4)
//   payload = UTF-8 bytes of the canonical (sort-keyed) JSON encoding
//
// serde_json's map type is ordered, so serializing through `Value` yields
// sort-keyed JSON without a separate canonicalization pass. The payload
// size ceiling is enforced from the header, before any allocation.

use std::io;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::config::NETWORK_MAX_PAYLOAD_SIZE;
use crate::crypto::hash::double_sha256;
use crate::primitives::{Block, BlockHeader, Transaction};

pub const COMMAND_LENGTH: usize = 12;
pub const HEADER_LENGTH: usize = COMMAND_LENGTH + 4 + 4;

pub const INV_TYPE_TX: u32 = 1;
pub const INV_TYPE_BLOCK: u32 = 2;

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("malformed frame header")]
    Framing,
    #[error("payload checksum mismatch")]
    ChecksumMismatch,
    #[error("payload of {0} bytes exceeds the network ceiling")]
    OversizePayload(usize),
    #[error("unknown command {0:?}")]
    UnknownCommand(String),
    #[error("protocol violation: {0}")]
    Violation(String),
    #[error(transparent)]
    Io(#[from] io::Error),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionPayload {
    pub protocol_version: u32,
    pub services: u64,
    pub timestamp: u64,
    pub best_height: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GetHeadersPayload {
    pub protocol_version: u32,
    pub locator_hashes: Vec<String>,
    pub hash_stop: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeadersPayload {
    pub headers: Vec<BlockHeader>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvVector {
    #[serde(rename = "type")]
    pub kind: u32,
    pub hash: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvPayload {
    pub inventory: Vec<InvVector>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GetDataPayload {
    pub inventory: Vec<InvVector>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockPayload {
    pub block_data: Block,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TxPayload {
    pub tx_data: Transaction,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Version(VersionPayload),
    GetHeaders(GetHeadersPayload),
    Headers(HeadersPayload),
    Inv(InvPayload),
    GetData(GetDataPayload),
    Block(BlockPayload),
    Tx(TxPayload),
}

impl Message {
    pub fn command(&self) -> &'static str {
        match self {
            Message::Version(_) => "version",
            Message::GetHeaders(_) => "getheaders",
            Message::Headers(_) => "headers",
            Message::Inv(_) => "inv",
            Message::GetData(_) => "getdata",
            Message::Block(_) => "block",
            Message::Tx(_) => "tx",
        }
    }

    fn payload_json(&self) -> Result<Vec<u8>, ProtocolError> {
        let value = match self {
            Message::Version(p) => serde_json::to_value(p),
            Message::GetHeaders(p) => serde_json::to_value(p),
            Message::Headers(p) => serde_json::to_value(p),
            Message::Inv(p) => serde_json::to_value(p),
            Message::GetData(p) => serde_json::to_value(p),
            Message::Block(p) => serde_json::to_value(p),
            Message::Tx(p) => serde_json::to_value(p),
        }
        .map_err(|e| ProtocolError::Violation(e.to_string()))?;
        serde_json::to_vec(&value).map_err(|e| ProtocolError::Violation(e.to_string()))
    }

    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        let payload = self.payload_json()?;
        let checksum = double_sha256(&payload);

        let mut frame = Vec::with_capacity(HEADER_LENGTH + payload.len());
        let mut command = [0u8; COMMAND_LENGTH];
        let name = self.command().as_bytes();
        command[..name.len()].copy_from_slice(name);
        frame.extend_from_slice(&command);
        frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        frame.extend_from_slice(&checksum[..4]);
        frame.extend_from_slice(&payload);
        Ok(frame)
    }

    pub fn decode(data: &[u8]) -> Result<Self, ProtocolError> {
        if data.len() < HEADER_LENGTH {
            return Err(ProtocolError::Framing);
        }
        let (header, rest) = data.split_at(HEADER_LENGTH);
        let payload_len = u32::from_le_bytes(
            header[COMMAND_LENGTH..COMMAND_LENGTH + 4]
                .try_into()
                .map_err(|_| ProtocolError::Framing)?,
        ) as usize;
        if payload_len > NETWORK_MAX_PAYLOAD_SIZE {
            return Err(ProtocolError::OversizePayload(payload_len));
        }
        if rest.len() != payload_len {
            return Err(ProtocolError::Framing);
        }
        decode_payload(&header[..COMMAND_LENGTH], &header[COMMAND_LENGTH + 4..], rest)
    }

    pub fn inv_single(kind: u32, hash: String) -> Self {
        Message::Inv(InvPayload {
            inventory: vec![InvVector { kind, hash }],
        })
    }
}

fn decode_payload(command_bytes: &[u8], checksum: &[u8], payload: &[u8]) -> Result<Message, ProtocolError> {
    if double_sha256(payload)[..4] != checksum[..4] {
        return Err(ProtocolError::ChecksumMismatch);
    }

    let command = std::str::from_utf8(command_bytes)
        .map_err(|_| ProtocolError::Framing)?
        .trim_end_matches('\0')
        .to_string();

    let violation = |e: serde_json::Error| ProtocolError::Violation(format!("{command}: {e}"));
    match command.as_str() {
        "version" => Ok(Message::Version(serde_json::from_slice(payload).map_err(violation)?)),
        "getheaders" => Ok(Message::GetHeaders(serde_json::from_slice(payload).map_err(violation)?)),
        "headers" => Ok(Message::Headers(serde_json::from_slice(payload).map_err(violation)?)),
        "inv" => Ok(Message::Inv(serde_json::from_slice(payload).map_err(violation)?)),
        "getdata" => Ok(Message::GetData(serde_json::from_slice(payload).map_err(violation)?)),
        "block" => Ok(Message::Block(serde_json::from_slice(payload).map_err(violation)?)),
        "tx" => Ok(Message::Tx(serde_json::from_slice(payload).map_err(violation)?)),
        _ => Err(ProtocolError::UnknownCommand(command)),
    }
}

pub struct FramedStream {
    stream: TcpStream,
}

impl FramedStream {
    pub fn new(stream: TcpStream) -> Self {
        FramedStream { stream }
    }

    pub async fn send(&mut self, msg: &Message) -> Result<(), ProtocolError> {
        let frame = msg.encode()?;
        self.stream.write_all(&frame).await?;
        Ok(())
    }

    /// Read one message. `Ok(None)` on clean EOF; protocol errors are
    /// disconnect reasons for the caller.
    pub async fn recv(&mut self) -> Result<Option<Message>, ProtocolError> {
        let mut header = [0u8; HEADER_LENGTH];
        match self.stream.read_exact(&mut header).await {
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        }

        let payload_len = u32::from_le_bytes(
            header[COMMAND_LENGTH..COMMAND_LENGTH + 4]
                .try_into()
                .map_err(|_| ProtocolError::Framing)?,
        ) as usize;
        if payload_len > NETWORK_MAX_PAYLOAD_SIZE {
            return Err(ProtocolError::OversizePayload(payload_len));
        }

        let mut payload = vec![0u8; payload_len];
        self.stream.read_exact(&mut payload).await?;

        decode_payload(
            &header[..COMMAND_LENGTH],
            &header[COMMAND_LENGTH + 4..],
            &payload,
        )
        .map(Some)
    }
}
