//! Decoded ring buffer records.
//!
//! Wire layout: a 32-byte [`EventHeader`] followed by `payload_len` bytes.
//! Decoding clamps the payload to both [`MAX_PAYLOAD`] and the bytes actually
//! received, so a lying length field can never cause an over-read.

use std::fmt;

use pagetap_common::{
    EventHeader, ThreadKey, EVENT_DIAGNOSTIC, EVENT_FAULT_ENTRY, EVENT_FAULT_EXIT,
    EVENT_HEADER_LEN, EVENT_READ_RESULT, EVENT_WRITE_RESULT, MAX_PAYLOAD, STATUS_SUCCESS,
};
use serde::Serialize;

use super::DecodeError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    FaultEntry,
    FaultExit,
    ReadResult,
    WriteResult,
    Diagnostic,
}

impl EventKind {
    #[must_use]
    pub const fn code(self) -> u8 {
        match self {
            EventKind::FaultEntry => EVENT_FAULT_ENTRY,
            EventKind::FaultExit => EVENT_FAULT_EXIT,
            EventKind::ReadResult => EVENT_READ_RESULT,
            EventKind::WriteResult => EVENT_WRITE_RESULT,
            EventKind::Diagnostic => EVENT_DIAGNOSTIC,
        }
    }
}

impl TryFrom<u8> for EventKind {
    type Error = DecodeError;

    fn try_from(code: u8) -> Result<Self, Self::Error> {
        match code {
            EVENT_FAULT_ENTRY => Ok(EventKind::FaultEntry),
            EVENT_FAULT_EXIT => Ok(EventKind::FaultExit),
            EVENT_READ_RESULT => Ok(EventKind::ReadResult),
            EVENT_WRITE_RESULT => Ok(EventKind::WriteResult),
            EVENT_DIAGNOSTIC => Ok(EventKind::Diagnostic),
            other => Err(DecodeError::UnknownKind(other)),
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            EventKind::FaultEntry => "FAULT",
            EventKind::FaultExit => "FAULT_RET",
            EventKind::ReadResult => "READ",
            EventKind::WriteResult => "WRITE",
            EventKind::Diagnostic => "DIAG",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Success,
    Failure,
}

/// One record from the event channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    pub kind: EventKind,
    pub key: ThreadKey,
    pub address: u64,
    pub status: Status,
    /// Fault flags, `vm_fault_t` or errno depending on `kind`.
    pub aux: u32,
    pub timestamp_ns: u64,
    pub payload: Vec<u8>,
}

impl Event {
    /// Decode one raw ring buffer record.
    ///
    /// # Errors
    /// [`DecodeError`] if the record is shorter than the header or has an unknown kind.
    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        if bytes.len() < EVENT_HEADER_LEN {
            return Err(DecodeError::Truncated { len: bytes.len(), expected: EVENT_HEADER_LEN });
        }

        // SAFETY: length checked above; EventHeader is repr(C) plain data with
        // no invalid bit patterns, and read_unaligned tolerates any alignment.
        #[allow(unsafe_code)]
        let header = unsafe { std::ptr::read_unaligned(bytes.as_ptr().cast::<EventHeader>()) };

        let kind = EventKind::try_from(header.kind)?;
        let body = &bytes[EVENT_HEADER_LEN..];
        let len = usize::from(header.payload_len).min(MAX_PAYLOAD).min(body.len());

        Ok(Self {
            kind,
            key: header.thread_key(),
            address: header.address,
            status: if header.status == STATUS_SUCCESS { Status::Success } else { Status::Failure },
            aux: header.aux,
            timestamp_ns: header.timestamp_ns,
            payload: body[..len].to_vec(),
        })
    }

    /// Encode into the wire layout. The payload is truncated to [`MAX_PAYLOAD`].
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let len = self.payload.len().min(MAX_PAYLOAD);
        let mut out = Vec::with_capacity(EVENT_HEADER_LEN + len);
        out.push(self.kind.code());
        out.push(match self.status {
            Status::Success => STATUS_SUCCESS,
            Status::Failure => pagetap_common::STATUS_FAILURE,
        });
        #[allow(clippy::cast_possible_truncation)]
        out.extend_from_slice(&(len as u16).to_ne_bytes());
        out.extend_from_slice(&self.key.pid.to_ne_bytes());
        out.extend_from_slice(&self.key.tid.to_ne_bytes());
        out.extend_from_slice(&self.aux.to_ne_bytes());
        out.extend_from_slice(&self.address.to_ne_bytes());
        out.extend_from_slice(&self.timestamp_ns.to_ne_bytes());
        out.extend_from_slice(&self.payload[..len]);
        out
    }

    /// Payload as text up to the first NUL (names and diagnostics).
    #[must_use]
    pub fn payload_text(&self) -> String {
        let end = self.payload.iter().position(|&b| b == 0).unwrap_or(self.payload.len());
        String::from_utf8_lossy(&self.payload[..end]).into_owned()
    }

    /// `aux` reinterpreted as the negative errno of a failed helper.
    #[must_use]
    #[allow(clippy::cast_possible_wrap)]
    pub fn errno(&self) -> i32 {
        self.aux as i32
    }
}
