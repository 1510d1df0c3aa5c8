//! Wire record types for the batch protocol.
//!
//! Operations travel client-to-server inside a [`BatchedRequest`]; the server
//! answers with a [`BatchedResponse`] of equal length. Kinds and statuses are
//! open integers: any byte decodes, and out-of-range kinds are rejected
//! per-operation at execution time rather than failing the whole batch.

use std::fmt;

/// Discriminant of an [`Operation`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OperationKind(pub u8);

impl OperationKind {
    pub const SET: OperationKind = OperationKind(0);
    pub const GET: OperationKind = OperationKind(1);
    pub const DELETE: OperationKind = OperationKind(2);
    pub const PING: OperationKind = OperationKind(3);
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            OperationKind::SET => f.write_str("SET"),
            OperationKind::GET => f.write_str("GET"),
            OperationKind::DELETE => f.write_str("DELETE"),
            OperationKind::PING => f.write_str("PING"),
            OperationKind(other) => write!(f, "{}", other),
        }
    }
}

/// Outcome discriminant of an [`OpResult`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ResultStatus(pub u8);

impl ResultStatus {
    pub const SUCCESS: ResultStatus = ResultStatus(0);
    pub const FAILURE: ResultStatus = ResultStatus(1);
}

impl fmt::Display for ResultStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            ResultStatus::SUCCESS => f.write_str("SUCCESS"),
            ResultStatus::FAILURE => f.write_str("FAILURE"),
            ResultStatus(other) => write!(f, "{}", other),
        }
    }
}

/// A single request on the wire. PING ignores key and value; GET and DELETE
/// ignore the value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Operation {
    pub kind: OperationKind,
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

impl Operation {
    pub fn ping() -> Self {
        Operation {
            kind: OperationKind::PING,
            key: Vec::new(),
            value: Vec::new(),
        }
    }

    pub fn get(key: impl Into<Vec<u8>>) -> Self {
        Operation {
            kind: OperationKind::GET,
            key: key.into(),
            value: Vec::new(),
        }
    }

    pub fn set(key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> Self {
        Operation {
            kind: OperationKind::SET,
            key: key.into(),
            value: value.into(),
        }
    }

    pub fn delete(key: impl Into<Vec<u8>>) -> Self {
        Operation {
            kind: OperationKind::DELETE,
            key: key.into(),
            value: Vec::new(),
        }
    }

    /// Semantic identity of the operation, used to collapse duplicates
    /// within a batch: `kind-name || '-' || key || '-' || value`.
    pub fn index(&self) -> Vec<u8> {
        let kind = self.kind.to_string();
        let mut index =
            Vec::with_capacity(kind.len() + self.key.len() + self.value.len() + 2);
        index.extend_from_slice(kind.as_bytes());
        index.push(b'-');
        index.extend_from_slice(&self.key);
        index.push(b'-');
        index.extend_from_slice(&self.value);
        index
    }
}

/// A single answer on the wire: `PONG` for PING, `OK` for SET/DELETE, the
/// stored value for GET, or a diagnostic message on failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpResult {
    pub status: ResultStatus,
    pub message: Vec<u8>,
}

impl OpResult {
    pub fn success(message: impl Into<Vec<u8>>) -> Self {
        OpResult {
            status: ResultStatus::SUCCESS,
            message: message.into(),
        }
    }

    pub fn failure(message: impl Into<Vec<u8>>) -> Self {
        OpResult {
            status: ResultStatus::FAILURE,
            message: message.into(),
        }
    }
}

/// Ordered operations encoded as one wire message.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BatchedRequest {
    pub operations: Vec<Operation>,
}

/// Ordered results answering a [`BatchedRequest`], one per deduplicated
/// operation.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BatchedResponse {
    pub results: Vec<OpResult>,
}
