//! Wire-level types shared by every transport implementation.

use crate::address::SimulatorAddress;
use serde::{Deserialize, Serialize};
use std::fmt;

/// An addressed message travelling between processes.
///
/// The payload is the encoded body of an operation; `operation_type` is the
/// stable id the message schema assigned to that operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimulatorMessage {
    /// Final destination (may contain wildcards)
    pub destination: SimulatorAddress,

    /// Originating endpoint
    pub source: SimulatorAddress,

    /// Link-local correlation id, rewritten at every hop
    pub message_id: u64,

    /// Schema id of the operation carried in `payload`
    pub operation_type: u16,

    /// Encoded operation body
    pub payload: String,
}

impl SimulatorMessage {
    /// Creates a message; the id is assigned by the link that sends it.
    pub fn new(
        destination: SimulatorAddress,
        source: SimulatorAddress,
        operation_type: u16,
        payload: String,
    ) -> Self {
        Self {
            destination,
            source,
            message_id: 0,
            operation_type,
            payload,
        }
    }

    /// Returns the payload size in bytes.
    pub fn size(&self) -> usize {
        self.payload.len()
    }
}

/// Outcome of delivering a message to one endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResponseType {
    Success,
    UnblockedByFailure,
    FailureCoordinatorNotFound,
    FailureAgentNotFound,
    FailureWorkerNotFound,
    FailureTestNotFound,
    UnknownOperation,
    ExceptionDuringOperationExecution,
}

impl ResponseType {
    pub fn is_success(self) -> bool {
        self == ResponseType::Success
    }
}

impl fmt::Display for ResponseType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Per-endpoint entry in a [`Response`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponsePart {
    pub address: SimulatorAddress,
    pub response_type: ResponseType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<String>,
}

/// Reply to a [`SimulatorMessage`].
///
/// A message addressed to a wildcard fans out; every endpoint it reached
/// contributes one part, so a single response may carry many parts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
    /// Id of the message being answered
    pub message_id: u64,

    /// Endpoint producing this response
    pub source: SimulatorAddress,

    /// One entry per reached endpoint
    pub parts: Vec<ResponsePart>,
}

impl Response {
    /// Creates an empty response for the given message.
    pub fn new(message_id: u64, source: SimulatorAddress) -> Self {
        Self {
            message_id,
            source,
            parts: Vec::new(),
        }
    }

    /// Creates a response with a single part.
    pub fn single(
        message_id: u64,
        source: SimulatorAddress,
        address: SimulatorAddress,
        response_type: ResponseType,
        payload: Option<String>,
    ) -> Self {
        let mut response = Self::new(message_id, source);
        response.add_part(address, response_type, payload);
        response
    }

    pub fn add_part(
        &mut self,
        address: SimulatorAddress,
        response_type: ResponseType,
        payload: Option<String>,
    ) {
        self.parts.push(ResponsePart {
            address,
            response_type,
            payload,
        });
    }

    /// Merges the parts of another response into this one.
    pub fn merge(&mut self, other: Response) {
        self.parts.extend(other.parts);
    }

    /// True if every part reports success (and there is at least one part).
    pub fn is_success(&self) -> bool {
        !self.parts.is_empty() && self.parts.iter().all(|p| p.response_type.is_success())
    }

    /// Returns the first part that did not succeed.
    pub fn first_failure(&self) -> Option<&ResponsePart> {
        self.parts.iter().find(|p| !p.response_type.is_success())
    }

    /// Looks up the part for a specific endpoint.
    pub fn part_for(&self, address: &SimulatorAddress) -> Option<&ResponsePart> {
        self.parts.iter().find(|p| &p.address == address)
    }
}

/// Unit of transmission on a link.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Frame {
    /// First frame on a new connection; names the dialing endpoint
    Hello { address: SimulatorAddress },

    Message(SimulatorMessage),

    Response(Response),
}
