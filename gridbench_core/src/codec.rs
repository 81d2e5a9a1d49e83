//! Encoding of operations into addressed messages.

use crate::operation::{Operation, OperationKind};
use crate::schema::MessageSchema;
use gridbench_env::{SimulatorAddress, SimulatorMessage};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum CodecError {
    #[error("{0} is not registered in the message schema")]
    UnregisteredOperation(OperationKind),

    #[error("Type id {0} is not registered in the message schema")]
    UnknownTypeId(u16),

    #[error("Could not encode {kind}: {reason}")]
    Encode { kind: OperationKind, reason: String },

    #[error("Could not decode {kind}: {reason}")]
    Decode { kind: OperationKind, reason: String },
}

/// Converts [`Operation`]s to and from their wire form using a shared schema.
#[derive(Debug, Clone)]
pub struct OperationCodec {
    schema: Arc<MessageSchema>,
}

impl OperationCodec {
    pub fn new(schema: Arc<MessageSchema>) -> Self {
        Self { schema }
    }

    pub fn schema(&self) -> &Arc<MessageSchema> {
        &self.schema
    }

    /// Returns the type id and JSON body of an operation.
    pub fn encode(&self, operation: &Operation) -> Result<(u16, String), CodecError> {
        let kind = operation.kind();
        let id = self
            .schema
            .to_id(kind)
            .ok_or(CodecError::UnregisteredOperation(kind))?;
        let body = match operation {
            Operation::Ping(op) => to_json(kind, op),
            Operation::Failure(op) => to_json(kind, op),
            Operation::Log(op) => to_json(kind, op),
            Operation::InitSession(op) => to_json(kind, op),
            Operation::CreateWorker(op) => to_json(kind, op),
            Operation::KillWorker(op) => to_json(kind, op),
            Operation::TerminateWorker(op) => to_json(kind, op),
            Operation::CreateTest(op) => to_json(kind, op),
            Operation::StartTestPhase(op) => to_json(kind, op),
            Operation::StopRun(op) => to_json(kind, op),
            Operation::IsPhaseCompleted(op) => to_json(kind, op),
            Operation::PerformanceStats(op) => to_json(kind, op),
            Operation::IntervalStats(op) => to_json(kind, op),
        }?;
        Ok((id, body))
    }

    /// Rebuilds an operation from its type id and JSON body.
    pub fn decode(&self, operation_type: u16, payload: &str) -> Result<Operation, CodecError> {
        let kind = self
            .schema
            .from_id(operation_type)
            .ok_or(CodecError::UnknownTypeId(operation_type))?;
        Ok(match kind {
            OperationKind::Ping => Operation::Ping(from_json(kind, payload)?),
            OperationKind::Failure => Operation::Failure(from_json(kind, payload)?),
            OperationKind::Log => Operation::Log(from_json(kind, payload)?),
            OperationKind::InitSession => Operation::InitSession(from_json(kind, payload)?),
            OperationKind::CreateWorker => Operation::CreateWorker(from_json(kind, payload)?),
            OperationKind::KillWorker => Operation::KillWorker(from_json(kind, payload)?),
            OperationKind::TerminateWorker => Operation::TerminateWorker(from_json(kind, payload)?),
            OperationKind::CreateTest => Operation::CreateTest(from_json(kind, payload)?),
            OperationKind::StartTestPhase => Operation::StartTestPhase(from_json(kind, payload)?),
            OperationKind::StopRun => Operation::StopRun(from_json(kind, payload)?),
            OperationKind::IsPhaseCompleted => Operation::IsPhaseCompleted(from_json(kind, payload)?),
            OperationKind::PerformanceStats => Operation::PerformanceStats(from_json(kind, payload)?),
            OperationKind::IntervalStats => Operation::IntervalStats(from_json(kind, payload)?),
        })
    }

    /// Wraps an operation into a message.
    pub fn message(
        &self,
        destination: SimulatorAddress,
        source: SimulatorAddress,
        operation: &Operation,
    ) -> Result<SimulatorMessage, CodecError> {
        let (id, body) = self.encode(operation)?;
        Ok(SimulatorMessage::new(destination, source, id, body))
    }

    /// Extracts the operation carried by a message.
    pub fn decode_message(&self, message: &SimulatorMessage) -> Result<Operation, CodecError> {
        self.decode(message.operation_type, &message.payload)
    }
}

fn to_json<T: Serialize>(kind: OperationKind, value: &T) -> Result<String, CodecError> {
    serde_json::to_string(value).map_err(|e| CodecError::Encode {
        kind,
        reason: e.to_string(),
    })
}

fn from_json<T: DeserializeOwned>(kind: OperationKind, payload: &str) -> Result<T, CodecError> {
    serde_json::from_str(payload).map_err(|e| CodecError::Decode {
        kind,
        reason: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::phase::TestPhase;
    use crate::test_case::TestCase;

    fn codec() -> OperationCodec {
        OperationCodec::new(Arc::new(MessageSchema::standard().unwrap()))
    }

    #[test]
    fn test_message_carries_schema_id() {
        let codec = codec();
        let message = codec
            .message(
                SimulatorAddress::test(1, 1, 1),
                SimulatorAddress::coordinator(),
                &Operation::start_phase(TestPhase::Run),
            )
            .unwrap();
        assert_eq!(message.operation_type, 21);
        assert_eq!(
            codec.decode_message(&message).unwrap(),
            Operation::start_phase(TestPhase::Run)
        );
    }

    #[test]
    fn test_create_test_preserves_properties() {
        let codec = codec();
        let op = Operation::create_test(3, TestCase::new("foo").with_class("SuccessTest"));
        let (id, body) = codec.encode(&op).unwrap();
        match codec.decode(id, &body).unwrap() {
            Operation::CreateTest(create) => {
                assert_eq!(create.test_index, 3);
                assert_eq!(create.test_case.class_name(), Some("SuccessTest"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_unknown_id_and_bad_body() {
        let codec = codec();
        assert!(matches!(codec.decode(77, "{}"), Err(CodecError::UnknownTypeId(77))));
        assert!(matches!(
            codec.decode(21, "{\"phase\":\"NOPE\"}"),
            Err(CodecError::Decode { kind: OperationKind::StartTestPhase, .. })
        ));
    }

    #[test]
    fn test_unregistered_operation_cannot_be_encoded() {
        let schema = MessageSchema::builder()
            .register(OperationKind::Ping, 1)
            .unwrap()
            .build();
        let codec = OperationCodec::new(Arc::new(schema));
        assert!(codec.encode(&Operation::ping("x")).is_ok());
        assert!(matches!(
            codec.encode(&Operation::stop_run()),
            Err(CodecError::UnregisteredOperation(OperationKind::StopRun))
        ));
    }
}
