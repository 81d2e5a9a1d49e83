//! Immutable mapping between operations and wire type ids.
//!
//! The schema is built once at process start and handed to the codec and the
//! transport. Registering an id or an operation twice is rejected while
//! building, so a running process can never hold an ambiguous table.

use crate::operation::OperationKind;
use gridbench_env::WireSchema;
use std::collections::HashMap;
use thiserror::Error;

/// Raised while building a schema.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchemaError {
    #[error("Type id {id} is already registered for {existing}, cannot register {kind}")]
    DuplicateId {
        id: u16,
        existing: OperationKind,
        kind: OperationKind,
    },

    #[error("{kind} is already registered with type id {existing_id}")]
    DuplicateOperation {
        kind: OperationKind,
        existing_id: u16,
    },

    #[error("Type id for {kind} must be positive")]
    InvalidId { kind: OperationKind },
}

/// Builder for [`MessageSchema`].
#[derive(Debug, Default)]
pub struct SchemaBuilder {
    by_kind: HashMap<OperationKind, u16>,
    by_id: HashMap<u16, OperationKind>,
}

impl SchemaBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds `kind` to `id`.
    pub fn register(mut self, kind: OperationKind, id: u16) -> Result<Self, SchemaError> {
        if id == 0 {
            return Err(SchemaError::InvalidId { kind });
        }
        if let Some(&existing_id) = self.by_kind.get(&kind) {
            return Err(SchemaError::DuplicateOperation { kind, existing_id });
        }
        if let Some(&existing) = self.by_id.get(&id) {
            return Err(SchemaError::DuplicateId { id, existing, kind });
        }
        self.by_kind.insert(kind, id);
        self.by_id.insert(id, kind);
        Ok(self)
    }

    pub fn build(self) -> MessageSchema {
        MessageSchema {
            by_kind: self.by_kind,
            by_id: self.by_id,
        }
    }
}

/// Bidirectional, injective operation/type id table.
#[derive(Debug, Clone)]
pub struct MessageSchema {
    by_kind: HashMap<OperationKind, u16>,
    by_id: HashMap<u16, OperationKind>,
}

impl MessageSchema {
    pub fn builder() -> SchemaBuilder {
        SchemaBuilder::new()
    }

    /// The table used by every GridBench process.
    pub fn standard() -> Result<MessageSchema, SchemaError> {
        Ok(Self::builder()
            .register(OperationKind::Ping, 1)?
            .register(OperationKind::Failure, 2)?
            .register(OperationKind::Log, 3)?
            .register(OperationKind::InitSession, 10)?
            .register(OperationKind::CreateWorker, 11)?
            .register(OperationKind::KillWorker, 12)?
            .register(OperationKind::TerminateWorker, 13)?
            .register(OperationKind::CreateTest, 20)?
            .register(OperationKind::StartTestPhase, 21)?
            .register(OperationKind::StopRun, 22)?
            .register(OperationKind::IsPhaseCompleted, 23)?
            .register(OperationKind::PerformanceStats, 30)?
            .register(OperationKind::IntervalStats, 31)?
            .build())
    }

    pub fn to_id(&self, kind: OperationKind) -> Option<u16> {
        self.by_kind.get(&kind).copied()
    }

    pub fn from_id(&self, id: u16) -> Option<OperationKind> {
        self.by_id.get(&id).copied()
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }
}

impl WireSchema for MessageSchema {
    fn is_registered(&self, operation_type: u16) -> bool {
        self.by_id.contains_key(&operation_type)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_standard_schema_covers_all_operations() {
        let schema = MessageSchema::standard().unwrap();
        assert_eq!(schema.len(), OperationKind::all().len());
        for &kind in OperationKind::all() {
            let id = schema.to_id(kind).unwrap();
            assert_eq!(schema.from_id(id), Some(kind));
        }
        assert!(schema.is_registered(21));
        assert!(!schema.is_registered(99));
    }

    #[test]
    fn test_duplicate_id_is_rejected() {
        let result = MessageSchema::builder()
            .register(OperationKind::Ping, 1)
            .and_then(|b| b.register(OperationKind::Log, 1));
        assert_eq!(
            result.unwrap_err(),
            SchemaError::DuplicateId {
                id: 1,
                existing: OperationKind::Ping,
                kind: OperationKind::Log
            }
        );
    }

    #[test]
    fn test_duplicate_operation_is_rejected() {
        let result = MessageSchema::builder()
            .register(OperationKind::Ping, 1)
            .and_then(|b| b.register(OperationKind::Ping, 2));
        assert!(matches!(
            result,
            Err(SchemaError::DuplicateOperation { existing_id: 1, .. })
        ));
    }

    #[test]
    fn test_zero_id_is_rejected() {
        let result = MessageSchema::builder().register(OperationKind::Ping, 0);
        assert!(matches!(result, Err(SchemaError::InvalidId { .. })));
    }
}
