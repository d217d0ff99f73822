use thiserror::Error;

use crate::registry::EntityType;

#[derive(Debug, Error)]
pub enum SensorGraphError {
    #[error("unknown entity type: {0}")]
    UnknownEntityType(String),
    #[error("invalid path segment {index} ({segment}): {reason}")]
    InvalidPathSegment {
        index: usize,
        segment: String,
        reason: String,
    },
    #[error("invalid traversal at segment {index} ({segment}): {reason}")]
    InvalidTraversal {
        index: usize,
        segment: String,
        reason: String,
    },
    #[error("query syntax error: {0}")]
    QuerySyntaxError(String),
    #[error("unknown property {property} on {entity_type}")]
    UnknownProperty {
        entity_type: EntityType,
        property: String,
    },
    #[error("unsupported query option: {0}")]
    UnsupportedQueryOption(String),
    #[error("incomplete entity: {0}")]
    IncompleteEntity(String),
    #[error("no such entity: {0}")]
    NoSuchEntity(String),
    #[error("cyclic reference: {0}")]
    CyclicReference(String),
    #[error("constraint violation: {0}")]
    ConstraintViolation(String),
    #[error("transaction error: {0}")]
    TransactionError(String),
    #[error("query timed out after {elapsed_ms} ms")]
    TimeoutError { elapsed_ms: u128 },
    #[error("entity not found: {0}")]
    NotFound(String),
    #[error("connection error: {0}")]
    ConnectionError(String),
    #[error("schema error: {0}")]
    SchemaError(String),
    #[error("storage error: {0}")]
    StorageError(String),
}

impl SensorGraphError {
    pub fn unknown_entity_type<T: Into<String>>(name: T) -> Self {
        SensorGraphError::UnknownEntityType(name.into())
    }

    pub fn invalid_segment<S: Into<String>, R: Into<String>>(
        index: usize,
        segment: S,
        reason: R,
    ) -> Self {
        SensorGraphError::InvalidPathSegment {
            index,
            segment: segment.into(),
            reason: reason.into(),
        }
    }

    pub fn invalid_traversal<S: Into<String>, R: Into<String>>(
        index: usize,
        segment: S,
        reason: R,
    ) -> Self {
        SensorGraphError::InvalidTraversal {
            index,
            segment: segment.into(),
            reason: reason.into(),
        }
    }

    pub fn syntax<T: Into<String>>(msg: T) -> Self {
        SensorGraphError::QuerySyntaxError(msg.into())
    }

    pub fn unknown_property<T: Into<String>>(entity_type: EntityType, property: T) -> Self {
        SensorGraphError::UnknownProperty {
            entity_type,
            property: property.into(),
        }
    }

    pub fn unsupported_option<T: Into<String>>(option: T) -> Self {
        SensorGraphError::UnsupportedQueryOption(option.into())
    }

    pub fn incomplete<T: Into<String>>(msg: T) -> Self {
        SensorGraphError::IncompleteEntity(msg.into())
    }

    pub fn no_such_entity<T: Into<String>>(msg: T) -> Self {
        SensorGraphError::NoSuchEntity(msg.into())
    }

    pub fn cyclic<T: Into<String>>(msg: T) -> Self {
        SensorGraphError::CyclicReference(msg.into())
    }

    pub fn constraint<T: Into<String>>(msg: T) -> Self {
        SensorGraphError::ConstraintViolation(msg.into())
    }

    pub fn transaction<T: Into<String>>(msg: T) -> Self {
        SensorGraphError::TransactionError(msg.into())
    }

    pub fn not_found<T: Into<String>>(msg: T) -> Self {
        SensorGraphError::NotFound(msg.into())
    }

    pub fn connection<T: Into<String>>(msg: T) -> Self {
        SensorGraphError::ConnectionError(msg.into())
    }

    pub fn schema<T: Into<String>>(msg: T) -> Self {
        SensorGraphError::SchemaError(msg.into())
    }

    pub fn storage<T: Into<String>>(msg: T) -> Self {
        SensorGraphError::StorageError(msg.into())
    }

    /// True for failures detected while parsing a path or query string.
    pub fn is_parse_error(&self) -> bool {
        matches!(
            self,
            SensorGraphError::UnknownEntityType(_)
                | SensorGraphError::InvalidPathSegment { .. }
                | SensorGraphError::InvalidTraversal { .. }
                | SensorGraphError::QuerySyntaxError(_)
                | SensorGraphError::UnknownProperty { .. }
                | SensorGraphError::UnsupportedQueryOption(_)
        )
    }
}
