//! Translation between local entities and remote records.

use arbor_core::model::task::field;
use arbor_core::{Assignment, Entity, Task};
use serde_json::{Value, json};

use crate::error::ReplicationError;
use crate::remote::RemoteRecord;

/// An entity that replicates to the remote database.
///
/// The parent link travels as the parent's cloud id, resolved by the
/// engines, since local ids mean nothing on another device.
pub trait CloudMirror: Entity {
    const RECORD_TYPE: &'static str;

    /// Overwrite every mirrored field of `record`.
    fn write_fields(&self, parent_cloud_id: Option<&str>, record: &mut RemoteRecord);

    /// Local assignments for every mirrored field except the parent link.
    ///
    /// # Errors
    ///
    /// Returns [`ReplicationError::Malformed`] when a field has the wrong
    /// shape.
    fn read_fields(record: &RemoteRecord) -> Result<Vec<Assignment>, ReplicationError>;

    /// Cloud id of the parent named by `record`, if any.
    ///
    /// # Errors
    ///
    /// Returns [`ReplicationError::Malformed`] when the field is not a
    /// string or null.
    fn parent_cloud_id(record: &RemoteRecord) -> Result<Option<String>, ReplicationError>;
}

const BODY: &str = "body";
const PARENT: &str = "parent";
const COMPLETED_AT: &str = "completedAt";
const CREATED_AT: &str = "createdAt";
const DELETED_AT: &str = "deletedAt";

impl CloudMirror for Task {
    const RECORD_TYPE: &'static str = "Task";

    fn write_fields(&self, parent_cloud_id: Option<&str>, record: &mut RemoteRecord) {
        let fields = &mut record.fields;
        fields.insert(BODY.into(), json!(self.body));
        fields.insert(PARENT.into(), json!(parent_cloud_id));
        fields.insert(COMPLETED_AT.into(), json!(self.completed_at_us));
        fields.insert(CREATED_AT.into(), json!(self.created_at_us));
        fields.insert(DELETED_AT.into(), json!(self.deleted_at_us));
    }

    fn read_fields(record: &RemoteRecord) -> Result<Vec<Assignment>, ReplicationError> {
        let body = match record.fields.get(BODY) {
            None | Some(Value::Null) => String::new(),
            Some(Value::String(text)) => text.clone(),
            Some(other) => return Err(malformed(record, BODY, other)),
        };
        Ok(vec![
            field::body(body),
            field::completed_at(timestamp(record, COMPLETED_AT)?),
            field::deleted_at(timestamp(record, DELETED_AT)?),
        ])
    }

    fn parent_cloud_id(record: &RemoteRecord) -> Result<Option<String>, ReplicationError> {
        match record.fields.get(PARENT) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::String(id)) if !id.is_empty() => Ok(Some(id.clone())),
            Some(other) => Err(malformed(record, PARENT, other)),
        }
    }
}

fn timestamp(record: &RemoteRecord, key: &str) -> Result<Option<i64>, ReplicationError> {
    match record.fields.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(value) => value
            .as_i64()
            .map(Some)
            .ok_or_else(|| malformed(record, key, value)),
    }
}

fn malformed(record: &RemoteRecord, key: &str, value: &Value) -> ReplicationError {
    ReplicationError::Malformed {
        record_id: record.record_id.clone(),
        reason: format!("field '{key}' has unexpected value {value}"),
    }
}
