use std::collections::HashMap;

use rollsync_core::{MappedOperation, ATTENDANCE_ENTITY};
use serde_json::json;

use crate::dataset::NormalizedRow;

/// Where a classroom's marks are written in the portal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteTarget {
    pub classroom_id: String,
    pub course_identifier: String,
}

/// Turns validated rows into attendance upserts.
///
/// Duplicate `classroom:student:date` keys collapse to the last row seen, kept
/// at the position of the first occurrence. The payload carries the mark and
/// its destination (course and portal row), so moving a mark to another row or
/// course changes its hash.
pub fn map_dataset_to_operations(
    target: &WriteTarget,
    rows: &[NormalizedRow],
) -> Vec<MappedOperation> {
    let mut positions: HashMap<String, usize> = HashMap::new();
    let mut operations: Vec<MappedOperation> = Vec::with_capacity(rows.len());

    for row in rows {
        let external_row_reference = row.external_row_reference.clone().unwrap_or_default();
        let operation = MappedOperation {
            entity_type: ATTENDANCE_ENTITY.to_string(),
            entity_key: row.entity_key(&target.classroom_id),
            payload: json!({
                "student_id": row.student_id,
                "date": row.date,
                "status": row.status,
                "course": target.course_identifier,
                "external_row_reference": external_row_reference,
            }),
            external_row_reference,
        };
        match positions.get(&operation.entity_key) {
            Some(&idx) => operations[idx] = operation,
            None => {
                positions.insert(operation.entity_key.clone(), operations.len());
                operations.push(operation);
            }
        }
    }
    operations
}
