//! Statement builders for entity operations. Every builder works on the
//! physical (already routed and qualified) table and emits `?` placeholders;
//! dialect placeholder rendering happens at execution.

use super::{EntityDescriptor, FieldMeta, KeyStrategy, Record};
use crate::dialect::UpsertTarget;
use crate::value::CellValue;

/// SQL plus the attributes whose values fill its placeholders, in order.
#[derive(Debug, Clone, PartialEq)]
pub struct SqlPlan {
    pub sql: String,
    pub attributes: Vec<String>,
}

impl SqlPlan {
    pub fn params(&self, record: &Record) -> Vec<CellValue> {
        record.values_of(&self.attributes)
    }
}

fn key_predicate(desc: &EntityDescriptor) -> (String, Vec<String>) {
    let keys = desc.key_fields();
    let sql = keys
        .iter()
        .map(|f| format!("{} = ?", f.column))
        .collect::<Vec<_>>()
        .join(" AND ");
    (sql, keys.iter().map(|f| f.attribute.clone()).collect())
}

fn insert_fields(desc: &EntityDescriptor) -> Vec<&FieldMeta> {
    desc.fields
        .iter()
        .filter(|f| !(f.primary_key && desc.key_strategy == KeyStrategy::Identity))
        .collect()
}

pub fn insert(desc: &EntityDescriptor, table: &str) -> SqlPlan {
    let fields = insert_fields(desc);
    let columns: Vec<&str> = fields.iter().map(|f| f.column.as_str()).collect();
    SqlPlan {
        sql: format!(
            "INSERT INTO {} ({}) VALUES ({})",
            table,
            columns.join(", "),
            vec!["?"; columns.len()].join(", ")
        ),
        attributes: fields.iter().map(|f| f.attribute.clone()).collect(),
    }
}

/// Insert-or-update target for the dialect's upsert statement. Attributes
/// named in `force` are overwritten even with null.
pub fn upsert_target(desc: &EntityDescriptor, table: &str, force: &[String]) -> (UpsertTarget, Vec<String>) {
    let fields = insert_fields(desc);
    let target = UpsertTarget {
        table: table.to_string(),
        columns: fields.iter().map(|f| f.column.clone()).collect(),
        values: vec!["?".to_string(); fields.len()],
        key_columns: desc.key_fields().iter().map(|f| f.column.clone()).collect(),
        update_columns: desc
            .non_key_fields()
            .iter()
            .map(|f| (f.column.clone(), is_forced(f, force)))
            .collect(),
    };
    (target, fields.iter().map(|f| f.attribute.clone()).collect())
}

fn is_forced(field: &FieldMeta, force: &[String]) -> bool {
    let wanted = super::normalize_name(&field.attribute);
    force.iter().any(|f| super::normalize_name(f) == wanted)
}

/// Update by primary key. Null values keep the stored column unless the
/// attribute is forced. `None` when the entity has nothing but keys.
pub fn update(desc: &EntityDescriptor, table: &str, force: &[String]) -> Option<SqlPlan> {
    let fields = desc.non_key_fields();
    if fields.is_empty() {
        return None;
    }
    let sets: Vec<String> = fields
        .iter()
        .map(|f| {
            if is_forced(f, force) {
                format!("{} = ?", f.column)
            } else {
                format!("{} = COALESCE(?, {})", f.column, f.column)
            }
        })
        .collect();
    let (predicate, keys) = key_predicate(desc);
    let mut attributes: Vec<String> = fields.iter().map(|f| f.attribute.clone()).collect();
    attributes.extend(keys);
    Some(SqlPlan {
        sql: format!("UPDATE {} SET {} WHERE {}", table, sets.join(", "), predicate),
        attributes,
    })
}

pub fn delete_by_key(desc: &EntityDescriptor, table: &str) -> SqlPlan {
    let (predicate, attributes) = key_predicate(desc);
    SqlPlan {
        sql: format!("DELETE FROM {} WHERE {}", table, predicate),
        attributes,
    }
}

pub fn select_by_key(desc: &EntityDescriptor, table: &str) -> SqlPlan {
    let (predicate, attributes) = key_predicate(desc);
    SqlPlan {
        sql: format!("SELECT {} FROM {} WHERE {}", desc.column_list(), table, predicate),
        attributes,
    }
}

/// Condition matching `count` key tuples: `k IN (?, ?)` for a single key,
/// OR-ed groups for composite keys.
fn keys_condition(desc: &EntityDescriptor, count: usize) -> String {
    let keys = desc.key_fields();
    if let [single] = keys.as_slice() {
        return format!("{} IN ({})", single.column, vec!["?"; count].join(", "));
    }
    let (group, _) = key_predicate(desc);
    vec![format!("({})", group); count].join(" OR ")
}

/// Select rows for `count` key tuples; parameters are the key values of each
/// record in turn.
pub fn select_by_keys(desc: &EntityDescriptor, table: &str, count: usize) -> String {
    format!(
        "SELECT {} FROM {} WHERE {}",
        desc.column_list(),
        table,
        keys_condition(desc, count)
    )
}

fn attribute_predicate(desc: &EntityDescriptor, attributes: &[String]) -> String {
    attributes
        .iter()
        .map(|a| {
            let column = desc.field(a).map(|f| f.column.as_str()).unwrap_or(a.as_str());
            format!("{} = ?", column)
        })
        .collect::<Vec<_>>()
        .join(" AND ")
}

/// Select by equality on arbitrary attributes (cascade children, unique
/// checks).
pub fn select_where(desc: &EntityDescriptor, table: &str, attributes: &[String]) -> SqlPlan {
    SqlPlan {
        sql: format!(
            "SELECT {} FROM {} WHERE {}",
            desc.column_list(),
            table,
            attribute_predicate(desc, attributes)
        ),
        attributes: attributes.to_vec(),
    }
}

pub fn delete_where(desc: &EntityDescriptor, table: &str, attributes: &[String]) -> SqlPlan {
    SqlPlan {
        sql: format!(
            "DELETE FROM {} WHERE {}",
            table,
            attribute_predicate(desc, attributes)
        ),
        attributes: attributes.to_vec(),
    }
}

/// Remove (or invalidate) stored children of one parent that are not among
/// the `keep` supplied children.
///
/// Parameters: the invalidate value when `invalidate_column` is set, then
/// the parent's mapped values, then the key values of each kept child.
pub fn stale_children(
    child: &EntityDescriptor,
    table: &str,
    mapped: &[String],
    keep: usize,
    invalidate_column: Option<&str>,
) -> String {
    let mut predicate = attribute_predicate(child, mapped);
    if keep > 0 {
        predicate.push_str(&format!(" AND NOT ({})", keys_condition(child, keep)));
    }
    match invalidate_column {
        Some(column) => format!("UPDATE {} SET {} = ? WHERE {}", table, column, predicate),
        None => format!("DELETE FROM {} WHERE {}", table, predicate),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::ColumnType;

    fn staff() -> EntityDescriptor {
        EntityDescriptor::builder("Staff", "sys_staff")
            .key("staffId", "staff_id", ColumnType::Text)
            .field("staffName", "staff_name", ColumnType::Text)
            .field("status", "status", ColumnType::Int32)
            .build()
            .unwrap()
    }

    fn role() -> EntityDescriptor {
        EntityDescriptor::builder("StaffRole", "sys_staff_role")
            .key("staffId", "staff_id", ColumnType::Text)
            .key("roleId", "role_id", ColumnType::Text)
            .field("enabled", "enabled", ColumnType::Int32)
            .build()
            .unwrap()
    }

    #[test]
    fn test_insert_and_identity() {
        let plan = insert(&staff(), "sys_staff");
        assert_eq!(
            plan.sql,
            "INSERT INTO sys_staff (staff_id, staff_name, status) VALUES (?, ?, ?)"
        );
        let identity = EntityDescriptor::builder("Log", "t_log")
            .key("id", "id", ColumnType::Int64)
            .field("msg", "msg", ColumnType::Text)
            .key_strategy(KeyStrategy::Identity)
            .build()
            .unwrap();
        let plan = insert(&identity, "t_log");
        assert_eq!(plan.sql, "INSERT INTO t_log (msg) VALUES (?)");
        assert_eq!(plan.attributes, vec!["msg"]);
    }

    #[test]
    fn test_update_skips_nulls_unless_forced() {
        let plan = update(&staff(), "sys_staff_1", &["STATUS".to_string()]).unwrap();
        assert_eq!(
            plan.sql,
            "UPDATE sys_staff_1 SET staff_name = COALESCE(?, staff_name), status = ? WHERE staff_id = ?"
        );
        assert_eq!(plan.attributes, vec!["staffName", "status", "staffId"]);
        let record = Record::new().with("staffId", "S1").with("status", 1);
        assert_eq!(
            plan.params(&record),
            vec![CellValue::Null, CellValue::Int32(1), "S1".into()]
        );
    }

    #[test]
    fn test_select_by_keys() {
        assert_eq!(
            select_by_keys(&staff(), "sys_staff", 3),
            "SELECT staff_id, staff_name, status FROM sys_staff WHERE staff_id IN (?, ?, ?)"
        );
        assert_eq!(
            select_by_keys(&role(), "sys_staff_role", 2),
            "SELECT staff_id, role_id, enabled FROM sys_staff_role WHERE (staff_id = ? AND role_id = ?) OR (staff_id = ? AND role_id = ?)"
        );
    }

    #[test]
    fn test_stale_children() {
        let mapped = vec!["staffId".to_string()];
        assert_eq!(
            stale_children(&role(), "sys_staff_role", &mapped, 1, None),
            "DELETE FROM sys_staff_role WHERE staff_id = ? AND NOT ((staff_id = ? AND role_id = ?))"
        );
        assert_eq!(
            stale_children(&role(), "sys_staff_role", &mapped, 0, Some("enabled")),
            "UPDATE sys_staff_role SET enabled = ? WHERE staff_id = ?"
        );
    }

    #[test]
    fn test_upsert_target_marks_forced_columns() {
        let (target, attributes) = upsert_target(&staff(), "sys_staff", &["staffName".into()]);
        assert_eq!(target.key_columns, vec!["staff_id"]);
        assert_eq!(
            target.update_columns,
            vec![("staff_name".to_string(), true), ("status".to_string(), false)]
        );
        assert_eq!(attributes.len(), 3);
    }
}
