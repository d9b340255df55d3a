use super::DataSet;
use crate::config::SecureMask;
use crate::secure::Desensitizer;
use crate::value::CellValue;

/// Replace each non-null value of the column with its masked form. Rows
/// own their cells, so cached values they were translated from are never
/// touched.
pub fn apply(data: &mut DataSet, rule: &SecureMask, desensitizer: &dyn Desensitizer) {
    let Some(idx) = data.column_index(&rule.column) else {
        return;
    };
    for row in &mut data.rows {
        if row[idx].is_null() {
            continue;
        }
        let masked = desensitizer.mask(&row[idx].display(), rule);
        row[idx] = CellValue::Text(masked);
    }
}
