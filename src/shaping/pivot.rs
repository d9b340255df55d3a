use std::collections::{BTreeSet, HashMap};

use super::DataSet;
use crate::config::{Pivot, Unpivot};
use crate::error::{EngineError, Result};
use crate::value::CellValue;

fn index_of(data: &DataSet, column: &str, role: &str) -> Result<usize> {
    data.column_index(column).ok_or_else(|| {
        EngineError::mapping(format!("pivot {} column `{}` is not in the result", role, column))
    })
}

/// Swap rows and columns. Output labels are `column_1..column_n`, one per
/// input row.
pub fn transpose(data: &mut DataSet) {
    let rows = std::mem::take(&mut data.rows);
    let width = data.labels.len();
    data.labels = (1..=rows.len()).map(|i| format!("column_{}", i)).collect();
    data.rows = if rows.is_empty() {
        Vec::new()
    } else {
        (0..width)
            .map(|c| rows.iter().map(|r| r[c].clone()).collect())
            .collect()
    };
    data.shape_changed = true;
}

/// Turn category values into columns.
///
/// Output labels are the group columns followed by one column per
/// category and value column: `<category>` when a single value column is
/// pivoted, `<category>_<value label>` otherwise. Categories are the
/// declared list or the distinct combinations found in the data, sorted by
/// their string forms. Groups keep first-appearance order.
pub fn pivot(data: &mut DataSet, p: &Pivot) -> Result<()> {
    if data.rows.is_empty() && data.labels.is_empty() {
        data.shape_changed = true;
        return Ok(());
    }
    if p.group_columns.is_empty() {
        transpose(data);
        return Ok(());
    }
    let cat_idx = p
        .category_columns
        .iter()
        .map(|c| index_of(data, c, "category"))
        .collect::<Result<Vec<_>>>()?;
    let group_idx = p
        .group_columns
        .iter()
        .map(|c| index_of(data, c, "group"))
        .collect::<Result<Vec<_>>>()?;
    let start = index_of(data, &p.start_column, "start")?;
    let end = match &p.end_column {
        Some(c) => index_of(data, c, "end")?,
        None => start,
    };
    if end < start {
        return Err(EngineError::mapping(format!(
            "pivot end column `{}` precedes start column `{}`",
            p.end_column.as_deref().unwrap_or_default(),
            p.start_column
        )));
    }
    let key_of = |row: &Vec<CellValue>, idx: &[usize]| -> Vec<String> {
        idx.iter().map(|&i| row[i].key_string()).collect()
    };

    let categories: Vec<Vec<String>> = match &p.categories {
        Some(declared) => declared.clone(),
        None => data
            .rows
            .iter()
            .map(|r| key_of(r, &cat_idx))
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect(),
    };
    let category_pos: HashMap<&[String], usize> = categories
        .iter()
        .enumerate()
        .map(|(i, c)| (c.as_slice(), i))
        .collect();

    let value_count = end - start + 1;
    let default = p
        .default_value
        .as_ref()
        .map(CellValue::from_json)
        .unwrap_or_default();

    let mut labels: Vec<String> = group_idx.iter().map(|&i| data.labels[i].clone()).collect();
    for category in &categories {
        let name = category.join("_");
        for v in start..=end {
            labels.push(if value_count == 1 {
                name.clone()
            } else {
                format!("{}_{}", name, data.labels[v])
            });
        }
    }

    let mut group_pos: HashMap<Vec<String>, usize> = HashMap::new();
    let mut out: Vec<Vec<CellValue>> = Vec::new();
    let mut filled: Vec<Vec<bool>> = Vec::new();
    for row in &data.rows {
        let group = key_of(row, &group_idx);
        let g = *group_pos.entry(group).or_insert_with(|| {
            let mut fresh: Vec<CellValue> = group_idx.iter().map(|&i| row[i].clone()).collect();
            fresh.resize(labels.len(), default.clone());
            out.push(fresh);
            filled.push(vec![false; categories.len()]);
            out.len() - 1
        });
        let category = key_of(row, &cat_idx);
        let Some(&c) = category_pos.get(category.as_slice()) else {
            continue;
        };
        if filled[g][c] {
            continue;
        }
        filled[g][c] = true;
        let base = group_idx.len() + c * value_count;
        for (offset, v) in (start..=end).enumerate() {
            out[g][base + offset] = row[v].clone();
        }
    }
    data.labels = labels;
    data.rows = out;
    data.shape_changed = true;
    Ok(())
}

/// Explode the listed columns into (label, value) rows. Other columns are
/// repeated on every exploded row.
pub fn unpivot(data: &mut DataSet, u: &Unpivot) -> Result<()> {
    let cols = u
        .columns
        .iter()
        .map(|c| {
            data.column_index(c).ok_or_else(|| {
                EngineError::mapping(format!("unpivot column `{}` is not in the result", c))
            })
        })
        .collect::<Result<Vec<_>>>()?;
    let names: Vec<String> = cols
        .iter()
        .enumerate()
        .map(|(i, &c)| u.labels.get(i).cloned().unwrap_or_else(|| data.labels[c].clone()))
        .collect();
    let kept: Vec<usize> = (0..data.labels.len()).filter(|i| !cols.contains(i)).collect();

    let mut labels: Vec<String> = kept.iter().map(|&i| data.labels[i].clone()).collect();
    labels.push(u.label_column.clone());
    labels.push(u.value_column.clone());

    let mut out = Vec::with_capacity(data.rows.len() * cols.len());
    for row in &data.rows {
        for (name, &c) in names.iter().zip(&cols) {
            let mut exploded: Vec<CellValue> = kept.iter().map(|&i| row[i].clone()).collect();
            exploded.push(CellValue::Text(name.clone()));
            exploded.push(row[c].clone());
            out.push(exploded);
        }
    }
    data.labels = labels;
    data.rows = out;
    data.shape_changed = true;
    Ok(())
}
