use super::DataSet;
use crate::config::{ChainRelative, ColsChain, RowsChain};
use crate::error::{EngineError, Result};
use crate::value::CellValue;

fn ratio(current: &CellValue, previous: &CellValue, multiply: f64) -> CellValue {
    match (current.as_f64(), previous.as_f64()) {
        (Some(cur), Some(prev)) if prev != 0.0 => CellValue::Float64((cur - prev) / prev * multiply),
        _ => CellValue::Null,
    }
}

fn ratio_label(label: &str) -> String {
    format!("{}_ratio", label)
}

pub fn apply(data: &mut DataSet, chain: &ChainRelative) -> Result<()> {
    match chain {
        ChainRelative::Rows(rows) => rows_chain(data, rows)?,
        ChainRelative::Cols(cols) => cols_chain(data, cols)?,
    }
    data.shape_changed = true;
    Ok(())
}

/// Change of each listed column against the previous row (the next row
/// when `reverse`), restarting whenever the group column changes.
pub fn rows_chain(data: &mut DataSet, chain: &RowsChain) -> Result<()> {
    let mut cols = Vec::with_capacity(chain.columns.len());
    for column in &chain.columns {
        cols.push(data.column_index(column).ok_or_else(|| {
            EngineError::mapping(format!("chain column `{}` is not in the result", column))
        })?);
    }
    let group = match &chain.group_column {
        Some(g) => Some(data.column_index(g).ok_or_else(|| {
            EngineError::mapping(format!("chain group column `{}` is not in the result", g))
        })?),
        None => None,
    };

    let n = data.rows.len();
    let mut ratios = vec![vec![CellValue::Null; cols.len()]; n];
    for i in 0..n {
        let neighbour = if chain.reverse {
            (i + 1 < n).then_some(i + 1)
        } else {
            i.checked_sub(1)
        };
        let Some(j) = neighbour else {
            continue;
        };
        if let Some(g) = group {
            if data.rows[i][g].key_string() != data.rows[j][g].key_string() {
                continue;
            }
        }
        for (k, &c) in cols.iter().enumerate() {
            ratios[i][k] = ratio(&data.rows[i][c], &data.rows[j][c], chain.multiply);
        }
    }

    if !chain.insert {
        for (row, values) in data.rows.iter_mut().zip(ratios) {
            for (&c, value) in cols.iter().zip(values) {
                row[c] = value;
            }
        }
        return Ok(());
    }
    // insert from the rightmost column so earlier indexes stay valid
    let mut order: Vec<usize> = (0..cols.len()).collect();
    order.sort_by(|a, b| cols[*b].cmp(&cols[*a]));
    for k in order {
        let at = cols[k] + 1;
        data.labels.insert(at, ratio_label(&data.labels[cols[k]]));
        for (row, values) in data.rows.iter_mut().zip(&ratios) {
            row.insert(at, values[k].clone());
        }
    }
    Ok(())
}

/// Change between repeating column groups: the value at `relative_index`
/// of each group of `group_size` columns (starting at `start_column`) is
/// compared with the same position of the previous group.
pub fn cols_chain(data: &mut DataSet, chain: &ColsChain) -> Result<()> {
    let start = data.column_index(&chain.start_column).ok_or_else(|| {
        EngineError::mapping(format!(
            "chain start column `{}` is not in the result",
            chain.start_column
        ))
    })?;
    if chain.group_size == 0 || chain.relative_index >= chain.group_size {
        return Err(EngineError::mapping(format!(
            "chain relative index {} does not fit group size {}",
            chain.relative_index, chain.group_size
        )));
    }
    let groups = (data.labels.len() - start) / chain.group_size;
    let targets: Vec<usize> = (0..groups)
        .map(|g| start + g * chain.group_size + chain.relative_index)
        .collect();

    let ratios: Vec<Vec<CellValue>> = data
        .rows
        .iter()
        .map(|row| {
            targets
                .iter()
                .enumerate()
                .map(|(g, &c)| match g.checked_sub(1) {
                    Some(p) => ratio(&row[c], &row[targets[p]], chain.multiply),
                    None => CellValue::Null,
                })
                .collect()
        })
        .collect();

    if !chain.insert {
        for (row, values) in data.rows.iter_mut().zip(ratios) {
            for (&c, value) in targets.iter().zip(values).skip(1) {
                row[c] = value;
            }
        }
        return Ok(());
    }
    for (k, &c) in targets.iter().enumerate().rev() {
        data.labels.insert(c + 1, ratio_label(&data.labels[c]));
        for (row, values) in data.rows.iter_mut().zip(&ratios) {
            row.insert(c + 1, values[k].clone());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn monthly() -> DataSet {
        DataSet::new(
            vec!["shop".into(), "month".into(), "sales".into()],
            vec![
                vec!["a".into(), "01".into(), 100.into()],
                vec!["a".into(), "02".into(), 150.into()],
                vec!["b".into(), "01".into(), 0.into()],
                vec!["b".into(), "02".into(), 10.into()],
            ],
        )
    }

    fn rows(insert: bool, reverse: bool) -> ChainRelative {
        ChainRelative::Rows(RowsChain {
            columns: vec!["sales".into()],
            group_column: Some("shop".into()),
            reverse,
            multiply: 100.0,
            insert,
        })
    }

    #[test]
    fn test_rows_chain_inserts_ratio_column() {
        let mut d = monthly();
        apply(&mut d, &rows(true, false)).unwrap();
        assert_eq!(d.labels, vec!["shop", "month", "sales", "sales_ratio"]);
        assert!(d.rows[0][3].is_null());
        assert_eq!(d.rows[1][3], CellValue::Float64(50.0));
        // group boundary and zero base
        assert!(d.rows[2][3].is_null());
        assert!(d.rows[3][3].is_null());
        assert!(d.shape_changed && d.is_consistent());
    }

    #[test]
    fn test_rows_chain_reverse_in_place() {
        let mut d = monthly();
        apply(&mut d, &rows(false, true)).unwrap();
        assert_eq!(d.width(), 3);
        let expected = (100.0 - 150.0) / 150.0 * 100.0;
        assert_eq!(d.rows[0][2], CellValue::Float64(expected));
        assert!(d.rows[1][2].is_null());
    }

    #[test]
    fn test_cols_chain() {
        let mut d = DataSet::new(
            vec!["shop".into(), "jan_qty".into(), "jan_amt".into(), "feb_qty".into(), "feb_amt".into()],
            vec![vec!["a".into(), 4.into(), 40.into(), 5.into(), 60.into()]],
        );
        let chain = ChainRelative::Cols(ColsChain {
            start_column: "jan_qty".into(),
            group_size: 2,
            relative_index: 1,
            multiply: 1.0,
            insert: true,
        });
        apply(&mut d, &chain).unwrap();
        assert_eq!(
            d.labels,
            vec!["shop", "jan_qty", "jan_amt", "jan_amt_ratio", "feb_qty", "feb_amt", "feb_amt_ratio"]
        );
        assert!(d.rows[0][3].is_null());
        assert_eq!(d.rows[0][6], CellValue::Float64(0.5));
    }
}
