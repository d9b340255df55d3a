use std::collections::HashSet;

use super::DataSet;
use crate::config::{Align, Decorate, Link};
use crate::error::{EngineError, Result};
use crate::exec::ExecutionContext;
use crate::value::CellValue;

fn decorate(fragment: String, decorate: Option<&Decorate>) -> String {
    let Some(d) = decorate else {
        return fragment;
    };
    let len = fragment.chars().count();
    if len >= d.size {
        return fragment;
    }
    let fill: String = std::iter::repeat(d.fill).take(d.size - len).collect();
    match d.align {
        Align::Left => fragment + &fill,
        Align::Right => fill + &fragment,
    }
}

/// Concatenates one linked column across a group.
struct Linker {
    idx: usize,
    fragments: Vec<String>,
    seen: HashSet<String>,
}

impl Linker {
    fn push(&mut self, value: &CellValue, link: &Link) {
        // nulls add no fragment and no separator
        if value.is_null() {
            return;
        }
        let fragment = value.display();
        if link.distinct && !self.seen.insert(fragment.clone()) {
            return;
        }
        self.fragments
            .push(decorate(fragment, link.decorate.as_ref()));
    }

    fn take(&mut self, sign: &str) -> CellValue {
        self.seen.clear();
        CellValue::Text(std::mem::take(&mut self.fragments).join(sign))
    }
}

/// Collapse contiguous rows that share the id columns. Linked columns are
/// concatenated, every other column keeps the group's first value. With no
/// id columns the whole result is one group.
pub fn apply(data: &mut DataSet, link: &Link, ctx: &mut ExecutionContext) -> Result<()> {
    let mut linkers = Vec::with_capacity(link.columns.len());
    for column in &link.columns {
        let idx = data.column_index(column).ok_or_else(|| {
            EngineError::mapping(format!("link column `{}` is not in the result", column))
        })?;
        linkers.push(Linker {
            idx,
            fragments: Vec::new(),
            seen: HashSet::new(),
        });
    }
    let mut id_idx = Vec::with_capacity(link.id_columns.len());
    for column in &link.id_columns {
        id_idx.push(data.column_index(column).ok_or_else(|| {
            EngineError::mapping(format!("link id column `{}` is not in the result", column))
        })?);
    }

    let input = std::mem::take(&mut data.rows);
    let before = input.len();
    let mut out: Vec<Vec<CellValue>> = Vec::new();
    let mut current: Option<Vec<String>> = None;
    for row in input {
        let identity: Vec<String> = id_idx.iter().map(|&i| row[i].key_string()).collect();
        if current.as_ref() != Some(&identity) {
            if let Some(last) = out.last_mut() {
                for l in &mut linkers {
                    last[l.idx] = l.take(&link.sign);
                }
            }
            current = Some(identity);
            for l in &mut linkers {
                l.push(&row[l.idx], link);
            }
            out.push(row);
        } else {
            for l in &mut linkers {
                l.push(&row[l.idx], link);
            }
        }
    }
    if let Some(last) = out.last_mut() {
        for l in &mut linkers {
            last[l.idx] = l.take(&link.sign);
        }
    }
    if out.len() != before {
        ctx.log(format!("linked {} row(s) into {}", before, out.len()));
    }
    data.rows = out;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineSettings;

    fn ctx() -> ExecutionContext {
        ExecutionContext::start("find", "q", &EngineSettings::default())
    }

    fn tags(rows: Vec<(i32, &str)>) -> DataSet {
        DataSet::new(
            vec!["id".into(), "tag".into()],
            rows.into_iter()
                .map(|(id, tag)| vec![id.into(), tag.into()])
                .collect(),
        )
    }

    #[test]
    fn test_groups_are_contiguous() {
        let mut d = tags(vec![(1, "a"), (1, "b"), (2, "c")]);
        apply(&mut d, &Link::new(["tag"]).id_columns(["id"]), &mut ctx()).unwrap();
        assert_eq!(
            d.rows,
            vec![
                vec![CellValue::Int32(1), "a,b".into()],
                vec![CellValue::Int32(2), "c".into()],
            ]
        );

        // a repeated id after a break starts a new group
        let mut d = tags(vec![(1, "a"), (2, "b"), (1, "c")]);
        apply(&mut d, &Link::new(["tag"]).id_columns(["id"]), &mut ctx()).unwrap();
        assert_eq!(d.rows.len(), 3);
    }

    #[test]
    fn test_distinct_decorate_and_null_identity() {
        let mut d = DataSet::new(
            vec!["dept".into(), "code".into(), "name".into()],
            vec![
                vec![CellValue::Null, "7".into(), "x".into()],
                vec![CellValue::Null, "7".into(), "y".into()],
                vec![CellValue::Null, "12".into(), CellValue::Null],
            ],
        );
        let mut link = Link::new(["code", "name"]).id_columns(["dept"]).sign("|").distinct();
        link.decorate = Some(Decorate {
            fill: '0',
            size: 3,
            align: Align::Right,
        });
        apply(&mut d, &link, &mut ctx()).unwrap();
        assert_eq!(d.rows.len(), 1);
        assert_eq!(d.rows[0][1], CellValue::from("007|012"));
        assert_eq!(d.rows[0][2], CellValue::from("00x|00y"));
    }

    #[test]
    fn test_null_fragments_leave_no_gap() {
        let mut d = DataSet::new(
            vec!["id".into(), "tag".into()],
            vec![
                vec![1.into(), "a".into()],
                vec![1.into(), CellValue::Null],
                vec![1.into(), "b".into()],
                vec![2.into(), CellValue::Null],
            ],
        );
        apply(&mut d, &Link::new(["tag"]).id_columns(["id"]), &mut ctx()).unwrap();
        assert_eq!(d.rows[0][1], CellValue::from("a,b"));
        // an all-null group links to an empty string, not null
        assert_eq!(d.rows[1][1], CellValue::from(""));
    }

    #[test]
    fn test_no_id_columns_links_everything() {
        let mut d = tags(vec![(1, "a"), (2, "b")]);
        apply(&mut d, &Link::new(["tag"]).sign(";"), &mut ctx()).unwrap();
        assert_eq!(d.rows, vec![vec![CellValue::Int32(1), "a;b".into()]]);
        assert!(apply(&mut tags(vec![]), &Link::new(["missing"]), &mut ctx()).is_err());
    }
}
