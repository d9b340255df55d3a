//! Text renderings of a shaped result for the command line.

use crate::shaping::DataSet;
use crate::value::CellValue;

pub fn to_csv(data: &DataSet) -> String {
    let mut output = String::new();

    let headers: Vec<String> = data.labels.iter().map(|l| csv_escape(l)).collect();
    output.push_str(&headers.join(","));
    output.push('\n');

    for row in &data.rows {
        let cells: Vec<String> = row.iter().map(|cell| csv_escape(&cell_text(cell))).collect();
        output.push_str(&cells.join(","));
        output.push('\n');
    }

    output
}

pub fn to_tsv(data: &DataSet) -> String {
    let mut output = String::new();

    output.push_str(&data.labels.join("\t"));
    output.push('\n');

    for row in &data.rows {
        let cells: Vec<String> = row
            .iter()
            .map(|cell| cell_text(cell).replace(['\t', '\n'], " "))
            .collect();
        output.push_str(&cells.join("\t"));
        output.push('\n');
    }

    output
}

/// Rows as a JSON array of objects in label order.
pub fn to_json(data: &DataSet) -> String {
    let rows: Vec<serde_json::Value> = data
        .rows
        .iter()
        .map(|row| {
            let obj: serde_json::Map<String, serde_json::Value> = data
                .labels
                .iter()
                .enumerate()
                .map(|(i, label)| {
                    let value = row.get(i).map(CellValue::to_json).unwrap_or_default();
                    (label.clone(), value)
                })
                .collect();
            serde_json::Value::Object(obj)
        })
        .collect();

    serde_json::to_string_pretty(&rows).unwrap_or_else(|_| "[]".to_string())
}

/// Aligned plain-text grid, padded by display width.
pub fn to_table(data: &DataSet) -> String {
    let mut widths: Vec<usize> = data
        .labels
        .iter()
        .map(|l| unicode_width::UnicodeWidthStr::width(l.as_str()))
        .collect();
    for row in &data.rows {
        for (i, cell) in row.iter().enumerate().take(widths.len()) {
            widths[i] = widths[i].max(cell.display_width());
        }
    }

    let line = |cells: Vec<(String, usize)>| -> String {
        let padded: Vec<String> = cells
            .into_iter()
            .zip(&widths)
            .map(|((text, width), max)| format!("{}{}", text, " ".repeat(max - width.min(*max))))
            .collect();
        padded.join(" | ").trim_end().to_string()
    };

    let mut output = String::new();
    output.push_str(&line(
        data.labels
            .iter()
            .map(|l| (l.clone(), unicode_width::UnicodeWidthStr::width(l.as_str())))
            .collect(),
    ));
    output.push('\n');
    let rule: Vec<String> = widths.iter().map(|w| "-".repeat(*w)).collect();
    output.push_str(&rule.join("-+-"));
    output.push('\n');
    for row in &data.rows {
        output.push_str(&line(row.iter().map(|c| (c.display(), c.display_width())).collect()));
        output.push('\n');
    }
    output.push_str(&format!("({} row{})\n", data.rows.len(), if data.rows.len() == 1 { "" } else { "s" }));
    output
}

fn cell_text(cell: &CellValue) -> String {
    match cell {
        CellValue::Null => String::new(),
        other => other.display(),
    }
}

fn csv_escape(s: &str) -> String {
    if s.contains(',') || s.contains('"') || s.contains('\n') || s.contains('\r') {
        format!("\"{}\"", s.replace('"', "\"\""))
    } else {
        s.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn data() -> DataSet {
        DataSet::new(
            vec!["id".into(), "name".into(), "active".into()],
            vec![
                vec![CellValue::Int32(1), "Alice".into(), CellValue::Bool(true)],
                vec![CellValue::Int32(2), "Bob".into(), CellValue::Null],
            ],
        )
    }

    #[test]
    fn test_csv_export() {
        let csv = to_csv(&data());
        assert!(csv.starts_with("id,name,active\n"));
        assert!(csv.contains("1,Alice,true\n"));
        assert!(csv.contains("2,Bob,\n"));
    }

    #[test]
    fn test_csv_escaping() {
        assert_eq!(csv_escape("hello"), "hello");
        assert_eq!(csv_escape("hello,world"), "\"hello,world\"");
        assert_eq!(csv_escape("say \"hi\""), "\"say \"\"hi\"\"\"");
    }

    #[test]
    fn test_tsv_export() {
        let tsv = to_tsv(&data());
        assert!(tsv.starts_with("id\tname\tactive\n"));
        assert!(tsv.contains("1\tAlice\ttrue\n"));
    }

    #[test]
    fn test_json_export() {
        let json = to_json(&data());
        let parsed: Vec<serde_json::Value> = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[0]["id"], 1);
        assert_eq!(parsed[0]["name"], "Alice");
        assert_eq!(parsed[0]["active"], true);
        assert!(parsed[1]["active"].is_null());
    }

    #[test]
    fn test_table_alignment() {
        let table = to_table(&data());
        let lines: Vec<&str> = table.lines().collect();
        assert_eq!(lines[0], "id | name  | active");
        assert_eq!(lines[2], "1  | Alice | true");
        assert_eq!(lines.last().copied(), Some("(2 rows)"));
    }
}
