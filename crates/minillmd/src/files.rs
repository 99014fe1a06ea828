//! Text extraction for uploaded training data.

use serde::{Deserialize, Serialize};

use crate::error::{DaemonError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileType {
    Txt,
    Csv,
}

/// Classify by extension: `txt`, `text` and `md` are plain text.
pub fn file_type(filename: &str) -> Result<FileType> {
    let ext = filename
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "txt" | "text" | "md" => Ok(FileType::Txt),
        "csv" => Ok(FileType::Csv),
        _ => Err(DaemonError::BadRequest(format!(
            "unsupported file extension: .{ext}"
        ))),
    }
}

/// Plain text passes through. CSV rows become lines with their fields
/// joined by single spaces.
pub fn extract_text(content: &str, kind: FileType) -> String {
    match kind {
        FileType::Txt => content.to_string(),
        FileType::Csv => content
            .lines()
            .map(|line| split_csv_row(line).join(" "))
            .collect::<Vec<_>>()
            .join("\n"),
    }
}

/// Split one CSV row, honouring double-quoted fields and `""` escapes.
fn split_csv_row(line: &str) -> Vec<String> {
    let mut fields = Vec::new();
    let mut cur = String::new();
    let mut quoted = false;
    let mut chars = line.trim_end_matches('\r').chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '"' if quoted && chars.peek() == Some(&'"') => {
                cur.push('"');
                chars.next();
            }
            '"' => quoted = !quoted,
            ',' if !quoted => fields.push(std::mem::take(&mut cur)),
            _ => cur.push(c),
        }
    }
    fields.push(cur);
    fields
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extensions_are_classified() {
        assert_eq!(file_type("notes.TXT").ok(), Some(FileType::Txt));
        assert_eq!(file_type("readme.md").ok(), Some(FileType::Txt));
        assert_eq!(file_type("rows.csv").ok(), Some(FileType::Csv));
        assert!(file_type("paper.pdf").is_err());
        assert!(file_type("noext").is_err());
    }

    #[test]
    fn csv_rows_are_joined_with_spaces() {
        let text = extract_text("a,b,c\r\n\"x, y\",z\n", FileType::Csv);
        assert_eq!(text, "a b c\nx, y z");
    }

    #[test]
    fn escaped_quotes_survive() {
        assert_eq!(split_csv_row(r#""say ""hi""",ok"#), vec![r#"say "hi""#, "ok"]);
    }
}
