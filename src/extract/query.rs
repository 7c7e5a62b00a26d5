//! `content query` commands and their output
//!
//! Android content providers are read over ADB with:
//!
//! ```text
//! content query --uri content://sms --projection _id:address:body \
//!     --where "_id>200" --sort "_id ASC LIMIT 200"
//! ```
//!
//! which prints one `Row: N col=value, col=value` line per row. Values are
//! not escaped: they may contain `, ` and even newlines, so rows are split
//! against the requested projection rather than on separators.

use std::collections::HashMap;

/// `--where` clause
#[derive(Debug, Clone, PartialEq)]
pub enum Selection {
    /// `column>value`, for keyset paging
    IdGreaterThan { column: String, value: u64 },
    /// `column IN (v1,v2,...)`
    ColumnIn { column: String, values: Vec<String> },
}

impl Selection {
    fn render(&self) -> String {
        match self {
            Selection::IdGreaterThan { column, value } => format!("{}>{}", column, value),
            Selection::ColumnIn { column, values } => {
                let rendered: Vec<String> = values
                    .iter()
                    .map(|v| {
                        if v.chars().all(|c| c.is_ascii_digit()) && !v.is_empty() {
                            v.clone()
                        } else {
                            format!("'{}'", v.replace('\'', "''"))
                        }
                    })
                    .collect();
                format!("{} IN ({})", column, rendered.join(","))
            }
        }
    }

    fn parse(text: &str) -> Option<Selection> {
        if let Some((column, rest)) = text.split_once(" IN ") {
            let inner = rest.trim().strip_prefix('(')?.strip_suffix(')')?;
            let values = inner
                .split(',')
                .map(|v| v.trim().trim_matches('\'').replace("''", "'"))
                .filter(|v| !v.is_empty())
                .collect();
            return Some(Selection::ColumnIn {
                column: column.trim().to_string(),
                values,
            });
        }
        let (column, value) = text.split_once('>')?;
        Some(Selection::IdGreaterThan {
            column: column.trim().to_string(),
            value: value.trim().parse().ok()?,
        })
    }
}

/// A `content query` invocation
#[derive(Debug, Clone, PartialEq)]
pub struct ContentQuery {
    pub uri: String,
    pub projection: Vec<String>,
    pub selection: Option<Selection>,
    pub sort: Option<String>,
    pub limit: Option<usize>,
}

impl ContentQuery {
    pub fn new(uri: &str, projection: &[&str]) -> Self {
        Self {
            uri: uri.to_string(),
            projection: projection.iter().map(|c| c.to_string()).collect(),
            selection: None,
            sort: None,
            limit: None,
        }
    }

    pub fn with_selection(mut self, selection: Selection) -> Self {
        self.selection = Some(selection);
        self
    }

    pub fn sorted_by(mut self, sort: &str) -> Self {
        self.sort = Some(sort.to_string());
        self
    }

    /// Appended to the sort clause; providers ignoring it return everything
    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Shell command line for `adb shell`
    pub fn to_command(&self) -> String {
        let mut command = format!(
            "content query --uri {} --projection {}",
            self.uri,
            self.projection.join(":")
        );
        if let Some(selection) = &self.selection {
            command.push_str(&format!(" --where \"{}\"", selection.render()));
        }
        let sort = match (&self.sort, self.limit) {
            (Some(sort), Some(limit)) => Some(format!("{} LIMIT {}", sort, limit)),
            (Some(sort), None) => Some(sort.clone()),
            (None, Some(limit)) => Some(format!("_id ASC LIMIT {}", limit)),
            (None, None) => None,
        };
        if let Some(sort) = sort {
            command.push_str(&format!(" --sort \"{}\"", sort));
        }
        command
    }

    /// Inverse of [`ContentQuery::to_command`]
    pub fn parse_command(command: &str) -> Option<ContentQuery> {
        let tokens = tokenize(command);
        let mut iter = tokens.iter();
        if iter.next().map(String::as_str) != Some("content")
            || iter.next().map(String::as_str) != Some("query")
        {
            return None;
        }

        let mut query = ContentQuery::new("", &[]);
        while let Some(flag) = iter.next() {
            let value = iter.next()?;
            match flag.as_str() {
                "--uri" => query.uri = value.clone(),
                "--projection" => {
                    query.projection = value.split(':').map(str::to_string).collect();
                }
                "--where" => query.selection = Some(Selection::parse(value)?),
                "--sort" => match value.split_once(" LIMIT ") {
                    Some((sort, limit)) => {
                        query.sort = Some(sort.trim().to_string());
                        query.limit = Some(limit.trim().parse().ok()?);
                    }
                    None => query.sort = Some(value.clone()),
                },
                _ => return None,
            }
        }
        (!query.uri.is_empty()).then_some(query)
    }
}

/// Split on whitespace, honouring double quotes
fn tokenize(command: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut quoted = false;
    for c in command.chars() {
        match c {
            '"' => quoted = !quoted,
            c if c.is_whitespace() && !quoted => {
                if !current.is_empty() {
                    tokens.push(std::mem::take(&mut current));
                }
            }
            c => current.push(c),
        }
    }
    if !current.is_empty() {
        tokens.push(current);
    }
    tokens
}

/// One parsed output row; absent and `NULL` values are `None`
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ContentRow {
    values: HashMap<String, Option<String>>,
}

impl ContentRow {
    pub fn from_pairs<'a>(pairs: impl IntoIterator<Item = (&'a str, Option<&'a str>)>) -> Self {
        Self {
            values: pairs
                .into_iter()
                .map(|(k, v)| (k.to_string(), v.map(str::to_string)))
                .collect(),
        }
    }

    pub fn get(&self, column: &str) -> Option<&str> {
        self.values.get(column).and_then(|v| v.as_deref())
    }

    pub fn get_u64(&self, column: &str) -> Option<u64> {
        self.get(column).and_then(|v| v.trim().parse().ok())
    }

    pub fn get_i64(&self, column: &str) -> Option<i64> {
        self.get(column).and_then(|v| v.trim().parse().ok())
    }
}

/// A row that could not be split against the projection
#[derive(Debug, Clone, PartialEq)]
pub struct MalformedRow {
    pub line: String,
    pub reason: String,
}

/// Result of parsing a whole `content query` output
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryOutput {
    pub rows: Vec<ContentRow>,
    pub malformed: Vec<MalformedRow>,
}

impl QueryOutput {
    /// Rows seen on the wire, including malformed ones
    pub fn raw_count(&self) -> usize {
        self.rows.len() + self.malformed.len()
    }
}

/// Parse `content query` output against the requested projection
pub fn parse_rows(output: &str, projection: &[String]) -> QueryOutput {
    let mut raw_rows: Vec<String> = Vec::new();
    for line in output.lines() {
        if line.starts_with("Row: ") {
            raw_rows.push(line.to_string());
        } else if let Some(last) = raw_rows.last_mut() {
            last.push('\n');
            last.push_str(line);
        }
    }

    let mut parsed = QueryOutput::default();
    for raw in raw_rows {
        match split_row(&raw, projection) {
            Ok(row) => parsed.rows.push(row),
            Err(reason) => parsed.malformed.push(MalformedRow { line: raw, reason }),
        }
    }
    parsed
}

fn split_row(raw: &str, projection: &[String]) -> Result<ContentRow, String> {
    let body = raw
        .strip_prefix("Row: ")
        .and_then(|rest| rest.split_once(' ').map(|(_, cols)| cols))
        .ok_or_else(|| "missing row header".to_string())?;

    let mut values = HashMap::new();
    let mut rest = body;
    for (index, column) in projection.iter().enumerate() {
        let marker = format!("{}=", column);
        rest = rest
            .strip_prefix(&marker)
            .ok_or_else(|| format!("expected column '{}'", column))?;

        let value = match projection.get(index + 1) {
            Some(next) => {
                let next_marker = format!(", {}=", next);
                let end = rest
                    .find(&next_marker)
                    .ok_or_else(|| format!("expected column '{}'", next))?;
                let value = &rest[..end];
                rest = &rest[end + 2..];
                value
            }
            None => std::mem::take(&mut rest),
        };
        let value = (value != "NULL").then(|| value.to_string());
        values.insert(column.clone(), value);
    }
    Ok(ContentRow { values })
}

/// Render rows the way `content query` prints them
pub fn render_rows(rows: &[ContentRow], projection: &[String]) -> String {
    if rows.is_empty() {
        return "No result found.\n".to_string();
    }
    let mut out = String::new();
    for (index, row) in rows.iter().enumerate() {
        let columns: Vec<String> = projection
            .iter()
            .map(|c| format!("{}={}", c, row.get(c).unwrap_or("NULL")))
            .collect();
        out.push_str(&format!("Row: {} {}\n", index, columns.join(", ")));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn projection(cols: &[&str]) -> Vec<String> {
        cols.iter().map(|c| c.to_string()).collect()
    }

    #[test]
    fn test_to_command() {
        let query = ContentQuery::new("content://sms", &["_id", "address", "body"])
            .with_selection(Selection::IdGreaterThan {
                column: "_id".to_string(),
                value: 200,
            })
            .sorted_by("_id ASC")
            .with_limit(50);
        assert_eq!(
            query.to_command(),
            "content query --uri content://sms --projection _id:address:body --where \"_id>200\" --sort \"_id ASC LIMIT 50\""
        );
    }

    #[test]
    fn test_command_round_trip_with_in_clause() {
        let query = ContentQuery::new("content://com.android.contacts/data", &["contact_id", "data1"])
            .with_selection(Selection::ColumnIn {
                column: "contact_id".to_string(),
                values: vec!["3".to_string(), "7".to_string()],
            });
        let parsed = ContentQuery::parse_command(&query.to_command()).unwrap();
        assert_eq!(parsed, query);
    }

    #[test]
    fn test_parse_command_rejects_other_commands() {
        assert!(ContentQuery::parse_command("echo ok").is_none());
        assert!(ContentQuery::parse_command("content query --projection _id").is_none());
    }

    #[test]
    fn test_parse_rows_with_commas_newlines_and_null() {
        let output = "Row: 0 _id=1, address=+15551234567, body=Hello, world\n\
                      Row: 1 _id=2, address=NULL, body=line one\nline two\n";
        let parsed = parse_rows(output, &projection(&["_id", "address", "body"]));
        assert!(parsed.malformed.is_empty());
        assert_eq!(parsed.rows.len(), 2);
        assert_eq!(parsed.rows[0].get("body"), Some("Hello, world"));
        assert_eq!(parsed.rows[0].get_u64("_id"), Some(1));
        assert_eq!(parsed.rows[1].get("address"), None);
        assert_eq!(parsed.rows[1].get("body"), Some("line one\nline two"));
    }

    #[test]
    fn test_parse_rows_reports_malformed() {
        let output = "Row: 0 _id=1, name=A\nRow: 1 garbage\n";
        let parsed = parse_rows(output, &projection(&["_id", "name"]));
        assert_eq!(parsed.rows.len(), 1);
        assert_eq!(parsed.malformed.len(), 1);
        assert_eq!(parsed.raw_count(), 2);
    }

    #[test]
    fn test_no_result() {
        let parsed = parse_rows("No result found.\n", &projection(&["_id"]));
        assert_eq!(parsed.raw_count(), 0);
    }

    #[test]
    fn test_render_then_parse() {
        let cols = projection(&["_id", "body"]);
        let rows = vec![ContentRow::from_pairs([("_id", Some("5")), ("body", Some("a, b"))])];
        let parsed = parse_rows(&render_rows(&rows, &cols), &cols);
        assert_eq!(parsed.rows, rows);
    }
}
