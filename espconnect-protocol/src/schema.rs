//! Window schemas and CSV row conversion.

use crate::xml::XmlElement;
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::HashMap;

pub const OPCODE_FIELD: &str = "@opcode";
pub const COUNTER_FIELD: &str = "@counter";
pub const TIMESTAMP_FIELD: &str = "@timestamp";
pub const KEY_FIELD: &str = "@key";

/// Simplified type a server field maps to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogicalType {
    String,
    Int,
    Float,
    Date,
    DateTime,
    /// Wire types without a mapping keep their server name.
    Other(String),
}

impl LogicalType {
    pub fn is_date(&self) -> bool {
        matches!(self, LogicalType::Date)
    }

    pub fn is_time(&self) -> bool {
        matches!(self, LogicalType::DateTime)
    }
}

/// Classifies a server wire type: `(logical, is_number, is_array)`.
pub fn classify_wire_type(wire: &str) -> (LogicalType, bool, bool) {
    match wire {
        "utf8str" => (LogicalType::String, false, false),
        "int32" | "int64" => (LogicalType::Int, true, false),
        "double" | "money" => (LogicalType::Float, true, false),
        "array(dbl)" => (LogicalType::Float, true, true),
        "array(i32)" | "array(i64)" => (LogicalType::Int, true, true),
        "date" => (LogicalType::Date, false, false),
        "timestamp" => (LogicalType::DateTime, false, false),
        other => (LogicalType::Other(other.to_string()), false, false),
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Field {
    pub name: String,
    pub wire_type: String,
    pub logical: LogicalType,
    pub is_key: bool,
    pub is_number: bool,
    pub is_array: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

impl Field {
    pub fn new(name: impl Into<String>, wire_type: impl Into<String>, is_key: bool) -> Self {
        let wire_type = wire_type.into();
        let (logical, is_number, is_array) = classify_wire_type(&wire_type);
        Self {
            name: name.into(),
            wire_type,
            logical,
            is_key,
            is_number,
            is_array,
            label: None,
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }
}

/// Options for [`Schema::rows_from_csv`] and CSV publishing.
#[derive(Debug, Clone)]
pub struct CsvOptions {
    /// First line names the columns.
    pub header: bool,
    /// First column is a one-letter opcode (`i`, `u`, `p`, `d`).
    pub opcodes: bool,
    /// Second column holds flags and is skipped.
    pub flags: bool,
    /// Rows per publish block.
    pub blocksize: usize,
    /// Opcode applied to rows that do not carry one.
    pub default_opcode: String,
    /// Close the publisher once everything has been sent.
    pub close: bool,
    /// Milliseconds to wait between blocks; 0 sends them back to back.
    pub pause: u64,
}

impl Default for CsvOptions {
    fn default() -> Self {
        Self {
            header: false,
            opcodes: false,
            flags: false,
            blocksize: 1,
            default_opcode: "insert".to_string(),
            close: false,
            pause: 0,
        }
    }
}

/// Ordered field list of a window, with an index by name.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Schema {
    fields: Vec<Field>,
    index: HashMap<String, usize>,
}

impl Schema {
    pub fn new(fields: Vec<Field>) -> Self {
        let index = fields
            .iter()
            .enumerate()
            .map(|(i, f)| (f.name.clone(), i))
            .collect();
        Self { fields, index }
    }

    /// Builds from a JSON schema body: `{"fields": [{"@name", "@type", "@key"}]}`.
    ///
    /// Plain `name`/`type`/`key` member names are accepted too.
    pub fn from_json(body: &Value) -> Self {
        let fields = body
            .get("fields")
            .and_then(Value::as_array)
            .map(|list| list.iter().filter_map(field_from_json).collect())
            .unwrap_or_default();
        Self::new(fields)
    }

    /// Builds from any element containing `fields/field` descendants.
    pub fn from_xml(element: &XmlElement) -> Self {
        let fields = element
            .find_all(".//fields/field")
            .into_iter()
            .filter_map(|f| {
                let name = f.attr("name")?;
                let mut field = Field::new(
                    name,
                    f.attr("type").unwrap_or(""),
                    f.attr("key") == Some("true"),
                );
                if let Some(label) = f.attr("label") {
                    field.label = Some(label.to_string());
                }
                Some(field)
            })
            .collect();
        Self::new(fields)
    }

    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    pub fn field(&self, name: &str) -> Option<&Field> {
        self.index.get(name).map(|&i| &self.fields[i])
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn columns(&self) -> Vec<&str> {
        self.fields.iter().map(|f| f.name.as_str()).collect()
    }

    pub fn key_fields(&self) -> impl Iterator<Item = &Field> {
        self.fields.iter().filter(|f| f.is_key)
    }

    pub fn key_field_names(&self) -> Vec<&str> {
        self.key_fields().map(|f| f.name.as_str()).collect()
    }

    /// Non-key fields.
    pub fn column_fields(&self) -> impl Iterator<Item = &Field> {
        self.fields.iter().filter(|f| !f.is_key)
    }

    /// Schema used by event streams: every server key is cleared and the
    /// stream columns `@counter` (the only key), `@timestamp` and `@opcode`
    /// lead the list.
    pub fn for_stream(&self) -> Schema {
        let mut fields = vec![
            Field::new(COUNTER_FIELD, "int32", true),
            Field::new(TIMESTAMP_FIELD, "timestamp", false),
            Field::new(OPCODE_FIELD, "utf8str", false),
        ];
        fields.extend(self.fields.iter().cloned().map(|mut f| {
            f.is_key = false;
            f
        }));
        Schema::new(fields)
    }

    /// Joins the key field values of a row with `-`. Missing keys are skipped.
    pub fn key_for(&self, row: &Map<String, Value>) -> String {
        self.key_fields()
            .filter_map(|f| row.get(&f.name))
            .map(value_text)
            .collect::<Vec<_>>()
            .join("-")
    }

    /// Converts CSV text into rows.
    ///
    /// Lines are trimmed and blank lines skipped. `/* ... */` comment blocks
    /// (each marker on its own line) are ignored. Double quotes group text
    /// containing commas; a backslash escapes a quote or another backslash.
    /// Without a header, values map positionally onto schema fields after
    /// the optional opcode and flags columns.
    pub fn rows_from_csv(&self, csv: &str, options: &CsvOptions) -> Vec<Map<String, Value>> {
        let mut lines = csv.split('\n');
        let headers: Option<Vec<String>> = if options.header {
            lines
                .next()
                .map(|h| h.trim().split(',').map(|s| s.trim().to_string()).collect())
        } else {
            None
        };

        let mut rows = Vec::new();
        let mut in_comment = false;

        for line in lines {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            if in_comment {
                if line.starts_with("*/") {
                    in_comment = false;
                }
                continue;
            }
            if line.starts_with("/*") {
                in_comment = true;
                continue;
            }

            let values = split_csv_line(line);
            let mut row = Map::new();

            if let Some(headers) = &headers {
                for (name, value) in headers.iter().zip(values) {
                    if self.field(name).is_some() {
                        row.insert(name.clone(), Value::String(value));
                    }
                }
            } else {
                let mut next_field = 0;
                for (j, value) in values.into_iter().enumerate() {
                    if options.opcodes && j == 0 {
                        let opcode = match value.to_ascii_lowercase().as_str() {
                            "u" => Some("update"),
                            "p" => Some("upsert"),
                            "d" => Some("delete"),
                            _ => None,
                        };
                        if let Some(op) = opcode {
                            row.insert(OPCODE_FIELD.to_string(), Value::from(op));
                        }
                        continue;
                    }
                    if options.flags && j == 1 {
                        continue;
                    }
                    if let Some(field) = self.fields.get(next_field) {
                        row.insert(field.name.clone(), Value::String(value));
                    }
                    next_field += 1;
                }
            }
            rows.push(row);
        }

        rows
    }
}

fn field_from_json(f: &Value) -> Option<Field> {
    let lookup = |a: &str, b: &str| f.get(a).or_else(|| f.get(b));
    let name = lookup("@name", "name")?.as_str()?;
    let wire_type = lookup("@type", "type").and_then(Value::as_str).unwrap_or("");
    let is_key = match lookup("@key", "key") {
        Some(Value::String(s)) => s == "true",
        Some(Value::Bool(b)) => *b,
        _ => false,
    };
    let mut field = Field::new(name, wire_type, is_key);
    if let Some(label) = f.get("label").and_then(Value::as_str) {
        field.label = Some(label.to_string());
    }
    Some(field)
}

/// Text form of a scalar value, as used in keys.
pub fn value_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn split_csv_line(line: &str) -> Vec<String> {
    let mut values = Vec::new();
    let mut word = String::new();
    let mut quoted = false;
    let mut prev = '\0';

    for c in line.chars() {
        match c {
            ',' if !quoted => values.push(std::mem::take(&mut word)),
            '"' if prev == '\\' => word.push('"'),
            '"' => quoted = !quoted,
            '\\' if prev == '\\' => word.push('\\'),
            '\\' => {}
            _ => word.push(c),
        }
        prev = c;
    }
    if !word.is_empty() {
        values.push(word);
    }
    values
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn trades() -> Schema {
        Schema::new(vec![
            Field::new("id", "int64", true),
            Field::new("symbol", "utf8str", false),
            Field::new("price", "double", false),
        ])
    }

    #[test]
    fn test_type_table() {
        assert_eq!(classify_wire_type("utf8str"), (LogicalType::String, false, false));
        assert_eq!(classify_wire_type("int32"), (LogicalType::Int, true, false));
        assert_eq!(classify_wire_type("money"), (LogicalType::Float, true, false));
        assert_eq!(classify_wire_type("array(dbl)"), (LogicalType::Float, true, true));
        assert_eq!(classify_wire_type("array(i64)"), (LogicalType::Int, true, true));
        assert!(classify_wire_type("date").0.is_date());
        assert!(classify_wire_type("timestamp").0.is_time());
        assert_eq!(
            classify_wire_type("blob"),
            (LogicalType::Other("blob".to_string()), false, false)
        );
    }

    #[test]
    fn test_from_json() {
        let schema = Schema::from_json(&json!({
            "fields": [
                {"@name": "id", "@type": "int64", "@key": "true"},
                {"@name": "symbol", "@type": "utf8str", "@key": "false"},
                {"name": "qty", "type": "int32"}
            ]
        }));
        assert_eq!(schema.columns(), vec!["id", "symbol", "qty"]);
        assert_eq!(schema.key_field_names(), vec!["id"]);
        assert!(schema.field("qty").unwrap().is_number);
        assert_eq!(schema.column_fields().count(), 2);
    }

    #[test]
    fn test_from_xml() {
        let xml = XmlElement::parse(
            r#"<schema><fields><field name="a" type="int32" key="true"/><field name="b" type="double"/></fields></schema>"#,
        )
        .unwrap();
        let schema = Schema::from_xml(&xml);
        assert_eq!(schema.len(), 2);
        assert!(schema.field("a").unwrap().is_key);
        assert_eq!(schema.field("b").unwrap().logical, LogicalType::Float);
    }

    #[test]
    fn test_stream_schema_order() {
        let stream = trades().for_stream();
        assert_eq!(
            stream.columns(),
            vec!["@counter", "@timestamp", "@opcode", "id", "symbol", "price"]
        );
        assert_eq!(stream.key_field_names(), vec!["@counter"]);
    }

    #[test]
    fn test_key_for() {
        let schema = Schema::new(vec![
            Field::new("a", "utf8str", true),
            Field::new("b", "int32", true),
            Field::new("c", "double", false),
        ]);
        let row = json!({"a": "x", "b": 7, "c": 1.5});
        assert_eq!(schema.key_for(row.as_object().unwrap()), "x-7");
    }

    #[test]
    fn test_csv_positional_with_opcodes_and_flags() {
        let csv = "i,n,1,IBM,100.5\nu,n,2,\"A,B\",3\n\n/*\n9,skip,0\n*/\nd,n,3,X,0\n";
        let options = CsvOptions {
            opcodes: true,
            flags: true,
            ..Default::default()
        };
        let rows = trades().rows_from_csv(csv, &options);
        assert_eq!(rows.len(), 3);
        assert!(rows[0].get("@opcode").is_none());
        assert_eq!(rows[0]["symbol"], json!("IBM"));
        assert_eq!(rows[1]["@opcode"], json!("update"));
        assert_eq!(rows[1]["symbol"], json!("A,B"));
        assert_eq!(rows[2]["@opcode"], json!("delete"));
        assert_eq!(rows[2]["id"], json!("3"));
    }

    #[test]
    fn test_csv_with_header() {
        let csv = "symbol,unknown,id\nIBM,zzz,1\n";
        let options = CsvOptions {
            header: true,
            ..Default::default()
        };
        let rows = trades().rows_from_csv(csv, &options);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["symbol"], json!("IBM"));
        assert_eq!(rows[0]["id"], json!("1"));
        assert!(rows[0].get("unknown").is_none());
    }

    #[test]
    fn test_csv_escapes() {
        let values = split_csv_line(r#"a\"b,"c, d",e\\f"#);
        assert_eq!(values, vec!["a\"b", "c, d", "e\\f"]);
    }
}
