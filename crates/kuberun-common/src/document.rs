//! Workload descriptor documents
//!
//! Descriptors are read from YAML (via yaml-rust2) or JSON into a
//! `serde_json::Value` tree, and written back in the format they were read in
//! so that a persisted copy can be re-applied verbatim.

use std::fmt;
use std::path::Path;

use serde_json::{Map, Number, Value};
use yaml_rust2::{Yaml, YamlLoader};

use crate::Error;

/// On-disk format of a descriptor
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DocumentFormat {
    /// YAML document
    Yaml,
    /// JSON document
    Json,
}

impl DocumentFormat {
    /// File extension used when persisting a document in this format
    pub fn extension(&self) -> &'static str {
        match self {
            Self::Yaml => "yaml",
            Self::Json => "json",
        }
    }

    /// Guess the format from file contents: JSON objects start with `{`
    pub fn detect(contents: &str) -> Self {
        if contents.trim_start().starts_with('{') {
            Self::Json
        } else {
            Self::Yaml
        }
    }
}

impl fmt::Display for DocumentFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

/// A parsed descriptor together with the format it came from
#[derive(Clone, Debug, PartialEq)]
pub struct Document {
    /// The document tree
    pub value: Value,
    /// Format the document was read in
    pub format: DocumentFormat,
}

impl Document {
    /// Parse a document, detecting JSON vs YAML from its contents
    pub fn parse(contents: &str) -> Result<Self, Error> {
        let format = DocumentFormat::detect(contents);
        let value = match format {
            DocumentFormat::Json => serde_json::from_str(contents).map_err(|e| {
                Error::serialization_for_format("json", format!("invalid JSON: {}", e))
            })?,
            DocumentFormat::Yaml => parse_yaml(contents)?,
        };
        if !value.is_object() {
            return Err(Error::validation(
                "descriptor must be a mapping at the top level",
            ));
        }
        Ok(Self { value, format })
    }

    /// Read and parse a document from disk
    pub fn read(path: &Path) -> Result<Self, Error> {
        let contents = std::fs::read_to_string(path).map_err(|e| Error::io(path, e))?;
        Self::parse(&contents)
    }

    /// Render a tree in the given format
    pub fn render(value: &Value, format: DocumentFormat) -> Result<String, Error> {
        match format {
            DocumentFormat::Json => serde_json::to_string_pretty(value)
                .map_err(|e| Error::serialization_for_format("json", e.to_string())),
            DocumentFormat::Yaml => serde_yaml::to_string(value)
                .map_err(|e| Error::serialization_for_format("yaml", e.to_string())),
        }
    }

    /// Write a tree to disk in the given format
    pub fn write(path: &Path, value: &Value, format: DocumentFormat) -> Result<(), Error> {
        let rendered = Self::render(value, format)?;
        std::fs::write(path, rendered).map_err(|e| Error::io(path, e))
    }
}

/// Parse a YAML string into a serde_json::Value.
///
/// For multi-document YAML, returns only the first document.
/// Returns `Value::Null` for empty input.
pub fn parse_yaml(input: &str) -> Result<Value, Error> {
    let docs = YamlLoader::load_from_str(input)
        .map_err(|e| Error::serialization_for_format("yaml", e.to_string()))?;
    match docs.into_iter().next() {
        Some(doc) => yaml_to_json(doc),
        None => Ok(Value::Null),
    }
}

fn yaml_to_json(yaml: Yaml) -> Result<Value, Error> {
    match yaml {
        Yaml::Null => Ok(Value::Null),
        Yaml::Boolean(b) => Ok(Value::Bool(b)),
        Yaml::Integer(i) => Ok(Value::Number(i.into())),
        Yaml::Real(s) => {
            let f: f64 = s
                .parse()
                .map_err(|e: std::num::ParseFloatError| Error::serialization(e.to_string()))?;
            Ok(Number::from_f64(f)
                .map(Value::Number)
                .unwrap_or(Value::Null))
        }
        Yaml::String(s) => Ok(Value::String(s)),
        Yaml::Array(arr) => arr
            .into_iter()
            .map(yaml_to_json)
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        Yaml::Hash(map) => map
            .into_iter()
            .map(|(k, v)| {
                let key = match k {
                    Yaml::String(s) => s,
                    Yaml::Integer(i) => i.to_string(),
                    Yaml::Real(r) => r,
                    Yaml::Boolean(b) => b.to_string(),
                    Yaml::Null => "null".to_string(),
                    _ => {
                        return Err(Error::serialization_for_format(
                            "yaml",
                            "unsupported YAML key type",
                        ))
                    }
                };
                yaml_to_json(v).map(|v| (key, v))
            })
            .collect::<Result<Map<String, Value>, _>>()
            .map(Value::Object),
        Yaml::Alias(_) => Err(Error::serialization_for_format(
            "yaml",
            "YAML aliases not supported",
        )),
        Yaml::BadValue => Err(Error::serialization_for_format("yaml", "bad YAML value")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const POD_YAML: &str = r#"
apiVersion: v1
kind: Pod
metadata:
  name: hello
  labels:
    team: infra
spec:
  containers:
    - name: main
      image: busybox
      resources:
        limits:
          nvidia.com/gpu: 2
          cpu: 0.5
"#;

    #[test]
    fn parses_yaml_pod() {
        let doc = Document::parse(POD_YAML).unwrap();
        assert_eq!(doc.format, DocumentFormat::Yaml);
        assert_eq!(doc.value["kind"], "Pod");
        assert_eq!(doc.value["metadata"]["labels"]["team"], "infra");
        assert_eq!(
            doc.value["spec"]["containers"][0]["resources"]["limits"]["nvidia.com/gpu"],
            2
        );
        let cpu = doc.value["spec"]["containers"][0]["resources"]["limits"]["cpu"]
            .as_f64()
            .unwrap();
        assert!((cpu - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn parses_json_job() {
        let doc = Document::parse(
            r#"{"apiVersion":"batch/v1","kind":"Job","metadata":{"name":"j"},"spec":{"completions":3}}"#,
        )
        .unwrap();
        assert_eq!(doc.format, DocumentFormat::Json);
        assert_eq!(doc.value["spec"]["completions"], 3);
    }

    #[test]
    fn only_first_yaml_document_is_used() {
        let doc = Document::parse("kind: Pod\n---\nkind: Job\n").unwrap();
        assert_eq!(doc.value["kind"], "Pod");
    }

    #[test]
    fn rejects_non_mapping_documents() {
        assert!(Document::parse("- a\n- b\n").is_err());
        assert!(Document::parse("").is_err());
    }

    #[test]
    fn rejects_invalid_yaml() {
        assert!(Document::parse("not: valid: yaml: {{").is_err());
    }

    #[test]
    fn write_preserves_format() {
        let dir = tempfile::tempdir().unwrap();
        let doc = Document::parse(POD_YAML).unwrap();

        let yaml_path = dir.path().join("copy.yaml");
        Document::write(&yaml_path, &doc.value, DocumentFormat::Yaml).unwrap();
        let reread = Document::read(&yaml_path).unwrap();
        assert_eq!(reread.format, DocumentFormat::Yaml);
        assert_eq!(reread.value["metadata"]["name"], "hello");

        let json_path = dir.path().join("copy.json");
        Document::write(&json_path, &doc.value, DocumentFormat::Json).unwrap();
        let reread = Document::read(&json_path).unwrap();
        assert_eq!(reread.format, DocumentFormat::Json);
        assert_eq!(reread.value["spec"]["containers"][0]["image"], "busybox");
    }

    #[test]
    fn read_missing_file_reports_path() {
        let err = Document::read(Path::new("/nonexistent/pod.yaml")).unwrap_err();
        assert!(err.to_string().contains("/nonexistent/pod.yaml"));
    }
}
