//! Enrolled template files.
//!
//! Two on-disk shapes are accepted:
//! - `*.json`: an array of `{ "id", "label", "embedding": [128 floats] }`
//! - `*.csv`: one embedding per line, comma separated, as written by
//!   `numpy.savetxt(..., delimiter=",")` or by [`write_csv`]

use crate::types::{EmbeddingVector, EnrolledTemplate};
use std::io::Write;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TemplateError {
    #[error("cannot read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid template JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("line {line}: {message}")]
    Csv { line: usize, message: String },
    #[error("template {id:?} contains a non-finite value")]
    NonFinite { id: String },
    #[error("unsupported template file extension: {0}")]
    UnsupportedFormat(String),
}

/// Load templates from a `.json` or `.csv` file.
pub fn load(path: &Path) -> Result<Vec<EnrolledTemplate>, TemplateError> {
    let text = std::fs::read_to_string(path).map_err(|source| TemplateError::Io {
        path: path.to_path_buf(),
        source,
    })?;

    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or_default()
        .to_ascii_lowercase();

    let templates = match ext.as_str() {
        "json" => parse_json(&text)?,
        "csv" | "txt" => parse_csv(&text)?,
        other => return Err(TemplateError::UnsupportedFormat(other.to_string())),
    };

    tracing::info!(path = %path.display(), count = templates.len(), "loaded enrolled templates");
    Ok(templates)
}

pub fn parse_json(text: &str) -> Result<Vec<EnrolledTemplate>, TemplateError> {
    let templates: Vec<EnrolledTemplate> = serde_json::from_str(text)?;
    for t in &templates {
        ensure_finite(t)?;
    }
    Ok(templates)
}

/// Parse numpy-style CSV. Blank lines and `#` comments are skipped; rows are
/// named `row-<n>` by their position among data rows.
pub fn parse_csv(text: &str) -> Result<Vec<EnrolledTemplate>, TemplateError> {
    let mut templates = Vec::new();

    for (i, raw) in text.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let values = line
            .split(',')
            .map(|field| field.trim().parse::<f32>())
            .collect::<Result<Vec<f32>, _>>()
            .map_err(|e| TemplateError::Csv {
                line: i + 1,
                message: e.to_string(),
            })?;

        let embedding = EmbeddingVector::try_from(values).map_err(|e| TemplateError::Csv {
            line: i + 1,
            message: e.to_string(),
        })?;

        let template = EnrolledTemplate {
            id: format!("row-{}", templates.len()),
            label: String::new(),
            embedding,
        };
        ensure_finite(&template)?;
        templates.push(template);
    }

    Ok(templates)
}

/// Write one embedding per line in the CSV shape [`parse_csv`] reads.
pub fn write_csv<W: Write>(mut out: W, embeddings: &[EmbeddingVector]) -> std::io::Result<()> {
    for embedding in embeddings {
        let line = embedding
            .as_slice()
            .iter()
            .map(|v| format!("{v:.18e}"))
            .collect::<Vec<_>>()
            .join(",");
        writeln!(out, "{line}")?;
    }
    out.flush()
}

fn ensure_finite(t: &EnrolledTemplate) -> Result<(), TemplateError> {
    if t.embedding.as_slice().iter().all(|v| v.is_finite()) {
        Ok(())
    } else {
        Err(TemplateError::NonFinite { id: t.id.clone() })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::EMBEDDING_DIM;

    fn embedding(seed: f32) -> EmbeddingVector {
        let values: Vec<f32> = (0..EMBEDDING_DIM).map(|i| seed + i as f32 * 1e-3).collect();
        EmbeddingVector::try_from(values).unwrap()
    }

    #[test]
    fn test_csv_round_trip_through_file() {
        let mut file = tempfile::Builder::new().suffix(".csv").tempfile().unwrap();
        write_csv(&mut file, &[embedding(0.25), embedding(-0.5)]).unwrap();

        let loaded = load(file.path()).unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0].id, "row-0");
        assert_eq!(loaded[1].id, "row-1");
        assert_eq!(loaded[1].embedding, embedding(-0.5));
    }

    #[test]
    fn test_csv_numpy_format() {
        let row = vec!["1.000000000000000000e+00"; EMBEDDING_DIM].join(",");
        let text = format!("# exported\n{row}\n\n");
        let loaded = parse_csv(&text).unwrap();
        assert_eq!(loaded.len(), 1);
        assert!(loaded[0].embedding.as_slice().iter().all(|&v| v == 1.0));
    }

    #[test]
    fn test_csv_wrong_width_reports_line() {
        let good = vec!["0"; EMBEDDING_DIM].join(",");
        let text = format!("{good}\n0.1,0.2\n");
        match parse_csv(&text) {
            Err(TemplateError::Csv { line, .. }) => assert_eq!(line, 2),
            other => panic!("expected CSV error, got {other:?}"),
        }
    }

    #[test]
    fn test_csv_rejects_nan() {
        let mut fields = vec!["0"; EMBEDDING_DIM];
        fields[5] = "nan";
        assert!(matches!(
            parse_csv(&fields.join(",")),
            Err(TemplateError::NonFinite { .. })
        ));
    }

    #[test]
    fn test_json_gallery() {
        let gallery = vec![EnrolledTemplate {
            id: "owner".into(),
            label: "glasses".into(),
            embedding: embedding(0.1),
        }];
        let mut file = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
        serde_json::to_writer(&mut file, &gallery).unwrap();

        let loaded = load(file.path()).unwrap();
        assert_eq!(loaded, gallery);
    }

    #[test]
    fn test_json_wrong_length_rejected() {
        let text = r#"[{"id": "x", "embedding": [0.1, 0.2]}]"#;
        assert!(matches!(parse_json(text), Err(TemplateError::Json(_))));
    }

    #[test]
    fn test_unknown_extension() {
        let file = tempfile::Builder::new().suffix(".bin").tempfile().unwrap();
        assert!(matches!(load(file.path()), Err(TemplateError::UnsupportedFormat(_))));
    }

    #[test]
    fn test_missing_file() {
        assert!(matches!(
            load(Path::new("/nonexistent/templates.json")),
            Err(TemplateError::Io { .. })
        ));
    }
}
