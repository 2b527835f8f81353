//! File format detection and parsing into rows

use std::path::{Path, PathBuf};

use crate::{Error, Result};

/// Formats recognised by extension. Recognised does not mean supported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileFormat {
    Csv,
    Tsv,
    Excel,
}

impl FileFormat {
    /// Fails with [`Error::UnsupportedFormat`] for unknown extensions.
    pub fn detect(file_name: &str) -> Result<Self> {
        let extension = Path::new(file_name)
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase)
            .unwrap_or_default();

        match extension.as_str() {
            "csv" => Ok(FileFormat::Csv),
            "tsv" | "tab" => Ok(FileFormat::Tsv),
            "xlsx" | "xls" => Ok(FileFormat::Excel),
            "" => Err(Error::UnsupportedFormat(format!(
                "{file_name} has no file extension"
            ))),
            other => Err(Error::UnsupportedFormat(format!(".{other} ({file_name})"))),
        }
    }

    fn delimiter(self) -> Option<u8> {
        match self {
            FileFormat::Csv => Some(b','),
            FileFormat::Tsv => Some(b'\t'),
            FileFormat::Excel => None,
        }
    }
}

/// Tabular rows with the column names taken from the header row.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RowSet {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

impl RowSet {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// Reads a delimited file with a header row. Blocking.
pub fn parse(path: &Path, format: FileFormat) -> Result<RowSet> {
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();

    let Some(delimiter) = format.delimiter() else {
        return Err(Error::UnsupportedFormat(
            "XLSX/XLS file processing not yet implemented. Please convert to CSV format.".into(),
        ));
    };

    let to_error = |e: csv::Error| {
        if e.is_io_error() {
            Error::Io(e.into())
        } else {
            Error::parse(&file_name, e.to_string())
        }
    };

    let mut reader = csv::ReaderBuilder::new()
        .delimiter(delimiter)
        .has_headers(true)
        .from_path(path)
        .map_err(to_error)?;

    let columns: Vec<String> = reader
        .headers()
        .map_err(to_error)?
        .iter()
        .map(|h| h.trim().to_string())
        .collect();
    if columns.iter().all(String::is_empty) {
        return Err(Error::parse(&file_name, "missing header row"));
    }

    let rows = reader
        .records()
        .map(|record| {
            record
                .map(|r| r.iter().map(str::to_string).collect())
                .map_err(to_error)
        })
        .collect::<Result<Vec<Vec<String>>>>()?;

    Ok(RowSet { columns, rows })
}

/// [`parse`] on the blocking pool.
pub async fn parse_file(path: PathBuf, format: FileFormat) -> Result<RowSet> {
    tokio::task::spawn_blocking(move || parse(&path, format))
        .await
        .map_err(|e| Error::Internal(format!("parser task failed: {e}")))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write(dir: &tempfile::TempDir, name: &str, content: &str) -> PathBuf {
        let path = dir.path().join(name);
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(content.as_bytes()).unwrap();
        path
    }

    #[test]
    fn detects_by_extension() {
        assert_eq!(FileFormat::detect("orders.csv").unwrap(), FileFormat::Csv);
        assert_eq!(FileFormat::detect("ORDERS.CSV").unwrap(), FileFormat::Csv);
        assert_eq!(FileFormat::detect("orders.tsv").unwrap(), FileFormat::Tsv);
        assert_eq!(FileFormat::detect("book.xlsx").unwrap(), FileFormat::Excel);

        let err = FileFormat::detect("report.pdf").unwrap_err();
        assert!(matches!(err, Error::UnsupportedFormat(_)));
        assert!(err.to_string().contains("pdf"));
        assert!(FileFormat::detect("README").is_err());
    }

    #[test]
    fn parses_csv_with_header() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(&dir, "orders.csv", "id,total\n1,10.5\n2,3\n");

        let rows = parse(&path, FileFormat::Csv).unwrap();
        assert_eq!(rows.columns, vec!["id", "total"]);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows.rows[1], vec!["2", "3"]);
    }

    #[test]
    fn parses_tsv() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(&dir, "orders.tsv", "id\tname\n7\twidget, large\n");

        let rows = parse(&path, FileFormat::Tsv).unwrap();
        assert_eq!(rows.rows, vec![vec!["7", "widget, large"]]);
    }

    #[test]
    fn header_only_file_has_no_rows() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(&dir, "empty.csv", "id,total\n");

        let rows = parse(&path, FileFormat::Csv).unwrap();
        assert!(rows.is_empty());
        assert_eq!(rows.columns.len(), 2);
    }

    #[test]
    fn ragged_rows_are_permanent_errors() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(&dir, "bad.csv", "id,total\n1,2,3\n");

        let err = parse(&path, FileFormat::Csv).unwrap_err();
        assert!(matches!(err, Error::Parse { .. }));
        assert!(err.is_permanent());
    }

    #[test]
    fn empty_file_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(&dir, "blank.csv", "");
        assert!(matches!(
            parse(&path, FileFormat::Csv).unwrap_err(),
            Error::Parse { .. }
        ));
    }

    #[test]
    fn excel_is_recognised_but_unsupported() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(&dir, "book.xlsx", "PK");
        let err = parse(&path, FileFormat::Excel).unwrap_err();
        assert!(matches!(err, Error::UnsupportedFormat(_)));
    }

    #[tokio::test]
    async fn parses_off_the_runtime() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(&dir, "orders.csv", "id\n1\n");
        assert_eq!(parse_file(path, FileFormat::Csv).await.unwrap().len(), 1);
    }
}
