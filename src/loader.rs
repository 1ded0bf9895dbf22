use crate::models::{standardize_school_name, Delimiter, StudentRecord, TeacherRecord};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DataLoadError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },
    #[error("{path} is missing expected column `{column}`")]
    MissingColumn { path: PathBuf, column: String },
}

/// Both survey tables, loaded and name-standardized. Everything
/// downstream is derived from this pair on every run.
#[derive(Debug, Clone, Default)]
pub struct Dataset {
    pub teachers: Vec<TeacherRecord>,
    pub students: Vec<StudentRecord>,
}

/// Reads the two survey CSVs with the deployment's delimiter. The
/// teacher table's institution column is renamed to the canonical
/// `SekolahNama` on the way in, and the school-name column of both
/// tables is trimmed and upper-cased before any key derivation.
pub struct DatasetLoader {
    delimiter: Delimiter,
}

/// Columns a teacher table must carry; the institution column is
/// accepted under its source name or the canonical one.
const TEACHER_REQUIRED_COLUMNS: &[&str] = &["NAMA", "Mean_LD", "Level_LD"];
const TEACHER_SCHOOL_COLUMNS: &[&str] = &["SekolahNama", "Asal Instansi"];
const STUDENT_REQUIRED_COLUMNS: &[&str] = &["Nama", "SekolahNama", "CT_norm", "Level_CT"];

impl DatasetLoader {
    pub fn new(delimiter: Delimiter) -> Self {
        Self { delimiter }
    }

    pub fn delimiter(&self) -> Delimiter {
        self.delimiter
    }

    pub fn load(&self, teacher_path: &Path, student_path: &Path) -> Result<Dataset, DataLoadError> {
        Ok(Dataset {
            teachers: self.load_teachers(teacher_path)?,
            students: self.load_students(student_path)?,
        })
    }

    pub fn load_teachers(&self, path: &Path) -> Result<Vec<TeacherRecord>, DataLoadError> {
        let raw = read_file(path)?;
        self.parse_teachers(&raw, path)
    }

    pub fn load_students(&self, path: &Path) -> Result<Vec<StudentRecord>, DataLoadError> {
        let raw = read_file(path)?;
        self.parse_students(&raw, path)
    }

    fn parse_teachers(&self, input: &[u8], path: &Path) -> Result<Vec<TeacherRecord>, DataLoadError> {
        let mut reader = self.reader(input);
        let headers = headers_of(&mut reader, path)?;
        require_columns(&headers, TEACHER_REQUIRED_COLUMNS, path)?;
        if !TEACHER_SCHOOL_COLUMNS.iter().any(|c| headers.iter().any(|h| h == *c)) {
            return Err(DataLoadError::MissingColumn {
                path: path.to_path_buf(),
                column: "Asal Instansi".to_string(),
            });
        }

        let mut records = Vec::new();
        for row in reader.deserialize::<TeacherRecord>() {
            let mut record = row.map_err(|source| DataLoadError::Csv {
                path: path.to_path_buf(),
                source,
            })?;
            record.school_name = standardize_school_name(&record.school_name);
            records.push(record);
        }
        Ok(records)
    }

    fn parse_students(&self, input: &[u8], path: &Path) -> Result<Vec<StudentRecord>, DataLoadError> {
        let mut reader = self.reader(input);
        let headers = headers_of(&mut reader, path)?;
        require_columns(&headers, STUDENT_REQUIRED_COLUMNS, path)?;

        let mut records = Vec::new();
        for row in reader.deserialize::<StudentRecord>() {
            let mut record = row.map_err(|source| DataLoadError::Csv {
                path: path.to_path_buf(),
                source,
            })?;
            record.school_name = standardize_school_name(&record.school_name);
            records.push(record);
        }
        Ok(records)
    }

    fn reader<'r>(&self, input: &'r [u8]) -> csv::Reader<&'r [u8]> {
        csv::ReaderBuilder::new()
            .delimiter(self.delimiter.as_byte())
            .trim(csv::Trim::All)
            .from_reader(input)
    }
}

fn read_file(path: &Path) -> Result<Vec<u8>, DataLoadError> {
    fs::read(path).map_err(|source| DataLoadError::Io {
        path: path.to_path_buf(),
        source,
    })
}

fn headers_of(
    reader: &mut csv::Reader<&[u8]>,
    path: &Path,
) -> Result<csv::StringRecord, DataLoadError> {
    reader
        .headers()
        .map(|h| h.clone())
        .map_err(|source| DataLoadError::Csv {
            path: path.to_path_buf(),
            source,
        })
}

fn require_columns(
    headers: &csv::StringRecord,
    required: &[&str],
    path: &Path,
) -> Result<(), DataLoadError> {
    for column in required {
        if !headers.iter().any(|h| h == *column) {
            return Err(DataLoadError::MissingColumn {
                path: path.to_path_buf(),
                column: (*column).to_string(),
            });
        }
    }
    Ok(())
}

/// Lazily populated cache of loaded datasets keyed by source paths and
/// delimiter. Purely an optimization over re-reading the files: a
/// fresh load must produce identical results, and `invalidate` exists
/// so callers can force one.
#[derive(Default)]
pub struct DatasetCache {
    entries: HashMap<CacheKey, Arc<Dataset>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CacheKey {
    teacher_path: PathBuf,
    student_path: PathBuf,
    delimiter: u8,
}

impl DatasetCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn load(
        &mut self,
        loader: &DatasetLoader,
        teacher_path: &Path,
        student_path: &Path,
    ) -> Result<Arc<Dataset>, DataLoadError> {
        let key = CacheKey {
            teacher_path: teacher_path.to_path_buf(),
            student_path: student_path.to_path_buf(),
            delimiter: loader.delimiter().as_byte(),
        };
        if let Some(dataset) = self.entries.get(&key) {
            return Ok(Arc::clone(dataset));
        }
        let dataset = Arc::new(loader.load(teacher_path, student_path)?);
        self.entries.insert(key, Arc::clone(&dataset));
        Ok(dataset)
    }

    pub fn invalidate(&mut self) {
        self.entries.clear();
    }
}
