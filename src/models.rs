use serde::{Deserialize, Serialize};

/// Number of leading name tokens used to match schools between the two
/// surveys. Prior published results were produced with this value.
pub const DEFAULT_KEY_PREFIX_TOKENS: usize = 4;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub teacher_data_file: String,
    pub student_data_file: String,
    pub delimiter: Delimiter,
    pub output_directory: Option<String>,
    pub key_prefix_tokens: Option<usize>,
    pub levels_of_interest: Option<Vec<String>>,
    pub predictor: Option<PredictorConfig>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Delimiter {
    #[serde(rename = "comma")]
    Comma,
    #[serde(rename = "semicolon")]
    Semicolon,
}

impl Delimiter {
    pub fn as_byte(&self) -> u8 {
        match self {
            Delimiter::Comma => b',',
            Delimiter::Semicolon => b';',
        }
    }
}

/// Optional fixed coefficients and evaluation point for the prediction
/// report. When intercept/slope are absent the line is re-fitted from
/// the school-level aggregate; when input is absent the prediction is
/// evaluated at the observed mean teacher literacy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PredictorConfig {
    pub intercept: Option<f64>,
    pub slope: Option<f64>,
    pub input: Option<f64>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            teacher_data_file: "files/dashboard_dataguru.csv".to_string(),
            student_data_file: "files/dashboard_datasiswa.csv".to_string(),
            delimiter: Delimiter::Comma,
            output_directory: Some("output".to_string()),
            key_prefix_tokens: Some(DEFAULT_KEY_PREFIX_TOKENS),
            levels_of_interest: None,
            predictor: Some(PredictorConfig {
                intercept: None,
                slope: None,
                input: None,
            }),
        }
    }
}

impl Config {
    pub fn load_from_file(file_path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(file_path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn save_to_file(&self, file_path: &str) -> anyhow::Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(file_path, content)?;
        Ok(())
    }
}

/// One row of the teacher survey. Score cells stay as raw strings and
/// are parsed on demand so a malformed cell excludes the row from
/// aggregation instead of failing the whole load.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TeacherRecord {
    #[serde(rename = "NAMA", default)]
    pub name: String,
    #[serde(rename = "Usia", default)]
    pub age: String,
    #[serde(rename = "Total_LD", default)]
    pub total_ld: String,
    #[serde(rename = "Mean_LD", default)]
    pub mean_ld: String,
    #[serde(rename = "Level_LD", default)]
    pub level_ld: String,
    #[serde(rename = "SekolahNama", alias = "Asal Instansi", default)]
    pub school_name: String,
}

/// One row of the student survey (Bebras challenge results).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StudentRecord {
    #[serde(rename = "Nama", default)]
    pub name: String,
    #[serde(rename = "SekolahNama", default)]
    pub school_name: String,
    #[serde(rename = "Provinsi", default)]
    pub province: String,
    #[serde(rename = "Kabupaten", default)]
    pub regency: String,
    #[serde(rename = "Kelas", default)]
    pub class_name: String,
    #[serde(rename = "Kategori", default)]
    pub category: String,
    #[serde(rename = "Nilai", default)]
    pub score: String,
    #[serde(rename = "CT_norm", default)]
    pub ct_norm: String,
    #[serde(rename = "Level_CT", default)]
    pub level_ct: String,
}

impl TeacherRecord {
    pub fn mean_ld_score(&self) -> Option<f64> {
        parse_score(&self.mean_ld)
    }

    pub fn level(&self) -> Option<String> {
        normalize_level(&self.level_ld)
    }
}

impl StudentRecord {
    pub fn ct_norm_score(&self) -> Option<f64> {
        parse_score(&self.ct_norm)
    }

    pub fn level(&self) -> Option<String> {
        normalize_level(&self.level_ct)
    }
}

/// Parse a numeric cell that may use either `.` or `,` as the decimal
/// separator (semicolon-delimited exports use comma decimals).
pub fn parse_score(cell: &str) -> Option<f64> {
    cell.trim().replace(',', ".").parse::<f64>().ok()
}

/// Standardize a raw school-name cell for display and grouping:
/// trimmed and upper-cased, matching how both surveys are cleaned
/// before any name comparison.
pub fn standardize_school_name(raw: &str) -> String {
    raw.trim().to_uppercase()
}

/// Lower-cased trimmed level label, or None for a missing label.
/// Per-level joins between the two surveys are case-insensitive.
pub fn normalize_level(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    Some(trimmed.to_lowercase())
}

/// Strategy for deriving the join key that matches teacher and student
/// rows to the same school: lower-case the name, collapse whitespace,
/// and keep the first `prefix_tokens` tokens. Two institutions sharing
/// that prefix are treated as the same school; this approximate match
/// is kept as-is for compatibility with previously published results.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchoolKeyer {
    pub prefix_tokens: usize,
}

impl Default for SchoolKeyer {
    fn default() -> Self {
        Self {
            prefix_tokens: DEFAULT_KEY_PREFIX_TOKENS,
        }
    }
}

impl SchoolKeyer {
    pub fn new(prefix_tokens: usize) -> Self {
        Self { prefix_tokens }
    }

    /// Derive the join key for a raw institution name. Total and
    /// deterministic: a missing name maps to the empty key, which is
    /// excluded from matching downstream.
    pub fn key(&self, raw_name: Option<&str>) -> String {
        let raw = match raw_name {
            Some(raw) => raw,
            None => return String::new(),
        };
        raw.to_lowercase()
            .split_whitespace()
            .take(self.prefix_tokens)
            .collect::<Vec<_>>()
            .join(" ")
    }
}
