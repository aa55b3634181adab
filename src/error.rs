use thiserror::Error;

#[derive(Error, Debug)]
pub enum HarvestError {
    #[error("Fetch failed: {0}")]
    FetchError(#[from] ureq::Error),

    #[error("Fetch failed for {url}: {reason}")]
    SourceUnavailable { url: String, reason: String },

    #[error("Database error: {0}")]
    DatabaseError(#[from] rusqlite::Error),

    #[error("Migration error: {0}")]
    MigrationError(#[from] refinery::Error),

    #[error("JSON serialization error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("TOML parsing error: {0}")]
    TomlError(#[from] toml::de::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("URL parse error: {0}")]
    UrlParseError(#[from] url::ParseError),

    #[error("PDF text extraction failed: {0}")]
    PdfError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Profile table error: {0}")]
    ProfileError(String),

    #[error("Persistence failed after {attempts} attempts: {reason}")]
    PersistenceError { attempts: u32, reason: String },

    #[error("Record not found: {0}")]
    RecordNotFound(i64),

    #[error("Batch cancelled")]
    Cancelled,
}

impl HarvestError {
    /// Get an actionable hint for how to resolve this error
    pub fn hint(&self) -> Option<&'static str> {
        match self {
            HarvestError::FetchError(_) | HarvestError::SourceUnavailable { .. } => Some(
                "Check the URL in your sources file, or try:\n  loanharvest inspect <url>"
            ),
            HarvestError::TomlError(_) => Some(
                "Check the TOML syntax of your config, sources or profiles file"
            ),
            HarvestError::ProfileError(_) => Some(
                "Run `loanharvest profiles` to see the loaded profile table"
            ),
            HarvestError::PdfError(_) => Some(
                "The PDF may be scanned (no text layer); the HTML fields are still used"
            ),
            HarvestError::DatabaseError(_) | HarvestError::PersistenceError { .. } => Some(
                "Check that the database path is writable (override with LOANHARVEST_DB)"
            ),
            HarvestError::RecordNotFound(_) => Some(
                "Run `loanharvest records` to see stored record ids"
            ),
            _ => None,
        }
    }

    /// Whether the error came from retrieving a source document
    pub fn is_fetch(&self) -> bool {
        matches!(
            self,
            HarvestError::FetchError(_) | HarvestError::SourceUnavailable { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, HarvestError>;
