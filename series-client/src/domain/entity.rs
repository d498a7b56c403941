use sqlx::FromRow;

/// A site on the metering platform. Sites are identified by an opaque
/// token, not a sequential id.
#[derive(Debug, Clone, FromRow)]
pub struct Site {
    pub token: String,
    pub code: String,
    pub name: Option<String>,
}

/// A meter belonging to exactly one site.
#[derive(Debug, Clone, FromRow)]
pub struct Meter {
    pub code: String,
    pub serial: Option<String>,
    pub meter_type: Option<String>,
    pub site_token: Option<String>,
}

/// Normalize a platform meter code for use as a table column name:
/// lowercase, '-' replaced with '_'.
pub fn meter_column_name(code: &str) -> String {
    code.to_lowercase().replace('-', "_")
}
