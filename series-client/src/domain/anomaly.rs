use time::{Date, PrimitiveDateTime};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnomalyKind {
    /// No stored row, or a NULL cell for this meter's column.
    Missing,
    /// Explicit zero generation while irradiance made that implausible.
    UnexpectedZero,
}

/// One data-quality finding. Generated fresh on every detector run and
/// only ever reported, never persisted.
///
/// `entity` is `None` when the finding applies to the whole bucket
/// (no row stored for any meter).
#[derive(Debug, Clone, PartialEq)]
pub struct AnomalyRecord {
    pub date: Date,
    pub bucket_start: PrimitiveDateTime,
    pub entity: Option<String>,
    pub kind: AnomalyKind,
    pub context: String,
}
