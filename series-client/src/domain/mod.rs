pub mod anomaly;
pub mod bucket;
pub mod entity;
pub mod sample;

pub use anomaly::{AnomalyKind, AnomalyRecord};
pub use bucket::Bucket;
pub use entity::{meter_column_name, Meter, Site};
pub use sample::{Quantity, Sample, SourceKind};
