pub mod series_sink;

pub use series_sink::{ColumnSpec, ReconcilingSink};
