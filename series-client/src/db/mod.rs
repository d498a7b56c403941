pub mod day_queries;
pub mod series_store;

pub use series_store::SeriesStore;
