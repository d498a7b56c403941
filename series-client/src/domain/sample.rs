use time::PrimitiveDateTime;

/// Physical quantity carried by a sample or bucket.
///
/// Each quantity maps onto one column name in the persistent store;
/// wide power tables use per-meter columns instead (see
/// [`crate::domain::meter_column_name`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Quantity {
    /// Instantaneous generation power, kW.
    Power,
    /// Cumulative billing-quality meter reading, kWh.
    MeterReading,
    /// Solar irradiance, W/m2.
    SolarRadiation,
    /// Air temperature, degrees C.
    AirTemperature,
    /// Relative humidity, percent.
    RelativeHumidity,
    /// Rainfall, mm.
    Rainfall,
}

impl Quantity {
    pub fn column(&self) -> &'static str {
        match self {
            Quantity::Power => "power",
            Quantity::MeterReading => "reading",
            Quantity::SolarRadiation => "sol_rad",
            Quantity::AirTemperature => "air_temp",
            Quantity::RelativeHumidity => "rel_humidity",
            Quantity::Rainfall => "rain",
        }
    }
}

/// Upstream format a sample was parsed from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    /// Multi-column weather-station CSV export (web form or dropped file).
    WeatherCsv,
    /// Single-substance CSV export with a "Substance" header section.
    StationCsv,
    /// Per-meter billing-readings delimited export.
    ReadingsExport,
    /// JavaScript-table-literal power/flow feed.
    MeterFlows,
}

impl SourceKind {
    /// Whether the source's native timestamps are civil-local and need
    /// a single pass through the timezone normalizer. UTC-native
    /// sources must not be passed through it at all.
    pub fn is_civil_local(&self) -> bool {
        match self {
            SourceKind::WeatherCsv | SourceKind::MeterFlows => true,
            SourceKind::StationCsv | SourceKind::ReadingsExport => false,
        }
    }
}

/// One parsed reading. Timestamps are naive; before aggregation every
/// civil-local sample is normalized so that `ts` is UTC wall time.
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    pub ts: PrimitiveDateTime,
    pub quantity: Quantity,
    pub value: Option<f64>,
    pub source: SourceKind,
}
