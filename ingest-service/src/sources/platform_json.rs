use serde::Deserialize;
use serde_json::Value;
use series_client::domain::{Meter, Site};

use crate::pipeline::IngestError;

/// Typed views of the metering platform's paginated site and meter
/// listings, applied after the driver has merged all pages. Kept as
/// pure functions over the merged document so page merging stays the
/// driver's concern.

#[derive(Debug, Deserialize)]
struct SiteDoc {
    #[serde(default)]
    sites: Vec<SiteEntry>,
}

#[derive(Debug, Deserialize)]
struct SiteEntry {
    token: String,
    code: String,
    #[serde(default)]
    name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct MeterDoc {
    #[serde(default)]
    meters: Vec<MeterEntry>,
}

#[derive(Debug, Deserialize)]
struct MeterEntry {
    code: String,
    #[serde(default)]
    serial: Option<String>,
    #[serde(rename = "type", default)]
    meter_type: Option<String>,
    #[serde(rename = "siteToken", default)]
    site_token: Option<String>,
}

pub fn parse_sites(doc: &Value) -> Result<Vec<Site>, IngestError> {
    let doc: SiteDoc = serde_json::from_value(doc.clone())
        .map_err(|e| IngestError::Format(format!("bad site listing: {e}")))?;
    Ok(doc
        .sites
        .into_iter()
        .map(|s| Site { token: s.token, code: s.code, name: s.name })
        .collect())
}

pub fn parse_meters(doc: &Value) -> Result<Vec<Meter>, IngestError> {
    let doc: MeterDoc = serde_json::from_value(doc.clone())
        .map_err(|e| IngestError::Format(format!("bad meter listing: {e}")))?;
    Ok(doc
        .meters
        .into_iter()
        .map(|m| Meter {
            code: m.code,
            serial: m.serial,
            meter_type: m.meter_type,
            site_token: m.site_token,
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn sites_parse_from_a_merged_listing() {
        let doc = json!({
            "pageCount": 1,
            "sites": [
                { "token": "abc-123", "code": "hh", "name": "Hamilton House" },
                { "token": "def-456", "code": "kwmc" }
            ]
        });
        let sites = parse_sites(&doc).unwrap();
        assert_eq!(sites.len(), 2);
        assert_eq!(sites[0].token, "abc-123");
        assert!(sites[1].name.is_none());
    }

    #[test]
    fn meters_parse_with_optional_fields() {
        let doc = json!({
            "pageCount": 1,
            "meters": [
                { "code": "PV2-GEN", "serial": "S123", "type": "generation", "siteToken": "abc-123" },
                { "code": "HH1" }
            ]
        });
        let meters = parse_meters(&doc).unwrap();
        assert_eq!(meters.len(), 2);
        assert_eq!(meters[0].meter_type.as_deref(), Some("generation"));
        assert!(meters[1].site_token.is_none());
    }

    #[test]
    fn a_listing_without_the_array_is_empty_not_an_error() {
        assert!(parse_sites(&json!({ "pageCount": 1 })).unwrap().is_empty());
    }

    #[test]
    fn a_malformed_listing_is_a_format_error() {
        let doc = json!({ "meters": [{ "serial": "no-code" }] });
        assert!(matches!(parse_meters(&doc), Err(IngestError::Format(_))));
    }
}
