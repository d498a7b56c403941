use std::{
    path::Path,
    sync::atomic::{AtomicU32, Ordering},
    time::Duration,
};

use serde_json::Value;

use crate::pipeline::IngestError;

/// Shared daily ceiling on outbound API calls. Sources running
/// concurrently share one instance; acquisition is an atomic
/// increment-and-check.
pub struct CallBudget {
    ceiling: u32,
    used: AtomicU32,
}

impl CallBudget {
    pub fn new(ceiling: u32) -> Self {
        Self { ceiling, used: AtomicU32::new(0) }
    }

    /// Take one call from the budget, or report a quota skip.
    pub fn try_acquire(&self) -> Result<(), IngestError> {
        let prev = self.used.fetch_add(1, Ordering::SeqCst);
        if prev >= self.ceiling {
            return Err(IngestError::QuotaExceeded(format!(
                "daily call ceiling of {} reached",
                self.ceiling
            )));
        }
        Ok(())
    }

    pub fn used(&self) -> u32 {
        self.used.load(Ordering::SeqCst).min(self.ceiling)
    }
}

/// Outbound HTTP with a bounded timeout and the shared call budget
/// applied to every request. All network failures surface as
/// `IngestError::Network` and are left for the next scheduled run.
pub struct ApiDriver {
    client: reqwest::Client,
    budget: std::sync::Arc<CallBudget>,
}

impl ApiDriver {
    pub fn new(timeout: Duration, budget: std::sync::Arc<CallBudget>) -> Result<Self, IngestError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| IngestError::Network(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { client, budget })
    }

    pub async fn get_text(&self, url: &str) -> Result<String, IngestError> {
        self.budget.try_acquire()?;
        metrics::counter!("api_calls_total").increment(1);
        tracing::debug!(url, "GET");
        let resp = self
            .client
            .get(url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| IngestError::Network(format!("GET {url} failed: {e}")))?;
        resp.text()
            .await
            .map_err(|e| IngestError::Network(format!("reading body of {url} failed: {e}")))
    }

    pub async fn post_form(
        &self,
        url: &str,
        fields: &[(&str, String)],
    ) -> Result<String, IngestError> {
        self.budget.try_acquire()?;
        metrics::counter!("api_calls_total").increment(1);
        tracing::debug!(url, "POST form");
        let resp = self
            .client
            .post(url)
            .form(fields)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| IngestError::Network(format!("POST {url} failed: {e}")))?;
        resp.text()
            .await
            .map_err(|e| IngestError::Network(format!("reading body of {url} failed: {e}")))
    }

    pub async fn get_json(&self, url: &str) -> Result<Value, IngestError> {
        let body = self.get_text(url).await?;
        serde_json::from_str(&body)
            .map_err(|e| IngestError::Format(format!("response from {url} is not JSON: {e}")))
    }

    /// Fetch a paginated listing and merge the named array fields from
    /// every page. Termination is by the first page's declared
    /// `pageCount`, never by spotting an empty page.
    pub async fn get_paged(&self, url: &str, merge_fields: &[&str]) -> Result<Value, IngestError> {
        let mut doc = self.get_json(url).await?;
        let page_count = doc
            .get("pageCount")
            .and_then(Value::as_u64)
            .ok_or_else(|| IngestError::Format(format!("no pageCount field in {url}")))?;

        let sep = if url.contains('?') { '&' } else { '?' };
        for page in 2..=page_count {
            let page_url = format!("{url}{sep}page={page}");
            let page_doc = self.get_json(&page_url).await?;
            merge_page(&mut doc, page_doc, merge_fields)?;
        }
        if let Some(pc) = doc.get_mut("pageCount") {
            *pc = Value::from(1u64);
        }
        Ok(doc)
    }
}

/// Append the named array fields of `page` onto `doc`. Pages are
/// disjoint, so order does not matter.
pub fn merge_page(doc: &mut Value, mut page: Value, fields: &[&str]) -> Result<(), IngestError> {
    for field in fields {
        let extra = match page.get_mut(*field).map(Value::take) {
            Some(Value::Array(items)) => items,
            Some(_) => {
                return Err(IngestError::Format(format!("field '{field}' in page is not an array")))
            }
            None => Vec::new(),
        };
        match doc.get_mut(*field) {
            Some(Value::Array(existing)) => existing.extend(extra),
            _ => {
                if let Some(obj) = doc.as_object_mut() {
                    obj.insert((*field).to_string(), Value::Array(extra));
                }
            }
        }
    }
    Ok(())
}

fn hex_dash_run(line: &str) -> Option<&str> {
    let mut best: Option<(usize, usize)> = None;
    let mut start = None;
    for (i, c) in line.char_indices() {
        if c.is_ascii_hexdigit() || c == '-' {
            start.get_or_insert(i);
        } else if let Some(s) = start.take() {
            if best.map(|(bs, be)| i - s > be - bs).unwrap_or(true) {
                best = Some((s, i));
            }
        }
    }
    if let Some(s) = start {
        let end = line.len();
        if best.map(|(bs, be)| end - s > be - bs).unwrap_or(true) {
            best = Some((s, end));
        }
    }
    best.map(|(s, e)| &line[s..e])
}

/// Pull a platform auth token out of a secrets file: the token is the
/// run of hex-and-dash text longer than 30 characters on a line
/// containing at least two '-' separators. Other lines (comments,
/// blank) are skipped.
pub fn extract_token(body: &str) -> Option<String> {
    for line in body.lines() {
        if line.len() > 30 && line.matches('-').count() >= 2 {
            if let Some(run) = hex_dash_run(line) {
                if run.len() > 30 {
                    return Some(run.to_string());
                }
            }
        }
    }
    None
}

/// API keys are plain hex with no separators; same line-scan rules as
/// tokens but without the dash requirement.
pub fn extract_api_key(body: &str) -> Option<String> {
    for line in body.lines() {
        if line.len() <= 30 {
            continue;
        }
        let mut best = (0, 0);
        let mut start = None;
        for (i, c) in line.char_indices() {
            if c.is_ascii_hexdigit() {
                start.get_or_insert(i);
            } else if let Some(s) = start.take() {
                if i - s > best.1 - best.0 {
                    best = (s, i);
                }
            }
        }
        if let Some(s) = start {
            if line.len() - s > best.1 - best.0 {
                best = (s, line.len());
            }
        }
        if best.1 - best.0 > 30 {
            return Some(line[best.0..best.1].to_string());
        }
    }
    None
}

pub async fn read_api_key_file(path: &Path) -> Result<String, IngestError> {
    let body = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| IngestError::Format(format!("failed to read {}: {e}", path.display())))?;
    extract_api_key(&body)
        .ok_or_else(|| IngestError::Format(format!("no API key found in {}", path.display())))
}

pub async fn read_token_file(path: &Path) -> Result<String, IngestError> {
    let body = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| IngestError::Format(format!("failed to read {}: {e}", path.display())))?;
    extract_token(&body)
        .ok_or_else(|| IngestError::Format(format!("no token found in {}", path.display())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn page(meters: std::ops::Range<u32>) -> Value {
        json!({
            "pageCount": 3,
            "meters": meters.map(|i| json!({ "code": format!("m{i}") })).collect::<Vec<_>>()
        })
    }

    #[test]
    fn three_pages_merge_to_all_records() {
        let mut doc = page(0..10);
        merge_page(&mut doc, page(10..20), &["meters"]).unwrap();
        merge_page(&mut doc, page(20..25), &["meters"]).unwrap();
        let meters = doc["meters"].as_array().unwrap();
        assert_eq!(meters.len(), 25);
        let codes: std::collections::HashSet<&str> =
            meters.iter().map(|m| m["code"].as_str().unwrap()).collect();
        assert_eq!(codes.len(), 25);
    }

    #[test]
    fn merge_order_does_not_matter() {
        let mut a = page(0..10);
        merge_page(&mut a, page(20..25), &["meters"]).unwrap();
        merge_page(&mut a, page(10..20), &["meters"]).unwrap();
        assert_eq!(a["meters"].as_array().unwrap().len(), 25);
    }

    #[test]
    fn a_page_missing_the_field_merges_nothing() {
        let mut doc = page(0..10);
        merge_page(&mut doc, json!({ "pageCount": 3 }), &["meters"]).unwrap();
        assert_eq!(doc["meters"].as_array().unwrap().len(), 10);
    }

    #[test]
    fn budget_exhaustion_is_a_quota_skip() {
        let budget = CallBudget::new(2);
        assert!(budget.try_acquire().is_ok());
        assert!(budget.try_acquire().is_ok());
        let err = budget.try_acquire().unwrap_err();
        assert!(err.is_quota_skip());
        assert_eq!(budget.used(), 2);
    }

    #[test]
    fn token_is_the_long_hex_dash_run() {
        let body = "\
# platform credentials
do not use this line even though it is quite long
token: 0123abcd-4567-89ef-0123-456789abcdef0123\n";
        assert_eq!(
            extract_token(body).as_deref(),
            Some("0123abcd-4567-89ef-0123-456789abcdef0123")
        );
    }

    #[test]
    fn api_keys_need_no_dashes() {
        let body = "# key follows\n0123456789abcdef0123456789abcdef01\n";
        assert_eq!(
            extract_api_key(body).as_deref(),
            Some("0123456789abcdef0123456789abcdef01")
        );
        assert_eq!(extract_api_key("deadbeef\n"), None);
    }

    #[test]
    fn short_or_dashless_lines_never_match() {
        assert_eq!(extract_token("0123abcd-4567\n"), None);
        assert_eq!(extract_token("0123456789abcdef0123456789abcdef0123456789\n"), None);
    }
}
