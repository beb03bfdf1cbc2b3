//! Filters that decorate locators

use chrono::NaiveDate;
use regex::Regex;
use serde::Deserialize;
use serde_yaml::Mapping;
use std::sync::Arc;
use tracing::debug;

use datafetch_common::types::ResourceDescriptor;

use crate::error::ConfigError;
use crate::registry::parse_params;

/// Default pattern for dates embedded in file names: `2023-06-01` or `20230601`
pub const DEFAULT_DATE_PATTERN: &str = r"(\d{4}-\d{2}-\d{2}|\d{8})";

const DEFAULT_DATE_FORMATS: [&str; 2] = ["%Y-%m-%d", "%Y%m%d"];

/// Keeps or drops a single descriptor
pub trait ResourceFilter: Send + Sync {
    fn id(&self) -> &str;

    fn accepts(&self, descriptor: &ResourceDescriptor) -> bool;
}

// ============================================================================
// Glob
// ============================================================================

/// Shell-style pattern on the file name, or on the whole address when the
/// pattern contains a `/`
#[derive(Debug, Clone)]
pub struct GlobFilter {
    id: String,
    pattern: glob::Pattern,
    match_full_path: bool,
}

impl GlobFilter {
    pub fn new(id: impl Into<String>, pattern: &str) -> Result<Self, ConfigError> {
        let id = id.into();
        let compiled = glob::Pattern::new(pattern).map_err(|e| ConfigError::InvalidStrategy {
            strategy_type: "glob".to_string(),
            strategy_id: id.clone(),
            message: format!("invalid pattern '{}': {}", pattern, e),
        })?;
        Ok(Self {
            id,
            pattern: compiled,
            match_full_path: pattern.contains('/'),
        })
    }
}

impl ResourceFilter for GlobFilter {
    fn id(&self) -> &str {
        &self.id
    }

    fn accepts(&self, descriptor: &ResourceDescriptor) -> bool {
        if self.match_full_path {
            self.pattern.matches(&descriptor.address)
        } else {
            self.pattern.matches(descriptor.file_name())
        }
    }
}

// ============================================================================
// Regex
// ============================================================================

/// Regular expression searched anywhere in the address
#[derive(Debug, Clone)]
pub struct RegexFilter {
    id: String,
    pattern: Regex,
}

impl RegexFilter {
    pub fn new(id: impl Into<String>, pattern: &str) -> Result<Self, ConfigError> {
        let id = id.into();
        let compiled = Regex::new(pattern).map_err(|e| ConfigError::InvalidStrategy {
            strategy_type: "regex".to_string(),
            strategy_id: id.clone(),
            message: e.to_string(),
        })?;
        Ok(Self {
            id,
            pattern: compiled,
        })
    }
}

impl ResourceFilter for RegexFilter {
    fn id(&self) -> &str {
        &self.id
    }

    fn accepts(&self, descriptor: &ResourceDescriptor) -> bool {
        self.pattern.is_match(&descriptor.address)
    }
}

// ============================================================================
// Date
// ============================================================================

/// Drops descriptors dated before `start_date` or after `end_date`.
///
/// The date comes from the descriptor's metadata when the locator set one,
/// otherwise from the first `date_pattern` match in the file name (then the
/// full address). Descriptors without a readable date are dropped.
#[derive(Debug, Clone)]
pub struct DateFilter {
    id: String,
    start_date: NaiveDate,
    end_date: Option<NaiveDate>,
    pattern: Regex,
    formats: Vec<String>,
}

impl DateFilter {
    pub fn new(
        id: impl Into<String>,
        start_date: NaiveDate,
        end_date: Option<NaiveDate>,
        date_pattern: Option<&str>,
        date_format: Option<&str>,
    ) -> Result<Self, ConfigError> {
        let id = id.into();
        let invalid = |message: String| ConfigError::InvalidStrategy {
            strategy_type: "date".to_string(),
            strategy_id: id.clone(),
            message,
        };

        if end_date.is_some_and(|end| end < start_date) {
            return Err(invalid("end_date is before start_date".to_string()));
        }

        let pattern = Regex::new(date_pattern.unwrap_or(DEFAULT_DATE_PATTERN))
            .map_err(|e| invalid(e.to_string()))?;
        let formats = match date_format {
            Some(format) => vec![format.to_string()],
            None => DEFAULT_DATE_FORMATS.iter().map(|f| f.to_string()).collect(),
        };

        Ok(Self {
            id,
            start_date,
            end_date,
            pattern,
            formats,
        })
    }

    fn parse(&self, text: &str) -> Option<NaiveDate> {
        let captures = self.pattern.captures(text)?;
        let matched = captures.get(1).or_else(|| captures.get(0))?.as_str();
        self.formats
            .iter()
            .find_map(|format| NaiveDate::parse_from_str(matched, format).ok())
    }

    /// Date the descriptor refers to, if one can be determined
    pub fn extract_date(&self, descriptor: &ResourceDescriptor) -> Option<NaiveDate> {
        descriptor
            .metadata
            .date
            .or_else(|| self.parse(descriptor.file_name()))
            .or_else(|| self.parse(&descriptor.address))
    }
}

impl ResourceFilter for DateFilter {
    fn id(&self) -> &str {
        &self.id
    }

    fn accepts(&self, descriptor: &ResourceDescriptor) -> bool {
        match self.extract_date(descriptor) {
            Some(date) => date >= self.start_date && self.end_date.map_or(true, |end| date <= end),
            None => {
                debug!(filter = %self.id, address = %descriptor.address, "No date found, dropping");
                false
            },
        }
    }
}

// ============================================================================
// Factories
// ============================================================================

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct PatternParams {
    pattern: String,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct DateParams {
    start_date: NaiveDate,
    #[serde(default)]
    end_date: Option<NaiveDate>,
    #[serde(default)]
    date_pattern: Option<String>,
    #[serde(default)]
    date_format: Option<String>,
}

pub(crate) fn glob_factory(id: &str, params: &Mapping) -> Result<Arc<dyn ResourceFilter>, ConfigError> {
    let params: PatternParams = parse_params("glob", id, params)?;
    Ok(Arc::new(GlobFilter::new(id, &params.pattern)?))
}

pub(crate) fn regex_factory(id: &str, params: &Mapping) -> Result<Arc<dyn ResourceFilter>, ConfigError> {
    let params: PatternParams = parse_params("regex", id, params)?;
    Ok(Arc::new(RegexFilter::new(id, &params.pattern)?))
}

pub(crate) fn date_factory(id: &str, params: &Mapping) -> Result<Arc<dyn ResourceFilter>, ConfigError> {
    let params: DateParams = parse_params("date", id, params)?;
    Ok(Arc::new(DateFilter::new(
        id,
        params.start_date,
        params.end_date,
        params.date_pattern.as_deref(),
        params.date_format.as_deref(),
    )?))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use datafetch_common::types::ResourceMetadata;

    fn d(address: &str) -> ResourceDescriptor {
        ResourceDescriptor::new(address)
    }

    fn date(s: &str) -> NaiveDate {
        s.parse().unwrap()
    }

    #[test]
    fn test_glob_on_file_name() {
        let filter = GlobFilter::new("g", "*.txt").unwrap();
        assert!(filter.accepts(&d("/doc/cor/a.txt")));
        assert!(!filter.accepts(&d("/doc/cor/b.csv")));
        assert!(filter.accepts(&d("https://x.org/files/c.txt?v=1")));
    }

    #[test]
    fn test_glob_with_slash_matches_full_path() {
        let filter = GlobFilter::new("g", "/doc/*/a.txt").unwrap();
        assert!(filter.accepts(&d("/doc/cor/a.txt")));
        assert!(!filter.accepts(&d("/other/cor/a.txt")));
    }

    #[test]
    fn test_invalid_patterns_are_config_errors() {
        assert!(GlobFilter::new("g", "[").is_err());
        assert!(RegexFilter::new("r", "(").is_err());
    }

    #[test]
    fn test_date_from_file_name() {
        let filter = DateFilter::new("f", date("2023-06-01"), None, None, None).unwrap();
        assert!(!filter.accepts(&d("https://x.org/daily/2023-05-31.csv")));
        assert!(filter.accepts(&d("https://x.org/daily/2023-06-01.csv")));
        assert!(filter.accepts(&d("/doc/cor/20231201c.txt")));
        assert!(!filter.accepts(&d("/doc/cor/undated.txt")));
    }

    #[test]
    fn test_date_from_metadata_wins() {
        let filter =
            DateFilter::new("f", date("2023-06-01"), Some(date("2023-06-30")), None, None).unwrap();
        let descriptor = d("/doc/20230101.txt").with_metadata(ResourceMetadata {
            date: Some(date("2023-06-15")),
            ..Default::default()
        });
        assert!(filter.accepts(&descriptor));
        assert!(!filter.accepts(&d("/doc/20230701.txt")));
    }

    #[test]
    fn test_custom_pattern_and_format() {
        let filter = DateFilter::new(
            "f",
            date("2023-06-01"),
            None,
            Some(r"_(\d{2}\.\d{2}\.\d{4})\."),
            Some("%d.%m.%Y"),
        )
        .unwrap();
        assert!(filter.accepts(&d("/x/report_15.06.2023.pdf")));
        assert!(!filter.accepts(&d("/x/report_15.05.2023.pdf")));
    }

    #[test]
    fn test_end_before_start_rejected() {
        assert!(DateFilter::new("f", date("2023-06-01"), Some(date("2023-01-01")), None, None).is_err());
    }

    #[test]
    fn test_factories_parse_params() {
        let params: Mapping = serde_yaml::from_str("start_date: \"2023-06-01\"").unwrap();
        let filter = date_factory("loc.file_filter[0]", &params).unwrap();
        assert!(filter.accepts(&d("/a/20230602.txt")));

        let missing: Mapping = serde_yaml::from_str("{}").unwrap();
        let err = glob_factory("loc.file_filter[0]", &missing).err().unwrap();
        assert!(err.to_string().contains("pattern"));
    }
}
