//! HTTP locators: a fixed endpoint, a paginated listing, and a date range

use chrono::format::{Item, StrftimeItems};
use chrono::{Days, NaiveDate, Utc};
use futures::future::BoxFuture;
use futures::stream::{self, StreamExt, TryStreamExt};
use serde::Deserialize;
use serde_json::Value;
use serde_yaml::Mapping;
use std::fmt::Write;
use std::sync::Arc;
use tracing::{debug, info};
use url::Url;

use datafetch_common::types::{ResourceDescriptor, ResourceMetadata};

use super::{DescriptorStream, Locator};
use crate::error::{ConfigError, FailureKind, LocatorError};
use crate::http::{HttpClient, HttpFailure};
use crate::registry::{parse_params, BuildContext};

fn locator_error(locator: &str, failure: HttpFailure) -> LocatorError {
    LocatorError::new(locator, failure.kind, failure.message)
}

// ============================================================================
// Single endpoint
// ============================================================================

/// Yields exactly one descriptor for a fixed address
#[derive(Debug, Clone)]
pub struct SingleHttpLocator {
    id: String,
    client: HttpClient,
    url: String,
}

impl SingleHttpLocator {
    pub fn new(id: impl Into<String>, client: HttpClient, url: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            client,
            url: url.into(),
        }
    }
}

impl Locator for SingleHttpLocator {
    fn id(&self) -> &str {
        &self.id
    }

    fn produce(&self) -> DescriptorStream<'_> {
        let result = self
            .client
            .resolve(&self.url)
            .map(|url| ResourceDescriptor::new(url.as_str()))
            .map_err(|failure| locator_error(&self.id, failure));
        stream::once(futures::future::ready(result)).boxed()
    }
}

// ============================================================================
// Paginated listing
// ============================================================================

/// Where the next page of a paginated listing comes from
#[derive(Debug, Clone)]
pub struct Pagination {
    /// Dotted path in the page body holding the next cursor
    pub cursor_field: Option<String>,
    /// Query parameter the cursor is sent back in
    pub cursor_param: String,
    /// Hard stop on the number of pages requested
    pub max_pages: Option<u32>,
}

impl Default for Pagination {
    fn default() -> Self {
        Self {
            cursor_field: None,
            cursor_param: "cursor".to_string(),
            max_pages: None,
        }
    }
}

/// Walks a JSON listing endpoint page by page.
///
/// Each page must hold an array at `items_field`; each item yields one
/// descriptor whose address is the string at `url_field` (or the item itself
/// when it is a string), resolved against the page URL. The next page is
/// requested while `cursor_field` is present; a cursor that is itself an
/// absolute URL is followed as-is, anything else is sent back as the
/// `cursor_param` query parameter. Cursors live only for one `produce` call.
#[derive(Debug, Clone)]
pub struct PaginatedHttpLocator {
    id: String,
    client: HttpClient,
    url: String,
    items_field: String,
    url_field: Option<String>,
    pagination: Pagination,
}

struct PageCursor {
    url: Url,
    cursor: Option<String>,
    pages: u32,
}

impl PaginatedHttpLocator {
    pub fn new(
        id: impl Into<String>,
        client: HttpClient,
        url: impl Into<String>,
        items_field: impl Into<String>,
        url_field: Option<String>,
        pagination: Pagination,
    ) -> Self {
        Self {
            id: id.into(),
            client,
            url: url.into(),
            items_field: items_field.into(),
            url_field,
            pagination,
        }
    }

    async fn fetch_page(&self, url: &Url) -> Result<Value, LocatorError> {
        let id = self.id.as_str();
        let client = &self.client;
        client
            .retry_policy()
            .run("locator_page", move || async move {
                client.get_json(url).await.map_err(|failure| locator_error(id, failure))
            })
            .await
    }

    fn page_items(
        &self,
        page_url: &Url,
        body: &Value,
        cursor: Option<&str>,
    ) -> Result<Vec<ResourceDescriptor>, LocatorError> {
        let malformed =
            |message: String| LocatorError::new(&self.id, FailureKind::Permanent, message);

        let items = lookup(body, &self.items_field)
            .and_then(Value::as_array)
            .ok_or_else(|| malformed(format!("{} has no array at '{}'", page_url, self.items_field)))?;

        items
            .iter()
            .map(|item| {
                let address = match &self.url_field {
                    Some(field) => lookup(item, field).and_then(Value::as_str),
                    None => item.as_str(),
                }
                .ok_or_else(|| malformed(format!("item in {} has no address", page_url)))?;

                let resolved = page_url
                    .join(address)
                    .map_err(|e| malformed(format!("invalid address '{}': {}", address, e)))?;

                Ok(ResourceDescriptor::new(resolved.as_str()).with_metadata(ResourceMetadata {
                    cursor: cursor.map(str::to_string),
                    ..Default::default()
                }))
            })
            .collect()
    }

    fn next_page(
        &self,
        current: &PageCursor,
        body: &Value,
    ) -> Result<Option<PageCursor>, LocatorError> {
        let Some(field) = &self.pagination.cursor_field else {
            return Ok(None);
        };
        let next = match lookup(body, field) {
            Some(Value::String(s)) if !s.is_empty() => s.clone(),
            Some(Value::Number(n)) => n.to_string(),
            _ => return Ok(None),
        };
        if current.cursor.as_deref() == Some(next.as_str()) {
            debug!(locator = %self.id, cursor = %next, "Cursor did not advance, stopping");
            return Ok(None);
        }
        if self
            .pagination
            .max_pages
            .is_some_and(|max| current.pages >= max)
        {
            info!(locator = %self.id, pages = current.pages, "Reached max_pages");
            return Ok(None);
        }

        let url = match Url::parse(&next) {
            Ok(absolute) => absolute,
            Err(_) => {
                let mut url = self
                    .client
                    .resolve(&self.url)
                    .map_err(|failure| locator_error(&self.id, failure))?;
                url.query_pairs_mut()
                    .append_pair(&self.pagination.cursor_param, &next);
                url
            },
        };

        Ok(Some(PageCursor {
            url,
            cursor: Some(next),
            pages: current.pages + 1,
        }))
    }
}

impl Locator for PaginatedHttpLocator {
    fn id(&self) -> &str {
        &self.id
    }

    fn produce(&self) -> DescriptorStream<'_> {
        let first = self
            .client
            .resolve(&self.url)
            .map(|url| PageCursor {
                url,
                cursor: None,
                pages: 1,
            })
            .map_err(|failure| locator_error(&self.id, failure));

        let start = match first {
            Ok(cursor) => Some(cursor),
            Err(e) => return stream::once(futures::future::ready(Err(e))).boxed(),
        };

        stream::try_unfold(start, move |state| async move {
            let Some(current) = state else {
                return Ok(None);
            };
            debug!(locator = %self.id, page = current.pages, url = %current.url, "Requesting page");

            let body = self.fetch_page(&current.url).await?;
            let items = self.page_items(&current.url, &body, current.cursor.as_deref())?;
            let next = if items.is_empty() {
                None
            } else {
                self.next_page(&current, &body)?
            };
            Ok(Some((items, next)))
        })
        .map_ok(|items| stream::iter(items.into_iter().map(Ok)))
        .try_flatten()
        .boxed()
    }
}

/// Follow a dotted path such as `data.items` into a JSON value
fn lookup<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.')
        .filter(|segment| !segment.is_empty())
        .try_fold(value, |current, segment| current.get(segment))
}

// ============================================================================
// Date range
// ============================================================================

/// One descriptor per date in `[start_date, end_date]`, rendered from a URL
/// template containing `{date}`
#[derive(Debug, Clone)]
pub struct DateRangeHttpLocator {
    id: String,
    client: HttpClient,
    url_template: String,
    start_date: NaiveDate,
    end_date: NaiveDate,
    date_format: String,
    step_days: u64,
}

impl DateRangeHttpLocator {
    pub fn new(
        id: impl Into<String>,
        client: HttpClient,
        url_template: impl Into<String>,
        start_date: NaiveDate,
        end_date: NaiveDate,
        date_format: impl Into<String>,
        step_days: u64,
    ) -> Result<Self, ConfigError> {
        let id = id.into();
        let url_template = url_template.into();
        let invalid = |message: &str| ConfigError::InvalidStrategy {
            strategy_type: "date_range_http_locator".to_string(),
            strategy_id: id.clone(),
            message: message.to_string(),
        };

        if !url_template.contains("{date}") {
            return Err(invalid("url_template must contain '{date}'"));
        }
        if step_days == 0 {
            return Err(invalid("step_days must be at least 1"));
        }
        let date_format = date_format.into();
        if render_date(start_date, &date_format).is_none() {
            return Err(invalid(&format!(
                "date_format '{}' is not a strftime format a date can render",
                date_format
            )));
        }

        Ok(Self {
            id,
            client,
            url_template,
            start_date,
            end_date,
            date_format,
            step_days,
        })
    }

    fn dates(&self) -> impl Iterator<Item = NaiveDate> + Send + '_ {
        std::iter::successors(Some(self.start_date), move |date| {
            date.checked_add_days(Days::new(self.step_days))
        })
        .take_while(move |date| *date <= self.end_date)
    }

    fn descriptor(&self, date: NaiveDate) -> Result<ResourceDescriptor, LocatorError> {
        let formatted = render_date(date, &self.date_format).ok_or_else(|| {
            LocatorError::new(
                &self.id,
                FailureKind::Permanent,
                format!("cannot render {} with '{}'", date, self.date_format),
            )
        })?;
        let rendered = self.url_template.replace("{date}", &formatted);
        let url = self
            .client
            .resolve(&rendered)
            .map_err(|failure| locator_error(&self.id, failure))?;
        Ok(ResourceDescriptor::new(url.as_str()).with_metadata(ResourceMetadata {
            date: Some(date),
            ..Default::default()
        }))
    }
}

/// `None` when the format has unknown specifiers or needs fields a date lacks
fn render_date(date: NaiveDate, format: &str) -> Option<String> {
    if StrftimeItems::new(format).any(|item| matches!(item, Item::Error)) {
        return None;
    }
    let mut out = String::new();
    write!(out, "{}", date.format(format)).ok()?;
    Some(out)
}

impl Locator for DateRangeHttpLocator {
    fn id(&self) -> &str {
        &self.id
    }

    fn produce(&self) -> DescriptorStream<'_> {
        stream::iter(self.dates().map(move |date| self.descriptor(date))).boxed()
    }
}

// ============================================================================
// Factories
// ============================================================================

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct SingleParams {
    http_config: String,
    url: String,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct PaginatedParams {
    http_config: String,
    url: String,
    items_field: String,
    #[serde(default)]
    url_field: Option<String>,
    #[serde(default)]
    cursor_field: Option<String>,
    #[serde(default)]
    cursor_param: Option<String>,
    #[serde(default)]
    max_pages: Option<u32>,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct DateRangeParams {
    http_config: String,
    url_template: String,
    start_date: NaiveDate,
    #[serde(default)]
    end_date: Option<NaiveDate>,
    #[serde(default)]
    date_format: Option<String>,
    #[serde(default)]
    step_days: Option<u64>,
}

pub(crate) fn single_factory<'a>(
    id: &'a str,
    params: &'a Mapping,
    ctx: &'a BuildContext,
) -> BoxFuture<'a, Result<Arc<dyn Locator>, ConfigError>> {
    Box::pin(async move {
        let params: SingleParams = parse_params("single_http_locator", id, params)?;
        let client = ctx.http_client(&params.http_config)?;
        Ok(Arc::new(SingleHttpLocator::new(id, client, params.url)) as Arc<dyn Locator>)
    })
}

pub(crate) fn paginated_factory<'a>(
    id: &'a str,
    params: &'a Mapping,
    ctx: &'a BuildContext,
) -> BoxFuture<'a, Result<Arc<dyn Locator>, ConfigError>> {
    Box::pin(async move {
        let params: PaginatedParams = parse_params("paginated_http_locator", id, params)?;
        let client = ctx.http_client(&params.http_config)?;
        let pagination = Pagination {
            cursor_field: params.cursor_field,
            cursor_param: params.cursor_param.unwrap_or_else(|| "cursor".to_string()),
            max_pages: params.max_pages,
        };
        Ok(Arc::new(PaginatedHttpLocator::new(
            id,
            client,
            params.url,
            params.items_field,
            params.url_field,
            pagination,
        )) as Arc<dyn Locator>)
    })
}

pub(crate) fn date_range_factory<'a>(
    id: &'a str,
    params: &'a Mapping,
    ctx: &'a BuildContext,
) -> BoxFuture<'a, Result<Arc<dyn Locator>, ConfigError>> {
    Box::pin(async move {
        let params: DateRangeParams = parse_params("date_range_http_locator", id, params)?;
        let client = ctx.http_client(&params.http_config)?;
        let end_date = params.end_date.unwrap_or_else(|| Utc::now().date_naive());
        let locator = DateRangeHttpLocator::new(
            id,
            client,
            params.url_template,
            params.start_date,
            end_date,
            params.date_format.unwrap_or_else(|| "%Y-%m-%d".to_string()),
            params.step_days.unwrap_or(1),
        )?;
        Ok(Arc::new(locator) as Arc<dyn Locator>)
    })
}
