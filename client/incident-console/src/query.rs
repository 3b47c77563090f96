//! Shareable filter representation: flat key/value pairs for deep links.
//!
//! Keys: `severity` (comma-joined), `status`, `category`, `search`, `sortBy`,
//! `sortOrder`, `page`. Defaults and empty values are omitted, and anything
//! unrecognised decodes to the default, so the default state encodes to
//! nothing and nothing decodes to the default state.

use url::form_urlencoded;

use crate::types::{known_category, Severity, Status};
use crate::view::{FilterState, SortBy, SortOrder};

pub const KEY_SEVERITY: &str = "severity";
pub const KEY_STATUS: &str = "status";
pub const KEY_CATEGORY: &str = "category";
pub const KEY_SEARCH: &str = "search";
pub const KEY_SORT_BY: &str = "sortBy";
pub const KEY_SORT_ORDER: &str = "sortOrder";
pub const KEY_PAGE: &str = "page";

pub fn encode(state: &FilterState) -> Vec<(String, String)> {
  let defaults = FilterState::default();
  let mut pairs = Vec::new();

  if !state.severities.is_empty() {
    let joined = state
      .severities
      .iter()
      .map(|s| s.as_str())
      .collect::<Vec<_>>()
      .join(",");
    pairs.push((KEY_SEVERITY.to_string(), joined));
  }
  if let Some(status) = state.status {
    pairs.push((KEY_STATUS.to_string(), status.as_str().to_string()));
  }
  if let Some(category) = state.category.as_deref().filter(|c| !c.is_empty()) {
    pairs.push((KEY_CATEGORY.to_string(), category.to_string()));
  }
  if !state.search.is_empty() {
    pairs.push((KEY_SEARCH.to_string(), state.search.clone()));
  }
  if state.sort_by != defaults.sort_by {
    pairs.push((KEY_SORT_BY.to_string(), state.sort_by.as_str().to_string()));
  }
  if state.sort_order != defaults.sort_order {
    pairs.push((KEY_SORT_ORDER.to_string(), state.sort_order.as_str().to_string()));
  }
  // Pages are 1-based; 0 reads back as the first page.
  let page = state.page.max(1);
  if page != defaults.page {
    pairs.push((KEY_PAGE.to_string(), page.to_string()));
  }
  pairs
}

/// Rebuild a state from pairs. `rows_per_page` is not part of the link and
/// comes from `base`.
pub fn decode_onto<K, V>(pairs: impl IntoIterator<Item = (K, V)>, base: &FilterState) -> FilterState
where
  K: AsRef<str>,
  V: AsRef<str>,
{
  let mut state = FilterState {
    rows_per_page: base.rows_per_page,
    ..FilterState::default()
  };

  for (key, value) in pairs {
    let value = value.as_ref();
    match key.as_ref() {
      KEY_SEVERITY => {
        state.severities = value.split(',').filter_map(Severity::from_str_loose).collect();
      }
      KEY_STATUS => state.status = Status::from_str_loose(value),
      KEY_CATEGORY => {
        state.category = Some(value)
          .filter(|c| !c.is_empty())
          .map(|c| known_category(c).unwrap_or(c).to_string());
      }
      KEY_SEARCH => state.search = value.to_string(),
      KEY_SORT_BY => {
        if let Some(sort_by) = SortBy::from_str_loose(value) {
          state.sort_by = sort_by;
        }
      }
      KEY_SORT_ORDER => {
        if let Some(order) = SortOrder::from_str_loose(value) {
          state.sort_order = order;
        }
      }
      KEY_PAGE => {
        if let Some(page) = value.parse::<usize>().ok().filter(|p| *p > 0) {
          state.page = page;
        }
      }
      other => tracing::debug!("ignoring unknown filter key {:?}", other),
    }
  }
  state
}

pub fn decode<K, V>(pairs: impl IntoIterator<Item = (K, V)>) -> FilterState
where
  K: AsRef<str>,
  V: AsRef<str>,
{
  decode_onto(pairs, &FilterState::default())
}

/// `application/x-www-form-urlencoded` rendition of [`encode`].
pub fn to_query_string(state: &FilterState) -> String {
  form_urlencoded::Serializer::new(String::new())
    .extend_pairs(encode(state))
    .finish()
}

pub fn from_query_string(query: &str) -> FilterState {
  from_query_string_onto(query, &FilterState::default())
}

pub fn from_query_string_onto(query: &str, base: &FilterState) -> FilterState {
  let query = query.strip_prefix('?').unwrap_or(query);
  decode_onto(form_urlencoded::parse(query.as_bytes()), base)
}
