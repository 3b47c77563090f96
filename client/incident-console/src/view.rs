//! Derived views: filter -> sort -> paginate, plus severity summary.
//!
//! Everything here is a pure function of (incidents, filter state). The memo
//! only skips recomputation when neither the store revision nor the filter
//! changed; results are identical either way.

use std::cmp::Ordering;
use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::store::IncidentStore;
use crate::types::{Incident, Severity, Status};

pub const DEFAULT_ROWS_PER_PAGE: usize = 10;

// ---------------------------------------------------------------------------
// Filter state
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortBy {
  #[default]
  Timestamp,
  Severity,
}

impl SortBy {
  pub fn from_str_loose(s: &str) -> Option<Self> {
    match s {
      "timestamp" => Some(Self::Timestamp),
      "severity" => Some(Self::Severity),
      _ => None,
    }
  }

  pub fn as_str(self) -> &'static str {
    match self {
      Self::Timestamp => "timestamp",
      Self::Severity => "severity",
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
  Asc,
  #[default]
  Desc,
}

impl SortOrder {
  pub fn from_str_loose(s: &str) -> Option<Self> {
    match s {
      "asc" => Some(Self::Asc),
      "desc" => Some(Self::Desc),
      _ => None,
    }
  }

  pub fn as_str(self) -> &'static str {
    match self {
      Self::Asc => "asc",
      Self::Desc => "desc",
    }
  }
}

/// UI-owned filter state. Not validated by the store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FilterState {
  /// Empty means "all severities".
  pub severities: BTreeSet<Severity>,
  pub status: Option<Status>,
  pub category: Option<String>,
  /// Case-insensitive substring of `source`.
  pub search: String,
  pub sort_by: SortBy,
  pub sort_order: SortOrder,
  /// 1-based.
  pub page: usize,
  pub rows_per_page: usize,
}

impl Default for FilterState {
  fn default() -> Self {
    Self {
      severities: BTreeSet::new(),
      status: None,
      category: None,
      search: String::new(),
      sort_by: SortBy::default(),
      sort_order: SortOrder::default(),
      page: 1,
      rows_per_page: DEFAULT_ROWS_PER_PAGE,
    }
  }
}

impl FilterState {
  pub fn matches(&self, incident: &Incident) -> bool {
    if !self.severities.is_empty() && !self.severities.contains(&incident.severity) {
      return false;
    }
    if self.status.is_some_and(|s| s != incident.status) {
      return false;
    }
    if self.category.as_ref().is_some_and(|c| *c != incident.category) {
      return false;
    }
    if !self.search.is_empty()
      && !incident
        .source
        .to_lowercase()
        .contains(&self.search.to_lowercase())
    {
      return false;
    }
    true
  }

  pub fn compare(&self, a: &Incident, b: &Incident) -> Ordering {
    let ord = match self.sort_by {
      SortBy::Timestamp => a.timestamp.cmp(&b.timestamp),
      SortBy::Severity => a.severity.rank().cmp(&b.severity.rank()),
    };
    match self.sort_order {
      SortOrder::Asc => ord,
      SortOrder::Desc => ord.reverse(),
    }
  }

  /// Number of narrowing dimensions in use (badge count).
  pub fn active_filter_count(&self) -> usize {
    [
      !self.severities.is_empty(),
      self.status.is_some(),
      self.category.is_some(),
      !self.search.is_empty(),
    ]
    .into_iter()
    .filter(|active| *active)
    .count()
  }

  /// Drop every narrowing dimension; sorting and page size are kept.
  pub fn clear_filters(&mut self) {
    self.severities.clear();
    self.status = None;
    self.category = None;
    self.search.clear();
    self.page = 1;
  }
}

// ---------------------------------------------------------------------------
// Pipeline stages
// ---------------------------------------------------------------------------

pub fn filter(incidents: &[Incident], state: &FilterState) -> Vec<Incident> {
  incidents.iter().filter(|i| state.matches(i)).cloned().collect()
}

/// Stable sort, so equal keys keep first-seen order.
pub fn sort(rows: &mut [Incident], state: &FilterState) {
  rows.sort_by(|a, b| state.compare(a, b));
}

/// `[(page-1)*rows_per_page, page*rows_per_page)`; anything out of range
/// (page 0 included) is empty.
pub fn paginate(rows: &[Incident], page: usize, rows_per_page: usize) -> &[Incident] {
  if page == 0 || rows_per_page == 0 {
    return &[];
  }
  let start = (page - 1).saturating_mul(rows_per_page);
  if start >= rows.len() {
    return &[];
  }
  let end = start.saturating_add(rows_per_page).min(rows.len());
  &rows[start..end]
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SummaryCounts {
  pub critical: usize,
  pub high: usize,
  pub medium: usize,
  pub low: usize,
  pub open: usize,
  pub total: usize,
}

impl SummaryCounts {
  pub fn for_severity(&self, severity: Severity) -> usize {
    match severity {
      Severity::Critical => self.critical,
      Severity::High => self.high,
      Severity::Medium => self.medium,
      Severity::Low => self.low,
    }
  }
}

/// Counts over the unfiltered set.
pub fn summarize(incidents: &[Incident]) -> SummaryCounts {
  let mut counts = SummaryCounts {
    total: incidents.len(),
    ..Default::default()
  };
  for incident in incidents {
    match incident.severity {
      Severity::Critical => counts.critical += 1,
      Severity::High => counts.high += 1,
      Severity::Medium => counts.medium += 1,
      Severity::Low => counts.low += 1,
    }
    if incident.status == Status::Open {
      counts.open += 1;
    }
  }
  counts
}

// ---------------------------------------------------------------------------
// Composed view
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IncidentView {
  pub rows: Vec<Incident>,
  pub page: usize,
  pub rows_per_page: usize,
  /// Rows matching the filter before pagination.
  pub filtered_total: usize,
  pub total_pages: usize,
}

pub fn derive_view(incidents: &[Incident], state: &FilterState) -> IncidentView {
  let mut rows = filter(incidents, state);
  sort(&mut rows, state);
  let filtered_total = rows.len();
  let total_pages = if state.rows_per_page == 0 {
    0
  } else {
    filtered_total.div_ceil(state.rows_per_page)
  };
  IncidentView {
    rows: paginate(&rows, state.page, state.rows_per_page).to_vec(),
    page: state.page,
    rows_per_page: state.rows_per_page,
    filtered_total,
    total_pages,
  }
}

/// Caches the last view per (store revision, filter state).
#[derive(Debug, Default)]
pub struct ViewMemo {
  last: Option<(u64, FilterState, IncidentView)>,
}

impl ViewMemo {
  pub fn view(&mut self, store: &IncidentStore, state: &FilterState) -> IncidentView {
    if let Some((revision, cached_state, view)) = &self.last {
      if *revision == store.revision() && cached_state == state {
        return view.clone();
      }
    }
    let view = derive_view(&store.all(), state);
    self.last = Some((store.revision(), state.clone(), view.clone()));
    view
  }
}
