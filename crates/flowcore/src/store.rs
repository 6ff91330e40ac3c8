use crate::{FlowId, FlowState, FlowStatus, PauseReason, StoreError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Durable, document-style persistence for flow state.
///
/// `save` is a compare-and-swap on `FlowState::version`: a flow that has never
/// been stored must carry version 0, and a stored flow is only replaced when
/// the incoming version equals the stored one. The new version is returned and
/// the caller is expected to adopt it.
#[async_trait]
pub trait FlowStore: Send + Sync {
    async fn save(&self, state: &FlowState) -> Result<u64, StoreError>;

    async fn load(&self, flow_id: FlowId) -> Result<FlowState, StoreError>;

    async fn query(&self, filter: &FlowFilter, page: PageRequest) -> Result<PagedResult<FlowState>, StoreError>;
}

/// Metadata filter over stored flows. Empty fields match everything.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FlowFilter {
    #[serde(default)]
    pub statuses: Vec<FlowStatus>,
    #[serde(default)]
    pub flow_type: Option<String>,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub correlation_id: Option<String>,
    #[serde(default)]
    pub pause_reasons: Vec<PauseReason>,
    #[serde(default)]
    pub created: DateRange,
}

impl FlowFilter {
    pub fn with_status(status: FlowStatus) -> Self {
        Self {
            statuses: vec![status],
            ..Self::default()
        }
    }

    pub fn matches(&self, state: &FlowState) -> bool {
        (self.statuses.is_empty() || self.statuses.contains(&state.status))
            && self.flow_type.as_ref().map_or(true, |t| &state.flow_type == t)
            && self.user_id.as_ref().map_or(true, |u| state.user_id.as_ref() == Some(u))
            && self
                .correlation_id
                .as_ref()
                .map_or(true, |c| state.correlation_id.as_ref() == Some(c))
            && (self.pause_reasons.is_empty()
                || state.pause_reason.is_some_and(|r| self.pause_reasons.contains(&r)))
            && self.created.contains(state.created_at)
    }
}

/// Half-open `[from, to)` range; open ends are unbounded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct DateRange {
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
}

impl DateRange {
    pub fn new(from: Option<DateTime<Utc>>, to: Option<DateTime<Utc>>) -> Self {
        Self { from, to }
    }

    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        self.from.map_or(true, |from| at >= from) && self.to.map_or(true, |to| at < to)
    }
}

/// 1-based page request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageRequest {
    pub page: usize,
    pub page_size: usize,
}

impl PageRequest {
    pub fn new(page: usize, page_size: usize) -> Self {
        Self {
            page: page.max(1),
            page_size: page_size.max(1),
        }
    }

    pub fn offset(&self) -> usize {
        (self.page.max(1) - 1) * self.page_size
    }

    pub fn next(self) -> Self {
        Self {
            page: self.page + 1,
            ..self
        }
    }
}

impl Default for PageRequest {
    fn default() -> Self {
        Self { page: 1, page_size: 50 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PagedResult<T> {
    pub items: Vec<T>,
    pub total: usize,
    pub page: usize,
    pub page_size: usize,
}

impl<T> PagedResult<T> {
    /// Sort newest first and cut out the requested page.
    pub fn from_sorted(mut items: Vec<T>, page: PageRequest, created_at: impl Fn(&T) -> (DateTime<Utc>, FlowId)) -> Self {
        items.sort_by(|a, b| created_at(b).cmp(&created_at(a)));
        let total = items.len();
        let items = items.into_iter().skip(page.offset()).take(page.page_size).collect();
        Self {
            items,
            total,
            page: page.page,
            page_size: page.page_size,
        }
    }

    pub fn has_more(&self) -> bool {
        self.page * self.page_size < self.total
    }

    pub fn map<U>(self, f: impl FnMut(T) -> U) -> PagedResult<U> {
        PagedResult {
            items: self.items.into_iter().map(f).collect(),
            total: self.total,
            page: self.page,
            page_size: self.page_size,
        }
    }
}

/// Drain every page of a query.
pub async fn query_all(store: &dyn FlowStore, filter: &FlowFilter) -> Result<Vec<FlowState>, StoreError> {
    let mut page = PageRequest::new(1, 200);
    let mut all = Vec::new();
    loop {
        let result = store.query(filter, page).await?;
        let more = result.has_more();
        all.extend(result.items);
        if !more {
            return Ok(all);
        }
        page = page.next();
    }
}
