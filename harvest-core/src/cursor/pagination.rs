use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::error::{StateError, StateResult};
use super::store::CursorStore;

/// Durable pointer to the next unprocessed listing page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Cursor {
    pub next_page: u32,
    #[serde(default)]
    pub last_page: u32,
    #[serde(default)]
    pub last_run_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub search_context: String,
}

impl Cursor {
    pub fn initial() -> Self {
        Self::starting_at(1)
    }

    pub fn starting_at(page: u32) -> Self {
        let next_page = page.max(1);
        Self {
            next_page,
            last_page: next_page - 1,
            last_run_at: None,
            search_context: String::new(),
        }
    }

    /// Cursor after `last_attempted` has been visited.
    pub fn advanced_past(
        &self,
        last_attempted: u32,
        search_context: &str,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            next_page: last_attempted.saturating_add(1),
            last_page: last_attempted,
            last_run_at: Some(now),
            search_context: search_context.to_string(),
        }
    }
}

impl Default for Cursor {
    fn default() -> Self {
        Self::initial()
    }
}

/// Contiguous pages processed in one run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Default)]
#[serde(transparent)]
pub struct PageBatch {
    pages: Vec<u32>,
}

impl PageBatch {
    pub fn pages(&self) -> &[u32] {
        &self.pages
    }

    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    pub fn len(&self) -> usize {
        self.pages.len()
    }

    pub fn first(&self) -> Option<u32> {
        self.pages.first().copied()
    }

    pub fn last(&self) -> Option<u32> {
        self.pages.last().copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = u32> + '_ {
        self.pages.iter().copied()
    }
}

/// `[next_page, next_page + batch_size - 1]` clipped to `max_pages`.
///
/// Pure: retrying a crashed run with the same cursor yields the same pages.
pub fn compute_batch(cursor: &Cursor, batch_size: u32, max_pages: u32) -> PageBatch {
    let start = cursor.next_page.max(1);
    if batch_size == 0 || start > max_pages {
        return PageBatch::default();
    }
    let end = start
        .saturating_add(batch_size - 1)
        .min(max_pages);
    PageBatch {
        pages: (start..=end).collect(),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PaginationState {
    Idle,
    BatchComputed,
    BatchRunning,
    Advanced,
    Exhausted,
}

impl fmt::Display for PaginationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            PaginationState::Idle => "idle",
            PaginationState::BatchComputed => "batch_computed",
            PaginationState::BatchRunning => "batch_running",
            PaginationState::Advanced => "advanced",
            PaginationState::Exhausted => "exhausted",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchSource {
    Cursor,
    Override,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunPlan {
    pub batch: PageBatch,
    pub source: BatchSource,
    pub cursor: Cursor,
}

/// Owns the cursor for one run: read once in [`Paginator::begin`], written at
/// most once in [`Paginator::finish`] or [`Paginator::stop_before`].
pub struct Paginator {
    cursors: CursorStore,
    batch_size: u32,
    max_pages: u32,
    state: PaginationState,
    plan: Option<RunPlan>,
    last_completed: Option<u32>,
}

impl Paginator {
    pub fn new(cursors: CursorStore, batch_size: u32, max_pages: u32) -> Self {
        Self {
            cursors,
            batch_size,
            max_pages,
            state: PaginationState::Idle,
            plan: None,
            last_completed: None,
        }
    }

    pub fn state(&self) -> PaginationState {
        self.state
    }

    pub fn plan(&self) -> Option<&RunPlan> {
        self.plan.as_ref()
    }

    pub fn last_completed(&self) -> Option<u32> {
        self.last_completed
    }

    /// Reads the cursor (or takes the explicit page) and computes the batch.
    /// Allowed from idle and from any settled state of a previous batch.
    pub fn begin(&mut self, page_override: Option<u32>) -> StateResult<RunPlan> {
        if matches!(
            self.state,
            PaginationState::BatchComputed | PaginationState::BatchRunning
        ) {
            return Err(StateError::InvalidTransition {
                from: self.state,
                operation: "begin",
            });
        }
        self.last_completed = None;
        let plan = self.preview(page_override)?;
        let basis_page = match page_override {
            Some(page) => page.max(1),
            None => plan.cursor.next_page,
        };
        self.state = if plan.batch.is_empty() {
            PaginationState::Exhausted
        } else {
            PaginationState::BatchComputed
        };
        info!(
            state = %self.state,
            next_page = basis_page,
            max_pages = self.max_pages,
            pages = ?plan.batch.pages(),
            source = ?plan.source,
            "pagination batch computed"
        );
        self.plan = Some(plan.clone());
        Ok(plan)
    }

    /// The plan `begin` would produce, without changing state.
    pub fn preview(&self, page_override: Option<u32>) -> StateResult<RunPlan> {
        let stored = self.cursors.load()?;
        let (basis, source) = match page_override {
            Some(page) => (Cursor::starting_at(page), BatchSource::Override),
            None => (stored.clone(), BatchSource::Cursor),
        };
        Ok(RunPlan {
            batch: compute_batch(&basis, self.batch_size, self.max_pages),
            source,
            cursor: stored,
        })
    }

    pub fn start(&mut self) -> StateResult<()> {
        self.expect(PaginationState::BatchComputed, "start")?;
        self.state = PaginationState::BatchRunning;
        Ok(())
    }

    pub fn page_completed(&mut self, page: u32) -> StateResult<()> {
        self.expect(PaginationState::BatchRunning, "page_completed")?;
        self.last_completed = Some(page);
        Ok(())
    }

    /// Batch done: `next_page = last page attempted + 1`. Override runs never
    /// persist.
    pub fn finish(
        &mut self,
        search_context: &str,
        now: DateTime<Utc>,
    ) -> StateResult<Option<Cursor>> {
        self.expect(PaginationState::BatchRunning, "finish")?;
        let last = self
            .plan
            .as_ref()
            .and_then(|plan| plan.batch.last())
            .ok_or(StateError::InvalidTransition {
                from: self.state,
                operation: "finish",
            })?;
        self.persist(last, search_context, now)
    }

    /// Batch interrupted at `failed_page` after earlier pages completed; the
    /// failed page becomes the next page.
    pub fn stop_before(
        &mut self,
        failed_page: u32,
        search_context: &str,
        now: DateTime<Utc>,
    ) -> StateResult<Option<Cursor>> {
        self.expect(PaginationState::BatchRunning, "stop_before")?;
        self.persist(failed_page.saturating_sub(1), search_context, now)
    }

    /// Leaves the stored cursor untouched so the next run retries the batch.
    pub fn abandon(&mut self) {
        debug!(state = %self.state, "abandoning batch, cursor left untouched");
        self.state = PaginationState::Idle;
        self.plan = None;
        self.last_completed = None;
    }

    fn persist(
        &mut self,
        last_attempted: u32,
        search_context: &str,
        now: DateTime<Utc>,
    ) -> StateResult<Option<Cursor>> {
        let Some(plan) = self.plan.as_ref() else {
            return Err(StateError::InvalidTransition {
                from: self.state,
                operation: "persist",
            });
        };
        if plan.source == BatchSource::Override {
            info!(last_attempted, "explicit page run, cursor not persisted");
            self.state = PaginationState::Advanced;
            return Ok(None);
        }
        let cursor = plan
            .cursor
            .advanced_past(last_attempted, search_context, now);
        self.cursors.save(&cursor)?;
        info!(
            next_page = cursor.next_page,
            last_page = cursor.last_page,
            "cursor advanced"
        );
        self.state = PaginationState::Advanced;
        Ok(Some(cursor))
    }

    fn expect(&self, expected: PaginationState, operation: &'static str) -> StateResult<()> {
        if self.state == expected {
            Ok(())
        } else {
            Err(StateError::InvalidTransition {
                from: self.state,
                operation,
            })
        }
    }
}
