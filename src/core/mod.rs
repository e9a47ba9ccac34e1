mod engine;
mod error;
mod money;
mod schedule;
mod types;

pub use engine::{
    DEFAULT_CONFIDENCE, DEFAULT_MAX_ITERATIONS, Projector, STATUS_PREVIEW_COUNT,
    next_occurrence_after,
};
pub use error::{ProjectionError, Result};
pub use money::{amount_at, annual_cost, round2, vat_breakdown};
pub use schedule::{days_in_month, next_occurrence};
pub use types::{
    DueExpense, ExpenseOccurrence, Frequency, PreviewMetrics, PreviewSummary, Projection,
    RecurringExpenseTemplate, RecurringTotals, Settlement, TemplateStatus, TemplateSummary,
    TruncationReason, VatBreakdown,
};
