use std::collections::{BTreeMap, BTreeSet, HashMap};

use chrono::{Days, NaiveDate};
use tracing::{debug, warn};

use super::error::{ProjectionError, Result};
use super::money::{amount_at, annual_cost, template_vat};
use super::schedule::next_occurrence;
use super::types::{
    DueExpense, ExpenseOccurrence, PreviewMetrics, PreviewSummary, Projection,
    RecurringExpenseTemplate, RecurringTotals, Settlement, TemplateStatus, TruncationReason,
};

pub const DEFAULT_MAX_ITERATIONS: usize = 1000;
pub const DEFAULT_CONFIDENCE: f64 = 0.95;
pub const STATUS_PREVIEW_COUNT: usize = 6;
const DAYS_PER_PROJECTED_YEAR: u32 = 365;

/// Walks recurring expense templates forward into dated occurrences.
///
/// Holds no state besides its limits; every operation takes its reference
/// date from the caller.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Projector {
    max_iterations: usize,
    confidence: f64,
}

impl Default for Projector {
    fn default() -> Self {
        Self::new()
    }
}

impl Projector {
    pub fn new() -> Self {
        Self {
            max_iterations: DEFAULT_MAX_ITERATIONS,
            confidence: DEFAULT_CONFIDENCE,
        }
    }

    pub fn with_max_iterations(self, max_iterations: usize) -> Self {
        Self {
            max_iterations,
            ..self
        }
    }

    pub fn with_confidence(self, confidence: f64) -> Self {
        Self { confidence, ..self }
    }

    pub fn max_iterations(&self) -> usize {
        self.max_iterations
    }

    pub fn confidence(&self) -> f64 {
        self.confidence
    }

    /// Occurrences from `max(next_occurrence, walk_start)` up to
    /// `walk_start + horizon_days`, stopping early at the template's `end_date`.
    pub fn enumerate(
        &self,
        template: &RecurringExpenseTemplate,
        horizon_days: u32,
        walk_start: NaiveDate,
    ) -> Result<Projection> {
        if !template.is_active {
            return Ok(Projection::empty());
        }
        template.validate()?;

        let boundary = walk_start
            .checked_add_days(Days::new(u64::from(horizon_days)))
            .unwrap_or(NaiveDate::MAX);
        let cursor = template.next_occurrence.max(walk_start);
        Ok(self.walk(template, cursor, boundary))
    }

    /// Full history of a template: every occurrence from `start_date` through `until`.
    pub fn enumerate_from_start(
        &self,
        template: &RecurringExpenseTemplate,
        until: NaiveDate,
    ) -> Result<Projection> {
        if !template.is_active {
            return Ok(Projection::empty());
        }
        template.validate()?;

        if until < template.start_date {
            return Ok(Projection::empty());
        }
        Ok(self.walk(template, template.start_date, until))
    }

    fn walk(
        &self,
        template: &RecurringExpenseTemplate,
        mut cursor: NaiveDate,
        boundary: NaiveDate,
    ) -> Projection {
        let description = template.describe();
        let mut occurrences = Vec::new();
        let mut truncation = None;

        while cursor <= boundary && template.end_date.is_none_or(|end| cursor <= end) {
            if occurrences.len() >= self.max_iterations {
                truncation = Some(TruncationReason::IterationCap {
                    limit: self.max_iterations,
                });
                break;
            }

            occurrences.push(self.materialize(template, cursor, description.clone()));

            let next = next_occurrence(cursor, template.frequency, template.day_of_month);
            if next <= cursor {
                truncation = Some(TruncationReason::Stalled { at: cursor });
                break;
            }
            cursor = next;
        }

        match truncation {
            Some(reason) => {
                warn!(
                    template_id = %template.id,
                    emitted = occurrences.len(),
                    %reason,
                    "recurring expense projection truncated"
                );
                Projection::Truncated {
                    occurrences,
                    reason,
                }
            }
            None => {
                debug!(
                    template_id = %template.id,
                    emitted = occurrences.len(),
                    %boundary,
                    "enumerated recurring expense occurrences"
                );
                Projection::Complete { occurrences }
            }
        }
    }

    fn materialize(
        &self,
        template: &RecurringExpenseTemplate,
        date: NaiveDate,
        description: String,
    ) -> ExpenseOccurrence {
        let amount = amount_at(
            template.amount,
            template.amount_escalation_percentage,
            template.start_date,
            date,
        );
        let vat = template_vat(template, amount);

        ExpenseOccurrence {
            date,
            amount,
            gross_amount: vat.gross_amount,
            vat_amount: vat.vat_amount,
            deductible_vat_amount: vat.deductible_vat_amount,
            template_id: template.id.clone(),
            template_name: template.name.clone(),
            description,
            confidence: self.confidence,
        }
    }

    /// Next `count` due dates starting exactly at `next_occurrence`, with no
    /// clamping to a reference date. Never returns more than `max_iterations`.
    pub fn preview_occurrences(
        &self,
        template: &RecurringExpenseTemplate,
        count: usize,
    ) -> Result<Vec<ExpenseOccurrence>> {
        if !template.is_active {
            return Ok(Vec::new());
        }
        template.validate()?;

        let limit = count.min(self.max_iterations);
        let mut occurrences = Vec::with_capacity(limit);
        let mut cursor = template.next_occurrence;
        for _ in 0..limit {
            if template.end_date.is_some_and(|end| cursor > end) {
                break;
            }
            occurrences.push(self.materialize(template, cursor, template.name.clone()));

            let next = next_occurrence(cursor, template.frequency, template.day_of_month);
            if next <= cursor {
                break;
            }
            cursor = next;
        }
        Ok(occurrences)
    }

    pub fn preview_summary(
        &self,
        template: &RecurringExpenseTemplate,
        count: usize,
    ) -> Result<PreviewSummary> {
        let occurrences = self.preview_occurrences(template, count)?;
        let annual = annual_cost(template);
        let metrics = PreviewMetrics {
            count: occurrences.len(),
            total_cost: occurrences.iter().map(|o| o.gross_amount).sum(),
            annual_cost: annual,
            average_monthly_cost: annual / 12.0,
        };

        Ok(PreviewSummary {
            template: template.into(),
            occurrences,
            metrics,
        })
    }

    /// Gross totals over every template's projection, grouped by frequency and category.
    pub fn total_recurring_expenses(
        &self,
        templates: &[RecurringExpenseTemplate],
        horizon_days: u32,
        walk_start: NaiveDate,
    ) -> Result<RecurringTotals> {
        let mut by_frequency = BTreeMap::new();
        let mut by_category = BTreeMap::new();
        let mut occurrences = Vec::new();
        let mut truncated_templates = Vec::new();

        for template in templates {
            let projection = self.enumerate(template, horizon_days, walk_start)?;
            if projection.is_truncated() {
                truncated_templates.push(template.id.clone());
            }

            let template_total = projection.gross_total();
            *by_frequency.entry(template.frequency).or_insert(0.0) += template_total;
            if let Some(category) = &template.category_id {
                *by_category.entry(category.clone()).or_insert(0.0) += template_total;
            }
            occurrences.extend(projection.into_occurrences());
        }

        let total: f64 = occurrences.iter().map(|o| o.gross_amount).sum();
        Ok(RecurringTotals {
            total,
            by_frequency,
            by_category,
            occurrences,
            truncated_templates,
        })
    }

    /// Escalation-aware yearly cost: the sum of a real 365-day projection.
    ///
    /// Unlike [`annual_cost`] this honours escalation steps and `end_date`
    /// inside the year, so the two diverge for escalating templates.
    pub fn projected_annual_cost(
        &self,
        template: &RecurringExpenseTemplate,
        walk_start: NaiveDate,
    ) -> Result<f64> {
        Ok(self
            .enumerate(template, DAYS_PER_PROJECTED_YEAR, walk_start)?
            .gross_total())
    }

    pub fn template_status(
        &self,
        template: &RecurringExpenseTemplate,
        today: NaiveDate,
        recorded: &BTreeSet<NaiveDate>,
    ) -> Result<TemplateStatus> {
        let history = self.enumerate_from_start(template, today)?;
        let truncation = history.truncation().cloned();
        let expected = history.into_occurrences();
        let expected_occurrences = expected.len();
        let outstanding = outstanding_only(expected, recorded);

        Ok(TemplateStatus {
            template_id: template.id.clone(),
            annual_cost: annual_cost(template),
            next_occurrences: self.preview_occurrences(template, STATUS_PREVIEW_COUNT)?,
            expected_occurrences,
            recorded_occurrences: recorded.len(),
            outstanding_occurrences: outstanding.len(),
            outstanding_amount: outstanding.iter().map(|o| o.gross_amount).sum(),
            next_outstanding_occurrence: outstanding.first().map(|o| o.date),
            truncation,
        })
    }

    /// Outstanding occurrences up to `today` for a template that is already due.
    pub fn due_expense(
        &self,
        template: &RecurringExpenseTemplate,
        today: NaiveDate,
        recorded: &BTreeSet<NaiveDate>,
    ) -> Result<Option<DueExpense>> {
        if !template.is_active || template.next_occurrence > today {
            return Ok(None);
        }

        let (outstanding, truncation) = self.outstanding_until(template, today, recorded)?;
        let (Some(first), Some(last)) = (outstanding.first(), outstanding.last()) else {
            return Ok(None);
        };

        Ok(Some(DueExpense {
            template: template.clone(),
            occurrences_due: outstanding.len(),
            total_amount: outstanding.iter().map(|o| o.gross_amount).sum(),
            next_occurrence_date: first.date,
            last_occurrence_date: last.date,
            truncation,
        }))
    }

    /// Due expenses across templates, earliest `next_occurrence` first.
    pub fn due_expenses(
        &self,
        templates: &[RecurringExpenseTemplate],
        today: NaiveDate,
        recorded_by_template: &HashMap<String, BTreeSet<NaiveDate>>,
    ) -> Result<Vec<DueExpense>> {
        let empty = BTreeSet::new();
        let mut ordered = templates.iter().collect::<Vec<_>>();
        ordered.sort_by_key(|t| t.next_occurrence);

        let mut due = Vec::new();
        for template in ordered {
            let recorded = recorded_by_template.get(&template.id).unwrap_or(&empty);
            if let Some(expense) = self.due_expense(template, today, recorded)? {
                due.push(expense);
            }
        }
        Ok(due)
    }

    /// Occurrences still to be booked as expenses, and the template's next due
    /// date once they are. Nothing is persisted.
    ///
    /// A truncated history is refused: advancing `next_occurrence` past it would
    /// drop every occurrence beyond the iteration cap.
    pub fn settle(
        &self,
        template: &RecurringExpenseTemplate,
        today: NaiveDate,
        recorded: &BTreeSet<NaiveDate>,
    ) -> Result<Settlement> {
        if !template.is_active {
            return Err(ProjectionError::InvalidRequest(format!(
                "template {} is not active",
                template.id
            )));
        }

        let (outstanding, truncation) = self.outstanding_until(template, today, recorded)?;
        if let Some(reason) = truncation {
            return Err(ProjectionError::InvalidRequest(format!(
                "history of template {} is incomplete ({reason}); raise the iteration cap to settle it",
                template.id
            )));
        }
        if outstanding.is_empty() {
            return Err(ProjectionError::InvalidRequest(format!(
                "no outstanding occurrences for template {}",
                template.id
            )));
        }

        Ok(Settlement {
            template_id: template.id.clone(),
            count: outstanding.len(),
            total_amount: outstanding.iter().map(|o| o.gross_amount).sum(),
            occurrences: outstanding,
            next_occurrence: next_occurrence_after(template, today),
        })
    }

    fn outstanding_until(
        &self,
        template: &RecurringExpenseTemplate,
        today: NaiveDate,
        recorded: &BTreeSet<NaiveDate>,
    ) -> Result<(Vec<ExpenseOccurrence>, Option<TruncationReason>)> {
        let history = self.enumerate_from_start(template, today)?;
        let truncation = history.truncation().cloned();
        let due = history
            .into_occurrences()
            .into_iter()
            .filter(|o| o.date <= today)
            .collect();
        Ok((outstanding_only(due, recorded), truncation))
    }
}

fn outstanding_only(
    occurrences: Vec<ExpenseOccurrence>,
    recorded: &BTreeSet<NaiveDate>,
) -> Vec<ExpenseOccurrence> {
    occurrences
        .into_iter()
        .filter(|o| !recorded.contains(&o.date))
        .collect()
}

/// One schedule step from an arbitrary date using the template's cadence.
pub fn next_occurrence_after(template: &RecurringExpenseTemplate, from: NaiveDate) -> NaiveDate {
    next_occurrence(from, template.frequency, template.day_of_month)
}
