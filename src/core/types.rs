use std::collections::BTreeMap;
use std::fmt;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use super::error::{ProjectionError, Result};

#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Frequency {
    Weekly,
    Monthly,
    Quarterly,
    Yearly,
}

impl Frequency {
    pub fn as_str(self) -> &'static str {
        match self {
            Frequency::Weekly => "weekly",
            Frequency::Monthly => "monthly",
            Frequency::Quarterly => "quarterly",
            Frequency::Yearly => "yearly",
        }
    }

    /// Fixed occurrence count used by the simplified annual cost estimate.
    pub fn occurrences_per_year(self) -> u32 {
        match self {
            Frequency::Weekly => 52,
            Frequency::Monthly => 12,
            Frequency::Quarterly => 4,
            Frequency::Yearly => 1,
        }
    }
}

impl fmt::Display for Frequency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Definition of a periodic obligation as stored by the persistence layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "TemplateRecord")]
pub struct RecurringExpenseTemplate {
    pub id: String,
    pub name: String,
    pub amount: f64,
    pub currency: String,
    pub frequency: Frequency,
    pub start_date: NaiveDate,
    pub end_date: Option<NaiveDate>,
    pub next_occurrence: NaiveDate,
    pub day_of_month: Option<u32>,
    pub amount_escalation_percentage: Option<f64>,
    /// Carried for the record only; escalation always compounds from `start_date`.
    pub last_escalation_date: Option<NaiveDate>,
    pub is_active: bool,
    pub vat_rate: f64,
    pub is_vat_deductible: bool,
    pub business_use_percentage: f64,
    pub category_id: Option<String>,
}

// Wire shape with the defaults applied when a template is created without them.
#[derive(Deserialize)]
struct TemplateRecord {
    id: String,
    name: String,
    amount: f64,
    #[serde(default = "default_currency")]
    currency: String,
    frequency: Frequency,
    start_date: NaiveDate,
    #[serde(default)]
    end_date: Option<NaiveDate>,
    #[serde(default)]
    next_occurrence: Option<NaiveDate>,
    #[serde(default)]
    day_of_month: Option<u32>,
    #[serde(default)]
    amount_escalation_percentage: Option<f64>,
    #[serde(default)]
    last_escalation_date: Option<NaiveDate>,
    #[serde(default = "default_true")]
    is_active: bool,
    #[serde(default = "default_vat_rate")]
    vat_rate: f64,
    #[serde(default = "default_true")]
    is_vat_deductible: bool,
    #[serde(default = "default_business_use")]
    business_use_percentage: f64,
    #[serde(default)]
    category_id: Option<String>,
}

fn default_currency() -> String {
    "EUR".to_string()
}

fn default_true() -> bool {
    true
}

fn default_vat_rate() -> f64 {
    21.0
}

fn default_business_use() -> f64 {
    100.0
}

impl From<TemplateRecord> for RecurringExpenseTemplate {
    fn from(record: TemplateRecord) -> Self {
        Self {
            next_occurrence: record.next_occurrence.unwrap_or(record.start_date),
            id: record.id,
            name: record.name,
            amount: record.amount,
            currency: record.currency,
            frequency: record.frequency,
            start_date: record.start_date,
            end_date: record.end_date,
            day_of_month: record.day_of_month,
            amount_escalation_percentage: record.amount_escalation_percentage,
            last_escalation_date: record.last_escalation_date,
            is_active: record.is_active,
            vat_rate: record.vat_rate,
            is_vat_deductible: record.is_vat_deductible,
            business_use_percentage: record.business_use_percentage,
            category_id: record.category_id,
        }
    }
}

impl RecurringExpenseTemplate {
    /// Template with the creation defaults: EUR, 21% deductible VAT, full business use.
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        amount: f64,
        frequency: Frequency,
        start_date: NaiveDate,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            amount,
            currency: default_currency(),
            frequency,
            start_date,
            end_date: None,
            next_occurrence: start_date,
            day_of_month: None,
            amount_escalation_percentage: None,
            last_escalation_date: None,
            is_active: true,
            vat_rate: default_vat_rate(),
            is_vat_deductible: true,
            business_use_percentage: default_business_use(),
            category_id: None,
        }
    }

    pub fn validate(&self) -> Result<()> {
        let invalid = |reason: &str| Err(ProjectionError::invalid_template(&self.id, reason));

        if self.name.trim().is_empty() {
            return invalid("name must not be empty");
        }
        if !self.amount.is_finite() || self.amount <= 0.0 {
            return invalid("amount must be greater than 0");
        }
        if !self.vat_rate.is_finite() || !(0.0..=100.0).contains(&self.vat_rate) {
            return invalid("vat_rate must be between 0 and 100");
        }
        if !self.business_use_percentage.is_finite()
            || !(0.0..=100.0).contains(&self.business_use_percentage)
        {
            return invalid("business_use_percentage must be between 0 and 100");
        }
        if let Some(day) = self.day_of_month {
            if !(1..=31).contains(&day) {
                return invalid("day_of_month must be between 1 and 31");
            }
        }
        if let Some(pct) = self.amount_escalation_percentage {
            if !pct.is_finite() || pct <= -100.0 {
                return invalid("amount_escalation_percentage must be > -100");
            }
        }
        if let Some(end) = self.end_date {
            if end < self.start_date {
                return invalid("end_date must not precede start_date");
            }
        }
        Ok(())
    }

    pub(crate) fn describe(&self) -> String {
        format!("{} ({})", self.name, self.frequency)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct VatBreakdown {
    pub gross_amount: f64,
    pub vat_amount: f64,
    pub deductible_vat_amount: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExpenseOccurrence {
    pub date: NaiveDate,
    pub amount: f64,
    pub gross_amount: f64,
    pub vat_amount: f64,
    pub deductible_vat_amount: f64,
    pub template_id: String,
    pub template_name: String,
    pub description: String,
    pub confidence: f64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TruncationReason {
    IterationCap { limit: usize },
    Stalled { at: NaiveDate },
}

impl fmt::Display for TruncationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TruncationReason::IterationCap { limit } => {
                write!(f, "iteration cap of {limit} reached")
            }
            TruncationReason::Stalled { at } => write!(f, "schedule stopped advancing at {at}"),
        }
    }
}

/// Result of walking a template forward; `Truncated` marks a partial list.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Projection {
    Complete {
        occurrences: Vec<ExpenseOccurrence>,
    },
    Truncated {
        occurrences: Vec<ExpenseOccurrence>,
        reason: TruncationReason,
    },
}

impl Projection {
    pub fn empty() -> Self {
        Projection::Complete {
            occurrences: Vec::new(),
        }
    }

    pub fn occurrences(&self) -> &[ExpenseOccurrence] {
        match self {
            Projection::Complete { occurrences } | Projection::Truncated { occurrences, .. } => {
                occurrences
            }
        }
    }

    pub fn into_occurrences(self) -> Vec<ExpenseOccurrence> {
        match self {
            Projection::Complete { occurrences } | Projection::Truncated { occurrences, .. } => {
                occurrences
            }
        }
    }

    pub fn truncation(&self) -> Option<&TruncationReason> {
        match self {
            Projection::Complete { .. } => None,
            Projection::Truncated { reason, .. } => Some(reason),
        }
    }

    pub fn is_truncated(&self) -> bool {
        self.truncation().is_some()
    }

    pub fn gross_total(&self) -> f64 {
        self.occurrences().iter().map(|o| o.gross_amount).sum()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecurringTotals {
    pub total: f64,
    pub by_frequency: BTreeMap<Frequency, f64>,
    pub by_category: BTreeMap<String, f64>,
    pub occurrences: Vec<ExpenseOccurrence>,
    pub truncated_templates: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TemplateSummary {
    pub id: String,
    pub name: String,
    pub frequency: Frequency,
    pub amount: f64,
}

impl From<&RecurringExpenseTemplate> for TemplateSummary {
    fn from(template: &RecurringExpenseTemplate) -> Self {
        Self {
            id: template.id.clone(),
            name: template.name.clone(),
            frequency: template.frequency,
            amount: template.amount,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PreviewMetrics {
    pub count: usize,
    pub total_cost: f64,
    pub annual_cost: f64,
    pub average_monthly_cost: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PreviewSummary {
    pub template: TemplateSummary,
    pub occurrences: Vec<ExpenseOccurrence>,
    pub metrics: PreviewMetrics,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DueExpense {
    pub template: RecurringExpenseTemplate,
    pub occurrences_due: usize,
    pub total_amount: f64,
    pub next_occurrence_date: NaiveDate,
    pub last_occurrence_date: NaiveDate,
    /// Set when the history walk hit a limit; later outstanding dates are missing.
    pub truncation: Option<TruncationReason>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TemplateStatus {
    pub template_id: String,
    pub annual_cost: f64,
    pub next_occurrences: Vec<ExpenseOccurrence>,
    pub expected_occurrences: usize,
    pub recorded_occurrences: usize,
    pub outstanding_occurrences: usize,
    pub outstanding_amount: f64,
    pub next_outstanding_occurrence: Option<NaiveDate>,
    pub truncation: Option<TruncationReason>,
}

/// Occurrences to book for a template and the date it is next due afterwards.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Settlement {
    pub template_id: String,
    pub occurrences: Vec<ExpenseOccurrence>,
    pub count: usize,
    pub total_amount: f64,
    pub next_occurrence: NaiveDate,
}
