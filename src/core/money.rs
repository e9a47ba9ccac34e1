use chrono::NaiveDate;

use super::types::{RecurringExpenseTemplate, VatBreakdown};

const DAYS_PER_YEAR: f64 = 365.25;

/// Rounds to currency-cent precision, with half-cents going towards positive infinity.
pub fn round2(value: f64) -> f64 {
    (value * 100.0 + 0.5).floor() / 100.0
}

/// Base amount compounded once per completed (calendar-approximate) year since `start_date`.
pub fn amount_at(
    base_amount: f64,
    escalation_percentage: Option<f64>,
    start_date: NaiveDate,
    at_date: NaiveDate,
) -> f64 {
    let pct = match escalation_percentage {
        Some(pct) if pct != 0.0 => pct,
        _ => return base_amount,
    };

    let years_since_start = (at_date - start_date).num_days() as f64 / DAYS_PER_YEAR;
    let periods = years_since_start.floor() as i32;
    round2(base_amount * (1.0 + pct / 100.0).powi(periods))
}

/// Each derived quantity is rounded on its own; `gross_amount` is the plain sum.
pub fn vat_breakdown(
    net_amount: f64,
    vat_rate: f64,
    is_deductible: bool,
    business_use_percentage: f64,
) -> VatBreakdown {
    let vat_amount = round2(net_amount * (vat_rate / 100.0));
    let gross_amount = net_amount + vat_amount;
    let deductible_vat_amount = if is_deductible {
        round2(vat_amount * (business_use_percentage / 100.0))
    } else {
        0.0
    };

    VatBreakdown {
        gross_amount,
        vat_amount,
        deductible_vat_amount,
    }
}

pub(crate) fn template_vat(template: &RecurringExpenseTemplate, net_amount: f64) -> VatBreakdown {
    vat_breakdown(
        net_amount,
        template.vat_rate,
        template.is_vat_deductible,
        template.business_use_percentage,
    )
}

/// Gross cost of a year at the base amount; ignores escalation and `end_date`.
pub fn annual_cost(template: &RecurringExpenseTemplate) -> f64 {
    let vat = template_vat(template, template.amount);
    vat.gross_amount * f64::from(template.frequency.occurrences_per_year())
}
