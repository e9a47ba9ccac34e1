use chrono::{Datelike, Days, NaiveDate};

use super::types::Frequency;

pub fn days_in_month(year: i32, month: u32) -> u32 {
    let (next_year, next_month) = if month == 12 {
        (year + 1, 1)
    } else {
        (year, month + 1)
    };
    NaiveDate::from_ymd_opt(next_year, next_month, 1)
        .and_then(|first_of_next| first_of_next.pred_opt())
        .map(|last| last.day())
        .unwrap_or(31)
}

/// Next due date strictly after `current`.
///
/// With a fixed `day_of_month` the day is clamped into the target month, so
/// the 31st becomes the last day of February. Without one, a day that does not
/// exist in the target month spills over into the following month (Jan 31 plus
/// one month is Mar 3, or Mar 2 in a leap year).
pub fn next_occurrence(
    current: NaiveDate,
    frequency: Frequency,
    day_of_month: Option<u32>,
) -> NaiveDate {
    let months = match frequency {
        Frequency::Weekly => {
            return current
                .checked_add_days(Days::new(7))
                .unwrap_or(NaiveDate::MAX);
        }
        Frequency::Monthly => 1,
        Frequency::Quarterly => 3,
        Frequency::Yearly => 12,
    };

    match day_of_month.filter(|day| *day > 0) {
        Some(day) => shift_months_clamped(current, months, day),
        None => shift_months_rollover(current, months),
    }
}

fn target_month(date: NaiveDate, months: u32) -> (i32, u32) {
    let total = i64::from(date.year()) * 12 + i64::from(date.month0()) + i64::from(months);
    let year = i32::try_from(total.div_euclid(12)).unwrap_or(i32::MAX);
    (year, total.rem_euclid(12) as u32 + 1)
}

fn shift_months_clamped(date: NaiveDate, months: u32, day_of_month: u32) -> NaiveDate {
    let (year, month) = target_month(date, months);
    let day = day_of_month.min(days_in_month(year, month));
    NaiveDate::from_ymd_opt(year, month, day).unwrap_or(NaiveDate::MAX)
}

fn shift_months_rollover(date: NaiveDate, months: u32) -> NaiveDate {
    let (year, month) = target_month(date, months);
    NaiveDate::from_ymd_opt(year, month, 1)
        .and_then(|first| first.checked_add_days(Days::new(u64::from(date.day() - 1))))
        .unwrap_or(NaiveDate::MAX)
}
