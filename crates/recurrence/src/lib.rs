use chrono::{Datelike, Days, Months, NaiveDate, Utc, Weekday};
use shared::domain::{NewTask, RecurrenceMeta, TaskRecord, TaskStatus};

/// Upper bound on range enumeration when the caller does not supply one.
pub const DEFAULT_MAX_OCCURRENCES: usize = 100;

/// Recurrence pattern, decided once at parse time and matched exhaustively
/// afterwards. Inputs that fit no supported shape land in `Unrecognized`;
/// every calculation treats that variant as a hard "no match".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pattern {
    Daily,
    Weekdays,
    Weekly,
    Monthly,
    OnWeekday(Weekday),
    EveryNDays(u32),
    Unrecognized,
}

/// Parses a natural-language recurrence descriptor. Matching is
/// case-insensitive and ignores surrounding whitespace. Supported shapes:
/// `daily`, `weekly`, `monthly`, `weekdays`, `every <weekday>`,
/// `every N days`.
pub fn parse(input: &str) -> Pattern {
    let normalized = input.trim().to_ascii_lowercase();
    match normalized.as_str() {
        "daily" => Pattern::Daily,
        "weekly" => Pattern::Weekly,
        "monthly" => Pattern::Monthly,
        "weekdays" => Pattern::Weekdays,
        other => match other.strip_prefix("every ") {
            Some(rest) => parse_every_clause(rest.trim()),
            None => Pattern::Unrecognized,
        },
    }
}

fn parse_every_clause(rest: &str) -> Pattern {
    if let Some(weekday) = parse_weekday(rest) {
        return Pattern::OnWeekday(weekday);
    }

    let Some(count) = rest.strip_suffix("days").or_else(|| rest.strip_suffix("day")) else {
        return Pattern::Unrecognized;
    };
    match count.trim().parse::<u32>() {
        Ok(n) if n >= 1 => Pattern::EveryNDays(n),
        _ => Pattern::Unrecognized,
    }
}

fn parse_weekday(name: &str) -> Option<Weekday> {
    match name {
        "monday" => Some(Weekday::Mon),
        "tuesday" => Some(Weekday::Tue),
        "wednesday" => Some(Weekday::Wed),
        "thursday" => Some(Weekday::Thu),
        "friday" => Some(Weekday::Fri),
        "saturday" => Some(Weekday::Sat),
        "sunday" => Some(Weekday::Sun),
        _ => None,
    }
}

/// Next date strictly after `from` satisfying `pattern`, or `None` for
/// `Unrecognized`. Weekday patterns always advance at least one day, so a
/// reference date that itself matches is skipped.
pub fn next_occurrence(pattern: &Pattern, from: NaiveDate) -> Option<NaiveDate> {
    match pattern {
        Pattern::Daily => from.checked_add_days(Days::new(1)),
        Pattern::Weekly => from.checked_add_days(Days::new(7)),
        // Calendar-month addition; chrono clamps to the last day of a
        // shorter target month (Jan 31 -> Feb 28/29).
        Pattern::Monthly => from.checked_add_months(Months::new(1)),
        Pattern::Weekdays => {
            let mut next = from.checked_add_days(Days::new(1))?;
            while matches!(next.weekday(), Weekday::Sat | Weekday::Sun) {
                next = next.checked_add_days(Days::new(1))?;
            }
            Some(next)
        }
        Pattern::OnWeekday(target) => {
            let gap = (target.num_days_from_monday() + 7 - from.weekday().num_days_from_monday()) % 7;
            let gap = if gap == 0 { 7 } else { gap };
            from.checked_add_days(Days::new(u64::from(gap)))
        }
        Pattern::EveryNDays(n) => from.checked_add_days(Days::new(u64::from(*n))),
        Pattern::Unrecognized => None,
    }
}

/// A pattern string is valid iff the next-occurrence calculation yields a
/// date from today's reference point.
pub fn is_valid(input: &str) -> bool {
    next_occurrence(&parse(input), Utc::now().date_naive()).is_some()
}

/// Finite iterator over occurrences strictly after `start` and at most
/// `end` (inclusive). `Clone` makes the sequence restartable from any
/// snapshot. Bounded by `max` to guard against pathological inputs.
#[derive(Debug, Clone)]
pub struct Occurrences {
    pattern: Pattern,
    cursor: NaiveDate,
    end: NaiveDate,
    remaining: usize,
}

pub fn occurrences_between(
    pattern: Pattern,
    start: NaiveDate,
    end: NaiveDate,
    max: Option<usize>,
) -> Occurrences {
    Occurrences {
        pattern,
        cursor: start,
        end,
        remaining: max.unwrap_or(DEFAULT_MAX_OCCURRENCES),
    }
}

impl Iterator for Occurrences {
    type Item = NaiveDate;

    fn next(&mut self) -> Option<NaiveDate> {
        if self.remaining == 0 {
            return None;
        }
        let next = next_occurrence(&self.pattern, self.cursor)?;
        if next > self.end {
            return None;
        }
        self.cursor = next;
        self.remaining -= 1;
        Some(next)
    }
}

/// Derives the follow-up task for a completed recurring task: status reset
/// to pending, due/scheduled dates moved to the next occurrence after
/// `completed_on`, recurrence metadata recording the source task and the
/// completion date. Returns `None` when the source carries no recurrence
/// metadata or its pattern is unrecognized.
pub fn regenerate(task: &TaskRecord, completed_on: NaiveDate) -> Option<NewTask> {
    let meta = task.recurrence.as_ref()?;
    let next = next_occurrence(&parse(&meta.pattern), completed_on)?;
    Some(NewTask {
        business_id: task.business_id,
        title: task.title.clone(),
        notes: task.notes.clone(),
        status: TaskStatus::Pending,
        due_date: Some(next),
        scheduled_date: Some(next),
        recurrence: Some(RecurrenceMeta {
            pattern: meta.pattern.clone(),
            source_task_id: Some(task.task_id),
            last_completed: Some(completed_on),
        }),
    })
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
