//! Slot conflict detection and the alternative-suggestion engine.
//!
//! # Conflict sets
//!
//! A candidate is checked against three independent sources: available
//! weekly templates on the same weekday, `available`/`booked` dated slots, and
//! explicit blocks matched by weekday or date. All three use the half-open
//! [`overlaps`](crate::time_range::overlaps) rule.
//!
//! # Suggestions
//!
//! Alternatives are searched in 15-minute steps away from the requested
//! start, up to `max_adjustment_minutes`, then scored:
//!
//! - base `100 - |adjustment|`
//! - `+20` when the whole slot sits inside 09:00-17:00
//! - `-15` when it starts before 08:00 or ends after 19:00
//! - `+5` for moving later
//!
//! The sort is stable, so equal scores keep generation order (smaller
//! adjustments first, earlier before later). Day shifts keep the requested
//! time and lose 25 points per day moved.

use chrono::{NaiveDate, NaiveTime, Weekday};
use serde::{Deserialize, Serialize};

use crate::slot::{BlockedSlot, CandidateSlot, ScheduleSlot, SlotTarget, TimeSlotTemplate};
use crate::time_range::TimeRange;
use crate::types::{ValidationError, define_str_enum};

/// Step between suggested start times.
pub const ADJUSTMENT_STEP_MINUTES: i64 = 15;

/// Default search radius for suggestions.
pub const DEFAULT_MAX_ADJUSTMENT_MINUTES: i64 = 60;

/// Upper bound accepted for the search radius.
pub const MAX_ADJUSTMENT_LIMIT_MINUTES: i64 = 240;

/// Number of time-shift suggestions returned.
pub const MAX_TIME_SUGGESTIONS: usize = 5;

/// Day offsets tried for same-time suggestions, nearest first.
const DAY_OFFSETS: [i64; 6] = [-1, 1, -2, 2, -3, 3];

/// Number of day-shift suggestions returned.
pub const MAX_DAY_SUGGESTIONS: usize = 3;

/// Default look-ahead when checking weekly candidates against dated slots.
pub const DEFAULT_LOOKAHEAD_WEEKS: i64 = 4;

const fn hm(hour: u32, minute: u32) -> NaiveTime {
    match NaiveTime::from_hms_opt(hour, minute, 0) {
        Some(t) => t,
        None => panic!("valid constant"),
    }
}

const EARLIEST_START: NaiveTime = hm(6, 0);
const LATEST_END: NaiveTime = hm(22, 0);
const PRIME_START: NaiveTime = hm(9, 0);
const PRIME_END: NaiveTime = hm(17, 0);
const EARLY_CUTOFF: NaiveTime = hm(8, 0);
const LATE_CUTOFF: NaiveTime = hm(19, 0);

/// Everything a candidate collides with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SlotConflicts {
    pub candidate: CandidateSlot,
    pub templates: Vec<TimeSlotTemplate>,
    pub slots: Vec<ScheduleSlot>,
    pub blocks: Vec<BlockedSlot>,
}

impl SlotConflicts {
    pub fn is_empty(&self) -> bool {
        self.templates.is_empty() && self.slots.is_empty() && self.blocks.is_empty()
    }

    pub fn len(&self) -> usize {
        self.templates.len() + self.slots.len() + self.blocks.len()
    }
}

/// Inclusive date window used for weekly candidates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateWindow {
    pub from: NaiveDate,
    pub to: NaiveDate,
}

impl DateWindow {
    /// `from` plus the default look-ahead.
    pub fn lookahead(from: NaiveDate) -> Self {
        Self {
            from,
            to: from + chrono::Duration::weeks(DEFAULT_LOOKAHEAD_WEEKS),
        }
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        (self.from..=self.to).contains(&date)
    }
}

/// The date range whose dated slots can collide with `candidate`.
pub fn window_for(candidate: &CandidateSlot, window: DateWindow) -> DateWindow {
    match candidate.target {
        SlotTarget::Date(date) => DateWindow { from: date, to: date },
        SlotTarget::Weekly(_) => window,
    }
}

/// Filters the teacher's rows down to the ones colliding with `candidate`.
///
/// Dated slots are considered only when they fall inside `window` (the
/// candidate's own date for dated candidates).
pub fn collect_conflicts(
    candidate: &CandidateSlot,
    window: DateWindow,
    templates: &[TimeSlotTemplate],
    slots: &[ScheduleSlot],
    blocks: &[BlockedSlot],
) -> SlotConflicts {
    let weekday = candidate.target.weekday();
    let window = window_for(candidate, window);

    let templates = templates
        .iter()
        .filter(|t| t.is_available && t.day_of_week == weekday && t.time.overlaps(&candidate.time))
        .cloned()
        .collect();

    let slots = slots
        .iter()
        .filter(|s| s.blocks_time() && s.time.overlaps(&candidate.time))
        .filter(|s| match candidate.target {
            SlotTarget::Date(date) => s.date == date,
            SlotTarget::Weekly(day) => s.weekday() == day && window.contains(s.date),
        })
        .cloned()
        .collect();

    let blocks = blocks
        .iter()
        .filter(|b| b.time.overlaps(&candidate.time))
        .filter(|b| match candidate.target {
            SlotTarget::Date(date) => b.applies_on(date),
            SlotTarget::Weekly(day) => b.day_of_week == Some(day),
        })
        .cloned()
        .collect();

    SlotConflicts {
        candidate: *candidate,
        templates,
        slots,
        blocks,
    }
}

define_str_enum!(
    /// Which way alternatives may move.
    Direction, "direction" {
        Earlier => "earlier",
        Later => "later",
        Any => "any",
    }
);

define_str_enum!(
    /// How to resolve a conflicting candidate.
    Strategy, "strategy" {
        SuggestAlternatives => "suggest_alternatives",
        AutoAdjust => "auto_adjust",
        ForceOverride => "force_override",
    }
);

/// Caller preferences for the suggestion search.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Preferences {
    pub direction: Direction,
    pub max_adjustment_minutes: i64,
    pub allow_day_change: bool,
}

impl Default for Preferences {
    fn default() -> Self {
        Self {
            direction: Direction::Any,
            max_adjustment_minutes: DEFAULT_MAX_ADJUSTMENT_MINUTES,
            allow_day_change: false,
        }
    }
}

impl Preferences {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if !(0..=MAX_ADJUSTMENT_LIMIT_MINUTES).contains(&self.max_adjustment_minutes) {
            return Err(ValidationError::OutOfRange {
                field: "max adjustment minutes",
                message: format!(
                    "expected 0..={MAX_ADJUSTMENT_LIMIT_MINUTES}, got {}",
                    self.max_adjustment_minutes
                ),
            });
        }
        Ok(())
    }
}

/// How a suggestion differs from the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SuggestionKind {
    TimeShift,
    DayShift,
}

/// A conflict-free alternative.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Suggestion {
    pub kind: SuggestionKind,
    pub target: SlotTarget,
    #[serde(flatten)]
    pub time: TimeRange,
    /// Signed minutes relative to the requested start.
    pub adjustment_minutes: i64,
    /// Signed days relative to the requested target.
    pub day_offset: i64,
    pub score: i64,
}

impl Suggestion {
    pub fn to_candidate(&self) -> CandidateSlot {
        CandidateSlot {
            target: self.target,
            time: self.time,
        }
    }
}

/// Whether a range fits inside the bookable part of the day.
pub fn within_bookable_hours(range: &TimeRange) -> bool {
    range.start >= EARLIEST_START && range.end < LATEST_END
}

/// Score for a time-shifted alternative.
pub fn score(range: &TimeRange, adjustment_minutes: i64) -> i64 {
    let mut score = 100 - adjustment_minutes.abs();
    if range.start >= PRIME_START && range.end <= PRIME_END {
        score += 20;
    }
    if range.start < EARLY_CUTOFF || range.end > LATE_CUTOFF {
        score -= 15;
    }
    if adjustment_minutes > 0 {
        score += 5;
    }
    score
}

fn is_free(range: &TimeRange, busy: &[TimeRange]) -> bool {
    busy.iter().all(|b| !b.overlaps(range))
}

/// Searches for conflict-free alternatives to `candidate`.
///
/// `busy` returns the occupied ranges for a target; it is called once for the
/// candidate's own target and once per day offset when day changes are
/// allowed. Time shifts come first (best [`MAX_TIME_SUGGESTIONS`] by score),
/// followed by up to [`MAX_DAY_SUGGESTIONS`] same-time day shifts.
pub fn suggest_alternatives<F>(
    candidate: &CandidateSlot,
    preferences: &Preferences,
    mut busy: F,
) -> Result<Vec<Suggestion>, ValidationError>
where
    F: FnMut(&SlotTarget) -> Vec<TimeRange>,
{
    preferences.validate()?;
    let own_busy = busy(&candidate.target);

    let mut shifts = Vec::new();
    let steps = preferences.max_adjustment_minutes / ADJUSTMENT_STEP_MINUTES;
    for step in 1..=steps {
        let magnitude = step * ADJUSTMENT_STEP_MINUTES;
        let signed: &[i64] = match preferences.direction {
            Direction::Earlier => &[-1],
            Direction::Later => &[1],
            Direction::Any => &[-1, 1],
        };
        for sign in signed {
            let adjustment = sign * magnitude;
            let Some(range) = candidate.time.shifted(adjustment) else {
                continue;
            };
            if !within_bookable_hours(&range) || !is_free(&range, &own_busy) {
                continue;
            }
            shifts.push(Suggestion {
                kind: SuggestionKind::TimeShift,
                target: candidate.target,
                time: range,
                adjustment_minutes: adjustment,
                day_offset: 0,
                score: score(&range, adjustment),
            });
        }
    }
    shifts.sort_by_key(|s| std::cmp::Reverse(s.score));
    shifts.truncate(MAX_TIME_SUGGESTIONS);

    if preferences.allow_day_change && within_bookable_hours(&candidate.time) {
        let mut day_shifts = Vec::new();
        for offset in DAY_OFFSETS {
            if day_shifts.len() == MAX_DAY_SUGGESTIONS {
                break;
            }
            let target = candidate.target.shifted_days(offset);
            if is_free(&candidate.time, &busy(&target)) {
                day_shifts.push(Suggestion {
                    kind: SuggestionKind::DayShift,
                    target,
                    time: candidate.time,
                    adjustment_minutes: 0,
                    day_offset: offset,
                    score: score(&candidate.time, 0) - 25 * offset.abs(),
                });
            }
        }
        shifts.extend(day_shifts);
    }

    Ok(shifts)
}

/// The alternative `auto_adjust` commits to: the best time shift, else the
/// nearest day shift.
pub fn best_alternative(suggestions: &[Suggestion]) -> Option<Suggestion> {
    suggestions
        .iter()
        .find(|s| s.kind == SuggestionKind::TimeShift)
        .or_else(|| suggestions.first())
        .copied()
}

/// Busy ranges on `target` from the teacher's rows.
pub fn busy_ranges(
    target: &SlotTarget,
    templates: &[TimeSlotTemplate],
    slots: &[ScheduleSlot],
    blocks: &[BlockedSlot],
) -> Vec<TimeRange> {
    let weekday: Weekday = target.weekday();
    let mut ranges: Vec<TimeRange> = templates
        .iter()
        .filter(|t| t.is_available && t.day_of_week == weekday)
        .map(|t| t.time)
        .collect();
    ranges.extend(
        slots
            .iter()
            .filter(|s| s.blocks_time())
            .filter(|s| match target {
                SlotTarget::Date(date) => s.date == *date,
                SlotTarget::Weekly(day) => s.weekday() == *day,
            })
            .map(|s| s.time),
    );
    ranges.extend(
        blocks
            .iter()
            .filter(|b| match target {
                SlotTarget::Date(date) => b.applies_on(*date),
                SlotTarget::Weekly(day) => b.day_of_week == Some(*day),
            })
            .map(|b| b.time),
    );
    ranges
}
