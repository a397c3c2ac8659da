//! Splits OCR text into per-date blocks.
//!
//! This is a heuristic: text before the first date is dropped when several
//! dates are present, and multi-column layouts or out-of-order dates will
//! mis-segment. Only dates that carry a year are recognized.

use crate::error::IngestError;
use chrono::NaiveDate;
use regex::{Captures, Regex};

const MONTH: &str = r"(?P<month>jan(?:uary)?|feb(?:ruary)?|mar(?:ch)?|apr(?:il)?|may|june?|july?|aug(?:ust)?|sep(?:t(?:ember)?)?|oct(?:ober)?|nov(?:ember)?|dec(?:ember)?)";
const WEEKDAY: &str = r"(?:(?:mon|tues|wednes|thurs|fri|satur|sun)day,?\s+)?";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DateBlock {
    pub date: Option<NaiveDate>,
    pub text: String,
}

/// A date expression found in text, with byte offsets into the original string.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DateMatch {
    pub date: NaiveDate,
    pub start: usize,
    pub end: usize,
}

pub struct DateSegmenter {
    month_first: Regex,
    day_first: Regex,
    iso: Regex,
    numeric: Regex,
}

impl DateSegmenter {
    pub fn new() -> Result<Self, IngestError> {
        Ok(Self {
            month_first: Regex::new(&format!(
                r"(?i)\b{WEEKDAY}{MONTH}\.?\s+(?P<day>\d{{1,2}})(?:st|nd|rd|th)?,?\s+(?P<year>\d{{4}})\b"
            ))?,
            day_first: Regex::new(&format!(
                r"(?i)\b{WEEKDAY}(?P<day>\d{{1,2}})(?:st|nd|rd|th)?\s+(?:of\s+)?{MONTH}\.?,?\s+(?P<year>\d{{4}})\b"
            ))?,
            iso: Regex::new(r"\b(?P<year>\d{4})-(?P<month>\d{1,2})-(?P<day>\d{1,2})\b")?,
            numeric: Regex::new(r"\b(?P<month>\d{1,2})/(?P<day>\d{1,2})/(?P<year>\d{4})\b")?,
        })
    }

    /// All recognizable dates ordered by offset. Overlapping expressions keep the earliest, longest one.
    pub fn find_dates(&self, text: &str) -> Vec<DateMatch> {
        let mut found = Vec::new();
        collect(&self.month_first, text, &mut found, named_month);
        collect(&self.day_first, text, &mut found, named_month);
        collect(&self.iso, text, &mut found, numeric_month);
        collect(&self.numeric, text, &mut found, numeric_month);

        found.sort_by(|left, right| {
            left.start
                .cmp(&right.start)
                .then_with(|| right.end.cmp(&left.end))
        });

        let mut accepted: Vec<DateMatch> = Vec::with_capacity(found.len());
        for candidate in found {
            let overlaps = accepted
                .last()
                .is_some_and(|previous| candidate.start < previous.end);
            if !overlaps {
                accepted.push(candidate);
            }
        }

        accepted
    }

    pub fn segment(&self, text: &str) -> Vec<DateBlock> {
        let dates = self.find_dates(text);

        if dates.len() <= 1 {
            return vec![DateBlock {
                date: dates.first().map(|found| found.date),
                text: text.trim().to_string(),
            }];
        }

        let blocks = dates
            .iter()
            .enumerate()
            .filter_map(|(position, found)| {
                let end = dates
                    .get(position + 1)
                    .map(|next| next.start)
                    .unwrap_or(text.len());
                let block = text[found.start..end].trim();
                if block.is_empty() {
                    None
                } else {
                    Some(DateBlock {
                        date: Some(found.date),
                        text: block.to_string(),
                    })
                }
            })
            .collect::<Vec<_>>();

        if blocks.is_empty() {
            return vec![DateBlock {
                date: None,
                text: text.to_string(),
            }];
        }

        blocks
    }
}

fn collect(
    pattern: &Regex,
    text: &str,
    found: &mut Vec<DateMatch>,
    month_of: fn(&str) -> Option<u32>,
) {
    for captures in pattern.captures_iter(text) {
        let Some(whole) = captures.get(0) else {
            continue;
        };
        if let Some(date) = parse_date(&captures, month_of) {
            found.push(DateMatch {
                date,
                start: whole.start(),
                end: whole.end(),
            });
        }
    }
}

fn parse_date(captures: &Captures<'_>, month_of: fn(&str) -> Option<u32>) -> Option<NaiveDate> {
    let year = captures.name("year")?.as_str().parse::<i32>().ok()?;
    let month = month_of(captures.name("month")?.as_str())?;
    let day = captures.name("day")?.as_str().parse::<u32>().ok()?;
    NaiveDate::from_ymd_opt(year, month, day)
}

fn named_month(name: &str) -> Option<u32> {
    let prefix = name.get(..3)?.to_ascii_lowercase();
    let month = match prefix.as_str() {
        "jan" => 1,
        "feb" => 2,
        "mar" => 3,
        "apr" => 4,
        "may" => 5,
        "jun" => 6,
        "jul" => 7,
        "aug" => 8,
        "sep" => 9,
        "oct" => 10,
        "nov" => 11,
        "dec" => 12,
        _ => return None,
    };
    Some(month)
}

fn numeric_month(value: &str) -> Option<u32> {
    value.parse::<u32>().ok().filter(|month| (1..=12).contains(month))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn segmenter() -> DateSegmenter {
        DateSegmenter::new().expect("date patterns should compile")
    }

    fn ymd(year: i32, month: u32, day: u32) -> Option<NaiveDate> {
        NaiveDate::from_ymd_opt(year, month, day)
    }

    #[test]
    fn two_dates_produce_two_blocks() {
        let text = "June 12, 2025\nFinished the draft.\n\nJune 13, 2025\nRead in the park.\nFelt calm.";
        let blocks = segmenter().segment(text);

        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[0].date, ymd(2025, 6, 12));
        assert_eq!(blocks[0].text, "June 12, 2025\nFinished the draft.");
        assert_eq!(blocks[1].date, ymd(2025, 6, 13));
        assert!(blocks[1].text.starts_with("June 13, 2025"));
        assert!(blocks[1].text.ends_with("Felt calm."));
    }

    #[test]
    fn text_without_dates_is_one_undated_block() {
        let blocks = segmenter().segment("Just some thoughts about nothing in particular.");
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].date, None);
        assert_eq!(blocks[0].text, "Just some thoughts about nothing in particular.");
    }

    #[test]
    fn single_date_keeps_whole_text() {
        let text = "Notes first.\nMarch 20, 2024\nA long day.";
        let blocks = segmenter().segment(text);
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].date, ymd(2024, 3, 20));
        assert_eq!(blocks[0].text, text);
    }

    #[test]
    fn recognizes_common_english_formats() {
        let dates = segmenter().find_dates(
            "Monday, Jan 6th 2025 / 7 February 2025 / 2025-03-08 / 04/09/2025 / Sept. 10, 2025",
        );
        let parsed = dates.iter().map(|found| Some(found.date)).collect::<Vec<_>>();

        assert_eq!(
            parsed,
            vec![
                ymd(2025, 1, 6),
                ymd(2025, 2, 7),
                ymd(2025, 3, 8),
                ymd(2025, 4, 9),
                ymd(2025, 9, 10),
            ]
        );
        assert_eq!(dates[0].start, 0);
    }

    #[test]
    fn impossible_dates_are_ignored() {
        assert!(segmenter().find_dates("February 30, 2025 and 13/01/2025").is_empty());
    }

    #[test]
    fn repeated_date_does_not_create_empty_blocks() {
        let blocks = segmenter().segment("June 12, 2025 June 12, 2025\n\nJune 14, 2025 rain");
        assert!(blocks.iter().all(|block| !block.text.is_empty()));
        assert_eq!(blocks.len(), 3);
        assert_eq!(blocks[2].text, "June 14, 2025 rain");
    }

    #[test]
    fn preamble_before_first_date_is_dropped() {
        let blocks = segmenter().segment("Page 4\nJune 12, 2025 one\nJune 13, 2025 two");
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[0].text, "June 12, 2025 one");
    }
}
