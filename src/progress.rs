//! Progress extraction from job output.
//!
//! Jobs report progress on stdout with two markers:
//!
//! ```text
//! PROGRESS: [7/10] 70% - Processing: Artist - Album
//! PROGRESS_SUB: Fetching track listing
//! ```
//!
//! Older jobs emit `[7/10] Processing: Artist`, which is used only when no
//! `PROGRESS:` line is present in the scanned window.

use serde::Serialize;

const PRIMARY_PREFIX: &str = "PROGRESS: [";
const SUB_PREFIX: &str = "PROGRESS_SUB: ";
const ITEM_SEPARATOR: &str = " - Processing: ";
const LEGACY_MARKER: &str = "] Processing:";
const LEGACY_ITEM: &str = "Processing...";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Progress {
    pub current: u64,
    pub total: u64,
    pub percentage: u64,
    pub current_item: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SubProgress {
    pub message: String,
}

/// Result of scanning a window of output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProgressReport {
    #[serde(flatten)]
    pub main: Option<Progress>,
    #[serde(rename = "sub_progress", skip_serializing_if = "Option::is_none")]
    pub sub: Option<SubProgress>,
}

/// Scan `lines`, newest first, for progress markers.
///
/// The newest `PROGRESS:` line wins; the legacy form is consulted only when
/// the window has none. The newest `PROGRESS_SUB:` line rides along. Returns
/// `None` when nothing in the window matches.
pub fn parse<I, S>(lines: I) -> Option<ProgressReport>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut primary = None;
    let mut legacy = None;
    let mut sub = None;

    for line in lines {
        let line = strip_timestamp(line.as_ref());

        if primary.is_none() {
            if let Some(p) = parse_primary(line) {
                primary = Some(p);
                continue;
            }
        }
        if sub.is_none() {
            if let Some(s) = parse_sub(line) {
                sub = Some(s);
                continue;
            }
        }
        if legacy.is_none() {
            legacy = parse_legacy(line);
        }
        if primary.is_some() && sub.is_some() {
            break;
        }
    }

    let main = primary.or(legacy);
    if main.is_none() && sub.is_none() {
        return None;
    }
    Some(ProgressReport { main, sub })
}

/// Drop a leading `[HH:MM:SS] ` stamp added by the output buffer.
fn strip_timestamp(line: &str) -> &str {
    let Some(rest) = line.strip_prefix('[') else {
        return line;
    };
    let Some((stamp, tail)) = rest.split_once("] ") else {
        return line;
    };
    let is_clock = stamp.len() == 8
        && stamp.bytes().enumerate().all(|(i, b)| match i {
            2 | 5 => b == b':',
            _ => b.is_ascii_digit(),
        });
    if is_clock {
        tail
    } else {
        line
    }
}

/// `<cur>/<tot>` inside the first brackets.
fn fraction(s: &str) -> Option<(u64, u64)> {
    let (current, total) = s.split_once('/')?;
    Some((current.trim().parse().ok()?, total.trim().parse().ok()?))
}

fn parse_primary(line: &str) -> Option<Progress> {
    let rest = line.strip_prefix(PRIMARY_PREFIX)?;
    let (bracket, rest) = rest.split_once("] ")?;
    let (current, total) = fraction(bracket)?;
    let (pct, rest) = rest.split_once('%')?;
    let percentage = pct.trim().parse().ok()?;
    let (_, item) = rest.split_once(ITEM_SEPARATOR)?;

    Some(Progress {
        current,
        total,
        percentage,
        current_item: item.trim().to_string(),
    })
}

fn parse_sub(line: &str) -> Option<SubProgress> {
    let message = line.strip_prefix(SUB_PREFIX)?;
    Some(SubProgress {
        message: message.trim().to_string(),
    })
}

fn parse_legacy(line: &str) -> Option<Progress> {
    if !line.contains(LEGACY_MARKER) {
        return None;
    }
    let (_, rest) = line.split_once('[')?;
    let (bracket, _) = rest.split_once(']')?;
    let (current, total) = fraction(bracket)?;
    if total == 0 {
        return None;
    }
    let percentage = current.checked_mul(100)? / total;
    Some(Progress {
        current,
        total,
        percentage,
        current_item: LEGACY_ITEM.to_string(),
    })
}
