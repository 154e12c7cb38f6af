use chrono::NaiveDate;
use heapless::Vec as BoundedVec;
use serde::{Deserialize, Serialize};

pub const HISTORY_CAPACITY: usize = 30;

/// One day of training load. `form` is always `ctl - atl` of the already
/// rounded values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FormRecord {
    pub date: NaiveDate,
    pub ctl: i32,
    pub atl: i32,
    pub form: i32,
}

impl FormRecord {
    pub fn from_loads(date: NaiveDate, ctl: f64, atl: f64) -> Self {
        let ctl = ctl.round() as i32;
        let atl = atl.round() as i32;
        Self {
            date,
            ctl,
            atl,
            form: ctl.saturating_sub(atl),
        }
    }
}

/// Last known good snapshot, oldest first.
#[derive(Debug, Clone, Default)]
pub struct FormHistory {
    records: BoundedVec<FormRecord, HISTORY_CAPACITY>,
}

impl FormHistory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Swaps in a new history, keeping the most recent `HISTORY_CAPACITY`
    /// records. Empty input keeps the current history and returns false.
    pub fn replace(&mut self, records: &[FormRecord]) -> bool {
        if records.is_empty() {
            return false;
        }

        let start = records.len().saturating_sub(HISTORY_CAPACITY);
        let mut next = BoundedVec::new();
        for record in &records[start..] {
            // Cannot overflow: the slice holds at most HISTORY_CAPACITY records.
            let _ = next.push(*record);
        }
        self.records = next;
        true
    }

    pub fn current(&self) -> Option<&FormRecord> {
        self.records.last()
    }

    pub fn records(&self) -> &[FormRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
