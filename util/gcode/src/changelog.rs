use serde::{Deserialize, Serialize};

use crate::state::ModalState;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChangeLogEntry<T> {
    pub change: T,
    /// Lines during which `change` stayed in force, the changing line included.
    pub count: usize,
}

/// Run-length encoded history of one value, one step per interpreted line.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChangeLog<T>(Vec<ChangeLogEntry<T>>);

impl<T> Default for ChangeLog<T> {
    fn default() -> Self {
        ChangeLog(Vec::new())
    }
}

impl<T: Clone + PartialEq> ChangeLog<T> {
    pub fn new() -> Self {
        Self::default()
    }
    /// Records the value in force after one more line.
    pub fn record(&mut self, value: &T) {
        match self.0.last_mut() {
            Some(entry) if entry.change == *value => entry.count += 1,
            _ => self.0.push(ChangeLogEntry { change: value.clone(), count: 1 }),
        }
    }
    pub fn entries(&self) -> &[ChangeLogEntry<T>] {
        &self.0
    }
    pub fn total(&self) -> usize {
        self.0.iter().map(|entry| entry.count).sum()
    }
    /// One item per recorded line.
    pub fn values(&self) -> impl Iterator<Item = &T> + '_ {
        self.0.iter().flat_map(|entry| std::iter::repeat(&entry.change).take(entry.count))
    }
    pub fn value_at(&self, line: usize) -> Option<&T> {
        let mut remaining = line;
        for entry in &self.0 {
            if remaining < entry.count {
                return Some(&entry.change);
            }
            remaining -= entry.count;
        }
        None
    }
}

/// Both logs merged into one tagged sequence, ordered by the line each change starts on.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum LoggedChange {
    Modal { line: usize, value: ModalState, count: usize },
    Feedrate { line: usize, value: f64, count: usize },
}

pub fn tagged_changes(modal: &ChangeLog<ModalState>, feedrate: &ChangeLog<f64>) -> Vec<LoggedChange> {
    let mut changes = Vec::with_capacity(modal.entries().len() + feedrate.entries().len());
    let mut line = 0;
    for entry in modal.entries() {
        changes.push(LoggedChange::Modal { line, value: entry.change, count: entry.count });
        line += entry.count;
    }
    let mut line = 0;
    for entry in feedrate.entries() {
        changes.push(LoggedChange::Feedrate { line, value: entry.change, count: entry.count });
        line += entry.count;
    }
    changes.sort_by_key(|change| match change {
        LoggedChange::Modal { line, .. } => (*line, 0),
        LoggedChange::Feedrate { line, .. } => (*line, 1),
    });
    changes
}

#[cfg(test)]
mod test {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn test_run_lengths() {
        let mut log = ChangeLog::new();
        for value in [1, 1, 2, 2, 2, 1] {
            log.record(&value);
        }
        let counts: Vec<_> = log.entries().iter().map(|entry| (entry.change, entry.count)).collect();
        assert_eq!(counts, vec![(1, 2), (2, 3), (1, 1)]);
        assert_eq!(log.value_at(4), Some(&2));
        assert_eq!(log.value_at(5), Some(&1));
        assert_eq!(log.value_at(6), None);
    }

    #[test]
    fn test_tagged_changes_interleave() {
        let mut modal = ChangeLog::new();
        let mut feedrate = ChangeLog::new();
        let mut changed = ModalState::default();
        changed.wcs = 2;
        for (state, feed) in [(ModalState::default(), 0.0), (ModalState::default(), 100.0), (changed, 100.0)] {
            modal.record(&state);
            feedrate.record(&feed);
        }
        let lines: Vec<_> = tagged_changes(&modal, &feedrate).iter().map(|change| match change {
            LoggedChange::Modal { line, .. } => ('m', *line),
            LoggedChange::Feedrate { line, .. } => ('f', *line),
        }).collect();
        assert_eq!(lines, vec![('m', 0), ('f', 0), ('f', 1), ('m', 2)]);
    }

    proptest! {
        #[test]
        fn counts_sum_to_recorded_lines(values in proptest::collection::vec(0u8..4, 0..200)) {
            let mut log = ChangeLog::new();
            for value in &values {
                log.record(value);
            }
            prop_assert_eq!(log.total(), values.len());
            prop_assert_eq!(log.values().copied().collect::<Vec<_>>(), values);
            prop_assert!(log.entries().windows(2).all(|pair| pair[0].change != pair[1].change));
        }
    }
}
