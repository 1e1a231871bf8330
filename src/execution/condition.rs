//! Conditions
//!
//! A condition is a tagged signal delivered to the action on top of a
//! thread's stack instead of executing it. Pending conditions are kept in
//! a set ordered by (priority, insertion order): lower priority values
//! are more urgent, and equal priorities are delivered first-come first.

use std::collections::BTreeMap;
use std::fmt;

use serde::Serialize;
use serde_json::Value;

/// Priority of an administrative job-wide hold. Outranks termination.
pub const HARD_HOLD_PRIORITY: u32 = 100;
/// Priority of a termination request.
pub const TERMINATE_PRIORITY: u32 = 200;
/// Priority of an ordinary hold (pause, breakpoint, command wait).
pub const HOLD_PRIORITY: u32 = 300;
/// Priority of a workflow exception.
pub const EXCEPTION_PRIORITY: u32 = 600;
/// Priority of a named control signal.
pub const SIGNAL_PRIORITY: u32 = 800;

/// Why a thread is held.
#[derive(Serialize, Debug, Clone, PartialEq)]
pub enum HoldReason {
    /// Paused by an administrator.
    Pause,
    /// Suspended at a breakpoint (`None` for a step request).
    Breakpoint(Option<u64>),
    /// Waiting for the remote command identified by this token.
    Command(u64),
}

/// What a condition means.
#[derive(Serialize, Debug, Clone, PartialEq)]
pub enum ConditionKind {
    HardHold,
    Hold(HoldReason),
    Terminate { code: i64 },
    Exception { name: String, data: Value },
    Signal(String),
}

/// A pending condition on a logical thread.
#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct Condition {
    pub kind: ConditionKind,
    /// Inheritable conditions still pending when a thread completes are
    /// handed to its parent.
    pub inheritable: bool,
}

impl Condition {
    pub fn hard_hold() -> Self {
        Self {
            kind: ConditionKind::HardHold,
            inheritable: false,
        }
    }

    pub fn hold(reason: HoldReason) -> Self {
        Self {
            kind: ConditionKind::Hold(reason),
            inheritable: false,
        }
    }

    pub fn terminate(code: i64) -> Self {
        Self {
            kind: ConditionKind::Terminate { code },
            inheritable: false,
        }
    }

    pub fn exception(name: impl Into<String>, data: Value) -> Self {
        Self {
            kind: ConditionKind::Exception {
                name: name.into(),
                data,
            },
            inheritable: true,
        }
    }

    pub fn signal(name: impl Into<String>) -> Self {
        Self {
            kind: ConditionKind::Signal(name.into()),
            inheritable: false,
        }
    }

    /// Overrides the default inheritability.
    pub fn inheritable(mut self, inheritable: bool) -> Self {
        self.inheritable = inheritable;
        self
    }

    pub fn priority(&self) -> u32 {
        match self.kind {
            ConditionKind::HardHold => HARD_HOLD_PRIORITY,
            ConditionKind::Terminate { .. } => TERMINATE_PRIORITY,
            ConditionKind::Hold(_) => HOLD_PRIORITY,
            ConditionKind::Exception { .. } => EXCEPTION_PRIORITY,
            ConditionKind::Signal(_) => SIGNAL_PRIORITY,
        }
    }

    /// Hold-class conditions freeze the thread instead of being delivered.
    pub fn is_hold(&self) -> bool {
        matches!(self.kind, ConditionKind::HardHold | ConditionKind::Hold(_))
    }
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            ConditionKind::HardHold => write!(f, "HardHold"),
            ConditionKind::Hold(reason) => write!(f, "Hold({:?})", reason),
            ConditionKind::Terminate { code } => write!(f, "Terminate({})", code),
            ConditionKind::Exception { name, .. } => write!(f, "Exception({})", name),
            ConditionKind::Signal(name) => write!(f, "Signal({})", name),
        }
    }
}

/// Priority-ordered set of pending conditions.
#[derive(Debug, Default)]
pub struct ConditionSet {
    entries: BTreeMap<(u32, u64), Condition>,
    next_seq: u64,
}

impl ConditionSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `condition`; returns false if an equal one is already pending.
    pub fn add(&mut self, condition: Condition) -> bool {
        if self.entries.values().any(|c| *c == condition) {
            return false;
        }
        let seq = self.next_seq;
        self.next_seq += 1;
        self.entries.insert((condition.priority(), seq), condition);
        true
    }

    /// The most urgent pending condition.
    pub fn first(&self) -> Option<&Condition> {
        self.entries.values().next()
    }

    pub fn contains<F>(&self, predicate: F) -> bool
    where
        F: Fn(&Condition) -> bool,
    {
        self.entries.values().any(predicate)
    }

    /// Removes every condition matching `predicate`; returns how many.
    pub fn remove_where<F>(&mut self, predicate: F) -> usize
    where
        F: Fn(&Condition) -> bool,
    {
        let before = self.entries.len();
        self.entries.retain(|_, c| !predicate(c));
        before - self.entries.len()
    }

    /// Removes and returns the inheritable conditions in delivery order.
    pub fn take_inheritable(&mut self) -> Vec<Condition> {
        let keys: Vec<_> = self
            .entries
            .iter()
            .filter(|(_, c)| c.inheritable)
            .map(|(k, _)| *k)
            .collect();
        keys.into_iter()
            .filter_map(|k| self.entries.remove(&k))
            .collect()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Pending conditions in delivery order.
    pub fn iter(&self) -> impl Iterator<Item = &Condition> {
        self.entries.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_delivery_order_by_priority() {
        let mut set = ConditionSet::new();
        set.add(Condition::signal("Later"));
        set.add(Condition::exception("Boom", json!(null)));
        set.add(Condition::terminate(1));
        set.add(Condition::hold(HoldReason::Pause));

        let order: Vec<u32> = set.iter().map(Condition::priority).collect();
        assert_eq!(
            order,
            vec![TERMINATE_PRIORITY, HOLD_PRIORITY, EXCEPTION_PRIORITY, SIGNAL_PRIORITY]
        );
        assert_eq!(set.first(), Some(&Condition::terminate(1)));
    }

    #[test]
    fn test_ties_break_on_insertion_order() {
        let mut set = ConditionSet::new();
        set.add(Condition::exception("First", json!(1)));
        set.add(Condition::exception("Second", json!(2)));

        match &set.first().unwrap().kind {
            ConditionKind::Exception { name, .. } => assert_eq!(name, "First"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_duplicate_add_is_ignored() {
        let mut set = ConditionSet::new();
        assert!(set.add(Condition::terminate(3)));
        assert!(!set.add(Condition::terminate(3)));
        assert!(set.add(Condition::terminate(4)));
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn test_hard_hold_outranks_terminate() {
        let mut set = ConditionSet::new();
        set.add(Condition::terminate(1));
        set.add(Condition::hard_hold());
        assert!(set.first().unwrap().is_hold());
    }

    #[test]
    fn test_take_inheritable() {
        let mut set = ConditionSet::new();
        set.add(Condition::exception("Boom", json!(null)));
        set.add(Condition::terminate(1));
        set.add(Condition::signal("Sticky").inheritable(true));

        let taken = set.take_inheritable();
        assert_eq!(taken.len(), 2);
        assert_eq!(set.len(), 1);
        assert_eq!(set.first(), Some(&Condition::terminate(1)));
    }

    #[test]
    fn test_remove_where() {
        let mut set = ConditionSet::new();
        set.add(Condition::hold(HoldReason::Pause));
        set.add(Condition::hold(HoldReason::Command(9)));
        let removed = set.remove_where(|c| c.kind == ConditionKind::Hold(HoldReason::Pause));
        assert_eq!(removed, 1);
        assert!(set.contains(|c| c.is_hold()));
    }

    #[test]
    fn test_display() {
        assert_eq!(Condition::terminate(2).to_string(), "Terminate(2)");
        assert_eq!(Condition::signal("X").to_string(), "Signal(X)");
    }
}
