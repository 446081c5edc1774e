//! Breakpoint and watch tables owned by the in-process debug runtime.
//!
//! Conditions are compiled once, at registration, with the same expression
//! compiler the debuggee language uses; evaluation happens at hit time in
//! the halted frame, through a verdict closure supplied by the runtime.

use std::collections::{BTreeMap, HashMap};

use script::{compile_expr, CompiledExpr, SyntaxError};

/// Result of checking a traced location against the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Hit {
    /// Nothing here wants a halt.
    Miss,
    /// Halt. `cleared` is set when a temporary entry removed itself and the
    /// controller must be told exactly once.
    Halt { cleared: bool },
}

/// Outcome of evaluating a breakpoint condition in the halted frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConditionVerdict {
    True,
    False,
    /// The condition itself failed to evaluate.
    Error,
}

#[derive(Debug)]
pub struct Breakpoint {
    pub filename: String,
    pub line: u32,
    pub temporary: bool,
    pub condition: Option<CompiledExpr>,
    pub enabled: bool,
    pub ignore_count: u32,
}

/// `None`, the empty string and the literal `"None"` all mean
/// "unconditional".
pub fn normalize_condition(raw: Option<&str>) -> Option<&str> {
    match raw {
        None => None,
        Some(text) => {
            let text = text.trim();
            if text.is_empty() || text == "None" {
                None
            } else {
                Some(text)
            }
        }
    }
}

/// Process-wide breakpoint table, keyed by `(filename, line)`.
#[derive(Debug, Default)]
pub struct BreakpointTable {
    by_file: HashMap<String, BTreeMap<u32, Breakpoint>>,
}

impl BreakpointTable {
    /// Insert or replace the breakpoint at `(filename, line)`.
    ///
    /// A condition that fails to compile leaves the table untouched; the
    /// caller reports the failure to the controller.
    pub fn set(
        &mut self,
        filename: &str,
        line: u32,
        temporary: bool,
        condition: Option<&str>,
    ) -> Result<(), SyntaxError> {
        let condition = match normalize_condition(condition) {
            Some(source) => Some(compile_expr(source)?),
            None => None,
        };
        self.by_file.entry(filename.to_owned()).or_default().insert(
            line,
            Breakpoint {
                filename: filename.to_owned(),
                line,
                temporary,
                condition,
                enabled: true,
                ignore_count: 0,
            },
        );
        Ok(())
    }

    pub fn clear(&mut self, filename: &str, line: u32) -> bool {
        let Some(lines) = self.by_file.get_mut(filename) else {
            return false;
        };
        let removed = lines.remove(&line).is_some();
        if lines.is_empty() {
            self.by_file.remove(filename);
        }
        removed
    }

    pub fn clear_all(&mut self) {
        self.by_file.clear();
    }

    pub fn get(&self, filename: &str, line: u32) -> Option<&Breakpoint> {
        self.by_file.get(filename)?.get(&line)
    }

    pub fn enable(&mut self, filename: &str, line: u32, enable: bool) -> bool {
        match self.entry(filename, line) {
            Some(bp) => {
                bp.enabled = enable;
                true
            }
            None => false,
        }
    }

    pub fn set_ignore(&mut self, filename: &str, line: u32, count: u32) -> bool {
        match self.entry(filename, line) {
            Some(bp) => {
                bp.ignore_count = count;
                true
            }
            None => false,
        }
    }

    fn entry(&mut self, filename: &str, line: u32) -> Option<&mut Breakpoint> {
        self.by_file.get_mut(filename)?.get_mut(&line)
    }

    pub fn is_empty(&self) -> bool {
        self.by_file.is_empty()
    }

    /// Cheap pre-check for the per-line trace path.
    pub fn any_in_file(&self, filename: &str) -> bool {
        self.by_file.contains_key(filename)
    }

    /// Check a traced location, applying condition, ignore count and
    /// temporary removal.
    ///
    /// `eval` runs the compiled condition in the halted frame. A condition
    /// that errors halts rather than silently running on, and does not
    /// consume the ignore count.
    pub fn check(
        &mut self,
        filename: &str,
        line: u32,
        eval: impl FnOnce(&CompiledExpr) -> ConditionVerdict,
    ) -> Hit {
        let Some(lines) = self.by_file.get_mut(filename) else {
            return Hit::Miss;
        };
        let Some(bp) = lines.get_mut(&line) else {
            return Hit::Miss;
        };
        if !bp.enabled {
            return Hit::Miss;
        }
        let mut condition_error = false;
        if let Some(expr) = &bp.condition {
            match eval(expr) {
                ConditionVerdict::True => {}
                ConditionVerdict::False => return Hit::Miss,
                ConditionVerdict::Error => condition_error = true,
            }
        }
        if !condition_error && bp.ignore_count > 0 {
            bp.ignore_count -= 1;
            return Hit::Miss;
        }
        let cleared = bp.temporary;
        if cleared {
            lines.remove(&line);
            if lines.is_empty() {
                self.by_file.remove(filename);
            }
        }
        Hit::Halt { cleared }
    }
}

/// Trigger mode of a watch expression.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchFlag {
    /// Halt whenever the expression is truthy.
    Plain,
    /// Halt when the expression becomes evaluable.
    Created,
    /// Halt when the expression's value changes.
    Changed,
}

/// Split a raw watch spec into the expression text and its trigger flag.
pub fn parse_watch_spec(raw: &str) -> (&str, WatchFlag) {
    if let Some(expr) = raw.strip_suffix("??created??") {
        (expr.trim(), WatchFlag::Created)
    } else if let Some(expr) = raw.strip_suffix("??changed??") {
        (expr.trim(), WatchFlag::Changed)
    } else {
        (raw.trim(), WatchFlag::Plain)
    }
}

/// What the runtime observed when evaluating a watch expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchObservation {
    Value { truthy: bool, rendered: String },
    /// The expression could not be evaluated (e.g. a name not yet bound).
    Unevaluable,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum WatchState {
    Missing,
    Value(String),
}

#[derive(Debug)]
pub struct Watch {
    /// Full original spec, including any trigger suffix. Identity key.
    pub raw: String,
    pub expression: String,
    pub flag: WatchFlag,
    pub condition: CompiledExpr,
    pub temporary: bool,
    pub enabled: bool,
    pub ignore_count: u32,
    /// Last observed state; `None` until the first evaluation establishes
    /// the baseline for created/changed detection.
    last: Option<WatchState>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchHit {
    pub raw: String,
    /// A temporary watch removed itself on this hit.
    pub cleared: bool,
}

/// Watch expressions, keyed by their raw spec text.
#[derive(Debug, Default)]
pub struct WatchTable {
    watches: BTreeMap<String, Watch>,
}

impl WatchTable {
    pub fn set(&mut self, raw: &str, temporary: bool) -> Result<(), SyntaxError> {
        let (expression, flag) = parse_watch_spec(raw);
        let condition = compile_expr(expression)?;
        self.watches.insert(
            raw.to_owned(),
            Watch {
                raw: raw.to_owned(),
                expression: expression.to_owned(),
                flag,
                condition,
                temporary,
                enabled: true,
                ignore_count: 0,
                last: None,
            },
        );
        Ok(())
    }

    pub fn clear(&mut self, raw: &str) -> bool {
        self.watches.remove(raw).is_some()
    }

    pub fn clear_all(&mut self) {
        self.watches.clear();
    }

    pub fn get(&self, raw: &str) -> Option<&Watch> {
        self.watches.get(raw)
    }

    pub fn enable(&mut self, raw: &str, enable: bool) -> bool {
        match self.watches.get_mut(raw) {
            Some(watch) => {
                watch.enabled = enable;
                true
            }
            None => false,
        }
    }

    pub fn set_ignore(&mut self, raw: &str, count: u32) -> bool {
        match self.watches.get_mut(raw) {
            Some(watch) => {
                watch.ignore_count = count;
                true
            }
            None => false,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.watches.is_empty()
    }

    /// Evaluate every armed watch against the halted frame; the first
    /// trigger wins. Baselines update even for watches that do not trigger.
    pub fn check(
        &mut self,
        mut eval: impl FnMut(&CompiledExpr) -> WatchObservation,
    ) -> Option<WatchHit> {
        let mut hit: Option<(String, bool)> = None;
        for (raw, watch) in self.watches.iter_mut() {
            if !watch.enabled {
                continue;
            }
            let observed = eval(&watch.condition);
            let state = match &observed {
                WatchObservation::Unevaluable => WatchState::Missing,
                WatchObservation::Value { rendered, .. } => WatchState::Value(rendered.clone()),
            };
            let baseline = watch.last.replace(state.clone());
            let triggered = match watch.flag {
                WatchFlag::Plain => {
                    matches!(observed, WatchObservation::Value { truthy: true, .. })
                }
                WatchFlag::Created => {
                    baseline == Some(WatchState::Missing)
                        && matches!(state, WatchState::Value(_))
                }
                WatchFlag::Changed => match baseline {
                    Some(previous) => previous != state,
                    None => false,
                },
            };
            if !triggered {
                continue;
            }
            if watch.ignore_count > 0 {
                watch.ignore_count -= 1;
                continue;
            }
            hit = Some((raw.clone(), watch.temporary));
            break;
        }
        let (raw, temporary) = hit?;
        if temporary {
            self.watches.remove(&raw);
        }
        Some(WatchHit {
            raw,
            cleared: temporary,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FILE: &str = "example.scr";

    fn always_true(_: &CompiledExpr) -> ConditionVerdict {
        ConditionVerdict::True
    }

    #[test]
    fn setting_twice_replaces_the_entry() {
        let mut table = BreakpointTable::default();
        table.set(FILE, 3, false, Some("x > 5")).expect("setting");
        table.set(FILE, 3, true, None).expect("setting again");

        let bp = table.get(FILE, 3).expect("breakpoint should exist");
        assert!(bp.temporary);
        assert!(bp.condition.is_none());
    }

    #[test]
    fn clearing_removes_the_entry() {
        let mut table = BreakpointTable::default();
        table.set(FILE, 3, false, None).expect("setting");
        assert!(table.clear(FILE, 3));
        assert!(table.get(FILE, 3).is_none());
        assert!(!table.clear(FILE, 3));
        assert!(table.is_empty());
    }

    #[test]
    fn condition_normalization() {
        for raw in [None, Some(""), Some("None"), Some("  ")] {
            let mut table = BreakpointTable::default();
            table.set(FILE, 1, false, raw).expect("setting");
            assert!(
                table.get(FILE, 1).expect("entry").condition.is_none(),
                "{raw:?} should mean unconditional"
            );
        }

        let mut table = BreakpointTable::default();
        table.set(FILE, 1, false, Some("x > 5")).expect("setting");
        assert!(table.get(FILE, 1).expect("entry").condition.is_some());
    }

    #[test]
    fn bad_condition_is_rejected_without_registering() {
        let mut table = BreakpointTable::default();
        assert!(table.set(FILE, 4, false, Some("x >")).is_err());
        assert!(table.get(FILE, 4).is_none());
    }

    #[test]
    fn ignore_count_absorbs_hits_then_halts() {
        let mut table = BreakpointTable::default();
        table.set(FILE, 2, false, None).expect("setting");
        assert!(table.set_ignore(FILE, 2, 2));

        assert_eq!(table.check(FILE, 2, always_true), Hit::Miss);
        assert_eq!(table.get(FILE, 2).expect("entry").ignore_count, 1);
        assert_eq!(table.check(FILE, 2, always_true), Hit::Miss);
        assert_eq!(table.get(FILE, 2).expect("entry").ignore_count, 0);
        assert_eq!(
            table.check(FILE, 2, always_true),
            Hit::Halt { cleared: false }
        );
    }

    #[test]
    fn temporary_breakpoint_fires_once() {
        let mut table = BreakpointTable::default();
        table.set(FILE, 7, true, None).expect("setting");

        assert_eq!(table.check(FILE, 7, always_true), Hit::Halt { cleared: true });
        assert!(table.get(FILE, 7).is_none());
        assert_eq!(table.check(FILE, 7, always_true), Hit::Miss);
    }

    #[test]
    fn false_condition_does_not_halt() {
        let mut table = BreakpointTable::default();
        table.set(FILE, 5, false, Some("x > 5")).expect("setting");
        assert_eq!(table.check(FILE, 5, |_| ConditionVerdict::False), Hit::Miss);
        assert!(table.get(FILE, 5).is_some());
    }

    #[test]
    fn broken_condition_halts_without_consuming_ignores() {
        let mut table = BreakpointTable::default();
        table.set(FILE, 5, false, Some("x > 5")).expect("setting");
        table.set_ignore(FILE, 5, 3);

        assert_eq!(
            table.check(FILE, 5, |_| ConditionVerdict::Error),
            Hit::Halt { cleared: false }
        );
        assert_eq!(table.get(FILE, 5).expect("entry").ignore_count, 3);
    }

    #[test]
    fn disabled_breakpoint_never_halts() {
        let mut table = BreakpointTable::default();
        table.set(FILE, 9, false, None).expect("setting");
        table.enable(FILE, 9, false);
        assert_eq!(table.check(FILE, 9, always_true), Hit::Miss);

        table.enable(FILE, 9, true);
        assert_eq!(table.check(FILE, 9, always_true), Hit::Halt { cleared: false });
    }

    #[test]
    fn watch_spec_parsing() {
        assert_eq!(parse_watch_spec("x > 1"), ("x > 1", WatchFlag::Plain));
        assert_eq!(parse_watch_spec("foo??created??"), ("foo", WatchFlag::Created));
        assert_eq!(
            parse_watch_spec("bar ??changed??"),
            ("bar", WatchFlag::Changed)
        );
    }

    #[test]
    fn plain_watch_halts_on_truthy() {
        let mut table = WatchTable::default();
        table.set("x > 1", false).expect("setting");

        let miss = table.check(|_| WatchObservation::Value {
            truthy: false,
            rendered: "1".to_owned(),
        });
        assert_eq!(miss, None);

        let hit = table.check(|_| WatchObservation::Value {
            truthy: true,
            rendered: "2".to_owned(),
        });
        assert_eq!(
            hit,
            Some(WatchHit {
                raw: "x > 1".to_owned(),
                cleared: false
            })
        );
    }

    #[test]
    fn created_watch_needs_a_missing_baseline() {
        let mut table = WatchTable::default();
        table.set("name??created??", false).expect("setting");

        // First sighting only establishes the baseline.
        assert_eq!(
            table.check(|_| WatchObservation::Value {
                truthy: true,
                rendered: "1".to_owned()
            }),
            None
        );

        let mut table = WatchTable::default();
        table.set("name??created??", false).expect("setting");
        assert_eq!(table.check(|_| WatchObservation::Unevaluable), None);
        assert_eq!(table.check(|_| WatchObservation::Unevaluable), None);
        let hit = table.check(|_| WatchObservation::Value {
            truthy: false,
            rendered: "0".to_owned(),
        });
        assert_eq!(hit.expect("should trigger").raw, "name??created??");
    }

    #[test]
    fn changed_watch_triggers_on_new_value() {
        let mut table = WatchTable::default();
        table.set("total??changed??", false).expect("setting");

        let observe = |rendered: &str| WatchObservation::Value {
            truthy: true,
            rendered: rendered.to_owned(),
        };
        assert_eq!(table.check(|_| observe("10")), None);
        assert_eq!(table.check(|_| observe("10")), None);
        assert!(table.check(|_| observe("11")).is_some());
        assert_eq!(table.check(|_| observe("11")), None);
    }

    #[test]
    fn temporary_watch_removes_itself() {
        let mut table = WatchTable::default();
        table.set("x", true).expect("setting");

        let hit = table.check(|_| WatchObservation::Value {
            truthy: true,
            rendered: "1".to_owned(),
        });
        assert_eq!(hit.expect("should trigger").cleared, true);
        assert!(table.is_empty());
    }

    #[test]
    fn watch_ignore_count_absorbs_triggers() {
        let mut table = WatchTable::default();
        table.set("x", false).expect("setting");
        table.set_ignore("x", 1);

        let observe = || WatchObservation::Value {
            truthy: true,
            rendered: "1".to_owned(),
        };
        assert_eq!(table.check(|_| observe()), None);
        assert!(table.check(|_| observe()).is_some());
    }
}
