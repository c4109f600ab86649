//! SignalBus: emit, match, acknowledge.

use std::sync::Arc;

use serde_json::Value;

use crate::domain::{Loop, Selector, SignalKind, SignalRecord};
use crate::error::{GyreError, Result};
use crate::id::now_ms;
use crate::store::{Filter, Store};

/// Emits and delivers coordination signals through the store.
pub struct SignalBus {
    store: Arc<Store>,
}

impl SignalBus {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    /// Persist a signal. Exactly one of `target_loop`/`target_selector`
    /// must be set; violations are rejected before anything is written.
    pub fn emit(&self, signal: SignalRecord) -> Result<()> {
        match (&signal.target_loop, &signal.target_selector) {
            (Some(_), Some(_)) => {
                return Err(GyreError::InvalidSignal(
                    "both target_loop and target_selector set".to_string(),
                ));
            }
            (None, None) => {
                return Err(GyreError::InvalidSignal(
                    "neither target_loop nor target_selector set".to_string(),
                ));
            }
            _ => {}
        }
        if let Some(selector) = &signal.target_selector {
            if Selector::parse(selector).is_none() {
                return Err(GyreError::InvalidSignal(format!("bad selector '{}'", selector)));
            }
        }
        self.store.create(&signal)
    }

    /// Oldest unacknowledged signal for a loop.
    ///
    /// Specific-target signals win over selector matches; within each class
    /// the oldest is returned first (store order is creation order).
    pub fn check(&self, loop_id: &str) -> Result<Option<SignalRecord>> {
        let targeted: Vec<SignalRecord> = self.store.query(&[
            Filter::eq("target_loop", loop_id),
            Filter::absent("acknowledged_at"),
        ])?;
        if let Some(signal) = targeted.into_iter().next() {
            return Ok(Some(signal));
        }

        let selected: Vec<SignalRecord> = self.store.query(&[
            Filter::not_null("target_selector"),
            Filter::absent("acknowledged_at"),
        ])?;
        if selected.is_empty() {
            return Ok(None);
        }

        let target: Option<Loop> = self.store.get(loop_id)?;
        for signal in selected {
            let selector = signal.target_selector.as_deref().unwrap_or_default();
            if let Some(selector) = Selector::parse(selector) {
                if self.selector_matches(&selector, loop_id, target.as_ref())? {
                    return Ok(Some(signal));
                }
            }
        }
        Ok(None)
    }

    fn selector_matches(&self, selector: &Selector, loop_id: &str, target: Option<&Loop>) -> Result<bool> {
        match selector {
            Selector::Descendants(ancestor) => self.is_descendant_of(loop_id, ancestor),
            Selector::Children(parent) => {
                Ok(target.is_some_and(|l| l.parent_id.as_deref() == Some(parent.as_str())))
            }
            Selector::Kind(kind) => Ok(target.is_some_and(|l| l.kind.as_str() == kind)),
            Selector::Status(status) => Ok(target.is_some_and(|l| l.status.as_str() == status)),
        }
    }

    /// Whether `loop_id`'s parent chain reaches `ancestor`.
    ///
    /// Bounded walk through the store; the hierarchy is a tree, so the
    /// chain terminates at a root plan.
    pub fn is_descendant_of(&self, loop_id: &str, ancestor: &str) -> Result<bool> {
        let mut current = loop_id.to_string();
        for _ in 0..64 {
            let record: Option<Loop> = self.store.get(&current)?;
            match record.and_then(|l| l.parent_id) {
                Some(parent) if parent == ancestor => return Ok(true),
                Some(parent) => current = parent,
                None => return Ok(false),
            }
        }
        Ok(false)
    }

    /// Acknowledge a signal. Idempotent: a second acknowledgment leaves the
    /// original timestamp in place.
    pub fn acknowledge(&self, signal_id: &str) -> Result<()> {
        let signal: Option<SignalRecord> = self.store.get(signal_id)?;
        if let Some(mut signal) = signal {
            if signal.acknowledged_at.is_none() {
                signal.acknowledged_at = Some(now_ms());
                self.store.update(&signal)?;
            }
        }
        Ok(())
    }

    /// All unacknowledged signals, oldest first.
    pub fn pending(&self) -> Result<Vec<SignalRecord>> {
        self.store.query(&[Filter::absent("acknowledged_at")])
    }

    /// Unacknowledged signals targeting one loop directly.
    pub fn pending_for(&self, loop_id: &str) -> Result<Vec<SignalRecord>> {
        self.store.query(&[
            Filter::eq("target_loop", loop_id),
            Filter::absent("acknowledged_at"),
        ])
    }

    pub fn send_stop(&self, target: &str, reason: &str) -> Result<SignalRecord> {
        let signal = SignalRecord::new(SignalKind::Stop, reason).to_loop(target);
        self.emit(signal.clone())?;
        Ok(signal)
    }

    pub fn send_pause(&self, target: &str, reason: &str) -> Result<SignalRecord> {
        let signal = SignalRecord::new(SignalKind::Pause, reason).to_loop(target);
        self.emit(signal.clone())?;
        Ok(signal)
    }

    pub fn send_resume(&self, target: &str, reason: &str) -> Result<SignalRecord> {
        let signal = SignalRecord::new(SignalKind::Resume, reason).to_loop(target);
        self.emit(signal.clone())?;
        Ok(signal)
    }

    pub fn send_rebase(&self, target: &str, source: &str, new_head: &str, summary: &str) -> Result<SignalRecord> {
        let signal = SignalRecord::new(SignalKind::Rebase, "sibling merged to main")
            .from_loop(source)
            .to_loop(target)
            .with_payload(serde_json::json!({ "new_head": new_head, "summary": summary }));
        self.emit(signal.clone())?;
        Ok(signal)
    }

    pub fn send_error(&self, target: &str, source: &str, reason: &str, payload: Option<Value>) -> Result<SignalRecord> {
        let mut signal = SignalRecord::new(SignalKind::Error, reason)
            .from_loop(source)
            .to_loop(target);
        if let Some(payload) = payload {
            signal = signal.with_payload(payload);
        }
        self.emit(signal.clone())?;
        Ok(signal)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::KindConfig;
    use crate::domain::{LoopKind, LoopStatus};
    use std::path::PathBuf;
    use tempfile::TempDir;

    fn bus() -> (TempDir, Arc<Store>, SignalBus) {
        let tmp = TempDir::new().unwrap();
        let store = Arc::new(Store::open(tmp.path()).unwrap());
        let bus = SignalBus::new(store.clone());
        (tmp, store, bus)
    }

    fn template() -> KindConfig {
        KindConfig {
            prompt_path: PathBuf::from("p.md"),
            validation_command: "true".to_string(),
            max_iterations: 3,
        }
    }

    fn seed_family(store: &Store) -> (Loop, Loop, Loop) {
        let plan = Loop::new_plan("t", &template());
        let spec = Loop::new_child(&plan, LoopKind::Spec, 1, &template(), serde_json::json!({}), None);
        let phase = Loop::new_child(&spec, LoopKind::Phase, 1, &template(), serde_json::json!({}), None);
        store.create(&plan).unwrap();
        store.create(&spec).unwrap();
        store.create(&phase).unwrap();
        (plan, spec, phase)
    }

    #[test]
    fn test_emit_rejects_double_target() {
        let (_tmp, _store, bus) = bus();
        let bad = SignalRecord::new(SignalKind::Stop, "x")
            .to_loop("a")
            .to_selector("kind:code");
        assert!(matches!(bus.emit(bad).unwrap_err(), GyreError::InvalidSignal(_)));
        // Never persisted
        assert!(bus.pending().unwrap().is_empty());
    }

    #[test]
    fn test_emit_rejects_no_target() {
        let (_tmp, _store, bus) = bus();
        let bad = SignalRecord::new(SignalKind::Stop, "x");
        assert!(bus.emit(bad).is_err());
    }

    #[test]
    fn test_emit_rejects_malformed_selector() {
        let (_tmp, _store, bus) = bus();
        let bad = SignalRecord::new(SignalKind::Stop, "x").to_selector("everybody");
        assert!(bus.emit(bad).is_err());
    }

    #[test]
    fn test_check_returns_oldest_targeted() {
        let (_tmp, _store, bus) = bus();
        let mut first = SignalRecord::new(SignalKind::Pause, "first").to_loop("l-1");
        first.created_at = 1000;
        let mut second = SignalRecord::new(SignalKind::Stop, "second").to_loop("l-1");
        second.created_at = 2000;
        bus.emit(second).unwrap();
        bus.emit(first.clone()).unwrap();

        let got = bus.check("l-1").unwrap().unwrap();
        assert_eq!(got.id, first.id);
    }

    #[test]
    fn test_check_none_when_quiet() {
        let (_tmp, _store, bus) = bus();
        assert!(bus.check("l-1").unwrap().is_none());
    }

    #[test]
    fn test_acknowledge_hides_signal() {
        let (_tmp, _store, bus) = bus();
        let s = bus.send_stop("l-1", "stop").unwrap();
        assert!(bus.check("l-1").unwrap().is_some());
        bus.acknowledge(&s.id).unwrap();
        assert!(bus.check("l-1").unwrap().is_none());
    }

    #[test]
    fn test_acknowledge_idempotent_and_monotonic() {
        let (_tmp, store, bus) = bus();
        let s = bus.send_stop("l-1", "stop").unwrap();
        bus.acknowledge(&s.id).unwrap();
        let first: SignalRecord = store.get(&s.id).unwrap().unwrap();
        std::thread::sleep(std::time::Duration::from_millis(2));
        bus.acknowledge(&s.id).unwrap();
        let second: SignalRecord = store.get(&s.id).unwrap().unwrap();
        assert_eq!(first.acknowledged_at, second.acknowledged_at);
    }

    #[test]
    fn test_descendants_selector_matches_grandchild() {
        let (_tmp, store, bus) = bus();
        let (plan, _spec, phase) = seed_family(&store);

        bus.emit(
            SignalRecord::new(SignalKind::Stop, "stale")
                .to_selector(format!("descendants:{}", plan.id)),
        )
        .unwrap();

        let got = bus.check(&phase.id).unwrap();
        assert!(got.is_some());
        // The ancestor itself is not a descendant
        assert!(bus.check(&plan.id).unwrap().is_none());
    }

    #[test]
    fn test_children_selector_matches_only_direct() {
        let (_tmp, store, bus) = bus();
        let (plan, spec, phase) = seed_family(&store);

        bus.emit(SignalRecord::new(SignalKind::Info, "note").to_selector(format!("children:{}", plan.id)))
            .unwrap();

        assert!(bus.check(&spec.id).unwrap().is_some());
        assert!(bus.check(&phase.id).unwrap().is_none());
    }

    #[test]
    fn test_kind_and_status_selectors() {
        let (_tmp, store, bus) = bus();
        let (plan, mut spec, _phase) = seed_family(&store);
        spec.status = LoopStatus::Running;
        spec.touch();
        store.update(&spec).unwrap();

        bus.emit(SignalRecord::new(SignalKind::Info, "specs").to_selector("kind:spec"))
            .unwrap();
        assert!(bus.check(&spec.id).unwrap().is_some());
        assert!(bus.check(&plan.id).unwrap().is_none());

        bus.emit(SignalRecord::new(SignalKind::Info, "running").to_selector("status:running"))
            .unwrap();
        let got = bus.check(&spec.id).unwrap().unwrap();
        // kind:spec came first, so it is still the oldest match
        assert_eq!(got.target_selector.as_deref(), Some("kind:spec"));
    }

    #[test]
    fn test_specific_target_wins_over_selector() {
        let (_tmp, store, bus) = bus();
        let (_plan, spec, _phase) = seed_family(&store);

        let mut selector_first = SignalRecord::new(SignalKind::Info, "selector").to_selector("kind:spec");
        selector_first.created_at = 1;
        bus.emit(selector_first).unwrap();

        let targeted = bus.send_pause(&spec.id, "direct").unwrap();

        // The selector signal is older, but the specific target wins
        let got = bus.check(&spec.id).unwrap().unwrap();
        assert_eq!(got.id, targeted.id);
    }

    #[test]
    fn test_is_descendant_of() {
        let (_tmp, store, bus) = bus();
        let (plan, spec, phase) = seed_family(&store);
        assert!(bus.is_descendant_of(&phase.id, &plan.id).unwrap());
        assert!(bus.is_descendant_of(&spec.id, &plan.id).unwrap());
        assert!(!bus.is_descendant_of(&plan.id, &phase.id).unwrap());
        assert!(!bus.is_descendant_of(&plan.id, &plan.id).unwrap());
    }

    #[test]
    fn test_rebase_helper_payload() {
        let (_tmp, _store, bus) = bus();
        let s = bus.send_rebase("l-2", "l-1", "deadbeef", "merged l-1").unwrap();
        assert_eq!(s.kind, SignalKind::Rebase);
        let payload = s.payload.unwrap();
        assert_eq!(payload["new_head"], "deadbeef");
    }
}
