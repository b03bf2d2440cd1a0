use std::sync::{Arc, RwLock};
use std::time::Instant;

use tracing::{debug, error, warn};

use crate::types::{HookAction, HookContext, HookDefinition, HookResult, HookTiming};

/// Central registry and dispatcher for all hooks in the system.
///
/// Designed to be cheaply cloneable via Arc — a single HookEngine instance
/// should be shared across the whole process (pass as Arc<HookEngine>).
pub struct HookEngine {
    /// Sorted by priority ascending after every registration.
    hooks: RwLock<Vec<HookDefinition>>,
}

impl HookEngine {
    pub fn new() -> Self {
        Self { hooks: RwLock::new(Vec::new()) }
    }

    /// Register a hook. Re-sorts the list so priority order is always correct.
    pub fn register(&self, hook: HookDefinition) {
        let mut hooks = self.hooks.write().expect("hook registry poisoned");
        hooks.push(hook);
        // Stable sort preserves registration order within the same priority.
        hooks.sort_by_key(|h| h.priority);
        debug!(name = %hooks.last().unwrap().name, "hook registered");
    }

    /// Remove a hook by name. Silent no-op if the name is not found.
    pub fn unregister(&self, name: &str) {
        let mut hooks = self.hooks.write().expect("hook registry poisoned");
        let before = hooks.len();
        hooks.retain(|h| h.name != name);
        if hooks.len() < before {
            debug!(name, "hook unregistered");
        }
    }

    /// Emit an event: run Before hooks (blocking), then After hooks (fire-and-forget).
    ///
    /// Returns the combined result — callers should check `action` to decide
    /// whether to continue or abort their operation.
    pub fn emit(&self, mut ctx: HookContext) -> HookResult {
        let action = self.emit_before(&mut ctx);

        // If a Before hook blocked, skip After hooks — the event never happened.
        if matches!(action, HookAction::Block { .. }) {
            return HookResult { action, duration_ms: 0 };
        }

        self.emit_after(ctx);

        HookResult { action, duration_ms: 0 }
    }

    /// Run all Before hooks in priority order.
    ///
    /// Stops at the first Block. Modify updates the context payload in-place
    /// so subsequent hooks see the mutated version.
    pub fn emit_before(&self, ctx: &mut HookContext) -> HookAction {
        let hooks = self.hooks.read().expect("hook registry poisoned");

        for hook in hooks.iter().filter(|h| h.event == ctx.event && h.timing == HookTiming::Before)
        {
            let t = Instant::now();
            let result = hook.handler.handle(ctx);
            let elapsed_ms = t.elapsed().as_millis() as u64;

            debug!(
                hook = %hook.name,
                duration_ms = elapsed_ms,
                "before hook completed"
            );

            match result.action {
                HookAction::Block { ref reason } => {
                    warn!(hook = %hook.name, reason, "hook blocked event");
                    return result.action;
                }
                HookAction::Modify { ref payload } => {
                    // Propagate payload mutation so the next hook sees updated data.
                    ctx.payload = payload.clone();
                }
                HookAction::Allow => {}
            }
        }

        HookAction::Allow
    }

    /// Spawn all After hooks concurrently — errors are logged, never propagated.
    pub fn emit_after(&self, ctx: HookContext) {
        let hooks = self.hooks.read().expect("hook registry poisoned");

        for hook in hooks.iter().filter(|h| h.event == ctx.event && h.timing == HookTiming::After)
        {
            let ctx_clone = ctx.clone();
            // Clone Arc — cheap pointer bump, not a deep copy of the handler.
            let handler = Arc::clone(&hook.handler);
            let hook_name = hook.name.clone();

            tokio::spawn(async move {
                let t = Instant::now();
                let result = handler.handle(&ctx_clone);
                let elapsed_ms = t.elapsed().as_millis() as u64;

                if let HookAction::Block { reason } = result.action {
                    // After hooks cannot actually block — log the misconfiguration.
                    error!(
                        hook = %hook_name,
                        duration_ms = elapsed_ms,
                        reason,
                        "after hook returned Block — ignored (use Before timing to block)"
                    );
                } else {
                    debug!(hook = %hook_name, duration_ms = elapsed_ms, "after hook completed");
                }
            });
        }
    }
}

impl Default for HookEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::HookEvent;

    struct AllowHandler;
    impl crate::types::HookHandler for AllowHandler {
        fn handle(&self, _ctx: &HookContext) -> HookResult {
            HookResult::allow(0)
        }
    }

    struct BlockHandler(&'static str);
    impl crate::types::HookHandler for BlockHandler {
        fn handle(&self, _ctx: &HookContext) -> HookResult {
            HookResult::block(self.0, 0)
        }
    }

    struct ModifyHandler(serde_json::Value);
    impl crate::types::HookHandler for ModifyHandler {
        fn handle(&self, _ctx: &HookContext) -> HookResult {
            HookResult {
                action: HookAction::Modify { payload: self.0.clone() },
                duration_ms: 0,
            }
        }
    }

    fn ctx() -> HookContext {
        HookContext::new(HookEvent::MessageReceived, serde_json::json!({"n": 0}))
    }

    #[test]
    fn before_hooks_run_in_priority_order() {
        let engine = HookEngine::new();
        engine.register(HookDefinition::new(
            "second",
            HookEvent::MessageReceived,
            HookTiming::Before,
            Arc::new(ModifyHandler(serde_json::json!({"n": 2}))),
        ).with_priority(10));
        engine.register(HookDefinition::new(
            "first",
            HookEvent::MessageReceived,
            HookTiming::Before,
            Arc::new(ModifyHandler(serde_json::json!({"n": 1}))),
        ).with_priority(0));

        let mut c = ctx();
        let action = engine.emit_before(&mut c);
        assert!(matches!(action, HookAction::Allow));
        // the later-priority hook's modification is the one that survives
        assert_eq!(c.payload, serde_json::json!({"n": 2}));
    }

    #[test]
    fn a_blocking_hook_halts_the_chain() {
        let engine = HookEngine::new();
        engine.register(HookDefinition::new(
            "blocker",
            HookEvent::MessageReceived,
            HookTiming::Before,
            Arc::new(BlockHandler("nope")),
        ).with_priority(0));
        engine.register(HookDefinition::new(
            "never-runs",
            HookEvent::MessageReceived,
            HookTiming::Before,
            Arc::new(ModifyHandler(serde_json::json!({"n": 99}))),
        ).with_priority(10));

        let mut c = ctx();
        let action = engine.emit_before(&mut c);
        assert!(matches!(action, HookAction::Block { reason } if reason == "nope"));
        // unreached hook never mutated the payload
        assert_eq!(c.payload, serde_json::json!({"n": 0}));
    }

    #[test]
    fn hooks_for_other_events_are_not_invoked() {
        let engine = HookEngine::new();
        engine.register(HookDefinition::new(
            "wrong-event",
            HookEvent::MessageSent,
            HookTiming::Before,
            Arc::new(BlockHandler("should not fire")),
        ));

        let mut c = ctx();
        let action = engine.emit_before(&mut c);
        assert!(matches!(action, HookAction::Allow));
    }

    #[test]
    fn unregister_removes_hook_by_name() {
        let engine = HookEngine::new();
        engine.register(HookDefinition::new(
            "temp",
            HookEvent::MessageReceived,
            HookTiming::Before,
            Arc::new(BlockHandler("blocked")),
        ));
        engine.unregister("temp");

        let mut c = ctx();
        let action = engine.emit_before(&mut c);
        assert!(matches!(action, HookAction::Allow));
    }

    #[tokio::test]
    async fn emit_skips_after_hooks_when_before_blocks() {
        let engine = Arc::new(HookEngine::new());
        engine.register(HookDefinition::new(
            "blocker",
            HookEvent::MessageReceived,
            HookTiming::Before,
            Arc::new(BlockHandler("stop")),
        ));

        let result = engine.emit(ctx());
        assert!(matches!(result.action, HookAction::Block { .. }));
    }

    #[tokio::test]
    async fn emit_allows_through_when_no_hooks_registered() {
        let engine = HookEngine::new();
        let result = engine.emit(ctx());
        assert!(matches!(result.action, HookAction::Allow));
    }
}
