/// Fixed set of callback stages a `WorkManager` (or other driver
/// collaborator) can hook into, replacing the Python source's ad-hoc
/// `sim_manager.register_callback(sim_manager.prepare_new_iteration, fn,
/// priority)` pattern (bound methods as callback keys) with a typed enum,
/// per the "Ad-hoc callback registration" design note.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Stage {
    PrepareNewIteration,
    PreIteration,
    PostIteration,
}

/// A plain-value handler: not a bound method, not a closure capturing
/// driver internals — callers register a `fn` and the bus only ever hands
/// it a reference to whatever shared context the stage defines.
pub struct EventBus<Ctx> {
    handlers: Vec<(Stage, i32, fn(&mut Ctx))>,
}

impl<Ctx> EventBus<Ctx> {
    pub fn new() -> Self {
        EventBus { handlers: Vec::new() }
    }

    /// Lower priority values run first, matching `weed.priority`'s use as
    /// an ordering key in `weed_driver.py`.
    pub fn register(&mut self, stage: Stage, priority: i32, handler: fn(&mut Ctx)) {
        let pos = self
            .handlers
            .iter()
            .position(|(_, p, _)| priority < *p)
            .unwrap_or(self.handlers.len());
        self.handlers.insert(pos, (stage, priority, handler));
    }

    pub fn fire(&self, stage: Stage, ctx: &mut Ctx) {
        for (s, _, handler) in &self.handlers {
            if *s == stage {
                handler(ctx);
            }
        }
    }
}

impl<Ctx> Default for EventBus<Ctx> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handlers_fire_in_priority_order() {
        let mut bus: EventBus<Vec<i32>> = EventBus::new();
        bus.register(Stage::PrepareNewIteration, 10, |ctx| ctx.push(10));
        bus.register(Stage::PrepareNewIteration, -5, |ctx| ctx.push(-5));
        bus.register(Stage::PostIteration, 0, |ctx| ctx.push(999));
        let mut log = Vec::new();
        bus.fire(Stage::PrepareNewIteration, &mut log);
        assert_eq!(log, vec![-5, 10]);
    }
}
