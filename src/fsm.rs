//! Generic finite-state machine with declarative transition tables and
//! before/after transition hooks.
//!
//! One instance models one lifecycle (a managed process, the daemon itself).
//! The table is fixed at construction: `(from, event) -> to` rules in
//! declaration order. Hooks are ordered callback records removed by identity
//! token, never by value, so two hooks with identical behavior stay distinct.

use anyhow::Result;
use futures::future::BoxFuture;
use tracing::trace;

/// Hooks receive `(from, to, event)` and may be asynchronous; the returned
/// future is awaited before the transition proceeds.
type Hook<S, E> = Box<dyn Fn(&S, &S, &E) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Identity token for one registered hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HookId(u64);

pub struct StateMachine<S, E> {
    state: S,
    rules: Vec<(S, E, S)>,
    next_hook_id: u64,
    before: Vec<(HookId, Hook<S, E>)>,
    after: Vec<(HookId, Hook<S, E>)>,
}

impl<S, E> StateMachine<S, E>
where
    S: Clone + PartialEq + Send + Sync,
    E: Clone + PartialEq + Send + Sync,
{
    /// Build a machine at `initial` with its full transition table.
    ///
    /// States with no outgoing rules are simply dead ends; the machine
    /// enforces no terminal state of its own.
    pub fn new(initial: S, rules: impl IntoIterator<Item = (S, E, S)>) -> Self {
        Self {
            state: initial,
            rules: rules.into_iter().collect(),
            next_hook_id: 1,
            before: Vec::new(),
            after: Vec::new(),
        }
    }

    pub fn state(&self) -> &S {
        &self.state
    }

    pub fn is(&self, state: &S) -> bool {
        &self.state == state
    }

    /// True iff a rule exists from the current state for this event.
    pub fn can(&self, event: &E) -> bool {
        self.target(event).is_some()
    }

    /// Events with a rule from the current state, in declaration order.
    pub fn valid_events(&self) -> Vec<E> {
        self.rules
            .iter()
            .filter(|(from, _, _)| from == &self.state)
            .map(|(_, event, _)| event.clone())
            .collect()
    }

    fn target(&self, event: &E) -> Option<S> {
        self.rules
            .iter()
            .find(|(from, ev, _)| from == &self.state && ev == event)
            .map(|(_, _, to)| to.clone())
    }

    /// Attempt the transition for `event`.
    ///
    /// Returns `Ok(false)` without side effects when no rule matches. Runs
    /// every before-hook in registration order; a failing before-hook aborts
    /// the transition (state unchanged, after-hooks skipped) and propagates.
    /// Then the state changes and every after-hook runs; an after-hook
    /// failure propagates, but the state change has already taken effect.
    pub async fn transition(&mut self, event: &E) -> Result<bool> {
        let Some(to) = self.target(event) else {
            return Ok(false);
        };
        let from = self.state.clone();

        for (_, hook) in &self.before {
            hook(&from, &to, event).await?;
        }

        self.state = to.clone();
        trace!("State transition applied");

        for (_, hook) in &self.after {
            hook(&from, &to, event).await?;
        }
        Ok(true)
    }

    /// Unconditionally overwrite the current state, bypassing rules and
    /// hooks. Recovery and test plumbing, not normal operation.
    pub fn force_state(&mut self, state: S) {
        self.state = state;
    }

    pub fn before_transition<F>(&mut self, hook: F) -> HookId
    where
        F: Fn(&S, &S, &E) -> BoxFuture<'static, Result<()>> + Send + Sync + 'static,
    {
        let id = self.next_id();
        self.before.push((id, Box::new(hook)));
        id
    }

    pub fn after_transition<F>(&mut self, hook: F) -> HookId
    where
        F: Fn(&S, &S, &E) -> BoxFuture<'static, Result<()>> + Send + Sync + 'static,
    {
        let id = self.next_id();
        self.after.push((id, Box::new(hook)));
        id
    }

    /// Remove one hook by identity. Works for both hook lists.
    pub fn remove_hook(&mut self, id: HookId) -> bool {
        let before_len = self.before.len() + self.after.len();
        self.before.retain(|(hook_id, _)| *hook_id != id);
        self.after.retain(|(hook_id, _)| *hook_id != id);
        self.before.len() + self.after.len() != before_len
    }

    fn next_id(&mut self) -> HookId {
        let id = HookId(self.next_hook_id);
        self.next_hook_id += 1;
        id
    }
}
