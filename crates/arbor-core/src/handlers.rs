//! Handler registration table
//!
//! TigerStyle: Explicit registration, no runtime discovery.
//!
//! Each agent builds one table when it is bound to its shell. Handlers are
//! matched by the payload's type discriminator; catch-all handlers receive
//! every envelope and run after the typed ones.

use crate::agent::{Agent, AgentContext};
use crate::envelope::{Envelope, Event};
use crate::error::Result;
use futures::future::BoxFuture;
use std::sync::Arc;

/// Maximum number of handlers one agent may register
pub const HANDLERS_COUNT_MAX: usize = 1024;

/// Type-erased handler over a raw envelope
pub type EnvelopeHandlerFn<A> = Arc<
    dyn for<'a> Fn(
            &'a A,
            &'a mut AgentContext<<A as Agent>::State>,
            &'a Envelope,
        ) -> BoxFuture<'a, Result<()>>
        + Send
        + Sync,
>;

/// Per-handler options
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandlerOptions {
    /// Lower runs first
    pub priority: i32,
    /// Whether the handler sees envelopes its own agent published
    pub allow_self_handling: bool,
}

impl Default for HandlerOptions {
    fn default() -> Self {
        Self {
            priority: 0,
            allow_self_handling: false,
        }
    }
}

impl HandlerOptions {
    /// Default options
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the priority
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Let the handler observe the agent's own publications
    pub fn allow_self_handling(mut self) -> Self {
        self.allow_self_handling = true;
        self
    }
}

struct HandlerEntry<A: Agent> {
    /// `None` for catch-all
    type_name: Option<&'static str>,
    options: HandlerOptions,
    handler: EnvelopeHandlerFn<A>,
}

impl<A: Agent> Clone for HandlerEntry<A> {
    fn clone(&self) -> Self {
        Self {
            type_name: self.type_name,
            options: self.options,
            handler: Arc::clone(&self.handler),
        }
    }
}

/// Immutable handler table for one agent type
pub struct HandlerTable<A: Agent> {
    /// Typed handlers, sorted by priority then registration order
    typed: Vec<HandlerEntry<A>>,
    /// Catch-all handlers, same ordering
    catch_all: Vec<HandlerEntry<A>>,
}

impl<A: Agent> Clone for HandlerTable<A> {
    fn clone(&self) -> Self {
        Self {
            typed: self.typed.clone(),
            catch_all: self.catch_all.clone(),
        }
    }
}

impl<A: Agent> std::fmt::Debug for HandlerTable<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerTable")
            .field(
                "typed",
                &self.typed.iter().map(|e| e.type_name).collect::<Vec<_>>(),
            )
            .field("catch_all_count", &self.catch_all.len())
            .finish()
    }
}

impl<A: Agent> HandlerTable<A> {
    /// Start building a table
    pub fn builder() -> HandlerTableBuilder<A> {
        HandlerTableBuilder {
            entries: Vec::new(),
        }
    }

    /// A table with no handlers
    pub fn empty() -> Self {
        Self::builder().build()
    }

    /// Handlers for `event_type`, in execution order
    ///
    /// `is_self_origin` hides handlers that did not opt into seeing their
    /// own agent's publications.
    pub fn matching(&self, event_type: &str, is_self_origin: bool) -> Vec<EnvelopeHandlerFn<A>> {
        let visible = |e: &&HandlerEntry<A>| !is_self_origin || e.options.allow_self_handling;

        self.typed
            .iter()
            .filter(|e| e.type_name == Some(event_type))
            .filter(visible)
            .chain(self.catch_all.iter().filter(visible))
            .map(|e| Arc::clone(&e.handler))
            .collect()
    }

    /// Whether any typed handler is registered for `event_type`
    pub fn handles(&self, event_type: &str) -> bool {
        self.typed.iter().any(|e| e.type_name == Some(event_type))
    }

    /// Total number of registered handlers
    pub fn len(&self) -> usize {
        self.typed.len() + self.catch_all.len()
    }

    /// Whether the table is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Builder for [`HandlerTable`]
pub struct HandlerTableBuilder<A: Agent> {
    entries: Vec<HandlerEntry<A>>,
}

impl<A: Agent> HandlerTableBuilder<A> {
    /// Register a typed handler
    ///
    /// ```rust,ignore
    /// HandlerTable::builder()
    ///     .on::<Deposited, _>(|_agent, ctx, event| Box::pin(async move {
    ///         ctx.state.balance += event.amount;
    ///         Ok(())
    ///     }))
    ///     .build()
    /// ```
    pub fn on<E, F>(self, handler: F) -> Self
    where
        E: Event,
        F: for<'a> Fn(&'a A, &'a mut AgentContext<A::State>, E) -> BoxFuture<'a, Result<()>>
            + Send
            + Sync
            + 'static,
    {
        self.on_with::<E, F>(HandlerOptions::default(), handler)
    }

    /// Register a typed handler with options
    pub fn on_with<E, F>(mut self, options: HandlerOptions, handler: F) -> Self
    where
        E: Event,
        F: for<'a> Fn(&'a A, &'a mut AgentContext<A::State>, E) -> BoxFuture<'a, Result<()>>
            + Send
            + Sync
            + 'static,
    {
        let erased = erase::<A, _>(move |agent, ctx, envelope| {
            match envelope.payload.unpack::<E>() {
                Ok(event) => handler(agent, ctx, event),
                Err(e) => Box::pin(async move { Err(e) }),
            }
        });
        self.push(Some(E::TYPE_NAME), options, erased);
        self
    }

    /// Register a catch-all handler that receives every envelope
    pub fn on_all<F>(self, handler: F) -> Self
    where
        F: for<'a> Fn(&'a A, &'a mut AgentContext<A::State>, &'a Envelope) -> BoxFuture<'a, Result<()>>
            + Send
            + Sync
            + 'static,
    {
        self.on_all_with(HandlerOptions::default(), handler)
    }

    /// Register a catch-all handler with options
    pub fn on_all_with<F>(mut self, options: HandlerOptions, handler: F) -> Self
    where
        F: for<'a> Fn(&'a A, &'a mut AgentContext<A::State>, &'a Envelope) -> BoxFuture<'a, Result<()>>
            + Send
            + Sync
            + 'static,
    {
        self.push(None, options, Arc::new(handler));
        self
    }

    fn push(
        &mut self,
        type_name: Option<&'static str>,
        options: HandlerOptions,
        handler: EnvelopeHandlerFn<A>,
    ) {
        assert!(
            self.entries.len() < HANDLERS_COUNT_MAX,
            "handler table exceeds {} entries",
            HANDLERS_COUNT_MAX
        );
        self.entries.push(HandlerEntry {
            type_name,
            options,
            handler,
        });
    }

    /// Freeze the table
    pub fn build(self) -> HandlerTable<A> {
        let (mut catch_all, mut typed): (Vec<_>, Vec<_>) = self
            .entries
            .into_iter()
            .partition(|e| e.type_name.is_none());

        // Stable sort keeps registration order within a priority
        typed.sort_by_key(|e| e.options.priority);
        catch_all.sort_by_key(|e| e.options.priority);

        HandlerTable { typed, catch_all }
    }
}

fn erase<A, F>(f: F) -> EnvelopeHandlerFn<A>
where
    A: Agent,
    F: for<'a> Fn(&'a A, &'a mut AgentContext<A::State>, &'a Envelope) -> BoxFuture<'a, Result<()>>
        + Send
        + Sync
        + 'static,
{
    Arc::new(f)
}
