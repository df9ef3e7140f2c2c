//! Logical call object shared between the calling layer and the codec.

use crate::context::ContextMap;

/// One RPC attempt as seen by the caller: propagated context plus the bound
/// arguments.
///
/// Encoding reads the arguments; decoding merges header context into
/// `context` and stores the decoded arguments.
#[derive(Debug, Clone)]
pub struct Invocation<A> {
    context: ContextMap,
    args: Option<A>,
}

impl<A> Invocation<A> {
    /// Creates an invocation with no arguments and an empty context.
    pub fn new() -> Self {
        Self {
            context: ContextMap::new(),
            args: None,
        }
    }

    pub fn with_args(args: A) -> Self {
        Self {
            context: ContextMap::new(),
            args: Some(args),
        }
    }

    pub fn with_context(mut self, context: ContextMap) -> Self {
        self.context = context;
        self
    }

    pub fn add_context(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.context.insert(key, value);
    }

    pub fn context(&self, key: &str) -> Option<&str> {
        self.context.get(key)
    }

    pub fn context_map(&self) -> &ContextMap {
        &self.context
    }

    pub fn context_map_mut(&mut self) -> &mut ContextMap {
        &mut self.context
    }

    pub fn args(&self) -> Option<&A> {
        self.args.as_ref()
    }

    pub fn set_args(&mut self, args: A) {
        self.args = Some(args);
    }

    pub fn take_args(&mut self) -> Option<A> {
        self.args.take()
    }
}

impl<A> Default for Invocation<A> {
    fn default() -> Self {
        Self::new()
    }
}
