//! A multicast event channel.
//!
//! The source this engine is modeled on used a small delegate object with
//! `+`/`-` operators to add/remove listeners from a component. That pattern
//! doesn't translate to Rust directly, so it is replaced with an explicit
//! subscription primitive: `subscribe` returns a [`Token`] that `unsubscribe`
//! later consumes, and `emit` invokes every live handler in subscription
//! order. Handlers are plain closures that own no engine state; the channel
//! clones `Args` once per handler, so `Args` is required to be cheap to clone
//! (ids and small copyable tuples, in practice).

use std::fmt;

/// Opaque handle returned by [`EventChannel::subscribe`].
///
/// Tokens from one channel must not be passed to a different channel's
/// `unsubscribe` — doing so is a silent no-op rather than a panic, mirroring
/// the rest of the engine's "stale handle" policy.
#[derive(Copy, Clone, Eq, PartialEq, Hash)]
pub struct Token(u64);

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Token({})", self.0)
    }
}

struct Handler<Args> {
    token: Token,
    #[allow(clippy::type_complexity)]
    callback: Box<dyn FnMut(Args)>,
}

/// A multicast event channel: many handlers subscribed, invoked in
/// subscription order on every `emit`.
pub struct EventChannel<Args> {
    next_token: u64,
    handlers: Vec<Handler<Args>>,
}

impl<Args: Clone> EventChannel<Args> {
    pub fn new() -> Self {
        EventChannel {
            next_token: 0,
            handlers: Vec::new(),
        }
    }

    /// Registers a handler, invoked on every future `emit` until unsubscribed.
    pub fn subscribe<F>(&mut self, handler: F) -> Token
    where
        F: FnMut(Args) + 'static,
    {
        let token = Token(self.next_token);
        self.next_token += 1;
        self.handlers.push(Handler {
            token,
            callback: Box::new(handler),
        });
        token
    }

    /// Removes a previously subscribed handler. No-op if the token is unknown.
    pub fn unsubscribe(&mut self, token: Token) {
        self.handlers.retain(|h| h.token != token);
    }

    /// Invokes every subscribed handler, in subscription order, with a clone
    /// of `args`.
    pub fn emit(&mut self, args: Args) {
        for handler in &mut self.handlers {
            (handler.callback)(args.clone());
        }
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }
}

impl<Args: Clone> Default for EventChannel<Args> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[test]
    fn emits_in_subscription_order() {
        let order = Rc::new(RefCell::new(Vec::new()));
        let mut channel = EventChannel::<u32>::new();

        let o1 = order.clone();
        channel.subscribe(move |v| o1.borrow_mut().push(("a", v)));
        let o2 = order.clone();
        channel.subscribe(move |v| o2.borrow_mut().push(("b", v)));

        channel.emit(7);

        assert_eq!(*order.borrow(), vec![("a", 7), ("b", 7)]);
    }

    #[test]
    fn unsubscribe_stops_delivery() {
        let count = Rc::new(RefCell::new(0));
        let mut channel = EventChannel::<()>::new();

        let c = count.clone();
        let token = channel.subscribe(move |_| *c.borrow_mut() += 1);
        channel.emit(());
        channel.unsubscribe(token);
        channel.emit(());

        assert_eq!(*count.borrow(), 1);
    }

    #[test]
    fn unsubscribe_unknown_token_is_noop() {
        let mut channel = EventChannel::<()>::new();
        channel.subscribe(|_| {});
        channel.unsubscribe(Token(999));
        assert_eq!(channel.len(), 1);
    }
}
