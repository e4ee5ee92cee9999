//! A scoped, LIFO cleanup registry.
//!
//! Stands in for the original tool's `atexit`-registered cleanup handler:
//! each fallible step of a session can push an inverse operation, and on
//! scope exit — whether the scope returned `Ok` or an error propagated
//! out of it — every registered handler runs once, most-recently-pushed
//! first.

pub struct CleanupStack {
    handlers: Vec<Box<dyn FnOnce() + Send>>,
}

impl Default for CleanupStack {
    fn default() -> Self {
        Self::new()
    }
}

impl CleanupStack {
    pub fn new() -> Self {
        CleanupStack {
            handlers: Vec::new(),
        }
    }

    /// Push an inverse operation. Pushed only after its corresponding
    /// forward operation has already succeeded.
    pub fn push(&mut self, handler: impl FnOnce() + Send + 'static) {
        self.handlers.push(Box::new(handler));
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    /// Run every registered handler in LIFO order, then clear the stack.
    /// Called unconditionally on normal completion and from the error path.
    pub fn run_all(&mut self) {
        while let Some(handler) = self.handlers.pop() {
            handler();
        }
    }
}

impl Drop for CleanupStack {
    fn drop(&mut self) {
        self.run_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[test]
    fn lifo_order() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let mut stack = CleanupStack::new();
        for i in 0..3 {
            let order = order.clone();
            stack.push(move || order.lock().unwrap().push(i));
        }
        stack.run_all();
        assert_eq!(*order.lock().unwrap(), vec![2, 1, 0]);
    }

    #[test]
    fn runs_on_drop() {
        let order = Arc::new(Mutex::new(Vec::new()));
        {
            let mut stack = CleanupStack::new();
            let order = order.clone();
            stack.push(move || order.lock().unwrap().push(1));
        }
        assert_eq!(*order.lock().unwrap(), vec![1]);
    }
}
