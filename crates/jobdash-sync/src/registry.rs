use jobdash_core::feed::{FeedMessage, WILDCARD_EVENT};
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tracing::warn;

pub type FeedHandler = Arc<dyn Fn(&FeedMessage) -> anyhow::Result<()> + Send + Sync>;

pub fn feed_handler<F>(f: F) -> FeedHandler
where
    F: Fn(&FeedMessage) -> anyhow::Result<()> + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Event type to handlers, in registration order. Registering the same
/// handler twice makes it run twice.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Vec<FeedHandler>>,
}

impl HandlerRegistry {
    pub fn on(&mut self, event_type: &str, handler: FeedHandler) {
        self.handlers
            .entry(event_type.to_string())
            .or_default()
            .push(handler);
    }

    /// Removes the first registration of `handler` only.
    pub fn off(&mut self, event_type: &str, handler: &FeedHandler) -> bool {
        let Some(list) = self.handlers.get_mut(event_type) else {
            return false;
        };
        let Some(index) = list.iter().position(|existing| same_handler(existing, handler)) else {
            return false;
        };
        list.remove(index);
        if list.is_empty() {
            self.handlers.remove(event_type);
        }
        true
    }

    pub fn count(&self, event_type: &str) -> usize {
        self.handlers.get(event_type).map(Vec::len).unwrap_or(0)
    }

    /// Type-specific handlers first, then wildcard handlers.
    pub fn handlers_for(&self, event_type: &str) -> Vec<FeedHandler> {
        let mut out = Vec::new();
        if event_type != WILDCARD_EVENT {
            if let Some(list) = self.handlers.get(event_type) {
                out.extend(list.iter().cloned());
            }
        }
        if let Some(list) = self.handlers.get(WILDCARD_EVENT) {
            out.extend(list.iter().cloned());
        }
        out
    }
}

fn same_handler(a: &FeedHandler, b: &FeedHandler) -> bool {
    std::ptr::eq(
        Arc::as_ptr(a) as *const (),
        Arc::as_ptr(b) as *const (),
    )
}

/// Runs every handler; an error or panic in one is logged and the rest
/// still run. Returns how many handlers failed.
pub fn dispatch(handlers: &[FeedHandler], message: &FeedMessage) -> usize {
    let mut failures = 0;
    for (position, handler) in handlers.iter().enumerate() {
        match catch_unwind(AssertUnwindSafe(|| handler(message))) {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                failures += 1;
                warn!(
                    event = "feed_handler_error",
                    event_type = %message.event_type,
                    position,
                    error = %err
                );
            }
            Err(_) => {
                failures += 1;
                warn!(
                    event = "feed_handler_panic",
                    event_type = %message.event_type,
                    position
                );
            }
        }
    }
    failures
}
