use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::Arc;
use tracing::info;

use crate::error::RouteError;
use crate::server::handler::{Handler, Route};

pub const VERB_POST: &str = "post";
pub const VERB_PUT: &str = "put";

/// Maps (verb, path) to a registered route.
///
/// Populated before serving starts, then frozen behind an `Arc` and shared
/// read-only by every session.
#[derive(Debug, Default)]
pub struct RouteTable {
    routes: HashMap<(String, String), Route, ahash::RandomState>,
}

impl RouteTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for `verb` and `path`.
    ///
    /// Returns [`RouteError::Duplicate`] and keeps the existing handler if the
    /// pair is already registered. Paths are opaque keys and are not validated.
    pub fn register<H: Handler>(
        &mut self,
        verb: impl Into<String>,
        path: impl Into<String>,
        handler: H,
    ) -> Result<(), RouteError> {
        let key = (verb.into(), path.into());
        match self.routes.entry(key) {
            Entry::Occupied(slot) => {
                let (verb, path) = slot.key().clone();
                Err(RouteError::Duplicate { verb, path })
            }
            Entry::Vacant(slot) => {
                let (verb, path) = slot.key().clone();
                info!(verb = %verb, path = %path, "Registered route");
                slot.insert(Route::new(verb, path, Arc::new(handler)));
                Ok(())
            }
        }
    }

    pub fn lookup(&self, verb: &str, path: &str) -> Option<&Route> {
        // TODO: borrow-based lookup (hashbrown Equivalent) to skip the key allocations
        self.routes.get(&(verb.to_owned(), path.to_owned()))
    }

    pub fn contains(&self, verb: &str, path: &str) -> bool {
        self.lookup(verb, path).is_some()
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{Inbound, Outbound};
    use crate::error::HandlerError;

    async fn noop(_inbound: Inbound, _outbound: Outbound) -> Result<(), HandlerError> {
        Ok(())
    }

    async fn failing(_inbound: Inbound, _outbound: Outbound) -> Result<(), HandlerError> {
        Err("boom".into())
    }

    #[test]
    fn test_register_and_lookup() {
        let mut table = RouteTable::new();
        table.register(VERB_POST, "/ping", noop).unwrap();

        let route = table.lookup("post", "/ping").unwrap();
        assert_eq!(route.verb(), "post");
        assert_eq!(route.path(), "/ping");
        assert!(table.lookup("get", "/ping").is_none());
        assert!(table.lookup("post", "ping").is_none());
    }

    #[test]
    fn test_duplicate_rejected_first_kept() {
        let mut table = RouteTable::new();
        table.register(VERB_POST, "/ping", noop).unwrap();
        let first = Arc::clone(table.lookup("post", "/ping").unwrap().handler());

        let result = table.register(VERB_POST, "/ping", failing);
        assert_eq!(
            result,
            Err(RouteError::Duplicate {
                verb: "post".to_string(),
                path: "/ping".to_string(),
            })
        );

        let kept = table.lookup("post", "/ping").unwrap().handler();
        assert!(Arc::ptr_eq(&first, kept));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_same_path_different_verbs() {
        let mut table = RouteTable::new();
        table.register(VERB_POST, "/item", noop).unwrap();
        table.register(VERB_PUT, "/item", noop).unwrap();

        assert_eq!(table.len(), 2);
        assert!(table.contains("put", "/item"));
    }
}
