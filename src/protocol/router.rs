use crate::config::Concurrency;
use crate::error::{constants, ProtocolError, Result};
use crate::protocol::message::MAX_ROUTE_LEN;
use crate::service::Handler;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tracing::debug;

/// Invocation policy attached to a route.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RouteOptions {
    pub concurrency: Concurrency,
    pub deadline: Option<Duration>,
}

/// A registered handler and where it came from.
pub struct RouteEntry {
    pub route: Arc<str>,
    pub service: String,
    pub method: String,
    pub handler: Handler,
    pub options: RouteOptions,
}

impl fmt::Debug for RouteEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RouteEntry")
            .field("route", &self.route)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

/// Read-only view of the routing table.
pub type RouteTable = HashMap<String, Arc<RouteEntry>>;

/// Route table keyed by the full dotted route `service.method`.
///
/// Writers copy the table, modify the copy and swap it in; readers only clone
/// the current `Arc` under a short read lock, so a lookup never waits for more
/// than one registration.
pub struct Router {
    table: RwLock<Arc<RouteTable>>,
}

impl Default for Router {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Router {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Router")
            .field("routes", &self.routes())
            .finish()
    }
}

impl Router {
    pub fn new() -> Self {
        Self {
            table: RwLock::new(Arc::new(HashMap::new())),
        }
    }

    /// Register `service.method` with default options.
    pub fn register(&self, service: &str, method: &str, handler: Handler) -> Result<()> {
        self.register_with(service, method, handler, RouteOptions::default())
    }

    /// Register `service.method`. Duplicate routes are always rejected.
    pub fn register_with(
        &self,
        service: &str,
        method: &str,
        handler: Handler,
        options: RouteOptions,
    ) -> Result<()> {
        validate_service_name(service)?;
        validate_method_name(method)?;
        let route = format!("{service}.{method}");
        if route.len() > MAX_ROUTE_LEN {
            return Err(ProtocolError::RouteTooLong(route.len()));
        }

        let mut table = self
            .table
            .write()
            .map_err(|_| ProtocolError::LockPoisoned(constants::ERR_ROUTER_WRITE_LOCK))?;
        if table.contains_key(&route) {
            return Err(ProtocolError::RouteConflict(route));
        }

        let entry = RouteEntry {
            route: Arc::from(route.as_str()),
            service: service.to_string(),
            method: method.to_string(),
            handler,
            options,
        };
        let mut next = RouteTable::clone(&table);
        next.insert(route.clone(), Arc::new(entry));
        *table = Arc::new(next);

        debug!(%route, "Route registered");
        Ok(())
    }

    /// Remove one method of `service`, or every route of `service` when
    /// `method` is `None`. Unknown routes are ignored. Returns how many routes
    /// were removed.
    pub fn unregister(&self, service: &str, method: Option<&str>) -> Result<usize> {
        let mut table = self
            .table
            .write()
            .map_err(|_| ProtocolError::LockPoisoned(constants::ERR_ROUTER_WRITE_LOCK))?;

        let doomed: Vec<String> = match method {
            Some(method) => {
                let route = format!("{service}.{method}");
                table.contains_key(&route).then_some(route).into_iter().collect()
            }
            None => table
                .values()
                .filter(|entry| entry.service == service)
                .map(|entry| entry.route.to_string())
                .collect(),
        };
        if doomed.is_empty() {
            return Ok(0);
        }

        let mut next = RouteTable::clone(&table);
        for route in &doomed {
            next.remove(route);
        }
        *table = Arc::new(next);

        debug!(service, removed = doomed.len(), "Routes unregistered");
        Ok(doomed.len())
    }

    /// Look up the handler for `route`.
    pub fn resolve(&self, route: &str) -> Result<Arc<RouteEntry>> {
        self.snapshot()
            .get(route)
            .cloned()
            .ok_or_else(|| ProtocolError::NoRoute(route.to_string()))
    }

    /// Current routing table. Later registrations do not affect the snapshot.
    pub fn snapshot(&self) -> Arc<RouteTable> {
        match self.table.read() {
            Ok(table) => Arc::clone(&table),
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        }
    }

    /// Registered routes in lexical order.
    pub fn routes(&self) -> Vec<String> {
        let mut routes: Vec<String> = self.snapshot().keys().cloned().collect();
        routes.sort();
        routes
    }

    pub fn contains(&self, route: &str) -> bool {
        self.snapshot().contains_key(route)
    }

    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshot().is_empty()
    }
}

fn is_printable(s: &str) -> bool {
    s.chars().all(|c| !c.is_control() && !c.is_whitespace())
}

/// Service names form the leftmost route segment and may not contain dots.
pub fn validate_service_name(name: &str) -> Result<()> {
    if name.is_empty() || name.contains('.') || !is_printable(name) {
        return Err(ProtocolError::InvalidRoute(name.to_string()));
    }
    Ok(())
}

/// Method names may be dotted but every segment must be non-empty.
pub fn validate_method_name(name: &str) -> Result<()> {
    if name.is_empty() || name.split('.').any(str::is_empty) || !is_printable(name) {
        return Err(ProtocolError::InvalidRoute(name.to_string()));
    }
    Ok(())
}
