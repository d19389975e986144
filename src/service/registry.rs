use crate::config::{DispatchConfig, ServiceConfig};
use crate::error::{constants, ProtocolError, Result};
use crate::protocol::router::{validate_service_name, RouteOptions, Router};
use crate::service::{MethodSet, Service};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, RwLock};
use tracing::{info, warn};

struct Registered {
    service: Arc<dyn Service>,
    routes: Vec<String>,
    options: RouteOptions,
}

/// Services of a node, keyed by name.
///
/// Adding a service asks it for its methods and registers each one with the
/// router as `<service>.<method>`. A service whose methods cannot all be
/// registered is not added at all.
pub struct ServiceRegistry {
    router: Arc<Router>,
    services: RwLock<HashMap<String, Registered>>,
    defaults: RouteOptions,
    overrides: HashMap<String, ServiceConfig>,
}

impl fmt::Debug for ServiceRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceRegistry")
            .field("services", &self.names())
            .field("defaults", &self.defaults)
            .finish()
    }
}

impl ServiceRegistry {
    /// Registry with default policies.
    pub fn new(router: Arc<Router>) -> Self {
        Self::with_config(router, &DispatchConfig::default(), &[])
    }

    /// Registry applying `dispatch` defaults and per-service `overrides`.
    pub fn with_config(
        router: Arc<Router>,
        dispatch: &DispatchConfig,
        overrides: &[ServiceConfig],
    ) -> Self {
        Self {
            router,
            services: RwLock::new(HashMap::new()),
            defaults: RouteOptions {
                concurrency: dispatch.default_concurrency,
                deadline: dispatch.default_deadline,
            },
            overrides: overrides
                .iter()
                .map(|o| (o.name.clone(), o.clone()))
                .collect(),
        }
    }

    /// Add a service and register all of its methods.
    pub fn add(&self, service: Arc<dyn Service>) -> Result<()> {
        let name = service.name().to_string();
        validate_service_name(&name)?;

        let mut services = self
            .services
            .write()
            .map_err(|_| ProtocolError::LockPoisoned(constants::ERR_REGISTRY_LOCK))?;
        if services.contains_key(&name) {
            return Err(ProtocolError::ServiceExists(name));
        }

        let mut methods = MethodSet::new();
        Arc::clone(&service).register(&mut methods);
        if methods.is_empty() {
            return Err(ProtocolError::NoHandlers(name));
        }

        let options = self.options_for(&name, service.as_ref());
        let mut routes: Vec<String> = Vec::with_capacity(methods.len());
        for (method, handler) in methods.into_inner() {
            if let Err(e) = self
                .router
                .register_with(&name, &method, handler, options)
            {
                for route in &routes {
                    self.rollback(&name, route);
                }
                warn!(service = %name, error = %e, "Service rejected");
                return Err(e);
            }
            routes.push(method);
        }

        info!(
            service = %name,
            methods = routes.len(),
            concurrency = ?options.concurrency,
            "Service added"
        );
        let routes = routes.into_iter().map(|m| format!("{name}.{m}")).collect();
        services.insert(
            name,
            Registered {
                service,
                routes,
                options,
            },
        );
        Ok(())
    }

    /// Remove a service and every route it contributed.
    pub fn remove(&self, name: &str) -> Result<Option<Arc<dyn Service>>> {
        let mut services = self
            .services
            .write()
            .map_err(|_| ProtocolError::LockPoisoned(constants::ERR_REGISTRY_LOCK))?;
        let Some(registered) = services.remove(name) else {
            return Ok(None);
        };
        let removed = self.router.unregister(name, None)?;
        info!(service = name, routes = removed, "Service removed");
        Ok(Some(registered.service))
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Service>> {
        self.read()
            .get(name)
            .map(|registered| Arc::clone(&registered.service))
    }

    /// Routes contributed by `name`, in registration order.
    pub fn routes_of(&self, name: &str) -> Option<Vec<String>> {
        self.read().get(name).map(|r| r.routes.clone())
    }

    /// Effective invocation policy of `name`.
    pub fn options_of(&self, name: &str) -> Option<RouteOptions> {
        self.read().get(name).map(|r| r.options)
    }

    /// Service names in lexical order.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.read().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    pub fn router(&self) -> &Arc<Router> {
        &self.router
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, Registered>> {
        self.services
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn rollback(&self, service: &str, method: &str) {
        if let Err(e) = self.router.unregister(service, Some(method)) {
            warn!(service, method, error = %e, "Failed to roll back route");
        }
    }

    // Node configuration wins over what the service asks for.
    fn options_for(&self, name: &str, service: &dyn Service) -> RouteOptions {
        let requested = service.options();
        let configured = self.overrides.get(name);
        RouteOptions {
            concurrency: configured
                .and_then(|c| c.concurrency)
                .or(requested.concurrency)
                .unwrap_or(self.defaults.concurrency),
            deadline: configured
                .and_then(|c| c.deadline)
                .or(requested.deadline)
                .or(self.defaults.deadline),
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use crate::config::Concurrency;
    use crate::service::FnService;
    use bytes::Bytes;
    use std::time::Duration;

    fn echo(name: &str) -> FnService {
        FnService::new(name)
            .method("echo", |_ctx, data| async move { Ok(data) })
            .method("ping", |_ctx, _data| async { Ok(Bytes::from_static(b"pong")) })
    }

    #[test]
    fn add_registers_routes() {
        let router = Arc::new(Router::new());
        let registry = ServiceRegistry::new(Arc::clone(&router));
        registry.add(Arc::new(echo("svc"))).unwrap();

        assert_eq!(router.routes(), vec!["svc.echo", "svc.ping"]);
        assert_eq!(registry.names(), vec!["svc"]);
        assert!(registry.get("svc").is_some());
    }

    #[test]
    fn duplicate_service() {
        let registry = ServiceRegistry::new(Arc::new(Router::new()));
        registry.add(Arc::new(echo("svc"))).unwrap();
        assert!(matches!(
            registry.add(Arc::new(echo("svc"))),
            Err(ProtocolError::ServiceExists(name)) if name == "svc"
        ));
    }

    #[test]
    fn empty_service() {
        let registry = ServiceRegistry::new(Arc::new(Router::new()));
        assert!(matches!(
            registry.add(Arc::new(FnService::new("idle"))),
            Err(ProtocolError::NoHandlers(_))
        ));
        assert!(registry.is_empty());
    }

    #[test]
    fn partial_registration_rolls_back() {
        let router = Arc::new(Router::new());
        let registry = ServiceRegistry::new(Arc::clone(&router));
        let svc = FnService::new("svc")
            .method("a", |_ctx, data| async move { Ok(data) })
            .method("a", |_ctx, data| async move { Ok(data) });

        assert!(matches!(
            registry.add(Arc::new(svc)),
            Err(ProtocolError::RouteConflict(_))
        ));
        assert!(router.is_empty());
        assert!(registry.get("svc").is_none());
    }

    #[test]
    fn remove_unregisters() {
        let router = Arc::new(Router::new());
        let registry = ServiceRegistry::new(Arc::clone(&router));
        registry.add(Arc::new(echo("svc"))).unwrap();

        assert!(registry.remove("svc").unwrap().is_some());
        assert!(router.is_empty());
        assert!(registry.remove("svc").unwrap().is_none());
    }

    #[test]
    fn config_overrides_service_options() {
        let router = Arc::new(Router::new());
        let mut over = ServiceConfig::new("svc");
        over.concurrency = Some(Concurrency::Parallel);
        let registry = ServiceRegistry::with_config(
            Arc::clone(&router),
            &DispatchConfig::default(),
            &[over],
        );
        registry
            .add(Arc::new(
                echo("svc")
                    .concurrency(Concurrency::Serial)
                    .deadline(Duration::from_millis(50)),
            ))
            .unwrap();

        let options = registry.options_of("svc").unwrap();
        assert_eq!(options.concurrency, Concurrency::Parallel);
        assert_eq!(options.deadline, Some(Duration::from_millis(50)));
        assert_eq!(
            router.resolve("svc.echo").unwrap().options.concurrency,
            Concurrency::Parallel
        );
    }
}
