//! The self-ordering route table.
//!
//! Routes are tried in table order. Every successful match bumps the route's
//! counter, and a route whose count overtakes the one ranked directly above
//! it swaps places with it, so the hottest routes drift to the front.
//! Matching holds the read lock; only the swap takes the write lock.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use hyper::body::Bytes;
use hyper::http::request::Parts;
use hyper::Method;
use regex::{CaptureLocations, Regex};

use crate::app::ControllerMethod;
use crate::error::{ResourceError, RouteConfigError, RouterError, RouterResult};
use crate::pool::{Pooled, SyncPool};
use crate::request::RequestWrapper;
use crate::route::{Route, SecurityMode};

/// Decides which paths require an authenticated principal.
///
/// - only `public` set: everything is protected unless it matches `public`
/// - only `protected` set: everything is public unless it matches `protected`
/// - both set: protected paths require login unless they are also public
/// - neither set: everything is public
#[derive(Debug, Clone, Default)]
pub struct AccessPolicy {
    public: Option<Regex>,
    protected: Option<Regex>,
}

impl AccessPolicy {
    pub fn new(public: Option<&str>, protected: Option<&str>) -> Result<Self, RouteConfigError> {
        let compile = |pattern: &str| {
            Regex::new(pattern).map_err(|source| RouteConfigError::InvalidAccessPattern {
                pattern: pattern.to_owned(),
                source,
            })
        };
        Ok(Self {
            public: public.map(compile).transpose()?,
            protected: protected.map(compile).transpose()?,
        })
    }

    pub fn requires_authentication(&self, path: &str) -> bool {
        match (&self.public, &self.protected) {
            (None, None) => false,
            (Some(public), None) => !public.is_match(path),
            (None, Some(protected)) => protected.is_match(path),
            (Some(public), Some(protected)) => protected.is_match(path) && !public.is_match(path),
        }
    }

    /// Whether a request for `path` on a route with `mode` needs a login.
    pub fn route_requires_authentication(&self, path: &str, mode: SecurityMode) -> bool {
        mode == SecurityMode::ForceAuthenticated || self.requires_authentication(path)
    }
}

/// A request as handed over by the container.
#[derive(Debug)]
pub struct Incoming {
    pub head: Parts,
    pub body: Bytes,
    pub secure: bool,
}

/// The route table, ordered by descending match frequency.
pub struct RouteTable {
    routes: RwLock<Vec<Arc<Route>>>,
    by_id: HashMap<String, Arc<Route>>,
}

impl RouteTable {
    pub fn new(routes: Vec<Route>) -> Result<Self, RouteConfigError> {
        let routes: Vec<Arc<Route>> = routes.into_iter().map(Arc::new).collect();
        let mut by_id = HashMap::with_capacity(routes.len());
        for route in &routes {
            if by_id
                .insert(route.id().to_owned(), Arc::clone(route))
                .is_some()
            {
                return Err(RouteConfigError::DuplicateRouteId(route.id().to_owned()));
            }
        }
        Ok(Self {
            routes: RwLock::new(routes),
            by_id,
        })
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&Arc<Route>> {
        self.by_id.get(id)
    }

    /// Route identifiers in current table order.
    pub fn order(&self) -> RouterResult<Vec<String>> {
        let routes = self.routes.read().map_err(|_| RouterError::LockPoisoned)?;
        Ok(routes.iter().map(|r| r.id().to_owned()).collect())
    }

    /// Finds the first route matching `path`, records the match and
    /// promotes the route if it overtook its predecessor.
    pub fn lookup(&self, path: &str) -> RouterResult<Option<(Arc<Route>, CaptureLocations)>> {
        let found = {
            let routes = self.routes.read().map_err(|_| RouterError::LockPoisoned)?;
            routes.iter().enumerate().find_map(|(position, route)| {
                let locations = route.pattern().locate(path)?;
                let count = route.record_match();
                let promote = position > 0 && count > routes[position - 1].match_count();
                Some((Arc::clone(route), locations, promote))
            })
        };

        match found {
            Some((route, locations, promote)) => {
                if promote {
                    self.promote(&route)?;
                }
                Ok(Some((route, locations)))
            }
            None => Ok(None),
        }
    }

    fn promote(&self, route: &Arc<Route>) -> RouterResult<()> {
        let mut routes = self.routes.write().map_err(|_| RouterError::LockPoisoned)?;
        // the table may have changed since the read lock was released
        let Some(position) = routes.iter().position(|r| Arc::ptr_eq(r, route)) else {
            return Ok(());
        };
        if position > 0 && route.match_count() > routes[position - 1].match_count() {
            routes.swap(position - 1, position);
            log::debug!(
                "route {} promoted to position {} ({} matches)",
                route.id(),
                position - 1,
                route.match_count()
            );
        }
        Ok(())
    }

    /// Matches the request to a route and checks out a wrapper bound to it.
    ///
    /// Returns `Ok(None)` when no route matches.
    ///
    /// # Errors
    /// Fails with `405 Method Not Allowed` when the route matches but has no
    /// handler for the request method.
    pub fn find_route(
        &self,
        wrappers: &Arc<SyncPool<RequestWrapper>>,
        access: &AccessPolicy,
        incoming: Incoming,
    ) -> RouterResult<Option<Pooled<RequestWrapper>>> {
        let path = incoming.head.uri.path();
        let Some((route, locations)) = self.lookup(path)? else {
            return Ok(None);
        };

        let handler = handler_for(&route, &incoming.head.method)?;
        let auth_required = access.route_requires_authentication(path, route.security());

        let mut wrapper = wrappers.checkout()?;
        wrapper.bind(incoming.head, incoming.body, incoming.secure);
        wrapper.attach_route(route, handler, &locations, auth_required);
        Ok(Some(wrapper))
    }

    /// Writes the URI of route `id` into `out`, percent-encoding each
    /// argument into the template's placeholder slots.
    pub fn uri_for(
        &self,
        id: &str,
        args: &[&str],
        out: &mut String,
    ) -> Result<(), RouteConfigError> {
        let route = self
            .by_id
            .get(id)
            .ok_or_else(|| RouteConfigError::UnknownRoute(id.to_owned()))?;
        let template = route.pattern().reverse_template();

        let expected = template.matches('%').count();
        if expected != args.len() {
            return Err(RouteConfigError::ArgumentCount {
                id: id.to_owned(),
                expected,
                given: args.len(),
            });
        }

        let mut args = args.iter();
        for (i, literal) in template.split('%').enumerate() {
            if i > 0 {
                if let Some(arg) = args.next() {
                    out.push_str(&urlencoding::encode(arg));
                }
            }
            out.push_str(literal);
        }
        Ok(())
    }
}

/// The controller method serving `method`, if the route accepts the verb.
fn handler_for(route: &Route, method: &Method) -> RouterResult<Option<Arc<ControllerMethod>>> {
    match route.controller() {
        Some(controller) => controller
            .method_for(method)
            .cloned()
            .map(Some)
            .ok_or_else(|| ResourceError::method_not_allowed().into()),
        None if method == Method::GET || method == Method::HEAD => Ok(None),
        None => Err(ResourceError::method_not_allowed().into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::{Controller, ControllerMethod};
    use crate::route::RouteBuilder;
    use hyper::{Request, StatusCode};
    use std::thread;

    fn table(templates: &[&str]) -> RouteTable {
        let routes = templates
            .iter()
            .map(|t| RouteBuilder::new(*t, "view").build().unwrap())
            .collect();
        RouteTable::new(routes).unwrap()
    }

    fn incoming(method: Method, uri: &str) -> Incoming {
        let head = Request::builder()
            .method(method)
            .uri(uri)
            .body(())
            .unwrap()
            .into_parts()
            .0;
        Incoming {
            head,
            body: Bytes::new(),
            secure: true,
        }
    }

    #[test]
    fn test_lookup_is_deterministic() {
        let table = table(&["/a", "/b/{id}", "/c"]);
        for _ in 0..5 {
            let (route, _) = table.lookup("/b/7").unwrap().unwrap();
            assert_eq!(route.id(), "/b/%");
        }
        assert!(table.lookup("/missing").unwrap().is_none());
    }

    #[test]
    fn test_route_overtaking_predecessor_is_promoted() {
        let table = table(&["/a", "/b"]);
        table.lookup("/a").unwrap();
        table.lookup("/b").unwrap();
        assert_eq!(table.order().unwrap(), vec!["/a", "/b"]);

        // two matches against one: /b moves ahead
        table.lookup("/b").unwrap();
        assert_eq!(table.order().unwrap(), vec!["/b", "/a"]);
    }

    #[test]
    fn test_order_is_non_increasing_under_concurrency() {
        let table = Arc::new(table(&["/a", "/b", "/c", "/d"]));
        let handles: Vec<_> = ["/a", "/b", "/c", "/d"]
            .iter()
            .enumerate()
            .map(|(i, path)| {
                let table = Arc::clone(&table);
                let path = path.to_string();
                thread::spawn(move || {
                    for _ in 0..(i + 1) * 50 {
                        table.lookup(&path).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        // promotions only compare neighbours, so let a few more rounds settle
        for _ in 0..8 {
            for path in ["/a", "/b", "/c", "/d"] {
                table.lookup(path).unwrap();
            }
        }
        let routes = table.routes.read().unwrap();
        let counts: Vec<u64> = routes.iter().map(|r| r.match_count()).collect();
        assert!(
            counts.windows(2).all(|w| w[0] >= w[1]),
            "counts not ordered: {:?}",
            counts
        );
    }

    #[test]
    fn test_duplicate_ids_rejected() {
        let routes = vec![
            RouteBuilder::new("/a", "v").id("x").build().unwrap(),
            RouteBuilder::new("/b", "v").id("x").build().unwrap(),
        ];
        assert!(matches!(
            RouteTable::new(routes),
            Err(RouteConfigError::DuplicateRouteId(_))
        ));
    }

    #[test]
    fn test_find_route_binds_wrapper() {
        let controller = Controller::new()
            .on(Method::GET, ControllerMethod::new("edit", |_| Ok(None)))
            .on(Method::POST, ControllerMethod::new("save", |_| Ok(None)));
        let route = RouteBuilder::new("/users/{id:[0-9]+}/edit", "users/edit")
            .controller(controller)
            .build()
            .unwrap();
        let table = RouteTable::new(vec![route]).unwrap();
        let wrappers = SyncPool::shared(4, RequestWrapper::new);
        let access = AccessPolicy::default();

        let wrapper = table
            .find_route(&wrappers, &access, incoming(Method::GET, "/users/42/edit"))
            .unwrap()
            .unwrap();
        assert_eq!(wrapper.param("id"), Some("42"));
        assert_eq!(wrapper.handler().map(|h| h.name()), Some("edit"));
        assert!(!wrapper.auth_required());
        drop(wrapper);

        let err = table
            .find_route(&wrappers, &access, incoming(Method::PUT, "/users/42/edit"))
            .unwrap_err();
        assert_eq!(err.status(), StatusCode::METHOD_NOT_ALLOWED);

        assert!(table
            .find_route(&wrappers, &access, incoming(Method::GET, "/users/x/edit"))
            .unwrap()
            .is_none());
        assert_eq!(wrappers.stats().unwrap().outstanding(), 0);
    }

    #[test]
    fn test_routes_without_controller_accept_get_only() {
        let table = table(&["/about"]);
        let wrappers = SyncPool::shared(1, RequestWrapper::new);
        let access = AccessPolicy::default();
        assert!(table
            .find_route(&wrappers, &access, incoming(Method::HEAD, "/about"))
            .unwrap()
            .is_some());
        let err = table
            .find_route(&wrappers, &access, incoming(Method::DELETE, "/about"))
            .unwrap_err();
        assert_eq!(err.status(), StatusCode::METHOD_NOT_ALLOWED);
    }

    #[test]
    fn test_access_policy_modes() {
        let open = AccessPolicy::new(None, None).unwrap();
        assert!(!open.requires_authentication("/admin"));

        let public_only = AccessPolicy::new(Some("^/(login|static/)"), None).unwrap();
        assert!(public_only.requires_authentication("/admin"));
        assert!(!public_only.requires_authentication("/static/app.css"));

        let protected_only = AccessPolicy::new(None, Some("^/admin")).unwrap();
        assert!(protected_only.requires_authentication("/admin/users"));
        assert!(!protected_only.requires_authentication("/"));

        let both = AccessPolicy::new(Some("^/admin/help"), Some("^/admin")).unwrap();
        assert!(both.requires_authentication("/admin"));
        assert!(!both.requires_authentication("/admin/help"));

        assert!(open.route_requires_authentication("/", SecurityMode::ForceAuthenticated));
        assert!(AccessPolicy::new(Some("("), None).is_err());
    }

    #[test]
    fn test_uri_for_checks_arity() {
        let table = table(&["/users/{id}"]);
        let mut out = String::new();
        table.uri_for("/users/%", &["a/b"], &mut out).unwrap();
        assert_eq!(out, "/users/a%2Fb");

        let err = table.uri_for("/users/%", &[], &mut String::new()).unwrap_err();
        assert!(matches!(err, RouteConfigError::ArgumentCount { expected: 1, .. }));
        assert!(table.uri_for("nope", &[], &mut String::new()).is_err());
    }
}
