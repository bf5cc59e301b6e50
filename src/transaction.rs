//! Business-logic execution inside a persistence transaction.
//!
//! The participants of a request run in a fixed order:
//!
//! 1. the route's pre-route script
//! 2. the controller method, if user input is valid
//! 3. the view script and the controller's view hook, unless the outcome
//!    is a redirect
//!
//! A session is opened only when one of them needs persistence. Any
//! failure before commit rolls back; pending cache evictions are drained
//! only after a successful commit. The session is closed on every path.

use std::sync::Arc;
use std::time::Duration;

use hyper::StatusCode;

use crate::app::{
    Application, ControllerMethod, Invocation, PersistenceUnit, ScriptContext, Session, ViewHook,
};
use crate::error::{RouterError, RouterResult};
use crate::phase::CancelToken;
use crate::request::{Outcome, RequestWrapper};
use crate::route::Route;

/// A session closed when the guard goes out of scope.
struct SessionGuard {
    session: Box<dyn Session>,
    open: bool,
}

impl SessionGuard {
    fn open(unit: &dyn PersistenceUnit) -> RouterResult<Self> {
        Ok(Self {
            session: unit.open()?,
            open: false,
        })
    }

    fn begin(&mut self) -> RouterResult<()> {
        self.session.begin()?;
        self.open = true;
        Ok(())
    }

    fn commit(&mut self) -> RouterResult<()> {
        self.open = false;
        self.session.commit()
    }

    fn rollback(&mut self) {
        if !self.open {
            return;
        }
        self.open = false;
        if let Err(err) = self.session.rollback() {
            log::error!("rollback failed: {}", err);
        }
    }

    fn session(&mut self) -> &mut (dyn Session + 'static) {
        self.session.as_mut()
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.rollback();
        self.session.close();
    }
}

/// Runs scripts and controllers for a matched request.
#[derive(Debug, Default, Clone, Copy)]
pub struct TransactionExecutor;

impl TransactionExecutor {
    /// Binds user input and decides whether the transaction phase is needed.
    ///
    /// Returns `false` when there is nothing to run off-thread; the view is
    /// then rendered directly, with `400` if input failed validation.
    pub fn prepare(app: &Application, request: &mut RequestWrapper) -> RouterResult<bool> {
        let route = match request.route() {
            Some(route) => Arc::clone(route),
            None => return Err(RouterError::application("request has no matched route")),
        };
        let handler = request.handler().cloned();
        request.set_default_locale(&app.settings.default_locale);
        app.flash.restore(request)?;

        if let Some(binder) = handler.as_ref().and_then(|h| h.binder_ref()) {
            binder.bind(request)?;
        }
        if !request.is_valid() {
            log::debug!(
                "{} validation errors on {}",
                request.errors().len(),
                request.path()
            );
            request.set_outcome(Outcome::View(StatusCode::BAD_REQUEST));
        }

        let has_view_hook = route
            .controller()
            .map_or(false, |c| c.view_hook_ref().is_some());
        let needs_async = route.script().is_some()
            || route.view_script().is_some()
            || has_view_hook
            || (handler.is_some() && request.is_valid());

        Ok(needs_async)
    }

    /// Runs every participant of the request. Called on a worker thread.
    ///
    /// # Errors
    /// Returns the first participant failure after rolling back; a bad
    /// request failure also marks the outcome as `400`. A failure after
    /// commit is returned without undoing the commit.
    pub fn execute(
        app: &Application,
        request: &mut RequestWrapper,
        cancel: &CancelToken,
        deadline: Duration,
    ) -> RouterResult<()> {
        let route = match request.route() {
            Some(route) => Arc::clone(route),
            None => return Err(RouterError::application("request has no matched route")),
        };
        let handler = request.handler().cloned();
        let controller = route.controller().cloned();
        let view_hook = controller.as_deref().and_then(|c| c.view_hook_ref());

        let mut guard = if needs_persistence(&route, handler.as_deref(), view_hook) {
            let mut guard = SessionGuard::open(app.persistence.as_ref())?;
            guard.begin()?;
            Some(guard)
        } else {
            None
        };

        let result = run_participants(
            app,
            request,
            &route,
            handler.as_deref(),
            view_hook,
            guard.as_mut().map(SessionGuard::session),
            cancel,
            deadline,
        );

        if let Err(err) = result {
            if let Some(guard) = guard.as_mut() {
                log::error!("rolling back {}: {}", request.path(), err);
                guard.rollback();
            }
            if err.is_bad_request() {
                request.set_outcome(Outcome::View(StatusCode::BAD_REQUEST));
            }
            let discarded = request.take_evictions();
            if !discarded.is_empty() {
                log::debug!("discarding cache evictions of failed transaction");
            }
            return Err(err);
        }

        if let Some(guard) = guard.as_mut() {
            if let Err(err) = guard.commit() {
                log::error!("commit of {} failed: {}", request.path(), err);
                request.take_evictions();
                return Err(err);
            }
        }
        drop(guard);

        let evictions = request.take_evictions();
        if !evictions.is_empty() {
            if let Err(err) = app.auth.evict(&evictions) {
                log::error!("failure after commit of {}: {}", request.path(), err);
                return Err(err);
            }
        }
        Ok(())
    }
}

fn needs_persistence(
    route: &Route,
    handler: Option<&ControllerMethod>,
    view_hook: Option<&ViewHook>,
) -> bool {
    route.script().map_or(false, |s| s.needs_persistence())
        || route.view_script().map_or(false, |s| s.needs_persistence())
        || handler.map_or(false, ControllerMethod::needs_persistence)
        || view_hook.map_or(false, ViewHook::needs_persistence)
}

#[allow(clippy::too_many_arguments)]
fn run_participants(
    app: &Application,
    request: &mut RequestWrapper,
    route: &Route,
    handler: Option<&ControllerMethod>,
    view_hook: Option<&ViewHook>,
    mut session: Option<&mut (dyn Session + 'static)>,
    cancel: &CancelToken,
    deadline: Duration,
) -> RouterResult<()> {
    if let Some(script) = route.script() {
        script.run(&mut ScriptContext {
            request: &mut *request,
            session: session.as_deref_mut(),
        })?;
        cancel.check(deadline)?;
    }

    if let Some(handler) = handler.filter(|_| request.is_valid()) {
        let mut args = app.pools.args.checkout()?;
        app.resolvers
            .resolve_into(handler.params(), request, &mut args)?;

        let target = handler.invoke(&mut Invocation {
            args: &args,
            request: &mut *request,
            session: session.as_deref_mut(),
        })?;
        drop(args);

        match target {
            Some(target) => request.set_outcome(Outcome::Redirect(target)),
            None if handler.redirects_on_success() => {
                log::debug!("{} signalled failure on {}", handler.name(), request.path());
                request.set_outcome(Outcome::View(StatusCode::BAD_REQUEST));
            }
            None => {}
        }
        cancel.check(deadline)?;
    }

    if let Outcome::View(_) = request.outcome() {
        if let Some(script) = route.view_script() {
            script.run(&mut ScriptContext {
                request: &mut *request,
                session: session.as_deref_mut(),
            })?;
        }
        if let Some(hook) = view_hook {
            hook.run(&mut ScriptContext {
                request: &mut *request,
                session: session.as_deref_mut(),
            })?;
        }
    }

    cancel.check(deadline)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::{Controller, ControllerMethod, Transactional};
    use crate::error::ResourceError;
    use crate::route::RouteBuilder;
    use crate::table::Incoming;
    use crate::testing::{
        config, incoming, EchoRenderer, FixedAuth, Journal, RecordingPersistence, RecordingSession,
    };
    use hyper::Method;

    fn app(route: RouteBuilder, journal: &Journal) -> Application {
        app_with(route, journal, RecordingPersistence::new(journal.clone()))
    }

    fn app_with(
        route: RouteBuilder,
        journal: &Journal,
        persistence: RecordingPersistence,
    ) -> Application {
        Application::builder(EchoRenderer)
            .persistence(persistence)
            .auth(FixedAuth::new(None, journal.clone()))
            .route(route)
            .build(&config())
            .unwrap()
    }

    fn wrapper(app: &Application, incoming: Incoming) -> crate::pool::Pooled<RequestWrapper> {
        app.routes
            .find_route(&app.pools.wrappers, &app.access, incoming)
            .unwrap()
            .unwrap()
    }

    fn run(app: &Application, request: &mut RequestWrapper) -> RouterResult<()> {
        TransactionExecutor::execute(app, request, &CancelToken::new(), Duration::from_secs(1))
    }

    #[test]
    fn test_commit_then_evict() {
        let journal = Journal::default();
        let controller = Controller::new().on(
            Method::POST,
            ControllerMethod::new("save", |inv| {
                inv.session::<RecordingSession>().unwrap().write("user:7");
                inv.request.evictions_mut().evict("7");
                Ok(Some("/done".to_owned()))
            })
            .transactional(),
        );
        let app = app(RouteBuilder::new("/users", "users").controller(controller), &journal);
        let mut request = wrapper(&app, incoming(Method::POST, "/users", true));

        assert!(TransactionExecutor::prepare(&app, &mut request).unwrap());
        run(&app, &mut request).unwrap();

        assert_eq!(request.outcome(), &Outcome::Redirect("/done".into()));
        assert_eq!(
            journal.entries(),
            ["open", "begin", "write:user:7", "commit", "close", "evict:7"]
        );
    }

    #[test]
    fn test_failure_rolls_back_and_skips_evictions() {
        let journal = Journal::default();
        let controller = Controller::new().on(
            Method::POST,
            ControllerMethod::new("save", |inv| {
                inv.session::<RecordingSession>().unwrap().write("user:7");
                inv.request.evictions_mut().evict_all();
                Err(RouterError::application("constraint violated"))
            })
            .transactional(),
        );
        let app = app(RouteBuilder::new("/users", "users").controller(controller), &journal);
        let mut request = wrapper(&app, incoming(Method::POST, "/users", true));

        TransactionExecutor::prepare(&app, &mut request).unwrap();
        let err = run(&app, &mut request).unwrap_err();

        assert_eq!(err.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(request.evictions().is_empty());
        assert_eq!(
            journal.entries(),
            ["open", "begin", "write:user:7", "rollback", "close"]
        );
    }

    #[test]
    fn test_failed_commit_skips_evictions() {
        let journal = Journal::default();
        let controller = Controller::new().on(
            Method::POST,
            ControllerMethod::new("save", |inv| {
                inv.session::<RecordingSession>().unwrap().write("user:7");
                inv.request.evictions_mut().evict("7");
                Ok(Some("/done".to_owned()))
            })
            .transactional(),
        );
        let persistence = RecordingPersistence::new(journal.clone()).failing_commit();
        let app = app_with(
            RouteBuilder::new("/users", "users").controller(controller),
            &journal,
            persistence,
        );
        let mut request = wrapper(&app, incoming(Method::POST, "/users", true));

        TransactionExecutor::prepare(&app, &mut request).unwrap();
        let err = run(&app, &mut request).unwrap_err();

        assert_eq!(err.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(request.evictions().is_empty());
        assert_eq!(
            journal.entries(),
            ["open", "begin", "write:user:7", "commit", "close"]
        );
    }

    #[test]
    fn test_view_script_failure_rolls_back() {
        let journal = Journal::default();
        let route = RouteBuilder::new("/report", "report").view_script(Transactional(
            |ctx: &mut ScriptContext<'_>| -> RouterResult<()> {
                ctx.request.evictions_mut().evict_all();
                Err(RouterError::application("template data unavailable"))
            },
        ));
        let app = app(route, &journal);
        let mut request = wrapper(&app, incoming(Method::GET, "/report", true));

        assert!(TransactionExecutor::prepare(&app, &mut request).unwrap());
        let err = run(&app, &mut request).unwrap_err();

        assert_eq!(err.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(request.evictions().is_empty());
        assert_eq!(journal.entries(), ["open", "begin", "rollback", "close"]);
    }

    #[test]
    fn test_view_hook_failure_rolls_back() {
        let journal = Journal::default();
        let controller = Controller::new()
            .on(
                Method::GET,
                ControllerMethod::new("show", |inv| {
                    inv.session::<RecordingSession>().unwrap().write("visit");
                    Ok(None)
                })
                .transactional(),
            )
            .view_hook(true, |_| Err(RouterError::application("menu lookup failed")));
        let app = app(RouteBuilder::new("/home", "home").controller(controller), &journal);
        let mut request = wrapper(&app, incoming(Method::GET, "/home", true));

        TransactionExecutor::prepare(&app, &mut request).unwrap();
        let err = run(&app, &mut request).unwrap_err();

        assert_eq!(err.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(
            journal.entries(),
            ["open", "begin", "write:visit", "rollback", "close"]
        );
    }

    #[test]
    fn test_script_failure_skips_controller() {
        let journal = Journal::default();
        let log = journal.clone();
        let controller = Controller::new().on(
            Method::GET,
            ControllerMethod::new("show", move |_| {
                log.push("controller");
                Ok(None)
            }),
        );
        let route = RouteBuilder::new("/x", "x")
            .script(Transactional(|_: &mut ScriptContext<'_>| -> RouterResult<()> {
                Err(ResourceError::bad_request("rejected by script").into())
            }))
            .controller(controller);
        let app = app(route, &journal);
        let mut request = wrapper(&app, incoming(Method::GET, "/x", true));

        TransactionExecutor::prepare(&app, &mut request).unwrap();
        let err = run(&app, &mut request).unwrap_err();

        assert!(err.is_bad_request());
        assert_eq!(request.outcome(), &Outcome::View(StatusCode::BAD_REQUEST));
        assert_eq!(journal.entries(), ["open", "begin", "rollback", "close"]);
    }

    #[test]
    fn test_redirect_on_success_without_target_is_bad_request() {
        let journal = Journal::default();
        let controller = Controller::new().on(
            Method::POST,
            ControllerMethod::new("save", |_| Ok(None)).redirect_on_success(),
        );
        let app = app(RouteBuilder::new("/users", "users").controller(controller), &journal);
        let mut request = wrapper(&app, incoming(Method::POST, "/users", true));

        TransactionExecutor::prepare(&app, &mut request).unwrap();
        run(&app, &mut request).unwrap();

        assert!(request.is_valid());
        assert_eq!(request.outcome(), &Outcome::View(StatusCode::BAD_REQUEST));
        // nothing needed persistence
        assert!(journal.entries().is_empty());
    }

    #[test]
    fn test_invalid_input_skips_controller_but_runs_view_logic() {
        let journal = Journal::default();
        let log = journal.clone();
        let hook_log = journal.clone();
        let controller = Controller::new()
            .on(
                Method::POST,
                ControllerMethod::new("save", move |_| {
                    log.push("controller");
                    Ok(Some("/done".into()))
                })
                .binder(|request: &mut RequestWrapper| -> RouterResult<()> {
                    if request.param("name").is_none() {
                        request.errors_mut().reject("name", "required");
                    }
                    Ok(())
                }),
            )
            .view_hook(false, move |_| {
                hook_log.push("view-hook");
                Ok(())
            });
        let app = app(RouteBuilder::new("/users", "users").controller(controller), &journal);
        let mut request = wrapper(&app, incoming(Method::POST, "/users", true));

        assert!(TransactionExecutor::prepare(&app, &mut request).unwrap());
        assert_eq!(request.outcome(), &Outcome::View(StatusCode::BAD_REQUEST));
        run(&app, &mut request).unwrap();

        assert_eq!(journal.entries(), ["view-hook"]);
    }

    #[test]
    fn test_nothing_to_run_is_synchronous() {
        let journal = Journal::default();
        let app = app(RouteBuilder::new("/about", "about"), &journal);
        let mut request = wrapper(&app, incoming(Method::GET, "/about", true));
        assert!(!TransactionExecutor::prepare(&app, &mut request).unwrap());
    }

    #[test]
    fn test_cancelled_work_rolls_back() {
        let journal = Journal::default();
        let controller = Controller::new().on(
            Method::POST,
            ControllerMethod::new("save", |_| Ok(Some("/done".into()))).transactional(),
        );
        let app = app(RouteBuilder::new("/users", "users").controller(controller), &journal);
        let mut request = wrapper(&app, incoming(Method::POST, "/users", true));

        let cancel = CancelToken::new();
        cancel.cancel();
        let err = TransactionExecutor::execute(&app, &mut request, &cancel, Duration::from_secs(1))
            .unwrap_err();

        assert!(matches!(err, RouterError::Timeout(_)));
        assert_eq!(journal.entries(), ["open", "begin", "rollback", "close"]);
    }
}
