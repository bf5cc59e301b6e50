//! Request dispatch.
//!
//! [`Router::dispatch`] matches a route, enforces transport and login
//! policy, then drives the request through the authenticator and
//! transaction phases before rendering. The I/O task only ever awaits the
//! phase continuations; the blocking work happens on the worker pool.

use std::fmt::Write as _;
use std::sync::Arc;
use std::time::Duration;

use hyper::StatusCode;

use crate::app::Application;
use crate::config::RouterConfig;
use crate::error::{ResourceError, RouterError, RouterResult};
use crate::executor::Executor;
use crate::http::{self, Response};
use crate::phase::{CancelToken, PhaseKind, PhaseRunner};
use crate::pool::Pooled;
use crate::request::{Outcome, RequestWrapper};
use crate::route::SecurityMode;
use crate::table::Incoming;
use crate::transaction::TransactionExecutor;

#[cfg(feature = "fault-injection")]
use crate::chaos::FaultInjector;

/// Dispatches requests for one [`Application`].
#[derive(Clone)]
pub struct Router {
    app: Arc<Application>,
    phases: PhaseRunner,
}

impl Router {
    pub fn new(app: Application, executor: Executor, timeout: Duration) -> Self {
        let phases = PhaseRunner::new(executor, Arc::clone(&app.pools.phases), timeout);
        Self {
            app: Arc::new(app),
            phases,
        }
    }

    /// Builds the worker pool and phase deadline from `config`.
    pub fn from_config(app: Application, config: &RouterConfig) -> Self {
        let executor = Executor::new(Some(config.max_workers), Some(config.worker_keep_alive()));
        let router = Self::new(app, executor, config.phase_timeout());

        #[cfg(feature = "fault-injection")]
        let router = router.with_faults(FaultInjector::from_config(config));

        router
    }

    #[cfg(feature = "fault-injection")]
    pub fn with_faults(mut self, faults: FaultInjector) -> Self {
        self.phases = self.phases.with_faults(faults);
        self
    }

    pub fn application(&self) -> &Arc<Application> {
        &self.app
    }

    /// Produces the response for one request. Never fails: errors are
    /// rendered as their HTTP status.
    pub async fn dispatch(&self, incoming: Incoming) -> Response {
        match self.route(incoming).await {
            Ok(response) => response,
            Err(err) => failure(err),
        }
    }

    async fn route(&self, incoming: Incoming) -> RouterResult<Response> {
        let app = &self.app;
        let wrapper = app
            .routes
            .find_route(&app.pools.wrappers, &app.access, incoming)?
            .ok_or_else(ResourceError::not_found)?;

        let security = wrapper
            .route()
            .map_or(SecurityMode::Default, |route| route.security());
        if !wrapper.is_secure() && (wrapper.auth_required() || security != SecurityMode::Default) {
            return self.upgrade(&wrapper);
        }

        let mut wrapper = self.authenticate(wrapper).await?;

        if wrapper.auth_required() && wrapper.principal().is_none() {
            return match &app.settings.login_page {
                Some(login_page) => self.login(login_page, &wrapper),
                None => Err(ResourceError::forbidden().into()),
            };
        }

        let resumed = TransactionExecutor::prepare(app, &mut wrapper)?;
        let mut wrapper = if resumed {
            let app = Arc::clone(&self.app);
            let deadline = self.phases.timeout();
            self.phases
                .run(
                    PhaseKind::Transact,
                    wrapper,
                    move |request: &mut RequestWrapper, cancel: &CancelToken| {
                        TransactionExecutor::execute(&app, request, cancel, deadline)
                    },
                )
                .await?
        } else {
            wrapper
        };

        if let Err(err) = wrapper.take_staged_failure() {
            if !err.is_bad_request() {
                return Err(err);
            }
            log::debug!("re-rendering {} after rejected input: {}", wrapper.view_id(), err);
            wrapper.set_outcome(Outcome::View(StatusCode::BAD_REQUEST));
        }

        let mut response = match wrapper.outcome() {
            Outcome::Redirect(target) => http::see_other(target)?,
            Outcome::View(status) => {
                app.renderer
                    .render(wrapper.view_id(), &wrapper, *status, resumed)?
            }
        };
        app.flash.save(&wrapper, &mut response)?;
        Ok(response)
    }

    /// Resolves the principal on a worker. Plain requests stay anonymous.
    async fn authenticate(
        &self,
        mut wrapper: Pooled<RequestWrapper>,
    ) -> RouterResult<Pooled<RequestWrapper>> {
        if !wrapper.is_secure() {
            wrapper.set_principal(None);
            return Ok(wrapper);
        }

        let auth = Arc::clone(&self.app.auth);
        let mut wrapper = self
            .phases
            .run(
                PhaseKind::Authenticate,
                wrapper,
                move |request: &mut RequestWrapper, _: &CancelToken| {
                    let principal = match auth.resolve(request) {
                        Ok(principal) => principal,
                        Err(err) => {
                            log::warn!("treating {} as anonymous: {}", request.path(), err);
                            None
                        }
                    };
                    request.set_principal(principal);
                    Ok(())
                },
            )
            .await?;
        wrapper.take_staged_failure()?;
        Ok(wrapper)
    }

    /// `301` to the same URI over TLS.
    fn upgrade(&self, wrapper: &RequestWrapper) -> RouterResult<Response> {
        let host = wrapper
            .host()
            .ok_or_else(|| ResourceError::bad_request("cannot upgrade a request without a host"))?;

        let mut location = self.app.pools.buffer()?;
        location.push_str("https://");
        location.push_str(host);
        let port = self.app.settings.tls_port;
        if port != 443 {
            write!(location, ":{}", port).map_err(RouterError::application)?;
        }
        location.push_str(wrapper.path_and_query());

        log::debug!("upgrading {} to {}", wrapper.path(), location.as_str());
        http::moved_permanently(&location)
    }

    /// `303` to the login page carrying the original target.
    fn login(&self, login_page: &str, wrapper: &RequestWrapper) -> RouterResult<Response> {
        let mut location = self.app.pools.buffer()?;
        location.push_str(login_page);
        location.push(if login_page.contains('?') { '&' } else { '?' });
        location.push_str("uri=");
        location.push_str(&urlencoding::encode(wrapper.path_and_query()));
        http::see_other(&location)
    }
}

impl std::fmt::Debug for Router {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Router")
            .field("routes", &self.app.routes.len())
            .field("phases", &self.phases)
            .finish()
    }
}

fn failure(err: RouterError) -> Response {
    let status = err.status();
    match &err {
        RouterError::Resource(_) => log::debug!("{}", err),
        _ => log::error!("request failed: {}", err),
    }
    http::status(status)
}
