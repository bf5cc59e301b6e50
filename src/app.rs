//! Application wiring: controllers, scripts and the collaborators the router
//! depends on (persistence, authentication, rendering, input binding).

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use hyper::{Method, StatusCode};

use crate::binding::{Arg, ParamKind, ResolverRegistry};
use crate::config::RouterConfig;
use crate::error::{RouteConfigError, RouterError, RouterResult};
use crate::flash::CookieFlash;
use crate::http::Response;
use crate::phase::PhaseTask;
use crate::pool::{Pooled, SyncPool};
use crate::request::{EvictionSet, Principal, RequestWrapper};
use crate::route::{RouteBuilder, SecurityMode, UriPattern};
use crate::table::{AccessPolicy, RouteTable};

/// A persistence session with at most one open transaction.
pub trait Session: Send {
    fn begin(&mut self) -> RouterResult<()>;
    fn commit(&mut self) -> RouterResult<()>;
    fn rollback(&mut self) -> RouterResult<()>;
    /// Releases the session. Called exactly once, on every exit path.
    fn close(&mut self);
    /// Access to the concrete session for application code.
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

/// Opens persistence sessions.
pub trait PersistenceUnit: Send + Sync {
    fn open(&self) -> RouterResult<Box<dyn Session>>;
}

/// Placeholder for applications that never touch persistence.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoPersistence;

impl PersistenceUnit for NoPersistence {
    fn open(&self) -> RouterResult<Box<dyn Session>> {
        Err(RouterError::Persistence(
            "no persistence unit configured".to_owned(),
        ))
    }
}

/// Resolves principals and maintains the authenticated-principal cache.
///
/// Called from worker threads concurrently; implementations must be
/// thread-safe.
pub trait AuthService: Send + Sync {
    /// Resolves the principal behind a transport-secured request.
    fn resolve(&self, request: &RequestWrapper) -> RouterResult<Option<Principal>>;

    /// Applies cache evictions collected during a committed transaction.
    fn evict(&self, evictions: &EvictionSet) -> RouterResult<()>;
}

/// An authentication service that never recognises anyone.
#[derive(Debug, Default, Clone, Copy)]
pub struct AnonymousAuth;

impl AuthService for AnonymousAuth {
    fn resolve(&self, _request: &RequestWrapper) -> RouterResult<Option<Principal>> {
        Ok(None)
    }

    fn evict(&self, _evictions: &EvictionSet) -> RouterResult<()> {
        Ok(())
    }
}

/// Carries flash attributes from a redirecting request to the next one.
pub trait FlashStore: Send + Sync {
    /// Loads the attributes a previous request staged for this one.
    fn restore(&self, request: &mut RequestWrapper) -> RouterResult<()>;

    /// Hands staged attributes on after a redirect and discards the ones
    /// this request consumed. Called only once the request has committed.
    fn save(&self, request: &RequestWrapper, response: &mut Response) -> RouterResult<()>;
}

/// Renders views by id.
pub trait ViewRenderer: Send + Sync {
    /// `resumed` is true when the request went through the transaction
    /// phase before rendering.
    fn render(
        &self,
        view: &str,
        request: &RequestWrapper,
        status: StatusCode,
        resumed: bool,
    ) -> RouterResult<Response>;
}

/// Binds and validates user input, recording failures on the request.
pub trait Binder: Send + Sync {
    fn bind(&self, request: &mut RequestWrapper) -> RouterResult<()>;
}

impl<F> Binder for F
where
    F: Fn(&mut RequestWrapper) -> RouterResult<()> + Send + Sync,
{
    fn bind(&self, request: &mut RequestWrapper) -> RouterResult<()> {
        self(request)
    }
}

/// What scripts and view hooks see while they run.
pub struct ScriptContext<'a> {
    pub request: &'a mut RequestWrapper,
    pub session: Option<&'a mut (dyn Session + 'static)>,
}

/// A pre-route or view script.
pub trait Script: Send + Sync {
    /// Whether the script needs an open transaction.
    fn needs_persistence(&self) -> bool {
        false
    }

    fn run(&self, ctx: &mut ScriptContext<'_>) -> RouterResult<()>;
}

impl<F> Script for F
where
    F: Fn(&mut ScriptContext<'_>) -> RouterResult<()> + Send + Sync,
{
    fn run(&self, ctx: &mut ScriptContext<'_>) -> RouterResult<()> {
        self(ctx)
    }
}

/// A script that runs inside the request transaction.
pub struct Transactional<S>(pub S);

impl<S: Script> Script for Transactional<S> {
    fn needs_persistence(&self) -> bool {
        true
    }

    fn run(&self, ctx: &mut ScriptContext<'_>) -> RouterResult<()> {
        self.0.run(ctx)
    }
}

/// What a controller method sees while it runs.
pub struct Invocation<'a> {
    pub args: &'a [Arg],
    pub request: &'a mut RequestWrapper,
    pub session: Option<&'a mut (dyn Session + 'static)>,
}

impl Invocation<'_> {
    /// The session downcast to the application's concrete type.
    pub fn session<S: 'static>(&mut self) -> Option<&mut S> {
        self.session
            .as_deref_mut()
            .and_then(|s| s.as_any_mut().downcast_mut::<S>())
    }

    pub fn arg(&self, index: usize) -> Option<&Arg> {
        self.args.get(index)
    }
}

/// Returns `Some(target)` to redirect, `None` to render the view.
pub type Handler = dyn Fn(&mut Invocation<'_>) -> RouterResult<Option<String>> + Send + Sync;

/// One verb-specific entry point of a controller.
pub struct ControllerMethod {
    name: String,
    params: Vec<ParamKind>,
    redirect_on_success: bool,
    needs_persistence: bool,
    binder: Option<Arc<dyn Binder>>,
    handler: Arc<Handler>,
}

impl ControllerMethod {
    pub fn new<F>(name: impl Into<String>, handler: F) -> Self
    where
        F: Fn(&mut Invocation<'_>) -> RouterResult<Option<String>> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            params: Vec::new(),
            redirect_on_success: false,
            needs_persistence: false,
            binder: None,
            handler: Arc::new(handler),
        }
    }

    pub fn param(mut self, kind: ParamKind) -> Self {
        self.params.push(kind);
        self
    }

    /// A successful call is expected to redirect; returning `None` then
    /// means the input was rejected.
    pub fn redirect_on_success(mut self) -> Self {
        self.redirect_on_success = true;
        self
    }

    pub fn transactional(mut self) -> Self {
        self.needs_persistence = true;
        self
    }

    pub fn binder(mut self, binder: impl Binder + 'static) -> Self {
        self.binder = Some(Arc::new(binder));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn params(&self) -> &[ParamKind] {
        &self.params
    }

    pub fn redirects_on_success(&self) -> bool {
        self.redirect_on_success
    }

    pub fn needs_persistence(&self) -> bool {
        self.needs_persistence
    }

    pub(crate) fn binder_ref(&self) -> Option<&Arc<dyn Binder>> {
        self.binder.as_ref()
    }

    pub(crate) fn invoke(&self, invocation: &mut Invocation<'_>) -> RouterResult<Option<String>> {
        (self.handler)(invocation)
    }
}

impl fmt::Debug for ControllerMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ControllerMethod")
            .field("name", &self.name)
            .field("params", &self.params)
            .field("redirect_on_success", &self.redirect_on_success)
            .field("needs_persistence", &self.needs_persistence)
            .finish()
    }
}

/// Hook run before a view renders.
pub struct ViewHook {
    needs_persistence: bool,
    hook: Arc<dyn Fn(&mut ScriptContext<'_>) -> RouterResult<()> + Send + Sync>,
}

impl ViewHook {
    pub fn needs_persistence(&self) -> bool {
        self.needs_persistence
    }

    pub(crate) fn run(&self, ctx: &mut ScriptContext<'_>) -> RouterResult<()> {
        (self.hook)(ctx)
    }
}

/// Handlers for the verbs a route accepts, plus an optional view hook.
#[derive(Default)]
pub struct Controller {
    methods: HashMap<Method, Arc<ControllerMethod>>,
    view_hook: Option<ViewHook>,
}

impl Controller {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on(mut self, verb: Method, method: ControllerMethod) -> Self {
        self.methods.insert(verb, Arc::new(method));
        self
    }

    pub fn view_hook<F>(mut self, needs_persistence: bool, hook: F) -> Self
    where
        F: Fn(&mut ScriptContext<'_>) -> RouterResult<()> + Send + Sync + 'static,
    {
        self.view_hook = Some(ViewHook {
            needs_persistence,
            hook: Arc::new(hook),
        });
        self
    }

    /// The handler for `verb`. `HEAD` falls back to the `GET` handler.
    pub fn method_for(&self, verb: &Method) -> Option<&Arc<ControllerMethod>> {
        self.methods
            .get(verb)
            .or_else(|| (verb == Method::HEAD).then(|| self.methods.get(&Method::GET)).flatten())
    }

    pub fn view_hook_ref(&self) -> Option<&ViewHook> {
        self.view_hook.as_ref()
    }

    pub(crate) fn methods(&self) -> impl Iterator<Item = &Arc<ControllerMethod>> {
        self.methods.values()
    }
}

impl fmt::Debug for Controller {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Controller")
            .field("methods", &self.methods.keys().collect::<Vec<_>>())
            .field("view_hook", &self.view_hook.is_some())
            .finish()
    }
}

/// One pool per hot-path object kind, built once and shared by reference.
#[derive(Clone)]
pub struct Pools {
    pub wrappers: Arc<SyncPool<RequestWrapper>>,
    pub phases: Arc<SyncPool<PhaseTask>>,
    pub buffers: Arc<SyncPool<String>>,
    pub args: Arc<SyncPool<Vec<Arg>>>,
}

impl Pools {
    pub fn new(capacity: usize) -> Self {
        Self {
            wrappers: SyncPool::shared(capacity, RequestWrapper::new),
            phases: SyncPool::shared(capacity, PhaseTask::new),
            buffers: SyncPool::shared(capacity, || String::with_capacity(128)),
            args: SyncPool::shared(capacity, || Vec::with_capacity(8)),
        }
    }

    pub fn buffer(&self) -> RouterResult<Pooled<String>> {
        Ok(self.buffers.checkout()?)
    }
}

/// Router-wide settings extracted from the configuration.
#[derive(Debug, Clone)]
pub struct Settings {
    pub login_page: Option<String>,
    pub tls_port: u16,
    pub default_locale: String,
}

/// Everything the router needs to serve requests.
pub struct Application {
    pub(crate) routes: RouteTable,
    pub(crate) access: AccessPolicy,
    pub(crate) persistence: Arc<dyn PersistenceUnit>,
    pub(crate) auth: Arc<dyn AuthService>,
    pub(crate) renderer: Arc<dyn ViewRenderer>,
    pub(crate) flash: Arc<dyn FlashStore>,
    pub(crate) resolvers: ResolverRegistry,
    pub(crate) pools: Pools,
    pub(crate) settings: Settings,
}

impl Application {
    pub fn builder(renderer: impl ViewRenderer + 'static) -> ApplicationBuilder {
        ApplicationBuilder::new(renderer)
    }

    pub fn routes(&self) -> &RouteTable {
        &self.routes
    }

    pub fn pools(&self) -> &Pools {
        &self.pools
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Builds a request-scoped URI for the route `id`.
    pub fn uri_for(&self, id: &str, args: &[&str]) -> Result<String, RouteConfigError> {
        let mut out = String::new();
        self.routes.uri_for(id, args, &mut out)?;
        Ok(out)
    }
}

/// Compiles the route configuration and collaborators into an
/// [`Application`].
pub struct ApplicationBuilder {
    routes: Vec<RouteBuilder>,
    persistence: Arc<dyn PersistenceUnit>,
    auth: Arc<dyn AuthService>,
    renderer: Arc<dyn ViewRenderer>,
    flash: Arc<dyn FlashStore>,
    resolvers: ResolverRegistry,
}

impl ApplicationBuilder {
    pub fn new(renderer: impl ViewRenderer + 'static) -> Self {
        Self {
            routes: Vec::new(),
            persistence: Arc::new(NoPersistence),
            auth: Arc::new(AnonymousAuth),
            renderer: Arc::new(renderer),
            flash: Arc::new(CookieFlash::default()),
            resolvers: ResolverRegistry::default(),
        }
    }

    pub fn route(mut self, route: RouteBuilder) -> Self {
        self.routes.push(route);
        self
    }

    pub fn persistence(mut self, unit: impl PersistenceUnit + 'static) -> Self {
        self.persistence = Arc::new(unit);
        self
    }

    pub fn auth(mut self, auth: impl AuthService + 'static) -> Self {
        self.auth = Arc::new(auth);
        self
    }

    pub fn auth_shared(mut self, auth: Arc<dyn AuthService>) -> Self {
        self.auth = auth;
        self
    }

    pub fn flash(mut self, store: impl FlashStore + 'static) -> Self {
        self.flash = Arc::new(store);
        self
    }

    pub fn resolvers(mut self, resolvers: ResolverRegistry) -> Self {
        self.resolvers = resolvers;
        self
    }

    /// Validates and compiles every route.
    ///
    /// # Errors
    /// Fails on malformed templates, duplicate identifiers, controller
    /// parameters without a resolver, or a login page that would itself
    /// require a login.
    pub fn build(mut self, config: &RouterConfig) -> Result<Application, RouteConfigError> {
        let access = AccessPolicy::new(
            config.public_paths.as_deref(),
            config.protected_paths.as_deref(),
        )?;

        if let Some(login_page) = &config.login_page {
            secure_login_page(&mut self.routes, login_page, &access)?;
        }

        let mut routes = Vec::with_capacity(self.routes.len());
        for builder in self.routes {
            if let Some(controller) = builder.controller_ref() {
                for method in controller.methods() {
                    let unresolvable = method.params().iter().find(|k| !self.resolvers.supports(k));
                    if let Some(kind) = unresolvable {
                        return Err(RouteConfigError::UnresolvableParameter {
                            route: builder.template().to_owned(),
                            param: kind.to_string(),
                        });
                    }
                }
            }
            routes.push(builder.build()?);
        }

        log::info!("compiled {} routes", routes.len());

        Ok(Application {
            routes: RouteTable::new(routes)?,
            access,
            persistence: self.persistence,
            auth: self.auth,
            renderer: self.renderer,
            flash: self.flash,
            resolvers: self.resolvers,
            pools: Pools::new(config.pool_capacity),
            settings: Settings {
                login_page: config.login_page.clone(),
                tls_port: config.tls_port,
                default_locale: config.default_locale.clone(),
            },
        })
    }
}

/// Forces TLS on the route serving the login page and rejects login pages
/// that require authentication.
fn secure_login_page(
    routes: &mut [RouteBuilder],
    login_page: &str,
    access: &AccessPolicy,
) -> Result<(), RouteConfigError> {
    let path = login_page.split('?').next().unwrap_or(login_page);
    for builder in routes.iter_mut() {
        if !UriPattern::compile(builder.template())?.is_match(path) {
            continue;
        }
        let requires_login = builder.security_mode() == SecurityMode::ForceAuthenticated
            || access.requires_authentication(path);
        if requires_login {
            return Err(RouteConfigError::LoginPageRequiresAuthentication(
                login_page.to_owned(),
            ));
        }
        if builder.security_mode() == SecurityMode::Default {
            log::debug!("forcing TLS on login page route {}", builder.template());
            builder.set_security(SecurityMode::ForceTls);
        }
    }
    Ok(())
}
