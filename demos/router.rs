//! A small application served by switchyard.
//! Demonstrates routing, placeholder parameters, login redirects and a
//! transactional counter backed by an in-memory store, whose new value is
//! shown after the redirect through a flash attribute.

use std::any::Any;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use hyper::{Method, StatusCode};
use switchyard::{
    Application, Body, CachedAuthService, Controller, ControllerMethod, ParamKind,
    PersistenceUnit, Principal, PrincipalSource, RequestWrapper, Response, ResponseBuilder,
    RouteBuilder, Router, RouterConfig, RouterError, RouterResult, SecurityMode, Server, Session,
    ViewRenderer,
};

/// Renders every view as a line of plain text.
struct TextRenderer;

impl ViewRenderer for TextRenderer {
    fn render(
        &self,
        view: &str,
        request: &RequestWrapper,
        status: StatusCode,
        _resumed: bool,
    ) -> RouterResult<Response> {
        let mut body = match request.principal() {
            Some(principal) => format!("{} (signed in as {})", view, principal.name),
            None => view.to_owned(),
        };
        for (field, message) in request.errors().fields() {
            body.push_str(&format!("\n{}: {}", field, message));
        }
        if let Some(count) = request.flash().get("count") {
            body.push_str(&format!("\ncounter is now {}", count));
        }
        ResponseBuilder::new()
            .status(status)
            .header("Content-Type", "text/plain")
            .body(Body::from(body))
            .map_err(RouterError::application)
    }
}

/// The committed counter value.
#[derive(Default)]
struct Store {
    committed: AtomicU64,
}

struct Counter {
    store: Arc<Store>,
}

impl PersistenceUnit for Counter {
    fn open(&self) -> RouterResult<Box<dyn Session>> {
        Ok(Box::new(CounterSession {
            store: Arc::clone(&self.store),
            staged: None,
        }))
    }
}

struct CounterSession {
    store: Arc<Store>,
    staged: Option<u64>,
}

impl CounterSession {
    fn increment(&mut self) -> u64 {
        let value = self.staged.unwrap_or_else(|| self.store.committed.load(Ordering::SeqCst)) + 1;
        self.staged = Some(value);
        value
    }
}

impl Session for CounterSession {
    fn begin(&mut self) -> RouterResult<()> {
        self.staged = None;
        Ok(())
    }

    fn commit(&mut self) -> RouterResult<()> {
        if let Some(value) = self.staged.take() {
            self.store.committed.store(value, Ordering::SeqCst);
        }
        Ok(())
    }

    fn rollback(&mut self) -> RouterResult<()> {
        self.staged = None;
        Ok(())
    }

    fn close(&mut self) {}

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// Bearer tokens known to the demo.
struct Tokens(Mutex<HashMap<String, Principal>>);

impl PrincipalSource for Tokens {
    fn load(&self, credentials: &str) -> RouterResult<Option<Principal>> {
        let tokens = self.0.lock().map_err(|_| RouterError::LockPoisoned)?;
        Ok(tokens.get(credentials).cloned())
    }
}

fn application(config: &RouterConfig, store: Arc<Store>) -> Application {
    let mut tokens = HashMap::new();
    tokens.insert("secret".to_owned(), Principal::new("1", "admin").with_role("admin"));

    let increment = ControllerMethod::new("increment", |inv| {
        let session = inv
            .session::<CounterSession>()
            .ok_or_else(|| RouterError::application("counter session missing"))?;
        let value = session.increment();
        inv.request.set_flash("count", value.to_string());
        Ok(Some("/counter".to_owned()))
    })
    .transactional()
    .redirect_on_success();

    let counter = Controller::new()
        .on(Method::GET, ControllerMethod::new("show", |_| Ok(None)))
        .on(Method::POST, increment);

    let hello = Controller::new().on(
        Method::GET,
        ControllerMethod::new("hello", |inv| {
            let name = inv.arg(0).and_then(|a| a.as_text()).unwrap_or("world");
            log::info!("greeting {}", name);
            Ok(None)
        })
        .param(ParamKind::Param("name".into())),
    );

    Application::builder(TextRenderer)
        .persistence(Counter { store })
        .auth(CachedAuthService::new(Tokens(Mutex::new(tokens))))
        .route(RouteBuilder::new("/", "Welcome to switchyard!"))
        .route(RouteBuilder::new("/hello/{name}", "Hello, {name}!").controller(hello))
        .route(RouteBuilder::new("/counter", "counter").controller(counter))
        .route(RouteBuilder::new("/login", "Sign in with a bearer token"))
        .route(RouteBuilder::new("/admin", "Admin area").security(SecurityMode::ForceAuthenticated))
        .build(config)
        .unwrap_or_else(|err| panic!("invalid routes: {}", err))
}

#[tokio::main]
async fn main() {
    let mut config = RouterConfig::new().expect("invalid configuration");
    if config.login_page.is_none() {
        config.login_page = Some("/login".to_owned());
    }

    let store = Arc::new(Store::default());
    let app = application(&config, Arc::clone(&store));
    let router = Router::from_config(app, &config);
    let server = Server::from_config(config).expect("cannot resolve listen address");

    println!("Server running at http://{}", server.local_addr());
    println!("Try these routes:");
    println!("  - /");
    println!("  - /hello/your-name");
    println!("  - POST /counter (increments inside a transaction)");
    println!("  - /admin with X-Forwarded-Proto: https and Authorization: Bearer secret");

    server
        .serve_with_shutdown(router, async {
            tokio::signal::ctrl_c().await.ok();
        })
        .await
        .expect("Server failed to start");

    println!("counter ended at {}", store.committed.load(Ordering::SeqCst));
}
