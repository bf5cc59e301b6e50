#![allow(clippy::return_self_not_must_use)]

//! # Switchyard
//!
//! A request router that runs application logic on a worker pool, inside a
//! managed transaction, without ever blocking the connection task.
//!
//! ## Features
//! - URI templates with `{name}` / `{name:regex}` placeholders
//! - Self-ordering route table: hot routes drift to the front
//! - TLS upgrade and login redirects driven by per-route security modes
//! - Two asynchronous phases per request (authenticate, transact) with
//!   per-phase deadlines
//! - One persistence transaction per request, rolled back on failure, with
//!   principal-cache evictions applied only after commit
//! - Flash attributes carried across redirects in a cookie
//! - Pooled request state, phase tasks, string buffers and argument arrays
//!
//! ## Example
//! ```no_run
//! use switchyard::{
//!     Application, Controller, ControllerMethod, ParamKind, RequestWrapper, Response,
//!     RouteBuilder, Router, RouterConfig, RouterResult, Server, ViewRenderer,
//! };
//! use hyper::{Method, StatusCode};
//!
//! struct Text;
//!
//! impl ViewRenderer for Text {
//!     fn render(
//!         &self,
//!         view: &str,
//!         _request: &RequestWrapper,
//!         status: StatusCode,
//!         _resumed: bool,
//!     ) -> RouterResult<Response> {
//!         let mut response = Response::new(view.to_owned().into());
//!         *response.status_mut() = status;
//!         Ok(response)
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> std::io::Result<()> {
//!     let config = RouterConfig::default();
//!     let hello = Controller::new().on(
//!         Method::GET,
//!         ControllerMethod::new("hello", |_| Ok(None)).param(ParamKind::Param("name".into())),
//!     );
//!     let app = Application::builder(Text)
//!         .route(RouteBuilder::new("/hello/{name}", "hello-{name}").controller(hello))
//!         .build(&config)
//!         .expect("invalid routes");
//!
//!     let router = Router::from_config(app, &config);
//!     Server::from_config(config)?.serve(router).await
//! }
//! ```
//!
//! ## Architecture
//! - `RouteTable`: ordered routes behind a reader/writer lock
//! - `RequestWrapper`: pooled per-request state carried across phases
//! - `PhaseRunner`: submits phase work to the `Executor` and awaits it
//! - `TransactionExecutor`: scripts, controller and view hooks in one transaction
//! - `Server`: hosts a `Router` on hyper
//!
//! ## Configuration
//! Settings are read by [`RouterConfig::new`] from:
//! - Environment variables (prefixed with `SWITCHYARD_`)
//! - Configuration file (`config.toml`)
//!
//! ## Features
//! - `http2`: Enables HTTP/2 support (enabled by default)
//! - `fault-injection`: Random phase delays and failures for testing

pub use crate::app::{
    AnonymousAuth, Application, ApplicationBuilder, AuthService, Binder, Controller,
    ControllerMethod, FlashStore, Invocation, NoPersistence, PersistenceUnit, Pools, Script,
    ScriptContext, Session, Settings, Transactional, ViewHook, ViewRenderer,
};
pub use crate::auth::{bearer_token, CachedAuthService, PrincipalSource};
pub use crate::binding::{Arg, ParamKind, ParamTag, Resolver, ResolverRegistry};
pub use crate::config::RouterConfig;
pub use crate::error::{
    ExecutorError, PoolError, PoolResult, ResourceError, RouteConfigError, RouterError,
    RouterResult,
};
pub use crate::executor::Executor;
pub use crate::flash::{CookieFlash, FLASH_COOKIE};
pub use crate::http::{Body, Bytes, Request, Response, ResponseBuilder};
pub use crate::phase::{CancelToken, PhaseKind, PhaseRunner, PhaseState, PhaseTask, PhaseWork};
pub use crate::pool::{Lease, ObjectPool, PoolStats, Pooled, Recyclable, SyncPool};
pub use crate::request::{
    EvictionSet, Outcome, Principal, PrincipalState, RequestWrapper, ValidationErrors,
};
pub use crate::route::{Route, RouteBuilder, SecurityMode, UriPattern};
pub use crate::router::Router;
pub use crate::server::Server;
pub use crate::table::{AccessPolicy, Incoming, RouteTable};
pub use crate::transaction::TransactionExecutor;

#[cfg(feature = "fault-injection")]
pub use crate::chaos::FaultInjector;

mod app;
mod auth;
mod binding;
#[cfg(feature = "fault-injection")]
mod chaos;
mod config;
mod error;
mod executor;
mod flash;
mod http;
mod phase;
mod pool;
mod request;
mod route;
mod router;
mod server;
mod table;
mod transaction;

#[cfg(test)]
mod testing;

// Re-export common types
pub use hyper;
