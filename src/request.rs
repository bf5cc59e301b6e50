//! The pooled per-request context.
//!
//! A [`RequestWrapper`] is checked out of its pool when a route matches and
//! travels with the logical request across the authenticator and
//! transaction phases. It carries everything the router needs once the
//! request resumes: the matched route, synthesized parameters, validation
//! errors, flash attributes, the principal, pending cache evictions and any
//! failure staged by a worker.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use hyper::body::Bytes;
use hyper::header::{HeaderMap, ACCEPT_LANGUAGE, CONTENT_TYPE, COOKIE, HOST};
use hyper::http::request::Parts;
use hyper::{Method, StatusCode, Uri};

use crate::app::ControllerMethod;
use crate::error::{RouterError, RouterResult};
use crate::pool::Recyclable;
use crate::route::{expand_view_id, Route};

/// An authenticated user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    pub id: String,
    pub name: String,
    pub roles: Vec<String>,
}

impl Principal {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            roles: Vec::new(),
        }
    }

    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.roles.push(role.into());
        self
    }

    pub fn has_role(&self, role: &str) -> bool {
        self.roles.iter().any(|r| r == role)
    }
}

/// Whether the authenticator phase has run for this request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum PrincipalState {
    #[default]
    Unchecked,
    Anonymous,
    Authenticated(Principal),
}

/// Principal-cache entries to invalidate once the transaction commits.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum EvictionSet {
    #[default]
    Empty,
    Principals(HashSet<String>),
    All,
}

impl EvictionSet {
    pub fn evict(&mut self, principal_id: impl Into<String>) {
        match self {
            EvictionSet::All => {}
            EvictionSet::Principals(ids) => {
                ids.insert(principal_id.into());
            }
            EvictionSet::Empty => {
                let mut ids = HashSet::new();
                ids.insert(principal_id.into());
                *self = EvictionSet::Principals(ids);
            }
        }
    }

    pub fn evict_all(&mut self) {
        *self = EvictionSet::All;
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, EvictionSet::Empty)
    }

    pub fn contains(&self, principal_id: &str) -> bool {
        match self {
            EvictionSet::Empty => false,
            EvictionSet::Principals(ids) => ids.contains(principal_id),
            EvictionSet::All => true,
        }
    }
}

/// Per-field validation errors recorded while binding user input.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidationErrors {
    fields: Vec<(String, String)>,
    global: Vec<String>,
}

impl ValidationErrors {
    pub fn reject(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.fields.push((field.into(), message.into()));
    }

    pub fn reject_global(&mut self, message: impl Into<String>) {
        self.global.push(message.into());
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty() && self.global.is_empty()
    }

    pub fn len(&self) -> usize {
        self.fields.len() + self.global.len()
    }

    /// Messages recorded against `field`.
    pub fn field(&self, field: &str) -> impl Iterator<Item = &str> {
        let field = field.to_owned();
        self.fields
            .iter()
            .filter(move |(f, _)| *f == field)
            .map(|(_, m)| m.as_str())
    }

    pub fn fields(&self) -> impl Iterator<Item = (&str, &str)> {
        self.fields.iter().map(|(f, m)| (f.as_str(), m.as_str()))
    }

    pub fn global(&self) -> &[String] {
        &self.global
    }

    fn clear(&mut self) {
        self.fields.clear();
        self.global.clear();
    }
}

/// What the response should be once business logic has run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Render the route's view with the given status
    View(StatusCode),
    /// Answer `303 See Other` pointing at the target
    Redirect(String),
}

impl Default for Outcome {
    fn default() -> Self {
        Outcome::View(StatusCode::OK)
    }
}

/// The pooled, per-request router state.
#[derive(Default)]
pub struct RequestWrapper {
    head: Option<Parts>,
    body: Bytes,
    secure: bool,
    route: Option<Arc<Route>>,
    handler: Option<Arc<ControllerMethod>>,
    auth_required: bool,
    params: HashMap<String, Vec<String>>,
    errors: ValidationErrors,
    flash: HashMap<String, String>,
    staged_flash: HashMap<String, String>,
    locale: Option<String>,
    default_locale: String,
    principal: PrincipalState,
    evictions: EvictionSet,
    staged: Option<RouterError>,
    outcome: Outcome,
    view_id: String,
}

impl RequestWrapper {
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds the underlying request. Transport parameters are collected from
    /// the query string and, for form posts, the body.
    pub fn bind(&mut self, head: Parts, body: Bytes, secure: bool) {
        if let Some(query) = head.uri.query() {
            for (name, value) in url::form_urlencoded::parse(query.as_bytes()) {
                self.params
                    .entry(name.into_owned())
                    .or_default()
                    .push(value.into_owned());
            }
        }

        let is_form = head
            .headers
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.starts_with("application/x-www-form-urlencoded"))
            .unwrap_or(false);
        if is_form {
            for (name, value) in url::form_urlencoded::parse(&body) {
                self.params
                    .entry(name.into_owned())
                    .or_default()
                    .push(value.into_owned());
            }
        }

        self.head = Some(head);
        self.body = body;
        self.secure = secure;
    }

    /// Attaches the matched route. URI placeholders override transport
    /// parameters of the same name.
    pub(crate) fn attach_route(
        &mut self,
        route: Arc<Route>,
        handler: Option<Arc<ControllerMethod>>,
        locations: &regex::CaptureLocations,
        auth_required: bool,
    ) {
        if let Some(head) = &self.head {
            let path = head.uri.path();
            for (name, raw) in route.pattern().parameters(path, locations) {
                let value = match urlencoding::decode(raw) {
                    Ok(decoded) => decoded.into_owned(),
                    Err(_) => {
                        log::debug!("placeholder {} does not decode to UTF-8: {}", name, raw);
                        raw.to_owned()
                    }
                };
                let values = self.params.entry(name.to_owned()).or_default();
                values.clear();
                values.push(value);
            }
        }

        self.view_id.clear();
        let params = &self.params;
        expand_view_id(route.view(), &mut self.view_id, |name| {
            params.get(name).and_then(|v| v.first()).map(String::as_str)
        });

        self.route = Some(route);
        self.handler = handler;
        self.auth_required = auth_required;
    }

    pub(crate) fn set_default_locale(&mut self, locale: &str) {
        self.default_locale.clear();
        self.default_locale.push_str(locale);
    }

    pub fn method(&self) -> &Method {
        static GET: Method = Method::GET;
        self.head.as_ref().map(|h| &h.method).unwrap_or(&GET)
    }

    pub fn uri(&self) -> Option<&Uri> {
        self.head.as_ref().map(|h| &h.uri)
    }

    pub fn path(&self) -> &str {
        self.head.as_ref().map(|h| h.uri.path()).unwrap_or("/")
    }

    /// Path plus query string, as sent by the client.
    pub fn path_and_query(&self) -> &str {
        self.head
            .as_ref()
            .and_then(|h| h.uri.path_and_query())
            .map(|pq| pq.as_str())
            .unwrap_or_else(|| self.path())
    }

    pub fn headers(&self) -> Option<&HeaderMap> {
        self.head.as_ref().map(|h| &h.headers)
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers()
            .and_then(|h| h.get(name))
            .and_then(|v| v.to_str().ok())
    }

    /// The value of cookie `name`, searching every `Cookie` header.
    pub fn cookie(&self, name: &str) -> Option<&str> {
        self.headers()?
            .get_all(COOKIE)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .flat_map(|v| v.split(';'))
            .filter_map(|pair| {
                let mut parts = pair.trim().splitn(2, '=');
                Some((parts.next()?.trim(), parts.next().unwrap_or("").trim()))
            })
            .find(|(key, _)| *key == name)
            .map(|(_, value)| value)
    }

    /// The host the client addressed, without a port.
    pub fn host(&self) -> Option<&str> {
        let head = self.head.as_ref()?;
        let host = head
            .uri
            .host()
            .or_else(|| head.headers.get(HOST).and_then(|v| v.to_str().ok()))?;
        Some(strip_port(host))
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    pub fn is_secure(&self) -> bool {
        self.secure
    }

    pub fn route(&self) -> Option<&Arc<Route>> {
        self.route.as_ref()
    }

    pub fn handler(&self) -> Option<&Arc<ControllerMethod>> {
        self.handler.as_ref()
    }

    pub fn auth_required(&self) -> bool {
        self.auth_required
    }

    /// First value of a synthesized parameter.
    pub fn param(&self, name: &str) -> Option<&str> {
        self.params
            .get(name)
            .and_then(|v| v.first())
            .map(String::as_str)
    }

    pub fn param_values(&self, name: &str) -> &[String] {
        self.params.get(name).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn errors(&self) -> &ValidationErrors {
        &self.errors
    }

    pub fn errors_mut(&mut self) -> &mut ValidationErrors {
        &mut self.errors
    }

    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    /// Flash attributes the previous request left for this one.
    pub fn flash(&self) -> &HashMap<String, String> {
        &self.flash
    }

    /// Makes a restored attribute visible to this request.
    pub fn restore_flash(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.flash.insert(name.into(), value.into());
    }

    /// Stages an attribute for the request following a redirect.
    pub fn set_flash(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.staged_flash.insert(name.into(), value.into());
    }

    pub fn staged_flash(&self) -> &HashMap<String, String> {
        &self.staged_flash
    }

    /// The preferred locale from `Accept-Language`, computed on first use.
    pub fn locale(&mut self) -> &str {
        if self.locale.is_none() {
            let preferred = self
                .header(ACCEPT_LANGUAGE.as_str())
                .and_then(preferred_language)
                .map(str::to_owned);
            self.locale = Some(preferred.unwrap_or_else(|| self.default_locale.clone()));
        }
        self.locale.as_deref().unwrap_or_default()
    }

    pub fn principal_state(&self) -> &PrincipalState {
        &self.principal
    }

    pub fn principal(&self) -> Option<&Principal> {
        match &self.principal {
            PrincipalState::Authenticated(p) => Some(p),
            _ => None,
        }
    }

    pub fn set_principal(&mut self, principal: Option<Principal>) {
        self.principal = match principal {
            Some(p) => PrincipalState::Authenticated(p),
            None => PrincipalState::Anonymous,
        };
    }

    /// Cache evictions to apply after a successful commit.
    pub fn evictions_mut(&mut self) -> &mut EvictionSet {
        &mut self.evictions
    }

    pub fn evictions(&self) -> &EvictionSet {
        &self.evictions
    }

    pub(crate) fn take_evictions(&mut self) -> EvictionSet {
        std::mem::take(&mut self.evictions)
    }

    /// Stashes a failure raised off-thread so the resumed dispatch sees it.
    pub fn stage_failure(&mut self, err: RouterError) {
        if let Some(previous) = self.staged.replace(err) {
            log::debug!("replacing staged failure: {}", previous);
        }
    }

    pub fn has_staged_failure(&self) -> bool {
        self.staged.is_some()
    }

    /// Re-raises a staged failure through the caller's error path.
    pub fn take_staged_failure(&mut self) -> RouterResult<()> {
        match self.staged.take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    pub fn outcome(&self) -> &Outcome {
        &self.outcome
    }

    pub fn set_outcome(&mut self, outcome: Outcome) {
        self.outcome = outcome;
    }

    /// The view id with placeholders resolved.
    pub fn view_id(&self) -> &str {
        &self.view_id
    }
}

impl Recyclable for RequestWrapper {
    fn reset(&mut self) {
        self.head = None;
        self.body = Bytes::new();
        self.secure = false;
        self.route = None;
        self.handler = None;
        self.auth_required = false;
        self.params.clear();
        self.errors.clear();
        self.flash.clear();
        self.staged_flash.clear();
        self.locale = None;
        self.principal = PrincipalState::Unchecked;
        self.evictions = EvictionSet::Empty;
        self.staged = None;
        self.outcome = Outcome::default();
        self.view_id.clear();
    }
}

impl fmt::Debug for RequestWrapper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestWrapper")
            .field("method", self.method())
            .field("path", &self.path())
            .field("route", &self.route.as_ref().map(|r| r.id()))
            .field("secure", &self.secure)
            .field("principal", &self.principal)
            .field("outcome", &self.outcome)
            .finish()
    }
}

fn strip_port(host: &str) -> &str {
    if host.starts_with('[') {
        // bracketed IPv6 literal
        return match host.find(']') {
            Some(end) => &host[..=end],
            None => host,
        };
    }
    match host.rsplit_once(':') {
        Some((name, port)) if port.bytes().all(|b| b.is_ascii_digit()) => name,
        _ => host,
    }
}

/// The first language tag of an `Accept-Language` value.
fn preferred_language(header: &str) -> Option<&str> {
    header
        .split(',')
        .map(|part| part.split(';').next().unwrap_or_default().trim())
        .find(|tag| !tag.is_empty() && *tag != "*")
}
