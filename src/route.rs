//! Compiled route descriptors.
//!
//! A route binds a URI template to a security mode, an optional pre-route
//! script, an optional controller and a view. Templates use a small
//! placeholder language:
//!
//! - `{name}` captures one path segment into the parameter `name`
//! - `{name:regex}` captures whatever `regex` matches
//! - `{:regex}` matches `regex` without capturing
//!
//! Braces inside a placeholder's regex must balance, so quantifiers like
//! `{id:[0-9]{4}}` work as expected.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use regex::{CaptureLocations, Regex};

use crate::app::{Controller, Script};
use crate::error::RouteConfigError;

/// Sub-pattern used by placeholders that do not declare one.
const DEFAULT_SEGMENT: &str = "[^/]+";

/// Transport and authentication requirements of a route.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SecurityMode {
    /// Access policy decides
    #[default]
    Default,
    /// Always served over TLS
    ForceTls,
    /// Always requires an authenticated principal (and therefore TLS)
    ForceAuthenticated,
}

/// One placeholder of a parsed template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Placeholder {
    pub name: Option<String>,
    pub pattern: String,
}

/// The result of parsing a URI template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ParsedTemplate {
    /// Literal text between placeholders; always one longer than `placeholders`
    pub literals: Vec<String>,
    pub placeholders: Vec<Placeholder>,
}

impl ParsedTemplate {
    /// The template with every placeholder replaced by `%`.
    pub fn reverse_template(&self) -> String {
        let mut out = String::new();
        for (i, literal) in self.literals.iter().enumerate() {
            out.push_str(literal);
            if i < self.placeholders.len() {
                out.push('%');
            }
        }
        out
    }
}

/// Splits a template into literals and placeholders.
pub(crate) fn parse_template(template: &str) -> Result<ParsedTemplate, RouteConfigError> {
    let unbalanced = |position| RouteConfigError::UnbalancedBraces {
        template: template.to_owned(),
        position,
    };

    let mut literals = Vec::new();
    let mut placeholders = Vec::new();
    let mut literal = String::new();
    let mut body = String::new();
    let mut depth = 0usize;
    let mut opened_at = 0;

    for (pos, c) in template.char_indices() {
        match (c, depth) {
            ('{', 0) => {
                depth = 1;
                opened_at = pos;
                literals.push(std::mem::take(&mut literal));
            }
            ('}', 0) => return Err(unbalanced(pos)),
            ('}', 1) => {
                depth = 0;
                placeholders.push(placeholder(&body));
                body.clear();
            }
            ('{', _) => {
                depth += 1;
                body.push(c);
            }
            ('}', _) => {
                depth -= 1;
                body.push(c);
            }
            (_, 0) => literal.push(c),
            (_, _) => body.push(c),
        }
    }

    if depth != 0 {
        return Err(unbalanced(opened_at));
    }
    literals.push(literal);

    Ok(ParsedTemplate {
        literals,
        placeholders,
    })
}

fn placeholder(body: &str) -> Placeholder {
    let (name, pattern) = match body.split_once(':') {
        Some((name, pattern)) => (name.trim(), pattern),
        None => (body.trim(), DEFAULT_SEGMENT),
    };
    Placeholder {
        name: (!name.is_empty()).then(|| name.to_owned()),
        pattern: pattern.to_owned(),
    }
}

/// A compiled URI pattern with the capture groups of its placeholders.
#[derive(Debug, Clone)]
pub struct UriPattern {
    regex: Regex,
    /// Parameter name and regex group index per placeholder; `None` when the
    /// placeholder does not capture
    groups: Vec<Option<(String, usize)>>,
    reverse: String,
}

impl UriPattern {
    pub fn compile(template: &str) -> Result<Self, RouteConfigError> {
        let parsed = parse_template(template)?;
        let mut source = String::from("^");
        let mut named = Vec::with_capacity(parsed.placeholders.len());

        for (i, literal) in parsed.literals.iter().enumerate() {
            source.push_str(&regex::escape(literal));
            let Some(placeholder) = parsed.placeholders.get(i) else {
                continue;
            };
            match &placeholder.name {
                Some(name) => {
                    let group = format!("p{}", i);
                    source.push_str(&format!("(?P<{}>{})", group, placeholder.pattern));
                    named.push(Some((name.clone(), group)));
                }
                None => {
                    source.push_str(&format!("(?:{})", placeholder.pattern));
                    named.push(None);
                }
            }
        }
        source.push('$');

        let invalid = |source| RouteConfigError::InvalidPattern {
            template: template.to_owned(),
            source,
        };
        let regex = Regex::new(&source).map_err(invalid)?;

        let groups = named
            .into_iter()
            .map(|entry| {
                entry.and_then(|(name, group)| {
                    regex
                        .capture_names()
                        .position(|n| n == Some(group.as_str()))
                        .map(|index| (name, index))
                })
            })
            .collect();

        Ok(Self {
            regex,
            groups,
            reverse: parsed.reverse_template(),
        })
    }

    pub fn is_match(&self, path: &str) -> bool {
        self.regex.is_match(path)
    }

    /// Matches `path` and returns the offsets of every capture group.
    pub fn locate(&self, path: &str) -> Option<CaptureLocations> {
        let mut locations = self.regex.capture_locations();
        self.regex
            .captures_read(&mut locations, path)
            .map(|_| locations)
    }

    /// Placeholder names in template order; `None` for non-capturing ones.
    pub fn names(&self) -> impl Iterator<Item = Option<&str>> {
        self.groups
            .iter()
            .map(|g| g.as_ref().map(|(name, _)| name.as_str()))
    }

    /// The template with placeholders replaced by `%`.
    pub fn reverse_template(&self) -> &str {
        &self.reverse
    }

    /// Resolves captured parameters against the path `locations` came from.
    pub fn parameters<'a>(
        &'a self,
        path: &'a str,
        locations: &'a CaptureLocations,
    ) -> impl Iterator<Item = (&'a str, &'a str)> + 'a {
        self.groups.iter().flatten().filter_map(move |(name, index)| {
            locations
                .get(*index)
                .map(|(start, end)| (name.as_str(), &path[start..end]))
        })
    }
}

/// A compiled binding from a URI pattern to application logic.
///
/// Immutable once built, apart from its match counter.
pub struct Route {
    id: String,
    template: String,
    pattern: UriPattern,
    security: SecurityMode,
    script: Option<Arc<dyn Script>>,
    controller: Option<Arc<Controller>>,
    view: String,
    view_script: Option<Arc<dyn Script>>,
    matches: AtomicU64,
}

impl Route {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn template(&self) -> &str {
        &self.template
    }

    pub fn pattern(&self) -> &UriPattern {
        &self.pattern
    }

    pub fn security(&self) -> SecurityMode {
        self.security
    }

    pub fn script(&self) -> Option<&Arc<dyn Script>> {
        self.script.as_ref()
    }

    pub fn controller(&self) -> Option<&Arc<Controller>> {
        self.controller.as_ref()
    }

    /// The view-id template.
    pub fn view(&self) -> &str {
        &self.view
    }

    pub fn view_script(&self) -> Option<&Arc<dyn Script>> {
        self.view_script.as_ref()
    }

    pub fn match_count(&self) -> u64 {
        self.matches.load(Ordering::Acquire)
    }

    /// Records a match and returns the new count.
    pub(crate) fn record_match(&self) -> u64 {
        self.matches.fetch_add(1, Ordering::AcqRel) + 1
    }
}

impl fmt::Debug for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Route")
            .field("id", &self.id)
            .field("template", &self.template)
            .field("security", &self.security)
            .field("view", &self.view)
            .field("matches", &self.match_count())
            .finish()
    }
}

/// Describes one route as it arrives from the route configuration.
pub struct RouteBuilder {
    id: Option<String>,
    template: String,
    security: SecurityMode,
    script: Option<Arc<dyn Script>>,
    controller: Option<Arc<Controller>>,
    view: String,
    view_script: Option<Arc<dyn Script>>,
}

impl RouteBuilder {
    pub fn new(template: impl Into<String>, view: impl Into<String>) -> Self {
        Self {
            id: None,
            template: template.into(),
            security: SecurityMode::Default,
            script: None,
            controller: None,
            view: view.into(),
            view_script: None,
        }
    }

    /// Overrides the identifier, which otherwise defaults to the template
    /// with placeholders replaced by `%`.
    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn security(mut self, mode: SecurityMode) -> Self {
        self.security = mode;
        self
    }

    pub fn script(mut self, script: impl Script + 'static) -> Self {
        self.script = Some(Arc::new(script));
        self
    }

    pub fn controller(mut self, controller: Controller) -> Self {
        self.controller = Some(Arc::new(controller));
        self
    }

    pub fn view_script(mut self, script: impl Script + 'static) -> Self {
        self.view_script = Some(Arc::new(script));
        self
    }

    pub(crate) fn template(&self) -> &str {
        &self.template
    }

    pub(crate) fn security_mode(&self) -> SecurityMode {
        self.security
    }

    pub(crate) fn set_security(&mut self, mode: SecurityMode) {
        self.security = mode;
    }

    pub(crate) fn controller_ref(&self) -> Option<&Arc<Controller>> {
        self.controller.as_ref()
    }

    /// Compiles the template into a route.
    pub fn build(self) -> Result<Route, RouteConfigError> {
        let pattern = UriPattern::compile(&self.template)?;
        let id = self
            .id
            .unwrap_or_else(|| pattern.reverse_template().to_owned());
        Ok(Route {
            id,
            template: self.template,
            pattern,
            security: self.security,
            script: self.script,
            controller: self.controller,
            view: self.view,
            view_script: self.view_script,
            matches: AtomicU64::new(0),
        })
    }
}

/// Substitutes `{name}` references in a view-id template.
pub(crate) fn expand_view_id<'a, F>(template: &str, out: &mut String, mut lookup: F)
where
    F: FnMut(&str) -> Option<&'a str>,
{
    let mut rest = template;
    while let Some(start) = rest.find('{') {
        out.push_str(&rest[..start]);
        match rest[start..].find('}') {
            Some(len) => {
                let name = &rest[start + 1..start + len];
                if let Some(value) = lookup(name) {
                    out.push_str(value);
                }
                rest = &rest[start + len + 1..];
            }
            None => {
                out.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
}
