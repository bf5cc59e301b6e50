//! Controller argument binding.
//!
//! Controller methods declare their parameters as [`ParamKind`]s. Each kind
//! is served by a resolver function registered in a [`ResolverRegistry`].
//! The registry is built once at startup and every controller method is
//! checked against it while the route table is compiled, so a missing
//! resolver is a configuration error rather than a request-time surprise.

use std::collections::HashMap;
use std::fmt;

use crate::error::{ResourceError, RouterResult};
use crate::request::{Principal, RequestWrapper};

/// What a controller parameter is bound from.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ParamKind {
    /// A synthesized request parameter, absent when missing
    Param(String),
    /// A synthesized request parameter that must be present
    RequiredParam(String),
    /// The authenticated principal, if any
    Principal,
    /// The resolved locale
    Locale,
    /// Whether user input passed validation
    Valid,
    /// A request header
    Header(String),
    /// A flash attribute
    Flash(String),
}

impl ParamKind {
    /// The resolver key for this kind.
    pub fn tag(&self) -> ParamTag {
        match self {
            ParamKind::Param(_) => ParamTag::Param,
            ParamKind::RequiredParam(_) => ParamTag::RequiredParam,
            ParamKind::Principal => ParamTag::Principal,
            ParamKind::Locale => ParamTag::Locale,
            ParamKind::Valid => ParamTag::Valid,
            ParamKind::Header(_) => ParamTag::Header,
            ParamKind::Flash(_) => ParamTag::Flash,
        }
    }

    fn name(&self) -> &str {
        match self {
            ParamKind::Param(name)
            | ParamKind::RequiredParam(name)
            | ParamKind::Header(name)
            | ParamKind::Flash(name) => name,
            _ => "",
        }
    }
}

impl fmt::Display for ParamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            "" => write!(f, "{:?}", self.tag()),
            name => write!(f, "{:?}({})", self.tag(), name),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ParamTag {
    Param,
    RequiredParam,
    Principal,
    Locale,
    Valid,
    Header,
    Flash,
}

/// A resolved controller argument.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Arg {
    Text(Option<String>),
    Principal(Option<Principal>),
    Flag(bool),
}

impl Arg {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Arg::Text(text) => text.as_deref(),
            _ => None,
        }
    }

    pub fn as_principal(&self) -> Option<&Principal> {
        match self {
            Arg::Principal(principal) => principal.as_ref(),
            _ => None,
        }
    }

    pub fn as_flag(&self) -> Option<bool> {
        match self {
            Arg::Flag(flag) => Some(*flag),
            _ => None,
        }
    }
}

/// Resolves one argument from the request.
pub type Resolver = fn(&ParamKind, &mut RequestWrapper) -> RouterResult<Arg>;

/// Maps parameter kinds to their resolvers.
#[derive(Clone)]
pub struct ResolverRegistry {
    resolvers: HashMap<ParamTag, Resolver>,
}

impl ResolverRegistry {
    /// A registry without any resolvers.
    pub fn empty() -> Self {
        Self {
            resolvers: HashMap::new(),
        }
    }

    /// Registers (or replaces) the resolver for `tag`.
    pub fn register(&mut self, tag: ParamTag, resolver: Resolver) -> &mut Self {
        self.resolvers.insert(tag, resolver);
        self
    }

    pub fn supports(&self, kind: &ParamKind) -> bool {
        self.resolvers.contains_key(&kind.tag())
    }

    /// Resolves every parameter into `args`, which is cleared first.
    pub fn resolve_into(
        &self,
        params: &[ParamKind],
        request: &mut RequestWrapper,
        args: &mut Vec<Arg>,
    ) -> RouterResult<()> {
        args.clear();
        for kind in params {
            let resolver = self.resolvers.get(&kind.tag()).ok_or_else(|| {
                crate::error::RouterError::Binding(format!("no resolver for {}", kind))
            })?;
            args.push(resolver(kind, request)?);
        }
        Ok(())
    }
}

impl Default for ResolverRegistry {
    fn default() -> Self {
        let mut registry = Self::empty();
        registry
            .register(ParamTag::Param, resolve_param)
            .register(ParamTag::RequiredParam, resolve_required_param)
            .register(ParamTag::Principal, |_, request| {
                Ok(Arg::Principal(request.principal().cloned()))
            })
            .register(ParamTag::Locale, |_, request| {
                Ok(Arg::Text(Some(request.locale().to_owned())))
            })
            .register(ParamTag::Valid, |_, request| Ok(Arg::Flag(request.is_valid())))
            .register(ParamTag::Header, |kind, request| {
                Ok(Arg::Text(request.header(kind.name()).map(str::to_owned)))
            })
            .register(ParamTag::Flash, |kind, request| {
                Ok(Arg::Text(request.flash().get(kind.name()).cloned()))
            });
        registry
    }
}

impl fmt::Debug for ResolverRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.resolvers.keys()).finish()
    }
}

fn resolve_param(kind: &ParamKind, request: &mut RequestWrapper) -> RouterResult<Arg> {
    Ok(Arg::Text(request.param(kind.name()).map(str::to_owned)))
}

fn resolve_required_param(kind: &ParamKind, request: &mut RequestWrapper) -> RouterResult<Arg> {
    match request.param(kind.name()) {
        Some(value) => Ok(Arg::Text(Some(value.to_owned()))),
        None => {
            let message = format!("missing parameter {}", kind.name());
            Err(ResourceError::bad_request(message).into())
        }
    }
}
