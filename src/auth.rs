//! Principal cache in front of a credential store.

use std::sync::Arc;

use dashmap::DashMap;
use hyper::header::AUTHORIZATION;

use crate::app::AuthService;
use crate::error::RouterResult;
use crate::request::{EvictionSet, Principal, RequestWrapper};

/// The authoritative store of principals.
pub trait PrincipalSource: Send + Sync {
    /// The credential presented by the request, if any.
    fn credentials(&self, request: &RequestWrapper) -> Option<String> {
        bearer_token(request).map(str::to_owned)
    }

    /// Loads the principal for a credential. Blocking; runs on a worker.
    fn load(&self, credentials: &str) -> RouterResult<Option<Principal>>;
}

/// The token of an `Authorization: Bearer` header.
pub fn bearer_token(request: &RequestWrapper) -> Option<&str> {
    let value = request.header(AUTHORIZATION.as_str())?;
    let (scheme, token) = value.split_once(' ')?;
    scheme
        .eq_ignore_ascii_case("bearer")
        .then(|| token.trim())
        .filter(|token| !token.is_empty())
}

/// A thread-safe cache of resolved principals keyed by credential.
///
/// Worker threads resolve and evict concurrently; committed transactions
/// drain their pending evictions through [`AuthService::evict`].
pub struct CachedAuthService<S> {
    source: S,
    cache: Arc<DashMap<String, Principal>>,
}

impl<S: PrincipalSource> CachedAuthService<S> {
    pub fn new(source: S) -> Self {
        Self {
            source,
            cache: Arc::new(DashMap::new()),
        }
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    /// Number of cached principals.
    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }
}

impl<S: PrincipalSource> AuthService for CachedAuthService<S> {
    fn resolve(&self, request: &RequestWrapper) -> RouterResult<Option<Principal>> {
        let Some(credentials) = self.source.credentials(request) else {
            return Ok(None);
        };
        if let Some(principal) = self.cache.get(&credentials) {
            return Ok(Some(principal.value().clone()));
        }

        let principal = self.source.load(&credentials)?;
        if let Some(principal) = &principal {
            log::debug!("caching principal {}", principal.id);
            self.cache.insert(credentials, principal.clone());
        }
        Ok(principal)
    }

    fn evict(&self, evictions: &EvictionSet) -> RouterResult<()> {
        match evictions {
            EvictionSet::Empty => {}
            EvictionSet::All => {
                log::debug!("evicting {} cached principals", self.cache.len());
                self.cache.clear();
            }
            EvictionSet::Principals(ids) => {
                self.cache.retain(|_, principal| !ids.contains(&principal.id));
            }
        }
        Ok(())
    }
}
