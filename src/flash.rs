//! Flash attributes carried across a redirect in a cookie.

use hyper::header::{HeaderValue, SET_COOKIE};

use crate::app::FlashStore;
use crate::error::{RouterError, RouterResult};
use crate::http::Response;
use crate::request::{Outcome, RequestWrapper};

/// Default flash cookie name.
pub const FLASH_COOKIE: &str = "switchyard-flash";

/// Keeps flash attributes client-side, form-encoded in one cookie.
///
/// A redirect with staged attributes sets the cookie; the next request
/// restores them and its response expires the cookie again.
#[derive(Debug, Clone)]
pub struct CookieFlash {
    name: String,
}

impl CookieFlash {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Default for CookieFlash {
    fn default() -> Self {
        Self::new(FLASH_COOKIE)
    }
}

impl FlashStore for CookieFlash {
    fn restore(&self, request: &mut RequestWrapper) -> RouterResult<()> {
        let encoded = match request.cookie(&self.name) {
            Some(value) if !value.is_empty() => value.to_owned(),
            _ => return Ok(()),
        };
        for (name, value) in url::form_urlencoded::parse(encoded.as_bytes()) {
            request.restore_flash(name.into_owned(), value.into_owned());
        }
        Ok(())
    }

    fn save(&self, request: &RequestWrapper, response: &mut Response) -> RouterResult<()> {
        let redirecting = matches!(request.outcome(), Outcome::Redirect(_));
        let cookie = if redirecting && !request.staged_flash().is_empty() {
            let mut entries: Vec<_> = request.staged_flash().iter().collect();
            entries.sort();
            let mut encoded = url::form_urlencoded::Serializer::new(String::new());
            for (name, value) in entries {
                encoded.append_pair(name, value);
            }
            format!(
                "{}={}; Path=/; HttpOnly; SameSite=Lax",
                self.name,
                encoded.finish()
            )
        } else if request.cookie(&self.name).is_some() {
            format!("{}=; Path=/; Max-Age=0", self.name)
        } else {
            return Ok(());
        };

        let value = HeaderValue::from_str(&cookie).map_err(RouterError::application)?;
        response.headers_mut().append(SET_COOKIE, value);
        Ok(())
    }
}
