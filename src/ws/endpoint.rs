//! Session url construction.

use secrecy::{ExposeSecret as _, SecretString};
use url::Url;

use crate::Result;
use crate::error::Error;

/// Normalize a configured endpoint to a WebSocket url (`http` becomes `ws`, `https`
/// becomes `wss`). Existing query parameters are kept.
pub fn websocket_base(endpoint: &str) -> Result<Url> {
    let mut url = Url::parse(endpoint)?;

    let scheme = match url.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => {
            return Err(Error::validation(format!(
                "unsupported endpoint scheme `{other}`, expected http(s) or ws(s)"
            )));
        }
    };
    url.set_scheme(scheme)
        .map_err(|()| Error::validation(format!("cannot use scheme `{scheme}` for {endpoint}")))?;
    url.set_fragment(None);

    Ok(url)
}

/// Append the bearer token and session id to `base`.
///
/// The result contains the token in clear text and must not be logged.
#[must_use]
pub fn session_url(base: &Url, token: &SecretString, session_id: &str) -> Url {
    let mut url = base.clone();
    url.query_pairs_mut()
        .append_pair("token", token.expose_secret())
        .append_pair("session_id", session_id);
    url
}
