use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::IdentityError;

/// Who the channel is opened for. Supplied by the auth layer; a change of
/// either field means a different channel.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChannelIdentity {
    subject_id: String,
    role: String,
}

impl ChannelIdentity {
    pub fn new(
        subject_id: impl Into<String>,
        role: impl Into<String>,
    ) -> Result<Self, IdentityError> {
        let subject_id = subject_id.into().trim().to_string();
        let role = role.into().trim().to_string();
        if subject_id.is_empty() {
            return Err(IdentityError::EmptySubject);
        }
        if role.is_empty() {
            return Err(IdentityError::EmptyRole);
        }
        Ok(Self { subject_id, role })
    }

    pub fn subject_id(&self) -> &str {
        &self.subject_id
    }

    pub fn role(&self) -> &str {
        &self.role
    }
}

/// Derives the channel address `{base}/notify/{subject_id}?role={role}`.
///
/// `http`/`https` bases are rewritten to `ws`/`wss` so the same server url can
/// be shared with the REST client. Pure: no I/O, suitable for tests.
pub fn channel_address(base: &Url, identity: &ChannelIdentity) -> Result<Url, IdentityError> {
    let mut url = base.clone();
    let scheme = match url.scheme() {
        "http" => Some("ws"),
        "https" => Some("wss"),
        "ws" | "wss" => None,
        other => return Err(IdentityError::UnsupportedBase(format!("scheme {other}"))),
    };
    if let Some(scheme) = scheme {
        url.set_scheme(scheme)
            .map_err(|_| IdentityError::UnsupportedBase(base.to_string()))?;
    }

    url.path_segments_mut()
        .map_err(|_| IdentityError::UnsupportedBase(base.to_string()))?
        .pop_if_empty()
        .push("notify")
        .push(identity.subject_id());
    url.query_pairs_mut()
        .clear()
        .append_pair("role", identity.role());
    url.set_fragment(None);
    Ok(url)
}
