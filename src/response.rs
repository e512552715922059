use crate::types::Protocol;
use bytes::Bytes;
use std::collections::HashMap;

#[derive(Debug, Clone)]
pub struct Response {
    /// Value of `:status` (HTTP/2) or the status line (HTTP/1.1).
    pub status: u16,
    /// Response headers, names lowercased; pseudo-headers are not included.
    pub headers: HashMap<String, String>,
    pub body: Bytes,
    /// Which protocol actually served the exchange.
    pub protocol: Protocol,
}

impl Response {
    /// Case-insensitive header lookup.
    #[must_use]
    pub fn header(&self, key: impl AsRef<str>) -> Option<&str> {
        let key = key.as_ref();
        self.headers
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(key))
            .map(|(_, value)| value.as_ref())
    }

    /// Body as UTF-8, lossily.
    #[must_use]
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    #[cfg(feature = "json")]
    pub fn json<T: serde::de::DeserializeOwned>(&self) -> crate::error::Result<T> {
        serde_json::from_slice(&self.body)
            .map_err(|err| crate::error::Error::InvalidResponse(format!("JSON body: {err}")))
    }

    #[must_use]
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}
