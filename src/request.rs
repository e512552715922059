#[cfg(feature = "json")]
use crate::error::{Error, Result};
use crate::frame::Priority;
use crate::response::Response;
use crate::types::Headers;
use bytes::Bytes;
use std::sync::atomic::{AtomicUsize, Ordering};
use url::Url;

static REQUEST_ID: AtomicUsize = AtomicUsize::new(1);

#[derive(Debug, Clone, PartialEq, Eq, derive_more::Display)]
pub enum Method {
    #[display(fmt = "GET")]
    Get,
    #[display(fmt = "POST")]
    Post,
    #[display(fmt = "PUT")]
    Put,
    #[display(fmt = "DELETE")]
    Delete,
    #[display(fmt = "HEAD")]
    Head,
    #[display(fmt = "PATCH")]
    Patch,
    #[display(fmt = "OPTIONS")]
    Options,
    #[display(fmt = "{}", _0)]
    Other(String),
}

impl Method {
    /// Safe to replay on a fresh connection without user involvement.
    /// POST and PATCH are not.
    #[must_use]
    pub fn is_idempotent(&self) -> bool {
        matches!(
            self,
            Method::Get | Method::Head | Method::Put | Method::Delete | Method::Options
        )
    }
}

#[derive(Debug, Clone)]
pub struct Request {
    pub id: usize,
    pub method: Method,
    pub url: Url,
    pub headers: Headers,
    pub body: Bytes,
    /// Explicit send-priority hint; the engine never infers one.
    pub priority: Option<Priority>,
}

impl Request {
    pub fn new(method: Method, url: Url, headers: Option<Headers>, body: impl Into<Bytes>) -> Self {
        let mut full_headers = vec![
            (":method".to_owned(), method.to_string()),
            (":scheme".to_owned(), url.scheme().to_owned()),
            (":path".to_owned(), path_and_query(&url)),
            (
                ":authority".to_owned(),
                if let Some(port) = url.port() {
                    format!("{}:{}", url.host_str().expect("URL cannot be a base"), port)
                } else {
                    url.host_str().expect("URL cannot be a base").to_owned()
                },
            ),
        ];
        if let Some(headers) = headers {
            full_headers.extend(
                headers
                    .into_iter()
                    .map(|(name, value)| (name.to_ascii_lowercase(), value)),
            );
        }
        Self {
            id: REQUEST_ID.fetch_add(1, Ordering::SeqCst),
            method,
            url,
            headers: full_headers,
            body: body.into(),
            priority: None,
        }
    }

    #[inline]
    #[must_use]
    pub fn get(url: Url, headers: Option<Headers>) -> Self {
        Self::new(Method::Get, url, headers, Bytes::new())
    }

    #[inline]
    #[must_use]
    pub fn post(url: Url, headers: Option<Headers>, body: impl Into<Bytes>) -> Self {
        Self::new(Method::Post, url, headers, body)
    }

    /// Serialize `body` as JSON and set the content type.
    #[cfg(feature = "json")]
    pub fn post_json<T: serde::Serialize>(url: Url, body: &T) -> Result<Self> {
        let body = serde_json::to_vec(body)
            .map_err(|err| Error::InvalidRequest(format!("JSON body: {err}")))?;
        Ok(Self::new(
            Method::Post,
            url,
            Some(vec![(
                "content-type".to_owned(),
                "application/json".to_owned(),
            )]),
            body,
        ))
    }

    #[must_use]
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = Some(priority);
        self
    }

    /// Follow-up request for a redirect response, if it carries a usable
    /// Location. 303 rewrites to GET, as do the legacy 301/302 for POST.
    #[must_use]
    pub fn redirect(&self, response: &Response) -> Option<Request> {
        if !(300..400).contains(&response.status) {
            return None;
        }
        let location = response.header("location")?;
        let target = self.url.join(location).ok()?;
        let (method, body) = match response.status {
            303 => (Method::Get, Bytes::new()),
            301 | 302 if self.method == Method::Post => (Method::Get, Bytes::new()),
            _ => (self.method.clone(), self.body.clone()),
        };
        let carried: Headers = self
            .headers
            .iter()
            .filter(|(name, _)| !name.starts_with(':'))
            .cloned()
            .collect();
        Some(Request::new(method, target, Some(carried), body))
    }
}

fn path_and_query(url: &Url) -> String {
    match url.query() {
        Some(query) => format!("{}?{query}", url.path()),
        None => url.path().to_owned(),
    }
}

/// Suggested priority for a response kind when the application wants the
/// content-type heuristic: page skeletons first, images last. Purely an
/// adapter; nothing in the engine calls this.
#[must_use]
pub fn priority_for_content_type(content_type: &str) -> Priority {
    let weight = if content_type.starts_with("text/html")
        || content_type.starts_with("application/json")
    {
        219
    } else if content_type.starts_with("image/") {
        31
    } else {
        // stylesheets, scripts and everything else
        109
    };
    Priority {
        dependency: 0,
        exclusive: false,
        weight,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Protocol;

    #[test]
    fn pseudo_headers_come_first() {
        let request = Request::get(
            "https://example.com/a/b?q=1".try_into().unwrap(),
            Some(vec![("Accept".to_owned(), "*/*".to_owned())]),
        );
        let names: Vec<&str> = request
            .headers
            .iter()
            .map(|(name, _)| name.as_str())
            .collect();
        assert_eq!(
            names,
            vec![":method", ":scheme", ":path", ":authority", "accept"]
        );
        assert_eq!(request.headers[2].1, "/a/b?q=1");
        assert_eq!(request.headers[3].1, "example.com");
    }

    #[test]
    fn explicit_port_lands_in_authority() {
        let request = Request::get("https://example.com:8443/".try_into().unwrap(), None);
        assert_eq!(request.headers[3].1, "example.com:8443");
    }

    #[test]
    fn redirect_rewrites_post_to_get() {
        let request = Request::post(
            "https://example.com/submit".try_into().unwrap(),
            None,
            "payload",
        );
        let response = Response {
            status: 302,
            headers: [("location".to_owned(), "/done".to_owned())].into(),
            body: Bytes::new(),
            protocol: Protocol::Http2,
        };
        let follow = request.redirect(&response).unwrap();
        assert_eq!(follow.method, Method::Get);
        assert!(follow.body.is_empty());
        assert_eq!(follow.url.as_str(), "https://example.com/done");
    }

    #[test]
    fn no_redirect_without_location() {
        let request = Request::get("https://example.com/".try_into().unwrap(), None);
        let response = Response {
            status: 301,
            headers: Default::default(),
            body: Bytes::new(),
            protocol: Protocol::Http2,
        };
        assert!(request.redirect(&response).is_none());
    }

    #[cfg(feature = "json")]
    #[test]
    fn post_json_sets_body_and_content_type() {
        #[derive(serde::Serialize)]
        struct CreateUser {
            name: String,
            job: String,
        }
        let request = Request::post_json(
            "https://reqres.in/api/users/".try_into().unwrap(),
            &CreateUser {
                name: "morpheus".to_owned(),
                job: "leader".to_owned(),
            },
        )
        .unwrap();
        assert_eq!(request.method, Method::Post);
        assert!(request
            .headers
            .contains(&("content-type".to_owned(), "application/json".to_owned())));
        let body: serde_json::Value = serde_json::from_slice(&request.body).unwrap();
        assert_eq!(body["name"], "morpheus");
        assert_eq!(body["job"], "leader");
    }

    #[test]
    fn content_type_priority_tiers() {
        assert!(
            priority_for_content_type("text/html; charset=utf-8").weight
                > priority_for_content_type("text/css").weight
        );
        assert!(
            priority_for_content_type("text/css").weight
                > priority_for_content_type("image/png").weight
        );
    }
}
