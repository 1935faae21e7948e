//! Response values and page merging.
//!
//! [`Response`] is the immutable result of a request. For paginated calls a
//! single merged `Response` is synthesized from the per-page responses; the
//! originals stay available in page order through [`Response::responses`].

use crate::error::{Error, Result};
use http::header::EXPIRES;
use http::{HeaderMap, StatusCode};
use serde_json::Value;
use std::sync::Arc;

/// The result of an ESI request.
///
/// Exactly one of `data` and `body` is populated for a non-empty response:
/// `data` when the server sent JSON, `body` with the raw text otherwise.
/// A 304 is resolved internally; the caller sees the prior response's status
/// and `data` under the fresh headers.
///
/// `data` is reference-counted so conditional requests can hand back the
/// previous response's value without copying it: after a 304, the new
/// response's `data` is the same allocation as the old one's.
///
/// # Examples
///
/// ```no_run
/// use esiflow::{Client, RequestOptions};
/// use serde::Deserialize;
///
/// #[derive(Deserialize)]
/// struct Status {
///     players: u64,
/// }
///
/// # async fn example() -> Result<(), esiflow::Error> {
/// # let client = Client::builder().build()?;
/// let response = client.request("/v1/status/", RequestOptions::get()).await?;
///
/// println!("status: {}", response.status);
/// println!("expires: {:?}", response.header("expires"));
///
/// let status: Status = response.json()?;
/// println!("players online: {}", status.players);
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct Response {
    /// The HTTP status code.
    pub status: StatusCode,

    /// The response headers, minus the configured strip list. Header name
    /// lookups are case-insensitive.
    pub headers: HeaderMap,

    /// Parsed JSON, present when the response body was JSON.
    pub data: Option<Arc<Value>>,

    /// The raw body text, present when the response was non-JSON and
    /// non-empty.
    pub body: Option<String>,

    /// The per-page responses backing a merged paginated result, in page
    /// order. Empty for single responses.
    pub responses: Vec<Response>,
}

impl Response {
    /// Returns a header value as a string, or `None` if absent or not
    /// valid UTF-8.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name)?.to_str().ok()
    }

    /// Returns `true` if this response was merged from multiple pages.
    pub fn is_paginated(&self) -> bool {
        !self.responses.is_empty()
    }

    /// Deserializes `data` into a concrete type.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ResponseFormat`] if the response carried no JSON
    /// data or if it does not match the target type.
    pub fn json<T>(&self) -> Result<T>
    where
        T: serde::de::DeserializeOwned,
    {
        let data = self.data.as_deref().ok_or_else(|| Error::ResponseFormat {
            reason: "response carried no JSON data".to_string(),
            response: Box::new(self.clone()),
        })?;

        T::deserialize(data).map_err(|e| Error::ResponseFormat {
            reason: e.to_string(),
            response: Box::new(self.clone()),
        })
    }
}

/// Computes the set of headers present with identical values in every
/// response.
///
/// A header survives only if each response carries exactly the same value
/// list for it. The survivors double as a consistency check for paginated
/// fetches: a header that varies across pages (notably `expires`) does not
/// survive.
pub(crate) fn common_headers(responses: &[Response]) -> HeaderMap {
    let mut common = HeaderMap::new();
    let Some((first, rest)) = responses.split_first() else {
        return common;
    };

    for name in first.headers.keys() {
        let values: Vec<_> = first.headers.get_all(name).iter().collect();
        let shared = rest.iter().all(|r| {
            let theirs: Vec<_> = r.headers.get_all(name).iter().collect();
            theirs == values
        });
        if shared {
            for value in &values {
                common.append(name.clone(), (*value).clone());
            }
        }
    }

    common
}

/// Merges per-page responses into one logical response.
///
/// The merged response takes its status from the first page, its headers
/// from the intersection of all page headers, and its `data` from the
/// concatenation of each page's array data in page order. The input
/// responses are retained in `responses`.
///
/// # Errors
///
/// Returns [`Error::PageSplit`] if `expires` did not survive the header
/// intersection, meaning at least one page came from a different cache
/// generation. Returns [`Error::ResponseFormat`] if any page's data is not
/// an array.
pub(crate) fn merge_pages(responses: Vec<Response>) -> Result<Response> {
    let Some(first) = responses.first() else {
        return Err(Error::Configuration("no pages to merge".to_string()));
    };
    let status = first.status;

    let headers = common_headers(&responses);
    if !headers.contains_key(EXPIRES) {
        return Err(Error::PageSplit { responses });
    }

    let mut merged = Vec::new();
    for page in &responses {
        match page.data.as_deref() {
            Some(Value::Array(items)) => merged.extend(items.iter().cloned()),
            _ => {
                return Err(Error::ResponseFormat {
                    reason: "expected an array page body".to_string(),
                    response: Box::new(page.clone()),
                })
            }
        }
    }

    Ok(Response {
        status,
        headers,
        data: Some(Arc::new(Value::Array(merged))),
        body: None,
        responses,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderValue;
    use serde::Deserialize;
    use serde_json::json;

    fn page(status: u16, headers: &[(&str, &str)], data: Value) -> Response {
        let mut map = HeaderMap::new();
        for (name, value) in headers {
            map.append(
                http::HeaderName::try_from(*name).unwrap(),
                HeaderValue::from_str(value).unwrap(),
            );
        }
        Response {
            status: StatusCode::from_u16(status).unwrap(),
            headers: map,
            data: Some(Arc::new(data)),
            body: None,
            responses: Vec::new(),
        }
    }

    #[test]
    fn common_headers_keeps_identical_values() {
        let pages = vec![
            page(
                200,
                &[("expires", "t1"), ("x-pages", "2"), ("etag", "a")],
                json!([]),
            ),
            page(
                200,
                &[("expires", "t1"), ("x-pages", "2"), ("etag", "b")],
                json!([]),
            ),
        ];

        let common = common_headers(&pages);
        assert_eq!(common.get("expires").unwrap(), "t1");
        assert_eq!(common.get("x-pages").unwrap(), "2");
        assert!(!common.contains_key("etag"));
    }

    #[test]
    fn merge_concatenates_in_page_order() {
        let pages = vec![
            page(200, &[("expires", "t1")], json!([1, 2])),
            page(200, &[("expires", "t1")], json!([3, 4])),
        ];

        let merged = merge_pages(pages).unwrap();
        assert_eq!(merged.status, StatusCode::OK);
        assert_eq!(merged.responses.len(), 2);
        assert!(merged.is_paginated());
        assert_eq!(*merged.data.unwrap(), json!([1, 2, 3, 4]));
    }

    #[test]
    fn merge_detects_page_split() {
        let pages = vec![
            page(200, &[("expires", "t1")], json!([1])),
            page(200, &[("expires", "t2")], json!([2])),
        ];

        match merge_pages(pages) {
            Err(Error::PageSplit { responses }) => assert_eq!(responses.len(), 2),
            other => panic!("expected PageSplit, got {:?}", other),
        }
    }

    #[test]
    fn merge_rejects_non_array_pages() {
        let pages = vec![
            page(200, &[("expires", "t1")], json!([1])),
            page(200, &[("expires", "t1")], json!({"not": "an array"})),
        ];

        assert!(matches!(
            merge_pages(pages),
            Err(Error::ResponseFormat { .. })
        ));
    }

    #[test]
    fn json_deserializes_data() {
        let response = page(200, &[], json!({"players": 42}));

        #[derive(Deserialize)]
        struct Status {
            players: u64,
        }

        let status: Status = response.json().unwrap();
        assert_eq!(status.players, 42);
    }

    #[test]
    fn json_without_data_is_an_error() {
        let response = Response {
            status: StatusCode::NO_CONTENT,
            headers: HeaderMap::new(),
            data: None,
            body: None,
            responses: Vec::new(),
        };

        assert!(matches!(
            response.json::<Value>(),
            Err(Error::ResponseFormat { .. })
        ));
    }
}
