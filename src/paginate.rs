//! Multi-page fetch orchestration.
//!
//! GET pagination follows the server's `x-pages` header: page 1 is fetched
//! first, the remaining pages fan out concurrently, and the results merge
//! into one response in page order. Before fanning out, the paginator
//! compares the remaining cache window against the expected fetch time and
//! waits out a window that is about to close, so all pages come from the
//! same cache generation.
//!
//! POST pagination is client-driven: the body array is chunked and the
//! chunks are submitted concurrently, then merged the same way.

use crate::client::Client;
use crate::error::Result;
use crate::options::RequestOptions;
use crate::response::{merge_pages, Response};
use futures::future::join_all;
use http::header::{DATE, EXPIRES};
use http::HeaderMap;
use serde_json::Value;
use std::time::Duration;

const X_PAGES: &str = "x-pages";

pub(crate) async fn paginate_get(
    client: &Client,
    path: &str,
    options: RequestOptions,
) -> Result<Response> {
    // A prior merged response supplies one previous response per page,
    // positionally; a prior single response stands in for page 1. Pages
    // beyond the previous page count simply have no prior.
    let previous_pages: Vec<Response> = match options.previous_response.clone() {
        Some(prior) if prior.is_paginated() => prior.responses,
        Some(prior) => vec![prior],
        None => Vec::new(),
    };
    let previous_at = |index: usize| previous_pages.get(index).cloned();

    let first_options = page_options(&options, None, previous_at(0));
    let mut first = client.retry_request(path, &first_options).await?;
    let mut pages = page_count(&first.headers);

    if pages > 1 {
        if let Some(expires_in) = cache_window(&first.headers) {
            let budget = (client.inner.page_split_delay)(pages);
            if expires_in < budget {
                tracing::debug!(
                    pages,
                    expires_in_ms = expires_in.as_millis() as u64,
                    budget_ms = budget.as_millis() as u64,
                    path,
                    "cache window closes before all pages would arrive, waiting it out"
                );
                tokio::time::sleep(expires_in).await;
                first = client.retry_request(path, &first_options).await?;
                pages = page_count(&first.headers);
            }
        }
    }

    if pages <= 1 {
        return Ok(first);
    }

    let fetches = (2..=pages).map(|page| {
        let page_options = page_options(&options, Some(page), previous_at(page as usize - 1));
        async move { client.retry_request(path, &page_options).await }
    });
    let results = join_all(fetches).await;

    let mut responses = Vec::with_capacity(pages as usize);
    responses.push(first);
    for result in results {
        responses.push(result?);
    }

    merge_pages(responses)
}

pub(crate) async fn paginate_post(
    client: &Client,
    path: &str,
    options: RequestOptions,
) -> Result<Response> {
    let (Some(page_size), Some(Value::Array(items))) =
        (options.body_page_size, options.body.as_ref())
    else {
        return client.retry_request(path, &options).await;
    };
    if items.is_empty() {
        return client.retry_request(path, &options).await;
    }

    let chunks: Vec<Value> = items
        .chunks(page_size.get())
        .map(|chunk| Value::Array(chunk.to_vec()))
        .collect();
    tracing::debug!(
        chunks = chunks.len(),
        chunk_size = page_size.get(),
        path,
        "submitting chunked post"
    );

    let fetches = chunks.into_iter().map(|chunk| {
        let mut chunk_options = options.clone();
        chunk_options.body = Some(chunk);
        async move { client.retry_request(path, &chunk_options).await }
    });
    let results = join_all(fetches).await;

    let mut responses = Vec::with_capacity(results.len());
    for result in results {
        responses.push(result?);
    }

    merge_pages(responses)
}

/// Clones the request options for one page: the positional previous
/// response replaces the caller's, and pages past the first get a `page`
/// query parameter.
fn page_options(
    options: &RequestOptions,
    page: Option<u32>,
    previous: Option<Response>,
) -> RequestOptions {
    let mut page_options = options.clone();
    page_options.previous_response = previous;
    if let Some(page) = page {
        page_options
            .query
            .insert("page".to_string(), page.to_string());
    }
    page_options
}

/// Reads `x-pages`, defaulting to a single page on absence or garbage.
fn page_count(headers: &HeaderMap) -> u32 {
    headers
        .get(X_PAGES)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u32>().ok())
        .unwrap_or(1)
        .max(1)
}

/// Time until the response's cache entry regenerates: `expires` minus
/// `date`, plus a one-second cushion. `None` when either header is absent
/// or unparseable.
fn cache_window(headers: &HeaderMap) -> Option<Duration> {
    let expires = httpdate::parse_http_date(headers.get(EXPIRES)?.to_str().ok()?).ok()?;
    let date = httpdate::parse_http_date(headers.get(DATE)?.to_str().ok()?).ok()?;
    Some(expires.duration_since(date).unwrap_or_default() + Duration::from_secs(1))
}
