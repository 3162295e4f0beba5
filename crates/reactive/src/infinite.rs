//! Infinite queries: a normal cached query whose data is
//! `{"pages": […], "pageParams": […]}`, extended page by page with a
//! user-supplied page function and cursor derivations.

use std::sync::Arc;

use futures::future::BoxFuture;
use serde_json::{
    json,
    Value as JsonValue,
};

use crate::{
    client::{
        QueryClient,
        QuerySpec,
    },
    key::QueryKey,
    query::{
        FetchResult,
        FetchSignal,
        Query,
    },
};

pub type PageFn =
    Arc<dyn Fn(JsonValue, FetchSignal) -> BoxFuture<'static, anyhow::Result<JsonValue>> + Send + Sync>;
pub type CursorFn = Arc<dyn Fn(&JsonValue) -> Option<JsonValue> + Send + Sync>;

#[derive(Clone)]
pub struct InfiniteQuery {
    query: Query,
    page_fn: PageFn,
    next_param: CursorFn,
    previous_param: CursorFn,
}

fn pages_of(data: &JsonValue) -> (Vec<JsonValue>, Vec<JsonValue>) {
    let pages = data["pages"].as_array().cloned().unwrap_or_default();
    let params = data["pageParams"].as_array().cloned().unwrap_or_default();
    (pages, params)
}

impl InfiniteQuery {
    /// Registers (or joins) the cached query for `key`. The base fetch loads
    /// the first page with `initial_param`.
    pub fn new(
        client: &QueryClient,
        key: QueryKey,
        page_fn: PageFn,
        initial_param: JsonValue,
        next_param: CursorFn,
        previous_param: CursorFn,
    ) -> Self {
        let fetch_page = page_fn.clone();
        let first_param = initial_param.clone();
        let query = client.query(
            key,
            QuerySpec::new(move |signal| {
                let fetch_page = fetch_page.clone();
                let param = first_param.clone();
                Box::pin(async move {
                    let page = fetch_page(param.clone(), signal).await?;
                    Ok(json!({ "pages": [page], "pageParams": [param] }))
                })
            }),
        );
        Self {
            query,
            page_fn,
            next_param,
            previous_param,
        }
    }

    pub fn query(&self) -> &Query {
        &self.query
    }

    pub async fn fetch(&self) -> FetchResult {
        self.query.fetch().await
    }

    /// Appends the next page, deriving its cursor from the last page.
    /// Returns false when there is no further page.
    pub async fn fetch_next_page(&self) -> anyhow::Result<bool> {
        let data = match self.query.state().data {
            Some(data) => data,
            None => {
                self.fetch().await.map_err(|e| anyhow::anyhow!("{e:#}"))?;
                return Ok(true);
            },
        };
        let (mut pages, mut params) = pages_of(&data);
        let Some(last) = pages.last() else {
            return Ok(false);
        };
        let Some(param) = (self.next_param)(last) else {
            return Ok(false);
        };
        let page = (self.page_fn)(param.clone(), FetchSignal::never()).await?;
        pages.push(page);
        params.push(param);
        self.query
            .set_data(json!({ "pages": pages, "pageParams": params }));
        Ok(true)
    }

    /// Prepends the previous page, deriving its cursor from the first page.
    pub async fn fetch_previous_page(&self) -> anyhow::Result<bool> {
        let data = match self.query.state().data {
            Some(data) => data,
            None => {
                self.fetch().await.map_err(|e| anyhow::anyhow!("{e:#}"))?;
                return Ok(true);
            },
        };
        let (mut pages, mut params) = pages_of(&data);
        let Some(first) = pages.first() else {
            return Ok(false);
        };
        let Some(param) = (self.previous_param)(first) else {
            return Ok(false);
        };
        let page = (self.page_fn)(param.clone(), FetchSignal::never()).await?;
        pages.insert(0, page);
        params.insert(0, param);
        self.query
            .set_data(json!({ "pages": pages, "pageParams": params }));
        Ok(true)
    }
}
