use std::collections::BTreeMap;

use http::{HeaderMap, HeaderName, HeaderValue, Uri, uri::PathAndQuery};
use regex::Regex;
use serde::Deserialize;

use crate::{
    config::StageSpec,
    core::{BuildError, RequestContext, StageSlot},
    ports::stage::{Adapt, Close},
};

#[derive(Debug, Default, Deserialize)]
struct PathRewriteParams {
    pattern: String,
    replacement: String,
}

#[derive(Debug, Default, Deserialize)]
struct HeaderActionParams {
    /// Appended, keeping existing values
    #[serde(default)]
    add: BTreeMap<String, String>,
    /// Replaces any existing value
    #[serde(default)]
    set: BTreeMap<String, String>,
    #[serde(default)]
    remove: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
struct RequestActionParams {
    #[serde(flatten)]
    headers: HeaderActionParams,
    #[serde(default)]
    path_rewrite: Option<PathRewriteParams>,
}

#[derive(Debug, Default, Deserialize)]
struct AdaptorParams {
    #[serde(default)]
    request: RequestActionParams,
    #[serde(default)]
    response: HeaderActionParams,
}

#[derive(Default)]
struct HeaderActions {
    add: Vec<(HeaderName, HeaderValue)>,
    set: Vec<(HeaderName, HeaderValue)>,
    remove: Vec<HeaderName>,
}

fn header_pairs(
    pairs: BTreeMap<String, String>,
) -> Result<Vec<(HeaderName, HeaderValue)>, BuildError> {
    pairs
        .into_iter()
        .map(|(name, value)| {
            let header = HeaderName::from_bytes(name.as_bytes()).map_err(|e| {
                BuildError::invalid(StageSlot::Adaptor, format!("invalid header '{name}': {e}"))
            })?;
            let value = HeaderValue::from_str(&value).map_err(|e| {
                BuildError::invalid(StageSlot::Adaptor, format!("invalid value for '{name}': {e}"))
            })?;
            Ok((header, value))
        })
        .collect()
}

impl HeaderActions {
    fn new(params: HeaderActionParams) -> Result<Self, BuildError> {
        let remove = params
            .remove
            .iter()
            .map(|name| {
                HeaderName::from_bytes(name.as_bytes()).map_err(|e| {
                    BuildError::invalid(StageSlot::Adaptor, format!("invalid header '{name}': {e}"))
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            add: header_pairs(params.add)?,
            set: header_pairs(params.set)?,
            remove,
        })
    }

    fn apply(&self, headers: &mut HeaderMap) {
        for name in &self.remove {
            headers.remove(name);
        }
        for (name, value) in &self.set {
            headers.insert(name.clone(), value.clone());
        }
        for (name, value) in &self.add {
            headers.append(name.clone(), value.clone());
        }
    }
}

struct PathRewrite {
    pattern: Regex,
    replacement: String,
}

impl PathRewrite {
    /// Rewrite the path of `uri`, keeping its query. `None` if nothing changed
    /// or the result is not a valid URI.
    fn rewrite(&self, uri: &Uri) -> Option<Uri> {
        let path = uri.path();
        let rewritten = self.pattern.replace(path, self.replacement.as_str());
        if rewritten == path {
            return None;
        }

        let path_and_query = match uri.query() {
            Some(query) => format!("{rewritten}?{query}"),
            None => rewritten.into_owned(),
        };
        let mut parts = uri.clone().into_parts();
        parts.path_and_query = Some(path_and_query.parse::<PathAndQuery>().ok()?);
        Uri::from_parts(parts).ok()
    }
}

/// Rewrites request and response headers and the request path.
pub struct HeaderAdaptor {
    request: HeaderActions,
    response: HeaderActions,
    path_rewrite: Option<PathRewrite>,
}

impl HeaderAdaptor {
    pub fn new(spec: &StageSpec) -> Result<Self, BuildError> {
        let params: AdaptorParams = spec.parse_params(StageSlot::Adaptor)?;
        let path_rewrite = params
            .request
            .path_rewrite
            .map(|rewrite| {
                Regex::new(&rewrite.pattern)
                    .map(|pattern| PathRewrite {
                        pattern,
                        replacement: rewrite.replacement,
                    })
                    .map_err(|e| {
                        BuildError::invalid(StageSlot::Adaptor, format!("invalid path_rewrite pattern: {e}"))
                    })
            })
            .transpose()?;

        Ok(Self {
            request: HeaderActions::new(params.request.headers)?,
            response: HeaderActions::new(params.response)?,
            path_rewrite,
        })
    }
}

impl Close for HeaderAdaptor {}

impl Adapt for HeaderAdaptor {
    fn adapt_request(&self, ctx: &mut RequestContext) {
        let request = ctx.request_mut();
        if let Some(rewrite) = &self.path_rewrite {
            match rewrite.rewrite(request.uri()) {
                Some(uri) => {
                    tracing::debug!(from = %request.uri(), to = %uri, "path rewritten");
                    *request.uri_mut() = uri;
                }
                None => tracing::trace!(uri = %request.uri(), "path left unchanged"),
            }
        }
        self.request.apply(request.headers_mut());
    }

    fn adapt_response(&self, ctx: &mut RequestContext) {
        self.response.apply(ctx.response_mut().headers_mut());
    }
}
