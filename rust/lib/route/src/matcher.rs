use std::collections::HashMap;

use crate::error::RouteError;
use crate::params::{format_query, parse_query, Params};
use crate::template::{Route, Segment};
use crate::tree::StateId;

/// Result of matching a path against the registered routes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteMatch {
    pub state: StateId,
    pub params: Params,
}

/// Maps path/query strings to leaf states and back.
///
/// The router registers every leaf route once, at init, then only calls
/// `find` and `interpolate`.
pub trait PathMatcher: Send + Sync {
    /// Register the full route of a leaf state.
    fn add_route(&mut self, state: StateId, route: &Route) -> Result<(), RouteError>;

    /// Resolve `/path?query` to a leaf and its decoded params.
    ///
    /// Only query params declared by the route are kept.
    fn find(&self, path_query: &str) -> Option<RouteMatch>;

    /// Reverse routing: build `/path?query` for a state.
    ///
    /// Fails if a path param has no value. Params the route does not
    /// declare are ignored.
    fn interpolate(&self, state: StateId, params: &Params) -> Result<String, RouteError>;
}

/// Default [`PathMatcher`]: a segment trie.
///
/// At every level a static child is tried first, then the `:param` child,
/// then the `:splat*` child, so `articles/new` wins over `articles/:id`.
#[derive(Default)]
pub struct TrieMatcher {
    root: TrieNode,
    routes: HashMap<StateId, Route>,
}

#[derive(Default)]
struct TrieNode {
    /// Static children, keyed by segment text.
    children: HashMap<String, TrieNode>,
    /// `:param` child: matches exactly one segment.
    param: Option<Box<TrieNode>>,
    /// `:splat*` child: matches every remaining segment.
    splat: Option<Box<TrieNode>>,
    /// States whose route terminates here.
    states: Vec<StateId>,
}

impl TrieMatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

impl PathMatcher for TrieMatcher {
    fn add_route(&mut self, state: StateId, route: &Route) -> Result<(), RouteError> {
        let mut node = &mut self.root;
        for segment in &route.segments {
            node = match segment {
                Segment::Static(s) => node.children.entry(s.clone()).or_default(),
                Segment::Param(_) => &mut **node.param.get_or_insert_with(Box::default),
                Segment::Splat(_) => &mut **node.splat.get_or_insert_with(Box::default),
            };
        }
        node.states.push(state);
        self.routes.insert(state, route.clone());
        Ok(())
    }

    fn find(&self, path_query: &str) -> Option<RouteMatch> {
        let (path, query) = match path_query.split_once('?') {
            Some((p, q)) => (p, q),
            None => (path_query, ""),
        };
        let path = path.split('#').next().unwrap_or_default();
        let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();

        let mut captures = Vec::new();
        let state = self.root.find(&segments, &mut captures)?;
        let route = self.routes.get(&state)?;

        let mut params = Params::new();
        for (name, raw) in route.params().zip(captures) {
            params.insert(name, decode_capture(&raw)?);
        }
        for (key, value) in parse_query(query) {
            if route.query.iter().any(|q| *q == key) {
                params.insert(&key, value);
            }
        }
        Some(RouteMatch { state, params })
    }

    fn interpolate(&self, state: StateId, params: &Params) -> Result<String, RouteError> {
        let route = self
            .routes
            .get(&state)
            .ok_or_else(|| RouteError::StateNotFound(format!("#{}", state.0)))?;

        let mut parts = Vec::with_capacity(route.segments.len());
        for segment in &route.segments {
            match segment {
                Segment::Static(s) => parts.push(s.clone()),
                Segment::Param(name) => {
                    let value = required(route, name, params)?;
                    parts.push(urlencoding::encode(value).into_owned());
                }
                Segment::Splat(name) => {
                    let value = required(route, name, params)?;
                    let encoded = value
                        .split('/')
                        .filter(|s| !s.is_empty())
                        .map(|s| urlencoding::encode(s).into_owned())
                        .collect::<Vec<_>>()
                        .join("/");
                    if !encoded.is_empty() {
                        parts.push(encoded);
                    }
                }
            }
        }

        let mut url = format!("/{}", parts.join("/"));
        let query = format_query(
            route
                .query
                .iter()
                .filter_map(|q| params.get(q).map(|v| (q.as_str(), v))),
        );
        if !query.is_empty() {
            url.push('?');
            url.push_str(&query);
        }
        Ok(url)
    }
}

impl TrieNode {
    fn find(&self, segments: &[&str], captures: &mut Vec<String>) -> Option<StateId> {
        let Some((first, rest)) = segments.split_first() else {
            if let Some(&state) = self.states.first() {
                return Some(state);
            }
            // A splat also matches zero remaining segments.
            if let Some(&state) = self.splat.as_ref().and_then(|s| s.states.first()) {
                captures.push(String::new());
                return Some(state);
            }
            return None;
        };

        if let Some(child) = self.children.get(*first) {
            if let Some(state) = child.find(rest, captures) {
                return Some(state);
            }
        }

        if let Some(param) = &self.param {
            captures.push(first.to_string());
            if let Some(state) = param.find(rest, captures) {
                return Some(state);
            }
            captures.pop();
        }

        if let Some(&state) = self.splat.as_ref().and_then(|s| s.states.first()) {
            captures.push(segments.join("/"));
            return Some(state);
        }

        None
    }
}

/// Percent-decode a capture; splat captures are decoded per segment.
fn decode_capture(raw: &str) -> Option<String> {
    raw.split('/')
        .map(|s| urlencoding::decode(s).ok().map(|c| c.into_owned()))
        .collect::<Option<Vec<_>>>()
        .map(|parts| parts.join("/"))
}

fn required<'p>(route: &Route, name: &str, params: &'p Params) -> Result<&'p str, RouteError> {
    params.get(name).ok_or_else(|| RouteError::MissingParam {
        state: route.path(),
        param: name.to_string(),
    })
}
