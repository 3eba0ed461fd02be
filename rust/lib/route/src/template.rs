//! Path templates: `articles/:id?filter&sort`.
//!
//! The part before `?` is a `/`-separated list of segments:
//! - `articles`: static text
//! - `:id`: one path segment captured as param `id`
//! - `:rest*`: splat, captures the remaining path (must come last)
//!
//! The part after `?` lists the query params the state declares,
//! separated by `&`.

use std::fmt;

use crate::error::RouteError;

/// One path segment of a template.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Segment {
    Static(String),
    Param(String),
    Splat(String),
}

impl Segment {
    /// Param name, if this segment captures one.
    pub fn param(&self) -> Option<&str> {
        match self {
            Segment::Static(_) => None,
            Segment::Param(name) | Segment::Splat(name) => Some(name),
        }
    }

    /// Shape used for ambiguity checks: param names do not matter.
    pub(crate) fn shape(&self) -> &str {
        match self {
            Segment::Static(s) => s,
            Segment::Param(_) => ":",
            Segment::Splat(_) => "*",
        }
    }
}

impl fmt::Display for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Segment::Static(s) => f.write_str(s),
            Segment::Param(name) => write!(f, ":{name}"),
            Segment::Splat(name) => write!(f, ":{name}*"),
        }
    }
}

/// A single state's own template, parsed and validated.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PathTemplate {
    pub segments: Vec<Segment>,
    pub query: Vec<String>,
}

impl PathTemplate {
    pub fn parse(template: &str) -> Result<Self, RouteError> {
        let invalid = |reason: &str| RouteError::InvalidPath {
            template: template.to_string(),
            reason: reason.to_string(),
        };

        let (path, query) = match template.split_once('?') {
            Some((p, q)) => (p, Some(q)),
            None => (template, None),
        };

        let mut parsed = PathTemplate::default();
        let path = path.trim_matches('/');
        if !path.is_empty() {
            for raw in path.split('/') {
                if raw.is_empty() {
                    return Err(invalid("empty segment"));
                }
                let segment = match raw.strip_prefix(':') {
                    Some(name) => match name.strip_suffix('*') {
                        Some(name) => Segment::Splat(valid_name(name).ok_or_else(|| {
                            invalid(&format!("bad splat name '{name}'"))
                        })?),
                        None => Segment::Param(valid_name(name).ok_or_else(|| {
                            invalid(&format!("bad param name '{name}'"))
                        })?),
                    },
                    None => {
                        if raw.contains(['*', '?', '#', '&']) {
                            return Err(invalid(&format!("bad static segment '{raw}'")));
                        }
                        Segment::Static(raw.to_string())
                    }
                };
                parsed.segments.push(segment);
            }
        }

        if let Some(query) = query {
            for raw in query.split('&') {
                let name = valid_name(raw)
                    .ok_or_else(|| invalid(&format!("bad query param name '{raw}'")))?;
                parsed.query.push(name);
            }
        }

        let route = Route {
            segments: parsed.segments.clone(),
            query: parsed.query.clone(),
        };
        route.validate().map_err(|reason| invalid(&reason))?;
        Ok(parsed)
    }

    /// Path params declared by this template, in order.
    pub fn params(&self) -> impl Iterator<Item = &str> {
        self.segments.iter().filter_map(Segment::param)
    }

    pub fn is_pathless(&self) -> bool {
        self.segments.is_empty()
    }

    /// Whether this template declares `name` as a path or query param.
    pub fn owns(&self, name: &str) -> bool {
        self.params().any(|p| p == name) || self.query.iter().any(|q| q == name)
    }
}

/// The full route of a leaf state: every ancestor's segments, then its own,
/// and the union of all declared query params.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Route {
    pub segments: Vec<Segment>,
    pub query: Vec<String>,
}

impl Route {
    /// Path param names, in path order.
    pub fn params(&self) -> impl Iterator<Item = &str> {
        self.segments.iter().filter_map(Segment::param)
    }

    /// `/blog/articles/:id` form of the path part.
    pub fn path(&self) -> String {
        let joined = self
            .segments
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join("/");
        format!("/{joined}")
    }

    /// Path with params erased, used to detect overlapping leaves.
    pub(crate) fn shape(&self) -> String {
        let joined = self
            .segments
            .iter()
            .map(Segment::shape)
            .collect::<Vec<_>>()
            .join("/");
        format!("/{joined}")
    }

    /// Names unique, splat last.
    pub(crate) fn validate(&self) -> Result<(), String> {
        let mut seen: Vec<&str> = Vec::new();
        for (i, segment) in self.segments.iter().enumerate() {
            if let Segment::Splat(name) = segment {
                if i + 1 != self.segments.len() {
                    return Err(format!("splat ':{name}*' must be the last segment"));
                }
            }
            if let Some(name) = segment.param() {
                if seen.contains(&name) {
                    return Err(format!("param '{name}' declared twice"));
                }
                seen.push(name);
            }
        }
        for name in &self.query {
            if seen.contains(&name.as_str()) {
                return Err(format!("param '{name}' declared twice"));
            }
            seen.push(name);
        }
        Ok(())
    }
}

fn valid_name(name: &str) -> Option<String> {
    let ok = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    ok.then(|| name.to_string())
}
