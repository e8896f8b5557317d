//! Endpoint declarations.
//!
//! An `Endpoint` is a closed description of one remote operation: method,
//! path template, the tags a query provides and the tags a mutation
//! invalidates. Declarations are validated once, when built, so a malformed
//! path or tag is a startup error rather than a failure on first use.

use reqwest::{Method, Url};
use serde_json::{Map, Value};

use super::{EndpointError, QueryError};
use crate::cache::{CacheKey, Tag};

/// Applied to every successful response body before it is cached or returned.
pub type Transform = fn(Value) -> Result<Value, QueryError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointKind {
    Query,
    Mutation,
}

/// How one tag is derived from the request arguments and the response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TagTemplate {
    /// `(kind, *)`
    All { kind: String },
    /// A fixed `(kind, id)`
    Id { kind: String, id: String },
    /// `(kind, args[field])`; falls back to `(kind, *)` when the field is missing
    FromArg { kind: String, field: String },
    /// `(kind, item[field])` for every item of an array response, or for the
    /// response itself when it is a single object
    EachResult { kind: String, field: String },
}

impl TagTemplate {
    pub fn all(kind: impl Into<String>) -> Self {
        TagTemplate::All { kind: kind.into() }
    }

    pub fn id(kind: impl Into<String>, id: impl Into<String>) -> Self {
        TagTemplate::Id {
            kind: kind.into(),
            id: id.into(),
        }
    }

    pub fn from_arg(kind: impl Into<String>, field: impl Into<String>) -> Self {
        TagTemplate::FromArg {
            kind: kind.into(),
            field: field.into(),
        }
    }

    pub fn each_result(kind: impl Into<String>, field: impl Into<String>) -> Self {
        TagTemplate::EachResult {
            kind: kind.into(),
            field: field.into(),
        }
    }

    pub fn kind(&self) -> &str {
        match self {
            TagTemplate::All { kind }
            | TagTemplate::Id { kind, .. }
            | TagTemplate::FromArg { kind, .. }
            | TagTemplate::EachResult { kind, .. } => kind,
        }
    }

    fn resolve(&self, args: &Value, result: Option<&Value>, out: &mut Vec<Tag>) {
        match self {
            TagTemplate::All { kind } => out.push(Tag::all(kind.as_str())),
            TagTemplate::Id { kind, id } => out.push(Tag::new(kind.as_str(), id.as_str())),
            TagTemplate::FromArg { kind, field } => match args.get(field).and_then(scalar_id) {
                Some(id) => out.push(Tag::new(kind.as_str(), id)),
                None => out.push(Tag::all(kind.as_str())),
            },
            TagTemplate::EachResult { kind, field } => {
                let items: &[Value] = match result {
                    Some(Value::Array(items)) => items,
                    Some(single @ Value::Object(_)) => std::slice::from_ref(single),
                    _ => &[],
                };
                for item in items {
                    if let Some(id) = item.get(field).and_then(scalar_id) {
                        out.push(Tag::new(kind.as_str(), id));
                    }
                }
            }
        }
    }
}

/// String form of an id-like JSON value
pub(crate) fn scalar_id(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Param(String),
}

/// `/shops/{id}/approve`: placeholders must span a whole path segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathTemplate {
    raw: String,
    segments: Vec<Segment>,
}

impl PathTemplate {
    fn parse(endpoint: &str, path: &str) -> Result<Self, EndpointError> {
        if !path.starts_with('/') {
            return Err(EndpointError::RelativePath {
                endpoint: endpoint.to_string(),
                path: path.to_string(),
            });
        }

        let malformed = || EndpointError::MalformedTemplate {
            endpoint: endpoint.to_string(),
            path: path.to_string(),
        };

        let mut segments = Vec::new();
        for part in path[1..].split('/').filter(|p| !p.is_empty()) {
            if let Some(name) = part.strip_prefix('{').and_then(|p| p.strip_suffix('}')) {
                if !is_identifier(name) {
                    return Err(malformed());
                }
                if segments.contains(&Segment::Param(name.to_string())) {
                    return Err(EndpointError::DuplicatePlaceholder {
                        endpoint: endpoint.to_string(),
                        name: name.to_string(),
                    });
                }
                segments.push(Segment::Param(name.to_string()));
            } else if part.contains(['{', '}']) {
                return Err(malformed());
            } else {
                segments.push(Segment::Literal(part.to_string()));
            }
        }

        Ok(Self {
            raw: path.to_string(),
            segments,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn params(&self) -> impl Iterator<Item = &str> {
        self.segments.iter().filter_map(|s| match s {
            Segment::Param(name) => Some(name.as_str()),
            Segment::Literal(_) => None,
        })
    }

    /// Append the expanded path to `base`, consuming the placeholder fields from `args`.
    pub fn expand(&self, base: &Url, args: &mut Map<String, Value>) -> Result<Url, QueryError> {
        let mut url = base.clone();
        {
            let mut path = url
                .path_segments_mut()
                .map_err(|_| QueryError::Validation(format!("Base URL {} cannot take a path", base)))?;
            path.pop_if_empty();
            for segment in &self.segments {
                match segment {
                    Segment::Literal(literal) => {
                        path.push(literal);
                    }
                    Segment::Param(name) => {
                        let value = args.remove(name).ok_or_else(|| {
                            QueryError::Validation(format!("Missing path argument '{}' for {}", name, self.raw))
                        })?;
                        let id = scalar_id(&value).ok_or_else(|| {
                            QueryError::Validation(format!(
                                "Path argument '{}' must be a non-empty string or number",
                                name
                            ))
                        })?;
                        path.push(&id);
                    }
                }
            }
        }
        Ok(url)
    }
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

#[derive(Debug, Clone)]
pub struct Endpoint {
    name: String,
    kind: EndpointKind,
    method: Method,
    path: PathTemplate,
    provides: Vec<TagTemplate>,
    invalidates: Vec<TagTemplate>,
    user_scoped: bool,
    transform: Option<Transform>,
}

impl Endpoint {
    /// Cacheable GET endpoint
    pub fn query(name: impl Into<String>, path: impl Into<String>) -> EndpointBuilder {
        EndpointBuilder::new(name.into(), EndpointKind::Query, Method::GET, path.into())
    }

    /// Write endpoint whose success invalidates tags
    pub fn mutation(name: impl Into<String>, method: Method, path: impl Into<String>) -> EndpointBuilder {
        EndpointBuilder::new(name.into(), EndpointKind::Mutation, method, path.into())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> EndpointKind {
        self.kind
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn path(&self) -> &PathTemplate {
        &self.path
    }

    /// Whether responses depend on who is signed in
    pub fn is_user_scoped(&self) -> bool {
        self.user_scoped
    }

    pub fn key(&self, args: &Value) -> CacheKey {
        CacheKey::new(&self.name, args)
    }

    pub fn provided_tags(&self, args: &Value, result: &Value) -> Vec<Tag> {
        let mut tags = Vec::new();
        for template in &self.provides {
            template.resolve(args, Some(result), &mut tags);
        }
        tags
    }

    pub fn invalidated_tags(&self, args: &Value, result: Option<&Value>) -> Vec<Tag> {
        let mut tags = Vec::new();
        for template in &self.invalidates {
            template.resolve(args, result, &mut tags);
        }
        tags
    }

    /// Every tag kind this endpoint provides or invalidates
    pub fn tag_kinds(&self) -> impl Iterator<Item = &str> {
        self.provides
            .iter()
            .chain(self.invalidates.iter())
            .map(TagTemplate::kind)
    }

    pub fn transform_response(&self, body: Value) -> Result<Value, QueryError> {
        match self.transform {
            Some(transform) => transform(body),
            None => Ok(body),
        }
    }
}

#[derive(Debug, Clone)]
pub struct EndpointBuilder {
    name: String,
    kind: EndpointKind,
    method: Method,
    path: String,
    provides: Vec<TagTemplate>,
    invalidates: Vec<TagTemplate>,
    user_scoped: bool,
    transform: Option<Transform>,
}

impl EndpointBuilder {
    fn new(name: String, kind: EndpointKind, method: Method, path: String) -> Self {
        Self {
            name,
            kind,
            method,
            path,
            provides: Vec::new(),
            invalidates: Vec::new(),
            user_scoped: true,
            transform: None,
        }
    }

    pub fn method(mut self, method: Method) -> Self {
        self.method = method;
        self
    }

    pub fn provides(mut self, tag: TagTemplate) -> Self {
        self.provides.push(tag);
        self
    }

    pub fn invalidates(mut self, tag: TagTemplate) -> Self {
        self.invalidates.push(tag);
        self
    }

    /// Responses are the same for every user; kept across logout.
    pub fn public(mut self) -> Self {
        self.user_scoped = false;
        self
    }

    pub fn transform(mut self, transform: Transform) -> Self {
        self.transform = Some(transform);
        self
    }

    pub fn build(self) -> Result<Endpoint, EndpointError> {
        if self.name.trim().is_empty() {
            return Err(EndpointError::EmptyName);
        }
        let path = PathTemplate::parse(&self.name, &self.path)?;

        if self.kind == EndpointKind::Query {
            if self.method != Method::GET {
                return Err(EndpointError::QueryMethod { endpoint: self.name });
            }
            if !self.invalidates.is_empty() {
                return Err(EndpointError::QueryInvalidates { endpoint: self.name });
            }
        }
        if self
            .provides
            .iter()
            .chain(self.invalidates.iter())
            .any(|t| t.kind().trim().is_empty())
        {
            return Err(EndpointError::EmptyTagKind { endpoint: self.name });
        }

        Ok(Endpoint {
            name: self.name,
            kind: self.kind,
            method: self.method,
            path,
            provides: self.provides,
            invalidates: self.invalidates,
            user_scoped: self.user_scoped,
            transform: self.transform,
        })
    }
}
