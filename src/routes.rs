/// Path matching for API definitions
use anyhow::{anyhow, Result};
use smallstr::SmallString;
use std::borrow::Cow;
use std::collections::HashMap;

type SegmentKey = SmallString<[u8; 16]>;

/// One parsed segment of an API path pattern
#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment<'a> {
    /// Must equal the request segment
    Literal(&'a str),
    /// `{name}` or `:name`, captures one segment
    Param(&'a str),
    /// `*`, matches one segment without capturing
    Wildcard,
    /// `**` or `{name:*}`, matches the rest of the path
    CatchAll(Option<&'a str>),
}

fn parse_segment(segment: &str) -> Result<Segment<'_>> {
    if segment == "*" {
        return Ok(Segment::Wildcard);
    }
    if segment == "**" {
        return Ok(Segment::CatchAll(None));
    }
    if let Some(name) = segment.strip_prefix(':') {
        return named(segment, name).map(Segment::Param);
    }
    if let Some(inner) = segment.strip_prefix('{').and_then(|s| s.strip_suffix('}')) {
        return match inner.strip_suffix(":*") {
            Some(name) => named(segment, name).map(|n| Segment::CatchAll(Some(n))),
            None => named(segment, inner).map(Segment::Param),
        };
    }
    if segment.contains(['{', '}']) {
        return Err(anyhow!("Malformed path segment '{}'", segment));
    }
    Ok(Segment::Literal(segment))
}

fn named<'a>(segment: &str, name: &'a str) -> Result<&'a str> {
    if name.is_empty() || name.contains(['{', '}', ':', '*']) {
        return Err(anyhow!("Invalid parameter name in segment '{}'", segment));
    }
    Ok(name)
}

fn split_path(path: &str) -> impl Iterator<Item = &str> {
    path.split('/').filter(|s| !s.is_empty())
}

/// Segment trie mapping paths to API ids
///
/// At every level a literal child is tried first, then parameters, then the
/// anonymous wildcard, then a catch-all; a dead end backtracks to the next
/// candidate, so the most specific pattern wins.
#[derive(Debug, Clone, Default)]
pub struct RouteTrieNode {
    /// API whose pattern ends exactly here
    api: Option<u64>,
    /// Literal children
    children: HashMap<SegmentKey, Box<RouteTrieNode>>,
    /// Parameter children, in insertion order
    params: Vec<(SegmentKey, Box<RouteTrieNode>)>,
    /// Anonymous single-segment wildcard
    wildcard_child: Option<Box<RouteTrieNode>>,
    /// Tail match: optional capture name and API id
    catch_all: Option<(Option<SegmentKey>, u64)>,
}

impl RouteTrieNode {
    fn insert(&mut self, segments: &[Segment<'_>], api: u64) -> Result<()> {
        let Some((segment, remaining)) = segments.split_first() else {
            return match self.api {
                Some(existing) => Err(anyhow!(
                    "API {} has the same path pattern as API {}",
                    api,
                    existing
                )),
                None => {
                    self.api = Some(api);
                    Ok(())
                }
            };
        };

        match segment {
            Segment::Literal(literal) => self
                .children
                .entry(SegmentKey::from_str(literal))
                .or_default()
                .insert(remaining, api),
            Segment::Param(name) => {
                let position = self.params.iter().position(|(n, _)| n.as_str() == *name);
                let index = match position {
                    Some(index) => index,
                    None => {
                        self.params.push((SegmentKey::from_str(name), Box::default()));
                        self.params.len() - 1
                    }
                };
                self.params[index].1.insert(remaining, api)
            }
            Segment::Wildcard => self
                .wildcard_child
                .get_or_insert_with(Box::default)
                .insert(remaining, api),
            Segment::CatchAll(name) => {
                if !remaining.is_empty() {
                    return Err(anyhow!("Catch-all must be the last path segment"));
                }
                if let Some((_, existing)) = self.catch_all {
                    return Err(anyhow!(
                        "API {} has the same catch-all pattern as API {}",
                        api,
                        existing
                    ));
                }
                self.catch_all = Some((name.map(SegmentKey::from_str), api));
                Ok(())
            }
        }
    }

    fn find<'t, 'p>(
        &'t self,
        segments: &[&'p str],
        captured: &mut Vec<(&'t str, Cow<'p, str>)>,
    ) -> Option<u64> {
        let Some((segment, remaining)) = segments.split_first() else {
            return self.api.or_else(|| self.catch_all_match(segments, captured));
        };

        let key = SegmentKey::from_str(segment);
        if let Some(child) = self.children.get(&key) {
            if let Some(api) = child.find(remaining, captured) {
                return Some(api);
            }
        }

        for (name, child) in &self.params {
            captured.push((name.as_str(), Cow::Borrowed(*segment)));
            if let Some(api) = child.find(remaining, captured) {
                return Some(api);
            }
            captured.pop();
        }

        if let Some(child) = &self.wildcard_child {
            if let Some(api) = child.find(remaining, captured) {
                return Some(api);
            }
        }

        self.catch_all_match(segments, captured)
    }

    fn catch_all_match<'t, 'p>(
        &'t self,
        segments: &[&'p str],
        captured: &mut Vec<(&'t str, Cow<'p, str>)>,
    ) -> Option<u64> {
        let (name, api) = self.catch_all.as_ref()?;
        if let Some(name) = name {
            let value = match segments {
                [single] => Cow::Borrowed(*single),
                _ => Cow::Owned(segments.join("/")),
            };
            captured.push((name.as_str(), value));
        }
        Some(*api)
    }
}

/// Route table over API path patterns
#[derive(Debug, Clone, Default)]
pub struct RouteTrie {
    root: RouteTrieNode,
    len: usize,
}

impl RouteTrie {
    /// Create an empty route table
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `pattern` for `api`
    pub fn insert(&mut self, pattern: &str, api: u64) -> Result<()> {
        let segments = split_path(pattern)
            .map(parse_segment)
            .collect::<Result<Vec<_>>>()
            .map_err(|e| anyhow!("Invalid path pattern '{}': {}", pattern, e))?;
        self.root.insert(&segments, api)?;
        self.len += 1;
        Ok(())
    }

    /// Find the API matching `path`
    ///
    /// `on_param` is called once per parameter of the winning match, after
    /// backtracking settled; abandoned branches report nothing.
    pub fn find(&self, path: &str, mut on_param: impl FnMut(&str, &str)) -> Option<u64> {
        let segments: Vec<&str> = split_path(path).collect();
        let mut captured = Vec::new();
        let api = self.root.find(&segments, &mut captured)?;
        for (name, value) in &captured {
            on_param(name, value);
        }
        Some(api)
    }

    /// Number of registered patterns
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether no pattern is registered
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// Convert a glob-like pattern to a regex pattern
pub fn glob_to_regex(pattern: &str) -> String {
    let mut regex = String::with_capacity(pattern.len() * 2);
    regex.push('^');

    let mut chars = pattern.chars().peekable();
    while let Some(ch) = chars.next() {
        match ch {
            '*' => {
                if chars.peek() == Some(&'*') {
                    chars.next();
                    regex.push_str(".*");
                } else {
                    regex.push_str("[^.]*");
                }
            }
            '?' => {
                regex.push('.');
            }
            // Escape regex special characters
            '.' | '+' | '(' | ')' | '{' | '}' | '[' | ']' | '^' | '$' | '|' | '\\' => {
                regex.push('\\');
                regex.push(ch);
            }
            _ => {
                regex.push(ch);
            }
        }
    }

    regex.push('$');
    regex
}
