//! The path tree: a compact trie over path segments with static, wildcard
//! and catch-all children, plus a backtracking lookup.
//!
//! Unlike a `matchit`-based router (which returns the single best match per
//! `matchit`'s own precedence rules), this tree must support *several*
//! routes sharing one path shape, disambiguated by non-path predicates
//! evaluated by the caller. That needs backtracking across siblings when a
//! caller-supplied matcher rejects a candidate leaf, which `matchit` does
//! not expose — hence a bespoke implementation rather than a thin wrapper.

use std::collections::HashMap;

/// One node of the tree. Static children are stored as a byte-compacted
/// radix node (longest common prefix at this level); at most one wildcard
/// child and one catch-all child hang off each node.
struct Node<V> {
    prefix: Vec<u8>,
    values: Vec<V>,
    statics: Vec<Node<V>>,
    wildcard: Option<(String, Box<Node<V>>)>,
    catch_all: Option<(String, Vec<V>)>,
}

impl<V> Node<V> {
    fn new(prefix: Vec<u8>) -> Self {
        Self { prefix, values: Vec::new(), statics: Vec::new(), wildcard: None, catch_all: None }
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum InsertError {
    #[error("':' or '*' may not appear in the middle of a path segment")]
    EmbeddedWildcard,
    #[error("a catch-all with a different name is already registered at this node")]
    ConflictingCatchAll,
    #[error("wildcard names must match positionally with existing routes at this node")]
    ConflictingWildcardName,
}

pub struct PathTree<V> {
    root: Node<V>,
}

impl<V> Default for PathTree<V> {
    fn default() -> Self {
        Self { root: Node::new(Vec::new()) }
    }
}

impl<V> PathTree<V> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts `value` at `path`. `path` segments starting with `:` create
    /// wildcard subtrees; a segment that is exactly `*name` creates a
    /// catch-all. See the module docs for the precise rules.
    pub fn insert(&mut self, path: &str, value: V) -> Result<(), InsertError> {
        let segments = split_segments(path);
        insert_segments(&mut self.root, &segments, value)
    }

    /// Descends the tree trying, at each node, static match first, then
    /// wildcard, then catch-all; at a reached leaf, calls `matcher` with
    /// the slice of values stored there together with the path parameters
    /// captured along the way. If `matcher` returns `false` the search
    /// backtracks to the next untried branch.
    pub fn lookup<'v, F>(&'v self, path: &str, mut matcher: F) -> Option<(&'v [V], HashMap<String, String>)>
    where
        F: FnMut(&[V]) -> bool,
    {
        let segments = split_segments(path);
        let mut params = HashMap::new();
        lookup_segments(&self.root, &segments, &mut params, &mut matcher).map(|vs| (vs, params))
    }

    /// Total number of values stored in the tree, across every leaf,
    /// wildcard and catch-all. Used for diagnostics/metrics only.
    pub fn len(&self) -> usize {
        count_node(&self.root)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn count_node<V>(node: &Node<V>) -> usize {
    let mut total = node.values.len();
    for child in &node.statics {
        total += count_node(child);
    }
    if let Some((_, child)) = &node.wildcard {
        total += count_node(child);
    }
    if let Some((_, values)) = &node.catch_all {
        total += values.len();
    }
    total
}

fn split_segments(path: &str) -> Vec<&str> {
    path.split('/').filter(|s| !s.is_empty()).collect()
}

fn insert_segments<V>(node: &mut Node<V>, segments: &[&str], value: V) -> Result<(), InsertError> {
    let Some((head, rest)) = segments.split_first() else {
        node.values.push(value);
        return Ok(());
    };

    if let Some(name) = head.strip_prefix('*') {
        validate_segment_text(&head[1..])?;
        match &mut node.catch_all {
            Some((existing, values)) if existing == name => {
                values.push(value);
            }
            Some(_) => {
                return Err(InsertError::ConflictingCatchAll);
            }
            None => {
                node.catch_all = Some((name.to_string(), vec![value]));
            }
        }
        return Ok(());
    }

    if let Some(name) = head.strip_prefix(':') {
        validate_segment_text(&head[1..])?;
        match &mut node.wildcard {
            Some((existing, child)) if existing == name => {
                insert_segments(child, rest, value)?;
            }
            Some((existing, _)) if existing != name => {
                return Err(InsertError::ConflictingWildcardName);
            }
            _ => {
                let mut child = Node::new(Vec::new());
                insert_segments(&mut child, rest, value)?;
                node.wildcard = Some((name.to_string(), Box::new(child)));
            }
        }
        return Ok(());
    }

    validate_segment_text(head)?;
    insert_static(node, head.as_bytes(), rest, value)
}

/// Rejects a bare `:`/`*` embedded after the first character of a segment
/// (the leading sigil was already stripped by the caller); this also
/// catches the case of `foo:bar` or `foo*bar`, which are not wildcard
/// syntax at all.
fn validate_segment_text(text: &str) -> Result<(), InsertError> {
    if text.contains(':') || text.contains('*') {
        return Err(InsertError::EmbeddedWildcard);
    }
    Ok(())
}

fn insert_static<V>(
    node: &mut Node<V>,
    segment: &[u8],
    rest: &[&str],
    value: V,
) -> Result<(), InsertError> {
    for child in node.statics.iter_mut() {
        let common = common_prefix_len(&child.prefix, segment);
        if common == 0 {
            continue;
        }

        if common == child.prefix.len() && common == segment.len() {
            return insert_segments(child, rest, value);
        }

        if common == child.prefix.len() {
            // existing prefix fully consumed, segment continues: descend
            // as if the remainder were the next "segment" at this node by
            // wrapping it into a synthetic single-piece path.
            return insert_static_segment_remainder(child, &segment[common..], rest, value);
        }

        if common == segment.len() {
            // segment is a strict prefix of the existing child: split.
            split_child(child, common);
            child.values.push(value_if_terminal(rest, value));
            return Ok(());
        }

        // partial common prefix: split the existing child at `common`,
        // then insert the new branch alongside it.
        split_child(child, common);
        let mut new_branch = Node::new(segment[common..].to_vec());
        insert_static_terminal(&mut new_branch, rest, value)?;
        child.statics.push(new_branch);
        sort_statics(&mut child.statics);
        return Ok(());
    }

    // no existing child shares a prefix byte; add a fresh one.
    let mut new_child = Node::new(segment.to_vec());
    insert_static_terminal(&mut new_child, rest, value)?;
    node.statics.push(new_child);
    sort_statics(&mut node.statics);
    Ok(())
}

fn value_if_terminal<V>(rest: &[&str], value: V) -> V {
    // Only called when `rest` is empty by construction of the call sites
    // that need a plain value push; kept as a named seam for clarity.
    debug_assert!(rest.is_empty());
    value
}

fn insert_static_terminal<V>(node: &mut Node<V>, rest: &[&str], value: V) -> Result<(), InsertError> {
    insert_segments(node, rest, value)
}

fn insert_static_segment_remainder<V>(
    node: &mut Node<V>,
    remainder: &[u8],
    rest: &[&str],
    value: V,
) -> Result<(), InsertError> {
    if remainder.is_empty() {
        return insert_segments(node, rest, value);
    }
    insert_static(node, remainder, rest, value)
}

fn split_child<V>(child: &mut Node<V>, at: usize) {
    if at == child.prefix.len() {
        return;
    }
    let tail = child.prefix.split_off(at);
    let mut grandchild = Node::new(tail);
    std::mem::swap(&mut grandchild.values, &mut child.values);
    std::mem::swap(&mut grandchild.statics, &mut child.statics);
    std::mem::swap(&mut grandchild.wildcard, &mut child.wildcard);
    std::mem::swap(&mut grandchild.catch_all, &mut child.catch_all);
    child.statics.push(grandchild);
}

fn common_prefix_len(a: &[u8], b: &[u8]) -> usize {
    a.iter().zip(b.iter()).take_while(|(x, y)| x == y).count()
}

/// Longer static prefixes win; ties keep their original relative order
/// (stable sort), which preserves insertion priority for equal-length
/// prefixes.
fn sort_statics<V>(statics: &mut [Node<V>]) {
    statics.sort_by(|a, b| b.prefix.len().cmp(&a.prefix.len()));
}

fn lookup_segments<'v, V, F>(
    node: &'v Node<V>,
    segments: &[&str],
    params: &mut HashMap<String, String>,
    matcher: &mut F,
) -> Option<&'v [V]>
where
    F: FnMut(&[V]) -> bool,
{
    if segments.is_empty() {
        if !node.values.is_empty() && matcher(&node.values) {
            return Some(&node.values);
        }
        // A leaf with no segments left may still have a wildcard/catch-all
        // capturing the empty remainder (e.g. a catch-all matching zero
        // extra segments); fall through to try those below.
    } else {
        let (head, rest) = segments.split_first().unwrap();
        if let Some(found) = lookup_static_bytes(node, head.as_bytes(), rest, params, matcher) {
            return Some(found);
        }
    }

    if let Some((name, child)) = &node.wildcard {
        if let Some((head, rest)) = segments.split_first() {
            let mut trial = params.clone();
            trial.insert(name.clone(), percent_decode(head));
            if let Some(found) = lookup_segments(child, rest, &mut trial, matcher) {
                *params = trial;
                return Some(found);
            }
        }
    }

    if let Some((name, values)) = &node.catch_all {
        if !values.is_empty() && matcher(values) {
            params.insert(name.clone(), percent_decode(&segments.join("/")));
            return Some(values);
        }
    }

    None
}

/// Walks `node`'s static children looking for one whose compacted prefix is
/// a byte-prefix of `remainder` (the still-unmatched tail of the current
/// path segment). A child may consume the whole remainder (in which case
/// the search continues with `future_segments`) or only part of it (in
/// which case the search continues one level deeper, inside that child's
/// own static children, against the leftover bytes of the *same* segment) —
/// mirroring how [`insert_static`] splits a node at a byte offset that need
/// not land on a segment boundary.
fn lookup_static_bytes<'v, V, F>(
    node: &'v Node<V>,
    remainder: &[u8],
    future_segments: &[&str],
    params: &mut HashMap<String, String>,
    matcher: &mut F,
) -> Option<&'v [V]>
where
    F: FnMut(&[V]) -> bool,
{
    for child in &node.statics {
        if remainder.len() < child.prefix.len() || &remainder[..child.prefix.len()] != child.prefix.as_slice() {
            continue;
        }
        let leftover = &remainder[child.prefix.len()..];
        let mut trial = params.clone();
        let found = if leftover.is_empty() {
            lookup_segments(child, future_segments, &mut trial, matcher)
        } else {
            lookup_static_bytes(child, leftover, future_segments, &mut trial, matcher)
        };
        if let Some(found) = found {
            *params = trial;
            return Some(found);
        }
    }
    None
}

/// Decodes `%XX` percent-escapes; segment text is otherwise returned
/// verbatim. Captured wildcard/catch-all text is always URL-decoded before
/// being handed back to the caller.
fn percent_decode(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            if let (Some(hi), Some(lo)) = (hex_val(bytes[i + 1]), hex_val(bytes[i + 2])) {
                out.push(hi * 16 + lo);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8(out).unwrap_or_else(|_| s.to_string())
}

fn hex_val(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}

/// Literal-pattern matching helper used by [`crate::predicate::PathPredicate`]
/// for a `Path(...)` predicate evaluated outside tree compilation (e.g.
/// re-checked after a loopback rewrite). Supports the same `:name`/`*name`
/// syntax as [`PathTree::insert`].
pub fn path_matches_pattern(pattern: &str, path: &str) -> bool {
    let pat_segments = split_segments(pattern);
    let path_segments = split_segments(path);
    matches_segments(&pat_segments, &path_segments)
}

fn matches_segments(pattern: &[&str], path: &[&str]) -> bool {
    match pattern.split_first() {
        None => path.is_empty(),
        Some((head, rest)) if head.starts_with('*') => {
            let _ = rest;
            true
        }
        Some((head, rest)) if head.starts_with(':') => match path.split_first() {
            Some((_, path_rest)) => matches_segments(rest, path_rest),
            None => false,
        },
        Some((head, rest)) => match path.split_first() {
            Some((p_head, path_rest)) if p_head == head => matches_segments(rest, path_rest),
            _ => false,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_then_lookup_roundtrips() {
        let mut tree = PathTree::new();
        tree.insert("/a/:id/b", "leaf").unwrap();
        let (values, params) = tree.lookup("/a/42/b", |_| true).unwrap();
        assert_eq!(values, ["leaf"]);
        assert_eq!(params.get("id").map(|s| s.as_str()), Some("42"));
    }

    #[test]
    fn catch_all_captures_remainder_and_decodes() {
        let mut tree = PathTree::new();
        tree.insert("/files/*rest", "leaf").unwrap();
        let (values, params) = tree.lookup("/files/a%2Fb/c", |_| true).unwrap();
        assert_eq!(values, ["leaf"]);
        assert_eq!(params.get("rest").map(|s| s.as_str()), Some("a/b/c"));
    }

    #[test]
    fn single_catch_all_route_matches_every_path() {
        let mut tree = PathTree::new();
        tree.insert("/*rest", "leaf").unwrap();
        assert!(tree.lookup("/anything/at/all", |_| true).is_some());
        assert!(tree.lookup("/", |_| true).is_some());
    }

    #[test]
    fn static_wins_over_wildcard_at_same_node() {
        let mut tree = PathTree::new();
        tree.insert("/users/:id", "wild").unwrap();
        tree.insert("/users/me", "static").unwrap();
        let (values, _) = tree.lookup("/users/me", |_| true).unwrap();
        assert_eq!(values, ["static"]);
        let (values, params) = tree.lookup("/users/42", |_| true).unwrap();
        assert_eq!(values, ["wild"]);
        assert_eq!(params.get("id").map(|s| s.as_str()), Some("42"));
    }

    #[test]
    fn backtracks_past_a_leaf_the_matcher_rejects() {
        let mut tree = PathTree::new();
        tree.insert("/users/:id", "wild").unwrap();
        tree.insert("/users/*rest", "catch").unwrap();
        // matcher rejects the wildcard leaf, forcing a fall-through to catch-all.
        let (values, _) = tree.lookup("/users/42", |v| v != ["wild"]).unwrap();
        assert_eq!(values, ["catch"]);
    }

    #[test]
    fn conflicting_wildcard_names_are_rejected_and_existing_route_survives() {
        let mut tree = PathTree::new();
        tree.insert("/a/:id", "first").unwrap();
        let err = tree.insert("/a/:other", "second").unwrap_err();
        assert_eq!(err, InsertError::ConflictingWildcardName);
        let (values, _) = tree.lookup("/a/1", |_| true).unwrap();
        assert_eq!(values, ["first"]);
    }

    #[test]
    fn conflicting_catch_all_names_are_rejected() {
        let mut tree = PathTree::new();
        tree.insert("/a/*rest", "first").unwrap();
        let err = tree.insert("/a/*other", "second").unwrap_err();
        assert_eq!(err, InsertError::ConflictingCatchAll);
    }

    #[test]
    fn embedded_sigil_mid_segment_is_rejected() {
        let mut tree = PathTree::new();
        let err = tree.insert("/a/b:c", "v").unwrap_err();
        assert_eq!(err, InsertError::EmbeddedWildcard);
    }

    #[test]
    fn empty_tree_never_matches() {
        let tree: PathTree<&str> = PathTree::new();
        assert!(tree.lookup("/anything", |_| true).is_none());
    }

    #[test]
    fn partial_byte_prefix_split_within_one_segment_is_still_reachable() {
        // "car" and "cat" share a two-byte prefix, forcing insert_static to
        // split the node at a byte offset that does not land on a segment
        // boundary; both full words must still resolve correctly.
        let mut tree = PathTree::new();
        tree.insert("/car", "car_val").unwrap();
        tree.insert("/cat", "cat_val").unwrap();
        tree.insert("/ca", "ca_val").unwrap();
        assert_eq!(tree.lookup("/car", |_| true).unwrap().0, ["car_val"]);
        assert_eq!(tree.lookup("/cat", |_| true).unwrap().0, ["cat_val"]);
        assert_eq!(tree.lookup("/ca", |_| true).unwrap().0, ["ca_val"]);
        assert!(tree.lookup("/c", |_| true).is_none());
    }

    #[test]
    fn shared_prefix_routes_both_reachable() {
        let mut tree = PathTree::new();
        tree.insert("/api/users", "users").unwrap();
        tree.insert("/api/orders", "orders").unwrap();
        assert_eq!(tree.lookup("/api/users", |_| true).unwrap().0, ["users"]);
        assert_eq!(tree.lookup("/api/orders", |_| true).unwrap().0, ["orders"]);
    }
}
