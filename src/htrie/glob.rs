//! Glob path trie
//!
//! Each rule string is inserted byte by byte. A `*` becomes the distinguished
//! glob child of its parent and matches zero or more bytes, including `/`.
//! Nodes live in an arena and refer to each other by index so that the upper
//! and lower case slots of a case-insensitive trie can share one child.

use std::collections::HashMap;

use percent_encoding::{utf8_percent_encode, AsciiSet, CONTROLS};

use crate::error::RuleError;

/// Bytes escaped in a rule string, matching how a URL path is escaped
const PATH_ESCAPE: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'<')
    .add(b'>')
    .add(b'`')
    .add(b'{')
    .add(b'}');

type NodeId = u32;

const ROOT: NodeId = 0;

#[derive(Debug, Default)]
struct PathNode {
    children: HashMap<u8, NodeId>,
    glob: Option<NodeId>,
    /// Set while the node has exactly one distinct continuation
    only_child: Option<NodeId>,
    distinct_children: u32,
    byte: u8,
    is_glob: bool,
    can_match: bool,
}

#[derive(Debug)]
struct GlobTrie {
    nodes: Vec<PathNode>,
    icase: bool,
}

impl GlobTrie {
    fn new(icase: bool) -> Self {
        Self {
            nodes: vec![PathNode::default()],
            icase,
        }
    }

    fn node(&self, id: NodeId) -> &PathNode {
        &self.nodes[id as usize]
    }

    fn push(&mut self, parent: NodeId, node: PathNode) -> NodeId {
        let id = self.nodes.len() as NodeId;
        self.nodes.push(node);

        let parent = &mut self.nodes[parent as usize];
        parent.distinct_children += 1;
        parent.only_child = if parent.distinct_children == 1 {
            Some(id)
        } else {
            None
        };
        id
    }

    fn insert(&mut self, pattern: &str) {
        let mut cur = ROOT;
        for b in pattern.bytes() {
            cur = if b == b'*' {
                match self.node(cur).glob {
                    Some(next) => next,
                    None => {
                        let next = self.push(
                            cur,
                            PathNode {
                                byte: b,
                                is_glob: true,
                                ..PathNode::default()
                            },
                        );
                        self.nodes[cur as usize].glob = Some(next);
                        next
                    }
                }
            } else {
                self.literal_child(cur, b)
            };
        }
        self.nodes[cur as usize].can_match = true;
    }

    fn literal_child(&mut self, parent: NodeId, b: u8) -> NodeId {
        let key = if self.icase { b.to_ascii_lowercase() } else { b };
        if let Some(&next) = self.node(parent).children.get(&key) {
            return next;
        }

        let next = self.push(
            parent,
            PathNode {
                byte: key,
                ..PathNode::default()
            },
        );
        let children = &mut self.nodes[parent as usize].children;
        children.insert(key, next);
        if self.icase && key.is_ascii_alphabetic() {
            children.insert(key.to_ascii_uppercase(), next);
        }
        next
    }

    fn byte_eq(&self, node_byte: u8, input: u8) -> bool {
        if self.icase {
            node_byte == input.to_ascii_lowercase()
        } else {
            node_byte == input
        }
    }

    fn is_terminal(&self, id: NodeId) -> bool {
        let n = self.node(id);
        n.can_match || n.is_glob || n.glob.is_some_and(|g| self.node(g).can_match)
    }

    fn matches(&self, input: &[u8]) -> bool {
        self.walk_branch(ROOT, input, 0)
    }

    /// Walk literal edges from `start`, consuming `input[idx..]`
    fn walk_branch(&self, start: NodeId, input: &[u8], idx: usize) -> bool {
        let mut cur = start;
        for i in idx..input.len() {
            let node = self.node(cur);

            if let Some(glob) = node.glob {
                if self.glob_consume(glob, input, i) {
                    return true;
                }
            }

            if let Some(only) = node.only_child {
                let next = self.node(only);
                if next.is_glob || !self.byte_eq(next.byte, input[i]) {
                    return false;
                }
                cur = only;
                continue;
            }

            match node.children.get(&input[i]) {
                Some(&next) => cur = next,
                None => return false,
            }
        }
        self.is_terminal(cur)
    }

    /// Let the glob at `glob` absorb `input[idx..j]` for every `j`, resuming
    /// the literal walk from the glob's children at `j`
    fn glob_consume(&self, glob: NodeId, input: &[u8], idx: usize) -> bool {
        let gnode = self.node(glob);
        if gnode.can_match {
            return true;
        }

        if let Some(only) = gnode.only_child {
            let next = self.node(only);
            if next.is_glob {
                return false;
            }
            for j in idx..input.len() {
                if self.byte_eq(next.byte, input[j]) && self.walk_branch(only, input, j + 1) {
                    return true;
                }
            }
            return false;
        }

        for j in idx..input.len() {
            if let Some(&next) = gnode.children.get(&input[j]) {
                if self.walk_branch(next, input, j + 1) {
                    return true;
                }
            }
        }
        false
    }
}

pub(crate) fn validate_pattern(pattern: &str) -> Result<(), RuleError> {
    let reason = if pattern.is_empty() {
        "empty pattern"
    } else if pattern.contains(['?', '#']) {
        "query and fragment are not matchable"
    } else {
        return Ok(());
    };
    Err(RuleError::Path {
        pattern: pattern.to_string(),
        reason,
    })
}

/// Matches strings against a set of glob rules
///
/// Rules are written `|flags|pattern`; the only flag is `i` for a
/// case-insensitive rule.
#[derive(Debug, Default)]
pub struct GlobPathChecker {
    cs: Option<GlobTrie>,
    ci: Option<GlobTrie>,
}

impl GlobPathChecker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse and insert a `|flags|pattern` rule
    pub fn add_rule(&mut self, rule: &str) -> Result<(), RuleError> {
        let rest = rule
            .strip_prefix('|')
            .ok_or_else(|| RuleError::Format(rule.to_string()))?;
        let (flags, pattern) = rest
            .split_once('|')
            .ok_or_else(|| RuleError::Format(rule.to_string()))?;
        let icase = match flags {
            "" => false,
            "i" => true,
            _ => return Err(RuleError::Format(rule.to_string())),
        };
        self.add_path(pattern, icase)
    }

    /// Insert a pattern directly
    pub fn add_path(&mut self, pattern: &str, icase: bool) -> Result<(), RuleError> {
        let pattern = pattern.trim();
        validate_pattern(pattern)?;

        let escaped = utf8_percent_encode(pattern, PATH_ESCAPE).to_string();
        let trie = if icase { &mut self.ci } else { &mut self.cs };
        trie.get_or_insert_with(|| GlobTrie::new(icase))
            .insert(&escaped);
        Ok(())
    }

    /// Whether any rule matches `input`, ignoring surrounding whitespace
    pub fn check_path(&self, input: &str) -> bool {
        let input = input.trim().as_bytes();
        self.cs.as_ref().is_some_and(|t| t.matches(input))
            || self.ci.as_ref().is_some_and(|t| t.matches(input))
    }

    pub fn is_empty(&self) -> bool {
        self.cs.is_none() && self.ci.is_none()
    }
}
