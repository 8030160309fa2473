//! File-backed [`PolicyStore`].
//!
//! # Rule file
//!
//! One rule per line, casbin CSV style:
//!
//! ```text
//! # permissions
//! p, "1-ff00:0:111,[10.0.0.7]", /node, scrape
//! p, node_ops_role, /node, node_cpu
//! # role membership
//! g, "1-ff00:0:111,[10.0.0.7]", node_ops_role
//! ```
//!
//! Fields containing a comma, a double quote, or surrounding whitespace are
//! double-quoted with `""` escaping. Blank lines and `#` comments are ignored.

use std::collections::{HashSet, VecDeque};
use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};

use parking_lot::RwLock;
use tracing::{debug, info};

use super::{Permission, PolicyStore};
use crate::pki::store::write_atomic;
use crate::{Error, Result};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct Rules {
    /// `(subject, object, action)`, insertion order
    policies: Vec<(String, String, String)>,
    /// `(member, role)`, insertion order
    groupings: Vec<(String, String)>,
}

impl Rules {
    fn has_policy(&self, subject: &str, object: &str, action: &str) -> bool {
        self.policies
            .iter()
            .any(|(s, o, a)| s == subject && o == object && a == action)
    }

    fn has_grouping(&self, member: &str, role: &str) -> bool {
        self.groupings.iter().any(|(m, r)| m == member && r == role)
    }

    /// `subject` plus every role reachable from it.
    fn closure(&self, subject: &str) -> HashSet<String> {
        let mut seen = HashSet::from([subject.to_string()]);
        let mut queue = VecDeque::from([subject.to_string()]);
        while let Some(current) = queue.pop_front() {
            for (member, role) in &self.groupings {
                if *member == current && seen.insert(role.clone()) {
                    queue.push_back(role.clone());
                }
            }
        }
        seen
    }

    fn render(&self) -> String {
        let mut out = String::new();
        for (s, o, a) in &self.policies {
            let _ = writeln!(out, "p, {}, {}, {}", quote(s), quote(o), quote(a));
        }
        for (m, r) in &self.groupings {
            let _ = writeln!(out, "g, {}, {}", quote(m), quote(r));
        }
        out
    }

    fn parse(text: &str) -> Result<Self> {
        let mut rules = Self::default();
        for (idx, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let fields = split_fields(line)
                .map_err(|e| Error::Policy(format!("line {}: {e}", idx + 1)))?;
            match fields.as_slice() {
                [kind, s, o, a] if kind == "p" => {
                    if !rules.has_policy(s, o, a) {
                        rules.policies.push((s.clone(), o.clone(), a.clone()));
                    }
                }
                [kind, m, r] if kind == "g" => {
                    if !rules.has_grouping(m, r) {
                        rules.groupings.push((m.clone(), r.clone()));
                    }
                }
                _ => {
                    return Err(Error::Policy(format!(
                        "line {}: expected 'p, sub, obj, act' or 'g, member, role'",
                        idx + 1
                    )));
                }
            }
        }
        Ok(rules)
    }
}

fn quote(field: &str) -> String {
    let needs_quotes = field.is_empty()
        || field.contains(',')
        || field.contains('"')
        || field.starts_with(char::is_whitespace)
        || field.ends_with(char::is_whitespace);
    if needs_quotes {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}

fn split_fields(line: &str) -> std::result::Result<Vec<String>, String> {
    let mut fields = Vec::new();
    let mut chars = line.chars().peekable();

    loop {
        while chars.peek().is_some_and(|c| c.is_whitespace()) {
            chars.next();
        }
        let mut field = String::new();
        if chars.peek() == Some(&'"') {
            chars.next();
            loop {
                match chars.next() {
                    Some('"') if chars.peek() == Some(&'"') => {
                        chars.next();
                        field.push('"');
                    }
                    Some('"') => break,
                    Some(c) => field.push(c),
                    None => return Err("unterminated quoted field".to_string()),
                }
            }
            while chars.peek().is_some_and(|c| c.is_whitespace()) {
                chars.next();
            }
            fields.push(field);
        } else {
            while let Some(&c) = chars.peek() {
                if c == ',' {
                    break;
                }
                field.push(c);
                chars.next();
            }
            fields.push(field.trim_end().to_string());
        }

        match chars.next() {
            Some(',') => {}
            None => return Ok(fields),
            Some(c) => return Err(format!("unexpected '{c}' after quoted field")),
        }
    }
}

/// Rule table held in memory and written through to a file.
#[derive(Debug)]
pub struct FilePolicyStore {
    path: Option<PathBuf>,
    rules: RwLock<Rules>,
}

impl FilePolicyStore {
    /// Open `path`, creating an empty store if the file does not exist.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let rules = match fs::read_to_string(&path) {
            Ok(text) => Rules::parse(&text)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Rules::default(),
            Err(e) => return Err(Error::Io(e)),
        };
        info!(
            path = %path.display(),
            policies = rules.policies.len(),
            groupings = rules.groupings.len(),
            "Policy store loaded"
        );
        Ok(Self {
            path: Some(path),
            rules: RwLock::new(rules),
        })
    }

    /// A store that keeps rules in memory only.
    #[must_use]
    pub fn in_memory() -> Self {
        Self {
            path: None,
            rules: RwLock::new(Rules::default()),
        }
    }

    /// Backing file, if any.
    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn write(&self, rules: &Rules) -> Result<()> {
        if let Some(path) = &self.path {
            write_atomic(path, rules.render().as_bytes())?;
            debug!(path = %path.display(), "Policy persisted");
        }
        Ok(())
    }

    /// Apply `change` to a copy of the rules, persist it, then publish it.
    /// Nothing changes in memory if persisting fails.
    fn mutate<T>(&self, change: impl FnOnce(&mut Rules) -> T) -> Result<T> {
        let mut rules = self.rules.write();
        let mut next = rules.clone();
        let out = change(&mut next);
        if next != *rules {
            self.write(&next)?;
            *rules = next;
        }
        Ok(out)
    }
}

impl PolicyStore for FilePolicyStore {
    fn enforce(&self, subject: &str, object: &str, action: &str) -> bool {
        let rules = self.rules.read();
        let holders = rules.closure(subject);
        rules
            .policies
            .iter()
            .any(|(s, o, a)| o == object && a == action && holders.contains(s))
    }

    fn permissions_for(&self, subject: &str) -> Vec<Permission> {
        self.rules
            .read()
            .policies
            .iter()
            .filter(|(s, _, _)| s == subject)
            .map(|(_, o, a)| Permission::new(o.clone(), a.clone()))
            .collect()
    }

    fn add_permission(&self, subject: &str, object: &str, action: &str) -> Result<bool> {
        self.mutate(|rules| {
            if rules.has_policy(subject, object, action) {
                return false;
            }
            rules
                .policies
                .push((subject.to_string(), object.to_string(), action.to_string()));
            true
        })
    }

    fn delete_permission(&self, subject: &str, object: &str, action: &str) -> Result<bool> {
        self.mutate(|rules| {
            let before = rules.policies.len();
            rules
                .policies
                .retain(|(s, o, a)| !(s == subject && o == object && a == action));
            rules.policies.len() != before
        })
    }

    fn add_role_member(&self, member: &str, role: &str) -> Result<bool> {
        self.mutate(|rules| {
            if rules.has_grouping(member, role) {
                return false;
            }
            rules.groupings.push((member.to_string(), role.to_string()));
            true
        })
    }

    fn remove_role_member(&self, member: &str, role: &str) -> Result<bool> {
        self.mutate(|rules| {
            let before = rules.groupings.len();
            rules.groupings.retain(|(m, r)| !(m == member && r == role));
            rules.groupings.len() != before
        })
    }

    fn roles_for(&self, member: &str) -> Vec<String> {
        self.rules
            .read()
            .groupings
            .iter()
            .filter(|(m, _)| m == member)
            .map(|(_, r)| r.clone())
            .collect()
    }

    fn delete_role(&self, role: &str) -> Result<()> {
        self.mutate(|rules| {
            rules.policies.retain(|(s, _, _)| s != role);
            rules.groupings.retain(|(m, r)| m != role && r != role);
        })
    }

    fn delete_subject(&self, subject: &str) -> Result<()> {
        self.mutate(|rules| {
            rules.policies.retain(|(s, _, _)| s != subject);
            rules.groupings.retain(|(m, _)| m != subject);
        })
    }

    fn remove_object(&self, object: &str) -> Result<usize> {
        self.mutate(|rules| {
            let before = rules.policies.len();
            rules.policies.retain(|(_, o, _)| o != object);
            before - rules.policies.len()
        })
    }

    fn all_subjects(&self) -> Vec<String> {
        let rules = self.rules.read();
        let mut seen = HashSet::new();
        rules
            .policies
            .iter()
            .filter(|(s, _, _)| seen.insert(s.as_str()))
            .map(|(s, _, _)| s.clone())
            .collect()
    }

    fn persist(&self) -> Result<()> {
        self.write(&self.rules.read())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    const NODE: &str = "1-ff00:0:111,[10.0.0.7]";

    #[test]
    fn role_permissions_are_inherited_transitively() {
        // GIVEN: NODE in ops, ops in readers, readers can read node_cpu
        let store = FilePolicyStore::in_memory();
        store.add_role_member(NODE, "ops_role").unwrap();
        store.add_role_member("ops_role", "readers_role").unwrap();
        store.add_permission("readers_role", "/node", "node_cpu").unwrap();

        // THEN: enforce follows the chain; direct listing does not
        assert!(store.enforce(NODE, "/node", "node_cpu"));
        assert!(!store.enforce(NODE, "/node", "node_mem"));
        assert!(!store.enforce(NODE, "/other", "node_cpu"));
        assert!(store.permissions_for(NODE).is_empty());
    }

    #[test]
    fn cyclic_memberships_terminate() {
        let store = FilePolicyStore::in_memory();
        store.add_role_member("a", "b").unwrap();
        store.add_role_member("b", "a").unwrap();
        assert!(!store.enforce("a", "/x", "scrape"));
    }

    #[test]
    fn add_and_delete_report_changes() {
        let store = FilePolicyStore::in_memory();
        assert!(store.add_permission(NODE, "/node", "scrape").unwrap());
        assert!(!store.add_permission(NODE, "/node", "scrape").unwrap());
        assert!(store.delete_permission(NODE, "/node", "scrape").unwrap());
        assert!(!store.delete_permission(NODE, "/node", "scrape").unwrap());
    }

    #[test]
    fn delete_role_cascades() {
        let store = FilePolicyStore::in_memory();
        store.add_permission("ops_role", "/node", "up").unwrap();
        store.add_role_member(NODE, "ops_role").unwrap();

        store.delete_role("ops_role").unwrap();

        assert!(store.roles_for(NODE).is_empty());
        assert!(store.permissions_for("ops_role").is_empty());
        assert!(!store.enforce(NODE, "/node", "up"));
    }

    #[test]
    fn remove_object_drops_every_holder() {
        let store = FilePolicyStore::in_memory();
        store.add_permission(NODE, "/node", "scrape").unwrap();
        store.add_permission("ops_role", "/node", "up").unwrap();
        store.add_permission(NODE, "/other", "scrape").unwrap();

        assert_eq!(store.remove_object("/node").unwrap(), 2);
        assert_eq!(store.permissions_for(NODE), vec![Permission::new("/other", "scrape")]);
    }

    #[test]
    fn writes_through_and_reloads_identities_with_commas() {
        // GIVEN: a file-backed store
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("policy.csv");
        let store = FilePolicyStore::open(&path).unwrap();

        // WHEN: rules are added (no explicit save)
        store.add_permission(NODE, "/node", "scrape").unwrap();
        store
            .add_permission(NODE, "/node", "window:2030-01-01T00:00:00Z")
            .unwrap();
        store.add_role_member(NODE, "node_ops_role").unwrap();

        // THEN: the file already holds them, and a fresh store sees the same rules
        let text = fs::read_to_string(&path).unwrap();
        assert!(text.contains("p, \"1-ff00:0:111,[10.0.0.7]\", /node, scrape"));
        assert!(text.contains("g, \"1-ff00:0:111,[10.0.0.7]\", node_ops_role"));

        let reopened = FilePolicyStore::open(&path).unwrap();
        assert_eq!(reopened.permissions_for(NODE), store.permissions_for(NODE));
        assert_eq!(reopened.roles_for(NODE), vec!["node_ops_role".to_string()]);
    }

    #[test]
    fn hand_edited_file_with_comments_parses() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("policy.csv");
        fs::write(
            &path,
            "# operators\np,alice,/node,scrape\n\n  g , alice , ops_role\np, \"say \"\"hi\"\"\", /x, y\n",
        )
        .unwrap();

        let store = FilePolicyStore::open(&path).unwrap();
        assert!(store.enforce("alice", "/node", "scrape"));
        assert_eq!(store.roles_for("alice"), vec!["ops_role".to_string()]);
        assert!(store.enforce("say \"hi\"", "/x", "y"));
    }

    #[test]
    fn malformed_line_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("policy.csv");
        fs::write(&path, "p, only, two\n").unwrap();
        let err = FilePolicyStore::open(&path).unwrap_err();
        assert!(err.to_string().contains("line 1"));
    }

    #[test]
    fn all_subjects_lists_permission_holders_once() {
        let store = FilePolicyStore::in_memory();
        store.add_permission("b", "/x", "scrape").unwrap();
        store.add_permission("a", "/x", "scrape").unwrap();
        store.add_permission("b", "/y", "scrape").unwrap();
        store.add_role_member("c", "r").unwrap();
        assert_eq!(store.all_subjects(), vec!["b".to_string(), "a".to_string()]);
    }

    #[test]
    fn delete_subject_keeps_other_members() {
        let store = FilePolicyStore::in_memory();
        store.add_role_member("a", "r").unwrap();
        store.add_role_member("b", "r").unwrap();
        store.add_permission("a", "/x", "scrape").unwrap();

        store.delete_subject("a").unwrap();

        assert!(store.roles_for("a").is_empty());
        assert_eq!(store.roles_for("b"), vec!["r".to_string()]);
        assert!(store.permissions_for("a").is_empty());
    }

    #[test]
    fn quote_round_trips_through_split() {
        for field in ["plain", "a,b", "with \"quotes\"", " padded ", ""] {
            let line = format!("p, {}, o, a", quote(field));
            assert_eq!(split_fields(&line).unwrap()[1], field);
        }
    }
}
