//! Lexical scopes.
//!
//! A stack of name→entry maps: the universe block at the bottom, then the
//! package block, a per-file block, and one block per function body and
//! nested braces. Lookups walk top-down; re-declaration within the same
//! innermost block is an error reported by the checker.

use std::collections::HashMap;

use vela_common::Position;

use crate::check::type_info::Entity;

#[derive(Clone, Debug)]
pub struct ScopeEntry {
    pub entity: Entity,
    pub pos: Position,
    /// Function nesting depth at declaration (0 = package level).
    pub fn_depth: usize,
}

#[derive(Default)]
pub struct Scope {
    names: HashMap<String, ScopeEntry>,
}

pub struct ScopeStack {
    scopes: Vec<Scope>,
}

impl ScopeStack {
    /// Starts with the package block; the universe is consulted by the
    /// checker before giving up on a lookup.
    pub fn new() -> ScopeStack {
        ScopeStack {
            scopes: vec![Scope::default()],
        }
    }

    pub fn push(&mut self) {
        self.scopes.push(Scope::default());
    }

    pub fn pop(&mut self) {
        self.scopes.pop().expect("scope underflow");
    }

    pub fn depth(&self) -> usize {
        self.scopes.len()
    }

    /// Declares a name in the innermost scope. Returns the previous
    /// entry's position when the name is already declared in this block.
    pub fn declare(&mut self, name: &str, entry: ScopeEntry) -> Result<(), Position> {
        let top = self.scopes.last_mut().expect("no scope");
        if let Some(prev) = top.names.get(name) {
            return Err(prev.pos);
        }
        top.names.insert(name.to_string(), entry);
        Ok(())
    }

    /// Declares into the outermost (package) block.
    pub fn declare_package(&mut self, name: &str, entry: ScopeEntry) -> Result<(), Position> {
        let pkg = self.scopes.first_mut().expect("no scope");
        if let Some(prev) = pkg.names.get(name) {
            return Err(prev.pos);
        }
        pkg.names.insert(name.to_string(), entry);
        Ok(())
    }

    /// Replaces a package-level entry (used when resolving placeholder
    /// declarations during the sorted check).
    pub fn redeclare_package(&mut self, name: &str, entry: ScopeEntry) {
        let pkg = self.scopes.first_mut().expect("no scope");
        pkg.names.insert(name.to_string(), entry);
    }

    pub fn lookup(&self, name: &str) -> Option<&ScopeEntry> {
        self.scopes.iter().rev().find_map(|s| s.names.get(name))
    }

    /// Whether the name is declared in the innermost block (for the
    /// `:=` at-least-one-new-variable rule).
    pub fn declared_in_innermost(&self, name: &str) -> bool {
        self.scopes
            .last()
            .map(|s| s.names.contains_key(name))
            .unwrap_or(false)
    }
}

impl Default for ScopeStack {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry() -> ScopeEntry {
        ScopeEntry {
            entity: Entity::Package {
                path: "p".to_string(),
            },
            pos: Position::at(1, 1),
            fn_depth: 0,
        }
    }

    #[test]
    fn inner_scopes_shadow_outer() {
        let mut scopes = ScopeStack::new();
        scopes.declare("x", entry()).unwrap();
        scopes.push();
        assert!(scopes.lookup("x").is_some());
        assert!(!scopes.declared_in_innermost("x"));
        scopes.declare("x", entry()).unwrap();
        assert!(scopes.declared_in_innermost("x"));
        scopes.pop();
        assert!(scopes.lookup("x").is_some());
    }

    #[test]
    fn redeclaration_in_same_block_is_rejected() {
        let mut scopes = ScopeStack::new();
        scopes.declare("x", entry()).unwrap();
        assert!(scopes.declare("x", entry()).is_err());
    }
}
