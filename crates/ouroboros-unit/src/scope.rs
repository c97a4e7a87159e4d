//! Lifecycle scopes and scope chains
//!
//! A test belongs to a chain of scopes, leaf to root: its class, each base
//! class nearest first, its assembly, then the session. The chain is
//! computed once per class and cached by the lifecycle orchestrator.

use serde::{Deserialize, Serialize};

use crate::metadata::ClassInfo;

/// One lifecycle grouping level
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ScopeId {
    Session,
    Assembly(String),
    Class(String),
}

impl ScopeId {
    pub fn is_class(&self) -> bool {
        matches!(self, ScopeId::Class(_))
    }
}

impl std::fmt::Display for ScopeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ScopeId::Session => write!(f, "session"),
            ScopeId::Assembly(name) => write!(f, "assembly:{}", name),
            ScopeId::Class(name) => write!(f, "class:{}", name),
        }
    }
}

/// Ordered scopes of a class, leaf first
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScopeChain {
    scopes: Vec<ScopeId>,
}

impl ScopeChain {
    pub fn for_class(class: &ClassInfo) -> Self {
        let mut scopes = Vec::with_capacity(class.base_classes.len() + 3);
        scopes.push(ScopeId::Class(class.name.clone()));
        scopes.extend(class.base_classes.iter().cloned().map(ScopeId::Class));
        scopes.push(ScopeId::Assembly(class.assembly.clone()));
        scopes.push(ScopeId::Session);
        Self { scopes }
    }

    /// Innermost to outermost (cleanup order)
    pub fn leaf_to_root(&self) -> impl Iterator<Item = &ScopeId> {
        self.scopes.iter()
    }

    /// Outermost to innermost (setup order)
    pub fn root_to_leaf(&self) -> impl Iterator<Item = &ScopeId> {
        self.scopes.iter().rev()
    }

    pub fn leaf(&self) -> &ScopeId {
        &self.scopes[0]
    }

    pub fn contains(&self, scope: &ScopeId) -> bool {
        self.scopes.contains(scope)
    }

    pub fn len(&self) -> usize {
        self.scopes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scopes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chain_order() {
        let class = ClassInfo::new("Leaf")
            .in_assembly("core")
            .extends("Middle")
            .extends("Root");
        let chain = ScopeChain::for_class(&class);

        let leaf_first: Vec<String> = chain.leaf_to_root().map(|s| s.to_string()).collect();
        assert_eq!(
            leaf_first,
            vec!["class:Leaf", "class:Middle", "class:Root", "assembly:core", "session"]
        );
        assert_eq!(chain.root_to_leaf().next(), Some(&ScopeId::Session));
        assert_eq!(chain.leaf(), &ScopeId::Class("Leaf".into()));
    }
}
