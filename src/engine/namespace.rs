//! Namespaces: named scopes of symbol definitions
//!
//! A namespace maps symbols to code addresses and may carry a fallback
//! resolution generator consulted when a symbol has no local definition.
//! Generators typically search a host registry or a list of sibling
//! namespaces; namespaces must form a DAG in their generator references.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::engine::code::CodeAddr;
use crate::engine::error::{EngineError, EngineResult};
use crate::engine::symbol::Symbol;

/// Fallback resolution hook run when a symbol has no local definition
pub type DefinitionGenerator = Arc<dyn Fn(Symbol) -> Option<CodeAddr> + Send + Sync>;

/// A named scope of symbol definitions with an optional fallback generator
pub struct Namespace {
    name: String,
    defs: RwLock<HashMap<Symbol, CodeAddr>>,
    fallback: RwLock<Option<DefinitionGenerator>>,
}

impl Namespace {
    /// Create an empty namespace
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            defs: RwLock::new(HashMap::new()),
            fallback: RwLock::new(None),
        }
    }

    /// The namespace's name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Define a symbol at an address. Definitions are permanent; redefining
    /// a symbol is an error.
    pub fn define(&self, symbol: Symbol, addr: CodeAddr) -> EngineResult<()> {
        let mut defs = self.defs.write();
        if defs.contains_key(&symbol) {
            return Err(EngineError::DuplicateDefinition {
                symbol,
                namespace: self.name.clone(),
            });
        }
        defs.insert(symbol, addr);
        Ok(())
    }

    /// Resolve a symbol against local definitions only
    pub fn resolve_local(&self, symbol: Symbol) -> Option<CodeAddr> {
        self.defs.read().get(&symbol).copied()
    }

    /// Resolve a symbol: local definitions first, then the fallback
    /// generator if one is attached
    pub fn resolve(&self, symbol: Symbol) -> Option<CodeAddr> {
        if let Some(addr) = self.resolve_local(symbol) {
            return Some(addr);
        }
        let fallback = self.fallback.read().clone();
        fallback.and_then(|generate| generate(symbol))
    }

    /// Attach the fallback generator, replacing any previous one
    pub fn set_fallback(&self, generator: DefinitionGenerator) {
        *self.fallback.write() = Some(generator);
    }

    /// Number of local definitions
    pub fn len(&self) -> usize {
        self.defs.read().len()
    }

    /// Whether the namespace has no local definitions
    pub fn is_empty(&self) -> bool {
        self.defs.read().is_empty()
    }

    /// Local definitions, for diagnostics
    pub fn snapshot(&self) -> Vec<(Symbol, CodeAddr)> {
        self.defs
            .read()
            .iter()
            .map(|(sym, addr)| (*sym, *addr))
            .collect()
    }
}

impl fmt::Debug for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Namespace")
            .field("name", &self.name)
            .field("definitions", &self.len())
            .field("has_fallback", &self.fallback.read().is_some())
            .finish()
    }
}

/// Build a generator that searches other namespaces in order
pub fn search_namespaces(namespaces: Vec<Arc<Namespace>>) -> DefinitionGenerator {
    Arc::new(move |symbol| namespaces.iter().find_map(|ns| ns.resolve(symbol)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::symbol::intern;

    #[test]
    fn test_define_and_resolve() {
        let ns = Namespace::new("main");
        let addr = CodeAddr::from_raw(0x1000);
        ns.define(intern("f"), addr).unwrap();
        assert_eq!(ns.resolve(intern("f")), Some(addr));
        assert_eq!(ns.resolve(intern("g")), None);
    }

    #[test]
    fn test_redefinition_fails() {
        let ns = Namespace::new("main");
        ns.define(intern("f"), CodeAddr::from_raw(0x1000)).unwrap();
        let err = ns.define(intern("f"), CodeAddr::from_raw(0x2000));
        assert!(matches!(
            err,
            Err(EngineError::DuplicateDefinition { .. })
        ));
        // original definition intact
        assert_eq!(ns.resolve(intern("f")), Some(CodeAddr::from_raw(0x1000)));
    }

    #[test]
    fn test_fallback_generator() {
        let host = Arc::new(Namespace::new("host"));
        host.define(intern("puts"), CodeAddr::from_raw(0x5000))
            .unwrap();

        let main = Namespace::new("main");
        main.set_fallback(search_namespaces(vec![host]));

        assert_eq!(main.resolve_local(intern("puts")), None);
        assert_eq!(main.resolve(intern("puts")), Some(CodeAddr::from_raw(0x5000)));
    }

    #[test]
    fn test_local_definition_shadows_fallback() {
        let host = Arc::new(Namespace::new("host"));
        host.define(intern("f"), CodeAddr::from_raw(0x5000)).unwrap();

        let main = Namespace::new("main");
        main.set_fallback(search_namespaces(vec![host]));
        main.define(intern("f"), CodeAddr::from_raw(0x6000)).unwrap();

        assert_eq!(main.resolve(intern("f")), Some(CodeAddr::from_raw(0x6000)));
    }
}
