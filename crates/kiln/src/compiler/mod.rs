//! The `Compiler`: root of ownership for every Kiln component.
//!
//! A compiler holds the type registry, the foreign upcast graph, the type
//! environment, classes and instances, the search cache, the JIT engine
//! and the region that compiled code allocates from. Every method that
//! changes any of these takes `&mut self`; sharing one compiler across
//! threads needs external locking. Several compilers may coexist.
//!
//! Operations that can fail half way (`define`, the `compile_fn` family,
//! `add_instance`, `overload`, searches) run as transactions: on error
//! the environment, instances, registry, artifacts and search cache are
//! rolled back to where they were, so no forward-declared residual is left
//! dangling.

mod bindings;
mod compile;
mod globals;
mod typedb;

use std::path::Path;
use std::sync::Arc;

use rustc_hash::FxHashMap;

use kiln_codegen::{LowLevelOp, UnreachableRows};
use kiln_common::{Expr, Module, Ty};
use kiln_jit::{JitEngine, JitMark};
use kiln_rt::GlobalRegion;
use kiln_typeck::env::EnvMark;
use kiln_typeck::{ClassEnv, ForeignTypeGraph, ResidualQueue, SearchCache, TypeEnv, TypeRegistry};

use crate::builtins;
use crate::config::CompilerConfig;
use crate::error::CompileError;
use crate::reader::{ReadError, Reader};

pub use compile::CompiledFn;

use globals::Globals;

/// Parameter and result types of one artifact's entry.
#[derive(Clone, Debug)]
struct ArtifactSig {
    params: Vec<Ty>,
    ret: Ty,
}

struct Snapshot {
    env: EnvMark,
    registry: TypeRegistry,
    graph: ForeignTypeGraph,
    classes: ClassEnv,
    search_cache: SearchCache,
    jit: JitMark,
    globals: usize,
    signatures: usize,
}

pub struct Compiler {
    config: CompilerConfig,
    registry: TypeRegistry,
    graph: ForeignTypeGraph,
    env: TypeEnv,
    classes: ClassEnv,
    search_cache: SearchCache,
    residuals: ResidualQueue,
    /// Declared before `region`: compiled code must go first.
    jit: JitEngine,
    reader: Option<Box<dyn Reader>>,
    globals: Globals,
    ops: FxHashMap<String, Arc<dyn LowLevelOp>>,
    unreachable_sink: Option<UnreachableRows>,
    /// Indexed by artifact id.
    signatures: Vec<ArtifactSig>,
    anon_count: u64,
    last_drain: usize,
    /// Boxed so generated code can hold its address.
    region: Box<GlobalRegion>,
}

impl Compiler {
    pub fn new() -> Result<Self, CompileError> {
        Self::with_config(CompilerConfig::default())
    }

    pub fn with_config(config: CompilerConfig) -> Result<Self, CompileError> {
        let mut jit = JitEngine::new(config.backend)?;
        jit.set_inlining(config.enable_module_inlining);
        let mut c = Compiler {
            config,
            registry: TypeRegistry::new(),
            graph: ForeignTypeGraph::new(),
            env: TypeEnv::new(),
            classes: ClassEnv::new(),
            search_cache: SearchCache::new(),
            residuals: ResidualQueue::new(),
            jit,
            reader: None,
            globals: Globals::default(),
            ops: FxHashMap::default(),
            unreachable_sink: None,
            signatures: Vec::new(),
            anon_count: 0,
            last_drain: 0,
            region: Box::new(GlobalRegion::new()),
        };
        builtins::install(&mut c)?;
        tracing::debug!(backend = c.jit.backend_name(), globals = c.env.globals().count(), "compiler ready");
        Ok(c)
    }

    // ── Transactions ────────────────────────────────────────────────────

    fn snapshot(&self) -> Snapshot {
        Snapshot {
            env: self.env.mark(),
            registry: self.registry.clone(),
            graph: self.graph.clone(),
            classes: self.classes.clone(),
            search_cache: self.search_cache.clone(),
            jit: self.jit.mark(),
            globals: self.globals.mark(),
            signatures: self.signatures.len(),
        }
    }

    fn restore(&mut self, snapshot: Snapshot) {
        self.env.rollback_to(snapshot.env);
        self.registry = snapshot.registry;
        self.graph = snapshot.graph;
        self.classes = snapshot.classes;
        self.search_cache = snapshot.search_cache;
        self.jit.rollback_to(snapshot.jit);
        self.globals.rollback_to(snapshot.globals);
        self.signatures.truncate(snapshot.signatures);
        self.residuals.reset();
    }

    fn transaction<T>(
        &mut self,
        what: &'static str,
        f: impl FnOnce(&mut Self) -> Result<T, CompileError>,
    ) -> Result<T, CompileError> {
        let snapshot = self.snapshot();
        if !self.residuals.draining {
            self.residuals.reset();
            self.last_drain = 0;
        }
        let result = f(self);
        if let Err(e) = &result {
            tracing::debug!(op = what, error = %e, "rolled back");
            self.restore(snapshot);
        }
        result
    }

    // ── Configuration ───────────────────────────────────────────────────

    pub fn config(&self) -> &CompilerConfig {
        &self.config
    }

    pub fn config_mut(&mut self) -> &mut CompilerConfig {
        &mut self.config
    }

    pub fn enable_module_inlining(&self) -> bool {
        self.config.enable_module_inlining
    }

    pub fn set_enable_module_inlining(&mut self, enabled: bool) {
        self.config.enable_module_inlining = enabled;
    }

    pub fn build_interpreted_matches(&self) -> bool {
        self.config.build_interpreted_matches
    }

    pub fn set_build_interpreted_matches(&mut self, enabled: bool) {
        self.config.build_interpreted_matches = enabled;
    }

    pub fn require_match_reachability(&self) -> bool {
        self.config.require_match_reachability
    }

    pub fn set_require_match_reachability(&mut self, enabled: bool) {
        self.config.require_match_reachability = enabled;
    }

    pub fn always_lower_prim_match_tables(&self) -> bool {
        self.config.always_lower_prim_match_tables
    }

    pub fn set_always_lower_prim_match_tables(&mut self, enabled: bool) {
        self.config.always_lower_prim_match_tables = enabled;
    }

    pub fn build_columnwise_matches(&self) -> bool {
        self.config.build_columnwise_matches
    }

    pub fn set_build_columnwise_matches(&mut self, enabled: bool) {
        self.config.build_columnwise_matches = enabled;
    }

    /// Collect arms dropped as unreachable. Has no effect while
    /// reachability is required, since those arms are errors.
    pub fn set_unreachable_rows_sink(&mut self, sink: Option<UnreachableRows>) {
        self.unreachable_sink = sink;
    }

    // ── Readers ─────────────────────────────────────────────────────────

    pub fn set_reader(&mut self, reader: Box<dyn Reader>) {
        self.reader = Some(reader);
    }

    fn with_reader<T>(
        &mut self,
        hook: &'static str,
        f: impl FnOnce(&mut dyn Reader) -> Result<T, ReadError>,
    ) -> Result<T, CompileError> {
        let reader = self
            .reader
            .as_deref_mut()
            .ok_or(CompileError::NoReaderConfigured { hook })?;
        f(reader).map_err(|e| match e {
            ReadError::Unsupported => CompileError::NoReaderConfigured { hook },
            ReadError::Syntax { message, span } => CompileError::Parse { message, span },
        })
    }

    pub fn read_module(&mut self, text: &str) -> Result<Module, CompileError> {
        self.with_reader("read_module", |r| r.read_module(text))
    }

    pub fn read_module_file(&mut self, path: impl AsRef<Path>) -> Result<Module, CompileError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| CompileError::Parse {
            message: format!("cannot read {}: {}", path.display(), e),
            span: kiln_common::Span::synthetic(),
        })?;
        self.read_module(&text)
    }

    pub fn read_expr_defn(&mut self, text: &str) -> Result<(String, Expr), CompileError> {
        self.with_reader("read_expr_defn", |r| r.read_expr_defn(text))
    }

    pub fn read_expr(&mut self, text: &str) -> Result<Expr, CompileError> {
        self.with_reader("read_expr", |r| r.read_expr(text))
    }

    pub fn read_mono_type(&mut self, text: &str) -> Result<Ty, CompileError> {
        self.with_reader("read_mono_type", |r| r.read_mono_type(text))
    }

    // ── Introspection ───────────────────────────────────────────────────

    pub fn type_env(&self) -> &TypeEnv {
        &self.env
    }

    pub fn class_env(&self) -> &ClassEnv {
        &self.classes
    }

    /// Global names and their rendered types, in definition order.
    pub fn dump_type_env(&self) -> (Vec<String>, Vec<String>) {
        self.env.dump()
    }

    pub fn show_type_env(&self) -> String {
        self.env.show()
    }

    /// MIR of every unit compiled so far.
    pub fn dump_module(&self) -> String {
        self.jit.dump()
    }

    pub fn jit(&self) -> &JitEngine {
        &self.jit
    }

    pub fn search_cache(&self) -> &SearchCache {
        &self.search_cache
    }

    /// Residual definitions compiled by the last top-level operation.
    pub fn last_drain_count(&self) -> usize {
        self.last_drain
    }

    /// Zeroed, 8-byte aligned memory owned by the compiler and freed with
    /// it.
    pub fn memalloc(&self, bytes: usize) -> *mut u8 {
        self.region.alloc_bytes(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtins_are_installed() {
        let c = Compiler::new().unwrap();
        let env = c.type_env();
        assert!(env.lookup_global("int_add").is_some());
        assert!(env.lookup_global("==").is_some());
        assert!(env.lookup_global("convert").is_some());
        assert!(c.classes.instances("Eq").len() >= 4);
    }

    #[test]
    fn missing_reader_is_reported_per_hook() {
        let mut c = Compiler::new().unwrap();
        assert_eq!(
            c.read_expr("1"),
            Err(CompileError::NoReaderConfigured { hook: "read_expr" })
        );

        struct TypesOnly;
        impl Reader for TypesOnly {
            fn read_mono_type(&mut self, _: &str) -> Result<Ty, ReadError> {
                Ok(Ty::int())
            }
        }
        c.set_reader(Box::new(TypesOnly));
        assert_eq!(c.read_mono_type("int"), Ok(Ty::int()));
        assert_eq!(
            c.read_module("x = 1"),
            Err(CompileError::NoReaderConfigured { hook: "read_module" })
        );
    }

    #[test]
    fn memalloc_is_zeroed_and_aligned() {
        let c = Compiler::new().unwrap();
        let p = c.memalloc(20);
        assert_eq!(p as usize % 8, 0);
        // SAFETY: 20 bytes round up to three zeroed words.
        let words = unsafe { std::slice::from_raw_parts(p as *const u64, 3) };
        assert_eq!(words, &[0, 0, 0]);
    }

    #[test]
    fn missing_module_file_is_a_parse_error() {
        let mut c = Compiler::new().unwrap();
        let err = c.read_module_file("/definitely/not/here.kiln").unwrap_err();
        assert!(matches!(err, CompileError::Parse { .. }));
    }
}
