//! Intent compilation.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tracing::trace;

use super::error::IntentError;
use super::types::{Intent, IntentKind};

/// Levels of recursive compilation permitted before the intent fails.
pub const MAX_COMPILE_DEPTH: usize = 10;

/// Compiles intents of one kind into lower-level intents.
pub trait IntentCompiler: Send + Sync {
    /// Produces zero or more sub-intents for `intent`. `previous` carries the
    /// installables of the intent's prior incarnation so a compiler can
    /// produce replacements in place.
    ///
    /// # Errors
    ///
    /// Returns [`IntentError::CompilationFailed`] (or any other error) when
    /// the intent cannot be compiled; the pipeline lands the intent in
    /// FAILED.
    fn compile(
        &self,
        intent: &Intent,
        previous: Option<&[Intent]>,
    ) -> Result<Vec<Intent>, IntentError>;
}

/// Registry mapping intent kinds to compilers.
///
/// Lookup walks the kind's declared ancestor chain, so a compiler registered
/// for a parent kind serves every kind extending it.
#[derive(Default)]
pub struct CompilerRegistry {
    compilers: Mutex<HashMap<String, Arc<dyn IntentCompiler>>>,
}

impl CompilerRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `compiler` for `kind`, replacing any previous registration.
    pub fn register(&self, kind: &IntentKind, compiler: Arc<dyn IntentCompiler>) {
        self.compilers
            .lock()
            .expect("compiler registry lock poisoned")
            .insert(kind.name().to_string(), compiler);
    }

    /// Removes the registration for `kind`.
    pub fn unregister(&self, kind: &IntentKind) {
        self.compilers
            .lock()
            .expect("compiler registry lock poisoned")
            .remove(kind.name());
    }

    /// Names of the kinds with a registered compiler.
    #[must_use]
    pub fn registered_kinds(&self) -> Vec<String> {
        self.compilers
            .lock()
            .expect("compiler registry lock poisoned")
            .keys()
            .cloned()
            .collect()
    }

    /// Resolves the compiler for `kind`, walking its ancestor chain.
    ///
    /// # Errors
    ///
    /// Returns [`IntentError::NoCompiler`] when neither the kind nor any
    /// ancestor has a registration.
    pub fn get_compiler(&self, kind: &IntentKind) -> Result<Arc<dyn IntentCompiler>, IntentError> {
        let compilers = self
            .compilers
            .lock()
            .expect("compiler registry lock poisoned");
        for name in kind.lineage() {
            if let Some(compiler) = compilers.get(name) {
                return Ok(Arc::clone(compiler));
            }
        }
        Err(IntentError::NoCompiler {
            kind: kind.name().to_string(),
        })
    }

    /// Compiles `intent` down to installables, recursing while compilers
    /// produce further non-installable intents.
    ///
    /// # Errors
    ///
    /// Propagates compiler errors, [`IntentError::NoCompiler`] on dispatch
    /// misses, and [`IntentError::CompilationDepth`] past
    /// [`MAX_COMPILE_DEPTH`] levels.
    pub fn compile(
        &self,
        intent: &Intent,
        previous: Option<&[Intent]>,
    ) -> Result<Vec<Intent>, IntentError> {
        self.compile_at(intent, previous, 0)
    }

    fn compile_at(
        &self,
        intent: &Intent,
        previous: Option<&[Intent]>,
        depth: usize,
    ) -> Result<Vec<Intent>, IntentError> {
        if depth >= MAX_COMPILE_DEPTH {
            return Err(IntentError::CompilationDepth {
                key: intent.key().clone(),
                max: MAX_COMPILE_DEPTH,
            });
        }
        let compiler = self.get_compiler(intent.kind())?;
        let compiled = compiler.compile(intent, previous)?;
        trace!(
            key = %intent.key(),
            kind = %intent.kind(),
            produced = compiled.len(),
            depth,
            "compiled intent"
        );

        let mut installables = Vec::with_capacity(compiled.len());
        for sub in compiled {
            if sub.is_installable() {
                installables.push(sub);
            } else {
                installables.extend(self.compile_at(&sub, previous, depth + 1)?);
            }
        }
        Ok(installables)
    }
}
