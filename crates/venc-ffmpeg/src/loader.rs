//! Module loading and one-time initialization.
//!
//! [`resolve`] opens a shared module and checks that every requested entry
//! point exists. It never returns a partially usable module: a missing
//! symbol drops the library handle and reports which names failed.
//!
//! [`InitOnce`] caches the outcome of a load for the lifetime of the
//! process. The first caller runs the loader; concurrent callers block until
//! it finishes and then observe the same result. A failure is never
//! retried.

use std::sync::{Arc, OnceLock};

use libloading::Library;

use crate::error::{LoadError, ResolutionReport};

/// A shared module whose required entry points are all present.
pub struct ResolvedModule {
    module: String,
    library: Library,
    report: ResolutionReport,
}

impl ResolvedModule {
    /// Module name as passed to [`resolve`].
    #[must_use]
    pub fn module(&self) -> &str {
        &self.module
    }

    /// Per-entry-point outcome (all `OK`).
    #[must_use]
    pub fn report(&self) -> &ResolutionReport {
        &self.report
    }

    /// Fetch a typed entry point.
    ///
    /// The returned value is only valid while `self` is alive.
    ///
    /// # Safety
    ///
    /// `T` must be the exact function pointer type of `name` as declared by
    /// the native library.
    pub(crate) unsafe fn function<T: Copy>(&self, name: &str) -> Option<T> {
        // SAFETY: forwarded to the caller.
        unsafe { self.library.get::<T>(name.as_bytes()) }.ok().map(|sym| *sym)
    }
}

impl std::fmt::Debug for ResolvedModule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResolvedModule")
            .field("module", &self.module)
            .field("entry_points", &self.report.len())
            .finish_non_exhaustive()
    }
}

/// Load `module` from the standard search path and verify that every name
/// in `entry_points` resolves.
///
/// # Errors
///
/// Returns [`LoadError::ModuleNotFound`] if the module cannot be opened and
/// [`LoadError::MissingSymbols`] if any entry point is absent. In the
/// latter case the module is unloaded before returning.
pub fn resolve(module: &str, entry_points: &[&str]) -> Result<ResolvedModule, LoadError> {
    // SAFETY: loading a shared library runs its initializers. The modules
    // requested here are codec libraries with no unusual load-time effects.
    let library = unsafe { Library::new(module) }.map_err(|e| LoadError::ModuleNotFound {
        module: module.to_string(),
        reason: e.to_string(),
    })?;

    let mut report = ResolutionReport::default();
    for name in entry_points {
        // SAFETY: only the symbol address is read here; nothing is called.
        let found = unsafe { library.get::<*mut std::ffi::c_void>(name.as_bytes()) }.is_ok();
        report.record(name, found);
    }

    if !report.is_complete() {
        tracing::error!(module, "Entry point resolution failed:\n{report}");
        drop(library);
        return Err(LoadError::MissingSymbols {
            module: module.to_string(),
            report,
        });
    }

    tracing::debug!(module, entry_points = entry_points.len(), "Module resolved");
    Ok(ResolvedModule {
        module: module.to_string(),
        library,
        report,
    })
}

/// Process-lifetime cache for a fallible one-time load.
pub struct InitOnce<T> {
    cell: OnceLock<Result<Arc<T>, LoadError>>,
}

impl<T> InitOnce<T> {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            cell: OnceLock::new(),
        }
    }

    /// Return the cached outcome, running `load` if no attempt was made yet.
    ///
    /// # Errors
    ///
    /// Returns the (cached) error of the first attempt.
    pub fn get_or_load<F>(&self, load: F) -> Result<Arc<T>, LoadError>
    where
        F: FnOnce() -> Result<T, LoadError>,
    {
        self.cell.get_or_init(|| load().map(Arc::new)).clone()
    }

    /// The cached outcome, if an attempt has completed.
    #[must_use]
    pub fn get(&self) -> Option<&Result<Arc<T>, LoadError>> {
        self.cell.get()
    }
}

impl<T> Default for InitOnce<T> {
    fn default() -> Self {
        Self::new()
    }
}
