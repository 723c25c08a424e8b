use std::fmt;

use thiserror::Error;

/// Errors that can occur when resolving native entry points.
///
/// Cloneable so the outcome of the one-time load can be cached and handed
/// to every later caller.
#[derive(Debug, Clone, Error)]
pub enum LoadError {
    /// The shared module itself could not be opened.
    #[error("failed to load {module}: {reason}")]
    ModuleNotFound { module: String, reason: String },

    /// The module opened but at least one required entry point is absent.
    #[error("{module} is missing {} required entry point(s):\n{report}", .report.missing().count())]
    MissingSymbols {
        module: String,
        report: ResolutionReport,
    },
}

/// Per-entry-point outcome of resolving one module.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolutionReport {
    entries: Vec<(String, bool)>,
}

impl ResolutionReport {
    pub(crate) fn record(&mut self, name: &str, resolved: bool) {
        self.entries.push((name.to_string(), resolved));
    }

    /// Whether every entry point resolved.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.entries.iter().all(|(_, ok)| *ok)
    }

    /// Names that failed to resolve, in request order.
    pub fn missing(&self) -> impl Iterator<Item = &str> {
        self.entries
            .iter()
            .filter(|(_, ok)| !*ok)
            .map(|(name, _)| name.as_str())
    }

    /// Names that resolved, in request order.
    pub fn resolved(&self) -> impl Iterator<Item = &str> {
        self.entries
            .iter()
            .filter(|(_, ok)| *ok)
            .map(|(name, _)| name.as_str())
    }

    /// Number of entry points checked.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl fmt::Display for ResolutionReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, (name, ok)) in self.entries.iter().enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            write!(f, "{name}: {}", if *ok { "OK" } else { "FAIL" })?;
        }
        Ok(())
    }
}
