//! Formula registry
//!
//! A read-only map from formula name to [`Formula`], loaded from a
//! directory of `*.toml` / `*.json` formula documents.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::core::formula::Formula;
use crate::error::FormulaError;

/// All formulas known to a run
#[derive(Debug, Clone, Default)]
pub struct Registry {
    formulas: BTreeMap<String, Formula>,
    sources: BTreeMap<String, PathBuf>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a registry from already-parsed formulas
    pub fn from_formulas(formulas: impl IntoIterator<Item = Formula>) -> Result<Self, FormulaError> {
        let mut registry = Self::new();
        for formula in formulas {
            registry.insert(formula, None)?;
        }
        Ok(registry)
    }

    /// Load every formula document directly inside `dir`
    ///
    /// Files are read in name order so duplicate detection is stable.
    pub fn load_dir(dir: &Path) -> Result<Self, FormulaError> {
        let read_dir = std::fs::read_dir(dir).map_err(|e| FormulaError::IoError {
            path: dir.to_path_buf(),
            error: e.to_string(),
        })?;

        let mut paths: Vec<PathBuf> = read_dir
            .filter_map(Result::ok)
            .map(|entry| entry.path())
            .filter(|path| path.is_file() && is_formula_document(path))
            .collect();
        paths.sort();

        let mut registry = Self::new();
        for path in paths {
            let formula = Formula::load(&path)?;
            debug!(formula = %formula.name, path = %path.display(), "loaded formula");
            registry.insert(formula, Some(path))?;
        }
        Ok(registry)
    }

    fn insert(&mut self, formula: Formula, source: Option<PathBuf>) -> Result<(), FormulaError> {
        let name = formula.name.clone();
        if self.formulas.contains_key(&name) {
            return Err(FormulaError::DuplicateFormula {
                first: self.sources.get(&name).cloned().unwrap_or_default(),
                second: source.unwrap_or_default(),
                name,
            });
        }
        if let Some(source) = source {
            self.sources.insert(name.clone(), source);
        }
        self.formulas.insert(name, formula);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&Formula> {
        self.formulas.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.formulas.contains_key(name)
    }

    /// Formula names in sorted order
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.formulas.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.formulas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.formulas.is_empty()
    }
}

fn is_formula_document(path: &Path) -> bool {
    path.extension()
        .is_some_and(|ext| ext == "toml" || ext == "json")
}
