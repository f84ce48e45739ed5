//! Dependency resolution
//!
//! Walks the active dependency edges of a root formula and produces a
//! deterministic [`BuildPlan`], detecting cycles and missing formulas.

use serde::Serialize;
use std::collections::{BTreeMap, HashSet};

use tracing::debug;

use crate::core::formula::{DependencyScope, Formula};
use crate::core::platform::{EvalContext, Platform};
use crate::core::registry::Registry;
use crate::error::ResolverError;

/// What the plan is for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PlanMode {
    /// Normal install; test-only edges are ignored
    Install,
    /// `test` run; the root's test edges are followed too
    Test,
}

/// Resolved, ordered list of formulas to install for one target
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BuildPlan {
    root: String,
    mode: PlanMode,
    /// Dependencies before dependents
    order: Vec<String>,
    /// Selected variant label per formula
    variants: BTreeMap<String, String>,
    /// Active direct dependencies per formula, in declared order
    edges: BTreeMap<String, Vec<String>>,
}

impl BuildPlan {
    pub fn root(&self) -> &str {
        &self.root
    }

    pub fn mode(&self) -> PlanMode {
        self.mode
    }

    pub fn order(&self) -> &[String] {
        &self.order
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.edges.contains_key(name)
    }

    /// Position of `name` in the install order
    pub fn position(&self, name: &str) -> Option<usize> {
        self.order.iter().position(|n| n == name)
    }

    /// Variant label selected for `name`
    pub fn variant(&self, name: &str) -> Option<&str> {
        self.variants.get(name).map(String::as_str)
    }

    /// Active direct dependencies of `name`
    pub fn dependencies(&self, name: &str) -> &[String] {
        self.edges.get(name).map_or(&[], Vec::as_slice)
    }

    /// Every formula `name` depends on, directly or not, in plan order
    pub fn transitive_dependencies(&self, name: &str) -> Vec<&str> {
        let mut seen = HashSet::new();
        let mut stack: Vec<&str> = self.dependencies(name).iter().map(String::as_str).collect();
        while let Some(dep) = stack.pop() {
            if seen.insert(dep) {
                stack.extend(self.dependencies(dep).iter().map(String::as_str));
            }
        }
        self.order
            .iter()
            .map(String::as_str)
            .filter(|n| seen.contains(n))
            .collect()
    }

    /// Formulas that directly depend on `name`, in plan order
    pub fn dependents(&self, name: &str) -> Vec<&str> {
        self.order
            .iter()
            .filter(|n| self.dependencies(n).iter().any(|d| d == name))
            .map(String::as_str)
            .collect()
    }
}

/// Resolves build plans against a registry for one target platform
#[derive(Debug, Clone, Copy)]
pub struct Resolver<'a> {
    registry: &'a Registry,
    platform: &'a Platform,
}

struct Walk<'r> {
    mode: PlanMode,
    root: &'r str,
    visited: HashSet<String>,
    on_stack: Vec<String>,
    order: Vec<String>,
    variants: BTreeMap<String, String>,
    edges: BTreeMap<String, Vec<String>>,
}

impl<'a> Resolver<'a> {
    pub fn new(registry: &'a Registry, platform: &'a Platform) -> Self {
        Self { registry, platform }
    }

    /// Resolve the plan for `root`
    ///
    /// `variant` selects the root's variant; dependencies always use
    /// their default variant.
    pub fn resolve(
        &self,
        root: &str,
        variant: Option<&str>,
        mode: PlanMode,
    ) -> Result<BuildPlan, ResolverError> {
        let formula = self
            .registry
            .get(root)
            .ok_or_else(|| ResolverError::UnresolvedDependency {
                name: root.to_string(),
                required_by: None,
            })?;

        let mut walk = Walk {
            mode,
            root,
            visited: HashSet::new(),
            on_stack: Vec::new(),
            order: Vec::new(),
            variants: BTreeMap::new(),
            edges: BTreeMap::new(),
        };
        self.visit(formula, variant, &mut walk)?;

        debug!(root, order = ?walk.order, "resolved build plan");

        Ok(BuildPlan {
            root: root.to_string(),
            mode,
            order: walk.order,
            variants: walk.variants,
            edges: walk.edges,
        })
    }

    fn visit(
        &self,
        formula: &Formula,
        variant: Option<&str>,
        walk: &mut Walk<'_>,
    ) -> Result<(), ResolverError> {
        let name = formula.name.as_str();

        if let Some(start) = walk.on_stack.iter().position(|n| n == name) {
            let mut path = walk.on_stack[start..].to_vec();
            path.push(name.to_string());
            return Err(ResolverError::DependencyCycle { path });
        }
        if walk.visited.contains(name) {
            return Ok(());
        }

        formula
            .check_platform(self.platform)
            .map_err(|reason| ResolverError::UnsupportedPlatform {
                name: name.to_string(),
                reason,
            })?;
        if formula.select_compiler(self.platform).is_none() {
            return Err(ResolverError::UnsupportedPlatform {
                name: name.to_string(),
                reason: "no available compiler; every host compiler is listed in fails_with"
                    .to_string(),
            });
        }

        let selected = formula.active_variant(self.platform, variant)?;
        let label = selected.label.clone();

        let scope = if walk.mode == PlanMode::Test && name == walk.root {
            DependencyScope::Test
        } else {
            DependencyScope::Install
        };

        walk.on_stack.push(name.to_string());

        let ctx = EvalContext::new(self.platform, &label);
        let mut direct = Vec::new();
        for edge in formula.active_dependencies(&ctx, scope) {
            let dep = self.registry.get(&edge.name).ok_or_else(|| {
                ResolverError::UnresolvedDependency {
                    name: edge.name.clone(),
                    required_by: Some(name.to_string()),
                }
            })?;
            self.visit(dep, None, walk)?;
            if !direct.contains(&edge.name) {
                direct.push(edge.name.clone());
            }
        }

        walk.on_stack.pop();
        walk.visited.insert(name.to_string());
        walk.order.push(name.to_string());
        walk.variants.insert(name.to_string(), label);
        walk.edges.insert(name.to_string(), direct);

        Ok(())
    }
}
