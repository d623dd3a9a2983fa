//! Dependency resolution for module composition
//!
//! Walks the `dependencies` edges of a root module depth-first with an
//! explicit stack and a per-node mark, so adversarial graphs can neither
//! loop forever nor exhaust the native stack.
//!
//! The returned closure is in post-order: every module appears after all of
//! its own dependencies. Siblings are visited in declaration order, which
//! makes the first-discovery order the tie-break between independent
//! branches and keeps composed output reproducible.

use serde::Serialize;
use std::collections::HashMap;
use thiserror::Error;

use crate::ledger::ModuleStore;
use crate::module::{Module, ModuleName};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ResolveError {
    #[error("Cyclic dependency detected while resolving \"{root}\" (back-edge into \"{module}\")")]
    CycleDetected { root: ModuleName, module: ModuleName },

    #[error("Unknown module \"{module}\" while resolving \"{root}\"")]
    UnknownModule { root: ModuleName, module: ModuleName },
}

/// Every module transitively required by `root`, root excluded
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResolvedClosure {
    pub root: ModuleName,
    pub ordered: Vec<Module>,
}

impl ResolvedClosure {
    pub fn names(&self) -> Vec<ModuleName> {
        self.ordered.iter().map(|m| m.name.clone()).collect()
    }

    pub fn contains(&self, name: &ModuleName) -> bool {
        self.ordered.iter().any(|m| &m.name == name)
    }

    /// Output can still change while any dependency in the closure is not
    /// finalized
    pub fn is_mutable(&self) -> bool {
        self.ordered.iter().any(|m| !m.is_finalized)
    }

    pub fn len(&self) -> usize {
        self.ordered.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ordered.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mark {
    OnStack,
    Done,
}

struct Frame {
    name: ModuleName,
    dependencies: Vec<ModuleName>,
    module: Option<Module>,
    next: usize,
}

/// Resolver over a read-only module store snapshot
pub struct DependencyResolver<'a, S: ModuleStore + ?Sized> {
    store: &'a S,
}

impl<'a, S: ModuleStore + ?Sized> DependencyResolver<'a, S> {
    pub fn new(store: &'a S) -> Self {
        Self { store }
    }

    /// Resolve the closure of a stored module
    pub fn resolve(&self, root: &ModuleName) -> Result<ResolvedClosure, ResolveError> {
        let module = self
            .store
            .get_module(root)
            .ok_or_else(|| ResolveError::UnknownModule {
                root: root.clone(),
                module: root.clone(),
            })?;

        self.resolve_dependencies(root, &module.dependencies)
    }

    /// Resolve the closure of a root that only exists as a name and a
    /// dependency list (e.g. an unsaved draft)
    pub fn resolve_dependencies(
        &self,
        root: &ModuleName,
        dependencies: &[ModuleName],
    ) -> Result<ResolvedClosure, ResolveError> {
        let mut marks: HashMap<ModuleName, Mark> = HashMap::new();
        let mut ordered = Vec::new();
        let mut stack = vec![Frame {
            name: root.clone(),
            dependencies: dependencies.to_vec(),
            module: None,
            next: 0,
        }];
        marks.insert(root.clone(), Mark::OnStack);

        loop {
            let next_dependency = match stack.last_mut() {
                None => break,
                Some(frame) if frame.next < frame.dependencies.len() => {
                    frame.next += 1;
                    Some(frame.dependencies[frame.next - 1].clone())
                }
                Some(_) => None,
            };

            match next_dependency {
                Some(dependency) => match marks.get(&dependency) {
                    Some(Mark::OnStack) => {
                        return Err(ResolveError::CycleDetected {
                            root: root.clone(),
                            module: dependency,
                        });
                    }
                    Some(Mark::Done) => {}
                    None => {
                        let module = self.store.get_module(&dependency).ok_or_else(|| {
                            ResolveError::UnknownModule {
                                root: root.clone(),
                                module: dependency.clone(),
                            }
                        })?;

                        marks.insert(dependency.clone(), Mark::OnStack);
                        stack.push(Frame {
                            name: dependency,
                            dependencies: module.dependencies.clone(),
                            module: Some(module),
                            next: 0,
                        });
                    }
                },
                None => {
                    if let Some(frame) = stack.pop() {
                        marks.insert(frame.name, Mark::Done);
                        // The root frame carries no module and is not emitted
                        if let Some(module) = frame.module {
                            ordered.push(module);
                        }
                    }
                }
            }
        }

        Ok(ResolvedClosure {
            root: root.clone(),
            ordered,
        })
    }
}
