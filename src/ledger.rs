//! Module ledger
//!
//! The ledger owns Module and Invocation records. Rendering only reads from it
//! through [`ModuleStore`]; [`MemoryLedger`] additionally implements the
//! authoring mutations so a network snapshot can be served and exercised
//! in-process.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::RwLock;
use thiserror::Error;
use tracing::{debug, info};

use crate::compose::code;
use crate::module::{Invocation, Module, ModuleName, Seed, TokenId};

#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("Module \"{0}\" does not exist")]
    ModuleNotFound(ModuleName),

    #[error("Module \"{0}\" already exists")]
    AlreadyExists(ModuleName),

    #[error("Only module owner can change \"{0}\"")]
    NotOwner(ModuleName),

    #[error("Module \"{0}\" is finalized")]
    Finalized(ModuleName),

    #[error("Module \"{module}\" depends on unknown module \"{dependency}\"")]
    UnknownDependency {
        module: ModuleName,
        dependency: ModuleName,
    },

    #[error("Module \"{module}\" has malformed code: {source}")]
    MalformedCode {
        module: ModuleName,
        #[source]
        source: code::CodeError,
    },

    #[error("Module \"{0}\" is not invocable")]
    NotInvocable(ModuleName),

    #[error("Module \"{0}\" must be finalized")]
    NotFinalized(ModuleName),

    #[error("Module \"{0}\" has no invocations left")]
    InvocationsExhausted(ModuleName),
}

/// Offset/limit window for paged owner queries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Page {
    pub offset: usize,
    pub limit: usize,
}

impl Default for Page {
    fn default() -> Self {
        Self {
            offset: 0,
            limit: 50,
        }
    }
}

/// Read-only view of a network's module ledger
pub trait ModuleStore: Send + Sync {
    fn get_module(&self, name: &ModuleName) -> Option<Module>;

    fn exists(&self, name: &ModuleName) -> bool {
        self.get_module(name).is_some()
    }

    /// Module minted under the given token id
    fn module_by_token(&self, token_id: TokenId) -> Option<Module>;

    fn get_invocation(&self, token_id: TokenId) -> Option<Invocation>;

    fn owned_modules(&self, owner: &str, page: Page) -> Vec<Module>;

    fn owned_invocations(&self, owner: &str, page: Page) -> Vec<Invocation>;
}

/// Authoring input for create/update
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModuleDraft {
    pub name: ModuleName,
    #[serde(rename = "metadataJSON", default)]
    pub metadata_json: String,
    #[serde(default)]
    pub dependencies: Vec<ModuleName>,
    pub code: String,
    #[serde(default)]
    pub is_invocable: bool,
}

/// Serialized ledger contents for one network
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LedgerSnapshot {
    #[serde(default)]
    pub modules: Vec<Module>,
    #[serde(default)]
    pub invocations: Vec<Invocation>,
}

#[derive(Debug, Default)]
struct LedgerState {
    modules: BTreeMap<ModuleName, Module>,
    module_tokens: BTreeMap<TokenId, ModuleName>,
    invocations: BTreeMap<TokenId, Invocation>,
    next_token_id: TokenId,
}

impl LedgerState {
    fn mint_token_id(&mut self) -> TokenId {
        let id = self.next_token_id;
        self.next_token_id += 1;
        id
    }

    fn check_dependencies(&self, draft: &ModuleDraft) -> Result<(), LedgerError> {
        for dependency in &draft.dependencies {
            if !self.modules.contains_key(dependency) {
                return Err(LedgerError::UnknownDependency {
                    module: draft.name.clone(),
                    dependency: dependency.clone(),
                });
            }
        }
        Ok(())
    }

    fn owned_module_mut(&mut self, owner: &str, name: &ModuleName) -> Result<&mut Module, LedgerError> {
        let module = self
            .modules
            .get_mut(name)
            .ok_or_else(|| LedgerError::ModuleNotFound(name.clone()))?;

        if module.owner != owner {
            return Err(LedgerError::NotOwner(name.clone()));
        }
        Ok(module)
    }

    fn unlocked_module_mut(&mut self, owner: &str, name: &ModuleName) -> Result<&mut Module, LedgerError> {
        let module = self.owned_module_mut(owner, name)?;
        if module.is_finalized {
            return Err(LedgerError::Finalized(name.clone()));
        }
        Ok(module)
    }
}

/// In-process ledger guarded by a single lock
#[derive(Debug)]
pub struct MemoryLedger {
    state: RwLock<LedgerState>,
}

impl Default for MemoryLedger {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(LedgerState {
                next_token_id: 1,
                ..Default::default()
            }),
        }
    }

    /// Build a ledger from exported records
    ///
    /// Records are trusted as-is (the ledger already admitted them), but
    /// duplicate names, colliding token ids and invocations of unknown
    /// modules are rejected.
    pub fn from_snapshot(snapshot: LedgerSnapshot) -> Result<Self> {
        let mut state = LedgerState::default();
        let mut max_token = 0;

        for module in snapshot.modules {
            max_token = max_token.max(module.token_id);
            if state.module_tokens.insert(module.token_id, module.name.clone()).is_some() {
                anyhow::bail!("Duplicate token id {} in ledger snapshot", module.token_id);
            }
            if state.modules.contains_key(&module.name) {
                anyhow::bail!("Duplicate module \"{}\" in ledger snapshot", module.name);
            }
            state.modules.insert(module.name.clone(), module);
        }

        for invocation in snapshot.invocations {
            max_token = max_token.max(invocation.token_id);
            if !state.modules.contains_key(&invocation.module_name) {
                anyhow::bail!(
                    "Invocation {} references unknown module \"{}\"",
                    invocation.token_id,
                    invocation.module_name
                );
            }
            if state.module_tokens.contains_key(&invocation.token_id)
                || state.invocations.contains_key(&invocation.token_id)
            {
                anyhow::bail!("Duplicate token id {} in ledger snapshot", invocation.token_id);
            }
            state.invocations.insert(invocation.token_id, invocation);
        }

        state.next_token_id = max_token + 1;

        Ok(Self {
            state: RwLock::new(state),
        })
    }

    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read ledger file: {}", path.as_ref().display()))?;

        let snapshot: LedgerSnapshot = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse ledger file: {}", path.as_ref().display()))?;

        info!(
            modules = snapshot.modules.len(),
            invocations = snapshot.invocations.len(),
            "Loaded ledger snapshot from {}",
            path.as_ref().display()
        );

        Self::from_snapshot(snapshot)
    }

    pub fn snapshot(&self) -> LedgerSnapshot {
        let state = self.read();
        LedgerSnapshot {
            modules: state.modules.values().cloned().collect(),
            invocations: state.invocations.values().cloned().collect(),
        }
    }

    pub fn create_module(&self, owner: &str, draft: ModuleDraft) -> Result<TokenId, LedgerError> {
        let mut state = self.write();

        if state.modules.contains_key(&draft.name) {
            return Err(LedgerError::AlreadyExists(draft.name));
        }
        state.check_dependencies(&draft)?;
        admit_code(&draft)?;

        let token_id = state.mint_token_id();
        debug!(module = %draft.name, token_id, "Creating module");

        state.module_tokens.insert(token_id, draft.name.clone());
        state.modules.insert(
            draft.name.clone(),
            Module {
                name: draft.name,
                token_id,
                owner: owner.to_string(),
                code: draft.code,
                dependencies: draft.dependencies,
                metadata_json: draft.metadata_json,
                is_invocable: draft.is_invocable,
                is_finalized: false,
                invocations_max: 0,
                invocations_num: 0,
            },
        );

        Ok(token_id)
    }

    /// Replace a module's authored fields
    ///
    /// Finalized modules reject every update. Dependencies must exist now,
    /// but may point back at the module itself; cycles are only rejected at
    /// resolve time.
    pub fn update_module(&self, owner: &str, draft: ModuleDraft) -> Result<(), LedgerError> {
        let mut state = self.write();
        state.check_dependencies(&draft)?;

        let module = state.unlocked_module_mut(owner, &draft.name)?;
        admit_code(&draft)?;

        debug!(module = %draft.name, "Updating module");

        module.code = draft.code;
        module.dependencies = draft.dependencies;
        module.metadata_json = draft.metadata_json;
        module.is_invocable = draft.is_invocable;

        Ok(())
    }

    pub fn finalize(&self, owner: &str, name: &ModuleName) -> Result<(), LedgerError> {
        let mut state = self.write();
        let module = state.unlocked_module_mut(owner, name)?;
        module.is_finalized = true;
        Ok(())
    }

    pub fn set_invocable(
        &self,
        owner: &str,
        name: &ModuleName,
        is_invocable: bool,
    ) -> Result<(), LedgerError> {
        let mut state = self.write();
        let module = state.unlocked_module_mut(owner, name)?;
        module.is_invocable = is_invocable;
        Ok(())
    }

    /// Open an invocable module for minting
    ///
    /// Sets how many invocations may ever be minted and finalizes the module,
    /// so the limit cannot change afterwards.
    pub fn set_invocations_max(
        &self,
        owner: &str,
        name: &ModuleName,
        invocations_max: u64,
    ) -> Result<(), LedgerError> {
        let mut state = self.write();
        let module = state.unlocked_module_mut(owner, name)?;

        if !module.is_invocable {
            return Err(LedgerError::NotInvocable(name.clone()));
        }
        module.invocations_max = invocations_max;
        module.is_finalized = true;
        Ok(())
    }

    /// Mint an invocation token for a finalized invocable module
    pub fn create_invocation(&self, owner: &str, name: &ModuleName) -> Result<TokenId, LedgerError> {
        let mut state = self.write();

        let module = state
            .modules
            .get(name)
            .ok_or_else(|| LedgerError::ModuleNotFound(name.clone()))?;

        if !module.is_invocable {
            return Err(LedgerError::NotInvocable(name.clone()));
        }
        if !module.is_finalized {
            return Err(LedgerError::NotFinalized(name.clone()));
        }
        if module.invocations_num >= module.invocations_max {
            return Err(LedgerError::InvocationsExhausted(name.clone()));
        }

        let token_id = state.mint_token_id();
        let seed = Seed::derive(name, token_id);

        if let Some(module) = state.modules.get_mut(name) {
            module.invocations_num += 1;
        }
        state.invocations.insert(
            token_id,
            Invocation {
                token_id,
                module_name: name.clone(),
                seed,
                owner: owner.to_string(),
            },
        );

        debug!(module = %name, token_id, "Minted invocation");
        Ok(token_id)
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, LedgerState> {
        self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, LedgerState> {
        self.state.write().unwrap_or_else(|e| e.into_inner())
    }
}

fn admit_code(draft: &ModuleDraft) -> Result<(), LedgerError> {
    code::admit(&draft.code)
        .map(|_| ())
        .map_err(|source| LedgerError::MalformedCode {
            module: draft.name.clone(),
            source,
        })
}

fn paginate<T: Clone>(items: impl Iterator<Item = T>, page: Page) -> Vec<T> {
    items.skip(page.offset).take(page.limit).collect()
}

impl ModuleStore for MemoryLedger {
    fn get_module(&self, name: &ModuleName) -> Option<Module> {
        self.read().modules.get(name).cloned()
    }

    fn exists(&self, name: &ModuleName) -> bool {
        self.read().modules.contains_key(name)
    }

    fn module_by_token(&self, token_id: TokenId) -> Option<Module> {
        let state = self.read();
        state
            .module_tokens
            .get(&token_id)
            .and_then(|name| state.modules.get(name))
            .cloned()
    }

    fn get_invocation(&self, token_id: TokenId) -> Option<Invocation> {
        self.read().invocations.get(&token_id).cloned()
    }

    fn owned_modules(&self, owner: &str, page: Page) -> Vec<Module> {
        let state = self.read();
        let mut owned: Vec<&Module> = state.modules.values().filter(|m| m.owner == owner).collect();
        owned.sort_by_key(|m| m.token_id);
        paginate(owned.into_iter().cloned(), page)
    }

    fn owned_invocations(&self, owner: &str, page: Page) -> Vec<Invocation> {
        let state = self.read();
        paginate(
            state.invocations.values().filter(|i| i.owner == owner).cloned(),
            page,
        )
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;

    #[test]
    fn test_create_and_get_module() {
        let ledger = MemoryLedger::new();
        let token = ledger.create_module(OWNER, draft("a", &[], "() => 1")).unwrap();

        let module = ledger.get_module(&name("a")).unwrap();
        assert_eq!(module.token_id, token);
        assert_eq!(ledger.module_by_token(token).unwrap().name, name("a"));
        assert!(ledger.exists(&name("a")));
        assert!(!ledger.exists(&name("b")));
    }

    #[test]
    fn test_create_rejects_duplicates_and_unknown_deps() {
        let ledger = MemoryLedger::new();
        ledger.create_module(OWNER, draft("a", &[], "() => 1")).unwrap();

        assert!(matches!(
            ledger.create_module(OWNER, draft("a", &[], "() => 1")),
            Err(LedgerError::AlreadyExists(_))
        ));
        assert!(matches!(
            ledger.create_module(OWNER, draft("self", &["self"], "(s) => s")),
            Err(LedgerError::UnknownDependency { .. })
        ));
    }

    #[test]
    fn test_malformed_code_is_not_persisted() {
        let ledger = MemoryLedger::new();
        let result = ledger.create_module(OWNER, draft("bad", &[], "let x = 1; x"));

        assert!(matches!(result, Err(LedgerError::MalformedCode { .. })));
        assert!(!ledger.exists(&name("bad")));
    }

    #[test]
    fn test_update_allows_self_dependency() {
        let ledger = MemoryLedger::new();
        ledger.create_module(OWNER, draft("m-1", &[], "() => {}")).unwrap();
        ledger.update_module(OWNER, draft("m-1", &["m-1"], "() => {}")).unwrap();

        let module = ledger.get_module(&name("m-1")).unwrap();
        assert_eq!(module.dependencies, vec![name("m-1")]);
    }

    #[test]
    fn test_update_requires_owner() {
        let ledger = MemoryLedger::new();
        ledger.create_module(OWNER, draft("own-1", &[], "() => {}")).unwrap();

        assert!(matches!(
            ledger.update_module("0xbb", draft("own-1", &[], "() => 2")),
            Err(LedgerError::NotOwner(_))
        ));
    }

    #[test]
    fn test_finalized_modules_are_locked() {
        let ledger = MemoryLedger::new();
        let mut invocable = draft("final-1", &[], "() => {}");
        invocable.is_invocable = true;
        ledger.create_module(OWNER, invocable.clone()).unwrap();
        ledger.finalize(OWNER, &name("final-1")).unwrap();

        assert!(matches!(
            ledger.finalize(OWNER, &name("final-1")),
            Err(LedgerError::Finalized(_))
        ));
        assert!(matches!(
            ledger.set_invocations_max(OWNER, &name("final-1"), 10),
            Err(LedgerError::Finalized(_))
        ));
        assert!(matches!(
            ledger.set_invocable(OWNER, &name("final-1"), true),
            Err(LedgerError::Finalized(_))
        ));
        // Even an update that changes nothing
        assert!(matches!(
            ledger.update_module(OWNER, invocable),
            Err(LedgerError::Finalized(_))
        ));
    }

    #[test]
    fn test_invocation_requires_finalized_module_with_mints_left() {
        let ledger = MemoryLedger::new();
        let mut invocable = draft("mint-1", &[], "() => {}");
        invocable.is_invocable = true;
        ledger.create_module(OWNER, invocable).unwrap();
        ledger.create_module(OWNER, draft("mint-2", &[], "() => {}")).unwrap();

        assert!(matches!(
            ledger.create_invocation(OWNER, &name("mint-1")),
            Err(LedgerError::NotFinalized(_))
        ));
        assert!(matches!(
            ledger.create_invocation(OWNER, &name("mint-2")),
            Err(LedgerError::NotInvocable(_))
        ));

        // Finalized without a limit: zero mints available
        ledger.finalize(OWNER, &name("mint-1")).unwrap();
        assert!(matches!(
            ledger.create_invocation(OWNER, &name("mint-1")),
            Err(LedgerError::InvocationsExhausted(_))
        ));
    }

    #[test]
    fn test_invocations() {
        let ledger = MemoryLedger::new();
        let mut invocable = draft("inv", &[], "() => (seed) => seed");
        invocable.is_invocable = true;
        ledger.create_module(OWNER, invocable).unwrap();
        ledger.create_module(OWNER, draft("plain", &[], "() => 1")).unwrap();
        ledger.set_invocations_max(OWNER, &name("inv"), 1).unwrap();
        assert!(ledger.get_module(&name("inv")).unwrap().is_finalized);

        let token = ledger.create_invocation("0xcc", &name("inv")).unwrap();
        let invocation = ledger.get_invocation(token).unwrap();
        assert_eq!(invocation.module_name, name("inv"));
        assert_eq!(invocation.seed, Seed::derive(&name("inv"), token));

        assert!(matches!(
            ledger.create_invocation("0xcc", &name("inv")),
            Err(LedgerError::InvocationsExhausted(_))
        ));
        assert!(matches!(
            ledger.create_invocation("0xcc", &name("plain")),
            Err(LedgerError::NotInvocable(_))
        ));
        assert_eq!(ledger.owned_invocations("0xcc", Page::default()).len(), 1);
    }

    #[test]
    fn test_owned_modules_paging() {
        let ledger = MemoryLedger::new();
        for i in 0..5 {
            ledger
                .create_module(OWNER, draft(&format!("p-{}", i), &[], "() => {}"))
                .unwrap();
        }

        let page = ledger.owned_modules(OWNER, Page { offset: 1, limit: 2 });
        let names: Vec<&str> = page.iter().map(|m| m.name.as_str()).collect();
        assert_eq!(names, vec!["p-1", "p-2"]);
        assert!(ledger.owned_modules("0xnobody", Page::default()).is_empty());
    }

    #[test]
    fn test_snapshot_round_trip_keeps_token_counter() {
        let ledger = MemoryLedger::new();
        ledger.create_module(OWNER, draft("a", &[], "() => 1")).unwrap();
        ledger.create_module(OWNER, draft("b", &["a"], "(a) => a")).unwrap();

        let restored = MemoryLedger::from_snapshot(ledger.snapshot()).unwrap();
        let token = restored.create_module(OWNER, draft("c", &[], "() => 1")).unwrap();
        assert_eq!(token, 3);
    }

    #[test]
    fn test_snapshot_rejects_dangling_invocation() {
        let snapshot = LedgerSnapshot {
            modules: vec![],
            invocations: vec![Invocation {
                token_id: 9,
                module_name: name("ghost"),
                seed: Seed::preview(),
                owner: OWNER.to_string(),
            }],
        };
        assert!(MemoryLedger::from_snapshot(snapshot).is_err());
    }
}
