//! Module environment: layered, copy-on-write name visibility
//!
//! Each scope sees commands, macros and named objects through three tiers:
//!
//! - **inherited**: a snapshot of the parent's effective registries, never
//!   written through this scope
//! - **restricted library**: the modules an `IMPORT` may draw from, shared
//!   with the parent until a `LIBRARY` directive changes it
//! - **local**: per-name bindings layered over the inherited snapshot
//!
//! Both the restricted library and the local bindings are a [`Tier`]: shared
//! with whoever created the scope until the first write, then privately
//! owned. Local bindings are three-state ([`Binding`]) so that a removal can
//! hide an inherited name without touching the parent.
//!
//! Lock order when more than one tier is involved: library inherited,
//! library restricted, commands, macros, objects, exports, provenance.

use crate::ast::{Position, Value};
use crate::executor::Handler;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, RwLock, RwLockReadGuard, RwLockWriteGuard};
use thiserror::Error;
use tracing::debug;

/// Module that receives exports made inside a macro call without `MODULE`
pub const MACRO_EXPORT_MODULE: &str = "exports";

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ModuleError {
    #[error("module not found: {0}")]
    UnknownModule(String),
    #[error("item '{item}' not found in module '{module}'")]
    UnknownItem { module: String, item: String },
    #[error("import collision: '{name}' is already defined here as a {kind}; rename it with IMPORT new_name: \"{module}::{item}\"")]
    Collision {
        name: String,
        kind: ItemKind,
        module: String,
        item: String,
    },
    #[error("EXPORT needs a current module; use MODULE <name> first")]
    NoDefaultModule,
    #[error("cannot export '{0}': no macro, command or object by that name")]
    UnknownExport(String),
    #[error("nothing named '{0}' to remove")]
    NothingToRemove(String),
    #[error("invalid library directive: {0}")]
    BadDirective(String),
}

/// Macro definition: source text plus the environment it closes over
pub struct Macro {
    pub name: Option<String>,
    pub body: String,
    pub position: Position,
    /// Defining scope; calls run in a child of it
    pub env: Option<Arc<ModuleEnvironment>>,
}

impl Macro {
    pub fn new(name: Option<String>, body: impl Into<String>, position: Position) -> Self {
        Macro {
            name,
            body: body.into(),
            position,
            env: None,
        }
    }

    pub fn with_env(mut self, env: Arc<ModuleEnvironment>) -> Self {
        self.env = Some(env);
        self
    }
}

impl fmt::Debug for Macro {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Macro")
            .field("name", &self.name)
            .field("body", &self.body)
            .field("position", &self.position)
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemKind {
    Command,
    Macro,
    Object,
}

impl fmt::Display for ItemKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ItemKind::Command => "command",
            ItemKind::Macro => "macro",
            ItemKind::Object => "object",
        })
    }
}

/// One entry of a library module
#[derive(Clone)]
pub enum ModuleItem {
    Command(Handler),
    Macro(Arc<Macro>),
    Object(Value),
}

impl ModuleItem {
    pub fn kind(&self) -> ItemKind {
        match self {
            ModuleItem::Command(_) => ItemKind::Command,
            ModuleItem::Macro(_) => ItemKind::Macro,
            ModuleItem::Object(_) => ItemKind::Object,
        }
    }
}

impl fmt::Debug for ModuleItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModuleItem::Command(_) => f.write_str("Command(..)"),
            ModuleItem::Macro(m) => f.debug_tuple("Macro").field(m).finish(),
            ModuleItem::Object(v) => f.debug_tuple("Object").field(v).finish(),
        }
    }
}

pub type Module = BTreeMap<String, ModuleItem>;
pub type Library = BTreeMap<String, Module>;

/// Copy-on-write state of a tier
pub enum Tier<T> {
    /// Aliases the creator's data; no private writes yet
    Shared(Arc<T>),
    /// Private copy owned by this scope
    Owned(T),
}

impl<T: Clone> Tier<T> {
    pub fn get(&self) -> &T {
        match self {
            Tier::Shared(shared) => shared,
            Tier::Owned(owned) => owned,
        }
    }

    /// Mutable access, copying a shared tier first
    pub fn to_mut(&mut self) -> &mut T {
        if let Tier::Shared(shared) = self {
            *self = Tier::Owned(T::clone(shared));
        }
        match self {
            Tier::Owned(owned) => owned,
            Tier::Shared(_) => unreachable!("tier was just made owned"),
        }
    }

    pub fn is_owned(&self) -> bool {
        matches!(self, Tier::Owned(_))
    }

    /// Hand out a shareable snapshot. An owned tier becomes shared, so the
    /// next private write copies again instead of leaking into the snapshot.
    pub fn share(&mut self) -> Arc<T> {
        if let Tier::Owned(owned) = self {
            let shared = Arc::new(std::mem::replace(owned, T::clone(owned)));
            *self = Tier::Shared(Arc::clone(&shared));
            return shared;
        }
        match self {
            Tier::Shared(shared) => Arc::clone(shared),
            Tier::Owned(_) => unreachable!("tier was just shared"),
        }
    }
}

/// State of one name in a scope's local tier
#[derive(Debug, Clone, PartialEq)]
pub enum Binding<V> {
    /// No local entry: resolves through the inherited snapshot
    Inherited,
    /// Local value shadowing whatever is inherited
    Overridden(V),
    /// Hidden in this scope even if inherited
    Removed,
}

/// Local bindings layered over an inherited snapshot
pub struct Registry<V> {
    inherited: Arc<BTreeMap<String, V>>,
    local: Tier<BTreeMap<String, Binding<V>>>,
    effective: OnceLock<Arc<BTreeMap<String, V>>>,
}

impl<V: Clone> Registry<V> {
    pub fn new(inherited: Arc<BTreeMap<String, V>>) -> Self {
        Registry {
            inherited,
            local: Tier::Shared(Arc::new(BTreeMap::new())),
            effective: OnceLock::new(),
        }
    }

    pub fn get(&self, name: &str) -> Option<V> {
        match self.local.get().get(name) {
            Some(Binding::Overridden(v)) => Some(v.clone()),
            Some(Binding::Removed) => None,
            Some(Binding::Inherited) | None => self.inherited.get(name).cloned(),
        }
    }

    pub fn binding(&self, name: &str) -> Binding<V> {
        self.local
            .get()
            .get(name)
            .cloned()
            .unwrap_or(Binding::Inherited)
    }

    pub fn is_local(&self, name: &str) -> bool {
        matches!(self.local.get().get(name), Some(Binding::Overridden(_)))
    }

    pub fn is_copied(&self) -> bool {
        self.local.is_owned()
    }

    pub fn set(&mut self, name: &str, value: V) {
        self.local
            .to_mut()
            .insert(name.to_string(), Binding::Overridden(value));
        self.effective = OnceLock::new();
    }

    pub fn remove(&mut self, name: &str) {
        self.local.to_mut().insert(name.to_string(), Binding::Removed);
        self.effective = OnceLock::new();
    }

    /// Drop every local binding, falling back to the inherited snapshot
    pub fn reset(&mut self) {
        self.local = Tier::Shared(Arc::new(BTreeMap::new()));
        self.effective = OnceLock::new();
    }

    /// Merged view handed to child scopes as their inherited snapshot
    pub fn effective(&self) -> Arc<BTreeMap<String, V>> {
        let local = self.local.get();
        if local.is_empty() {
            return Arc::clone(&self.inherited);
        }
        Arc::clone(self.effective.get_or_init(|| {
            let mut merged = (*self.inherited).clone();
            for (name, binding) in local {
                match binding {
                    Binding::Overridden(v) => {
                        merged.insert(name.clone(), v.clone());
                    }
                    Binding::Removed => {
                        merged.remove(name);
                    }
                    Binding::Inherited => {}
                }
            }
            Arc::new(merged)
        }))
    }

    pub fn names(&self) -> Vec<String> {
        self.effective().keys().cloned().collect()
    }

    fn inherited_mut(&mut self) -> &mut BTreeMap<String, V> {
        self.effective = OnceLock::new();
        Arc::make_mut(&mut self.inherited)
    }
}

/// Where an imported local name came from
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Provenance {
    pub module: String,
    pub original: String,
    pub kind: ItemKind,
}

/// One `IMPORT` request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportSpec {
    pub module: String,
    /// `None` or a wildcard pattern imports every matching item
    pub item: Option<String>,
    /// Explicit local name
    pub alias: Option<String>,
}

impl ImportSpec {
    /// Parse `module`, `module::item` or `module::pattern`
    pub fn parse(spec: &str, alias: Option<String>) -> ImportSpec {
        let spec = spec.trim();
        match spec.split_once("::") {
            Some((module, item)) => ImportSpec {
                module: module.trim().to_string(),
                item: Some(item.trim().to_string()).filter(|i| !i.is_empty() && i != "*"),
                alias,
            },
            None => ImportSpec {
                module: spec.to_string(),
                item: None,
                alias,
            },
        }
    }
}

fn is_pattern(name: &str) -> bool {
    name.contains(['*', '?', '['])
}

fn matches_pattern(pattern: &str, name: &str) -> bool {
    glob::Pattern::new(pattern)
        .map(|p| p.matches(name))
        .unwrap_or(false)
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|e| e.into_inner())
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|e| e.into_inner())
}

fn locked<T>(lock: &Mutex<T>) -> MutexGuard<'_, T> {
    lock.lock().unwrap_or_else(|e| e.into_inner())
}

/// Layered scope structure governing command/macro/object visibility
pub struct ModuleEnvironment {
    default_name: RwLock<Option<String>>,
    library_inherited: RwLock<Arc<Library>>,
    library_restricted: RwLock<Tier<Library>>,
    commands: RwLock<Registry<Handler>>,
    macros: RwLock<Registry<Arc<Macro>>>,
    objects: RwLock<Registry<Value>>,
    exports: Arc<Mutex<Library>>,
    imported: Mutex<BTreeMap<String, Provenance>>,
}

impl Default for ModuleEnvironment {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ModuleEnvironment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleEnvironment")
            .field("default_name", &*read(&self.default_name))
            .field("commands", &read(&self.commands).names())
            .field("macros", &read(&self.macros).names())
            .finish()
    }
}

impl ModuleEnvironment {
    /// Root environment with empty tiers
    pub fn new() -> Self {
        let library = Arc::new(Library::new());
        ModuleEnvironment {
            default_name: RwLock::new(None),
            library_inherited: RwLock::new(Arc::clone(&library)),
            library_restricted: RwLock::new(Tier::Shared(library)),
            commands: RwLock::new(Registry::new(Arc::new(BTreeMap::new()))),
            macros: RwLock::new(Registry::new(Arc::new(BTreeMap::new()))),
            objects: RwLock::new(Registry::new(Arc::new(BTreeMap::new()))),
            exports: Arc::new(Mutex::new(Library::new())),
            imported: Mutex::new(BTreeMap::new()),
        }
    }

    /// Child scope: inherits the parent's effective registries and restricted
    /// library, and shares its exports
    pub fn new_child(parent: &ModuleEnvironment) -> Arc<ModuleEnvironment> {
        Arc::new(Self::child_with_exports(parent, Arc::clone(&parent.exports)))
    }

    /// Child scope for a macro call: own exports table and a default module
    /// so `EXPORT` works without a prior `MODULE`
    pub fn new_macro_scope(parent: &ModuleEnvironment) -> Arc<ModuleEnvironment> {
        let child = Self::child_with_exports(parent, Arc::new(Mutex::new(Library::new())));
        *write(&child.default_name) = Some(MACRO_EXPORT_MODULE.to_string());
        Arc::new(child)
    }

    fn child_with_exports(parent: &ModuleEnvironment, exports: Arc<Mutex<Library>>) -> Self {
        let default_name = read(&parent.default_name).clone();
        let library = write(&parent.library_restricted).share();
        let commands = read(&parent.commands).effective();
        let macros = read(&parent.macros).effective();
        let objects = read(&parent.objects).effective();
        ModuleEnvironment {
            default_name: RwLock::new(default_name),
            library_inherited: RwLock::new(Arc::clone(&library)),
            library_restricted: RwLock::new(Tier::Shared(library)),
            commands: RwLock::new(Registry::new(commands)),
            macros: RwLock::new(Registry::new(macros)),
            objects: RwLock::new(Registry::new(objects)),
            exports,
            imported: Mutex::new(BTreeMap::new()),
        }
    }

    // === Lookups ===

    pub fn get_command(&self, name: &str) -> Option<Handler> {
        read(&self.commands).get(name)
    }

    pub fn get_macro(&self, name: &str) -> Option<Arc<Macro>> {
        read(&self.macros).get(name)
    }

    pub fn get_object(&self, name: &str) -> Option<Value> {
        read(&self.objects).get(name)
    }

    pub fn command_binding(&self, name: &str) -> Binding<Handler> {
        read(&self.commands).binding(name)
    }

    pub fn macro_binding(&self, name: &str) -> Binding<Arc<Macro>> {
        read(&self.macros).binding(name)
    }

    pub fn has_local_macro(&self, name: &str) -> bool {
        read(&self.macros).is_local(name)
    }

    pub fn commands_copied(&self) -> bool {
        read(&self.commands).is_copied()
    }

    pub fn command_names(&self) -> Vec<String> {
        read(&self.commands).names()
    }

    pub fn macro_names(&self) -> Vec<String> {
        read(&self.macros).names()
    }

    pub fn provenance(&self, local_name: &str) -> Option<Provenance> {
        locked(&self.imported).get(local_name).cloned()
    }

    pub fn default_name(&self) -> Option<String> {
        read(&self.default_name).clone()
    }

    pub fn set_default_name(&self, name: &str) {
        *write(&self.default_name) = Some(name.to_string());
    }

    /// Modules an `IMPORT` can currently see
    pub fn restricted_modules(&self) -> Vec<String> {
        read(&self.library_restricted).get().keys().cloned().collect()
    }

    pub fn library_module(&self, module: &str) -> Option<Module> {
        read(&self.library_restricted).get().get(module).cloned()
    }

    // === Registration ===

    pub fn register_command(&self, name: &str, handler: Handler) {
        write(&self.commands).set(name, handler);
    }

    pub fn register_macro(&self, name: &str, mac: Arc<Macro>) {
        write(&self.macros).set(name, mac);
    }

    pub fn set_object(&self, name: &str, value: Value) {
        write(&self.objects).set(name, value);
    }

    /// Install a global command into this scope's inherited tier. Meant for
    /// host setup on the root environment before any child exists.
    pub fn install_command(&self, name: &str, handler: Handler) {
        write(&self.commands)
            .inherited_mut()
            .insert(name.to_string(), handler);
    }

    /// Install an item into a library module (inherited and restricted)
    pub fn install_module_item(&self, module: &str, item: &str, value: ModuleItem) {
        let mut inherited = write(&self.library_inherited);
        let mut restricted = write(&self.library_restricted);
        Arc::make_mut(&mut inherited)
            .entry(module.to_string())
            .or_default()
            .insert(item.to_string(), value.clone());
        restricted
            .to_mut()
            .entry(module.to_string())
            .or_default()
            .insert(item.to_string(), value);
    }

    /// Mirror every inherited command into the `stdlib` library module
    pub fn populate_stdlib(&self, module: &str) {
        let commands = read(&self.commands).effective();
        for (name, handler) in commands.iter() {
            self.install_module_item(module, name, ModuleItem::Command(handler.clone()));
        }
    }

    // === LIBRARY ===

    /// Remove modules or items from the restricted tier (`*` clears it)
    pub fn restrict(&self, spec: &str) -> Result<(), ModuleError> {
        let spec = spec.trim();
        let mut restricted = write(&self.library_restricted);
        if spec == "*" {
            *restricted = Tier::Owned(Library::new());
            return Ok(());
        }
        let library = restricted.to_mut();
        match spec.split_once("::") {
            Some((module, item)) => {
                let module_items = library
                    .get_mut(module.trim())
                    .ok_or_else(|| ModuleError::UnknownModule(module.trim().to_string()))?;
                let item = item.trim();
                if is_pattern(item) {
                    module_items.retain(|name, _| !matches_pattern(item, name));
                } else {
                    module_items.remove(item);
                }
            }
            None if is_pattern(spec) => library.retain(|name, _| !matches_pattern(spec, name)),
            None => {
                library.remove(spec);
            }
        }
        Ok(())
    }

    /// Re-admit modules or items from the inherited library (`*` admits all)
    pub fn allow(&self, spec: &str) -> Result<(), ModuleError> {
        let spec = spec.trim();
        let inherited = Arc::clone(&read(&self.library_inherited));
        let mut restricted = write(&self.library_restricted);
        if spec == "*" {
            *restricted = Tier::Shared(inherited);
            return Ok(());
        }
        match spec.split_once("::") {
            Some((module, item)) => {
                let (module, item) = (module.trim(), item.trim());
                let source = inherited
                    .get(module)
                    .ok_or_else(|| ModuleError::UnknownModule(module.to_string()))?;
                let picked: Vec<(String, ModuleItem)> = source
                    .iter()
                    .filter(|(name, _)| {
                        if is_pattern(item) {
                            matches_pattern(item, name)
                        } else {
                            name.as_str() == item
                        }
                    })
                    .map(|(n, v)| (n.clone(), v.clone()))
                    .collect();
                if picked.is_empty() {
                    return Err(ModuleError::UnknownItem {
                        module: module.to_string(),
                        item: item.to_string(),
                    });
                }
                restricted
                    .to_mut()
                    .entry(module.to_string())
                    .or_default()
                    .extend(picked);
            }
            None => {
                let picked: Vec<(String, Module)> = inherited
                    .iter()
                    .filter(|(name, _)| {
                        if is_pattern(spec) {
                            matches_pattern(spec, name)
                        } else {
                            name.as_str() == spec
                        }
                    })
                    .map(|(n, m)| (n.clone(), m.clone()))
                    .collect();
                if picked.is_empty() {
                    return Err(ModuleError::UnknownModule(spec.to_string()));
                }
                restricted.to_mut().extend(picked);
            }
        }
        Ok(())
    }

    // === IMPORT ===

    /// Import a module, an item or a pattern from the restricted tier.
    /// Returns the local names bound.
    pub fn import(&self, spec: &ImportSpec) -> Result<Vec<String>, ModuleError> {
        let module = self
            .library_module(&spec.module)
            .ok_or_else(|| ModuleError::UnknownModule(spec.module.clone()))?;

        let selected: Vec<(String, ModuleItem)> = match &spec.item {
            None => module.into_iter().collect(),
            Some(pattern) if is_pattern(pattern) => module
                .into_iter()
                .filter(|(name, _)| matches_pattern(pattern, name))
                .collect(),
            Some(item) => {
                let value = module.get(item).cloned().ok_or_else(|| ModuleError::UnknownItem {
                    module: spec.module.clone(),
                    item: item.clone(),
                })?;
                vec![(item.clone(), value)]
            }
        };

        // An alias only makes sense for a single item
        let alias = spec.alias.as_ref().filter(|_| selected.len() == 1);
        let renamed = alias.is_some();
        let plan: Vec<(String, String, ModuleItem)> = selected
            .into_iter()
            .map(|(original, item)| {
                let local = alias.cloned().unwrap_or_else(|| original.clone());
                (local, original, item)
            })
            .collect();

        if !renamed {
            for (local, original, item) in &plan {
                self.check_collision(local, &spec.module, original, item.kind())?;
            }
        }

        let mut bound = Vec::with_capacity(plan.len());
        for (local, original, item) in plan {
            let kind = item.kind();
            self.bind_item(&local, item);
            debug!(target: "tether::system", "imported {}::{} as {}", spec.module, original, local);
            locked(&self.imported).insert(
                local.clone(),
                Provenance {
                    module: spec.module.clone(),
                    original,
                    kind,
                },
            );
            bound.push(local);
        }
        Ok(bound)
    }

    fn check_collision(
        &self,
        local: &str,
        module: &str,
        original: &str,
        kind: ItemKind,
    ) -> Result<(), ModuleError> {
        let taken = match kind {
            ItemKind::Command => read(&self.commands).is_local(local),
            ItemKind::Macro => read(&self.macros).is_local(local),
            ItemKind::Object => read(&self.objects).is_local(local),
        };
        if !taken {
            return Ok(());
        }
        // Re-importing the very same item is not a collision
        let same = locked(&self.imported)
            .get(local)
            .map(|p| p.module == module && p.original == original && p.kind == kind)
            .unwrap_or(false);
        if same {
            return Ok(());
        }
        Err(ModuleError::Collision {
            name: local.to_string(),
            kind,
            module: module.to_string(),
            item: original.to_string(),
        })
    }

    fn bind_item(&self, local: &str, item: ModuleItem) {
        match item {
            ModuleItem::Command(h) => write(&self.commands).set(local, h),
            ModuleItem::Macro(m) => write(&self.macros).set(local, m),
            ModuleItem::Object(v) => write(&self.objects).set(local, v),
        }
    }

    // === EXPORT ===

    fn export_module(&self) -> Result<String, ModuleError> {
        self.default_name().ok_or(ModuleError::NoDefaultModule)
    }

    /// Export a local name: a macro or command, or for `#name` an object.
    /// `variable` resolves `#name` variables not registered as objects.
    pub fn export_name(
        &self,
        name: &str,
        alias: Option<&str>,
        variable: impl Fn(&str) -> Option<Value>,
    ) -> Result<(), ModuleError> {
        let module = self.export_module()?;
        let item = if name.starts_with('#') {
            self.get_object(name)
                .or_else(|| variable(name))
                .map(ModuleItem::Object)
        } else {
            self.get_macro(name)
                .map(ModuleItem::Macro)
                .or_else(|| self.get_command(name).map(ModuleItem::Command))
        };
        let item = item.ok_or_else(|| ModuleError::UnknownExport(name.to_string()))?;
        let exported = alias.unwrap_or(name).to_string();
        debug!(target: "tether::system", "export {}::{}", module, exported);
        locked(&self.exports)
            .entry(module)
            .or_default()
            .insert(exported, item);
        Ok(())
    }

    /// Re-export straight from the restricted tier: `module::item`,
    /// `module::pattern` or `module` (everything)
    pub fn export_spec(&self, spec: &ImportSpec) -> Result<usize, ModuleError> {
        let target = self.export_module()?;
        let source = self
            .library_module(&spec.module)
            .ok_or_else(|| ModuleError::UnknownModule(spec.module.clone()))?;
        let picked: Vec<(String, ModuleItem)> = match &spec.item {
            None => source.into_iter().collect(),
            Some(pattern) if is_pattern(pattern) => source
                .into_iter()
                .filter(|(name, _)| matches_pattern(pattern, name))
                .collect(),
            Some(item) => {
                let value = source.get(item).cloned().ok_or_else(|| ModuleError::UnknownItem {
                    module: spec.module.clone(),
                    item: item.clone(),
                })?;
                vec![(spec.alias.clone().unwrap_or_else(|| item.clone()), value)]
            }
        };
        let count = picked.len();
        locked(&self.exports)
            .entry(target)
            .or_default()
            .extend(picked);
        Ok(count)
    }

    /// Move accumulated exports into `target`'s library tiers. The target's
    /// inherited library is copied on write, so parents are never touched.
    pub fn merge_exports_into(&self, target: &ModuleEnvironment) {
        let exports = std::mem::take(&mut *locked(&self.exports));
        if exports.is_empty() {
            return;
        }
        let mut inherited = write(&target.library_inherited);
        let mut restricted = write(&target.library_restricted);
        for (module, items) in exports {
            debug!(target: "tether::system", "merging {} export(s) into module {}", items.len(), module);
            Arc::make_mut(&mut inherited)
                .entry(module.clone())
                .or_default()
                .extend(items.iter().map(|(k, v)| (k.clone(), v.clone())));
            restricted
                .to_mut()
                .entry(module)
                .or_default()
                .extend(items);
        }
    }

    pub fn pending_exports(&self) -> Vec<String> {
        locked(&self.exports)
            .iter()
            .flat_map(|(m, items)| items.keys().map(move |i| format!("{}::{}", m, i)))
            .collect()
    }

    // === REMOVE ===

    /// Drop every local binding; lookups fall through to the inherited tier
    pub fn remove_all(&self) {
        write(&self.commands).reset();
        write(&self.macros).reset();
        write(&self.objects).reset();
        locked(&self.imported).clear();
    }

    /// Tombstone every name imported from `module`
    pub fn remove_module(&self, module: &str) -> Result<usize, ModuleError> {
        let names: Vec<(String, ItemKind)> = locked(&self.imported)
            .iter()
            .filter(|(_, p)| p.module == module)
            .map(|(name, p)| (name.clone(), p.kind))
            .collect();
        if names.is_empty() {
            if self.library_module(module).is_none() {
                return Err(ModuleError::UnknownModule(module.to_string()));
            }
            return Err(ModuleError::NothingToRemove(module.to_string()));
        }
        for (name, kind) in &names {
            self.tombstone(name, *kind);
        }
        Ok(names.len())
    }

    /// Tombstone the local names imported from `module` under the given
    /// original item names
    pub fn remove_items(&self, module: &str, items: &[String]) -> Result<(), ModuleError> {
        for item in items {
            let found: Vec<(String, ItemKind)> = locked(&self.imported)
                .iter()
                .filter(|(_, p)| p.module == module && &p.original == item)
                .map(|(name, p)| (name.clone(), p.kind))
                .collect();
            if found.is_empty() {
                return Err(ModuleError::UnknownItem {
                    module: module.to_string(),
                    item: item.clone(),
                });
            }
            for (name, kind) in found {
                self.tombstone(&name, kind);
            }
        }
        Ok(())
    }

    /// Tombstone names visible in this scope, whatever their origin
    pub fn remove_mine(&self, names: &[String]) -> Result<(), ModuleError> {
        for name in names {
            let kind = if self.get_macro(name).is_some() {
                ItemKind::Macro
            } else if self.get_command(name).is_some() {
                ItemKind::Command
            } else if self.get_object(name).is_some() {
                ItemKind::Object
            } else {
                return Err(ModuleError::NothingToRemove(name.clone()));
            };
            self.tombstone(name, kind);
        }
        Ok(())
    }

    fn tombstone(&self, name: &str, kind: ItemKind) {
        match kind {
            ItemKind::Command => write(&self.commands).remove(name),
            ItemKind::Macro => write(&self.macros).remove(name),
            ItemKind::Object => write(&self.objects).remove(name),
        }
        locked(&self.imported).remove(name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::{CommandResult, Context};

    fn handler(status: bool) -> Handler {
        Arc::new(move |_ctx: &mut Context<'_>| CommandResult::Status(status))
    }

    fn root_with_math() -> ModuleEnvironment {
        let env = ModuleEnvironment::new();
        env.install_command("echo", handler(true));
        env.install_module_item("math", "add", ModuleItem::Command(handler(true)));
        env.install_module_item("math", "sub", ModuleItem::Command(handler(true)));
        env
    }

    #[test]
    fn test_tier_copy_on_write() {
        let shared = Arc::new(vec![1, 2]);
        let mut tier = Tier::Shared(Arc::clone(&shared));
        assert!(!tier.is_owned());
        tier.to_mut().push(3);
        assert!(tier.is_owned());
        assert_eq!(tier.get(), &vec![1, 2, 3]);
        assert_eq!(*shared, vec![1, 2]);
    }

    #[test]
    fn test_registry_three_states() {
        let mut inherited = BTreeMap::new();
        inherited.insert("a".to_string(), 1);
        let mut reg = Registry::new(Arc::new(inherited));
        assert_eq!(reg.binding("a"), Binding::Inherited);
        assert_eq!(reg.get("a"), Some(1));

        reg.set("a", 2);
        assert_eq!(reg.binding("a"), Binding::Overridden(2));
        assert_eq!(reg.get("a"), Some(2));

        reg.remove("a");
        assert_eq!(reg.binding("a"), Binding::Removed);
        assert_eq!(reg.get("a"), None);

        reg.reset();
        assert_eq!(reg.get("a"), Some(1));
    }

    #[test]
    fn test_child_mutation_isolated() {
        let root = root_with_math();
        let child = ModuleEnvironment::new_child(&root);
        assert!(!child.commands_copied());
        child.register_command("echo", handler(false));
        child.register_command("extra", handler(true));
        assert!(child.commands_copied());
        assert!(root.get_command("extra").is_none());
        assert!(matches!(root.command_binding("echo"), Binding::Inherited));
    }

    #[test]
    fn test_child_sees_parent_locals() {
        let root = root_with_math();
        root.register_command("mine", handler(true));
        let child = ModuleEnvironment::new_child(&root);
        assert!(child.get_command("mine").is_some());
        // Locals of the parent are the child's inherited tier
        assert!(matches!(child.command_binding("mine"), Binding::Inherited));
    }

    #[test]
    fn test_import_and_collision() {
        let env = root_with_math();
        env.register_command("add", handler(false));
        let err = env.import(&ImportSpec::parse("math::add", None)).unwrap_err();
        assert!(matches!(err, ModuleError::Collision { .. }));
        assert!(err.to_string().contains("IMPORT new_name: \"math::add\""));

        let bound = env
            .import(&ImportSpec::parse("math::add", Some("plus".into())))
            .unwrap();
        assert_eq!(bound, vec!["plus".to_string()]);
        assert_eq!(env.provenance("plus").unwrap().original, "add");
    }

    #[test]
    fn test_reimport_same_item_is_not_collision() {
        let env = root_with_math();
        env.import(&ImportSpec::parse("math", None)).unwrap();
        env.import(&ImportSpec::parse("math", None)).unwrap();
        assert!(env.get_command("sub").is_some());
    }

    #[test]
    fn test_restrict_then_allow() {
        let env = root_with_math();
        env.restrict("*").unwrap();
        assert!(matches!(
            env.import(&ImportSpec::parse("math", None)),
            Err(ModuleError::UnknownModule(_))
        ));
        env.allow("math").unwrap();
        let bound = env.import(&ImportSpec::parse("math", None)).unwrap();
        assert_eq!(bound.len(), 2);
        assert!(env.get_command("add").is_some());
    }

    #[test]
    fn test_restrict_does_not_touch_parent() {
        let root = root_with_math();
        let child = ModuleEnvironment::new_child(&root);
        child.restrict("math").unwrap();
        assert!(child.library_module("math").is_none());
        assert!(root.library_module("math").is_some());
    }

    #[test]
    fn test_export_requires_module() {
        let env = root_with_math();
        assert_eq!(
            env.export_name("echo", None, |_| None),
            Err(ModuleError::NoDefaultModule)
        );
        env.set_default_name("tools");
        env.export_name("echo", None, |_| None).unwrap();
        assert_eq!(env.pending_exports(), vec!["tools::echo".to_string()]);
    }

    #[test]
    fn test_export_object_from_variable() {
        let env = root_with_math();
        env.set_default_name("cfg");
        env.export_name("#limit", None, |name| {
            (name == "#limit").then_some(Value::Int(5))
        })
        .unwrap();
        env.merge_exports_into(&env);
        let module = env.library_module("cfg").unwrap();
        assert!(matches!(module.get("#limit"), Some(ModuleItem::Object(Value::Int(5)))));
    }

    #[test]
    fn test_remove_tombstones_and_remove_all() {
        let root = root_with_math();
        let child = ModuleEnvironment::new_child(&root);
        child.import(&ImportSpec::parse("math", None)).unwrap();
        child.remove_items("math", &["add".to_string()]).unwrap();
        assert!(child.get_command("add").is_none());
        assert!(child.get_command("sub").is_some());

        child.remove_mine(&["echo".to_string()]).unwrap();
        assert!(child.get_command("echo").is_none());
        assert!(root.get_command("echo").is_some());

        root.import(&ImportSpec::parse("math::sub", None)).unwrap();
        child.remove_all();
        assert!(child.get_command("echo").is_some());
        // The child's snapshot predates the parent's import
        assert!(child.get_command("sub").is_none());
        assert!(root.get_command("sub").is_some());
        assert!(root.get_command("echo").is_some());
        assert!(root.provenance("sub").is_some());
    }

    #[test]
    fn test_remove_unknown_errors() {
        let env = root_with_math();
        assert!(matches!(
            env.remove_module("nope"),
            Err(ModuleError::UnknownModule(_))
        ));
        assert!(matches!(
            env.remove_items("math", &["add".to_string()]),
            Err(ModuleError::UnknownItem { .. })
        ));
        assert!(matches!(
            env.remove_mine(&["ghost".to_string()]),
            Err(ModuleError::NothingToRemove(_))
        ));
    }

    #[test]
    fn test_wildcard_import() {
        let env = root_with_math();
        let bound = env.import(&ImportSpec::parse("math::s*", None)).unwrap();
        assert_eq!(bound, vec!["sub".to_string()]);
    }
}
