//! Display names for host-issued subject ids.
//!
//! Name lookup is best effort: a missing name never fails an event, so both
//! operations return an empty string instead of an error.

use std::hash::Hash;
use std::sync::Arc;

use dashmap::DashMap;

use clrscope_common::{FunctionId, ModuleId, TypeToken};

pub trait NameResolver: Send + Sync {
    /// Type name for a type-definition token of `module`, or `""`
    fn type_name(&self, module: ModuleId, token: TypeToken) -> String;

    /// `"Type::Method"` for `function`, or `""`
    fn function_name(&self, function: FunctionId) -> String;

    /// `function` was unloaded; its id may be reused
    fn forget_function(&self, _function: FunctionId) {}

    /// `module` was unloaded along with every type it defined
    fn forget_module(&self, _module: ModuleId) {}
}

impl<T: NameResolver + ?Sized> NameResolver for Arc<T> {
    fn type_name(&self, module: ModuleId, token: TypeToken) -> String {
        (**self).type_name(module, token)
    }

    fn function_name(&self, function: FunctionId) -> String {
        (**self).function_name(function)
    }

    fn forget_function(&self, function: FunctionId) {
        (**self).forget_function(function);
    }

    fn forget_module(&self, module: ModuleId) {
        (**self).forget_module(module);
    }
}

/// Resolves nothing
#[derive(Debug, Default, Clone, Copy)]
pub struct NullResolver;

impl NameResolver for NullResolver {
    fn type_name(&self, _module: ModuleId, _token: TypeToken) -> String {
        String::new()
    }

    fn function_name(&self, _function: FunctionId) -> String {
        String::new()
    }
}

/// Memoizes successful lookups of an inner resolver.
///
/// Empty results are not cached: a type whose metadata is not readable yet
/// may resolve later. Unload notifications evict what the unloaded function
/// or module contributed.
pub struct CachingResolver<R> {
    inner: R,
    types: DashMap<(ModuleId, TypeToken), String>,
    functions: DashMap<FunctionId, String>,
}

impl<R: NameResolver> CachingResolver<R> {
    pub fn new(inner: R) -> Self {
        Self { inner, types: DashMap::new(), functions: DashMap::new() }
    }

    #[must_use]
    pub fn cached(&self) -> usize {
        self.types.len() + self.functions.len()
    }
}

fn lookup<K: Eq + Hash>(
    cache: &DashMap<K, String>,
    key: K,
    resolve: impl FnOnce() -> String,
) -> String {
    if let Some(name) = cache.get(&key) {
        return name.value().clone();
    }
    let name = resolve();
    if !name.is_empty() {
        cache.insert(key, name.clone());
    }
    name
}

impl<R: NameResolver> NameResolver for CachingResolver<R> {
    fn type_name(&self, module: ModuleId, token: TypeToken) -> String {
        lookup(&self.types, (module, token), || self.inner.type_name(module, token))
    }

    fn function_name(&self, function: FunctionId) -> String {
        lookup(&self.functions, function, || self.inner.function_name(function))
    }

    fn forget_function(&self, function: FunctionId) {
        self.functions.remove(&function);
        self.inner.forget_function(function);
    }

    fn forget_module(&self, module: ModuleId) {
        self.types.retain(|(owner, _), _| *owner != module);
        self.inner.forget_module(module);
    }
}
