use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use super::handler::RemoteFunction;

type FunctionMap = HashMap<String, Arc<dyn RemoteFunction>>;

/// Name → function map shared by the receive loop and `register*` callers.
///
/// Lookups are exact and case-sensitive; a dotted name such as
/// `"examples.getStateName"` is one opaque key. Registering a name that is
/// already present replaces the earlier function for all later lookups.
#[derive(Default)]
pub(super) struct FunctionRegistry {
    functions: RwLock<FunctionMap>,
}

// A panic while holding the lock can only happen inside HashMap insert/get,
// which leaves the map consistent.
fn read_ignore_poison(lock: &RwLock<FunctionMap>) -> RwLockReadGuard<'_, FunctionMap> {
    lock.read().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn write_ignore_poison(lock: &RwLock<FunctionMap>) -> RwLockWriteGuard<'_, FunctionMap> {
    lock.write().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl FunctionRegistry {
    /// Returns `true` if an earlier function was replaced.
    pub(super) fn insert(&self, name: &str, func: Arc<dyn RemoteFunction>) -> bool {
        write_ignore_poison(&self.functions)
            .insert(name.to_string(), func)
            .is_some()
    }

    pub(super) fn get(&self, name: &str) -> Option<Arc<dyn RemoteFunction>> {
        read_ignore_poison(&self.functions).get(name).cloned()
    }

    pub(super) fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = read_ignore_poison(&self.functions).keys().cloned().collect();
        names.sort();
        names
    }
}
