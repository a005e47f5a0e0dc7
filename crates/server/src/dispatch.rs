//! Static RPC routing table, built as managers register.

use std::collections::HashMap;

use crate::error::DispatchError;
use crate::manager::{ManagerDescriptor, RpcMethod};

/// A resolved `(manager, method)` pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Route {
    /// Index into the session's manager list
    pub slot: usize,
    pub method: &'static RpcMethod,
}

#[derive(Debug, Default)]
pub(crate) struct DispatchTable {
    managers: HashMap<String, (usize, &'static ManagerDescriptor)>,
}

impl DispatchTable {
    pub(crate) fn contains(&self, manager: &str) -> bool {
        self.managers.contains_key(manager)
    }

    pub(crate) fn insert(&mut self, manager: &str, slot: usize, descriptor: &'static ManagerDescriptor) {
        self.managers.insert(manager.to_string(), (slot, descriptor));
    }

    pub(crate) fn descriptor(&self, manager: &str) -> Option<&'static ManagerDescriptor> {
        self.managers.get(manager).map(|(_, descriptor)| *descriptor)
    }

    pub(crate) fn resolve(&self, manager: &str, method: &str) -> Result<Route, DispatchError> {
        let (slot, descriptor) = self
            .managers
            .get(manager)
            .ok_or_else(|| DispatchError::UnknownManager(manager.to_string()))?;
        let method = descriptor
            .method(method)
            .ok_or_else(|| DispatchError::MethodNotExposed {
                manager: manager.to_string(),
                method: method.to_string(),
            })?;
        Ok(Route {
            slot: *slot,
            method,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    static NOTES: ManagerDescriptor = ManagerDescriptor::new(
        &["notes"],
        &[RpcMethod::exclusive("create"), RpcMethod::shared("count")],
    );

    #[test]
    fn resolves_exposed_methods() {
        let mut table = DispatchTable::default();
        table.insert("notes", 3, &NOTES);

        let route = table.resolve("notes", "create").expect("route");
        assert_eq!(route.slot, 3);
        assert!(route.method.exclusive);
        assert!(!table.resolve("notes", "count").expect("route").method.exclusive);
    }

    #[test]
    fn unknown_manager_and_method_are_typed_errors() {
        let mut table = DispatchTable::default();
        table.insert("notes", 0, &NOTES);

        assert_eq!(
            table.resolve("files", "create"),
            Err(DispatchError::UnknownManager("files".into()))
        );
        assert_eq!(
            table.resolve("notes", "drop_all"),
            Err(DispatchError::MethodNotExposed {
                manager: "notes".into(),
                method: "drop_all".into(),
            })
        );
    }
}
