/// Variable object cache
///
/// GDB varobjs are created per (frame, thread, stack depth) scope. The depth
/// is part of the key so that recursive calls of the same function do not
/// share objects.

use regex::Regex;
use std::collections::HashMap;
use std::sync::OnceLock;

use crate::backend::GdbBackend;
use crate::commands::{VarChild, VarCreateResult};
use crate::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VarScopeKey {
    pub frame_id: u32,
    pub thread_id: u32,
    pub depth: u32,
}

impl VarScopeKey {
    pub fn new(frame_id: u32, thread_id: u32, depth: u32) -> Self {
        Self {
            frame_id,
            thread_id,
            depth,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VarScopeKind {
    Local,
    Registers,
}

#[derive(Debug, Clone, PartialEq)]
pub struct VarObject {
    /// GDB-assigned name, e.g. `var3` or `var3.field`
    pub varname: String,
    /// Expression as the client sees it
    pub expression: String,
    pub numchild: u32,
    pub value: String,
    pub var_type: String,
    pub is_var: bool,
    pub is_child: bool,
    pub kind: VarScopeKind,
}

/// Outcome of refreshing a varobj
#[derive(Debug, Clone, PartialEq)]
pub enum VarUpdate {
    Current(VarObject),
    /// Deleted because it left scope; create it again
    OutOfScope,
}

fn is_descendant(varname: &str, ancestor: &str) -> bool {
    varname
        .strip_prefix(ancestor)
        .map_or(false, |rest| rest.starts_with('.'))
}

#[derive(Debug, Default)]
pub struct VarObjectManager {
    scopes: HashMap<VarScopeKey, Vec<VarObject>>,
}

impl VarObjectManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &VarScopeKey, expression: &str, kind: VarScopeKind) -> Option<&VarObject> {
        self.scopes
            .get(key)?
            .iter()
            .find(|v| v.expression == expression && v.kind == kind)
    }

    pub fn get_by_name(&self, key: &VarScopeKey, varname: &str) -> Option<&VarObject> {
        self.scopes.get(key)?.iter().find(|v| v.varname == varname)
    }

    /// Child of `parent` listed under `expression`
    pub fn get_child(&self, key: &VarScopeKey, parent: &str, expression: &str) -> Option<&VarObject> {
        self.scopes
            .get(key)?
            .iter()
            .find(|v| v.is_child && v.expression == expression && is_descendant(&v.varname, parent))
    }

    pub fn add(
        &mut self,
        key: VarScopeKey,
        expression: &str,
        is_var: bool,
        is_child: bool,
        created: &VarCreateResult,
        kind: VarScopeKind,
    ) -> VarObject {
        let varobj = VarObject {
            varname: created.name.clone(),
            expression: expression.to_string(),
            numchild: created.numchild,
            value: created.value.clone(),
            var_type: created.var_type.clone(),
            is_var,
            is_child,
            kind,
        };
        self.scopes.entry(key).or_default().push(varobj.clone());
        varobj
    }

    /// Record a child returned by `-var-list-children`. A child that is
    /// already cached takes the freshly listed value and type.
    pub fn add_child(&mut self, key: VarScopeKey, child: &VarChild, kind: VarScopeKind) -> VarObject {
        let created = VarCreateResult {
            name: child.name.clone(),
            numchild: child.numchild,
            value: child.value.clone().unwrap_or_default(),
            var_type: child.var_type.clone().unwrap_or_default(),
        };
        let existing = self
            .scopes
            .get_mut(&key)
            .and_then(|objs| objs.iter_mut().find(|v| v.varname == child.name));
        match existing {
            Some(varobj) => {
                varobj.numchild = created.numchild;
                varobj.value = created.value;
                varobj.var_type = created.var_type;
                varobj.clone()
            }
            None => self.add(key, &child.exp, false, true, &created, kind),
        }
    }

    /// Refresh a varobj with `-var-update`
    pub async fn update(&mut self, backend: &GdbBackend, key: VarScopeKey, varname: &str) -> Result<VarUpdate> {
        let changes = backend.var_update(varname).await?;
        let Some(change) = changes.first() else {
            return Ok(self
                .get_by_name(&key, varname)
                .cloned()
                .map_or(VarUpdate::OutOfScope, VarUpdate::Current));
        };

        if change.in_scope != "true" {
            log::debug!("Varobj {} is {} scope, deleting", varname, change.in_scope);
            self.remove(backend, key, varname).await?;
            return Ok(VarUpdate::OutOfScope);
        }

        let Some(varobj) = self
            .scopes
            .get_mut(&key)
            .and_then(|objs| objs.iter_mut().find(|v| v.varname == varname))
        else {
            return Ok(VarUpdate::OutOfScope);
        };
        // A changed child must not overwrite its parent's value
        if change.name == varobj.varname {
            if let Some(value) = &change.value {
                varobj.value = value.clone();
            }
        }
        Ok(VarUpdate::Current(varobj.clone()))
    }

    /// Delete a varobj and its children, in GDB and in the cache
    pub async fn remove(&mut self, backend: &GdbBackend, key: VarScopeKey, varname: &str) -> Result<()> {
        let Some(objs) = self.scopes.get_mut(&key) else {
            return Ok(());
        };
        if !objs.iter().any(|v| v.varname == varname) {
            return Ok(());
        }
        objs.retain(|v| v.varname != varname && !is_descendant(&v.varname, varname));
        // Deleting the parent in GDB takes its children with it
        backend.var_delete(varname).await
    }

    /// Drop every scope of this frame and thread recorded at another depth
    pub async fn invalidate_stale(
        &mut self,
        backend: &GdbBackend,
        frame_id: u32,
        thread_id: u32,
        depth: u32,
    ) -> Result<()> {
        let stale: Vec<VarScopeKey> = self
            .scopes
            .keys()
            .filter(|k| k.frame_id == frame_id && k.thread_id == thread_id && k.depth != depth)
            .copied()
            .collect();

        for key in stale {
            if let Some(objs) = self.scopes.remove(&key) {
                for varobj in objs.iter().filter(|v| !v.is_child) {
                    if let Err(e) = backend.var_delete(&varobj.varname).await {
                        log::warn!("Failed to delete stale varobj {}: {}", varobj.varname, e);
                    }
                }
            }
        }
        Ok(())
    }

    /// Forget all scopes; GDB drops varobjs itself when the inferior exits
    pub fn clear(&mut self) {
        self.scopes.clear();
    }

    /// Cached varobj for `expression`, refreshed or created as needed
    pub async fn get_or_create(
        &mut self,
        backend: &GdbBackend,
        key: VarScopeKey,
        frame_level: u32,
        expression: &str,
        kind: VarScopeKind,
    ) -> Result<VarObject> {
        if let Some(existing) = self.get(&key, expression, kind).map(|v| v.varname.clone()) {
            if let VarUpdate::Current(varobj) = self.update(backend, key, &existing).await? {
                return Ok(varobj);
            }
        }
        let created = backend.var_create(key.thread_id, frame_level, expression).await?;
        Ok(self.add(key, expression, true, false, &created, kind))
    }
}

/// Fixed-size array types such as `int [4]`
pub fn is_array_type(var_type: &str) -> bool {
    static ARRAY: OnceLock<Regex> = OnceLock::new();
    ARRAY
        .get_or_init(|| Regex::new(r"\[\d+\]").expect("valid regex"))
        .is_match(var_type)
}

fn is_access_specifier(child: &VarChild) -> bool {
    matches!(child.exp.as_str(), "public" | "protected" | "private")
        && child.var_type.as_deref().unwrap_or_default().is_empty()
        && child.value.as_deref().unwrap_or_default().is_empty()
}

/// List children, replacing C++ access-specifier pseudo-children with their own children
pub async fn list_children(backend: &GdbBackend, varname: &str) -> Result<Vec<VarChild>> {
    let mut children = Vec::new();
    for child in backend.var_list_children(varname).await? {
        if is_access_specifier(&child) {
            children.extend(backend.var_list_children(&child.name).await?);
        } else {
            children.push(child);
        }
    }
    Ok(children)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn created(name: &str, value: &str) -> VarCreateResult {
        VarCreateResult {
            name: name.to_string(),
            numchild: 0,
            value: value.to_string(),
            var_type: "int".to_string(),
        }
    }

    #[test]
    fn test_lookup_matches_expression_and_kind() {
        let mut manager = VarObjectManager::new();
        let key = VarScopeKey::new(0, 1, 3);
        manager.add(key, "x", true, false, &created("var1", "1"), VarScopeKind::Local);
        manager.add(key, "$pc", true, false, &created("var2", "0x1"), VarScopeKind::Registers);

        assert_eq!(manager.get(&key, "x", VarScopeKind::Local).unwrap().varname, "var1");
        assert!(manager.get(&key, "x", VarScopeKind::Registers).is_none());
        assert_eq!(manager.get_by_name(&key, "var2").unwrap().expression, "$pc");
    }

    #[test]
    fn test_depth_separates_scopes() {
        let mut manager = VarObjectManager::new();
        manager.add(VarScopeKey::new(0, 1, 3), "n", true, false, &created("var1", "3"), VarScopeKind::Local);
        manager.add(VarScopeKey::new(0, 1, 4), "n", true, false, &created("var2", "2"), VarScopeKind::Local);

        assert_eq!(
            manager.get(&VarScopeKey::new(0, 1, 4), "n", VarScopeKind::Local).unwrap().value,
            "2"
        );
    }

    #[test]
    fn test_descendant_names() {
        assert!(is_descendant("var1.a", "var1"));
        assert!(is_descendant("var1.a.b", "var1"));
        assert!(!is_descendant("var10", "var1"));
        assert!(!is_descendant("var1", "var1"));
    }

    #[test]
    fn test_child_lookup_is_scoped_to_parent() {
        let mut manager = VarObjectManager::new();
        let key = VarScopeKey::new(0, 1, 1);
        let child = |name: &str| VarChild {
            name: name.to_string(),
            exp: "x".to_string(),
            numchild: 0,
            value: Some("1".to_string()),
            var_type: Some("int".to_string()),
        };
        manager.add_child(key, &child("var1.x"), VarScopeKind::Local);
        manager.add_child(key, &child("var2.x"), VarScopeKind::Local);

        assert_eq!(manager.get_child(&key, "var2", "x").unwrap().varname, "var2.x");
        assert!(manager.get_child(&key, "var3", "x").is_none());
    }

    #[test]
    fn test_relisted_child_takes_new_value() {
        let mut manager = VarObjectManager::new();
        let key = VarScopeKey::new(0, 1, 1);
        let listed = |value: &str| VarChild {
            name: "var1.x".to_string(),
            exp: "x".to_string(),
            numchild: 0,
            value: Some(value.to_string()),
            var_type: Some("int".to_string()),
        };
        manager.add_child(key, &listed("1"), VarScopeKind::Local);

        let again = manager.add_child(key, &listed("2"), VarScopeKind::Local);
        assert_eq!(again.value, "2");
        assert_eq!(manager.get_by_name(&key, "var1.x").unwrap().value, "2");
        assert_eq!(manager.scopes[&key].len(), 1);
    }

    #[test]
    fn test_array_types() {
        assert!(is_array_type("int [4]"));
        assert!(is_array_type("char [16][2]"));
        assert!(!is_array_type("int *"));
    }

    #[test]
    fn test_access_specifier_detection() {
        let child = VarChild {
            name: "var1.public".to_string(),
            exp: "public".to_string(),
            numchild: 2,
            value: None,
            var_type: None,
        };
        assert!(is_access_specifier(&child));
        let field = VarChild {
            exp: "public".to_string(),
            var_type: Some("int".to_string()),
            ..child
        };
        assert!(!is_access_specifier(&field));
    }
}
