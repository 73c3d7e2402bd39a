//! Object-database interface
//!
//! The VM reads and writes the world through this trait and treats it as
//! opaque: inheritance search order, permission bits, and storage all live on
//! the other side. Every failure surfaces as a language error code so verbs
//! can catch it. Returned data are plain values; nothing handed out remains
//! valid across a mutating call, so callers re-resolve rather than cache.

use crate::var::{ErrCode, ObjId, Value};
use hearth_bytecode::Program;
use std::sync::Arc;

/// Resolution result for a verb call
#[derive(Clone)]
pub struct VerbInfo {
    /// The compiled body
    pub program: Arc<Program>,
    /// Object the verb is defined on (after inheritance search)
    pub definer: ObjId,
    /// Owning principal; frames execute with this identity
    pub owner: ObjId,
    /// Space-separated verb names
    pub names: String,
    /// Whether frames run with catchable-error semantics
    pub debug: bool,
}

/// The persistent object database, as the VM sees it
pub trait WorldState {
    /// Whether an object id names a live object
    fn valid(&self, obj: ObjId) -> bool;

    /// Read a property, honoring inheritance and permissions
    fn retrieve_property(
        &mut self,
        perms: ObjId,
        obj: ObjId,
        name: &str,
    ) -> Result<Value, ErrCode>;

    /// Write a property, honoring permissions
    fn update_property(
        &mut self,
        perms: ObjId,
        obj: ObjId,
        name: &str,
        value: &Value,
    ) -> Result<(), ErrCode>;

    /// Resolve a verb by name on an object, honoring inheritance
    fn find_verb(&mut self, perms: ObjId, obj: ObjId, name: &str) -> Result<VerbInfo, ErrCode>;

    /// Parent in the inheritance hierarchy
    fn parent(&self, obj: ObjId) -> Result<ObjId, ErrCode>;

    /// Direct children in the inheritance hierarchy
    fn children(&self, obj: ObjId) -> Result<Vec<ObjId>, ErrCode>;

    /// Containing object
    fn location(&self, obj: ObjId) -> Result<ObjId, ErrCode>;

    /// Contained objects
    fn contents(&self, obj: ObjId) -> Result<Vec<ObjId>, ErrCode>;
}
