//! Human-friendly name resolution with ID-first, name-fallback semantics.

use dbcask_registry::InstanceRecord;

use crate::pipeline::Engine;

/// The result of `Engine::resolve`.
#[derive(Debug, Clone, Default)]
pub struct ResolveResult {
    pub entry: Option<InstanceRecord>,
    pub found: bool,
    /// `true` when the match came from a name lookup rather than a direct
    /// ID lookup.
    pub resolved_by_name: bool,
}

impl Engine {
    /// Resolve `id_or_name` to an instance.
    ///
    /// Blank input never performs a lookup. Input matching the 32-hex
    /// instance-ID grammar is tried as an ID first; only on a miss does it
    /// fall through to a name lookup with the same trimmed string. Input
    /// that never matched the grammar goes straight to the name lookup.
    pub async fn resolve(&self, id_or_name: &str) -> crate::Result<ResolveResult> {
        let trimmed = id_or_name.trim();
        if trimmed.is_empty() {
            return Ok(ResolveResult { entry: None, found: false, resolved_by_name: false });
        }

        if dbcask_ids::is_instance_id(trimmed) {
            if let Some(entry) = self.registry().get_instance(trimmed)? {
                return Ok(ResolveResult { entry: Some(entry.instance), found: true, resolved_by_name: false });
            }
        }

        self.resolve_by_name(trimmed)
    }

    fn resolve_by_name(&self, name: &str) -> crate::Result<ResolveResult> {
        let Some(name_entry) = self.registry().get_name(name)? else {
            return Ok(ResolveResult { entry: None, found: false, resolved_by_name: false });
        };

        let Some(instance_id) = name_entry.name.instance_id else {
            return Ok(ResolveResult { entry: None, found: false, resolved_by_name: false });
        };

        match self.registry().get_instance(&instance_id)? {
            Some(entry) => Ok(ResolveResult { entry: Some(entry.instance), found: true, resolved_by_name: true }),
            None => Ok(ResolveResult { entry: None, found: false, resolved_by_name: false }),
        }
    }
}
