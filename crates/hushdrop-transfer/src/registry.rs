use hushdrop_types::{Endpoint, EndpointId};

/// Peers seen through discovery, in the order they were first found.
///
/// A display name maps to at most one live endpoint: the first one seen wins
/// and later endpoints advertising the same name are ignored.
#[derive(Debug, Default)]
pub struct EndpointRegistry {
    entries: Vec<Endpoint>,
}

impl EndpointRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns false when the id or the name is already registered.
    pub fn on_endpoint_found(&mut self, id: EndpointId, display_name: String) -> bool {
        if self
            .entries
            .iter()
            .any(|e| e.id == id || e.display_name == display_name)
        {
            return false;
        }
        self.entries.push(Endpoint { id, display_name });
        true
    }

    /// Removes the entry for `id`. Lost events for ignored duplicates are no-ops.
    pub fn on_endpoint_lost(&mut self, id: &EndpointId) -> Option<Endpoint> {
        let index = self.entries.iter().position(|e| &e.id == id)?;
        Some(self.entries.remove(index))
    }

    /// Display names in insertion order.
    pub fn list(&self) -> Vec<String> {
        self.entries.iter().map(|e| e.display_name.clone()).collect()
    }

    pub fn lookup(&self, display_name: &str) -> Option<&Endpoint> {
        self.entries.iter().find(|e| e.display_name == display_name)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
