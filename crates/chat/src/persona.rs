use std::sync::Arc;

use vellum_cache::{Cache, get_json, set_json};

use super::message::{Persona, Role};

/// Cache key holding the persisted persona list.
pub const PERSONAS_KEY: &str = "personas";

/// Identifier of the built-in default persona.
pub const DEFAULT_PERSONA_ID: &str = "assistant";

/// Returns the built-in default persona. It always exists and is restored if
/// removed, so a conversation without an explicit persona still sends.
pub fn default_persona() -> Persona {
    Persona {
        id: Some(DEFAULT_PERSONA_ID.to_string()),
        role: Role::System,
        name: Some("Assistant".to_string()),
        prompt: Some("You are an AI assistant that helps people find information.".to_string()),
    }
}

/// True for the default persona (or a persona without an id, which only the
/// default synthesis path produces). Conversations on the default persona get
/// their titles derived from content instead of the persona name.
pub fn is_default_persona(persona: &Persona) -> bool {
    persona
        .id
        .as_deref()
        .is_none_or(|id| id == DEFAULT_PERSONA_ID)
}

/// Persisted persona collection with id lookup.
///
/// The controller resolves personas by id at send time rather than trusting
/// the conversation's cached copy, so edits apply retroactively to every
/// conversation referencing the persona.
pub struct PersonaRegistry {
    cache: Arc<dyn Cache>,
    personas: Vec<Persona>,
}

impl PersonaRegistry {
    /// Loads the registry from the cache, guaranteeing the default persona
    /// is present.
    pub fn load(cache: Arc<dyn Cache>) -> Self {
        let mut personas: Vec<Persona> = get_json(cache.as_ref(), PERSONAS_KEY, Vec::new());

        if !personas
            .iter()
            .any(|persona| persona.id.as_deref() == Some(DEFAULT_PERSONA_ID))
        {
            personas.insert(0, default_persona());
        }

        Self { cache, personas }
    }

    pub fn personas(&self) -> &[Persona] {
        &self.personas
    }

    pub fn get_by_id(&self, id: &str) -> Option<&Persona> {
        self.personas
            .iter()
            .find(|persona| persona.id.as_deref() == Some(id))
    }

    /// Inserts or replaces a persona by id, assigning a fresh id when the
    /// persona has none, and persists the list. Returns the stored id.
    pub fn upsert(&mut self, mut persona: Persona) -> String {
        let id = match persona.id.clone() {
            Some(id) if !id.is_empty() => id,
            _ => uuid::Uuid::new_v4().to_string(),
        };
        persona.id = Some(id.clone());

        match self
            .personas
            .iter_mut()
            .find(|existing| existing.id.as_deref() == Some(id.as_str()))
        {
            Some(existing) => *existing = persona,
            None => self.personas.push(persona),
        }

        self.persist();
        id
    }

    /// Removes a persona by id. Removing the default persona resynthesizes
    /// it, so the registry is never empty.
    pub fn remove(&mut self, id: &str) {
        self.personas
            .retain(|persona| persona.id.as_deref() != Some(id));

        if id == DEFAULT_PERSONA_ID {
            self.personas.insert(0, default_persona());
        }

        self.persist();
    }

    fn persist(&self) {
        set_json(self.cache.as_ref(), PERSONAS_KEY, &self.personas);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vellum_cache::MemoryCache;

    #[test]
    fn load_synthesizes_default_persona() {
        let cache = Arc::new(MemoryCache::new());
        let registry = PersonaRegistry::load(cache);

        let default = registry
            .get_by_id(DEFAULT_PERSONA_ID)
            .expect("default persona present");
        assert!(default.prompt.as_deref().is_some_and(|p| !p.is_empty()));
    }

    #[test]
    fn upsert_edits_apply_on_next_lookup() {
        let cache = Arc::new(MemoryCache::new());
        let mut registry = PersonaRegistry::load(Arc::clone(&cache) as Arc<dyn Cache>);

        let id = registry.upsert(Persona {
            id: None,
            role: Role::System,
            name: Some("Historian".to_string()),
            prompt: Some("You are a historian.".to_string()),
        });

        let mut edited = registry.get_by_id(&id).cloned().expect("persona stored");
        edited.prompt = Some("You are a very terse historian.".to_string());
        registry.upsert(edited);

        assert_eq!(
            registry.get_by_id(&id).and_then(|p| p.prompt.as_deref()),
            Some("You are a very terse historian.")
        );

        // A freshly loaded registry sees the persisted edit too.
        let reloaded = PersonaRegistry::load(cache);
        assert!(reloaded.get_by_id(&id).is_some());
    }

    #[test]
    fn removing_the_default_persona_restores_it() {
        let cache = Arc::new(MemoryCache::new());
        let mut registry = PersonaRegistry::load(cache);

        registry.remove(DEFAULT_PERSONA_ID);
        assert!(registry.get_by_id(DEFAULT_PERSONA_ID).is_some());
    }

    #[test]
    fn default_persona_detection() {
        assert!(is_default_persona(&default_persona()));
        assert!(is_default_persona(&Persona {
            id: None,
            role: Role::System,
            name: None,
            prompt: None,
        }));
        assert!(!is_default_persona(&Persona {
            id: Some("custom".to_string()),
            role: Role::System,
            name: None,
            prompt: None,
        }));
    }
}
