// ── Skill Registry (§4.4) ─────────────────────────────────────────────────
// Static metadata seeded once at construction (§5: "skill registry and
// agent config are immutable within a request"). Invocation itself is a
// `SkillInvoker` trait object supplied by the caller — out of this
// crate's scope — but argument-schema validation and cost lookup live
// here.

pub mod pricing;

use crate::atoms::decimal::{Amount, ClassSplit};
use crate::atoms::error::{PlatformError, PlatformResult};
use crate::atoms::types::{Agent, ApiKeyProvider, FeeSplit, StateAccess};
use std::collections::HashMap;

/// Capability tags attached to every skill (§9 redesign guidance — a
/// fixed set rather than reflective dispatch).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SkillCapability {
    Invocable,
    StreamingSafe,
    SideEffecting,
}

#[derive(Debug, Clone)]
pub struct SkillDescriptor {
    pub name: String,
    pub category: String,
    pub price_tier: Amount,
    pub requires_agent_owner_key: bool,
    pub states: Vec<String>,
    pub capabilities: Vec<SkillCapability>,
    pub argument_schema: serde_json::Value,
}

impl SkillDescriptor {
    pub fn has_capability(&self, cap: SkillCapability) -> bool {
        self.capabilities.contains(&cap)
    }
}

/// What a fully-decomposed skill charge would look like before the
/// ledger draws against an actual balance — `gross` plus the per-bucket
/// fee fractions taken from the agent's `FeeSplit` (§4.4 `cost_for`).
#[derive(Debug, Clone, Copy)]
pub struct SkillCost {
    pub gross: Amount,
    pub fee_split: FeeSplit,
}

pub struct SkillRegistry {
    skills: HashMap<String, SkillDescriptor>,
}

impl SkillRegistry {
    pub fn new() -> Self {
        SkillRegistry { skills: HashMap::new() }
    }

    pub fn register(&mut self, descriptor: SkillDescriptor) {
        self.skills.insert(descriptor.name.clone(), descriptor);
    }

    pub fn get(&self, skill_name: &str) -> PlatformResult<&SkillDescriptor> {
        self.skills.get(skill_name).ok_or_else(|| PlatformError::not_found(format!("skill {skill_name}")))
    }

    /// `cost_for(agent, skill) -> gross + fee_shares` (§4.4). The gross is
    /// the skill's flat price tier; the agent's fee split determines how
    /// the ledger will later decompose it.
    pub fn cost_for(&self, agent: &Agent, skill_name: &str) -> PlatformResult<SkillCost> {
        let skill = self.get(skill_name)?;
        Ok(SkillCost { gross: skill.price_tier, fee_split: agent.fee_split })
    }

    pub fn requires_agent_owner_key(&self, skill_name: &str) -> PlatformResult<bool> {
        Ok(self.get(skill_name)?.requires_agent_owner_key)
    }

    /// `state_access(agent, skill, state) -> {disabled, private, public}`
    /// (§4.4). Falls back to `Disabled` when the agent never enabled the
    /// skill or the named state doesn't exist on it.
    pub fn state_access(&self, agent: &Agent, skill_name: &str, state: &str) -> PlatformResult<StateAccess> {
        let skill = self.get(skill_name)?;
        if !skill.states.iter().any(|s| s == state) {
            return Err(PlatformError::not_found(format!("state {state} on skill {skill_name}")));
        }
        Ok(match agent.skills.get(skill_name) {
            Some(enablement) if enablement.enabled => enablement.state_access,
            _ => StateAccess::Disabled,
        })
    }

    /// True iff calling `skill_name` on `agent`'s behalf should use the
    /// agent owner's own API key rather than a platform-supplied one.
    pub fn api_key_provider(&self, agent: &Agent, skill_name: &str) -> ApiKeyProvider {
        agent.skills.get(skill_name).map(|e| e.api_key_provider).unwrap_or(ApiKeyProvider::Platform)
    }

    /// Validate `arguments` against the skill's declared JSON schema
    /// boundary (§9: "tool-call arguments remain JSON-shaped; validate at
    /// the boundary"). This crate checks only object-shape and required
    /// keys — full JSON Schema validation is a caller concern.
    pub fn validate_arguments(&self, skill_name: &str, arguments: &serde_json::Value) -> PlatformResult<()> {
        let skill = self.get(skill_name)?;
        let required = skill.argument_schema.get("required").and_then(|r| r.as_array()).cloned().unwrap_or_default();
        let obj = arguments.as_object().ok_or_else(|| PlatformError::invalid(format!("{skill_name} arguments must be a JSON object")))?;
        for key in required {
            let key = key.as_str().unwrap_or_default();
            if !obj.contains_key(key) {
                return Err(PlatformError::invalid(format!("{skill_name} missing required argument {key}")));
            }
        }
        Ok(())
    }
}

impl Default for SkillRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atoms::types::{MemoryStrategy, SkillEnablement};
    use serde_json::json;
    use std::str::FromStr;

    fn test_agent(skills: HashMap<String, SkillEnablement>) -> Agent {
        Agent {
            id: "agent-1".into(),
            owner_id: "dev-1".into(),
            display_name: "test".into(),
            model: "claude-test".into(),
            temperature: 0.7,
            memory_strategy: MemoryStrategy::Trim,
            token_budget: 8000,
            skills,
            autonomous_tasks: vec![],
            fee_split: FeeSplit { platform: 0.1, dev: 0.05, agent: 0.0 },
            system_prompt: String::new(),
            deleted: false,
            created_at: String::new(),
            updated_at: String::new(),
        }
    }

    fn search_skill() -> SkillDescriptor {
        SkillDescriptor {
            name: "search".into(),
            category: "retrieval".into(),
            price_tier: Amount::from_str("0.0050").unwrap(),
            requires_agent_owner_key: false,
            states: vec!["query".into()],
            capabilities: vec![SkillCapability::Invocable, SkillCapability::StreamingSafe],
            argument_schema: json!({"required": ["query"]}),
        }
    }

    #[test]
    fn cost_for_returns_price_tier_and_agent_fee_split() {
        let mut registry = SkillRegistry::new();
        registry.register(search_skill());
        let agent = test_agent(HashMap::new());

        let cost = registry.cost_for(&agent, "search").unwrap();
        assert_eq!(cost.gross, Amount::from_str("0.0050").unwrap());
        assert_eq!(cost.fee_split.platform, 0.1);
    }

    #[test]
    fn state_access_is_disabled_when_agent_never_enabled_skill() {
        let mut registry = SkillRegistry::new();
        registry.register(search_skill());
        let agent = test_agent(HashMap::new());

        assert_eq!(registry.state_access(&agent, "search", "query").unwrap(), StateAccess::Disabled);
    }

    #[test]
    fn state_access_reflects_enablement_when_present() {
        let mut registry = SkillRegistry::new();
        registry.register(search_skill());
        let mut skills = HashMap::new();
        skills.insert("search".to_string(), SkillEnablement { enabled: true, state_access: StateAccess::Public, api_key_provider: ApiKeyProvider::AgentOwner });
        let agent = test_agent(skills);

        assert_eq!(registry.state_access(&agent, "search", "query").unwrap(), StateAccess::Public);
        assert_eq!(registry.api_key_provider(&agent, "search"), ApiKeyProvider::AgentOwner);
    }

    #[test]
    fn validate_arguments_rejects_missing_required_key() {
        let mut registry = SkillRegistry::new();
        registry.register(search_skill());
        let err = registry.validate_arguments("search", &json!({})).unwrap_err();
        assert!(matches!(err, PlatformError::InvalidInput(_)));
    }

    #[test]
    fn validate_arguments_accepts_well_formed_call() {
        let mut registry = SkillRegistry::new();
        registry.register(search_skill());
        assert!(registry.validate_arguments("search", &json!({"query": "rust"})).is_ok());
    }
}
