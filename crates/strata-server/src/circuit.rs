//! Circuits established by the login service, used to verify bootstrap
//! credentials.

use crate::config::CircuitConfig;
use parking_lot::RwLock;
use std::collections::HashMap;

/// What the login service agreed with an agent before it connects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Circuit {
    pub agent_id: String,
    pub session_id: String,
    pub secure_session_id: String,
    pub circuit_code: u32,
}

impl From<CircuitConfig> for Circuit {
    fn from(c: CircuitConfig) -> Self {
        Self {
            agent_id: c.agent_id,
            session_id: c.session_id,
            secure_session_id: c.secure_session_id,
            circuit_code: c.circuit_code,
        }
    }
}

/// Source of truth for established circuits.
pub trait CircuitAuthority: Send + Sync {
    fn circuit(&self, agent_id: &str) -> Option<Circuit>;
}

/// Circuits held in memory, keyed by agent.
#[derive(Default)]
pub struct MemoryCircuits {
    circuits: RwLock<HashMap<String, Circuit>>,
}

impl MemoryCircuits {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(circuits: &[CircuitConfig]) -> Self {
        let authority = Self::new();
        for c in circuits {
            authority.add(c.clone().into());
        }
        authority
    }

    /// Record a circuit, replacing any previous one for the agent.
    pub fn add(&self, circuit: Circuit) {
        self.circuits
            .write()
            .insert(circuit.agent_id.clone(), circuit);
    }

    pub fn remove(&self, agent_id: &str) -> Option<Circuit> {
        self.circuits.write().remove(agent_id)
    }
}

impl CircuitAuthority for MemoryCircuits {
    fn circuit(&self, agent_id: &str) -> Option<Circuit> {
        self.circuits.read().get(agent_id).cloned()
    }
}
