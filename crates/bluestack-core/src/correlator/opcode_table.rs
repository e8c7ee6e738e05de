//! Opcode pair table
//!
//! Static mapping from every acknowledged request opcode a client model can
//! send to the response opcode that completes it. Built once per client model
//! and shared read-only.

use crate::types::Opcode;
use hashbrown::HashMap;

/// Request opcode to expected response opcode
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OpcodePairTable {
    pairs: HashMap<Opcode, Opcode>,
}

impl OpcodePairTable {
    /// Build a table from `(request, response)` pairs
    ///
    /// A request opcode listed twice keeps its last response.
    pub fn from_pairs<I, O>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (O, O)>,
        O: Into<Opcode>,
    {
        Self {
            pairs: pairs
                .into_iter()
                .map(|(request, response)| (request.into(), response.into()))
                .collect(),
        }
    }

    /// Response opcode that completes `request`, if it is an acknowledged request
    pub fn expected_response(&self, request: Opcode) -> Option<Opcode> {
        self.pairs.get(&request).copied()
    }

    pub fn contains_request(&self, request: Opcode) -> bool {
        self.pairs.contains_key(&request)
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }
}
