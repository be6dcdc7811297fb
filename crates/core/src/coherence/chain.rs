//! Sequential conditioning chain.
//!
//! Frame N+1 is conditioned on the session anchor plus the previously accepted frame N.
//! The first frame sees only the anchor.

use crate::generation::ArtifactRef;

#[derive(Debug, Clone, Default)]
pub struct SequentialChain {
    anchor: Option<ArtifactRef>,
    accepted: Vec<ArtifactRef>,
}

impl SequentialChain {
    pub fn new(anchor: Option<ArtifactRef>) -> Self {
        Self {
            anchor,
            accepted: Vec::new(),
        }
    }

    /// Conditioning for the next frame to generate
    pub fn conditioning(&self) -> Vec<ArtifactRef> {
        self.anchor
            .iter()
            .chain(self.accepted.last())
            .cloned()
            .collect()
    }

    pub fn accept(&mut self, frame: ArtifactRef) {
        self.accepted.push(frame);
    }

    pub fn accepted(&self) -> &[ArtifactRef] {
        &self.accepted
    }

    pub fn len(&self) -> usize {
        self.accepted.len()
    }

    pub fn is_empty(&self) -> bool {
        self.accepted.is_empty()
    }
}
