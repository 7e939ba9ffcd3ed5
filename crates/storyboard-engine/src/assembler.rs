//! Picks which existing frames accompany a target into the generators.

use storyboard_contracts::dossiers::Dossier;
use storyboard_contracts::story::{Frame, FrameId};

use crate::config::{ExtensionBias, ReferenceWindow};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StyleReference {
    pub frame_id: FrameId,
    /// Position in the frame sequence the reference was taken from.
    pub position: usize,
    pub image_url: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentityAnchor {
    pub source_hash: String,
    pub role_label: String,
    pub image_url: String,
}

impl IdentityAnchor {
    pub fn from_dossier(dossier: &Dossier) -> Self {
        Self {
            source_hash: dossier.source_hash.clone(),
            role_label: dossier.role_label.clone(),
            image_url: dossier.reference_image_url.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AssembledContext {
    /// Style neighbors in story order.
    pub style_references: Vec<StyleReference>,
    pub identity_anchor: Option<IdentityAnchor>,
    /// Where the target sits in the sequence, if it is already part of it.
    pub target_position: Option<usize>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ContextAssembler {
    window: ReferenceWindow,
}

impl ContextAssembler {
    pub fn new(window: ReferenceWindow) -> Self {
        Self { window }
    }

    /// Pure selection over already-loaded frames.
    ///
    /// A target inside the sequence gets its nearest usable neighbors,
    /// growing outward one position at a time; at equal distance the
    /// configured bias decides which side goes first. A target outside the
    /// sequence gets the last usable frames. The identity anchor comes only
    /// from `known`, never from the style neighbors.
    pub fn assemble(
        &self,
        target_frame: Option<&FrameId>,
        frames: &[Frame],
        known: Option<&Dossier>,
    ) -> AssembledContext {
        let target_position =
            target_frame.and_then(|id| frames.iter().position(|frame| &frame.id == id));
        let mut positions = match target_position {
            Some(index) => self.neighbor_positions(index, frames),
            None => self.trailing_positions(frames),
        };
        positions.sort_unstable();

        let style_references = positions
            .into_iter()
            .filter_map(|position| {
                let frame = &frames[position];
                frame.usable_image().map(|url| StyleReference {
                    frame_id: frame.id.clone(),
                    position,
                    image_url: url.to_string(),
                })
            })
            .collect();

        AssembledContext {
            style_references,
            identity_anchor: known.map(IdentityAnchor::from_dossier),
            target_position,
        }
    }

    fn neighbor_positions(&self, index: usize, frames: &[Frame]) -> Vec<usize> {
        let limit = self.window.max_references;
        let mut picked = Vec::with_capacity(limit);
        let mut distance = 1;
        while picked.len() < limit && (distance <= index || index + distance < frames.len()) {
            let left = index.checked_sub(distance);
            let right = Some(index + distance).filter(|position| *position < frames.len());
            let ordered = match self.window.extension_bias {
                ExtensionBias::Left => [left, right],
                ExtensionBias::Right => [right, left],
            };
            for position in ordered.into_iter().flatten() {
                if picked.len() < limit && frames[position].usable_image().is_some() {
                    picked.push(position);
                }
            }
            distance += 1;
        }
        picked
    }

    fn trailing_positions(&self, frames: &[Frame]) -> Vec<usize> {
        frames
            .iter()
            .enumerate()
            .rev()
            .filter(|(_, frame)| frame.usable_image().is_some())
            .take(self.window.max_references)
            .map(|(position, _)| position)
            .collect()
    }
}
