use std::collections::BTreeMap;
use std::path::PathBuf;

use anyhow::{bail, Context};
use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::frame::{AspectRatio, Frame, FrameId, GenerationStatus};
use crate::files::{write_json_atomic, FileLock};

pub const STORY_SCHEMA_VERSION: u64 = 1;

/// Proof that a caller started an adaptation on a frame. Results are only
/// applied while the ticket is still the frame's latest one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvocationTicket {
    pub invocation_id: String,
    pub frame_id: FrameId,
    generation: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied,
    Superseded,
    FrameMissing,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct StoryFile {
    schema_version: u64,
    story_id: String,
    created_at: String,
    #[serde(default)]
    aspect_ratio: AspectRatio,
    #[serde(default)]
    frames: Vec<Frame>,
    #[serde(default)]
    generations: BTreeMap<FrameId, u64>,
}

/// Owns the ordered frame sequence of one project.
///
/// The pipeline only ever sees [`StoryStore::snapshot`]; writes go through
/// the ticketed `apply_*` calls so a late result from an abandoned
/// invocation cannot overwrite newer work. Ticket generations are saved
/// with the frames, so a ticket stays checkable after a reload in another
/// process. Callers that share a project file go through
/// [`StoryStore::update`].
#[derive(Debug, Clone)]
pub struct StoryStore {
    pub path: PathBuf,
    pub schema_version: u64,
    pub story_id: String,
    pub created_at: String,
    pub aspect_ratio: AspectRatio,
    frames: Vec<Frame>,
    generations: BTreeMap<FrameId, u64>,
}

impl StoryStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            schema_version: STORY_SCHEMA_VERSION,
            story_id: Uuid::new_v4().to_string(),
            created_at: now_utc_iso(),
            aspect_ratio: AspectRatio::default(),
            frames: Vec::new(),
            generations: BTreeMap::new(),
        }
    }

    pub fn load(path: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let path = path.into();
        let raw = std::fs::read_to_string(&path)
            .with_context(|| format!("failed reading {}", path.display()))?;
        let file: StoryFile = serde_json::from_str(&raw)
            .with_context(|| format!("{} is not a valid story file", path.display()))?;
        let mut frames = file.frames;
        for frame in &mut frames {
            frame.repair();
        }
        Ok(Self {
            path,
            schema_version: file.schema_version,
            story_id: file.story_id,
            created_at: file.created_at,
            aspect_ratio: file.aspect_ratio,
            frames,
            generations: file.generations,
        })
    }

    pub fn save(&self) -> anyhow::Result<()> {
        let file = StoryFile {
            schema_version: self.schema_version,
            story_id: self.story_id.clone(),
            created_at: self.created_at.clone(),
            aspect_ratio: self.aspect_ratio,
            frames: self.frames.clone(),
            generations: self.generations.clone(),
        };
        write_json_atomic(&self.path, &serde_json::to_value(file)?)
    }

    /// Loads the project under its lock file, applies `change` and saves it
    /// before the lock is released. Nothing is written when `change` fails.
    pub fn update<T>(
        path: impl Into<PathBuf>,
        change: impl FnOnce(&mut StoryStore) -> anyhow::Result<T>,
    ) -> anyhow::Result<T> {
        let path = path.into();
        let _lock = FileLock::acquire(&path)?;
        let mut store = Self::load(&path)?;
        let output = change(&mut store)?;
        store.save()?;
        Ok(output)
    }

    /// Settles frames left generating by a process that exited without
    /// reporting back. Returns how many frames changed.
    pub fn settle_interrupted(&mut self) -> usize {
        let mut settled = 0;
        for frame in &mut self.frames {
            if !matches!(frame.generation_status, GenerationStatus::Generating { .. }) {
                continue;
            }
            frame.generation_status = if frame.image_versions.is_empty() {
                GenerationStatus::Error {
                    message: "Generation was interrupted.".to_string(),
                }
            } else {
                GenerationStatus::Idle
            };
            settled += 1;
        }
        settled
    }

    pub fn frames(&self) -> &[Frame] {
        &self.frames
    }

    pub fn snapshot(&self) -> Vec<Frame> {
        self.frames.clone()
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn frame(&self, id: &FrameId) -> Option<&Frame> {
        self.frames.iter().find(|frame| &frame.id == id)
    }

    pub fn position(&self, id: &FrameId) -> Option<usize> {
        self.frames.iter().position(|frame| &frame.id == id)
    }

    pub fn total_duration(&self) -> f64 {
        self.frames.iter().map(|frame| frame.duration).sum()
    }

    pub fn push_frame(&mut self, frame: Frame) -> FrameId {
        let index = self.frames.len();
        self.insert_frame(index, frame)
    }

    pub fn insert_frame(&mut self, index: usize, mut frame: Frame) -> FrameId {
        frame.repair();
        let id = frame.id.clone();
        let index = index.min(self.frames.len());
        self.frames.insert(index, frame);
        id
    }

    pub fn remove_frame(&mut self, id: &FrameId) -> Option<Frame> {
        let index = self.position(id)?;
        Some(self.frames.remove(index))
    }

    pub fn move_frame(&mut self, id: &FrameId, new_index: usize) -> anyhow::Result<()> {
        let Some(index) = self.position(id) else {
            bail!("frame {id} not found");
        };
        let frame = self.frames.remove(index);
        let new_index = new_index.min(self.frames.len());
        self.frames.insert(new_index, frame);
        Ok(())
    }

    pub fn set_duration(&mut self, id: &FrameId, duration: f64) -> anyhow::Result<()> {
        self.frame_mut(id)?.set_duration(duration);
        Ok(())
    }

    pub fn set_prompt(&mut self, id: &FrameId, prompt: &str) -> anyhow::Result<()> {
        self.frame_mut(id)?.prompt = prompt.to_string();
        Ok(())
    }

    pub fn set_active_version(&mut self, id: &FrameId, index: usize) -> anyhow::Result<()> {
        self.frame_mut(id)?.set_active_version(index)
    }

    pub fn rollback(&mut self, id: &FrameId, index: usize) -> anyhow::Result<()> {
        self.frame_mut(id)?.rollback_to(index)
    }

    /// Frames whose source image fingerprint equals `hash`, in story order.
    pub fn list_by_source_hash(&self, hash: &str) -> Vec<&Frame> {
        self.frames
            .iter()
            .filter(|frame| frame.source_hash.as_deref() == Some(hash))
            .collect()
    }

    /// Marks `id` as generating and hands back a ticket that supersedes any
    /// earlier one for the same frame.
    pub fn begin_invocation(
        &mut self,
        id: &FrameId,
        message: &str,
    ) -> anyhow::Result<InvocationTicket> {
        self.frame_mut(id)?.generation_status = GenerationStatus::Generating {
            message: message.to_string(),
        };
        let generation = self.generations.entry(id.clone()).or_insert(0);
        *generation += 1;
        Ok(InvocationTicket {
            invocation_id: Uuid::new_v4().to_string(),
            frame_id: id.clone(),
            generation: *generation,
        })
    }

    pub fn is_current(&self, ticket: &InvocationTicket) -> bool {
        self.generations.get(&ticket.frame_id) == Some(&ticket.generation)
    }

    pub fn report_progress(&mut self, ticket: &InvocationTicket, message: &str) -> ApplyOutcome {
        self.with_current(ticket, |frame| {
            frame.generation_status = GenerationStatus::Generating {
                message: message.to_string(),
            };
        })
    }

    /// Appends the adapted image as a new version of the ticket's frame.
    pub fn apply_adaptation(
        &mut self,
        ticket: &InvocationTicket,
        image_url: String,
        prompt: String,
        source_hash: Option<String>,
    ) -> ApplyOutcome {
        self.with_current(ticket, |frame| {
            frame.push_version(image_url);
            frame.prompt = prompt;
            if source_hash.is_some() {
                frame.source_hash = source_hash;
            }
            frame.generation_status = GenerationStatus::Idle;
        })
    }

    /// Records a failed invocation. A frame that still has an earlier
    /// version falls back to it; an empty slot is left in the error state.
    pub fn fail_invocation(&mut self, ticket: &InvocationTicket, message: &str) -> ApplyOutcome {
        self.with_current(ticket, |frame| {
            frame.generation_status = if frame.image_versions.is_empty() {
                GenerationStatus::Error {
                    message: message.to_string(),
                }
            } else {
                GenerationStatus::Idle
            };
        })
    }

    fn with_current(
        &mut self,
        ticket: &InvocationTicket,
        apply: impl FnOnce(&mut Frame),
    ) -> ApplyOutcome {
        if !self.is_current(ticket) {
            return ApplyOutcome::Superseded;
        }
        let Some(frame) = self
            .frames
            .iter_mut()
            .find(|frame| frame.id == ticket.frame_id)
        else {
            return ApplyOutcome::FrameMissing;
        };
        apply(frame);
        ApplyOutcome::Applied
    }

    fn frame_mut(&mut self, id: &FrameId) -> anyhow::Result<&mut Frame> {
        self.frames
            .iter_mut()
            .find(|frame| &frame.id == id)
            .with_context(|| format!("frame {id} not found"))
    }
}

fn now_utc_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, false)
}
