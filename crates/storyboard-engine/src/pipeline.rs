//! The orchestrator: Assembler, Director and Artist in sequence, once per
//! invocation, with no retries of its own.

use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};
use storyboard_contracts::dossiers::{Dossier, DossierRegistry};
use storyboard_contracts::media::{fingerprint, ImageData, ImageSource};
use storyboard_contracts::models::{ModelSelector, CAPABILITY_IMAGE, CAPABILITY_STRUCTURED};
use storyboard_contracts::story::{AspectRatio, Frame, FrameId};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::artist::{AnchorImage, Artist};
use crate::assembler::ContextAssembler;
use crate::capability::CapabilityRegistry;
use crate::config::PipelineConfig;
use crate::director::{AnalysisBrief, Director, DirectorInput};
use crate::error::{FailedStage, FailureKind, PipelineError};
use crate::progress::{PipelineState, ProgressEvent, ProgressSink, ProgressStage};
use crate::source::ImageResolver;

/// What is being adapted and where the result will land.
#[derive(Debug, Clone, PartialEq)]
pub struct AdaptationTarget {
    pub source: ImageSource,
    /// Sequence slot the result is destined for, when it already has one.
    pub frame_id: Option<FrameId>,
    /// Known fingerprint of the original input. Computed from the resolved
    /// bytes when absent.
    pub source_hash: Option<String>,
    pub aspect_ratio: AspectRatio,
}

impl AdaptationTarget {
    /// Re-adapts an existing frame from its active image.
    pub fn from_frame(frame: &Frame) -> Result<Self, PipelineError> {
        let image_url = frame
            .active_image()
            .ok_or_else(|| PipelineError::context(format!("frame {} has no image yet", frame.id)))?;
        Ok(Self {
            source: ImageSource::Frame {
                frame_id: frame.id.clone(),
                image_url: image_url.to_string(),
            },
            frame_id: Some(frame.id.clone()),
            source_hash: frame.source_hash.clone(),
            aspect_ratio: frame.aspect_ratio,
        })
    }

    pub fn sketch(data_url: impl Into<String>, aspect_ratio: AspectRatio) -> Self {
        Self::new(
            ImageSource::Sketch {
                data_url: data_url.into(),
            },
            aspect_ratio,
        )
    }

    pub fn new(source: ImageSource, aspect_ratio: AspectRatio) -> Self {
        Self {
            source,
            frame_id: None,
            source_hash: None,
            aspect_ratio,
        }
    }

    pub fn in_slot(mut self, frame_id: FrameId) -> Self {
        self.frame_id = Some(frame_id);
        self
    }
}

#[derive(Debug, Clone)]
pub struct AdaptationRequest {
    pub target: AdaptationTarget,
    /// Snapshot of the sequence at invocation time.
    pub frames: Vec<Frame>,
    pub instruction: String,
    /// Caller-supplied dossier; looked up by source hash when absent.
    pub known_dossier: Option<Dossier>,
}

#[derive(Debug, Clone)]
pub struct AdaptationResult {
    pub invocation_id: String,
    pub image: ImageData,
    pub display_prompt: String,
    pub brief: AnalysisBrief,
    pub source_hash: String,
    /// The dossier created or refreshed by this invocation.
    pub dossier: Option<Dossier>,
}

pub struct Pipeline {
    resolver: ImageResolver,
    assembler: ContextAssembler,
    director: Director,
    artist: Artist,
    dossiers: Arc<dyn DossierRegistry>,
    config: PipelineConfig,
}

impl Pipeline {
    pub fn new(
        config: PipelineConfig,
        director: Director,
        artist: Artist,
        dossiers: Arc<dyn DossierRegistry>,
    ) -> Self {
        Self {
            resolver: ImageResolver::new(),
            assembler: ContextAssembler::new(config.reference_window),
            director,
            artist,
            dossiers,
            config,
        }
    }

    /// Wires both stages to `provider`, picking models through the default
    /// model registry.
    pub fn from_registry(
        config: PipelineConfig,
        capabilities: &CapabilityRegistry,
        provider: &str,
        dossiers: Arc<dyn DossierRegistry>,
    ) -> Result<Self> {
        let selector = ModelSelector::new(None);
        let analysis = selector
            .select(
                config.analysis_model.as_deref(),
                CAPABILITY_STRUCTURED,
                Some(provider),
            )
            .map_err(|err| anyhow!(err))?;
        let synthesis = selector
            .select(config.synthesis_model.as_deref(), CAPABILITY_IMAGE, Some(provider))
            .map_err(|err| anyhow!(err))?;
        for selection in [&analysis, &synthesis] {
            if let (Some(_), Some(reason)) = (&selection.requested, &selection.fallback_reason) {
                warn!(model = %selection.model.name, "{reason}");
            }
        }

        let structured = capabilities
            .structured(provider)
            .ok_or_else(|| anyhow!("provider '{provider}' has no structured generation"))?;
        let image = capabilities
            .image(provider)
            .ok_or_else(|| anyhow!("provider '{provider}' has no image generation"))?;
        info!(
            provider,
            analysis_model = %analysis.model.name,
            synthesis_model = %synthesis.model.name,
            "pipeline ready"
        );
        let director = Director::new(
            structured,
            analysis.model.name,
            config.story_language.clone(),
        );
        let artist = Artist::new(image, synthesis.model.name);
        Ok(Self::new(config, director, artist, dossiers))
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn dossiers(&self) -> &Arc<dyn DossierRegistry> {
        &self.dossiers
    }

    pub fn run_adaptation(
        &self,
        request: &AdaptationRequest,
        progress: &dyn ProgressSink,
    ) -> Result<AdaptationResult, PipelineError> {
        self.run_invocation(Uuid::new_v4().to_string(), request, progress)
    }

    /// Runs one invocation under a caller-chosen id, typically the id of the
    /// store ticket the result will be applied with.
    pub fn run_invocation(
        &self,
        invocation_id: impl Into<String>,
        request: &AdaptationRequest,
        progress: &dyn ProgressSink,
    ) -> Result<AdaptationResult, PipelineError> {
        let mut invocation = Invocation::new(invocation_id.into(), progress);
        let started = Instant::now();
        info!(
            invocation = %invocation.id,
            source = request.target.source.kind(),
            frames = request.frames.len(),
            "adaptation started"
        );

        let generated = match self.generate(&mut invocation, request) {
            Ok(generated) => generated,
            Err(err) => {
                warn!(
                    invocation = %invocation.id,
                    stage = %err.stage(),
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    error = %err,
                    "adaptation failed"
                );
                invocation.advance(PipelineState::Failed, err.user_message());
                return Err(err);
            }
        };

        invocation.advance(PipelineState::Succeeded, "Frame ready");
        let dossier = self.record_subject(&invocation, &generated);
        info!(
            invocation = %invocation.id,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "adaptation succeeded"
        );
        let display_prompt = generated
            .brief
            .display_prompt(&self.config.display_prompt_precedence, &request.instruction);
        Ok(AdaptationResult {
            invocation_id: invocation.id,
            image: generated.image,
            display_prompt,
            brief: generated.brief,
            source_hash: generated.source_hash,
            dossier,
        })
    }

    fn generate(
        &self,
        invocation: &mut Invocation<'_>,
        request: &AdaptationRequest,
    ) -> Result<Generated, PipelineError> {
        invocation.advance(PipelineState::AssemblingContext, "Reading the scene...");
        let target_image = self
            .resolver
            .resolve(&request.target.source)
            .map_err(|err| PipelineError::context(format!("{err:#}")))?;
        let source_hash = request
            .target
            .source_hash
            .clone()
            .unwrap_or_else(|| fingerprint(&target_image.bytes));
        let known = request
            .known_dossier
            .clone()
            .or_else(|| self.dossiers.lookup(&source_hash));

        let context = self.assembler.assemble(
            request.target.frame_id.as_ref(),
            &request.frames,
            known.as_ref(),
        );
        let mut style_references = Vec::with_capacity(context.style_references.len());
        for reference in &context.style_references {
            match self.resolver.resolve_url(&reference.image_url) {
                Ok(image) => style_references.push((reference.position, image)),
                Err(err) => warn!(
                    invocation = %invocation.id,
                    frame = %reference.frame_id,
                    error = %err,
                    "skipping unreadable style reference"
                ),
            }
        }
        let dossier_anchor = match context.identity_anchor.as_ref() {
            Some(anchor) => Some(AnchorImage {
                role_label: anchor.role_label.clone(),
                image: self.resolver.resolve_url(&anchor.image_url).map_err(|err| {
                    PipelineError::context(format!(
                        "identity reference for '{}' is unreadable: {err:#}",
                        anchor.role_label
                    ))
                })?,
            }),
            None => None,
        };
        debug!(
            invocation = %invocation.id,
            references = style_references.len(),
            anchored = dossier_anchor.is_some(),
            known = known.is_some(),
            "context assembled"
        );

        invocation.advance(PipelineState::Analyzing, "Analyzing the scene...");
        let director = self.director.clone();
        let input = DirectorInput {
            target: target_image.clone(),
            style_references: style_references.clone(),
            instruction: request.instruction.clone(),
            known_dossier: known.clone(),
        };
        let limit = self.config.analysis_timeout;
        let brief = bounded(FailedStage::Analysis, limit, move || {
            director.analyze(&input, limit)
        })?;

        let mut brief_anchor = None;
        let identity_anchor = match dossier_anchor {
            Some(anchor) => Some(anchor),
            None => self
                .anchor_from_brief(invocation, &brief, &request.frames, &request.target)
                .map(|(anchor, frame)| {
                    brief_anchor = Some(BriefAnchor {
                        frame_id: frame.id.clone(),
                        source_hash: frame.source_hash.clone(),
                    });
                    anchor
                }),
        };

        invocation.advance(PipelineState::Synthesizing, "Synthesizing the frame...");
        let artist = self.artist.clone();
        let synthesis_brief = brief.clone();
        let references: Vec<ImageData> = style_references
            .into_iter()
            .map(|(_, image)| image)
            .collect();
        let aspect_ratio = request.target.aspect_ratio;
        let limit = self.config.synthesis_timeout;
        let image = bounded(FailedStage::Synthesis, limit, move || {
            artist.synthesize(
                &synthesis_brief,
                &target_image,
                &references,
                identity_anchor.as_ref(),
                aspect_ratio,
                limit,
            )
        })?;

        Ok(Generated {
            image,
            brief,
            source_hash,
            known,
            brief_anchor,
        })
    }

    /// A brief may point at a context frame that already shows the subject.
    /// Used only when no dossier supplies an anchor.
    fn anchor_from_brief<'f>(
        &self,
        invocation: &Invocation<'_>,
        brief: &AnalysisBrief,
        frames: &'f [Frame],
        target: &AdaptationTarget,
    ) -> Option<(AnchorImage, &'f Frame)> {
        let index = brief.visual_anchor_index?;
        let frame = frames.get(index)?;
        if target.frame_id.as_ref() == Some(&frame.id) {
            return None;
        }
        let url = frame.usable_image()?;
        match self.resolver.resolve_url(url) {
            Ok(image) => Some((
                AnchorImage {
                    role_label: brief.role_label.clone(),
                    image,
                },
                frame,
            )),
            Err(err) => {
                warn!(
                    invocation = %invocation.id,
                    frame = %frame.id,
                    error = %err,
                    "brief anchor frame is unreadable"
                );
                None
            }
        }
    }

    /// Registers a newly recognized subject, or refreshes the one already
    /// known. A subject anchored to an existing frame is already in the
    /// story and only refreshes that frame's dossier, if it has one.
    /// Registry trouble never fails a finished invocation.
    fn record_subject(&self, invocation: &Invocation<'_>, generated: &Generated) -> Option<Dossier> {
        if let Some(known) = generated.known.as_ref() {
            return match self.dossiers.touch(&known.source_hash) {
                Ok(touched) => touched.or_else(|| Some(known.clone())),
                Err(err) => {
                    warn!(invocation = %invocation.id, error = %err, "failed to refresh dossier");
                    Some(known.clone())
                }
            };
        }
        if let Some(anchor) = generated.brief_anchor.as_ref() {
            debug!(
                invocation = %invocation.id,
                frame = %anchor.frame_id,
                "subject anchored to an existing frame; no new dossier"
            );
            let hash = anchor.source_hash.as_deref()?;
            return match self.dossiers.touch(hash) {
                Ok(touched) => touched,
                Err(err) => {
                    warn!(invocation = %invocation.id, error = %err, "failed to refresh dossier");
                    None
                }
            };
        }
        let kind = generated.brief.subject_type?;
        let dossier = Dossier::new(
            generated.source_hash.clone(),
            kind,
            generated.brief.role_label.clone(),
            generated.brief.subject_description.clone(),
            generated.image.to_data_url(),
        );
        match self.dossiers.upsert(dossier) {
            Ok(stored) => {
                info!(
                    invocation = %invocation.id,
                    source_hash = %stored.source_hash,
                    role = %stored.role_label,
                    kind = %stored.kind,
                    "dossier recorded"
                );
                invocation.emit(
                    ProgressStage::DossierUpserted,
                    format!("Remembering {} '{}'", stored.kind, stored.role_label),
                );
                Some(stored)
            }
            Err(err) => {
                warn!(invocation = %invocation.id, error = %err, "failed to record dossier");
                None
            }
        }
    }
}

struct Generated {
    image: ImageData,
    brief: AnalysisBrief,
    source_hash: String,
    known: Option<Dossier>,
    brief_anchor: Option<BriefAnchor>,
}

/// The context frame the brief named as showing the subject.
struct BriefAnchor {
    frame_id: FrameId,
    source_hash: Option<String>,
}

struct Invocation<'a> {
    id: String,
    state: PipelineState,
    progress: &'a dyn ProgressSink,
}

impl<'a> Invocation<'a> {
    fn new(id: String, progress: &'a dyn ProgressSink) -> Self {
        Self {
            id,
            state: PipelineState::Idle,
            progress,
        }
    }

    fn advance(&mut self, next: PipelineState, message: impl Into<String>) {
        debug_assert!(
            self.state.can_transition_to(next),
            "illegal transition {} -> {}",
            self.state.as_str(),
            next.as_str()
        );
        self.state = next;
        self.emit(ProgressStage::State(next), message);
    }

    fn emit(&self, stage: ProgressStage, message: impl Into<String>) {
        self.progress.notify(&ProgressEvent {
            invocation_id: self.id.clone(),
            stage,
            message: message.into(),
        });
    }
}

/// Runs `work` on its own thread and stops waiting after `limit`. A late
/// result is dropped with the channel.
fn bounded<T, F>(stage: FailedStage, limit: Duration, work: F) -> Result<T, PipelineError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, PipelineError> + Send + 'static,
{
    let (tx, rx) = mpsc::channel();
    thread::Builder::new()
        .name(format!("storyboard-{stage}"))
        .spawn(move || {
            let _ = tx.send(work());
        })
        .map_err(|err| {
            stage_error(
                stage,
                FailureKind::Generic,
                format!("could not start {stage} worker: {err}"),
            )
        })?;
    match rx.recv_timeout(limit) {
        Ok(result) => result,
        Err(RecvTimeoutError::Timeout) => Err(stage_error(
            stage,
            FailureKind::Timeout,
            format!("{stage} did not finish within {limit:?}"),
        )),
        Err(RecvTimeoutError::Disconnected) => Err(stage_error(
            stage,
            FailureKind::Generic,
            format!("{stage} worker stopped without a result"),
        )),
    }
}

fn stage_error(stage: FailedStage, kind: FailureKind, message: String) -> PipelineError {
    match stage {
        FailedStage::Context => PipelineError::context(message),
        FailedStage::Analysis => PipelineError::analysis(kind, message),
        FailedStage::Synthesis => PipelineError::synthesis(kind, message),
    }
}
