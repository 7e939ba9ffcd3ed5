//! Analysis stage: one structured call that places the subject in the
//! story and writes both prompts.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::{Map, Value};
use storyboard_contracts::dossiers::{Dossier, SubjectKind};
use storyboard_contracts::media::ImageData;
use tracing::debug;

use crate::capability::{GenerationPart, StructuredGenerator, StructuredRequest};
use crate::config::{DisplayPromptSource, IMAGE_PROMPT_LANGUAGE};
use crate::error::{FailureKind, PipelineError};
use crate::schema::OutputSchema;

pub const SUBJECT_NONE: &str = "none";

/// Schema-validated result of the analysis stage. Lives for one invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisBrief {
    pub world_context: String,
    /// `None` when the subject is not a recurring character, object or
    /// location.
    pub subject_type: Option<SubjectKind>,
    pub role_label: String,
    pub subject_description: String,
    pub transformation: String,
    pub narrative_rationale: String,
    pub visual_anchor_index: Option<usize>,
    /// Technical prompt for the image model, always in English.
    pub image_prompt: String,
    /// Action prompt for people and the video renderer, in the story's
    /// language.
    pub video_prompt: String,
    pub visual_description: String,
}

impl AnalysisBrief {
    /// First non-empty source in `precedence`; the raw instruction is the
    /// last resort when the list runs out.
    pub fn display_prompt(&self, precedence: &[DisplayPromptSource], instruction: &str) -> String {
        precedence
            .iter()
            .chain(std::iter::once(&DisplayPromptSource::Instruction))
            .map(|source| match source {
                DisplayPromptSource::VideoPrompt => self.video_prompt.as_str(),
                DisplayPromptSource::VisualDescription => self.visual_description.as_str(),
                DisplayPromptSource::Instruction => instruction,
            })
            .map(str::trim)
            .find(|text| !text.is_empty())
            .unwrap_or_default()
            .to_string()
    }

    /// Pins identity fields to an established dossier so repeated
    /// adaptations cannot drift away from it.
    fn adopt_identity(&mut self, dossier: &Dossier) {
        self.subject_type = Some(dossier.kind);
        self.role_label = dossier.role_label.clone();
        self.subject_description = dossier.description.clone();
    }
}

pub fn brief_schema() -> OutputSchema {
    let mut subject_values = vec![SUBJECT_NONE];
    subject_values.extend(SubjectKind::ALL.iter().map(SubjectKind::as_str));
    OutputSchema::new()
        .string(
            "worldContext",
            "Setting, era, medium and visual style shared by the context frames.",
        )
        .enumeration(
            "subjectType",
            &subject_values,
            "Whether the subject is a recurring character, object or location, or none.",
        )
        .string("roleLabel", "Short name for the subject, e.g. 'Old fisherman'.")
        .string(
            "subjectDescription",
            "Identity description: face, clothing, colors, shape.",
        )
        .string(
            "transformation",
            "What must change so the subject fits this story beat.",
        )
        .string(
            "narrativeRationale",
            "Why the frame belongs at this point of the story.",
        )
        .nullable_number(
            "visualAnchorIndex",
            "Storyboard position of a context frame already showing this exact subject, or null.",
        )
        .string("imagePrompt", "Detailed technical prompt for the image model.")
        .string("videoPrompt", "One or two sentences describing the action in the frame.")
        .string("visualDescription", "What the finished frame shows.")
}

#[derive(Debug, Clone)]
pub struct DirectorInput {
    pub target: ImageData,
    /// `(story position, image)` pairs in story order.
    pub style_references: Vec<(usize, ImageData)>,
    pub instruction: String,
    pub known_dossier: Option<Dossier>,
}

#[derive(Clone)]
pub struct Director {
    generator: Arc<dyn StructuredGenerator>,
    model: String,
    story_language: String,
}

impl Director {
    pub fn new(
        generator: Arc<dyn StructuredGenerator>,
        model: impl Into<String>,
        story_language: impl Into<String>,
    ) -> Self {
        Self {
            generator,
            model: model.into(),
            story_language: story_language.into(),
        }
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn provider(&self) -> &str {
        self.generator.name()
    }

    pub fn analyze(
        &self,
        input: &DirectorInput,
        timeout: Duration,
    ) -> Result<AnalysisBrief, PipelineError> {
        let schema = brief_schema();
        let request = StructuredRequest {
            model: self.model.clone(),
            parts: self.build_parts(input),
            schema: schema.clone(),
            timeout,
        };
        let payload = self
            .generator
            .generate_structured(&request)
            .map_err(|err| PipelineError::analysis(err.kind.into(), err.message))?;
        let mut brief = parse_brief(&schema, &payload)?;
        if let Some(dossier) = input.known_dossier.as_ref() {
            brief.adopt_identity(dossier);
        }
        debug!(
            provider = self.provider(),
            model = %self.model,
            subject = ?brief.subject_type,
            anchor = ?brief.visual_anchor_index,
            "analysis brief accepted"
        );
        Ok(brief)
    }

    fn build_parts(&self, input: &DirectorInput) -> Vec<GenerationPart> {
        let mut parts = Vec::with_capacity(input.style_references.len() * 2 + 3);
        parts.push(GenerationPart::text(
            "SUBJECT IMAGE: the item that must be placed into the story.",
        ));
        parts.push(GenerationPart::Image(input.target.clone()));
        for (position, image) in &input.style_references {
            parts.push(GenerationPart::text(format!(
                "CONTEXT FRAME at storyboard position {position}: shows the story's world and style."
            )));
            parts.push(GenerationPart::Image(image.clone()));
        }
        parts.push(GenerationPart::text(self.instruction_text(input)));
        parts
    }

    fn instruction_text(&self, input: &DirectorInput) -> String {
        let language = &self.story_language;
        let mut text = format!(
            "You are the director of a storyboard. Decide how the SUBJECT IMAGE becomes the next \
frame of the story shown by the CONTEXT FRAMES.\n\
Write worldContext, roleLabel, subjectDescription, transformation, narrativeRationale, \
videoPrompt and visualDescription in {language}.\n\
Write imagePrompt in {IMAGE_PROMPT_LANGUAGE} regardless of the story language: a precise, \
technical prompt for an image model covering subject, action, composition, lighting and the \
rendering style of the context frames.\n\
Set subjectType to none unless the subject is a character, object or location likely to recur.\n"
        );
        if input.style_references.is_empty() {
            text.push_str(
                "There are no context frames: this is the first frame, so establish the style.\n",
            );
        }
        if let Some(dossier) = input.known_dossier.as_ref() {
            text.push_str(&format!(
                "KNOWN SUBJECT: this subject is already established as the {} '{}': {}. Keep \
exactly this identity, use roleLabel '{}' verbatim and do not re-describe its appearance.\n",
                dossier.kind, dossier.role_label, dossier.description, dossier.role_label
            ));
        }
        text.push_str("INSTRUCTION: ");
        text.push_str(input.instruction.trim());
        text
    }
}

/// Converts a provider payload into a brief. Anything off-schema is a hard
/// analysis failure; nothing is defaulted.
pub fn parse_brief(schema: &OutputSchema, payload: &Value) -> Result<AnalysisBrief, PipelineError> {
    let fields = schema.validate(payload).map_err(|violation| {
        PipelineError::analysis(FailureKind::Malformed, violation.to_string())
    })?;
    let text = |name: &str| string_field(&fields, name);

    let subject_type = match text("subjectType").as_str() {
        SUBJECT_NONE => None,
        other => Some(other.parse::<SubjectKind>().map_err(|err| {
            PipelineError::analysis(FailureKind::Malformed, err.to_string())
        })?),
    };
    let visual_anchor_index = match fields.get("visualAnchorIndex") {
        Some(Value::Number(number)) => Some(
            number
                .as_u64()
                .and_then(|value| usize::try_from(value).ok())
                .ok_or_else(|| {
                    PipelineError::analysis(
                        FailureKind::Malformed,
                        format!("visualAnchorIndex {number} is not a frame position"),
                    )
                })?,
        ),
        _ => None,
    };
    let image_prompt = text("imagePrompt");
    if image_prompt.trim().is_empty() {
        return Err(PipelineError::analysis(
            FailureKind::Malformed,
            "imagePrompt is empty",
        ));
    }

    Ok(AnalysisBrief {
        world_context: text("worldContext"),
        subject_type,
        role_label: text("roleLabel"),
        subject_description: text("subjectDescription"),
        transformation: text("transformation"),
        narrative_rationale: text("narrativeRationale"),
        visual_anchor_index,
        image_prompt,
        video_prompt: text("videoPrompt"),
        visual_description: text("visualDescription"),
    })
}

fn string_field(fields: &Map<String, Value>, name: &str) -> String {
    fields
        .get(name)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::config::DEFAULT_DISPLAY_PROMPT_PRECEDENCE;
    use crate::test_support::{brief_payload, ScriptedStructured};

    fn input(known: Option<Dossier>) -> DirectorInput {
        DirectorInput {
            target: ImageData::new(vec![1], "image/png"),
            style_references: vec![
                (0, ImageData::new(vec![2], "image/png")),
                (2, ImageData::new(vec![3], "image/png")),
            ],
            instruction: "She opens the door".to_string(),
            known_dossier: known,
        }
    }

    fn robot() -> Dossier {
        Dossier::new(
            "hash",
            SubjectKind::Character,
            "Robot-7",
            "boxy chassis, red visor",
            "data:image/png;base64,AA==",
        )
    }

    #[test]
    fn request_orders_subject_then_context_then_instruction() -> anyhow::Result<()> {
        let generator = Arc::new(ScriptedStructured::returning(brief_payload()));
        let director = Director::new(generator.clone(), "model-a", "Russian");
        director.analyze(&input(None), Duration::from_secs(5))?;

        let requests = generator.requests();
        let parts = &requests[0].parts;
        assert_eq!(parts.len(), 7);
        assert_eq!(parts[1].as_image().map(|image| image.bytes.clone()), Some(vec![1]));
        assert_eq!(parts[3].as_image().map(|image| image.bytes.clone()), Some(vec![2]));
        assert_eq!(parts[5].as_image().map(|image| image.bytes.clone()), Some(vec![3]));
        let GenerationPart::Text(context_label) = &parts[4] else {
            anyhow::bail!("context image should follow its label");
        };
        assert!(context_label.contains("position 2"));
        assert_eq!(parts[6].as_image(), None);
        let Some(GenerationPart::Text(instruction)) = parts.last() else {
            anyhow::bail!("last part should be text");
        };
        assert!(instruction.contains("in Russian"));
        assert!(instruction.contains("imagePrompt in English"));
        assert!(instruction.ends_with("She opens the door"));
        assert_eq!(requests[0].model, "model-a");
        assert_eq!(requests[0].schema, brief_schema());
        Ok(())
    }

    #[test]
    fn brief_fields_are_parsed() -> anyhow::Result<()> {
        let brief = parse_brief(&brief_schema(), &brief_payload())?;
        assert_eq!(brief.subject_type, None);
        assert_eq!(brief.visual_anchor_index, None);
        assert_eq!(brief.image_prompt, "cinematic wide shot of a lighthouse keeper");
        assert_eq!(brief.video_prompt, "The keeper climbs the stairs.");

        let mut payload = brief_payload();
        payload["subjectType"] = json!("character");
        payload["visualAnchorIndex"] = json!(2);
        let brief = parse_brief(&brief_schema(), &payload)?;
        assert_eq!(brief.subject_type, Some(SubjectKind::Character));
        assert_eq!(brief.visual_anchor_index, Some(2));
        Ok(())
    }

    #[test]
    fn any_missing_required_field_is_an_analysis_error() {
        for field in brief_schema().fields.iter().map(|field| field.name.clone()) {
            let mut payload = brief_payload();
            if let Some(object) = payload.as_object_mut() {
                object.remove(&field);
            }
            let err = parse_brief(&brief_schema(), &payload).err();
            assert!(
                matches!(
                    err,
                    Some(PipelineError::Analysis {
                        kind: FailureKind::Malformed,
                        ..
                    })
                ),
                "missing {field} was accepted"
            );
        }
    }

    #[test]
    fn fractional_or_negative_anchor_and_empty_prompt_are_rejected() {
        for bad in [json!(1.5), json!(-1)] {
            let mut payload = brief_payload();
            payload["visualAnchorIndex"] = bad;
            assert!(parse_brief(&brief_schema(), &payload).is_err());
        }
        let mut payload = brief_payload();
        payload["imagePrompt"] = json!("  ");
        assert!(parse_brief(&brief_schema(), &payload).is_err());
    }

    #[test]
    fn known_dossier_biases_prompt_and_pins_identity() -> anyhow::Result<()> {
        let mut payload = brief_payload();
        payload["subjectType"] = json!("object");
        payload["roleLabel"] = json!("Tin Man");
        let generator = Arc::new(ScriptedStructured::returning(payload));
        let director = Director::new(generator.clone(), "model-a", "English");
        let brief = director.analyze(&input(Some(robot())), Duration::from_secs(5))?;

        assert_eq!(brief.role_label, "Robot-7");
        assert_eq!(brief.subject_type, Some(SubjectKind::Character));
        assert_eq!(brief.subject_description, "boxy chassis, red visor");
        let requests = generator.requests();
        assert_eq!(requests[0].parts.len(), 7);
        let Some(GenerationPart::Text(instruction)) = requests[0].parts.last() else {
            anyhow::bail!("last part should be text");
        };
        assert!(instruction.contains("KNOWN SUBJECT"));
        assert!(instruction.contains("'Robot-7'"));
        Ok(())
    }

    #[test]
    fn capability_failure_maps_to_analysis_error() {
        let generator = Arc::new(ScriptedStructured::failing(
            crate::error::CapabilityError::quota("429"),
        ));
        let director = Director::new(generator, "model-a", "English");
        let err = director.analyze(&input(None), Duration::from_secs(5)).err();
        assert_eq!(
            err.and_then(|err| err.recoverable()),
            Some(crate::error::RecoverableKind::QuotaExceeded)
        );
    }

    #[test]
    fn display_prompt_follows_precedence() -> anyhow::Result<()> {
        let mut brief = parse_brief(&brief_schema(), &brief_payload())?;
        let order = DEFAULT_DISPLAY_PROMPT_PRECEDENCE;
        assert_eq!(brief.display_prompt(&order, "fallback"), "The keeper climbs the stairs.");

        brief.video_prompt = " ".to_string();
        assert_eq!(
            brief.display_prompt(&order, "fallback"),
            "A keeper on a spiral staircase."
        );

        brief.visual_description.clear();
        assert_eq!(brief.display_prompt(&order, "fallback"), "fallback");

        let reversed = [DisplayPromptSource::VisualDescription];
        brief.visual_description = "desc".to_string();
        brief.video_prompt = "video".to_string();
        assert_eq!(brief.display_prompt(&reversed, "fallback"), "desc");
        assert_eq!(brief.display_prompt(&[], "fallback"), "fallback");
        Ok(())
    }
}
