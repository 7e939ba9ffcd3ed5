//! Scripted generators shared by the engine's unit tests.

use std::sync::Mutex;
use std::thread;
use std::time::Duration;

use serde_json::{json, Value};
use storyboard_contracts::media::ImageData;

use crate::capability::{
    ImageGenerator, ImageRequest, ImageResponse, ResponsePart, StructuredGenerator,
    StructuredRequest,
};
use crate::error::CapabilityError;

pub fn brief_payload() -> Value {
    json!({
        "worldContext": "A storm-beaten lighthouse, 1920s, ink and watercolor.",
        "subjectType": "none",
        "roleLabel": "Keeper",
        "subjectDescription": "Gray beard, oilskin coat.",
        "transformation": "Drawn in ink wash, climbing the tower stairs.",
        "narrativeRationale": "He goes up to relight the lamp.",
        "visualAnchorIndex": null,
        "imagePrompt": "cinematic wide shot of a lighthouse keeper",
        "videoPrompt": "The keeper climbs the stairs.",
        "visualDescription": "A keeper on a spiral staircase.",
    })
}

pub fn png(marker: u8) -> ImageData {
    ImageData::new(vec![0x89, b'P', b'N', b'G', marker], "image/png")
}

pub struct ScriptedStructured {
    reply: Result<Value, CapabilityError>,
    delay: Option<Duration>,
    requests: Mutex<Vec<StructuredRequest>>,
}

impl ScriptedStructured {
    pub fn returning(payload: Value) -> Self {
        Self {
            reply: Ok(payload),
            delay: None,
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn failing(err: CapabilityError) -> Self {
        Self {
            reply: Err(err),
            delay: None,
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn requests(&self) -> Vec<StructuredRequest> {
        self.requests
            .lock()
            .map(|requests| requests.clone())
            .unwrap_or_default()
    }
}

impl StructuredGenerator for ScriptedStructured {
    fn name(&self) -> &str {
        "scripted"
    }

    fn generate_structured(&self, request: &StructuredRequest) -> Result<Value, CapabilityError> {
        if let Ok(mut requests) = self.requests.lock() {
            requests.push(request.clone());
        }
        if let Some(delay) = self.delay {
            thread::sleep(delay);
        }
        self.reply.clone()
    }
}

pub struct ScriptedImage {
    reply: Result<ImageResponse, CapabilityError>,
    delay: Option<Duration>,
    requests: Mutex<Vec<ImageRequest>>,
}

impl ScriptedImage {
    pub fn returning(image: ImageData) -> Self {
        Self::responding(ImageResponse {
            parts: vec![
                ResponsePart::Text("Here is the frame.".to_string()),
                ResponsePart::InlineImage(image),
            ],
        })
    }

    pub fn responding(response: ImageResponse) -> Self {
        Self {
            reply: Ok(response),
            delay: None,
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn failing(err: CapabilityError) -> Self {
        Self {
            reply: Err(err),
            delay: None,
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn requests(&self) -> Vec<ImageRequest> {
        self.requests
            .lock()
            .map(|requests| requests.clone())
            .unwrap_or_default()
    }
}

impl ImageGenerator for ScriptedImage {
    fn name(&self) -> &str {
        "scripted"
    }

    fn generate_image(&self, request: &ImageRequest) -> Result<ImageResponse, CapabilityError> {
        if let Ok(mut requests) = self.requests.lock() {
            requests.push(request.clone());
        }
        if let Some(delay) = self.delay {
            thread::sleep(delay);
        }
        self.reply.clone()
    }
}
