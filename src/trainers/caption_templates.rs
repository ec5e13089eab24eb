//! Training captions carrying the placeholder token strings

use rand::rngs::StdRng;
use rand::seq::SliceRandom;

use crate::embeddings::ConceptTokens;

pub const OBJECT_TEMPLATES: &[&str] = &[
    "a photo of a {}",
    "a rendering of a {}",
    "a cropped photo of the {}",
    "the photo of a {}",
    "a photo of a clean {}",
    "a photo of a dirty {}",
    "a dark photo of the {}",
    "a photo of my {}",
    "a photo of the cool {}",
    "a close-up photo of a {}",
    "a bright photo of the {}",
    "a cropped photo of a {}",
    "a photo of the {}",
    "a good photo of the {}",
    "a photo of one {}",
    "a close-up photo of the {}",
    "a rendition of the {}",
    "a photo of the clean {}",
    "a rendition of a {}",
    "a photo of a nice {}",
    "a good photo of a {}",
    "a photo of the nice {}",
    "a photo of the small {}",
    "a photo of the weird {}",
    "a photo of the large {}",
    "a photo of a cool {}",
    "a photo of a small {}",
];

pub const STYLE_TEMPLATES: &[&str] = &[
    "a painting in the style of {}",
    "a rendering in the style of {}",
    "a cropped painting in the style of {}",
    "the painting in the style of {}",
    "a clean painting in the style of {}",
    "a dirty painting in the style of {}",
    "a dark painting in the style of {}",
    "a picture in the style of {}",
    "a cool painting in the style of {}",
    "a close-up painting in the style of {}",
    "a bright painting in the style of {}",
    "a cropped painting in the style of {}",
    "a good painting in the style of {}",
    "a close-up painting in the style of {}",
    "a rendition in the style of {}",
    "a nice painting in the style of {}",
    "a small painting in the style of {}",
    "a weird painting in the style of {}",
    "a large painting in the style of {}",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TemplateKind {
    Object,
    Style,
}

impl TemplateKind {
    /// The object flag wins when both are set
    pub fn from_flags(use_object_template: bool, use_style_template: bool) -> Option<Self> {
        if use_object_template {
            Some(TemplateKind::Object)
        } else if use_style_template {
            Some(TemplateKind::Style)
        } else {
            None
        }
    }

    pub fn templates(self) -> &'static [&'static str] {
        match self {
            TemplateKind::Object => OBJECT_TEMPLATES,
            TemplateKind::Style => STYLE_TEMPLATES,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Replacement {
    /// The whole caption becomes one of these, picked at random
    All(Vec<String>),
    Substring { from: String, to: String },
}

/// Rewrites dataset captions so they mention every placeholder token
#[derive(Debug, Clone, Default)]
pub struct CaptionTemplater {
    replacements: Vec<Replacement>,
    prompt_replacement: Option<(String, String)>,
}

impl CaptionTemplater {
    pub fn new(tokens: &ConceptTokens, template: Option<TemplateKind>) -> Self {
        let token_string = tokens.strings()[0].clone();
        let joined = tokens.joined();
        let multi = tokens.len() > 1;

        let mut replacements = Vec::new();
        if let Some(kind) = template {
            let captions = kind
                .templates()
                .iter()
                .map(|t| t.replace("{}", &joined))
                .collect();
            replacements.push(Replacement::All(captions));
        } else if multi {
            replacements.push(Replacement::Substring {
                from: token_string.clone(),
                to: joined.clone(),
            });
        }

        Self {
            replacements,
            prompt_replacement: multi.then_some((token_string, joined)),
        }
    }

    pub fn replacements(&self) -> &[Replacement] {
        &self.replacements
    }

    /// `(token_string, joined token strings)` for prompts written by users
    pub fn prompt_replacement(&self) -> Option<(&str, &str)> {
        self.prompt_replacement
            .as_ref()
            .map(|(from, to)| (from.as_str(), to.as_str()))
    }

    pub fn apply(&self, caption: &str, rng: &mut StdRng) -> String {
        let mut caption = caption.to_string();
        for replacement in &self.replacements {
            match replacement {
                Replacement::All(choices) => {
                    if let Some(choice) = choices.choose(rng) {
                        caption = choice.clone();
                    }
                }
                Replacement::Substring { from, to } => {
                    caption = caption.replace(from.as_str(), to);
                }
            }
        }
        caption
    }
}
