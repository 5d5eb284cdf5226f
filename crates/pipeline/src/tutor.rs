//! Learner profiles for tutoring requests.
//!
//! A profile adds a learner block to the system instructions and, for some
//! learning styles, a closing note to the answer.

use serde::{Deserialize, Serialize};

const VISUAL_NOTE: &str = "📝 *Note: Visualize these concepts as you read for better retention.*";
const HANDS_ON_NOTE: &str = "🛠️ *Tip: Try working through the examples yourself to reinforce your learning.*";

fn default_learning_style() -> String {
    "Text-Based".into()
}

fn default_background() -> String {
    "Unknown".into()
}

fn default_language() -> String {
    "English".into()
}

/// Who is asking, and how they prefer to learn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TutorProfile {
    /// Academic subject
    pub subject: String,

    /// Beginner, Intermediate, Advanced
    pub level: String,

    /// Visual, Text-Based, Hands-on
    #[serde(default = "default_learning_style")]
    pub learning_style: String,

    #[serde(default = "default_background")]
    pub background: String,

    #[serde(default = "default_language")]
    pub language: String,
}

impl TutorProfile {
    pub fn new(subject: impl Into<String>, level: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
            level: level.into(),
            learning_style: default_learning_style(),
            background: default_background(),
            language: default_language(),
        }
    }

    pub fn with_learning_style(mut self, style: impl Into<String>) -> Self {
        self.learning_style = style.into();
        self
    }

    pub fn with_background(mut self, background: impl Into<String>) -> Self {
        self.background = background.into();
        self
    }

    pub fn with_language(mut self, language: impl Into<String>) -> Self {
        self.language = language.into();
        self
    }

    /// `base` followed by the learner block.
    pub fn system_instructions(&self, base: &str) -> String {
        format!(
            "{base}\n\n\
             Subject: {subject}\n\
             Learning Level: {level}\n\
             Background Knowledge: {background}\n\
             Learning Style Preference: {style}\n\
             Language Preference: {language}\n\n\
             INSTRUCTIONS:\n\
             1. Provide a clear, educational explanation that directly addresses the question\n\
             2. Tailor your explanation to a {background} student at {level} level\n\
             3. Use {language} as the primary language\n\
             4. Format your response with appropriate markdown for readability\n\n\
             LEARNING STYLE ADAPTATIONS:\n\
             - For Visual learners: Include descriptions of visual concepts, diagrams, or mental models\n\
             - For Text-based learners: Provide clear, structured explanations with defined concepts\n\
             - For Hands-on learners: Include practical examples, exercises, or applications\n\n\
             Your explanation should be educational, accurate, and engaging.",
            subject = self.subject,
            level = self.level,
            background = self.background,
            style = self.learning_style,
            language = self.language,
        )
    }

    /// Closing note for the learning style, if it has one.
    pub fn style_note(&self) -> Option<&'static str> {
        let style: String = self
            .learning_style
            .chars()
            .filter(|c| c.is_alphanumeric())
            .collect::<String>()
            .to_lowercase();
        match style.as_str() {
            "visual" => Some(VISUAL_NOTE),
            "handson" => Some(HANDS_ON_NOTE),
            _ => None,
        }
    }

    /// The text appended to an answer: empty, or a blank line and the note.
    pub fn suffix(&self) -> String {
        self.style_note().map(|n| format!("\n\n{n}")).unwrap_or_default()
    }

    pub fn decorate(&self, answer: &str) -> String {
        format!("{answer}{}", self.suffix())
    }
}
