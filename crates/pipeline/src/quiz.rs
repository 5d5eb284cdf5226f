//! Multiple-choice quiz generation.
//!
//! The model is asked for a JSON array of questions. Output that does not
//! parse or validate is replaced by a placeholder quiz so the caller always
//! gets the requested number of well-formed questions.

use mentorlink_core::error::Error;
use mentorlink_core::provider::ModelRequest;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::context::{AssemblyInput, PromptAssembler};
use crate::invoker::ModelInvoker;

pub const MIN_QUESTIONS: usize = 1;
pub const MAX_QUESTIONS: usize = 10;
pub const DEFAULT_QUESTIONS: usize = 5;

const OPTIONS_PER_QUESTION: usize = 4;
const QUIZ_SYSTEM: &str = "You are a quiz generator.";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuizQuestion {
    pub question: String,
    pub options: Vec<String>,
    pub correct_answer: String,
    pub explanation: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Quiz {
    pub subject: String,
    pub level: String,
    pub questions: Vec<QuizQuestion>,
    /// The questions are placeholders because the model output was unusable.
    pub fallback: bool,
}

impl Quiz {
    pub fn to_html(&self) -> String {
        render_html(&self.questions)
    }
}

/// Why model output was rejected.
#[derive(Debug, thiserror::Error)]
pub enum QuizParseError {
    #[error("Quiz is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Quiz contains no questions")]
    Empty,

    #[error("Question {index} is missing `{field}`")]
    MissingField { index: usize, field: &'static str },

    #[error("Question {index} has {found} options, expected 4")]
    OptionCount { index: usize, found: usize },

    #[error("Question {index}: the correct answer is not one of the options")]
    AnswerNotAnOption { index: usize },
}

#[derive(Deserialize)]
struct RawQuestion {
    question: Option<String>,
    options: Option<Vec<String>>,
    correct_answer: Option<String>,
    explanation: Option<String>,
}

pub fn quiz_prompt(subject: &str, level: &str, num_questions: usize) -> String {
    format!(
        "Generate a quiz on the subject **{subject}** at **{level}** level.\n\n\
         Instructions:\n\
         1. Generate **{num_questions}** multiple-choice questions (MCQs).\n\
         2. Each question must have exactly 4 answer options (A, B, C, D).\n\
         3. Clearly indicate the correct answer.\n\
         4. Cover diverse aspects of {subject}.\n\n\
         FORMAT YOUR RESPONSE AS JSON:\n\
         [\n    {{\n        \"question\": \"Question text\",\n        \
         \"options\": [\"Option A\", \"Option B\", \"Option C\", \"Option D\"],\n        \
         \"correct_answer\": \"Option A\",\n        \
         \"explanation\": \"Brief explanation of why this answer is correct\"\n    }},\n    ...\n]\n\n\
         IMPORTANT:\n\
         - Make sure to return valid JSON that can be parsed.\n\
         - Do not include any text outside the JSON array.\n\
         - Include a brief explanation for each correct answer."
    )
}

/// The JSON array inside `content`, tolerating code fences and chatter.
fn json_slice(content: &str) -> &str {
    match (content.find('['), content.rfind(']')) {
        (Some(start), Some(end)) if start < end => &content[start..=end],
        _ => content.trim(),
    }
}

/// Parse and validate model output, keeping at most `num_questions`.
pub fn parse_quiz(content: &str, num_questions: usize) -> Result<Vec<QuizQuestion>, QuizParseError> {
    let raw: Vec<RawQuestion> = serde_json::from_str(json_slice(content))?;
    if raw.is_empty() {
        return Err(QuizParseError::Empty);
    }

    let mut questions = Vec::with_capacity(raw.len().min(num_questions));
    for (index, q) in raw.into_iter().enumerate() {
        let index = index + 1;
        let question = q.question.ok_or(QuizParseError::MissingField { index, field: "question" })?;
        let options = q.options.ok_or(QuizParseError::MissingField { index, field: "options" })?;
        let correct_answer = q
            .correct_answer
            .ok_or(QuizParseError::MissingField { index, field: "correct_answer" })?;

        if options.len() != OPTIONS_PER_QUESTION {
            return Err(QuizParseError::OptionCount {
                index,
                found: options.len(),
            });
        }
        if !options.contains(&correct_answer) {
            return Err(QuizParseError::AnswerNotAnOption { index });
        }

        let explanation = q
            .explanation
            .filter(|e| !e.trim().is_empty())
            .unwrap_or_else(|| format!("The correct answer is {correct_answer}."));
        questions.push(QuizQuestion {
            question,
            options,
            correct_answer,
            explanation,
        });
    }

    questions.truncate(num_questions);
    Ok(questions)
}

/// Placeholder questions used when the model output is unusable.
pub fn fallback_quiz(subject: &str, num_questions: usize) -> Vec<QuizQuestion> {
    (1..=num_questions)
        .map(|i| QuizQuestion {
            question: format!("Sample {subject} question {i}"),
            options: ["Option A", "Option B", "Option C", "Option D"]
                .into_iter()
                .map(String::from)
                .collect(),
            correct_answer: "Option A".into(),
            explanation: "This is a fallback explanation.".into(),
        })
        .collect()
}

/// Generates quizzes through the model invoker.
#[derive(Clone)]
pub struct QuizGenerator {
    invoker: ModelInvoker,
    model: String,
    temperature: f32,
    max_tokens: Option<u32>,
    assembler: PromptAssembler,
}

impl QuizGenerator {
    pub fn new(invoker: ModelInvoker, model: impl Into<String>, budget: usize) -> Self {
        Self {
            invoker,
            model: model.into(),
            temperature: 0.7,
            max_tokens: None,
            assembler: PromptAssembler::new(budget),
        }
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: Option<u32>) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub async fn generate(
        &self,
        subject: &str,
        level: &str,
        num_questions: usize,
        cancel: &CancellationToken,
    ) -> Result<Quiz, Error> {
        let subject = subject.trim();
        let level = level.trim();
        if subject.is_empty() || level.is_empty() {
            return Err(Error::Validation("subject and level are required".into()));
        }
        if !(MIN_QUESTIONS..=MAX_QUESTIONS).contains(&num_questions) {
            return Err(Error::Validation(format!(
                "num_questions must be between {MIN_QUESTIONS} and {MAX_QUESTIONS}, got {num_questions}"
            )));
        }

        let prompt = quiz_prompt(subject, level, num_questions);
        let assembled = self.assembler.assemble(&AssemblyInput {
            system_instructions: QUIZ_SYSTEM,
            history: &[],
            fragments: &[],
            query: &prompt,
        })?;
        let request = ModelRequest::new(&self.model, assembled.messages, self.assembler.budget())
            .with_temperature(self.temperature)
            .with_max_tokens(self.max_tokens);

        let completion = self.invoker.complete(request, cancel).await?;

        let (questions, fallback) = match parse_quiz(&completion.text, num_questions) {
            Ok(questions) => (questions, false),
            Err(e) => {
                warn!(subject, error = %e, "Unusable quiz from model, using fallback quiz");
                (fallback_quiz(subject, num_questions), true)
            }
        };
        info!(subject, level, questions = questions.len(), fallback, "Quiz generated");

        Ok(Quiz {
            subject: subject.to_string(),
            level: level.to_string(),
            questions,
            fallback,
        })
    }
}

// ── HTML ──────────────────────────────────────────────────────────────────

fn escape_html(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

const HTML_HEAD: &str = r#"<html>
<head>
    <meta charset="utf-8">
    <style>
        body { font-family: 'Segoe UI', Tahoma, Geneva, Verdana, sans-serif; background-color: #f2f4f8; color: #333; padding: 20px; }
        .quiz-card { background-color: #fff; border-radius: 12px; box-shadow: 0 4px 10px rgba(0,0,0,0.1); margin: 20px auto; padding: 20px; max-width: 700px; transition: transform 0.3s; }
        .quiz-card:hover { transform: scale(1.01); }
        .question { font-size: 18px; font-weight: bold; }
        .option { padding: 10px 14px; margin: 8px 0; border-radius: 8px; border: 1px solid #ccc; cursor: pointer; transition: background-color 0.3s, transform 0.2s; }
        .option:hover { background-color: #f0f0f0; transform: scale(1.02); }
        .selected-correct { background-color: #c8f7c5; border-color: #28a745; font-weight: bold; }
        .selected-incorrect { background-color: #f8d7da; border-color: #dc3545; }
        .answer { margin-top: 12px; padding: 12px; background-color: #e9ecef; border-left: 5px solid #007bff; display: none; border-radius: 8px; }
    </style>
    <script>
        function handleAnswerSelection(isCorrect, selectedOption, questionNum) {
            if (isCorrect) {
                selectedOption.className += ' selected-correct';
            } else {
                selectedOption.className += ' selected-incorrect';
                revealAnswer(questionNum);
            }
        }

        function revealAnswer(questionNum) {
            const answerDiv = document.getElementById("answer-" + questionNum);
            answerDiv.style.display = 'block';
            answerDiv.scrollIntoView({ behavior: 'smooth', block: 'nearest' });
            answerDiv.animate([
                { transform: 'scale(1.05)', opacity: 1 },
                { transform: 'scale(1)', opacity: 1 }
            ], { duration: 800, iterations: 1 });
        }
    </script>
</head>
<body>
<h2>🧠 Interactive Quiz</h2>
"#;

/// Interactive HTML: clicking a wrong option reveals the answer card.
pub fn render_html(questions: &[QuizQuestion]) -> String {
    let mut html = String::from(HTML_HEAD);
    for (i, q) in questions.iter().enumerate() {
        let n = i + 1;
        html.push_str(&format!(
            "<div class='quiz-card'>\n    <div class='question'>Q{n}: {}</div>\n    <div class='options'>\n",
            escape_html(&q.question)
        ));
        for option in &q.options {
            let is_correct = *option == q.correct_answer;
            html.push_str(&format!(
                "        <div class='option' onclick=\"handleAnswerSelection({is_correct}, this, {n})\">{}</div>\n",
                escape_html(option)
            ));
        }
        html.push_str(&format!(
            "    </div>\n    <div class='answer' id='answer-{n}'>\n        \
             <strong>✅ Correct Answer:</strong> {}<br>\n        \
             <em>💡 Explanation:</em> {}\n    </div>\n</div>\n",
            escape_html(&q.correct_answer),
            escape_html(&q.explanation)
        ));
    }
    html.push_str("</body>\n</html>\n");
    html
}
