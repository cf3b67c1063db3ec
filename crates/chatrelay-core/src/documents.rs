#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DocumentTask {
    Summarize,
    Quiz,
    Keywords,
    /// Any other task name; the document text itself becomes the prompt.
    Passthrough(String),
}

impl DocumentTask {
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "summarize" | "summary" => Self::Summarize,
            "quiz" => Self::Quiz,
            "keywords" => Self::Keywords,
            _ => Self::Passthrough(raw.trim().to_string()),
        }
    }

    pub fn prompt(&self, text: &str) -> String {
        match self {
            Self::Summarize => format!(
                "You are an expert at summarizing documents. Write a concise summary of the \
                 following text that highlights its main ideas, key arguments and conclusions.\n\n\
                 Text:\n\"\"\"{text}\"\"\""
            ),
            Self::Quiz => format!(
                "You are a teacher. Based on the following document, write a test with 5 \
                 multiple-choice questions (options A, B, C and D, with the correct option marked \
                 with *) and 3 open-ended essay questions that check the reader's understanding.\n\n\
                 Document:\n\"\"\"{text}\"\"\""
            ),
            Self::Keywords => format!(
                "You are a semantic analysis engine. Extract the 10-15 most important keywords or \
                 key phrases that represent the main content of the following text. Return them \
                 as a bulleted list.\n\nText:\n\"\"\"{text}\"\"\""
            ),
            Self::Passthrough(_) => text.to_string(),
        }
    }
}
