//! Default prompt templates for LLM usage.

/// Directive appended after the conversation when asking for a standalone search query.
pub const REPHRASE_DIRECTIVE: &str = "Given the conversation above, write a search query that would find the information needed to answer the last message. Respond with the query only.";

/// System directive for the answer generator.
///
/// The retrieved passages are appended below this directive.
pub const ANSWER_DIRECTIVE: &str = "Answer using only the context below.";

/// Separator placed between retrieved passages when they are stuffed into the system prompt.
pub const PASSAGE_SEPARATOR: &str = "\n\n";

/// Default in-progress marker appended to partial answers.
pub const TYPING_MARKER: &str = "\n\nTyping...";
