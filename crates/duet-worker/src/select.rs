//! Backend and model selection. Pure: no I/O, no state.

use duet_backend::Backend;
use duet_types::config::SelectionConfig;

/// The backend/model pair chosen for one prompt.
#[derive(Debug, Clone)]
pub struct Selection<'a> {
    pub backend: &'a Backend,
    pub model: Option<String>,
    /// The prompt with any leading `@backend` tag removed.
    pub prompt: String,
    pub deep: bool,
}

/// Pick a backend for `text`.
///
/// A leading `@name` tag naming a known backend wins, then the conversation's
/// override, then the configured default, then the first backend. Returns
/// `None` only when there are no backends at all.
pub fn select_backend<'a>(
    text: &str,
    conversation_override: Option<&str>,
    backends: &'a [Backend],
    config: &SelectionConfig,
) -> Option<Selection<'a>> {
    let find = |name: &str| backends.iter().find(|b| b.name().eq_ignore_ascii_case(name));

    let (tagged, prompt) = match split_tag(text) {
        Some((tag, rest)) => match find(tag) {
            Some(backend) => (Some(backend), rest),
            None => (None, text.trim()),
        },
        None => (None, text.trim()),
    };

    let backend = tagged
        .or_else(|| conversation_override.and_then(find))
        .or_else(|| find(&config.default_backend))
        .or_else(|| backends.first())?;

    let deep = is_complex(prompt, config.complex_threshold);
    Some(Selection {
        backend,
        model: backend.model_for(deep).map(str::to_string),
        prompt: prompt.to_string(),
        deep,
    })
}

/// Long prompts and prompts carrying code get the deeper model.
pub fn is_complex(prompt: &str, threshold: usize) -> bool {
    prompt.contains("```") || prompt.chars().count() >= threshold
}

fn split_tag(text: &str) -> Option<(&str, &str)> {
    let rest = text.trim_start().strip_prefix('@')?;
    let (tag, prompt) = rest.split_once(char::is_whitespace).unwrap_or((rest, ""));
    if tag.is_empty() {
        return None;
    }
    Some((tag, prompt.trim()))
}
