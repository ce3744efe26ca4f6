//! Markup collaborator.
//!
//! Rendering rich markup into its plain-text and presentation forms is the
//! job of a dedicated renderer; the filters only consume the result.

use crate::error::Result;

/// The two representations of one logical message.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RenderedMessage {
    pub text: Option<String>,
    pub presentation_ml: Option<String>,
}

impl RenderedMessage {
    pub fn new(text: impl Into<String>, presentation_ml: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            presentation_ml: Some(presentation_ml.into()),
        }
    }
}

pub trait MarkupRenderer: Send + Sync {
    fn render(&self, markup: &str) -> Result<RenderedMessage>;
}

/// Handles flat `<messageML>` content: the wrapper becomes a PresentationML
/// `div`, and the text form is the content with tags dropped.
#[derive(Debug, Default, Clone, Copy)]
pub struct BasicMarkupRenderer;

const ROOT_OPEN: &str = "<messageML>";
const ROOT_CLOSE: &str = "</messageML>";

impl MarkupRenderer for BasicMarkupRenderer {
    fn render(&self, markup: &str) -> Result<RenderedMessage> {
        let trimmed = markup.trim();
        let inner = trimmed
            .strip_prefix(ROOT_OPEN)
            .and_then(|rest| rest.strip_suffix(ROOT_CLOSE))
            .unwrap_or(trimmed);

        let presentation =
            format!(r#"<div data-format="PresentationML" data-version="2.0">{inner}</div>"#);
        Ok(RenderedMessage::new(unescape(&strip_tags(inner)), presentation))
    }
}

fn strip_tags(markup: &str) -> String {
    let mut out = String::with_capacity(markup.len());
    let mut in_tag = false;
    for c in markup.chars() {
        match c {
            '<' => in_tag = true,
            '>' if in_tag => in_tag = false,
            _ if !in_tag => out.push(c),
            _ => {}
        }
    }
    out
}

fn unescape(text: &str) -> String {
    text.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_message_ml_into_text_and_presentation() {
        let rendered = BasicMarkupRenderer
            .render("<messageML>Hello <b>world</b> &amp; co</messageML>")
            .unwrap();
        assert_eq!(rendered.text.as_deref(), Some("Hello world & co"));
        assert_eq!(
            rendered.presentation_ml.as_deref(),
            Some(r#"<div data-format="PresentationML" data-version="2.0">Hello <b>world</b> &amp; co</div>"#)
        );
    }
}
