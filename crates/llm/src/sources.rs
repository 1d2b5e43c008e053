use std::collections::HashSet;

use serde::{Deserialize, Serialize};

/// A citation attached to an assistant reply during streaming.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ChatSource {
    Url {
        id: String,
        url: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        title: Option<String>,
    },
    Document {
        id: String,
        #[serde(rename = "mediaType")]
        media_type: String,
        title: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        filename: Option<String>,
    },
}

impl ChatSource {
    /// Composite identity key: URL for link sources, media-type + filename +
    /// title for document sources. Ids are deliberately excluded so the same
    /// citation re-announced under a new id still dedupes.
    pub fn dedup_key(&self) -> String {
        match self {
            Self::Url { url, .. } => format!("url:{url}"),
            Self::Document {
                media_type,
                title,
                filename,
                ..
            } => format!(
                "document:{media_type}:{}:{title}",
                filename.as_deref().unwrap_or_default()
            ),
        }
    }
}

/// Removes repeated citations, keeping first occurrence order.
pub fn dedupe_sources(sources: Vec<ChatSource>) -> Vec<ChatSource> {
    let mut seen = HashSet::new();
    sources
        .into_iter()
        .filter(|source| seen.insert(source.dedup_key()))
        .collect()
}

/// Strips runs of trailing `[label](url)` markdown links that duplicate
/// cited URL sources. A single trailing link is left alone; two or more are
/// treated as an appended link dump and removed.
pub fn strip_trailing_source_links(text: &str, sources: &[ChatSource]) -> String {
    let urls: HashSet<&str> = sources
        .iter()
        .filter_map(|source| match source {
            ChatSource::Url { url, .. } => Some(url.as_str()),
            ChatSource::Document { .. } => None,
        })
        .collect();
    if urls.is_empty() {
        return text.to_string();
    }

    let mut working = text.trim_end();
    let mut stripped_count = 0;

    while let Some((rest, url)) = split_trailing_markdown_link(working) {
        if !urls.contains(url) {
            break;
        }
        stripped_count += 1;
        working = rest.trim_end();
    }

    if stripped_count >= 2 {
        working.to_string()
    } else {
        text.to_string()
    }
}

/// Splits `.. [label](url)` off the end of `text`, returning the remainder
/// and the url. None when the text does not end with a markdown link.
fn split_trailing_markdown_link(text: &str) -> Option<(&str, &str)> {
    let trimmed = text.trim_end();
    let without_paren = trimmed.strip_suffix(')')?;
    let open_paren = without_paren.rfind('(')?;
    let url = &without_paren[open_paren + 1..];
    if url.is_empty() || url.contains(')') {
        return None;
    }

    let before_paren = &without_paren[..open_paren];
    let without_bracket = before_paren.strip_suffix(']')?;
    let open_bracket = without_bracket.rfind('[')?;
    let label = &without_bracket[open_bracket + 1..];
    if label.is_empty() || label.contains(']') {
        return None;
    }

    Some((&without_bracket[..open_bracket], url))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url_source(id: &str, url: &str) -> ChatSource {
        ChatSource::Url {
            id: id.to_string(),
            url: url.to_string(),
            title: None,
        }
    }

    #[test]
    fn dedupes_url_sources_by_url_not_id() {
        let sources = vec![
            url_source("s1", "https://a.example"),
            url_source("s2", "https://a.example"),
            url_source("s3", "https://b.example"),
        ];

        let deduped = dedupe_sources(sources);
        assert_eq!(deduped.len(), 2);
        assert!(matches!(&deduped[0], ChatSource::Url { id, .. } if id == "s1"));
    }

    #[test]
    fn dedupes_document_sources_by_composite_key() {
        let first = ChatSource::Document {
            id: "d1".to_string(),
            media_type: "application/pdf".to_string(),
            title: "Report".to_string(),
            filename: Some("report.pdf".to_string()),
        };
        let duplicate = ChatSource::Document {
            id: "d2".to_string(),
            media_type: "application/pdf".to_string(),
            title: "Report".to_string(),
            filename: Some("report.pdf".to_string()),
        };
        let different_title = ChatSource::Document {
            id: "d3".to_string(),
            media_type: "application/pdf".to_string(),
            title: "Appendix".to_string(),
            filename: Some("report.pdf".to_string()),
        };

        let deduped = dedupe_sources(vec![first, duplicate, different_title]);
        assert_eq!(deduped.len(), 2);
    }

    #[test]
    fn strips_a_run_of_trailing_cited_links() {
        let sources = vec![
            url_source("s1", "https://a.example"),
            url_source("s2", "https://b.example"),
        ];
        let text = "The answer.\n\n[A](https://a.example) [B](https://b.example)";

        assert_eq!(strip_trailing_source_links(text, &sources), "The answer.");
    }

    #[test]
    fn keeps_a_single_trailing_link() {
        let sources = vec![url_source("s1", "https://a.example")];
        let text = "See [A](https://a.example)";

        assert_eq!(strip_trailing_source_links(text, &sources), text);
    }

    #[test]
    fn keeps_links_that_are_not_cited() {
        let sources = vec![url_source("s1", "https://a.example")];
        let text = "x [A](https://a.example) [Other](https://other.example)";

        assert_eq!(strip_trailing_source_links(text, &sources), text);
    }
}
