use regex::{Regex, RegexBuilder};
use tracing::warn;

use crate::config::FilterConfig;

const URL_REPLACEMENT: &str = "[URL REMOVED]";

/// Masks banned words and optionally strips links from text shown on stream.
#[derive(Debug, Clone)]
pub struct TextFilter {
    banwords: Vec<(Regex, String)>,
    urls: Option<Regex>,
}

impl TextFilter {
    pub fn new(config: &FilterConfig) -> Self {
        let banwords = config
            .banwords
            .iter()
            .map(|word| word.trim())
            .filter(|word| !word.is_empty())
            .filter_map(|word| {
                match RegexBuilder::new(&regex::escape(word))
                    .case_insensitive(true)
                    .build()
                {
                    Ok(pattern) => Some((pattern, "*".repeat(word.chars().count()))),
                    Err(e) => {
                        warn!(word = %word, error = %e, "Skipping banword");
                        None
                    }
                }
            })
            .collect();

        let urls = if config.filter_urls {
            Regex::new(r"https?://\S+|www\.\S+").ok()
        } else {
            None
        };

        Self { banwords, urls }
    }

    pub fn disabled() -> Self {
        Self {
            banwords: Vec::new(),
            urls: None,
        }
    }

    pub fn apply(&self, text: &str) -> String {
        let mut filtered = text.to_string();
        // Links first, so a banword inside a URL does not leave half a link behind.
        if let Some(urls) = &self.urls {
            filtered = urls.replace_all(&filtered, URL_REPLACEMENT).into_owned();
        }
        for (pattern, mask) in &self.banwords {
            filtered = pattern.replace_all(&filtered, mask.as_str()).into_owned();
        }
        filtered
    }
}
