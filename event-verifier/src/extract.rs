use crate::fetcher::PageCache;
use crate::types::{Candidate, PageFetcher, Result, VerifierError};
use once_cell::sync::Lazy;
use regex::Regex;
use scraper::{ElementRef, Html, Node, Selector};
use tracing::{debug, info, warn};

/// Elements whose text never counts as article content.
const SKIPPED_ELEMENTS: &[&str] = &["script", "style", "nav", "header", "footer", "aside", "noscript"];

const CONTENT_SELECTORS: &[&str] = &[
    "article",
    "[class*=\"article\"]",
    "[class*=\"content\"]",
    "[class*=\"post\"]",
    "[class*=\"story\"]",
    "[class*=\"news\"]",
    "[class*=\"text\"]",
    "[class*=\"body\"]",
    "[id*=\"article\"]",
    "[id*=\"content\"]",
    "[id*=\"post\"]",
    "[id*=\"story\"]",
    "[id*=\"news\"]",
    "[id*=\"text\"]",
    "[id*=\"body\"]",
    ".article-content",
    ".post-content",
    ".news-content",
    ".content-body",
    ".article-body",
    ".main-content",
    ".text-content",
    ".entry-content",
    ".post-body",
    ".article-text",
    ".story-body",
    ".content-wrapper",
    "main",
    ".main",
    "#main",
];

static SELECTORS: Lazy<Vec<Selector>> = Lazy::new(|| {
    CONTENT_SELECTORS
        .iter()
        .filter_map(|css| match Selector::parse(css) {
            Ok(selector) => Some(selector),
            Err(e) => {
                warn!("Skipping content selector {}: {:?}", css, e);
                None
            }
        })
        .collect()
});

static PARAGRAPH: Lazy<Option<Selector>> = Lazy::new(|| Selector::parse("p").ok());
static BODY: Lazy<Option<Selector>> = Lazy::new(|| Selector::parse("body").ok());

static BOILERPLATE: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"广告|推广|(?i)\b(?:advertisement|ad)\b",
        r"点击查看|查看更多|阅读全文|(?i)\bread more\b",
        r"分享到|转发|(?i)\b(?:share|forward)\b",
        r"评论|留言|(?i)\bcomments?\b",
        r"订阅|关注|(?i)\bsubscribe\b",
        r"版权所有|(?i)\bcopyright\b|(?i)\ball rights reserved\b",
        r"免责声明|(?i)\bdisclaimer\b",
        r"相关阅读|相关新闻|(?i)\brelated\b",
        r"热门推荐|推荐阅读|(?i)\brecommended\b",
    ]
    .iter()
    .filter_map(|pattern| Regex::new(pattern).ok())
    .collect()
});

/// Thresholds of the extraction cascade, counted in characters.
#[derive(Debug, Clone)]
pub struct ExtractionLimits {
    /// A selector match must exceed this to be taken as the article.
    pub container_min_chars: usize,
    /// Paragraphs shorter than this are ignored.
    pub paragraph_min_chars: usize,
    /// Below this, the paragraph join is replaced by the whole body text.
    pub paragraph_join_min_chars: usize,
    /// Cleaned text shorter than this does not count as extracted.
    pub accept_min_chars: usize,
}

impl Default for ExtractionLimits {
    fn default() -> Self {
        Self {
            container_min_chars: 200,
            paragraph_min_chars: 20,
            paragraph_join_min_chars: 100,
            accept_min_chars: 50,
        }
    }
}

/// Step 5: article body extraction from raw HTML.
#[derive(Debug, Clone, Default)]
pub struct ContentExtractor {
    limits: ExtractionLimits,
}

fn char_len(text: &str) -> usize {
    text.trim().chars().count()
}

/// Text of an element, ignoring script, style and navigation chrome.
fn visible_text(element: ElementRef<'_>) -> String {
    if SKIPPED_ELEMENTS.contains(&element.value().name()) {
        return String::new();
    }
    let mut text = String::new();
    for node in element.descendants() {
        if let Node::Text(fragment) = node.value() {
            let skipped = node.ancestors().any(|ancestor| {
                ancestor
                    .value()
                    .as_element()
                    .map(|parent| SKIPPED_ELEMENTS.contains(&parent.name()))
                    .unwrap_or(false)
            });
            if !skipped {
                text.push_str(fragment);
            }
        }
    }
    text
}

impl ContentExtractor {
    pub fn new(limits: ExtractionLimits) -> Self {
        Self { limits }
    }

    /// Pick the raw article text out of a page, before cleaning.
    fn raw_article_text(&self, document: &Html) -> String {
        for selector in SELECTORS.iter() {
            let best = document
                .select(selector)
                .map(visible_text)
                .max_by_key(|text| char_len(text));
            if let Some(text) = best {
                if char_len(&text) > self.limits.container_min_chars {
                    return text;
                }
            }
        }

        let mut extracted = String::new();
        if let Some(paragraph) = PARAGRAPH.as_ref() {
            let meaningful: Vec<String> = document
                .select(paragraph)
                .map(visible_text)
                .filter(|text| char_len(text) > self.limits.paragraph_min_chars)
                .collect();
            extracted = meaningful.join("\n");
        }

        if char_len(&extracted) < self.limits.paragraph_join_min_chars {
            if let Some(body) = BODY.as_ref().and_then(|selector| document.select(selector).next()) {
                extracted = visible_text(body);
            }
        }

        extracted
    }

    /// Cleaned article text of a page; empty when nothing usable was found.
    pub fn extract_text(&self, html: &str) -> String {
        if html.trim().is_empty() {
            return String::new();
        }
        let document = Html::parse_document(html);
        clean_text(&self.raw_article_text(&document))
    }

    /// Replace the candidate body with extracted text when it is long enough.
    ///
    /// Returns whether extraction succeeded. On failure the body is reset to
    /// the search snippet.
    pub fn apply(&self, candidate: &mut Candidate, html: &str) -> bool {
        let text = self.extract_text(html);
        if text.chars().count() >= self.limits.accept_min_chars {
            candidate.body = text;
            candidate.extracted = true;
        } else {
            debug!("Extraction for {} too short ({} chars), keeping snippet", candidate.id, text.chars().count());
            candidate.body = candidate.snippet.clone();
            candidate.extracted = false;
        }
        candidate.extracted
    }

    /// Extract every candidate from the downloaded pages.
    ///
    /// Pages absent from the cache are fetched live, unless the download step
    /// already recorded them as failed; those keep their snippet. A missing
    /// cache means the download step never ran, which only happens when this
    /// is called directly rather than from the pipeline.
    pub async fn extract_all(&self, candidates: &mut [Candidate], cache: Option<&PageCache>, fetcher: &dyn PageFetcher) -> Result<usize> {
        let cache = cache.ok_or_else(|| VerifierError::MissingArtifact("downloaded pages".to_string()))?;
        let mut extracted = 0;

        for candidate in candidates.iter_mut() {
            let html = match cache.get(candidate.id) {
                Some(html) => html.to_string(),
                None if cache.has_failed(candidate.id) => String::new(),
                None => match fetcher.get(&candidate.url).await {
                    Ok(html) => html,
                    Err(e) => {
                        warn!("Live fetch for {} ({}) failed: {}", candidate.id, candidate.url, e);
                        String::new()
                    }
                },
            };

            if self.apply(candidate, &html) {
                extracted += 1;
            }
        }

        info!("Extracted article text for {} of {} candidates", extracted, candidates.len());
        Ok(extracted)
    }
}

fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Collapse whitespace and strip boilerplate phrases.
pub fn clean_text(text: &str) -> String {
    if text.trim().is_empty() {
        return String::new();
    }
    let mut cleaned = collapse_whitespace(text);
    for pattern in BOILERPLATE.iter() {
        cleaned = pattern.replace_all(&cleaned, "").into_owned();
    }
    collapse_whitespace(&cleaned)
}
