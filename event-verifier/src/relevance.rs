use crate::types::{Candidate, Language};
use once_cell::sync::Lazy;
use std::collections::HashMap;
use tracing::{debug, info};

/// Additive weights of the relevance heuristic.
#[derive(Debug, Clone, PartialEq)]
pub struct RelevanceWeights {
    pub title_exact: f64,
    pub body_exact: f64,
    pub title_window: f64,
    pub body_window: f64,
    pub title_synonym: f64,
    pub body_synonym: f64,
    pub cjk_bonus: f64,
    pub latin_bonus: f64,
}

impl Default for RelevanceWeights {
    fn default() -> Self {
        Self {
            title_exact: 50.0,
            body_exact: 30.0,
            title_window: 10.0,
            body_window: 5.0,
            title_synonym: 15.0,
            body_synonym: 8.0,
            cjk_bonus: 5.0,
            latin_bonus: 3.0,
        }
    }
}

static DEFAULT_SYNONYMS: Lazy<HashMap<String, Vec<String>>> = Lazy::new(|| {
    let table: &[(&str, &[&str])] = &[
        ("英伟达", &["NVIDIA", "GPU", "RTX", "GeForce", "显卡", "芯片"]),
        ("NVIDIA", &["英伟达", "GPU", "RTX", "GeForce", "显卡", "芯片"]),
        ("OpenAI", &["ChatGPT", "GPT", "AI", "人工智能", "Sora", "DALL-E"]),
        ("ChatGPT", &["OpenAI", "GPT", "AI", "人工智能", "聊天机器人"]),
        ("人工智能", &["AI", "ChatGPT", "OpenAI", "机器学习", "深度学习", "神经网络"]),
        ("AI", &["人工智能", "ChatGPT", "OpenAI", "机器学习", "深度学习"]),
        ("苹果", &["Apple", "iPhone", "iPad", "Mac", "iOS", "macOS"]),
        ("Apple", &["苹果", "iPhone", "iPad", "Mac", "iOS", "macOS"]),
        ("特斯拉", &["Tesla", "Model", "电动车", "马斯克", "Musk"]),
        ("Tesla", &["特斯拉", "Model", "电动车", "马斯克", "Musk"]),
        ("唐家三少", &["张威", "网络小说", "网文", "作家", "斗罗大陆", "绝世唐门", "神印王座", "起点中文网"]),
        ("张威", &["唐家三少", "网络小说", "网文", "作家"]),
    ];
    table
        .iter()
        .map(|(key, terms)| (key.to_lowercase(), terms.iter().map(|t| t.to_string()).collect()))
        .collect()
});

fn is_cjk(c: char) -> bool {
    ('\u{4e00}'..='\u{9fff}').contains(&c)
}

fn is_kana(c: char) -> bool {
    ('\u{3040}'..='\u{30ff}').contains(&c)
}

fn is_hangul(c: char) -> bool {
    ('\u{ac00}'..='\u{d7af}').contains(&c)
}

/// Classify text by the first script class present, checked in priority order.
pub fn detect_language(text: &str) -> Language {
    if text.chars().any(is_cjk) {
        Language::Zh
    } else if text.chars().any(is_kana) {
        Language::Ja
    } else if text.chars().any(is_hangul) {
        Language::Ko
    } else if text.chars().any(|c| c.is_ascii_alphabetic()) {
        Language::En
    } else {
        Language::Other
    }
}

/// Step 3: heuristic ranking of candidates against the query.
pub struct RelevanceRanker {
    weights: RelevanceWeights,
    synonyms: HashMap<String, Vec<String>>,
    limit: usize,
}

impl RelevanceRanker {
    pub fn new(limit: usize) -> Self {
        Self {
            weights: RelevanceWeights::default(),
            synonyms: DEFAULT_SYNONYMS.clone(),
            limit,
        }
    }

    pub fn with_weights(mut self, weights: RelevanceWeights) -> Self {
        self.weights = weights;
        self
    }

    /// Add or replace the related terms for one query.
    pub fn with_synonyms(mut self, query: &str, terms: &[&str]) -> Self {
        self.synonyms.insert(query.to_lowercase(), terms.iter().map(|t| t.to_string()).collect());
        self
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    fn related_terms(&self, query: &str) -> &[String] {
        self.synonyms
            .get(&query.trim().to_lowercase())
            .map(|terms| terms.as_slice())
            .unwrap_or(&[])
    }

    /// Additive relevance of one title/body pair. Never negative.
    pub fn score(&self, query: &str, title: &str, body: &str) -> f64 {
        let w = &self.weights;
        let query_lower = query.to_lowercase();
        let title_lower = title.to_lowercase();
        let body_lower = body.to_lowercase();
        let mut score = 0.0;

        if title_lower.contains(&query_lower) {
            score += w.title_exact;
        }
        if body_lower.contains(&query_lower) {
            score += w.body_exact;
        }

        let query_chars: Vec<char> = query_lower.chars().collect();
        if query_chars.len() > 2 {
            for window in query_chars.windows(2) {
                let pair: String = window.iter().collect();
                if title_lower.contains(&pair) {
                    score += w.title_window;
                    break;
                } else if body_lower.contains(&pair) {
                    score += w.body_window;
                    break;
                }
            }
        }

        for term in self.related_terms(query) {
            let term_lower = term.to_lowercase();
            if title_lower.contains(&term_lower) {
                score += w.title_synonym;
            } else if body_lower.contains(&term_lower) {
                score += w.body_synonym;
            }
        }

        let combined = title.chars().chain(body.chars());
        let mut has_latin = false;
        for c in combined {
            if is_cjk(c) {
                return score + w.cjk_bonus;
            }
            has_latin |= c.is_ascii_alphabetic();
        }
        if has_latin {
            score += w.latin_bonus;
        }

        score
    }

    /// Order candidates by descending score with a language tie-break and
    /// keep the top `limit`. Lists no longer than `limit` pass through as is.
    pub fn rank(&self, query: &str, candidates: Vec<Candidate>) -> Vec<Candidate> {
        if candidates.len() <= self.limit {
            info!("Relevance ranking skipped: {} candidates within limit {}", candidates.len(), self.limit);
            return candidates;
        }

        let total = candidates.len();
        let mut scored: Vec<Candidate> = candidates
            .into_iter()
            .map(|mut candidate| {
                let language = detect_language(&format!("{} {}", candidate.title, candidate.body));
                let score = self.score(query, &candidate.title, &candidate.body);
                debug!("Candidate {} scored {:.1} ({})", candidate.id, score, language);
                candidate.language = Some(language);
                candidate.relevance_score = Some(score);
                candidate
            })
            .collect();

        scored.sort_by(|a, b| {
            let score_a = a.relevance_score.unwrap_or(0.0);
            let score_b = b.relevance_score.unwrap_or(0.0);
            score_b
                .partial_cmp(&score_a)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| language_priority(a).cmp(&language_priority(b)))
        });
        scored.truncate(self.limit);

        info!("Relevance ranking kept {} of {} candidates for '{}'", scored.len(), total, query);
        scored
    }
}

fn language_priority(candidate: &Candidate) -> u8 {
    candidate.language.map(|l| l.priority()).unwrap_or(Language::Other.priority())
}

#[cfg(test)]
mod tests {
    use super::*;
    use interfaces::defs::{PublishMeta, RawHit};

    fn candidate(id: u32, title: &str, body: &str) -> Candidate {
        Candidate::from_hit(
            id,
            RawHit {
                title: title.to_string(),
                content: body.to_string(),
                url: format!("https://news.example/{}", id),
                engine: "test".to_string(),
                meta: PublishMeta::default(),
            },
        )
    }

    #[test]
    fn detects_scripts_in_priority_order() {
        assert_eq!(detect_language("英伟达发布新显卡"), Language::Zh);
        assert_eq!(detect_language("ひらがな"), Language::Ja);
        assert_eq!(detect_language("한국어"), Language::Ko);
        assert_eq!(detect_language("plain english"), Language::En);
        assert_eq!(detect_language("12345 !!"), Language::Other);
    }

    #[test]
    fn score_adds_each_signal() {
        let ranker = RelevanceRanker::new(15);
        // title exact 50, body exact 30, window "nv" in title 10, GPU in title 15, latin 3
        let score = ranker.score("NVIDIA", "Nvidia unveils new GPU", "nvidia said today");
        assert_eq!(score, 108.0);

        // no query match; latin bonus only
        assert_eq!(ranker.score("NVIDIA", "Weather report", "rain"), 3.0);

        // cjk bonus wins over latin
        assert_eq!(ranker.score("xyz", "天气 report", ""), 5.0);
    }

    #[test]
    fn short_queries_skip_window_matching() {
        let ranker = RelevanceRanker::new(15).with_synonyms("ab", &[]);
        assert_eq!(ranker.score("ab", "xa bx", ""), 3.0);
    }

    #[test]
    fn rank_is_noop_within_limit() {
        let ranker = RelevanceRanker::new(3);
        let input = vec![candidate(1, "zzz", ""), candidate(2, "NVIDIA", ""), candidate(3, "", "")];
        let output = ranker.rank("NVIDIA", input.clone());
        assert_eq!(output, input);
    }

    #[test]
    fn rank_sorts_by_score_then_language_and_truncates() {
        let ranker = RelevanceRanker::new(3);
        let input = vec![
            candidate(1, "Unrelated story", "nothing here"),
            candidate(2, "NVIDIA results", "NVIDIA beats estimates"),
            candidate(3, "其他新闻", "无关"),
            candidate(4, "Markets", "nvidia mentioned"),
            candidate(5, "Another one", "still nothing"),
        ];
        let output = ranker.rank("NVIDIA", input);

        assert_eq!(output.len(), 3);
        let ids: Vec<u32> = output.iter().map(|c| c.id).collect();
        assert_eq!(ids[0], 2);
        assert_eq!(ids[1], 4);
        // 其他新闻 gets the cjk bonus (5) over the latin-only stories (3)
        assert_eq!(ids[2], 3);
        let scores: Vec<f64> = output.iter().map(|c| c.relevance_score.unwrap()).collect();
        assert!(scores.windows(2).all(|w| w[0] >= w[1]));
    }

    #[test]
    fn ties_prefer_higher_priority_language() {
        let ranker = RelevanceRanker::new(1).with_weights(RelevanceWeights {
            cjk_bonus: 0.0,
            latin_bonus: 0.0,
            ..RelevanceWeights::default()
        });
        let input = vec![candidate(1, "english only", ""), candidate(2, "中文", "")];
        let output = ranker.rank("qqq", input);
        assert_eq!(output[0].id, 2);
        assert_eq!(output[0].language, Some(Language::Zh));
    }
}
