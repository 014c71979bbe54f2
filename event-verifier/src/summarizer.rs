use crate::llm_adapter::ProviderChain;
use crate::relevance::detect_language;
use crate::types::{Candidate, CapabilityError, CompletionProvider, CompletionRequest, GenerationMode, Language, Result};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

pub const DEFAULT_ANALYSIS_PROMPT: &str = "请你以专业的视角，为以下新闻撰写一段300到500字的分析摘要。如果原文是外语，请用中文进行分析，并可以适当引用原文关键信息。正文如下：\n\n{content}";

pub const DEFAULT_SUMMARY_PROMPT: &str = "你是一位资深新闻分析师。请根据以下关于'{query}'的新闻分析，撰写一份综合性总结报告。\n\n分析内容：\n{analyzed_content}";

pub const DEFAULT_DIRECT_SYSTEM_PROMPT: &str = "You are an investigative news analyst. Provide concise, structured conclusions with caveats when sources are missing.";

pub const DEFAULT_DIRECT_PROMPT: &str = "根据下面事件文本进行事实核验取向的分析。要求：\n- 给出关键事实清单\n- 标注不确定点\n- 给出进一步核验建议\n\n事件文本：{text}";

pub const TRUNCATION_MARKER: &str = "...\n\n[注：由于内容过长，部分分析已省略]";

#[derive(Debug, Clone)]
pub struct SummarizerConfig {
    pub analysis_prompt: String,
    pub summary_prompt: String,
    pub direct_system_prompt: String,
    pub direct_prompt: String,
    /// Pause between two consecutive per-item model calls.
    pub analysis_delay: Duration,
    /// Character cap of the joined analyses sent for aggregation.
    pub char_cap: usize,
    /// Bodies shorter than this are never sent to the model.
    pub min_body_chars: usize,
    /// Analyses not longer than this are left out of the aggregate.
    pub min_analysis_chars: usize,
    /// Also analyze items whose extraction failed, using their snippet.
    pub analyze_unextracted: bool,
}

impl Default for SummarizerConfig {
    fn default() -> Self {
        Self {
            analysis_prompt: DEFAULT_ANALYSIS_PROMPT.to_string(),
            summary_prompt: DEFAULT_SUMMARY_PROMPT.to_string(),
            direct_system_prompt: DEFAULT_DIRECT_SYSTEM_PROMPT.to_string(),
            direct_prompt: DEFAULT_DIRECT_PROMPT.to_string(),
            analysis_delay: Duration::from_millis(2000),
            char_cap: 15000,
            min_body_chars: 50,
            min_analysis_chars: 20,
            analyze_unextracted: false,
        }
    }
}

/// Counts produced by the per-item analysis step.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AnalysisTally {
    pub attempted: usize,
    pub succeeded: usize,
}

/// Report text plus how it was produced.
#[derive(Debug, Clone, PartialEq)]
pub struct SummaryOutcome {
    pub text: String,
    pub mode: GenerationMode,
    /// Provider that wrote the text, absent for local summaries.
    pub provider: Option<String>,
}

/// Substitute `{name}` placeholders in one pass, so substituted values are
/// never rescanned.
pub fn render_template(template: &str, values: &[(&str, &str)]) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    'scan: while let Some(start) = rest.find('{') {
        out.push_str(&rest[..start]);
        let tail = &rest[start..];
        for (name, value) in values {
            let placeholder_len = name.len() + 2;
            if tail.len() >= placeholder_len && tail[1..].starts_with(name) && tail[1 + name.len()..].starts_with('}') {
                out.push_str(value);
                rest = &tail[placeholder_len..];
                continue 'scan;
            }
        }
        out.push('{');
        rest = &tail[1..];
    }
    out.push_str(rest);
    out
}

/// Cap `text` at `cap` characters, marking the cut. Text within the cap is
/// returned unchanged.
pub fn truncate_with_marker(text: String, cap: usize) -> String {
    if text.chars().count() <= cap {
        return text;
    }
    let mut truncated: String = text.chars().take(cap).collect();
    truncated.push_str(TRUNCATION_MARKER);
    truncated
}

/// Steps 6 and 7: per-item analysis and the final report.
pub struct Summarizer {
    analyst: Arc<dyn CompletionProvider>,
    aggregators: ProviderChain,
    direct: ProviderChain,
    config: SummarizerConfig,
}

impl Summarizer {
    pub fn new(analyst: Arc<dyn CompletionProvider>, aggregators: ProviderChain, direct: ProviderChain, config: SummarizerConfig) -> Self {
        Self {
            analyst,
            aggregators,
            direct,
            config,
        }
    }

    pub fn config(&self) -> &SummarizerConfig {
        &self.config
    }

    fn is_analyzable(&self, candidate: &Candidate) -> bool {
        (candidate.extracted || self.config.analyze_unextracted) && candidate.body.trim().chars().count() >= self.config.min_body_chars
    }

    /// Single analysis call for one article body.
    pub async fn analyze(&self, body: &str) -> std::result::Result<String, CapabilityError> {
        let prompt = render_template(&self.config.analysis_prompt, &[("content", body)]);
        let request = CompletionRequest::new(prompt).with_temperature(0.7).with_max_tokens(1024);
        self.analyst.complete(&request).await
    }

    /// Analyze every eligible candidate in order, one call at a time.
    ///
    /// A failed call is recorded on the item and never aborts the batch.
    pub async fn analyze_all(&self, candidates: &mut [Candidate]) -> AnalysisTally {
        let mut tally = AnalysisTally::default();

        for candidate in candidates.iter_mut() {
            if !self.is_analyzable(candidate) {
                debug!("Skipping analysis of {}: body not analyzable", candidate.id);
                candidate.analysis = None;
                candidate.analysis_success = false;
                continue;
            }

            if tally.attempted > 0 && !self.config.analysis_delay.is_zero() {
                tokio::time::sleep(self.config.analysis_delay).await;
            }
            tally.attempted += 1;

            match self.analyze(&candidate.body).await {
                Ok(text) => {
                    debug!("Analysis of {} succeeded ({} chars)", candidate.id, text.chars().count());
                    candidate.analysis = Some(text);
                    candidate.analysis_success = true;
                    tally.succeeded += 1;
                }
                Err(e) => {
                    warn!("Analysis of {} failed on {}: {}", candidate.id, self.analyst.provider_name(), e);
                    candidate.analysis = Some(format!("analysis failed: {}", e));
                    candidate.analysis_success = false;
                }
            }
        }

        info!("Per-item analysis: {} of {} succeeded", tally.succeeded, tally.attempted);
        tally
    }

    /// Successful analyses joined in candidate order, each under its title.
    pub fn concatenate(&self, candidates: &[Candidate]) -> Option<String> {
        let sections: Vec<String> = candidates
            .iter()
            .filter(|c| c.analysis_success)
            .filter_map(|c| {
                c.analysis
                    .as_deref()
                    .filter(|text| text.trim().chars().count() > self.config.min_analysis_chars)
                    .map(|text| format!("【{}】\n{}", c.title, text))
            })
            .collect();

        if sections.is_empty() {
            None
        } else {
            Some(sections.join("\n\n"))
        }
    }

    /// Final report over all successful analyses.
    ///
    /// With nothing to aggregate a statistical summary is built locally and no
    /// provider is called.
    pub async fn summarize(&self, query: &str, candidates: &[Candidate]) -> Result<SummaryOutcome> {
        let joined = match self.concatenate(candidates) {
            Some(joined) => joined,
            None => {
                info!("No successful analyses for '{}', writing statistical summary", query);
                return Ok(SummaryOutcome {
                    text: basic_summary(query, candidates),
                    mode: GenerationMode::Statistical,
                    provider: None,
                });
            }
        };

        let original_len = joined.chars().count();
        let capped = truncate_with_marker(joined, self.config.char_cap);
        if original_len > self.config.char_cap {
            info!("Aggregate input truncated from {} to {} characters", original_len, self.config.char_cap);
        }

        let prompt = render_template(&self.config.summary_prompt, &[("query", query), ("analyzed_content", &capped)]);
        let request = CompletionRequest::new(prompt).with_temperature(0.8).with_max_tokens(3000);
        let (text, provider) = self.aggregators.complete(&request).await?;

        info!("Final report for '{}' written by {}", query, provider);
        Ok(SummaryOutcome {
            text,
            mode: GenerationMode::Pipeline,
            provider: Some(provider),
        })
    }

    /// Single-shot analysis of the raw query text, used when no sources exist.
    pub async fn direct(&self, text: &str) -> Result<SummaryOutcome> {
        let prompt = render_template(&self.config.direct_prompt, &[("text", text)]);
        let request = CompletionRequest::new(prompt)
            .with_system(self.config.direct_system_prompt.clone())
            .with_temperature(0.3)
            .with_max_tokens(800);
        let (summary, provider) = self.direct.complete(&request).await?;

        info!("Direct analysis written by {}", provider);
        Ok(SummaryOutcome {
            text: summary,
            mode: GenerationMode::DirectFallback,
            provider: Some(provider),
        })
    }
}

/// Report built from counts and titles only.
pub fn basic_summary(query: &str, candidates: &[Candidate]) -> String {
    let mut by_language: BTreeMap<(u8, &'static str), usize> = BTreeMap::new();
    for candidate in candidates {
        let language: Language = candidate
            .language
            .unwrap_or_else(|| detect_language(&format!("{} {}", candidate.title, candidate.body)));
        *by_language.entry((language.priority(), language.code())).or_insert(0) += 1;
    }

    let mut report = format!("基于搜索关键词\"{}\"的新闻分析报告：\n\n本次分析共收集到{}条相关新闻。", query, candidates.len());

    if !by_language.is_empty() {
        report.push_str("\n\n新闻来源语言分布：");
        for ((_, code), count) in &by_language {
            report.push_str(&format!("\n- {}: {}条", code, count));
        }
    }

    if !candidates.is_empty() {
        report.push_str("\n\n主要新闻标题：");
        for candidate in candidates.iter().take(10) {
            report.push_str(&format!("\n- {}", candidate.title));
        }
    }

    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm_adapter::ProviderChainBuilder;
    use interfaces::baseline::ScriptedCompletion;
    use interfaces::defs::{PublishMeta, RawHit};

    fn candidate(id: u32, title: &str, body: &str, extracted: bool) -> Candidate {
        let mut c = Candidate::from_hit(
            id,
            RawHit {
                title: title.to_string(),
                content: body.to_string(),
                url: format!("https://news.example/{}", id),
                engine: "test".to_string(),
                meta: PublishMeta::default(),
            },
        );
        c.extracted = extracted;
        c
    }

    fn summarizer(analyst: Arc<ScriptedCompletion>, aggregate: Arc<ScriptedCompletion>) -> Summarizer {
        let chain = ProviderChainBuilder::new().add_provider(aggregate).build();
        let config = SummarizerConfig {
            analysis_delay: Duration::ZERO,
            ..SummarizerConfig::default()
        };
        Summarizer::new(analyst, chain.clone(), chain, config)
    }

    const LONG_BODY: &str = "This article body is comfortably longer than fifty characters in total.";

    #[test]
    fn render_substitutes_once() {
        let rendered = render_template("q={query} c={analyzed_content} {other}", &[("query", "{analyzed_content}"), ("analyzed_content", "text")]);
        assert_eq!(rendered, "q={analyzed_content} c=text {other}");
    }

    #[test]
    fn truncation_is_identity_under_cap() {
        let text = "短文本 short".to_string();
        assert_eq!(truncate_with_marker(text.clone(), 15000), text);

        let long: String = "字".repeat(30);
        let cut = truncate_with_marker(long, 10);
        assert!(cut.starts_with(&"字".repeat(10)));
        assert!(cut.ends_with(TRUNCATION_MARKER));
        assert_eq!(cut.chars().count(), 10 + TRUNCATION_MARKER.chars().count());
    }

    #[tokio::test]
    async fn analysis_skips_short_and_unextracted_bodies() {
        let analyst = Arc::new(ScriptedCompletion::new("glm", "a detailed analysis of the article"));
        let aggregate = Arc::new(ScriptedCompletion::new("deepseek", "report"));
        let summarizer = summarizer(analyst.clone(), aggregate);

        let mut items = vec![
            candidate(1, "one", LONG_BODY, true),
            candidate(2, "two", "too short", true),
            candidate(3, "three", LONG_BODY, false),
        ];
        let tally = summarizer.analyze_all(&mut items).await;

        assert_eq!(tally, AnalysisTally { attempted: 1, succeeded: 1 });
        assert_eq!(analyst.calls(), 1);
        assert!(items[0].analysis_success);
        assert!(items[1].analysis.is_none());
        assert!(items[2].analysis.is_none());
    }

    #[tokio::test]
    async fn failed_item_records_error_and_batch_continues() {
        let analyst = Arc::new(ScriptedCompletion::new("glm", "a detailed analysis of the article").fail_when_prompt_contains("BROKEN"));
        let aggregate = Arc::new(ScriptedCompletion::new("deepseek", "report"));
        let summarizer = summarizer(analyst, aggregate);

        let broken = format!("{} BROKEN", LONG_BODY);
        let mut items = vec![candidate(1, "one", &broken, true), candidate(2, "two", LONG_BODY, true)];
        let tally = summarizer.analyze_all(&mut items).await;

        assert_eq!(tally, AnalysisTally { attempted: 2, succeeded: 1 });
        assert!(!items[0].analysis_success);
        assert!(items[0].analysis.as_deref().unwrap_or("").starts_with("analysis failed"));
        assert!(items[1].analysis_success);
    }

    #[tokio::test]
    async fn summarize_without_successes_makes_no_call() {
        let analyst = Arc::new(ScriptedCompletion::new("glm", "unused"));
        let aggregate = Arc::new(ScriptedCompletion::new("deepseek", "report"));
        let summarizer = summarizer(analyst, aggregate.clone());

        let mut items = vec![candidate(1, "英伟达新闻", "snippet", false), candidate(2, "NVIDIA news", "snippet", false)];
        items[0].language = Some(Language::Zh);
        items[1].language = Some(Language::En);
        let outcome = summarizer.summarize("NVIDIA", &items).await.unwrap();

        assert_eq!(outcome.mode, GenerationMode::Statistical);
        assert!(outcome.provider.is_none());
        assert_eq!(aggregate.calls(), 0);
        assert!(outcome.text.contains("- zh: 1条"));
        assert!(outcome.text.contains("- en: 1条"));
        assert!(outcome.text.contains("- NVIDIA news"));
    }

    #[tokio::test]
    async fn summarize_joins_titled_analyses_in_order() {
        let analyst = Arc::new(ScriptedCompletion::new("glm", "unused"));
        let aggregate = Arc::new(ScriptedCompletion::new("deepseek", "final report"));
        let summarizer = summarizer(analyst, aggregate.clone());

        let mut items = vec![candidate(1, "first", LONG_BODY, true), candidate(2, "second", LONG_BODY, true)];
        items[0].analysis = Some("first analysis with enough characters".to_string());
        items[0].analysis_success = true;
        items[1].analysis = Some("second analysis with enough characters".to_string());
        items[1].analysis_success = true;

        let outcome = summarizer.summarize("query", &items).await.unwrap();
        assert_eq!(outcome.text, "final report");
        assert_eq!(outcome.mode, GenerationMode::Pipeline);

        let prompt = &aggregate.prompts()[0].prompt;
        let first = prompt.find("【first】\nfirst analysis").unwrap();
        let second = prompt.find("【second】\nsecond analysis").unwrap();
        assert!(first < second);
        assert!(!prompt.contains(TRUNCATION_MARKER));
    }

    #[tokio::test]
    async fn oversized_analyses_reach_the_aggregator_truncated() {
        let analyst = Arc::new(ScriptedCompletion::new("glm", "unused"));
        let aggregate = Arc::new(ScriptedCompletion::new("deepseek", "final report"));
        let summarizer = summarizer(analyst, aggregate.clone());

        let mut items = vec![candidate(1, "first", LONG_BODY, true), candidate(2, "second", LONG_BODY, true)];
        for item in items.iter_mut() {
            item.analysis = Some("分析".repeat(4000));
            item.analysis_success = true;
        }

        let outcome = summarizer.summarize("query", &items).await.unwrap();
        assert_eq!(outcome.mode, GenerationMode::Pipeline);

        let prompt = &aggregate.prompts()[0].prompt;
        assert!(prompt.contains(TRUNCATION_MARKER));
        assert!(prompt.contains("【first】"));
        assert!(prompt.chars().count() < 16000 + DEFAULT_SUMMARY_PROMPT.chars().count());
    }

    #[tokio::test]
    async fn direct_mode_sends_system_prompt() {
        let analyst = Arc::new(ScriptedCompletion::new("glm", "unused"));
        let aggregate = Arc::new(ScriptedCompletion::new("deepseek", "direct answer"));
        let summarizer = summarizer(analyst, aggregate.clone());

        let outcome = summarizer.direct("Some event happened").await.unwrap();
        assert_eq!(outcome.mode, GenerationMode::DirectFallback);
        let request = &aggregate.prompts()[0];
        assert!(request.system.is_some());
        assert!(request.prompt.contains("Some event happened"));
    }
}
