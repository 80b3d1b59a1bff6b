//! Prompt templates for the generation service.

/// Categories the classifier may assign.
pub const CATEGORIES: &[&str] = &[
    "Paper",
    "AI/ML",
    "Tech Industry",
    "Engineering",
    "Security",
    "Business",
    "Economy",
    "Science",
    "Product",
    "Career",
    "Other",
];

const SUMMARY_GUIDELINES: &str = "\
Extract and summarize the core ideas and most valuable insights from the text below. Use Markdown.

Guidelines:
- Open with the source or publication when it can be identified
- Extract key innovations, breakthroughs or novel perspectives
- Cite concrete data and examples that support the main arguments
- Explain why the article is worth reading
- Use **bold** for key terms

Avoid generic background, repetition and surface-level observations.

Output format:
## [Source: XXX]

**Why Read This:** [one or two sentences]

### Key Insights

1. **[Key point]**: [explanation]

(3-7 points in total)";

/// Summary prompt. With `target_language` the whole summary is written in
/// that language.
pub fn summary(text: &str, target_language: Option<&str>) -> String {
    let language = match target_language {
        Some(lang) if !lang.trim().is_empty() => format!("\n\nWrite the entire summary in {lang}."),
        _ => String::new(),
    };
    format!("{SUMMARY_GUIDELINES}{language}\n\nContent to analyze:\n```{text}```")
}

/// Classification and quality scoring prompt.
pub fn classify(text: &str) -> String {
    let categories = CATEGORIES
        .iter()
        .enumerate()
        .map(|(i, c)| format!("{}. \"{c}\"", i + 1))
        .collect::<Vec<_>>()
        .join("\n");

    format!(
        "You review content for quality and categorize it.\n\n\
         Rate the quality of the text from 0 to 1, considering coherence, factual accuracy \
         and readability. Favour articles about new developments in technology and the economy.\n\n\
         Identify the top 3 topics and give each exactly ONE category from this list:\n\
         {categories}\n\n\
         Academic or arxiv papers always use \"Paper\".\n\n\
         Respond with JSON only, no explanation:\n\
         {{\"feedback\": \"brief feedback\", \"topics\": [{{\"topic\": \"...\", \"category\": \"...\"}}], \"overall_score\": 0.0}}\n\n\
         The text: {text}"
    )
}
