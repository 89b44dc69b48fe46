//! Built-in prompt texts.
//!
//! Generation prompts steer the model towards a single runnable matplotlib
//! script that leaves its figure in `fig`. Judge prompts share one five-label
//! scale so every reply can go through `JudgeVerdict::parse`.
//!
//! Any of these can be replaced from the `templates` config section.

use plotbench_core::{PromptTemplates, TemplateError, TemplateName};

/// Fixed rubric for the code generator.
pub const GENERATION_SYSTEM_PROMPT: &str = r#"You are a Python code generator for scientific plots.

A pandas DataFrame named `df` already holds the data. Write one complete, runnable script that plots it with matplotlib (seaborn may be used) as the user asks.

Requirements:
1) Do not load or re-import the data; use `df` as given. If no plot type is requested, draw a bar plot.
2) Import every library you use and set global matplotlib parameters (font size, palette) near the top.
3) Unless told otherwise, use the first column as the group column and the second as the value column.
4) Set axis labels, a y-axis limit with headroom of about 1.3x the data range, and a sensible figure size.
5) When significance is requested, run pairwise t-tests against the control group (the first group unless one is named) and draw significance bars with caps and labels, stacking them so they do not overlap.
6) Overlay the individual data points on bar plots.
7) Call plt.tight_layout() and finish with `fig = ax.get_figure()`. Never call plt.show() or plt.close().
8) Return only the code, in a single ```python fenced block, without explanation.
"#;

pub const GENERATION_USER_PROMPT: &str = r#"The dataset is loaded as the pandas DataFrame `df` with columns: $columns

First rows of df:
$data_preview

User request: $instruction
"#;

pub const JUDGE_SYSTEM_PROMPT: &str = "You are a scientific visualization expert.";

pub const AESTHETIC_USER_PROMPT: &str = r#"Classify the aesthetic quality of the attached plot as one of: Excellent, Very Good, Average, Poor, Very Poor. Output only the label.

Definitions:
- Excellent: publication-level design that follows scientific visualization best practice; clear, well-organised layout; colour and typography that are both attractive and informative.
- Very Good: pleasing and professional overall, with only minor room for improvement in fonts, spacing or colour.
- Average: acceptable layout and design without refinement; conveys its information in an unremarkable way.
- Poor: clear design flaws such as a disorganised layout, unappealing colours or inconsistent elements that get in the way of the message.
- Very Poor: ignores basic visualization principles; chaotic layout and unsuitable colours make it look amateurish and hard to read.

The plot was produced for this request: $instruction
"#;

pub const CORRECTNESS_USER_PROMPT: &str = r#"Classify the correctness of the attached plot as one of: Excellent, Very Good, Average, Poor, Very Poor. Output only the label.

Definitions:
- Excellent: every statistical requirement is met; error bars, significance tests and data transformations are accurate and complete, and the data relationships are shown faithfully.
- Very Good: most statistical requirements are met, with only minor details or edge cases handled imperfectly.
- Average: statistical elements are present but some are incomplete or missing, leaving parts of the data relationships ambiguous.
- Poor: only a few requirements are met; major statistical elements are missing or wrong, so the plot may mislead.
- Very Poor: barely any statistical requirement is met; the data relationships are chaotic or distorted.

The plot was produced for this request: $instruction
"#;

pub const COMBINED_SYSTEM_PROMPT: &str = r#"Evaluate a generated chart on two dimensions. Do not give numeric scores; classify each dimension as one of: Excellent, Very Good, Average, Poor, Very Poor.

1. Accuracy
- The chart reflects the real relationships in the data: trends, comparisons, distributions, correlations.
- Error bars, significance tests and data transformations, where required, are computed correctly and shown clearly.
- The chart does what was asked; axes, legends and labels carry correct units, ranges and meanings.
- Labels, titles and annotations are accurate and explain data sources or processing where needed.

2. Aesthetics
- Clean, well-organised layout with a clear focal point and no crowding.
- A colour scheme suited to the data, with good contrast and a consistent professional style.
- Readable text, legends and annotations at sensible sizes.
- Crisp rendering with no blurring or distortion, up to academic publication standards.

Reply with this JSON object and nothing else:
{
    "accuracy": "<classification>",
    "aesthetics": "<classification>"
}
"#;

pub const COMBINED_USER_PROMPT: &str =
    "Please evaluate the attached chart according to the system prompt. It was produced for this request: $instruction";

/// Text-only judging: the judge reads the script instead of the figure.
pub const SOURCE_JUDGE_USER_PROMPT: &str = r#"No image is available. Judge the plot that the following matplotlib script would produce for the request below, reasoning from the code alone.

Request: $instruction

Script:
```python
$source
```
"#;

/// The complete built-in template set.
pub fn builtin_templates() -> Result<PromptTemplates, TemplateError> {
    PromptTemplates::builder()
        .set(TemplateName::GenerationSystem, GENERATION_SYSTEM_PROMPT)?
        .set(TemplateName::GenerationUser, GENERATION_USER_PROMPT)?
        .set(TemplateName::AestheticSystem, JUDGE_SYSTEM_PROMPT)?
        .set(TemplateName::AestheticUser, AESTHETIC_USER_PROMPT)?
        .set(TemplateName::CorrectnessSystem, JUDGE_SYSTEM_PROMPT)?
        .set(TemplateName::CorrectnessUser, CORRECTNESS_USER_PROMPT)?
        .set(TemplateName::CombinedSystem, COMBINED_SYSTEM_PROMPT)?
        .set(TemplateName::CombinedUser, COMBINED_USER_PROMPT)?
        .set(TemplateName::SourceJudgeUser, SOURCE_JUDGE_USER_PROMPT)?
        .build()
}
