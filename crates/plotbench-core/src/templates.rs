//! Prompt templates keyed by symbolic name.
//!
//! Templates use `$name` / `${name}` placeholders and `$$` for a literal
//! dollar sign. They are parsed once, up front, and rendered from an explicit
//! parameter map; a placeholder without a value is an error, never an empty
//! substitution.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use thiserror::Error;

/// Errors from parsing or rendering templates.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TemplateError {
    #[error("No value supplied for placeholder '{0}'")]
    MissingParameter(String),

    #[error("Placeholder '{placeholder}' is not allowed in the {template} template")]
    UnknownPlaceholder {
        template: TemplateName,
        placeholder: String,
    },

    #[error("Malformed template: {0}")]
    Malformed(String),

    #[error("No template registered for {0}")]
    NotFound(TemplateName),
}

/// Every prompt the pipeline sends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TemplateName {
    GenerationSystem,
    GenerationUser,
    AestheticSystem,
    AestheticUser,
    CorrectnessSystem,
    CorrectnessUser,
    CombinedSystem,
    CombinedUser,
    /// User turn for text-only judging of the script source
    SourceJudgeUser,
}

impl TemplateName {
    pub const ALL: [TemplateName; 9] = [
        TemplateName::GenerationSystem,
        TemplateName::GenerationUser,
        TemplateName::AestheticSystem,
        TemplateName::AestheticUser,
        TemplateName::CorrectnessSystem,
        TemplateName::CorrectnessUser,
        TemplateName::CombinedSystem,
        TemplateName::CombinedUser,
        TemplateName::SourceJudgeUser,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TemplateName::GenerationSystem => "generation_system",
            TemplateName::GenerationUser => "generation_user",
            TemplateName::AestheticSystem => "aesthetic_system",
            TemplateName::AestheticUser => "aesthetic_user",
            TemplateName::CorrectnessSystem => "correctness_system",
            TemplateName::CorrectnessUser => "correctness_user",
            TemplateName::CombinedSystem => "combined_system",
            TemplateName::CombinedUser => "combined_user",
            TemplateName::SourceJudgeUser => "source_judge_user",
        }
    }

    /// Placeholders a template registered under this name may use.
    pub fn allowed_placeholders(&self) -> &'static [&'static str] {
        match self {
            TemplateName::GenerationUser => &["instruction", "data_preview", "columns"],
            TemplateName::AestheticUser
            | TemplateName::CorrectnessUser
            | TemplateName::CombinedUser => &["instruction"],
            TemplateName::SourceJudgeUser => &["instruction", "source"],
            TemplateName::GenerationSystem
            | TemplateName::AestheticSystem
            | TemplateName::CorrectnessSystem
            | TemplateName::CombinedSystem => &[],
        }
    }
}

impl fmt::Display for TemplateName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Placeholder(String),
}

/// A parsed template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Template {
    source: String,
    segments: Vec<Segment>,
}

impl Template {
    /// Parse template text.
    ///
    /// A `$` not followed by `$`, `{` or an identifier is kept literally.
    pub fn parse(source: impl Into<String>) -> Result<Self, TemplateError> {
        let source = source.into();
        let mut segments = Vec::new();
        let mut literal = String::new();
        let mut chars = source.char_indices().peekable();

        while let Some((pos, c)) = chars.next() {
            if c != '$' {
                literal.push(c);
                continue;
            }

            match chars.peek().copied() {
                Some((_, '$')) => {
                    chars.next();
                    literal.push('$');
                }
                Some((_, '{')) => {
                    chars.next();
                    let mut name = String::new();
                    loop {
                        match chars.next() {
                            Some((_, '}')) => break,
                            Some((_, ch)) => name.push(ch),
                            None => {
                                return Err(TemplateError::Malformed(format!(
                                    "unterminated '${{' at byte {}",
                                    pos
                                )))
                            }
                        }
                    }
                    if !is_identifier(&name) {
                        return Err(TemplateError::Malformed(format!(
                            "invalid placeholder name '{}' at byte {}",
                            name, pos
                        )));
                    }
                    flush_literal(&mut literal, &mut segments);
                    segments.push(Segment::Placeholder(name));
                }
                Some((_, ch)) if ch.is_ascii_alphabetic() || ch == '_' => {
                    let mut name = String::new();
                    while let Some((_, ch)) = chars.peek().copied() {
                        if ch.is_ascii_alphanumeric() || ch == '_' {
                            name.push(ch);
                            chars.next();
                        } else {
                            break;
                        }
                    }
                    flush_literal(&mut literal, &mut segments);
                    segments.push(Segment::Placeholder(name));
                }
                _ => literal.push('$'),
            }
        }
        flush_literal(&mut literal, &mut segments);

        Ok(Self { source, segments })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Distinct placeholder names, sorted.
    pub fn placeholders(&self) -> BTreeSet<&str> {
        self.segments
            .iter()
            .filter_map(|s| match s {
                Segment::Placeholder(name) => Some(name.as_str()),
                Segment::Literal(_) => None,
            })
            .collect()
    }

    /// Substitute every placeholder from `params`.
    pub fn render(&self, params: &TemplateParams) -> Result<String, TemplateError> {
        let mut out = String::with_capacity(self.source.len());
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => out.push_str(text),
                Segment::Placeholder(name) => {
                    let value = params
                        .get(name)
                        .ok_or_else(|| TemplateError::MissingParameter(name.clone()))?;
                    out.push_str(value);
                }
            }
        }
        Ok(out)
    }
}

fn flush_literal(literal: &mut String, segments: &mut Vec<Segment>) {
    if !literal.is_empty() {
        segments.push(Segment::Literal(std::mem::take(literal)));
    }
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Values for template placeholders.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TemplateParams(BTreeMap<String, String>);

impl TemplateParams {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a value, builder-style.
    pub fn with(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.0.insert(name.into(), value.into());
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.0.insert(name.into(), value.into());
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.get(name).map(String::as_str)
    }
}

/// Immutable set of templates, one per [`TemplateName`].
#[derive(Debug, Clone)]
pub struct PromptTemplates {
    templates: BTreeMap<TemplateName, Template>,
}

impl PromptTemplates {
    pub fn builder() -> PromptTemplatesBuilder {
        PromptTemplatesBuilder::default()
    }

    /// Start a builder from this set, to apply overrides.
    pub fn to_builder(&self) -> PromptTemplatesBuilder {
        PromptTemplatesBuilder {
            templates: self.templates.clone(),
        }
    }

    pub fn get(&self, name: TemplateName) -> Option<&Template> {
        self.templates.get(&name)
    }

    /// Render the template registered under `name`.
    pub fn render(
        &self,
        name: TemplateName,
        params: &TemplateParams,
    ) -> Result<String, TemplateError> {
        self.templates
            .get(&name)
            .ok_or(TemplateError::NotFound(name))?
            .render(params)
    }
}

/// Builder for [`PromptTemplates`].
#[derive(Debug, Clone, Default)]
pub struct PromptTemplatesBuilder {
    templates: BTreeMap<TemplateName, Template>,
}

impl PromptTemplatesBuilder {
    /// Register template text under `name`.
    ///
    /// Fails if the text uses a placeholder `name` does not allow.
    pub fn set(mut self, name: TemplateName, source: &str) -> Result<Self, TemplateError> {
        let template = Template::parse(source)?;
        let allowed = name.allowed_placeholders();

        if let Some(unknown) = template
            .placeholders()
            .into_iter()
            .find(|p| !allowed.contains(p))
        {
            return Err(TemplateError::UnknownPlaceholder {
                template: name,
                placeholder: unknown.to_string(),
            });
        }

        self.templates.insert(name, template);
        Ok(self)
    }

    /// Finish, requiring a template for every name.
    pub fn build(self) -> Result<PromptTemplates, TemplateError> {
        if let Some(missing) = TemplateName::ALL
            .iter()
            .find(|n| !self.templates.contains_key(n))
        {
            return Err(TemplateError::NotFound(*missing));
        }

        Ok(PromptTemplates {
            templates: self.templates,
        })
    }
}
