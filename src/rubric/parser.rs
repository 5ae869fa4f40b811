#![warn(missing_docs)]
#![warn(clippy::missing_docs_in_private_items)]

use std::sync::LazyLock;

use regex::Regex;

use super::{Artifact, Criterion, GradingMode, Rubric, TestPolicy, TestRef};
use crate::{
    constants::EXTRA_CREDIT_KEYWORDS,
    util::slugify,
};

/// Longest description kept per section.
const DESCRIPTION_LIMIT: usize = 500;

/// A markdown heading with an optional point annotation.
#[derive(Debug, Clone, PartialEq)]
pub struct Heading {
    /// Number of leading `#` characters.
    pub level:  usize,
    /// Heading text without the point annotation.
    pub name:   String,
    /// Points declared in parentheses, if any.
    pub points: Option<f64>,
    /// Word preceding the points, e.g. `Extra` in `(Extra 5 pts)`.
    pub label:  Option<String>,
}

/// Parsed `(Extra 5 pts)` annotation.
#[derive(Debug, Clone, PartialEq)]
struct PointsTag {
    /// Optional leading word.
    label:  Option<String>,
    /// Declared points.
    points: f64,
}

peg::parser! {
    /// Grammars for the pieces of an assignment README that carry grading
    /// structure.
    grammar readme() for str {
        /// matches horizontal whitespace
        rule _() = quiet!{[' ' | '\t']*}

        /// matches an integer or decimal number
        rule number() -> f64
            = n:$(['0'..='9']+ ("." ['0'..='9']+)?) {? n.parse().or(Err("number")) }

        /// matches `pts`, `pt`, `points` or `point` in any case
        rule unit()
            = ['p' | 'P'] (['o' | 'O'] ['i' | 'I'] ['n' | 'N'] ['t' | 'T'] / ['t' | 'T']) ['s' | 'S']?

        /// matches a word such as `Extra` or `Bonus`
        rule label() -> String
            = w:$(['a'..='z' | 'A'..='Z']+) [' ' | '\t']+ { w.to_string() }

        /// matches `(10)`, `(10 pts)` or `(Extra 5 points)`
        rule points() -> PointsTag
            = "(" _ label:label()? n:number() _ unit()? _ ")" { PointsTag { label, points: n } }

        /// matches a point annotation that ends the line
        rule tail() -> PointsTag
            = _ p:points() _ ![_] { p }

        /// parses a markdown ATX heading
        pub rule heading() -> Heading
            = h:$("#"+) [' ' | '\t']+ name:$((!tail() [_])*) tag:tail()? {
                Heading {
                    level: h.len(),
                    name: name.trim().trim_end_matches('#').trim().to_string(),
                    points: tag.as_ref().map(|t| t.points),
                    label: tag.and_then(|t| t.label),
                }
            }

        /// matches a python identifier
        rule ident() -> String
            = i:$(['a'..='z' | 'A'..='Z' | '_'] ['a'..='z' | 'A'..='Z' | '0'..='9' | '_']*) { i.to_string() }

        /// extracts the function name from a `def name(` line
        pub rule def_name() -> String
            = _ ("async" [' ' | '\t']+)? "def" [' ' | '\t']+ n:ident() _ "(" [_]* { n }
    }
}

/// Parses a single markdown heading line.
pub fn parse_heading(line: &str) -> Option<Heading> {
    readme::heading(line.trim_end()).ok()
}

/// A section collected while walking the README.
#[derive(Default)]
struct Section {
    /// Heading text.
    name:      String,
    /// Declared points.
    points:    f64,
    /// Whether the heading marks extra credit.
    extra:     bool,
    /// Prose lines, code fences removed.
    prose:     Vec<String>,
    /// Function names declared in python code blocks or named inline.
    functions: Vec<String>,
}

impl Section {
    /// First substantial paragraph of prose.
    fn description(&self) -> String {
        let text = self.prose.join("\n");
        text.split("\n\n")
            .map(str::trim)
            .find(|p| {
                p.chars().count() > 20
                    && !["1.", "2.", "3.", "-", "*"]
                        .iter()
                        .any(|prefix| p.starts_with(prefix))
            })
            .map(|p| {
                if p.chars().count() > DESCRIPTION_LIMIT {
                    format!("{}...", p.chars().take(DESCRIPTION_LIMIT).collect::<String>())
                } else {
                    p.to_string()
                }
            })
            .unwrap_or_default()
    }

    /// Records a function name once.
    fn add_function(&mut self, name: String) {
        if !self.functions.contains(&name) {
            self.functions.push(name);
        }
    }

    /// Converts the section into a criterion.
    fn into_criterion(self) -> Criterion {
        let description = self.description();
        let id = slugify(&self.name);
        let builder = Criterion::builder()
            .id(id)
            .description(description)
            .max_points(self.points)
            .section(self.name)
            .extra_credit(self.extra);

        if self.functions.is_empty() {
            builder
                .mode(GradingMode::Llm)
                .artifact(Artifact::Report)
                .build()
        } else {
            let tests = self
                .functions
                .iter()
                .map(|f| TestRef::from(format!("test_{f}").as_str()))
                .collect();
            builder
                .mode(GradingMode::Hybrid)
                .artifact(Artifact::Both)
                .test_policy(TestPolicy::Weighted)
                .tests(tests)
                .build()
        }
    }
}

/// A function named in prose: ``called `mean_age` ``.
static CALLED_FUNCTION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"called\s+[`'](\w+)[`']").expect("function mention pattern is valid")
});

/// Finds function names mentioned as ``called `name` `` in prose.
fn inline_functions(line: &str) -> Vec<String> {
    CALLED_FUNCTION
        .captures_iter(line)
        .map(|cap| cap[1].to_string())
        .collect()
}

/// Whether a heading is extra credit by name or label.
fn is_extra(heading: &Heading) -> bool {
    let name = heading.name.to_lowercase();
    let label = heading.label.as_deref().unwrap_or_default().to_lowercase();
    EXTRA_CREDIT_KEYWORDS
        .iter()
        .any(|k| name.contains(*k) || label.contains(*k))
}

/// Derives a rubric from an assignment README.
///
/// The first level-one heading is the title, and its point annotation (if
/// any) is the declared total. Every other heading carrying points starts a
/// section. A section whose python code blocks define functions becomes a
/// hybrid criterion tested by `test_<function>`; otherwise it is reviewed by
/// the LLM against the report.
pub fn parse_markdown(content: &str, fallback_title: &str) -> Result<Rubric, String> {
    let mut title: Option<(String, Option<f64>)> = None;
    let mut sections: Vec<Section> = Vec::new();
    let mut fence: Option<String> = None;

    for line in content.lines() {
        let trimmed = line.trim_start();

        if let Some(info) = trimmed.strip_prefix("```") {
            fence = match fence {
                Some(_) => None,
                None => Some(info.trim().to_lowercase()),
            };
            continue;
        }

        if let Some(lang) = &fence {
            if (lang == "python" || lang == "py")
                && let Ok(name) = readme::def_name(trimmed)
                && let Some(section) = sections.last_mut()
            {
                section.add_function(name);
            }
            continue;
        }

        if trimmed.starts_with('#')
            && let Some(heading) = parse_heading(trimmed)
        {
            if heading.level == 1 && title.is_none() {
                title = Some((heading.name.clone(), heading.points));
                continue;
            }
            if let Some(points) = heading.points {
                sections.push(Section {
                    extra: is_extra(&heading),
                    name: heading.name,
                    points,
                    ..Section::default()
                });
                continue;
            }
        }

        if let Some(section) = sections.last_mut() {
            for name in inline_functions(line) {
                section.add_function(name);
            }
            section.prose.push(line.to_string());
        }
    }

    if sections.is_empty() {
        return Err("no headings with point values were found".to_string());
    }

    let criteria: Vec<Criterion> = sections.into_iter().map(Section::into_criterion).collect();
    let sum: f64 = criteria
        .iter()
        .filter(|c| !c.extra_credit)
        .map(|c| c.max_points)
        .sum();
    let (title, declared) = title.unwrap_or_else(|| (fallback_title.to_string(), None));

    Ok(Rubric::builder()
        .title(title)
        .total_points(declared.unwrap_or(sum))
        .criteria(criteria)
        .description(content.to_string())
        .build())
}
