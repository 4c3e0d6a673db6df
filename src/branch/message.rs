//! Parsing review fields out of commit messages.
//!
//! A review branch's commits carry the review's title, summary, test plan and
//! reviewer list in the conventional form:
//!
//! ```text
//! Add frobnication to the widget
//!
//! Some prose about why.
//!
//! Test Plan: ran the widget tests
//! Reviewers: alice, bob
//! ```
//!
//! The title comes from the first commit's subject. Field lines are collected
//! across every commit on the branch; everything else accumulates into the
//! summary.

use crate::git::Commit;
use crate::text;

/// The review fields recovered from a branch's commits.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MessageFields {
    /// One-line review title.
    pub title: String,

    /// Prose description, possibly empty.
    pub summary: String,

    /// The stated test plan.
    pub test_plan: String,

    /// Reviewer usernames in order of first mention.
    pub reviewers: Vec<String>,
}

/// Why a branch's commits could not produce review fields.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    /// The branch has no commits beyond its base.
    #[error("branch has no commits")]
    NoCommits,

    /// The first commit has an empty subject.
    #[error("first commit has no subject to use as a title")]
    NoTitle,

    /// No commit stated a test plan.
    #[error("no 'Test Plan:' field found in any commit message")]
    NoTestPlan,
}

enum Section {
    Summary,
    TestPlan,
}

/// Parse review fields from the commits of a branch, oldest first.
pub fn parse_fields(commits: &[Commit]) -> Result<MessageFields, ParseError> {
    let first = commits.first().ok_or(ParseError::NoCommits)?;
    let title = text::lossy_unicode_to_ascii(first.subject.trim());
    if title.is_empty() {
        return Err(ParseError::NoTitle);
    }

    let mut fields = MessageFields {
        title,
        ..MessageFields::default()
    };
    let mut summary_lines: Vec<String> = Vec::new();
    let mut test_plan_lines: Vec<String> = Vec::new();

    for (index, commit) in commits.iter().enumerate() {
        // Later subjects are part of the story, not the title.
        if index > 0 && !commit.subject.trim().is_empty() {
            summary_lines.push(text::lossy_unicode_to_ascii(commit.subject.trim()));
        }

        let mut section = Section::Summary;
        for line in commit.body.lines() {
            if let Some(rest) = field_value(line, "test plan:") {
                section = Section::TestPlan;
                if !rest.is_empty() {
                    test_plan_lines.push(text::lossy_unicode_to_ascii(rest));
                }
            } else if let Some(rest) = field_value(line, "reviewers:") {
                section = Section::Summary;
                for name in rest
                    .split(|c: char| c == ',' || c == ' ')
                    .filter(|name| !name.is_empty())
                {
                    let name = name.to_owned();
                    if !fields.reviewers.contains(&name) {
                        fields.reviewers.push(name);
                    }
                }
            } else {
                let line = text::lossy_unicode_to_ascii(line.trim_end());
                match section {
                    Section::Summary => summary_lines.push(line),
                    Section::TestPlan => test_plan_lines.push(line),
                }
            }
        }
    }

    fields.summary = join_trimmed(summary_lines);
    fields.test_plan = join_trimmed(test_plan_lines);
    if fields.test_plan.is_empty() {
        return Err(ParseError::NoTestPlan);
    }
    Ok(fields)
}

fn field_value<'a>(line: &'a str, field: &str) -> Option<&'a str> {
    let lowered = line.to_lowercase();
    lowered
        .starts_with(field)
        .then(|| line[field.len()..].trim())
}

fn join_trimmed(lines: Vec<String>) -> String {
    let joined = lines.join("\n");
    joined.trim().to_owned()
}
