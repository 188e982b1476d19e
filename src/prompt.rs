//! Prompt builders for fix attempts and treatment generation.

use crate::trial::Condition;

/// Preamble for the flat-context condition: one generated file at the root.
pub const FLAT_CONTEXT_PREAMBLE: &str = "Before making changes, read CLAUDE.md at the repository \
root for an overview of the codebase.\n\n";

/// Preamble for the structured-layer condition: per-directory context files.
pub const STRUCTURED_LAYER_PREAMBLE: &str = "Before making changes, read the AGENTS.md files \
(starting with CLAUDE.md at the root) to understand:\n\
- Where relevant code is located\n\
- What pitfalls to avoid\n\
- What contracts must be maintained\n\n";

/// Condition-appropriate preamble, or none for baseline.
pub fn preamble_for(condition: Condition) -> &'static str {
    match condition {
        Condition::Baseline => "",
        Condition::FlatContext => FLAT_CONTEXT_PREAMBLE,
        Condition::StructuredLayer => STRUCTURED_LAYER_PREAMBLE,
    }
}

pub fn from_commit_message(message: &str, condition: Condition) -> String {
    format!(
        "{}Fix the following bug:\n\n{}\n\nThe fix should make the existing tests pass.",
        preamble_for(condition),
        message
    )
}

pub fn from_failing_test(test_output: &str, condition: Condition) -> String {
    format!(
        "{}The following test is failing:\n\n```\n{}\n```\n\n\
         Find and fix the bug that causes this test to fail. Do not modify the test itself.",
        preamble_for(condition),
        test_output
    )
}

pub fn from_issue(title: &str, body: &str, condition: Condition) -> String {
    format!(
        "{}Fix the following bug:\n\n**{}**\n\n{}\n\nThe fix should make the existing tests pass.",
        preamble_for(condition),
        title,
        body
    )
}

/// Generation prompt for the flat-context treatment: a single repository
/// overview file.
pub fn flat_generation() -> String {
    "Explore this repository and write a single CLAUDE.md file at the repository root \
     summarizing: the project's purpose, the layout of the source tree, how to build and \
     run the tests, and the main modules with one line each. Write only that file."
        .to_string()
}

/// Generation prompt for the structured-layer treatment: per-directory
/// knowledge files plus a root index.
pub fn structured_generation() -> String {
    "Explore this repository and generate a structured knowledge layer: a CLAUDE.md at the \
     repository root pointing into per-directory AGENTS.md files. Each AGENTS.md should cover, \
     for its directory: what the code there is responsible for, the invariants and contracts \
     other code relies on, known pitfalls, and pointers to the most relevant files. Keep each \
     file short and factual. Create only these context files; do not modify source code."
        .to_string()
}

/// Generation prompt for a condition, if it has one.
pub fn generation_for(condition: Condition) -> Option<String> {
    match condition {
        Condition::Baseline => None,
        Condition::FlatContext => Some(flat_generation()),
        Condition::StructuredLayer => Some(structured_generation()),
    }
}
