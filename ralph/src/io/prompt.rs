//! Task prompt rendering.
//!
//! The template marks each section as `required` or `droppable`; when the
//! rendered prompt exceeds the byte budget, droppable sections go first
//! (reference text, then dependencies, then the previous failure).

use std::fs;
use std::path::Path;
use std::sync::LazyLock;

use anyhow::Result;
use minijinja::{Environment, context};
use regex::Regex;
use serde::Serialize;
use tracing::debug;

use crate::core::types::{Plan, Task};

const TASK_TEMPLATE: &str = include_str!("prompts/task.md");

/// Default prompt budget in bytes.
pub const DEFAULT_PROMPT_BUDGET: usize = 60_000;

static SECTION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"<!--\s*section:(\w+)\s+(required|droppable)\s*-->").expect("valid regex")
});
static HEADING_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(#{1,6})\s+(.+?)\s*#*\s*$").expect("valid regex"));

/// Text pulled from a task's spec reference.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReferenceText {
    pub source: String,
    pub text: String,
}

#[derive(Debug, Clone, Serialize)]
struct DependencyContext {
    id: String,
    title: String,
}

/// All inputs needed to render one task prompt.
#[derive(Debug, Clone)]
pub struct PromptInputs<'a> {
    pub project: &'a str,
    pub plan_path: &'a Path,
    pub task: &'a Task,
    pub dependencies: Vec<&'a Task>,
    pub attempt: u32,
    pub previous_error: Option<&'a str>,
    pub reference: Option<ReferenceText>,
}

impl<'a> PromptInputs<'a> {
    /// Gather inputs for `task`, reading its spec reference relative to `project_root`.
    pub fn for_task(
        plan: &'a Plan,
        task: &'a Task,
        project_root: &Path,
        plan_path: &'a Path,
        attempt: u32,
        previous_error: Option<&'a str>,
    ) -> Self {
        let dependencies = task
            .dependencies
            .iter()
            .filter_map(|dep| plan.task(dep))
            .collect();
        let reference = task
            .spec_reference
            .as_deref()
            .and_then(|reference| load_reference(project_root, reference));
        Self {
            project: &plan.project_name,
            plan_path,
            task,
            dependencies,
            attempt,
            previous_error,
            reference,
        }
    }
}

/// Render the task prompt, trimmed to `budget_bytes`.
pub fn render_task_prompt(inputs: &PromptInputs<'_>, budget_bytes: usize) -> Result<String> {
    let mut env = Environment::new();
    env.add_template("task", TASK_TEMPLATE)?;
    let dependencies: Vec<DependencyContext> = inputs
        .dependencies
        .iter()
        .map(|task| DependencyContext {
            id: task.id.clone(),
            title: task.title.clone(),
        })
        .collect();
    let rendered = env.get_template("task")?.render(context! {
        project => inputs.project,
        plan_path => inputs.plan_path.display().to_string(),
        task => inputs.task,
        dependencies => dependencies,
        attempt => inputs.attempt,
        previous_error => inputs.previous_error.map(str::trim).filter(|s| !s.is_empty()),
        reference => inputs.reference.as_ref(),
    })?;

    let mut sections = parse_sections(&rendered);
    apply_budget_to_sections(&mut sections, budget_bytes);
    Ok(render_sections(&sections))
}

/// Resolve `path[#anchor]` against the project root.
///
/// With an anchor, only the matching heading's section is returned (falling
/// back to the whole file when no heading matches). Missing files yield `None`.
pub fn load_reference(project_root: &Path, reference: &str) -> Option<ReferenceText> {
    let (file, anchor) = match reference.split_once('#') {
        Some((file, anchor)) => (file.trim(), Some(anchor.trim())),
        None => (reference.trim(), None),
    };
    if file.is_empty() || file.contains("://") {
        return None;
    }
    let path = project_root.join(file);
    let contents = match fs::read_to_string(&path) {
        Ok(contents) => contents,
        Err(err) => {
            debug!(path = %path.display(), %err, "spec reference not readable");
            return None;
        }
    };
    let text = anchor
        .filter(|a| !a.is_empty())
        .and_then(|a| extract_section(&contents, a))
        .unwrap_or(contents);
    Some(ReferenceText {
        source: reference.trim().to_string(),
        text: text.trim().to_string(),
    })
}

fn slugify(heading: &str) -> String {
    let mut slug = String::with_capacity(heading.len());
    for c in heading.trim().chars() {
        if c.is_alphanumeric() {
            slug.extend(c.to_lowercase());
        } else if c == ' ' || c == '-' || c == '_' {
            slug.push('-');
        }
    }
    slug
}

/// The section under the heading whose slug equals `anchor`, up to the next
/// heading of the same or higher level.
fn extract_section(contents: &str, anchor: &str) -> Option<String> {
    let wanted = slugify(anchor);
    let mut level = None;
    let mut out = Vec::new();
    for line in contents.lines() {
        if let Some(caps) = HEADING_RE.captures(line) {
            let depth = caps[1].len();
            match level {
                Some(open) if depth <= open => break,
                None if slugify(&caps[2]) == wanted => level = Some(depth),
                _ => {}
            }
        }
        if level.is_some() {
            out.push(line);
        }
    }
    level.map(|_| out.join("\n"))
}

/// A parsed section from rendered template output.
#[derive(Debug, Clone)]
struct ParsedSection {
    key: String,
    required: bool,
    content: String,
}

/// Split rendered output at `<!-- section:KEY required|droppable -->` markers.
/// Empty droppable sections are omitted.
fn parse_sections(rendered: &str) -> Vec<ParsedSection> {
    let markers: Vec<_> = SECTION_RE.captures_iter(rendered).collect();
    let mut sections = Vec::new();
    for (i, caps) in markers.iter().enumerate() {
        let (Some(whole), Some(key), Some(kind)) = (caps.get(0), caps.get(1), caps.get(2)) else {
            continue;
        };
        let required = kind.as_str() == "required";
        let end = markers
            .get(i + 1)
            .and_then(|next| next.get(0))
            .map_or(rendered.len(), |next| next.start());
        let content = rendered[whole.end()..end].trim().to_string();
        if !content.is_empty() || required {
            sections.push(ParsedSection {
                key: key.as_str().to_string(),
                required,
                content,
            });
        }
    }
    sections
}

fn apply_budget_to_sections(sections: &mut Vec<ParsedSection>, budget: usize) {
    let total_len =
        |secs: &[ParsedSection]| -> usize { secs.iter().map(|s| s.content.len()).sum() };

    for key in ["reference", "dependencies", "failure"] {
        if total_len(sections) <= budget {
            return;
        }
        if let Some(idx) = sections.iter().position(|s| s.key == key && !s.required) {
            debug!(
                section = key,
                bytes_dropped = sections[idx].content.len(),
                "dropped section for budget"
            );
            sections.remove(idx);
        }
    }

    let total = total_len(sections);
    if total <= budget {
        return;
    }
    // Still over: trim the task description section, which carries free text.
    if let Some(task) = sections.iter_mut().find(|s| s.key == "task") {
        let over = total - budget;
        let keep = task.content.len().saturating_sub(over + 12);
        let cut = floor_char_boundary(&task.content, keep);
        task.content.truncate(cut);
        task.content.push_str("\n[truncated]");
        debug!(kept = cut, "truncated task section for budget");
    }
}

fn floor_char_boundary(s: &str, index: usize) -> usize {
    if index >= s.len() {
        return s.len();
    }
    (0..=index).rev().find(|&i| s.is_char_boundary(i)).unwrap_or(0)
}

fn render_sections(sections: &[ParsedSection]) -> String {
    sections
        .iter()
        .map(|s| s.content.as_str())
        .collect::<Vec<_>>()
        .join("\n\n")
}
