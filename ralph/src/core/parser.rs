//! Markdown plan document parser.
//!
//! Grammar (tolerant, line oriented):
//!
//! ```text
//! # Project: <name>                 (or any H1, or a `Project Name:` field)
//! ## Description                    (free text until the next H2)
//! ## Tasks
//! ### Task 1: <title>               (one block per H3 inside the tasks section)
//! - **ID**: task-001
//! - **Priority**: high|medium|low
//! - **Status**: ToDo|InProgress|Implemented|NeedsRework|Verified
//! - **Dependencies**: task-000, ...  (or "None")
//! - **Complexity**: 1..5
//! - **Tags**: a, b
//! - **Spec Reference**: docs/spec.md#section
//! - **Description**: text, continuing on following lines
//! - **Acceptance Criteria**:
//!   - [ ] unchecked criterion
//!   - [x] checked criterion
//! ```
//!
//! Parsing never fails. Blocks that carry no recognizable field are skipped,
//! which keeps half-written documents loadable; structural problems are
//! reported later by [`crate::core::validate`].

use std::sync::LazyLock;

use regex::Regex;

use crate::core::types::{AcceptanceCriterion, Plan, Priority, Task, TaskStatus};

const DEFAULT_PROJECT_NAME: &str = "Untitled Project";
const DEFAULT_COMPLEXITY: u8 = 3;

static CHECKBOX_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*[-*+]\s+\[([ xX])\]\s*(.*)$").expect("valid regex"));
static HEADING_ID_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^(?:(?P<id>task-\d+)|task[\s_]*#?\d+)\s*[:.)\-]\s*(?P<title>.+)$")
        .expect("valid regex")
});
static TASK_ID_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^task-\d+$").expect("valid regex"));

/// Labeled fields recognized in task blocks and the document header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Field {
    Id,
    Title,
    Priority,
    Status,
    Dependencies,
    Description,
    AcceptanceCriteria,
    SpecReference,
    Complexity,
    Tags,
    ProjectName,
    Generated,
}

impl Field {
    fn from_label(label: &str) -> Option<Self> {
        let label = label.trim().trim_end_matches(':').trim().to_ascii_lowercase();
        let field = match label.as_str() {
            "id" | "task id" => Self::Id,
            "title" | "name" => Self::Title,
            "priority" => Self::Priority,
            "status" => Self::Status,
            "dependencies" | "depends on" | "deps" | "dependency" => Self::Dependencies,
            "description" | "details" => Self::Description,
            "acceptance criteria" | "acceptance" | "criteria" => Self::AcceptanceCriteria,
            "spec reference" | "spec" | "spec ref" | "reference" | "specification" => {
                Self::SpecReference
            }
            "complexity" | "effort" => Self::Complexity,
            "tags" | "labels" => Self::Tags,
            "project" | "project name" => Self::ProjectName,
            "generated" | "generated at" | "generated on" => Self::Generated,
            _ => return None,
        };
        Some(field)
    }
}

/// A labeled field found on one line. `value_offset` is the byte offset of the
/// value within the line, used when rewriting a field in place.
#[derive(Debug, Clone, Copy)]
struct FieldLine<'a> {
    field: Field,
    value: &'a str,
    value_offset: usize,
}

/// Classified document line.
#[derive(Debug, Clone, Copy)]
enum Line<'a> {
    Heading { level: usize, text: &'a str },
    Checkbox { checked: bool, text: &'a str },
    Field(FieldLine<'a>),
    Bullet(&'a str),
    Text(&'a str),
    Blank,
}

fn classify(line: &str, in_fence: bool) -> Line<'_> {
    if line.trim().is_empty() {
        return Line::Blank;
    }
    if in_fence {
        return Line::Text(line);
    }
    let trimmed = line.trim_start();
    if trimmed.starts_with('#') {
        let level = trimmed.chars().take_while(|c| *c == '#').count();
        let rest = &trimmed[level..];
        if rest.is_empty() || rest.starts_with(' ') {
            return Line::Heading {
                level,
                text: rest.trim().trim_end_matches('#').trim(),
            };
        }
    }
    if let Some(caps) = CHECKBOX_RE.captures(line) {
        let checked = caps.get(1).is_some_and(|m| m.as_str() != " ");
        let text = caps.get(2).map_or("", |m| m.as_str().trim());
        return Line::Checkbox { checked, text };
    }
    if let Some(field) = parse_field(line) {
        return Line::Field(field);
    }
    for marker in ["- ", "* ", "+ "] {
        if let Some(rest) = trimmed.strip_prefix(marker) {
            return Line::Bullet(rest.trim());
        }
    }
    Line::Text(line.trim())
}

/// Parse `- **Label**: value`, `**Label:** value`, or `Label: value`.
fn parse_field(line: &str) -> Option<FieldLine<'_>> {
    let mut rest = line.trim_start();
    for marker in ["- ", "* ", "+ "] {
        if let Some(stripped) = rest.strip_prefix(marker) {
            rest = stripped.trim_start();
            break;
        }
    }

    let (label, tail) = if let Some(after_open) = rest.strip_prefix("**") {
        let close = after_open.find("**")?;
        let label = &after_open[..close];
        let tail = &after_open[close + 2..];
        if label.trim_end().ends_with(':') {
            (label, tail.trim_start().strip_prefix(':').unwrap_or(tail))
        } else {
            (label, tail.trim_start().strip_prefix(':')?)
        }
    } else {
        let (label, tail) = rest.split_once(':')?;
        (label, tail)
    };

    let field = Field::from_label(label)?;
    let tail = tail.trim_start();
    let value_offset = line.len() - tail.len();
    Some(FieldLine {
        field,
        value: tail.trim(),
        value_offset,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Section {
    Preamble,
    Description,
    Tasks,
    Other,
}

/// Line range of one task block: `heading` is the heading line, `end` is exclusive.
#[derive(Debug, Clone, Copy)]
struct BlockRange {
    heading: usize,
    end: usize,
}

#[derive(Debug, Default)]
struct Scan<'a> {
    project_name: Option<String>,
    description: Vec<&'a str>,
    generated_at: Option<String>,
    blocks: Vec<BlockRange>,
}

fn is_task_section(text: &str) -> bool {
    text.to_ascii_lowercase().contains("task")
}

fn is_description_section(text: &str) -> bool {
    matches!(
        text.to_ascii_lowercase().as_str(),
        "description" | "overview" | "summary" | "project description"
    )
}

fn strip_line_ending(raw: &str) -> &str {
    raw.trim_end_matches('\n').trim_end_matches('\r')
}

fn is_fence(line: &str) -> bool {
    let trimmed = line.trim_start();
    trimmed.starts_with("```") || trimmed.starts_with("~~~")
}

fn scan<'a>(lines: &[&'a str]) -> Scan<'a> {
    let has_task_section = lines.iter().any(|raw| {
        matches!(classify(strip_line_ending(raw), false), Line::Heading { level: 2, text } if is_task_section(text))
    });

    let mut out = Scan::default();
    let mut section = Section::Preamble;
    let mut open_block: Option<usize> = None;
    let mut in_fence = false;

    for (idx, &raw) in lines.iter().enumerate() {
        let line = strip_line_ending(raw);
        if is_fence(line) {
            in_fence = !in_fence;
            if open_block.is_none() && section == Section::Description {
                out.description.push(line);
            }
            continue;
        }

        match classify(line, in_fence) {
            Line::Heading { level, text } if level <= 2 => {
                if let Some(start) = open_block.take() {
                    out.blocks.push(BlockRange {
                        heading: start,
                        end: idx,
                    });
                }
                if level == 1 {
                    if out.project_name.is_none() {
                        let name = text
                            .split_once(':')
                            .filter(|(label, _)| Field::from_label(label) == Some(Field::ProjectName))
                            .map_or(text, |(_, value)| value.trim());
                        out.project_name = Some(name.to_string());
                    }
                    section = Section::Preamble;
                } else if is_task_section(text) {
                    section = Section::Tasks;
                } else if is_description_section(text) {
                    section = Section::Description;
                } else {
                    section = Section::Other;
                }
            }
            Line::Heading { level: 3, text }
                if section == Section::Tasks
                    || (!has_task_section && text.to_ascii_lowercase().starts_with("task")) =>
            {
                if let Some(start) = open_block.take() {
                    out.blocks.push(BlockRange {
                        heading: start,
                        end: idx,
                    });
                }
                open_block = Some(idx);
            }
            _ if open_block.is_some() => {}
            Line::Field(field) => match field.field {
                Field::ProjectName if out.project_name.is_none() && !field.value.is_empty() => {
                    out.project_name = Some(field.value.to_string());
                }
                Field::Generated if !field.value.is_empty() => {
                    out.generated_at = Some(field.value.to_string());
                }
                Field::Description
                    if matches!(section, Section::Preamble | Section::Description) =>
                {
                    out.description.push(field.value);
                }
                _ if section == Section::Description => out.description.push(line.trim()),
                _ => {}
            },
            Line::Blank if section == Section::Description => out.description.push(""),
            Line::Heading { .. } | Line::Blank => {}
            _ if section == Section::Description => out.description.push(line.trim()),
            _ => {}
        }
    }

    if let Some(start) = open_block {
        out.blocks.push(BlockRange {
            heading: start,
            end: lines.len(),
        });
    }
    out
}

/// Fields collected from one block before defaults and id synthesis apply.
#[derive(Debug, Default)]
struct RawTask {
    id: Option<String>,
    title: String,
    description: Vec<String>,
    priority: Option<Priority>,
    status: Option<TaskStatus>,
    dependencies: Vec<String>,
    criteria: Vec<AcceptanceCriterion>,
    spec_reference: Option<String>,
    complexity: Option<u8>,
    tags: Vec<String>,
    recognized: bool,
}

fn normalize_id(raw: &str) -> String {
    let cleaned = raw.trim().trim_matches('`').trim();
    if TASK_ID_RE.is_match(cleaned) {
        cleaned.to_ascii_lowercase()
    } else {
        cleaned.to_string()
    }
}

fn parse_dependency_list(value: &str, out: &mut Vec<String>) {
    for token in value.split(|c: char| c == ',' || c == ';' || c.is_whitespace()) {
        let token = token.trim().trim_matches('`').trim_matches('[').trim_matches(']');
        if token.is_empty() {
            continue;
        }
        let lower = token.to_ascii_lowercase();
        if matches!(lower.as_str(), "none" | "n/a" | "-" | "and" | "nil") {
            continue;
        }
        let id = normalize_id(token);
        if !out.contains(&id) {
            out.push(id);
        }
    }
}

fn parse_block(lines: &[&str], range: BlockRange) -> Option<RawTask> {
    let heading = match classify(strip_line_ending(lines[range.heading]), false) {
        Line::Heading { text, .. } => text,
        _ => return None,
    };

    let mut task = RawTask::default();
    match HEADING_ID_RE.captures(heading) {
        Some(caps) => {
            task.id = caps.name("id").map(|m| normalize_id(m.as_str()));
            task.title = caps.name("title").map_or("", |m| m.as_str()).trim().to_string();
        }
        None => task.title = heading.to_string(),
    }

    let mut current: Option<Field> = None;
    let mut in_fence = false;
    for raw in &lines[range.heading + 1..range.end] {
        let line = strip_line_ending(raw);
        if is_fence(line) {
            in_fence = !in_fence;
            if matches!(current, None | Some(Field::Description)) {
                task.description.push(line.to_string());
            }
            continue;
        }
        match classify(line, in_fence) {
            Line::Field(field) => {
                task.recognized = true;
                current = Some(field.field);
                apply_field(&mut task, field.field, field.value);
            }
            Line::Heading { text, .. } => match Field::from_label(text) {
                Some(field) => {
                    current = Some(field);
                    task.recognized = true;
                }
                None => current = None,
            },
            Line::Checkbox { checked, text } => {
                task.recognized = true;
                task.criteria.push(AcceptanceCriterion {
                    text: text.to_string(),
                    completed: checked,
                });
            }
            Line::Bullet(text) => match current {
                Some(Field::AcceptanceCriteria) => task.criteria.push(AcceptanceCriterion {
                    text: text.to_string(),
                    completed: false,
                }),
                Some(Field::Dependencies) => parse_dependency_list(text, &mut task.dependencies),
                Some(Field::Description) | None => task.description.push(format!("- {text}")),
                _ => {}
            },
            Line::Text(text) => {
                if matches!(current, Some(Field::Description) | None) {
                    task.description.push(text.to_string());
                }
            }
            Line::Blank => {
                if matches!(current, Some(Field::Description) | None) {
                    task.description.push(String::new());
                }
            }
        }
    }

    if !task.recognized || task.title.is_empty() {
        return None;
    }
    Some(task)
}

fn apply_field(task: &mut RawTask, field: Field, value: &str) {
    match field {
        Field::Id if !value.is_empty() => task.id = Some(normalize_id(value)),
        Field::Title if !value.is_empty() => task.title = value.to_string(),
        Field::Priority => task.priority = value.parse().ok(),
        Field::Status => task.status = value.parse().ok(),
        Field::Dependencies => parse_dependency_list(value, &mut task.dependencies),
        Field::Description if !value.is_empty() => task.description.push(value.to_string()),
        Field::SpecReference if !value.is_empty() => {
            task.spec_reference = Some(value.trim_matches('`').to_string());
        }
        Field::Complexity => {
            task.complexity = value
                .split(|c: char| !c.is_ascii_digit())
                .find(|part| !part.is_empty())
                .and_then(|digits| digits.parse::<u8>().ok())
                .map(|n| n.clamp(1, 5));
        }
        Field::Tags => task.tags.extend(
            value
                .split(',')
                .map(|tag| tag.trim().trim_matches('`').to_string())
                .filter(|tag| !tag.is_empty()),
        ),
        _ => {}
    }
}

fn join_paragraphs(lines: &[impl AsRef<str>]) -> String {
    let joined = lines
        .iter()
        .map(|line| line.as_ref())
        .collect::<Vec<_>>()
        .join("\n");
    joined.trim().to_string()
}

/// Parse blocks in order, synthesizing `task-NNN` ids for blocks without one.
fn parse_tasks(lines: &[&str], blocks: &[BlockRange]) -> Vec<(BlockRange, Task)> {
    let mut tasks = Vec::new();
    for range in blocks {
        let Some(raw) = parse_block(lines, *range) else {
            continue;
        };
        let index = tasks.len();
        let task = Task {
            id: raw.id.unwrap_or_else(|| format!("task-{:03}", index + 1)),
            title: raw.title,
            description: join_paragraphs(&raw.description),
            priority: raw.priority.unwrap_or_default(),
            dependencies: raw.dependencies,
            acceptance_criteria: raw.criteria,
            spec_reference: raw.spec_reference,
            complexity: raw.complexity.unwrap_or(DEFAULT_COMPLEXITY),
            tags: raw.tags,
            status: raw.status.unwrap_or_default(),
        };
        tasks.push((*range, task));
    }
    tasks
}

/// Parse a plan document. Never fails; an unusable document yields zero tasks.
pub fn parse(document: &str) -> Plan {
    let lines: Vec<&str> = document.split_inclusive('\n').collect();
    let scanned = scan(&lines);
    let tasks: Vec<Task> = parse_tasks(&lines, &scanned.blocks)
        .into_iter()
        .map(|(_, task)| task)
        .collect();
    Plan {
        project_name: scanned
            .project_name
            .unwrap_or_else(|| DEFAULT_PROJECT_NAME.to_string()),
        description: join_paragraphs(&scanned.description),
        total_tasks: tasks.len(),
        tasks,
        generated_at: scanned.generated_at,
    }
}

/// Rewrite the `Status` field of one task, leaving every other byte untouched.
///
/// Inserts a status line after the id line (or the heading) when the block has
/// none. Returns `None` when no block resolves to `task_id`.
pub fn update_task_status(document: &str, task_id: &str, status: TaskStatus) -> Option<String> {
    let lines: Vec<&str> = document.split_inclusive('\n').collect();
    let scanned = scan(&lines);
    let (range, _) = parse_tasks(&lines, &scanned.blocks)
        .into_iter()
        .find(|(_, task)| task.id == task_id)?;

    let mut status_line = None;
    let mut id_line = None;
    let mut in_fence = false;
    for idx in range.heading + 1..range.end {
        let line = strip_line_ending(lines[idx]);
        if is_fence(line) {
            in_fence = !in_fence;
            continue;
        }
        if let Line::Field(field) = classify(line, in_fence) {
            match field.field {
                Field::Status if status_line.is_none() => {
                    status_line = Some((idx, field.value_offset));
                }
                Field::Id if id_line.is_none() => id_line = Some(idx),
                _ => {}
            }
        }
    }

    let mut out = String::with_capacity(document.len() + 32);
    match status_line {
        Some((idx, offset)) => {
            for (i, raw) in lines.iter().enumerate() {
                if i == idx {
                    let body = strip_line_ending(raw);
                    out.push_str(&body[..offset]);
                    out.push_str(status.as_str());
                    out.push_str(&raw[body.len()..]);
                } else {
                    out.push_str(raw);
                }
            }
        }
        None => {
            let anchor = id_line.unwrap_or(range.heading);
            for (i, raw) in lines.iter().enumerate() {
                out.push_str(raw);
                if i == anchor {
                    if !raw.ends_with('\n') {
                        out.push('\n');
                    }
                    out.push_str(&format!("- **Status**: {status}\n"));
                }
            }
        }
    }
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
# Project: Widget Service

## Description
A small service that serves widgets.

Generated: 2026-01-02T03:04:05Z

## Tasks

### Task 1: Scaffold the crate
- **ID**: task-001
- **Priority**: high
- **Status**: Implemented
- **Dependencies**: None
- **Complexity**: 2
- **Tags**: setup, rust
- **Description**: Create the workspace.
  Include a README.
- **Acceptance Criteria**:
  - [x] cargo build passes
  - [ ] README exists

### Task 2: Serve widgets
- **ID**: task-002
- **Dependencies**: task-001
- **Spec Reference**: docs/spec.md#widgets
- **Acceptance Criteria**:
  - [ ] GET /widgets returns 200

## Notes
Anything here is ignored.
";

    #[test]
    fn parses_header_and_tasks() {
        let plan = parse(SAMPLE);
        assert_eq!(plan.project_name, "Widget Service");
        assert_eq!(plan.description, "A small service that serves widgets.");
        assert_eq!(plan.generated_at.as_deref(), Some("2026-01-02T03:04:05Z"));
        assert_eq!(plan.total_tasks, 2);

        let first = &plan.tasks[0];
        assert_eq!(first.id, "task-001");
        assert_eq!(first.title, "Scaffold the crate");
        assert_eq!(first.priority, Priority::High);
        assert_eq!(first.status, TaskStatus::Implemented);
        assert!(first.dependencies.is_empty());
        assert_eq!(first.complexity, 2);
        assert_eq!(first.tags, vec!["setup", "rust"]);
        assert_eq!(first.description, "Create the workspace.\nInclude a README.");
        assert_eq!(
            first.acceptance_criteria,
            vec![
                AcceptanceCriterion {
                    text: "cargo build passes".to_string(),
                    completed: true
                },
                AcceptanceCriterion {
                    text: "README exists".to_string(),
                    completed: false
                },
            ]
        );

        let second = &plan.tasks[1];
        assert_eq!(second.dependencies, vec!["task-001"]);
        assert_eq!(second.spec_reference.as_deref(), Some("docs/spec.md#widgets"));
    }

    #[test]
    fn missing_fields_take_defaults() {
        let plan = parse("# P\n\n## Tasks\n\n### Task 1: Bare\n- **ID**: task-001\n");
        let task = &plan.tasks[0];
        assert_eq!(task.priority, Priority::Medium);
        assert_eq!(task.status, TaskStatus::ToDo);
        assert!(task.dependencies.is_empty());
        assert_eq!(task.complexity, DEFAULT_COMPLEXITY);
    }

    #[test]
    fn synthesizes_ids_in_document_order() {
        let doc = "## Tasks\n### First\n- Priority: low\n### Second\n- Priority: high\n";
        let plan = parse(doc);
        let ids: Vec<&str> = plan.tasks.iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ids, vec!["task-001", "task-002"]);
        assert_eq!(plan.project_name, DEFAULT_PROJECT_NAME);
    }

    #[test]
    fn heading_id_is_used_when_no_id_field() {
        let plan = parse("## Tasks\n### task-007: Heading id\n- **Priority**: low\n");
        assert_eq!(plan.tasks[0].id, "task-007");
        assert_eq!(plan.tasks[0].title, "Heading id");
    }

    #[test]
    fn skips_blocks_without_fields() {
        let doc = "## Tasks\n### Just a note\nsome prose\n### Task 2: Real\n- **ID**: task-002\n";
        let plan = parse(doc);
        assert_eq!(plan.total_tasks, 1);
        assert_eq!(plan.tasks[0].id, "task-002");
    }

    #[test]
    fn accepts_colon_inside_bold_and_plain_labels() {
        let doc = "## Tasks\n### A\n**ID:** task-010\nStatus: in progress\nDependencies:\n- task-001\n- task-002\n";
        let plan = parse(doc);
        let task = &plan.tasks[0];
        assert_eq!(task.id, "task-010");
        assert_eq!(task.status, TaskStatus::InProgress);
        assert_eq!(task.dependencies, vec!["task-001", "task-002"]);
    }

    #[test]
    fn empty_document_has_no_tasks() {
        let plan = parse("");
        assert_eq!(plan.total_tasks, 0);
        assert!(plan.tasks.is_empty());
    }

    #[test]
    fn reparsing_is_idempotent() {
        assert_eq!(parse(SAMPLE), parse(SAMPLE));
    }

    #[test]
    fn update_rewrites_only_the_target_status() {
        let updated =
            update_task_status(SAMPLE, "task-001", TaskStatus::Verified).expect("task found");
        assert!(updated.contains("- **Status**: Verified\n"));
        assert_eq!(updated.len(), SAMPLE.len() + "Verified".len() - "Implemented".len());
        let plan = parse(&updated);
        assert_eq!(plan.tasks[0].status, TaskStatus::Verified);
        assert_eq!(plan.tasks[1].status, TaskStatus::ToDo);
    }

    #[test]
    fn update_inserts_status_when_absent() {
        let updated =
            update_task_status(SAMPLE, "task-002", TaskStatus::Implemented).expect("task found");
        let plan = parse(&updated);
        assert_eq!(plan.tasks[1].status, TaskStatus::Implemented);
        assert!(updated.contains("- **ID**: task-002\n- **Status**: Implemented\n"));
    }

    #[test]
    fn update_unknown_task_returns_none() {
        assert!(update_task_status(SAMPLE, "task-999", TaskStatus::Implemented).is_none());
    }
}
