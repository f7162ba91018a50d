//! `${...}` placeholder resolution.
//!
//! The expression language is deliberately tiny: dotted paths only.
//!
//! | Expression | Value |
//! |---|---|
//! | `${user_input}` | the run's original input |
//! | `${loop_iteration}` | the innermost loop counter (0-based) |
//! | `${steps.<id>.output}` | output of a recorded step |
//! | `${steps.<id>.<field>}` | `success`, `error`, `selected_branch`, `iterations_completed`, `branch_results`, `duration_ms` |
//!
//! `$${` produces a literal `${`. Nothing is ever evaluated; resolved values
//! are substituted verbatim and never re-scanned.

use std::collections::BTreeMap;

use crate::context::{RunContext, StepResult};
use crate::error::{Error, Result};

/// A field of a recorded [`StepResult`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepField {
    Output,
    Success,
    Error,
    SelectedBranch,
    IterationsCompleted,
    BranchResults,
    DurationMs,
}

impl StepField {
    fn parse(name: &str) -> Option<Self> {
        Some(match name {
            "output" => Self::Output,
            "success" => Self::Success,
            "error" => Self::Error,
            "selected_branch" => Self::SelectedBranch,
            "iterations_completed" => Self::IterationsCompleted,
            "branch_results" => Self::BranchResults,
            "duration_ms" => Self::DurationMs,
            _ => return None,
        })
    }

    fn name(self) -> &'static str {
        match self {
            Self::Output => "output",
            Self::Success => "success",
            Self::Error => "error",
            Self::SelectedBranch => "selected_branch",
            Self::IterationsCompleted => "iterations_completed",
            Self::BranchResults => "branch_results",
            Self::DurationMs => "duration_ms",
        }
    }

    fn read(self, step_id: &str, result: &StepResult) -> Result<String> {
        let missing = || {
            Error::Definition(format!(
                "step `{}` has no `{}` (wrong step kind)",
                step_id,
                self.name()
            ))
        };
        Ok(match self {
            Self::Output => result.output.clone(),
            Self::Success => result.success.to_string(),
            Self::Error => result.error.clone().unwrap_or_default(),
            Self::SelectedBranch => result.selected_branch.clone().ok_or_else(missing)?,
            Self::IterationsCompleted => result
                .iterations_completed
                .ok_or_else(missing)?
                .to_string(),
            Self::BranchResults => {
                let outputs: BTreeMap<&str, &str> = result
                    .branch_results
                    .as_ref()
                    .ok_or_else(missing)?
                    .iter()
                    .map(|(id, r)| (id.as_str(), r.output.as_str()))
                    .collect();
                serde_json::to_string(&outputs)?
            }
            Self::DurationMs => result.duration_ms.to_string(),
        })
    }
}

/// A parsed placeholder expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Expr {
    UserInput,
    LoopIteration,
    Step { step_id: String, field: StepField },
}

impl Expr {
    fn parse(source: &str) -> Result<Self> {
        let path = source.trim();
        let segments: Vec<&str> = path.split('.').collect();
        if segments.iter().any(|s| !is_segment(s)) {
            return Err(Error::Definition(format!("malformed expression `${{{}}}`", path)));
        }
        match segments.as_slice() {
            ["user_input"] => Ok(Self::UserInput),
            ["loop_iteration"] => Ok(Self::LoopIteration),
            ["steps", step_id, field] => {
                let field = StepField::parse(field).ok_or_else(|| {
                    Error::Definition(format!("unknown step field `{}` in `${{{}}}`", field, path))
                })?;
                Ok(Self::Step {
                    step_id: step_id.to_string(),
                    field,
                })
            }
            _ => Err(Error::Definition(format!("unknown expression `${{{}}}`", path))),
        }
    }

    fn evaluate(&self, ctx: &RunContext) -> Result<String> {
        match self {
            Self::UserInput => Ok(ctx.user_input().to_string()),
            Self::LoopIteration => ctx.loop_iteration().map(|i| i.to_string()).ok_or_else(|| {
                Error::Scope("`${loop_iteration}` used outside a loop".to_string())
            }),
            Self::Step { step_id, field } => {
                let result = ctx.step(step_id).ok_or_else(|| Error::UnresolvedReference {
                    step_id: step_id.clone(),
                    expression: format!("steps.{}.{}", step_id, field.name()),
                })?;
                field.read(step_id, result)
            }
        }
    }
}

fn is_segment(s: &str) -> bool {
    !s.is_empty() && s.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Part {
    Literal(String),
    Expr(Expr),
}

/// A parsed template string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Template {
    parts: Vec<Part>,
}

impl Template {
    /// Parse a template. Fails on unterminated or malformed placeholders.
    pub fn parse(source: &str) -> Result<Self> {
        let mut parts = Vec::new();
        let mut literal = String::new();
        let mut rest = source;

        while let Some(pos) = rest.find('$') {
            literal.push_str(&rest[..pos]);
            let tail = &rest[pos..];
            if let Some(after) = tail.strip_prefix("$${") {
                literal.push_str("${");
                rest = after;
            } else if let Some(after) = tail.strip_prefix("${") {
                let end = after.find('}').ok_or_else(|| {
                    Error::Definition(format!("unterminated placeholder in `{}`", source))
                })?;
                if !literal.is_empty() {
                    parts.push(Part::Literal(std::mem::take(&mut literal)));
                }
                parts.push(Part::Expr(Expr::parse(&after[..end])?));
                rest = &after[end + 1..];
            } else {
                literal.push('$');
                rest = &tail[1..];
            }
        }
        literal.push_str(rest);
        if !literal.is_empty() {
            parts.push(Part::Literal(literal));
        }
        Ok(Self { parts })
    }

    /// Step ids this template reads from.
    pub fn step_references(&self) -> impl Iterator<Item = &str> {
        self.parts.iter().filter_map(|p| match p {
            Part::Expr(Expr::Step { step_id, .. }) => Some(step_id.as_str()),
            _ => None,
        })
    }

    /// Substitute every placeholder.
    pub fn render(&self, ctx: &RunContext) -> Result<String> {
        let mut out = String::new();
        for part in &self.parts {
            match part {
                Part::Literal(text) => out.push_str(text),
                Part::Expr(expr) => out.push_str(&expr.evaluate(ctx)?),
            }
        }
        Ok(out)
    }
}

/// Parse and render in one go.
pub fn resolve(template: &str, ctx: &RunContext) -> Result<String> {
    Template::parse(template)?.render(ctx)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Operator {
    Eq,
    Ne,
    Contains,
}

/// A boolean expression for loop exit conditions.
///
/// Either `lhs == rhs`, `lhs != rhs`, `lhs contains rhs` (case-insensitive),
/// or a single template judged by truthiness. Operators are only recognised
/// outside placeholders, and each side is resolved on its own, so resolved
/// text can never introduce an operator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Condition {
    lhs: Template,
    comparison: Option<(Operator, Template)>,
}

const FALSY: &[&str] = &["", "false", "0", "no", "none", "null"];

impl Condition {
    pub fn parse(source: &str) -> Result<Self> {
        match find_operator(source) {
            Some((pos, op, len)) => Ok(Self {
                lhs: Template::parse(source[..pos].trim())?,
                comparison: Some((op, Template::parse(source[pos + len..].trim())?)),
            }),
            None => Ok(Self {
                lhs: Template::parse(source.trim())?,
                comparison: None,
            }),
        }
    }

    pub fn step_references(&self) -> impl Iterator<Item = &str> {
        self.lhs
            .step_references()
            .chain(self.comparison.iter().flat_map(|(_, rhs)| rhs.step_references()))
    }

    pub fn evaluate(&self, ctx: &RunContext) -> Result<bool> {
        let lhs = self.lhs.render(ctx)?;
        let Some((op, rhs)) = &self.comparison else {
            return Ok(is_truthy(&lhs));
        };
        let (lhs, rhs) = (lhs.trim().to_string(), rhs.render(ctx)?.trim().to_string());
        Ok(match op {
            Operator::Eq => lhs == rhs,
            Operator::Ne => lhs != rhs,
            Operator::Contains => lhs.to_lowercase().contains(&rhs.to_lowercase()),
        })
    }
}

/// Truthiness of a resolved value.
pub fn is_truthy(value: &str) -> bool {
    !FALSY.contains(&value.trim().to_lowercase().as_str())
}

fn find_operator(source: &str) -> Option<(usize, Operator, usize)> {
    const OPERATORS: &[(&str, Operator)] = &[
        (" == ", Operator::Eq),
        (" != ", Operator::Ne),
        (" contains ", Operator::Contains),
    ];
    let mut depth = 0usize;
    let bytes = source.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'$' && bytes.get(i + 1) == Some(&b'{') {
            depth += 1;
            i += 2;
            continue;
        }
        if bytes[i] == b'}' && depth > 0 {
            depth -= 1;
        } else if depth == 0 {
            for (token, op) in OPERATORS {
                if bytes[i..].starts_with(token.as_bytes()) {
                    return Some((i, *op, token.len()));
                }
            }
        }
        i += 1;
    }
    None
}
