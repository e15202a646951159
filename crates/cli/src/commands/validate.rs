use std::fs;
use std::path::Path;

use chrono::Utc;
use expensa_core::domain::workflow::{WorkflowDraft, WorkflowId};
use serde_json::json;

use crate::commands::{CommandResult, EXIT_OPERATION};

/// Checks a create-request body offline; nothing is written.
pub fn run(path: &Path) -> CommandResult {
    let raw = match fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(error) => {
            return CommandResult::failure(
                "validate",
                "read_file",
                format!("could not read `{}`: {error}", path.display()),
                EXIT_OPERATION,
            );
        }
    };

    let draft: WorkflowDraft = match serde_json::from_str(&raw) {
        Ok(draft) => draft,
        Err(error) => {
            return CommandResult::failure(
                "validate",
                "parse",
                format!("`{}` is not a workflow definition: {error}", path.display()),
                EXIT_OPERATION,
            );
        }
    };

    let definition = draft.into_definition(WorkflowId::new("validate"), Utc::now());
    match definition.validate() {
        Ok(()) => CommandResult::success_with(
            "validate",
            format!("workflow `{}` is valid", definition.name),
            Some(json!({
                "name": definition.name,
                "isActive": definition.is_active,
                "steps": definition
                    .ordered_steps()
                    .iter()
                    .map(|step| json!({
                        "stepNumber": step.step_number,
                        "name": step.name,
                        "target": step.target.to_string(),
                        "slaHours": step.sla_hours,
                    }))
                    .collect::<Vec<_>>(),
                "onReturnPolicy": definition.on_return_policy.as_str(),
            })),
        ),
        Err(error) => {
            CommandResult::failure("validate", "validation", error.to_string(), EXIT_OPERATION)
        }
    }
}
