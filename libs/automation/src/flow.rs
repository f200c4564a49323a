//! Conversation flow definitions and the step state machine.
//!
//! A flow is an ordered step list with explicit `next_step_id` links and
//! optional `skip_when` expressions. The engine is pure: it takes the
//! current cursor, the variable map, and (optionally) the user's reply, and
//! returns the actions to send plus the new cursor. Persistence stays with
//! the caller.

use std::collections::HashMap;

use omc_core::{Button, Error, Result};
use omc_storage::ChatbotFlow;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::expr;

/// Ceiling on steps executed per advance; flows with link cycles stop here instead of spinning.
const MAX_STEPS_PER_ADVANCE: usize = 64;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FlowButton {
    pub id: String,
    pub title: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FlowBranch {
    pub when: String,
    pub next_step_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StepKind {
    SendText {
        text: String,
        #[serde(default)]
        store_as: Option<String>,
    },
    SendButtons {
        text: String,
        buttons: Vec<FlowButton>,
        #[serde(default)]
        store_as: Option<String>,
    },
    CollectInput {
        #[serde(default)]
        prompt: Option<String>,
        store_as: String,
    },
    Branch {
        branches: Vec<FlowBranch>,
    },
    End,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FlowStep {
    pub id: String,
    #[serde(flatten)]
    pub kind: StepKind,
    #[serde(default)]
    pub skip_when: Option<String>,
    #[serde(default)]
    pub next_step_id: Option<String>,
}

impl FlowStep {
    /// Steps that hold the cursor until the user's next message.
    fn waits_for_input(&self) -> Option<&str> {
        match &self.kind {
            StepKind::SendText { store_as, .. } | StepKind::SendButtons { store_as, .. } => {
                store_as.as_deref()
            }
            StepKind::CollectInput { store_as, .. } => Some(store_as),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FlowDefinition {
    pub id: Uuid,
    pub steps: Vec<FlowStep>,
}

impl FlowDefinition {
    pub fn parse(flow: &ChatbotFlow) -> Result<Self> {
        let steps: Vec<FlowStep> = serde_json::from_value(flow.steps.clone())
            .map_err(|err| Error::invalid_input("malformed flow steps").with_source(err))?;
        Ok(Self { id: flow.id, steps })
    }

    pub fn first_step_id(&self) -> Option<&str> {
        self.steps.first().map(|s| s.id.as_str())
    }

    fn step(&self, id: &str) -> Option<&FlowStep> {
        self.steps.iter().find(|s| s.id == id)
    }
}

/// What the engine asks the caller to emit.
#[derive(Debug, Clone, PartialEq)]
pub enum FlowAction {
    SendText(String),
    SendButtons { text: String, buttons: Vec<Button> },
}

/// The user's reply feeding a waiting step. Button presses carry the label
/// so `{store_as}_title` can be recorded next to `{store_as}`.
#[derive(Debug, Clone)]
pub struct FlowInput {
    pub value: String,
    pub title: Option<String>,
}

#[derive(Debug)]
pub struct FlowOutcome {
    pub actions: Vec<FlowAction>,
    /// `None` means the flow ended and the session resets to the null flow.
    pub next_step_id: Option<String>,
    pub variables: HashMap<String, String>,
}

/// Advances the flow. With a cursor set, the incoming reply is stored under
/// the waiting step's `store_as` first; execution then walks steps until one
/// waits for input again or the flow ends.
pub fn advance(
    def: &FlowDefinition,
    current_step_id: Option<&str>,
    mut variables: HashMap<String, String>,
    input: Option<FlowInput>,
) -> Result<FlowOutcome> {
    let mut actions = Vec::new();

    let mut cursor: Option<String> = match current_step_id {
        Some(step_id) => {
            let step = def.step(step_id).ok_or_else(|| {
                Error::invalid_input(format!("unknown flow step {step_id}"))
            })?;
            if let (Some(store_as), Some(input)) = (step.waits_for_input(), input) {
                variables.insert(store_as.to_string(), input.value);
                if let Some(title) = input.title {
                    variables.insert(format!("{store_as}_title"), title);
                }
            }
            step.next_step_id.clone()
        }
        None => def.first_step_id().map(str::to_string),
    };

    for _ in 0..MAX_STEPS_PER_ADVANCE {
        let Some(step_id) = cursor.clone() else {
            return Ok(FlowOutcome {
                actions,
                next_step_id: None,
                variables,
            });
        };
        let Some(step) = def.step(&step_id) else {
            tracing::warn!(flow = %def.id, step = %step_id, "flow references missing step");
            return Ok(FlowOutcome {
                actions,
                next_step_id: None,
                variables,
            });
        };

        if let Some(condition) = &step.skip_when {
            match expr::eval(condition, &variables) {
                Ok(true) => {
                    cursor = step.next_step_id.clone();
                    continue;
                }
                Ok(false) => {}
                Err(err) => {
                    tracing::warn!(flow = %def.id, step = %step_id, error = %err, "skip expression failed");
                }
            }
        }

        match &step.kind {
            StepKind::SendText { text, store_as } => {
                actions.push(FlowAction::SendText(render(text, &variables)));
                if store_as.is_some() {
                    return Ok(FlowOutcome {
                        actions,
                        next_step_id: Some(step_id),
                        variables,
                    });
                }
                cursor = step.next_step_id.clone();
            }
            StepKind::SendButtons {
                text,
                buttons,
                store_as,
            } => {
                actions.push(FlowAction::SendButtons {
                    text: render(text, &variables),
                    buttons: buttons
                        .iter()
                        .map(|b| Button {
                            id: b.id.clone(),
                            title: b.title.clone(),
                        })
                        .collect(),
                });
                if store_as.is_some() {
                    return Ok(FlowOutcome {
                        actions,
                        next_step_id: Some(step_id),
                        variables,
                    });
                }
                cursor = step.next_step_id.clone();
            }
            StepKind::CollectInput { prompt, .. } => {
                if let Some(prompt) = prompt {
                    actions.push(FlowAction::SendText(render(prompt, &variables)));
                }
                return Ok(FlowOutcome {
                    actions,
                    next_step_id: Some(step_id),
                    variables,
                });
            }
            StepKind::Branch { branches } => {
                let mut target = step.next_step_id.clone();
                for branch in branches {
                    match expr::eval(&branch.when, &variables) {
                        Ok(true) => {
                            target = Some(branch.next_step_id.clone());
                            break;
                        }
                        Ok(false) => {}
                        Err(err) => {
                            tracing::warn!(flow = %def.id, step = %step_id, error = %err, "branch expression failed");
                        }
                    }
                }
                cursor = target;
            }
            StepKind::End => {
                return Ok(FlowOutcome {
                    actions,
                    next_step_id: None,
                    variables,
                });
            }
        }
    }

    tracing::warn!(flow = %def.id, "flow exceeded step limit; ending session");
    Ok(FlowOutcome {
        actions,
        next_step_id: None,
        variables,
    })
}

/// `{{name}}` substitution against the variable map; unknown names render
/// as empty.
pub fn render(template: &str, variables: &HashMap<String, String>) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find("}}") {
            Some(end) => {
                let name = after[..end].trim();
                if let Some(value) = variables.get(name) {
                    out.push_str(value);
                }
                rest = &after[end + 2..];
            }
            None => {
                out.push_str(&rest[start..]);
                return out;
            }
        }
    }
    out.push_str(rest);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn flow(steps: serde_json::Value) -> FlowDefinition {
        let row = ChatbotFlow {
            id: Uuid::new_v4(),
            organization_id: Uuid::new_v4(),
            name: "onboarding".into(),
            trigger_keywords: vec!["start".into()],
            enabled: true,
            steps,
        };
        FlowDefinition::parse(&row).unwrap()
    }

    #[test]
    fn name_collection_round_trip() {
        // step1 asks for a name and waits; step2 greets with it and ends
        let def = flow(json!([
            {"id": "step1", "type": "send_text", "text": "Name?", "store_as": "name",
             "next_step_id": "step2"},
            {"id": "step2", "type": "send_text", "text": "Hi {{name}}"}
        ]));

        let first = advance(&def, None, HashMap::new(), None).unwrap();
        assert_eq!(first.actions, vec![FlowAction::SendText("Name?".into())]);
        assert_eq!(first.next_step_id.as_deref(), Some("step1"));

        let second = advance(
            &def,
            first.next_step_id.as_deref(),
            first.variables,
            Some(FlowInput {
                value: "Ada".into(),
                title: None,
            }),
        )
        .unwrap();
        assert_eq!(second.actions, vec![FlowAction::SendText("Hi Ada".into())]);
        assert!(second.next_step_id.is_none());
        assert_eq!(second.variables.get("name").unwrap(), "Ada");
    }

    #[test]
    fn button_press_records_id_and_title() {
        let def = flow(json!([
            {"id": "pick", "type": "send_buttons", "text": "Choose",
             "buttons": [{"id": "opt_a", "title": "Option A"}],
             "store_as": "choice", "next_step_id": "done"},
            {"id": "done", "type": "send_text", "text": "You chose {{choice_title}}"}
        ]));

        let first = advance(&def, None, HashMap::new(), None).unwrap();
        assert_eq!(first.next_step_id.as_deref(), Some("pick"));

        let second = advance(
            &def,
            Some("pick"),
            first.variables,
            Some(FlowInput {
                value: "opt_a".into(),
                title: Some("Option A".into()),
            }),
        )
        .unwrap();
        assert_eq!(second.variables.get("choice").unwrap(), "opt_a");
        assert_eq!(second.variables.get("choice_title").unwrap(), "Option A");
        assert_eq!(
            second.actions,
            vec![FlowAction::SendText("You chose Option A".into())]
        );
    }

    #[test]
    fn skip_when_bypasses_step() {
        let def = flow(json!([
            {"id": "ask", "type": "send_text", "text": "Name?", "store_as": "name",
             "skip_when": "name != ''", "next_step_id": "greet"},
            {"id": "greet", "type": "send_text", "text": "Hi {{name}}"}
        ]));

        let mut vars = HashMap::new();
        vars.insert("name".to_string(), "Ada".to_string());
        let outcome = advance(&def, None, vars, None).unwrap();
        assert_eq!(outcome.actions, vec![FlowAction::SendText("Hi Ada".into())]);
        assert!(outcome.next_step_id.is_none());
    }

    #[test]
    fn branch_jumps_on_first_true_expression() {
        let def = flow(json!([
            {"id": "route", "type": "branch",
             "branches": [
                 {"when": "tier == 'vip'", "next_step_id": "vip"},
                 {"when": "tier == 'basic'", "next_step_id": "basic"}
             ],
             "next_step_id": "basic"},
            {"id": "vip", "type": "send_text", "text": "Welcome back!"},
            {"id": "basic", "type": "send_text", "text": "Hello"}
        ]));

        let mut vars = HashMap::new();
        vars.insert("tier".to_string(), "vip".to_string());
        let outcome = advance(&def, None, vars, None).unwrap();
        assert_eq!(
            outcome.actions,
            vec![FlowAction::SendText("Welcome back!".into())]
        );
    }

    #[test]
    fn explicit_end_clears_cursor() {
        let def = flow(json!([
            {"id": "bye", "type": "send_text", "text": "Bye", "next_step_id": "end"},
            {"id": "end", "type": "end"}
        ]));
        let outcome = advance(&def, None, HashMap::new(), None).unwrap();
        assert_eq!(outcome.actions.len(), 1);
        assert!(outcome.next_step_id.is_none());
    }

    #[test]
    fn collect_input_waits_then_stores() {
        let def = flow(json!([
            {"id": "wait", "type": "collect_input", "store_as": "answer",
             "next_step_id": "echo"},
            {"id": "echo", "type": "send_text", "text": "Got {{answer}}"}
        ]));
        let first = advance(&def, None, HashMap::new(), None).unwrap();
        assert!(first.actions.is_empty());
        assert_eq!(first.next_step_id.as_deref(), Some("wait"));

        let second = advance(
            &def,
            Some("wait"),
            first.variables,
            Some(FlowInput {
                value: "42".into(),
                title: None,
            }),
        )
        .unwrap();
        assert_eq!(second.actions, vec![FlowAction::SendText("Got 42".into())]);
    }

    #[test]
    fn cyclic_links_hit_the_step_limit() {
        let def = flow(json!([
            {"id": "a", "type": "branch", "branches": [], "next_step_id": "b"},
            {"id": "b", "type": "branch", "branches": [], "next_step_id": "a"}
        ]));
        let outcome = advance(&def, None, HashMap::new(), None).unwrap();
        assert!(outcome.next_step_id.is_none());
    }

    #[test]
    fn render_handles_unknown_and_unterminated() {
        let mut vars = HashMap::new();
        vars.insert("name".to_string(), "Ada".to_string());
        assert_eq!(render("Hi {{name}}!", &vars), "Hi Ada!");
        assert_eq!(render("Hi {{ name }}!", &vars), "Hi Ada!");
        assert_eq!(render("Hi {{ghost}}!", &vars), "Hi !");
        assert_eq!(render("Hi {{name", &vars), "Hi {{name");
    }
}
