//! Guided-workflow engine — closes the turn-completion → workflow loop
//! named in §2/§4.8. Holds `WorkflowRun` state in memory only (workflow
//! runs are not named in the persisted-state list in §6, unlike session
//! metadata/items/approvals) and implements `TurnEventProcessor` so a
//! `NotificationDispatcher` can advance a run the moment its bound
//! session's turn completes.

use crate::error::ArchonError;
use crate::model::NotificationEvent;
use crate::notify::{Readiness, TurnEventProcessor};
use crate::session_manager::SessionManager;
use crate::workflows::engine::{WorkflowRecipe, WorkflowStep};
use async_trait::async_trait;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Paused,
    AwaitingDecision,
    Stopped,
    Completed,
    Dismissed,
}

#[derive(Clone)]
pub struct WorkflowRunState {
    pub id: String,
    pub recipe_id: String,
    pub status: RunStatus,
    pub current_step: i64,
    pub total_steps: i64,
    pub started_at: String,
    pub finished_at: Option<String>,
    pub cwd: String,
    pub title: String,
    pub session_id: Option<String>,
}

impl WorkflowRunState {
    fn to_view(&self) -> crate::workflows::engine::WorkflowRun {
        crate::workflows::engine::WorkflowRun {
            id: self.id.clone(),
            recipe_id: self.recipe_id.clone(),
            status: format!("{:?}", self.status).to_ascii_lowercase(),
            current_step: self.current_step,
            total_steps: self.total_steps,
            started_at: self.started_at.clone(),
            finished_at: self.finished_at.clone(),
        }
    }
}

pub struct WorkflowEngine {
    recipes: Vec<WorkflowRecipe>,
    runs: RwLock<HashMap<String, WorkflowRunState>>,
    session_manager: Arc<SessionManager>,
}

impl WorkflowEngine {
    pub fn new(recipes: Vec<WorkflowRecipe>, session_manager: Arc<SessionManager>) -> Self {
        Self { recipes, runs: RwLock::new(HashMap::new()), session_manager }
    }

    pub fn templates(&self) -> &[WorkflowRecipe] {
        &self.recipes
    }

    pub async fn runs(&self) -> Vec<crate::workflows::engine::WorkflowRun> {
        self.runs.read().await.values().map(|r| r.to_view()).collect()
    }

    pub async fn metrics(&self) -> serde_json::Value {
        let guard = self.runs.read().await;
        let mut by_status: HashMap<&'static str, i64> = HashMap::new();
        for run in guard.values() {
            let tag = match run.status {
                RunStatus::Running => "running",
                RunStatus::Paused => "paused",
                RunStatus::AwaitingDecision => "awaiting_decision",
                RunStatus::Stopped => "stopped",
                RunStatus::Completed => "completed",
                RunStatus::Dismissed => "dismissed",
            };
            *by_status.entry(tag).or_insert(0) += 1;
        }
        serde_json::json!({ "total_runs": guard.len(), "by_status": by_status })
    }

    fn recipe(&self, recipe_id: &str) -> Result<&WorkflowRecipe, ArchonError> {
        self.recipes
            .iter()
            .find(|r| r.id == recipe_id)
            .ok_or_else(|| ArchonError::not_found(format!("workflow recipe {recipe_id} not found")))
    }

    pub async fn start_run(&self, recipe_id: &str, cwd: &str) -> Result<crate::workflows::engine::WorkflowRun, ArchonError> {
        let recipe = self.recipe(recipe_id)?.clone();
        let id = crate::util::new_session_id();
        let mut state = WorkflowRunState {
            id: id.clone(),
            recipe_id: recipe_id.to_string(),
            status: RunStatus::Running,
            current_step: 0,
            total_steps: recipe.steps.len() as i64,
            started_at: crate::model::now_rfc3339(),
            finished_at: None,
            cwd: cwd.to_string(),
            title: recipe.name.clone(),
            session_id: None,
        };
        self.run_step(&recipe, &mut state).await?;
        let view = state.to_view();
        self.runs.write().await.insert(id, state);
        Ok(view)
    }

    async fn run_step(&self, recipe: &WorkflowRecipe, state: &mut WorkflowRunState) -> Result<(), ArchonError> {
        let step: &WorkflowStep = recipe
            .steps
            .get(state.current_step as usize)
            .ok_or_else(|| ArchonError::invalid("workflow step index out of range"))?;
        let provider = step.provider.clone().unwrap_or_else(|| "claude".to_string());
        let title = format!("{} ({}/{})", recipe.name, state.current_step + 1, state.total_steps);
        let session = self.session_manager.create(&provider, &state.cwd, &title).await?;
        self.session_manager.send(&session.id, &step.prompt, None).await?;
        state.session_id = Some(session.id);
        Ok(())
    }

    async fn advance(&self, session_id: &str) {
        let recipe_id_and_next = {
            let guard = self.runs.read().await;
            guard
                .values()
                .find(|r| r.session_id.as_deref() == Some(session_id) && r.status == RunStatus::Running)
                .map(|r| (r.id.clone(), r.current_step + 1, r.total_steps))
        };
        let Some((run_id, next_step, total_steps)) = recipe_id_and_next else { return };

        if next_step >= total_steps {
            if let Some(state) = self.runs.write().await.get_mut(&run_id) {
                state.status = RunStatus::Completed;
                state.finished_at = Some(crate::model::now_rfc3339());
            }
            return;
        }

        let recipe = {
            let guard = self.runs.read().await;
            let recipe_id = guard.get(&run_id).map(|r| r.recipe_id.clone());
            recipe_id.and_then(|id| self.recipes.iter().find(|r| r.id == id).cloned())
        };
        let Some(recipe) = recipe else { return };

        let mut guard = self.runs.write().await;
        if let Some(state) = guard.get_mut(&run_id) {
            state.current_step = next_step;
            if let Err(e) = self.run_step(&recipe, state).await {
                tracing::warn!(run_id, err = %e, "workflow step failed to start, stopping run");
                state.status = RunStatus::Stopped;
                state.finished_at = Some(crate::model::now_rfc3339());
            }
        }
    }

    async fn mutate_run<F>(&self, run_id: &str, f: F) -> Result<(), ArchonError>
    where
        F: FnOnce(&mut WorkflowRunState) -> Result<(), ArchonError>,
    {
        let mut guard = self.runs.write().await;
        let state = guard
            .get_mut(run_id)
            .ok_or_else(|| ArchonError::not_found(format!("workflow run {run_id} not found")))?;
        f(state)
    }

    pub async fn pause(&self, run_id: &str) -> Result<(), ArchonError> {
        self.mutate_run(run_id, |s| {
            s.status = RunStatus::Paused;
            Ok(())
        })
        .await
    }

    pub async fn resume(&self, run_id: &str) -> Result<(), ArchonError> {
        self.mutate_run(run_id, |s| {
            s.status = RunStatus::Running;
            Ok(())
        })
        .await
    }

    pub async fn stop(&self, run_id: &str) -> Result<(), ArchonError> {
        self.mutate_run(run_id, |s| {
            s.status = RunStatus::Stopped;
            s.finished_at = Some(crate::model::now_rfc3339());
            Ok(())
        })
        .await
    }

    pub async fn dismiss(&self, run_id: &str) -> Result<(), ArchonError> {
        self.mutate_run(run_id, |s| {
            s.status = RunStatus::Dismissed;
            Ok(())
        })
        .await
    }

    pub async fn undismiss(&self, run_id: &str) -> Result<(), ArchonError> {
        self.mutate_run(run_id, |s| {
            s.status = RunStatus::Paused;
            Ok(())
        })
        .await
    }

    pub async fn rename(&self, run_id: &str, title: &str) -> Result<(), ArchonError> {
        let title = crate::util::sanitize_title(title);
        self.mutate_run(run_id, |s| {
            s.title = title;
            Ok(())
        })
        .await
    }

    pub async fn decision(&self, run_id: &str, _decision: serde_json::Value) -> Result<(), ArchonError> {
        self.mutate_run(run_id, |s| {
            s.status = RunStatus::Running;
            Ok(())
        })
        .await
    }
}

#[async_trait]
impl TurnEventProcessor for WorkflowEngine {
    async fn process(&self, event: &NotificationEvent, readiness: Readiness) {
        if readiness != Readiness::Progress {
            return;
        }
        if event.status == "failed" {
            if let Some((run_id, _, _)) = {
                let guard = self.runs.read().await;
                guard
                    .values()
                    .find(|r| r.session_id.as_deref() == Some(event.session_id.as_str()))
                    .map(|r| (r.id.clone(), r.current_step, r.total_steps))
            } {
                let _ = self
                    .mutate_run(&run_id, |s| {
                        s.status = RunStatus::Stopped;
                        s.finished_at = Some(crate::model::now_rfc3339());
                        Ok(())
                    })
                    .await;
            }
            return;
        }
        self.advance(&event.session_id).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflows::engine::WorkflowTrigger;

    fn recipe(steps: usize) -> WorkflowRecipe {
        WorkflowRecipe {
            id: "r1".into(),
            name: "test-recipe".into(),
            description: String::new(),
            steps: (0..steps)
                .map(|_| WorkflowStep { prompt: "do it".into(), provider: Some("exec".into()), inherit_from: None })
                .collect(),
            tags: vec![],
            triggers: vec![WorkflowTrigger::OnCommit],
            is_builtin: false,
            run_count: 0,
        }
    }

    #[test]
    fn run_view_status_is_lowercase() {
        let state = WorkflowRunState {
            id: "run-1".into(),
            recipe_id: "r1".into(),
            status: RunStatus::Running,
            current_step: 0,
            total_steps: 2,
            started_at: "t".into(),
            finished_at: None,
            cwd: "/tmp".into(),
            title: "test-recipe".into(),
            session_id: None,
        };
        assert_eq!(state.to_view().status, "running");
        let _ = recipe(2);
    }
}
