//! The pipeline state machine: a config-driven list of phases, each either an
//! *actor phase* (advanced by a worker running a named skill) or an *observer
//! phase* (advanced autonomously by a named resolver).

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use thiserror::Error;

/// One phase in `.kanban-workflow.yaml`'s `workflow.phases` list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseConfig {
    pub name: String,
    pub status: String,
    #[serde(default)]
    pub skill: Option<String>,
    #[serde(default)]
    pub resolver: Option<String>,
    #[serde(default)]
    pub transitions_to: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowConfig {
    pub entry_phase: String,
    pub phases: Vec<PhaseConfig>,
    #[serde(default)]
    pub defaults: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct CronJobConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_interval")]
    pub interval_seconds: u64,
}

fn default_interval() -> u64 {
    300
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CronConfig {
    #[serde(default)]
    pub mr_comment_poll: Option<CronJobConfig>,
    #[serde(default)]
    pub mr_chain_manager: Option<CronJobConfig>,
}

/// The parsed `.kanban-workflow.yaml` document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub workflow: WorkflowConfig,
    #[serde(default)]
    pub cron: CronConfig,
}

#[derive(Debug, Error)]
pub enum PipelineConfigError {
    #[error("failed to parse pipeline config: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("entry_phase {0:?} does not name a configured phase")]
    UnknownEntryPhase(String),
    #[error("phase {0:?} transitions_to unknown phase/status {1:?}")]
    UnknownTransition(String, String),
    #[error("phase {0:?} has neither skill nor resolver")]
    PhaseWithoutHandler(String),
    #[error("duplicate phase name {0:?}")]
    DuplicatePhase(String),
}

impl PipelineConfig {
    pub fn from_yaml(raw: &str) -> Result<Self, PipelineConfigError> {
        Ok(serde_yaml::from_str(raw)?)
    }
}

/// A single phase in the built state machine.
#[derive(Debug, Clone)]
pub struct Phase {
    pub name: String,
    pub status: String,
    pub skill: Option<String>,
    pub resolver: Option<String>,
    pub transitions_to: Vec<String>,
}

impl Phase {
    pub fn is_actor(&self) -> bool {
        self.skill.is_some()
    }

    pub fn is_observer(&self) -> bool {
        self.resolver.is_some()
    }
}

/// A validated, queryable pipeline state machine built from a [`PipelineConfig`].
#[derive(Debug, Clone)]
pub struct PipelineModel {
    entry_phase: String,
    phases: Vec<Phase>,
    by_status: HashMap<String, usize>,
}

const RESERVED_STATUSES: [&str; 4] = ["Not Started", "Complete", "In Progress", "Skipped"];

impl PipelineModel {
    pub fn from_config(cfg: &PipelineConfig) -> Result<Self, PipelineConfigError> {
        let mut by_status = HashMap::new();
        let mut by_name = HashMap::new();
        let mut phases = Vec::with_capacity(cfg.workflow.phases.len());

        for (idx, p) in cfg.workflow.phases.iter().enumerate() {
            if by_name.insert(p.name.clone(), idx).is_some() {
                return Err(PipelineConfigError::DuplicatePhase(p.name.clone()));
            }
            if p.skill.is_none() && p.resolver.is_none() {
                return Err(PipelineConfigError::PhaseWithoutHandler(p.name.clone()));
            }
            by_status.insert(p.status.clone(), idx);
            phases.push(Phase {
                name: p.name.clone(),
                status: p.status.clone(),
                skill: p.skill.clone(),
                resolver: p.resolver.clone(),
                transitions_to: p.transitions_to.clone(),
            });
        }

        if !by_name.contains_key(&cfg.workflow.entry_phase) {
            return Err(PipelineConfigError::UnknownEntryPhase(
                cfg.workflow.entry_phase.clone(),
            ));
        }

        for phase in &phases {
            for target in &phase.transitions_to {
                let known = by_name.contains_key(target)
                    || by_status.contains_key(target)
                    || RESERVED_STATUSES.contains(&target.as_str());
                if !known {
                    return Err(PipelineConfigError::UnknownTransition(
                        phase.name.clone(),
                        target.clone(),
                    ));
                }
            }
        }

        Ok(Self {
            entry_phase: cfg.workflow.entry_phase.clone(),
            phases,
            by_status,
        })
    }

    pub fn entry_phase(&self) -> &Phase {
        self.phases
            .iter()
            .find(|p| p.name == self.entry_phase)
            .expect("validated at construction")
    }

    pub fn all_phases(&self) -> &[Phase] {
        &self.phases
    }

    pub fn all_statuses(&self) -> Vec<&str> {
        self.phases.iter().map(|p| p.status.as_str()).collect()
    }

    pub fn phase_for_status(&self, status: &str) -> Option<&Phase> {
        self.by_status.get(status).map(|&idx| &self.phases[idx])
    }

    pub fn skill_for_status(&self, status: &str) -> Option<&str> {
        self.phase_for_status(status).and_then(|p| p.skill.as_deref())
    }

    pub fn is_resolver_status(&self, status: &str) -> bool {
        self.phase_for_status(status)
            .map(Phase::is_observer)
            .unwrap_or(false)
    }

    pub fn is_known_status(&self, status: &str) -> bool {
        RESERVED_STATUSES.contains(&status) || self.by_status.contains_key(status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_config() -> PipelineConfig {
        PipelineConfig {
            workflow: WorkflowConfig {
                entry_phase: "Design".to_string(),
                phases: vec![
                    PhaseConfig {
                        name: "Design".to_string(),
                        status: "Design".to_string(),
                        skill: Some("phase-design".to_string()),
                        resolver: None,
                        transitions_to: vec!["PR Created".to_string()],
                    },
                    PhaseConfig {
                        name: "PR Created".to_string(),
                        status: "PR Created".to_string(),
                        skill: None,
                        resolver: Some("pr-status".to_string()),
                        transitions_to: vec!["Done".to_string(), "Addressing Comments".to_string()],
                    },
                    PhaseConfig {
                        name: "Addressing Comments".to_string(),
                        status: "Addressing Comments".to_string(),
                        skill: Some("phase-review".to_string()),
                        resolver: None,
                        transitions_to: vec!["PR Created".to_string()],
                    },
                ],
                defaults: BTreeMap::new(),
            },
            cron: CronConfig::default(),
        }
    }

    #[test]
    fn builds_valid_model() {
        let model = PipelineModel::from_config(&sample_config()).unwrap();
        assert_eq!(model.entry_phase().name, "Design");
        assert_eq!(model.skill_for_status("Design"), Some("phase-design"));
        assert!(model.is_resolver_status("PR Created"));
        assert!(!model.is_resolver_status("Design"));
    }

    #[test]
    fn rejects_unknown_entry_phase() {
        let mut cfg = sample_config();
        cfg.workflow.entry_phase = "Nope".to_string();
        assert!(matches!(
            PipelineModel::from_config(&cfg),
            Err(PipelineConfigError::UnknownEntryPhase(_))
        ));
    }

    #[test]
    fn rejects_transition_to_unknown_phase() {
        let mut cfg = sample_config();
        cfg.workflow.phases[0].transitions_to = vec!["Nonexistent".to_string()];
        assert!(matches!(
            PipelineModel::from_config(&cfg),
            Err(PipelineConfigError::UnknownTransition(_, _))
        ));
    }

    #[test]
    fn rejects_phase_without_skill_or_resolver() {
        let mut cfg = sample_config();
        cfg.workflow.phases[0].skill = None;
        assert!(matches!(
            PipelineModel::from_config(&cfg),
            Err(PipelineConfigError::PhaseWithoutHandler(_))
        ));
    }

    #[test]
    fn reserved_statuses_are_always_known() {
        let model = PipelineModel::from_config(&sample_config()).unwrap();
        assert!(model.is_known_status("Complete"));
        assert!(model.is_known_status("Not Started"));
        assert!(!model.is_known_status("Unknown Status"));
    }

    #[test]
    fn from_yaml_parses_document() {
        let yaml = r#"
workflow:
  entry_phase: Design
  phases:
    - name: Design
      status: Design
      skill: phase-design
      transitions_to: [PR Created]
    - name: PR Created
      status: "PR Created"
      resolver: pr-status
      transitions_to: [Done]
cron:
  mr_comment_poll:
    enabled: true
    interval_seconds: 120
"#;
        let cfg = PipelineConfig::from_yaml(yaml).unwrap();
        let model = PipelineModel::from_config(&cfg).unwrap();
        assert_eq!(model.all_phases().len(), 2);
        assert_eq!(
            cfg.cron.mr_comment_poll.unwrap().interval_seconds,
            120
        );
    }
}
