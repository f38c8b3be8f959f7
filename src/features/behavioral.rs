//! Behavioral counters over a session window, updated on insert and evict.

use crate::normalizer::SessionEvent;
use std::collections::HashMap;

const ESCALATION_KEYWORDS: [&str; 6] = ["sudo", "admin", "root", "privilege", "escalate", "elevate"];
const EXEC_KEYWORDS: [&str; 4] = ["exec", "cmd", "shell", "run"];

fn contains_any(action: &str, keywords: &[&str]) -> bool {
    let lower = action.to_ascii_lowercase();
    keywords.iter().any(|k| lower.contains(k))
}

pub(crate) fn is_auth_action(action: &str) -> bool {
    let lower = action.to_ascii_lowercase();
    lower.contains("login") || lower.contains("auth")
}

pub(crate) fn is_escalation_action(action: &str) -> bool {
    contains_any(action, &ESCALATION_KEYWORDS)
}

pub(crate) fn is_exec_action(action: &str) -> bool {
    contains_any(action, &EXEC_KEYWORDS)
}

#[derive(Debug, Default)]
pub struct BehavioralAccum {
    pub total: u32,
    pub failed_auth: u32,
    pub escalation: u32,
    pub errors: u32,
    resources: HashMap<String, u32>,
}

impl BehavioralAccum {
    pub fn add(&mut self, event: &SessionEvent) {
        self.apply(event, 1);
    }

    pub fn remove(&mut self, event: &SessionEvent) {
        self.apply(event, -1);
    }

    fn apply(&mut self, event: &SessionEvent, sign: i32) {
        let bump = |counter: &mut u32| {
            if sign > 0 {
                *counter += 1;
            } else {
                *counter = counter.saturating_sub(1);
            }
        };

        bump(&mut self.total);
        if is_auth_action(&event.action)
            && matches!(event.status_code, Some(401) | Some(403))
        {
            bump(&mut self.failed_auth);
        }
        if is_escalation_action(&event.action) {
            bump(&mut self.escalation);
        }
        if matches!(event.status_code, Some(code) if code >= 400) {
            bump(&mut self.errors);
        }
        if !event.resource.is_empty() {
            if sign > 0 {
                *self.resources.entry(event.resource.clone()).or_insert(0) += 1;
            } else if let Some(count) = self.resources.get_mut(&event.resource) {
                *count -= 1;
                if *count == 0 {
                    self.resources.remove(&event.resource);
                }
            }
        }
    }

    pub fn unique_resources(&self) -> usize {
        self.resources.len()
    }

    /// Status >= 400 fraction of the window; 0 for an empty window.
    pub fn error_rate(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            f64::from(self.errors) / f64::from(self.total)
        }
    }
}
