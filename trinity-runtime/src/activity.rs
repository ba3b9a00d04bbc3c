//! Activity tracking
//!
//! One service owns the activity timeline: rows go to the state store,
//! and every transition fans out over a broadcast channel that the
//! WebSocket layer subscribes to. Ordering on the channel is best-effort;
//! consumers reconcile by `created_at`.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use trinity_core::sanitizer;
use trinity_core::types::{Activity, ActivityState, ActivityType, TriggeredBy};
use trinity_core::Result;
use trinity_store::{NewActivity, StateStore};

/// Broadcast capacity; slow consumers drop oldest events
const CHANNEL_CAPACITY: usize = 256;

/// Wire event for activity transitions
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivityEvent {
    /// Always `"agent_activity"`; the channel carries other event kinds
    #[serde(rename = "type")]
    pub event_type: String,
    pub agent_name: String,
    pub activity_id: String,
    pub activity_type: String,
    pub activity_state: String,
    /// Human-readable one-liner for timeline UIs
    pub action: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub details: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Central activity tracker
#[derive(Clone)]
pub struct ActivityService {
    store: StateStore,
    events: broadcast::Sender<ActivityEvent>,
}

impl ActivityService {
    pub fn new(store: StateStore) -> Self {
        let (events, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { store, events }
    }

    /// Subscribe to activity transitions
    pub fn subscribe(&self) -> broadcast::Receiver<ActivityEvent> {
        self.events.subscribe()
    }

    /// Record the start of an activity; returns its id
    #[allow(clippy::too_many_arguments)]
    pub fn track(
        &self,
        agent_name: &str,
        activity_type: ActivityType,
        triggered_by: TriggeredBy,
        parent_activity_id: Option<String>,
        related_execution_id: Option<String>,
        details: serde_json::Value,
    ) -> Result<String> {
        let details = sanitizer::sanitize_value(&details);
        let activity_id = self.store.create_activity(NewActivity {
            agent_name: agent_name.to_string(),
            activity_type,
            triggered_by,
            parent_activity_id,
            related_execution_id,
            details: details.clone(),
        })?;

        self.broadcast(ActivityEvent {
            event_type: "agent_activity".to_string(),
            agent_name: agent_name.to_string(),
            activity_id: activity_id.clone(),
            activity_type: activity_type.as_str().to_string(),
            activity_state: "started".to_string(),
            action: action_description(activity_type, &details),
            timestamp: chrono::Utc::now(),
            details,
            error: None,
        });
        Ok(activity_id)
    }

    /// Record completion or failure of an activity
    pub fn complete(
        &self,
        activity_id: &str,
        state: ActivityState,
        details: Option<serde_json::Value>,
        error: Option<&str>,
    ) -> Result<bool> {
        let Some(activity) = self.store.get_activity(activity_id)? else {
            return Ok(false);
        };
        let details = details.map(|d| sanitizer::sanitize_value(&d));
        let updated = self
            .store
            .complete_activity(activity_id, state, details.clone(), error)?;
        if updated {
            self.broadcast(ActivityEvent {
                event_type: "agent_activity".to_string(),
                agent_name: activity.agent_name.clone(),
                activity_id: activity_id.to_string(),
                activity_type: activity.activity_type.as_str().to_string(),
                activity_state: match state {
                    ActivityState::Started => "started",
                    ActivityState::Completed => "completed",
                    ActivityState::Failed => "failed",
                }
                .to_string(),
                action: format!("Completed: {}", activity.activity_type.as_str()),
                timestamp: chrono::Utc::now(),
                details: details.unwrap_or(serde_json::Value::Null),
                error: error.map(str::to_string),
            });
        }
        Ok(updated)
    }

    /// Recent activities for an agent, newest first
    pub fn recent(&self, agent_name: &str, limit: usize) -> Result<Vec<Activity>> {
        Ok(self.store.list_agent_activities(agent_name, limit)?)
    }

    /// Activities still in progress for an agent
    pub fn current(&self, agent_name: &str) -> Result<Vec<Activity>> {
        Ok(self.store.list_current_activities(agent_name)?)
    }

    fn broadcast(&self, event: ActivityEvent) {
        // Nobody listening is fine
        let _ = self.events.send(event);
    }
}

/// Human-readable action line for an activity transition
fn action_description(activity_type: ActivityType, details: &serde_json::Value) -> String {
    match activity_type {
        ActivityType::ChatStart => match details.get("message_preview").and_then(|v| v.as_str()) {
            Some(preview) => {
                let head: String = preview.chars().take(50).collect();
                format!("Processing: {head}…")
            }
            None => "Processing chat".to_string(),
        },
        ActivityType::ToolCall => match details.get("tool_name").and_then(|v| v.as_str()) {
            Some(tool) => format!("Using tool: {tool}"),
            None => "Executing tool".to_string(),
        },
        ActivityType::ScheduleStart => match details.get("schedule_name").and_then(|v| v.as_str()) {
            Some(name) => format!("Running: {name}"),
            None => "Running scheduled task".to_string(),
        },
        ActivityType::AgentCollaboration => {
            match details.get("target_agent").and_then(|v| v.as_str()) {
                Some(target) => format!("Collaborating with: {target}"),
                None => "Agent collaboration".to_string(),
            }
        }
        ActivityType::ChatEnd => "Chat completed".to_string(),
        ActivityType::ScheduleEnd => "Schedule completed".to_string(),
        ActivityType::ExecutionCancelled => "Execution cancelled".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn service() -> ActivityService {
        ActivityService::new(StateStore::open_in_memory().unwrap())
    }

    #[tokio::test]
    async fn test_track_persists_and_broadcasts() {
        let service = service();
        let mut events = service.subscribe();

        let id = service
            .track(
                "alpha",
                ActivityType::ChatStart,
                TriggeredBy::User,
                None,
                Some("e-1".to_string()),
                json!({"message_preview": "hello world"}),
            )
            .unwrap();

        let event = events.recv().await.unwrap();
        assert_eq!(event.activity_id, id);
        assert_eq!(event.activity_state, "started");
        assert!(event.action.starts_with("Processing: hello world"));

        assert_eq!(service.current("alpha").unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_complete_broadcasts_final_state() {
        let service = service();
        let id = service
            .track(
                "alpha",
                ActivityType::ScheduleStart,
                TriggeredBy::Schedule,
                None,
                None,
                json!({"schedule_name": "nightly"}),
            )
            .unwrap();
        let mut events = service.subscribe();

        assert!(service
            .complete(&id, ActivityState::Failed, None, Some("agent died"))
            .unwrap());

        let event = events.recv().await.unwrap();
        assert_eq!(event.activity_state, "failed");
        assert_eq!(event.error.as_deref(), Some("agent died"));
        assert!(service.current("alpha").unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_details_are_sanitized_before_store_and_wire() {
        let service = service();
        let mut events = service.subscribe();
        let id = service
            .track(
                "alpha",
                ActivityType::ToolCall,
                TriggeredBy::Agent,
                None,
                None,
                json!({"tool_name": "bash", "command": "export API_KEY=sk-abcdefghij1234567890abcd"}),
            )
            .unwrap();

        let event = events.recv().await.unwrap();
        assert!(!event.details["command"].as_str().unwrap().contains("sk-abcdef"));

        let stored = service.recent("alpha", 1).unwrap();
        assert!(!stored[0].details["command"].as_str().unwrap().contains("sk-abcdef"));
        let _ = id;
    }

    #[tokio::test]
    async fn test_complete_unknown_is_false() {
        let service = service();
        assert!(!service
            .complete("ghost", ActivityState::Completed, None, None)
            .unwrap());
    }

    #[test]
    fn test_action_descriptions() {
        assert_eq!(
            action_description(ActivityType::ToolCall, &json!({"tool_name": "grep"})),
            "Using tool: grep"
        );
        assert_eq!(
            action_description(ActivityType::ChatEnd, &json!({})),
            "Chat completed"
        );
        assert_eq!(
            action_description(ActivityType::AgentCollaboration, &json!({"target_agent": "beta"})),
            "Collaborating with: beta"
        );
    }
}
