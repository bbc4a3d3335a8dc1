//! Conversation domain model.
//!
//! A conversation is an ordered, turn-structured dialogue among two or
//! more agents on a topic, driven by a turn strategy.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::{AgentId, ConversationId};

/// How the next speaker is selected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnStrategy {
    /// Deterministic rotation through the participant list.
    RoundRobin,
    /// The last message's mention picks the next speaker; round-robin
    /// otherwise.
    MentionBased,
    /// Mentioned participants get priority; otherwise a seeded-random
    /// pick among participants other than the last speaker.
    FreeForm,
    /// A designated facilitator speaks between every other turn and
    /// steers who speaks next.
    FacilitatorLed,
}

impl Default for TurnStrategy {
    fn default() -> Self {
        Self::RoundRobin
    }
}

impl TurnStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RoundRobin => "round_robin",
            Self::MentionBased => "mention_based",
            Self::FreeForm => "free_form",
            Self::FacilitatorLed => "facilitator_led",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "round_robin" => Some(Self::RoundRobin),
            "mention_based" => Some(Self::MentionBased),
            "free_form" => Some(Self::FreeForm),
            "facilitator_led" => Some(Self::FacilitatorLed),
            _ => None,
        }
    }
}

/// Status of a conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationStatus {
    Pending,
    Active,
    Completed,
    Cancelled,
}

impl ConversationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Active => "active",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
        }
    }
}

/// One message in a conversation transcript.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationMessage {
    pub agent_id: AgentId,
    pub agent_name: String,
    pub content: String,
    /// Agent ids extracted from `@Name` mentions in the content.
    pub mentions: Vec<AgentId>,
    pub timestamp: DateTime<Utc>,
}

/// An ordered dialogue among participants.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub id: ConversationId,
    pub topic: String,
    /// Ordered participant ids, at least two.
    pub participants: Vec<AgentId>,
    pub max_turns: u32,
    pub messages: Vec<ConversationMessage>,
    pub status: ConversationStatus,
    pub turn_strategy: TurnStrategy,
    pub facilitator_id: Option<AgentId>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Conversation {
    /// Literal marker that ends a conversation when it appears in a
    /// message (case-sensitive, matched after trimming).
    pub const COMPLETION_MARKER: &'static str = "[TERMINÉ]";

    pub fn new(
        topic: impl Into<String>,
        participants: Vec<AgentId>,
        max_turns: u32,
        turn_strategy: TurnStrategy,
        facilitator_id: Option<AgentId>,
    ) -> Self {
        Self {
            id: ConversationId::new(),
            topic: topic.into(),
            participants,
            max_turns,
            messages: Vec::new(),
            status: ConversationStatus::Pending,
            turn_strategy,
            facilitator_id,
            created_at: Utc::now(),
            completed_at: None,
        }
    }

    pub fn is_participant(&self, agent_id: AgentId) -> bool {
        self.participants.contains(&agent_id)
    }

    /// Render the topic plus ordered `Name: content` lines.
    pub fn transcript(&self) -> String {
        let mut out = format!("# {}\n", self.topic);
        for message in &self.messages {
            out.push_str(&format!("{}: {}\n", message.agent_name, message.content));
        }
        out
    }
}

/// Outcome of a completed conversation run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationResult {
    pub conversation_id: ConversationId,
    pub status: ConversationStatus,
    pub messages: Vec<ConversationMessage>,
    pub turns_taken: u32,
    pub duration_ms: u64,
    /// Annotation set when the conversation ended on an error.
    pub error: Option<String>,
}
