//! Conversation engine.
//!
//! Runs a turn-structured dialogue among agents until max turns, a
//! completion marker, or a declined turn ends it. Speaker selection is
//! pluggable via [`TurnStrategy`]; free-form selection is seeded so test
//! runs are reproducible.

use std::sync::{Arc, LazyLock};
use std::time::{Duration, Instant};

use chrono::Utc;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use regex::Regex;
use tokio::time::timeout;

use crate::domain::errors::{CoreError, CoreResult};
use crate::domain::models::{
    AgentId, Conversation, ConversationMessage, ConversationResult, ConversationStatus,
    ProcessMessageFn, TurnStrategy,
};

static MENTION_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"@([A-Za-z][A-Za-z0-9_]*)").expect("mention pattern is valid"));

/// Synthesized content recorded when a speaker misses the turn deadline.
pub const NO_RESPONSE_MARKER: &str = "[no response]";

/// A conversation participant as the engine sees it.
#[derive(Clone)]
pub struct Participant {
    pub id: AgentId,
    pub name: String,
    pub persona: Option<String>,
    /// Absent responder means the participant cannot take a turn; the
    /// conversation ends when they are selected.
    pub responder: Option<ProcessMessageFn>,
}

/// Hook fired after each appended message.
pub type MessageHook = Arc<dyn Fn(&ConversationMessage) + Send + Sync>;
/// Hook fired once with the final result.
pub type CompleteHook = Arc<dyn Fn(&ConversationResult) + Send + Sync>;

/// Tunables for a conversation run.
#[derive(Debug, Clone)]
pub struct ConversationSettings {
    /// Per-turn response deadline.
    pub turn_timeout: Duration,
    /// How many trailing messages the prompt carries.
    pub transcript_tail: usize,
    /// Seed for free-form speaker selection.
    pub rng_seed: Option<u64>,
}

impl Default for ConversationSettings {
    fn default() -> Self {
        Self { turn_timeout: Duration::from_secs(60), transcript_tail: 12, rng_seed: None }
    }
}

/// Extract `@Name` mentions, resolved case-insensitively against
/// participant names. First matching participant wins per mention.
pub fn extract_mentions(content: &str, participants: &[Participant]) -> Vec<AgentId> {
    let mut mentions = Vec::new();
    for capture in MENTION_RE.captures_iter(content) {
        let name = &capture[1];
        if let Some(p) = participants.iter().find(|p| p.name.eq_ignore_ascii_case(name)) {
            if !mentions.contains(&p.id) {
                mentions.push(p.id);
            }
        }
    }
    mentions
}

/// Drives one conversation to completion.
pub struct ConversationRunner {
    conversation: Conversation,
    participants: Vec<Participant>,
    settings: ConversationSettings,
    initial_prompt: Option<String>,
    on_message: Option<MessageHook>,
    on_complete: Option<CompleteHook>,
    rng: StdRng,
    /// Rotation cursor over non-facilitator participants.
    non_facilitator_cursor: usize,
}

impl ConversationRunner {
    pub fn new(
        topic: impl Into<String>,
        participants: Vec<Participant>,
        max_turns: u32,
        strategy: TurnStrategy,
        facilitator_id: Option<AgentId>,
        settings: ConversationSettings,
    ) -> CoreResult<Self> {
        if participants.len() < 2 {
            return Err(CoreError::BadInput(
                "a conversation requires at least 2 participants".to_string(),
            ));
        }
        if strategy == TurnStrategy::FacilitatorLed {
            let facilitator = facilitator_id.ok_or_else(|| {
                CoreError::BadInput("facilitator_led requires a facilitator_id".to_string())
            })?;
            if !participants.iter().any(|p| p.id == facilitator) {
                return Err(CoreError::BadInput(
                    "the facilitator must be a participant".to_string(),
                ));
            }
        }

        let rng = match settings.rng_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let ids = participants.iter().map(|p| p.id).collect();
        Ok(Self {
            conversation: Conversation::new(topic, ids, max_turns, strategy, facilitator_id),
            participants,
            settings,
            initial_prompt: None,
            on_message: None,
            on_complete: None,
            rng,
            non_facilitator_cursor: 0,
        })
    }

    pub fn with_initial_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.initial_prompt = Some(prompt.into());
        self
    }

    pub fn on_message(mut self, hook: MessageHook) -> Self {
        self.on_message = Some(hook);
        self
    }

    pub fn on_complete(mut self, hook: CompleteHook) -> Self {
        self.on_complete = Some(hook);
        self
    }

    pub fn conversation(&self) -> &Conversation {
        &self.conversation
    }

    /// Run turns until a termination condition fires, returning the
    /// transcript. Errors end the conversation cleanly with a completed
    /// status and an annotation.
    pub async fn run(mut self) -> ConversationResult {
        let started = Instant::now();
        self.conversation.status = ConversationStatus::Active;
        let mut turns: u32 = 0;
        let error: Option<String> = None;

        while turns < self.conversation.max_turns {
            let speaker = self.select_next_speaker();
            let Some(responder) = self.participants[speaker].responder.clone() else {
                tracing::debug!(
                    speaker = %self.participants[speaker].name,
                    "participant has no responder, ending conversation"
                );
                break;
            };

            let prompt = self.build_prompt(speaker, turns == 0);
            let response = match timeout(self.settings.turn_timeout, responder(prompt)).await {
                Err(_) => {
                    tracing::warn!(
                        speaker = %self.participants[speaker].name,
                        "turn deadline exceeded"
                    );
                    self.append_message(speaker, NO_RESPONSE_MARKER.to_string());
                    turns += 1;
                    continue;
                }
                Ok(None) => break,
                Ok(Some(text)) => text.trim().to_string(),
            };
            if response.is_empty() {
                break;
            }

            let content = self.append_message(speaker, response);
            turns += 1;
            if content.contains(Conversation::COMPLETION_MARKER) {
                break;
            }
        }

        self.conversation.status = ConversationStatus::Completed;
        self.conversation.completed_at = Some(Utc::now());

        let result = ConversationResult {
            conversation_id: self.conversation.id,
            status: self.conversation.status,
            messages: self.conversation.messages.clone(),
            turns_taken: turns,
            duration_ms: started.elapsed().as_millis() as u64,
            error,
        };
        if let Some(hook) = &self.on_complete {
            hook(&result);
        }
        result
    }

    // -- Speaker selection --------------------------------------------

    fn index_of(&self, id: AgentId) -> Option<usize> {
        self.participants.iter().position(|p| p.id == id)
    }

    fn last_speaker_index(&self) -> Option<usize> {
        self.conversation
            .messages
            .last()
            .and_then(|m| self.index_of(m.agent_id))
    }

    fn round_robin(&self) -> usize {
        match self.last_speaker_index() {
            None => 0,
            Some(last) => (last + 1) % self.participants.len(),
        }
    }

    fn select_next_speaker(&mut self) -> usize {
        match self.conversation.turn_strategy {
            TurnStrategy::RoundRobin => self.round_robin(),
            TurnStrategy::MentionBased => self
                .mentioned_in_last_message()
                .unwrap_or_else(|| self.round_robin()),
            TurnStrategy::FreeForm => self.select_free_form(),
            TurnStrategy::FacilitatorLed => self.select_facilitator_led(),
        }
    }

    fn mentioned_in_last_message(&self) -> Option<usize> {
        let last = self.conversation.messages.last()?;
        last.mentions.iter().find_map(|id| self.index_of(*id))
    }

    fn select_free_form(&mut self) -> usize {
        let last = self.last_speaker_index();
        if let Some(message) = self.conversation.messages.last() {
            for mention in &message.mentions {
                if let Some(index) = self.index_of(*mention) {
                    if Some(index) != last {
                        return index;
                    }
                }
            }
        }
        let candidates: Vec<usize> = (0..self.participants.len())
            .filter(|i| Some(*i) != last)
            .collect();
        candidates[self.rng.gen_range(0..candidates.len())]
    }

    fn select_facilitator_led(&mut self) -> usize {
        let facilitator = self
            .conversation
            .facilitator_id
            .and_then(|id| self.index_of(id))
            .unwrap_or(0);

        let last = self.last_speaker_index();
        match last {
            // Facilitator opens and speaks after every other turn.
            None => facilitator,
            Some(index) if index != facilitator => facilitator,
            Some(_) => {
                let message = self.conversation.messages.last();
                if let Some(choice) = message.and_then(|m| self.facilitator_choice(m, facilitator)) {
                    return choice;
                }
                self.next_non_facilitator(facilitator)
            }
        }
    }

    /// Who the facilitator handed the floor to: an explicit mention
    /// first, otherwise a participant named in the message body.
    fn facilitator_choice(
        &self,
        message: &ConversationMessage,
        facilitator: usize,
    ) -> Option<usize> {
        for mention in &message.mentions {
            if let Some(index) = self.index_of(*mention) {
                if index != facilitator {
                    return Some(index);
                }
            }
        }
        let lowered = message.content.to_lowercase();
        let tokens: Vec<&str> = lowered
            .split(|c: char| !c.is_alphanumeric() && c != '_')
            .collect();
        self.participants.iter().enumerate().find_map(|(index, p)| {
            (index != facilitator && tokens.contains(&p.name.to_lowercase().as_str()))
                .then_some(index)
        })
    }

    fn next_non_facilitator(&mut self, facilitator: usize) -> usize {
        let others: Vec<usize> =
            (0..self.participants.len()).filter(|i| *i != facilitator).collect();
        let index = others[self.non_facilitator_cursor % others.len()];
        self.non_facilitator_cursor += 1;
        index
    }

    // -- Transcript ---------------------------------------------------

    fn append_message(&mut self, speaker: usize, content: String) -> String {
        let mentions = extract_mentions(&content, &self.participants);
        let message = ConversationMessage {
            agent_id: self.participants[speaker].id,
            agent_name: self.participants[speaker].name.clone(),
            content: content.clone(),
            mentions,
            timestamp: Utc::now(),
        };
        if let Some(hook) = &self.on_message {
            hook(&message);
        }
        self.conversation.messages.push(message);
        content
    }

    fn build_prompt(&self, speaker: usize, first_turn: bool) -> String {
        let participant = &self.participants[speaker];
        let mut prompt = format!("Topic: {}\n", self.conversation.topic);
        if let Some(persona) = &participant.persona {
            prompt.push_str(&format!("You are {}. {persona}\n", participant.name));
        } else {
            prompt.push_str(&format!("You are {}.\n", participant.name));
        }
        if first_turn {
            if let Some(initial) = &self.initial_prompt {
                prompt.push_str(initial);
                prompt.push('\n');
            }
        }
        let tail = self.settings.transcript_tail;
        let messages = &self.conversation.messages;
        let skip = messages.len().saturating_sub(tail);
        if !messages.is_empty() {
            prompt.push_str("Conversation so far:\n");
            for message in &messages[skip..] {
                prompt.push_str(&format!("{}: {}\n", message.agent_name, message.content));
            }
        }
        prompt.push_str("Your turn. Reply with your contribution.");
        prompt
    }
}
