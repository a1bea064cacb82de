use crate::llm::types::{ChatMessage, ContentPart, MessageContent};

/// The ordered message list presented to the VLM over one episode.
///
/// Owned by a single agent; reset together with the episode.
#[derive(Debug, Clone, Default)]
pub struct Conversation {
    messages: Vec<ChatMessage>,
}

impl Conversation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn clear(&mut self) {
        self.messages.clear();
    }

    pub fn push(&mut self, message: ChatMessage) {
        self.messages.push(message);
    }

    /// Add a part to the trailing user turn, or open a new user turn if the
    /// conversation does not end with one.
    pub fn append_user_part(&mut self, part: ContentPart) {
        match self.messages.last_mut() {
            Some(last) if last.role == "user" => parts_mut(last).push(part),
            _ => self.messages.push(ChatMessage::user(vec![part])),
        }
    }

    /// Parts of message `idx`, converting plain-text content to a single part.
    pub fn parts_mut(&mut self, idx: usize) -> Option<&mut Vec<ContentPart>> {
        self.messages.get_mut(idx).map(parts_mut)
    }

    pub fn image_count(&self) -> usize {
        self.messages
            .iter()
            .map(|m| match &m.content {
                MessageContent::Parts(parts) => parts.iter().filter(|p| p.is_image()).count(),
                MessageContent::Text(_) => 0,
            })
            .sum()
    }

    /// Keep only the `budget` most recent images, dropping older image parts
    /// in place. Text parts are never touched. Returns how many were removed.
    pub fn prune_images(&mut self, budget: usize) -> usize {
        let mut seen = 0usize;
        let mut removed = 0usize;
        for message in self.messages.iter_mut().rev() {
            let MessageContent::Parts(parts) = &mut message.content else {
                continue;
            };
            let mut keep = Vec::with_capacity(parts.len());
            // Walk newest → oldest inside the turn as well.
            for part in parts.drain(..).rev() {
                if part.is_image() {
                    if seen >= budget {
                        removed += 1;
                        continue;
                    }
                    seen += 1;
                }
                keep.push(part);
            }
            keep.reverse();
            *parts = keep;
        }
        if removed > 0 {
            tracing::debug!(removed, budget, "pruned old screenshots from conversation");
        }
        removed
    }
}

fn parts_mut(message: &mut ChatMessage) -> &mut Vec<ContentPart> {
    if let MessageContent::Text(text) = &mut message.content {
        let text = std::mem::take(text);
        message.content = MessageContent::Parts(vec![ContentPart::text(text)]);
    }
    match &mut message.content {
        MessageContent::Parts(parts) => parts,
        MessageContent::Text(_) => unreachable!("converted to parts above"),
    }
}
