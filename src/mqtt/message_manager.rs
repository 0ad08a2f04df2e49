use std::fmt;

/// Message the engine hands to the bridge for publication
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    pub topic: String,
    pub payload: String,
    pub retain: bool,
}

impl fmt::Display for OutboundMessage {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let preview: String = self.payload.chars().take(40).collect();
        let ellipsis = if preview.len() < self.payload.len() { "..." } else { "" };
        write!(
            f,
            "{} <- {}{}{}",
            self.topic,
            preview,
            ellipsis,
            if self.retain { " (retained)" } else { "" }
        )
    }
}

impl OutboundMessage {
    /// Input state or one-shot trigger, not retained
    pub fn event(topic: impl Into<String>, payload: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            retain: false,
        }
    }

    /// Output state or discovery descriptor, retained by the broker
    pub fn retained(topic: impl Into<String>, payload: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            retain: true,
        }
    }
}

/// Notification from the bridge to the engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BridgeEvent {
    /// A broker session was (re)established and subscriptions are in place
    Connected,
    /// Command received on the command topic of `output`
    Command { output: String, payload: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_truncates_long_payloads() {
        let msg = OutboundMessage::retained("a/b", "x".repeat(100));
        let rendered = msg.to_string();
        assert!(rendered.starts_with("a/b <- xxxx"));
        assert!(rendered.ends_with("... (retained)"));

        assert_eq!(OutboundMessage::event("a/b", "ON").to_string(), "a/b <- ON");
    }
}
