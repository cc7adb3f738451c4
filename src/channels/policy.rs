use super::transport::InboundMessage;
use crate::config::AccessSettings;
use std::collections::BTreeSet;

/// Decides whether an inbound message is handled at all.
pub trait AccessPolicy: Send + Sync {
    fn allows(&self, message: &InboundMessage) -> bool;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl AccessPolicy for AllowAll {
    fn allows(&self, _message: &InboundMessage) -> bool {
        true
    }
}

/// Admits listed chats and listed users. Both lists empty admits everyone.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AllowList {
    chat_ids: BTreeSet<String>,
    user_ids: BTreeSet<String>,
}

impl AllowList {
    pub fn new(
        chat_ids: impl IntoIterator<Item = String>,
        user_ids: impl IntoIterator<Item = String>,
    ) -> Self {
        Self {
            chat_ids: chat_ids.into_iter().collect(),
            user_ids: user_ids.into_iter().collect(),
        }
    }

    pub fn from_settings(access: &AccessSettings) -> Self {
        Self::new(
            access.allowed_chat_ids.iter().cloned(),
            access.allowed_user_ids.iter().cloned(),
        )
    }

    pub fn is_open(&self) -> bool {
        self.chat_ids.is_empty() && self.user_ids.is_empty()
    }
}

impl AccessPolicy for AllowList {
    fn allows(&self, message: &InboundMessage) -> bool {
        self.is_open()
            || self.chat_ids.contains(message.chat_id.as_str())
            || self.user_ids.contains(message.sender_id.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channels::transport::ChatKind;
    use crate::shared::ids::{ChatId, UserId};

    fn message(chat: &str, user: &str) -> InboundMessage {
        InboundMessage {
            message_id: "1".to_string(),
            chat_id: ChatId::new(chat),
            chat_kind: ChatKind::Group,
            sender_id: UserId::new(user),
            sender_name: "dana".to_string(),
            text: Some("/help".to_string()),
            image: None,
        }
    }

    #[test]
    fn empty_lists_admit_everyone() {
        assert!(AllowList::default().allows(&message("c1", "u1")));
    }

    #[test]
    fn listed_chat_or_listed_user_is_admitted() {
        let policy = AllowList::new(vec!["c1".to_string()], vec!["u9".to_string()]);
        assert!(policy.allows(&message("c1", "u1")));
        assert!(policy.allows(&message("c2", "u9")));
        assert!(!policy.allows(&message("c2", "u1")));
    }
}
