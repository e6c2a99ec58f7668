use thiserror::Error;

/// Root segment used when no prefix is configured.
pub const DEFAULT_PREFIX: &str = "iot3";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TopicError {
    #[error("Device id must not be empty.")]
    EmptyDeviceId,
    #[error("Device id '{0}' contains a topic separator or wildcard.")]
    ReservedCharacter(String),
}

/// Every topic an agent publishes to or subscribes on, derived from its device id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicSet {
    pub event_prefix: String,
    pub command_base: String,
    pub command: String,
    pub meta: String,
    pub log: String,
    pub update: String,
    pub reboot: String,
    pub reset: String,
    pub upgrade: String,
}

impl TopicSet {
    pub fn derive(device_id: &str) -> Result<Self, TopicError> {
        Self::derive_with_prefix(DEFAULT_PREFIX, device_id)
    }

    pub fn derive_with_prefix(prefix: &str, device_id: &str) -> Result<Self, TopicError> {
        if device_id.is_empty() {
            return Err(TopicError::EmptyDeviceId);
        }
        if device_id.contains(['/', '+', '#']) {
            return Err(TopicError::ReservedCharacter(device_id.to_string()));
        }

        let root = format!("{}/{}", prefix.trim_end_matches('/'), device_id);
        let command_base = format!("{}/cmd/", root);

        Ok(Self {
            event_prefix: format!("{}/evt/", root),
            command: format!("{}+/fmt/+", command_base),
            command_base,
            meta: format!("{}/mgmt/device/meta", root),
            log: format!("{}/mgmt/device/status", root),
            update: format!("{}/mgmt/device/update", root),
            reboot: format!("{}/mgmt/initiate/device/reboot", root),
            reset: format!("{}/mgmt/initiate/device/factory_reset", root),
            upgrade: format!("{}/mgmt/initiate/firmware/update", root),
        })
    }

    /// `<prefix>/<id>/evt/<event_id>/fmt/<format>`
    pub fn event(&self, event_id: &str, format: &str) -> String {
        format!("{}{}/fmt/{}", self.event_prefix, event_id, format)
    }

    /// Presence topic carrying the online/offline status and the last will.
    pub fn connection(&self) -> String {
        self.event("connection", "json")
    }

    /// Control topics the agent subscribes to besides the command wildcard.
    pub fn control_topics(&self) -> [&str; 4] {
        [&self.reboot, &self.reset, &self.update, &self.upgrade]
    }

    pub fn is_command(&self, topic: &str) -> bool {
        topic.starts_with(&self.command_base)
    }

    pub fn all(&self) -> [&str; 8] {
        [
            &self.event_prefix,
            &self.command,
            &self.meta,
            &self.log,
            &self.update,
            &self.reboot,
            &self.reset,
            &self.upgrade,
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derives_documented_layout() {
        let topics = TopicSet::derive("abc").unwrap();
        assert_eq!(topics.event_prefix, "iot3/abc/evt/");
        assert_eq!(topics.command, "iot3/abc/cmd/+/fmt/+");
        assert_eq!(topics.meta, "iot3/abc/mgmt/device/meta");
        assert_eq!(topics.log, "iot3/abc/mgmt/device/status");
        assert_eq!(topics.update, "iot3/abc/mgmt/device/update");
        assert_eq!(topics.reboot, "iot3/abc/mgmt/initiate/device/reboot");
        assert_eq!(topics.reset, "iot3/abc/mgmt/initiate/device/factory_reset");
        assert_eq!(topics.upgrade, "iot3/abc/mgmt/initiate/firmware/update");
    }

    #[test]
    fn every_topic_names_the_device_once() {
        let topics = TopicSet::derive("abc").unwrap();
        for topic in topics.all() {
            assert_eq!(topic.matches("abc").count(), 1, "{}", topic);
            assert_eq!(topic.split('/').nth(1), Some("abc"));
        }
    }

    #[test]
    fn rejects_empty_device_id() {
        assert_eq!(TopicSet::derive(""), Err(TopicError::EmptyDeviceId));
    }

    #[test]
    fn rejects_ids_that_escape_the_namespace() {
        for id in ["a/b", "+", "dev#", "../other"] {
            assert_eq!(
                TopicSet::derive(id),
                Err(TopicError::ReservedCharacter(id.to_string()))
            );
        }
    }

    #[test]
    fn event_topics_and_command_matching() {
        let topics = TopicSet::derive_with_prefix("fleet/", "dev1").unwrap();
        assert_eq!(topics.event("status", "json"), "fleet/dev1/evt/status/fmt/json");
        assert_eq!(topics.connection(), "fleet/dev1/evt/connection/fmt/json");
        assert!(topics.is_command("fleet/dev1/cmd/valve/fmt/json"));
        assert!(!topics.is_command("fleet/dev2/cmd/valve/fmt/json"));
        assert!(!topics.is_command(&topics.reboot));
    }
}
