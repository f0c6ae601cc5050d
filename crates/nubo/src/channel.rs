use alloc::format;
use alloc::string::String;
use alloc::vec;
use alloc::vec::Vec;

/// Channel separator.
pub const SEPARATOR: char = '/';

/// Wildcard matching exactly one channel level.
pub const SINGLE_LEVEL_WILDCARD: &str = "+";

/// Wildcard matching all remaining channel levels.
///
/// It is only valid as the last level of a pattern.
pub const MULTI_LEVEL_WILDCARD: &str = "#";

const ACTUATION_REQUEST_ROOT: &str = "actuators/commands/";
const ACTUATOR_STATUS_ROOT: &str = "actuators/status/";
const BINARY_ROOT: &str = "service/binary/";
const FILE_COMMANDS_ROOT: &str = "service/commands/file/";
const URL_COMMANDS_ROOT: &str = "service/commands/url/";
const FILE_STATUS_ROOT: &str = "service/status/file/";
const URL_STATUS_ROOT: &str = "service/status/url/";
const PACKET_REQUEST_ROOT: &str = "service/binary_request/";
const FILE_LIST_UPDATE_ROOT: &str = "service/file_list_update/";

/// Checks whether a concrete channel matches a pattern.
///
/// Levels are delimited by `/` and compared case-sensitively.
/// The `+` wildcard matches exactly one level, even an empty one, while the
/// `#` wildcard matches all remaining levels, including their absence,
/// and must be the last level of the pattern. A pattern with a misplaced `#`
/// never matches.
#[must_use]
pub fn matches(pattern: &str, channel: &str) -> bool {
    let mut pattern_levels = pattern.split(SEPARATOR).peekable();
    let mut channel_levels = channel.split(SEPARATOR);

    while let Some(pattern_level) = pattern_levels.next() {
        if pattern_level == MULTI_LEVEL_WILDCARD {
            return pattern_levels.peek().is_none();
        }

        let Some(channel_level) = channel_levels.next() else {
            return false;
        };

        if pattern_level != SINGLE_LEVEL_WILDCARD && pattern_level != channel_level {
            return false;
        }
    }

    channel_levels.next().is_none()
}

/// All channels of a device.
///
/// Each channel is a fixed root concatenated with the device key.
/// Actuation channels have an additional trailing level containing the
/// actuator reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Channels {
    device_key: String,
}

impl Channels {
    /// Creates the [`Channels`] for the given device key.
    #[must_use]
    #[inline]
    pub fn new(device_key: impl Into<String>) -> Self {
        Self {
            device_key: device_key.into(),
        }
    }

    /// Returns the device key.
    #[must_use]
    #[inline]
    pub fn device_key(&self) -> &str {
        &self.device_key
    }

    /// Channel where the actuation requests for an actuator arrive.
    #[must_use]
    pub fn actuation(&self, reference: &str) -> String {
        format!("{ACTUATION_REQUEST_ROOT}{}/{reference}", self.device_key)
    }

    /// Pattern matching the actuation requests for all actuators.
    #[must_use]
    pub fn actuation_pattern(&self) -> String {
        self.actuation(SINGLE_LEVEL_WILDCARD)
    }

    /// Prefix shared by all actuation channels of the device.
    #[must_use]
    pub fn actuation_prefix(&self) -> String {
        format!("{ACTUATION_REQUEST_ROOT}{}/", self.device_key)
    }

    /// Channel where an actuator status is published.
    #[must_use]
    pub fn actuator_status(&self, reference: &str) -> String {
        format!("{ACTUATOR_STATUS_ROOT}{}/{reference}", self.device_key)
    }

    /// Channel carrying the binary packets of a chunked transfer.
    #[must_use]
    pub fn binary(&self) -> String {
        format!("{BINARY_ROOT}{}", self.device_key)
    }

    /// Channel carrying the file management commands.
    #[must_use]
    pub fn file_commands(&self) -> String {
        format!("{FILE_COMMANDS_ROOT}{}", self.device_key)
    }

    /// Channel carrying the `URL` download commands.
    #[must_use]
    pub fn url_commands(&self) -> String {
        format!("{URL_COMMANDS_ROOT}{}", self.device_key)
    }

    /// Channel where the chunked transfer statuses are published.
    #[must_use]
    pub fn file_status(&self) -> String {
        format!("{FILE_STATUS_ROOT}{}", self.device_key)
    }

    /// Channel where the `URL` download statuses are published.
    #[must_use]
    pub fn url_status(&self) -> String {
        format!("{URL_STATUS_ROOT}{}", self.device_key)
    }

    /// Channel where the packet requests are published.
    #[must_use]
    pub fn packet_request(&self) -> String {
        format!("{PACKET_REQUEST_ROOT}{}", self.device_key)
    }

    /// Channel where the list of the stored files is published.
    #[must_use]
    pub fn file_list_update(&self) -> String {
        format!("{FILE_LIST_UPDATE_ROOT}{}", self.device_key)
    }

    /// Inbound channels used by the file management service.
    #[must_use]
    pub fn file_management_inbound(&self) -> Vec<String> {
        vec![self.binary(), self.file_commands(), self.url_commands()]
    }
}

#[cfg(test)]
mod tests {
    use alloc::string::ToString;
    use alloc::vec;

    use super::{Channels, matches};

    #[test]
    fn exact_match() {
        assert!(matches("service/binary/KEY", "service/binary/KEY"));
        assert!(!matches("service/binary/KEY", "service/binary/key"));
        assert!(!matches("service/binary/KEY", "service/binary"));
        assert!(!matches("service/binary", "service/binary/KEY"));
    }

    #[test]
    fn single_level_wildcard() {
        assert!(matches("actuators/commands/KEY/+", "actuators/commands/KEY/SW"));
        assert!(matches("actuators/commands/KEY/+", "actuators/commands/KEY/"));
        assert!(matches("+/commands/+/+", "actuators/commands/KEY/SW"));
        assert!(!matches("actuators/commands/KEY/+", "actuators/commands/KEY"));
        assert!(!matches(
            "actuators/commands/KEY/+",
            "actuators/commands/KEY/SW/extra"
        ));
    }

    #[test]
    fn multi_level_wildcard() {
        assert!(matches("service/#", "service/binary/KEY"));
        assert!(matches("service/#", "service"));
        assert!(matches("#", "any/channel/at/all"));
        assert!(!matches("service/#", "actuators/commands/KEY"));
        // A misplaced multi-level wildcard never matches.
        assert!(!matches("service/#/KEY", "service/binary/KEY"));
    }

    #[test]
    fn device_channels() {
        let channels = Channels::new("KEY");

        assert_eq!(channels.device_key(), "KEY");
        assert_eq!(channels.actuation("SW"), "actuators/commands/KEY/SW");
        assert_eq!(channels.actuation_pattern(), "actuators/commands/KEY/+");
        assert_eq!(channels.actuator_status("SW"), "actuators/status/KEY/SW");
        assert_eq!(channels.packet_request(), "service/binary_request/KEY");
        assert_eq!(channels.file_list_update(), "service/file_list_update/KEY");
        assert_eq!(
            channels.file_management_inbound(),
            vec![
                "service/binary/KEY".to_string(),
                "service/commands/file/KEY".to_string(),
                "service/commands/url/KEY".to_string(),
            ]
        );

        assert!(matches(
            &channels.actuation_pattern(),
            &channels.actuation("SW")
        ));
    }
}
