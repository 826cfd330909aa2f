//! Protocol-level constants and small value types shared by all operations.

use std::fmt;

/// MIME type of a WBXML request or response body.
pub const WBXML_MIME_TYPE: &str = "application/vnd.ms-sync.wbxml";
/// MIME type used for raw message uploads on protocol versions before 14.0.
pub const RFC822_MIME_TYPE: &str = "message/rfc822";

/// The device type reported in every request URI. Servers are known to gate
/// behavior on this string, so it stays fixed.
pub const DEVICE_TYPE: &str = "Android";

/// Policy type requested from servers speaking 12.0 or later.
pub const EAS_12_POLICY_TYPE: &str = "MS-EAS-Provisioning-WBXML";
/// Policy type requested from 2.5 servers; the policy arrives as a WAP
/// provisioning XML document instead of WBXML.
pub const EAS_2_POLICY_TYPE: &str = "MS-WAP-Provisioning-XML";

/// An Exchange ActiveSync dialect version.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum ProtocolVersion {
    V2_5,
    V12_0,
    V12_1,
    V14_0,
    V14_1,
}

impl ProtocolVersion {
    /// The newest dialect this client speaks, used until the server tells us
    /// otherwise.
    pub const DEFAULT: ProtocolVersion = ProtocolVersion::V14_1;

    /// All dialects this client speaks, oldest first.
    pub const SUPPORTED: &'static [ProtocolVersion] = &[
        ProtocolVersion::V2_5,
        ProtocolVersion::V12_0,
        ProtocolVersion::V12_1,
        ProtocolVersion::V14_0,
        ProtocolVersion::V14_1,
    ];

    /// The version string as it appears in the `MS-ASProtocolVersion` header.
    pub fn as_str(self) -> &'static str {
        match self {
            ProtocolVersion::V2_5 => "2.5",
            ProtocolVersion::V12_0 => "12.0",
            ProtocolVersion::V12_1 => "12.1",
            ProtocolVersion::V14_0 => "14.0",
            ProtocolVersion::V14_1 => "14.1",
        }
    }

    /// Parses a version string from an `MS-ASProtocolVersions` header field.
    pub fn parse(s: &str) -> Option<ProtocolVersion> {
        ProtocolVersion::SUPPORTED
            .iter()
            .copied()
            .find(|v| v.as_str() == s.trim())
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How far back a folder syncs, expressed as the AirSync `FilterType` value.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Lookback {
    All,
    OneDay,
    ThreeDays,
    #[default]
    OneWeek,
    TwoWeeks,
    OneMonth,
}

impl Lookback {
    /// The wire value for the `FilterType` element.
    pub fn filter_code(self) -> &'static str {
        match self {
            Lookback::All => "0",
            Lookback::OneDay => "1",
            Lookback::ThreeDays => "2",
            Lookback::OneWeek => "3",
            Lookback::TwoWeeks => "4",
            Lookback::OneMonth => "5",
        }
    }
}

/// Values for the AirSyncBase `BodyPreference/Type` element.
pub mod body_type {
    pub const TEXT: &str = "1";
    pub const HTML: &str = "2";
    pub const MIME: &str = "4";
}

/// `MIMESupport` values: never send MIME, or always send MIME.
pub mod mime_support {
    pub const NEVER: &str = "0";
    pub const ALWAYS: &str = "2";
}

/// Truncation sizes. 2.5 servers take an enumerated code ("7" meaning no
/// truncation); 12.0+ servers take a byte count.
pub mod truncation {
    pub const EAS_2_5_NONE: &str = "7";
    pub const EAS_12_SIZE: &str = "200000";
}

/// Status codes shared by the Sync family of commands (MS-ASCMD 2.2.3.177.17).
pub mod sync_status {
    pub const SUCCESS: u32 = 1;
    pub const BAD_SYNC_KEY: u32 = 3;
    pub const PROTOCOL_ERROR: u32 = 4;
    pub const SERVER_ERROR: u32 = 5;
    pub const NOT_FOUND: u32 = 8;
    pub const FOLDER_SYNC_REQUIRED: u32 = 12;
    pub const RETRY: u32 = 16;

    /// Whether a failed command with this status is worth retrying as-is.
    pub fn should_retry(status: u32) -> bool {
        status == SERVER_ERROR || status == RETRY
    }
}

/// Status codes for the FolderSync command.
pub mod folder_status {
    pub const OK: u32 = 1;
    pub const INVALID_SYNC_KEY: u32 = 9;
}

/// Command statuses in the provisioning range demand a provisioning round
/// before the original command will be served (MS-ASCMD common status codes
/// 139 through 145).
pub fn status_needs_provisioning(status: u32) -> bool {
    (139..=145).contains(&status)
}

/// The folder type table from the FolderSync command.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FolderType {
    UserGeneric,
    Inbox,
    Drafts,
    DeletedItems,
    SentItems,
    Outbox,
    Tasks,
    Calendar,
    Contacts,
    Notes,
    Journal,
    UserMail,
    UserCalendar,
    UserContacts,
    UserTasks,
    Unknown(u32),
}

impl FolderType {
    pub fn from_code(code: u32) -> FolderType {
        match code {
            1 => FolderType::UserGeneric,
            2 => FolderType::Inbox,
            3 => FolderType::Drafts,
            4 => FolderType::DeletedItems,
            5 => FolderType::SentItems,
            6 => FolderType::Outbox,
            7 => FolderType::Tasks,
            8 => FolderType::Calendar,
            9 => FolderType::Contacts,
            10 => FolderType::Notes,
            11 => FolderType::Journal,
            12 => FolderType::UserMail,
            13 => FolderType::UserCalendar,
            14 => FolderType::UserContacts,
            15 => FolderType::UserTasks,
            other => FolderType::Unknown(other),
        }
    }

    /// Whether this folder holds mail and should take part in email sync.
    pub fn holds_mail(self) -> bool {
        matches!(
            self,
            FolderType::Inbox
                | FolderType::Drafts
                | FolderType::DeletedItems
                | FolderType::SentItems
                | FolderType::Outbox
                | FolderType::UserMail
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn versions_are_ordered() {
        assert!(ProtocolVersion::V2_5 < ProtocolVersion::V12_0);
        assert!(ProtocolVersion::V12_1 < ProtocolVersion::V14_0);
        assert!(ProtocolVersion::V14_1 >= ProtocolVersion::V14_0);
    }

    #[test]
    fn version_round_trips_through_header_string() {
        for &v in ProtocolVersion::SUPPORTED {
            assert_eq!(ProtocolVersion::parse(v.as_str()), Some(v));
        }
        assert_eq!(ProtocolVersion::parse("16.1"), None);
    }

    #[test]
    fn retryable_sync_statuses() {
        assert!(sync_status::should_retry(5));
        assert!(sync_status::should_retry(16));
        assert!(!sync_status::should_retry(1));
        assert!(!sync_status::should_retry(3));
        assert!(!sync_status::should_retry(12));
    }

    #[test]
    fn folder_types_map_to_mail_folders() {
        assert!(FolderType::from_code(2).holds_mail());
        assert!(FolderType::from_code(12).holds_mail());
        assert!(!FolderType::from_code(8).holds_mail());
        assert_eq!(FolderType::from_code(99), FolderType::Unknown(99));
    }
}
