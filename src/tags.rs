//! The Exchange ActiveSync WBXML codebook.
//!
//! Every element that can appear on the wire is identified by a codepage and
//! a 6-bit token. A [`Tag`] packs both into one value so parsers can match on
//! a single constant regardless of which `SWITCH_PAGE` state the stream was
//! in when the token was read.

use std::fmt;

/// Number of bits the codepage is shifted left within a packed [`Tag`].
pub const PAGE_SHIFT: u16 = 6;
/// Mask selecting the token bits of a packed [`Tag`] (or of a raw wire byte).
pub const PAGE_MASK: u16 = 0x3f;

/// A WBXML element identifier: codepage plus in-page token.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Tag(u16);

impl Tag {
    /// Packs a codepage and an in-page token into a `Tag`.
    pub const fn new(page: u8, code: u8) -> Tag {
        Tag(((page as u16) << PAGE_SHIFT) | (code as u16 & PAGE_MASK))
    }

    /// The codepage this tag lives in.
    pub const fn page(self) -> u8 {
        (self.0 >> PAGE_SHIFT) as u8
    }

    /// The in-page token, as it appears on the wire (without the
    /// with-content bit).
    pub const fn code(self) -> u8 {
        (self.0 & PAGE_MASK) as u8
    }
}

impl fmt::Debug for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => f.write_str(name),
            None => write!(f, "Unknown({}:0x{:02x})", self.page(), self.code()),
        }
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Codepage numbers, as assigned by MS-ASWBXML.
pub mod pages {
    pub const AIRSYNC: u8 = 0x00;
    pub const EMAIL: u8 = 0x02;
    pub const MOVE: u8 = 0x05;
    pub const FOLDER: u8 = 0x07;
    pub const TASK: u8 = 0x09;
    pub const PROVISION: u8 = 0x0e;
    pub const BASE: u8 = 0x11;
    pub const SETTINGS: u8 = 0x12;
    pub const COMPOSE: u8 = 0x15;
    pub const EMAIL2: u8 = 0x16;
}

/// The human-readable name of a codepage, for wire logging.
pub fn page_name(page: u8) -> Option<&'static str> {
    Some(match page {
        pages::AIRSYNC => "AirSync",
        pages::EMAIL => "Email",
        pages::MOVE => "Move",
        pages::FOLDER => "FolderHierarchy",
        pages::TASK => "Tasks",
        pages::PROVISION => "Provision",
        pages::BASE => "AirSyncBase",
        pages::SETTINGS => "Settings",
        pages::COMPOSE => "ComposeMail",
        pages::EMAIL2 => "Email2",
        _ => return None,
    })
}

macro_rules! codebook {
    ($($page:expr => { $($konst:ident = $code:expr, $name:expr;)+ })+) => {
        $($(pub const $konst: Tag = Tag::new($page, $code);)+)+

        impl Tag {
            /// The XML element name for tags this client knows about.
            pub fn name(self) -> Option<&'static str> {
                match self {
                    $($(t if t == $konst => Some($name),)+)+
                    _ => None,
                }
            }
        }
    };
}

codebook! {
    pages::AIRSYNC => {
        SYNC_SYNC = 0x05, "Sync";
        SYNC_RESPONSES = 0x06, "Responses";
        SYNC_ADD = 0x07, "Add";
        SYNC_CHANGE = 0x08, "Change";
        SYNC_DELETE = 0x09, "Delete";
        SYNC_FETCH = 0x0a, "Fetch";
        SYNC_SYNC_KEY = 0x0b, "SyncKey";
        SYNC_CLIENT_ID = 0x0c, "ClientId";
        SYNC_SERVER_ID = 0x0d, "ServerId";
        SYNC_STATUS = 0x0e, "Status";
        SYNC_COLLECTION = 0x0f, "Collection";
        SYNC_CLASS = 0x10, "Class";
        SYNC_VERSION = 0x11, "Version";
        SYNC_COLLECTION_ID = 0x12, "CollectionId";
        SYNC_GET_CHANGES = 0x13, "GetChanges";
        SYNC_MORE_AVAILABLE = 0x14, "MoreAvailable";
        SYNC_WINDOW_SIZE = 0x15, "WindowSize";
        SYNC_COMMANDS = 0x16, "Commands";
        SYNC_OPTIONS = 0x17, "Options";
        SYNC_FILTER_TYPE = 0x18, "FilterType";
        SYNC_TRUNCATION = 0x19, "Truncation";
        SYNC_CONFLICT = 0x1b, "Conflict";
        SYNC_COLLECTIONS = 0x1c, "Collections";
        SYNC_APPLICATION_DATA = 0x1d, "ApplicationData";
        SYNC_DELETES_AS_MOVES = 0x1e, "DeletesAsMoves";
        SYNC_SUPPORTED = 0x20, "Supported";
        SYNC_SOFT_DELETE = 0x21, "SoftDelete";
        SYNC_MIME_SUPPORT = 0x22, "MIMESupport";
        SYNC_MIME_TRUNCATION = 0x23, "MIMETruncation";
        SYNC_WAIT = 0x24, "Wait";
        SYNC_LIMIT = 0x25, "Limit";
        SYNC_PARTIAL = 0x26, "Partial";
    }
    pages::EMAIL => {
        EMAIL_ATTACHMENT = 0x05, "Attachment";
        EMAIL_ATTACHMENTS = 0x06, "Attachments";
        EMAIL_ATT_NAME = 0x07, "AttName";
        EMAIL_ATT_SIZE = 0x08, "AttSize";
        EMAIL_ATT0_ID = 0x09, "Att0Id";
        EMAIL_ATT_METHOD = 0x0a, "AttMethod";
        EMAIL_ATT_REMOVED = 0x0b, "AttRemoved";
        EMAIL_BODY = 0x0c, "Body";
        EMAIL_BODY_SIZE = 0x0d, "BodySize";
        EMAIL_BODY_TRUNCATED = 0x0e, "BodyTruncated";
        EMAIL_DATE_RECEIVED = 0x0f, "DateReceived";
        EMAIL_DISPLAY_NAME = 0x10, "DisplayName";
        EMAIL_DISPLAY_TO = 0x11, "DisplayTo";
        EMAIL_IMPORTANCE = 0x12, "Importance";
        EMAIL_MESSAGE_CLASS = 0x13, "MessageClass";
        EMAIL_SUBJECT = 0x14, "Subject";
        EMAIL_READ = 0x15, "Read";
        EMAIL_TO = 0x16, "To";
        EMAIL_CC = 0x17, "Cc";
        EMAIL_FROM = 0x18, "From";
        EMAIL_REPLY_TO = 0x19, "ReplyTo";
        EMAIL_CATEGORIES = 0x1b, "Categories";
        EMAIL_CATEGORY = 0x1c, "Category";
        EMAIL_MEETING_REQUEST = 0x22, "MeetingRequest";
        EMAIL_THREAD_TOPIC = 0x35, "ThreadTopic";
        EMAIL_MIME_DATA = 0x36, "MIMEData";
        EMAIL_MIME_TRUNCATED = 0x37, "MIMETruncated";
        EMAIL_MIME_SIZE = 0x38, "MIMESize";
        EMAIL_INTERNET_CPID = 0x39, "InternetCPID";
        EMAIL_FLAG = 0x3a, "Flag";
        EMAIL_FLAG_STATUS = 0x3b, "FlagStatus";
        EMAIL_CONTENT_CLASS = 0x3c, "ContentClass";
        EMAIL_FLAG_TYPE = 0x3d, "FlagType";
        EMAIL_COMPLETE_TIME = 0x3e, "CompleteTime";
    }
    pages::MOVE => {
        MOVE_MOVE_ITEMS = 0x05, "MoveItems";
        MOVE_MOVE = 0x06, "Move";
        MOVE_SRC_MSG_ID = 0x07, "SrcMsgId";
        MOVE_SRC_FLD_ID = 0x08, "SrcFldId";
        MOVE_DST_FLD_ID = 0x09, "DstFldId";
        MOVE_RESPONSE = 0x0a, "Response";
        MOVE_STATUS = 0x0b, "Status";
        MOVE_DST_MSG_ID = 0x0c, "DstMsgId";
    }
    pages::FOLDER => {
        FOLDER_FOLDERS = 0x05, "Folders";
        FOLDER_FOLDER = 0x06, "Folder";
        FOLDER_DISPLAY_NAME = 0x07, "DisplayName";
        FOLDER_SERVER_ID = 0x08, "ServerId";
        FOLDER_PARENT_ID = 0x09, "ParentId";
        FOLDER_TYPE = 0x0a, "Type";
        FOLDER_RESPONSE = 0x0b, "Response";
        FOLDER_STATUS = 0x0c, "Status";
        FOLDER_CONTENT_CLASS = 0x0d, "ContentClass";
        FOLDER_CHANGES = 0x0e, "Changes";
        FOLDER_ADD = 0x0f, "Add";
        FOLDER_DELETE = 0x10, "Delete";
        FOLDER_UPDATE = 0x11, "Update";
        FOLDER_SYNC_KEY = 0x12, "SyncKey";
        FOLDER_FOLDER_CREATE = 0x13, "FolderCreate";
        FOLDER_FOLDER_DELETE = 0x14, "FolderDelete";
        FOLDER_FOLDER_UPDATE = 0x15, "FolderUpdate";
        FOLDER_FOLDER_SYNC = 0x16, "FolderSync";
        FOLDER_COUNT = 0x17, "Count";
    }
    pages::TASK => {
        // Only the subset the flag upsync borrows from the Tasks vocabulary.
        TASK_DUE_DATE = 0x0c, "DueDate";
        TASK_UTC_DUE_DATE = 0x0d, "UtcDueDate";
        TASK_START_DATE = 0x1e, "StartDate";
        TASK_UTC_START_DATE = 0x1f, "UtcStartDate";
    }
    pages::PROVISION => {
        PROVISION_PROVISION = 0x05, "Provision";
        PROVISION_POLICIES = 0x06, "Policies";
        PROVISION_POLICY = 0x07, "Policy";
        PROVISION_POLICY_TYPE = 0x08, "PolicyType";
        PROVISION_POLICY_KEY = 0x09, "PolicyKey";
        PROVISION_DATA = 0x0a, "Data";
        PROVISION_STATUS = 0x0b, "Status";
        PROVISION_REMOTE_WIPE = 0x0c, "RemoteWipe";
        PROVISION_EAS_PROVISION_DOC = 0x0d, "EASProvisionDoc";
        PROVISION_PASSWORD_ENABLED = 0x0e, "DevicePasswordEnabled";
        PROVISION_ALPHANUMERIC_PASSWORD_REQUIRED = 0x0f, "AlphanumericDevicePasswordRequired";
        PROVISION_DEVICE_ENCRYPTION_ENABLED = 0x10, "DeviceEncryptionEnabled";
        PROVISION_PASSWORD_RECOVERY_ENABLED = 0x11, "PasswordRecoveryEnabled";
        PROVISION_ATTACHMENTS_ENABLED = 0x12, "AttachmentsEnabled";
        PROVISION_MIN_PASSWORD_LENGTH = 0x13, "MinDevicePasswordLength";
        PROVISION_MAX_INACTIVITY_TIME_LOCK = 0x14, "MaxInactivityTimeDeviceLock";
        PROVISION_MAX_PASSWORD_FAILS = 0x15, "MaxDevicePasswordFailedAttempts";
        PROVISION_MAX_ATTACHMENT_SIZE = 0x16, "MaxAttachmentSize";
        PROVISION_ALLOW_SIMPLE_PASSWORD = 0x17, "AllowSimpleDevicePassword";
        PROVISION_PASSWORD_EXPIRATION = 0x18, "DevicePasswordExpiration";
        PROVISION_PASSWORD_HISTORY = 0x19, "DevicePasswordHistory";
        PROVISION_ALLOW_STORAGE_CARD = 0x1a, "AllowStorageCard";
        PROVISION_ALLOW_CAMERA = 0x1b, "AllowCamera";
        PROVISION_REQUIRE_DEVICE_ENCRYPTION = 0x1c, "RequireDeviceEncryption";
        PROVISION_ALLOW_UNSIGNED_APPLICATIONS = 0x1d, "AllowUnsignedApplications";
        PROVISION_ALLOW_UNSIGNED_INSTALLATION_PACKAGES = 0x1e, "AllowUnsignedInstallationPackages";
        PROVISION_MIN_PASSWORD_COMPLEX_CHARS = 0x1f, "MinDevicePasswordComplexCharacters";
        PROVISION_ALLOW_WIFI = 0x20, "AllowWiFi";
        PROVISION_ALLOW_TEXT_MESSAGING = 0x21, "AllowTextMessaging";
        PROVISION_ALLOW_POP_IMAP = 0x22, "AllowPOPIMAPEmail";
        PROVISION_ALLOW_BLUETOOTH = 0x23, "AllowBluetooth";
        PROVISION_ALLOW_IRDA = 0x24, "AllowIrDA";
        PROVISION_REQUIRE_MANUAL_SYNC_WHEN_ROAMING = 0x25, "RequireManualSyncWhenRoaming";
        PROVISION_ALLOW_DESKTOP_SYNC = 0x26, "AllowDesktopSync";
        PROVISION_MAX_CALENDAR_AGE_FILTER = 0x27, "MaxCalendarAgeFilter";
        PROVISION_ALLOW_HTML_EMAIL = 0x28, "AllowHTMLEmail";
        PROVISION_MAX_EMAIL_AGE_FILTER = 0x29, "MaxEmailAgeFilter";
        PROVISION_MAX_EMAIL_BODY_TRUNCATION_SIZE = 0x2a, "MaxEmailBodyTruncationSize";
        PROVISION_MAX_EMAIL_HTML_BODY_TRUNCATION_SIZE = 0x2b, "MaxEmailHTMLBodyTruncationSize";
        PROVISION_REQUIRE_SIGNED_SMIME_MESSAGES = 0x2c, "RequireSignedSMIMEMessages";
        PROVISION_REQUIRE_ENCRYPTED_SMIME_MESSAGES = 0x2d, "RequireEncryptedSMIMEMessages";
        PROVISION_REQUIRE_SIGNED_SMIME_ALGORITHM = 0x2e, "RequireSignedSMIMEAlgorithm";
        PROVISION_REQUIRE_ENCRYPTION_SMIME_ALGORITHM = 0x2f, "RequireEncryptionSMIMEAlgorithm";
        PROVISION_ALLOW_SMIME_ENCRYPTION_NEGOTIATION = 0x30, "AllowSMIMEEncryptionAlgorithmNegotiation";
        PROVISION_ALLOW_SMIME_SOFT_CERTS = 0x31, "AllowSMIMESoftCerts";
        PROVISION_ALLOW_BROWSER = 0x32, "AllowBrowser";
        PROVISION_ALLOW_CONSUMER_EMAIL = 0x33, "AllowConsumerEmail";
        PROVISION_ALLOW_REMOTE_DESKTOP = 0x34, "AllowRemoteDesktop";
        PROVISION_ALLOW_INTERNET_SHARING = 0x35, "AllowInternetSharing";
        PROVISION_UNAPPROVED_IN_ROM_APPLICATION_LIST = 0x36, "UnapprovedInROMApplicationList";
        PROVISION_APPLICATION_NAME = 0x37, "ApplicationName";
        PROVISION_APPROVED_APPLICATION_LIST = 0x38, "ApprovedApplicationList";
        PROVISION_HASH = 0x39, "Hash";
    }
    pages::BASE => {
        BASE_BODY_PREFERENCE = 0x05, "BodyPreference";
        BASE_TYPE = 0x06, "Type";
        BASE_TRUNCATION_SIZE = 0x07, "TruncationSize";
        BASE_ALL_OR_NONE = 0x08, "AllOrNone";
        BASE_BODY = 0x0a, "Body";
        BASE_DATA = 0x0b, "Data";
        BASE_ESTIMATED_DATA_SIZE = 0x0c, "EstimatedDataSize";
        BASE_TRUNCATED = 0x0d, "Truncated";
        BASE_ATTACHMENTS = 0x0e, "Attachments";
        BASE_ATTACHMENT = 0x0f, "Attachment";
        BASE_DISPLAY_NAME = 0x10, "DisplayName";
        BASE_METHOD = 0x11, "Method";
        BASE_FILE_REFERENCE = 0x12, "FileReference";
        BASE_CONTENT_ID = 0x13, "ContentId";
        BASE_CONTENT_LOCATION = 0x14, "ContentLocation";
        BASE_IS_INLINE = 0x15, "IsInline";
        BASE_NATIVE_BODY_TYPE = 0x16, "NativeBodyType";
        BASE_CONTENT_TYPE = 0x17, "ContentType";
    }
    pages::SETTINGS => {
        SETTINGS_SETTINGS = 0x05, "Settings";
        SETTINGS_STATUS = 0x06, "Status";
        SETTINGS_GET = 0x07, "Get";
        SETTINGS_SET = 0x08, "Set";
        SETTINGS_DEVICE_INFORMATION = 0x16, "DeviceInformation";
        SETTINGS_MODEL = 0x17, "Model";
        SETTINGS_FRIENDLY_NAME = 0x19, "FriendlyName";
        SETTINGS_OS = 0x1a, "OS";
        SETTINGS_USER_AGENT = 0x20, "UserAgent";
    }
    pages::COMPOSE => {
        COMPOSE_SEND_MAIL = 0x05, "SendMail";
        COMPOSE_SMART_FORWARD = 0x06, "SmartForward";
        COMPOSE_SMART_REPLY = 0x07, "SmartReply";
        COMPOSE_SAVE_IN_SENT_ITEMS = 0x08, "SaveInSentItems";
        COMPOSE_REPLACE_MIME = 0x09, "ReplaceMime";
        COMPOSE_SOURCE = 0x0b, "Source";
        COMPOSE_FOLDER_ID = 0x0c, "FolderId";
        COMPOSE_ITEM_ID = 0x0d, "ItemId";
        COMPOSE_LONG_ID = 0x0e, "LongId";
        COMPOSE_INSTANCE_ID = 0x0f, "InstanceId";
        COMPOSE_MIME = 0x10, "Mime";
        COMPOSE_CLIENT_ID = 0x11, "ClientId";
        COMPOSE_STATUS = 0x12, "Status";
    }
    pages::EMAIL2 => {
        EMAIL2_CONVERSATION_ID = 0x09, "ConversationId";
        EMAIL2_CONVERSATION_INDEX = 0x0a, "ConversationIndex";
        EMAIL2_LAST_VERB_EXECUTED = 0x0b, "LastVerbExecuted";
        EMAIL2_LAST_VERB_EXECUTION_TIME = 0x0c, "LastVerbExecutionTime";
        EMAIL2_RECEIVED_AS_BCC = 0x0d, "ReceivedAsBcc";
        EMAIL2_SENDER = 0x0e, "Sender";
        EMAIL2_MEETING_MESSAGE_TYPE = 0x13, "MeetingMessageType";
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pack_and_unpack() {
        assert_eq!(SYNC_SYNC.page(), pages::AIRSYNC);
        assert_eq!(SYNC_SYNC.code(), 0x05);
        assert_eq!(EMAIL_SUBJECT.page(), pages::EMAIL);
        assert_eq!(EMAIL_SUBJECT.code(), 0x14);
        assert_eq!(Tag::new(pages::EMAIL, 0x14), EMAIL_SUBJECT);
    }

    #[test]
    fn known_names() {
        assert_eq!(SYNC_SYNC.name(), Some("Sync"));
        assert_eq!(FOLDER_FOLDER_SYNC.name(), Some("FolderSync"));
        assert_eq!(PROVISION_EAS_PROVISION_DOC.name(), Some("EASProvisionDoc"));
        assert_eq!(Tag::new(0x1f, 0x05).name(), None);
    }

    #[test]
    fn unknown_tag_renders_page_and_code() {
        let rendered = format!("{}", Tag::new(0x1f, 0x0a));
        assert_eq!(rendered, "Unknown(31:0x0a)");
    }
}
