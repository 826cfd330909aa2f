//! The Provision command: security policy negotiation.
//!
//! Provisioning is a two-phase handshake. The first request announces the
//! device and asks for the policy document; the server answers with the
//! policy and a temporary key. The second request acknowledges the policy
//! (fully or partially) using that key, and the server answers with the
//! permanent key that must accompany every subsequent command.
//!
//! Servers speaking 12.0 or later deliver the policy as a nested WBXML
//! `EASProvisionDoc`; 2.5 servers embed a WAP provisioning XML document in
//! the `Data` element instead. Both dialects land in the same [`Policy`].

use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use tracing::{debug, info, warn};

use crate::connection::{Connection, HttpResponse, Transport};
use crate::error::{Error, Result};
use crate::operation::Operation;
use crate::protocol::{ProtocolVersion, EAS_12_POLICY_TYPE, EAS_2_POLICY_TYPE};
use crate::tags;
use crate::wbxml::{Parser, Serializer, Token};

/// Acknowledgment status telling the server we apply the whole policy.
const ACK_OK: &str = "1";
/// Acknowledgment status for a policy we only partially apply.
const ACK_PARTIAL: &str = "2";

/// How strict the required device password must be.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum PasswordMode {
    #[default]
    None,
    Simple,
    Strong,
}

/// A policy requirement this client cannot enforce.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UnsupportedPolicy {
    RequireDeviceEncryption,
    AllowStorageCard,
    AllowUnsignedApplications,
    AllowUnsignedInstallationPackages,
    AllowWifi,
    AllowTextMessaging,
    AllowPopImapEmail,
    AllowHtmlEmail,
    AllowBrowser,
    AllowConsumerEmail,
    AllowInternetSharing,
    AllowBluetooth,
    RequireSdCardEncryption,
    RequireSmimeSupport,
    MaxAttachmentSize,
    UnapprovedInRomApplicationList,
    ApprovedApplicationList,
    MaxEmailBodyTruncationSize,
    MaxEmailHtmlBodyTruncationSize,
}

/// The security policy a server demands before it serves mail.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Policy {
    pub password_mode: PasswordMode,
    pub password_min_length: u32,
    pub password_max_fails: u32,
    pub password_expiration_days: u32,
    pub password_history: u32,
    pub password_complex_chars: u32,
    pub password_recovery_enabled: bool,
    /// Maximum screen-lock delay, in seconds.
    pub max_screen_lock_time: u32,
    pub require_encryption: bool,
    pub require_manual_sync_when_roaming: bool,
    pub do_not_allow_camera: bool,
    pub do_not_allow_attachments: bool,
    pub do_not_allow_html: bool,
    pub max_attachment_size: u32,
    pub max_calendar_lookback: u32,
    pub max_email_lookback: u32,
    pub max_text_truncation_size: u32,
    pub max_html_truncation_size: u32,
    /// Requirements the server stated but this client cannot enforce.
    pub unsupported: Vec<UnsupportedPolicy>,
}

impl Policy {
    /// Makes the policy self-consistent: no password means no password
    /// sub-settings, and a simple password never needs complex characters
    /// (servers erroneously send non-zero values there).
    pub fn normalize(&mut self) {
        match self.password_mode {
            PasswordMode::None => {
                self.password_max_fails = 0;
                self.max_screen_lock_time = 0;
                self.password_min_length = 0;
                self.password_complex_chars = 0;
                self.password_history = 0;
                self.password_expiration_days = 0;
            }
            PasswordMode::Simple => self.password_complex_chars = 0,
            PasswordMode::Strong => {}
        }
    }

    /// Whether this client can honor the whole policy set.
    pub fn is_fully_supported(&self) -> bool {
        self.unsupported.is_empty() && !self.do_not_allow_attachments
    }
}

/// What the device tells the server about itself during provisioning.
/// Servers speaking 14.1 insist on the identity block and refuse to
/// provision without it; the capability flags decide which policy
/// requirements this device can actually honor.
#[derive(Clone, Debug)]
pub struct DeviceCapabilities {
    pub model: String,
    pub friendly_name: String,
    pub operating_system: String,
    /// Whether device storage encryption can be enforced here.
    pub supports_encryption: bool,
    /// Whether removable storage exists that an SD-card encryption
    /// requirement would apply to.
    pub has_removable_storage: bool,
}

/// The result of a completed provisioning handshake.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ProvisionOutcome {
    Provisioned {
        policy: Policy,
        /// The permanent policy key; already installed on the connection.
        policy_key: String,
        /// False when the policy was only acknowledged partially.
        fully_supported: bool,
    },
    /// The server ordered the account wiped. The order was acknowledged;
    /// the caller must destroy local account data.
    RemoteWipeRequested,
}

/// Runs the two-phase provisioning handshake and installs the resulting
/// policy key on the connection.
pub fn provision<T: Transport>(
    conn: &mut Connection<T>,
    device: &DeviceCapabilities,
) -> Result<ProvisionOutcome> {
    let policy_type = policy_type_for(conn.protocol_version());

    let first = {
        let mut op = ProvisionOp {
            phase: Phase::Initial,
            policy_type,
            device,
            user_agent: conn.user_agent().to_string(),
        };
        conn.run(&mut op)?
    };

    if first.remote_wipe {
        info!("server ordered a remote wipe");
        acknowledge_remote_wipe(conn)?;
        return Ok(ProvisionOutcome::RemoteWipeRequested);
    }

    let mut policy = first
        .policy
        .ok_or_else(|| Error::MalformedProtocol("provision response without a policy".into()))?;
    let temporary_key = first.policy_key.ok_or_else(|| {
        Error::MalformedProtocol("provision response without a policy key".into())
    })?;

    let fully_supported = policy.is_fully_supported();
    let ack_status = if fully_supported {
        ACK_OK
    } else {
        warn!(unsupported = ?policy.unsupported, "acknowledging policy partially");
        ACK_PARTIAL
    };

    let second = {
        let mut op = ProvisionOp {
            phase: Phase::Acknowledge {
                policy_key: temporary_key,
                status: ack_status,
            },
            policy_type,
            device,
            user_agent: conn.user_agent().to_string(),
        };
        conn.run(&mut op)?
    };

    let policy_key = second.policy_key.ok_or_else(|| {
        Error::MalformedProtocol("provision acknowledgment without a policy key".into())
    })?;
    debug!(%policy_key, "provisioned");
    conn.set_policy_key(Some(policy_key.clone()));

    // The partial acknowledgment was accepted; the leftovers are the
    // server's concession, not outstanding work.
    policy.unsupported.clear();

    Ok(ProvisionOutcome::Provisioned {
        policy,
        policy_key,
        fully_supported,
    })
}

/// Confirms a remote wipe order. The caller still has to destroy local
/// account data afterwards.
pub fn acknowledge_remote_wipe<T: Transport>(conn: &mut Connection<T>) -> Result<()> {
    let device = DeviceCapabilities {
        model: String::new(),
        friendly_name: String::new(),
        operating_system: String::new(),
        supports_encryption: false,
        has_removable_storage: false,
    };
    let mut op = ProvisionOp {
        phase: Phase::WipeAcknowledge,
        policy_type: policy_type_for(conn.protocol_version()),
        device: &device,
        user_agent: conn.user_agent().to_string(),
    };
    conn.run(&mut op)?;
    Ok(())
}

fn policy_type_for(version: ProtocolVersion) -> &'static str {
    if version >= ProtocolVersion::V12_0 {
        EAS_12_POLICY_TYPE
    } else {
        EAS_2_POLICY_TYPE
    }
}

enum Phase {
    Initial,
    Acknowledge {
        policy_key: String,
        status: &'static str,
    },
    WipeAcknowledge,
}

struct ProvisionOp<'a> {
    phase: Phase,
    policy_type: &'static str,
    device: &'a DeviceCapabilities,
    user_agent: String,
}

impl Operation for ProvisionOp<'_> {
    type Output = ParsedProvision;

    fn command(&self) -> &'static str {
        "Provision"
    }

    // A stale key on a provisioning request earns another 449.
    fn uses_policy_key(&self) -> bool {
        false
    }

    fn request_body(&mut self, version: ProtocolVersion) -> Result<Vec<u8>> {
        let mut s = Serializer::new(Vec::new())?;
        s.start(tags::PROVISION_PROVISION)?;
        match &self.phase {
            Phase::Initial => {
                if version >= ProtocolVersion::V14_1 {
                    self.write_device_information(&mut s)?;
                }
                s.start(tags::PROVISION_POLICIES)?
                    .start(tags::PROVISION_POLICY)?
                    .data(tags::PROVISION_POLICY_TYPE, self.policy_type)?
                    .end()?
                    .end()?;
            }
            Phase::Acknowledge { policy_key, status } => {
                s.start(tags::PROVISION_POLICIES)?
                    .start(tags::PROVISION_POLICY)?
                    .data(tags::PROVISION_POLICY_TYPE, self.policy_type)?
                    .data(tags::PROVISION_POLICY_KEY, policy_key)?
                    .data(tags::PROVISION_STATUS, status)?
                    .end()?
                    .end()?;
            }
            Phase::WipeAcknowledge => {
                s.start(tags::PROVISION_REMOTE_WIPE)?
                    .data(tags::PROVISION_STATUS, ACK_OK)?
                    .end()?;
            }
        }
        s.end()?.done()?;
        Ok(s.into_inner())
    }

    fn handle_response(
        &mut self,
        response: HttpResponse,
        _version: ProtocolVersion,
    ) -> Result<ParsedProvision> {
        // Some servers answer a wipe or policy acknowledgment with a bare
        // 200 and no body at all.
        let mut p = match Parser::new(&response.body[..]) {
            Err(Error::EmptyStream) => return Ok(ParsedProvision::default()),
            other => other?,
        };
        p.expect_document_start(tags::PROVISION_PROVISION)?;

        let mut parsed = ParsedProvision::default();

        while let Token::Start(tag) = p.next_tag(tags::PROVISION_PROVISION)? {
            match tag {
                tags::PROVISION_STATUS => {
                    let status = p.value_int()?;
                    if status != 1 {
                        return Err(Error::CommandStatus {
                            status,
                            item_id: None,
                        });
                    }
                }
                tags::SETTINGS_DEVICE_INFORMATION => {
                    device_information_parser(&mut p)?;
                }
                tags::PROVISION_POLICIES => policies_parser(&mut p, &mut parsed, self.device)?,
                tags::PROVISION_REMOTE_WIPE => {
                    parsed.remote_wipe = true;
                    p.skip_tag()?;
                }
                _ => p.skip_tag()?,
            }
        }
        Ok(parsed)
    }
}

impl ProvisionOp<'_> {
    fn write_device_information(&self, s: &mut Serializer<Vec<u8>>) -> Result<()> {
        s.start(tags::SETTINGS_DEVICE_INFORMATION)?
            .start(tags::SETTINGS_SET)?
            .data(tags::SETTINGS_MODEL, &self.device.model)?
            .data(tags::SETTINGS_FRIENDLY_NAME, &self.device.friendly_name)?
            .data(tags::SETTINGS_OS, &self.device.operating_system)?
            .data(tags::SETTINGS_USER_AGENT, &self.user_agent)?
            .end()?
            .end()?;
        Ok(())
    }
}

#[derive(Debug, Default)]
struct ParsedProvision {
    policy: Option<Policy>,
    policy_key: Option<String>,
    remote_wipe: bool,
}

fn device_information_parser(p: &mut Parser<&[u8]>) -> Result<()> {
    while let Token::Start(tag) = p.next_tag(tags::SETTINGS_DEVICE_INFORMATION)? {
        match tag {
            tags::SETTINGS_STATUS => {
                debug!(status = p.value_int()?, "device information status");
            }
            _ => p.skip_tag()?,
        }
    }
    Ok(())
}

fn policies_parser(
    p: &mut Parser<&[u8]>,
    parsed: &mut ParsedProvision,
    device: &DeviceCapabilities,
) -> Result<()> {
    while let Token::Start(tag) = p.next_tag(tags::PROVISION_POLICIES)? {
        if tag != tags::PROVISION_POLICY {
            p.skip_tag()?;
            continue;
        }
        let mut policy_type = String::new();
        while let Token::Start(tag) = p.next_tag(tags::PROVISION_POLICY)? {
            match tag {
                tags::PROVISION_POLICY_TYPE => policy_type = p.value()?,
                tags::PROVISION_POLICY_KEY => parsed.policy_key = Some(p.value()?),
                tags::PROVISION_STATUS => {
                    debug!(status = p.value_int()?, "policy status");
                }
                tags::PROVISION_DATA => {
                    if policy_type.eq_ignore_ascii_case(EAS_2_POLICY_TYPE) {
                        let doc = p.value()?;
                        parsed.policy = Some(parse_wap_policy(&doc)?);
                    } else {
                        data_parser(p, parsed, device)?;
                    }
                }
                _ => p.skip_tag()?,
            }
        }
    }
    Ok(())
}

fn data_parser(
    p: &mut Parser<&[u8]>,
    parsed: &mut ParsedProvision,
    device: &DeviceCapabilities,
) -> Result<()> {
    while let Token::Start(tag) = p.next_tag(tags::PROVISION_DATA)? {
        if tag == tags::PROVISION_EAS_PROVISION_DOC {
            parsed.policy = Some(parse_provision_doc(p, device)?);
        } else {
            p.skip_tag()?;
        }
    }
    Ok(())
}

/// Walks an `EASProvisionDoc` element into a normalized [`Policy`].
fn parse_provision_doc(p: &mut Parser<&[u8]>, device: &DeviceCapabilities) -> Result<Policy> {
    let mut policy = Policy::default();
    let mut password_enabled = false;
    let mut smime_noted = false;

    while let Token::Start(tag) = p.next_tag(tags::PROVISION_EAS_PROVISION_DOC)? {
        match tag {
            tags::PROVISION_PASSWORD_ENABLED => {
                if p.value_int()? == 1 {
                    password_enabled = true;
                    if policy.password_mode == PasswordMode::None {
                        policy.password_mode = PasswordMode::Simple;
                    }
                }
            }
            tags::PROVISION_MIN_PASSWORD_LENGTH => {
                policy.password_min_length = p.value_int()?;
            }
            tags::PROVISION_ALPHANUMERIC_PASSWORD_REQUIRED => {
                if p.value_int()? == 1 {
                    policy.password_mode = PasswordMode::Strong;
                }
            }
            // Already in seconds on the wire.
            tags::PROVISION_MAX_INACTIVITY_TIME_LOCK => {
                policy.max_screen_lock_time = p.value_int()?;
            }
            tags::PROVISION_MAX_PASSWORD_FAILS => {
                policy.password_max_fails = p.value_int()?;
            }
            tags::PROVISION_PASSWORD_EXPIRATION => {
                policy.password_expiration_days = p.value_int()?;
            }
            tags::PROVISION_PASSWORD_HISTORY => {
                policy.password_history = p.value_int()?;
            }
            tags::PROVISION_MIN_PASSWORD_COMPLEX_CHARS => {
                policy.password_complex_chars = p.value_int()?;
            }
            tags::PROVISION_PASSWORD_RECOVERY_ENABLED => {
                policy.password_recovery_enabled = p.value_int()? == 1;
            }
            tags::PROVISION_ALLOW_SIMPLE_PASSWORD => {
                // No documented meaning beyond "simple".
                p.value()?;
            }
            tags::PROVISION_ALLOW_CAMERA => {
                policy.do_not_allow_camera = p.value_int()? == 0;
            }
            tags::PROVISION_ATTACHMENTS_ENABLED => {
                policy.do_not_allow_attachments = p.value_int()? != 1;
            }
            tags::PROVISION_REQUIRE_DEVICE_ENCRYPTION => {
                if p.value_int()? == 1 {
                    if device.supports_encryption {
                        policy.require_encryption = true;
                    } else {
                        policy
                            .unsupported
                            .push(UnsupportedPolicy::RequireDeviceEncryption);
                    }
                }
            }
            // Refers to storage-card encryption; only a requirement when the
            // device actually has a card to encrypt.
            tags::PROVISION_DEVICE_ENCRYPTION_ENABLED => {
                if p.value_int()? == 1 && device.has_removable_storage {
                    policy
                        .unsupported
                        .push(UnsupportedPolicy::RequireSdCardEncryption);
                }
            }
            tags::PROVISION_REQUIRE_MANUAL_SYNC_WHEN_ROAMING => {
                policy.require_manual_sync_when_roaming = p.value_int()? == 1;
            }
            tags::PROVISION_ALLOW_STORAGE_CARD
            | tags::PROVISION_ALLOW_UNSIGNED_APPLICATIONS
            | tags::PROVISION_ALLOW_UNSIGNED_INSTALLATION_PACKAGES
            | tags::PROVISION_ALLOW_WIFI
            | tags::PROVISION_ALLOW_TEXT_MESSAGING
            | tags::PROVISION_ALLOW_POP_IMAP
            | tags::PROVISION_ALLOW_HTML_EMAIL
            | tags::PROVISION_ALLOW_BROWSER
            | tags::PROVISION_ALLOW_CONSUMER_EMAIL
            | tags::PROVISION_ALLOW_INTERNET_SHARING => {
                // Denying any of these is outside what a mail client can
                // enforce.
                if p.value_int()? == 0 {
                    if tag == tags::PROVISION_ALLOW_HTML_EMAIL {
                        policy.do_not_allow_html = true;
                    }
                    policy.unsupported.push(match tag {
                        t if t == tags::PROVISION_ALLOW_STORAGE_CARD => {
                            UnsupportedPolicy::AllowStorageCard
                        }
                        t if t == tags::PROVISION_ALLOW_UNSIGNED_APPLICATIONS => {
                            UnsupportedPolicy::AllowUnsignedApplications
                        }
                        t if t == tags::PROVISION_ALLOW_UNSIGNED_INSTALLATION_PACKAGES => {
                            UnsupportedPolicy::AllowUnsignedInstallationPackages
                        }
                        t if t == tags::PROVISION_ALLOW_WIFI => UnsupportedPolicy::AllowWifi,
                        t if t == tags::PROVISION_ALLOW_TEXT_MESSAGING => {
                            UnsupportedPolicy::AllowTextMessaging
                        }
                        t if t == tags::PROVISION_ALLOW_POP_IMAP => {
                            UnsupportedPolicy::AllowPopImapEmail
                        }
                        t if t == tags::PROVISION_ALLOW_HTML_EMAIL => {
                            UnsupportedPolicy::AllowHtmlEmail
                        }
                        t if t == tags::PROVISION_ALLOW_BROWSER => UnsupportedPolicy::AllowBrowser,
                        t if t == tags::PROVISION_ALLOW_CONSUMER_EMAIL => {
                            UnsupportedPolicy::AllowConsumerEmail
                        }
                        _ => UnsupportedPolicy::AllowInternetSharing,
                    });
                }
            }
            // 0 = none, 1 = hands-free only, 2 = unrestricted.
            tags::PROVISION_ALLOW_BLUETOOTH => {
                if p.value_int()? != 2 {
                    policy.unsupported.push(UnsupportedPolicy::AllowBluetooth);
                }
            }
            tags::PROVISION_REQUIRE_SIGNED_SMIME_MESSAGES
            | tags::PROVISION_REQUIRE_ENCRYPTED_SMIME_MESSAGES
            | tags::PROVISION_REQUIRE_SIGNED_SMIME_ALGORITHM
            | tags::PROVISION_REQUIRE_ENCRYPTION_SMIME_ALGORITHM => {
                if p.value_int()? == 1 && !smime_noted {
                    policy.unsupported.push(UnsupportedPolicy::RequireSmimeSupport);
                    smime_noted = true;
                }
            }
            tags::PROVISION_MAX_ATTACHMENT_SIZE => {
                let max = p.value_int()?;
                if max > 0 {
                    policy.max_attachment_size = max;
                    policy.unsupported.push(UnsupportedPolicy::MaxAttachmentSize);
                }
            }
            tags::PROVISION_MAX_CALENDAR_AGE_FILTER => {
                policy.max_calendar_lookback = p.value_int()?;
            }
            tags::PROVISION_MAX_EMAIL_AGE_FILTER => {
                policy.max_email_lookback = p.value_int()?;
            }
            tags::PROVISION_MAX_EMAIL_BODY_TRUNCATION_SIZE
            | tags::PROVISION_MAX_EMAIL_HTML_BODY_TRUNCATION_SIZE => {
                let value = p.value()?;
                // "-1" means no required truncation.
                if value != "-1" {
                    let max = parse_int(&value)?;
                    if tag == tags::PROVISION_MAX_EMAIL_BODY_TRUNCATION_SIZE {
                        policy.max_text_truncation_size = max;
                        policy
                            .unsupported
                            .push(UnsupportedPolicy::MaxEmailBodyTruncationSize);
                    } else {
                        policy.max_html_truncation_size = max;
                        policy
                            .unsupported
                            .push(UnsupportedPolicy::MaxEmailHtmlBodyTruncationSize);
                    }
                }
            }
            tags::PROVISION_UNAPPROVED_IN_ROM_APPLICATION_LIST
            | tags::PROVISION_APPROVED_APPLICATION_LIST => {
                if application_list_parser(p, tag)? {
                    policy.unsupported.push(
                        if tag == tags::PROVISION_UNAPPROVED_IN_ROM_APPLICATION_LIST {
                            UnsupportedPolicy::UnapprovedInRomApplicationList
                        } else {
                            UnsupportedPolicy::ApprovedApplicationList
                        },
                    );
                }
            }
            // Abilities we don't have can be "allowed" freely.
            tags::PROVISION_ALLOW_DESKTOP_SYNC
            | tags::PROVISION_ALLOW_SMIME_ENCRYPTION_NEGOTIATION
            | tags::PROVISION_ALLOW_SMIME_SOFT_CERTS
            | tags::PROVISION_ALLOW_REMOTE_DESKTOP
            | tags::PROVISION_ALLOW_IRDA => p.skip_tag()?,
            _ => p.skip_tag()?,
        }
    }

    // No password requirement trumps every other password setting.
    if !password_enabled {
        policy.password_mode = PasswordMode::None;
    }
    policy.normalize();
    Ok(policy)
}

/// Whether an application list element names any applications.
fn application_list_parser(p: &mut Parser<&[u8]>, ending: tags::Tag) -> Result<bool> {
    let mut any = false;
    while let Token::Start(tag) = p.next_tag(ending)? {
        match tag {
            tags::PROVISION_APPLICATION_NAME | tags::PROVISION_HASH => {
                p.value()?;
                any = true;
            }
            _ => p.skip_tag()?,
        }
    }
    Ok(any)
}

/// Parses the WAP provisioning XML dialect used by 2.5 servers.
fn parse_wap_policy(doc: &str) -> Result<Policy> {
    let mut reader = Reader::from_str(doc);
    reader.config_mut().trim_text(true);

    let mut policy = Policy::default();
    let mut section = Section::None;
    let mut section_depth = 0u32;
    let mut enforce_inactivity = true;

    loop {
        let event = reader
            .read_event()
            .map_err(|e| Error::MalformedProtocol(format!("bad provisioning xml: {}", e)))?;
        match event {
            Event::Eof => break,
            Event::Start(ref e) | Event::Empty(ref e) => match e.name().as_ref() {
                b"characteristic" => {
                    if section == Section::None {
                        match xml_attr(e, "type")?.as_deref() {
                            Some("SecurityPolicy") => section = Section::Security,
                            Some("Registry") => section = Section::Registry,
                            _ => {}
                        }
                        section_depth = 1;
                    } else if matches!(event, Event::Start(_)) {
                        section_depth += 1;
                    }
                }
                b"parm" => {
                    let name = xml_attr(e, "name")?.unwrap_or_default();
                    let value = xml_attr(e, "value")?.unwrap_or_default();
                    match section {
                        // Parm 4131 value 1 means no password is required;
                        // everything else in the document is then moot.
                        Section::Security => {
                            if name == "4131" && value == "1" {
                                return Ok(Policy::default());
                            }
                        }
                        Section::Registry => apply_registry_parm(
                            &mut policy,
                            &name,
                            &value,
                            &mut enforce_inactivity,
                        )?,
                        Section::None => {}
                    }
                }
                _ => {}
            },
            Event::End(ref e) if e.name().as_ref() == b"characteristic" => {
                if section != Section::None {
                    section_depth -= 1;
                    if section_depth == 0 {
                        section = Section::None;
                    }
                }
            }
            _ => {}
        }
    }

    // The WAP dialect only speaks up when a password is required; reaching
    // this point means it is.
    if policy.password_mode == PasswordMode::None {
        policy.password_mode = PasswordMode::Simple;
    }
    policy.normalize();
    Ok(policy)
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Section {
    None,
    Security,
    Registry,
}

fn apply_registry_parm(
    policy: &mut Policy,
    name: &str,
    value: &str,
    enforce_inactivity: &mut bool,
) -> Result<()> {
    match name {
        "AEFrequencyType" => {
            // "0" means no inactivity lock is enforced.
            if value == "0" {
                *enforce_inactivity = false;
                policy.max_screen_lock_time = 0;
            }
        }
        "AEFrequencyValue" => {
            if *enforce_inactivity {
                // Minutes on the wire; "0" means lock immediately.
                policy.max_screen_lock_time = if value == "0" {
                    1
                } else {
                    60 * parse_int(value)?
                };
            }
        }
        "DeviceWipeThreshold" => policy.password_max_fails = parse_int(value)?,
        "MinimumPasswordLength" => policy.password_min_length = parse_int(value)?,
        "PasswordComplexity" => {
            policy.password_mode = if value == "0" {
                PasswordMode::Strong
            } else {
                PasswordMode::Simple
            };
        }
        // CodewordFrequency and friends have no meaning for us.
        _ => {}
    }
    Ok(())
}

fn xml_attr(e: &BytesStart<'_>, name: &str) -> Result<Option<String>> {
    for attr in e.attributes() {
        let attr =
            attr.map_err(|e| Error::MalformedProtocol(format!("bad provisioning xml: {}", e)))?;
        if attr.key.as_ref() == name.as_bytes() {
            let value = attr
                .unescape_value()
                .map_err(|e| Error::MalformedProtocol(format!("bad provisioning xml: {}", e)))?;
            return Ok(Some(value.into_owned()));
        }
    }
    Ok(None)
}

fn parse_int(value: &str) -> Result<u32> {
    value
        .trim()
        .parse()
        .map_err(|_| Error::MalformedProtocol(format!("expected an integer, got {:?}", value)))
}
