//! Message type registry shared by both channels.
//!
//! Codes are fixed one-byte values and must stay byte-for-byte compatible with
//! deployed peers. Every request code except `BackupCancelReq` has a matching
//! response code; server command codes are pushed on the notification channel.

use serde::{Deserialize, Serialize};

macro_rules! msg_types {
    ($($(#[$doc:meta])* $variant:ident = $code:literal => $name:literal,)+) => {
        /// One-byte message type codes
        #[repr(u8)]
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub enum MsgType {
            $($(#[$doc])* $variant = $code,)+
        }

        impl MsgType {
            /// Every known message type, in code order
            pub const ALL: &'static [MsgType] = &[$(MsgType::$variant,)+];

            /// Wire name of the code (`MSG_LOGIN_REQ`, ...)
            pub fn name(self) -> &'static str {
                match self {
                    $(MsgType::$variant => $name,)+
                }
            }
        }

        impl TryFrom<u8> for MsgType {
            type Error = crate::WireError;

            fn try_from(value: u8) -> Result<Self, Self::Error> {
                match value {
                    $($code => Ok(MsgType::$variant),)+
                    _ => Err(crate::WireError::Type(value)),
                }
            }
        }
    };
}

msg_types! {
    /// Plain notification frame
    Socket = 0x01 => "MSG_SOCKET",

    /// Admin asks the server to make a device restore a file
    AdminRestoreReq = 0x70 => "MSG_ADMIN_RESTORE_REQ",
    /// Reply to `AdminRestoreReq`
    AdminRestoreResp = 0x71 => "MSG_ADMIN_RESTORE_RESP",
    /// Server push: start a restore
    ServerRestoreCmd = 0x72 => "MSG_SERVER_RESTORE_CMD",
    /// Open a restore transfer
    RestoreInitReq = 0x73 => "MSG_RESTORE_INIT_REQ",
    /// Reply to `RestoreInitReq`
    RestoreInitResp = 0x74 => "MSG_RESTORE_INIT_RESP",
    /// Fetch one restore chunk
    RestoreChunkReq = 0x75 => "MSG_RESTORE_CHUNK_REQ",
    /// Reply to `RestoreChunkReq`
    RestoreChunkResp = 0x76 => "MSG_RESTORE_CHUNK_RESP",
    /// Close a restore transfer
    RestoreFinishReq = 0x77 => "MSG_RESTORE_FINISH_REQ",
    /// Reply to `RestoreFinishReq`
    RestoreFinishResp = 0x78 => "MSG_RESTORE_FINISH_RESP",
    /// Reattach to an interrupted restore
    RestoreResumeReq = 0x79 => "MSG_RESTORE_RESUME_REQ",
    /// Reply to `RestoreResumeReq`
    RestoreResumeResp = 0x7A => "MSG_RESTORE_RESUME_RESP",

    /// Device login
    LoginReq = 0xA1 => "MSG_LOGIN_REQ",
    /// Reply to `LoginReq`
    LoginResp = 0xA2 => "MSG_LOGIN_RESP",
    /// Online device listing
    ListReq = 0xB1 => "MSG_LIST_REQ",
    /// Reply to `ListReq`
    ListResp = 0xB2 => "MSG_LIST_RESP",
    /// Device registration
    DeviceReq = 0xC1 => "MSG_DEVICE_REQ",
    /// Reply to `DeviceReq`
    DeviceResp = 0xC2 => "MSG_DEVICE_RESP",

    /// Admin asks a device for its logs
    AdminGetLogsReq = 0xD1 => "MSG_ADMIN_COMMAND_GETLOGS_REQ",
    /// Reply to `AdminGetLogsReq`
    AdminGetLogsResp = 0xD2 => "MSG_ADMIN_COMMAND_GETLOGS_RESP",
    /// Server push: upload logs
    ServerGetLogCmd = 0xD3 => "MSG_SERVER_COMMAND_GETLOG",
    /// Device uploads requested logs
    ClientGetLogReq = 0xD4 => "MSG_CLIENT_COMMAND_GETLOG_REQ",
    /// Reply to `ClientGetLogReq`
    ClientGetLogResp = 0xD5 => "MSG_CLIENT_COMMAND_GETLOG_RESP",
    /// Admin console login
    AdminLoginReq = 0xD6 => "MSG_ADMIN_LOGIN_REQ",
    /// Reply to `AdminLoginReq`
    AdminLoginResp = 0xD7 => "MSG_ADMIN_LOGIN_RESP",
    /// Admin reads logs stored on the server
    AdminGetStoredLogsReq = 0xD8 => "MSG_ADMIN_GET_STORED_LOGS_REQ",
    /// Reply to `AdminGetStoredLogsReq`
    AdminGetStoredLogsResp = 0xD9 => "MSG_ADMIN_GET_STORED_LOGS_RESP",
    /// Admin reads the command history
    AdminGetCommandHistoryReq = 0xDA => "MSG_ADMIN_GET_COMMAND_HISTORY_REQ",
    /// Reply to `AdminGetCommandHistoryReq`
    AdminGetCommandHistoryResp = 0xDB => "MSG_ADMIN_GET_COMMAND_HISTORY_RESP",

    /// Admin changes firewall policy
    AdminFirewallControlReq = 0xE1 => "MSG_ADMIN_FIREWALL_CONTROL_REQ",
    /// Reply to `AdminFirewallControlReq`
    AdminFirewallControlResp = 0xE2 => "MSG_ADMIN_FIREWALL_CONTROL_RESP",
    /// Server push: firewall policy changed
    ServerFirewallUpdateCmd = 0xE3 => "MSG_SERVER_FIREWALL_UPDATE_CMD",
    /// Device fetches its firewall policy
    ClientGetFirewallConfigReq = 0xE4 => "MSG_CLIENT_GET_FIREWALL_CONFIG_REQ",
    /// Reply to `ClientGetFirewallConfigReq`
    ClientGetFirewallConfigResp = 0xE5 => "MSG_CLIENT_GET_FIREWALL_CONFIG_RESP",
    /// Device reports file changes
    ClientFileSyncReq = 0xE6 => "MSG_CLIENT_FILE_SYNC_REQ",
    /// Reply to `ClientFileSyncReq`
    ClientFileSyncResp = 0xE7 => "MSG_CLIENT_FILE_SYNC_RESP",
    /// Admin browses a device's file tree
    AdminGetFileTreeReq = 0xE8 => "MSG_ADMIN_GET_FILE_TREE_REQ",
    /// Reply to `AdminGetFileTreeReq`
    AdminGetFileTreeResp = 0xE9 => "MSG_ADMIN_GET_FILE_TREE_RESP",

    /// Open a backup transfer
    BackupInitReq = 0xF1 => "MSG_BACKUP_INIT_REQ",
    /// Reply to `BackupInitReq`
    BackupInitResp = 0xF2 => "MSG_BACKUP_INIT_RESP",
    /// Upload one backup chunk
    BackupChunkReq = 0xF3 => "MSG_BACKUP_CHUNK_REQ",
    /// Reply to `BackupChunkReq`
    BackupChunkResp = 0xF4 => "MSG_BACKUP_CHUNK_RESP",
    /// Close a backup transfer
    BackupFinishReq = 0xF5 => "MSG_BACKUP_FINISH_REQ",
    /// Reply to `BackupFinishReq`
    BackupFinishResp = 0xF6 => "MSG_BACKUP_FINISH_RESP",
    /// Abandon a backup transfer (no response code)
    BackupCancelReq = 0xF7 => "MSG_BACKUP_CANCEL_REQ",
    /// Look up an interrupted backup
    BackupResumeReq = 0xF8 => "MSG_BACKUP_RESUME_REQ",
    /// Reply to `BackupResumeReq`
    BackupResumeResp = 0xF9 => "MSG_BACKUP_RESUME_RESP",
}

/// Broad role of a message code
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MsgKind {
    /// Notification channel payload
    Notification,
    /// Pushed by the server to a device on the notification channel
    ServerCommand,
    /// API request
    Request,
    /// API response
    Response,
}

impl MsgType {
    /// Raw code
    pub fn code(self) -> u8 {
        self as u8
    }

    /// Response code paired with a request code
    pub fn response(self) -> Option<MsgType> {
        use MsgType::*;
        match self {
            AdminRestoreReq => Some(AdminRestoreResp),
            RestoreInitReq => Some(RestoreInitResp),
            RestoreChunkReq => Some(RestoreChunkResp),
            RestoreFinishReq => Some(RestoreFinishResp),
            RestoreResumeReq => Some(RestoreResumeResp),
            LoginReq => Some(LoginResp),
            ListReq => Some(ListResp),
            DeviceReq => Some(DeviceResp),
            AdminGetLogsReq => Some(AdminGetLogsResp),
            ClientGetLogReq => Some(ClientGetLogResp),
            AdminLoginReq => Some(AdminLoginResp),
            AdminGetStoredLogsReq => Some(AdminGetStoredLogsResp),
            AdminGetCommandHistoryReq => Some(AdminGetCommandHistoryResp),
            AdminFirewallControlReq => Some(AdminFirewallControlResp),
            ClientGetFirewallConfigReq => Some(ClientGetFirewallConfigResp),
            ClientFileSyncReq => Some(ClientFileSyncResp),
            AdminGetFileTreeReq => Some(AdminGetFileTreeResp),
            BackupInitReq => Some(BackupInitResp),
            BackupChunkReq => Some(BackupChunkResp),
            BackupFinishReq => Some(BackupFinishResp),
            BackupResumeReq => Some(BackupResumeResp),
            _ => None,
        }
    }

    /// Role of the code
    pub fn kind(self) -> MsgKind {
        use MsgType::*;
        match self {
            Socket => MsgKind::Notification,
            ServerRestoreCmd | ServerGetLogCmd | ServerFirewallUpdateCmd => MsgKind::ServerCommand,
            BackupCancelReq => MsgKind::Request,
            other if other.response().is_some() => MsgKind::Request,
            _ => MsgKind::Response,
        }
    }
}

impl From<MsgType> for u8 {
    fn from(value: MsgType) -> Self {
        value as u8
    }
}

/// Human-readable name for any code, including unknown ones
pub fn describe(code: u8) -> String {
    match MsgType::try_from(code) {
        Ok(t) => t.name().to_string(),
        Err(_) => format!("UNKNOWN(0x{:02X})", code),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_roundtrip() {
        for t in MsgType::ALL {
            assert_eq!(MsgType::try_from(t.code()).unwrap(), *t);
        }
        assert!(MsgType::try_from(0x00).is_err());
        assert!(MsgType::try_from(0xFE).is_err());
    }

    #[test]
    fn test_fixed_codes() {
        assert_eq!(MsgType::LoginReq.code(), 0xA1);
        assert_eq!(MsgType::ListResp.code(), 0xB2);
        assert_eq!(MsgType::RestoreResumeResp.code(), 0x7A);
        assert_eq!(MsgType::BackupResumeResp.code(), 0xF9);
        assert_eq!(MsgType::ServerFirewallUpdateCmd.code(), 0xE3);
    }

    #[test]
    fn test_every_request_but_cancel_has_response() {
        let requests: Vec<_> = MsgType::ALL
            .iter()
            .filter(|t| t.kind() == MsgKind::Request)
            .collect();
        assert_eq!(requests.len(), 22);
        for t in requests {
            if *t == MsgType::BackupCancelReq {
                assert_eq!(t.response(), None);
            } else {
                let resp = t.response().unwrap();
                assert_eq!(resp.kind(), MsgKind::Response);
            }
        }
    }

    #[test]
    fn test_describe_unknown() {
        assert_eq!(describe(0xA1), "MSG_LOGIN_REQ");
        assert_eq!(describe(0x42), "UNKNOWN(0x42)");
    }
}
