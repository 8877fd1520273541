//! Binary Gearman command types and their ordered argument schemas.
//!
//! A binary frame is `magic ++ be32(type) ++ be32(len) ++ payload`, where
//! `payload` is the command's fields joined by single NUL bytes (the final
//! field may itself contain NULs). This module owns the registry mapping each
//! [`PacketType`] to its field names, plus the typed [`Frame`] most of the
//! crate actually works with.

use bytes::Bytes;

/// `\0REQ` — a frame sent by us to the server.
pub const MAGIC_REQ: [u8; 4] = [0, b'R', b'E', b'Q'];
/// `\0RES` — a frame sent by the server to us.
pub const MAGIC_RES: [u8; 4] = [0, b'R', b'E', b'S'];

/// The default TCP port a Gearman job server listens on.
pub const DEFAULT_PORT: u16 = 4730;

/// Numeric command codes, replicated verbatim from the Gearman wire protocol
/// for interoperability with real job servers.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[repr(u32)]
pub enum PacketType {
    CanDo = 1,
    ResetAbilities = 3,
    PreSleep = 4,
    Noop = 6,
    SubmitJob = 7,
    JobCreated = 8,
    GrabJob = 9,
    NoJob = 10,
    JobAssign = 11,
    WorkStatus = 12,
    WorkComplete = 13,
    WorkFail = 14,
    GetStatus = 15,
    EchoReq = 16,
    EchoRes = 17,
    SubmitJobBg = 18,
    Error = 19,
    StatusRes = 20,
    SubmitJobHigh = 21,
    SetClientId = 22,
    WorkException = 25,
    WorkData = 28,
    WorkWarning = 29,
    GrabJobUniq = 30,
    JobAssignUniq = 31,
    SubmitJobHighBg = 32,
    SubmitJobLow = 33,
    SubmitJobLowBg = 34,
}

impl PacketType {
    pub fn from_u32(code: u32) -> Option<Self> {
        Some(match code {
            1 => Self::CanDo,
            3 => Self::ResetAbilities,
            4 => Self::PreSleep,
            6 => Self::Noop,
            7 => Self::SubmitJob,
            8 => Self::JobCreated,
            9 => Self::GrabJob,
            10 => Self::NoJob,
            11 => Self::JobAssign,
            12 => Self::WorkStatus,
            13 => Self::WorkComplete,
            14 => Self::WorkFail,
            15 => Self::GetStatus,
            16 => Self::EchoReq,
            17 => Self::EchoRes,
            18 => Self::SubmitJobBg,
            19 => Self::Error,
            20 => Self::StatusRes,
            21 => Self::SubmitJobHigh,
            22 => Self::SetClientId,
            25 => Self::WorkException,
            28 => Self::WorkData,
            29 => Self::WorkWarning,
            30 => Self::GrabJobUniq,
            31 => Self::JobAssignUniq,
            32 => Self::SubmitJobHighBg,
            33 => Self::SubmitJobLow,
            34 => Self::SubmitJobLowBg,
            _ => return None,
        })
    }

    pub fn code(self) -> u32 {
        self as u32
    }

    /// The ordered field names for this type's payload, used by both the
    /// parser and the serializer to know how many NUL-separated fields to
    /// expect and where the final (binary-safe) field begins.
    pub fn field_names(self) -> &'static [&'static str] {
        use PacketType::*;
        match self {
            CanDo => &["task"],
            ResetAbilities | PreSleep | Noop | GrabJob | NoJob | GrabJobUniq => &[],
            SubmitJob | SubmitJobHigh | SubmitJobLow | SubmitJobBg | SubmitJobHighBg
            | SubmitJobLowBg => &["task", "unique", "data"],
            JobCreated => &["job_handle"],
            JobAssign => &["job_handle", "task", "data"],
            JobAssignUniq => &["job_handle", "task", "unique", "data"],
            WorkStatus => &["job_handle", "numerator", "denominator"],
            WorkComplete => &["job_handle", "data"],
            WorkFail => &["job_handle"],
            GetStatus => &["job_handle"],
            EchoReq => &["data"],
            EchoRes => &["data"],
            Error => &["error_code", "error_text"],
            StatusRes => &["job_handle", "known", "running", "numerator", "denominator"],
            SetClientId => &["client_id"],
            WorkException => &["job_handle", "data"],
            WorkData => &["job_handle", "data"],
            WorkWarning => &["job_handle", "data"],
        }
    }

    pub fn name(self) -> &'static str {
        use PacketType::*;
        match self {
            CanDo => "CAN_DO",
            ResetAbilities => "RESET_ABILITIES",
            PreSleep => "PRE_SLEEP",
            Noop => "NOOP",
            SubmitJob => "SUBMIT_JOB",
            JobCreated => "JOB_CREATED",
            GrabJob => "GRAB_JOB",
            NoJob => "NO_JOB",
            JobAssign => "JOB_ASSIGN",
            WorkStatus => "WORK_STATUS",
            WorkComplete => "WORK_COMPLETE",
            WorkFail => "WORK_FAIL",
            GetStatus => "GET_STATUS",
            EchoReq => "ECHO_REQ",
            EchoRes => "ECHO_RES",
            SubmitJobBg => "SUBMIT_JOB_BG",
            Error => "ERROR",
            StatusRes => "STATUS_RES",
            SubmitJobHigh => "SUBMIT_JOB_HIGH",
            SetClientId => "SET_CLIENT_ID",
            WorkException => "WORK_EXCEPTION",
            WorkData => "WORK_DATA",
            WorkWarning => "WORK_WARNING",
            GrabJobUniq => "GRAB_JOB_UNIQ",
            JobAssignUniq => "JOB_ASSIGN_UNIQ",
            SubmitJobHighBg => "SUBMIT_JOB_HIGH_BG",
            SubmitJobLow => "SUBMIT_JOB_LOW",
            SubmitJobLowBg => "SUBMIT_JOB_LOW_BG",
        }
    }
}

/// Priority of a submitted job; selects one of the three families of submit
/// commands.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum Priority {
    #[default]
    None,
    Low,
    High,
}

impl Priority {
    /// Picks the concrete submit command for this priority and background-ness.
    pub fn submit_packet_type(self, background: bool) -> PacketType {
        use PacketType::*;
        match (self, background) {
            (Priority::None, false) => SubmitJob,
            (Priority::None, true) => SubmitJobBg,
            (Priority::High, false) => SubmitJobHigh,
            (Priority::High, true) => SubmitJobHighBg,
            (Priority::Low, false) => SubmitJobLow,
            (Priority::Low, true) => SubmitJobLowBg,
        }
    }
}

/// A decoded binary frame: its type plus its ordered, still-raw field values.
///
/// Handlers destructure `args` by the schema documented on [`PacketType`]
/// rather than this module re-typing every field into its own struct; this
/// mirrors the wire's own "ordered byte-string fields" shape and keeps one
/// schema (not two) in sync.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Frame {
    pub ptype: PacketType,
    pub args: Vec<Bytes>,
}

impl Frame {
    pub fn new(ptype: PacketType, args: Vec<Bytes>) -> Self {
        Self { ptype, args }
    }

    pub fn field(&self, idx: usize) -> &Bytes {
        &self.args[idx]
    }
}

/// Admin text commands accepted on the line-oriented protocol.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum AdminCommandTag {
    Status,
    Version,
    Workers,
    Maxqueue,
    Shutdown,
}

impl AdminCommandTag {
    pub fn keyword(self) -> &'static str {
        match self {
            Self::Status => "status",
            Self::Version => "version",
            Self::Workers => "workers",
            Self::Maxqueue => "maxqueue",
            Self::Shutdown => "shutdown",
        }
    }

    /// Identifies which allowed admin command a raw command line begins with.
    pub fn from_line_prefix(line: &str) -> Option<Self> {
        [
            Self::Status,
            Self::Version,
            Self::Workers,
            Self::Maxqueue,
            Self::Shutdown,
        ]
        .into_iter()
        .find(|tag| line.starts_with(tag.keyword()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packet_type_roundtrips_through_code() {
        for code in 0..40u32 {
            if let Some(pt) = PacketType::from_u32(code) {
                assert_eq!(pt.code(), code);
            }
        }
    }

    #[test]
    fn submit_packet_type_covers_all_combinations() {
        use PacketType::*;
        assert_eq!(Priority::None.submit_packet_type(false), SubmitJob);
        assert_eq!(Priority::None.submit_packet_type(true), SubmitJobBg);
        assert_eq!(Priority::High.submit_packet_type(false), SubmitJobHigh);
        assert_eq!(Priority::High.submit_packet_type(true), SubmitJobHighBg);
        assert_eq!(Priority::Low.submit_packet_type(false), SubmitJobLow);
        assert_eq!(Priority::Low.submit_packet_type(true), SubmitJobLowBg);
    }

    #[test]
    fn admin_tag_prefix_matching() {
        assert_eq!(
            AdminCommandTag::from_line_prefix("status\n"),
            Some(AdminCommandTag::Status)
        );
        assert_eq!(
            AdminCommandTag::from_line_prefix("maxqueue some_task 10"),
            Some(AdminCommandTag::Maxqueue)
        );
        assert_eq!(AdminCommandTag::from_line_prefix("bogus"), None);
    }
}
