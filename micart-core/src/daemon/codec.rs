//! Wire formats spoken with micad.
//!
//! * the fixed 325-byte creation record,
//! * the `MICA-SUCCESS` / `MICA-FAILED` reply sentinels,
//! * the space-separated text control commands.

use nix::sys::signal::Signal;

use crate::error::DaemonError;
use crate::types::ContainerId;

const CPU_LEN: usize = 4;
const NAME_LEN: usize = 32;
const PATH_LEN: usize = 128;
const PED_LEN: usize = 32;
const PED_CFG_LEN: usize = 128;
const DEBUG_LEN: usize = 1;

/// Exact size of a packed creation record. There is no length prefix.
pub const CREATE_MESSAGE_SIZE: usize =
    CPU_LEN + NAME_LEN + PATH_LEN + PED_LEN + PED_CFG_LEN + DEBUG_LEN;

/// Reply sentinel for a successful creation.
pub const SUCCESS_SENTINEL: &str = "MICA-SUCCESS";
/// Reply sentinel for a failed creation.
pub const FAILED_SENTINEL: &str = "MICA-FAILED";

/// Guest allocation request sent once per container.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CreateMessage {
    /// CPU budget handed to the guest.
    pub cpu: u32,
    /// Client name, at most 32 bytes on the wire.
    pub name: String,
    /// Guest image / client firmware path, at most 128 bytes.
    pub client_path: String,
    /// Secondary "pedestal" identifier, at most 32 bytes.
    pub pedestal: String,
    /// Pedestal configuration path, at most 128 bytes.
    pub pedestal_conf: String,
    pub debug: bool,
}

impl CreateMessage {
    /// Serialize into the fixed little-endian layout.
    ///
    /// Over-long strings are cut at the last UTF-8 boundary that fits their
    /// field; short ones are NUL padded.
    pub fn pack(&self) -> [u8; CREATE_MESSAGE_SIZE] {
        let mut buf = [0u8; CREATE_MESSAGE_SIZE];
        let mut offset = 0;

        buf[..CPU_LEN].copy_from_slice(&self.cpu.to_le_bytes());
        offset += CPU_LEN;

        for (value, len) in [
            (&self.name, NAME_LEN),
            (&self.client_path, PATH_LEN),
            (&self.pedestal, PED_LEN),
            (&self.pedestal_conf, PED_CFG_LEN),
        ] {
            put_field(&mut buf[offset..offset + len], value);
            offset += len;
        }

        buf[offset] = u8::from(self.debug);
        buf
    }

    /// Decode a packed record. Mainly used by tests and diagnostics.
    pub fn unpack(buf: &[u8]) -> Result<Self, DaemonError> {
        if buf.len() != CREATE_MESSAGE_SIZE {
            return Err(DaemonError::MalformedCreateMessage {
                size: buf.len(),
                expected: CREATE_MESSAGE_SIZE,
            });
        }

        let cpu = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
        let mut offset = CPU_LEN;
        let mut next = |len: usize| {
            let field = read_field(&buf[offset..offset + len]);
            offset += len;
            field
        };

        let name = next(NAME_LEN);
        let client_path = next(PATH_LEN);
        let pedestal = next(PED_LEN);
        let pedestal_conf = next(PED_CFG_LEN);

        Ok(Self {
            cpu,
            name,
            client_path,
            pedestal,
            pedestal_conf,
            debug: buf[CREATE_MESSAGE_SIZE - 1] != 0,
        })
    }
}

fn put_field(dst: &mut [u8], value: &str) {
    let mut end = value.len().min(dst.len());
    while !value.is_char_boundary(end) {
        end -= 1;
    }
    dst[..end].copy_from_slice(&value.as_bytes()[..end]);
}

fn read_field(src: &[u8]) -> String {
    let end = src.iter().position(|&b| b == 0).unwrap_or(src.len());
    String::from_utf8_lossy(&src[..end]).into_owned()
}

/// Verdict found in a creation reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DaemonReply {
    Success { advisory: String },
    Failed { advisory: String },
}

impl DaemonReply {
    /// Look for a sentinel anywhere in the accumulated reply.
    ///
    /// `MICA-FAILED` wins if both appear. Text before the sentinel is kept
    /// as advisory output for the operator.
    pub fn scan(buf: &[u8]) -> Option<Self> {
        let text = String::from_utf8_lossy(buf);

        if let Some(pos) = text.find(FAILED_SENTINEL) {
            return Some(Self::Failed {
                advisory: text[..pos].trim().to_string(),
            });
        }
        text.find(SUCCESS_SENTINEL).map(|pos| Self::Success {
            advisory: text[..pos].trim().to_string(),
        })
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }

    /// Log text micad printed before its verdict. May be empty.
    pub fn advisory(&self) -> &str {
        match self {
            Self::Success { advisory } | Self::Failed { advisory } => advisory,
        }
    }
}

/// Text command for the control socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlCommand {
    Start,
    Exec,
    Run,
    Stop,
    Pause,
    Resume,
    Restore,
    /// Tear the guest down.
    Remove(ContainerId),
    /// Deliver a signal number; 0 is a liveness probe.
    Kill { id: ContainerId, signal: i32 },
}

impl ControlCommand {
    /// Signal command; `None` formats the zero-signal liveness probe.
    pub fn kill(id: &ContainerId, signal: Option<Signal>) -> Self {
        Self::Kill {
            id: id.clone(),
            signal: signal.map_or(0, |s| s as i32),
        }
    }

    /// Leading command word.
    pub fn verb(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Exec => "exec",
            Self::Run => "run",
            Self::Stop => "stop",
            Self::Pause => "pause",
            Self::Resume => "resume",
            Self::Restore => "restore",
            Self::Remove(_) => "rm",
            Self::Kill { .. } => "kill",
        }
    }

    /// Command word followed by space-joined arguments.
    pub fn encode(&self) -> String {
        let args: Vec<String> = match self {
            Self::Remove(id) => vec![id.to_string()],
            Self::Kill { id, signal } => vec![id.to_string(), signal.to_string()],
            _ => Vec::new(),
        };
        std::iter::once(self.verb().to_string())
            .chain(args)
            .collect::<Vec<_>>()
            .join(" ")
    }
}

impl std::fmt::Display for ControlCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.encode())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pack_layout() {
        let msg = CreateMessage {
            cpu: 4,
            name: "demo".to_string(),
            client_path: "/bin/x".to_string(),
            debug: true,
            ..Default::default()
        };
        let buf = msg.pack();

        assert_eq!(buf.len(), 325);
        assert_eq!(u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]), 4);
        assert_eq!(&buf[4..8], b"demo");
        assert!(buf[8..36].iter().all(|&b| b == 0));
        assert_eq!(&buf[36..42], b"/bin/x");
        assert_eq!(buf[324], 1);
        assert_eq!(CreateMessage::unpack(&buf).unwrap(), msg);
    }

    #[test]
    fn test_overlong_fields_do_not_bleed() {
        let msg = CreateMessage {
            cpu: 0x0102_0304,
            name: "n".repeat(40),
            client_path: "p".repeat(200),
            pedestal: "jailhouse".to_string(),
            pedestal_conf: "/etc/ped.cell".to_string(),
            debug: false,
        };
        let buf = msg.pack();
        let decoded = CreateMessage::unpack(&buf).unwrap();

        assert_eq!(decoded.cpu, 0x0102_0304);
        assert_eq!(decoded.name, "n".repeat(32));
        assert_eq!(decoded.client_path, "p".repeat(128));
        assert_eq!(decoded.pedestal, "jailhouse");
        assert_eq!(decoded.pedestal_conf, "/etc/ped.cell");
        assert!(!decoded.debug);
    }

    #[test]
    fn test_truncation_respects_char_boundary() {
        // 31 ASCII bytes + a 2-byte char would straddle the 32-byte field.
        let name = format!("{}é", "a".repeat(31));
        let msg = CreateMessage {
            name,
            ..Default::default()
        };
        let decoded = CreateMessage::unpack(&msg.pack()).unwrap();
        assert_eq!(decoded.name, "a".repeat(31));
    }

    #[test]
    fn test_unpack_rejects_wrong_size() {
        assert!(matches!(
            CreateMessage::unpack(&[0u8; 10]),
            Err(DaemonError::MalformedCreateMessage { size: 10, .. })
        ));
    }

    #[test]
    fn test_scan_sentinels() {
        assert_eq!(DaemonReply::scan(b"booting..."), None);
        assert_eq!(
            DaemonReply::scan(b"loading firmware\nMICA-SUCCESS"),
            Some(DaemonReply::Success {
                advisory: "loading firmware".to_string()
            })
        );
        let failed = DaemonReply::scan(b"MICA-FAILED\n").unwrap();
        assert!(!failed.is_success());
        assert_eq!(failed.advisory(), "");
        // Failure takes precedence.
        assert!(!DaemonReply::scan(b"MICA-SUCCESS MICA-FAILED")
            .unwrap()
            .is_success());
    }

    #[test]
    fn test_control_command_encoding() {
        let id = ContainerId::new("c1").unwrap();
        assert_eq!(ControlCommand::Start.encode(), "start");
        assert_eq!(ControlCommand::Remove(id.clone()).encode(), "rm c1");
        assert_eq!(
            ControlCommand::kill(&id, Some(Signal::SIGKILL)).encode(),
            "kill c1 9"
        );
        assert_eq!(ControlCommand::kill(&id, None).encode(), "kill c1 0");
    }
}
