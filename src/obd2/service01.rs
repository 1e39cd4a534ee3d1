//! OBD2 service 01 (Show current data)

use automotive_diag::obd2::Obd2Command;

use super::{DataPid, ObdEngine, ObdValue, ProtocolError, ProtocolResult, decode_pid_response};
use crate::dtc::DtcStatus;

// PIDs 0x20, 0x40 .. only report which PIDs follow
const SUPPORT_PIDS: [u8; 8] = [0x00, 0x20, 0x40, 0x60, 0x80, 0xA0, 0xC0, 0xE0];

impl ObdEngine {
    /// Reads and decodes a service 01 PID
    pub fn read_pid(&self, pid: DataPid) -> ProtocolResult<ObdValue> {
        let data = self.query_data(Obd2Command::Service01.into(), Some(pid.pid()))?;
        pid.decode(&data).ok_or_else(|| ProtocolError::MalformedPayload {
            command: format!("01{:02X}", pid.pid()),
            reason: format!(
                "expected {} data bytes, got {}",
                pid.data_len().unwrap_or_default(),
                data.len()
            ),
        })
    }

    /// Reads the MIL state and stored DTC count (service 01 PID 01)
    pub fn dtc_status(&self) -> ProtocolResult<DtcStatus> {
        let data = self.query_data(Obd2Command::Service01.into(), Some(0x01))?;
        if data.len() != 4 {
            return Err(ProtocolError::MalformedPayload {
                command: "0101".into(),
                reason: format!("expected 4 data bytes, got {}", data.len()),
            });
        }
        Ok(DtcStatus::from_byte(data[0]))
    }

    /// Returns the service 01 PIDs the vehicle supports, in ascending order.
    ///
    /// Follows the `0x20`, `0x40` .. continuation bits. The support PIDs themselves are
    /// not included in the list
    pub fn supported_pids(&self) -> ProtocolResult<Vec<u8>> {
        let mut supported = Vec::new();
        for base in SUPPORT_PIDS {
            let data = match self.query_data(Obd2Command::Service01.into(), Some(base)) {
                Ok(d) => d,
                // The vehicle advertised the range but does not answer for it
                Err(ProtocolError::NoData { .. } | ProtocolError::EcuError { .. }) if base != 0x00 => {
                    break;
                }
                Err(e) => return Err(e),
            };
            if data.len() != 4 {
                return Err(ProtocolError::MalformedPayload {
                    command: format!("01{base:02X}"),
                    reason: format!("expected a 4 byte bitmap, got {} bytes", data.len()),
                });
            }
            let bits = decode_pid_response(&data);
            for (idx, set) in bits.iter().enumerate() {
                let pid = base as usize + idx + 1;
                if *set && pid <= 0xFF && !SUPPORT_PIDS.contains(&(pid as u8)) {
                    supported.push(pid as u8);
                }
            }
            if !bits[31] {
                break;
            }
        }
        Ok(supported)
    }
}
