//! OBD2 service 09 (Request vehicle information)

use automotive_diag::obd2::Obd2Command;

use super::{ObdEngine, ProtocolError, ProtocolResult, reply_messages};
use crate::channel::Command;

const VIN_PID: u8 = 0x02;
const VIN_LEN: usize = 17;

impl ObdEngine {
    /// Reads the vehicle identification number
    pub fn vin(&self) -> ProtocolResult<String> {
        let mode: u8 = Obd2Command::Service09.into();
        let cmd = Command::pid(mode, VIN_PID);
        let resp = self.query(&cmd)?;
        let messages = reply_messages(&cmd, &resp)?;
        let mut frames: Vec<&Vec<u8>> = messages
            .iter()
            .filter(|m| m.starts_with(&[0x49, VIN_PID]))
            .collect();
        if frames.is_empty() {
            super::find_response(&cmd, &messages, mode, Some(VIN_PID))?;
        }
        // Older protocols send one numbered frame per line
        frames.sort_by_key(|m| m.get(2).copied().unwrap_or_default());
        let data: Vec<u8> = frames.iter().flat_map(|m| m[2..].iter().copied()).collect();
        let vin: String = data
            .iter()
            .filter(|b| b.is_ascii_alphanumeric())
            .map(|b| *b as char)
            .collect();
        if vin.len() < VIN_LEN {
            return Err(ProtocolError::MalformedPayload {
                command: cmd.to_string(),
                reason: format!("VIN is {} characters long", vin.len()),
            });
        }
        Ok(vin[vin.len() - VIN_LEN..].to_string())
    }
}
